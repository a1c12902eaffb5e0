//! In-memory ledger store
//!
//! A single writer lock is held for the whole life of a transaction, so
//! transactions are fully serialized. Writes go to a private copy of the
//! ledger that replaces the shared one on commit.
//!
//! Faults can be injected to exercise the coordinator's retry and abort
//! paths without a real database.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;

use crate::domain::result::{Error, Result};
use crate::domain::{Account, Currency, Entry, Page, Transfer};
use crate::ports::{AccountDrift, LedgerAudit, LedgerStore, LedgerTotals, LedgerTx};

#[derive(Debug, Clone, Default)]
struct LedgerState {
    accounts: BTreeMap<i64, Account>,
    entries: Vec<Entry>,
    transfers: Vec<Transfer>,
    last_account_id: i64,
    last_entry_id: i64,
    last_transfer_id: i64,
}

/// Faults to inject into upcoming transactions
#[derive(Debug, Default)]
struct Faults {
    /// Number of upcoming commits that fail with a transient conflict
    commit_conflicts: u32,
    /// Fail every rollback
    rollback_failure: bool,
    /// Fail the next `create_transfer` with a database error
    transfer_insert_failure: bool,
}

/// In-memory ledger store
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<LedgerState>,
    writer: Mutex<()>,
    faults: Mutex<Faults>,
    begins: AtomicU64,
    claims: Mutex<Vec<i64>>,
}

fn poisoned<T>(e: std::sync::PoisonError<T>) -> Error {
    Error::database(format!("memory store lock poisoned: {}", e))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` commits fail with `TransientStore`
    pub fn inject_commit_conflicts(&self, count: u32) -> Result<()> {
        self.faults.lock().map_err(poisoned)?.commit_conflicts = count;
        Ok(())
    }

    /// Make every rollback fail
    pub fn inject_rollback_failure(&self) -> Result<()> {
        self.faults.lock().map_err(poisoned)?.rollback_failure = true;
        Ok(())
    }

    /// Make the next transfer insert fail, after balances were updated
    pub fn inject_transfer_insert_failure(&self) -> Result<()> {
        self.faults.lock().map_err(poisoned)?.transfer_insert_failure = true;
        Ok(())
    }

    /// How many transactions have been opened so far
    pub fn begin_count(&self) -> u64 {
        self.begins.load(Ordering::SeqCst)
    }

    /// Account ids passed to `get_account_for_update`, in call order,
    /// across all transactions
    pub fn claim_log(&self) -> Result<Vec<i64>> {
        Ok(self.claims.lock().map_err(poisoned)?.clone())
    }
}

impl LedgerStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn begin(&self) -> Result<Box<dyn LedgerTx + '_>> {
        let guard = self.writer.lock().map_err(poisoned)?;
        let staged = self.state.lock().map_err(poisoned)?.clone();
        self.begins.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryTx {
            store: self,
            staged,
            _guard: guard,
        }))
    }
}

/// Open transaction: holds the writer lock and a private copy of the ledger.
/// Dropping it discards the copy.
struct MemoryTx<'a> {
    store: &'a MemoryStore,
    staged: LedgerState,
    _guard: MutexGuard<'a, ()>,
}

impl MemoryTx<'_> {
    fn account_mut(&mut self, id: i64) -> Result<&mut Account> {
        self.staged
            .accounts
            .get_mut(&id)
            .ok_or_else(|| Error::not_found(format!("account {}", id)))
    }

    fn require_account(&self, id: i64) -> Result<()> {
        if self.staged.accounts.contains_key(&id) {
            Ok(())
        } else {
            Err(Error::database(format!(
                "foreign key violation: account {} does not exist",
                id
            )))
        }
    }
}

fn window<T>(items: impl Iterator<Item = T>, page: Page) -> Vec<T> {
    items
        .skip(page.offset as usize)
        .take(page.limit as usize)
        .collect()
}

impl LedgerTx for MemoryTx<'_> {
    fn create_account(
        &mut self,
        owner: &str,
        currency: Currency,
        initial_balance: i64,
    ) -> Result<Account> {
        if self
            .staged
            .accounts
            .values()
            .any(|a| a.owner == owner && a.currency == currency)
        {
            return Err(Error::DuplicateAccount {
                owner: owner.to_string(),
                currency,
            });
        }
        if initial_balance < 0 {
            return Err(Error::database("check constraint violation: balance >= 0"));
        }
        self.staged.last_account_id += 1;
        let account = Account {
            id: self.staged.last_account_id,
            owner: owner.to_string(),
            balance: initial_balance,
            currency,
            created_at: Utc::now(),
        };
        self.staged.accounts.insert(account.id, account.clone());
        Ok(account)
    }

    fn get_account(&mut self, id: i64) -> Result<Account> {
        self.account_mut(id).map(|a| a.clone())
    }

    fn get_account_for_update(&mut self, id: i64) -> Result<Account> {
        // The writer lock already serializes every transaction
        self.store.claims.lock().map_err(poisoned)?.push(id);
        self.get_account(id)
    }

    fn update_account_balance(&mut self, id: i64, delta: i64) -> Result<Account> {
        let account = self.account_mut(id)?;
        let balance = account
            .balance
            .checked_add(delta)
            .ok_or_else(|| Error::database("balance overflow"))?;
        if balance < 0 {
            return Err(Error::InsufficientFunds {
                account_id: id,
                balance: account.balance,
                requested: delta.saturating_neg(),
            });
        }
        account.balance = balance;
        Ok(account.clone())
    }

    fn list_accounts(&mut self, owner: Option<&str>, page: Page) -> Result<Vec<Account>> {
        let matching = self
            .staged
            .accounts
            .values()
            .filter(|a| owner.map_or(true, |o| a.owner == o))
            .cloned();
        Ok(window(matching, page))
    }

    fn create_entry(&mut self, account_id: i64, amount: i64) -> Result<Entry> {
        self.require_account(account_id)?;
        self.staged.last_entry_id += 1;
        let entry = Entry {
            id: self.staged.last_entry_id,
            account_id,
            amount,
            created_at: Utc::now(),
        };
        self.staged.entries.push(entry.clone());
        Ok(entry)
    }

    fn create_transfer(
        &mut self,
        from_account_id: i64,
        to_account_id: i64,
        amount: i64,
    ) -> Result<Transfer> {
        {
            let mut faults = self.store.faults.lock().map_err(poisoned)?;
            if faults.transfer_insert_failure {
                faults.transfer_insert_failure = false;
                return Err(Error::database("injected transfer insert failure"));
            }
        }
        self.require_account(from_account_id)?;
        self.require_account(to_account_id)?;
        if amount <= 0 || from_account_id == to_account_id {
            return Err(Error::database("check constraint violation on transfers"));
        }
        self.staged.last_transfer_id += 1;
        let transfer = Transfer {
            id: self.staged.last_transfer_id,
            from_account_id,
            to_account_id,
            amount,
            created_at: Utc::now(),
        };
        self.staged.transfers.push(transfer.clone());
        Ok(transfer)
    }

    fn list_entries(&mut self, account_id: i64, page: Page) -> Result<Vec<Entry>> {
        let matching = self
            .staged
            .entries
            .iter()
            .filter(|e| e.account_id == account_id)
            .cloned();
        Ok(window(matching, page))
    }

    fn list_transfers(&mut self, account_id: i64, page: Page) -> Result<Vec<Transfer>> {
        let matching = self
            .staged
            .transfers
            .iter()
            .filter(|t| t.from_account_id == account_id || t.to_account_id == account_id)
            .cloned();
        Ok(window(matching, page))
    }

    fn ledger_totals(&mut self) -> Result<LedgerTotals> {
        let mut sums: BTreeMap<&'static str, (Currency, i128)> = BTreeMap::new();
        for account in self.staged.accounts.values() {
            sums.entry(account.currency.code())
                .or_insert((account.currency, 0))
                .1 += i128::from(account.balance);
        }
        Ok(LedgerTotals {
            accounts: self.staged.accounts.len() as i64,
            entries: self.staged.entries.len() as i64,
            transfers: self.staged.transfers.len() as i64,
            balances: sums.into_values().collect(),
        })
    }

    fn audit(&mut self) -> Result<LedgerAudit> {
        let negative_balances = self
            .staged
            .accounts
            .values()
            .filter(|a| a.balance < 0)
            .map(|a| a.id)
            .collect();

        let mut entry_totals: BTreeMap<i64, i64> = BTreeMap::new();
        for entry in &self.staged.entries {
            *entry_totals.entry(entry.account_id).or_default() += entry.amount;
        }
        let mut transfer_totals: BTreeMap<i64, i64> = BTreeMap::new();
        for transfer in &self.staged.transfers {
            *transfer_totals.entry(transfer.to_account_id).or_default() += transfer.amount;
            *transfer_totals.entry(transfer.from_account_id).or_default() -= transfer.amount;
        }
        let drifted_accounts = self
            .staged
            .accounts
            .keys()
            .filter_map(|id| {
                let entry_total = entry_totals.get(id).copied().unwrap_or(0);
                let transfer_total = transfer_totals.get(id).copied().unwrap_or(0);
                (entry_total != transfer_total).then_some(AccountDrift {
                    account_id: *id,
                    entry_total,
                    transfer_total,
                })
            })
            .collect();

        let invalid_transfers = self
            .staged
            .transfers
            .iter()
            .filter(|t| t.amount <= 0 || t.from_account_id == t.to_account_id)
            .map(|t| t.id)
            .collect();

        let accounts = &self.staged.accounts;
        let orphaned_entries = self
            .staged
            .entries
            .iter()
            .filter(|e| !accounts.contains_key(&e.account_id))
            .map(|e| e.id)
            .collect();
        let orphaned_transfers = self
            .staged
            .transfers
            .iter()
            .filter(|t| {
                !accounts.contains_key(&t.from_account_id) || !accounts.contains_key(&t.to_account_id)
            })
            .map(|t| t.id)
            .collect();

        Ok(LedgerAudit {
            negative_balances,
            entry_sum: self.staged.entries.iter().map(|e| e.amount).sum(),
            drifted_accounts,
            invalid_transfers,
            orphaned_entries,
            orphaned_transfers,
        })
    }

    fn commit(self: Box<Self>) -> Result<()> {
        {
            let mut faults = self.store.faults.lock().map_err(poisoned)?;
            if faults.commit_conflicts > 0 {
                faults.commit_conflicts -= 1;
                return Err(Error::TransientStore(
                    "injected serialization conflict".to_string(),
                ));
            }
        }
        let MemoryTx { store, staged, _guard } = *self;
        *store.state.lock().map_err(poisoned)? = staged;
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<()> {
        if self.store.faults.lock().map_err(poisoned)?.rollback_failure {
            return Err(Error::database("injected rollback failure"));
        }
        Ok(())
    }
}
