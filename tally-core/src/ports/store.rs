//! Ledger store port - transactional database abstraction

use serde::Serialize;

use crate::domain::result::Result;
use crate::domain::{Account, Currency, Entry, Page, Transfer};

/// A relational backend that can open transactions.
///
/// Implementations must be shareable across threads; each transaction they
/// hand out is used by one thread only.
pub trait LedgerStore: Send + Sync {
    /// Backend name for logs (e.g., "duckdb", "memory")
    fn name(&self) -> &str;

    /// Open a new transaction
    fn begin(&self) -> Result<Box<dyn LedgerTx + '_>>;
}

/// Operations available inside one open transaction.
///
/// Dropping a handle without calling `commit` or `rollback` rolls it back.
/// After any operation fails the transaction must be rolled back; none of
/// its writes become visible.
pub trait LedgerTx {
    // === Accounts ===

    /// Insert a new account. Fails with `DuplicateAccount` when the owner
    /// already holds an account in that currency.
    fn create_account(
        &mut self,
        owner: &str,
        currency: Currency,
        initial_balance: i64,
    ) -> Result<Account>;

    /// Read an account, `NotFound` if absent
    fn get_account(&mut self, id: i64) -> Result<Account>;

    /// Read an account and claim its row for writing until the
    /// transaction ends
    fn get_account_for_update(&mut self, id: i64) -> Result<Account>;

    /// Atomically add `delta` to the balance. Fails with
    /// `InsufficientFunds` if the result would be negative.
    fn update_account_balance(&mut self, id: i64, delta: i64) -> Result<Account>;

    /// List accounts ordered by id, optionally for one owner
    fn list_accounts(&mut self, owner: Option<&str>, page: Page) -> Result<Vec<Account>>;

    // === Ledger records ===

    fn create_entry(&mut self, account_id: i64, amount: i64) -> Result<Entry>;

    fn create_transfer(&mut self, from_account_id: i64, to_account_id: i64, amount: i64)
        -> Result<Transfer>;

    /// Entries of one account, oldest first
    fn list_entries(&mut self, account_id: i64, page: Page) -> Result<Vec<Entry>>;

    /// Transfers where the account is either side, oldest first
    fn list_transfers(&mut self, account_id: i64, page: Page) -> Result<Vec<Transfer>>;

    // === Reporting ===

    /// Row counts and per-currency balance sums
    fn ledger_totals(&mut self) -> Result<LedgerTotals>;

    /// Consistency data for the doctor checks
    fn audit(&mut self) -> Result<LedgerAudit>;

    // === Completion ===

    fn commit(self: Box<Self>) -> Result<()>;

    fn rollback(self: Box<Self>) -> Result<()>;
}

/// Result of `ledger_totals`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerTotals {
    pub accounts: i64,
    pub entries: i64,
    pub transfers: i64,
    /// Sum of balances per currency as i128, ordered by currency
    pub balances: Vec<(Currency, i128)>,
}

/// Per-account disagreement between entries and transfers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountDrift {
    pub account_id: i64,
    /// Sum of the account's entries
    pub entry_total: i64,
    /// Incoming minus outgoing transfer amounts
    pub transfer_total: i64,
}

/// Result of `audit`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerAudit {
    /// Accounts whose balance is below zero
    pub negative_balances: Vec<i64>,
    /// Sum of every entry amount; zero in a balanced ledger
    pub entry_sum: i64,
    pub drifted_accounts: Vec<AccountDrift>,
    /// Transfers with a non-positive amount or the same account on both sides
    pub invalid_transfers: Vec<i64>,
    /// Entries pointing at an account that does not exist
    pub orphaned_entries: Vec<i64>,
    /// Transfers with either side pointing at a missing account
    pub orphaned_transfers: Vec<i64>,
}
