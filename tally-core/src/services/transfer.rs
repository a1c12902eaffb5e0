//! Transfer service - moves funds between two accounts atomically
//!
//! A transfer is checked up front (amount, distinct accounts, existence,
//! currency, ownership) and then executed as one unit of work: both
//! accounts are claimed in ascending id order, the source balance is
//! checked, both balances are moved and the debit entry, credit entry and
//! transfer record are written. Anything failing in between rolls the whole
//! unit back.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::domain::result::{Error, Result};
use crate::domain::{RequestContext, TransferRequest, TransferResult, TransferState};
use crate::services::coordinator::{Coordinator, UnitOfWork};

/// Callback invoked with every committed transfer
pub type TransferHook = Arc<dyn Fn(&TransferResult) + Send + Sync>;

/// Service for executing transfers
pub struct TransferService {
    coordinator: Arc<Coordinator>,
    hooks: Vec<TransferHook>,
}

impl TransferService {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self {
            coordinator,
            hooks: Vec::new(),
        }
    }

    /// Register a callback that runs after each committed transfer
    pub fn with_hook(mut self, hook: TransferHook) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Transfer `request.amount` from the source to the destination account
    pub fn transfer(&self, ctx: &RequestContext, request: TransferRequest) -> Result<TransferResult> {
        request.validate()?;
        self.precheck(ctx, &request)?;
        debug!(
            from = request.from_account_id,
            to = request.to_account_id,
            amount = request.amount,
            state = %TransferState::Validated,
            "transfer state"
        );

        let mut last_state = TransferState::Validated;
        let outcome = self.coordinator.run(ctx, |uow| {
            let mut attempt = TransferAttempt::new(request);
            let result = attempt.execute(uow);
            last_state = attempt.state;

            if let Ok(committed) = &result {
                if !self.hooks.is_empty() {
                    let hooks = self.hooks.clone();
                    let committed = committed.clone();
                    uow.after_commit(move || {
                        for hook in &hooks {
                            hook(&committed);
                        }
                    });
                }
            }
            result
        });

        match &outcome {
            Ok(result) => {
                debug!(
                    transfer_id = result.transfer.id,
                    state = %TransferState::Committed,
                    "transfer state"
                );
                info!(
                    transfer_id = result.transfer.id,
                    from = request.from_account_id,
                    to = request.to_account_id,
                    amount = request.amount,
                    "transfer committed"
                );
            }
            Err(err) if last_state == TransferState::Applied => {
                warn!(
                    from = request.from_account_id,
                    to = request.to_account_id,
                    error = %err,
                    "transfer applied but not committed"
                );
            }
            Err(_) => {}
        }
        outcome
    }

    /// Store-side preconditions, read in their own short transaction
    fn precheck(&self, ctx: &RequestContext, request: &TransferRequest) -> Result<()> {
        let (from, to) = self.coordinator.run(ctx, |uow| {
            let from = uow.get_account(request.from_account_id)?;
            let to = uow.get_account(request.to_account_id)?;
            Ok((from, to))
        })?;

        if from.currency != to.currency {
            return Err(Error::CurrencyMismatch {
                from: from.currency,
                to: to.currency,
            });
        }
        ctx.authorize_owner(&from.owner)
    }
}

/// One run of the transfer unit of work, tracking its lifecycle state
struct TransferAttempt {
    request: TransferRequest,
    state: TransferState,
}

impl TransferAttempt {
    fn new(request: TransferRequest) -> Self {
        Self {
            request,
            state: TransferState::Validated,
        }
    }

    fn advance(&mut self, next: TransferState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal transfer transition {} -> {}",
            self.state,
            next
        );
        debug!(
            from = self.request.from_account_id,
            to = self.request.to_account_id,
            state = %next,
            "transfer state"
        );
        self.state = next;
    }

    fn execute(&mut self, uow: &mut UnitOfWork<'_>) -> Result<TransferResult> {
        let result = self.apply(uow);
        if let Err(err) = &result {
            if self.state.can_advance_to(TransferState::Aborted) {
                debug!(error = %err, kind = err.kind(), "transfer aborted");
                self.advance(TransferState::Aborted);
            }
        }
        result
    }

    fn apply(&mut self, uow: &mut UnitOfWork<'_>) -> Result<TransferResult> {
        let TransferRequest {
            from_account_id,
            to_account_id,
            amount,
        } = self.request;

        let (from, _to) = uow.lock_pair(from_account_id, to_account_id)?;
        self.advance(TransferState::Locked);

        if from.balance < amount {
            return Err(Error::InsufficientFunds {
                account_id: from.id,
                balance: from.balance,
                requested: amount,
            });
        }
        self.advance(TransferState::BalanceChecked);

        let from_account = uow.update_account_balance(from_account_id, -amount)?;
        let to_account = uow.update_account_balance(to_account_id, amount)?;
        let from_entry = uow.create_entry(from_account_id, -amount)?;
        let to_entry = uow.create_entry(to_account_id, amount)?;
        let transfer = uow.create_transfer(from_account_id, to_account_id, amount)?;
        self.advance(TransferState::Applied);

        Ok(TransferResult {
            transfer,
            from_account,
            to_account,
            from_entry,
            to_entry,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use proptest::prelude::*;

    use super::*;
    use crate::adapters::memory::MemoryStore;
    use crate::domain::{Account, Currency, Page};
    use crate::services::coordinator::RetryPolicy;

    struct Fixture {
        store: Arc<MemoryStore>,
        coordinator: Arc<Coordinator>,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(MemoryStore::new());
            let coordinator = Arc::new(Coordinator::new(
                store.clone(),
                RetryPolicy {
                    max_attempts: 3,
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(2),
                },
            ));
            Self { store, coordinator }
        }

        fn service(&self) -> TransferService {
            TransferService::new(self.coordinator.clone())
        }

        fn account(&self, owner: &str, currency: Currency, balance: i64) -> Account {
            self.coordinator
                .run(&RequestContext::background(), |uow| {
                    uow.create_account(owner, currency, balance)
                })
                .unwrap()
        }

        fn balance(&self, id: i64) -> i64 {
            self.coordinator
                .run(&RequestContext::background(), |uow| uow.get_account(id))
                .unwrap()
                .balance
        }

        fn entry_count(&self) -> i64 {
            self.coordinator
                .run(&RequestContext::background(), |uow| uow.ledger_totals())
                .unwrap()
                .entries
        }
    }

    #[test]
    fn test_transfer_moves_funds_and_records_entries() {
        let fx = Fixture::new();
        let a = fx.account("alice", Currency::Usd, 100);
        let b = fx.account("bob", Currency::Usd, 50);
        let service = fx.service();
        let ctx = RequestContext::background();

        let result = service.transfer(&ctx, TransferRequest::new(a.id, b.id, 30)).unwrap();
        assert_eq!(result.from_account.balance, 70);
        assert_eq!(result.to_account.balance, 80);
        assert_eq!(result.from_entry.amount, -30);
        assert_eq!(result.to_entry.amount, 30);
        assert_eq!(result.transfer.amount, 30);
        assert_eq!(result.transfer.from_account_id, a.id);
        assert_eq!(result.transfer.to_account_id, b.id);

        let err = service
            .transfer(&ctx, TransferRequest::new(a.id, b.id, 1000))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientFunds { balance: 70, requested: 1000, .. }
        ));
        assert_eq!(fx.balance(a.id), 70);
        assert_eq!(fx.balance(b.id), 80);
        assert_eq!(fx.entry_count(), 2);

        let transfers = fx
            .coordinator
            .run(&ctx, |uow| uow.list_transfers(a.id, Page::default()))
            .unwrap();
        assert_eq!(transfers.len(), 1);
    }

    #[test]
    fn test_reverse_transfer_claims_lower_id_first() {
        let fx = Fixture::new();
        let a = fx.account("alice", Currency::Usd, 100);
        let b = fx.account("bob", Currency::Usd, 50);

        fx.service()
            .transfer(&RequestContext::background(), TransferRequest::new(b.id, a.id, 20))
            .unwrap();
        assert!(a.id < b.id);
        assert_eq!(fx.store.claim_log().unwrap(), vec![a.id, b.id]);
        assert_eq!(fx.balance(a.id), 120);
        assert_eq!(fx.balance(b.id), 30);
    }

    #[test]
    fn test_invalid_requests_never_touch_the_store() {
        let fx = Fixture::new();
        let service = fx.service();
        let ctx = RequestContext::background();

        for request in [
            TransferRequest::new(1, 1, 10),
            TransferRequest::new(1, 2, 0),
            TransferRequest::new(1, 2, -5),
        ] {
            let err = service.transfer(&ctx, request).unwrap_err();
            assert!(matches!(err, Error::Validation(_)), "{:?}", request);
        }
        assert_eq!(fx.store.begin_count(), 0);
    }

    #[test]
    fn test_missing_account_and_currency_mismatch() {
        let fx = Fixture::new();
        let usd = fx.account("alice", Currency::Usd, 100);
        let eur = fx.account("alice", Currency::Eur, 100);
        let service = fx.service();
        let ctx = RequestContext::background();

        assert!(matches!(
            service.transfer(&ctx, TransferRequest::new(usd.id, 999, 10)),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            service.transfer(&ctx, TransferRequest::new(usd.id, eur.id, 10)),
            Err(Error::CurrencyMismatch {
                from: Currency::Usd,
                to: Currency::Eur
            })
        ));
        assert_eq!(fx.balance(usd.id), 100);
        assert_eq!(fx.balance(eur.id), 100);
    }

    #[test]
    fn test_principal_must_own_source_account() {
        let fx = Fixture::new();
        let a = fx.account("alice", Currency::Usd, 100);
        let b = fx.account("bob", Currency::Usd, 100);
        let service = fx.service();

        let err = service
            .transfer(&RequestContext::for_principal("bob"), TransferRequest::new(a.id, b.id, 10))
            .unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));

        // Paying into someone else's account is fine
        service
            .transfer(&RequestContext::for_principal("alice"), TransferRequest::new(a.id, b.id, 10))
            .unwrap();
        assert_eq!(fx.balance(b.id), 110);
    }

    #[test]
    fn test_failure_after_balance_update_rolls_back_everything() {
        let fx = Fixture::new();
        let a = fx.account("alice", Currency::Usd, 100);
        let b = fx.account("bob", Currency::Usd, 50);
        fx.store.inject_transfer_insert_failure().unwrap();

        let err = fx
            .service()
            .transfer(&RequestContext::background(), TransferRequest::new(a.id, b.id, 30))
            .unwrap_err();
        assert!(matches!(err, Error::Database(_)));
        assert_eq!(fx.balance(a.id), 100);
        assert_eq!(fx.balance(b.id), 50);
        assert_eq!(fx.entry_count(), 0);
    }

    #[test]
    fn test_transient_commit_failure_is_retried() {
        let fx = Fixture::new();
        let a = fx.account("alice", Currency::Usd, 100);
        let b = fx.account("bob", Currency::Usd, 50);
        fx.store.inject_commit_conflicts(2).unwrap();

        let result = fx
            .service()
            .transfer(&RequestContext::background(), TransferRequest::new(b.id, a.id, 50))
            .unwrap();
        assert_eq!(result.from_account.balance, 0);
        assert_eq!(fx.balance(a.id), 150);
        assert_eq!(fx.entry_count(), 2);
    }

    #[test]
    fn test_hooks_see_committed_transfers_only() {
        let fx = Fixture::new();
        let a = fx.account("alice", Currency::Usd, 100);
        let b = fx.account("bob", Currency::Usd, 0);
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let service = fx.service().with_hook(Arc::new(move |result: &TransferResult| {
            assert_eq!(result.transfer.amount, 40);
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        let ctx = RequestContext::background();

        service.transfer(&ctx, TransferRequest::new(a.id, b.id, 40)).unwrap();
        assert!(service.transfer(&ctx, TransferRequest::new(a.id, b.id, 400)).is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    fn transfer_plan() -> impl Strategy<Value = (Vec<i64>, Vec<(usize, usize, i64)>)> {
        (
            prop::collection::vec(0i64..500, 3),
            prop::collection::vec((0usize..3, 0usize..3, 1i64..300), 1..25),
        )
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_transfers_conserve_money((initial, plan) in transfer_plan()) {
            let fx = Fixture::new();
            let owners = ["alice", "bob", "carol"];
            let accounts: Vec<Account> = owners
                .iter()
                .zip(&initial)
                .map(|(owner, balance)| fx.account(owner, Currency::Usd, *balance))
                .collect();
            let service = fx.service();
            let ctx = RequestContext::background();
            let total: i64 = initial.iter().sum();
            let mut expected = initial.clone();

            for (from, to, amount) in plan {
                let before = fx.entry_count();
                let outcome = service.transfer(
                    &ctx,
                    TransferRequest::new(accounts[from].id, accounts[to].id, amount),
                );
                if from == to {
                    prop_assert!(matches!(outcome, Err(Error::Validation(_))));
                } else if expected[from] < amount {
                    prop_assert!(matches!(outcome, Err(Error::InsufficientFunds { .. })), "{:?}", outcome);
                } else {
                    let result = outcome.unwrap();
                    expected[from] -= amount;
                    expected[to] += amount;
                    prop_assert_eq!(result.from_account.balance, expected[from]);
                    prop_assert_eq!(result.to_account.balance, expected[to]);
                    prop_assert_eq!(result.from_entry.amount + result.to_entry.amount, 0);
                    prop_assert_eq!(fx.entry_count(), before + 2);
                    continue;
                }
                prop_assert_eq!(fx.entry_count(), before);
            }

            let balances: Vec<i64> = accounts.iter().map(|a| fx.balance(a.id)).collect();
            prop_assert_eq!(&balances, &expected);
            prop_assert_eq!(balances.iter().sum::<i64>(), total);
            prop_assert!(balances.iter().all(|b| *b >= 0));
        }
    }
}
