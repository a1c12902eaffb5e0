//! Transaction coordinator - runs units of work atomically
//!
//! Every unit of work runs inside one store transaction that is committed on
//! success and rolled back on every other exit path (errors, cancellation,
//! panics via the transaction's drop guard). Transient store conflicts are
//! retried from a fresh transaction with jittered exponential backoff.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, info, warn};

use crate::domain::result::{Error, Result};
use crate::domain::{Account, Currency, Entry, Page, RequestContext, Transfer};
use crate::ports::{LedgerAudit, LedgerStore, LedgerTotals, LedgerTx};

/// Longest single sleep between cancellation checks while backing off
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Bounded retry with exponential backoff and full jitter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Upper bound of the backoff after the given failed attempt (1-based)
    pub fn backoff_ceiling(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Random delay in `[0, backoff_ceiling(attempt)]`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let ceiling = self.backoff_ceiling(attempt).as_micros() as u64;
        if ceiling == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(rand::thread_rng().gen_range(0..=ceiling))
    }
}

/// Callback run once after a successful commit
pub type CommitHook = Box<dyn FnOnce() + Send + 'static>;

/// The store operations available to a unit of work.
///
/// Every operation first checks the request context, so a cancelled caller
/// stops issuing statements and the coordinator rolls back.
pub struct UnitOfWork<'a> {
    tx: Box<dyn LedgerTx + 'a>,
    ctx: &'a RequestContext,
    hooks: Vec<CommitHook>,
}

impl<'a> UnitOfWork<'a> {
    fn new(tx: Box<dyn LedgerTx + 'a>, ctx: &'a RequestContext) -> Self {
        Self {
            tx,
            ctx,
            hooks: Vec::new(),
        }
    }

    pub fn ctx(&self) -> &RequestContext {
        self.ctx
    }

    /// Register a callback to run after this unit of work commits.
    /// Discarded if the transaction rolls back or is retried.
    pub fn after_commit(&mut self, hook: impl FnOnce() + Send + 'static) {
        self.hooks.push(Box::new(hook));
    }

    pub fn create_account(
        &mut self,
        owner: &str,
        currency: Currency,
        initial_balance: i64,
    ) -> Result<Account> {
        self.ctx.check()?;
        self.tx.create_account(owner, currency, initial_balance)
    }

    pub fn get_account(&mut self, id: i64) -> Result<Account> {
        self.ctx.check()?;
        self.tx.get_account(id)
    }

    pub fn get_account_for_update(&mut self, id: i64) -> Result<Account> {
        self.ctx.check()?;
        self.tx.get_account_for_update(id)
    }

    /// Claim two accounts in ascending id order, whatever the direction of
    /// the operation, and return them in argument order.
    ///
    /// Two units of work locking the same pair always claim the lower id
    /// first, so they can never wait on each other in a cycle.
    pub fn lock_pair(&mut self, first: i64, second: i64) -> Result<(Account, Account)> {
        if first == second {
            return Err(Error::validation("cannot lock the same account twice"));
        }
        let (low, high) = if first < second {
            (first, second)
        } else {
            (second, first)
        };
        let low_account = self.get_account_for_update(low)?;
        let high_account = self.get_account_for_update(high)?;
        if first == low {
            Ok((low_account, high_account))
        } else {
            Ok((high_account, low_account))
        }
    }

    pub fn update_account_balance(&mut self, id: i64, delta: i64) -> Result<Account> {
        self.ctx.check()?;
        self.tx.update_account_balance(id, delta)
    }

    pub fn list_accounts(&mut self, owner: Option<&str>, page: Page) -> Result<Vec<Account>> {
        self.ctx.check()?;
        self.tx.list_accounts(owner, page)
    }

    pub fn create_entry(&mut self, account_id: i64, amount: i64) -> Result<Entry> {
        self.ctx.check()?;
        self.tx.create_entry(account_id, amount)
    }

    pub fn create_transfer(
        &mut self,
        from_account_id: i64,
        to_account_id: i64,
        amount: i64,
    ) -> Result<Transfer> {
        self.ctx.check()?;
        self.tx.create_transfer(from_account_id, to_account_id, amount)
    }

    pub fn list_entries(&mut self, account_id: i64, page: Page) -> Result<Vec<Entry>> {
        self.ctx.check()?;
        self.tx.list_entries(account_id, page)
    }

    pub fn list_transfers(&mut self, account_id: i64, page: Page) -> Result<Vec<Transfer>> {
        self.ctx.check()?;
        self.tx.list_transfers(account_id, page)
    }

    pub fn ledger_totals(&mut self) -> Result<LedgerTotals> {
        self.ctx.check()?;
        self.tx.ledger_totals()
    }

    pub fn audit(&mut self) -> Result<LedgerAudit> {
        self.ctx.check()?;
        self.tx.audit()
    }
}

/// Runs units of work against a ledger store
pub struct Coordinator {
    store: Arc<dyn LedgerStore>,
    retry: RetryPolicy,
    transaction_timeout: Option<Duration>,
}

impl Coordinator {
    pub fn new(store: Arc<dyn LedgerStore>, retry: RetryPolicy) -> Self {
        Self {
            store,
            retry,
            transaction_timeout: None,
        }
    }

    /// Bound every `run` call by this timeout on top of the caller's deadline
    pub fn with_transaction_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.transaction_timeout = timeout;
        self
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Execute `work` in one transaction, retrying transient conflicts.
    ///
    /// `work` may run several times; each run starts from a fresh
    /// transaction and only the last run's commit hooks survive.
    pub fn run<T, F>(&self, ctx: &RequestContext, mut work: F) -> Result<T>
    where
        F: FnMut(&mut UnitOfWork<'_>) -> Result<T>,
    {
        let ctx = match self.transaction_timeout {
            Some(timeout) => ctx.clone().with_timeout(timeout),
            None => ctx.clone(),
        };
        let max_attempts = self.retry.max_attempts.max(1);

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.attempt(&ctx, &mut work) {
                Ok((value, hooks)) => {
                    if attempt > 1 {
                        info!(store = self.store.name(), attempt, "transaction committed after retry");
                    }
                    for hook in hooks {
                        hook();
                    }
                    return Ok(value);
                }
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        store = self.store.name(),
                        attempt,
                        max_attempts,
                        delay_us = delay.as_micros() as u64,
                        error = %err,
                        "transient store conflict, retrying"
                    );
                    pause(&ctx, delay)?;
                }
                Err(err) => {
                    if err.is_transient() {
                        warn!(store = self.store.name(), attempts = attempt, error = %err, "retry budget exhausted");
                    }
                    return Err(err);
                }
            }
        }
    }

    fn attempt<T, F>(&self, ctx: &RequestContext, work: &mut F) -> Result<(T, Vec<CommitHook>)>
    where
        F: FnMut(&mut UnitOfWork<'_>) -> Result<T>,
    {
        ctx.check()?;
        let tx = self.store.begin()?;
        let mut uow = UnitOfWork::new(tx, ctx);

        // A caller that cancelled while the work ran must not see a commit
        let outcome = work(&mut uow).and_then(|value| ctx.check().map(|_| value));

        let UnitOfWork { tx, hooks, .. } = uow;
        match outcome {
            Ok(value) => {
                tx.commit()?;
                debug!(store = self.store.name(), "transaction committed");
                Ok((value, hooks))
            }
            Err(cause) => match tx.rollback() {
                Ok(()) => {
                    debug!(store = self.store.name(), error = %cause, "transaction rolled back");
                    Err(cause)
                }
                Err(rollback) => Err(Error::TransactionAbort {
                    cause: Box::new(cause),
                    rollback: Box::new(rollback),
                }),
            },
        }
    }
}

/// Sleep for `delay`, waking early with `Cancelled` if the context ends
fn pause(ctx: &RequestContext, delay: Duration) -> Result<()> {
    let until = Instant::now() + delay;
    loop {
        ctx.check()?;
        let now = Instant::now();
        if now >= until {
            return Ok(());
        }
        thread::sleep((until - now).min(CANCEL_POLL_INTERVAL));
    }
}
