//! Account service - opening accounts and reading ledger history

use std::sync::Arc;

use tracing::info;

use crate::domain::result::{Error, Result};
use crate::domain::{Account, Entry, NewAccount, Page, RequestContext, Transfer};
use crate::services::coordinator::{Coordinator, UnitOfWork};

/// Service for account management and per-account history
pub struct AccountService {
    coordinator: Arc<Coordinator>,
}

impl AccountService {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }

    /// Open a new account. A principal may only open accounts for itself.
    pub fn create_account(&self, ctx: &RequestContext, new: NewAccount) -> Result<Account> {
        new.validate()?;
        ctx.authorize_owner(&new.owner)?;

        let account = self.coordinator.run(ctx, |uow| {
            uow.create_account(&new.owner, new.currency, new.initial_balance)
        })?;
        info!(account_id = account.id, currency = %account.currency, "account created");
        Ok(account)
    }

    pub fn get_account(&self, ctx: &RequestContext, id: i64) -> Result<Account> {
        self.coordinator.run(ctx, |uow| owned_account(uow, id))
    }

    /// List accounts, optionally for one owner.
    ///
    /// With a principal the listing is always restricted to its own
    /// accounts; asking for another owner's accounts is refused.
    pub fn list_accounts(
        &self,
        ctx: &RequestContext,
        owner: Option<&str>,
        page: Page,
    ) -> Result<Vec<Account>> {
        let owner = match (ctx.principal(), owner) {
            (Some(principal), Some(requested)) if principal.username() != requested => {
                return Err(Error::unauthorized(
                    "cannot list accounts of another user",
                ));
            }
            (Some(principal), _) => Some(principal.username().to_string()),
            (None, requested) => requested.map(str::to_string),
        };

        self.coordinator
            .run(ctx, |uow| uow.list_accounts(owner.as_deref(), page))
    }

    /// Entries booked against an account, oldest first
    pub fn list_entries(&self, ctx: &RequestContext, account_id: i64, page: Page) -> Result<Vec<Entry>> {
        self.coordinator.run(ctx, |uow| {
            owned_account(uow, account_id)?;
            uow.list_entries(account_id, page)
        })
    }

    /// Transfers into or out of an account, oldest first
    pub fn list_transfers(
        &self,
        ctx: &RequestContext,
        account_id: i64,
        page: Page,
    ) -> Result<Vec<Transfer>> {
        self.coordinator.run(ctx, |uow| {
            owned_account(uow, account_id)?;
            uow.list_transfers(account_id, page)
        })
    }
}

fn owned_account(uow: &mut UnitOfWork<'_>, id: i64) -> Result<Account> {
    let account = uow.get_account(id)?;
    uow.ctx().authorize_owner(&account.owner)?;
    Ok(account)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::MemoryStore;
    use crate::domain::{Currency, TransferRequest};
    use crate::services::coordinator::RetryPolicy;
    use crate::services::transfer::TransferService;

    fn coordinator() -> Arc<Coordinator> {
        Arc::new(Coordinator::new(
            Arc::new(MemoryStore::new()),
            RetryPolicy::no_retry(),
        ))
    }

    #[test]
    fn test_create_and_get_account() {
        let service = AccountService::new(coordinator());
        let ctx = RequestContext::for_principal("alice");

        let account = service
            .create_account(&ctx, NewAccount::new("alice", Currency::Cad, 25))
            .unwrap();
        assert_eq!(account.balance, 25);
        assert_eq!(service.get_account(&ctx, account.id).unwrap(), account);

        assert!(matches!(
            service.create_account(&ctx, NewAccount::new("alice", Currency::Cad, 0)),
            Err(Error::DuplicateAccount { currency: Currency::Cad, .. })
        ));
    }

    #[test]
    fn test_create_account_validates_input() {
        let service = AccountService::new(coordinator());
        let ctx = RequestContext::background();

        for new in [
            NewAccount::new("Al", Currency::Usd, 0),
            NewAccount::new("bad owner", Currency::Usd, 0),
            NewAccount::new("alice", Currency::Usd, -1),
        ] {
            assert!(matches!(service.create_account(&ctx, new), Err(Error::Validation(_))));
        }
    }

    #[test]
    fn test_principal_scoping() {
        let service = AccountService::new(coordinator());
        let admin = RequestContext::background();
        let alice = service
            .create_account(&admin, NewAccount::new("alice", Currency::Usd, 10))
            .unwrap();
        service
            .create_account(&admin, NewAccount::new("bob", Currency::Usd, 10))
            .unwrap();

        let bob = RequestContext::for_principal("bob");
        assert!(matches!(
            service.create_account(&bob, NewAccount::new("alice", Currency::Eur, 0)),
            Err(Error::Unauthorized(_))
        ));
        assert!(matches!(service.get_account(&bob, alice.id), Err(Error::Unauthorized(_))));
        assert!(matches!(
            service.list_entries(&bob, alice.id, Page::default()),
            Err(Error::Unauthorized(_))
        ));
        assert!(matches!(
            service.list_accounts(&bob, Some("alice"), Page::default()),
            Err(Error::Unauthorized(_))
        ));

        let listed = service.list_accounts(&bob, None, Page::default()).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].owner, "bob");
        assert_eq!(service.list_accounts(&admin, None, Page::default()).unwrap().len(), 2);
    }

    #[test]
    fn test_history_pages() {
        let coordinator = coordinator();
        let accounts = AccountService::new(coordinator.clone());
        let transfers = TransferService::new(coordinator);
        let ctx = RequestContext::background();
        let a = accounts
            .create_account(&ctx, NewAccount::new("alice", Currency::Usd, 100))
            .unwrap();
        let b = accounts
            .create_account(&ctx, NewAccount::new("bob", Currency::Usd, 0))
            .unwrap();
        for amount in 1..=5 {
            transfers
                .transfer(&ctx, TransferRequest::new(a.id, b.id, amount))
                .unwrap();
        }

        let entries = accounts.list_entries(&ctx, a.id, Page::new(1, 2).unwrap()).unwrap();
        assert_eq!(entries.iter().map(|e| e.amount).collect::<Vec<_>>(), vec![-2, -3]);
        assert!(entries.iter().all(Entry::is_debit));

        let history = accounts.list_transfers(&ctx, b.id, Page::default()).unwrap();
        assert_eq!(history.len(), 5);
        assert!(matches!(
            accounts.list_transfers(&ctx, 42, Page::default()),
            Err(Error::NotFound(_))
        ));
    }
}
