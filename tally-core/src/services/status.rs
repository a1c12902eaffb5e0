//! Status service - ledger-wide counts and balance totals

use std::sync::Arc;

use serde::Serialize;

use crate::domain::result::Result;
use crate::domain::{Currency, RequestContext};
use crate::services::coordinator::Coordinator;

/// Status service for ledger summaries
pub struct StatusService {
    coordinator: Arc<Coordinator>,
}

impl StatusService {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }

    /// Get overall status summary
    pub fn get_status(&self, ctx: &RequestContext) -> Result<StatusSummary> {
        let totals = self.coordinator.run(ctx, |uow| uow.ledger_totals())?;

        Ok(StatusSummary {
            store: self.coordinator.store().name().to_string(),
            total_accounts: totals.accounts,
            total_entries: totals.entries,
            total_transfers: totals.transfers,
            balances: totals
                .balances
                .into_iter()
                .map(|(currency, total)| CurrencyTotal { currency, total })
                .collect(),
        })
    }
}

#[derive(Debug, Serialize)]
pub struct StatusSummary {
    pub store: String,
    pub total_accounts: i64,
    pub total_entries: i64,
    pub total_transfers: i64,
    pub balances: Vec<CurrencyTotal>,
}

#[derive(Debug, Serialize)]
pub struct CurrencyTotal {
    pub currency: Currency,
    pub total: i128,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::MemoryStore;
    use crate::services::coordinator::RetryPolicy;

    #[test]
    fn test_status_groups_balances_by_currency() {
        let coordinator = Arc::new(Coordinator::new(
            Arc::new(MemoryStore::new()),
            RetryPolicy::no_retry(),
        ));
        let ctx = RequestContext::background();
        coordinator
            .run(&ctx, |uow| {
                uow.create_account("alice", Currency::Usd, 10)?;
                uow.create_account("bob", Currency::Usd, 5)?;
                uow.create_account("bob", Currency::Eur, 7)
            })
            .unwrap();

        let status = StatusService::new(coordinator).get_status(&ctx).unwrap();
        assert_eq!(status.store, "memory");
        assert_eq!(status.total_accounts, 3);
        assert_eq!(status.total_entries, 0);
        let totals: Vec<(Currency, i128)> = status
            .balances
            .iter()
            .map(|b| (b.currency, b.total))
            .collect();
        assert_eq!(totals, vec![(Currency::Eur, 7), (Currency::Usd, 15)]);
    }

    #[test]
    fn test_totals_beyond_i64_range() {
        let coordinator = Arc::new(Coordinator::new(
            Arc::new(MemoryStore::new()),
            RetryPolicy::no_retry(),
        ));
        let ctx = RequestContext::background();
        let large = i64::MAX / 2 + 1;
        coordinator
            .run(&ctx, |uow| {
                uow.create_account("alice", Currency::Usd, large)?;
                uow.create_account("bob", Currency::Usd, large)
            })
            .unwrap();

        let status = StatusService::new(coordinator).get_status(&ctx).unwrap();
        assert_eq!(status.balances.len(), 1);
        assert_eq!(status.balances[0].total, 2 * large as i128);
        assert!(status.balances[0].total > i64::MAX as i128);
    }
}
