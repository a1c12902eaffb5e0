//! Ledger entry domain model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One account's balance delta from one transfer.
/// Append-only: entries are never updated or deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub id: i64,
    pub account_id: i64,
    /// Signed delta in minor units (negative for the debit side)
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

impl Entry {
    pub fn is_debit(&self) -> bool {
        self.amount < 0
    }
}
