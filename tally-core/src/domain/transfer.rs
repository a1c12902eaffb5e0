//! Transfer domain model

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::result::{Error, Result};
use super::{Account, Entry};

/// A completed movement of funds between two accounts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: i64,
    pub from_account_id: i64,
    pub to_account_id: i64,
    /// Always positive, in minor units
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

/// A request to move `amount` from one account to another
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub from_account_id: i64,
    pub to_account_id: i64,
    pub amount: i64,
}

impl TransferRequest {
    pub fn new(from_account_id: i64, to_account_id: i64, amount: i64) -> Self {
        Self {
            from_account_id,
            to_account_id,
            amount,
        }
    }

    /// Input checks that never need the store
    pub fn validate(&self) -> Result<()> {
        if self.amount <= 0 {
            return Err(Error::validation("transfer amount must be positive"));
        }
        if self.from_account_id == self.to_account_id {
            return Err(Error::validation(
                "cannot transfer between the same account",
            ));
        }
        Ok(())
    }
}

/// Everything a committed transfer produced, returned once to the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferResult {
    pub transfer: Transfer,
    pub from_account: Account,
    pub to_account: Account,
    pub from_entry: Entry,
    pub to_entry: Entry,
}

/// Lifecycle of one transfer attempt.
///
/// `Committed` and `Aborted` are terminal. Only `Validated`, `Locked` and
/// `BalanceChecked` may move to `Aborted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Validated,
    Locked,
    BalanceChecked,
    Applied,
    Committed,
    Aborted,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferState::Committed | TransferState::Aborted)
    }

    /// Whether `next` is a legal successor of this state
    pub fn can_advance_to(&self, next: TransferState) -> bool {
        use TransferState::*;
        matches!(
            (self, next),
            (Validated, Locked)
                | (Locked, BalanceChecked)
                | (BalanceChecked, Applied)
                | (Applied, Committed)
                | (Validated | Locked | BalanceChecked, Aborted)
        )
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransferState::Validated => "validated",
            TransferState::Locked => "locked",
            TransferState::BalanceChecked => "balance_checked",
            TransferState::Applied => "applied",
            TransferState::Committed => "committed",
            TransferState::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_validation() {
        assert!(TransferRequest::new(1, 2, 10).validate().is_ok());
        assert!(matches!(
            TransferRequest::new(1, 2, 0).validate(),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            TransferRequest::new(1, 2, -5).validate(),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            TransferRequest::new(3, 3, 10).validate(),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_state_transitions() {
        use TransferState::*;
        assert!(Validated.can_advance_to(Locked));
        assert!(Applied.can_advance_to(Committed));
        assert!(BalanceChecked.can_advance_to(Aborted));
        assert!(!Applied.can_advance_to(Aborted));
        assert!(!Validated.can_advance_to(Committed));
        assert!(Committed.is_terminal());
        assert!(!Locked.is_terminal());
    }
}
