//! Account domain model

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::result::{Error, Result};

/// Owner names follow the username rule of the authentication layer
const OWNER_PATTERN: &str = r"^[a-z0-9_]+$";
const OWNER_MIN_LEN: usize = 3;
const OWNER_MAX_LEN: usize = 100;

/// Currencies the ledger accepts. There is no conversion between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Usd,
    Eur,
    Cad,
}

impl Currency {
    pub const ALL: [Currency; 3] = [Currency::Usd, Currency::Eur, Currency::Cad];

    /// ISO 4217 code
    pub fn code(&self) -> &'static str {
        match self {
            Currency::Usd => "USD",
            Currency::Eur => "EUR",
            Currency::Cad => "CAD",
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Currency {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "USD" => Ok(Currency::Usd),
            "EUR" => Ok(Currency::Eur),
            "CAD" => Ok(Currency::Cad),
            other => Err(Error::validation(format!("unsupported currency: {:?}", other))),
        }
    }
}

/// A balance-holding account.
///
/// `balance` is in minor currency units (cents for USD) and never goes
/// negative outside an in-flight transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub owner: String,
    pub balance: i64,
    pub currency: Currency,
    pub created_at: DateTime<Utc>,
}

/// Input for opening a new account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAccount {
    pub owner: String,
    pub currency: Currency,
    pub initial_balance: i64,
}

impl NewAccount {
    pub fn new(owner: impl Into<String>, currency: Currency, initial_balance: i64) -> Self {
        Self {
            owner: owner.into(),
            currency,
            initial_balance,
        }
    }

    /// Validate account data
    pub fn validate(&self) -> Result<()> {
        validate_owner(&self.owner)?;
        if self.initial_balance < 0 {
            return Err(Error::validation("initial balance cannot be negative"));
        }
        Ok(())
    }
}

fn owner_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(OWNER_PATTERN).expect("owner pattern is a valid regex"))
}

/// Check an owner (username) against the naming rule
pub fn validate_owner(owner: &str) -> Result<()> {
    let len = owner.chars().count();
    if !(OWNER_MIN_LEN..=OWNER_MAX_LEN).contains(&len) {
        return Err(Error::validation(format!(
            "owner must contain from {} to {} characters",
            OWNER_MIN_LEN, OWNER_MAX_LEN
        )));
    }
    if !owner_regex().is_match(owner) {
        return Err(Error::validation(
            "owner must contain only lowercase letters, digits or underscore",
        ));
    }
    Ok(())
}

/// Offset/limit window for list operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub offset: u32,
    pub limit: u32,
}

impl Page {
    pub const MAX_LIMIT: u32 = 100;

    pub fn new(offset: u32, limit: u32) -> Result<Self> {
        if limit == 0 || limit > Self::MAX_LIMIT {
            return Err(Error::validation(format!(
                "page limit must be between 1 and {}",
                Self::MAX_LIMIT
            )));
        }
        Ok(Self { offset, limit })
    }
}

impl Default for Page {
    fn default() -> Self {
        Self { offset: 0, limit: 20 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_currency_parsing() {
        assert_eq!("usd".parse::<Currency>().unwrap(), Currency::Usd);
        assert_eq!(" Eur ".parse::<Currency>().unwrap(), Currency::Eur);
        assert!(matches!("GBP".parse::<Currency>(), Err(Error::Validation(_))));
        assert_eq!(Currency::Cad.to_string(), "CAD");
    }

    #[test]
    fn test_currency_serializes_as_code() {
        assert_eq!(serde_json::to_string(&Currency::Usd).unwrap(), "\"USD\"");
        let parsed: Currency = serde_json::from_str("\"CAD\"").unwrap();
        assert_eq!(parsed, Currency::Cad);
    }

    #[test]
    fn test_owner_validation() {
        assert!(validate_owner("alice_01").is_ok());
        assert!(validate_owner("al").is_err());
        assert!(validate_owner("Alice").is_err());
        assert!(validate_owner("bob smith").is_err());
        assert!(validate_owner(&"a".repeat(101)).is_err());
    }

    #[test]
    fn test_new_account_rejects_negative_opening_balance() {
        let account = NewAccount::new("alice", Currency::Usd, -1);
        assert!(matches!(account.validate(), Err(Error::Validation(_))));
        assert!(NewAccount::new("alice", Currency::Usd, 0).validate().is_ok());
    }

    #[test]
    fn test_page_bounds() {
        assert!(Page::new(0, 0).is_err());
        assert!(Page::new(0, 101).is_err());
        assert_eq!(Page::new(40, 20).unwrap(), Page { offset: 40, limit: 20 });
    }
}
