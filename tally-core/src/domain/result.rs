//! Result and error types for the core library

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::Currency;

/// Core library error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Insufficient funds in account {account_id}: balance {balance}, requested {requested}")]
    InsufficientFunds {
        account_id: i64,
        balance: i64,
        requested: i64,
    },

    #[error("Currency mismatch: cannot move {from} into a {to} account")]
    CurrencyMismatch { from: Currency, to: Currency },

    #[error("Account already exists for owner {owner} in {currency}")]
    DuplicateAccount { owner: String, currency: Currency },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Serialization or write-write conflict reported by the store.
    /// Safe to retry from a fresh transaction.
    #[error("Transient store error: {0}")]
    TransientStore(String),

    /// Rollback failed after the unit of work failed. Never retried.
    #[error("Transaction aborted: {cause}; rollback failed: {rollback}")]
    TransactionAbort {
        cause: Box<Error>,
        rollback: Box<Error>,
    },

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a database error
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an unauthorized error
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether the coordinator may retry the whole unit of work
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientStore(_))
    }

    /// Short machine-readable kind, used in JSON output and logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::InsufficientFunds { .. } => "insufficient_funds",
            Self::CurrencyMismatch { .. } => "currency_mismatch",
            Self::DuplicateAccount { .. } => "duplicate_account",
            Self::Unauthorized(_) => "unauthorized",
            Self::TransientStore(_) => "transient_store",
            Self::TransactionAbort { .. } => "transaction_abort",
            Self::Cancelled(_) => "cancelled",
            Self::Database(_) => "database",
            Self::Config(_) => "config",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
        }
    }
}

/// Core library result type
pub type Result<T> = std::result::Result<T, Error>;

/// Operation result with optional context (for JSON output)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResult<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub context: Option<HashMap<String, serde_json::Value>>,
}

impl<T> OperationResult<T> {
    /// Create a successful result
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            context: None,
        }
    }

    /// Create a failed result
    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            context: None,
        }
    }

    /// Create a failed result with context
    pub fn fail_with_context(
        error: impl Into<String>,
        context: HashMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            context: Some(context),
        }
    }
}

impl<T> From<Result<T>> for OperationResult<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => {
                let mut context = HashMap::new();
                context.insert("kind".to_string(), serde_json::Value::from(e.kind()));
                Self::fail_with_context(e.to_string(), context)
            }
        }
    }
}
