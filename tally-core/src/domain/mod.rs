//! Core domain entities
//!
//! All ledger entities are defined here. These are pure data structures
//! with validation logic - no I/O or external dependencies.

mod account;
mod context;
mod entry;
pub mod result;
mod transfer;

pub use account::{validate_owner, Account, Currency, NewAccount, Page};
pub use context::{CancellationToken, Principal, RequestContext};
pub use entry::Entry;
pub use transfer::{Transfer, TransferRequest, TransferResult, TransferState};
