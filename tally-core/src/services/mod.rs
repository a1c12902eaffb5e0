//! Service layer - business logic orchestration
//!
//! Services coordinate domain logic and port interactions. Each service
//! focuses on a specific use case; all of them run their store access
//! through the shared [`Coordinator`].

mod account;
pub mod coordinator;
mod doctor;
pub mod migration;
mod status;
mod transfer;

pub use account::AccountService;
pub use coordinator::{CommitHook, Coordinator, RetryPolicy, UnitOfWork};
pub use doctor::{CheckResult, DoctorResult, DoctorService, DoctorSummary};
pub use migration::{MigrationResult, MigrationService};
pub use status::{CurrencyTotal, StatusService, StatusSummary};
pub use transfer::{TransferHook, TransferService};
