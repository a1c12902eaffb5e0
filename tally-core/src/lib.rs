//! Tally Core - transactional money-transfer engine
//!
//! This crate implements the core domain logic following hexagonal architecture:
//!
//! - **domain**: Core ledger entities (Account, Entry, Transfer, errors)
//! - **ports**: Trait definitions for external dependencies (LedgerStore)
//! - **services**: Business logic orchestration (coordinator, transfers)
//! - **adapters**: Concrete implementations (DuckDB, in-memory)

pub mod adapters;
pub mod config;
pub mod domain;
pub mod migrations;
pub mod ports;
pub mod services;

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use adapters::duckdb::DuckDbStore;
use config::Config;
use ports::LedgerStore;
use services::*;

// Re-export commonly used types at crate root
pub use domain::result::{Error, OperationResult, Result};
pub use domain::{
    Account, CancellationToken, Currency, Entry, NewAccount, Page, Principal, RequestContext,
    Transfer, TransferRequest, TransferResult, TransferState,
};

/// Main context for Tally operations
///
/// This is the primary entry point for all business logic. It holds the
/// ledger store, configuration, and all services. Dropping it closes the
/// store.
pub struct LedgerContext {
    pub config: Config,
    pub coordinator: Arc<Coordinator>,
    pub account_service: AccountService,
    pub transfer_service: TransferService,
    pub status_service: StatusService,
    pub doctor_service: DoctorService,
}

impl LedgerContext {
    /// Open (or create) the DuckDB ledger in `dir` and apply migrations
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let config = Config::load(dir)?;

        let db_path = dir.join(&config.database_file);
        let store = DuckDbStore::open(&db_path)?;
        let migrations = store.ensure_schema()?;
        if !migrations.applied.is_empty() {
            info!(applied = migrations.applied.len(), "database migrated");
        }

        Ok(Self::with_store(Arc::new(store), config))
    }

    /// Build a context around an already prepared store
    pub fn with_store(store: Arc<dyn LedgerStore>, config: Config) -> Self {
        let coordinator = Arc::new(
            Coordinator::new(store, config.retry_policy())
                .with_transaction_timeout(config.transaction_timeout()),
        );

        Self {
            account_service: AccountService::new(Arc::clone(&coordinator)),
            transfer_service: TransferService::new(Arc::clone(&coordinator)),
            status_service: StatusService::new(Arc::clone(&coordinator)),
            doctor_service: DoctorService::new(Arc::clone(&coordinator)),
            coordinator,
            config,
        }
    }

    /// Replace the transfer service, e.g. to attach post-commit hooks
    pub fn with_transfer_hook(mut self, hook: TransferHook) -> Self {
        self.transfer_service = self.transfer_service.with_hook(hook);
        self
    }
}
