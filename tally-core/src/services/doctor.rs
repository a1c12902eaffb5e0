//! Doctor service - ledger consistency checks

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;

use crate::domain::result::Result;
use crate::domain::RequestContext;
use crate::services::coordinator::Coordinator;

/// Doctor service for health checks
pub struct DoctorService {
    coordinator: Arc<Coordinator>,
}

impl DoctorService {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }

    /// Run all health checks against one consistent snapshot
    pub fn run_checks(&self, ctx: &RequestContext) -> Result<DoctorResult> {
        let audit = self.coordinator.run(ctx, |uow| uow.audit())?;
        let mut checks = BTreeMap::new();

        checks.insert(
            "negative_balances".to_string(),
            if audit.negative_balances.is_empty() {
                CheckResult::pass("No account is overdrawn")
            } else {
                CheckResult::error(
                    format!("{} account(s) have a negative balance", audit.negative_balances.len()),
                    audit
                        .negative_balances
                        .iter()
                        .map(|id| json!({ "account_id": id }))
                        .collect(),
                )
            },
        );

        checks.insert(
            "entries_net_zero".to_string(),
            if audit.entry_sum == 0 {
                CheckResult::pass("Debits and credits cancel out")
            } else {
                CheckResult::error(
                    format!("Entries sum to {} instead of zero", audit.entry_sum),
                    vec![json!({ "entry_sum": audit.entry_sum })],
                )
            },
        );

        checks.insert(
            "entry_transfer_agreement".to_string(),
            if audit.drifted_accounts.is_empty() {
                CheckResult::pass("Every account's entries match its transfers")
            } else {
                CheckResult::error(
                    format!(
                        "{} account(s) have entries that disagree with their transfers",
                        audit.drifted_accounts.len()
                    ),
                    audit
                        .drifted_accounts
                        .iter()
                        .map(|d| {
                            json!({
                                "account_id": d.account_id,
                                "entry_total": d.entry_total,
                                "transfer_total": d.transfer_total
                            })
                        })
                        .collect(),
                )
            },
        );

        checks.insert(
            "invalid_transfers".to_string(),
            if audit.invalid_transfers.is_empty() {
                CheckResult::pass("All transfers are well formed")
            } else {
                CheckResult::warning(
                    format!("{} transfer(s) are malformed", audit.invalid_transfers.len()),
                    audit
                        .invalid_transfers
                        .iter()
                        .map(|id| json!({ "transfer_id": id }))
                        .collect(),
                )
            },
        );

        // Stores without enforced foreign keys can still drift
        let orphans = audit.orphaned_entries.len() + audit.orphaned_transfers.len();
        checks.insert(
            "orphaned_records".to_string(),
            if orphans == 0 {
                CheckResult::pass("No entries or transfers reference missing accounts")
            } else {
                CheckResult::error(
                    format!("{} record(s) reference missing accounts", orphans),
                    audit
                        .orphaned_entries
                        .iter()
                        .map(|id| json!({ "entry_id": id }))
                        .chain(
                            audit
                                .orphaned_transfers
                                .iter()
                                .map(|id| json!({ "transfer_id": id })),
                        )
                        .collect(),
                )
            },
        );

        let passed = checks.values().filter(|c| c.status == "pass").count() as i64;
        let warnings = checks.values().filter(|c| c.status == "warning").count() as i64;
        let errors = checks.values().filter(|c| c.status == "error").count() as i64;

        Ok(DoctorResult {
            checks,
            summary: DoctorSummary { passed, warnings, errors },
        })
    }
}

#[derive(Debug, Serialize)]
pub struct DoctorResult {
    pub checks: BTreeMap<String, CheckResult>,
    pub summary: DoctorSummary,
}

impl DoctorResult {
    pub fn is_healthy(&self) -> bool {
        self.summary.errors == 0
    }
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub status: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<serde_json::Value>>,
}

impl CheckResult {
    fn pass(message: impl Into<String>) -> Self {
        Self {
            status: "pass".to_string(),
            message: message.into(),
            details: None,
        }
    }

    fn warning(message: impl Into<String>, details: Vec<serde_json::Value>) -> Self {
        Self {
            status: "warning".to_string(),
            message: message.into(),
            details: Some(details),
        }
    }

    fn error(message: impl Into<String>, details: Vec<serde_json::Value>) -> Self {
        Self {
            status: "error".to_string(),
            message: message.into(),
            details: Some(details),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DoctorSummary {
    pub passed: i64,
    pub warnings: i64,
    pub errors: i64,
}
