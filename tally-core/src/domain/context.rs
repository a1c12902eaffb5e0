//! Request context: caller identity, cancellation and deadline

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::result::{Error, Result};

/// An already-authenticated username attached to a request.
/// The engine never verifies credentials, it only compares owners.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal(String);

impl Principal {
    pub fn new(username: impl Into<String>) -> Self {
        Self(username.into())
    }

    pub fn username(&self) -> &str {
        &self.0
    }
}

/// Shared flag a caller flips to abandon in-flight work
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-call context handed to every service operation
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    principal: Option<Principal>,
    cancellation: CancellationToken,
    deadline: Option<Instant>,
}

impl RequestContext {
    /// Context for trusted internal callers: no principal, no deadline
    pub fn background() -> Self {
        Self::default()
    }

    /// Context acting on behalf of an authenticated user
    pub fn for_principal(username: impl Into<String>) -> Self {
        Self {
            principal: Some(Principal::new(username)),
            ..Self::default()
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Tighten the deadline; an earlier existing deadline wins
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        });
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Fail with `Cancelled` once the caller gave up or the deadline passed
    pub fn check(&self) -> Result<()> {
        if self.cancellation.is_cancelled() {
            return Err(Error::Cancelled("cancelled by caller".to_string()));
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(Error::Cancelled("deadline exceeded".to_string()));
            }
        }
        Ok(())
    }

    /// Require that the principal, if any, owns the resource
    pub fn authorize_owner(&self, owner: &str) -> Result<()> {
        match &self.principal {
            Some(principal) if principal.username() != owner => Err(Error::unauthorized(
                "account doesn't belong to the authenticated user",
            )),
            _ => Ok(()),
        }
    }
}
