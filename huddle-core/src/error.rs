//! Error kinds shared by every service in the core (§7 of the design).
//!
//! Local-recovery kinds ([`HuddleError::LockBusy`], [`HuddleError::MalformedRow`],
//! [`HuddleError::ProviderTransient`]) are handled internally and rarely escape a
//! service call. The rest are user-surfaced, non-fatal: callers render them as a
//! [`GuidedError`] triple rather than aborting.

use thiserror::Error;

/// Error taxonomy distinguished by the core (§7).
#[derive(Debug, Error)]
pub enum HuddleError {
    /// Advisory lock could not be acquired within the retry budget.
    #[error("lock busy: {0}")]
    LockBusy(String),

    /// A JSONL row failed schema validation and was skipped.
    #[error("malformed row: {0}")]
    MalformedRow(String),

    /// A row declared a schema version newer than this build understands.
    #[error("future schema version {found} (supported up to {supported})")]
    SchemaFuture { found: i64, supported: i64 },

    /// Provider call failed in a way that is worth retrying once (429/5xx/timeout).
    #[error("provider transient error: {0}")]
    ProviderTransient(String),

    /// Provider call failed in a way that is not worth retrying.
    #[error("provider error: {0}")]
    ProviderFatal(String),

    /// The in-flight request observed its cancel flag.
    #[error("request cancelled")]
    Cancelled,

    /// Tool argument or profile-policy validation failed.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Agent profile policy denied the action.
    #[error("policy denied: {0}")]
    PolicyDenied(String),

    /// A suspension point exceeded its budget.
    #[error("timeout after {0:?}")]
    Timeout(std::time::Duration),

    /// Any other I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or unreadable JSON where well-formed JSON was required.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HuddleError {
    /// `true` for kinds that are recovered locally and should not reach a user-facing surface.
    pub fn is_locally_recoverable(&self) -> bool {
        matches!(
            self,
            HuddleError::LockBusy(_) | HuddleError::MalformedRow(_) | HuddleError::ProviderTransient(_)
        )
    }
}

/// A `Problem: / Why: / Next:` triple for non-fatal, user-surfaced errors (§7).
///
/// The core never renders this itself — it builds the triple and hands it to
/// whatever UI layer is attached, keeping presentation out of scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuidedError {
    pub problem: String,
    pub why: String,
    pub next: String,
}

impl GuidedError {
    pub fn new(problem: impl Into<String>, why: impl Into<String>, next: impl Into<String>) -> Self {
        Self {
            problem: problem.into(),
            why: why.into(),
            next: next.into(),
        }
    }
}

impl std::fmt::Display for GuidedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Problem: {}\nWhy: {}\nNext: {}", self.problem, self.why, self.next)
    }
}
