//! Error types for foundry operations
//!
//! Every leaf call returns a typed error carrying a category. The category is
//! the contract: it decides whether a failure is retried, surfaced on the
//! cluster status, or turned into a CLI exit code. Orchestration layers wrap
//! errors with phase context but never downgrade the category.

use thiserror::Error;

/// Main error type for foundry operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error (treated as transient)
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Cluster spec fails an invariant; requires a spec edit, never retried
    #[error("validation error: {0}")]
    Validation(String),

    /// Transient infrastructure hiccup; retried with bounded backoff
    #[error("transient error: {0}")]
    Transient(String),

    /// Operation disallowed by policy (e.g. scale and upgrade in one step)
    #[error("policy violation: {0}")]
    Policy(String),

    /// External collaborator failed (CAPI move, etcd never ready)
    #[error("external error: {0}")]
    External(String),

    /// Operation cancelled; propagated unchanged, no rollback
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Fatal infrastructure condition (hardware shortage, BMC failure)
    #[error("infrastructure error: {0}")]
    Infrastructure(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Filesystem error while writing cluster artifacts
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Handling category for an [`Error`]
///
/// Collapses the error variants into the classes the controller and CLI act
/// on. Wrapping an error with context must preserve its category.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// User must edit the spec; do not requeue
    Validation,
    /// Retry with backoff; surface only when the bound is exceeded
    Transient,
    /// Fatal within this reconcile; surfaced on status
    Policy,
    /// Fatal within this reconcile; retried at the next reconcile tick
    External,
    /// Propagated unchanged
    Cancelled,
    /// Fatal; surfaced on status with the reported message
    Infrastructure,
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a transient error with the given message
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Create a policy-violation error with the given message
    pub fn policy(msg: impl Into<String>) -> Self {
        Self::Policy(msg.into())
    }

    /// Create an external-collaborator error with the given message
    pub fn external(msg: impl Into<String>) -> Self {
        Self::External(msg.into())
    }

    /// Create a cancellation error with the given message
    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    /// Create a fatal infrastructure error with the given message
    pub fn infrastructure(msg: impl Into<String>) -> Self {
        Self::Infrastructure(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// The handling category for this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Kube(_) | Self::Transient(_) | Self::Io(_) => ErrorCategory::Transient,
            Self::Validation(_) | Self::Serialization(_) => ErrorCategory::Validation,
            Self::Policy(_) => ErrorCategory::Policy,
            Self::External(_) => ErrorCategory::External,
            Self::Cancelled(_) => ErrorCategory::Cancelled,
            Self::Infrastructure(_) => ErrorCategory::Infrastructure,
        }
    }

    /// Whether this error may succeed on retry within the same reconcile
    pub fn is_transient(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }

    /// Wrap this error with phase context, preserving the category
    ///
    /// The orchestrator uses this to prefix the phase name so that
    /// `FailureMessage` identifies where a multi-step operation died.
    pub fn with_phase(self, phase: &str) -> Self {
        match self {
            Self::Kube(e) => Self::Transient(format!("{phase}: {e}")),
            Self::Validation(m) => Self::Validation(format!("{phase}: {m}")),
            Self::Transient(m) => Self::Transient(format!("{phase}: {m}")),
            Self::Policy(m) => Self::Policy(format!("{phase}: {m}")),
            Self::External(m) => Self::External(format!("{phase}: {m}")),
            Self::Cancelled(m) => Self::Cancelled(format!("{phase}: {m}")),
            Self::Infrastructure(m) => Self::Infrastructure(format!("{phase}: {m}")),
            Self::Serialization(m) => Self::Serialization(format!("{phase}: {m}")),
            Self::Io(e) => Self::Transient(format!("{phase}: {e}")),
        }
    }

    /// Process exit code for the CLI surface
    ///
    /// 0 success, 1 validation failure, 2 transient/infra failure,
    /// 3 policy violation.
    pub fn exit_code(&self) -> i32 {
        match self.category() {
            ErrorCategory::Validation => 1,
            ErrorCategory::Policy => 3,
            ErrorCategory::Transient
            | ErrorCategory::External
            | ErrorCategory::Cancelled
            | ErrorCategory::Infrastructure => 2,
        }
    }
}
