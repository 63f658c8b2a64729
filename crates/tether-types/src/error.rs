use thiserror::Error;

use crate::run::Zone;

/// Stable error codes surfaced on terminal run errors and step results.
pub mod codes {
    pub const POLICY_DENIED: &str = "POLICY_DENIED";
    pub const APPROVAL_REQUIRED: &str = "APPROVAL_REQUIRED";
    pub const ZONE_MISMATCH: &str = "ZONE_MISMATCH";
    pub const STEP_TIMEOUT: &str = "STEP_TIMEOUT";
    pub const POLLING_TIMEOUT: &str = "POLLING_TIMEOUT";
    pub const POLLING_CANCELLED: &str = "POLLING_CANCELLED";
    pub const RUN_CANCELLED: &str = "RUN_CANCELLED";
    pub const COST_LIMIT: &str = "COST_LIMIT";
    pub const TOKEN_LIMIT: &str = "TOKEN_LIMIT";
    pub const TOOL_CALL_LIMIT: &str = "TOOL_CALL_LIMIT";
    pub const GATE_FAILED: &str = "GATE_FAILED";
    pub const COMPLIANCE_DENIED: &str = "COMPLIANCE_DENIED";
    pub const HANDLER_MISSING: &str = "HANDLER_MISSING";
    pub const STEP_FAILED: &str = "STEP_FAILED";
    pub const NO_ROUTE: &str = "NO_ROUTE";
    pub const REPLAY_DETECTED: &str = "REPLAY_DETECTED";
    pub const FINGERPRINT_MISMATCH: &str = "FINGERPRINT_MISMATCH";
    pub const STORAGE_ERROR: &str = "STORAGE_ERROR";
    pub const INTEGRITY_ERROR: &str = "INTEGRITY_ERROR";
}

/// The error kinds the core surfaces distinctly. Anything crossing a public
/// API boundary is one of these; internal helpers may use richer types.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("policy denied: {0}")]
    PolicyDenied(String),

    #[error("approval required for `{operation}` on `{resource}` ({zone} zone)")]
    ApprovalRequired {
        operation: String,
        resource: String,
        zone: Zone,
    },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("lock: {0}")]
    Lock(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("resource limit: {0}")]
    ResourceLimit(String),

    #[error("gate failed: {0}")]
    GateFailed(String),

    #[error("verification failed: {0}")]
    VerificationFailed(String),

    #[error("storage: {0}")]
    Storage(String),

    #[error("integrity: {0}")]
    Integrity(String),
}

impl CoreError {
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "VALIDATION_ERROR",
            CoreError::PolicyDenied(_) => codes::POLICY_DENIED,
            CoreError::ApprovalRequired { .. } => codes::APPROVAL_REQUIRED,
            CoreError::Conflict(_) => "CONFLICT",
            CoreError::Lock(_) => "LOCK_ERROR",
            CoreError::Timeout(_) => codes::STEP_TIMEOUT,
            CoreError::Cancelled(_) => codes::RUN_CANCELLED,
            CoreError::ResourceLimit(_) => "RESOURCE_LIMIT",
            CoreError::GateFailed(_) => codes::GATE_FAILED,
            CoreError::VerificationFailed(_) => "VERIFICATION_FAILED",
            CoreError::Storage(_) => codes::STORAGE_ERROR,
            CoreError::Integrity(_) => codes::INTEGRITY_ERROR,
        }
    }

    /// Whether the orchestrator may retry the failed operation locally.
    /// Everything else surfaces to the run.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Storage(_) | CoreError::Timeout(_))
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
