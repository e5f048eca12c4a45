use rescue_core::Environment;
use rescue_storage::{CountMismatch, StoreError};
use serde::Serialize;
use thiserror::Error;

/// Destructive entry points that are refused against production without an override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum GuardedOperation {
    Reconcile,
    ResetAll,
}

impl std::fmt::Display for GuardedOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            GuardedOperation::Reconcile => "reconcile",
            GuardedOperation::ResetAll => "reset-all",
        })
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("organization {org_id} has {groups} ambiguous group(s); exclude them explicitly or fix the data first")]
    IdentityAmbiguous { org_id: String, groups: usize },
    #[error("plan {supplied} is stale; the store now plans to {current}")]
    StalePlan { supplied: String, current: String },
    #[error("refusing {operation} against {environment} without a production override")]
    ProductionGuard {
        operation: GuardedOperation,
        environment: Environment,
    },
    #[error("verification failed (committed: {committed}): {mismatch}")]
    VerificationFailed { committed: bool, mismatch: CountMismatch },
    #[error("{field} does not match the required phrase")]
    ConfirmationMismatch { field: &'static str },
    #[error("organization {0} is locked by another reconciliation")]
    OrganizationLocked(String),
    #[error("organization {0} is not in the organization table")]
    UnknownOrganization(String),
    #[error("snapshot of {expected} contains records of {found:?}")]
    MixedOrganizations { expected: String, found: Vec<String> },
    #[error("halted after {applied} of {planned} group(s): {cause}")]
    Halted {
        applied: usize,
        planned: usize,
        #[source]
        cause: Box<ReconcileError>,
    },
    #[error("encoding plan: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ReconcileError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::OrganizationLocked { org_id } => ReconcileError::OrganizationLocked(org_id),
            StoreError::Verification(mismatch) => ReconcileError::VerificationFailed {
                committed: false,
                mismatch,
            },
            other => ReconcileError::Store(other),
        }
    }
}

impl ReconcileError {
    /// Process exit status for the maintenance CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            ReconcileError::Store(err) if err.is_unreachable() => 2,
            ReconcileError::VerificationFailed { .. } => 3,
            ReconcileError::ProductionGuard {
                operation: GuardedOperation::ResetAll,
                ..
            } => 4,
            ReconcileError::Halted { cause, .. } => match cause.exit_code() {
                code @ (2 | 3) => code,
                _ => 1,
            },
            _ => 1,
        }
    }

    /// True when the store may have been changed before the error surfaced.
    pub fn may_have_mutated(&self) -> bool {
        match self {
            ReconcileError::VerificationFailed { committed, .. } => *committed,
            ReconcileError::Halted { applied, .. } => *applied > 0,
            _ => false,
        }
    }
}
