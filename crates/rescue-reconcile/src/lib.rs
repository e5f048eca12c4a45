//! Identifier-migration engine: groups duplicate listings left behind by an id scheme change,
//! plans their merge, and applies the plan behind environment and confirmation guards.

mod config;
mod error;
pub mod execute;
pub mod grouping;
pub mod plan;
pub mod reset;

pub use config::ReconcileConfig;
pub use error::{GuardedOperation, ReconcileError};
pub use execute::{AmbiguityPolicy, ExecuteRequest, ExecutionReport, GroupOutcome, GroupStatus, Reconciler};
pub use grouping::{group, DuplicateGroup, Grouping};
pub use plan::{plan, FavoriteAction, MigrationPlan, PlanIssue};
pub use reset::{
    check_preconditions as check_reset_preconditions, reset_all, ResetConfirmation, ResetReport,
    RESET_CONFIRMATION_PHRASE, RESET_GO_AHEAD_PHRASE,
};

pub const CRATE_NAME: &str = "rescue-reconcile";
