use chrono::{DateTime, Utc};
use rescue_core::{Environment, ProductionOverride, TableCounts};
use rescue_storage::{AnimalStore, CountMismatch};
use serde::Serialize;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::error::GuardedOperation;
use crate::ReconcileError;

pub const RESET_CONFIRMATION_PHRASE: &str = "DELETE ALL";
pub const RESET_GO_AHEAD_PHRASE: &str = "yes";

/// Typed answers collected from the operator before a bulk reset.
#[derive(Debug, Clone, Default)]
pub struct ResetConfirmation {
    pub typed_confirmation: String,
    pub typed_go_ahead: String,
    pub production_override: ProductionOverride,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResetReport {
    pub run_id: Uuid,
    pub environment: Environment,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub before: TableCounts,
    pub deleted: TableCounts,
    pub after: TableCounts,
    pub favorites_retained: u64,
}

/// Pure string and environment checks; runs before anything touches the store.
pub fn check_preconditions(environment: Environment, confirmation: &ResetConfirmation) -> Result<(), ReconcileError> {
    if !confirmation.production_override.permits(environment) {
        return Err(ReconcileError::ProductionGuard {
            operation: GuardedOperation::ResetAll,
            environment,
        });
    }
    if confirmation.typed_confirmation != RESET_CONFIRMATION_PHRASE {
        return Err(ReconcileError::ConfirmationMismatch { field: "confirmation" });
    }
    if confirmation.typed_go_ahead != RESET_GO_AHEAD_PHRASE {
        return Err(ReconcileError::ConfirmationMismatch { field: "go-ahead" });
    }
    Ok(())
}

/// Delete every animal, image, and scrape log in the store. Favorites stay. Not retried.
pub async fn reset_all(
    store: &dyn AnimalStore,
    environment: Environment,
    confirmation: &ResetConfirmation,
) -> Result<ResetReport, ReconcileError> {
    check_preconditions(environment, confirmation)?;

    let span = info_span!("reset_all", %environment);
    wipe(store, environment).instrument(span).await
}

async fn wipe(store: &dyn AnimalStore, environment: Environment) -> Result<ResetReport, ReconcileError> {
    let started_at = Utc::now();
    let run_id = Uuid::new_v4();

    let before = store.counts(None).await?;
    let deleted = store.delete_all_listings().await?;
    let after = store.counts(None).await?;

    if !after.owned_rows_are_empty() {
        error!(%before, %after, "rows remain after reset");
        return Err(ReconcileError::VerificationFailed {
            committed: true,
            mismatch: CountMismatch {
                org_id: "*".to_string(),
                before,
                removed: deleted,
                expected: TableCounts {
                    favorites: before.favorites,
                    ..TableCounts::default()
                },
                actual: after,
            },
        });
    }

    info!(%run_id, %deleted, favorites_retained = after.favorites, "store reset");
    Ok(ResetReport {
        run_id,
        environment,
        started_at,
        finished_at: Utc::now(),
        before,
        deleted,
        after,
        favorites_retained: after.favorites,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn confirmation(phrase: &str, go_ahead: &str) -> ResetConfirmation {
        ResetConfirmation {
            typed_confirmation: phrase.to_string(),
            typed_go_ahead: go_ahead.to_string(),
            production_override: ProductionOverride::Denied,
        }
    }

    #[test]
    fn phrases_are_case_sensitive() {
        let check = |c: &ResetConfirmation| check_preconditions(Environment::Development, c);
        assert!(check(&confirmation("DELETE ALL", "yes")).is_ok());
        assert!(matches!(
            check(&confirmation("delete all", "yes")),
            Err(ReconcileError::ConfirmationMismatch { field: "confirmation" })
        ));
        assert!(matches!(
            check(&confirmation("DELETE ALL", "YES")),
            Err(ReconcileError::ConfirmationMismatch { field: "go-ahead" })
        ));
        assert!(check(&confirmation("DELETE ALL ", "yes")).is_err());
    }

    #[test]
    fn production_guard_comes_before_phrase_checks() {
        let err = check_preconditions(Environment::Production, &confirmation("nope", "nope")).unwrap_err();
        assert_eq!(err.exit_code(), 4);

        let mut granted = confirmation("DELETE ALL", "yes");
        granted.production_override = ProductionOverride::Granted;
        assert!(check_preconditions(Environment::Production, &granted).is_ok());
    }
}
