use std::sync::Arc;

use chrono::{DateTime, Utc};
use rescue_core::{Environment, OrgSnapshot, ProductionOverride, TableCounts};
use rescue_identity::OrganizationRegistry;
use rescue_storage::{AnimalStore, CountMismatch, GroupMutationOutcome, OrgLease};
use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::error::GuardedOperation;
use crate::grouping::group;
use crate::plan::{plan, MigrationPlan};
use crate::ReconcileError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AmbiguityPolicy {
    /// Refuse the whole run while any group is ambiguous.
    #[default]
    Refuse,
    /// Apply the resolvable groups and leave ambiguous ones untouched.
    ExcludeAmbiguous,
}

#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    /// Must equal the checksum of the plan being applied.
    pub confirmation: String,
    pub environment: Environment,
    pub production_override: ProductionOverride,
    pub ambiguity: AmbiguityPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    Applied,
    Failed,
    NotExecuted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupOutcome {
    pub canonical_external_id: String,
    pub removed_external_ids: Vec<String>,
    pub status: GroupStatus,
    pub counts: Option<GroupMutationOutcome>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionReport {
    pub run_id: Uuid,
    pub org_id: String,
    pub checksum: String,
    pub environment: Environment,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub before: TableCounts,
    pub after: TableCounts,
    pub expected_after: TableCounts,
    pub groups: Vec<GroupOutcome>,
    pub skipped_ambiguous: usize,
    pub verified: bool,
}

impl ExecutionReport {
    pub fn applied(&self) -> usize {
        self.groups
            .iter()
            .filter(|g| g.status == GroupStatus::Applied)
            .count()
    }
}

/// Plans and applies identifier migrations for one organization at a time.
pub struct Reconciler {
    store: Arc<dyn AnimalStore>,
    registry: Arc<OrganizationRegistry>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn AnimalStore>, registry: Arc<OrganizationRegistry>) -> Self {
        Self { store, registry }
    }

    pub fn registry(&self) -> &OrganizationRegistry {
        &self.registry
    }

    fn plan_snapshot(&self, snapshot: &OrgSnapshot) -> Result<MigrationPlan, ReconcileError> {
        let grouping = group(snapshot, &self.registry)?;
        plan(snapshot, &grouping)
    }

    /// Dry run: read one consistent snapshot and plan it. Never writes.
    pub async fn plan_organization(&self, org_id: &str) -> Result<MigrationPlan, ReconcileError> {
        if self.registry.get(org_id).is_none() {
            return Err(ReconcileError::UnknownOrganization(org_id.to_string()));
        }
        let snapshot = self.store.snapshot_organization(org_id).await?;
        let plan = self.plan_snapshot(&snapshot)?;
        info!(
            org_id,
            groups = plan.groups_total,
            resolvable = plan.resolvable,
            ambiguous = plan.ambiguous,
            unknown = plan.unknown_ids.len(),
            checksum = %plan.checksum,
            "planned identifier migration"
        );
        Ok(plan)
    }

    fn check_guards(plan: &MigrationPlan, request: &ExecuteRequest) -> Result<(), ReconcileError> {
        if plan.ambiguous > 0 && request.ambiguity != AmbiguityPolicy::ExcludeAmbiguous {
            return Err(ReconcileError::IdentityAmbiguous {
                org_id: plan.org_id.clone(),
                groups: plan.ambiguous,
            });
        }
        if !request.production_override.permits(request.environment) {
            return Err(ReconcileError::ProductionGuard {
                operation: GuardedOperation::Reconcile,
                environment: request.environment,
            });
        }
        let sealed = plan.compute_checksum()?;
        if request.confirmation != plan.checksum || sealed != plan.checksum {
            return Err(ReconcileError::StalePlan {
                supplied: request.confirmation.clone(),
                current: sealed,
            });
        }
        Ok(())
    }

    /// Apply a confirmed plan. Every guard is checked before the first write, and the plan is
    /// re-derived under the organization lock so a store that moved on since the dry run is
    /// refused.
    pub async fn execute(
        &self,
        plan: &MigrationPlan,
        request: &ExecuteRequest,
    ) -> Result<ExecutionReport, ReconcileError> {
        Self::check_guards(plan, request)?;

        let span = info_span!("reconcile_execute", org_id = %plan.org_id, checksum = %plan.checksum);
        self.execute_under_lock(plan, request).instrument(span).await
    }

    async fn execute_under_lock(
        &self,
        plan: &MigrationPlan,
        request: &ExecuteRequest,
    ) -> Result<ExecutionReport, ReconcileError> {
        let lease = self.store.try_lock_organization(&plan.org_id).await?;
        let result = self.execute_locked(plan, request).await;
        self.release(lease).await;
        result
    }

    async fn release(&self, lease: OrgLease) {
        let org_id = lease.org_id.clone();
        if let Err(err) = self.store.release_organization(lease).await {
            warn!(%org_id, error = %err, "releasing organization lock");
        }
    }

    async fn execute_locked(
        &self,
        plan: &MigrationPlan,
        request: &ExecuteRequest,
    ) -> Result<ExecutionReport, ReconcileError> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        let snapshot = self.store.snapshot_organization(&plan.org_id).await?;
        let fresh = self.plan_snapshot(&snapshot)?;
        if fresh.checksum != request.confirmation {
            warn!(supplied = %request.confirmation, current = %fresh.checksum, "store changed since planning");
            return Err(ReconcileError::StalePlan {
                supplied: request.confirmation.clone(),
                current: fresh.checksum,
            });
        }

        let before = self.store.counts(Some(&fresh.org_id)).await?;
        let planned = fresh.per_group.len();
        let mut groups: Vec<GroupOutcome> = fresh
            .per_group
            .iter()
            .map(|g| GroupOutcome {
                canonical_external_id: g.canonical.external_id.clone(),
                removed_external_ids: g.removed_external_ids(),
                status: GroupStatus::NotExecuted,
                counts: None,
            })
            .collect();

        for (index, planned_group) in fresh.per_group.iter().enumerate() {
            let mutation = planned_group.to_mutation(&fresh.org_id);
            match self.store.apply_group(&mutation).await {
                Ok(outcome) => {
                    info!(
                        canonical = %mutation.canonical_external_id,
                        removed = %outcome.removed,
                        "group applied"
                    );
                    groups[index].status = GroupStatus::Applied;
                    groups[index].counts = Some(outcome);
                }
                Err(err) => {
                    groups[index].status = GroupStatus::Failed;
                    error!(
                        canonical = %mutation.canonical_external_id,
                        applied = index,
                        planned,
                        error = %err,
                        "group failed, halting"
                    );
                    return Err(ReconcileError::Halted {
                        applied: index,
                        planned,
                        cause: Box::new(err.into()),
                    });
                }
            }
        }

        let after = self.store.counts(Some(&fresh.org_id)).await?;
        let expected_after = fresh.expected_after();
        if after != expected_after {
            error!(%before, %after, expected = %expected_after, "post-commit verification failed");
            return Err(ReconcileError::VerificationFailed {
                committed: true,
                mismatch: CountMismatch {
                    org_id: fresh.org_id.clone(),
                    before,
                    removed: fresh.total_removed(),
                    expected: expected_after,
                    actual: after,
                },
            });
        }

        let report = ExecutionReport {
            run_id,
            org_id: fresh.org_id.clone(),
            checksum: fresh.checksum.clone(),
            environment: request.environment,
            started_at,
            finished_at: Utc::now(),
            before,
            after,
            expected_after,
            groups,
            skipped_ambiguous: fresh.ambiguous,
            verified: true,
        };
        info!(%run_id, applied = report.applied(), %after, "reconciliation verified");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grouping::tests::{pit_snapshot, registry};
    use rescue_storage::MemoryStore;

    fn request(confirmation: &str, environment: Environment) -> ExecuteRequest {
        ExecuteRequest {
            confirmation: confirmation.to_string(),
            environment,
            production_override: ProductionOverride::Denied,
            ambiguity: AmbiguityPolicy::Refuse,
        }
    }

    async fn reconciler() -> (Arc<MemoryStore>, Reconciler) {
        let store = Arc::new(MemoryStore::new());
        store.seed(pit_snapshot()).await;
        let reconciler = Reconciler::new(store.clone(), Arc::new(registry()));
        (store, reconciler)
    }

    #[tokio::test]
    async fn production_is_refused_without_override() {
        let (store, reconciler) = reconciler().await;
        let plan = reconciler.plan_organization("pit").await.expect("plan");
        let err = reconciler
            .execute(&plan, &request(&plan.checksum, Environment::Production))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::ProductionGuard { .. }));
        assert_eq!(store.counts(Some("pit")).await.expect("counts"), plan.baseline);
    }

    #[tokio::test]
    async fn wrong_confirmation_is_a_stale_plan() {
        let (store, reconciler) = reconciler().await;
        let plan = reconciler.plan_organization("pit").await.expect("plan");
        let err = reconciler
            .execute(&plan, &request("deadbeef", Environment::Staging))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::StalePlan { .. }));
        assert_eq!(store.counts(Some("pit")).await.expect("counts"), plan.baseline);
    }

    #[tokio::test]
    async fn tampered_plan_does_not_pass_its_own_checksum() {
        let (_store, reconciler) = reconciler().await;
        let mut plan = reconciler.plan_organization("pit").await.expect("plan");
        plan.per_group[0].removals.clear();
        let err = reconciler
            .execute(&plan, &request(&plan.checksum.clone(), Environment::Staging))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::StalePlan { .. }));
    }

    #[tokio::test]
    async fn locked_organization_is_refused() {
        let (store, reconciler) = reconciler().await;
        let plan = reconciler.plan_organization("pit").await.expect("plan");
        let _held = store.try_lock_organization("pit").await.expect("lock");
        let err = reconciler
            .execute(&plan, &request(&plan.checksum, Environment::Test))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::OrganizationLocked(_)));
    }

    #[tokio::test]
    async fn applied_run_releases_the_lock() {
        let (store, reconciler) = reconciler().await;
        let plan = reconciler.plan_organization("pit").await.expect("plan");
        let report = reconciler
            .execute(&plan, &request(&plan.checksum, Environment::Development))
            .await
            .expect("execute");
        assert!(report.verified);
        assert_eq!(report.applied(), 1);
        let lease = store.try_lock_organization("pit").await.expect("lock is free again");
        store.release_organization(lease).await.expect("release");
    }
}
