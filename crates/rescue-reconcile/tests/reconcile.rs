mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rescue_core::{AnimalDraft, Environment, OrgSnapshot, TableCounts};
use rescue_identity::IdentifyingFields;
use rescue_reconcile::{AmbiguityPolicy, GroupStatus, ReconcileError, Reconciler};
use rescue_storage::{
    AnimalStore, CountMismatch, GroupMutation, GroupMutationOutcome, MemoryStore, OrgLease, StoreError,
    UpsertOutcome,
};

use common::{add_animal, pit_store, registry, request};

#[tokio::test]
async fn pit_cody_is_merged_into_its_current_id() {
    let store = pit_store().await;
    let reconciler = Reconciler::new(store.clone(), registry());
    let other_org_before = store.counts(Some("tierschutz-europa")).await.expect("counts");

    let plan = reconciler.plan_organization("pit").await.expect("plan");
    assert_eq!(plan.groups_total, 1);
    assert_eq!(plan.resolvable, 1);
    assert_eq!(plan.per_group[0].canonical.external_id, "pit-cody-95bc94");
    assert_eq!(plan.per_group[0].removed_external_ids(), ["pit-cody"]);

    let report = reconciler
        .execute(&plan, &request(&plan, Environment::Development))
        .await
        .expect("execute");
    assert!(report.verified);
    assert_eq!(report.groups[0].status, GroupStatus::Applied);
    assert_eq!(report.after.animals, report.before.animals - 1);

    let after = store.snapshot_organization("pit").await.expect("snapshot");
    let ids: Vec<&str> = after.records.iter().map(|r| r.external_id.as_str()).collect();
    assert_eq!(ids, ["pit-cody-95bc94", "pit-bella"]);
    assert!(after.images.iter().all(|i| i.external_id == "pit-cody-95bc94"));
    assert_eq!(after.images.len(), 1);
    assert_eq!(after.scrape_logs.len(), 1);

    // ana's bookmark follows Cody; ben's duplicate collapses onto the one he already had.
    let mut owners: Vec<(&str, &str)> = after
        .favorites
        .iter()
        .map(|f| (f.user_ref.as_str(), f.external_id.as_str()))
        .collect();
    owners.sort();
    assert_eq!(owners, [("ana", "pit-cody-95bc94"), ("ben", "pit-cody-95bc94")]);

    assert_eq!(
        store.counts(Some("tierschutz-europa")).await.expect("counts"),
        other_org_before
    );
}

#[tokio::test]
async fn removed_rows_match_the_plan_exactly() {
    let store = pit_store().await;
    let reconciler = Reconciler::new(store.clone(), registry());
    let plan = reconciler.plan_organization("pit").await.expect("plan");

    reconciler
        .execute(&plan, &request(&plan, Environment::Test))
        .await
        .expect("execute");

    let after = store.counts(Some("pit")).await.expect("counts");
    assert_eq!(after, plan.expected_after());
    assert_eq!(
        plan.total_removed(),
        TableCounts { animals: 1, images: 2, scrape_logs: 1, favorites: 1 }
    );
}

#[tokio::test]
async fn dry_run_is_pure_and_repeatable() {
    let store = pit_store().await;
    let reconciler = Reconciler::new(store.clone(), registry());
    let before = store.counts(None).await.expect("counts");

    let first = reconciler.plan_organization("pit").await.expect("plan");
    let second = reconciler.plan_organization("pit").await.expect("plan");

    assert_eq!(first.checksum, second.checksum);
    assert_eq!(first, second);
    assert_eq!(store.counts(None).await.expect("counts"), before);
}

#[tokio::test]
async fn second_run_finds_nothing_to_do() {
    let store = pit_store().await;
    let reconciler = Reconciler::new(store.clone(), registry());
    let plan = reconciler.plan_organization("pit").await.expect("plan");
    reconciler
        .execute(&plan, &request(&plan, Environment::Staging))
        .await
        .expect("execute");

    let again = reconciler.plan_organization("pit").await.expect("plan");
    assert_eq!(again.resolvable, 0);
    assert!(again.per_group.is_empty());
    assert_ne!(again.checksum, plan.checksum);
}

#[tokio::test]
async fn plan_is_stale_once_the_store_changes() {
    let store = pit_store().await;
    let reconciler = Reconciler::new(store.clone(), registry());
    let plan = reconciler.plan_organization("pit").await.expect("plan");

    store.push_scrape_log("pit", "pit-cody", "ok").await;
    let changed = store.counts(Some("pit")).await.expect("counts");

    let err = reconciler
        .execute(&plan, &request(&plan, Environment::Development))
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::StalePlan { .. }));
    assert_eq!(err.exit_code(), 1);
    assert_eq!(store.counts(Some("pit")).await.expect("counts"), changed);
}

async fn store_with_ambiguous_cody() -> Arc<MemoryStore> {
    let store = pit_store().await;
    add_animal(&store, "pit", "pit-cody-000001", "Cody").await;
    let rex = IdentifyingFields::new("Rex", None, None);
    let rex_current = registry().get("pit").expect("pit").external_id_for(&rex);
    add_animal(&store, "pit", "pit-rex", "Rex").await;
    add_animal(&store, "pit", &rex_current, "Rex").await;
    store
}

#[tokio::test]
async fn ambiguous_groups_block_execution_by_default() {
    let store = store_with_ambiguous_cody().await;
    let reconciler = Reconciler::new(store.clone(), registry());
    let plan = reconciler.plan_organization("pit").await.expect("plan");
    assert_eq!(plan.ambiguous, 1);
    assert_eq!(plan.resolvable, 1);
    let before = store.counts(Some("pit")).await.expect("counts");

    let err = reconciler
        .execute(&plan, &request(&plan, Environment::Development))
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::IdentityAmbiguous { groups: 1, .. }));
    assert_eq!(store.counts(Some("pit")).await.expect("counts"), before);
}

#[tokio::test]
async fn excluded_ambiguous_groups_are_left_untouched() {
    let store = store_with_ambiguous_cody().await;
    let reconciler = Reconciler::new(store.clone(), registry());
    let plan = reconciler.plan_organization("pit").await.expect("plan");

    let mut req = request(&plan, Environment::Development);
    req.ambiguity = AmbiguityPolicy::ExcludeAmbiguous;
    let report = reconciler.execute(&plan, &req).await.expect("execute");
    assert_eq!(report.skipped_ambiguous, 1);
    assert_eq!(report.applied(), 1);
    assert_eq!(report.groups[0].removed_external_ids, ["pit-rex"]);

    let after = store.snapshot_organization("pit").await.expect("snapshot");
    for id in ["pit-cody", "pit-cody-95bc94", "pit-cody-000001"] {
        assert!(after.records.iter().any(|r| r.external_id == id), "{id} should remain");
    }
    assert!(!after.records.iter().any(|r| r.external_id == "pit-rex"));
}

/// Delegates to a `MemoryStore` but can misreport counts or fail a chosen `apply_group` call.
struct FaultyStore {
    inner: MemoryStore,
    skew_counts_after_apply: bool,
    fail_apply_call: Option<usize>,
    applied: AtomicBool,
    apply_calls: AtomicUsize,
}

impl FaultyStore {
    fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            skew_counts_after_apply: false,
            fail_apply_call: None,
            applied: AtomicBool::new(false),
            apply_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl AnimalStore for FaultyStore {
    async fn snapshot_organization(&self, org_id: &str) -> Result<OrgSnapshot, StoreError> {
        self.inner.snapshot_organization(org_id).await
    }

    async fn counts(&self, org_id: Option<&str>) -> Result<TableCounts, StoreError> {
        let mut counts = self.inner.counts(org_id).await?;
        if self.skew_counts_after_apply && self.applied.load(Ordering::SeqCst) {
            counts.animals += 1;
        }
        Ok(counts)
    }

    async fn apply_group(&self, mutation: &GroupMutation) -> Result<GroupMutationOutcome, StoreError> {
        let call = self.apply_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_apply_call == Some(call) {
            let before = self.inner.counts(Some(&mutation.org_id)).await?;
            return Err(StoreError::Verification(CountMismatch {
                org_id: mutation.org_id.clone(),
                before,
                removed: mutation.expected_removed(),
                expected: before,
                actual: before,
            }));
        }
        let outcome = self.inner.apply_group(mutation).await?;
        self.applied.store(true, Ordering::SeqCst);
        Ok(outcome)
    }

    async fn delete_all_listings(&self) -> Result<TableCounts, StoreError> {
        self.inner.delete_all_listings().await
    }

    async fn try_lock_organization(&self, org_id: &str) -> Result<OrgLease, StoreError> {
        self.inner.try_lock_organization(org_id).await
    }

    async fn release_organization(&self, lease: OrgLease) -> Result<(), StoreError> {
        self.inner.release_organization(lease).await
    }

    async fn upsert_animal(&self, draft: &AnimalDraft) -> Result<UpsertOutcome, StoreError> {
        self.inner.upsert_animal(draft).await
    }
}

async fn two_group_store() -> MemoryStore {
    let store = MemoryStore::new();
    add_animal(&store, "pit", "pit-cody", "Cody").await;
    add_animal(&store, "pit", "pit-cody-95bc94", "Cody").await;
    add_animal(&store, "pit", "pit-rex", "Rex").await;
    add_animal(&store, "pit", "pit-rex-0c0ffe", "Rex").await;
    store
}

#[tokio::test]
async fn count_drift_after_commit_is_reported_as_committed() {
    let mut faulty = FaultyStore::new(two_group_store().await);
    faulty.skew_counts_after_apply = true;
    let store = Arc::new(faulty);
    let reconciler = Reconciler::new(store.clone(), registry());
    let plan = reconciler.plan_organization("pit").await.expect("plan");

    let err = reconciler
        .execute(&plan, &request(&plan, Environment::Development))
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::VerificationFailed { committed: true, .. }));
    assert_eq!(err.exit_code(), 3);
    assert!(err.may_have_mutated());
}

#[tokio::test]
async fn failing_group_halts_the_run() {
    let mut faulty = FaultyStore::new(two_group_store().await);
    faulty.fail_apply_call = Some(2);
    let store = Arc::new(faulty);
    let reconciler = Reconciler::new(store.clone(), registry());
    let plan = reconciler.plan_organization("pit").await.expect("plan");
    assert_eq!(plan.resolvable, 2);

    let err = reconciler
        .execute(&plan, &request(&plan, Environment::Development))
        .await
        .unwrap_err();
    match &err {
        ReconcileError::Halted { applied, planned, cause } => {
            assert_eq!((*applied, *planned), (1, 2));
            assert!(matches!(
                **cause,
                ReconcileError::VerificationFailed { committed: false, .. }
            ));
        }
        other => panic!("expected Halted, got {other:?}"),
    }
    assert_eq!(err.exit_code(), 3);

    // The first group stays applied; the second was rolled back before commit.
    let after = store.snapshot_organization("pit").await.expect("snapshot");
    let ids: Vec<&str> = after.records.iter().map(|r| r.external_id.as_str()).collect();
    assert_eq!(ids, ["pit-cody-95bc94", "pit-rex", "pit-rex-0c0ffe"]);

    // The lock was released even though the run failed.
    let lease = store.try_lock_organization("pit").await.expect("lock");
    store.release_organization(lease).await.expect("release");
}

#[tokio::test]
async fn unknown_organization_is_refused_before_reading() {
    let store = pit_store().await;
    let reconciler = Reconciler::new(store, registry());
    assert!(matches!(
        reconciler.plan_organization("atlantis").await,
        Err(ReconcileError::UnknownOrganization(_))
    ));
}
