#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use rescue_core::{AnimalDraft, Environment, ProductionOverride};
use rescue_identity::OrganizationRegistry;
use rescue_reconcile::{AmbiguityPolicy, ExecuteRequest, MigrationPlan};
use rescue_storage::{AnimalStore, MemoryStore};

pub const REGISTRY_YAML: &str = r#"
organizations:
  - org_id: pit
    legacy_schemes:
      - name: bare-slug
        pattern: "pit-[a-z0-9]+(?:-[a-z0-9]+)*"
  - org_id: tierschutz-europa
    prefix: tse
    include_type_segment: true
    legacy_schemes:
      - name: numeric
        pattern: "tse-[0-9]+"
"#;

pub fn registry() -> Arc<OrganizationRegistry> {
    Arc::new(OrganizationRegistry::from_yaml_str(REGISTRY_YAML).expect("registry"))
}

pub fn at(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 4, 2, hour, 0, 0).single().expect("timestamp")
}

pub async fn add_animal(store: &MemoryStore, org_id: &str, external_id: &str, name: &str) {
    let mut draft = AnimalDraft::new(org_id, name, at(8));
    draft.external_id = external_id.to_string();
    store.upsert_animal(&draft).await.expect("insert animal");
}

/// `pit` after the id scheme change: Cody exists under both schemes, Bella only under the old one.
/// One unrelated organization shares the store.
pub async fn pit_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    add_animal(&store, "pit", "pit-cody", "Cody").await;
    add_animal(&store, "pit", "pit-cody-95bc94", "Cody").await;
    add_animal(&store, "pit", "pit-bella", "Bella").await;
    add_animal(&store, "tierschutz-europa", "tse-4711", "Rex").await;

    store.push_image("pit", "pit-cody", "https://img.example/cody-1.jpg").await;
    store.push_image("pit", "pit-cody", "https://img.example/cody-2.jpg").await;
    store.push_image("pit", "pit-cody-95bc94", "https://img.example/cody-3.jpg").await;
    store.push_image("tierschutz-europa", "tse-4711", "https://img.example/rex.jpg").await;

    store.push_scrape_log("pit", "pit-cody", "ok").await;
    store.push_scrape_log("pit", "pit-cody-95bc94", "ok").await;

    store.push_favorite("pit", "pit-cody", "ana").await;
    store.push_favorite("pit", "pit-cody", "ben").await;
    store.push_favorite("pit", "pit-cody-95bc94", "ben").await;
    store
}

pub fn request(plan: &MigrationPlan, environment: Environment) -> ExecuteRequest {
    ExecuteRequest {
        confirmation: plan.checksum.clone(),
        environment,
        production_override: ProductionOverride::Denied,
        ambiguity: AmbiguityPolicy::Refuse,
    }
}
