use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use rescue_core::{AnimalDraft, AnimalImage, AnimalRecord, Favorite, OrgSnapshot, ScrapeLog, TableCounts};
use tokio::sync::Mutex;

use crate::{
    expect_rows, AnimalStore, GroupMutation, GroupMutationOutcome, OrgLease, StoreError, UpsertOutcome,
};

#[derive(Debug, Clone, Default)]
struct Tables {
    animals: Vec<AnimalRecord>,
    images: Vec<AnimalImage>,
    scrape_logs: Vec<ScrapeLog>,
    favorites: Vec<Favorite>,
    next_id: i64,
}

impl Tables {
    fn counts(&self, org_id: Option<&str>) -> TableCounts {
        let in_scope = |org: &str| org_id.map_or(true, |wanted| wanted == org);
        TableCounts {
            animals: self.animals.iter().filter(|r| in_scope(&r.org_id)).count() as u64,
            images: self.images.iter().filter(|r| in_scope(&r.org_id)).count() as u64,
            scrape_logs: self.scrape_logs.iter().filter(|r| in_scope(&r.org_id)).count() as u64,
            favorites: self.favorites.iter().filter(|r| in_scope(&r.org_id)).count() as u64,
        }
    }

    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn apply(&mut self, mutation: &GroupMutation) -> Result<u64, StoreError> {
        let org = mutation.org_id.as_str();
        let canonical_present = self
            .animals
            .iter()
            .filter(|r| r.org_id == org && r.external_id == mutation.canonical_external_id)
            .count() as u64;
        expect_rows("lock canonical animal", 1, canonical_present)?;

        for removal in &mutation.removals {
            let before = self.images.len();
            self.images.retain(|i| {
                !(i.org_id == org && i.external_id == removal.external_id && removal.image_ids.contains(&i.image_id))
            });
            expect_rows("delete animal_images", removal.image_ids.len() as u64, (before - self.images.len()) as u64)?;

            let before = self.scrape_logs.len();
            self.scrape_logs.retain(|l| {
                !(l.org_id == org
                    && l.external_id == removal.external_id
                    && removal.scrape_log_ids.contains(&l.log_id))
            });
            expect_rows(
                "delete animal_scrape_logs",
                removal.scrape_log_ids.len() as u64,
                (before - self.scrape_logs.len()) as u64,
            )?;
        }

        let before = self.favorites.len();
        self.favorites
            .retain(|f| !(f.org_id == org && mutation.favorite_merges.contains(&f.favorite_id)));
        expect_rows(
            "delete merged animal_favorites",
            mutation.favorite_merges.len() as u64,
            (before - self.favorites.len()) as u64,
        )?;

        let mut repointed = 0u64;
        for repoint in &mutation.favorite_repoints {
            let mut hits = 0u64;
            for favorite in self.favorites.iter_mut().filter(|f| {
                f.org_id == org && f.favorite_id == repoint.favorite_id && f.external_id == repoint.from_external_id
            }) {
                favorite.external_id = mutation.canonical_external_id.clone();
                hits += 1;
            }
            expect_rows("repoint animal_favorites", 1, hits)?;
            repointed += hits;
        }

        for removal in &mutation.removals {
            // Owned rows must be gone before the animal, as the foreign keys require.
            let dangling = self
                .images
                .iter()
                .filter(|i| i.org_id == org && i.external_id == removal.external_id)
                .count()
                + self
                    .scrape_logs
                    .iter()
                    .filter(|l| l.org_id == org && l.external_id == removal.external_id)
                    .count();
            expect_rows("foreign key check on animals", 0, dangling as u64)?;

            let before = self.animals.len();
            self.animals.retain(|r| {
                !(r.org_id == org && r.record_id == removal.record_id && r.external_id == removal.external_id)
            });
            expect_rows("delete animals", 1, (before - self.animals.len()) as u64)?;
        }

        Ok(repointed)
    }
}

/// In-process store with the same transactional contract as `PgStore`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    leases: Mutex<HashMap<String, u64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load rows as-is, keeping their ids. Later inserts allocate above the highest id seen.
    pub async fn seed(&self, snapshot: OrgSnapshot) {
        let mut tables = self.tables.lock().await;
        let max_id = snapshot
            .records
            .iter()
            .map(|r| r.record_id)
            .chain(snapshot.images.iter().map(|i| i.image_id))
            .chain(snapshot.scrape_logs.iter().map(|l| l.log_id))
            .chain(snapshot.favorites.iter().map(|f| f.favorite_id))
            .max()
            .unwrap_or(0);
        tables.next_id = tables.next_id.max(max_id);
        tables.animals.extend(snapshot.records);
        tables.images.extend(snapshot.images);
        tables.scrape_logs.extend(snapshot.scrape_logs);
        tables.favorites.extend(snapshot.favorites);
    }

    pub async fn push_image(&self, org_id: &str, external_id: &str, image_url: &str) -> i64 {
        let mut tables = self.tables.lock().await;
        let image_id = tables.allocate_id();
        let position = tables
            .images
            .iter()
            .filter(|i| i.org_id == org_id && i.external_id == external_id)
            .count() as i32;
        tables.images.push(AnimalImage {
            image_id,
            org_id: org_id.to_string(),
            external_id: external_id.to_string(),
            image_url: image_url.to_string(),
            original_image_url: Some(image_url.to_string()),
            position,
        });
        image_id
    }

    pub async fn push_scrape_log(&self, org_id: &str, external_id: &str, outcome: &str) -> i64 {
        let mut tables = self.tables.lock().await;
        let log_id = tables.allocate_id();
        tables.scrape_logs.push(ScrapeLog {
            log_id,
            org_id: org_id.to_string(),
            external_id: external_id.to_string(),
            scraped_at: Utc::now(),
            outcome: outcome.to_string(),
        });
        log_id
    }

    pub async fn push_favorite(&self, org_id: &str, external_id: &str, user_ref: &str) -> i64 {
        let mut tables = self.tables.lock().await;
        let favorite_id = tables.allocate_id();
        tables.favorites.push(Favorite {
            favorite_id,
            user_ref: user_ref.to_string(),
            org_id: org_id.to_string(),
            external_id: external_id.to_string(),
        });
        favorite_id
    }
}

#[async_trait]
impl AnimalStore for MemoryStore {
    async fn snapshot_organization(&self, org_id: &str) -> Result<OrgSnapshot, StoreError> {
        let tables = self.tables.lock().await;
        let mut snapshot = OrgSnapshot {
            org_id: org_id.to_string(),
            records: tables.animals.iter().filter(|r| r.org_id == org_id).cloned().collect(),
            images: tables.images.iter().filter(|r| r.org_id == org_id).cloned().collect(),
            scrape_logs: tables.scrape_logs.iter().filter(|r| r.org_id == org_id).cloned().collect(),
            favorites: tables.favorites.iter().filter(|r| r.org_id == org_id).cloned().collect(),
        };
        snapshot.records.sort_by_key(|r| r.record_id);
        snapshot.images.sort_by_key(|r| r.image_id);
        snapshot.scrape_logs.sort_by_key(|r| r.log_id);
        snapshot.favorites.sort_by_key(|r| r.favorite_id);
        Ok(snapshot)
    }

    async fn counts(&self, org_id: Option<&str>) -> Result<TableCounts, StoreError> {
        Ok(self.tables.lock().await.counts(org_id))
    }

    async fn apply_group(&self, mutation: &GroupMutation) -> Result<GroupMutationOutcome, StoreError> {
        let mut tables = self.tables.lock().await;
        let before = tables.counts(Some(&mutation.org_id));

        // Mutate a copy and swap it in only once it has verified.
        let mut working = tables.clone();
        let favorites_repointed = working.apply(mutation)?;
        let after = working.counts(Some(&mutation.org_id));
        mutation.verify(before, after)?;

        *tables = working;
        Ok(GroupMutationOutcome {
            before,
            after,
            removed: mutation.expected_removed(),
            favorites_repointed,
        })
    }

    async fn delete_all_listings(&self) -> Result<TableCounts, StoreError> {
        let mut tables = self.tables.lock().await;
        let deleted = TableCounts {
            animals: tables.animals.len() as u64,
            images: tables.images.len() as u64,
            scrape_logs: tables.scrape_logs.len() as u64,
            favorites: 0,
        };
        tables.images.clear();
        tables.scrape_logs.clear();
        tables.animals.clear();
        Ok(deleted)
    }

    async fn try_lock_organization(&self, org_id: &str) -> Result<OrgLease, StoreError> {
        let mut leases = self.leases.lock().await;
        if leases.contains_key(org_id) {
            return Err(StoreError::OrganizationLocked {
                org_id: org_id.to_string(),
            });
        }
        let token = leases.values().copied().max().unwrap_or(0) + 1;
        leases.insert(org_id.to_string(), token);
        Ok(OrgLease {
            org_id: org_id.to_string(),
            token,
        })
    }

    async fn release_organization(&self, lease: OrgLease) -> Result<(), StoreError> {
        let mut leases = self.leases.lock().await;
        match leases.get(&lease.org_id) {
            Some(token) if *token == lease.token => {
                leases.remove(&lease.org_id);
                Ok(())
            }
            _ => Err(StoreError::LeaseNotHeld {
                org_id: lease.org_id,
                token: lease.token,
            }),
        }
    }

    async fn upsert_animal(&self, draft: &AnimalDraft) -> Result<UpsertOutcome, StoreError> {
        if self.leases.lock().await.contains_key(&draft.org_id) {
            return Err(StoreError::OrganizationLocked {
                org_id: draft.org_id.clone(),
            });
        }

        let mut tables = self.tables.lock().await;
        if let Some(existing) = tables
            .animals
            .iter_mut()
            .find(|r| r.org_id == draft.org_id && r.external_id == draft.external_id)
        {
            existing.name = draft.name.clone();
            existing.animal_type = draft.animal_type.clone();
            existing.breed = draft.breed.clone();
            existing.sex = draft.sex.clone();
            existing.age_text = draft.age_text.clone();
            existing.adoption_url = draft.adoption_url.clone();
            existing.primary_image_url = draft.primary_image_url.clone();
            existing.original_image_url = draft.original_image_url.clone();
            existing.status = draft.status.clone();
            existing.updated_at = draft.observed_at;
            return Ok(UpsertOutcome::Updated {
                record_id: existing.record_id,
            });
        }

        let record_id = tables.allocate_id();
        tables.animals.push(AnimalRecord {
            record_id,
            org_id: draft.org_id.clone(),
            external_id: draft.external_id.clone(),
            name: draft.name.clone(),
            animal_type: draft.animal_type.clone(),
            breed: draft.breed.clone(),
            sex: draft.sex.clone(),
            age_text: draft.age_text.clone(),
            adoption_url: draft.adoption_url.clone(),
            primary_image_url: draft.primary_image_url.clone(),
            original_image_url: draft.original_image_url.clone(),
            status: draft.status.clone(),
            created_at: draft.observed_at,
            updated_at: draft.observed_at,
        });
        Ok(UpsertOutcome::Inserted { record_id })
    }
}
