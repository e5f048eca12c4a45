use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rescue_core::{AnimalDraft, AnimalImage, AnimalRecord, Favorite, OrgSnapshot, ScrapeLog, TableCounts};
use sqlx::postgres::{PgConnection, PgPoolOptions, PgRow};
use sqlx::{Connection, PgPool, Row};
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn, Instrument};

use crate::{
    expect_rows, org_lock_key, AnimalStore, GroupMutation, GroupMutationOutcome, OrgLease, StoreError,
    UpsertOutcome,
};

const COUNTS_SQL: &str = r#"
    SELECT (SELECT COUNT(*) FROM animals WHERE $1::text IS NULL OR organization_id = $1) AS animals,
           (SELECT COUNT(*) FROM animal_images WHERE $1::text IS NULL OR organization_id = $1) AS images,
           (SELECT COUNT(*) FROM animal_scrape_logs WHERE $1::text IS NULL OR organization_id = $1) AS scrape_logs,
           (SELECT COUNT(*) FROM animal_favorites WHERE $1::text IS NULL OR organization_id = $1) AS favorites
"#;

/// Postgres-backed store. Advisory leases live on detached connections so a lease can never be
/// handed back to the pool while still held.
pub struct PgStore {
    pool: PgPool,
    leases: Mutex<HashMap<u64, (String, PgConnection)>>,
    next_token: AtomicU64,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(StoreError::Unreachable)?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            leases: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn apply_group_in_transaction(&self, mutation: &GroupMutation) -> Result<GroupMutationOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let before = count_rows(&mut tx, Some(&mutation.org_id)).await?;

        let favorites_repointed = match apply_mutation(&mut tx, mutation).await {
            Ok(n) => n,
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "rollback after failed statement");
                }
                return Err(err);
            }
        };

        let after = count_rows(&mut tx, Some(&mutation.org_id)).await?;
        if let Err(mismatch) = mutation.verify(before, after) {
            tx.rollback().await?;
            return Err(StoreError::Verification(mismatch));
        }

        tx.commit().await?;
        debug!(%before, %after, "group committed");
        Ok(GroupMutationOutcome {
            before,
            after,
            removed: mutation.expected_removed(),
            favorites_repointed,
        })
    }
}

fn counts_from_row(row: &PgRow) -> Result<TableCounts, StoreError> {
    let get = |column: &str| -> Result<u64, StoreError> {
        let value: i64 = row.try_get(column)?;
        Ok(value.max(0) as u64)
    };
    Ok(TableCounts {
        animals: get("animals")?,
        images: get("images")?,
        scrape_logs: get("scrape_logs")?,
        favorites: get("favorites")?,
    })
}

async fn count_rows(conn: &mut PgConnection, org_id: Option<&str>) -> Result<TableCounts, StoreError> {
    let row = sqlx::query(COUNTS_SQL).bind(org_id).fetch_one(&mut *conn).await?;
    counts_from_row(&row)
}

fn record_from_row(row: &PgRow) -> Result<AnimalRecord, sqlx::Error> {
    Ok(AnimalRecord {
        record_id: row.try_get("id")?,
        org_id: row.try_get("organization_id")?,
        external_id: row.try_get("external_id")?,
        name: row.try_get("name")?,
        animal_type: row.try_get("animal_type")?,
        breed: row.try_get("breed")?,
        sex: row.try_get("sex")?,
        age_text: row.try_get("age_text")?,
        adoption_url: row.try_get("adoption_url")?,
        primary_image_url: row.try_get("primary_image_url")?,
        original_image_url: row.try_get("original_image_url")?,
        status: row.try_get("status")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

async fn apply_mutation(conn: &mut PgConnection, mutation: &GroupMutation) -> Result<u64, StoreError> {
    let org = mutation.org_id.as_str();

    let canonical = sqlx::query(
        r#"
        SELECT id
          FROM animals
         WHERE organization_id = $1
           AND external_id = $2
           FOR UPDATE
        "#,
    )
    .bind(org)
    .bind(&mutation.canonical_external_id)
    .fetch_all(&mut *conn)
    .await?;
    expect_rows("lock canonical animal", 1, canonical.len() as u64)?;

    for removal in &mutation.removals {
        let deleted = sqlx::query(
            r#"
            DELETE FROM animal_images
             WHERE organization_id = $1
               AND animal_external_id = $2
               AND id = ANY($3)
            "#,
        )
        .bind(org)
        .bind(&removal.external_id)
        .bind(&removal.image_ids)
        .execute(&mut *conn)
        .await?
        .rows_affected();
        expect_rows("delete animal_images", removal.image_ids.len() as u64, deleted)?;

        let deleted = sqlx::query(
            r#"
            DELETE FROM animal_scrape_logs
             WHERE organization_id = $1
               AND animal_external_id = $2
               AND id = ANY($3)
            "#,
        )
        .bind(org)
        .bind(&removal.external_id)
        .bind(&removal.scrape_log_ids)
        .execute(&mut *conn)
        .await?
        .rows_affected();
        expect_rows("delete animal_scrape_logs", removal.scrape_log_ids.len() as u64, deleted)?;
    }

    if !mutation.favorite_merges.is_empty() {
        let deleted = sqlx::query(
            r#"
            DELETE FROM animal_favorites
             WHERE organization_id = $1
               AND id = ANY($2)
            "#,
        )
        .bind(org)
        .bind(&mutation.favorite_merges)
        .execute(&mut *conn)
        .await?
        .rows_affected();
        expect_rows("delete merged animal_favorites", mutation.favorite_merges.len() as u64, deleted)?;
    }

    let mut repointed = 0u64;
    for repoint in &mutation.favorite_repoints {
        let updated = sqlx::query(
            r#"
            UPDATE animal_favorites
               SET animal_external_id = $1
             WHERE id = $2
               AND organization_id = $3
               AND animal_external_id = $4
            "#,
        )
        .bind(&mutation.canonical_external_id)
        .bind(repoint.favorite_id)
        .bind(org)
        .bind(&repoint.from_external_id)
        .execute(&mut *conn)
        .await?
        .rows_affected();
        expect_rows("repoint animal_favorites", 1, updated)?;
        repointed += updated;
    }

    for removal in &mutation.removals {
        let deleted = sqlx::query(
            r#"
            DELETE FROM animals
             WHERE id = $1
               AND organization_id = $2
               AND external_id = $3
            "#,
        )
        .bind(removal.record_id)
        .bind(org)
        .bind(&removal.external_id)
        .execute(&mut *conn)
        .await?
        .rows_affected();
        expect_rows("delete animals", 1, deleted)?;
    }

    Ok(repointed)
}

#[async_trait]
impl AnimalStore for PgStore {
    async fn snapshot_organization(&self, org_id: &str) -> Result<OrgSnapshot, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await?;

        let records = sqlx::query(
            r#"
            SELECT id, organization_id, external_id, name, animal_type, breed, sex, age_text,
                   adoption_url, primary_image_url, original_image_url, status, created_at, updated_at
              FROM animals
             WHERE organization_id = $1
             ORDER BY id
            "#,
        )
        .bind(org_id)
        .fetch_all(&mut *tx)
        .await?
        .iter()
        .map(record_from_row)
        .collect::<Result<Vec<_>, _>>()?;

        let mut images = Vec::new();
        for row in sqlx::query(
            r#"
            SELECT id, organization_id, animal_external_id, image_url, original_image_url, position
              FROM animal_images
             WHERE organization_id = $1
             ORDER BY id
            "#,
        )
        .bind(org_id)
        .fetch_all(&mut *tx)
        .await?
        {
            images.push(AnimalImage {
                image_id: row.try_get("id")?,
                org_id: row.try_get("organization_id")?,
                external_id: row.try_get("animal_external_id")?,
                image_url: row.try_get("image_url")?,
                original_image_url: row.try_get("original_image_url")?,
                position: row.try_get("position")?,
            });
        }

        let mut scrape_logs = Vec::new();
        for row in sqlx::query(
            r#"
            SELECT id, organization_id, animal_external_id, scraped_at, outcome
              FROM animal_scrape_logs
             WHERE organization_id = $1
             ORDER BY id
            "#,
        )
        .bind(org_id)
        .fetch_all(&mut *tx)
        .await?
        {
            scrape_logs.push(ScrapeLog {
                log_id: row.try_get("id")?,
                org_id: row.try_get("organization_id")?,
                external_id: row.try_get("animal_external_id")?,
                scraped_at: row.try_get("scraped_at")?,
                outcome: row.try_get("outcome")?,
            });
        }

        let mut favorites = Vec::new();
        for row in sqlx::query(
            r#"
            SELECT id, user_ref, organization_id, animal_external_id
              FROM animal_favorites
             WHERE organization_id = $1
             ORDER BY id
            "#,
        )
        .bind(org_id)
        .fetch_all(&mut *tx)
        .await?
        {
            favorites.push(Favorite {
                favorite_id: row.try_get("id")?,
                user_ref: row.try_get("user_ref")?,
                org_id: row.try_get("organization_id")?,
                external_id: row.try_get("animal_external_id")?,
            });
        }

        tx.commit().await?;
        Ok(OrgSnapshot {
            org_id: org_id.to_string(),
            records,
            images,
            scrape_logs,
            favorites,
        })
    }

    async fn counts(&self, org_id: Option<&str>) -> Result<TableCounts, StoreError> {
        let mut conn = self.pool.acquire().await?;
        count_rows(&mut conn, org_id).await
    }

    async fn apply_group(&self, mutation: &GroupMutation) -> Result<GroupMutationOutcome, StoreError> {
        let span = info_span!(
            "apply_group",
            org_id = %mutation.org_id,
            canonical = %mutation.canonical_external_id,
            removals = mutation.removals.len()
        );
        self.apply_group_in_transaction(mutation).instrument(span).await
    }

    async fn delete_all_listings(&self) -> Result<TableCounts, StoreError> {
        let mut tx = self.pool.begin().await?;
        let images = sqlx::query("DELETE FROM animal_images").execute(&mut *tx).await?.rows_affected();
        let scrape_logs = sqlx::query("DELETE FROM animal_scrape_logs")
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let animals = sqlx::query("DELETE FROM animals").execute(&mut *tx).await?.rows_affected();
        tx.commit().await?;
        Ok(TableCounts {
            animals,
            images,
            scrape_logs,
            favorites: 0,
        })
    }

    async fn try_lock_organization(&self, org_id: &str) -> Result<OrgLease, StoreError> {
        // Session-level advisory locks belong to one connection, so it leaves the pool.
        let mut conn = self.pool.acquire().await?.detach();
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(org_lock_key(org_id))
            .fetch_one(&mut conn)
            .await?;
        if !acquired {
            let _ = conn.close().await;
            return Err(StoreError::OrganizationLocked {
                org_id: org_id.to_string(),
            });
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.leases.lock().await.insert(token, (org_id.to_string(), conn));
        debug!(org_id, token, "advisory lock acquired");
        Ok(OrgLease {
            org_id: org_id.to_string(),
            token,
        })
    }

    async fn release_organization(&self, lease: OrgLease) -> Result<(), StoreError> {
        let mut leases = self.leases.lock().await;
        let owned = leases
            .get(&lease.token)
            .is_some_and(|(org_id, _)| *org_id == lease.org_id);
        let Some((org_id, mut conn)) = owned.then(|| leases.remove(&lease.token)).flatten() else {
            return Err(StoreError::LeaseNotHeld {
                org_id: lease.org_id,
                token: lease.token,
            });
        };
        drop(leases);

        let released: bool = sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
            .bind(org_lock_key(&org_id))
            .fetch_one(&mut conn)
            .await?;
        if !released {
            warn!(%org_id, "advisory lock was not held at release");
        }
        conn.close().await?;
        Ok(())
    }

    async fn upsert_animal(&self, draft: &AnimalDraft) -> Result<UpsertOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let allowed: bool = sqlx::query_scalar("SELECT pg_try_advisory_xact_lock_shared($1)")
            .bind(org_lock_key(&draft.org_id))
            .fetch_one(&mut *tx)
            .await?;
        if !allowed {
            return Err(StoreError::OrganizationLocked {
                org_id: draft.org_id.clone(),
            });
        }

        let row = sqlx::query(
            r#"
            INSERT INTO animals (
                organization_id, external_id, name, animal_type, breed, sex, age_text,
                adoption_url, primary_image_url, original_image_url, status, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $12)
            ON CONFLICT (organization_id, external_id) DO UPDATE
               SET name = EXCLUDED.name,
                   animal_type = EXCLUDED.animal_type,
                   breed = EXCLUDED.breed,
                   sex = EXCLUDED.sex,
                   age_text = EXCLUDED.age_text,
                   adoption_url = EXCLUDED.adoption_url,
                   primary_image_url = EXCLUDED.primary_image_url,
                   original_image_url = EXCLUDED.original_image_url,
                   status = EXCLUDED.status,
                   updated_at = EXCLUDED.updated_at
            RETURNING id, (xmax = 0) AS inserted
            "#,
        )
        .bind(&draft.org_id)
        .bind(&draft.external_id)
        .bind(&draft.name)
        .bind(&draft.animal_type)
        .bind(&draft.breed)
        .bind(&draft.sex)
        .bind(&draft.age_text)
        .bind(&draft.adoption_url)
        .bind(&draft.primary_image_url)
        .bind(&draft.original_image_url)
        .bind(&draft.status)
        .bind(draft.observed_at)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        let record_id: i64 = row.try_get("id")?;
        let inserted: bool = row.try_get("inserted")?;
        Ok(if inserted {
            UpsertOutcome::Inserted { record_id }
        } else {
            UpsertOutcome::Updated { record_id }
        })
    }
}
