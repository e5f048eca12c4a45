//! Persistence seam for the reconciliation engine: the `AnimalStore` contract, an in-process
//! store, the Postgres store, and the on-disk audit archive for plans and reports.

use async_trait::async_trait;
use rescue_core::{AnimalDraft, OrgSnapshot, TableCounts};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

mod archive;
mod memory;
mod postgres;

pub use archive::{ArchivedEntry, AuditArchive};
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use sqlx::Error as SqlxError;

pub const CRATE_NAME: &str = "rescue-storage";

/// Post-mutation counts disagree with what the mutation was expected to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("org {org_id}: expected {expected} after removing {removed} from {before}, found {actual}")]
pub struct CountMismatch {
    pub org_id: String,
    pub before: TableCounts,
    pub removed: TableCounts,
    pub expected: TableCounts,
    pub actual: TableCounts,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unreachable: {0}")]
    Unreachable(#[source] sqlx::Error),
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
    #[error("applying migrations: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("organization {org_id} is locked by a running reconciliation")]
    OrganizationLocked { org_id: String },
    #[error("no lease {token} is held for organization {org_id}")]
    LeaseNotHeld { org_id: String, token: u64 },
    #[error("{statement}: expected {expected} row(s), affected {actual}")]
    UnexpectedRowCount {
        statement: &'static str,
        expected: u64,
        actual: u64,
    },
    #[error("verification inside transaction failed, rolled back: {0}")]
    Verification(#[from] CountMismatch),
}

impl StoreError {
    pub fn is_unreachable(&self) -> bool {
        matches!(self, StoreError::Unreachable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Unreachable(err),
            other => StoreError::Database(other),
        }
    }
}

pub(crate) fn expect_rows(statement: &'static str, expected: u64, actual: u64) -> Result<(), StoreError> {
    if expected == actual {
        Ok(())
    } else {
        Err(StoreError::UnexpectedRowCount {
            statement,
            expected,
            actual,
        })
    }
}

/// Advisory lock key for an organization, stable across processes.
pub fn org_lock_key(org_id: &str) -> i64 {
    let mut hasher = Sha256::new();
    hasher.update(b"rescue-reconcile:");
    hasher.update(org_id.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

/// Exclusive hold on one organization. Returned to the store via `release_organization`.
#[derive(Debug, PartialEq, Eq)]
pub struct OrgLease {
    pub org_id: String,
    pub token: u64,
}

/// One non-canonical record and the dependent rows deleted with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordRemoval {
    pub record_id: i64,
    pub external_id: String,
    pub image_ids: Vec<i64>,
    pub scrape_log_ids: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FavoriteRepoint {
    pub favorite_id: i64,
    pub from_external_id: String,
}

/// Everything one duplicate group changes, applied all-or-nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMutation {
    pub org_id: String,
    pub canonical_external_id: String,
    pub removals: Vec<RecordRemoval>,
    pub favorite_repoints: Vec<FavoriteRepoint>,
    /// Favorites deleted because the same user already bookmarks the canonical record.
    pub favorite_merges: Vec<i64>,
}

impl GroupMutation {
    pub fn expected_removed(&self) -> TableCounts {
        TableCounts {
            animals: self.removals.len() as u64,
            images: self.removals.iter().map(|r| r.image_ids.len() as u64).sum(),
            scrape_logs: self.removals.iter().map(|r| r.scrape_log_ids.len() as u64).sum(),
            favorites: self.favorite_merges.len() as u64,
        }
    }

    /// `before - expected_removed == after`, column by column.
    pub fn verify(&self, before: TableCounts, after: TableCounts) -> Result<(), CountMismatch> {
        let removed = self.expected_removed();
        let mismatch = |expected| CountMismatch {
            org_id: self.org_id.clone(),
            before,
            removed,
            expected,
            actual: after,
        };
        match before.checked_sub(&removed) {
            Some(expected) if expected == after => Ok(()),
            Some(expected) => Err(mismatch(expected)),
            None => Err(mismatch(TableCounts::default())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMutationOutcome {
    pub before: TableCounts,
    pub after: TableCounts,
    pub removed: TableCounts,
    pub favorites_repointed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpsertOutcome {
    Inserted { record_id: i64 },
    Updated { record_id: i64 },
}

#[async_trait]
pub trait AnimalStore: Send + Sync {
    /// Every row of one organization, read consistently.
    async fn snapshot_organization(&self, org_id: &str) -> Result<OrgSnapshot, StoreError>;

    /// Row counts for one organization, or for the whole store when `org_id` is `None`.
    async fn counts(&self, org_id: Option<&str>) -> Result<TableCounts, StoreError>;

    /// Apply one group's removals in a single transaction, verifying counts before commit.
    async fn apply_group(&self, mutation: &GroupMutation) -> Result<GroupMutationOutcome, StoreError>;

    /// Delete every animal, image, and scrape log in one transaction. Returns rows deleted.
    async fn delete_all_listings(&self) -> Result<TableCounts, StoreError>;

    /// Fails fast with `OrganizationLocked` when another holder exists.
    async fn try_lock_organization(&self, org_id: &str) -> Result<OrgLease, StoreError>;

    async fn release_organization(&self, lease: OrgLease) -> Result<(), StoreError>;

    /// Scraper write path. Never changes the `external_id` of an existing row and refuses to
    /// interleave with a reconciliation holding the organization's lease.
    async fn upsert_animal(&self, draft: &AnimalDraft) -> Result<UpsertOutcome, StoreError>;
}
