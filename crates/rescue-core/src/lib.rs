//! Core domain model for rescue listings: animals, their dependent rows, and store snapshots.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "rescue-core";

/// One row of `animals`: a single animal listed by a single organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnimalRecord {
    pub record_id: i64,
    pub org_id: String,
    pub external_id: String,
    pub name: String,
    pub animal_type: Option<String>,
    pub breed: Option<String>,
    pub sex: Option<String>,
    pub age_text: Option<String>,
    pub adoption_url: Option<String>,
    pub primary_image_url: Option<String>,
    /// Scraper-level fallback; carried verbatim, never interpreted here.
    pub original_image_url: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Row of `animal_images`, owned by the animal it references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnimalImage {
    pub image_id: i64,
    pub org_id: String,
    pub external_id: String,
    pub image_url: String,
    pub original_image_url: Option<String>,
    pub position: i32,
}

/// Row of `animal_scrape_logs`, owned by the animal it references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeLog {
    pub log_id: i64,
    pub org_id: String,
    pub external_id: String,
    pub scraped_at: DateTime<Utc>,
    pub outcome: String,
}

/// User bookmark. A weak reference: no foreign key, never cascaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Favorite {
    pub favorite_id: i64,
    pub user_ref: String,
    pub org_id: String,
    pub external_id: String,
}

/// Scraper handoff into the store. `external_id` is assigned before the write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnimalDraft {
    pub org_id: String,
    pub external_id: String,
    pub name: String,
    pub animal_type: Option<String>,
    pub breed: Option<String>,
    pub sex: Option<String>,
    pub age_text: Option<String>,
    pub adoption_url: Option<String>,
    pub primary_image_url: Option<String>,
    pub original_image_url: Option<String>,
    pub status: String,
    pub observed_at: DateTime<Utc>,
}

impl AnimalDraft {
    pub fn new(org_id: impl Into<String>, name: impl Into<String>, observed_at: DateTime<Utc>) -> Self {
        Self {
            org_id: org_id.into(),
            external_id: String::new(),
            name: name.into(),
            animal_type: None,
            breed: None,
            sex: None,
            age_text: None,
            adoption_url: None,
            primary_image_url: None,
            original_image_url: None,
            status: "available".to_string(),
            observed_at,
        }
    }
}

/// Row counts of the tables the engine touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TableCounts {
    pub animals: u64,
    pub images: u64,
    pub scrape_logs: u64,
    pub favorites: u64,
}

impl TableCounts {
    /// `self - other`, or `None` when any column would go negative.
    pub fn checked_sub(&self, other: &TableCounts) -> Option<TableCounts> {
        Some(TableCounts {
            animals: self.animals.checked_sub(other.animals)?,
            images: self.images.checked_sub(other.images)?,
            scrape_logs: self.scrape_logs.checked_sub(other.scrape_logs)?,
            favorites: self.favorites.checked_sub(other.favorites)?,
        })
    }

    pub fn saturating_add(&self, other: &TableCounts) -> TableCounts {
        TableCounts {
            animals: self.animals.saturating_add(other.animals),
            images: self.images.saturating_add(other.images),
            scrape_logs: self.scrape_logs.saturating_add(other.scrape_logs),
            favorites: self.favorites.saturating_add(other.favorites),
        }
    }

    pub fn owned_rows_are_empty(&self) -> bool {
        self.animals == 0 && self.images == 0 && self.scrape_logs == 0
    }
}

impl fmt::Display for TableCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "animals={} images={} scrape_logs={} favorites={}",
            self.animals, self.images, self.scrape_logs, self.favorites
        )
    }
}

/// Every row belonging to one organization, read at a single instant.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OrgSnapshot {
    pub org_id: String,
    pub records: Vec<AnimalRecord>,
    pub images: Vec<AnimalImage>,
    pub scrape_logs: Vec<ScrapeLog>,
    pub favorites: Vec<Favorite>,
}

impl OrgSnapshot {
    pub fn empty(org_id: impl Into<String>) -> Self {
        Self {
            org_id: org_id.into(),
            ..Default::default()
        }
    }

    pub fn counts(&self) -> TableCounts {
        TableCounts {
            animals: self.records.len() as u64,
            images: self.images.len() as u64,
            scrape_logs: self.scrape_logs.len() as u64,
            favorites: self.favorites.len() as u64,
        }
    }

    pub fn images_for<'a>(&'a self, external_id: &'a str) -> impl Iterator<Item = &'a AnimalImage> + 'a {
        self.images.iter().filter(move |i| i.external_id == external_id)
    }

    pub fn scrape_logs_for<'a>(&'a self, external_id: &'a str) -> impl Iterator<Item = &'a ScrapeLog> + 'a {
        self.scrape_logs.iter().filter(move |l| l.external_id == external_id)
    }

    pub fn favorites_for<'a>(&'a self, external_id: &'a str) -> impl Iterator<Item = &'a Favorite> + 'a {
        self.favorites.iter().filter(move |f| f.external_id == external_id)
    }

    /// Images and scrape logs whose `external_id` has no matching record.
    pub fn orphaned_dependents(&self) -> Vec<String> {
        let known: std::collections::HashSet<&str> =
            self.records.iter().map(|r| r.external_id.as_str()).collect();
        let mut orphans: Vec<String> = self
            .images
            .iter()
            .map(|i| i.external_id.as_str())
            .chain(self.scrape_logs.iter().map(|l| l.external_id.as_str()))
            .filter(|id| !known.contains(id))
            .map(ToString::to_string)
            .collect();
        orphans.sort();
        orphans.dedup();
        orphans
    }
}

/// Deployment the engine is pointed at. Threaded through every destructive call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Test,
    Staging,
    Production,
}

impl Environment {
    pub fn is_production(self) -> bool {
        matches!(self, Environment::Production)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Test => "test",
            Environment::Staging => "staging",
            Environment::Production => "production",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown environment {0:?} (expected development, test, staging or production)")]
pub struct ParseEnvironmentError(pub String);

impl FromStr for Environment {
    type Err = ParseEnvironmentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" | "local" => Ok(Environment::Development),
            "test" | "testing" => Ok(Environment::Test),
            "staging" | "stage" => Ok(Environment::Staging),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(ParseEnvironmentError(other.to_string())),
        }
    }
}

/// Explicit permission to run a destructive operation against production.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProductionOverride {
    #[default]
    Denied,
    Granted,
}

impl ProductionOverride {
    pub fn from_flag(granted: bool) -> Self {
        if granted {
            ProductionOverride::Granted
        } else {
            ProductionOverride::Denied
        }
    }

    pub fn permits(self, environment: Environment) -> bool {
        !environment.is_production() || self == ProductionOverride::Granted
    }
}
