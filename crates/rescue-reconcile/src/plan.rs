use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rescue_core::{AnimalRecord, OrgSnapshot, TableCounts};
use rescue_identity::{Classification, IdentifyingFields};
use rescue_storage::{FavoriteRepoint, GroupMutation, RecordRemoval};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::grouping::{DuplicateGroup, Grouping};
use crate::ReconcileError;

/// A record as it stood when the plan was made.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordRef {
    pub record_id: i64,
    pub external_id: String,
    pub updated_at: DateTime<Utc>,
}

impl From<&AnimalRecord> for RecordRef {
    fn from(record: &AnimalRecord) -> Self {
        Self {
            record_id: record.record_id,
            external_id: record.external_id.clone(),
            updated_at: record.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum FavoriteAction {
    /// Point the bookmark at the canonical record.
    Repoint { favorite_id: i64, user_ref: String },
    /// The user already bookmarks the canonical record; delete the redundant row.
    Merge {
        favorite_id: i64,
        user_ref: String,
        kept_favorite_id: i64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedRemoval {
    pub record: RecordRef,
    pub classification: Classification,
    pub image_ids: Vec<i64>,
    pub scrape_log_ids: Vec<i64>,
    pub favorites: Vec<FavoriteAction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedGroup {
    pub identity: IdentifyingFields,
    pub canonical: RecordRef,
    pub removals: Vec<PlannedRemoval>,
    pub dependents_removed_count: TableCounts,
}

impl PlannedGroup {
    pub fn to_mutation(&self, org_id: &str) -> GroupMutation {
        let mut favorite_repoints = Vec::new();
        let mut favorite_merges = Vec::new();
        for removal in &self.removals {
            for action in &removal.favorites {
                match action {
                    FavoriteAction::Repoint { favorite_id, .. } => favorite_repoints.push(FavoriteRepoint {
                        favorite_id: *favorite_id,
                        from_external_id: removal.record.external_id.clone(),
                    }),
                    FavoriteAction::Merge { favorite_id, .. } => favorite_merges.push(*favorite_id),
                }
            }
        }
        GroupMutation {
            org_id: org_id.to_string(),
            canonical_external_id: self.canonical.external_id.clone(),
            removals: self
                .removals
                .iter()
                .map(|r| RecordRemoval {
                    record_id: r.record.record_id,
                    external_id: r.record.external_id.clone(),
                    image_ids: r.image_ids.clone(),
                    scrape_log_ids: r.scrape_log_ids.clone(),
                })
                .collect(),
            favorite_repoints,
            favorite_merges,
        }
    }

    pub fn removed_external_ids(&self) -> Vec<String> {
        self.removals.iter().map(|r| r.record.external_id.clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmbiguousGroup {
    pub identity: IdentifyingFields,
    pub current_ids: Vec<String>,
    pub legacy_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "issue", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanIssue {
    #[error("{} current-scheme records share one identity: {current_ids:?}", .current_ids.len())]
    IdentityAmbiguous {
        identity: IdentifyingFields,
        current_ids: Vec<String>,
    },
    #[error("{external_id} uses legacy scheme {scheme} and has no current-scheme counterpart")]
    UnresolvedLegacy { external_id: String, scheme: String },
    #[error("{external_id} matches no known scheme of its organization")]
    UnknownScheme { external_id: String },
}

impl PlanIssue {
    pub fn severity(&self) -> IssueSeverity {
        match self {
            PlanIssue::IdentityAmbiguous { .. } => IssueSeverity::Error,
            PlanIssue::UnresolvedLegacy { .. } | PlanIssue::UnknownScheme { .. } => IssueSeverity::Warning,
        }
    }
}

/// Dry-run result for one organization. Holds no wall-clock values, so planning an unchanged
/// store twice gives the same checksum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationPlan {
    pub org_id: String,
    pub baseline: TableCounts,
    pub groups_total: usize,
    pub resolvable: usize,
    pub ambiguous: usize,
    /// Groups made only of legacy ids. Lone legacy records are not counted here; each one
    /// appears in `issues` as `UnresolvedLegacy`.
    pub unresolved_legacy: usize,
    pub unknown_ids: Vec<String>,
    pub per_group: Vec<PlannedGroup>,
    pub ambiguous_groups: Vec<AmbiguousGroup>,
    pub issues: Vec<PlanIssue>,
    pub checksum: String,
}

impl MigrationPlan {
    /// SHA-256 over the JSON encoding of every field except `checksum`.
    pub fn compute_checksum(&self) -> Result<String, serde_json::Error> {
        let mut unsealed = self.clone();
        unsealed.checksum.clear();
        let bytes = serde_json::to_vec(&unsealed)?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(hex::encode(hasher.finalize()))
    }

    pub fn total_removed(&self) -> TableCounts {
        self.per_group
            .iter()
            .fold(TableCounts::default(), |acc, g| acc.saturating_add(&g.dependents_removed_count))
    }

    /// Counts the organization should have once every resolvable group is applied.
    pub fn expected_after(&self) -> TableCounts {
        self.baseline
            .checked_sub(&self.total_removed())
            .unwrap_or_default()
    }

    pub fn has_errors(&self) -> bool {
        self.issues.iter().any(|i| i.severity() == IssueSeverity::Error)
    }
}

fn plan_group(group: &DuplicateGroup, canonical_index: usize) -> PlannedGroup {
    let canonical = &group.members[canonical_index];

    // user_ref -> favorite that survives on the canonical record
    let mut kept: HashMap<&str, i64> = canonical
        .dependents
        .favorites
        .iter()
        .map(|f| (f.user_ref.as_str(), f.favorite_id))
        .collect();

    let mut removals = Vec::new();
    let mut totals = TableCounts::default();
    for (index, member) in group.members.iter().enumerate() {
        if index == canonical_index {
            continue;
        }
        let mut favorites = Vec::with_capacity(member.dependents.favorites.len());
        for favorite in &member.dependents.favorites {
            match kept.get(favorite.user_ref.as_str()) {
                Some(&kept_favorite_id) => {
                    totals.favorites += 1;
                    favorites.push(FavoriteAction::Merge {
                        favorite_id: favorite.favorite_id,
                        user_ref: favorite.user_ref.clone(),
                        kept_favorite_id,
                    });
                }
                None => {
                    kept.insert(favorite.user_ref.as_str(), favorite.favorite_id);
                    favorites.push(FavoriteAction::Repoint {
                        favorite_id: favorite.favorite_id,
                        user_ref: favorite.user_ref.clone(),
                    });
                }
            }
        }
        totals.animals += 1;
        totals.images += member.dependents.image_ids.len() as u64;
        totals.scrape_logs += member.dependents.scrape_log_ids.len() as u64;
        removals.push(PlannedRemoval {
            record: RecordRef::from(&member.record),
            classification: member.classification.clone(),
            image_ids: member.dependents.image_ids.clone(),
            scrape_log_ids: member.dependents.scrape_log_ids.clone(),
            favorites,
        });
    }

    PlannedGroup {
        identity: group.identity.clone(),
        canonical: RecordRef::from(&canonical.record),
        removals,
        dependents_removed_count: totals,
    }
}

/// Turn a grouping into a sealed plan. Pure: reads nothing beyond its arguments.
pub fn plan(snapshot: &OrgSnapshot, grouping: &Grouping) -> Result<MigrationPlan, ReconcileError> {
    let mut per_group = Vec::new();
    let mut ambiguous_groups = Vec::new();
    let mut issues = Vec::new();
    let mut unresolved_groups = 0usize;

    for group in &grouping.groups {
        let current: Vec<usize> = group
            .members
            .iter()
            .enumerate()
            .filter(|(_, m)| matches!(m.classification, Classification::Current { .. }))
            .map(|(i, _)| i)
            .collect();
        match current.as_slice() {
            [] => unresolved_groups += 1,
            [canonical] => per_group.push(plan_group(group, *canonical)),
            _ => {
                let current_ids: Vec<String> = current
                    .iter()
                    .map(|&i| group.members[i].record.external_id.clone())
                    .collect();
                issues.push(PlanIssue::IdentityAmbiguous {
                    identity: group.identity.clone(),
                    current_ids: current_ids.clone(),
                });
                ambiguous_groups.push(AmbiguousGroup {
                    identity: group.identity.clone(),
                    current_ids,
                    legacy_ids: group
                        .members
                        .iter()
                        .filter(|m| m.classification.legacy_scheme().is_some())
                        .map(|m| m.record.external_id.clone())
                        .collect(),
                });
            }
        }
    }

    issues.extend(grouping.unresolved_legacy.iter().map(|w| PlanIssue::UnresolvedLegacy {
        external_id: w.external_id.clone(),
        scheme: w.scheme.clone(),
    }));
    issues.extend(grouping.unknown.iter().map(|id| PlanIssue::UnknownScheme {
        external_id: id.clone(),
    }));

    let mut plan = MigrationPlan {
        org_id: grouping.org_id.clone(),
        baseline: snapshot.counts(),
        groups_total: grouping.groups.len(),
        resolvable: per_group.len(),
        ambiguous: ambiguous_groups.len(),
        unresolved_legacy: unresolved_groups,
        unknown_ids: grouping.unknown.clone(),
        per_group,
        ambiguous_groups,
        issues,
        checksum: String::new(),
    };
    plan.checksum = plan.compute_checksum()?;
    Ok(plan)
}
