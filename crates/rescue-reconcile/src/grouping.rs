use std::collections::{BTreeMap, BTreeSet};

use rescue_core::{AnimalRecord, Favorite, OrgSnapshot};
use rescue_identity::{Classification, IdentifyingFields, OrganizationRegistry, SchemeKind};
use serde::Serialize;

use crate::ReconcileError;

/// Rows that reference one record and must follow it through a migration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Dependents {
    pub image_ids: Vec<i64>,
    pub scrape_log_ids: Vec<i64>,
    pub favorites: Vec<Favorite>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupMember {
    pub record: AnimalRecord,
    pub classification: Classification,
    pub dependents: Dependents,
}

/// Records of one organization that describe the same animal under different id schemes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateGroup {
    pub identity: IdentifyingFields,
    /// Ordered by `record_id`.
    pub members: Vec<GroupMember>,
}

impl DuplicateGroup {
    pub fn current_members(&self) -> impl Iterator<Item = &GroupMember> {
        self.members
            .iter()
            .filter(|m| m.classification.kind() == SchemeKind::Current)
    }

    /// No member carries a current-scheme id, so there is nothing to keep.
    pub fn is_unresolved_legacy(&self) -> bool {
        self.current_members().next().is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnresolvedLegacyWarning {
    pub external_id: String,
    pub scheme: String,
    pub identity: IdentifyingFields,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Grouping {
    pub org_id: String,
    pub groups: Vec<DuplicateGroup>,
    pub unresolved_legacy: Vec<UnresolvedLegacyWarning>,
    /// Ids no scheme of this organization recognizes. Never grouped.
    pub unknown: Vec<String>,
}

fn dependents_of(snapshot: &OrgSnapshot, external_id: &str) -> Dependents {
    Dependents {
        image_ids: snapshot.images_for(external_id).map(|i| i.image_id).collect(),
        scrape_log_ids: snapshot.scrape_logs_for(external_id).map(|l| l.log_id).collect(),
        favorites: snapshot.favorites_for(external_id).cloned().collect(),
    }
}

fn spans_identity_eras(members: &[(&AnimalRecord, Classification)]) -> bool {
    let current = members
        .iter()
        .filter(|(_, c)| c.kind() == SchemeKind::Current)
        .count();
    let legacy_schemes: BTreeSet<&str> = members
        .iter()
        .filter_map(|(_, c)| c.legacy_scheme())
        .collect();
    (!legacy_schemes.is_empty() && current > 0) || legacy_schemes.len() >= 2
}

/// Bucket one organization's records by exact identifying fields and keep the buckets that mix
/// identifier schemes.
pub fn group(snapshot: &OrgSnapshot, registry: &OrganizationRegistry) -> Result<Grouping, ReconcileError> {
    let org = registry
        .get(&snapshot.org_id)
        .ok_or_else(|| ReconcileError::UnknownOrganization(snapshot.org_id.clone()))?;

    let foreign: BTreeSet<&str> = snapshot
        .records
        .iter()
        .map(|r| r.org_id.as_str())
        .filter(|o| *o != snapshot.org_id)
        .collect();
    if !foreign.is_empty() {
        return Err(ReconcileError::MixedOrganizations {
            expected: snapshot.org_id.clone(),
            found: foreign.into_iter().map(ToString::to_string).collect(),
        });
    }

    let mut records: Vec<&AnimalRecord> = snapshot.records.iter().collect();
    records.sort_by_key(|r| r.record_id);

    let mut unknown = Vec::new();
    let mut buckets: BTreeMap<IdentifyingFields, Vec<(&AnimalRecord, Classification)>> = BTreeMap::new();
    for record in records {
        let classification = org.classify(&record.external_id);
        if classification == Classification::Unknown {
            unknown.push(record.external_id.clone());
            continue;
        }
        buckets
            .entry(IdentifyingFields::from_record(record, &org.rules))
            .or_default()
            .push((record, classification));
    }

    let mut groups = Vec::new();
    let mut unresolved_legacy = Vec::new();
    for (identity, members) in buckets {
        let has_current = members.iter().any(|(_, c)| c.kind() == SchemeKind::Current);
        if !has_current {
            for (record, classification) in &members {
                if let Some(scheme) = classification.legacy_scheme() {
                    unresolved_legacy.push(UnresolvedLegacyWarning {
                        external_id: record.external_id.clone(),
                        scheme: scheme.to_string(),
                        identity: identity.clone(),
                    });
                }
            }
        }

        if !spans_identity_eras(&members) {
            continue;
        }
        let members = members
            .into_iter()
            .map(|(record, classification)| GroupMember {
                dependents: dependents_of(snapshot, &record.external_id),
                record: record.clone(),
                classification,
            })
            .collect();
        groups.push(DuplicateGroup { identity, members });
    }

    Ok(Grouping {
        org_id: snapshot.org_id.clone(),
        groups,
        unresolved_legacy,
        unknown,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rescue_core::{AnimalImage, ScrapeLog};

    pub(crate) const REGISTRY_YAML: &str = r#"
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
      - name: bare-slug
        pattern: "tse-[a-z]+(?:-[a-z]+)*"
  - org_id: tierschutz-europa-sued
    prefix: tse-sued
"#;

    pub(crate) fn registry() -> OrganizationRegistry {
        OrganizationRegistry::from_yaml_str(REGISTRY_YAML).expect("registry")
    }

    pub(crate) fn record(id: i64, org: &str, external_id: &str, name: &str) -> AnimalRecord {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().expect("ts");
        AnimalRecord {
            record_id: id,
            org_id: org.to_string(),
            external_id: external_id.to_string(),
            name: name.to_string(),
            animal_type: Some("dog".into()),
            breed: None,
            sex: None,
            age_text: None,
            adoption_url: None,
            primary_image_url: None,
            original_image_url: None,
            status: "available".into(),
            created_at: at,
            updated_at: at,
        }
    }

    pub(crate) fn pit_snapshot() -> OrgSnapshot {
        let mut snapshot = OrgSnapshot::empty("pit");
        snapshot.records = vec![
            record(1, "pit", "pit-cody", "Cody"),
            record(2, "pit", "pit-cody-95bc94", "Cody"),
            record(3, "pit", "pit-bella", "Bella"),
        ];
        snapshot.images = vec![
            AnimalImage {
                image_id: 10,
                org_id: "pit".into(),
                external_id: "pit-cody".into(),
                image_url: "https://img.example/cody-old.jpg".into(),
                original_image_url: None,
                position: 0,
            },
            AnimalImage {
                image_id: 11,
                org_id: "pit".into(),
                external_id: "pit-cody-95bc94".into(),
                image_url: "https://img.example/cody.jpg".into(),
                original_image_url: None,
                position: 0,
            },
        ];
        snapshot.scrape_logs = vec![ScrapeLog {
            log_id: 20,
            org_id: "pit".into(),
            external_id: "pit-cody".into(),
            scraped_at: Utc.with_ymd_and_hms(2026, 2, 1, 6, 0, 0).single().expect("ts"),
            outcome: "ok".into(),
        }];
        snapshot
    }

    #[test]
    fn legacy_and_current_cody_form_one_group() {
        let grouping = group(&pit_snapshot(), &registry()).expect("group");
        assert_eq!(grouping.groups.len(), 1);
        let ids: Vec<&str> = grouping.groups[0]
            .members
            .iter()
            .map(|m| m.record.external_id.as_str())
            .collect();
        assert_eq!(ids, ["pit-cody", "pit-cody-95bc94"]);
        assert_eq!(grouping.groups[0].members[0].dependents.image_ids, [10]);
        assert_eq!(grouping.groups[0].members[0].dependents.scrape_log_ids, [20]);
        assert!(!grouping.groups[0].is_unresolved_legacy());
    }

    #[test]
    fn singleton_legacy_record_is_a_warning_not_a_group() {
        let grouping = group(&pit_snapshot(), &registry()).expect("group");
        assert_eq!(grouping.unresolved_legacy.len(), 1);
        assert_eq!(grouping.unresolved_legacy[0].external_id, "pit-bella");
        assert_eq!(grouping.unresolved_legacy[0].scheme, "bare-slug");
    }

    #[test]
    fn different_names_never_share_a_group() {
        let mut snapshot = OrgSnapshot::empty("pit");
        snapshot.records = vec![
            record(1, "pit", "pit-cody", "Cody"),
            record(2, "pit", "pit-codie-0a1b2c", "Codie"),
        ];
        let grouping = group(&snapshot, &registry()).expect("group");
        assert!(grouping.groups.is_empty());
    }

    #[test]
    fn unknown_ids_are_listed_and_left_alone() {
        let mut snapshot = OrgSnapshot::empty("pit");
        snapshot.records = vec![
            record(1, "pit", "cody-without-prefix", "Cody"),
            record(2, "pit", "pit-cody-95bc94", "Cody"),
        ];
        let grouping = group(&snapshot, &registry()).expect("group");
        assert_eq!(grouping.unknown, ["cody-without-prefix"]);
        assert!(grouping.groups.is_empty());
    }

    #[test]
    fn two_legacy_schemes_group_without_a_current_member() {
        let mut snapshot = OrgSnapshot::empty("tierschutz-europa");
        snapshot.records = vec![
            record(1, "tierschutz-europa", "tse-4711", "Rex"),
            record(2, "tierschutz-europa", "tse-rex", "Rex"),
        ];
        let grouping = group(&snapshot, &registry()).expect("group");
        assert_eq!(grouping.groups.len(), 1);
        assert!(grouping.groups[0].is_unresolved_legacy());
        assert_eq!(grouping.unresolved_legacy.len(), 2);
    }

    #[test]
    fn record_org_wins_over_a_longer_foreign_prefix() {
        let registry = registry();
        let tse = registry.get("tierschutz-europa").expect("tse");
        let current = tse.external_id_for(&IdentifyingFields::new("Sued", Some("dog"), None));
        assert!(current.starts_with("tse-sued-dog-"));

        let mut snapshot = OrgSnapshot::empty("tierschutz-europa");
        snapshot.records = vec![
            record(1, "tierschutz-europa", "tse-sued", "Sued"),
            record(2, "tierschutz-europa", &current, "Sued"),
        ];
        let grouping = group(&snapshot, &registry).expect("group");
        assert!(grouping.unknown.is_empty());
        assert!(grouping.unresolved_legacy.is_empty());
        assert_eq!(grouping.groups.len(), 1);
        let ids: Vec<&str> = grouping.groups[0]
            .members
            .iter()
            .map(|m| m.record.external_id.as_str())
            .collect();
        assert_eq!(ids, ["tse-sued", current.as_str()]);
    }

    #[test]
    fn refuses_mixed_and_unknown_organizations() {
        let mut mixed = pit_snapshot();
        mixed.records.push(record(9, "tierschutz-europa", "tse-rex", "Rex"));
        assert!(matches!(
            group(&mixed, &registry()),
            Err(ReconcileError::MixedOrganizations { .. })
        ));

        let stranger = OrgSnapshot::empty("nowhere");
        assert!(matches!(
            group(&stranger, &registry()),
            Err(ReconcileError::UnknownOrganization(_))
        ));
    }
}
