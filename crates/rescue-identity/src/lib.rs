//! Stable external identifiers for scraped animals, and recognition of the schemes that produced
//! identifiers already in the store.

use std::collections::HashSet;
use std::path::Path;

use anyhow::Context;
use regex::Regex;
use rescue_core::{AnimalDraft, AnimalRecord};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const CRATE_NAME: &str = "rescue-identity";

/// Hex characters kept from the SHA-256 digest.
pub const DIGEST_HEX_WIDTH: usize = 6;

const FIELD_SEPARATOR: &str = "|";

/// Lower-case, trim, and fold whitespace runs to a single space.
pub fn normalize_field(input: &str) -> String {
    input
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// URL-safe segment: ASCII alphanumerics kept, every other run becomes one `-`.
pub fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut pending_dash = false;
    for ch in input.chars().flat_map(char::to_lowercase) {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch);
        } else {
            pending_dash = true;
        }
    }
    if slug.is_empty() {
        "unnamed".to_string()
    } else {
        slug
    }
}

/// Optional organization-specific field that joins name and type in the identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disambiguator {
    Breed,
    Sex,
    AgeText,
}

/// Which display fields feed an organization's identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IdentityRules {
    #[serde(default)]
    pub include_type_segment: bool,
    #[serde(default)]
    pub disambiguator: Option<Disambiguator>,
}

/// The normalized subset of display fields an external id is derived from.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IdentifyingFields {
    pub name: String,
    pub animal_type: Option<String>,
    pub disambiguator: Option<String>,
}

fn normalized_option(value: Option<&str>) -> Option<String> {
    value.map(normalize_field).filter(|v| !v.is_empty())
}

impl IdentifyingFields {
    pub fn new(name: &str, animal_type: Option<&str>, disambiguator: Option<&str>) -> Self {
        Self {
            name: normalize_field(name),
            animal_type: normalized_option(animal_type),
            disambiguator: normalized_option(disambiguator),
        }
    }

    fn from_parts(
        rules: &IdentityRules,
        name: &str,
        animal_type: Option<&str>,
        breed: Option<&str>,
        sex: Option<&str>,
        age_text: Option<&str>,
    ) -> Self {
        let disambiguator = match rules.disambiguator {
            Some(Disambiguator::Breed) => breed,
            Some(Disambiguator::Sex) => sex,
            Some(Disambiguator::AgeText) => age_text,
            None => None,
        };
        let animal_type = if rules.include_type_segment { animal_type } else { None };
        Self::new(name, animal_type, disambiguator)
    }

    /// Recompute the identity of a stored record from its current display fields.
    pub fn from_record(record: &AnimalRecord, rules: &IdentityRules) -> Self {
        Self::from_parts(
            rules,
            &record.name,
            record.animal_type.as_deref(),
            record.breed.as_deref(),
            record.sex.as_deref(),
            record.age_text.as_deref(),
        )
    }

    pub fn from_draft(draft: &AnimalDraft, rules: &IdentityRules) -> Self {
        Self::from_parts(
            rules,
            &draft.name,
            draft.animal_type.as_deref(),
            draft.breed.as_deref(),
            draft.sex.as_deref(),
            draft.age_text.as_deref(),
        )
    }

    /// Each field is written as `{byte length}:{value}` so no value can borrow
    /// characters from its neighbour.
    fn digest_input(&self) -> String {
        [
            self.name.as_str(),
            self.animal_type.as_deref().unwrap_or_default(),
            self.disambiguator.as_deref().unwrap_or_default(),
        ]
        .iter()
        .map(|field| format!("{}:{}", field.len(), field))
        .collect::<Vec<_>>()
        .join(FIELD_SEPARATOR)
    }

    /// Truncated SHA-256 of the normalized fields.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.digest_input().as_bytes());
        let mut hex = hex::encode(hasher.finalize());
        hex.truncate(DIGEST_HEX_WIDTH);
        hex
    }
}

/// `{org_prefix}-{slug(name)}[-{slug(type)}]-{digest}`.
pub fn generate_external_id(org_prefix: &str, fields: &IdentifyingFields) -> String {
    let mut id = format!("{}-{}", org_prefix, slugify(&fields.name));
    if let Some(animal_type) = &fields.animal_type {
        id.push('-');
        id.push_str(&slugify(animal_type));
    }
    id.push('-');
    id.push_str(&fields.digest());
    id
}

/// Stamp a scraper draft with the organization's current-scheme identifier.
pub fn assign_external_id(org: &OrganizationIdentity, draft: &mut AnimalDraft) -> String {
    let fields = IdentifyingFields::from_draft(draft, &org.rules);
    draft.external_id = generate_external_id(&org.prefix, &fields);
    draft.external_id.clone()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchemeKind {
    Legacy,
    Current,
    Unknown,
}

/// Which identifier scheme produced a stored external id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Classification {
    Current { digest: String },
    Legacy { scheme: String },
    Unknown,
}

impl Classification {
    pub fn kind(&self) -> SchemeKind {
        match self {
            Classification::Current { .. } => SchemeKind::Current,
            Classification::Legacy { .. } => SchemeKind::Legacy,
            Classification::Unknown => SchemeKind::Unknown,
        }
    }

    pub fn legacy_scheme(&self) -> Option<&str> {
        match self {
            Classification::Legacy { scheme } => Some(scheme),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LegacyScheme {
    pub name: String,
    pattern: Regex,
}

impl LegacyScheme {
    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }
}

/// One organization's prefix, identity rules, and historical id formats.
#[derive(Debug, Clone)]
pub struct OrganizationIdentity {
    pub org_id: String,
    pub prefix: String,
    pub rules: IdentityRules,
    pub legacy_schemes: Vec<LegacyScheme>,
    current_pattern: Regex,
}

impl OrganizationIdentity {
    pub fn classify(&self, external_id: &str) -> Classification {
        if let Some(caps) = self.current_pattern.captures(external_id) {
            return Classification::Current {
                digest: caps["digest"].to_string(),
            };
        }
        self.legacy_schemes
            .iter()
            .find(|scheme| scheme.pattern.is_match(external_id))
            .map(|scheme| Classification::Legacy {
                scheme: scheme.name.clone(),
            })
            .unwrap_or(Classification::Unknown)
    }

    pub fn external_id_for(&self, fields: &IdentifyingFields) -> String {
        generate_external_id(&self.prefix, fields)
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("parsing organization table: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("organization {org_id} has invalid prefix {prefix:?}")]
    InvalidPrefix { org_id: String, prefix: String },
    #[error("organization {0} is listed more than once")]
    DuplicateOrganization(String),
    #[error("prefix {0:?} is claimed by more than one organization")]
    DuplicatePrefix(String),
    #[error("legacy scheme {scheme} of {org_id} has an invalid pattern: {source}")]
    InvalidPattern {
        org_id: String,
        scheme: String,
        #[source]
        source: regex::Error,
    },
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    organizations: Vec<OrganizationEntry>,
}

#[derive(Debug, Deserialize)]
struct OrganizationEntry {
    org_id: String,
    #[serde(default)]
    prefix: Option<String>,
    #[serde(flatten)]
    rules: IdentityRules,
    #[serde(default)]
    legacy_schemes: Vec<LegacySchemeEntry>,
}

#[derive(Debug, Deserialize)]
struct LegacySchemeEntry {
    name: String,
    pattern: String,
}

fn valid_prefix(prefix: &str) -> bool {
    !prefix.is_empty()
        && !prefix.starts_with('-')
        && !prefix.ends_with('-')
        && prefix
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

impl OrganizationEntry {
    fn compile(self) -> Result<OrganizationIdentity, RegistryError> {
        let prefix = self.prefix.unwrap_or_else(|| self.org_id.clone());
        if !valid_prefix(&prefix) {
            return Err(RegistryError::InvalidPrefix {
                org_id: self.org_id,
                prefix,
            });
        }

        let current = format!(
            r"^{}-(?P<slug>[a-z0-9]+(?:-[a-z0-9]+)*)-(?P<digest>[0-9a-f]{{{}}})$",
            regex::escape(&prefix),
            DIGEST_HEX_WIDTH
        );
        let current_pattern = Regex::new(&current).map_err(|source| RegistryError::InvalidPattern {
            org_id: self.org_id.clone(),
            scheme: "current".to_string(),
            source,
        })?;

        let mut legacy_schemes = Vec::with_capacity(self.legacy_schemes.len());
        for entry in self.legacy_schemes {
            // Anchored so a pattern can never match a fragment of a longer id.
            let pattern = Regex::new(&format!("^(?:{})$", entry.pattern)).map_err(|source| {
                RegistryError::InvalidPattern {
                    org_id: self.org_id.clone(),
                    scheme: entry.name.clone(),
                    source,
                }
            })?;
            legacy_schemes.push(LegacyScheme {
                name: entry.name,
                pattern,
            });
        }

        Ok(OrganizationIdentity {
            org_id: self.org_id,
            prefix,
            rules: self.rules,
            legacy_schemes,
            current_pattern,
        })
    }
}

/// Enumerated `(organization, legacy pattern)` table consulted by the classifier.
#[derive(Debug, Clone, Default)]
pub struct OrganizationRegistry {
    organizations: Vec<OrganizationIdentity>,
}

impl OrganizationRegistry {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, RegistryError> {
        let file: RegistryFile = serde_yaml::from_str(yaml)?;
        let mut org_ids = HashSet::new();
        let mut prefixes = HashSet::new();
        let mut organizations = Vec::with_capacity(file.organizations.len());
        for entry in file.organizations {
            let org = entry.compile()?;
            if !org_ids.insert(org.org_id.clone()) {
                return Err(RegistryError::DuplicateOrganization(org.org_id));
            }
            if !prefixes.insert(org.prefix.clone()) {
                return Err(RegistryError::DuplicatePrefix(org.prefix));
            }
            organizations.push(org);
        }
        Ok(Self { organizations })
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn get(&self, org_id: &str) -> Option<&OrganizationIdentity> {
        self.organizations.iter().find(|o| o.org_id == org_id)
    }

    pub fn organizations(&self) -> &[OrganizationIdentity] {
        &self.organizations
    }

    /// Owning organization of an id: the longest prefix followed by `-`.
    pub fn organization_for(&self, external_id: &str) -> Option<&OrganizationIdentity> {
        self.organizations
            .iter()
            .filter(|o| {
                external_id
                    .strip_prefix(o.prefix.as_str())
                    .is_some_and(|rest| rest.starts_with('-'))
            })
            .max_by_key(|o| o.prefix.len())
    }

    pub fn classify(&self, external_id: &str) -> Classification {
        self.organization_for(external_id)
            .map(|org| org.classify(external_id))
            .unwrap_or(Classification::Unknown)
    }
}
