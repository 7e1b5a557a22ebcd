//! Core event model, change fingerprints and identity namespacing for ReMap.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "remap-core";

/// Separator between tag and provider-local id in a global identifier.
pub const NAMESPACE_SEPARATOR: char = '_';

const FINGERPRINT_FIELD_SEPARATOR: &[u8] = b"\x1f";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("invalid provider tag {0:?}: expected 1-32 ASCII letters, digits or '-'")]
    InvalidProviderTag(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lon: f64,
    pub lat: f64,
}

impl Coordinates {
    pub fn new(lon: f64, lat: f64) -> Self {
        Self { lon, lat }
    }

    /// Returns `None` for NaN or out-of-range values.
    pub fn checked(lon: f64, lat: f64) -> Option<Self> {
        let coords = Self { lon, lat };
        coords.is_valid().then_some(coords)
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }
}

/// Normalized event as published by one provider feed.
///
/// Records are never mutated in place once sealed: change detection always compares the
/// fingerprint of an old record against the fingerprint of its successor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub venue: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub coordinates: Option<Coordinates>,
    #[serde(default)]
    pub start_date: Option<NaiveDateTime>,
    #[serde(default)]
    pub end_date: Option<NaiveDateTime>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub credits: Option<String>,
    #[serde(default)]
    pub fingerprint: String,
}

impl EventRecord {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            category: None,
            city: None,
            venue: None,
            address: None,
            coordinates: None,
            start_date: None,
            end_date: None,
            url: None,
            image_url: None,
            credits: None,
            fingerprint: String::new(),
        }
    }

    /// Stable SHA-256 over every mutable field. The identifier is not part of it.
    pub fn compute_fingerprint(&self) -> String {
        let coords = self
            .coordinates
            .map(|c| format!("{}|{}", c.lon, c.lat))
            .unwrap_or_default();
        let fmt_ts = |ts: &Option<NaiveDateTime>| {
            ts.map(|t| t.format("%Y-%m-%dT%H:%M:%S").to_string())
                .unwrap_or_default()
        };
        let start = fmt_ts(&self.start_date);
        let end = fmt_ts(&self.end_date);
        let fields = [
            self.title.as_str(),
            self.description.as_str(),
            self.category.as_deref().unwrap_or_default(),
            self.city.as_deref().unwrap_or_default(),
            self.venue.as_deref().unwrap_or_default(),
            self.address.as_deref().unwrap_or_default(),
            coords.as_str(),
            start.as_str(),
            end.as_str(),
            self.url.as_deref().unwrap_or_default(),
            self.image_url.as_deref().unwrap_or_default(),
            self.credits.as_deref().unwrap_or_default(),
        ];

        let mut hasher = Sha256::new();
        for (idx, field) in fields.iter().enumerate() {
            if idx > 0 {
                hasher.update(FINGERPRINT_FIELD_SEPARATOR);
            }
            hasher.update(field.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Fix the fingerprint over the current field values.
    pub fn sealed(mut self) -> Self {
        self.fingerprint = self.compute_fingerprint();
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Attach resolved coordinates. The fingerprint keeps describing the feed content.
    pub fn with_coordinates(mut self, coordinates: Coordinates) -> Self {
        self.coordinates = Some(coordinates);
        self
    }

    pub fn has_coordinates(&self) -> bool {
        self.coordinates.map(|c| c.is_valid()).unwrap_or(false)
    }

    /// Free-text address used when coordinates must be resolved.
    pub fn geocode_query(&self) -> Option<String> {
        let non_empty = |v: &Option<String>| {
            v.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
        };
        if let Some(address) = non_empty(&self.address) {
            let city = non_empty(&self.city);
            return Some(match city {
                Some(city) if !address.to_lowercase().contains(&city.to_lowercase()) => {
                    format!("{address}, {city}")
                }
                _ => address,
            });
        }
        match (non_empty(&self.venue), non_empty(&self.city)) {
            (Some(venue), Some(city)) => Some(format!("{venue}, {city}")),
            (Some(venue), None) => Some(venue),
            (None, Some(city)) => Some(city),
            (None, None) => None,
        }
    }

    /// Text handed to the embedding collaborator.
    pub fn embedding_text(&self) -> String {
        let mut text = self.title.trim().to_string();
        let description = self.description.trim();
        if !description.is_empty() && description != text {
            if !text.is_empty() {
                text.push_str(". ");
            }
            text.push_str(description);
        }
        text.chars().take(1000).collect()
    }
}

/// One provider feed as fetched at a point in time, in feed order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub provider: String,
    pub fetched_at: DateTime<Utc>,
    pub records: Vec<EventRecord>,
}

impl Snapshot {
    pub fn new(provider: impl Into<String>, fetched_at: DateTime<Utc>, records: Vec<EventRecord>) -> Self {
        Self {
            provider: provider.into(),
            fetched_at,
            records,
        }
    }

    pub fn empty(provider: impl Into<String>) -> Self {
        Self::new(provider, DateTime::<Utc>::default(), Vec::new())
    }
}

/// Record rejected at the ingestion boundary or by the differ.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MalformedRecord {
    /// Zero-based position in the feed.
    pub position: usize,
    pub id: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaKind {
    Added,
    Changed,
    Removed,
    Unchanged,
}

impl DeltaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeltaKind::Added => "added",
            DeltaKind::Changed => "changed",
            DeltaKind::Removed => "removed",
            DeltaKind::Unchanged => "unchanged",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaEntry {
    pub id: String,
    pub kind: DeltaKind,
    pub old_fingerprint: Option<String>,
    pub new_fingerprint: Option<String>,
}

/// Counts derived from a delta sequence; never reported independently of it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaSummary {
    pub added: usize,
    pub changed: usize,
    pub removed: usize,
    pub unchanged: usize,
    pub skipped: usize,
}

impl DeltaSummary {
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a DeltaEntry>, skipped: usize) -> Self {
        let mut summary = Self {
            skipped,
            ..Self::default()
        };
        for entry in entries {
            match entry.kind {
                DeltaKind::Added => summary.added += 1,
                DeltaKind::Changed => summary.changed += 1,
                DeltaKind::Removed => summary.removed += 1,
                DeltaKind::Unchanged => summary.unchanged += 1,
            }
        }
        summary
    }

    pub fn total(&self) -> usize {
        self.added + self.changed + self.removed + self.unchanged
    }

    /// Entries that require an index mutation.
    pub fn actionable(&self) -> usize {
        self.added + self.changed + self.removed
    }
}

/// Fixed per-provider prefix that makes provider-local ids globally unique.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProviderTag(String);

impl ProviderTag {
    pub fn new(tag: impl Into<String>) -> Result<Self, CoreError> {
        let tag = tag.into();
        let valid = !tag.is_empty()
            && tag.len() <= 32
            && tag.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
        if valid {
            Ok(Self(tag))
        } else {
            Err(CoreError::InvalidProviderTag(tag))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn prefix(&self) -> String {
        format!("{}{}", self.0, NAMESPACE_SEPARATOR)
    }

    /// Global identifier for a provider-local one. Ids already carrying the prefix pass
    /// through untouched, so `namespace(namespace(x)) == namespace(x)`.
    pub fn namespace(&self, local_id: &str) -> String {
        let local_id = local_id.trim();
        if self.is_namespaced(local_id) {
            local_id.to_string()
        } else {
            format!("{}{}", self.prefix(), local_id)
        }
    }

    pub fn is_namespaced(&self, id: &str) -> bool {
        id.starts_with(&self.prefix())
    }

    /// Provider-local part of a global identifier owned by this tag.
    pub fn local_part<'a>(&self, global_id: &'a str) -> Option<&'a str> {
        global_id.strip_prefix(&self.prefix())
    }
}

impl std::fmt::Display for ProviderTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ProviderTag {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ProviderTag> for String {
    fn from(tag: ProviderTag) -> Self {
        tag.0
    }
}

/// Pure namespacing function over (tag, local id).
pub fn namespace(tag: &ProviderTag, local_id: &str) -> String {
    tag.namespace(local_id)
}

/// Deterministic index point id for a global identifier.
pub fn point_id(global_id: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, global_id.as_bytes())
}
