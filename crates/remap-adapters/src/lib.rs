//! Feed adapter contracts + per-format normalizers.
//!
//! Every provider feed, whatever its wire shape, leaves this crate as a list of sealed
//! [`EventRecord`]s plus the records that could not be accepted ([`MalformedRecord`]).
//! A feed that cannot be read or decoded at all is an [`AdapterError`].

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use remap_core::{Coordinates, EventRecord, MalformedRecord};
use remap_storage::{ArtifactStore, FetchError, HttpFetcher, StoredArtifact};
use scraper::Html;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

mod remap_json;
mod ticketmaster;
mod ticketsqueeze;

pub use remap_json::RemapJsonAdapter;
pub use ticketmaster::TicketmasterAdapter;
pub use ticketsqueeze::TicketsqueezeCsvAdapter;

pub const CRATE_NAME: &str = "remap-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedFormat {
    Ticketmaster,
    RemapJson,
    TicketsqueezeCsv,
}

impl FeedFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedFormat::Ticketmaster => "ticketmaster",
            FeedFormat::RemapJson => "remap_json",
            FeedFormat::TicketsqueezeCsv => "ticketsqueeze_csv",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            FeedFormat::Ticketmaster | FeedFormat::RemapJson => "json",
            FeedFormat::TicketsqueezeCsv => "csv",
        }
    }
}

impl std::fmt::Display for FeedFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a provider publishes its feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedLocation {
    Url(String),
    File(PathBuf),
}

impl std::fmt::Display for FeedLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeedLocation::Url(url) => f.write_str(url),
            FeedLocation::File(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RawFeed {
    pub provider: String,
    pub format: FeedFormat,
    pub source: String,
    pub fetched_at: DateTime<Utc>,
    pub body: Vec<u8>,
    pub archived: Option<StoredArtifact>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedFeed {
    pub records: Vec<EventRecord>,
    pub malformed: Vec<MalformedRecord>,
}

impl ParsedFeed {
    fn accept(&mut self, record: EventRecord) {
        self.records.push(record.sealed());
    }

    fn reject(&mut self, position: usize, id: Option<String>, reason: impl Into<String>) {
        let reason = reason.into();
        debug!(position, id = id.as_deref().unwrap_or("<none>"), %reason, "feed record quarantined");
        self.malformed.push(MalformedRecord { position, id, reason });
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("fetching feed {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: FetchError,
    },
    #[error("reading feed file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{format} feed could not be decoded: {message}")]
    Decode { format: FeedFormat, message: String },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Affiliate link wrapping for ticketing URLs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AffiliateConfig {
    pub base_url: String,
    pub member_id: Option<String>,
}

impl AffiliateConfig {
    /// Route `url` through the affiliate redirect unless it already carries the member id.
    pub fn wrap(&self, url: &str) -> String {
        let member = self.member_id.as_deref().map(str::trim).unwrap_or_default();
        if url.is_empty() || member.is_empty() || self.base_url.is_empty() || url.contains(member) {
            return url.to_string();
        }
        format!("{}{}", self.base_url, urlencoding::encode(url))
    }
}

/// Provider-level settings an adapter needs while normalizing.
#[derive(Debug, Clone, Default)]
pub struct AdapterContext {
    pub provider: String,
    pub credits: Option<String>,
    pub affiliate: AffiliateConfig,
}

#[async_trait]
pub trait FeedAdapter: Send + Sync {
    fn format(&self) -> FeedFormat;

    async fn fetch(
        &self,
        http: &HttpFetcher,
        archive: Option<&ArtifactStore>,
        run_id: Uuid,
        provider: &str,
        location: &FeedLocation,
    ) -> Result<RawFeed, AdapterError> {
        fetch_feed(http, archive, run_id, provider, self.format(), location).await
    }

    fn parse(&self, feed: &RawFeed, ctx: &AdapterContext) -> Result<ParsedFeed, AdapterError>;
}

pub fn adapter_for_format(format: FeedFormat) -> Box<dyn FeedAdapter> {
    match format {
        FeedFormat::Ticketmaster => Box::new(TicketmasterAdapter),
        FeedFormat::RemapJson => Box::new(RemapJsonAdapter),
        FeedFormat::TicketsqueezeCsv => Box::new(TicketsqueezeCsvAdapter),
    }
}

/// Pull a feed body from its location and archive it when an artifact store is given.
pub async fn fetch_feed(
    http: &HttpFetcher,
    archive: Option<&ArtifactStore>,
    run_id: Uuid,
    provider: &str,
    format: FeedFormat,
    location: &FeedLocation,
) -> Result<RawFeed, AdapterError> {
    let fetched_at = Utc::now();
    let (source, body) = match location {
        FeedLocation::Url(url) => {
            let response = http
                .fetch_bytes(run_id, provider, url)
                .await
                .map_err(|source| AdapterError::Fetch {
                    url: url.clone(),
                    source,
                })?;
            (response.final_url, response.body)
        }
        FeedLocation::File(path) => {
            let body = tokio::fs::read(path)
                .await
                .map_err(|source| AdapterError::Read {
                    path: path.clone(),
                    source,
                })?;
            (path.display().to_string(), body)
        }
    };

    info!(provider, %format, source = %source, bytes = body.len(), "feed fetched");
    let mut feed = RawFeed {
        provider: provider.to_string(),
        format,
        source,
        fetched_at,
        body,
        archived: None,
    };
    if let Some(store) = archive {
        feed.archived = Some(archive_feed(store, &feed).await?);
    }
    Ok(feed)
}

/// Store a feed body in the content-addressed archive under its fetch time.
pub async fn archive_feed(store: &ArtifactStore, feed: &RawFeed) -> Result<StoredArtifact, AdapterError> {
    Ok(store
        .store_bytes(feed.fetched_at, &feed.provider, feed.format.extension(), &feed.body)
        .await?)
}

pub(crate) fn text_or_none(value: Option<&str>) -> Option<String> {
    let trimmed = value?.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Reduce an HTML fragment to whitespace-collapsed text.
pub fn html_to_text(fragment: &str) -> String {
    if !fragment.contains('<') {
        return fragment.split_whitespace().collect::<Vec<_>>().join(" ");
    }
    let document = Html::parse_fragment(fragment);
    document
        .root_element()
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Identifiers arrive as strings or bare numbers depending on the provider.
pub(crate) fn json_id(value: Option<&JsonValue>) -> Option<String> {
    match value? {
        JsonValue::String(s) => text_or_none(Some(s)),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub(crate) fn json_f64(value: Option<&JsonValue>) -> Option<f64> {
    match value? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Parse a coordinate pair; out-of-range, unparsable and `0,0` placeholders count as absent.
pub(crate) fn coordinates_from(lon: Option<f64>, lat: Option<f64>) -> Option<Coordinates> {
    let (lon, lat) = (lon?, lat?);
    if lon == 0.0 && lat == 0.0 {
        return None;
    }
    Coordinates::checked(lon, lat)
}

pub(crate) fn end_of_day() -> NaiveTime {
    NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN)
}

/// Lenient timestamp parsing for feed values: RFC 3339 (offset dropped to wall time),
/// `YYYY-MM-DD[T ]HH:MM[:SS]`, or a bare date completed with `default_time`.
pub fn parse_feed_datetime(raw: &str, default_time: NaiveTime) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_local());
    }
    const FORMATS: [&str; 6] = [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M",
    ];
    for format in FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(dt);
        }
    }
    if let Some(stripped) = raw.strip_suffix('Z') {
        return parse_feed_datetime(stripped, default_time);
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .map(|date| date.and_time(default_time))
}
