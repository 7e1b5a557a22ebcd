//! Search-index collaborator: upsert/delete/count of one point per global identifier.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use remap_core::{point_id, EventRecord};
use remap_storage::{CollaboratorError, FetchError, HttpFetcher};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info};
use uuid::Uuid;

use crate::embed::{Embedding, SparseVector};

pub const DENSE_VECTOR_NAME: &str = "dense_vector";
pub const SPARSE_VECTOR_NAME: &str = "sparse_vector";

const PAYLOAD_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Debug, Clone, PartialEq)]
pub struct IndexPoint {
    /// Global (namespaced) identifier.
    pub id: String,
    pub dense: Vec<f32>,
    pub sparse: SparseVector,
    pub payload: JsonValue,
}

impl IndexPoint {
    pub fn from_record(record: &EventRecord, embedding: Embedding) -> Self {
        Self {
            id: record.id.clone(),
            dense: embedding.dense,
            sparse: embedding.sparse,
            payload: build_payload(record),
        }
    }

    pub fn point_id(&self) -> Uuid {
        point_id(&self.id)
    }
}

/// Filterable payload: `location` is a geo point and the dates are naive ISO timestamps.
pub fn build_payload(record: &EventRecord) -> JsonValue {
    let ts = |v: &Option<chrono::NaiveDateTime>| {
        v.map(|t| t.format(PAYLOAD_TIMESTAMP_FORMAT).to_string())
    };
    json!({
        "id": record.id,
        "title": record.title,
        "description": record.description,
        "category": record.category,
        "city": record.city,
        "venue": record.venue,
        "address": record.address,
        "location": record.coordinates.map(|c| json!({ "lat": c.lat, "lon": c.lon })),
        "start_date": ts(&record.start_date),
        "end_date": ts(&record.end_date),
        "url": record.url,
        "image_url": record.image_url,
        "credits": record.credits,
        "hash": record.fingerprint,
    })
}

/// An indexed event as seen while paging through the collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedEvent {
    /// Global (namespaced) identifier.
    pub id: String,
    /// `start_date` payload exactly as stored.
    pub start_date: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScrollPage {
    pub events: Vec<IndexedEvent>,
    /// Points read, including any without an identifier in their payload.
    pub scanned: usize,
    /// Opaque cursor for the next page; `None` once the collection is exhausted.
    pub next_offset: Option<JsonValue>,
}

#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Create the collection and its payload indexes if missing. Safe to call repeatedly.
    async fn ensure_collection(&self, dense_dimensions: usize) -> Result<(), CollaboratorError>;

    /// Insert-or-replace, keyed by [`IndexPoint::point_id`].
    async fn upsert(&self, points: &[IndexPoint]) -> Result<(), CollaboratorError>;

    /// Delete by global identifier. Unknown identifiers are ignored.
    async fn delete(&self, ids: &[String]) -> Result<(), CollaboratorError>;

    async fn count(&self) -> Result<u64, CollaboratorError>;

    /// Page through the collection in point order, starting at `offset`.
    async fn scroll(&self, offset: Option<JsonValue>, limit: usize) -> Result<ScrollPage, CollaboratorError>;
}

fn payload_str(payload: &JsonValue, field: &str) -> Option<String> {
    payload.get(field).and_then(JsonValue::as_str).map(str::to_string)
}

#[derive(Debug, Clone)]
pub struct QdrantConfig {
    pub server: String,
    pub api_key: Option<String>,
    pub collection: String,
}

/// Qdrant REST client.
#[derive(Debug, Clone)]
pub struct QdrantIndex {
    http: Arc<HttpFetcher>,
    config: QdrantConfig,
}

#[derive(Debug, Deserialize)]
struct QdrantEnvelope<T> {
    result: T,
}

#[derive(Debug, Deserialize)]
struct CountResult {
    count: u64,
}

#[derive(Debug, Deserialize)]
struct ScrollResult {
    points: Vec<ScrolledPoint>,
    next_page_offset: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct ScrolledPoint {
    #[serde(default)]
    payload: JsonValue,
}

const SCOPE: &str = "qdrant";

impl QdrantIndex {
    pub fn new(http: Arc<HttpFetcher>, config: QdrantConfig) -> Self {
        Self { http, config }
    }

    fn collection_url(&self, suffix: &str) -> String {
        format!(
            "{}/collections/{}{}",
            self.config.server.trim_end_matches('/'),
            self.config.collection,
            suffix
        )
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_key {
            Some(key) if !key.is_empty() => builder.header("api-key", key),
            _ => builder,
        }
    }

    async fn collection_exists(&self) -> Result<bool, CollaboratorError> {
        let url = self.collection_url("");
        match self
            .http
            .send(SCOPE, |c| self.authorized(c.get(&url)))
            .await
        {
            Ok(_) => Ok(true),
            Err(FetchError::HttpStatus { status: 404, .. }) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn create_payload_index(&self, field: &str, schema: &str) -> Result<(), CollaboratorError> {
        let url = self.collection_url("/index?wait=true");
        let body = json!({ "field_name": field, "field_schema": schema });
        self.http
            .send(SCOPE, |c| self.authorized(c.put(&url)).json(&body))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SearchIndex for QdrantIndex {
    async fn ensure_collection(&self, dense_dimensions: usize) -> Result<(), CollaboratorError> {
        if self.collection_exists().await? {
            return Ok(());
        }
        let url = self.collection_url("");
        let body = json!({
            "vectors": { DENSE_VECTOR_NAME: { "size": dense_dimensions, "distance": "Cosine" } },
            "sparse_vectors": { SPARSE_VECTOR_NAME: {} },
        });
        self.http
            .send(SCOPE, |c| self.authorized(c.put(&url)).json(&body))
            .await?;

        for (field, schema) in [
            ("id", "keyword"),
            ("location", "geo"),
            ("start_date", "datetime"),
            ("end_date", "datetime"),
        ] {
            self.create_payload_index(field, schema).await?;
        }
        info!(collection = %self.config.collection, dense_dimensions, "created search collection");
        Ok(())
    }

    async fn upsert(&self, points: &[IndexPoint]) -> Result<(), CollaboratorError> {
        if points.is_empty() {
            return Ok(());
        }
        let url = self.collection_url("/points?wait=true");
        let body = json!({
            "points": points
                .iter()
                .map(|p| json!({
                    "id": p.point_id().to_string(),
                    "vector": {
                        DENSE_VECTOR_NAME: p.dense,
                        SPARSE_VECTOR_NAME: { "indices": p.sparse.indices, "values": p.sparse.values },
                    },
                    "payload": p.payload,
                }))
                .collect::<Vec<_>>(),
        });
        self.http
            .send(SCOPE, |c| self.authorized(c.put(&url)).json(&body))
            .await?;
        debug!(count = points.len(), "upserted points");
        Ok(())
    }

    async fn delete(&self, ids: &[String]) -> Result<(), CollaboratorError> {
        if ids.is_empty() {
            return Ok(());
        }
        let url = self.collection_url("/points/delete?wait=true");
        let body = json!({
            "points": ids.iter().map(|id| point_id(id).to_string()).collect::<Vec<_>>(),
        });
        match self
            .http
            .send(SCOPE, |c| self.authorized(c.post(&url)).json(&body))
            .await
        {
            Ok(_) => Ok(()),
            // No collection means nothing left to delete.
            Err(FetchError::HttpStatus { status: 404, .. }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn count(&self) -> Result<u64, CollaboratorError> {
        let url = self.collection_url("/points/count");
        let body = json!({ "exact": true });
        let response = self
            .http
            .send(SCOPE, |c| self.authorized(c.post(&url)).json(&body))
            .await?;
        let envelope: QdrantEnvelope<CountResult> = response.json()?;
        Ok(envelope.result.count)
    }

    async fn scroll(&self, offset: Option<JsonValue>, limit: usize) -> Result<ScrollPage, CollaboratorError> {
        let url = self.collection_url("/points/scroll");
        let mut body = json!({
            "limit": limit.max(1),
            "with_payload": ["id", "start_date"],
            "with_vector": false,
        });
        if let Some(offset) = offset {
            body["offset"] = offset;
        }
        let response = match self
            .http
            .send(SCOPE, |c| self.authorized(c.post(&url)).json(&body))
            .await
        {
            Ok(response) => response,
            Err(FetchError::HttpStatus { status: 404, .. }) => return Ok(ScrollPage::default()),
            Err(err) => return Err(err.into()),
        };
        let envelope: QdrantEnvelope<ScrollResult> = response.json()?;
        let scanned = envelope.result.points.len();
        let events = envelope
            .result
            .points
            .into_iter()
            .filter_map(|point| {
                Some(IndexedEvent {
                    id: payload_str(&point.payload, "id")?,
                    start_date: payload_str(&point.payload, "start_date"),
                })
            })
            .collect();
        Ok(ScrollPage {
            events,
            scanned,
            next_offset: envelope.result.next_page_offset.filter(|o| !o.is_null()),
        })
    }
}

/// In-process index keyed by point id, with switchable failure modes.
#[derive(Debug, Default)]
pub struct MemoryIndex {
    points: Mutex<BTreeMap<Uuid, IndexPoint>>,
    dense_dimensions: Mutex<Option<usize>>,
    rejected_ids: Mutex<HashSet<String>>,
    unavailable: AtomicBool,
    upsert_calls: AtomicUsize,
    delete_calls: AtomicUsize,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upserts and deletes that include `id` are rejected until cleared.
    pub fn reject_id(&self, id: impl Into<String>) {
        self.rejected_ids.lock().unwrap_or_else(|e| e.into_inner()).insert(id.into());
    }

    pub fn clear_rejections(&self) {
        self.rejected_ids.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Every call fails transiently while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn get(&self, id: &str) -> Option<IndexPoint> {
        self.points
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&point_id(id))
            .cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self
            .points
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|p| p.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.points.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn upsert_calls(&self) -> usize {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub fn dense_dimensions(&self) -> Option<usize> {
        *self.dense_dimensions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check(&self, ids: impl IntoIterator<Item = impl AsRef<str>>) -> Result<(), CollaboratorError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Transient("index unreachable".to_string()));
        }
        let rejected = self.rejected_ids.lock().unwrap_or_else(|e| e.into_inner());
        for id in ids {
            if rejected.contains(id.as_ref()) {
                return Err(CollaboratorError::Rejected(format!("point {} rejected", id.as_ref())));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SearchIndex for MemoryIndex {
    async fn ensure_collection(&self, dense_dimensions: usize) -> Result<(), CollaboratorError> {
        self.check(std::iter::empty::<&str>())?;
        let mut dims = self.dense_dimensions.lock().unwrap_or_else(|e| e.into_inner());
        dims.get_or_insert(dense_dimensions);
        Ok(())
    }

    async fn upsert(&self, points: &[IndexPoint]) -> Result<(), CollaboratorError> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        self.check(points.iter().map(|p| p.id.as_str()))?;
        let mut map = self.points.lock().unwrap_or_else(|e| e.into_inner());
        for point in points {
            map.insert(point.point_id(), point.clone());
        }
        Ok(())
    }

    async fn delete(&self, ids: &[String]) -> Result<(), CollaboratorError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.check(ids)?;
        let mut map = self.points.lock().unwrap_or_else(|e| e.into_inner());
        for id in ids {
            map.remove(&point_id(id));
        }
        Ok(())
    }

    async fn count(&self) -> Result<u64, CollaboratorError> {
        self.check(std::iter::empty::<&str>())?;
        Ok(self.len() as u64)
    }

    async fn scroll(&self, offset: Option<JsonValue>, limit: usize) -> Result<ScrollPage, CollaboratorError> {
        self.check(std::iter::empty::<&str>())?;
        let from = match offset.as_ref().and_then(JsonValue::as_str) {
            Some(raw) => Uuid::parse_str(raw)
                .map_err(|e| CollaboratorError::Rejected(format!("bad scroll offset {raw:?}: {e}")))?,
            None => Uuid::nil(),
        };
        let points = self.points.lock().unwrap_or_else(|e| e.into_inner());
        let mut rest = points.range(from..);
        let events: Vec<_> = rest
            .by_ref()
            .take(limit.max(1))
            .map(|(_, point)| IndexedEvent {
                id: point.id.clone(),
                start_date: payload_str(&point.payload, "start_date"),
            })
            .collect();
        Ok(ScrollPage {
            scanned: events.len(),
            events,
            next_offset: rest.next().map(|(key, _)| JsonValue::String(key.to_string())),
        })
    }
}
