//! Coordinate resolution for delta records that arrive without a usable location.

use std::sync::Arc;

use async_trait::async_trait;
use remap_core::Coordinates;
use remap_storage::{CollaboratorError, GeocodeCache, Geocoder, HttpFetcher};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::delta::DeltaChange;
use crate::reconcile::{FailedItem, FailureStage};

/// OpenRouteService (Pelias) forward geocoder.
#[derive(Debug, Clone)]
pub struct OpenRouteGeocoder {
    http: Arc<HttpFetcher>,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct FeatureCollection {
    #[serde(default)]
    features: Vec<Feature>,
}

#[derive(Debug, Deserialize)]
struct Feature {
    geometry: Geometry,
}

#[derive(Debug, Deserialize)]
struct Geometry {
    /// `[lon, lat]`
    coordinates: Vec<f64>,
}

impl OpenRouteGeocoder {
    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl Geocoder for OpenRouteGeocoder {
    async fn geocode(&self, address: &str) -> Result<Coordinates, CollaboratorError> {
        if self.api_key.is_empty() {
            return Err(CollaboratorError::Rejected("OPENROUTE_API_KEY is not set".to_string()));
        }
        let url = format!("{}/geocode/search", self.base_url.trim_end_matches('/'));
        let response = self
            .http
            .send("openroute", |client| {
                client.get(&url).query(&[
                    ("api_key", self.api_key.as_str()),
                    ("text", address),
                    ("size", "1"),
                ])
            })
            .await?;
        let body: FeatureCollection = response.json()?;

        let coords = body
            .features
            .first()
            .map(|f| f.geometry.coordinates.as_slice())
            .ok_or_else(|| CollaboratorError::NotFound(address.to_string()))?;
        match coords {
            [lon, lat, ..] => Coordinates::checked(*lon, *lat).ok_or_else(|| {
                CollaboratorError::Rejected(format!("geocoder returned out-of-range point for {address}"))
            }),
            _ => Err(CollaboratorError::Rejected(format!(
                "geocoder returned a malformed point for {address}"
            ))),
        }
    }
}

/// Attach coordinates to every added/changed record that lacks them. Records that cannot
/// be resolved are dropped from the returned changes and reported as failed.
pub async fn resolve_missing_coordinates(
    changes: Vec<DeltaChange>,
    cache: &GeocodeCache,
    geocoder: &dyn Geocoder,
) -> (Vec<DeltaChange>, Vec<FailedItem>) {
    let mut resolved = Vec::with_capacity(changes.len());
    let mut failed = Vec::new();

    for mut change in changes {
        if !change.needs_upsert() || change.record.has_coordinates() {
            resolved.push(change);
            continue;
        }
        let Some(query) = change.record.geocode_query() else {
            warn!(id = %change.entry.id, "record has no address to resolve");
            failed.push(FailedItem::new(&change.entry.id, FailureStage::Geocode, "no address, venue or city"));
            continue;
        };
        match cache.resolve(&query, geocoder).await {
            Ok(coordinates) => {
                debug!(id = %change.entry.id, %query, "coordinates resolved");
                change.record = change.record.with_coordinates(coordinates);
                resolved.push(change);
            }
            Err(err) => {
                warn!(id = %change.entry.id, %query, error = %err, "coordinate resolution failed");
                failed.push(FailedItem::new(&change.entry.id, FailureStage::Geocode, err.to_string()));
            }
        }
    }
    (resolved, failed)
}
