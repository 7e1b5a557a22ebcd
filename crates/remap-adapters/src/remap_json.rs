use async_trait::async_trait;
use chrono::{NaiveDateTime, NaiveTime, TimeDelta};
use remap_core::EventRecord;
use remap_storage::{ArtifactStore, CollaboratorError, HttpFetcher};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    archive_feed, coordinates_from, end_of_day, fetch_feed, html_to_text, json_f64, json_id,
    parse_feed_datetime, text_or_none, AdapterContext, AdapterError, FeedAdapter, FeedFormat,
    FeedLocation, ParsedFeed, RawFeed,
};

const DESKLINE_EVENT_URL_BASE: &str =
    "https://www.unpliveneto.it/eventi-delle-pro-loco-in-veneto/#/eventi";
const OCCURRENCES_PER_EVENT: usize = 100;

/// Normalized `{"events": [...]}` exports and raw Deskline `{"data": [...]}` listings.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemapJsonAdapter;

#[derive(Debug, Default, Deserialize)]
struct NormalizedEvent {
    id: Option<JsonValue>,
    title: Option<String>,
    category: Option<String>,
    description: Option<String>,
    city: Option<String>,
    location: Option<NormalizedLocation>,
    start_date: Option<String>,
    end_date: Option<String>,
    url: Option<String>,
    image_url: Option<String>,
    credits: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct NormalizedLocation {
    venue: Option<String>,
    address: Option<String>,
    #[serde(alias = "lat")]
    latitude: Option<JsonValue>,
    #[serde(alias = "lon")]
    longitude: Option<JsonValue>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DesklineEvent {
    id: Option<JsonValue>,
    name: Option<String>,
    db_code: Option<String>,
    date: Option<String>,
    location: Option<DesklineLocation>,
    #[serde(default)]
    descriptions: Vec<DesklineDescription>,
    #[serde(default)]
    criteria: Vec<DesklineCriterion>,
    url_friendly_name: Option<String>,
    has_more_dates: Option<bool>,
    next_occurrences: Option<DesklineOccurrences>,
}

#[derive(Debug, Default, Deserialize)]
struct DesklineOccurrences {
    #[serde(default)]
    items: Vec<DesklineOccurrence>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DesklineOccurrence {
    date: Option<String>,
    start_time: Option<String>,
    /// Hours; zero means the edition runs until the end of its day.
    duration: Option<JsonValue>,
}

impl DesklineEvent {
    /// `(start, duration hours)` for every edition. Rows flagged `hasMoreDates` list their
    /// editions under `nextOccurrences`; any other row is a single edition on its listing date.
    fn editions(&self) -> Vec<(String, f64)> {
        let listed: Vec<_> = match (self.has_more_dates, &self.next_occurrences) {
            (Some(true), Some(occurrences)) => occurrences
                .items
                .iter()
                .filter_map(|item| {
                    let day = text_or_none(item.date.as_deref())?.get(..10)?.to_string();
                    let time = text_or_none(item.start_time.as_deref()).unwrap_or_else(|| "00:00".to_string());
                    let hours = json_f64(item.duration.as_ref()).unwrap_or(0.0);
                    Some((format!("{day}T{time}"), hours))
                })
                .collect(),
            _ => Vec::new(),
        };
        if !listed.is_empty() {
            return listed;
        }
        text_or_none(self.date.as_deref())
            .map(|date| vec![(date, 0.0)])
            .unwrap_or_default()
    }
}

fn edition_end(start: NaiveDateTime, duration_hours: f64) -> Option<NaiveDateTime> {
    if duration_hours > 0.0 && duration_hours.is_finite() {
        let span = TimeDelta::try_seconds((duration_hours * 3600.0).round() as i64)?;
        return start.checked_add_signed(span);
    }
    Some(start.date().and_time(end_of_day()))
}

#[derive(Debug, Default, Deserialize)]
struct DesklineLocation {
    place: Option<String>,
    town: Option<String>,
    coordinate: Option<DesklineCoordinate>,
}

#[derive(Debug, Default, Deserialize)]
struct DesklineCoordinate {
    lat: Option<JsonValue>,
    long: Option<JsonValue>,
}

#[derive(Debug, Default, Deserialize)]
struct DesklineDescription {
    description: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DesklineCriterion {
    group_name: Option<String>,
}

enum Shape {
    Normalized(Vec<JsonValue>),
    Deskline(Vec<JsonValue>),
}

type Rejection = (Option<String>, String);

impl RemapJsonAdapter {
    fn shape(&self, body: &[u8]) -> Result<Shape, AdapterError> {
        let decode = |message: String| AdapterError::Decode {
            format: FeedFormat::RemapJson,
            message,
        };
        let value: JsonValue = serde_json::from_slice(body).map_err(|e| decode(e.to_string()))?;
        match value {
            JsonValue::Array(items) => Ok(Shape::Normalized(items)),
            JsonValue::Object(mut map) => {
                if let Some(JsonValue::Array(items)) = map.remove("events") {
                    Ok(Shape::Normalized(items))
                } else if let Some(JsonValue::Array(items)) = map.remove("data") {
                    Ok(Shape::Deskline(items))
                } else {
                    Err(decode("expected an `events` or `data` array".to_string()))
                }
            }
            _ => Err(decode("expected a JSON object or array".to_string())),
        }
    }

    fn normalized(event: NormalizedEvent, ctx: &AdapterContext) -> Result<EventRecord, Rejection> {
        let id = json_id(event.id.as_ref()).ok_or((None, "missing id".to_string()))?;
        let title = text_or_none(event.title.as_deref())
            .ok_or_else(|| (Some(id.clone()), "missing title".to_string()))?;
        let location = event.location.unwrap_or_default();

        let mut record = EventRecord::new(id, title);
        record.description = event.description.as_deref().map(html_to_text).unwrap_or_default();
        record.category = text_or_none(event.category.as_deref());
        record.city = text_or_none(event.city.as_deref());
        record.venue = text_or_none(location.venue.as_deref());
        record.address = text_or_none(location.address.as_deref());
        record.coordinates = coordinates_from(
            json_f64(location.longitude.as_ref()),
            json_f64(location.latitude.as_ref()),
        );
        record.start_date = event
            .start_date
            .as_deref()
            .and_then(|s| parse_feed_datetime(s, NaiveTime::MIN));
        record.end_date = event
            .end_date
            .as_deref()
            .and_then(|s| parse_feed_datetime(s, end_of_day()));
        record.url = text_or_none(event.url.as_deref());
        record.image_url = text_or_none(event.image_url.as_deref());
        record.credits = text_or_none(event.credits.as_deref()).or_else(|| ctx.credits.clone());
        Ok(record)
    }

    /// One record per edition of a Deskline event; the edition date is part of the id.
    fn deskline(event: DesklineEvent, ctx: &AdapterContext) -> Result<Vec<EventRecord>, Rejection> {
        let base_id = json_id(event.id.as_ref()).ok_or((None, "missing id".to_string()))?;
        let title = text_or_none(event.name.as_deref())
            .ok_or_else(|| (Some(base_id.clone()), "missing name".to_string()))?;
        let location = event.location.as_ref();
        let venue = location.and_then(|l| text_or_none(l.place.as_deref()));
        let city = location.and_then(|l| text_or_none(l.town.as_deref()));
        let coordinate = location.and_then(|l| l.coordinate.as_ref());

        let url = match (
            text_or_none(event.db_code.as_deref()),
            text_or_none(event.url_friendly_name.as_deref()),
        ) {
            (Some(db_code), Some(slug)) => Some(format!("{DESKLINE_EVENT_URL_BASE}/{db_code}/{base_id}/{slug}")),
            _ => None,
        };

        let mut template = EventRecord::new(base_id.clone(), title);
        template.description = event
            .descriptions
            .first()
            .and_then(|d| d.description.as_deref())
            .map(html_to_text)
            .unwrap_or_default();
        template.category = event
            .criteria
            .first()
            .and_then(|c| text_or_none(c.group_name.as_deref()));
        template.address = match (&venue, &city) {
            (Some(venue), Some(city)) => Some(format!("{venue}, {city}")),
            _ => venue.clone().or_else(|| city.clone()),
        };
        template.venue = venue;
        template.city = city;
        template.coordinates = coordinate.and_then(|c| {
            coordinates_from(json_f64(c.long.as_ref()), json_f64(c.lat.as_ref()))
        });
        template.url = url;
        template.credits = ctx.credits.clone();

        let editions = event.editions();
        if editions.is_empty() {
            return Ok(vec![template]);
        }
        Ok(editions
            .into_iter()
            .map(|(start, hours)| {
                let mut record = template.clone();
                if let Some(day) = start.get(..10) {
                    record.id = format!("{base_id}_{day}");
                }
                record.start_date = parse_feed_datetime(&start, NaiveTime::MIN);
                record.end_date = record.start_date.and_then(|s| edition_end(s, hours));
                record
            })
            .collect())
    }
}

/// Fill in `nextOccurrences` for listing rows flagged `hasMoreDates`, one detail request per
/// row. Rows whose details cannot be fetched keep their listing date. Returns `None` when
/// the body is left as it was.
async fn attach_occurrences(
    http: &HttpFetcher,
    provider: &str,
    listing_url: &str,
    body: &[u8],
) -> Result<Option<Vec<u8>>, AdapterError> {
    // Undecodable bodies are reported by `parse`.
    let Ok(mut listing) = serde_json::from_slice::<JsonValue>(body) else {
        return Ok(None);
    };
    let Some(rows) = listing.get_mut("data").and_then(JsonValue::as_array_mut) else {
        return Ok(None);
    };
    let detail_base = listing_url
        .split('?')
        .next()
        .unwrap_or(listing_url)
        .trim_end_matches('/');

    let mut attached = 0usize;
    for row in rows.iter_mut() {
        let Some(row) = row.as_object_mut() else { continue };
        let wants_dates = row.get("hasMoreDates").and_then(JsonValue::as_bool).unwrap_or(false);
        if !wants_dates || row.contains_key("nextOccurrences") {
            continue;
        }
        let (Some(id), Some(db_code)) = (
            json_id(row.get("id")),
            text_or_none(row.get("dbCode").and_then(JsonValue::as_str)),
        ) else {
            continue;
        };
        let from_date = row
            .get("date")
            .and_then(JsonValue::as_str)
            .and_then(|d| d.get(..10))
            .unwrap_or("2020-01-01")
            .to_string();

        let url = format!("{detail_base}/{db_code}/{}", urlencoding::encode(&id));
        let fields = format!(
            "nextOccurrences(fromDate:\"{from_date}\",count:{OCCURRENCES_PER_EVENT}){{items{{date,dayOfWeek,startTime,duration}},hasMoreItems}}"
        );
        let detail = http
            .send(provider, |client| {
                client
                    .get(&url)
                    .query(&[("fields", fields.as_str())])
                    .header("DW-Source", "desklineweb")
            })
            .await
            .map_err(CollaboratorError::from)
            .and_then(|response| response.json::<JsonValue>());

        match detail {
            Ok(mut detail) => match detail.get_mut("nextOccurrences").map(JsonValue::take) {
                Some(occurrences) => {
                    row.insert("nextOccurrences".to_string(), occurrences);
                    attached += 1;
                }
                None => warn!(provider, %id, "event details carry no occurrences; keeping listing date"),
            },
            Err(err) => warn!(provider, %id, error = %err, "occurrence lookup failed; keeping listing date"),
        }
    }

    if attached == 0 {
        return Ok(None);
    }
    debug!(provider, attached, "deskline occurrences attached");
    serde_json::to_vec(&listing)
        .map(Some)
        .map_err(|e| AdapterError::Decode {
            format: FeedFormat::RemapJson,
            message: e.to_string(),
        })
}

#[async_trait]
impl FeedAdapter for RemapJsonAdapter {
    fn format(&self) -> FeedFormat {
        FeedFormat::RemapJson
    }

    /// Remote Deskline listings are completed with their occurrences before archiving, so
    /// the archived body parses offline to the same records.
    async fn fetch(
        &self,
        http: &HttpFetcher,
        archive: Option<&ArtifactStore>,
        run_id: Uuid,
        provider: &str,
        location: &FeedLocation,
    ) -> Result<RawFeed, AdapterError> {
        let FeedLocation::Url(listing_url) = location else {
            return fetch_feed(http, archive, run_id, provider, self.format(), location).await;
        };
        let mut feed = fetch_feed(http, None, run_id, provider, self.format(), location).await?;
        if let Some(body) = attach_occurrences(http, provider, listing_url, &feed.body).await? {
            feed.body = body;
        }
        if let Some(store) = archive {
            feed.archived = Some(archive_feed(store, &feed).await?);
        }
        Ok(feed)
    }

    fn parse(&self, feed: &RawFeed, ctx: &AdapterContext) -> Result<ParsedFeed, AdapterError> {
        let mut parsed = ParsedFeed::default();
        match self.shape(&feed.body)? {
            Shape::Normalized(items) => {
                for (position, item) in items.into_iter().enumerate() {
                    let outcome = serde_json::from_value::<NormalizedEvent>(item)
                        .map_err(|e| (None, format!("not an event object: {e}")))
                        .and_then(|event| Self::normalized(event, ctx));
                    match outcome {
                        Ok(record) => parsed.accept(record),
                        Err((id, reason)) => parsed.reject(position, id, reason),
                    }
                }
            }
            Shape::Deskline(items) => {
                for (position, item) in items.into_iter().enumerate() {
                    let outcome = serde_json::from_value::<DesklineEvent>(item)
                        .map_err(|e| (None, format!("not a Deskline event: {e}")))
                        .and_then(|event| Self::deskline(event, ctx));
                    match outcome {
                        Ok(editions) => editions.into_iter().for_each(|record| parsed.accept(record)),
                        Err((id, reason)) => parsed.reject(position, id, reason),
                    }
                }
            }
        }
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};
    use remap_core::Coordinates;
    use remap_storage::{HttpClientConfig, RetryPolicy};
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::tempdir;

    fn at(day: (i32, u32, u32), hms: (u32, u32, u32)) -> Option<NaiveDateTime> {
        NaiveDate::from_ymd_opt(day.0, day.1, day.2).and_then(|d| d.and_hms_opt(hms.0, hms.1, hms.2))
    }

    fn raw(body: &str) -> RawFeed {
        RawFeed {
            provider: "unpli".to_string(),
            format: FeedFormat::RemapJson,
            source: "inline".to_string(),
            fetched_at: Utc::now(),
            body: body.as_bytes().to_vec(),
            archived: None,
        }
    }

    fn ctx() -> AdapterContext {
        AdapterContext {
            provider: "unpli".to_string(),
            credits: Some("UNPLI Veneto".to_string()),
            ..AdapterContext::default()
        }
    }

    #[test]
    fn deskline_rows_become_dated_editions() {
        let body = r#"{"data": [{
            "id": "8f2c", "name": "Festa dei Bisi", "dbCode": "UNP",
            "date": "2026-06-14T00:00:00",
            "location": {"place": "Piazza Maggiore", "town": "Lumignano",
                         "coordinate": {"lat": 45.4631, "long": 11.5967}},
            "descriptions": [{"description": "<p>Piselli <em>freschi</em></p>"}],
            "criteria": [{"groupName": "Sagre"}],
            "urlFriendlyName": "festa-dei-bisi"
        }]}"#;
        let parsed = RemapJsonAdapter.parse(&raw(body), &ctx()).expect("parse");
        let record = &parsed.records[0];

        assert_eq!(record.id, "8f2c_2026-06-14");
        assert_eq!(record.description, "Piselli freschi");
        assert_eq!(record.category.as_deref(), Some("Sagre"));
        assert_eq!(record.address.as_deref(), Some("Piazza Maggiore, Lumignano"));
        assert_eq!(record.coordinates, Some(Coordinates::new(11.5967, 45.4631)));
        assert_eq!(
            record.end_date,
            NaiveDate::from_ymd_opt(2026, 6, 14).and_then(|d| d.and_hms_opt(23, 59, 59))
        );
        assert_eq!(
            record.url.as_deref(),
            Some("https://www.unpliveneto.it/eventi-delle-pro-loco-in-veneto/#/eventi/UNP/8f2c/festa-dei-bisi")
        );
        assert_eq!(record.credits.as_deref(), Some("UNPLI Veneto"));
    }

    #[test]
    fn rows_with_more_dates_expand_into_one_edition_per_occurrence() {
        let body = r#"{"data": [{
            "id": 4417, "name": "Festa della Ciliegia", "dbCode": "UNP",
            "date": "2026-06-06T00:00:00", "hasMoreDates": true,
            "location": {"town": "Marostica"},
            "nextOccurrences": {"items": [
                {"date": "2026-06-06T00:00:00", "startTime": "18:00", "duration": 5},
                {"date": "2026-06-07T00:00:00", "startTime": "10:30", "duration": 0},
                {"date": "2026-06-13T00:00:00", "duration": 1.5},
                {"startTime": "09:00", "duration": 2}
            ], "hasMoreItems": false}
        }]}"#;
        let parsed = RemapJsonAdapter.parse(&raw(body), &ctx()).expect("parse");
        let view: Vec<_> = parsed
            .records
            .iter()
            .map(|r| (r.id.as_str(), r.start_date, r.end_date))
            .collect();

        assert_eq!(
            view,
            vec![
                ("4417_2026-06-06", at((2026, 6, 6), (18, 0, 0)), at((2026, 6, 6), (23, 0, 0))),
                ("4417_2026-06-07", at((2026, 6, 7), (10, 30, 0)), at((2026, 6, 7), (23, 59, 59))),
                ("4417_2026-06-13", at((2026, 6, 13), (0, 0, 0)), at((2026, 6, 13), (1, 30, 0))),
            ]
        );
        assert!(parsed.records.iter().all(|r| r.address.as_deref() == Some("Marostica")));
        assert!(parsed.malformed.is_empty());
    }

    #[test]
    fn occurrences_are_ignored_without_the_more_dates_flag() {
        let body = r#"{"data": [{
            "id": "x9", "name": "Palio", "date": "2026-08-15T00:00:00",
            "nextOccurrences": {"items": [{"date": "2026-08-16T00:00:00", "duration": 3}]}
        }]}"#;
        let parsed = RemapJsonAdapter.parse(&raw(body), &ctx()).expect("parse");
        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.records[0].id, "x9_2026-08-15");
    }

    /// Deskline stand-in: the listing on `/unpliveneto/it/events`, occurrences for `UNP/c1`,
    /// 404 for any other event detail.
    fn serve_deskline(listing: &'static str, detail: &'static str) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                let mut buf = [0u8; 8192];
                let mut request = Vec::new();
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(read) => request.extend_from_slice(&buf[..read]),
                    }
                }
                let line = String::from_utf8_lossy(&request).lines().next().unwrap_or_default().to_string();
                let (status, body) = if line.contains("/events/UNP/c1") {
                    (200, detail)
                } else if line.contains("/events/UNP/") {
                    (404, "{}")
                } else {
                    (200, listing)
                };
                log.lock().expect("request log").push(line);
                let _ = write!(
                    stream,
                    "HTTP/1.1 {status} Stub\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
            }
        });
        (format!("http://{addr}"), seen)
    }

    #[tokio::test]
    async fn remote_listings_fetch_occurrences_before_archiving() {
        let listing = r#"{"data": [
            {"id": "c1", "name": "Festa della Ciliegia", "dbCode": "UNP",
             "date": "2026-06-06T00:00:00", "hasMoreDates": true},
            {"id": "c2", "name": "Palio dei Mussi", "dbCode": "UNP",
             "date": "2026-07-01T00:00:00", "hasMoreDates": true},
            {"id": "c3", "name": "Sagra", "dbCode": "UNP", "date": "2026-07-04T00:00:00"}
        ]}"#;
        let detail = r#"{"nextOccurrences": {"items": [
            {"date": "2026-06-06T00:00:00", "startTime": "18:00", "duration": 5},
            {"date": "2026-06-07T00:00:00", "startTime": "10:00", "duration": 0}
        ], "hasMoreItems": false}}"#;
        let (base, requests) = serve_deskline(listing, detail);

        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            retry: RetryPolicy {
                max_retries: 0,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            },
            ..HttpClientConfig::default()
        })
        .expect("http");
        let dir = tempdir().expect("tempdir");
        let archive = ArtifactStore::new(dir.path());
        let location = FeedLocation::Url(format!("{base}/unpliveneto/it/events?pageSize=5"));

        let feed = RemapJsonAdapter
            .fetch(&http, Some(&archive), Uuid::new_v4(), "unpli", &location)
            .await
            .expect("fetch");
        let parsed = RemapJsonAdapter.parse(&feed, &ctx()).expect("parse");
        let ids: Vec<_> = parsed.records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["c1_2026-06-06", "c1_2026-06-07", "c2_2026-07-01", "c3_2026-07-04"]);

        let requests = requests.lock().expect("request log").clone();
        assert_eq!(requests.len(), 3, "{requests:?}");
        assert!(requests
            .iter()
            .any(|line| line.contains("/unpliveneto/it/events/UNP/c1?fields=") && line.contains("2026-06-06")));
        assert!(!requests.iter().any(|line| line.contains("/UNP/c3")));

        let stored = feed.archived.clone().expect("archived");
        let offline = RawFeed {
            body: std::fs::read(&stored.absolute_path).expect("archived body"),
            ..feed
        };
        let reparsed = RemapJsonAdapter.parse(&offline, &ctx()).expect("reparse");
        assert_eq!(reparsed.records, parsed.records);
    }

    #[test]
    fn normalized_export_keeps_explicit_fields() {
        let body = r#"{"events": [
            {"id": "E1", "title": "Mercatino", "city": "Bassano",
             "location": {"venue": "Ponte Vecchio", "address": "Via Gamba 1",
                          "latitude": null, "longitude": null},
             "start_date": "2026-09-01T09:00:00", "end_date": "2026-09-01",
             "credits": "Pro Loco Bassano"},
            {"title": "missing id"}
        ]}"#;
        let parsed = RemapJsonAdapter.parse(&raw(body), &ctx()).expect("parse");

        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.malformed.len(), 1);
        let record = &parsed.records[0];
        assert_eq!(record.coordinates, None);
        assert_eq!(record.address.as_deref(), Some("Via Gamba 1"));
        assert_eq!(record.credits.as_deref(), Some("Pro Loco Bassano"));
        assert_eq!(
            record.end_date,
            NaiveDate::from_ymd_opt(2026, 9, 1).and_then(|d| d.and_hms_opt(23, 59, 59))
        );
    }

    #[test]
    fn object_without_known_array_is_rejected() {
        let err = RemapJsonAdapter
            .parse(&raw(r#"{"items": []}"#), &ctx())
            .expect_err("decode");
        assert!(matches!(err, AdapterError::Decode { format: FeedFormat::RemapJson, .. }));
    }
}
