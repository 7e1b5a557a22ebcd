use async_trait::async_trait;
use chrono::NaiveTime;
use remap_core::EventRecord;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::{
    coordinates_from, html_to_text, json_f64, json_id, parse_feed_datetime, text_or_none,
    AdapterContext, AdapterError, FeedAdapter, FeedFormat, ParsedFeed, RawFeed,
};

const DEFAULT_CREDITS: &str = "Ticketmaster";

/// Ticketmaster discovery-feed dumps: a bare array or `{"events": [...]}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TicketmasterAdapter;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TicketmasterDocument {
    List(Vec<JsonValue>),
    Wrapped { events: Vec<JsonValue> },
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TicketmasterEvent {
    event_id: Option<JsonValue>,
    event_name: Option<String>,
    classification_segment: Option<String>,
    event_info: Option<String>,
    event_notes: Option<String>,
    venue: Option<TicketmasterVenue>,
    event_start_date_time: Option<String>,
    event_end_date_time: Option<String>,
    primary_event_url: Option<String>,
    event_image_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TicketmasterVenue {
    venue_name: Option<String>,
    venue_street: Option<String>,
    venue_city: Option<String>,
    venue_latitude: Option<JsonValue>,
    venue_longitude: Option<JsonValue>,
}

impl TicketmasterAdapter {
    fn normalize(event: TicketmasterEvent, ctx: &AdapterContext) -> Result<EventRecord, (Option<String>, String)> {
        let id = json_id(event.event_id.as_ref()).ok_or((None, "missing eventId".to_string()))?;
        let title = text_or_none(event.event_name.as_deref())
            .ok_or_else(|| (Some(id.clone()), "missing eventName".to_string()))?;

        let venue = event.venue.unwrap_or_default();
        let start_date = event
            .event_start_date_time
            .as_deref()
            .and_then(|s| parse_feed_datetime(s, NaiveTime::MIN));
        let end_date = event
            .event_end_date_time
            .as_deref()
            .and_then(|s| parse_feed_datetime(s, NaiveTime::MIN))
            .or(start_date);
        let description = event
            .event_info
            .as_deref()
            .and_then(|s| text_or_none(Some(s)))
            .or_else(|| text_or_none(event.event_notes.as_deref()))
            .map(|s| html_to_text(&s))
            .unwrap_or_default();

        let mut record = EventRecord::new(id, title);
        record.description = description;
        record.category = text_or_none(event.classification_segment.as_deref());
        record.city = text_or_none(venue.venue_city.as_deref());
        record.venue = text_or_none(venue.venue_name.as_deref());
        record.address = text_or_none(venue.venue_street.as_deref());
        record.coordinates = coordinates_from(
            json_f64(venue.venue_longitude.as_ref()),
            json_f64(venue.venue_latitude.as_ref()),
        );
        record.start_date = start_date;
        record.end_date = end_date;
        record.url = text_or_none(event.primary_event_url.as_deref()).map(|url| ctx.affiliate.wrap(&url));
        record.image_url = text_or_none(event.event_image_url.as_deref());
        record.credits = ctx
            .credits
            .clone()
            .or_else(|| Some(DEFAULT_CREDITS.to_string()));
        Ok(record)
    }
}

#[async_trait]
impl FeedAdapter for TicketmasterAdapter {
    fn format(&self) -> FeedFormat {
        FeedFormat::Ticketmaster
    }

    fn parse(&self, feed: &RawFeed, ctx: &AdapterContext) -> Result<ParsedFeed, AdapterError> {
        let document: TicketmasterDocument =
            serde_json::from_slice(&feed.body).map_err(|e| AdapterError::Decode {
                format: self.format(),
                message: e.to_string(),
            })?;
        let items = match document {
            TicketmasterDocument::List(items) => items,
            TicketmasterDocument::Wrapped { events } => events,
        };

        let mut parsed = ParsedFeed::default();
        for (position, item) in items.into_iter().enumerate() {
            let event: TicketmasterEvent = match serde_json::from_value(item) {
                Ok(event) => event,
                Err(err) => {
                    parsed.reject(position, None, format!("not a Ticketmaster event: {err}"));
                    continue;
                }
            };
            match Self::normalize(event, ctx) {
                Ok(record) => parsed.accept(record),
                Err((id, reason)) => parsed.reject(position, id, reason),
            }
        }
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AffiliateConfig;
    use chrono::{NaiveDate, Utc};
    use remap_core::Coordinates;

    fn raw(body: &str) -> RawFeed {
        RawFeed {
            provider: "ticketmaster".to_string(),
            format: FeedFormat::Ticketmaster,
            source: "inline".to_string(),
            fetched_at: Utc::now(),
            body: body.as_bytes().to_vec(),
            archived: None,
        }
    }

    #[test]
    fn maps_venue_fields_and_defaults_end_to_start() {
        let body = r#"[{
            "eventId": 1001,
            "eventName": "Vasco Live",
            "classificationSegment": "Music",
            "eventNotes": "<p>Doors at 19:00</p>",
            "venue": {"venueName": "Stadio San Siro", "venueStreet": "Piazzale Angelo Moratti",
                      "venueCity": "Milano", "venueLatitude": "45.4781", "venueLongitude": "9.1240"},
            "eventStartDateTime": "2026-06-20T19:00:00Z",
            "primaryEventUrl": "https://www.ticketmaster.it/event/1001"
        }]"#;
        let parsed = TicketmasterAdapter
            .parse(&raw(body), &AdapterContext::default())
            .expect("parse");

        assert!(parsed.malformed.is_empty());
        let record = &parsed.records[0];
        assert_eq!(record.id, "1001");
        assert_eq!(record.description, "Doors at 19:00");
        assert_eq!(record.coordinates, Some(Coordinates::new(9.1240, 45.4781)));
        assert_eq!(
            record.start_date,
            NaiveDate::from_ymd_opt(2026, 6, 20).and_then(|d| d.and_hms_opt(19, 0, 0))
        );
        assert_eq!(record.end_date, record.start_date);
        assert_eq!(record.credits.as_deref(), Some("Ticketmaster"));
        assert_eq!(record.fingerprint, record.compute_fingerprint());
    }

    #[test]
    fn events_without_id_or_name_are_quarantined() {
        let body = r#"{"events": [
            {"eventName": "No id"},
            {"eventId": "X2"},
            "not an object",
            {"eventId": "X3", "eventName": "Fine"}
        ]}"#;
        let parsed = TicketmasterAdapter
            .parse(&raw(body), &AdapterContext::default())
            .expect("parse");
        assert_eq!(parsed.records.len(), 1);
        let positions: Vec<_> = parsed.malformed.iter().map(|m| m.position).collect();
        assert_eq!(positions, vec![0, 1, 2]);
        assert_eq!(parsed.malformed[1].id.as_deref(), Some("X2"));
    }

    #[test]
    fn affiliate_link_is_applied_to_event_urls() {
        let ctx = AdapterContext {
            affiliate: AffiliateConfig {
                base_url: "https://aff.example/c/77?u=".to_string(),
                member_id: Some("77".to_string()),
            },
            ..AdapterContext::default()
        };
        let body = r#"[{"eventId": "A", "eventName": "Show", "primaryEventUrl": "https://tm.example/e/A"}]"#;
        let parsed = TicketmasterAdapter.parse(&raw(body), &ctx).expect("parse");
        assert_eq!(
            parsed.records[0].url.as_deref(),
            Some("https://aff.example/c/77?u=https%3A%2F%2Ftm.example%2Fe%2FA")
        );
    }

    #[test]
    fn undecodable_body_is_a_feed_error() {
        let err = TicketmasterAdapter
            .parse(&raw("{\"data\": 3}"), &AdapterContext::default())
            .expect_err("decode error");
        assert!(matches!(err, AdapterError::Decode { .. }));
    }
}
