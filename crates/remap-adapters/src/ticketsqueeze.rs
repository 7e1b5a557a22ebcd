use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{NaiveDateTime, NaiveTime};
use remap_core::EventRecord;
use tracing::warn;

use crate::{
    coordinates_from, end_of_day, parse_feed_datetime, text_or_none, AdapterContext,
    AdapterError, FeedAdapter, FeedFormat, ParsedFeed, RawFeed,
};

const DEFAULT_CREDITS: &str = "TicketSqueeze - Events Data";

/// TicketSqueeze CSV exports. Column names vary between export generations, so every field is
/// looked up through an ordered alias list.
#[derive(Debug, Clone, Copy, Default)]
pub struct TicketsqueezeCsvAdapter;

struct Row {
    cells: HashMap<String, String>,
}

impl Row {
    fn first(&self, aliases: &[&str]) -> Option<String> {
        aliases
            .iter()
            .find_map(|alias| text_or_none(self.cells.get(*alias).map(String::as_str)))
    }

    fn number(&self, aliases: &[&str]) -> Option<f64> {
        self.first(aliases).and_then(|v| v.parse().ok())
    }
}

fn combine(date: &str, time: Option<&str>, default_time: NaiveTime) -> Option<NaiveDateTime> {
    match time {
        Some(time) => parse_feed_datetime(&format!("{date} {time}"), default_time),
        None => parse_feed_datetime(date, default_time),
    }
}

impl TicketsqueezeCsvAdapter {
    fn normalize(row: &Row, ctx: &AdapterContext) -> Result<EventRecord, (Option<String>, String)> {
        let id = row
            .first(&["event_id", "id"])
            .ok_or((None, "missing event_id".to_string()))?;
        let title = row
            .first(&["title", "name", "event_name"])
            .ok_or_else(|| (Some(id.clone()), "missing title".to_string()))?;

        let start_raw = row.first(&["start_date", "event_date", "new_event_date"]);
        let start_time = row.first(&["start_time", "event_time", "new_event_time"]);
        let start_date = start_raw
            .as_deref()
            .and_then(|d| combine(d, start_time.as_deref(), NaiveTime::MIN));
        if start_raw.is_some() && start_date.is_none() {
            warn!(%id, raw = start_raw.as_deref().unwrap_or_default(), "unparsable start date");
        }

        let end_raw = row.first(&["end_date", "event_date", "new_event_date"]);
        let end_time = row.first(&["end_time"]);
        let end_date = match end_raw.as_deref() {
            Some(d) => combine(d, end_time.as_deref(), end_of_day()),
            None => start_date.map(|start| start.date().and_time(end_of_day())),
        };

        let mut record = EventRecord::new(id, title.clone());
        record.description = row.first(&["description"]).unwrap_or(title);
        record.category = row.first(&["category"]);
        record.city = row.first(&["city", "venue_city"]);
        record.venue = row.first(&["venue", "venue_name"]);
        record.address = row.first(&["address", "venue_address"]);
        record.coordinates = coordinates_from(
            row.number(&["longitude", "lon", "geolocation_longitude"]),
            row.number(&["latitude", "lat", "geolocation_latitude"]),
        );
        record.start_date = start_date;
        record.end_date = end_date;
        record.url = row.first(&["url", "event_url"]);
        record.image_url = row.first(&["image_url", "image"]);
        record.credits = ctx
            .credits
            .clone()
            .or_else(|| Some(DEFAULT_CREDITS.to_string()));
        Ok(record)
    }
}

#[async_trait]
impl FeedAdapter for TicketsqueezeCsvAdapter {
    fn format(&self) -> FeedFormat {
        FeedFormat::TicketsqueezeCsv
    }

    fn parse(&self, feed: &RawFeed, ctx: &AdapterContext) -> Result<ParsedFeed, AdapterError> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(feed.body.as_slice());
        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| AdapterError::Decode {
                format: self.format(),
                message: e.to_string(),
            })?
            .iter()
            .map(|h| h.trim_start_matches('\u{feff}').trim().to_ascii_lowercase())
            .collect();

        let mut parsed = ParsedFeed::default();
        for (position, result) in reader.records().enumerate() {
            let record = match result {
                Ok(record) => record,
                Err(err) => {
                    parsed.reject(position, None, format!("unreadable CSV row: {err}"));
                    continue;
                }
            };
            let row = Row {
                cells: headers
                    .iter()
                    .cloned()
                    .zip(record.iter().map(ToString::to_string))
                    .collect(),
            };
            match Self::normalize(&row, ctx) {
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
    use chrono::{NaiveDate, Utc};
    use remap_core::Coordinates;

    fn raw(body: &str) -> RawFeed {
        RawFeed {
            provider: "ticketsqueeze".to_string(),
            format: FeedFormat::TicketsqueezeCsv,
            source: "inline".to_string(),
            fetched_at: Utc::now(),
            body: body.as_bytes().to_vec(),
            archived: None,
        }
    }

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> Option<NaiveDateTime> {
        NaiveDate::from_ymd_opt(y, m, d).and_then(|date| date.and_hms_opt(h, min, s))
    }

    #[test]
    fn column_aliases_and_date_rules() {
        let body = "\
event_id,event_name,venue_name,venue_address,venue_city,lat,lon,event_date,event_time,url
TS1,Opera Night,Teatro La Fenice,Campo San Fantin 1965,Venezia,45.4336,12.3343,2026-10-02,20:30,https://ts.example/1
TS2,Matinee,Teatro Verdi,,Padova,,,2026-10-03,,
";
        let parsed = TicketsqueezeCsvAdapter
            .parse(&raw(body), &AdapterContext::default())
            .expect("parse");
        assert!(parsed.malformed.is_empty());

        let first = &parsed.records[0];
        assert_eq!(first.title, "Opera Night");
        assert_eq!(first.description, "Opera Night");
        assert_eq!(first.coordinates, Some(Coordinates::new(12.3343, 45.4336)));
        assert_eq!(first.start_date, at(2026, 10, 2, 20, 30, 0));
        // event_date doubles as the end date; without end_time it closes the day.
        assert_eq!(first.end_date, at(2026, 10, 2, 23, 59, 59));
        assert_eq!(first.credits.as_deref(), Some("TicketSqueeze - Events Data"));

        let second = &parsed.records[1];
        assert_eq!(second.coordinates, None);
        assert_eq!(second.address, None);
        assert_eq!(second.start_date, at(2026, 10, 3, 0, 0, 0));
    }

    #[test]
    fn explicit_end_columns_win_and_missing_end_falls_back_to_start_day() {
        let body = "\
event_id,title,start_date,start_time,end_date,end_time
A,Fair,2026-05-01,10:00,2026-05-03,18:00
B,Walk,2026-05-02T08:15:00,,,
";
        let parsed = TicketsqueezeCsvAdapter
            .parse(&raw(body), &AdapterContext::default())
            .expect("parse");
        assert_eq!(parsed.records[0].end_date, at(2026, 5, 3, 18, 0, 0));
        assert_eq!(parsed.records[1].start_date, at(2026, 5, 2, 8, 15, 0));
        assert_eq!(parsed.records[1].end_date, at(2026, 5, 2, 23, 59, 59));
    }

    #[test]
    fn rows_without_id_are_quarantined() {
        let body = "event_id,title\n,Nameless\nC,Kept\n";
        let parsed = TicketsqueezeCsvAdapter
            .parse(&raw(body), &AdapterContext::default())
            .expect("parse");
        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.malformed[0].position, 0);
        assert_eq!(parsed.malformed[0].reason, "missing event_id");
    }
}
