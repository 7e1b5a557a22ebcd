use std::path::{Path, PathBuf};

use remap_adapters::{adapter_for_format, AdapterContext, FeedFormat, FeedLocation};
use remap_storage::{ArtifactStore, HttpClientConfig, HttpFetcher};
use tempfile::tempdir;
use uuid::Uuid;

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

fn ctx(provider: &str, credits: Option<&str>) -> AdapterContext {
    AdapterContext {
        provider: provider.to_string(),
        credits: credits.map(ToString::to_string),
        ..AdapterContext::default()
    }
}

#[tokio::test]
async fn fixture_feeds_parse_through_their_adapters() {
    let http = HttpFetcher::new(HttpClientConfig::default()).expect("http");
    let cases = [
        ("ticketmaster", FeedFormat::Ticketmaster, "fixtures/ticketmaster/feed.json", 2usize, 1usize),
        ("unpli", FeedFormat::RemapJson, "fixtures/unpli/deskline.json", 4, 1),
        ("unpli", FeedFormat::RemapJson, "fixtures/unpli/events.json", 4, 0),
        ("ticketsqueeze", FeedFormat::TicketsqueezeCsv, "fixtures/ticketsqueeze/feed.csv", 2, 1),
    ];

    for (provider, format, rel, records, malformed) in cases {
        let adapter = adapter_for_format(format);
        let location = FeedLocation::File(workspace_root().join(rel));
        let feed = adapter
            .fetch(&http, None, Uuid::new_v4(), provider, &location)
            .await
            .expect("fetch fixture");
        let parsed = adapter.parse(&feed, &ctx(provider, None)).expect("parse fixture");

        assert_eq!(parsed.records.len(), records, "{rel}");
        assert_eq!(parsed.malformed.len(), malformed, "{rel}");
        for record in &parsed.records {
            assert!(!record.id.is_empty());
            assert_eq!(record.fingerprint, record.compute_fingerprint(), "{rel}");
        }
    }
}

#[tokio::test]
async fn deskline_and_normalized_exports_agree_on_ids() {
    let http = HttpFetcher::new(HttpClientConfig::default()).expect("http");
    let adapter = adapter_for_format(FeedFormat::RemapJson);
    let mut ids = Vec::new();
    for rel in ["fixtures/unpli/deskline.json", "fixtures/unpli/events.json"] {
        let feed = adapter
            .fetch(&http, None, Uuid::new_v4(), "unpli", &FeedLocation::File(workspace_root().join(rel)))
            .await
            .expect("fetch");
        let parsed = adapter.parse(&feed, &ctx("unpli", Some("UNPLI Veneto"))).expect("parse");
        ids.push(parsed.records.iter().map(|r| r.id.clone()).collect::<Vec<_>>());
    }
    assert_eq!(ids[0], ids[1]);
}

#[tokio::test]
async fn fetched_feeds_are_archived_once_per_body() {
    let dir = tempdir().expect("tempdir");
    let archive = ArtifactStore::new(dir.path());
    let http = HttpFetcher::new(HttpClientConfig::default()).expect("http");
    let adapter = adapter_for_format(FeedFormat::TicketsqueezeCsv);
    let location = FeedLocation::File(workspace_root().join("fixtures/ticketsqueeze/feed.csv"));

    let feed = adapter
        .fetch(&http, Some(&archive), Uuid::new_v4(), "ticketsqueeze", &location)
        .await
        .expect("fetch");
    let stored = feed.archived.expect("archived");
    assert!(stored.absolute_path.exists());
    assert_eq!(stored.absolute_path.extension().and_then(|e| e.to_str()), Some("csv"));
    assert_eq!(stored.byte_size, feed.body.len());
}

#[tokio::test]
async fn missing_feed_file_is_a_fetch_failure() {
    let http = HttpFetcher::new(HttpClientConfig::default()).expect("http");
    let adapter = adapter_for_format(FeedFormat::Ticketmaster);
    let err = adapter
        .fetch(
            &http,
            None,
            Uuid::new_v4(),
            "ticketmaster",
            &FeedLocation::File(workspace_root().join("fixtures/ticketmaster/absent.json")),
        )
        .await
        .expect_err("missing file");
    assert!(matches!(err, remap_adapters::AdapterError::Read { .. }));
}
