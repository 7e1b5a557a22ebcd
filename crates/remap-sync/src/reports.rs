use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use tokio::fs;

use crate::delta::Delta;
use crate::{ProviderRunSummary, SyncRunSummary};

pub const SUMMARY_FILE: &str = "summary.json";
pub const DELTA_JSON_FILE: &str = "delta.json";
pub const DELTA_PARQUET_FILE: &str = "delta.parquet";
pub const RUN_SUMMARY_FILE: &str = "run_summary.json";

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .with_context(|| format!("serializing {}", path.display()))?;
    fs::write(path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))
}

/// `summary.json`, `delta.json` and `delta.parquet` for one provider run.
pub async fn write_provider_reports(dir: &Path, summary: &ProviderRunSummary, delta: &Delta) -> Result<()> {
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    write_json(&dir.join(SUMMARY_FILE), summary).await?;
    write_json(
        &dir.join(DELTA_JSON_FILE),
        &serde_json::json!({
            "run_id": summary.run_id,
            "provider": summary.provider,
            "summary": summary.delta,
            "entries": delta.entries().collect::<Vec<_>>(),
            "malformed": summary.malformed,
        }),
    )
    .await?;

    let path = dir.join(DELTA_PARQUET_FILE);
    let batch = delta_record_batch(delta)?;
    tokio::task::spawn_blocking(move || write_parquet(&path, batch))
        .await
        .context("joining parquet writer")??;
    Ok(())
}

pub async fn write_run_summary(dir: &Path, summary: &SyncRunSummary) -> Result<()> {
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;
    write_json(&dir.join(RUN_SUMMARY_FILE), summary).await
}

fn delta_record_batch(delta: &Delta) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("id", DataType::Utf8, false),
        ArrowField::new("kind", DataType::Utf8, false),
        ArrowField::new("old_fingerprint", DataType::Utf8, true),
        ArrowField::new("new_fingerprint", DataType::Utf8, true),
        ArrowField::new("title", DataType::Utf8, false),
    ]));

    let ids: Vec<&str> = delta.changes.iter().map(|c| c.entry.id.as_str()).collect();
    let kinds: Vec<&str> = delta.changes.iter().map(|c| c.entry.kind.as_str()).collect();
    let old_fps: Vec<Option<&str>> = delta
        .changes
        .iter()
        .map(|c| c.entry.old_fingerprint.as_deref())
        .collect();
    let new_fps: Vec<Option<&str>> = delta
        .changes
        .iter()
        .map(|c| c.entry.new_fingerprint.as_deref())
        .collect();
    let titles: Vec<&str> = delta.changes.iter().map(|c| c.record.title.as_str()).collect();

    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from(ids)),
            Arc::new(StringArray::from(kinds)),
            Arc::new(StringArray::from(old_fps)),
            Arc::new(StringArray::from(new_fps)),
            Arc::new(StringArray::from(titles)),
        ],
    )
    .context("building delta record batch")
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}
