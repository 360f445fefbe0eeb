//! Ingestion pipeline (C5).
//!
//! Runs after acquisition, against the internal store. Re-enumerates file
//! sets from the internal prefix and, per file: downloads to a temp file,
//! estimates the row count, validates the header against the dataset's
//! declared primary-key and change-type columns, then streams rows through
//! the bulk protocol (`bulk.rs`) in batches of 1,000, buffering lineage
//! events and flushing them through `lineage::LineageService`.

pub mod bulk;
pub mod document;
pub mod progress;

use std::io::Read;
use std::time::Instant;

use chrono::Utc;
use mongodb::bson::{doc, Document as BsonDocument};
use mongodb::{Collection, Database, IndexModel};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::catalogue;
use crate::dataset::{DatasetDefinition, StorageObject};
use crate::errors::{Error, SchemaError};
use crate::ingestion::document::RawRow;
use crate::ingestion::progress::ProgressTracker;
use crate::lineage::{LineageService, PendingLineageEvent};
use crate::objectstore::ObjectStoreReader;
use crate::reporting::{FileStatus, ImportFileRecord, ImportReport, IngestionDetails, ReportingService, RunStatus};

const BATCH_SIZE: usize = 1000;
const PROGRESS_EVERY_ROWS: u64 = 100;
const LINEAGE_FLUSH_THRESHOLD: usize = 500;
const DOWNLOAD_BUFFER_LEN: usize = 80 * 1024;

pub async fn run(
    report: &mut ImportReport,
    datasets: &[DatasetDefinition],
    internal: &dyn ObjectStoreReader,
    database: &Database,
    lineage: &LineageService,
    reporting: &ReportingService,
    lookback_days: u32,
) -> Result<(), Error> {
    let import_id = report.import_id.clone();
    let (from, to) = catalogue::lookback_range(lookback_days);
    let file_sets = catalogue::discover(internal, datasets, from, to).await?;

    report.ingestion.status = RunStatus::Started;
    report.ingestion.started_at = Some(Utc::now());
    reporting.persist(report).await?;

    for file_set in &file_sets {
        let collection: Collection<BsonDocument> = database.collection(&file_set.dataset.name);
        ensure_wildcard_index(&collection).await;

        for file in &file_set.files {
            let key = file.object.key.clone();

            match ingest_one(
                &file_set.dataset,
                &file.object,
                internal,
                &collection,
                lineage,
                reporting,
                &import_id,
                report,
            )
            .await
            {
                Ok(details) => {
                    report.ingestion.files_processed += 1;
                    report.ingestion.records_created += details.records_created;
                    report.ingestion.records_updated += details.records_updated;
                    report.ingestion.records_deleted += details.records_deleted;
                    report.ingestion.current_file_status = None;

                    let record = ImportFileRecord {
                        import_id: import_id.clone(),
                        file_key: key.clone(),
                        dataset_name: file_set.dataset.name.clone(),
                        etag: file.object.etag.clone(),
                        file_size: file.object.content_length,
                        status: FileStatus::Ingested,
                        acquisition: None,
                        ingestion: Some(details),
                        error: None,
                    };
                    reporting.record_file(&record).await?;
                    reporting.persist(report).await?;
                    info!(dataset = file_set.dataset.name, key, "ingested file");
                }
                Err(err) => {
                    let record = ImportFileRecord {
                        import_id: import_id.clone(),
                        file_key: key.clone(),
                        dataset_name: file_set.dataset.name.clone(),
                        etag: file.object.etag.clone(),
                        file_size: file.object.content_length,
                        status: FileStatus::Failed,
                        acquisition: None,
                        ingestion: None,
                        error: Some(err.to_string()),
                    };
                    if let Err(reporting_err) = reporting.record_file(&record).await {
                        warn!(error = %reporting_err, "failed to persist ingestion failure record");
                    }

                    report.ingestion.status = RunStatus::Failed;
                    reporting.persist(report).await.ok();
                    return Err(err);
                }
            }
        }
    }

    report.ingestion.status = RunStatus::Completed;
    report.ingestion.completed_at = Some(Utc::now());
    reporting.persist(report).await?;
    Ok(())
}

/// Idempotent; tolerate and log failure rather than aborting the import
/// over an index that may already exist under a different name.
async fn ensure_wildcard_index(collection: &Collection<BsonDocument>) {
    let model = IndexModel::builder().keys(doc! { "$**": 1 }).build();
    if let Err(err) = collection.create_index(model).await {
        warn!(error = %err, collection = collection.name(), "failed to ensure wildcard index, continuing");
    }
}

async fn ingest_one(
    dataset: &DatasetDefinition,
    source: &StorageObject,
    internal: &dyn ObjectStoreReader,
    collection: &Collection<BsonDocument>,
    lineage: &LineageService,
    reporting: &ReportingService,
    import_id: &str,
    report: &mut ImportReport,
) -> Result<IngestionDetails, Error> {
    let download_started = Instant::now();
    let temp_file = download_to_temp(internal, &source.key).await?;
    let download_duration_ms = download_started.elapsed().as_millis() as u64;

    let mut details =
        ingest_from_path(dataset, temp_file.path(), &source.key, collection, lineage, reporting, import_id, report)
            .await?;
    details.download_duration_ms = download_duration_ms;
    Ok(details)
}

/// Debug entry point shared with `ingest_one` (§B of the supplemented
/// feature list): runs the same header-validation, batching, and lineage
/// protocol directly against a local file, without an object-store
/// download or an acquisition record.
pub async fn ingest_local_file(
    dataset: &DatasetDefinition,
    path: &std::path::Path,
    collection: &Collection<BsonDocument>,
    lineage: &LineageService,
    reporting: &ReportingService,
    import_id: &str,
    report: &mut ImportReport,
) -> Result<IngestionDetails, Error> {
    let source_key = path.to_string_lossy().to_string();
    ingest_from_path(dataset, path, &source_key, collection, lineage, reporting, import_id, report).await
}

#[allow(clippy::too_many_arguments)]
async fn ingest_from_path(
    dataset: &DatasetDefinition,
    path: &std::path::Path,
    source_key: &str,
    collection: &Collection<BsonDocument>,
    lineage: &LineageService,
    reporting: &ReportingService,
    import_id: &str,
    report: &mut ImportReport,
) -> Result<IngestionDetails, Error> {
    let total_rows_estimate = estimate_row_count(path)?;

    let mut csv_reader = csv::ReaderBuilder::new().delimiter(dataset.delimiter).has_headers(true).from_path(path)?;

    let headers: Vec<String> =
        csv_reader.headers()?.iter().map(|h| h.trim().trim_matches('"').trim().to_string()).collect();
    validate_headers(dataset, &headers)?;

    let mut tracker = ProgressTracker::new(source_key.to_string(), total_rows_estimate);
    let mut rows_since_progress: u64 = 0;

    let mut batch: Vec<RawRow> = Vec::with_capacity(BATCH_SIZE);
    let mut pending_events: Vec<PendingLineageEvent> = Vec::new();

    let mut records_created = 0u64;
    let mut records_updated = 0u64;
    let mut records_deleted = 0u64;
    let mut records_skipped = 0u64;
    let mut records_processed = 0u64;

    for result in csv_reader.records() {
        let record = result?;
        let row: RawRow = headers
            .iter()
            .zip(record.iter())
            .map(|(header, value)| (header.clone(), value.to_string()))
            .collect();
        batch.push(row);
        records_processed += 1;
        rows_since_progress += 1;

        if rows_since_progress >= PROGRESS_EVERY_ROWS {
            report.ingestion.current_file_status = Some(tracker.advance(rows_since_progress));
            rows_since_progress = 0;
            reporting.persist(report).await?;
        }

        if batch.len() >= BATCH_SIZE {
            let outcome =
                bulk::apply_batch(collection, dataset, std::mem::take(&mut batch), import_id, source_key, Utc::now())
                    .await?;
            records_created += outcome.created;
            records_updated += outcome.updated;
            records_deleted += outcome.deleted;
            records_skipped += outcome.skipped;
            pending_events.extend(outcome.lineage_events);

            if pending_events.len() >= LINEAGE_FLUSH_THRESHOLD {
                lineage.record_events(std::mem::take(&mut pending_events)).await?;
            }
        }
    }

    if !batch.is_empty() {
        let outcome = bulk::apply_batch(collection, dataset, batch, import_id, source_key, Utc::now()).await?;
        records_created += outcome.created;
        records_updated += outcome.updated;
        records_deleted += outcome.deleted;
        records_skipped += outcome.skipped;
        pending_events.extend(outcome.lineage_events);
    }

    if rows_since_progress > 0 {
        report.ingestion.current_file_status = Some(tracker.advance(rows_since_progress));
    }
    report.ingestion.current_file_status = Some(tracker.complete());

    if !pending_events.is_empty() {
        lineage.record_events(pending_events).await?;
    }

    // `temp_file` (a `tempfile::NamedTempFile`) deletes its backing file on
    // drop, on every exit path including the `?` early returns above.
    Ok(IngestionDetails {
        records_processed,
        records_created,
        records_updated,
        records_deleted,
        records_skipped,
        download_duration_ms: 0,
    })
}

fn validate_headers(dataset: &DatasetDefinition, headers: &[String]) -> Result<(), Error> {
    let available: std::collections::HashSet<&str> = headers.iter().map(|h| h.as_str()).collect();
    let mut missing = Vec::new();
    for required in dataset.primary_key_headers.iter().chain(std::iter::once(&dataset.change_type_header)) {
        if !available.contains(required.as_str()) {
            missing.push(required.clone());
        }
    }
    if !missing.is_empty() {
        return Err(SchemaError::MissingColumns { missing, available: headers.to_vec() }.into());
    }
    Ok(())
}

async fn download_to_temp(internal: &dyn ObjectStoreReader, key: &str) -> Result<tempfile::NamedTempFile, Error> {
    let temp_file = tempfile::NamedTempFile::new()?;
    let std_file = temp_file.reopen()?;
    let mut writer = tokio::fs::File::from_std(std_file);

    let mut source = internal.open_read(key).await?;
    while let Some(chunk) = source.read_chunk().await? {
        writer.write_all(&chunk).await?;
    }
    writer.flush().await?;
    Ok(temp_file)
}

/// Count newline-terminated lines minus one (header), treating a trailing
/// non-newlined row as present, reading in `DOWNLOAD_BUFFER_LEN` chunks so
/// this never loads the whole file into memory.
fn estimate_row_count(path: &std::path::Path) -> Result<u64, Error> {
    let mut file = std::fs::File::open(path)?;
    let mut buf = vec![0u8; DOWNLOAD_BUFFER_LEN];
    let mut newline_count: u64 = 0;
    let mut saw_any_byte = false;
    let mut last_byte = 0u8;

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        saw_any_byte = true;
        for &b in &buf[..n] {
            if b == b'\n' {
                newline_count += 1;
            }
        }
        last_byte = buf[n - 1];
    }

    let trailing_row_without_newline = saw_any_byte && last_byte != b'\n';
    Ok(newline_count.saturating_sub(1) + u64::from(trailing_row_without_newline))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_headers_accepts_all_present() {
        let dataset = test_dataset();
        let headers = vec!["REGION".to_string(), "FARM_ID".to_string(), "CHANGE_TYPE".to_string()];
        assert!(validate_headers(&dataset, &headers).is_ok());
    }

    #[test]
    fn validate_headers_rejects_missing_pk_column() {
        let dataset = test_dataset();
        let headers = vec!["REGION".to_string(), "CHANGE_TYPE".to_string()];
        let err = validate_headers(&dataset, &headers).unwrap_err();
        assert!(matches!(err, Error::Schema(SchemaError::MissingColumns { .. })));
    }

    fn test_dataset() -> DatasetDefinition {
        DatasetDefinition {
            name: "farms".to_string(),
            file_prefix_format: "FARMS_{date}".to_string(),
            date_pattern: "%Y%m%d".to_string(),
            datetime_pattern: "%Y%m%d%H%M%S".to_string(),
            primary_key_headers: vec!["REGION".to_string(), "FARM_ID".to_string()],
            change_type_header: "CHANGE_TYPE".to_string(),
            accumulators: Default::default(),
            delimiter: b',',
        }
    }

    #[test]
    fn estimate_row_count_counts_trailing_row_without_newline() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        use std::io::Write;
        write!(file, "header\nrow1\nrow2").unwrap();
        let estimate = estimate_row_count(file.path()).unwrap();
        assert_eq!(estimate, 2);
    }

    #[test]
    fn estimate_row_count_handles_trailing_newline() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        use std::io::Write;
        write!(file, "header\nrow1\nrow2\n").unwrap();
        let estimate = estimate_row_count(file.path()).unwrap();
        assert_eq!(estimate, 2);
    }
}
