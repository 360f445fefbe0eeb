//! Acquisition pipeline (C4).
//!
//! For every (dataset, file) discovered by the catalogue: decide whether
//! a transfer is required by comparing target metadata against the
//! source object, and if so stream-decrypt the source into the target,
//! stamping the target with metadata that makes the comparison
//! idempotent on the next run.

use std::collections::HashMap;
use std::time::Instant;

use chrono::Utc;
use tracing::{info, warn};

use crate::catalogue;
use crate::crypto::{self, CredentialsProvider};
use crate::dataset::{metadata_keys, DatasetDefinition, StorageObject};
use crate::errors::Error;
use crate::objectstore::{normalize_etag, ByteCounterSink, ObjectStoreReader, ObjectStoreWriter};
use crate::reporting::{AcquisitionDetails, FileStatus, ImportFileRecord, ImportReport, ReportingService, RunStatus};

/// Run acquisition for one import, discovering file sets over the last
/// `lookback_days` days and transferring whatever the target store is
/// missing or stale on. Returns as soon as the in-memory report has
/// recorded completion; the caller is responsible for persisting it.
pub async fn run(
    report: &mut ImportReport,
    datasets: &[DatasetDefinition],
    external: &dyn ObjectStoreReader,
    internal: &dyn ObjectStoreWriter,
    credentials: &dyn CredentialsProvider,
    reporting: &ReportingService,
    lookback_days: u32,
) -> Result<(), Error> {
    let (from, to) = catalogue::lookback_range(lookback_days);
    let file_sets = catalogue::discover(external, datasets, from, to).await?;

    let total: usize = file_sets.iter().map(|set| set.files.len()).sum();

    report.acquisition.status = RunStatus::Started;
    report.acquisition.files_discovered = total as u64;
    report.acquisition.started_at = Some(Utc::now());
    reporting.persist(report).await?;

    let mut processed = 0u64;
    let mut skipped = 0u64;

    for file_set in &file_sets {
        for file in &file_set.files {
            let key = &file.object.key;

            match acquire_one(&file.object, external, internal, credentials).await {
                Ok(Some(outcome)) => {
                    processed += 1;
                    let record = ImportFileRecord {
                        import_id: report.import_id.clone(),
                        file_key: key.clone(),
                        dataset_name: file_set.dataset.name.clone(),
                        etag: Some(outcome.target_etag),
                        file_size: outcome.bytes_written,
                        status: FileStatus::Acquired,
                        acquisition: Some(AcquisitionDetails { decryption_duration_ms: outcome.duration_ms }),
                        ingestion: None,
                        error: None,
                    };
                    reporting.record_file(&record).await?;
                    info!(dataset = file_set.dataset.name, key, "acquired file");
                }
                Ok(None) => {
                    // Skipped files were recorded by a previous run; no
                    // new ImportFileRecord is written for them.
                    skipped += 1;
                    info!(dataset = file_set.dataset.name, key, "skipping, target already up to date");
                }
                Err(err) => {
                    let record = ImportFileRecord {
                        import_id: report.import_id.clone(),
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
                        warn!(error = %reporting_err, "failed to persist acquisition failure record");
                    }

                    report.acquisition.files_processed = processed;
                    report.acquisition.files_skipped = skipped;
                    report.acquisition.files_failed = total as u64 - processed - skipped;
                    reporting.persist(report).await.ok();

                    return Err(err);
                }
            }
        }
    }

    report.acquisition.status = RunStatus::Completed;
    report.acquisition.files_processed = processed;
    report.acquisition.files_skipped = skipped;
    report.acquisition.files_failed = 0;
    report.acquisition.completed_at = Some(Utc::now());
    reporting.persist(report).await?;

    Ok(())
}

struct AcquireOutcome {
    target_etag: String,
    bytes_written: u64,
    duration_ms: u64,
}

/// Returns `Ok(None)` when the target is already up to date (skip),
/// `Ok(Some(outcome))` on a completed transfer, or `Err` on fatal
/// failure.
async fn acquire_one(
    source: &StorageObject,
    external: &dyn ObjectStoreReader,
    internal: &dyn ObjectStoreWriter,
    credentials: &dyn CredentialsProvider,
) -> Result<Option<AcquireOutcome>, Error> {
    let key = &source.key;

    if !needs_transfer(internal, key, source).await? {
        return Ok(None);
    }

    let started = Instant::now();

    let mut reader = external.open_read(key).await?;
    let (password, salt) = credentials.credentials_for(key).await?;
    let writer = internal.open_write(key, "text/csv").await?;
    let mut counting_sink = ByteCounterSink::new(writer);

    crypto::decrypt(reader.as_mut(), &mut counting_sink, &password, &salt, source.content_length).await?;

    let bytes_written = counting_sink.bytes_written();
    let sink: Box<dyn crate::objectstore::ByteSink> = Box::new(counting_sink);
    sink.close().await?;

    let mut metadata = HashMap::new();
    metadata.insert(metadata_keys::SOURCE_ENCRYPTED_LENGTH.to_string(), source.content_length.to_string());
    let normalized_source_etag = normalize_etag(source.etag.as_deref().unwrap_or(""));
    metadata.insert(metadata_keys::SOURCE_ETAG.to_string(), normalized_source_etag);
    internal.set_metadata(key, metadata).await?;

    let target_meta = internal
        .get_metadata(key)
        .await?
        .ok_or_else(|| Error::Storage(format!("target object {key} vanished immediately after upload")))?;
    let target_etag = target_meta.etag.unwrap_or_default();

    Ok(Some(AcquireOutcome { target_etag, bytes_written, duration_ms: started.elapsed().as_millis() as u64 }))
}

async fn needs_transfer(
    internal: &dyn ObjectStoreWriter,
    target_key: &str,
    source: &StorageObject,
) -> Result<bool, Error> {
    let Some(target) = internal.get_metadata(target_key).await? else {
        return Ok(true);
    };

    let (Some(stored_len), Some(stored_etag)) =
        (target.metadata(metadata_keys::SOURCE_ENCRYPTED_LENGTH), target.metadata(metadata_keys::SOURCE_ETAG))
    else {
        return Ok(true);
    };

    let stored_len: u64 = match stored_len.parse() {
        Ok(len) => len,
        Err(_) => return Ok(true),
    };
    if stored_len != source.content_length {
        return Ok(true);
    }

    let normalized_stored = normalize_etag(stored_etag);
    let normalized_source = normalize_etag(source.etag.as_deref().unwrap_or(""));
    Ok(normalized_stored != normalized_source)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap as Map;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use bytes::Bytes;

    use super::*;
    use crate::objectstore::{ByteSink, ByteSource};

    struct FakeStore {
        objects: Mutex<Map<String, (Vec<u8>, Map<String, String>)>>,
    }

    impl FakeStore {
        fn new() -> Self {
            FakeStore { objects: Mutex::new(Map::new()) }
        }

        fn put(&self, key: &str, data: Vec<u8>) {
            self.objects.lock().unwrap().insert(key.to_string(), (data, Map::new()));
        }
    }

    struct FakeSource {
        remaining: std::collections::VecDeque<Bytes>,
    }

    #[async_trait]
    impl ByteSource for FakeSource {
        async fn read_chunk(&mut self) -> Result<Option<Bytes>, Error> {
            Ok(self.remaining.pop_front())
        }
    }

    struct FakeSink {
        key: String,
        store: std::sync::Arc<FakeStore>,
        buffer: Vec<u8>,
    }

    #[async_trait]
    impl ByteSink for FakeSink {
        async fn write(&mut self, chunk: &[u8]) -> Result<(), Error> {
            self.buffer.extend_from_slice(chunk);
            Ok(())
        }

        async fn flush(&mut self) -> Result<(), Error> {
            Ok(())
        }

        async fn close(self: Box<Self>) -> Result<(), Error> {
            self.store.objects.lock().unwrap().insert(self.key.clone(), (self.buffer, Map::new()));
            Ok(())
        }
    }

    // The traits are implemented for `Arc<FakeStore>` rather than
    // `FakeStore` directly so `open_write` can hand its sink a cheap
    // clone of the same shared store to write back into on `close`.
    #[async_trait]
    impl ObjectStoreReader for std::sync::Arc<FakeStore> {
        async fn open_read(&self, key: &str) -> Result<Box<dyn ByteSource>, Error> {
            let data = self.objects.lock().unwrap().get(key).map(|(d, _)| d.clone()).unwrap_or_default();
            Ok(Box::new(FakeSource { remaining: vec![Bytes::from(data)].into() }))
        }

        async fn exists(&self, key: &str) -> Result<bool, Error> {
            Ok(self.objects.lock().unwrap().contains_key(key))
        }

        async fn get_metadata(&self, key: &str) -> Result<Option<StorageObject>, Error> {
            Ok(self.objects.lock().unwrap().get(key).map(|(data, meta)| StorageObject {
                key: key.to_string(),
                content_length: data.len() as u64,
                etag: Some(format!("\"{}\"", data.len())),
                last_modified: None,
                user_metadata: meta.clone(),
            }))
        }

        async fn list(&self, _prefix: &str) -> Result<Vec<StorageObject>, Error> {
            Ok(Vec::new())
        }
    }

    #[async_trait]
    impl ObjectStoreWriter for std::sync::Arc<FakeStore> {
        async fn open_write(&self, key: &str, _content_type: &str) -> Result<Box<dyn ByteSink>, Error> {
            Ok(Box::new(FakeSink { key: key.to_string(), store: self.clone(), buffer: Vec::new() }))
        }

        async fn set_metadata(&self, key: &str, metadata: Map<String, String>) -> Result<(), Error> {
            if let Some(entry) = self.objects.lock().unwrap().get_mut(key) {
                entry.1 = metadata;
            }
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<(), Error> {
            self.objects.lock().unwrap().remove(key);
            Ok(())
        }
    }

    #[tokio::test]
    async fn needs_transfer_when_target_missing() {
        let store = std::sync::Arc::new(FakeStore::new());
        let source = StorageObject {
            key: "a".into(),
            content_length: 10,
            etag: Some("\"abc\"".into()),
            last_modified: None,
            user_metadata: Map::new(),
        };
        assert!(needs_transfer(&store, "a", &source).await.unwrap());
    }

    #[tokio::test]
    async fn skips_when_metadata_matches() {
        let store = std::sync::Arc::new(FakeStore::new());
        store.put("a", vec![0u8; 10]);
        let mut meta = Map::new();
        meta.insert(metadata_keys::SOURCE_ENCRYPTED_LENGTH.to_string(), "10".to_string());
        meta.insert(metadata_keys::SOURCE_ETAG.to_string(), "abc".to_string());
        store.set_metadata("a", meta).await.unwrap();

        let source =
            StorageObject { key: "a".into(), content_length: 10, etag: Some("\"ABC\"".into()), last_modified: None, user_metadata: Map::new() };
        assert!(!needs_transfer(&store, "a", &source).await.unwrap());
    }

    #[tokio::test]
    async fn transfers_when_length_differs() {
        let store = std::sync::Arc::new(FakeStore::new());
        store.put("a", vec![0u8; 10]);
        let mut meta = Map::new();
        meta.insert(metadata_keys::SOURCE_ENCRYPTED_LENGTH.to_string(), "99".to_string());
        meta.insert(metadata_keys::SOURCE_ETAG.to_string(), "abc".to_string());
        store.set_metadata("a", meta).await.unwrap();

        let source =
            StorageObject { key: "a".into(), content_length: 10, etag: Some("\"abc\"".into()), last_modified: None, user_metadata: Map::new() };
        assert!(needs_transfer(&store, "a", &source).await.unwrap());
    }
}
