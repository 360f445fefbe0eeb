//! Import reporting (C7).
//!
//! One `ImportReport` document per run, one `ImportFileRecord` document
//! per `(import_id, file_key)`. Every phase transition mutates an
//! in-memory report and then upserts the whole document, mirroring the
//! teacher's "mutate in memory, upsert the whole row" pattern in
//! `loggers::datasets::Datasets::import` (there an upsert-on-conflict for
//! a dataset row; here an upsert-on-conflict for a run's report).

use chrono::{DateTime, Utc};
use mongodb::bson::doc;
use mongodb::options::FindOptions;
use mongodb::{Collection, Database};
use serde::{Deserialize, Serialize};

use crate::errors::Error;

pub const REPORTS_COLLECTION: &str = "import_reports";
pub const FILES_COLLECTION: &str = "import_files";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    NotStarted,
    Started,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentFileStatus {
    pub file_name: String,
    pub total_rows_estimate: u64,
    pub row_number: u64,
    /// 0-99 until `Complete()` runs, at which point it is forced to 100.
    pub percentage_completed: u8,
    pub rows_per_minute: f64,
    pub estimated_time_remaining_secs: Option<f64>,
    pub estimated_completion: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionPhase {
    pub status: RunStatus,
    pub files_discovered: u64,
    pub files_processed: u64,
    pub files_skipped: u64,
    pub files_failed: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl AcquisitionPhase {
    pub fn not_started() -> Self {
        AcquisitionPhase {
            status: RunStatus::NotStarted,
            files_discovered: 0,
            files_processed: 0,
            files_skipped: 0,
            files_failed: 0,
            started_at: None,
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionPhase {
    pub status: RunStatus,
    pub files_processed: u64,
    pub records_created: u64,
    pub records_updated: u64,
    pub records_deleted: u64,
    pub current_file_status: Option<CurrentFileStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl IngestionPhase {
    pub fn not_started() -> Self {
        IngestionPhase {
            status: RunStatus::NotStarted,
            files_processed: 0,
            records_created: 0,
            records_updated: 0,
            records_deleted: 0,
            current_file_status: None,
            started_at: None,
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportReport {
    pub import_id: String,
    pub source_type: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub acquisition: AcquisitionPhase,
    pub ingestion: IngestionPhase,
    pub error: Option<String>,
}

impl ImportReport {
    pub fn new(import_id: impl Into<String>, source_type: impl Into<String>) -> Self {
        ImportReport {
            import_id: import_id.into(),
            source_type: source_type.into(),
            status: RunStatus::Started,
            started_at: Utc::now(),
            completed_at: None,
            acquisition: AcquisitionPhase::not_started(),
            ingestion: IngestionPhase::not_started(),
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileStatus {
    Acquired,
    Ingested,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionDetails {
    pub decryption_duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionDetails {
    pub records_processed: u64,
    pub records_created: u64,
    pub records_updated: u64,
    pub records_deleted: u64,
    pub records_skipped: u64,
    pub download_duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportFileRecord {
    pub import_id: String,
    pub file_key: String,
    pub dataset_name: String,
    pub etag: Option<String>,
    pub file_size: u64,
    pub status: FileStatus,
    pub acquisition: Option<AcquisitionDetails>,
    pub ingestion: Option<IngestionDetails>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportSummary {
    pub import_id: String,
    pub source_type: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

pub struct ReportingService {
    database: Database,
}

impl ReportingService {
    pub fn new(database: Database) -> Self {
        ReportingService { database }
    }

    fn reports(&self) -> Collection<ImportReport> {
        self.database.collection(REPORTS_COLLECTION)
    }

    fn files(&self) -> Collection<ImportFileRecord> {
        self.database.collection(FILES_COLLECTION)
    }

    pub async fn start_import(&self, report: &ImportReport) -> Result<(), Error> {
        self.persist(report).await
    }

    /// Every phase transition is a whole-document upsert keyed by
    /// `import_id`, so callers just mutate their in-memory copy and call
    /// this after each transition.
    pub async fn persist(&self, report: &ImportReport) -> Result<(), Error> {
        self.reports()
            .replace_one(doc! { "import_id": &report.import_id }, report)
            .upsert(true)
            .await?;
        Ok(())
    }

    pub async fn record_file(&self, record: &ImportFileRecord) -> Result<(), Error> {
        self.files()
            .replace_one(doc! { "import_id": &record.import_id, "file_key": &record.file_key }, record)
            .upsert(true)
            .await?;
        Ok(())
    }

    /// Defense-in-depth point query against target-metadata idempotency
    /// (§4.4). `spec.md` §9 marks this redundant with the metadata
    /// compare and says implementers may omit calling it; acquisition in
    /// this crate does not call it, but it is kept available for
    /// operational debugging (e.g. via the CLI) since the query itself is
    /// cheap and harmless.
    pub async fn is_file_processed(&self, file_key: &str, etag: &str) -> Result<bool, Error> {
        let filter = doc! {
            "file_key": file_key,
            "etag": etag,
            "status": { "$in": ["Acquired", "Ingested"] },
        };
        Ok(self.files().find_one(filter).await?.is_some())
    }

    pub async fn get_import_summaries(&self, skip: u64, top: i64) -> Result<Vec<ImportSummary>, Error> {
        let options = FindOptions::builder().sort(doc! { "started_at": -1 }).skip(skip).limit(top).build();
        let mut cursor = self.reports().clone_with_type::<ImportSummary>().find(doc! {}).with_options(options).await?;

        let mut summaries = Vec::new();
        use futures::stream::TryStreamExt;
        while let Some(summary) = cursor.try_next().await? {
            summaries.push(summary);
        }
        Ok(summaries)
    }
}
