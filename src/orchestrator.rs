//! Orchestrator (C9).
//!
//! `start(import_id, source_type)` sequences `start_import` → acquisition
//! → ingestion inside one reported run, same shape as the teacher's
//! `Archive::import` driving one dataset's readers/transformer/writers in
//! a fixed order. No retries, no partial-success recovery: a failed run
//! leaves the report `Failed` and the next run is idempotent by design
//! (§6 exit semantics).

use chrono::Utc;
use mongodb::Database;
use tracing::{error, info};

use crate::acquisition;
use crate::crypto::CredentialsProvider;
use crate::dataset::DatasetDefinition;
use crate::errors::Error;
use crate::ingestion;
use crate::lineage::LineageService;
use crate::objectstore::{ObjectStoreFactory, StoreSource};
use crate::reporting::{ImportReport, ReportingService, RunStatus};

pub struct Orchestrator {
    datasets: Vec<DatasetDefinition>,
    store_factory: ObjectStoreFactory,
    credentials: Box<dyn CredentialsProvider>,
    reporting: ReportingService,
    lineage: LineageService,
    database: Database,
    default_lookback_days: u32,
}

impl Orchestrator {
    pub fn new(
        datasets: Vec<DatasetDefinition>,
        store_factory: ObjectStoreFactory,
        credentials: Box<dyn CredentialsProvider>,
        reporting: ReportingService,
        lineage: LineageService,
        database: Database,
        default_lookback_days: u32,
    ) -> Self {
        Orchestrator { datasets, store_factory, credentials, reporting, lineage, database, default_lookback_days }
    }

    pub async fn start(&self, import_id: &str, source_type: &str) -> Result<ImportReport, Error> {
        let mut report = ImportReport::new(import_id, source_type);
        self.reporting.start_import(&report).await?;
        info!(import_id, source_type, "import started");

        match self.run_phases(&mut report).await {
            Ok(()) => {
                report.status = RunStatus::Completed;
                report.completed_at = Some(Utc::now());
                self.reporting.persist(&report).await?;
                info!(import_id, "import completed");
                Ok(report)
            }
            Err(err) => {
                report.status = RunStatus::Failed;
                report.error = Some(err.to_string());
                report.completed_at = Some(Utc::now());
                self.reporting.persist(&report).await.ok();
                error!(import_id, error = %err, "import failed");
                Err(err)
            }
        }
    }

    async fn run_phases(&self, report: &mut ImportReport) -> Result<(), Error> {
        let external_reader = self.store_factory.reader(StoreSource::External);
        let internal_writer = self.store_factory.writer(StoreSource::Internal);

        acquisition::run(
            report,
            &self.datasets,
            external_reader.as_ref(),
            internal_writer.as_ref(),
            self.credentials.as_ref(),
            &self.reporting,
            self.default_lookback_days,
        )
        .await?;

        self.lineage.ensure_indexes().await?;

        let internal_reader = self.store_factory.reader(StoreSource::Internal);
        ingestion::run(
            report,
            &self.datasets,
            internal_reader.as_ref(),
            &self.database,
            &self.lineage,
            &self.reporting,
            self.default_lookback_days,
        )
        .await?;

        Ok(())
    }
}
