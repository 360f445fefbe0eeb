mod acquisition;
mod catalogue;
mod config;
mod crypto;
mod dataset;
mod errors;
mod ingestion;
mod lineage;
mod objectstore;
mod orchestrator;
mod query;
mod reporting;
mod utils;

use std::path::PathBuf;

use clap::{Args, Parser};
use mongodb::Client as MongoClient;
use tracing_subscriber::fmt::format::FmtSpan;
use uuid::Uuid;

use crate::config::Settings;
use crate::crypto::StaticCredentialsProvider;
use crate::errors::Error;
use crate::lineage::LineageService;
use crate::objectstore::ObjectStoreFactory;
use crate::orchestrator::Orchestrator;
use crate::query::{QueryFacade, QueryParams};
use crate::reporting::ReportingService;

/// The reference-data ETL engine.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Run acquisition then ingestion for one import.
    Run {
        /// Source type recorded on the report, e.g. "scheduled" or "manual".
        #[arg(long, default_value = "manual")]
        source_type: String,
        /// Override the configured default lookback window in days.
        #[arg(long)]
        lookback_days: Option<u32>,
    },

    /// Re-ingest a single already-decrypted CSV file on disk, outside the
    /// object store, against a named dataset collection. Exercises the
    /// same ingestion code path `run` uses (§B of SPEC_FULL.md).
    IngestFile(IngestFileArgs),

    /// Run an ad-hoc filter/sort/select query against a dataset collection.
    Query(QueryArgs),

    /// Print the full lifecycle (lineage events) of one record.
    Lineage {
        /// Target dataset collection name.
        collection: String,
        /// The record's composite `_id`, e.g. "NORTH__F001".
        record_id: String,
    },
}

#[derive(Args)]
struct IngestFileArgs {
    /// Dataset name as declared in datasets.toml.
    dataset: String,
    /// Path to the CSV file to ingest.
    path: PathBuf,
}

#[derive(Args)]
struct QueryArgs {
    /// Dataset collection name.
    collection: String,
    #[arg(long)]
    filter: Option<String>,
    #[arg(long)]
    order_by: Option<String>,
    #[arg(long)]
    select: Option<String>,
    #[arg(long)]
    skip: Option<u64>,
    #[arg(long)]
    top: Option<i64>,
    #[arg(long)]
    count: bool,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt::fmt().with_span_events(FmtSpan::CLOSE).with_target(false).with_level(true).init();

    let cli = Cli::parse();
    let settings = Settings::load()?;

    let mongo_client = MongoClient::with_uri_str(&settings.document_store.uri)
        .await
        .map_err(Error::Document)?;
    let database = mongo_client.database(&settings.document_store.database);

    match cli.command {
        Commands::Run { source_type, lookback_days } => {
            let store_factory = ObjectStoreFactory::from_settings(&settings.object_store).await?;
            let credentials =
                Box::new(StaticCredentialsProvider::new(settings.crypto.password.clone(), settings.crypto.salt.clone()));
            let reporting = ReportingService::new(database.clone());
            let lineage = LineageService::new(database.clone());
            let lookback = lookback_days.unwrap_or(settings.default_lookback_days);

            let orchestrator = Orchestrator::new(
                settings.datasets,
                store_factory,
                credentials,
                reporting,
                lineage,
                database,
                lookback,
            );

            let import_id = Uuid::new_v4().to_string();
            let bars = utils::ImportBars::new();
            let report = orchestrator.start(&import_id, &source_type).await?;
            bars.finish(&report);
        }

        Commands::IngestFile(args) => {
            let dataset = settings
                .datasets
                .iter()
                .find(|d| d.name.eq_ignore_ascii_case(&args.dataset))
                .cloned()
                .ok_or_else(|| Error::Config(format!("no dataset named '{}' in datasets.toml", args.dataset)))?;

            let collection = database.collection(&dataset.name);
            let lineage = LineageService::new(database.clone());
            lineage.ensure_indexes().await?;
            let reporting = ReportingService::new(database.clone());

            let import_id = Uuid::new_v4().to_string();
            let mut report = reporting::ImportReport::new(&import_id, "ingest-file");
            reporting.start_import(&report).await?;

            let details =
                ingestion::ingest_local_file(&dataset, &args.path, &collection, &lineage, &reporting, &import_id, &mut report)
                    .await?;
            println!(
                "processed={} created={} updated={} deleted={} skipped={}",
                details.records_processed,
                details.records_created,
                details.records_updated,
                details.records_deleted,
                details.records_skipped
            );
        }

        Commands::Query(args) => {
            let facade = QueryFacade::new(database, &settings.datasets);
            let params = QueryParams {
                filter: args.filter,
                order_by: args.order_by,
                select: args.select,
                skip: args.skip,
                top: args.top,
                count: args.count,
            };
            let result = facade.query(&args.collection, params).await?;
            let rendered = serde_json::to_string_pretty(&result)
                .map_err(|err| Error::Config(format!("failed to render query result: {err}")))?;
            println!("{rendered}");
        }

        Commands::Lineage { collection, record_id } => {
            let lineage = LineageService::new(database);
            match lineage.get_lifecycle(&collection, &record_id).await? {
                Some((parent, events)) => {
                    println!("status={:?} created_by={} last_modified_by={}", parent.current_status, parent.created_by_import, parent.last_modified_by_import);
                    for event in events {
                        println!(
                            "{} {:?} via import={} file={}",
                            event.event_time, event.event_type, event.import_id, event.file_key
                        );
                    }
                }
                None => println!("no lineage recorded for {collection}/{record_id}"),
            }
        }
    }

    Ok(())
}
