//! CLI progress-bar helpers, adapted from the teacher's `indicatif` bar
//! builders. These are a thin subscriber over `ImportReport` counters, not
//! a second source of truth: `ImportBars::update_from_report` is called
//! after every `ReportingService::persist` and just reflects whatever is
//! already in the report.

use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use crate::reporting::{ImportReport, RunStatus};

pub static PROGRESS_TEMPLATE: &str = "[{elapsed_precise}] {bar:40.cyan/blue} {human_pos:>7}/{human_len:7} {msg}";
pub static SPINNER_TEMPLATE: &str = "[{elapsed_precise}] {spinner:2.cyan/blue} {msg}";
pub static SPINNER_TOTALS_TEMPLATE: &str = "{spinner:2.cyan/blue} {msg}: {human_pos}";

pub fn new_spinner(message: &str) -> ProgressBar {
    let style = ProgressStyle::with_template(SPINNER_TEMPLATE).expect("invalid spinner template");
    ProgressBar::new_spinner().with_message(message.to_string()).with_style(style)
}

pub fn new_progress_bar(total: u64, message: &str) -> ProgressBar {
    let style = ProgressStyle::with_template(PROGRESS_TEMPLATE).expect("invalid progress bar template");
    ProgressBar::new(total).with_message(message.to_string()).with_style(style)
}

pub fn new_spinner_totals(message: &str) -> ProgressBar {
    let style = ProgressStyle::with_template(SPINNER_TOTALS_TEMPLATE).expect("invalid spinner template");
    ProgressBar::new_spinner().with_message(message.to_string()).with_style(style)
}

/// Two bars tracking one import run: file-level acquisition progress and
/// row-level ingestion progress for whichever file is current.
pub struct ImportBars {
    _bars: MultiProgress,
    pub files: ProgressBar,
    pub rows: ProgressBar,
}

impl ImportBars {
    pub fn new() -> Self {
        let bars = MultiProgress::new();
        let files = new_spinner_totals("Files acquired");
        let rows = new_spinner("Ingesting");
        bars.add(files.clone());
        bars.add(rows.clone());
        files.enable_steady_tick(Duration::from_millis(200));
        rows.enable_steady_tick(Duration::from_millis(200));
        ImportBars { _bars: bars, files, rows }
    }

    pub fn update_from_report(&self, report: &ImportReport) {
        self.files.set_position(report.acquisition.files_processed + report.acquisition.files_skipped);
        self.files.set_length(report.acquisition.files_discovered);

        match &report.ingestion.current_file_status {
            Some(status) => {
                self.rows.set_message(format!(
                    "{} ({}%, {:.0} rows/min)",
                    status.file_name, status.percentage_completed, status.rows_per_minute
                ));
            }
            None => self.rows.set_message("waiting"),
        }
    }

    pub fn finish(&self, report: &ImportReport) {
        self.update_from_report(report);
        let summary = match report.status {
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Started | RunStatus::NotStarted => "incomplete",
        };
        self.files.finish_with_message(format!("files: {summary}"));
        self.rows.finish_with_message(summary.to_string());
    }
}

impl Default for ImportBars {
    fn default() -> Self {
        Self::new()
    }
}
