//! Static dataset definitions and the file bookkeeping types built on top
//! of the object store (`StorageObject`, `EtlFile`, `FileSet`). Loaded once
//! at startup and treated as immutable for the lifetime of the process,
//! the same way the teacher treats `arga_core::models::Dataset` metadata
//! as fixed once an import begins.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;

use crate::errors::Error;

/// One declared reference dataset. Everything in the acquisition and
/// ingestion pipelines is parameterised by one of these.
#[derive(Debug, Clone)]
pub struct DatasetDefinition {
    /// Name of the target document-store collection.
    pub name: String,
    /// Template with exactly one `{date}` slot, e.g. `"FARMS_{date}"`.
    pub file_prefix_format: String,
    /// `chrono::format::strftime` pattern used to render the date portion.
    pub date_pattern: String,
    /// `chrono::format::strftime` pattern for the 14-digit run timestamp.
    pub datetime_pattern: String,
    /// Ordered CSV column names making up the composite primary key.
    pub primary_key_headers: Vec<String>,
    /// CSV column carrying the I/U/D change-type code.
    pub change_type_header: String,
    /// CSV columns whose values accumulate (set-union) instead of
    /// overwriting on update.
    pub accumulators: BTreeSet<String>,
    /// Field delimiter byte. Pipe (`|`) in production, comma in tests.
    pub delimiter: u8,
}

impl DatasetDefinition {
    /// Render the list-prefix for one calendar date.
    pub fn prefix_for_date(&self, date: NaiveDate) -> Result<String, Error> {
        if !self.file_prefix_format.contains("{date}") {
            return Err(crate::errors::CatalogueError::MalformedPrefix {
                dataset: self.name.clone(),
                reason: "file_prefix_format is missing the {date} slot".to_string(),
            }
            .into());
        }
        let rendered = date.format(&self.date_pattern).to_string();
        Ok(self.file_prefix_format.replace("{date}", &rendered))
    }
}

/// Raw, directly-deserialisable shape of one `[[dataset]]` table in
/// `datasets.toml`. Kept separate from `DatasetDefinition` the way the
/// teacher keeps `readers::meta::Meta` separate from `arga_core::models::Dataset`,
/// so the file format and the runtime type can evolve independently.
#[derive(Debug, Clone, Deserialize)]
pub struct RawDatasetDefinition {
    pub name: String,
    pub file_prefix_format: String,
    pub date_pattern: String,
    pub datetime_pattern: String,
    pub primary_key_headers: Vec<String>,
    pub change_type_header: String,
    #[serde(default)]
    pub accumulators: Vec<String>,
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
}

fn default_delimiter() -> String {
    "|".to_string()
}

impl From<RawDatasetDefinition> for DatasetDefinition {
    fn from(raw: RawDatasetDefinition) -> Self {
        DatasetDefinition {
            name: raw.name,
            file_prefix_format: raw.file_prefix_format,
            date_pattern: raw.date_pattern,
            datetime_pattern: raw.datetime_pattern,
            primary_key_headers: raw.primary_key_headers,
            change_type_header: raw.change_type_header,
            accumulators: raw.accumulators.into_iter().collect(),
            delimiter: raw.delimiter.bytes().next().unwrap_or(b'|'),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DatasetsFile {
    #[serde(rename = "dataset", default)]
    datasets: Vec<RawDatasetDefinition>,
}

/// Parse a `datasets.toml` document into its definitions, preserving
/// declaration order.
pub fn parse_datasets_toml(contents: &str) -> Result<Vec<DatasetDefinition>, Error> {
    let file: DatasetsFile = toml::from_str(contents)?;
    Ok(file.datasets.into_iter().map(DatasetDefinition::from).collect())
}

/// An object as seen through the object-store abstraction (C1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageObject {
    pub key: String,
    pub content_length: u64,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub user_metadata: HashMap<String, String>,
}

impl StorageObject {
    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.user_metadata.get(key).map(|s| s.as_str())
    }
}

/// Well-known user-metadata keys stamped on acquisition targets.
pub mod metadata_keys {
    pub const SOURCE_ENCRYPTED_LENGTH: &str = "source_encrypted_length";
    pub const SOURCE_ETAG: &str = "source_etag";
}

/// A `StorageObject` plus the run timestamp parsed out of its filename.
#[derive(Debug, Clone)]
pub struct EtlFile {
    pub object: StorageObject,
    pub timestamp: DateTime<Utc>,
}

/// All files available for one dataset within a queried date range,
/// ordered ascending by `timestamp`, the order in which their changes
/// must be applied.
#[derive(Debug, Clone)]
pub struct FileSet {
    pub dataset: DatasetDefinition,
    pub files: Vec<EtlFile>,
}

impl FileSet {
    pub fn new(dataset: DatasetDefinition, mut files: Vec<EtlFile>) -> Self {
        files.sort_by_key(|f| f.timestamp);
        FileSet { dataset, files }
    }
}

/// Extract the trailing 14-digit run timestamp from a catalogue key.
///
/// Per §4.3: split on `.` and take the first segment, split that on `_`
/// and parse the leading 14 characters of the last segment using the
/// dataset's `datetime_pattern`, interpreted as UTC.
pub fn parse_timestamp(key: &str, datetime_pattern: &str) -> Result<DateTime<Utc>, Error> {
    let stem = key.split('.').next().unwrap_or(key);
    let last_segment = stem.rsplit('_').next().unwrap_or(stem);

    if last_segment.len() < 14 {
        return Err(crate::errors::CatalogueError::UnparseableTimestamp { key: key.to_string() }.into());
    }
    let digits = &last_segment[..14];
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(crate::errors::CatalogueError::UnparseableTimestamp { key: key.to_string() }.into());
    }

    let naive = chrono::NaiveDateTime::parse_from_str(digits, datetime_pattern)
        .map_err(|_| crate::errors::CatalogueError::UnparseableTimestamp { key: key.to_string() })?;
    Ok(DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def() -> DatasetDefinition {
        DatasetDefinition {
            name: "farms".to_string(),
            file_prefix_format: "FARMS_{date}".to_string(),
            date_pattern: "%Y%m%d".to_string(),
            datetime_pattern: "%Y%m%d%H%M%S".to_string(),
            primary_key_headers: vec!["REGION".to_string(), "FARM_ID".to_string()],
            change_type_header: "CHANGE_TYPE".to_string(),
            accumulators: BTreeSet::new(),
            delimiter: b',',
        }
    }

    #[test]
    fn prefix_substitutes_date() {
        let d = def();
        let date = NaiveDate::from_ymd_opt(2026, 7, 26).unwrap();
        assert_eq!(d.prefix_for_date(date).unwrap(), "FARMS_20260726");
    }

    #[test]
    fn parses_trailing_timestamp() {
        let ts = parse_timestamp("FARMS_20260726_20260726153000.csv", "%Y%m%d%H%M%S").unwrap();
        assert_eq!(ts.to_string(), "2026-07-26 15:30:00 UTC");
    }

    #[test]
    fn parses_timestamp_with_extra_suffix_segments() {
        let ts = parse_timestamp("FARMS_20260726153000.csv.enc", "%Y%m%d%H%M%S").unwrap();
        assert_eq!(ts.to_string(), "2026-07-26 15:30:00 UTC");
    }

    #[test]
    fn rejects_unparseable_timestamp() {
        let err = parse_timestamp("FARMS_notadate.csv", "%Y%m%d%H%M%S");
        assert!(err.is_err());
    }

    #[test]
    fn fileset_sorts_ascending_by_timestamp() {
        let newer = EtlFile {
            object: StorageObject {
                key: "b".into(),
                content_length: 1,
                etag: None,
                last_modified: None,
                user_metadata: HashMap::new(),
            },
            timestamp: DateTime::parse_from_rfc3339("2026-01-02T00:00:00Z").unwrap().to_utc(),
        };
        let older = EtlFile {
            object: StorageObject {
                key: "a".into(),
                content_length: 1,
                etag: None,
                last_modified: None,
                user_metadata: HashMap::new(),
            },
            timestamp: DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().to_utc(),
        };
        let set = FileSet::new(def(), vec![newer, older]);
        assert_eq!(set.files[0].object.key, "a");
        assert_eq!(set.files[1].object.key, "b");
    }
}
