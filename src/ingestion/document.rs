//! Document construction (§4.5.1).
//!
//! Builds the composite `_id` and the field map for one CSV row, and merges
//! it against whatever already exists for that id so accumulator columns
//! get set-union rather than overwrite semantics. The merged result is the
//! same value used both as the bulk-write payload and as a lineage event's
//! `new_values`, so there is exactly one place that computes "what should
//! this document look like now".

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use mongodb::bson::{Bson, Document};

use crate::dataset::DatasetDefinition;

/// One parsed CSV row, header name to raw (already-unquoted) field value.
pub type RawRow = HashMap<String, String>;

/// Join the dataset's primary-key column values, in declared order, with
/// `"__"`. Empty key parts are kept verbatim.
pub fn composite_id(dataset: &DatasetDefinition, row: &RawRow) -> String {
    dataset
        .primary_key_headers
        .iter()
        .map(|header| row.get(header).map(|s| s.as_str()).unwrap_or(""))
        .collect::<Vec<_>>()
        .join("__")
}

/// Build the full desired document for an `I`/`U` row, merging against
/// `existing` (the document currently stored under this `_id`, if any).
///
/// Non-accumulator columns are overwritten by the new row's value (empty
/// string maps to BSON null). Accumulator columns are unioned: the new
/// value is added to whatever array already exists unless it is empty, in
/// which case the existing array is left untouched (or initialised empty
/// on insert).
pub fn merge_document(
    dataset: &DatasetDefinition,
    row: &RawRow,
    existing: Option<&Document>,
    now: DateTime<Utc>,
) -> Document {
    let mut doc = Document::new();
    let id = composite_id(dataset, row);
    doc.insert("_id", id);

    for (header, value) in row {
        if dataset.accumulators.contains(header) {
            let mut set: BTreeSet<String> = existing
                .and_then(|d| d.get_array(header).ok())
                .map(|arr| arr.iter().filter_map(|v| v.as_str()).map(|s| s.to_string()).collect())
                .unwrap_or_default();
            if !value.is_empty() {
                set.insert(value.clone());
            }
            doc.insert(header, Bson::Array(set.into_iter().map(Bson::String).collect()));
        }
        else if value.is_empty() {
            doc.insert(header, Bson::Null);
        }
        else {
            doc.insert(header, Bson::String(value.clone()));
        }
    }

    let created_at = existing.and_then(|d| d.get_datetime("created_at").ok()).copied();
    doc.insert("created_at", created_at.unwrap_or_else(|| now.into()));
    doc.insert("updated_at", Bson::DateTime(now.into()));
    doc.insert("is_deleted", false);
    doc
}

/// The update applied to an existing document for a `D` row: flip
/// `is_deleted`, stamp `deleted_at`/`updated_at`, leave every other field
/// as-is.
pub fn soft_delete_update(now: DateTime<Utc>) -> Document {
    mongodb::bson::doc! {
        "$set": {
            "is_deleted": true,
            "deleted_at": now,
            "updated_at": now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset() -> DatasetDefinition {
        DatasetDefinition {
            name: "farms".to_string(),
            file_prefix_format: "FARMS_{date}".to_string(),
            date_pattern: "%Y%m%d".to_string(),
            datetime_pattern: "%Y%m%d%H%M%S".to_string(),
            primary_key_headers: vec!["REGION".to_string(), "FARM_ID".to_string()],
            change_type_header: "CHANGE_TYPE".to_string(),
            accumulators: ["DISEASE_TYPE".to_string()].into_iter().collect(),
            delimiter: b',',
        }
    }

    fn row(pairs: &[(&str, &str)]) -> RawRow {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn composite_id_joins_pk_columns_in_order() {
        let row = row(&[("REGION", "NORTH"), ("FARM_ID", "F001")]);
        assert_eq!(composite_id(&dataset(), &row), "NORTH__F001");
    }

    #[test]
    fn composite_id_keeps_empty_parts() {
        let row = row(&[("REGION", ""), ("FARM_ID", "F002")]);
        assert_eq!(composite_id(&dataset(), &row), "__F002");
    }

    #[test]
    fn merge_maps_empty_scalar_to_null() {
        let now = Utc::now();
        let row = row(&[("REGION", "NORTH"), ("FARM_ID", "F001"), ("NAME", "")]);
        let doc = merge_document(&dataset(), &row, None, now);
        assert_eq!(doc.get("NAME"), Some(&Bson::Null));
    }

    #[test]
    fn merge_unions_accumulator_values() {
        let now = Utc::now();
        let first = row(&[("REGION", "NORTH"), ("FARM_ID", "F001"), ("DISEASE_TYPE", "BVD")]);
        let inserted = merge_document(&dataset(), &first, None, now);

        let second = row(&[("REGION", "NORTH"), ("FARM_ID", "F001"), ("DISEASE_TYPE", "IBR")]);
        let updated = merge_document(&dataset(), &second, Some(&inserted), now);

        let values: Vec<&str> = updated.get_array("DISEASE_TYPE").unwrap().iter().filter_map(|v| v.as_str()).collect();
        assert_eq!(values.len(), 2);
        assert!(values.contains(&"BVD"));
        assert!(values.contains(&"IBR"));
    }

    #[test]
    fn merge_preserves_created_at_across_updates() {
        let now = Utc::now();
        let row1 = row(&[("REGION", "NORTH"), ("FARM_ID", "F001")]);
        let inserted = merge_document(&dataset(), &row1, None, now);
        let created = inserted.get_datetime("created_at").unwrap().to_owned();

        let later = now + chrono::Duration::hours(1);
        let updated = merge_document(&dataset(), &row1, Some(&inserted), later);
        assert_eq!(updated.get_datetime("created_at").unwrap().to_owned(), created);
    }
}
