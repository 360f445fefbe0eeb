//! Bulk write protocol (§4.5.2).
//!
//! Applies one batch of parsed rows against a dataset's collection:
//! query existing documents by `_id` in one round trip, then build one
//! write model per row and execute the whole batch as a single unordered
//! bulk write so an independent document's failure never blocks another,
//! producing the pending lineage events the caller flushes through
//! `lineage::LineageService`.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use futures::stream::TryStreamExt;
use mongodb::bson::{doc, Document};
use mongodb::{Collection, ReplaceOneModel, UpdateOneModel, WriteModel};
use tracing::warn;

use crate::dataset::DatasetDefinition;
use crate::errors::{Error, RowError};
use crate::ingestion::document::{composite_id, merge_document, soft_delete_update, RawRow};
use crate::lineage::{LineageEventType, PendingLineageEvent};

#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub created: u64,
    pub updated: u64,
    pub deleted: u64,
    pub skipped: u64,
    pub lineage_events: Vec<PendingLineageEvent>,
}

pub async fn apply_batch(
    collection: &Collection<Document>,
    dataset: &DatasetDefinition,
    rows: Vec<RawRow>,
    import_id: &str,
    file_key: &str,
    now: DateTime<Utc>,
) -> Result<BatchOutcome, Error> {
    let mut outcome = BatchOutcome::default();

    let mut ids = Vec::with_capacity(rows.len());
    let mut parsed_rows = Vec::with_capacity(rows.len());
    for row in rows {
        let change_type =
            row.get(&dataset.change_type_header).map(|s| s.trim().to_uppercase()).unwrap_or_default();
        if !matches!(change_type.as_str(), "I" | "U" | "D") {
            let row_error = RowError::UnknownChangeType(change_type.clone());
            warn!(error = %row_error, "skipping row with unrecognised change_type");
            outcome.skipped += 1;
            continue;
        }
        let id = composite_id(dataset, &row);
        ids.push(id.clone());
        parsed_rows.push((id, change_type, row));
    }

    if parsed_rows.is_empty() {
        return Ok(outcome);
    }

    // Step 1: query existing docs by `_id ∈ batch` in one round-trip.
    let mut existing: HashMap<String, Document> = HashMap::new();
    let filter = doc! { "_id": { "$in": &ids } };
    let mut cursor = collection.find(filter).await?;
    while let Some(doc) = cursor.try_next().await? {
        if let Ok(id) = doc.get_str("_id") {
            existing.insert(id.to_string(), doc.clone());
        }
    }

    // Step 2: soft_deleted_ids = ids of existing docs with is_deleted=true.
    let soft_deleted_ids: HashSet<String> = existing
        .iter()
        .filter(|(_, doc)| doc.get_bool("is_deleted").unwrap_or(false))
        .map(|(id, _)| id.clone())
        .collect();

    // Step 3: build one write model per row. Nothing is sent to the
    // server yet, so a later row never prevents an earlier one from being
    // attempted.
    let namespace = collection.namespace();
    let mut models = Vec::with_capacity(parsed_rows.len());

    for (id, change_type, row) in parsed_rows {
        let existing_doc = existing.get(&id);

        if change_type == "D" {
            models.push(WriteModel::UpdateOne(
                UpdateOneModel::builder()
                    .namespace(namespace.clone())
                    .filter(doc! { "_id": &id })
                    .update(soft_delete_update(now))
                    .build(),
            ));
            outcome.deleted += 1;
            outcome.lineage_events.push(PendingLineageEvent {
                collection_name: dataset.name.clone(),
                record_id: id,
                event_type: LineageEventType::Deleted,
                import_id: import_id.to_string(),
                file_key: file_key.to_string(),
                event_time: now,
                change_type,
                previous_values: existing_doc.cloned(),
                new_values: None,
            });
            continue;
        }

        let merged = merge_document(dataset, &row, existing_doc, now);
        models.push(WriteModel::ReplaceOne(
            ReplaceOneModel::builder()
                .namespace(namespace.clone())
                .filter(doc! { "_id": &id })
                .replacement(merged.clone())
                .upsert(true)
                .build(),
        ));

        let event_type = if soft_deleted_ids.contains(&id) {
            LineageEventType::Undeleted
        }
        else if existing_doc.is_none() {
            LineageEventType::Created
        }
        else {
            LineageEventType::Updated
        };

        match event_type {
            LineageEventType::Created => outcome.created += 1,
            LineageEventType::Updated | LineageEventType::Undeleted => outcome.updated += 1,
            LineageEventType::Deleted => unreachable!("D rows already handled above"),
        }

        outcome.lineage_events.push(PendingLineageEvent {
            collection_name: dataset.name.clone(),
            record_id: id,
            event_type,
            import_id: import_id.to_string(),
            file_key: file_key.to_string(),
            event_time: now,
            change_type,
            previous_values: existing_doc.cloned(),
            new_values: Some(merged),
        });
    }

    // Step 4: one round-trip for the whole batch, unordered so an error on
    // one document's write is reported without stopping the rest from
    // being applied (§4.5.2 step 4, §5 ordering guarantee (b)).
    collection.client().bulk_write(models).ordered(false).await?;

    Ok(outcome)
}
