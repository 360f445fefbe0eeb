//! Lineage store (C6).
//!
//! An append-only per-record event log with a current-status projection.
//! Two collections: `lineage_parents` (one row per `(collection, record_id)`,
//! current status only) and `lineage_events` (one row per change applied to
//! that record, immutable once written). Both use deterministic ids so
//! retries and reruns never create duplicates, the same idempotency
//! property the acquisition target-metadata compare gives C4.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::stream::TryStreamExt;
use mongodb::bson::{doc, Document};
use mongodb::options::{FindOptions, IndexOptions};
use mongodb::{Collection, Database, IndexModel};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::Error;

pub const PARENTS_COLLECTION: &str = "lineage_parents";
pub const EVENTS_COLLECTION: &str = "lineage_events";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LineageStatus {
    Active,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LineageEventType {
    Created,
    Updated,
    Deleted,
    Undeleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineageParent {
    #[serde(rename = "_id")]
    pub id: String,
    pub collection_name: String,
    pub record_id: String,
    pub current_status: LineageStatus,
    pub created_by_import: String,
    pub last_modified_by_import: String,
    pub created_at: DateTime<Utc>,
    pub last_modified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineageEvent {
    #[serde(rename = "_id")]
    pub id: String,
    pub lineage_parent_id: String,
    pub collection_name: String,
    pub record_id: String,
    pub event_type: LineageEventType,
    pub import_id: String,
    pub file_key: String,
    pub event_time: DateTime<Utc>,
    pub change_type: String,
    pub previous_values: Option<Document>,
    pub new_values: Option<Document>,
}

/// Deterministic parent id: URL-safe base64 (no padding) of the SHA-256
/// digest of `collection_name || "__" || record_id`. Stable across runs.
pub fn parent_id(collection_name: &str, record_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(collection_name.as_bytes());
    hasher.update(b"__");
    hasher.update(record_id.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Deterministic event id: same construction over
/// `collection_name || "__" || record_id || "__" || event_time_iso`, so the
/// same event re-applied (e.g. on a rerun) always hashes to the same id.
/// The hash itself carries no temporal ordering; retrieval orders events by
/// the stored `event_time` field, not by id.
pub fn event_id(collection_name: &str, record_id: &str, event_time: DateTime<Utc>) -> String {
    let iso = event_time.to_rfc3339_opts(SecondsFormat::Nanos, true);
    let mut hasher = Sha256::new();
    hasher.update(collection_name.as_bytes());
    hasher.update(b"__");
    hasher.update(record_id.as_bytes());
    hasher.update(b"__");
    hasher.update(iso.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// One pending mutation to append to the lineage log, produced by the
/// ingestion bulk protocol (§4.5.2) before it is flushed here.
pub struct PendingLineageEvent {
    pub collection_name: String,
    pub record_id: String,
    pub event_type: LineageEventType,
    pub import_id: String,
    pub file_key: String,
    pub event_time: DateTime<Utc>,
    pub change_type: String,
    pub previous_values: Option<Document>,
    pub new_values: Option<Document>,
}

pub struct LineageService {
    database: Database,
}

impl LineageService {
    pub fn new(database: Database) -> Self {
        LineageService { database }
    }

    fn parents(&self) -> Collection<LineageParent> {
        self.database.collection(PARENTS_COLLECTION)
    }

    fn events(&self) -> Collection<LineageEvent> {
        self.database.collection(EVENTS_COLLECTION)
    }

    /// Idempotent; call once per process before the first write.
    pub async fn ensure_indexes(&self) -> Result<(), Error> {
        let model = IndexModel::builder()
            .keys(doc! { "lineage_parent_id": 1 })
            .options(IndexOptions::builder().build())
            .build();
        self.events().create_index(model).await?;
        Ok(())
    }

    /// Upsert one parent row per distinct `(collection_name, record_id)` in
    /// `pending`, then insert every event. Parent upserts use set-on-insert
    /// for immutables and set for mutables, matching §4.6; both steps use
    /// unordered semantics so one failing document never blocks another.
    pub async fn record_events(&self, pending: Vec<PendingLineageEvent>) -> Result<(), Error> {
        if pending.is_empty() {
            return Ok(());
        }

        let mut seen_parents = std::collections::HashSet::new();
        for event in &pending {
            let pid = parent_id(&event.collection_name, &event.record_id);
            if !seen_parents.insert(pid.clone()) {
                continue;
            }
            let status = match event.event_type {
                LineageEventType::Deleted => LineageStatus::Deleted,
                _ => LineageStatus::Active,
            };
            self.upsert_parent(&pid, event, status).await?;
        }

        let rows: Vec<LineageEvent> = pending
            .into_iter()
            .map(|event| {
                let pid = parent_id(&event.collection_name, &event.record_id);
                let id = event_id(&event.collection_name, &event.record_id, event.event_time);
                LineageEvent {
                    id,
                    lineage_parent_id: pid,
                    collection_name: event.collection_name,
                    record_id: event.record_id,
                    event_type: event.event_type,
                    import_id: event.import_id,
                    file_key: event.file_key,
                    event_time: event.event_time,
                    change_type: event.change_type,
                    previous_values: event.previous_values,
                    new_values: event.new_values,
                }
            })
            .collect();

        self.events().insert_many(rows).ordered(false).await?;
        Ok(())
    }

    async fn upsert_parent(&self, pid: &str, event: &PendingLineageEvent, status: LineageStatus) -> Result<(), Error> {
        let status_str = match status {
            LineageStatus::Active => "Active",
            LineageStatus::Deleted => "Deleted",
        };
        let filter = doc! { "_id": pid };
        let update = doc! {
            "$setOnInsert": {
                "_id": pid,
                "record_id": &event.record_id,
                "collection_name": &event.collection_name,
                "created_by_import": &event.import_id,
                "created_at": event.event_time,
            },
            "$set": {
                "current_status": status_str,
                "last_modified_by_import": &event.import_id,
                "last_modified_at": event.event_time,
            },
        };
        self.parents().update_one(filter, update).upsert(true).await?;
        Ok(())
    }

    /// `(parent, events ascending by id)` for one record, or `None` if it
    /// has no lineage yet.
    pub async fn get_lifecycle(
        &self,
        collection_name: &str,
        record_id: &str,
    ) -> Result<Option<(LineageParent, Vec<LineageEvent>)>, Error> {
        let pid = parent_id(collection_name, record_id);
        let Some(parent) = self.parents().find_one(doc! { "_id": &pid }).await? else {
            return Ok(None);
        };

        let options = FindOptions::builder().sort(doc! { "event_time": 1 }).build();
        let mut cursor = self.events().find(doc! { "lineage_parent_id": &pid }).with_options(options).await?;
        let mut events = Vec::new();
        while let Some(event) = cursor.try_next().await? {
            events.push(event);
        }
        Ok(Some((parent, events)))
    }

    pub async fn get_lifecycle_page(
        &self,
        collection_name: &str,
        record_id: &str,
        skip: u64,
        top: i64,
    ) -> Result<Option<LifecyclePage>, Error> {
        let pid = parent_id(collection_name, record_id);
        let Some(parent) = self.parents().find_one(doc! { "_id": &pid }).await? else {
            return Ok(None);
        };

        let total_events = self.events().count_documents(doc! { "lineage_parent_id": &pid }).await?;
        let options = FindOptions::builder().sort(doc! { "event_time": 1 }).skip(skip).limit(top).build();
        let mut cursor = self.events().find(doc! { "lineage_parent_id": &pid }).with_options(options).await?;
        let mut events = Vec::new();
        while let Some(event) = cursor.try_next().await? {
            events.push(event);
        }

        Ok(Some(LifecyclePage { total_events, skip, top, count: events.len() as u64, events, parent }))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LifecyclePage {
    pub total_events: u64,
    pub skip: u64,
    pub top: i64,
    pub count: u64,
    pub events: Vec<LineageEvent>,
    pub parent: LineageParent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_id_is_deterministic() {
        let a = parent_id("farms", "NORTH__F001");
        let b = parent_id("farms", "NORTH__F001");
        assert_eq!(a, b);
        assert!(!a.contains('='));
        assert_eq!(a.len(), 43);
    }

    #[test]
    fn parent_id_is_sensitive_to_inputs() {
        assert_ne!(parent_id("farms", "NORTH__F001"), parent_id("farms", "NORTH__F002"));
        assert_ne!(parent_id("farms", "NORTH__F001"), parent_id("cattle", "NORTH__F001"));
    }

    #[test]
    fn event_id_is_deterministic_and_distinct_per_time() {
        let t1 = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().to_utc();
        let t2 = DateTime::parse_from_rfc3339("2026-01-02T00:00:00Z").unwrap().to_utc();
        let id1a = event_id("farms", "NORTH__F001", t1);
        let id1b = event_id("farms", "NORTH__F001", t1);
        assert_eq!(id1a, id1b);

        let id2 = event_id("farms", "NORTH__F001", t2);
        assert_ne!(id1a, id2);
    }
}
