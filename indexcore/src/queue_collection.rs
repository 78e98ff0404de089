// Copyright (C) 2024 RecordManager-rs contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.

//! §4.H Queue Collection Manager: materializes (or reuses) the set of
//! dedup-group ids the merged stream should visit.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use time::OffsetDateTime;
use tracing::warn;

use crate::error::CoreResult;
use crate::store::{DedupFilter, DocumentStore, FindOptions, RecordFilter};

/// Identifies which records/dedup-groups a queue collection was built from.
/// The content hash of this selection (plus the time window) is the queue
/// collection's identity.
#[derive(Debug, Clone)]
pub struct QueueSelectionParams {
    pub source_ids: Vec<String>,
    pub single_id: Option<String>,
}

impl QueueSelectionParams {
    pub fn content_hash(&self) -> String {
        let mut hasher = DefaultHasher::new();
        let mut sources = self.source_ids.clone();
        sources.sort();
        sources.hash(&mut hasher);
        self.single_id.hash(&mut hasher);
        format!("queue-{:016x}", hasher.finish())
    }
}

pub struct QueueCollectionManager {
    store: Arc<dyn DocumentStore>,
}

impl QueueCollectionManager {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        QueueCollectionManager { store }
    }

    /// Returns an existing, reusable `final` collection covering
    /// `[from, latest]`, or builds a fresh one in two stages.
    pub async fn get_or_build(
        &self,
        params: &QueueSelectionParams,
        from: Option<OffsetDateTime>,
        latest: OffsetDateTime,
    ) -> CoreResult<String> {
        let hash = params.content_hash();
        if let Some(existing) = self.store.get_existing_queue_collection(&hash, from, latest).await? {
            return Ok(existing);
        }
        self.build(params, &hash, from, latest).await
    }

    async fn build(
        &self,
        params: &QueueSelectionParams,
        hash: &str,
        from: Option<OffsetDateTime>,
        latest: OffsetDateTime,
    ) -> CoreResult<String> {
        self.gc_before_build(latest).await?;
        let collection = self.store.new_queue_collection(hash).await?;

        let mut written = 0usize;

        // Stage 1: record-driven discovery, dedup-id-only projection, in
        // dedup-id order, enqueue on each change of id.
        let record_filter = RecordFilter {
            included_sources: if params.source_ids.is_empty() {
                None
            } else {
                Some(params.source_ids.clone())
            },
            single_id: params.single_id.clone(),
            updated_since: from,
            require_dedup_id: Some(true),
            ..Default::default()
        };
        let options = FindOptions {
            dedup_id_only: true,
            order_by_dedup_id: true,
        };
        let records = self.store.find_records(&record_filter, &options).await?;
        let mut last_dedup_id: Option<String> = None;
        for record in records {
            let Some(dedup_id) = record.dedup_id else { continue };
            if last_dedup_id.as_deref() != Some(dedup_id.as_str()) {
                self.store.add_id_to_queue(&collection, &dedup_id).await?;
                written += 1;
                last_dedup_id = Some(dedup_id);
            }
        }

        // Stage 2: dedup-group-driven discovery.
        let dedup_filter = if let Some(single) = &params.single_id {
            DedupFilter {
                single_id: Some(single.clone()),
                changed_since: None,
            }
        } else if let Some(from) = from {
            DedupFilter {
                single_id: None,
                changed_since: Some(from),
            }
        } else {
            warn!("queue-build-without-from-date-may-include-stale-deleted-groups");
            DedupFilter::default()
        };
        let mut seen = std::collections::HashSet::new();
        for group in self.store.find_dedups(&dedup_filter).await? {
            if seen.insert(group.id.clone()) {
                self.store.add_id_to_queue(&collection, &group.id).await?;
                written += 1;
            }
        }

        if written > 0 {
            let low_water = from.unwrap_or(OffsetDateTime::UNIX_EPOCH);
            self.store.finalize_queue_collection(&collection, low_water, latest).await?;
        } else {
            self.store.drop_queue_collection(&collection).await?;
        }
        Ok(collection)
    }

    async fn gc_before_build(&self, latest: OffsetDateTime) -> CoreResult<()> {
        self.store.cleanup_queue_collections(latest).await
    }

    pub async fn queued_ids(&self, collection: &str) -> CoreResult<Vec<String>> {
        self.store.get_queued_ids(collection).await
    }

    /// Drops a `building` collection on interrupted shutdown (§4.H,
    /// "A `building` collection is dropped on clean shutdown").
    pub async fn drop_on_interrupt(&self, collection: &str) -> CoreResult<()> {
        self.store.drop_queue_collection(collection).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DedupGroup, SourceRecord};
    use crate::testutil::InMemoryStore;
    use time::macros::datetime;

    fn record(id: &str, source: &str, dedup_id: Option<&str>) -> SourceRecord {
        SourceRecord {
            id: id.to_string(),
            source_id: source.to_string(),
            format: "Book".to_string(),
            original_data: String::new(),
            linking_ids: Vec::new(),
            host_record_ids: Vec::new(),
            deleted: false,
            created: datetime!(2024-01-01 00:00 UTC),
            date: datetime!(2024-01-02 00:00 UTC),
            dedup_id: dedup_id.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn builds_queue_from_records_and_dedups() {
        let store = Arc::new(InMemoryStore::new());
        store.put_record(record("a.1", "a", Some("D1")));
        store.put_record(record("a.2", "a", Some("D1")));
        store.put_dedup(DedupGroup {
            id: "D1".to_string(),
            member_ids: vec!["a.1".to_string(), "a.2".to_string()],
            deleted: false,
            changed: datetime!(2024-01-02 00:00 UTC),
        });

        let manager = QueueCollectionManager::new(store);
        let params = QueueSelectionParams {
            source_ids: vec![],
            single_id: None,
        };
        let collection = manager
            .get_or_build(&params, None, datetime!(2024-01-03 00:00 UTC))
            .await
            .unwrap();
        let ids = manager.queued_ids(&collection).await.unwrap();
        assert!(ids.contains(&"D1".to_string()));
    }

    #[tokio::test]
    async fn reuses_existing_final_collection_covering_window() {
        let store = Arc::new(InMemoryStore::new());
        store.put_record(record("a.1", "a", Some("D1")));
        store.put_dedup(DedupGroup {
            id: "D1".to_string(),
            member_ids: vec!["a.1".to_string()],
            deleted: false,
            changed: datetime!(2024-01-02 00:00 UTC),
        });
        let manager = QueueCollectionManager::new(store);
        let params = QueueSelectionParams {
            source_ids: vec![],
            single_id: None,
        };
        let first = manager
            .get_or_build(&params, None, datetime!(2024-01-03 00:00 UTC))
            .await
            .unwrap();
        let second = manager
            .get_or_build(&params, None, datetime!(2024-01-03 00:00 UTC))
            .await
            .unwrap();
        assert_eq!(first, second);
    }
}
