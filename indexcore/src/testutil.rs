// Copyright (C) 2024 RecordManager-rs contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.

//! An in-memory `DocumentStore` fake, in the spirit of the `TestSandbox`
//! helper this codebase's teacher crate provides for pipeline tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::error::CoreResult;
use crate::model::{DedupGroup, SourceRecord};
use crate::store::{DedupFilter, DocumentStore, FindOptions, RecordFilter};

#[derive(Default)]
struct QueueCollection {
    ids: Vec<String>,
    final_: bool,
    low_water: Option<OffsetDateTime>,
    high_water: Option<OffsetDateTime>,
}

pub struct InMemoryStore {
    records: Mutex<HashMap<String, SourceRecord>>,
    dedups: Mutex<HashMap<String, DedupGroup>>,
    state: Mutex<HashMap<String, String>>,
    queues: Mutex<HashMap<String, QueueCollection>>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        InMemoryStore {
            records: Mutex::new(HashMap::new()),
            dedups: Mutex::new(HashMap::new()),
            state: Mutex::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
        }
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_record(&self, record: SourceRecord) {
        self.records.lock().unwrap().insert(record.id.clone(), record);
    }

    pub fn put_dedup(&self, group: DedupGroup) {
        self.dedups.lock().unwrap().insert(group.id.clone(), group);
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn find_records(
        &self,
        filter: &RecordFilter,
        _options: &FindOptions,
    ) -> CoreResult<Vec<SourceRecord>> {
        let records = self.records.lock().unwrap();
        let mut out: Vec<SourceRecord> = records
            .values()
            .filter(|r| {
                if let Some(single) = &filter.single_id {
                    return &r.id == single && r.dedup_id.is_none();
                }
                if let Some(since) = filter.updated_since {
                    if r.date < since {
                        return false;
                    }
                }
                if !filter.source_included(&r.source_id) {
                    return false;
                }
                if let Some(require_dedup) = filter.require_dedup_id {
                    if r.dedup_id.is_some() != require_dedup {
                        return false;
                    }
                }
                if filter.exclude_deleted && r.deleted {
                    return false;
                }
                true
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    async fn get_record(&self, id: &str) -> CoreResult<Option<SourceRecord>> {
        Ok(self.records.lock().unwrap().get(id).cloned())
    }

    async fn get_dedup(&self, id: &str) -> CoreResult<Option<DedupGroup>> {
        Ok(self.dedups.lock().unwrap().get(id).cloned())
    }

    async fn find_dedups(&self, filter: &DedupFilter) -> CoreResult<Vec<DedupGroup>> {
        let dedups = self.dedups.lock().unwrap();
        let mut out: Vec<DedupGroup> = dedups
            .values()
            .filter(|d| {
                if let Some(single) = &filter.single_id {
                    return &d.id == single;
                }
                if let Some(since) = filter.changed_since {
                    return d.changed >= since;
                }
                true
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    async fn find_component_parts(
        &self,
        linking_ids: &[String],
        source_ids: &[String],
    ) -> CoreResult<Vec<SourceRecord>> {
        let records = self.records.lock().unwrap();
        let mut out: Vec<SourceRecord> = records
            .values()
            .filter(|r| {
                !r.deleted
                    && r.host_record_ids.iter().any(|h| linking_ids.contains(h))
                    && (source_ids.is_empty() || source_ids.iter().any(|s| s == &r.source_id))
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    async fn latest_record_timestamp(&self) -> CoreResult<Option<OffsetDateTime>> {
        Ok(self.records.lock().unwrap().values().map(|r| r.date).max())
    }

    async fn get_state(&self, key: &str) -> CoreResult<Option<String>> {
        Ok(self.state.lock().unwrap().get(key).cloned())
    }

    async fn save_state(&self, key: &str, value: &str) -> CoreResult<()> {
        self.state
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get_existing_queue_collection(
        &self,
        selection_hash: &str,
        from: Option<OffsetDateTime>,
        to: OffsetDateTime,
    ) -> CoreResult<Option<String>> {
        let queues = self.queues.lock().unwrap();
        if let Some(q) = queues.get(selection_hash) {
            if q.final_ && q.high_water.map(|hw| hw >= to).unwrap_or(false) {
                let covers_from = match (q.low_water, from) {
                    (Some(lw), Some(f)) => lw <= f,
                    (_, None) => true,
                    (None, Some(_)) => false,
                };
                if covers_from {
                    return Ok(Some(selection_hash.to_string()));
                }
            }
        }
        Ok(None)
    }

    async fn new_queue_collection(&self, selection_hash: &str) -> CoreResult<String> {
        self.queues
            .lock()
            .unwrap()
            .insert(selection_hash.to_string(), QueueCollection::default());
        Ok(selection_hash.to_string())
    }

    async fn add_id_to_queue(&self, collection: &str, id: &str) -> CoreResult<()> {
        self.queues
            .lock()
            .unwrap()
            .entry(collection.to_string())
            .or_default()
            .ids
            .push(id.to_string());
        Ok(())
    }

    async fn get_queued_ids(&self, collection: &str) -> CoreResult<Vec<String>> {
        Ok(self
            .queues
            .lock()
            .unwrap()
            .get(collection)
            .map(|q| q.ids.clone())
            .unwrap_or_default())
    }

    async fn finalize_queue_collection(
        &self,
        collection: &str,
        low_water: OffsetDateTime,
        high_water: OffsetDateTime,
    ) -> CoreResult<()> {
        if let Some(q) = self.queues.lock().unwrap().get_mut(collection) {
            q.final_ = true;
            q.low_water = Some(low_water);
            q.high_water = Some(high_water);
        }
        Ok(())
    }

    async fn drop_queue_collection(&self, collection: &str) -> CoreResult<()> {
        self.queues.lock().unwrap().remove(collection);
        Ok(())
    }

    async fn cleanup_queue_collections(&self, max_high_water: OffsetDateTime) -> CoreResult<()> {
        self.queues
            .lock()
            .unwrap()
            .retain(|_, q| !q.final_ || q.high_water.map(|hw| hw >= max_high_water).unwrap_or(true));
        Ok(())
    }

    async fn reconnect(&self) -> CoreResult<()> {
        Ok(())
    }
}
