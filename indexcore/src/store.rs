// Copyright (C) 2024 RecordManager-rs contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.

//! The document store is an external collaborator: a queryable
//! record and dedup-group collection. This module only defines the
//! interface the core depends on; a concrete
//! implementation lives outside this crate. [`crate::testutil`] provides an
//! in-memory fake used by this crate's own tests.

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::error::CoreResult;
use crate::model::{DedupGroup, SourceRecord};

/// Selects which records a stream operation should visit.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub single_id: Option<String>,
    pub updated_since: Option<OffsetDateTime>,
    pub included_sources: Option<Vec<String>>,
    pub excluded_sources: Vec<String>,
    pub excluded_source_patterns: Vec<String>,
    pub require_dedup_id: Option<bool>,
    pub exclude_deleted: bool,
}

impl RecordFilter {
    pub fn source_included(&self, source_id: &str) -> bool {
        if let Some(included) = &self.included_sources {
            if !included.iter().any(|s| s == source_id) {
                return false;
            }
        }
        if self.excluded_sources.iter().any(|s| s == source_id) {
            return false;
        }
        if self
            .excluded_source_patterns
            .iter()
            .any(|pattern| regex_matches(pattern, source_id))
        {
            return false;
        }
        true
    }
}

fn regex_matches(pattern: &str, value: &str) -> bool {
    regex::Regex::new(pattern)
        .map(|re| re.is_match(value))
        .unwrap_or(false)
}

#[derive(Debug, Clone, Default)]
pub struct DedupFilter {
    pub single_id: Option<String>,
    pub changed_since: Option<OffsetDateTime>,
}

/// Options for [`DocumentStore::find_records`]: ordering and field
/// projection are collaborator-specific, so only the knobs the core relies
/// on are modeled here.
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub dedup_id_only: bool,
    pub order_by_dedup_id: bool,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn find_records(
        &self,
        filter: &RecordFilter,
        options: &FindOptions,
    ) -> CoreResult<Vec<SourceRecord>>;

    async fn get_record(&self, id: &str) -> CoreResult<Option<SourceRecord>>;

    async fn get_dedup(&self, id: &str) -> CoreResult<Option<DedupGroup>>;

    async fn find_dedups(&self, filter: &DedupFilter) -> CoreResult<Vec<DedupGroup>>;

    /// Records whose `host_record_ids` intersects any of `linking_ids`,
    /// restricted to `source_ids` when non-empty. Backs component-part
    /// discovery for a host record (§4.F step 2).
    async fn find_component_parts(
        &self,
        linking_ids: &[String],
        source_ids: &[String],
    ) -> CoreResult<Vec<SourceRecord>>;

    /// Most recent `date` among all non-deleted records, used to pick the
    /// merged stream's high-water mark.
    async fn latest_record_timestamp(&self) -> CoreResult<Option<OffsetDateTime>>;

    async fn get_state(&self, key: &str) -> CoreResult<Option<String>>;
    async fn save_state(&self, key: &str, value: &str) -> CoreResult<()>;

    async fn get_existing_queue_collection(
        &self,
        selection_hash: &str,
        from: Option<OffsetDateTime>,
        to: OffsetDateTime,
    ) -> CoreResult<Option<String>>;
    async fn new_queue_collection(&self, selection_hash: &str) -> CoreResult<String>;
    async fn add_id_to_queue(&self, collection: &str, id: &str) -> CoreResult<()>;
    async fn get_queued_ids(&self, collection: &str) -> CoreResult<Vec<String>>;
    async fn finalize_queue_collection(
        &self,
        collection: &str,
        low_water: OffsetDateTime,
        high_water: OffsetDateTime,
    ) -> CoreResult<()>;
    async fn drop_queue_collection(&self, collection: &str) -> CoreResult<()>;
    async fn cleanup_queue_collections(&self, max_high_water: OffsetDateTime) -> CoreResult<()>;

    /// Reopens the store's connection; called by each worker on init and by
    /// the merged-stream sibling after it starts.
    async fn reconnect(&self) -> CoreResult<()>;
}
