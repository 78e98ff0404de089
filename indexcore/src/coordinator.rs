// Copyright (C) 2024 RecordManager-rs contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.

//! §4.I Indexing Coordinator: ties every other component together into the
//! two streams (per-record, merged) and the auxiliary modes (compare, dump,
//! delete-source, count-values, check-indexed-records).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tracing::{info, warn};

use crate::config::{DataSourceSettings, DataSourceTable, SolrIndexingConfig};
use crate::document_builder::{BuildInputs, DocumentBuilder, ResolvedRecord};
use crate::error::{CoreErrorKind, CoreResult};
use crate::merge_engine::MergeEngine;
use crate::metadata::{MetadataRecord, MetadataRecordRegistry};
use crate::model::{DedupGroup, FieldValue, SolrDocument, SourceRecord};
use crate::queue_collection::{QueueCollectionManager, QueueSelectionParams};
use crate::solr_client::SolrClient;
use crate::store::{DocumentStore, FindOptions, RecordFilter};
use crate::update_buffer::{BatchSink, UpdateBuffer};
use crate::worker_pool::Cancellation;

const DEFAULT_COMMIT_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_UPDATE_TIMEOUT: Duration = Duration::from_secs(300);
const PROGRESS_INTERVAL: u64 = 1000;

/// Fields every comparison ignores regardless of `ignore_in_comparison`,
/// because they are stamped by the indexing run itself rather than derived
/// from the source record.
const COMPARE_ALWAYS_IGNORE: &[&str] = &["first_indexed", "last_indexed", "_version_", "fullrecord"];

/// Parses the `--source` CLI argument: a comma-separated list of source ids,
/// where a `-name` entry excludes a source and a `-/regex/` entry excludes
/// every source id matching `regex`.
#[derive(Debug, Clone, Default)]
pub struct SourceFilter {
    included: Vec<String>,
    excluded: Vec<String>,
    excluded_patterns: Vec<String>,
}

impl SourceFilter {
    pub fn parse(spec: &str) -> SourceFilter {
        let mut filter = SourceFilter::default();
        for token in spec.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            if let Some(rest) = token.strip_prefix('-') {
                if rest.len() >= 2 && rest.starts_with('/') && rest.ends_with('/') {
                    filter.excluded_patterns.push(rest[1..rest.len() - 1].to_string());
                } else {
                    filter.excluded.push(rest.to_string());
                }
            } else {
                filter.included.push(token.to_string());
            }
        }
        filter
    }

    fn apply_to(&self, filter: &mut RecordFilter) {
        if !self.included.is_empty() {
            filter.included_sources = Some(self.included.clone());
        }
        filter.excluded_sources = self.excluded.clone();
        filter.excluded_source_patterns = self.excluded_patterns.clone();
    }
}

/// Fetches a previously-indexed document by id, for compare mode. A search
/// backend is an external collaborator; the concrete HTTP client
/// living outside this crate implements this trait.
#[async_trait::async_trait]
pub trait SolrSearchService: Send + Sync {
    async fn fetch_by_id(&self, id: &str) -> CoreResult<Option<SolrDocument>>;
}

/// Used when no search backend is wired in: compare mode then treats every
/// record as new, which is a reasonable bootstrap default.
pub struct NullSolrSearchService;

#[async_trait::async_trait]
impl SolrSearchService for NullSolrSearchService {
    async fn fetch_by_id(&self, _id: &str) -> CoreResult<Option<SolrDocument>> {
        Ok(None)
    }
}

/// Command-line-level knobs for a single `update_records` invocation.
#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    pub from: Option<OffsetDateTime>,
    pub source_filter: SourceFilter,
    pub single_id: Option<String>,
    pub no_commit: bool,
    pub delete: bool,
    pub compare: bool,
    pub dump_prefix: Option<PathBuf>,
    pub date_per_server: bool,
}

pub struct Coordinator {
    store: Arc<dyn DocumentStore>,
    config: Arc<SolrIndexingConfig>,
    datasources: Arc<DataSourceTable>,
    metadata_registry: Arc<MetadataRecordRegistry>,
    builder: Arc<DocumentBuilder>,
    merge_engine: Arc<MergeEngine>,
    solr: Arc<SolrClient>,
    search: Arc<dyn SolrSearchService>,
    queue_manager: Arc<QueueCollectionManager>,
    cancellation: Cancellation,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        config: Arc<SolrIndexingConfig>,
        datasources: Arc<DataSourceTable>,
        metadata_registry: Arc<MetadataRecordRegistry>,
        builder: Arc<DocumentBuilder>,
        merge_engine: Arc<MergeEngine>,
        solr: Arc<SolrClient>,
        search: Arc<dyn SolrSearchService>,
        cancellation: Cancellation,
    ) -> Self {
        Coordinator {
            queue_manager: Arc::new(QueueCollectionManager::new(store.clone())),
            store,
            config,
            datasources,
            metadata_registry,
            builder,
            merge_engine,
            solr,
            search,
            cancellation,
        }
    }

    /// Top-level entry point. Returns a process exit code: `0` clean, `1`
    /// interrupted, `2` failed.
    pub async fn update_records(&self, options: &UpdateOptions, sink: &dyn BatchSink) -> CoreResult<i32> {
        if options.delete {
            return self.delete_source(options, sink).await.map(|()| 0).or(Ok(2));
        }

        let checkpoint_key = checkpoint_key_for(&self.config, options.date_per_server);
        let from = match options.from {
            Some(from) => Some(from),
            None if options.single_id.is_none() && !options.compare => self
                .store
                .get_state(&checkpoint_key)
                .await?
                .and_then(|raw| OffsetDateTime::parse(&raw, &time::format_description::well_known::Rfc3339).ok()),
            None => None,
        };
        let latest = self
            .store
            .latest_record_timestamp()
            .await?
            .unwrap_or_else(OffsetDateTime::now_utc);

        let mut record_filter = RecordFilter {
            single_id: options.single_id.clone(),
            updated_since: from,
            ..Default::default()
        };
        options.source_filter.apply_to(&mut record_filter);

        let dedup_eligible =
            !options.compare && options.single_id.is_none() && self.datasources.values().any(|s| s.dedup);

        let merged_handle = if dedup_eligible {
            Some(self.spawn_merged_stream(options, from, latest))
        } else {
            None
        };

        let single_result = self.run_single_record_stream(options, &record_filter, sink).await;
        let mut exit_code = exit_code_for(&single_result);

        if let Some(handle) = merged_handle {
            let merged_result = handle.await.unwrap_or_else(|join_err| {
                Err(CoreErrorKind::ChildFailure.with_error(anyhow::anyhow!("merged stream task panicked: {join_err}")))
            });
            exit_code = exit_code.max(exit_code_for(&merged_result));
        }

        if exit_code == 0 && options.single_id.is_none() && !options.compare {
            self.store
                .save_state(&checkpoint_key, &format_checkpoint(latest))
                .await?;
        }

        if exit_code == 0 && !options.no_commit && !options.compare {
            self.solr.commit(DEFAULT_COMMIT_TIMEOUT).await?;
        }

        Ok(exit_code)
    }

    /// Runs the merged/dedup-group stream as an async sibling of the
    /// per-record stream — a tokio task standing in for the source's
    /// forked child process.
    fn spawn_merged_stream(
        &self,
        options: &UpdateOptions,
        from: Option<OffsetDateTime>,
        latest: OffsetDateTime,
    ) -> tokio::task::JoinHandle<CoreResult<()>> {
        let store = self.store.clone();
        let datasources = self.datasources.clone();
        let metadata_registry = self.metadata_registry.clone();
        let builder = self.builder.clone();
        let merge_engine = self.merge_engine.clone();
        let config = self.config.clone();
        let self_solr = self.solr.clone();
        let queue_manager = self.queue_manager.clone();
        let cancellation = self.cancellation.clone();
        let source_filter = options.source_filter.clone();
        let single_id = options.single_id.clone();
        let dump_prefix = options.dump_prefix.clone();

        tokio::spawn(async move {
            store.reconnect().await?;
            let params = QueueSelectionParams {
                source_ids: source_filter.included.clone(),
                single_id,
            };
            let collection = queue_manager.get_or_build(&params, from, latest).await?;
            let dedup_ids = queue_manager.queued_ids(&collection).await?;

            let mut buffer = UpdateBuffer::new(config.clone(), dump_prefix);
            let sink = MergedStreamSink { solr: self_solr.clone() };
            let mut processed = 0u64;
            for dedup_id in dedup_ids {
                if cancellation.is_cancelled() {
                    queue_manager.drop_on_interrupt(&collection).await.ok();
                    return Err(CoreErrorKind::Interrupted.with_error(anyhow::anyhow!("merged stream interrupted")));
                }
                let Some(group) = store.get_dedup(&dedup_id).await? else { continue };
                let outcome = process_dedup_record(
                    &group,
                    &store,
                    &datasources,
                    &metadata_registry,
                    &builder,
                    &merge_engine,
                )
                .await?;
                for doc in outcome.upserts {
                    buffer.append(doc, &sink).await?;
                }
                for id in outcome.deletes {
                    buffer.delete(id, &sink).await?;
                }
                processed += 1;
                if processed % PROGRESS_INTERVAL == 0 {
                    info!(processed, "merged-stream-progress");
                }
            }
            buffer.flush(&sink).await?;
            Ok(())
        })
    }

    async fn run_single_record_stream(
        &self,
        options: &UpdateOptions,
        filter: &RecordFilter,
        sink: &dyn BatchSink,
    ) -> CoreResult<()> {
        let records = self.store.find_records(filter, &FindOptions::default()).await?;
        let mut buffer = UpdateBuffer::new(self.config.clone(), options.dump_prefix.clone());
        let mut processed = 0u64;
        let mut commit_counter = 0u64;

        for record in &records {
            if self.cancellation.is_cancelled() {
                return Err(CoreErrorKind::Interrupted.with_error(anyhow::anyhow!("single-record stream interrupted")));
            }

            let Some((settings, metadata)) = self.resolve_record(record)? else { continue };

            if record.deleted {
                buffer.delete(create_doc_id(record, &settings), sink).await?;
                processed += 1;
                continue;
            }

            let resolved_hosts = self.resolve_hosts(record).await?;
            let component_parts = self.resolve_component_parts(record, &settings).await?;
            let inputs = BuildInputs {
                record,
                settings: &settings,
                metadata: metadata.as_ref(),
                dedup: None,
                is_hidden_component_part: record.is_component_part() && !settings.index_merged_parts,
                component_parts,
                resolved_hosts,
            };

            match self.builder.build(inputs) {
                Ok(Some(outcome)) => {
                    if options.compare {
                        let existing = self.search.fetch_by_id(&record.id).await?;
                        let diffs = diff_documents(&outcome.doc, existing.as_ref(), &self.config.ignore_in_comparison);
                        if !diffs.is_empty() {
                            info!(id = %record.id, fields = ?diffs, "compare-mismatch");
                        }
                    } else {
                        buffer.append(outcome.doc, sink).await?;
                    }
                }
                Ok(None) => {}
                Err(err) if err.kind() == CoreErrorKind::DataDefect => {
                    warn!(id = %record.id, error = %err, "record-build-data-defect-skipped");
                }
                Err(err) => return Err(err),
            }

            processed += 1;
            commit_counter += 1;
            if processed % PROGRESS_INTERVAL == 0 {
                info!(processed, total = records.len(), "single-record-stream-progress");
            }
            if !options.no_commit
                && !options.compare
                && self.config.max_commit_interval > 0
                && commit_counter % self.config.max_commit_interval == 0
            {
                buffer.flush(sink).await?;
                self.solr.commit(DEFAULT_UPDATE_TIMEOUT).await?;
            }
        }

        if !options.compare {
            buffer.flush(sink).await?;
        }
        Ok(())
    }

    fn resolve_record(&self, record: &SourceRecord) -> CoreResult<Option<(DataSourceSettings, Box<dyn MetadataRecord>)>> {
        let Some(settings) = self.datasources.get(&record.source_id) else {
            warn!(source_id = %record.source_id, "unknown-data-source-settings-skipped");
            return Ok(None);
        };
        if !settings.index {
            return Ok(None);
        }
        let Some(metadata) = self.metadata_registry.build(&record.format, &record.original_data) else {
            warn!(format = %record.format, id = %record.id, "no-metadata-record-constructor-skipped");
            return Ok(None);
        };
        Ok(Some((settings.clone(), metadata)))
    }

    async fn resolve_hosts(&self, record: &SourceRecord) -> CoreResult<Vec<ResolvedRecord>> {
        let mut hosts = Vec::new();
        for host_id in &record.host_record_ids {
            let Some(host_record) = self.store.get_record(host_id).await? else { continue };
            let Some((_, metadata)) = self.resolve_record(&host_record)? else { continue };
            hosts.push(ResolvedRecord { record: host_record, metadata });
        }
        Ok(hosts)
    }

    async fn resolve_component_parts(
        &self,
        record: &SourceRecord,
        settings: &DataSourceSettings,
    ) -> CoreResult<Vec<ResolvedRecord>> {
        find_component_parts_for(&self.store, &self.datasources, &self.metadata_registry, record, settings).await
    }

    async fn delete_source(&self, options: &UpdateOptions, sink: &dyn BatchSink) -> CoreResult<()> {
        let mut filter = RecordFilter::default();
        options.source_filter.apply_to(&mut filter);
        let records = self.store.find_records(&filter, &FindOptions::default()).await?;
        let mut buffer = UpdateBuffer::new(self.config.clone(), options.dump_prefix.clone());
        for record in &records {
            let Some((settings, _)) = self.resolve_record(record)? else { continue };
            buffer.delete(create_doc_id(record, &settings), sink).await?;
        }
        buffer.flush(sink).await?;
        if !options.no_commit {
            self.solr.commit(DEFAULT_COMMIT_TIMEOUT).await?;
        }
        Ok(())
    }

    /// Counts, across every record matching `filter`, how many times each
    /// value appears in `field` of the built document (auxiliary reporting
    /// operation, §4.I).
    pub async fn count_values(&self, field: &str, filter: &RecordFilter) -> CoreResult<HashMap<String, u64>> {
        let records = self.store.find_records(filter, &FindOptions::default()).await?;
        let mut counts = HashMap::new();
        for record in &records {
            let Some((settings, metadata)) = self.resolve_record(record)? else { continue };
            let resolved_hosts = self.resolve_hosts(record).await?;
            let component_parts = self.resolve_component_parts(record, &settings).await?;
            let inputs = BuildInputs {
                record,
                settings: &settings,
                metadata: metadata.as_ref(),
                dedup: None,
                is_hidden_component_part: false,
                component_parts,
                resolved_hosts,
            };
            if let Some(outcome) = self.builder.build(inputs)? {
                if let Some(value) = outcome.doc.get(field) {
                    for v in value.as_slice() {
                        *counts.entry(v.to_string()).or_insert(0u64) += 1;
                    }
                }
            }
        }
        Ok(counts)
    }

    /// Returns the ids of records matching `filter` that the store has but
    /// the search backend does not (auxiliary consistency check,
    /// §4.I).
    pub async fn check_indexed_records(&self, filter: &RecordFilter) -> CoreResult<Vec<String>> {
        let records = self.store.find_records(filter, &FindOptions::default()).await?;
        let mut missing = Vec::new();
        for record in &records {
            if record.deleted {
                continue;
            }
            let Some((settings, _)) = self.resolve_record(record)? else { continue };
            let doc_id = create_doc_id(record, &settings);
            if self.search.fetch_by_id(&doc_id).await?.is_none() {
                missing.push(doc_id);
            }
        }
        Ok(missing)
    }
}

/// `--date-per-server` forces per-url checkpoint tracking for this one
/// invocation regardless of the config's `track_updates_per_update_url`.
fn checkpoint_key_for(config: &SolrIndexingConfig, date_per_server: bool) -> String {
    if date_per_server {
        format!("Last Index Update[ {}]", config.update_url)
    } else {
        config.checkpoint_key()
    }
}

fn exit_code_for(result: &CoreResult<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(err) if err.kind() == CoreErrorKind::Interrupted => 1,
        Err(_) => 2,
    }
}

fn create_doc_id(record: &SourceRecord, settings: &DataSourceSettings) -> String {
    let local = record.local_id();
    if settings.index_unprefixed_ids {
        local.to_string()
    } else {
        format!("{}.{}", settings.id_prefix_or(&record.source_id), local)
    }
}

fn format_checkpoint(ts: OffsetDateTime) -> String {
    ts.to_offset(time::UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| ts.to_string())
}

/// Component-part discovery: records whose `host_record_ids` intersects
/// `record`'s `linking_ids`, restricted to `componentPartSourceId` when
/// configured or the record's own source otherwise (§4.F step 2).
async fn find_component_parts_for(
    store: &Arc<dyn DocumentStore>,
    datasources: &DataSourceTable,
    metadata_registry: &MetadataRecordRegistry,
    record: &SourceRecord,
    settings: &DataSourceSettings,
) -> CoreResult<Vec<ResolvedRecord>> {
    if !record.is_host_candidate() {
        return Ok(Vec::new());
    }
    let restrict: Vec<String> = if settings.component_part_source_id.is_empty() {
        vec![record.source_id.clone()]
    } else {
        settings.component_part_source_id.clone()
    };
    let candidates = store.find_component_parts(&record.linking_ids, &restrict).await?;
    let mut parts = Vec::with_capacity(candidates.len());
    for part in candidates {
        let Some(part_settings) = datasources.get(&part.source_id) else { continue };
        if !part_settings.index {
            continue;
        }
        let Some(metadata) = metadata_registry.build(&part.format, &part.original_data) else { continue };
        parts.push(ResolvedRecord { record: part, metadata });
    }
    Ok(parts)
}

/// Documents to upsert and ids to delete from the index, the result of
/// folding one dedup group through [`process_dedup_record`].
struct DedupOutcome {
    upserts: Vec<SolrDocument>,
    deletes: Vec<String>,
}

impl DedupOutcome {
    fn delete_only(id: String) -> Self {
        DedupOutcome {
            upserts: Vec::new(),
            deletes: vec![id],
        }
    }
}

/// Resolves a dedup group's member records, builds each survivor, and fuses
/// them per §4.I: a deleted group, or a group with zero surviving children,
/// is deleted from the index outright; a deleted member record is itself
/// deleted under its own id; exactly one survivor is indexed under its own
/// id and the group id is deleted; two or more survivors are fused by the
/// merge engine into one merged document under the group id, with the
/// merge engine's copy-back step folded into each surviving child before it
/// is re-emitted alongside the merged document.
async fn process_dedup_record(
    group: &DedupGroup,
    store: &Arc<dyn DocumentStore>,
    datasources: &DataSourceTable,
    metadata_registry: &MetadataRecordRegistry,
    builder: &DocumentBuilder,
    merge_engine: &MergeEngine,
) -> CoreResult<DedupOutcome> {
    if group.deleted {
        return Ok(DedupOutcome::delete_only(group.id.clone()));
    }

    let mut deletes: Vec<String> = Vec::new();
    let mut children: Vec<(String, SolrDocument)> = Vec::new();
    for member_id in &group.member_ids {
        let Some(record) = store.get_record(member_id).await? else { continue };
        let Some(settings) = datasources.get(&record.source_id) else { continue };
        if record.deleted {
            if settings.index {
                deletes.push(create_doc_id(&record, settings));
            }
            continue;
        }
        if !settings.index {
            continue;
        }
        let Some(metadata) = metadata_registry.build(&record.format, &record.original_data) else {
            continue;
        };
        let component_parts = find_component_parts_for(store, datasources, metadata_registry, &record, settings).await?;
        let inputs = BuildInputs {
            record: &record,
            settings,
            metadata: metadata.as_ref(),
            dedup: Some(group),
            is_hidden_component_part: record.is_component_part() && !settings.index_merged_parts,
            component_parts,
            resolved_hosts: Vec::new(),
        };
        if let Some(outcome) = builder.build(inputs)? {
            children.push((member_id.clone(), outcome.doc));
        }
    }

    match children.len() {
        0 => {
            deletes.push(group.id.clone());
            Ok(DedupOutcome { upserts: Vec::new(), deletes })
        }
        1 => {
            let (member_id, doc) = children.into_iter().next().unwrap();
            warn!(group_id = %group.id, member_id = %member_id, "dedup-group-single-survivor-indexed-under-own-id");
            deletes.push(group.id.clone());
            Ok(DedupOutcome { upserts: vec![doc], deletes })
        }
        _ => {
            let mut merged = merge_engine.merge_records(children.clone());
            merged.insert("id".to_string(), FieldValue::Single(group.id.clone()));
            merged.insert("record_format".to_string(), FieldValue::Single("merged".to_string()));
            merged.insert("merged_boolean".to_string(), FieldValue::Single("true".to_string()));

            merge_engine.copy_merged_data_to_children(&merged, &mut children);

            let mut upserts = Vec::with_capacity(children.len() + 1);
            for (_, mut child_doc) in children {
                child_doc.insert("merged_child_boolean".to_string(), FieldValue::Single("true".to_string()));
                upserts.push(child_doc);
            }
            upserts.push(merged);
            Ok(DedupOutcome { upserts, deletes })
        }
    }
}

/// Symmetric-difference diff over two documents' keys and values, skipping
/// both the fixed and the configured exclusion sets (§4.I "Compare
/// mode").
fn diff_documents(new_doc: &SolrDocument, existing: Option<&SolrDocument>, ignore: &[String]) -> Vec<String> {
    let is_ignored = |field: &str| COMPARE_ALWAYS_IGNORE.contains(&field) || ignore.iter().any(|f| f == field);
    let Some(existing) = existing else {
        return new_doc.keys().filter(|f| !is_ignored(f)).cloned().collect();
    };
    let mut diffs = Vec::new();
    for (field, value) in new_doc {
        if is_ignored(field) {
            continue;
        }
        if existing.get(field) != Some(value) {
            diffs.push(field.clone());
        }
    }
    for field in existing.keys() {
        if !is_ignored(field) && !new_doc.contains_key(field) {
            diffs.push(field.clone());
        }
    }
    diffs
}

/// The merged stream writes through its own buffer rather than the caller's
/// sink, since it shares no mutable state with the single-record stream
///. [`UpdateBuffer`] already
/// routes to a dump file directly when configured with one; this sink only
/// runs when a document actually needs to reach Solr.
struct MergedStreamSink {
    solr: Arc<SolrClient>,
}

#[async_trait::async_trait]
impl BatchSink for MergedStreamSink {
    async fn submit_upserts(&self, docs: Vec<SolrDocument>) -> CoreResult<()> {
        let body: Vec<serde_json::Value> = docs.iter().map(crate::update_buffer::solr_doc_to_json).collect();
        self.solr
            .request(serde_json::Value::Array(body), DEFAULT_UPDATE_TIMEOUT)
            .await
    }

    async fn submit_deletes(&self, ids: Vec<String>) -> CoreResult<()> {
        let body: Vec<serde_json::Value> = ids
            .iter()
            .map(|id| serde_json::json!({"delete": {"id": id}}))
            .collect();
        self.solr
            .request(serde_json::Value::Array(body), DEFAULT_UPDATE_TIMEOUT)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SolrIndexingConfig;
    use crate::enrichment::{EnricherRegistry, EnrichmentBridge, FieldMapper, MappingTables};
    use crate::model::FieldValue;
    use crate::testutil::InMemoryStore;
    use crate::xslt::UnconfiguredXsltEngine;
    use time::macros::datetime;

    #[test]
    fn source_filter_parses_exclusions_and_regex() {
        let filter = SourceFilter::parse("a,b,-c,-/^d.*/");
        assert_eq!(filter.included, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(filter.excluded, vec!["c".to_string()]);
        assert_eq!(filter.excluded_patterns, vec!["^d.*".to_string()]);
    }

    struct FakeMetadata {
        format: String,
    }
    impl MetadataRecord for FakeMetadata {
        fn format(&self) -> &str {
            &self.format
        }
        fn title(&self) -> Option<String> {
            Some("T".to_string())
        }
        fn is_component_part(&self) -> bool {
            false
        }
        fn to_solr_array(&self) -> Vec<(String, FieldValue)> {
            vec![("title".to_string(), FieldValue::Single("T".to_string()))]
        }
        fn to_xml(&self) -> String {
            "<r/>".to_string()
        }
        fn merge_component_parts(
            &self,
            _parts: &[Box<dyn MetadataRecord>],
        ) -> (Vec<(String, FieldValue)>, Option<OffsetDateTime>) {
            (Vec::new(), None)
        }
    }

    fn record(id: &str, source: &str, dedup_id: Option<&str>) -> SourceRecord {
        SourceRecord {
            id: id.to_string(),
            source_id: source.to_string(),
            format: "Book".to_string(),
            original_data: "<r/>".to_string(),
            linking_ids: Vec::new(),
            host_record_ids: Vec::new(),
            deleted: false,
            created: datetime!(2024-01-01 00:00 UTC),
            date: datetime!(2024-01-02 00:00 UTC),
            dedup_id: dedup_id.map(str::to_string),
        }
    }

    fn registry() -> MetadataRecordRegistry {
        let mut registry = MetadataRecordRegistry::new();
        registry.register("Book", |_raw| {
            Box::new(FakeMetadata { format: "Book".to_string() })
        });
        registry
    }

    fn builder(config: Arc<SolrIndexingConfig>) -> DocumentBuilder {
        DocumentBuilder::new(
            config,
            FieldMapper::new(MappingTables::default()),
            EnrichmentBridge::new(EnricherRegistry::new(), Vec::new()),
            Arc::new(UnconfiguredXsltEngine),
        )
    }

    fn plain_config() -> Arc<SolrIndexingConfig> {
        Arc::new(
            SolrIndexingConfig::parse(
                r#"
                update_url = "http://x/update"
                search_url = "http://x/select"
            "#,
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn find_component_parts_for_restricts_to_same_source_by_default() {
        let mem_store = InMemoryStore::new();
        let mut host = record("a.host", "a", None);
        host.linking_ids = vec!["link.1".to_string()];
        mem_store.put_record(host.clone());
        let mut part = record("a.part1", "a", None);
        part.host_record_ids = vec!["link.1".to_string()];
        mem_store.put_record(part);
        let mut other_source_part = record("b.part1", "b", None);
        other_source_part.host_record_ids = vec!["link.1".to_string()];
        mem_store.put_record(other_source_part);

        let mut datasources = DataSourceTable::new();
        datasources.insert("a".to_string(), DataSourceSettings::default());
        datasources.insert("b".to_string(), DataSourceSettings::default());
        let registry = registry();
        let store_arc: Arc<dyn DocumentStore> = Arc::new(mem_store);
        let settings = DataSourceSettings::default();

        let parts = find_component_parts_for(&store_arc, &datasources, &registry, &host, &settings)
            .await
            .unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].record.id, "a.part1");
    }

    #[tokio::test]
    async fn dedup_group_with_single_survivor_keeps_own_id_and_deletes_group_id() {
        let mem_store = InMemoryStore::new();
        mem_store.put_record(record("a.1", "a", Some("D1")));
        let group = DedupGroup {
            id: "D1".to_string(),
            member_ids: vec!["a.1".to_string()],
            deleted: false,
            changed: datetime!(2024-01-02 00:00 UTC),
        };
        let config = plain_config();
        let mut datasources = DataSourceTable::new();
        datasources.insert("a".to_string(), DataSourceSettings::default());
        let registry = registry();
        let builder = builder(config.clone());
        let merge_engine = MergeEngine::new(config.clone());
        let store_arc: Arc<dyn DocumentStore> = Arc::new(mem_store);

        let outcome = process_dedup_record(&group, &store_arc, &datasources, &registry, &builder, &merge_engine)
            .await
            .unwrap();
        assert_eq!(outcome.upserts.len(), 1);
        assert_eq!(outcome.upserts[0].get("id"), Some(&FieldValue::Single("a.1".to_string())));
        assert_eq!(outcome.deletes, vec!["D1".to_string()]);
    }

    #[tokio::test]
    async fn dedup_group_with_no_survivors_deletes_group_id() {
        let mem_store = InMemoryStore::new();
        let mut rec = record("a.1", "a", Some("D1"));
        rec.deleted = true;
        mem_store.put_record(rec);
        let group = DedupGroup {
            id: "D1".to_string(),
            member_ids: vec!["a.1".to_string()],
            deleted: false,
            changed: datetime!(2024-01-02 00:00 UTC),
        };
        let config = plain_config();
        let mut datasources = DataSourceTable::new();
        datasources.insert("a".to_string(), DataSourceSettings::default());
        let registry = registry();
        let builder = builder(config.clone());
        let merge_engine = MergeEngine::new(config.clone());
        let store_arc: Arc<dyn DocumentStore> = Arc::new(mem_store);

        let outcome = process_dedup_record(&group, &store_arc, &datasources, &registry, &builder, &merge_engine)
            .await
            .unwrap();
        assert!(outcome.upserts.is_empty());
        assert_eq!(outcome.deletes, vec!["a.1".to_string(), "D1".to_string()]);
    }

    #[tokio::test]
    async fn deleted_member_is_deleted_alongside_its_surviving_sibling() {
        let mem_store = InMemoryStore::new();
        mem_store.put_record(record("a.1", "a", Some("D1")));
        let mut deleted = record("a.2", "a", Some("D1"));
        deleted.deleted = true;
        mem_store.put_record(deleted);
        let group = DedupGroup {
            id: "D1".to_string(),
            member_ids: vec!["a.1".to_string(), "a.2".to_string()],
            deleted: false,
            changed: datetime!(2024-01-02 00:00 UTC),
        };
        let config = plain_config();
        let mut datasources = DataSourceTable::new();
        datasources.insert("a".to_string(), DataSourceSettings::default());
        let registry = registry();
        let builder = builder(config.clone());
        let merge_engine = MergeEngine::new(config.clone());
        let store_arc: Arc<dyn DocumentStore> = Arc::new(mem_store);

        let outcome = process_dedup_record(&group, &store_arc, &datasources, &registry, &builder, &merge_engine)
            .await
            .unwrap();
        assert_eq!(outcome.upserts.len(), 1);
        assert_eq!(outcome.upserts[0].get("id"), Some(&FieldValue::Single("a.1".to_string())));
        assert_eq!(outcome.deletes, vec!["a.2".to_string(), "D1".to_string()]);
    }

    #[tokio::test]
    async fn deleted_dedup_group_is_deleted_outright() {
        let mem_store = InMemoryStore::new();
        let group = DedupGroup {
            id: "D1".to_string(),
            member_ids: Vec::new(),
            deleted: true,
            changed: datetime!(2024-01-02 00:00 UTC),
        };
        let config = plain_config();
        let datasources = DataSourceTable::new();
        let registry = registry();
        let builder = builder(config.clone());
        let merge_engine = MergeEngine::new(config.clone());
        let store_arc: Arc<dyn DocumentStore> = Arc::new(mem_store);

        let outcome = process_dedup_record(&group, &store_arc, &datasources, &registry, &builder, &merge_engine)
            .await
            .unwrap();
        assert!(outcome.upserts.is_empty());
        assert_eq!(outcome.deletes, vec!["D1".to_string()]);
    }

    #[tokio::test]
    async fn dedup_group_with_two_survivors_emits_children_and_merged_doc() {
        let mem_store = InMemoryStore::new();
        mem_store.put_record(record("a.1", "a", Some("D1")));
        mem_store.put_record(record("a.2", "a", Some("D1")));
        let group = DedupGroup {
            id: "D1".to_string(),
            member_ids: vec!["a.1".to_string(), "a.2".to_string()],
            deleted: false,
            changed: datetime!(2024-01-02 00:00 UTC),
        };
        let config = plain_config();
        let mut datasources = DataSourceTable::new();
        datasources.insert("a".to_string(), DataSourceSettings::default());
        let registry = registry();
        let builder = builder(config.clone());
        let merge_engine = MergeEngine::new(config.clone());
        let store_arc: Arc<dyn DocumentStore> = Arc::new(mem_store);

        let outcome = process_dedup_record(&group, &store_arc, &datasources, &registry, &builder, &merge_engine)
            .await
            .unwrap();
        assert!(outcome.deletes.is_empty());
        assert_eq!(outcome.upserts.len(), 3);

        let merged = outcome
            .upserts
            .iter()
            .find(|d| d.get("id") == Some(&FieldValue::Single("D1".to_string())))
            .expect("merged doc present");
        assert_eq!(merged.get("record_format"), Some(&FieldValue::Single("merged".to_string())));
        assert_eq!(merged.get("merged_boolean"), Some(&FieldValue::Single("true".to_string())));

        let children: Vec<_> = outcome
            .upserts
            .iter()
            .filter(|d| d.get("id") != Some(&FieldValue::Single("D1".to_string())))
            .collect();
        assert_eq!(children.len(), 2);
        for child in children {
            assert_eq!(child.get("merged_child_boolean"), Some(&FieldValue::Single("true".to_string())));
        }
    }

    struct TopicMetadata(String);
    impl MetadataRecord for TopicMetadata {
        fn format(&self) -> &str {
            "Book"
        }
        fn title(&self) -> Option<String> {
            Some("T".to_string())
        }
        fn is_component_part(&self) -> bool {
            false
        }
        fn to_solr_array(&self) -> Vec<(String, FieldValue)> {
            vec![("topic".to_string(), FieldValue::Single(self.0.clone()))]
        }
        fn to_xml(&self) -> String {
            "<r/>".to_string()
        }
        fn merge_component_parts(
            &self,
            _parts: &[Box<dyn MetadataRecord>],
        ) -> (Vec<(String, FieldValue)>, Option<OffsetDateTime>) {
            (Vec::new(), None)
        }
    }

    #[tokio::test]
    async fn copy_from_merged_record_reaches_children_through_the_production_path() {
        let mem_store = InMemoryStore::new();
        let mut rec1 = record("a.1", "a", Some("D1"));
        rec1.original_data = "Math".to_string();
        let mut rec2 = record("a.2", "a", Some("D1"));
        rec2.original_data = "Physics".to_string();
        mem_store.put_record(rec1);
        mem_store.put_record(rec2);
        let group = DedupGroup {
            id: "D1".to_string(),
            member_ids: vec!["a.1".to_string(), "a.2".to_string()],
            deleted: false,
            changed: datetime!(2024-01-02 00:00 UTC),
        };
        let mut config = (*plain_config()).clone();
        config.merged_fields = vec!["topic".to_string()];
        config.copy_from_merged_record = vec!["topic".to_string()];
        let config = Arc::new(config);
        let mut datasources = DataSourceTable::new();
        datasources.insert("a".to_string(), DataSourceSettings::default());

        let mut registry = MetadataRecordRegistry::new();
        registry.register("Book", |raw| Box::new(TopicMetadata(raw.to_string())) as Box<dyn MetadataRecord>);
        let builder = builder(config.clone());
        let merge_engine = MergeEngine::new(config.clone());
        let store_arc: Arc<dyn DocumentStore> = Arc::new(mem_store);

        let outcome = process_dedup_record(&group, &store_arc, &datasources, &registry, &builder, &merge_engine)
            .await
            .unwrap();
        let children: Vec<_> = outcome
            .upserts
            .iter()
            .filter(|d| d.get("id") != Some(&FieldValue::Single("D1".to_string())))
            .collect();
        assert_eq!(children.len(), 2);
        for child in children {
            let topics = child.get("topic").unwrap().as_slice();
            assert!(topics.contains(&"Math"));
            assert!(topics.contains(&"Physics"));
        }
    }

    #[test]
    fn date_per_server_overrides_config_checkpoint_tracking() {
        let config = SolrIndexingConfig::parse(
            r#"
            update_url = "http://a/update"
            search_url = "http://a/select"
        "#,
        )
        .unwrap();
        assert_eq!(checkpoint_key_for(&config, false), "Last Index Update");
        assert_eq!(
            checkpoint_key_for(&config, true),
            "Last Index Update[ http://a/update]"
        );
    }

    #[test]
    fn diff_documents_flags_new_and_changed_fields_only() {
        let mut new_doc = SolrDocument::new();
        new_doc.insert("title".to_string(), FieldValue::Single("New".to_string()));
        new_doc.insert("last_indexed".to_string(), FieldValue::Single("now".to_string()));
        let mut existing = SolrDocument::new();
        existing.insert("title".to_string(), FieldValue::Single("Old".to_string()));
        let diffs = diff_documents(&new_doc, Some(&existing), &[]);
        assert_eq!(diffs, vec!["title".to_string()]);
    }
}
