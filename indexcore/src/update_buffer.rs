// Copyright (C) 2024 RecordManager-rs contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.

//! §4.A Update Buffer: JSON batch accumulation, size/count triggers, flush.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use fs2::FileExt;

use crate::config::SolrIndexingConfig;
use crate::error::{CoreErrorKind, CoreResult};
use crate::model::{FieldValue, SolrDocument};

const DELETE_BATCH_THRESHOLD: usize = 1000;

/// Where a flushed batch goes: the Solr worker pool, or a numbered dump
/// file on disk.
#[async_trait]
pub trait BatchSink: Send + Sync {
    async fn submit_upserts(&self, docs: Vec<SolrDocument>) -> CoreResult<()>;
    async fn submit_deletes(&self, ids: Vec<String>) -> CoreResult<()>;
}

pub(crate) fn solr_doc_to_json(doc: &SolrDocument) -> serde_json::Value {
    let mut obj = serde_json::Map::new();
    for (field, value) in doc {
        let json_value = match value {
            FieldValue::Single(s) => serde_json::Value::String(s.clone()),
            FieldValue::Multi(values) => {
                serde_json::Value::Array(values.iter().cloned().map(serde_json::Value::String).collect())
            }
        };
        obj.insert(field.clone(), json_value);
    }
    serde_json::Value::Object(obj)
}

/// Appends `batch` as one JSON line to the smallest unused `<prefix>-<N>.json`
/// file, touching files under an exclusive lock to allocate `N` safely
/// across concurrent writers.
pub fn dump_batch_to_file(prefix: &Path, batch: &serde_json::Value) -> CoreResult<PathBuf> {
    let mut n = 0u64;
    loop {
        let candidate = prefix.with_file_name(format!(
            "{}-{n}.json",
            prefix.file_name().and_then(|s| s.to_str()).unwrap_or("dump")
        ));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&candidate)
            .map_err(|e| CoreErrorKind::Contract.with_error(e))?;
        file.lock_exclusive()
            .map_err(|e| CoreErrorKind::Contract.with_error(e))?;
        let metadata = file
            .metadata()
            .map_err(|e| CoreErrorKind::Contract.with_error(e))?;
        if metadata.len() > 0 {
            // Another writer already claimed this index with content; try the next one.
            fs2::FileExt::unlock(&file).ok();
            n += 1;
            continue;
        }
        let mut writer = file;
        writeln!(writer, "{}", batch).map_err(|e| CoreErrorKind::Contract.with_error(e))?;
        fs2::FileExt::unlock(&writer).ok();
        return Ok(candidate);
    }
}

pub struct UpdateBuffer {
    config: Arc<SolrIndexingConfig>,
    pending_docs: Vec<SolrDocument>,
    pending_deletes: Vec<String>,
    byte_len: usize,
    dump_prefix: Option<PathBuf>,
    dump_counter: u64,
}

impl UpdateBuffer {
    pub fn new(config: Arc<SolrIndexingConfig>, dump_prefix: Option<PathBuf>) -> Self {
        UpdateBuffer {
            config,
            pending_docs: Vec::new(),
            pending_deletes: Vec::new(),
            byte_len: 0,
            dump_prefix,
            dump_counter: 0,
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending_docs.len()
    }

    /// Appends a document, dispatching the buffer through `sink` if the
    /// item-count or byte-size trigger fires.
    pub async fn append(&mut self, doc: SolrDocument, sink: &dyn BatchSink) -> CoreResult<()> {
        let json = solr_doc_to_json(&doc);
        self.byte_len += json.to_string().len();
        self.pending_docs.push(doc);
        if self.pending_docs.len() >= self.config.max_update_records
            || self.byte_len > self.config.max_update_size_bytes()
        {
            self.flush(sink).await?;
        }
        Ok(())
    }

    /// Queues a delete-by-id, flushing when the 1000-id delete batching
    /// threshold is reached.
    pub async fn delete(&mut self, id: String, sink: &dyn BatchSink) -> CoreResult<()> {
        self.pending_deletes.push(id);
        if self.pending_deletes.len() >= DELETE_BATCH_THRESHOLD {
            self.flush_deletes(sink).await?;
        }
        Ok(())
    }

    pub async fn flush(&mut self, sink: &dyn BatchSink) -> CoreResult<()> {
        if !self.pending_docs.is_empty() {
            let docs = std::mem::take(&mut self.pending_docs);
            self.byte_len = 0;
            if let Some(prefix) = &self.dump_prefix {
                let array = serde_json::Value::Array(docs.iter().map(solr_doc_to_json).collect());
                dump_batch_to_file(prefix, &array)?;
            } else {
                sink.submit_upserts(docs).await?;
            }
        }
        self.flush_deletes(sink).await
    }

    async fn flush_deletes(&mut self, sink: &dyn BatchSink) -> CoreResult<()> {
        if self.pending_deletes.is_empty() {
            return Ok(());
        }
        let ids = std::mem::take(&mut self.pending_deletes);
        if let Some(prefix) = &self.dump_prefix {
            let array = serde_json::Value::Array(
                ids.iter()
                    .map(|id| serde_json::json!({"delete": {"id": id}}))
                    .collect(),
            );
            dump_batch_to_file(prefix, &array)?;
        } else {
            sink.submit_deletes(ids).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        upserts: Mutex<Vec<Vec<SolrDocument>>>,
        deletes: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl BatchSink for RecordingSink {
        async fn submit_upserts(&self, docs: Vec<SolrDocument>) -> CoreResult<()> {
            self.upserts.lock().unwrap().push(docs);
            Ok(())
        }
        async fn submit_deletes(&self, ids: Vec<String>) -> CoreResult<()> {
            self.deletes.lock().unwrap().push(ids);
            Ok(())
        }
    }

    fn config(max_records: usize, max_size_kib: usize) -> Arc<SolrIndexingConfig> {
        let mut cfg = SolrIndexingConfig::parse(
            r#"
            update_url = "http://x/update"
            search_url = "http://x/select"
        "#,
        )
        .unwrap();
        cfg.max_update_records = max_records;
        cfg.max_update_size_kib = max_size_kib;
        Arc::new(cfg)
    }

    fn doc(id: &str) -> SolrDocument {
        let mut d = SolrDocument::new();
        d.insert("id".to_string(), FieldValue::Single(id.to_string()));
        d
    }

    #[tokio::test]
    async fn flushes_on_record_count_trigger() {
        let sink = RecordingSink::default();
        let mut buffer = UpdateBuffer::new(config(2, 1024), None);
        buffer.append(doc("a"), &sink).await.unwrap();
        assert_eq!(sink.upserts.lock().unwrap().len(), 0);
        buffer.append(doc("b"), &sink).await.unwrap();
        assert_eq!(sink.upserts.lock().unwrap().len(), 1);
        assert_eq!(sink.upserts.lock().unwrap()[0].len(), 2);
        assert_eq!(buffer.pending_len(), 0);
    }

    #[tokio::test]
    async fn flushes_deletes_at_threshold() {
        let sink = RecordingSink::default();
        let mut buffer = UpdateBuffer::new(config(100_000, 1024 * 1024), None);
        for i in 0..DELETE_BATCH_THRESHOLD {
            buffer.delete(format!("id{i}"), &sink).await.unwrap();
        }
        assert_eq!(sink.deletes.lock().unwrap().len(), 1);
        assert_eq!(sink.deletes.lock().unwrap()[0].len(), DELETE_BATCH_THRESHOLD);
    }

    #[tokio::test]
    async fn explicit_flush_drains_pending_deletes_even_below_threshold() {
        let sink = RecordingSink::default();
        let mut buffer = UpdateBuffer::new(config(100_000, 1024 * 1024), None);
        buffer.delete("only-one".to_string(), &sink).await.unwrap();
        buffer.flush(&sink).await.unwrap();
        assert_eq!(*sink.deletes.lock().unwrap(), vec![vec!["only-one".to_string()]]);
    }
}
