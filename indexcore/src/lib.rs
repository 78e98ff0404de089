// Copyright (C) 2024 RecordManager-rs contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.

//! `indexcore` turns bibliographic source records into Solr documents.
//!
//! It ingests records from a [`store::DocumentStore`], projects each one
//! individually, and — for sources with deduplication enabled — projects
//! every dedup group into a second, merged stream running alongside the
//! first. [`coordinator::Coordinator`] is the entry point that ties the
//! rest of the modules together; everything else is a component it wires
//! up: field mapping and enrichment, Solr transport, cluster-awareness,
//! worker pools, the merge engine, and the on-disk queue collections that
//! let the merged stream resume without re-scanning the whole store.

pub mod cluster_monitor;
pub mod config;
pub mod coordinator;
pub mod document_builder;
pub mod enrichment;
pub mod error;
pub mod merge_engine;
pub mod metadata;
pub mod model;
pub mod queue_collection;
pub mod solr_client;
pub mod store;
pub mod unicode_norm;
pub mod update_buffer;
pub mod worker_pool;
pub mod xslt;

#[cfg(any(test, feature = "testsuite"))]
pub mod testutil;

pub use config::{DataSourceSettings, DataSourceTable, SolrIndexingConfig};
pub use coordinator::{Coordinator, SourceFilter, UpdateOptions};
pub use error::{CoreError, CoreErrorKind, CoreResult};
pub use model::{DedupGroup, FieldValue, SolrDocument, SourceRecord};
pub use store::DocumentStore;
