// Copyright (C) 2024 RecordManager-rs contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.

//! Value objects for the indexing pipeline: source records, dedup groups, and
//! the flat Solr document representation. Records and groups are plain data
//! keyed by id; there is no shared mutable graph, only lookups through a
//! `DocumentStore` (see [`crate::store`]).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// A record drawn from a single source feed, as persisted by the document store.
///
/// The metadata payload itself (XML, field accessors) is out of scope for this
/// crate; see [`crate::metadata::MetadataRecord`] for the interface the core
/// depends on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRecord {
    /// `source.localId` form, e.g. `"alma.99123"`.
    pub id: String,
    pub source_id: String,
    pub format: String,
    /// Original payload, typically XML.
    pub original_data: String,
    pub linking_ids: Vec<String>,
    pub host_record_ids: Vec<String>,
    pub deleted: bool,
    pub created: OffsetDateTime,
    pub date: OffsetDateTime,
    pub dedup_id: Option<String>,
}

impl SourceRecord {
    pub fn is_component_part(&self) -> bool {
        !self.host_record_ids.is_empty()
    }

    /// A record is a host (candidate for component-part merging) when it has
    /// no host of its own but advertises linking ids that component parts
    /// could point back at.
    pub fn is_host_candidate(&self) -> bool {
        self.host_record_ids.is_empty() && !self.linking_ids.is_empty()
    }

    pub fn local_id(&self) -> &str {
        self.id
            .split_once('.')
            .map(|(_, local)| local)
            .unwrap_or(&self.id)
    }
}

/// A deduplication group: a set of records judged to describe the same work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupGroup {
    pub id: String,
    pub member_ids: Vec<String>,
    pub deleted: bool,
    pub changed: OffsetDateTime,
}

/// A single Solr field value: a scalar string or an ordered list of strings.
///
/// Invariant (enforced by [`crate::document_builder`] before a document leaves
/// the builder): no empty, `"0"`, or numeric-zero entries; list entries are
/// deduplicated preserving first-seen order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Single(String),
    Multi(Vec<String>),
}

impl FieldValue {
    pub fn as_slice(&self) -> Vec<&str> {
        match self {
            FieldValue::Single(s) => vec![s.as_str()],
            FieldValue::Multi(v) => v.iter().map(String::as_str).collect(),
        }
    }

    pub fn into_vec(self) -> Vec<String> {
        match self {
            FieldValue::Single(s) => vec![s],
            FieldValue::Multi(v) => v,
        }
    }

    pub fn is_multi(&self) -> bool {
        matches!(self, FieldValue::Multi(_))
    }

    pub fn push(&mut self, value: String) {
        match self {
            FieldValue::Single(existing) => {
                *self = FieldValue::Multi(vec![existing.clone(), value]);
            }
            FieldValue::Multi(v) => v.push(value),
        }
    }

    pub fn extend(&mut self, values: impl IntoIterator<Item = String>) {
        for v in values {
            self.push(v);
        }
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Single(s)
    }
}

impl From<Vec<String>> for FieldValue {
    fn from(v: Vec<String>) -> Self {
        FieldValue::Multi(v)
    }
}

/// Flat field -> value map destined for a Solr update request.
pub type SolrDocument = BTreeMap<String, FieldValue>;

/// A directive the update buffer can batch: either an upsert of a full
/// document, or a delete-by-id.
#[derive(Debug, Clone)]
pub enum UpdateDirective {
    Upsert(SolrDocument),
    Delete(String),
}
