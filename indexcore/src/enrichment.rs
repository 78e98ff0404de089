// Copyright (C) 2024 RecordManager-rs contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.

//! §4.E Field Mapper & Enrichment Bridge.
//!
//! `FieldMapper` remaps values through source-specific and global default
//! tables. `EnrichmentBridge` lazily resolves pluggable enrichers from a
//! builder registry instead of a
//! class-name string lookup.

use std::collections::HashMap;
use std::sync::Arc;

use crate::metadata::MetadataRecord;
use crate::model::{FieldValue, SolrDocument};

/// `field -> (from_value -> to_value)` remapping tables.
#[derive(Debug, Clone, Default)]
pub struct MappingTables {
    pub per_source: HashMap<String, HashMap<String, HashMap<String, String>>>,
    pub global: HashMap<String, HashMap<String, String>>,
}

pub struct FieldMapper {
    tables: MappingTables,
}

impl FieldMapper {
    pub fn new(tables: MappingTables) -> Self {
        FieldMapper { tables }
    }

    /// Applies source-specific mapping first, falling back to the global
    /// default table for any field not overridden by the source.
    pub fn map_values(&self, source_id: &str, mut doc: SolrDocument) -> SolrDocument {
        for (field, value) in doc.iter_mut() {
            let table = self
                .tables
                .per_source
                .get(source_id)
                .and_then(|by_field| by_field.get(field))
                .or_else(|| self.tables.global.get(field));
            let Some(table) = table else { continue };
            let mapped = value
                .as_slice()
                .iter()
                .map(|v| table.get(*v).cloned().unwrap_or_else(|| v.to_string()))
                .collect::<Vec<_>>();
            *value = if value.is_multi() {
                FieldValue::Multi(mapped)
            } else {
                FieldValue::Single(mapped.into_iter().next().unwrap_or_default())
            };
        }
        doc
    }
}

/// A pluggable pre-index hook.
pub trait Enricher: Send + Sync {
    fn enrich(&self, source_id: &str, record: &dyn MetadataRecord, doc: &mut SolrDocument);
}

/// Resolves enricher names (qualified, or unqualified against a known
/// namespace) to instances, instantiating each lazily and caching it.
#[derive(Default)]
pub struct EnricherRegistry {
    builders: HashMap<String, Arc<dyn Enricher>>,
}

impl EnricherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, enricher: Arc<dyn Enricher>) {
        self.builders.insert(name.into(), enricher);
    }

    fn resolve(&self, name: &str) -> Option<Arc<dyn Enricher>> {
        self.builders.get(name).cloned()
    }
}

/// Applies the configured global and per-source enrichers, in order: global
/// enrichers precede per-source ones, and duplicate names are removed before
/// invocation.
pub struct EnrichmentBridge {
    registry: EnricherRegistry,
    global_enrichers: Vec<String>,
}

impl EnrichmentBridge {
    pub fn new(registry: EnricherRegistry, global_enrichers: Vec<String>) -> Self {
        EnrichmentBridge {
            registry,
            global_enrichers,
        }
    }

    pub fn enrich(
        &self,
        source_id: &str,
        source_enrichers: &[String],
        record: &dyn MetadataRecord,
        doc: &mut SolrDocument,
    ) {
        let mut ordered = Vec::new();
        for name in self.global_enrichers.iter().chain(source_enrichers.iter()) {
            if !ordered.contains(name) {
                ordered.push(name.clone());
            }
        }
        for name in ordered {
            if let Some(enricher) = self.registry.resolve(&name) {
                enricher.enrich(source_id, record, doc);
            } else {
                tracing::warn!(enricher = %name, "unknown-enricher-skipped");
            }
        }
    }
}
