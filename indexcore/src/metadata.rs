// Copyright (C) 2024 RecordManager-rs contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.

//! The metadata-record interface: parsing a source record's raw payload into
//! a structured view is out of scope for this crate (§1, "record
//! parsers"). Instead of dynamic dispatch on a format string, the core
//! depends on this trait and a small registry, per §9 "Dynamic dispatch
//! on record format".

use crate::model::FieldValue;

/// Work-identification data used by the work-key derivation step.
#[derive(Debug, Clone, Default)]
pub struct WorkIdentificationData {
    pub uniform_titles: Vec<String>,
    pub uniform_titles_alt_script: Vec<String>,
    pub titles: Vec<String>,
    pub titles_alt_script: Vec<String>,
    pub authors: Vec<String>,
}

/// The interface a parsed metadata record exposes to the core. Concrete
/// implementations (MARC, Dublin Core, ...) live outside this crate; see
/// [`MetadataRecordRegistry`] for how the core obtains one for a given
/// format tag.
pub trait MetadataRecord: Send + Sync {
    fn format(&self) -> &str;
    fn title(&self) -> Option<String>;
    fn is_component_part(&self) -> bool;
    fn volume(&self) -> Option<String> {
        None
    }
    fn issue(&self) -> Option<String> {
        None
    }
    fn start_page(&self) -> Option<String> {
        None
    }
    fn container_reference(&self) -> Option<String> {
        None
    }
    fn container_title(&self) -> Option<String> {
        None
    }

    /// Native, pre-mapping field -> value(s) projection, used when the
    /// source defines no `solrTransformation`.
    fn to_solr_array(&self) -> Vec<(String, FieldValue)>;

    fn to_xml(&self) -> String;

    /// Merges a set of component-part records into this one, returning the
    /// merged representation (as additional field/value pairs to overlay)
    /// and the latest change timestamp among the parts, if newer than this
    /// record's own.
    fn merge_component_parts(
        &self,
        parts: &[Box<dyn MetadataRecord>],
    ) -> (Vec<(String, FieldValue)>, Option<time::OffsetDateTime>);

    fn work_identification_data(&self) -> WorkIdentificationData {
        WorkIdentificationData::default()
    }

    /// Non-fatal warnings accumulated while parsing or transforming.
    fn processing_warnings(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Resolves a format tag to a constructor for the matching metadata-record
/// type. Replaces class-name-string dynamic dispatch with an explicit
/// registry injected at startup.
#[derive(Default)]
pub struct MetadataRecordRegistry {
    constructors: std::collections::HashMap<String, Box<dyn Fn(&str) -> Box<dyn MetadataRecord> + Send + Sync>>,
}

impl MetadataRecordRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, format: impl Into<String>, ctor: F)
    where
        F: Fn(&str) -> Box<dyn MetadataRecord> + Send + Sync + 'static,
    {
        self.constructors.insert(format.into(), Box::new(ctor));
    }

    pub fn build(&self, format: &str, raw: &str) -> Option<Box<dyn MetadataRecord>> {
        self.constructors.get(format).map(|ctor| ctor(raw))
    }
}
