// Copyright (C) 2024 RecordManager-rs contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.

//! §4.F Solr Document Builder: `buildDocument(record, dedupRecord?)`.
//!
//! This is the core's largest component. Each of the 14 steps is a small
//! private method on [`DocumentBuilder`], so the overall shape of `build`
//! reads as the same numbered pipeline its steps are commented with below.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use time::OffsetDateTime;

use crate::config::{ComponentPartsPolicy, DataSourceSettings, InstitutionInBuilding, SolrIndexingConfig};
use crate::enrichment::{EnrichmentBridge, FieldMapper};
use crate::error::CoreError;
use crate::metadata::MetadataRecord;
use crate::model::{DedupGroup, FieldValue, SolrDocument, SourceRecord};
use crate::unicode_norm::{self, NormalizationForm};
use crate::xslt::XsltEngine;

const ALLFIELDS_EXCLUDE: &[&str] = &[
    "fullrecord",
    "thumbnail",
    "id",
    "recordtype",
    "record_format",
    "ctrlnum",
];

/// A resolved component-part or host record, paired with its parsed
/// metadata, as handed to the builder by the coordinator after it has
/// already done the document-store lookups (§1: parsing and the store
/// are both external collaborators; the builder only consumes the result).
pub struct ResolvedRecord {
    pub record: SourceRecord,
    pub metadata: Box<dyn MetadataRecord>,
}

pub struct BuildInputs<'a> {
    pub record: &'a SourceRecord,
    pub settings: &'a DataSourceSettings,
    pub metadata: &'a dyn MetadataRecord,
    pub dedup: Option<&'a DedupGroup>,
    pub is_hidden_component_part: bool,
    /// Component parts found via linking-id intersection.
    /// Ownership is taken so `merge_component_parts` can be called with
    /// owned trait objects without requiring `Clone` on `MetadataRecord`.
    pub component_parts: Vec<ResolvedRecord>,
    /// Host records resolved from `host_record_ids`.
    pub resolved_hosts: Vec<ResolvedRecord>,
}

pub struct BuildOutcome {
    pub doc: SolrDocument,
    pub merged_component_count: u32,
}

pub struct DocumentBuilder {
    config: Arc<SolrIndexingConfig>,
    mapper: FieldMapper,
    enrichment: EnrichmentBridge,
    xslt: Arc<dyn XsltEngine>,
}

impl DocumentBuilder {
    pub fn new(
        config: Arc<SolrIndexingConfig>,
        mapper: FieldMapper,
        enrichment: EnrichmentBridge,
        xslt: Arc<dyn XsltEngine>,
    ) -> Self {
        DocumentBuilder {
            config,
            mapper,
            enrichment,
            xslt,
        }
    }

    /// Returns `None` when the record must be skipped entirely (step 1).
    pub fn build(&self, mut inputs: BuildInputs<'_>) -> Result<Option<BuildOutcome>, CoreError> {
        // Step 1: hidden component parts.
        if inputs.is_hidden_component_part && !inputs.settings.index_merged_parts {
            return Ok(None);
        }

        let mut warnings: Vec<String> = Vec::new();
        let mut effective_date = inputs.record.date;
        let mut merged_component_count = 0u32;
        let mut merge_overlay: Vec<(String, FieldValue)> = Vec::new();

        // Step 2: component-part merge.
        if inputs.record.is_host_candidate() && self.should_merge_parts(inputs.settings, &inputs.component_parts) {
            let parts: Vec<Box<dyn MetadataRecord>> = std::mem::take(&mut inputs.component_parts)
                .into_iter()
                .map(|p| p.metadata)
                .collect();
            if !parts.is_empty() {
                let (overlay, latest) = inputs.metadata.merge_component_parts(&parts);
                if let Some(latest) = latest {
                    if latest > effective_date {
                        effective_date = latest;
                    }
                }
                merge_overlay = overlay;
                merged_component_count += 1;
            }
        }

        // Step 3: transform.
        let mut doc: SolrDocument = if let Some(stylesheet) = &inputs.settings.solr_transformation {
            let mut params = HashMap::new();
            params.insert("source_id".to_string(), inputs.record.source_id.clone());
            if let Some(inst) = &inputs.settings.institution {
                params.insert("institution".to_string(), inst.clone());
            }
            params.insert("format".to_string(), inputs.metadata.format().to_string());
            params.insert(
                "id_prefix".to_string(),
                inputs.settings.id_prefix_or(&inputs.record.source_id).to_string(),
            );
            let transformed_xml = self
                .xslt
                .transform(stylesheet, &inputs.record.original_data, &params)?;
            parse_transformed_xml_into_doc(&transformed_xml)
        } else {
            let mut doc = SolrDocument::new();
            for (field, value) in inputs.metadata.to_solr_array() {
                doc.insert(field, value);
            }
            self.enrichment.enrich(
                &inputs.record.source_id,
                &inputs.settings.enrichments,
                inputs.metadata,
                &mut doc,
            );
            doc
        };

        for (field, value) in merge_overlay {
            doc.entry(field).or_insert(value);
        }

        // Step 4: identity and linkage.
        let solr_id = create_solr_id(
            &inputs.record.id,
            &inputs.record.source_id,
            inputs.settings,
            inputs.settings.index_unprefixed_ids,
        );
        doc.insert("id".to_string(), FieldValue::Single(solr_id.clone()));

        if let Some(dedup) = inputs.dedup {
            doc.insert(
                self.config.dedup_id_field.clone(),
                FieldValue::Single(dedup.id.clone()),
            );
        }

        if inputs.record.is_component_part() {
            if inputs.resolved_hosts.is_empty() {
                warnings.push(format!(
                    "no host record found for component part `{}`",
                    inputs.record.id
                ));
                if let Some(title) = inputs.metadata.title() {
                    doc.insert(
                        self.config.container_title_field.clone(),
                        FieldValue::Single(title),
                    );
                }
            } else {
                for host in &inputs.resolved_hosts {
                    let host_id = create_solr_id(
                        &host.record.id,
                        &host.record.source_id,
                        inputs.settings,
                        inputs.settings.index_unprefixed_ids,
                    );
                    doc.entry(self.config.hierarchy_parent_id_field.clone())
                        .or_insert_with(|| FieldValue::Multi(Vec::new()))
                        .push(host_id);
                    if let Some(title) = host.metadata.title() {
                        doc.entry(self.config.hierarchy_parent_title_field.clone())
                            .or_insert_with(|| FieldValue::Multi(Vec::new()))
                            .push(title);
                    }
                }
            }
            if let Some(v) = inputs.metadata.volume() {
                doc.insert(self.config.container_volume_field.clone(), FieldValue::Single(v));
            }
            if let Some(v) = inputs.metadata.issue() {
                doc.insert(self.config.container_issue_field.clone(), FieldValue::Single(v));
            }
            if let Some(v) = inputs.metadata.start_page() {
                doc.insert(
                    self.config.container_start_page_field.clone(),
                    FieldValue::Single(v),
                );
            }
            if let Some(v) = inputs.metadata.container_reference() {
                doc.insert(
                    self.config.container_reference_field.clone(),
                    FieldValue::Single(v),
                );
            }
        } else {
            for field in self.hierarchy_id_fields_present(&doc) {
                if let Some(value) = doc.get(&field).cloned() {
                    let mapped = value
                        .into_vec()
                        .into_iter()
                        .map(|v| {
                            create_solr_id(
                                &v,
                                &inputs.record.source_id,
                                inputs.settings,
                                inputs.settings.index_unprefixed_ids,
                            )
                        })
                        .collect::<Vec<_>>();
                    doc.insert(field, FieldValue::Multi(mapped));
                }
            }
        }

        if merged_component_count > 0 {
            doc.insert(
                self.config.is_hierarchy_id_field.clone(),
                FieldValue::Single(solr_id.clone()),
            );
            if let Some(title) = inputs.metadata.title() {
                doc.insert(
                    self.config.is_hierarchy_title_field.clone(),
                    FieldValue::Single(title),
                );
            }
        }

        // Step 5: defaults and extras.
        if !doc.contains_key("institution") {
            if let Some(inst) = &inputs.settings.institution {
                doc.insert("institution".to_string(), FieldValue::Single(inst.clone()));
            }
        }
        for (name, value) in inputs.settings.extrafield_pairs() {
            doc.entry(name.to_string())
                .and_modify(|existing| existing.push(value.to_string()))
                .or_insert_with(|| FieldValue::Single(value.to_string()));
        }

        // Step 6: building pipeline.
        if inputs.settings.add_institution_to_building_before_mapping {
            self.add_institution_to_building(&mut doc, inputs.settings, &inputs.record.source_id);
            doc = self.mapper.map_values(&inputs.record.source_id, doc);
        } else {
            doc = self.mapper.map_values(&inputs.record.source_id, doc);
            self.add_institution_to_building(&mut doc, inputs.settings, &inputs.record.source_id);
        }

        // Step 7: hierarchical facet expansion.
        for field in &self.config.hierarchical_facets {
            if let Some(value) = doc.get(field).cloned() {
                if !value.is_multi() {
                    let expanded = unicode_norm::expand_hierarchical_facet(
                        value.as_slice().first().copied().unwrap_or(""),
                    );
                    doc.insert(field.clone(), FieldValue::Multi(expanded));
                }
            }
        }

        // Step 8: allfields synthesis.
        if !doc.contains_key("allfields") {
            let mut all = Vec::new();
            for (field, value) in &doc {
                if ALLFIELDS_EXCLUDE.contains(&field.as_str()) {
                    continue;
                }
                all.extend(value.as_slice().into_iter().map(str::to_string));
            }
            doc.insert(
                "allfields".to_string(),
                FieldValue::Multi(unicode_norm::unique_case_insensitive(all)),
            );
        }

        // Step 9: timestamps.
        doc.insert(
            "first_indexed".to_string(),
            FieldValue::Single(format_iso_z(inputs.record.created)),
        );
        doc.insert("last_indexed".to_string(), FieldValue::Single(format_iso_z(effective_date)));
        doc.entry("fullrecord".to_string())
            .or_insert_with(|| FieldValue::Single(inputs.record.original_data.clone()));

        // Step 10: format in allfields.
        if self.config.format_in_allfields {
            if let Some(format_value) = doc.get("format").cloned() {
                let extra: Vec<String> = format_value
                    .as_slice()
                    .iter()
                    .map(|f| unicode_norm::digit_to_letter(f))
                    .collect();
                doc.entry("allfields".to_string())
                    .or_insert_with(|| FieldValue::Multi(Vec::new()))
                    .extend(extra);
            }
        }

        // Step 11: hidden marker.
        if inputs.is_hidden_component_part {
            doc.insert(
                "hidden_component_boolean".to_string(),
                FieldValue::Single("true".to_string()),
            );
        }

        // Step 12: work keys.
        self.add_work_keys(&mut doc, inputs.metadata);

        // Step 13: normalization & cleanup.
        let form = NormalizationForm::parse(&self.config.unicode_normalization_form);
        let case_sensitive_fields: Vec<&str> = self
            .config
            .hierarchical_facets
            .iter()
            .map(String::as_str)
            .collect();
        let mut normalized = SolrDocument::new();
        for (field, value) in doc {
            if field == "fullrecord" {
                normalized.insert(field, value);
                continue;
            }
            match value {
                FieldValue::Single(s) => {
                    let n = form.normalize(&s);
                    if !unicode_norm::is_empty_or_zero(&n) {
                        normalized.insert(field, FieldValue::Single(n));
                    }
                }
                FieldValue::Multi(values) => {
                    let case_insensitive = !case_sensitive_fields.contains(&field.as_str());
                    let cleaned = unicode_norm::normalize_clean_dedup(values, form, case_insensitive);
                    if !cleaned.is_empty() {
                        normalized.insert(field, FieldValue::Multi(cleaned));
                    }
                }
            }
        }
        doc = normalized;

        // Step 14: warnings.
        let mut all_warnings = warnings;
        all_warnings.extend(inputs.metadata.processing_warnings());
        if !all_warnings.is_empty() {
            if let Some(field) = &self.config.warnings_field {
                doc.entry(field.clone())
                    .or_insert_with(|| FieldValue::Multi(Vec::new()))
                    .extend(all_warnings);
            }
        }

        doc.entry("record_format".to_string())
            .or_insert_with(|| FieldValue::Single(inputs.metadata.format().to_string()));

        Ok(Some(BuildOutcome {
            doc,
            merged_component_count,
        }))
    }

    fn should_merge_parts(&self, settings: &DataSourceSettings, parts: &[ResolvedRecord]) -> bool {
        if parts.is_empty() {
            return false;
        }
        match settings.component_parts {
            ComponentPartsPolicy::MergeAll => true,
            ComponentPartsPolicy::MergeNonEarticles => !parts
                .iter()
                .all(|p| self.config.ejournal_formats.iter().any(|f| f == p.metadata.format())),
            ComponentPartsPolicy::AsIs => !parts
                .iter()
                .any(|p| self.config.journal_formats.iter().any(|f| f == p.metadata.format())),
        }
    }

    fn hierarchy_id_fields_present(&self, doc: &SolrDocument) -> Vec<String> {
        [
            self.config.hierarchy_top_id_field.clone(),
            self.config.hierarchy_parent_id_field.clone(),
        ]
        .into_iter()
        .filter(|f| doc.contains_key(f))
        .collect()
    }

    fn add_institution_to_building(
        &self,
        doc: &mut SolrDocument,
        settings: &DataSourceSettings,
        source_id: &str,
    ) {
        let prefix = match settings.institution_in_building {
            InstitutionInBuilding::None => return,
            InstitutionInBuilding::Institution => settings.institution.clone().unwrap_or_default(),
            InstitutionInBuilding::Driver => source_id.to_string(),
            InstitutionInBuilding::Source => source_id.to_string(),
            InstitutionInBuilding::InstitutionSlashSource => {
                format!("{}/{}", settings.institution.clone().unwrap_or_default(), source_id)
            }
        };
        if prefix.is_empty() {
            return;
        }
        for field in &self.config.building_fields {
            match doc.get_mut(field) {
                Some(value) => {
                    let prefixed = value
                        .as_slice()
                        .iter()
                        .map(|v| format!("{prefix}/{v}"))
                        .collect::<Vec<_>>();
                    *value = FieldValue::Multi(prefixed);
                }
                None if field == "building" => {
                    doc.insert(field.clone(), FieldValue::Multi(vec![prefix.clone()]));
                }
                None => {}
            }
        }
    }

    fn add_work_keys(&self, doc: &mut SolrDocument, metadata: &dyn MetadataRecord) {
        let data = metadata.work_identification_data();
        if data.authors.is_empty() && data.titles.is_empty() && data.uniform_titles.is_empty() {
            return;
        }
        let mut keys = Vec::new();
        for title in data.uniform_titles.iter().chain(data.uniform_titles_alt_script.iter()) {
            keys.push(format!("UT {}", normalize_work_key(title)));
        }
        for title in data.titles.iter().chain(data.titles_alt_script.iter()) {
            for author in &data.authors {
                keys.push(format!("AT {} {}", normalize_work_key(author), normalize_work_key(title)));
            }
        }
        if !keys.is_empty() {
            doc.entry(self.config.work_keys_field.clone())
                .or_insert_with(|| FieldValue::Multi(Vec::new()))
                .extend(keys);
        }
    }
}

fn create_solr_id(full_id: &str, source_id: &str, settings: &DataSourceSettings, strip_prefix: bool) -> String {
    let local = full_id.split_once('.').map(|(_, l)| l).unwrap_or(full_id);
    if strip_prefix {
        local.to_string()
    } else {
        format!("{}.{}", settings.id_prefix_or(source_id), local)
    }
}

fn format_iso_z(ts: OffsetDateTime) -> String {
    ts.to_offset(time::UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| ts.to_string())
}

/// Idempotent work-key normalization: lowercase, collapse whitespace. Real
/// deployments would additionally strip diacritics and punctuation per the
/// data-source's normalization rules; those rules are out of this crate's
/// scope.
fn normalize_work_key(value: &str) -> String {
    value.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

static TRANSFORMED_FIELD_RE: Lazy<regex::Regex> =
    Lazy::new(|| regex::Regex::new(r#"(?s)<field\s+name="([^"]*)"\s*>(.*?)</field>"#).expect("static field regex"));

/// Extracts `<field name="...">value</field>` pairs out of a `solrTransformation`
/// stylesheet's output, the Solr update-XML shape such a stylesheet producing
/// "the whole document" is expected to emit. Repeated field names accumulate
/// into a multi-valued field, in source order.
fn parse_transformed_xml_into_doc(xml: &str) -> SolrDocument {
    let mut doc = SolrDocument::new();
    for cap in TRANSFORMED_FIELD_RE.captures_iter(xml) {
        let name = cap[1].trim();
        if name.is_empty() {
            continue;
        }
        let value = unescape_xml_entities(cap[2].trim());
        if value.is_empty() {
            continue;
        }
        doc.entry(name.to_string())
            .or_insert_with(|| FieldValue::Multi(Vec::new()))
            .push(value);
    }
    doc
}

fn unescape_xml_entities(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
