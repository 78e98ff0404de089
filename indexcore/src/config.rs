// Copyright (C) 2024 RecordManager-rs contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.

//! Configuration: the global Solr/indexing settings and the per-source
//! `datasources` table. Both are deserialized with `serde` from TOML, the
//! way the rest of this codebase's corpus loads structured configuration.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentPartsPolicy {
    AsIs,
    MergeAll,
    MergeNonEarticles,
}

impl Default for ComponentPartsPolicy {
    fn default() -> Self {
        ComponentPartsPolicy::AsIs
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstitutionInBuilding {
    Institution,
    Driver,
    None,
    Source,
    #[serde(rename = "institution/source")]
    InstitutionSlashSource,
}

impl Default for InstitutionInBuilding {
    fn default() -> Self {
        InstitutionInBuilding::None
    }
}

/// Per-source-id settings, keyed in [`DataSourceSettings::load`]'s caller by
/// source id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSourceSettings {
    pub institution: Option<String>,
    #[serde(default)]
    pub component_parts: ComponentPartsPolicy,
    #[serde(default)]
    pub component_part_source_id: Vec<String>,
    #[serde(default = "default_true")]
    pub index_merged_parts: bool,
    pub pre_transformation: Option<String>,
    pub normalization: Option<String>,
    pub solr_transformation: Option<String>,
    pub id_prefix: Option<String>,
    #[serde(default)]
    pub index_unprefixed_ids: bool,
    #[serde(default)]
    pub dedup: bool,
    #[serde(default = "default_true")]
    pub index: bool,
    #[serde(default)]
    pub institution_in_building: InstitutionInBuilding,
    #[serde(default)]
    pub add_institution_to_building_before_mapping: bool,
    /// `name:value` pairs.
    #[serde(default)]
    pub extrafields: Vec<String>,
    #[serde(default)]
    pub enrichments: Vec<String>,
}

impl Default for DataSourceSettings {
    /// Mirrors the `#[serde(default = ...)]` values above field-by-field;
    /// a plain `#[derive(Default)]` would silently give `index` and
    /// `index_merged_parts` `false` instead of their real defaults.
    fn default() -> Self {
        DataSourceSettings {
            institution: None,
            component_parts: ComponentPartsPolicy::default(),
            component_part_source_id: Vec::new(),
            index_merged_parts: true,
            pre_transformation: None,
            normalization: None,
            solr_transformation: None,
            id_prefix: None,
            index_unprefixed_ids: false,
            dedup: false,
            index: true,
            institution_in_building: InstitutionInBuilding::default(),
            add_institution_to_building_before_mapping: false,
            extrafields: Vec::new(),
            enrichments: Vec::new(),
        }
    }
}

impl DataSourceSettings {
    pub fn id_prefix_or<'a>(&'a self, source_id: &'a str) -> &'a str {
        self.id_prefix.as_deref().unwrap_or(source_id)
    }

    /// Parses `extrafields` entries of the form `name:value` into pairs,
    /// skipping malformed entries.
    pub fn extrafield_pairs(&self) -> Vec<(&str, &str)> {
        self.extrafields
            .iter()
            .filter_map(|entry| entry.split_once(':'))
            .collect()
    }
}

/// Table of all known sources, as loaded from `datasources.ini`'s equivalent.
pub type DataSourceTable = HashMap<String, DataSourceSettings>;

/// The Solr/indexing section of the global configuration (§3 "Global
/// config (Solr section)").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolrIndexingConfig {
    pub update_url: String,
    pub search_url: String,
    pub admin_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,

    #[serde(default = "default_max_commit_interval")]
    pub max_commit_interval: u64,
    #[serde(default = "default_max_update_records")]
    pub max_update_records: usize,
    #[serde(default = "default_max_update_size_kib")]
    pub max_update_size_kib: usize,
    #[serde(default = "default_max_update_tries")]
    pub max_update_tries: u32,
    #[serde(default = "default_update_retry_wait")]
    pub update_retry_wait_secs: u64,

    #[serde(default)]
    pub record_workers: usize,
    #[serde(default)]
    pub solr_update_workers: usize,
    #[serde(default)]
    pub threaded_merged_record_update: bool,
    #[serde(default = "default_cluster_state_check_interval")]
    pub cluster_state_check_interval_secs: i64,
    #[serde(default)]
    pub track_updates_per_update_url: bool,

    #[serde(default = "default_unicode_normalization_form")]
    pub unicode_normalization_form: String,

    #[serde(default)]
    pub merged_fields: Vec<String>,
    #[serde(default)]
    pub single_fields: Vec<String>,
    #[serde(default)]
    pub scored_fields: Vec<String>,
    #[serde(default)]
    pub building_fields: Vec<String>,
    #[serde(default)]
    pub hierarchical_facets: Vec<String>,
    #[serde(default)]
    pub copy_from_merged_record: Vec<String>,
    #[serde(default)]
    pub journal_formats: Vec<String>,
    #[serde(default)]
    pub ejournal_formats: Vec<String>,
    pub warnings_field: Option<String>,
    #[serde(default)]
    pub format_in_allfields: bool,
    #[serde(default)]
    pub ignore_in_comparison: Vec<String>,

    #[serde(default = "default_dedup_id_field")]
    pub dedup_id_field: String,
    #[serde(default = "default_container_title_field")]
    pub container_title_field: String,
    #[serde(default = "default_container_volume_field")]
    pub container_volume_field: String,
    #[serde(default = "default_container_issue_field")]
    pub container_issue_field: String,
    #[serde(default = "default_container_start_page_field")]
    pub container_start_page_field: String,
    #[serde(default = "default_container_reference_field")]
    pub container_reference_field: String,
    #[serde(default = "default_hierarchy_top_id_field")]
    pub hierarchy_top_id_field: String,
    #[serde(default = "default_hierarchy_parent_id_field")]
    pub hierarchy_parent_id_field: String,
    #[serde(default = "default_hierarchy_parent_title_field")]
    pub hierarchy_parent_title_field: String,
    #[serde(default = "default_is_hierarchy_id_field")]
    pub is_hierarchy_id_field: String,
    #[serde(default = "default_is_hierarchy_title_field")]
    pub is_hierarchy_title_field: String,
    #[serde(default = "default_work_keys_field")]
    pub work_keys_field: String,
}

fn default_max_commit_interval() -> u64 {
    1
}
fn default_max_update_records() -> usize {
    5000
}
fn default_max_update_size_kib() -> usize {
    1024
}
fn default_max_update_tries() -> u32 {
    5
}
fn default_update_retry_wait() -> u64 {
    30
}
fn default_cluster_state_check_interval() -> i64 {
    0
}
fn default_unicode_normalization_form() -> String {
    "NFKC".to_string()
}
fn default_dedup_id_field() -> String {
    "dedup_id_str_mv".to_string()
}
fn default_container_title_field() -> String {
    "container_title".to_string()
}
fn default_container_volume_field() -> String {
    "container_volume".to_string()
}
fn default_container_issue_field() -> String {
    "container_issue".to_string()
}
fn default_container_start_page_field() -> String {
    "container_start_page".to_string()
}
fn default_container_reference_field() -> String {
    "container_reference".to_string()
}
fn default_hierarchy_top_id_field() -> String {
    "hierarchy_top_id".to_string()
}
fn default_hierarchy_parent_id_field() -> String {
    "hierarchy_parent_id".to_string()
}
fn default_hierarchy_parent_title_field() -> String {
    "hierarchy_parent_title".to_string()
}
fn default_is_hierarchy_id_field() -> String {
    "is_hierarchy_id".to_string()
}
fn default_is_hierarchy_title_field() -> String {
    "is_hierarchy_title".to_string()
}
fn default_work_keys_field() -> String {
    "work_keys_str_mv".to_string()
}

impl SolrIndexingConfig {
    pub fn max_update_size_bytes(&self) -> usize {
        self.max_update_size_kib * 1024
    }

    pub fn checkpoint_key(&self) -> String {
        if self.track_updates_per_update_url {
            format!("Last Index Update[ {}]", self.update_url)
        } else {
            "Last Index Update".to_string()
        }
    }

    pub fn parse(toml_str: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(toml_str)
    }
}

pub fn parse_datasources(toml_str: &str) -> Result<DataSourceTable, toml::de::Error> {
    toml::from_str(toml_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let cfg = SolrIndexingConfig::parse(
            r#"
            update_url = "http://localhost:8983/solr/biblio/update"
            search_url = "http://localhost:8983/solr/biblio/select"
        "#,
        )
        .unwrap();
        assert_eq!(cfg.max_update_tries, 5);
        assert_eq!(cfg.dedup_id_field, "dedup_id_str_mv");
        assert_eq!(cfg.checkpoint_key(), "Last Index Update");
    }

    #[test]
    fn checkpoint_key_is_per_url_when_tracked() {
        let mut cfg = SolrIndexingConfig::parse(
            r#"
            update_url = "http://a/update"
            search_url = "http://a/select"
        "#,
        )
        .unwrap();
        cfg.track_updates_per_update_url = true;
        assert_eq!(cfg.checkpoint_key(), "Last Index Update[ http://a/update]");
    }

    #[test]
    fn extrafield_pairs_skip_malformed() {
        let settings = DataSourceSettings {
            extrafields: vec!["institution:MyInst".to_string(), "broken".to_string()],
            ..Default::default()
        };
        assert_eq!(settings.extrafield_pairs(), vec![("institution", "MyInst")]);
    }
}
