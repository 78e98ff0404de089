// Copyright (C) 2024 RecordManager-rs contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.

//! §4.G Merge Engine: scoring, field-class-driven fusion, and copy-back.

use std::sync::Arc;

use crate::config::SolrIndexingConfig;
use crate::model::{FieldValue, SolrDocument};
use crate::unicode_norm;

const LOCAL_IDS_FIELD: &str = "local_ids_str_mv";

/// A child document plus the id it should be recorded under in
/// `local_ids_str_mv`.
pub struct ScoredChild {
    pub id: String,
    pub doc: SolrDocument,
    score: f64,
}

pub struct MergeEngine {
    config: Arc<SolrIndexingConfig>,
}

impl MergeEngine {
    pub fn new(config: Arc<SolrIndexingConfig>) -> Self {
        MergeEngine { config }
    }

    /// Scores every child, sorts descending, then fuses fields in that
    /// order. Returns the merged document.
    pub fn merge_records(&self, children: Vec<(String, SolrDocument)>) -> SolrDocument {
        let mut scored: Vec<ScoredChild> = children
            .into_iter()
            .map(|(id, doc)| {
                let score = self.score(&doc);
                ScoredChild { id, doc, score }
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

        let mut merged = SolrDocument::new();
        let mut author_merged = false;
        let alias_author2 = self.config.merged_fields.iter().any(|f| f == "author=author2");

        for child in &scored {
            merged
                .entry(LOCAL_IDS_FIELD.to_string())
                .or_insert_with(|| FieldValue::Multi(Vec::new()))
                .push(child.id.clone());

            for (field, value) in &child.doc {
                let target_field = if field == "author" && alias_author2 {
                    "author2"
                } else {
                    field.as_str()
                };
                let is_mv = field.ends_with("_mv") || self.config.merged_fields.iter().any(|f| f == field);
                let is_author_alias_merge = field == "author"
                    && alias_author2
                    && merged
                        .get(target_field)
                        .map(|v| !v.as_slice().contains(&value.as_slice().first().copied().unwrap_or("")))
                        .unwrap_or(true);

                if is_mv || is_author_alias_merge {
                    merged
                        .entry(target_field.to_string())
                        .or_insert_with(|| FieldValue::Multi(Vec::new()))
                        .extend(value.clone().into_vec());
                    if field == "author" {
                        author_merged = true;
                    }
                } else if self.config.single_fields.iter().any(|f| f == field)
                    || (field == "author" && !author_merged)
                {
                    merged.entry(field.clone()).or_insert_with(|| value.clone());
                } else if field == "allfields" {
                    merged
                        .entry("allfields".to_string())
                        .or_insert_with(|| FieldValue::Multi(Vec::new()))
                        .extend(value.clone().into_vec());
                }
                // Anything not matching falls through and is ignored, per spec.
            }
        }

        // Post-pass: dedup every multi-valued/merged field.
        let hierarchical: Vec<&str> = self.config.hierarchical_facets.iter().map(String::as_str).collect();
        for (field, value) in merged.iter_mut() {
            if let FieldValue::Multi(values) = value {
                let case_insensitive = field == "allfields" || !hierarchical.contains(&field.as_str());
                *values = unicode_norm::dedup_preserve_order(std::mem::take(values), case_insensitive);
            }
        }

        merged
    }

    /// `score = fc == 0 ? 0 : (capsRatio == 0 ? fc : (fc + tl) / capsRatio)`
    /// where `fc` is the count of values across `scored_fields`, `tl` is the
    /// title length, and `capsRatio` is the per-field average "uppercase
    /// density".
    fn score(&self, doc: &SolrDocument) -> f64 {
        let mut field_count = 0usize;
        let mut caps_ratios = Vec::new();
        for field in &self.config.scored_fields {
            if let Some(value) = doc.get(field) {
                let values = value.as_slice();
                field_count += values.len();
                for v in values {
                    caps_ratios.push(caps_ratio(v));
                }
            }
        }
        if field_count == 0 {
            return 0.0;
        }
        let caps_ratio_avg = if caps_ratios.is_empty() {
            0.0
        } else {
            caps_ratios.iter().sum::<f64>() / caps_ratios.len() as f64
        };
        let title_len = doc
            .get("title")
            .map(|v| v.as_slice().first().map(|s| s.len()).unwrap_or(0))
            .unwrap_or(0) as f64;
        if caps_ratio_avg == 0.0 {
            field_count as f64
        } else {
            (field_count as f64 + title_len) / caps_ratio_avg
        }
    }

    /// For every field in `copy_from_merged_record`, unions the merged
    /// field's values into each child's own copy of that field.
    pub fn copy_merged_data_to_children(
        &self,
        merged: &SolrDocument,
        children: &mut [(String, SolrDocument)],
    ) {
        for field in &self.config.copy_from_merged_record {
            let Some(merged_value) = merged.get(field) else { continue };
            for (_, child_doc) in children.iter_mut() {
                let union = match child_doc.get(field) {
                    Some(existing) => {
                        let mut values = existing.clone().into_vec();
                        values.extend(merged_value.clone().into_vec());
                        unicode_norm::dedup_preserve_order(values, true)
                    }
                    None => merged_value.clone().into_vec(),
                };
                child_doc.insert(field.clone(), FieldValue::Multi(union));
            }
        }
    }
}

/// `1 - (lcs_len(v, lowercase(v)) / byteLen(v))`: 0 when `v` is already all
/// lowercase, approaching 1 as more characters differ from their lowercase
/// form.
fn caps_ratio(value: &str) -> f64 {
    if value.is_empty() {
        return 0.0;
    }
    let lower = value.to_lowercase();
    let sim = longest_common_subsequence_len(value, &lower) as f64;
    1.0 - (sim / value.len() as f64)
}

fn longest_common_subsequence_len(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];
    for i in 1..=a.len() {
        for j in 1..=b.len() {
            curr[j] = if a[i - 1] == b[j - 1] {
                prev[j - 1] + 1
            } else {
                prev[j].max(curr[j - 1])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Arc<SolrIndexingConfig> {
        let mut cfg = SolrIndexingConfig::parse(
            r#"
            update_url = "http://x/update"
            search_url = "http://x/select"
        "#,
        )
        .unwrap();
        cfg.scored_fields = vec!["title".to_string()];
        cfg.merged_fields = vec!["isbn".to_string()];
        cfg.single_fields = vec!["title".to_string()];
        Arc::new(cfg)
    }

    fn doc_with_title(title: &str) -> SolrDocument {
        let mut d = SolrDocument::new();
        d.insert("title".to_string(), FieldValue::Single(title.to_string()));
        d.insert(
            "isbn".to_string(),
            FieldValue::Multi(vec!["isbn-x".to_string()]),
        );
        d
    }

    #[test]
    fn s2_lowercase_heavy_title_wins_and_local_ids_capture_both() {
        let engine = MergeEngine::new(config());
        let children = vec![
            ("a.1".to_string(), doc_with_title("Hello World")),
            ("a.2".to_string(), doc_with_title("HELLO WORLD")),
        ];
        let merged = engine.merge_records(children);
        // "Hello World" has a lower caps ratio than "HELLO WORLD", so it
        // scores higher and its title should win the single-valued field.
        assert_eq!(
            merged.get("title"),
            Some(&FieldValue::Single("Hello World".to_string()))
        );
        let ids = merged.get(LOCAL_IDS_FIELD).unwrap().as_slice();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"a.1"));
        assert!(ids.contains(&"a.2"));
    }

    #[test]
    fn merge_is_order_independent_for_list_fields() {
        let engine = MergeEngine::new(config());
        let children_a = vec![
            ("a.1".to_string(), doc_with_title("Same Score")),
            ("a.2".to_string(), doc_with_title("Same Score")),
        ];
        let mut children_b = children_a.clone_for_test();
        children_b.reverse();

        let merged_a = MergeEngine::new(config()).merge_records(children_a);
        let merged_b = engine.merge_records(children_b);

        let mut isbn_a = merged_a.get("isbn").unwrap().clone().into_vec();
        let mut isbn_b = merged_b.get("isbn").unwrap().clone().into_vec();
        isbn_a.sort();
        isbn_b.sort();
        assert_eq!(isbn_a, isbn_b);
    }

    trait CloneForTest {
        fn clone_for_test(&self) -> Self;
    }
    impl CloneForTest for Vec<(String, SolrDocument)> {
        fn clone_for_test(&self) -> Self {
            self.iter().map(|(id, doc)| (id.clone(), doc.clone())).collect()
        }
    }

    #[test]
    fn copy_from_merged_record_unions_into_children() {
        let mut cfg = (*config()).clone();
        cfg.copy_from_merged_record = vec!["topic".to_string()];
        let engine = MergeEngine::new(Arc::new(cfg));
        let mut merged = SolrDocument::new();
        merged.insert(
            "topic".to_string(),
            FieldValue::Multi(vec!["Physics".to_string(), "Math".to_string()]),
        );
        let mut children = vec![(
            "a.1".to_string(),
            {
                let mut d = SolrDocument::new();
                d.insert("topic".to_string(), FieldValue::Multi(vec!["Math".to_string()]));
                d
            },
        )];
        engine.copy_merged_data_to_children(&merged, &mut children);
        let topics = children[0].1.get("topic").unwrap().as_slice();
        assert!(topics.contains(&"Physics"));
        assert!(topics.contains(&"Math"));
    }

    #[test]
    fn hierarchical_facet_dedup_is_case_sensitive() {
        let mut cfg = (*config()).clone();
        cfg.hierarchical_facets = vec!["hierarchy".to_string()];
        cfg.merged_fields = vec!["hierarchy".to_string()];
        let engine = MergeEngine::new(Arc::new(cfg));
        let mut doc = doc_with_title("T");
        doc.insert(
            "hierarchy".to_string(),
            FieldValue::Multi(vec!["0/A/".to_string(), "0/a/".to_string()]),
        );
        let merged = engine.merge_records(vec![("a.1".to_string(), doc)]);
        let values = merged.get("hierarchy").unwrap().as_slice();
        assert_eq!(values.len(), 2);
    }
}
