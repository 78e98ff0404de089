// Copyright (C) 2024 RecordManager-rs contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.

//! Small text helpers shared by the document builder and merge engine:
//! Unicode normalization, the `0`/empty-value test, order-preserving
//! dedup, and the digit-to-letter substitution used by `format_in_allfields`.

use std::collections::HashSet;

use unicode_normalization::UnicodeNormalization;

/// Unicode normalization forms the config's `unicode_normalization_form`
/// setting can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizationForm {
    Nfc,
    Nfd,
    Nfkc,
    Nfkd,
    None,
}

impl NormalizationForm {
    pub fn parse(name: &str) -> NormalizationForm {
        match name.to_ascii_uppercase().as_str() {
            "NFC" => NormalizationForm::Nfc,
            "NFD" => NormalizationForm::Nfd,
            "NFKC" => NormalizationForm::Nfkc,
            "NFKD" => NormalizationForm::Nfkd,
            _ => NormalizationForm::None,
        }
    }

    pub fn normalize(self, value: &str) -> String {
        match self {
            NormalizationForm::Nfc => value.nfc().collect(),
            NormalizationForm::Nfd => value.nfd().collect(),
            NormalizationForm::Nfkc => value.nfkc().collect(),
            NormalizationForm::Nfkd => value.nfkd().collect(),
            NormalizationForm::None => value.to_string(),
        }
    }
}

/// True if a scalar value must be dropped entirely (§3 Solr document
/// invariant): empty string, `"0"`, `"0.0"`, or numeric zero.
pub fn is_empty_or_zero(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty() || trimmed == "0" || trimmed == "0.0"
}

/// Deduplicates a list of values while preserving first-seen order.
/// `case_insensitive` controls whether the comparison folds case (used for
/// everything except hierarchical facets, whose case encodes path depth).
pub fn dedup_preserve_order(values: Vec<String>, case_insensitive: bool) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(values.len());
    for v in values {
        let key = if case_insensitive {
            v.to_lowercase()
        } else {
            v.clone()
        };
        if seen.insert(key) {
            out.push(v);
        }
    }
    out
}

/// Normalizes every value in `values`, drops empty/zero entries, then
/// dedups preserving order.
pub fn normalize_clean_dedup(
    values: Vec<String>,
    form: NormalizationForm,
    case_insensitive_dedup: bool,
) -> Vec<String> {
    let cleaned: Vec<String> = values
        .into_iter()
        .map(|v| form.normalize(&v))
        .filter(|v| !is_empty_or_zero(v))
        .collect();
    dedup_preserve_order(cleaned, case_insensitive_dedup)
}

/// Substitutes digits `0`-`9` with the letters `ax`..`jx`, so index analyzers
/// that split on word boundaries do not fragment a token like "2nd" the same
/// way they would a bare number.
pub fn digit_to_letter(value: &str) -> String {
    value
        .chars()
        .map(|c| match c {
            '0'..='9' => {
                let offset = c as u8 - b'0';
                format!("{}x", (b'a' + offset) as char)
            }
            other => other.to_string(),
        })
        .collect()
}

/// Expands a `"a/b/c"` hierarchical facet path into depth-prefixed
/// `["0/a/", "1/a/b/", "2/a/b/c/"]` form.
/// A value that is already an array is passed through unsplit by the caller.
pub fn expand_hierarchical_facet(path: &str) -> Vec<String> {
    let parts: Vec<&str> = path.split('/').collect();
    let mut out = Vec::with_capacity(parts.len());
    for depth in 0..parts.len() {
        let joined = parts[..=depth].join("/");
        out.push(format!("{depth}/{joined}/"));
    }
    out
}

/// Case-insensitive order-preserving uniquing, used for `allfields`.
pub fn unique_case_insensitive(values: Vec<String>) -> Vec<String> {
    dedup_preserve_order(values, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hierarchical_facet_expansion_matches_spec_example() {
        assert_eq!(
            expand_hierarchical_facet("a/b/c"),
            vec!["0/a/", "1/a/b/", "2/a/b/c/"]
        );
    }

    #[test]
    fn empty_zero_detection() {
        assert!(is_empty_or_zero(""));
        assert!(is_empty_or_zero("0"));
        assert!(is_empty_or_zero("0.0"));
        assert!(is_empty_or_zero("  "));
        assert!(!is_empty_or_zero("0.1"));
        assert!(!is_empty_or_zero("Book"));
    }

    #[test]
    fn dedup_preserves_first_seen_order() {
        let values = vec!["A".to_string(), "b".to_string(), "a".to_string()];
        assert_eq!(
            dedup_preserve_order(values, true),
            vec!["A".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn digit_substitution_avoids_bare_numbers() {
        assert_eq!(digit_to_letter("2nd"), "cxnd");
        assert_eq!(digit_to_letter("Book"), "Book");
    }

    #[test]
    fn normalize_clean_dedup_drops_zero_values() {
        let values = vec!["0".to_string(), "Title".to_string(), "title".to_string()];
        let out = normalize_clean_dedup(values, NormalizationForm::None, true);
        assert_eq!(out, vec!["Title".to_string()]);
    }
}
