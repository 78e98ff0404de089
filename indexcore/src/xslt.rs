// Copyright (C) 2024 RecordManager-rs contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.

//! The XSLT transformation engine is an external collaborator:
//! the core calls [`XsltEngine::transform`] and does not care which XSLT
//! implementation backs it.

use std::collections::HashMap;

use crate::error::{CoreError, CoreErrorKind};

pub trait XsltEngine: Send + Sync {
    /// Applies the named stylesheet to `xml`, with the given string
    /// parameters (e.g. `source_id`, `institution`, `format`, `id_prefix`).
    fn transform(
        &self,
        stylesheet: &str,
        xml: &str,
        params: &HashMap<String, String>,
    ) -> Result<String, CoreError>;
}

/// An engine that always fails; useful as a default when no XSLT
/// implementation has been wired in, so a configured `solrTransformation`
/// surfaces a clear contract error rather than silently producing nothing.
pub struct UnconfiguredXsltEngine;

impl XsltEngine for UnconfiguredXsltEngine {
    fn transform(
        &self,
        stylesheet: &str,
        _xml: &str,
        _params: &HashMap<String, String>,
    ) -> Result<String, CoreError> {
        Err(CoreErrorKind::Contract.with_error(anyhow::anyhow!(
            "no XSLT engine configured, cannot apply stylesheet `{stylesheet}`"
        )))
    }
}
