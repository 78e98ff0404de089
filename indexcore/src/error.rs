// Copyright (C) 2024 RecordManager-rs contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <http://www.gnu.org/licenses/>.

use std::fmt;

use thiserror::Error;

/// Classification of core errors, following the taxonomy of transient vs. fatal
/// failure modes the indexing coordinator must distinguish between.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CoreErrorKind {
    /// HTTP 5xx, socket errors, a `degraded` cluster: retried with backoff.
    TransientIo,
    /// The search cluster stayed `error` beyond the retry budget.
    ClusterUnreachable,
    /// Missing linking ids, host records, dedup record, or data-source settings.
    /// Logged and tolerated; processing continues with partial data.
    DataDefect,
    /// Unserializable JSON, missing required configuration: not recoverable.
    Contract,
    /// SIGINT or an equivalent external interruption.
    Interrupted,
    /// The forked/spawned sibling processing the merged stream failed.
    ChildFailure,
}

/// Generic core error: a `kind` plus a boxed source, the same
/// `kind` + `#[source] anyhow::Error` shape used elsewhere in this crate's
/// error types.
#[derive(Error, Debug)]
#[error("CoreError(kind={kind:?}, source={source})")]
pub struct CoreError {
    pub kind: CoreErrorKind,
    #[source]
    source: anyhow::Error,
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreErrorKind {
    pub fn with_error<E>(self, source: E) -> CoreError
    where
        anyhow::Error: From<E>,
    {
        CoreError {
            kind: self,
            source: From::from(source),
        }
    }
}

impl CoreError {
    pub fn add_context<C>(self, ctx: C) -> Self
    where
        C: fmt::Display + Send + Sync + 'static,
    {
        CoreError {
            kind: self.kind,
            source: self.source.context(ctx),
        }
    }

    pub fn kind(&self) -> CoreErrorKind {
        self.kind
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            CoreErrorKind::TransientIo | CoreErrorKind::ClusterUnreachable
        )
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(err: reqwest::Error) -> CoreError {
        CoreErrorKind::TransientIo.with_error(err)
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> CoreError {
        CoreErrorKind::Contract.with_error(err)
    }
}
