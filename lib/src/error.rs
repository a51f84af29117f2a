// Copyright 2026 The DataLad Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error taxonomy carried by error result records.
//!
//! Module-level error types stay `thiserror` enums close to where they
//! happen; at the result boundary they are flattened into an
//! [`ErrorReport`] with a stable [`ErrorKind`] so renderers, hooks, and
//! exit-code mapping can act on failures without downcasting.

use std::error::Error as StdError;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Classification of a failure, stable across module boundaries.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// No containing dataset was found for a required purpose.
    NoDataset,
    /// Argument values failed validation.
    InvalidArgument,
    /// A required helper binary is absent or non-functional.
    MissingExternalDependency,
    /// A declared sibling cannot be reached.
    RemoteNotAvailable,
    /// An individual transfer failed.
    Transfer,
    /// Local filesystem or remote authorization failure.
    Permission,
    /// State expected to be clean was dirty, or a merge conflicted.
    Conflict,
    /// Content hash did not match the expected key after transfer.
    IntegrityMismatch,
    /// The operation was cancelled cooperatively.
    Cancelled,
    /// Non-zero exit from an externally executed command.
    External,
    /// Infrastructure failure inside this crate.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NoDataset => "no-dataset",
            Self::InvalidArgument => "invalid-argument",
            Self::MissingExternalDependency => "missing-external-dependency",
            Self::RemoteNotAvailable => "remote-not-available",
            Self::Transfer => "transfer",
            Self::Permission => "permission",
            Self::Conflict => "conflict",
            Self::IntegrityMismatch => "integrity-mismatch",
            Self::Cancelled => "cancelled",
            Self::External => "external",
            Self::Internal => "internal",
        };
        write!(f, "{name}")
    }
}

/// Flattened error payload of an error result record.
///
/// The cause chain is rendered to strings eagerly so records stay `Clone`
/// and serializable regardless of the originating error type.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub causes: Vec<String>,
}

impl ErrorReport {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            causes: vec![],
        }
    }

    /// Captures `error` and its whole `source()` chain.
    pub fn from_error(kind: ErrorKind, error: &dyn StdError) -> Self {
        let mut causes = vec![];
        let mut cur = error.source();
        while let Some(cause) = cur {
            causes.push(cause.to_string());
            cur = cause.source();
        }
        Self {
            kind,
            message: error.to_string(),
            causes,
        }
    }

    /// One-line rendering: message plus bracketed cause labels.
    pub fn render_short(&self) -> String {
        if self.causes.is_empty() {
            self.message.clone()
        } else {
            format!("{} [{}]", self.message, self.causes.join(": "))
        }
    }

    /// Multi-line rendering with the full cause chain, one cause per line.
    pub fn render_full(&self) -> String {
        let mut out = format!("{}: {}", self.kind, self.message);
        for (i, cause) in self.causes.iter().enumerate() {
            out.push_str(&format!("\n{:indent$}caused by: {cause}", "", indent = (i + 1) * 2));
        }
        out
    }
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render_short())
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("outer failure")]
    struct Outer(#[source] io::Error);

    #[test]
    fn test_from_error_captures_chain() {
        let err = Outer(io::Error::other("inner failure"));
        let report = ErrorReport::from_error(ErrorKind::Transfer, &err);
        assert_eq!(report.message, "outer failure");
        assert_eq!(report.causes, ["inner failure"]);
    }

    #[test]
    fn test_render_short_and_full() {
        let mut report = ErrorReport::new(ErrorKind::Conflict, "tree is dirty");
        assert_eq!(report.render_short(), "tree is dirty");
        report.causes.push("unsaved file x".into());
        assert_eq!(report.render_short(), "tree is dirty [unsaved file x]");
        assert_eq!(
            report.render_full(),
            "conflict: tree is dirty\n  caused by: unsaved file x"
        );
    }

    #[test]
    fn test_kind_serialization() {
        let json = serde_json::to_string(&ErrorKind::IntegrityMismatch).unwrap();
        assert_eq!(json, "\"integrity-mismatch\"");
    }
}
