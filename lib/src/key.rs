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

//! Content keys of annexed files.
//!
//! A key names the bytes of an annexed file deterministically:
//! `<backend>-s<size>--<digest>`, with field variants between the backend
//! and the digest (`s` size, `m` mtime, `S`/`C` chunking). Backends with an
//! `E` suffix carry the file extension inside the digest part. The digest
//! is treated opaquely; only the size prefix is interpreted here.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Error parsing a content key.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("Key has no backend-digest separator: {0:?}")]
    MissingSeparator(String),
    #[error("Key has an empty backend or digest: {0:?}")]
    EmptyField(String),
    #[error("Malformed size field {field:?} in key {key:?}")]
    BadSize { key: String, field: String },
}

/// Parsed content key. Formats back to exactly the input string.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct AnnexKey {
    raw: String,
    backend_len: usize,
    size: Option<u64>,
}

impl AnnexKey {
    pub fn parse(raw: &str) -> Result<Self, KeyError> {
        let (prefix, digest) = raw
            .split_once("--")
            .ok_or_else(|| KeyError::MissingSeparator(raw.to_string()))?;
        let mut fields = prefix.split('-');
        let backend = fields.next().unwrap_or("");
        if backend.is_empty() || digest.is_empty() {
            return Err(KeyError::EmptyField(raw.to_string()));
        }
        let mut size = None;
        for field in fields {
            if let Some(digits) = field.strip_prefix('s')
                && field.len() > 1
            {
                size = Some(digits.parse().map_err(|_| KeyError::BadSize {
                    key: raw.to_string(),
                    field: field.to_string(),
                })?);
            }
            // Other fields (mtime, chunk size/number) are passed through.
        }
        Ok(Self {
            raw: raw.to_string(),
            backend_len: backend.len(),
            size,
        })
    }

    /// Backend name, e.g. `SHA256E` or `URL`.
    pub fn backend(&self) -> &str {
        &self.raw[..self.backend_len]
    }

    /// Declared content size in bytes, if the key carries one.
    ///
    /// URL-backed keys commonly do not; transfers must still work without
    /// it.
    pub fn size(&self) -> Option<u64> {
        self.size
    }

    /// The digest part after the `--` separator (extension included for
    /// `E` backends).
    pub fn digest(&self) -> &str {
        let sep = self.raw.find("--").expect("parsed keys have a separator");
        &self.raw[sep + 2..]
    }

    /// True for backends that embed the file extension (`E` suffix).
    pub fn carries_extension(&self) -> bool {
        self.backend().ends_with('E')
    }

    /// True if the digest is a verifiable checksum (as opposed to e.g. the
    /// URL and WORM backends, which cannot be re-checked from content).
    pub fn is_verifiable(&self) -> bool {
        let backend = self.backend();
        backend.starts_with("SHA") || backend.starts_with("MD5") || backend.starts_with("BLAKE")
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for AnnexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.raw)
    }
}

impl FromStr for AnnexKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<AnnexKey> for String {
    fn from(key: AnnexKey) -> Self {
        key.raw
    }
}

impl TryFrom<String> for AnnexKey {
    type Error = KeyError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw)
    }
}
