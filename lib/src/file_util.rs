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

//! Filesystem helpers shared across the crate.

use std::io;
use std::io::Write as _;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

use tempfile::NamedTempFile;
use thiserror::Error;

/// I/O error annotated with the path it happened on.
#[derive(Debug, Error)]
#[error("Cannot access {path}")]
pub struct PathError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

/// Extension trait attaching a path context to `io::Result`.
pub trait IoResultExt<T> {
    fn context(self, path: impl AsRef<Path>) -> Result<T, PathError>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn context(self, path: impl AsRef<Path>) -> Result<T, PathError> {
        self.map_err(|error| PathError {
            path: path.as_ref().to_path_buf(),
            source: error,
        })
    }
}

/// Canonicalizes an existing path without introducing UNC prefixes on
/// Windows.
pub fn canonicalize(path: &Path) -> Result<PathBuf, PathError> {
    dunce::canonicalize(path).context(path)
}

/// Turns the given `to` path into relative path starting from the `from`
/// path.
///
/// Both `from` and `to` paths are supposed to be absolute and normalized in
/// the same manner.
pub fn relative_path(from: &Path, to: &Path) -> PathBuf {
    // Find common prefix.
    for (i, base) in from.ancestors().enumerate() {
        if let Ok(suffix) = to.strip_prefix(base) {
            if i == 0 && suffix.as_os_str().is_empty() {
                return ".".into();
            } else {
                let mut result = PathBuf::from_iter(std::iter::repeat_n("..", i));
                result.push(suffix);
                return result;
            }
        }
    }

    // No common prefix found. Return the original (absolute) path.
    to.to_owned()
}

/// Consumes as much `..` and `.` as possible without considering symlinks.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut result = PathBuf::new();
    for c in path.components() {
        match c {
            Component::CurDir => {}
            Component::ParentDir
                if matches!(result.components().next_back(), Some(Component::Normal(_))) =>
            {
                // Do not pop ".."
                let popped = result.pop();
                assert!(popped);
            }
            _ => {
                result.push(c);
            }
        }
    }

    if result.as_os_str().is_empty() {
        ".".into()
    } else {
        result
    }
}

/// Renders a relative path with `/` separators for on-the-wire records.
///
/// Persisted subdataset pointers and run records always use POSIX
/// separators, independent of the platform the record was written on.
/// Returns `None` if the path escapes its base or a component isn't valid
/// UTF-8.
pub fn wire_path(path: &Path) -> Option<String> {
    let mut out = String::new();
    for c in path.components() {
        match c {
            Component::Normal(name) => {
                if !out.is_empty() {
                    out.push('/');
                }
                out.push_str(name.to_str()?);
            }
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(out)
}

/// Converts an on-the-wire `/`-separated relative path to a native one.
pub fn from_wire_path(wire: &str) -> PathBuf {
    wire.split('/').filter(|c| !c.is_empty()).collect()
}

/// Writes `content` to `path` atomically via a sibling temporary file.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<(), PathError> {
    let parent = path.parent().expect("target path must have a parent");
    let mut temp = NamedTempFile::new_in(parent).context(parent)?;
    temp.write_all(content).context(path)?;
    temp.flush().context(path)?;
    temp.persist(path)
        .map_err(|err| PathError {
            path: path.to_path_buf(),
            source: err.error,
        })
        .map(|_| ())
}
