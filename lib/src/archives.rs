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

//! Archive members as content sources.
//!
//! Annexed files can live inside annexed archives, addressed by a
//! `dl+archive:<archive-key>#path=<member>&size=<bytes>` URL. Obtaining
//! such a file means obtaining the archive, extracting it into a cache
//! directory (once, under a per-archive inter-process lock), and
//! hard-linking the member out of the cache. Tarballs are unpacked
//! in-process; formats without an in-crate decoder go through an external
//! extractor with a 7-Zip fallback. Member timestamps restored from ZIP
//! archives are clamped to the representable 1980–2107 range.

use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::SystemTime;

use chrono::TimeZone as _;
use chrono::Utc;
use thiserror::Error;

use crate::file_util;
use crate::file_util::IoResultExt as _;
use crate::file_util::PathError;
use crate::key::AnnexKey;
use crate::key::KeyError;
use crate::lock;
use crate::lock::LockError;
use crate::runner;
use crate::runner::CancelToken;
use crate::runner::RunOptions;
use crate::ssh::percent_decode;

const URL_SCHEME: &str = "dl+archive:";

/// Error providing an archive member.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Not an archive-member URL: {url} ({reason})")]
    BadUrl { url: String, reason: String },
    #[error(transparent)]
    BadKey(#[from] KeyError),
    #[error("No extractor available for {path} (tried {tried})")]
    NoExtractor { path: PathBuf, tried: String },
    #[error("Archive has no member {member:?}")]
    MemberNotFound { member: String },
    #[error("Extraction was cancelled")]
    Cancelled,
    #[error("Extractor failed: {detail}")]
    ExtractorFailed { detail: String },
    #[error(transparent)]
    Io(#[from] PathError),
    #[error(transparent)]
    Lock(#[from] LockError),
}

/// Parsed `dl+archive:` URL.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ArchiveMemberUrl {
    pub archive_key: AnnexKey,
    /// Member path inside the archive, POSIX separators.
    pub member: String,
    pub size: Option<u64>,
}

impl ArchiveMemberUrl {
    pub fn parse(text: &str) -> Result<Self, ArchiveError> {
        let bad = |reason: &str| ArchiveError::BadUrl {
            url: text.to_string(),
            reason: reason.to_string(),
        };
        let rest = text.strip_prefix(URL_SCHEME).ok_or_else(|| bad("scheme"))?;
        let (key, fragment) = rest.split_once('#').ok_or_else(|| bad("no fragment"))?;
        let mut member = None;
        let mut size = None;
        for pair in fragment.split('&') {
            match pair.split_once('=') {
                Some(("path", value)) => member = Some(percent_decode(value)),
                Some(("size", value)) => {
                    size = Some(value.parse().map_err(|_| bad("malformed size"))?);
                }
                _ => {}
            }
        }
        Ok(Self {
            archive_key: AnnexKey::parse(key)?,
            member: member.ok_or_else(|| bad("no member path"))?,
            size,
        })
    }
}

impl std::fmt::Display for ArchiveMemberUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{URL_SCHEME}{}#path={}",
            self.archive_key,
            percent_encode(&self.member)
        )?;
        if let Some(size) = self.size {
            write!(f, "&size={size}")?;
        }
        Ok(())
    }
}

/// Encodes the few bytes that would break the fragment syntax.
fn percent_encode(text: &str) -> String {
    let mut out = String::new();
    for byte in text.bytes() {
        match byte {
            b'%' | b'&' | b'#' | b'=' => out.push_str(&format!("%{byte:02X}")),
            _ => out.push(byte as char),
        }
    }
    out
}

/// Seconds-since-epoch bounds of the ZIP timestamp format.
fn zip_timestamp_bounds() -> (SystemTime, SystemTime) {
    let lower = Utc
        .with_ymd_and_hms(1980, 1, 1, 0, 0, 0)
        .single()
        .expect("constant UTC date is unambiguous");
    let upper = Utc
        .with_ymd_and_hms(2107, 12, 31, 23, 59, 59)
        .single()
        .expect("constant UTC date is unambiguous");
    let to_system = |secs: i64| SystemTime::UNIX_EPOCH + Duration::from_secs(secs as u64);
    (to_system(lower.timestamp()), to_system(upper.timestamp()))
}

/// Clamps a timestamp into the range ZIP can represent (1980–2107).
pub fn clamp_zip_timestamp(time: SystemTime) -> SystemTime {
    let (lower, upper) = zip_timestamp_bounds();
    time.clamp(lower, upper)
}

/// Extraction cache: one directory of unpacked members per archive key.
#[derive(Clone, Debug)]
pub struct ArchiveCache {
    root: PathBuf,
}

impl ArchiveCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn members_dir(&self, key: &AnnexKey) -> PathBuf {
        self.root.join(key.as_str()).join("members")
    }

    fn lock_path(&self, key: &AnnexKey) -> PathBuf {
        self.root.join(format!("{}.lck", key.as_str()))
    }

    /// Places `member` of the archive at `dest`.
    ///
    /// The archive is unpacked into the cache on first use, guarded by a
    /// per-archive lock so concurrent processes extract once. The member
    /// is hard-linked out of the cache where the filesystem allows,
    /// copied otherwise.
    pub fn provide_member(
        &self,
        key: &AnnexKey,
        archive_path: &Path,
        member: &str,
        dest: &Path,
        cancel: &CancelToken,
    ) -> Result<(), ArchiveError> {
        fs::create_dir_all(&self.root).context(&self.root)?;
        let members = self.members_dir(key);
        {
            let _guard = lock::acquire(
                &self.lock_path(key),
                Duration::from_secs(3600),
                Some(Duration::from_secs(24 * 3600)),
            )?;
            if !members.is_dir() {
                let staging = self.root.join(key.as_str()).join("members.partial");
                let _ = fs::remove_dir_all(&staging);
                fs::create_dir_all(&staging).context(&staging)?;
                extract_archive(archive_path, &staging, cancel)?;
                fs::rename(&staging, &members).context(&members)?;
            }
        }
        let source = members.join(file_util::from_wire_path(member));
        if !source.exists() {
            return Err(ArchiveError::MemberNotFound {
                member: member.to_string(),
            });
        }
        if dest.exists() {
            fs::remove_file(dest).context(dest)?;
        }
        if fs::hard_link(&source, dest).is_err() {
            fs::copy(&source, dest).context(dest)?;
        }
        Ok(())
    }
}

/// Unpacks `archive` into `dest_dir`, dispatching on the file name.
pub fn extract_archive(
    archive: &Path,
    dest_dir: &Path,
    cancel: &CancelToken,
) -> Result<(), ArchiveError> {
    let name = archive
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        let file = fs::File::open(archive).context(archive)?;
        unpack_tar(flate2::read::GzDecoder::new(file), dest_dir, cancel)
    } else if name.ends_with(".tar") {
        let file = fs::File::open(archive).context(archive)?;
        unpack_tar(file, dest_dir, cancel)
    } else if name.ends_with(".gz") {
        // A bare compressed file: the single member keeps the inner name.
        let inner = name.trim_end_matches(".gz");
        let file = fs::File::open(archive).context(archive)?;
        let mut decoder = flate2::read::GzDecoder::new(file);
        let dest = dest_dir.join(inner);
        let mut out = fs::File::create(&dest).context(&dest)?;
        std::io::copy(&mut decoder, &mut out).context(&dest)?;
        Ok(())
    } else {
        extract_external(archive, dest_dir, &name)
    }
}

fn unpack_tar(
    reader: impl std::io::Read,
    dest_dir: &Path,
    cancel: &CancelToken,
) -> Result<(), ArchiveError> {
    let mut archive = tar::Archive::new(reader);
    let entries = archive.entries().map_err(|source| PathError {
        path: dest_dir.to_path_buf(),
        source,
    })?;
    for entry in entries {
        if cancel.is_cancelled() {
            return Err(ArchiveError::Cancelled);
        }
        let mut entry = entry.map_err(|source| PathError {
            path: dest_dir.to_path_buf(),
            source,
        })?;
        entry.unpack_in(dest_dir).map_err(|source| PathError {
            path: dest_dir.to_path_buf(),
            source,
        })?;
    }
    Ok(())
}

/// Drives an external extractor, with 7-Zip as the general fallback.
fn extract_external(archive: &Path, dest_dir: &Path, name: &str) -> Result<(), ArchiveError> {
    let mut attempts: Vec<(&str, Vec<String>)> = vec![];
    if name.ends_with(".zip") {
        attempts.push((
            "unzip",
            vec![
                "-q".into(),
                archive.display().to_string(),
                "-d".into(),
                dest_dir.display().to_string(),
            ],
        ));
    } else if name.ends_with(".xz") || name.ends_with(".tbz2") || name.ends_with(".tar.bz2") {
        attempts.push((
            "tar",
            vec![
                "-xf".into(),
                archive.display().to_string(),
                "-C".into(),
                dest_dir.display().to_string(),
            ],
        ));
    }
    attempts.push((
        "7z",
        vec![
            "x".into(),
            "-y".into(),
            format!("-o{}", dest_dir.display()),
            archive.display().to_string(),
        ],
    ));

    let mut tried = vec![];
    for (tool, args) in &attempts {
        tried.push(*tool);
        let cmd = runner::prepare(tool, args, None);
        match runner::run(cmd, RunOptions::default()) {
            Ok(output) if output.success() => {
                if name.ends_with(".zip") {
                    normalize_zip_timestamps(dest_dir)?;
                }
                return Ok(());
            }
            Ok(output) => {
                return Err(ArchiveError::ExtractorFailed {
                    detail: format!(
                        "{tool} exited with {:?}: {}",
                        output.code(),
                        String::from_utf8_lossy(&output.stderr).trim()
                    ),
                });
            }
            // Tool not installed; try the next one.
            Err(err) => {
                tracing::debug!(tool = *tool, ?err, "extractor unavailable");
            }
        }
    }
    Err(ArchiveError::NoExtractor {
        path: archive.to_path_buf(),
        tried: tried.join(", "),
    })
}

/// Clamps member mtimes to the ZIP-representable range.
///
/// Some extractors materialize out-of-range timestamps as wrapped values;
/// re-clamping keeps members stable across store/restore cycles.
fn normalize_zip_timestamps(dir: &Path) -> Result<(), ArchiveError> {
    for entry in walk_files(dir)? {
        let meta = fs::symlink_metadata(&entry).context(&entry)?;
        if !meta.is_file() {
            continue;
        }
        let Ok(mtime) = meta.modified() else {
            continue;
        };
        let clamped = clamp_zip_timestamp(mtime);
        if clamped != mtime {
            let file = fs::File::options()
                .append(true)
                .open(&entry)
                .context(&entry)?;
            let times = fs::FileTimes::new().set_modified(clamped);
            file.set_times(times).context(&entry)?;
        }
    }
    Ok(())
}

fn walk_files(dir: &Path) -> Result<Vec<PathBuf>, PathError> {
    let mut out = vec![];
    let mut stack = vec![dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir).context(&dir)? {
            let entry = entry.context(&dir)?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                out.push(path);
            }
        }
    }
    Ok(out)
}
