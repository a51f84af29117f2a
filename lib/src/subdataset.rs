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

//! Subdataset pointers and queries.
//!
//! A parent dataset records each subdataset in its tracked `.gitmodules`
//! file: the relative path (POSIX separators on the wire), the URL it was
//! installed from, the subdataset's UUID (`datalad-id`), and the original
//! unresolved URL (`datalad-url`, preserving `ria+…` and similar forms for
//! later installs). The registered commit lives as a gitlink in the
//! parent's tree; path and `.gitmodules` must agree at any committed
//! state.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use bstr::ByteSlice as _;
use uuid::Uuid;

use crate::config::GitConfigFile;
use crate::dataset;
use crate::dataset::Dataset;
use crate::dataset::DatasetError;
use crate::file_util;
use crate::runner::RunOptions;

/// Installed state of a registered subdataset.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SubdatasetState {
    /// Working tree exists and matches the registered commit.
    Present,
    /// Not installed locally.
    Absent,
    /// Installed, but its HEAD differs from the registered commit.
    Modified,
}

/// One subdataset pointer of a parent dataset.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SubdatasetRecord {
    /// Record name in `.gitmodules` (usually equal to the path).
    pub name: String,
    /// Relative path within the parent, POSIX separators.
    pub path: String,
    /// Source URL used at installation time, resolved against the parent.
    pub url: Option<String>,
    /// The subdataset's UUID as registered in the parent.
    pub id: Option<Uuid>,
    /// Original unresolved URL, kept verbatim for future installs.
    pub datalad_url: Option<String>,
    /// Commit recorded in the parent's tree, when known.
    pub registered_commit: Option<String>,
    pub state: SubdatasetState,
}

impl SubdatasetRecord {
    /// Native path of this subdataset under `parent_root`.
    pub fn abspath(&self, parent_root: &Path) -> PathBuf {
        parent_root.join(file_util::from_wire_path(&self.path))
    }
}

/// Parses subdataset pointers out of `.gitmodules` content.
///
/// Records keep file order. States and registered commits are not known at
/// this level; they start out `Absent`/`None`.
pub fn parse_gitmodules(text: &[u8]) -> Vec<SubdatasetRecord> {
    let file = GitConfigFile::parse(text);
    let mut order: Vec<String> = vec![];
    let mut fields: HashMap<String, HashMap<String, String>> = HashMap::new();
    for (key, value) in file.entries() {
        let Some(rest) = key.strip_prefix("submodule.") else {
            continue;
        };
        let Some((name, field)) = rest.rsplit_once('.') else {
            continue;
        };
        if !order.iter().any(|n| n == name) {
            order.push(name.to_string());
        }
        fields
            .entry(name.to_string())
            .or_default()
            .insert(field.to_string(), value.unwrap_or_default());
    }
    order
        .into_iter()
        .filter_map(|name| {
            let entry = fields.remove(&name)?;
            let path = entry.get("path")?.clone();
            Some(SubdatasetRecord {
                name,
                path,
                url: entry.get("url").cloned(),
                id: entry
                    .get("datalad-id")
                    .and_then(|text| Uuid::parse_str(text).ok()),
                datalad_url: entry.get("datalad-url").cloned(),
                registered_commit: None,
                state: SubdatasetState::Absent,
            })
        })
        .collect()
}

/// Writes (or updates) a subdataset pointer in `.gitmodules` content.
pub fn record_in_gitmodules(file: &mut GitConfigFile, record: &SubdatasetRecord) {
    let prefix = format!("submodule.{}", record.name);
    file.set(&format!("{prefix}.path"), &record.path);
    if let Some(url) = &record.url {
        file.set(&format!("{prefix}.url"), url);
    }
    if let Some(id) = &record.id {
        file.set(&format!("{prefix}.datalad-id"), &id.to_string());
    }
    if let Some(datalad_url) = &record.datalad_url {
        file.set(&format!("{prefix}.datalad-url"), datalad_url);
    }
}

/// Parses `ls-tree -z` output into path → commit for gitlink entries.
pub fn parse_gitlink_tree(text: &[u8]) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for entry in text.split(|&b| b == 0) {
        // `<mode> <type> <oid>\t<path>`
        let Some((meta, path)) = entry.split_once_str("\t") else {
            continue;
        };
        let mut parts = meta.splitn(3, |&b| b == b' ');
        let (Some(mode), Some(_kind), Some(oid)) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        if mode != b"160000" {
            continue;
        }
        if let (Ok(path), Ok(oid)) = (path.to_str(), oid.to_str()) {
            out.insert(path.to_string(), oid.to_string());
        }
    }
    out
}

/// Filters and recursion knobs for [`subdatasets`].
#[derive(Clone, Debug, Default)]
pub struct SubdatasetQuery {
    pub recursive: bool,
    pub recursion_limit: Option<usize>,
    /// Keep only subdatasets whose tree contains this path.
    pub contains: Option<PathBuf>,
    /// Keep only subdatasets in this state.
    pub state: Option<SubdatasetState>,
}

/// Yields the subdataset records of `dataset`, optionally recursing into
/// installed subdatasets.
pub fn subdatasets(
    dataset: &Dataset,
    query: &SubdatasetQuery,
) -> Result<Vec<SubdatasetRecord>, DatasetError> {
    let mut out = vec![];
    collect(dataset, query, query.recursion_limit, &mut out)?;
    if let Some(contains) = &query.contains {
        out.retain(|record| contains.starts_with(record.abspath(dataset.root())));
    }
    if let Some(state) = query.state {
        out.retain(|record| record.state == state);
    }
    Ok(out)
}

fn collect(
    dataset: &Dataset,
    query: &SubdatasetQuery,
    limit: Option<usize>,
    out: &mut Vec<SubdatasetRecord>,
) -> Result<(), DatasetError> {
    if limit == Some(0) {
        return Ok(());
    }
    let gitmodules = match fs::read(dataset.root().join(".gitmodules")) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(source) => {
            return Err(crate::file_util::PathError {
                path: dataset.root().join(".gitmodules"),
                source,
            }
            .into());
        }
    };
    let mut records = parse_gitmodules(&gitmodules);
    let registered = registered_commits(dataset, &records)?;
    for record in &mut records {
        record.registered_commit = registered.get(&record.path).cloned();
        record.state = evaluate_state(dataset, record)?;
    }
    for record in records {
        let present = record.state != SubdatasetState::Absent;
        let abspath = record.abspath(dataset.root());
        out.push(record);
        if query.recursive && present {
            let sub = Dataset::at(&abspath)?;
            let deeper = limit.map(|l| l - 1);
            collect(&sub, query, deeper, out)?;
        }
    }
    Ok(())
}

fn registered_commits(
    dataset: &Dataset,
    records: &[SubdatasetRecord],
) -> Result<HashMap<String, String>, DatasetError> {
    if records.is_empty() || dataset.head_commit()?.is_none() {
        return Ok(HashMap::new());
    }
    let mut args: Vec<OsString> = vec!["ls-tree".into(), "-z".into(), "HEAD".into(), "--".into()];
    args.extend(
        records
            .iter()
            .map(|record| OsString::from(record.path.clone())),
    );
    let output = dataset.repo().call_git(&args, RunOptions::default())?;
    Ok(parse_gitlink_tree(&output.stdout))
}

fn evaluate_state(
    dataset: &Dataset,
    record: &SubdatasetRecord,
) -> Result<SubdatasetState, DatasetError> {
    let abspath = record.abspath(dataset.root());
    if !dataset::is_dataset_root(&abspath) {
        return Ok(SubdatasetState::Absent);
    }
    let Some(registered) = &record.registered_commit else {
        return Ok(SubdatasetState::Present);
    };
    let sub = Dataset::at(&abspath)?;
    match sub.head_commit()? {
        Some(head) if head == *registered => Ok(SubdatasetState::Present),
        Some(_) => Ok(SubdatasetState::Modified),
        None => Ok(SubdatasetState::Modified),
    }
}

/// Registers `sub` as a subdataset of `parent`: updates `.gitmodules` and
/// stages both the pointer file and the gitlink. Committing is the
/// caller's move (usually a save).
pub fn register(
    parent: &Dataset,
    sub: &Dataset,
    url: Option<&str>,
    datalad_url: Option<&str>,
) -> Result<SubdatasetRecord, DatasetError> {
    let relpath = file_util::relative_path(parent.root(), sub.root());
    let wire = file_util::wire_path(&relpath).ok_or_else(|| DatasetError::NoDataset {
        purpose: "to register a subdataset outside the parent tree".to_string(),
        start: sub.root().to_path_buf(),
    })?;
    let record = SubdatasetRecord {
        name: wire.clone(),
        path: wire.clone(),
        url: Some(url.map(str::to_string).unwrap_or_else(|| format!("./{wire}"))),
        id: sub.id()?,
        datalad_url: datalad_url.map(str::to_string),
        registered_commit: sub.head_commit()?,
        state: SubdatasetState::Present,
    };
    let gitmodules_path = parent.root().join(".gitmodules");
    let text = fs::read(&gitmodules_path).unwrap_or_default();
    let mut file = GitConfigFile::parse(&text);
    record_in_gitmodules(&mut file, &record);
    file_util::write_atomic(&gitmodules_path, &file.to_bytes())?;
    parent.repo().add_paths(&[".gitmodules".into(), wire.into()])?;
    Ok(record)
}
