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

//! Status, diff, and save over the dataset tree.
//!
//! Working-tree state comes from the VCS's porcelain-v2 output, parsed at
//! the byte level. Subdataset entries get their aggregate state from the
//! requested evaluation depth: not at all, by comparing the registered
//! commit against the subdataset's HEAD (the underlying branch tip on
//! adjusted working trees), or by additionally inspecting the subdataset's
//! own working tree. Save walks the tree bottom-up so parent pointers are
//! committed after their subdatasets.

use std::ffi::OsString;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use bstr::ByteSlice as _;

use crate::dataset;
use crate::dataset::Dataset;
use crate::dataset::DatasetError;
use crate::file_util;
use crate::key::AnnexKey;
use crate::resultbus::Message;
use crate::resultbus::PathType;
use crate::resultbus::ResultRecord;
use crate::resultbus::ResultStatus;
use crate::runner::RunOptions;
use crate::subdataset;
use crate::subdataset::SubdatasetQuery;
use crate::subdataset::SubdatasetState;

/// Change state of one path.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FileState {
    Clean,
    Modified,
    Added,
    Deleted,
    Untracked,
    Typechanged,
}

impl std::fmt::Display for FileState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Clean => "clean",
            Self::Modified => "modified",
            Self::Added => "added",
            Self::Deleted => "deleted",
            Self::Untracked => "untracked",
            Self::Typechanged => "typechanged",
        };
        write!(f, "{name}")
    }
}

/// How deep subdataset state is evaluated.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SubdatasetEval {
    /// Never look into subdatasets.
    No,
    /// Compare the registered commit against the subdataset's HEAD.
    #[default]
    Commit,
    /// Additionally inspect the subdataset's working tree.
    Full,
}

/// Which untracked files to report.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum UntrackedMode {
    No,
    #[default]
    Normal,
    All,
}

/// Whether to resolve file types through annex pointers.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ReportFiletype {
    /// A symlink into the annex object store reports as a key.
    #[default]
    Eval,
    /// Report the raw working-tree type.
    Raw,
}

#[derive(Clone, Debug, Default)]
pub struct StatusOptions {
    pub untracked: UntrackedMode,
    pub eval_subdataset: SubdatasetEval,
    pub report_filetype: ReportFiletype,
    pub recursive: bool,
}

/// Per-path status report.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StatusRecord {
    /// Absolute path.
    pub path: PathBuf,
    pub state: FileState,
    pub kind: PathType,
    /// Root of the dataset the path belongs to.
    pub dataset: PathBuf,
}

/// One parsed porcelain-v2 entry, still repo-relative.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PorcelainEntry {
    pub path: String,
    /// Staged/unstaged state pair, e.g. `.M`.
    pub xy: [u8; 2],
    /// True for submodule entries.
    pub submodule: bool,
    /// Submodule flags `<C><M><U>` when `submodule` (commit changed,
    /// tracked modifications, untracked content).
    pub sub_flags: [u8; 3],
}

/// Parses `status --porcelain=v2 -z` output.
///
/// Rename entries carry their origin path in a second NUL field; the
/// origin is dropped here because reports are per current path.
pub fn parse_porcelain_v2(text: &[u8]) -> Vec<PorcelainEntry> {
    let mut out = vec![];
    let mut fields = text.split(|&b| b == 0).peekable();
    while let Some(entry) = fields.next() {
        if entry.is_empty() {
            continue;
        }
        // Column counts per entry kind: ordinary change (9), rename (10,
        // plus the origin path in its own NUL field), unmerged (11).
        match entry.first() {
            Some(b'1') | Some(b'2') | Some(b'u') => {
                let (columns, path_index) = match entry.first() {
                    Some(b'1') => (9, 8),
                    Some(b'2') => (10, 9),
                    _ => (11, 10),
                };
                let cols: Vec<&[u8]> = entry.splitn(columns, |&b| b == b' ').collect();
                if entry.first() == Some(&b'2') {
                    // The rename source follows as its own NUL field.
                    let _ = fields.next();
                }
                if cols.len() != columns {
                    continue;
                }
                let (xy, sub) = (cols[1], cols[2]);
                let Ok(path) = cols[path_index].to_str() else {
                    continue;
                };
                out.push(PorcelainEntry {
                    path: path.to_string(),
                    xy: [
                        xy.first().copied().unwrap_or(b'.'),
                        xy.get(1).copied().unwrap_or(b'.'),
                    ],
                    submodule: sub.first() == Some(&b'S'),
                    sub_flags: [
                        sub.get(1).copied().unwrap_or(b'.'),
                        sub.get(2).copied().unwrap_or(b'.'),
                        sub.get(3).copied().unwrap_or(b'.'),
                    ],
                });
            }
            Some(b'?') | Some(b'!') => {
                let Some(path) = entry.get(2..).and_then(|p| p.to_str().ok()) else {
                    continue;
                };
                out.push(PorcelainEntry {
                    path: path.to_string(),
                    xy: [*entry.first().expect("entry is non-empty"), b'.'],
                    submodule: false,
                    sub_flags: [b'.', b'.', b'.'],
                });
            }
            _ => {}
        }
    }
    out
}

/// Maps a porcelain state pair onto a [`FileState`].
pub fn state_from_xy(xy: [u8; 2]) -> FileState {
    let effective = if xy[1] != b'.' { xy[1] } else { xy[0] };
    match effective {
        b'?' => FileState::Untracked,
        b'A' => FileState::Added,
        b'D' => FileState::Deleted,
        b'T' => FileState::Typechanged,
        b'.' => FileState::Clean,
        // M, R, C, U and anything else git may grow.
        _ => FileState::Modified,
    }
}

/// Extracts the content key from an annex pointer symlink target.
///
/// Annexed files in the working tree are symlinks whose target ends in
/// `…/annex/objects/<x>/<y>/<key>/<key>`.
pub fn key_from_link_target(target: &Path) -> Option<AnnexKey> {
    let mut components = target.components().rev();
    let name = components.next()?.as_os_str().to_str()?;
    let looks_annexed = target
        .components()
        .any(|c| c.as_os_str() == "annex");
    if !looks_annexed {
        return None;
    }
    AnnexKey::parse(name).ok()
}

fn classify_path(root: &Path, relpath: &str, report: ReportFiletype) -> PathType {
    let abspath = root.join(file_util::from_wire_path(relpath));
    let meta = match fs::symlink_metadata(&abspath) {
        Ok(meta) => meta,
        Err(_) => return PathType::File,
    };
    if meta.is_dir() {
        return PathType::Directory;
    }
    if meta.file_type().is_symlink() {
        if report == ReportFiletype::Eval
            && let Ok(target) = fs::read_link(&abspath)
            && key_from_link_target(&target).is_some()
        {
            return PathType::Key;
        }
        return PathType::Symlink;
    }
    PathType::File
}

/// Reports the working-tree state of `paths` (all of the dataset when
/// empty).
pub fn status(
    dataset: &Dataset,
    paths: &[PathBuf],
    options: &StatusOptions,
) -> Result<Vec<StatusRecord>, DatasetError> {
    let mut records = vec![];
    status_into(dataset, paths, options, &mut records)?;
    Ok(records)
}

fn status_into(
    dataset: &Dataset,
    paths: &[PathBuf],
    options: &StatusOptions,
    out: &mut Vec<StatusRecord>,
) -> Result<(), DatasetError> {
    let untracked = match options.untracked {
        UntrackedMode::No => "--untracked-files=no",
        UntrackedMode::Normal => "--untracked-files=normal",
        UntrackedMode::All => "--untracked-files=all",
    };
    let mut args: Vec<OsString> = vec![
        "status".into(),
        "--porcelain=v2".into(),
        "-z".into(),
        untracked.into(),
    ];
    if !paths.is_empty() {
        args.push("--".into());
        for path in paths {
            let rel = file_util::relative_path(dataset.root(), path);
            args.push(rel.into_os_string());
        }
    }
    let output = dataset.repo().call_git(&args, RunOptions::default())?;
    let entries = parse_porcelain_v2(&output.stdout);
    for entry in &entries {
        let abspath = dataset.root().join(file_util::from_wire_path(&entry.path));
        if entry.submodule {
            let state = subdataset_state(dataset, entry, options.eval_subdataset)?;
            out.push(StatusRecord {
                path: abspath.clone(),
                state,
                kind: PathType::Dataset,
                dataset: dataset.root().to_path_buf(),
            });
            if options.recursive && dataset::is_dataset_root(&abspath) {
                let sub = Dataset::at(&abspath)?;
                status_into(&sub, &[], options, out)?;
            }
        } else {
            out.push(StatusRecord {
                path: abspath,
                state: state_from_xy(entry.xy),
                kind: classify_path(dataset.root(), &entry.path, options.report_filetype),
                dataset: dataset.root().to_path_buf(),
            });
        }
    }
    Ok(())
}

/// Aggregate state of a subdataset entry under the requested evaluation.
fn subdataset_state(
    parent: &Dataset,
    entry: &PorcelainEntry,
    eval: SubdatasetEval,
) -> Result<FileState, DatasetError> {
    match eval {
        // Parent-level view only; the subdataset itself is never opened.
        SubdatasetEval::No => Ok(state_from_xy(entry.xy)),
        SubdatasetEval::Commit => commit_divergence(parent, entry),
        SubdatasetEval::Full => {
            let diverged = commit_divergence(parent, entry)?;
            if diverged != FileState::Clean {
                return Ok(diverged);
            }
            // Tracked or untracked changes inside the subdataset's own
            // working tree count as modification.
            if entry.sub_flags[1] == b'M' || entry.sub_flags[2] == b'U' {
                Ok(FileState::Modified)
            } else {
                Ok(FileState::Clean)
            }
        }
    }
}

/// Compares the commit registered in the parent with the subdataset HEAD.
///
/// On an adjusted working tree the tip of the underlying branch counts as
/// HEAD: the adjusted checkout itself is a derived artifact. A subdataset
/// is modified only on commit-level divergence, never merely because its
/// history extends past an ancestor.
fn commit_divergence(parent: &Dataset, entry: &PorcelainEntry) -> Result<FileState, DatasetError> {
    let abspath = parent.root().join(file_util::from_wire_path(&entry.path));
    if !dataset::is_dataset_root(&abspath) {
        return Ok(state_from_xy(entry.xy));
    }
    let output = parent.repo().call_git(
        &[
            "ls-tree".into(),
            "-z".into(),
            "HEAD".into(),
            "--".into(),
            entry.path.clone().into(),
        ],
        RunOptions::default(),
    )?;
    let registered = subdataset::parse_gitlink_tree(&output.stdout)
        .remove(&entry.path);
    let Some(registered) = registered else {
        return Ok(FileState::Added);
    };
    let sub = Dataset::at(&abspath)?;
    let head = match sub.adjusted_branch() {
        Some(adjusted) => {
            let output = sub.repo().call_git_unchecked(
                &[
                    "rev-parse".into(),
                    "--verify".into(),
                    "-q".into(),
                    format!("refs/heads/{}", adjusted.base_branch).into(),
                ],
                RunOptions::default(),
            )?;
            output
                .success()
                .then(|| String::from_utf8_lossy(&output.stdout).trim().to_string())
        }
        None => sub.head_commit()?,
    };
    match head {
        Some(head) if head == registered => Ok(FileState::Clean),
        _ => Ok(FileState::Modified),
    }
}

/// One change between two tree states.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DiffRecord {
    pub path: PathBuf,
    pub state: FileState,
    pub old_mode: u32,
    pub new_mode: u32,
    /// Content size after the change, for annexed pointers taken from the
    /// key.
    pub size: Option<u64>,
}

/// Parses `diff --raw -z --no-renames` output.
pub fn parse_raw_diff(text: &[u8]) -> Vec<(String, u32, u32, u8)> {
    let mut out = vec![];
    let mut fields = text.split(|&b| b == 0);
    while let Some(meta) = fields.next() {
        if meta.is_empty() {
            continue;
        }
        let Some(meta) = meta.strip_prefix(b":") else {
            continue;
        };
        let mut cols = meta.splitn(5, |&b| b == b' ');
        let (Some(old_mode), Some(new_mode), _old_id, _new_id, Some(letter)) = (
            cols.next(),
            cols.next(),
            cols.next(),
            cols.next(),
            cols.next(),
        ) else {
            continue;
        };
        let Some(path) = fields.next().and_then(|p| p.to_str().ok()) else {
            continue;
        };
        let parse_mode = |m: &[u8]| {
            u32::from_str_radix(std::str::from_utf8(m).unwrap_or("0"), 8).unwrap_or(0)
        };
        out.push((
            path.to_string(),
            parse_mode(old_mode),
            parse_mode(new_mode),
            letter.first().copied().unwrap_or(b'M'),
        ));
    }
    out
}

/// Reports changes between two committed states.
pub fn diff(
    dataset: &Dataset,
    from: &str,
    to: &str,
    paths: &[PathBuf],
) -> Result<Vec<DiffRecord>, DatasetError> {
    let mut args: Vec<OsString> = vec![
        "diff".into(),
        "--raw".into(),
        "-z".into(),
        "--no-renames".into(),
        from.into(),
        to.into(),
    ];
    if !paths.is_empty() {
        args.push("--".into());
        for path in paths {
            args.push(file_util::relative_path(dataset.root(), path).into_os_string());
        }
    }
    let output = dataset.repo().call_git(&args, RunOptions::default())?;
    let records = parse_raw_diff(&output.stdout)
        .into_iter()
        .map(|(relpath, old_mode, new_mode, letter)| {
            let abspath = dataset.root().join(file_util::from_wire_path(&relpath));
            let size = fs::read_link(&abspath)
                .ok()
                .as_deref()
                .and_then(key_from_link_target)
                .and_then(|key| key.size());
            DiffRecord {
                path: abspath,
                state: match letter {
                    b'A' => FileState::Added,
                    b'D' => FileState::Deleted,
                    b'T' => FileState::Typechanged,
                    _ => FileState::Modified,
                },
                old_mode,
                new_mode,
                size,
            }
        })
        .collect();
    Ok(records)
}

/// Knobs for save.
#[derive(Clone, Debug, Default)]
pub struct SaveOptions {
    pub recursive: bool,
    /// Amend the last commit instead of creating one.
    pub amend: bool,
}

/// Saves modifications as one commit per affected dataset, bottom-up.
///
/// A clean dataset yields a `notneeded` record and no commit, which makes
/// save idempotent. Untracked directories that are dataset roots get
/// registered as subdatasets on the way.
pub fn save(
    dataset: &Dataset,
    paths: &[PathBuf],
    message: &str,
    options: &SaveOptions,
) -> Result<Vec<ResultRecord>, DatasetError> {
    let mut results = vec![];
    save_inner(dataset, paths, message, options, &mut results)?;
    Ok(results)
}

fn save_inner(
    dataset: &Dataset,
    paths: &[PathBuf],
    message: &str,
    options: &SaveOptions,
    results: &mut Vec<ResultRecord>,
) -> Result<(), DatasetError> {
    if options.recursive {
        // Children first, so the parent commit records updated pointers.
        let children = subdataset::subdatasets(
            dataset,
            &SubdatasetQuery {
                recursive: false,
                ..Default::default()
            },
        )?;
        for child in &children {
            if child.state == SubdatasetState::Absent {
                continue;
            }
            let sub = Dataset::at(&child.abspath(dataset.root()))?;
            save_inner(&sub, &[], message, options, results)?;
        }
    }

    if options.amend && dataset.adjusted_branch().is_some() {
        results.push(
            ResultRecord::new(
                "save",
                ResultStatus::Impossible,
                Message::plain("cannot amend on an adjusted working tree"),
            )
            .with_path(dataset.root(), PathType::Dataset)
            .with_dataset(dataset.root()),
        );
        return Ok(());
    }

    let state = status(
        dataset,
        paths,
        &StatusOptions {
            untracked: UntrackedMode::Normal,
            eval_subdataset: SubdatasetEval::Commit,
            ..Default::default()
        },
    )?;
    let dirty: Vec<&StatusRecord> = state
        .iter()
        .filter(|record| record.state != FileState::Clean)
        .collect();
    if dirty.is_empty() {
        results.push(
            ResultRecord::new(
                "save",
                ResultStatus::NotNeeded,
                Message::plain("dataset is clean"),
            )
            .with_path(dataset.root(), PathType::Dataset)
            .with_dataset(dataset.root()),
        );
        return Ok(());
    }

    // Register untracked dataset roots before staging the rest.
    for record in &dirty {
        if record.state == FileState::Untracked && dataset::is_dataset_root(&record.path) {
            let sub = Dataset::at(&record.path)?;
            subdataset::register(dataset, &sub, None, None)?;
        }
    }

    let to_add: Vec<OsString> = if paths.is_empty() {
        vec!["-A".into()]
    } else {
        let mut args: Vec<OsString> = vec!["--".into()];
        args.extend(
            paths
                .iter()
                .map(|p| file_util::relative_path(dataset.root(), p).into_os_string()),
        );
        args
    };
    let mut add_args: Vec<OsString> = vec!["add".into()];
    add_args.extend(to_add);
    dataset.repo().call_git(&add_args, RunOptions::default())?;

    let mut commit_args: Vec<OsString> = vec!["commit".into(), "-m".into(), message.into()];
    if options.amend {
        commit_args.push("--amend".into());
    }
    dataset.repo().call_git(&commit_args, RunOptions::default())?;
    results.push(
        ResultRecord::ok("save", "changes committed")
            .with_path(dataset.root(), PathType::Dataset)
            .with_dataset(dataset.root())
            .with_extra("paths", dirty.len()),
    );
    Ok(())
}
