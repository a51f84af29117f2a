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

//! Reproducible execution records.
//!
//! A run captures everything needed to re-derive its results: the exact
//! command, the working directory relative to the dataset root, the
//! dataset identity, input and output globs, and the exit code. The
//! record travels in the commit message as a machine-readable block
//! (spilling to a sidecar file when it would bloat the message), so a
//! later replay can parse history alone. Input content is fetched before
//! execution; output globs are re-expanded afterwards so newly created
//! files are picked up; modifications outside the declared outputs are
//! still saved but flagged.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::config::ConfigManager;
use crate::dataset::Dataset;
use crate::dataset::DatasetError;
use crate::error::ErrorKind;
use crate::error::ErrorReport;
use crate::file_util;
use crate::file_util::PathError;
use crate::resultbus::Message;
use crate::resultbus::OnFailure;
use crate::resultbus::PathType;
use crate::resultbus::ResultRecord;
use crate::resultbus::ResultStatus;
use crate::runner;
use crate::runner::RunOptions;
use crate::status;
use crate::status::FileState;
use crate::status::SaveOptions;
use crate::status::StatusOptions;

/// Subject-line marker of run commits.
pub const RUN_SUBJECT_PREFIX: &str = "[DATALAD RUNCMD]";
/// Delimiters of the machine-readable block inside the commit message.
pub const RECORD_OPEN: &str = "=== Do not change lines below ===";
pub const RECORD_CLOSE: &str = "^^^ Do not change lines above ^^^";

/// Record JSON above this size moves into a sidecar file.
const SIDECAR_THRESHOLD: usize = 8 * 1024;
const SIDECAR_DIR: &str = ".datalad/runinfo";

/// Error preparing or recording an execution.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Unknown placeholder {name:?} in command")]
    UnknownPlaceholder { name: String },
    #[error("Input spec {pattern:?} matched nothing")]
    UnmatchedGlob { pattern: String },
    #[error("Malformed glob {pattern:?}")]
    BadGlob {
        pattern: String,
        #[source]
        error: glob::PatternError,
    },
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Io(#[from] PathError),
}

/// The command itself: an argv vector runs directly, a single string goes
/// through the platform shell.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RunCommand {
    Argv(Vec<String>),
    /// Shell-interpreted. On platforms without reliable shell quoting,
    /// argument escaping is the caller's responsibility.
    Shell(String),
}

/// What to execute and under which contract.
#[derive(Clone, Debug, Default)]
pub struct RunSpec {
    pub command: Option<RunCommand>,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub extra_inputs: Vec<String>,
    /// Tolerate a dirty tree; only declared outputs are saved.
    pub explicit: bool,
    /// Skip fetching input content before execution.
    pub assume_ready: bool,
    pub dry_run: bool,
    /// Free-form subject; a rendering of the command when empty.
    pub message: Option<String>,
    /// Working directory, dataset root when absent.
    pub cwd: Option<PathBuf>,
}

/// The provenance block of a run commit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub cmd: RunCommand,
    /// Working directory relative to the dataset root.
    pub pwd: String,
    /// Dataset identity at execution time.
    pub dsid: Option<Uuid>,
    pub exit: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_inputs: Vec<String>,
    #[serde(rename = "dry-run", default, skip_serializing_if = "std::ops::Not::not")]
    pub dry_run: bool,
    /// Upstream run commits this one was derived from.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chain: Vec<String>,
}

/// Sidecar pointer stored in place of an oversized record.
#[derive(Debug, Serialize, Deserialize)]
struct SidecarPointer {
    record_id: String,
}

/// Renders the commit message for a run.
///
/// When the serialized record exceeds the configured size, it is written
/// to `.datalad/runinfo/<id>.json` and the message carries only the
/// pointer.
pub fn format_run_commit_message(
    subject: &str,
    record: &RunRecord,
    dataset_root: Option<&Path>,
) -> Result<(String, Option<PathBuf>), RunError> {
    let json =
        serde_json::to_string_pretty(record).expect("run records serialize infallibly");
    let (block, sidecar) = if json.len() > SIDECAR_THRESHOLD && dataset_root.is_some() {
        let root = dataset_root.expect("checked above");
        let record_id = Uuid::new_v4().simple().to_string();
        let dir = root.join(SIDECAR_DIR);
        fs::create_dir_all(&dir).map_err(|source| PathError {
            path: dir.clone(),
            source,
        })?;
        let sidecar_path = dir.join(format!("{record_id}.json"));
        file_util::write_atomic(&sidecar_path, json.as_bytes())?;
        let pointer = serde_json::to_string_pretty(&SidecarPointer { record_id })
            .expect("pointers serialize infallibly");
        (pointer, Some(sidecar_path))
    } else {
        (json, None)
    };
    let message =
        format!("{RUN_SUBJECT_PREFIX} {subject}\n\n{RECORD_OPEN}\n{block}\n{RECORD_CLOSE}\n");
    Ok((message, sidecar))
}

/// Extracts the run record from a commit message, following a sidecar
/// pointer through `sidecar_lookup` when needed.
pub fn parse_run_commit_message(
    message: &str,
    sidecar_lookup: &dyn Fn(&str) -> Option<String>,
) -> Option<(String, RunRecord)> {
    let subject = message
        .lines()
        .next()?
        .strip_prefix(RUN_SUBJECT_PREFIX)?
        .trim()
        .to_string();
    let open = message.find(RECORD_OPEN)? + RECORD_OPEN.len();
    let close = message.find(RECORD_CLOSE)?;
    let block = message.get(open..close)?.trim();
    if let Ok(pointer) = serde_json::from_str::<SidecarPointer>(block) {
        let content = sidecar_lookup(&pointer.record_id)?;
        return Some((subject, serde_json::from_str(&content).ok()?));
    }
    Some((subject, serde_json::from_str(block).ok()?))
}

/// Expands `{placeholder}` names in one command word.
fn expand_word(
    word: &str,
    values: &HashMap<String, Vec<String>>,
) -> Result<Vec<String>, RunError> {
    // A word that is exactly one list placeholder splices the list.
    if let Some(name) = word
        .strip_prefix('{')
        .and_then(|rest| rest.strip_suffix('}'))
        && let Some(list) = values.get(name)
        && (name == "inputs" || name == "outputs" || name == "extra_inputs")
    {
        return Ok(list.clone());
    }
    let mut out = String::new();
    let mut rest = word;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            out.push('{');
            rest = after;
            continue;
        };
        let name = &after[..close];
        let list = values.get(name).ok_or_else(|| RunError::UnknownPlaceholder {
            name: name.to_string(),
        })?;
        out.push_str(&list.join(" "));
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(vec![out])
}

/// Expands the closed placeholder set over a whole command.
pub fn expand_command(
    command: &RunCommand,
    values: &HashMap<String, Vec<String>>,
) -> Result<RunCommand, RunError> {
    match command {
        RunCommand::Argv(words) => {
            let mut out = vec![];
            for word in words {
                out.extend(expand_word(word, values)?);
            }
            Ok(RunCommand::Argv(out))
        }
        RunCommand::Shell(text) => {
            let expanded = expand_word(text, values)?;
            Ok(RunCommand::Shell(expanded.join(" ")))
        }
    }
}

/// The substitution table for one execution.
pub fn placeholder_values(
    config: &ConfigManager,
    inputs: &[String],
    outputs: &[String],
    extra_inputs: &[String],
    pwd: &Path,
    tmpdir: &Path,
) -> HashMap<String, Vec<String>> {
    let mut values: HashMap<String, Vec<String>> = HashMap::new();
    values.insert("inputs".into(), inputs.to_vec());
    values.insert("outputs".into(), outputs.to_vec());
    values.insert("extra_inputs".into(), extra_inputs.to_vec());
    values.insert("pwd".into(), vec![pwd.display().to_string()]);
    values.insert("tmpdir".into(), vec![tmpdir.display().to_string()]);
    // User-configured placeholders extend the closed set.
    const PREFIX: &str = "datalad.run.substitutions.";
    for key in config.keys_with_prefix(PREFIX) {
        if let (Some(name), Some(value)) = (key.strip_prefix(PREFIX), config.get(&key)) {
            values.insert(name.to_string(), vec![value.to_string()]);
        }
    }
    values
}

/// Expands glob patterns against a root; returns matches and the patterns
/// that matched nothing.
pub fn expand_globs(root: &Path, patterns: &[String]) -> Result<(Vec<PathBuf>, Vec<String>), RunError> {
    let mut matched = vec![];
    let mut unmatched = vec![];
    for pattern in patterns {
        let full = root.join(pattern);
        let full = full.to_string_lossy().into_owned();
        let paths =
            glob::glob(&full).map_err(|error| RunError::BadGlob {
                pattern: pattern.clone(),
                error,
            })?;
        let mut any = false;
        for path in paths.flatten() {
            any = true;
            matched.push(path);
        }
        if !any {
            unmatched.push(pattern.clone());
        }
    }
    Ok((matched, unmatched))
}

/// Outcome of [`run`]: the emitted records plus the recorded exit code.
#[derive(Debug)]
pub struct RunOutcome {
    pub results: Vec<ResultRecord>,
    pub exit: Option<i32>,
}

/// Executes a command under the provenance contract.
pub fn run(
    dataset: &Dataset,
    spec: &RunSpec,
    on_failure: OnFailure,
) -> Result<RunOutcome, RunError> {
    let mut results = vec![];
    let command = match &spec.command {
        Some(RunCommand::Argv(argv)) if argv.is_empty() => None,
        Some(command) => Some(command),
        None => None,
    };
    let Some(command) = command else {
        results.push(error_record(
            "run",
            dataset,
            ErrorKind::InvalidArgument,
            "no command given",
        ));
        return Ok(RunOutcome {
            results,
            exit: None,
        });
    };

    // Precondition: a clean tree, unless the caller is explicit about the
    // outputs to save.
    if !spec.explicit {
        let state = status::status(dataset, &[], &StatusOptions::default())?;
        if state.iter().any(|record| record.state != FileState::Clean) {
            results.push(
                ResultRecord::new(
                    "run",
                    ResultStatus::Impossible,
                    Message::plain(
                        "clean dataset required; use explicit output declarations to \
                         run anyway",
                    ),
                )
                .with_path(dataset.root(), PathType::Dataset)
                .with_dataset(dataset.root()),
            );
            return Ok(RunOutcome {
                results,
                exit: None,
            });
        }
    }

    // Inputs: expand, report misses, fetch content.
    let (input_paths, unmatched) = expand_globs(dataset.root(), &all_inputs(spec))?;
    for pattern in &unmatched {
        results.push(error_record(
            "run",
            dataset,
            ErrorKind::InvalidArgument,
            &format!("input spec {pattern:?} matched nothing"),
        ));
    }
    if !unmatched.is_empty() && on_failure == OnFailure::Stop {
        return Ok(RunOutcome {
            results,
            exit: None,
        });
    }
    if !spec.assume_ready && !input_paths.is_empty() && dataset.is_annexed() {
        let args: Vec<OsString> = input_paths
            .iter()
            .map(|path| path.as_os_str().to_os_string())
            .collect();
        dataset
            .repo()
            .call_annex_json("get", &args, RunOptions::default())
            .map_err(DatasetError::from)?;
    }

    let cwd = spec
        .cwd
        .clone()
        .unwrap_or_else(|| dataset.root().to_path_buf());
    let tmpdir = tempfile::tempdir().map_err(|source| PathError {
        path: std::env::temp_dir(),
        source,
    })?;
    let config = dataset.config()?;
    let values = placeholder_values(
        &config,
        &relative_strings(dataset.root(), &input_paths),
        &spec.outputs,
        &spec.extra_inputs,
        &cwd,
        tmpdir.path(),
    );
    let expanded = expand_command(command, &values)?;

    let record_pwd = file_util::wire_path(&file_util::relative_path(dataset.root(), &cwd))
        .unwrap_or_default();
    let subject = spec
        .message
        .clone()
        .unwrap_or_else(|| render_command(&expanded));

    if spec.dry_run {
        let record = RunRecord {
            cmd: expanded,
            pwd: record_pwd,
            dsid: dataset.id()?,
            exit: 0,
            inputs: spec.inputs.clone(),
            outputs: spec.outputs.clone(),
            extra_inputs: spec.extra_inputs.clone(),
            dry_run: true,
            chain: vec![],
        };
        results.push(
            ResultRecord::ok("run", format!("would run: {}", render_command(&record.cmd)))
                .with_path(dataset.root(), PathType::Dataset)
                .with_dataset(dataset.root()),
        );
        return Ok(RunOutcome {
            results,
            exit: Some(0),
        });
    }

    // Execute through the threaded runner; the child gets a synchronized
    // PWD.
    let cmd = match &expanded {
        RunCommand::Argv(argv) => {
            let Some((program, args)) = argv.split_first() else {
                results.push(error_record(
                    "run",
                    dataset,
                    ErrorKind::InvalidArgument,
                    "command expanded to nothing",
                ));
                return Ok(RunOutcome {
                    results,
                    exit: None,
                });
            };
            runner::prepare(program, args, Some(&cwd))
        }
        RunCommand::Shell(text) => {
            if cfg!(windows) {
                runner::prepare("cmd", ["/C", text.as_str()], Some(&cwd))
            } else {
                runner::prepare("sh", ["-c", text.as_str()], Some(&cwd))
            }
        }
    };
    let output = runner::run(cmd, RunOptions::default()).map_err(|error| {
        DatasetError::from(crate::vcs::VcsError::Runner(error))
    })?;
    let exit = output.code().unwrap_or(-1);

    if exit != 0 {
        results.push(error_record(
            "run",
            dataset,
            ErrorKind::External,
            &format!("command exited with {exit}"),
        ));
        if on_failure == OnFailure::Stop {
            return Ok(RunOutcome {
                results,
                exit: Some(exit),
            });
        }
    }

    // Outputs are re-expanded after the fact: the command is expected to
    // have created them.
    let (output_paths, _) = expand_globs(dataset.root(), &spec.outputs)?;
    let dirty = status::status(dataset, &[], &StatusOptions::default())?;
    let modified: Vec<&status::StatusRecord> = dirty
        .iter()
        .filter(|record| record.state != FileState::Clean)
        .collect();
    let undeclared: Vec<String> = modified
        .iter()
        .filter(|record| !output_paths.iter().any(|out| record.path.starts_with(out)))
        .filter_map(|record| {
            file_util::wire_path(&file_util::relative_path(dataset.root(), &record.path))
        })
        .collect();
    if !undeclared.is_empty() {
        results.push(
            ResultRecord::ok(
                "run",
                format!(
                    "saving modifications outside the declared outputs: {}",
                    undeclared.join(", ")
                ),
            )
            .with_path(dataset.root(), PathType::Dataset)
            .with_dataset(dataset.root()),
        );
    }

    if modified.is_empty() {
        results.push(
            ResultRecord::new(
                "run",
                ResultStatus::NotNeeded,
                Message::plain("command produced no changes"),
            )
            .with_path(dataset.root(), PathType::Dataset)
            .with_dataset(dataset.root()),
        );
        return Ok(RunOutcome {
            results,
            exit: Some(exit),
        });
    }

    let record = RunRecord {
        cmd: expanded,
        pwd: record_pwd,
        dsid: dataset.id()?,
        exit,
        inputs: spec.inputs.clone(),
        outputs: spec.outputs.clone(),
        extra_inputs: spec.extra_inputs.clone(),
        dry_run: false,
        chain: vec![],
    };
    let (message, _sidecar) =
        format_run_commit_message(&subject, &record, Some(dataset.root()))?;
    let save_paths: Vec<PathBuf> = if spec.explicit {
        output_paths
    } else {
        vec![]
    };
    results.extend(status::save(
        dataset,
        &save_paths,
        &message,
        &SaveOptions::default(),
    )?);
    Ok(RunOutcome {
        results,
        exit: Some(exit),
    })
}

fn all_inputs(spec: &RunSpec) -> Vec<String> {
    spec.inputs
        .iter()
        .chain(spec.extra_inputs.iter())
        .cloned()
        .collect()
}

fn relative_strings(root: &Path, paths: &[PathBuf]) -> Vec<String> {
    paths
        .iter()
        .filter_map(|path| file_util::wire_path(&file_util::relative_path(root, path)))
        .collect()
}

/// One-line rendering of a command for subjects and scripts.
pub fn render_command(command: &RunCommand) -> String {
    match command {
        RunCommand::Shell(text) => text.clone(),
        RunCommand::Argv(argv) => argv
            .iter()
            .map(|word| {
                if word.contains(' ') || word.contains('\'') {
                    format!("'{}'", word.replace('\'', r"'\''"))
                } else {
                    word.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(" "),
    }
}

fn error_record(
    action: &str,
    dataset: &Dataset,
    kind: ErrorKind,
    message: &str,
) -> ResultRecord {
    let mut record = ResultRecord::new(action, ResultStatus::Error, Message::plain(message));
    record.error = Some(ErrorReport::new(kind, message));
    record
        .with_path(dataset.root(), PathType::Dataset)
        .with_dataset(dataset.root())
}
