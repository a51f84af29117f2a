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

//! Replaying recorded executions from history.
//!
//! A rerun walks a revision range, extracts the run record of every run
//! commit, verifies (and fetches) its inputs, and executes the command
//! again. Plain commits in the range are skipped, merges are
//! reconstructed with equivalent shape, and a merge whose parents are
//! both run commits is refused as a conflict. Adjusted working trees are
//! not replayable. With a script target, the reconstructed commands are
//! written out for inspection instead of being executed.

use std::fs;
use std::path::Path;
use std::path::PathBuf;

use bstr::ByteSlice as _;
use thiserror::Error;

use crate::dataset::Dataset;
use crate::dataset::DatasetError;
use crate::error::ErrorKind;
use crate::error::ErrorReport;
use crate::file_util::PathError;
use crate::resultbus::Message;
use crate::resultbus::OnFailure;
use crate::resultbus::PathType;
use crate::resultbus::ResultRecord;
use crate::resultbus::ResultStatus;
use crate::run;
use crate::run::RunError;
use crate::run::RunRecord;
use crate::run::RunSpec;
use crate::runner::RunOptions;
use crate::vcs::VcsError;

/// Error while planning or executing a replay.
#[derive(Debug, Error)]
pub enum RerunError {
    #[error("Refusing to replay on an adjusted working tree")]
    AdjustedBranch,
    #[error("Merge {commit} joins two run commits; replay order is ambiguous")]
    MergeOfRuns { commit: String },
    #[error(transparent)]
    Run(#[from] RunError),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Io(#[from] PathError),
    #[error(transparent)]
    Vcs(#[from] VcsError),
}

/// One commit of the replay range.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RevisionInfo {
    pub commit: String,
    pub parents: Vec<String>,
    pub message: String,
}

/// Parses `log --reverse --format=%H%x1f%P%x1f%B%x00` output.
pub fn parse_revision_log(text: &[u8]) -> Vec<RevisionInfo> {
    let mut out = vec![];
    for chunk in text.split(|&b| b == 0) {
        let chunk = chunk.trim_start_with(|c| c == '\n');
        if chunk.is_empty() {
            continue;
        }
        let mut fields = chunk.splitn(3, |&b| b == 0x1f);
        let (Some(commit), Some(parents), Some(message)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        let (Ok(commit), Ok(parents), Ok(message)) =
            (commit.to_str(), parents.to_str(), message.to_str())
        else {
            continue;
        };
        out.push(RevisionInfo {
            commit: commit.to_string(),
            parents: parents.split_whitespace().map(str::to_string).collect(),
            message: message.to_string(),
        });
    }
    out
}

/// One planned replay action.
#[derive(Clone, Debug, PartialEq)]
pub enum RerunStep {
    /// Re-execute a recorded command.
    Execute {
        commit: String,
        subject: String,
        record: RunRecord,
    },
    /// Reconstruct a merge of equivalent shape.
    Merge {
        commit: String,
        parents: Vec<String>,
    },
    /// A commit without a run record; nothing to replay.
    Skip { commit: String },
}

/// Classifies the revisions of a replay range.
///
/// A merge whose parents are all run commits has no defined replay order
/// and is refused conservatively.
pub fn build_plan(
    revisions: &[RevisionInfo],
    sidecar_lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<Vec<RerunStep>, RerunError> {
    let run_commits: Vec<&str> = revisions
        .iter()
        .filter(|rev| run::parse_run_commit_message(&rev.message, sidecar_lookup).is_some())
        .map(|rev| rev.commit.as_str())
        .collect();
    let mut plan = vec![];
    for revision in revisions {
        if revision.parents.len() > 1 {
            let run_parents = revision
                .parents
                .iter()
                .filter(|parent| run_commits.contains(&parent.as_str()))
                .count();
            if run_parents == revision.parents.len() {
                return Err(RerunError::MergeOfRuns {
                    commit: revision.commit.clone(),
                });
            }
            plan.push(RerunStep::Merge {
                commit: revision.commit.clone(),
                parents: revision.parents.clone(),
            });
            continue;
        }
        match run::parse_run_commit_message(&revision.message, sidecar_lookup) {
            Some((subject, record)) => plan.push(RerunStep::Execute {
                commit: revision.commit.clone(),
                subject,
                record,
            }),
            None => plan.push(RerunStep::Skip {
                commit: revision.commit.clone(),
            }),
        }
    }
    Ok(plan)
}

/// Renders the plan as a shell script for offline inspection.
pub fn render_script(plan: &[RerunStep]) -> String {
    let mut out = String::from("#!/bin/sh\n# reconstructed from dataset history\nset -e\n\n");
    for step in plan {
        match step {
            RerunStep::Execute {
                commit,
                subject,
                record,
            } => {
                out.push_str(&format!("# {} {}\n", &commit[..commit.len().min(8)], subject));
                out.push_str(&run::render_command(&record.cmd));
                out.push('\n');
            }
            RerunStep::Merge { commit, .. } => {
                out.push_str(&format!(
                    "# {}: merge reconstructed during replay\n",
                    &commit[..commit.len().min(8)]
                ));
            }
            RerunStep::Skip { .. } => {}
        }
    }
    out
}

/// Replay knobs.
#[derive(Clone, Debug, Default)]
pub struct RerunOptions {
    /// Lower bound of the replay range (exclusive); the last run commit
    /// reachable from HEAD when absent.
    pub since: Option<String>,
    /// Write the reconstructed commands here instead of executing.
    pub script: Option<PathBuf>,
}

/// Replays run commits of the given range onto the current HEAD.
pub fn rerun(
    dataset: &Dataset,
    options: &RerunOptions,
    on_failure: OnFailure,
) -> Result<Vec<ResultRecord>, RerunError> {
    if dataset.adjusted_branch().is_some() {
        let err = RerunError::AdjustedBranch;
        return Ok(vec![error_record(dataset, ErrorKind::InvalidArgument, &err.to_string())]);
    }

    let range = match &options.since {
        Some(since) => format!("{since}..HEAD"),
        None => "HEAD".to_string(),
    };
    let output = dataset.repo().call_git(
        &[
            "log".into(),
            "--reverse".into(),
            "--format=%H%x1f%P%x1f%B%x00".into(),
            range.into(),
        ],
        RunOptions::default(),
    )?;
    let revisions = parse_revision_log(&output.stdout);
    let lookup = sidecar_lookup(dataset.root());
    let plan = match build_plan(&revisions, &lookup) {
        Ok(plan) => plan,
        Err(err @ RerunError::MergeOfRuns { .. }) => {
            return Ok(vec![error_record(dataset, ErrorKind::Conflict, &err.to_string())]);
        }
        Err(err) => return Err(err),
    };

    if let Some(script_path) = &options.script {
        let script = render_script(&plan);
        fs::write(script_path, script).map_err(|source| PathError {
            path: script_path.clone(),
            source,
        })?;
        return Ok(vec![
            ResultRecord::ok("rerun", "script written")
                .with_path(script_path.clone(), PathType::File)
                .with_dataset(dataset.root()),
        ]);
    }

    let mut results = vec![];
    for step in plan {
        match step {
            RerunStep::Skip { .. } => {}
            RerunStep::Execute {
                commit,
                subject,
                record,
            } => {
                let spec = RunSpec {
                    command: Some(record.cmd.clone()),
                    inputs: record.inputs.clone(),
                    outputs: record.outputs.clone(),
                    extra_inputs: record.extra_inputs.clone(),
                    explicit: false,
                    assume_ready: false,
                    dry_run: false,
                    message: Some(format!("{subject} (rerun of {})", &commit[..8.min(commit.len())])),
                    cwd: Some(dataset.root().join(crate::file_util::from_wire_path(&record.pwd))),
                };
                let outcome = run::run(dataset, &spec, on_failure)?;
                let failed = outcome
                    .results
                    .iter()
                    .any(|record| record.status == ResultStatus::Error);
                results.extend(outcome.results);
                if failed && on_failure == OnFailure::Stop {
                    return Ok(results);
                }
            }
            RerunStep::Merge { commit, parents } => {
                // Merge the non-mainline parent to reconstruct the shape;
                // conflict resolution is out of scope.
                let Some(other) = parents.get(1) else {
                    continue;
                };
                let merge = dataset.repo().call_git_unchecked(
                    &[
                        "merge".into(),
                        "--no-ff".into(),
                        "--no-edit".into(),
                        other.into(),
                    ],
                    RunOptions::default(),
                )?;
                if merge.success() {
                    results.push(
                        ResultRecord::ok("rerun", format!("reconstructed merge {commit}"))
                            .with_path(dataset.root(), PathType::Dataset)
                            .with_dataset(dataset.root()),
                    );
                } else {
                    results.push(error_record(
                        dataset,
                        ErrorKind::Conflict,
                        &format!("merge of {other} could not be reconstructed cleanly"),
                    ));
                    if on_failure == OnFailure::Stop {
                        return Ok(results);
                    }
                }
            }
        }
    }
    Ok(results)
}

/// Sidecar lookup bound to a dataset root.
fn sidecar_lookup(root: &Path) -> impl Fn(&str) -> Option<String> {
    let dir = root.join(".datalad/runinfo");
    move |record_id: &str| fs::read_to_string(dir.join(format!("{record_id}.json"))).ok()
}

fn error_record(dataset: &Dataset, kind: ErrorKind, message: &str) -> ResultRecord {
    let mut record = ResultRecord::new("rerun", ResultStatus::Error, Message::plain(message));
    record.error = Some(ErrorReport::new(kind, message));
    record
        .with_path(dataset.root(), PathType::Dataset)
        .with_dataset(dataset.root())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::run::RunCommand;
    use crate::run::format_run_commit_message;

    use super::*;

    fn run_message(subject: &str) -> String {
        let record = RunRecord {
            cmd: RunCommand::Shell(format!("make {subject}")),
            pwd: ".".into(),
            dsid: None,
            exit: 0,
            inputs: vec![],
            outputs: vec![],
            extra_inputs: vec![],
            dry_run: false,
            chain: vec![],
        };
        format_run_commit_message(subject, &record, None).unwrap().0
    }

    fn revision(commit: &str, parents: &[&str], message: &str) -> RevisionInfo {
        RevisionInfo {
            commit: commit.to_string(),
            parents: parents.iter().map(|p| p.to_string()).collect(),
            message: message.to_string(),
        }
    }

    #[test]
    fn test_parse_revision_log() {
        let sample =
            b"aaaa\x1f\x1finitial commit\n\x00bbbb\x1faaaa\x1fsecond\nbody line\n\x00cccc\x1fbbbb dddd\x1fmerge\n\x00";
        let revisions = parse_revision_log(sample);
        assert_eq!(revisions.len(), 3);
        assert_eq!(revisions[0].commit, "aaaa");
        assert!(revisions[0].parents.is_empty());
        assert_eq!(revisions[1].parents, ["aaaa"]);
        assert!(revisions[1].message.contains("body line"));
        assert_eq!(revisions[2].parents, ["bbbb", "dddd"]);
    }

    #[test]
    fn test_build_plan_classifies_steps() {
        let revisions = vec![
            revision("a1", &[], "setup things"),
            revision("b2", &["a1"], &run_message("analysis")),
            revision("c3", &["b2", "x9"], "Merge branch 'topic'"),
        ];
        let plan = build_plan(&revisions, &|_| None).unwrap();
        assert_matches!(plan[0], RerunStep::Skip { .. });
        assert_matches!(
            &plan[1],
            RerunStep::Execute { subject, .. } if subject == "analysis"
        );
        assert_matches!(&plan[2], RerunStep::Merge { parents, .. } if parents.len() == 2);
    }

    #[test]
    fn test_merge_of_two_run_commits_is_refused() {
        let revisions = vec![
            revision("b2", &[], &run_message("left")),
            revision("d4", &[], &run_message("right")),
            revision("e5", &["b2", "d4"], "Merge runs"),
        ];
        assert_matches!(
            build_plan(&revisions, &|_| None),
            Err(RerunError::MergeOfRuns { commit }) if commit == "e5"
        );
    }

    #[test]
    fn test_render_script() {
        let revisions = vec![
            revision("a1a1a1a1a1", &[], "plain"),
            revision("b2b2b2b2b2", &["a1a1a1a1a1"], &run_message("analysis")),
        ];
        let plan = build_plan(&revisions, &|_| None).unwrap();
        insta::assert_snapshot!(render_script(&plan), @r"
        #!/bin/sh
        # reconstructed from dataset history
        set -e

        # b2b2b2b2 analysis
        make analysis
        ");
    }
}
