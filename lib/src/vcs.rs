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

//! Invocation surface for the external VCS and annex processes.
//!
//! Every interaction with the two binaries goes through [`Repo`]: plain
//! calls with captured output, lazily decoded line streams, and the
//! annex's one-record-per-line JSON output. Argument lists that would
//! exceed the platform command-line limit are split into several
//! invocations; commit operations amend after the first invocation so
//! exactly one commit results.

use std::ffi::OsStr;
use std::ffi::OsString;
use std::path::Path;
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread::JoinHandle;

use bstr::BString;
use bstr::ByteSlice as _;
use serde::Deserialize;
use thiserror::Error;

use crate::runner;
use crate::runner::RunOptions;
use crate::runner::RunOutput;
use crate::runner::RunnerError;
use crate::runner::StdinSource;

/// Versions below these are known to lack options this crate relies on.
const MINIMUM_GIT_VERSION: (u32, u32, u32) = (2, 30, 0);
const MINIMUM_ANNEX_VERSION: (u32, u32, u32) = (8, 2021, 0);

/// Pathspec counts above this go through `--pathspec-from-file` instead of
/// the command line.
const PATHSPEC_FILE_THRESHOLD: usize = 100;

/// Upper bound for a single decoded protocol line. Large enough for big
/// JSON records; overflowing it is an error, never a truncation.
const MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

/// Error talking to the external VCS or annex.
#[derive(Debug, Error)]
pub enum VcsError {
    #[error("Required external tool {name:?} was not found or failed to start")]
    MissingBinary {
        name: OsString,
        #[source]
        error: Box<RunnerError>,
    },
    #[error("{name:?} is version {found}, but at least {minimum} is required")]
    TooOld {
        name: OsString,
        found: String,
        minimum: String,
    },
    #[error("{program:?} exited with {code:?}: {stderr}")]
    NonZero {
        program: OsString,
        code: Option<i32>,
        stderr: String,
    },
    #[error("Unparseable version output: {0:?}")]
    BadVersion(String),
    #[error("Line exceeded the {limit} byte buffer")]
    LineTooLong { limit: usize },
    #[error("Malformed JSON record: {line:?}")]
    BadJson {
        line: String,
        #[source]
        error: serde_json::Error,
    },
    #[error(transparent)]
    Runner(#[from] RunnerError),
}

/// Handle on one repository, holding the executable paths to use.
#[derive(Clone, Debug)]
pub struct Repo {
    root: PathBuf,
    git_exe: PathBuf,
    annex_exe: PathBuf,
}

impl Repo {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            git_exe: PathBuf::from("git"),
            annex_exe: PathBuf::from("git-annex"),
        }
    }

    pub fn with_executables(
        mut self,
        git_exe: impl Into<PathBuf>,
        annex_exe: impl Into<PathBuf>,
    ) -> Self {
        self.git_exe = git_exe.into();
        self.annex_exe = annex_exe.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn git_dir(&self) -> PathBuf {
        self.root.join(".git")
    }

    fn git_command(&self, args: &[OsString]) -> std::process::Command {
        // core.quotepath=false keeps non-ASCII paths unescaped in porcelain
        // output.
        let mut full: Vec<OsString> = vec!["-c".into(), "core.quotepath=false".into()];
        full.extend(args.iter().cloned());
        let mut cmd = runner::prepare(&self.git_exe, full, Some(&self.root));
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        cmd
    }

    fn annex_command(&self, args: &[OsString]) -> std::process::Command {
        runner::prepare(&self.annex_exe, args.to_vec(), Some(&self.root))
    }

    /// Runs the VCS, erroring on non-zero exit.
    pub fn call_git(&self, args: &[OsString], opts: RunOptions) -> Result<RunOutput, VcsError> {
        let output = runner::run(self.git_command(args), opts)?;
        self.check_status(&self.git_exe, output)
    }

    /// Runs the VCS but hands back the output even on non-zero exit.
    pub fn call_git_unchecked(
        &self,
        args: &[OsString],
        opts: RunOptions,
    ) -> Result<RunOutput, VcsError> {
        Ok(runner::run(self.git_command(args), opts)?)
    }

    /// Runs the annex, erroring on non-zero exit.
    pub fn call_annex(&self, args: &[OsString], opts: RunOptions) -> Result<RunOutput, VcsError> {
        let output = runner::run(self.annex_command(args), opts)?;
        self.check_status(&self.annex_exe, output)
    }

    fn check_status(&self, program: &Path, output: RunOutput) -> Result<RunOutput, VcsError> {
        if output.success() {
            Ok(output)
        } else {
            Err(VcsError::NonZero {
                program: program.as_os_str().to_os_string(),
                code: output.code(),
                stderr: output.stderr.to_str_lossy().trim().to_string(),
            })
        }
    }

    /// Streams decoded VCS output lines without buffering the whole
    /// output.
    pub fn stream_git_lines(&self, args: &[OsString], separator: u8) -> LineStream {
        LineStream::spawn(self.git_command(args), self.git_exe.clone(), separator)
    }

    /// Runs an annex command in `--json` mode and parses each output line.
    pub fn call_annex_json(
        &self,
        subcommand: &str,
        args: &[OsString],
        opts: RunOptions,
    ) -> Result<Vec<AnnexRecord>, VcsError> {
        let mut full: Vec<OsString> = vec![
            subcommand.into(),
            "--json".into(),
            "--json-error-messages".into(),
        ];
        full.extend(args.iter().cloned());
        // The annex reports per-record failures in the records themselves
        // and exits non-zero if any record failed; both channels matter.
        let output = runner::run(self.annex_command(&full), opts)?;
        let mut records = vec![];
        for line in output.stdout.lines() {
            if line.is_empty() {
                continue;
            }
            if line.len() > MAX_LINE_BYTES {
                return Err(VcsError::LineTooLong {
                    limit: MAX_LINE_BYTES,
                });
            }
            records.push(parse_annex_record(line)?);
        }
        if records.is_empty() && !output.success() {
            return self.check_status(&self.annex_exe, output).map(|_| vec![]);
        }
        Ok(records)
    }

    /// Stages the given paths, splitting over multiple invocations when
    /// the command line would overflow.
    pub fn add_paths(&self, paths: &[OsString]) -> Result<(), VcsError> {
        self.pathspec_call(&["add".into(), "--".into()], paths, |args, stdin| {
            self.call_git(args, stdin_opts(stdin)).map(|_| ())
        })
    }

    /// Commits the given paths with `message`.
    ///
    /// When the paths do not fit one invocation, later chunks amend the
    /// commit created by the first so exactly one commit results.
    pub fn commit_paths(&self, message: &str, paths: &[OsString]) -> Result<(), VcsError> {
        let mut first = true;
        for chunk in chunk_args(paths, max_arg_bytes()) {
            let mut args: Vec<OsString> = vec!["commit".into()];
            if first {
                args.push("-m".into());
                args.push(message.into());
            } else {
                args.push("--amend".into());
                args.push("--no-edit".into());
            }
            let stdin;
            if chunk.len() > PATHSPEC_FILE_THRESHOLD {
                args.push("--pathspec-from-file=-".into());
                args.push("--pathspec-file-nul".into());
                stdin = Some(join_nul(chunk));
            } else {
                args.push("--".into());
                args.extend(chunk.iter().cloned());
                stdin = None;
            }
            self.call_git(&args, stdin_opts(stdin))?;
            first = false;
        }
        Ok(())
    }

    fn pathspec_call(
        &self,
        prefix: &[OsString],
        paths: &[OsString],
        mut call: impl FnMut(&[OsString], Option<Vec<u8>>) -> Result<(), VcsError>,
    ) -> Result<(), VcsError> {
        for chunk in chunk_args(paths, max_arg_bytes()) {
            if chunk.len() > PATHSPEC_FILE_THRESHOLD {
                let mut args: Vec<OsString> = prefix[..prefix.len() - 1].to_vec();
                args.push("--pathspec-from-file=-".into());
                args.push("--pathspec-file-nul".into());
                call(&args, Some(join_nul(chunk)))?;
            } else {
                let mut args = prefix.to_vec();
                args.extend(chunk.iter().cloned());
                call(&args, None)?;
            }
        }
        Ok(())
    }

    /// Probes both external binaries and their versions.
    pub fn ensure_functional(&self) -> Result<(), VcsError> {
        let git = self.probe_version(&self.git_exe, &["version".into()])?;
        let git_version = parse_git_version(&git)?;
        if git_version < MINIMUM_GIT_VERSION {
            return Err(too_old(&self.git_exe, git_version, MINIMUM_GIT_VERSION));
        }
        let annex = self.probe_version(&self.annex_exe, &["version".into(), "--raw".into()])?;
        let annex_version = parse_annex_version(&annex)?;
        if annex_version < MINIMUM_ANNEX_VERSION {
            return Err(too_old(&self.annex_exe, annex_version, MINIMUM_ANNEX_VERSION));
        }
        Ok(())
    }

    fn probe_version(&self, exe: &Path, args: &[OsString]) -> Result<String, VcsError> {
        let cmd = runner::prepare(exe, args.to_vec(), None);
        let output = runner::run(cmd, RunOptions::default()).map_err(|error| {
            VcsError::MissingBinary {
                name: exe.as_os_str().to_os_string(),
                error: Box::new(error),
            }
        })?;
        let output = self.check_status(exe, output)?;
        Ok(output.stdout.to_str_lossy().into_owned())
    }
}

fn too_old(name: &Path, found: (u32, u32, u32), minimum: (u32, u32, u32)) -> VcsError {
    let render = |(a, b, c): (u32, u32, u32)| format!("{a}.{b}.{c}");
    VcsError::TooOld {
        name: name.as_os_str().to_os_string(),
        found: render(found),
        minimum: render(minimum),
    }
}

fn stdin_opts(stdin: Option<Vec<u8>>) -> RunOptions {
    RunOptions {
        stdin: match stdin {
            Some(bytes) => StdinSource::Bytes(bytes),
            None => StdinSource::Null,
        },
        ..Default::default()
    }
}

fn join_nul(paths: &[OsString]) -> Vec<u8> {
    let mut out = vec![];
    for path in paths {
        out.extend_from_slice(path.as_encoded_bytes());
        out.push(0);
    }
    out
}

/// One record of the annex's JSON-lines output.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct AnnexRecord {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default, rename = "error-messages")]
    pub error_messages: Vec<String>,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub whereis: Vec<WhereisLocation>,
    #[serde(default, flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One known location of a key, as reported by the annex.
#[derive(Clone, Debug, Deserialize)]
pub struct WhereisLocation {
    pub uuid: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub here: bool,
    #[serde(default)]
    pub urls: Vec<String>,
}

fn parse_annex_record(line: &[u8]) -> Result<AnnexRecord, VcsError> {
    serde_json::from_slice(line).map_err(|error| VcsError::BadJson {
        line: line.to_str_lossy().into_owned(),
        error,
    })
}

/// Byte budget for one command line: half of the platform maximum, clamped
/// to survive OS misreports.
pub fn max_arg_bytes() -> usize {
    let reported = platform_arg_max().unwrap_or(128 * 1024);
    (reported / 2).clamp(4 * 1024, 2 * 1024 * 1024)
}

#[cfg(unix)]
fn platform_arg_max() -> Option<usize> {
    use nix::unistd::SysconfVar;
    use nix::unistd::sysconf;

    sysconf(SysconfVar::ARG_MAX).ok().flatten().map(|v| v as usize)
}

#[cfg(not(unix))]
fn platform_arg_max() -> Option<usize> {
    // CreateProcess command lines cap at 32767 UTF-16 units.
    Some(32 * 1024)
}

/// Splits `items` into chunks whose cumulative byte length stays within
/// `budget`. An oversized single item still gets its own chunk.
pub fn chunk_args(items: &[OsString], budget: usize) -> Vec<&[OsString]> {
    let mut chunks = vec![];
    let mut start = 0;
    let mut used = 0;
    for (i, item) in items.iter().enumerate() {
        // Account for the separating space.
        let cost = item.as_encoded_bytes().len() + 1;
        if i > start && used + cost > budget {
            chunks.push(&items[start..i]);
            start = i;
            used = 0;
        }
        used += cost;
    }
    if start < items.len() {
        chunks.push(&items[start..]);
    }
    chunks
}

/// Lazily decoded line stream from a subprocess.
///
/// The producing thread splits output on `separator` and applies the
/// bounded line buffer; iteration yields each decoded line or the error
/// that ended the stream.
pub struct LineStream {
    rx: mpsc::Receiver<Result<BString, VcsError>>,
    handle: Option<JoinHandle<()>>,
}

impl LineStream {
    fn spawn(cmd: std::process::Command, program: PathBuf, separator: u8) -> Self {
        let (tx, rx) = mpsc::sync_channel(1024);
        let handle = std::thread::spawn(move || {
            let mut pending: Vec<u8> = vec![];
            let mut overflowed = false;
            let mut stderr = vec![];
            let result = {
                let tx = &tx;
                let pending = &mut pending;
                let overflowed = &mut overflowed;
                runner::run_streamed(
                    cmd,
                    RunOptions::default(),
                    &mut move |chunk: &[u8]| {
                        if *overflowed {
                            return;
                        }
                        pending.extend_from_slice(chunk);
                        while let Some(pos) = pending.iter().position(|&b| b == separator) {
                            let line: Vec<u8> = pending.drain(..=pos).take(pos).collect();
                            if tx.send(Ok(BString::from(line))).is_err() {
                                return;
                            }
                        }
                        if pending.len() > MAX_LINE_BYTES {
                            *overflowed = true;
                            let _ = tx.send(Err(VcsError::LineTooLong {
                                limit: MAX_LINE_BYTES,
                            }));
                        }
                    },
                    &mut |chunk: &[u8]| stderr.extend_from_slice(chunk),
                )
            };
            match result {
                Ok(status) if status.success() => {
                    if !pending.is_empty() && !overflowed {
                        let _ = tx.send(Ok(BString::from(pending)));
                    }
                }
                Ok(status) => {
                    let _ = tx.send(Err(VcsError::NonZero {
                        program: program.into_os_string(),
                        code: status.code(),
                        stderr: stderr.to_str_lossy().trim().to_string(),
                    }));
                }
                Err(error) => {
                    let _ = tx.send(Err(error.into()));
                }
            }
        });
        Self {
            rx,
            handle: Some(handle),
        }
    }
}

impl Iterator for LineStream {
    type Item = Result<BString, VcsError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.recv().ok()
    }
}

impl Drop for LineStream {
    fn drop(&mut self) {
        // Unblock a producer stuck on the bounded channel, then wait for
        // the subprocess to drain. Dropping a stream early therefore costs
        // as much as reading it to the end.
        while self.rx.try_recv().is_ok() {}
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn parse_git_version(output: &str) -> Result<(u32, u32, u32), VcsError> {
    // `git version 2.43.0` (possibly with a platform suffix)
    let rest = output
        .trim()
        .strip_prefix("git version ")
        .ok_or_else(|| VcsError::BadVersion(output.trim().to_string()))?;
    parse_version_triple(rest).ok_or_else(|| VcsError::BadVersion(output.trim().to_string()))
}

fn parse_annex_version(output: &str) -> Result<(u32, u32, u32), VcsError> {
    // `--raw` emits the bare version, e.g. `10.20240227-1~ndall+1`.
    let line = output
        .lines()
        .next()
        .map(|line| line.strip_prefix("git-annex version: ").unwrap_or(line))
        .unwrap_or("");
    parse_version_triple(line).ok_or_else(|| VcsError::BadVersion(output.trim().to_string()))
}

fn parse_version_triple(text: &str) -> Option<(u32, u32, u32)> {
    let numeric: String = text
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let mut parts = numeric.split('.').filter(|p| !p.is_empty());
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let patch = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    Some((major, minor, patch))
}
