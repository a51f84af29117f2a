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

//! Threaded subprocess runner.
//!
//! Output pumping happens on plain OS threads so callers with their own
//! event loops are never entangled with an executor. The runner supports
//! captured and streamed output, timeouts, cooperative cancellation, and a
//! terminate-then-kill shutdown with a bounded grace period. Every spawned
//! process gets `PWD` synchronized with its working directory and
//! `LC_MESSAGES=C` so output parsing is stable across locales.

use std::ffi::OsStr;
use std::ffi::OsString;
use std::io::Read as _;
use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;
use std::process::Child;
use std::process::Command;
use std::process::ExitStatus;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use thiserror::Error;

const POLL_INTERVAL: Duration = Duration::from_millis(25);
const READ_CHUNK: usize = 8192;

/// Process-wide cooperative cancellation signal.
///
/// Cloning shares the underlying flag; workers observe it at stage
/// boundaries and I/O poll points.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// What to feed the child's stdin.
#[derive(Debug, Default)]
pub enum StdinSource {
    #[default]
    Null,
    Bytes(Vec<u8>),
    /// Streams a file from `offset` in bounded chunks, never loading it
    /// into memory.
    File { path: PathBuf, offset: u64 },
}

/// Knobs for one subprocess invocation.
#[derive(Debug)]
pub struct RunOptions {
    pub cwd: Option<PathBuf>,
    pub env: Vec<(OsString, OsString)>,
    pub timeout: Option<Duration>,
    pub cancel: Option<CancelToken>,
    pub stdin: StdinSource,
    /// Grace between terminate and kill when shutting the child down.
    pub kill_grace: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            cwd: None,
            env: vec![],
            timeout: None,
            cancel: None,
            stdin: StdinSource::Null,
            kill_grace: Duration::from_secs(30),
        }
    }
}

/// Captured outcome of a finished subprocess.
#[derive(Debug)]
pub struct RunOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn code(&self) -> Option<i32> {
        self.status.code()
    }
}

/// Error spawning or supervising a subprocess.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Could not execute {program:?}")]
    Spawn {
        program: OsString,
        #[source]
        error: std::io::Error,
    },
    #[error("Failed while communicating with {program:?}")]
    Io {
        program: OsString,
        #[source]
        error: std::io::Error,
    },
    #[error("{program:?} did not finish within {after:.1?}")]
    TimedOut { program: OsString, after: Duration },
    #[error("{program:?} was cancelled")]
    Cancelled { program: OsString },
}

/// Builds a [`Command`] with the environment-safety contract applied.
pub fn prepare(
    program: impl AsRef<OsStr>,
    args: impl IntoIterator<Item = impl AsRef<OsStr>>,
    cwd: Option<&Path>,
) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args);
    // Disable translation so output parsing is deterministic.
    cmd.env("LC_MESSAGES", "C");
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
        cmd.env("PWD", cwd);
    }
    cmd
}

/// Runs `cmd` to completion, capturing stdout and stderr.
pub fn run(cmd: Command, opts: RunOptions) -> Result<RunOutput, RunnerError> {
    let mut stdout = vec![];
    let mut stderr = vec![];
    let status = supervise(
        cmd,
        opts,
        &mut |chunk| stdout.extend_from_slice(chunk),
        &mut |chunk| stderr.extend_from_slice(chunk),
    )?;
    Ok(RunOutput {
        status,
        stdout,
        stderr,
    })
}

/// Runs `cmd`, handing output chunks to the callbacks as they arrive.
///
/// The callbacks run on dedicated pump threads; keep them cheap.
pub fn run_streamed(
    cmd: Command,
    opts: RunOptions,
    on_stdout: &mut (dyn FnMut(&[u8]) + Send),
    on_stderr: &mut (dyn FnMut(&[u8]) + Send),
) -> Result<ExitStatus, RunnerError> {
    supervise(cmd, opts, on_stdout, on_stderr)
}

fn supervise(
    mut cmd: Command,
    opts: RunOptions,
    on_stdout: &mut (dyn FnMut(&[u8]) + Send),
    on_stderr: &mut (dyn FnMut(&[u8]) + Send),
) -> Result<ExitStatus, RunnerError> {
    let program = cmd.get_program().to_os_string();
    for (name, value) in &opts.env {
        cmd.env(name, value);
    }
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.stdin(match &opts.stdin {
        StdinSource::Null => Stdio::null(),
        StdinSource::Bytes(_) | StdinSource::File { .. } => Stdio::piped(),
    });
    tracing::debug!(cmd = ?cmd, "spawning subprocess");
    let mut child = cmd.spawn().map_err(|error| RunnerError::Spawn {
        program: program.clone(),
        error,
    })?;

    let mut child_stdout = child.stdout.take().expect("stdout is piped");
    let mut child_stderr = child.stderr.take().expect("stderr is piped");
    let stdin_pipe = child.stdin.take();

    let started = Instant::now();
    let (status, io_result) = thread::scope(|scope| {
        let out_thread = scope.spawn(move || -> std::io::Result<()> {
            let mut buf = [0u8; READ_CHUNK];
            loop {
                let n = child_stdout.read(&mut buf)?;
                if n == 0 {
                    return Ok(());
                }
                on_stdout(&buf[..n]);
            }
        });
        let err_thread = scope.spawn(move || -> std::io::Result<()> {
            let mut buf = [0u8; READ_CHUNK];
            loop {
                let n = child_stderr.read(&mut buf)?;
                if n == 0 {
                    return Ok(());
                }
                on_stderr(&buf[..n]);
            }
        });
        match (stdin_pipe, &opts.stdin) {
            (Some(mut pipe), StdinSource::Bytes(bytes)) => {
                let bytes = bytes.clone();
                scope.spawn(move || {
                    // The child may exit without draining stdin; that's
                    // fine.
                    let _ = pipe.write_all(&bytes);
                });
            }
            (Some(mut pipe), StdinSource::File { path, offset }) => {
                let path = path.clone();
                let offset = *offset;
                scope.spawn(move || {
                    let _ = stream_file_to(&path, offset, &mut pipe);
                });
            }
            _ => {}
        }

        let status = wait_with_deadline(&mut child, &opts, started, &program);
        let io_result = out_thread
            .join()
            .expect("stdout pump must not panic")
            .and(err_thread.join().expect("stderr pump must not panic"));
        (status, io_result)
    });

    let status = status?;
    io_result.map_err(|error| RunnerError::Io {
        program: program.clone(),
        error,
    })?;
    match status {
        WaitOutcome::Finished(status) => Ok(status),
        WaitOutcome::TimedOut => Err(RunnerError::TimedOut {
            program,
            after: opts.timeout.expect("timeout was hit"),
        }),
        WaitOutcome::Cancelled => Err(RunnerError::Cancelled { program }),
    }
}

fn stream_file_to(path: &Path, offset: u64, sink: &mut impl std::io::Write) -> std::io::Result<()> {
    use std::io::Seek as _;

    let mut file = std::fs::File::open(path)?;
    file.seek(std::io::SeekFrom::Start(offset))?;
    let mut buf = [0u8; READ_CHUNK];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            return Ok(());
        }
        sink.write_all(&buf[..n])?;
    }
}

enum WaitOutcome {
    Finished(ExitStatus),
    TimedOut,
    Cancelled,
}

fn wait_with_deadline(
    child: &mut Child,
    opts: &RunOptions,
    started: Instant,
    program: &OsStr,
) -> Result<WaitOutcome, RunnerError> {
    let any_err = |error| RunnerError::Io {
        program: program.to_os_string(),
        error,
    };
    loop {
        if let Some(status) = child.try_wait().map_err(any_err)? {
            return Ok(WaitOutcome::Finished(status));
        }
        if let Some(cancel) = &opts.cancel
            && cancel.is_cancelled()
        {
            shutdown(child, opts.kill_grace);
            return Ok(WaitOutcome::Cancelled);
        }
        if let Some(timeout) = opts.timeout
            && started.elapsed() >= timeout
        {
            shutdown(child, opts.kill_grace);
            return Ok(WaitOutcome::TimedOut);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Terminates the child, escalating to kill after the grace period.
fn shutdown(child: &mut Child, grace: Duration) {
    terminate(child);
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        match child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(_) => break,
        }
    }
    tracing::warn!("subprocess ignored terminate; killing");
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(unix)]
fn terminate(child: &Child) {
    use nix::sys::signal::Signal;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let pid = Pid::from_raw(child.id() as i32);
    if let Err(err) = kill(pid, Signal::SIGTERM) {
        tracing::debug!(?err, "SIGTERM delivery failed");
    }
}

#[cfg(not(unix))]
fn terminate(child: &Child) {
    // No soft-terminate equivalent; the kill fallback handles it.
    let _ = child;
}
