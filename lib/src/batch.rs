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

//! Pool of long-running request/reply helper subprocesses.
//!
//! Rapidly repeated annex queries (key lookups, content info) go through
//! helpers running in `--batch` mode: one line of request, one line of
//! reply, over the helper's lifetime. Helpers are created lazily, reused,
//! reaped when idle too long (`datalad.runtime.max-inactive-age`), and
//! capped per repository (`datalad.runtime.max-batched`). A request and
//! its reply are serialized on a per-helper mutex; re-entrant use from the
//! thread already holding a helper raises instead of hanging, and a
//! crashed helper yields a distinguished error while the next request
//! respawns it.

use std::collections::HashMap;
use std::ffi::OsString;
use std::io;
use std::io::BufRead as _;
use std::io::BufReader;
use std::io::Read as _;
use std::io::Write as _;
use std::path::PathBuf;
use std::process::Child;
use std::process::ChildStdin;
use std::process::ChildStdout;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread::ThreadId;
use std::time::Duration;
use std::time::Instant;

use thiserror::Error;

const MAX_REPLY_BYTES: usize = 4 * 1024 * 1024;

/// Error from a batched helper request.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("Could not start batched helper {command}")]
    Spawn {
        command: String,
        #[source]
        error: io::Error,
    },
    #[error("I/O with batched helper {command} failed")]
    Io {
        command: String,
        #[source]
        error: io::Error,
    },
    #[error("Batched helper {command} exited unexpectedly")]
    Crashed { command: String },
    #[error("Re-entrant request to batched helper {command} from the thread holding it")]
    Deadlock { command: String },
    #[error("All {limit} batched helper slots are busy")]
    Exhausted { limit: usize },
    #[error("Reply from batched helper {command} exceeded {limit} bytes")]
    ReplyTooLong { command: String, limit: usize },
}

/// Line-oriented request/reply channel to one helper.
pub trait BatchTransport: Send {
    fn send_line(&mut self, line: &[u8]) -> io::Result<()>;
    /// Returns the next reply line without its terminator, or `None` on
    /// EOF (helper exited).
    fn recv_line(&mut self) -> io::Result<Option<Vec<u8>>>;
}

/// Factory creating a fresh transport for a helper slot.
pub type SpawnTransport = dyn Fn() -> io::Result<Box<dyn BatchTransport>> + Send + Sync;

/// Identity of one helper process: what to run and where.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct BatchCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub cwd: PathBuf,
}

impl BatchCommand {
    pub fn annex(repo_root: impl Into<PathBuf>, args: &[&str]) -> Self {
        Self {
            program: PathBuf::from("git-annex"),
            args: args.iter().map(OsString::from).collect(),
            cwd: repo_root.into(),
        }
    }

    fn describe(&self) -> String {
        let mut out = self.program.display().to_string();
        for arg in &self.args {
            out.push(' ');
            out.push_str(&arg.to_string_lossy());
        }
        out
    }
}

/// Transport backed by a real subprocess with piped stdio.
pub struct SubprocessTransport {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
}

impl SubprocessTransport {
    pub fn spawn(command: &BatchCommand) -> io::Result<Self> {
        let mut cmd = crate::runner::prepare(&command.program, &command.args, Some(&command.cwd));
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::null());
        tracing::debug!(?cmd, "spawning batched helper");
        let mut child = cmd.spawn()?;
        let stdin = child.stdin.take().expect("stdin is piped");
        let stdout = BufReader::new(child.stdout.take().expect("stdout is piped"));
        Ok(Self {
            child,
            stdin: Some(stdin),
            stdout,
        })
    }
}

impl BatchTransport for SubprocessTransport {
    fn send_line(&mut self, line: &[u8]) -> io::Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::BrokenPipe))?;
        stdin.write_all(line)?;
        stdin.write_all(b"\n")?;
        stdin.flush()
    }

    fn recv_line(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut line = vec![];
        let n = self
            .stdout
            .by_ref()
            .take(MAX_REPLY_BYTES as u64 + 1)
            .read_until(b'\n', &mut line)?;
        if n == 0 {
            return Ok(None);
        }
        if n > MAX_REPLY_BYTES {
            return Err(io::Error::other("reply line overflow"));
        }
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        Ok(Some(line))
    }
}

impl Drop for SubprocessTransport {
    fn drop(&mut self) {
        // Closing stdin asks the helper to finish; don't wait forever for
        // it.
        drop(self.stdin.take());
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match self.child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                _ => break,
            }
        }
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

struct HelperState {
    transport: Option<Box<dyn BatchTransport>>,
    last_used: Instant,
}

struct Helper {
    /// Thread currently inside a request/reply round, if any.
    owner: Mutex<Option<ThreadId>>,
    state: Mutex<HelperState>,
}

/// The per-repository helper pool.
pub struct BatchPool {
    helpers: Mutex<HashMap<BatchCommand, Arc<Helper>>>,
    max_helpers: usize,
    max_inactive: Duration,
}

impl BatchPool {
    pub fn new(max_helpers: usize, max_inactive: Duration) -> Self {
        Self {
            helpers: Mutex::new(HashMap::new()),
            max_helpers: max_helpers.max(1),
            max_inactive,
        }
    }

    /// Pool sized from `datalad.runtime.max-batched` and
    /// `datalad.runtime.max-inactive-age`.
    pub fn from_config(config: &crate::config::ConfigManager) -> Self {
        let max_helpers = config
            .get_int("datalad.runtime.max-batched")
            .ok()
            .flatten()
            .map(|n| n.max(1) as usize)
            .unwrap_or(20);
        let max_inactive = config
            .get_int("datalad.runtime.max-inactive-age")
            .ok()
            .flatten()
            .map(|secs| Duration::from_secs(secs.max(0) as u64))
            .unwrap_or(Duration::from_secs(60));
        Self::new(max_helpers, max_inactive)
    }

    /// Sends one request line and returns the reply line.
    ///
    /// `spawn` is used to (re)create the helper when the slot is empty or
    /// its previous process died.
    pub fn query(
        &self,
        command: &BatchCommand,
        spawn: &SpawnTransport,
        request: &[u8],
    ) -> Result<Vec<u8>, BatchError> {
        let helper = self.slot(command)?;
        let describe = || command.describe();

        {
            let owner = helper.owner.lock().expect("owner lock poisoned");
            if *owner == Some(std::thread::current().id()) {
                return Err(BatchError::Deadlock {
                    command: describe(),
                });
            }
        }

        let mut state = helper.state.lock().expect("helper lock poisoned");
        *helper.owner.lock().expect("owner lock poisoned") = Some(std::thread::current().id());
        let _reset = OwnerReset(&helper.owner);

        if state.transport.is_none() {
            state.transport = Some(spawn().map_err(|error| BatchError::Spawn {
                command: describe(),
                error,
            })?);
        }
        let transport = state.transport.as_mut().expect("transport was just set");
        let round = (|| -> Result<Vec<u8>, BatchError> {
            transport.send_line(request).map_err(|error| map_io(error, &describe()))?;
            match transport
                .recv_line()
                .map_err(|error| map_io(error, &describe()))?
            {
                Some(reply) => Ok(reply),
                None => Err(BatchError::Crashed {
                    command: describe(),
                }),
            }
        })();
        match round {
            Ok(reply) => {
                state.last_used = Instant::now();
                Ok(reply)
            }
            Err(err) => {
                // Drop the dead transport; the next request respawns.
                state.transport = None;
                Err(err)
            }
        }
    }

    fn slot(&self, command: &BatchCommand) -> Result<Arc<Helper>, BatchError> {
        let mut helpers = self.helpers.lock().expect("pool lock poisoned");
        if let Some(helper) = helpers.get(command) {
            return Ok(helper.clone());
        }
        if helpers.len() >= self.max_helpers {
            reap(&mut helpers, Duration::ZERO, self.max_helpers - 1);
            if helpers.len() >= self.max_helpers {
                return Err(BatchError::Exhausted {
                    limit: self.max_helpers,
                });
            }
        }
        let helper = Arc::new(Helper {
            owner: Mutex::new(None),
            state: Mutex::new(HelperState {
                transport: None,
                last_used: Instant::now(),
            }),
        });
        helpers.insert(command.clone(), helper.clone());
        Ok(helper)
    }

    /// Drops helpers idle longer than the configured maximum.
    pub fn reap_idle(&self) {
        let mut helpers = self.helpers.lock().expect("pool lock poisoned");
        reap(&mut helpers, self.max_inactive, usize::MAX);
    }
}

/// Removes idle helpers; stops early once `keep_at_most` slots remain.
fn reap(
    helpers: &mut HashMap<BatchCommand, Arc<Helper>>,
    max_inactive: Duration,
    keep_at_most: usize,
) {
    let idle: Vec<BatchCommand> = helpers
        .iter()
        .filter(|(_, helper)| {
            // A busy helper's state lock is held; skip it.
            helper.state.try_lock().is_ok_and(|state| {
                state.transport.is_none() || state.last_used.elapsed() >= max_inactive
            })
        })
        .map(|(command, _)| command.clone())
        .collect();
    for command in idle {
        if helpers.len() <= keep_at_most {
            break;
        }
        tracing::debug!(command = %command.describe(), "reaping idle batched helper");
        helpers.remove(&command);
    }
}

fn map_io(error: io::Error, command: &str) -> BatchError {
    if error.kind() == io::ErrorKind::BrokenPipe {
        BatchError::Crashed {
            command: command.to_string(),
        }
    } else {
        BatchError::Io {
            command: command.to_string(),
            error,
        }
    }
}

struct OwnerReset<'a>(&'a Mutex<Option<ThreadId>>);

impl Drop for OwnerReset<'_> {
    fn drop(&mut self) {
        *self.0.lock().expect("owner lock poisoned") = None;
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    /// Transport echoing requests back, with a scripted death.
    struct FakeTransport {
        replies_before_death: Option<usize>,
    }

    impl BatchTransport for FakeTransport {
        fn send_line(&mut self, _line: &[u8]) -> io::Result<()> {
            Ok(())
        }

        fn recv_line(&mut self) -> io::Result<Option<Vec<u8>>> {
            match &mut self.replies_before_death {
                Some(0) => Ok(None),
                Some(n) => {
                    *n -= 1;
                    Ok(Some(b"pong".to_vec()))
                }
                None => Ok(Some(b"pong".to_vec())),
            }
        }
    }

    fn command(tag: &str) -> BatchCommand {
        BatchCommand {
            program: PathBuf::from(tag),
            args: vec!["--batch".into()],
            cwd: PathBuf::from("."),
        }
    }

    fn immortal() -> Box<SpawnTransport> {
        Box::new(|| {
            Ok(Box::new(FakeTransport {
                replies_before_death: None,
            }) as Box<dyn BatchTransport>)
        })
    }

    #[test]
    fn test_query_round_trip() {
        let pool = BatchPool::new(4, Duration::from_secs(60));
        let reply = pool.query(&command("a"), &*immortal(), b"ping").unwrap();
        assert_eq!(reply, b"pong");
    }

    #[test]
    fn test_crash_reports_and_respawns() {
        let pool = BatchPool::new(4, Duration::from_secs(60));
        let dying: Box<SpawnTransport> = Box::new(|| {
            Ok(Box::new(FakeTransport {
                replies_before_death: Some(1),
            }) as Box<dyn BatchTransport>)
        });
        let cmd = command("a");
        assert_eq!(pool.query(&cmd, &*dying, b"1").unwrap(), b"pong");
        assert_matches!(
            pool.query(&cmd, &*dying, b"2"),
            Err(BatchError::Crashed { .. })
        );
        // The next request gets a fresh helper.
        assert_eq!(pool.query(&cmd, &*dying, b"3").unwrap(), b"pong");
    }

    #[test]
    fn test_pool_cap_evicts_idle_helper() {
        let pool = BatchPool::new(2, Duration::from_secs(60));
        pool.query(&command("a"), &*immortal(), b"x").unwrap();
        pool.query(&command("b"), &*immortal(), b"x").unwrap();
        // Capacity reached; an idle helper is evicted to make room.
        pool.query(&command("c"), &*immortal(), b"x").unwrap();
        assert!(pool.helpers.lock().unwrap().len() <= 2);
    }

    #[test]
    fn test_reap_idle() {
        let pool = BatchPool::new(4, Duration::ZERO);
        pool.query(&command("a"), &*immortal(), b"x").unwrap();
        pool.reap_idle();
        assert!(pool.helpers.lock().unwrap().is_empty());
    }

    #[test]
    fn test_deadlock_detection() {
        let pool = BatchPool::new(4, Duration::from_secs(60));
        let cmd = command("a");
        let helper = pool.slot(&cmd).unwrap();
        *helper.owner.lock().unwrap() = Some(std::thread::current().id());
        assert_matches!(
            pool.query(&cmd, &*immortal(), b"x"),
            Err(BatchError::Deadlock { .. })
        );
        *helper.owner.lock().unwrap() = None;
        assert!(pool.query(&cmd, &*immortal(), b"x").is_ok());
    }

    #[test]
    fn test_concurrent_queries_serialize() {
        let pool = Arc::new(BatchPool::new(2, Duration::from_secs(60)));
        let mut handles = vec![];
        for _ in 0..8 {
            let pool = pool.clone();
            handles.push(std::thread::spawn(move || {
                let spawn = immortal();
                pool.query(&command("shared"), &*spawn, b"ping").unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.join().unwrap(), b"pong");
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_subprocess_transport_with_cat() {
        let cmd = BatchCommand {
            program: PathBuf::from("cat"),
            args: vec![],
            cwd: std::env::temp_dir(),
        };
        let pool = BatchPool::new(1, Duration::from_secs(60));
        let spawn_cmd = cmd.clone();
        let spawn: Box<SpawnTransport> = Box::new(move || {
            Ok(Box::new(SubprocessTransport::spawn(&spawn_cmd)?) as Box<dyn BatchTransport>)
        });
        assert_eq!(pool.query(&cmd, &*spawn, b"first").unwrap(), b"first");
        assert_eq!(pool.query(&cmd, &*spawn, b"second").unwrap(), b"second");
    }
}
