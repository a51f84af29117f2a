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

//! Shared helpers for datalad-lib integration tests.
//!
//! Nothing here talks to the external VCS or annex binaries; scaffolding
//! lays out just enough filesystem structure for discovery and
//! configuration, and fake transfer sources stand in for the network.

use std::fs;
use std::io;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use datalad_lib::config::ConfigLayer;
use datalad_lib::config::ConfigManager;
use datalad_lib::config::ConfigScope;
use datalad_lib::key::AnnexKey;
use datalad_lib::runner::CancelToken;
use datalad_lib::transfer::Candidate;
use datalad_lib::transfer::ContentSource;
use datalad_lib::transfer::TransferError;
use tempfile::TempDir;

pub fn new_temp_dir() -> TempDir {
    tempfile::Builder::new()
        .prefix("datalad-test-")
        .tempdir()
        .unwrap()
}

/// Lays out a minimal dataset root (repository marker only), no
/// subprocess involved.
pub fn scaffold_dataset(root: &Path) {
    fs::create_dir_all(root.join(".git")).unwrap();
}

/// Configuration stack isolated from the machine: no system/user files,
/// the given git-config text as the dataset-local layer.
pub fn isolated_config(local_text: &str) -> ConfigManager {
    let mut config = ConfigManager::default();
    config.add_layer(ConfigLayer::parse(
        ConfigScope::Local,
        local_text.as_bytes(),
    ));
    config
}

/// A content key sized to the given content.
pub fn key_for(name: &str, content: &[u8]) -> AnnexKey {
    AnnexKey::parse(&format!("WORM-s{}--{name}", content.len())).unwrap()
}

/// Shared writable buffer for capturing rendered bus output.
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn text(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Deterministic in-memory content source with a scripted failure count.
///
/// Clones share their counters, so a test can hand candidates to an
/// engine and still observe how often each source was tried.
#[derive(Clone)]
pub struct StaticSource {
    state: Arc<SourceState>,
}

struct SourceState {
    label: String,
    cost: u32,
    content: Vec<u8>,
    failures_left: AtomicUsize,
    fetches: AtomicUsize,
}

impl StaticSource {
    pub fn new(label: &str, cost: u32, content: &[u8]) -> Self {
        Self::flaky(label, cost, content, 0)
    }

    pub fn flaky(label: &str, cost: u32, content: &[u8], failures: usize) -> Self {
        Self {
            state: Arc::new(SourceState {
                label: label.to_string(),
                cost,
                content: content.to_vec(),
                failures_left: AtomicUsize::new(failures),
                fetches: AtomicUsize::new(0),
            }),
        }
    }

    pub fn fetch_count(&self) -> usize {
        self.state.fetches.load(Ordering::SeqCst)
    }

    pub fn candidate(&self) -> Candidate {
        Candidate {
            label: self.state.label.clone(),
            cost: self.state.cost,
            source: Arc::new(self.clone()),
        }
    }
}

impl ContentSource for StaticSource {
    fn describe(&self) -> String {
        self.state.label.clone()
    }

    fn cost(&self) -> u32 {
        self.state.cost
    }

    fn fetch(
        &self,
        _key: &AnnexKey,
        dest: &Path,
        progress: &mut dyn FnMut(u64, Option<u64>),
        cancel: &CancelToken,
    ) -> Result<(), TransferError> {
        self.state.fetches.fetch_add(1, Ordering::SeqCst);
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        if self.state.failures_left.load(Ordering::SeqCst) > 0 {
            self.state.failures_left.fetch_sub(1, Ordering::SeqCst);
            return Err(TransferError::Source(format!(
                "{} is unavailable",
                self.state.label
            )));
        }
        fs::write(dest, &self.state.content).unwrap();
        progress(
            self.state.content.len() as u64,
            Some(self.state.content.len() as u64),
        );
        Ok(())
    }
}
