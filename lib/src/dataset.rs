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

//! The dataset model.
//!
//! A dataset is a working tree managed by the external VCS, an optional
//! content annex, and a stable identity: a random UUID recorded in the
//! branch-committed configuration at creation, immutable for the life of
//! the dataset and shared by all of its checkouts. Handles are flyweights:
//! for one canonical root path there is one `Arc<Dataset>` per process.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::LazyLock;
use std::sync::Mutex;

use thiserror::Error;
use uuid::Uuid;

use crate::config::ConfigError;
use crate::config::ConfigManager;
use crate::config::ConfigScope;
use crate::file_util;
use crate::file_util::PathError;
use crate::runner::RunOptions;
use crate::vcs::Repo;
use crate::vcs::VcsError;

/// Key under which a dataset's identity lives in branch configuration.
pub const DATASET_ID_KEY: &str = "datalad.dataset.id";

/// Error around dataset identity, discovery, or lifecycle.
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("No dataset found {purpose} (started from {start})")]
    NoDataset { purpose: String, start: PathBuf },
    #[error("Dataset at {root} already has id {existing}; refusing to record {proposed}")]
    IdMismatch {
        root: PathBuf,
        existing: Uuid,
        proposed: Uuid,
    },
    #[error("Recorded dataset id {text:?} is not a UUID")]
    InvalidId { text: String },
    #[error("{path} lies inside the dataset {parent}; pass force to create an unregistered dataset")]
    NestedCreate { path: PathBuf, parent: PathBuf },
    #[error("Unknown procedure {0:?}")]
    UnknownProcedure(String),
    #[error("Working tree at {root} has uncommitted changes")]
    Dirty { root: PathBuf },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Vcs(#[from] VcsError),
    #[error(transparent)]
    Path(#[from] PathError),
}

/// Mode of a working tree on file systems without symlink support: the
/// checked-out branch is a rewrite of the true branch.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AdjustedBranch {
    /// Name of the underlying true branch.
    pub base_branch: String,
    /// Adjustment kind, e.g. `unlocked`.
    pub kind: String,
}

/// Parses an adjusted branch name of the shape `adjusted/<base>(<kind>)`.
pub fn parse_adjusted_branch(branch: &str) -> Option<AdjustedBranch> {
    let rest = branch.strip_prefix("adjusted/")?;
    let (base, kind) = rest.split_once('(')?;
    let kind = kind.strip_suffix(')')?;
    (!base.is_empty() && !kind.is_empty()).then(|| AdjustedBranch {
        base_branch: base.to_string(),
        kind: kind.to_string(),
    })
}

static REGISTRY: LazyLock<Mutex<HashMap<PathBuf, Arc<Dataset>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Handle on one dataset root.
#[derive(Debug)]
pub struct Dataset {
    root: PathBuf,
    repo: Repo,
}

impl Dataset {
    /// Returns the process-wide handle for the dataset at `path`.
    ///
    /// The path is canonicalized first; two spellings of the same root
    /// yield the same `Arc`. Construction is serialized across threads.
    pub fn at(path: &Path) -> Result<Arc<Self>, DatasetError> {
        let root = file_util::canonicalize(path)?;
        let mut registry = REGISTRY.lock().expect("dataset registry poisoned");
        if let Some(existing) = registry.get(&root) {
            return Ok(existing.clone());
        }
        let dataset = Arc::new(Self {
            repo: Repo::new(&root),
            root: root.clone(),
        });
        registry.insert(root, dataset.clone());
        Ok(dataset)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn repo(&self) -> &Repo {
        &self.repo
    }

    /// True if the working tree exists locally.
    pub fn is_installed(&self) -> bool {
        is_dataset_root(&self.root)
    }

    /// True if the dataset carries a content annex.
    pub fn is_annexed(&self) -> bool {
        self.root.join(".git").join("annex").is_dir()
    }

    /// Loads the configuration stack for this dataset.
    pub fn config(&self) -> Result<ConfigManager, DatasetError> {
        Ok(ConfigManager::for_dataset(&self.root)?)
    }

    /// The recorded dataset UUID, if any.
    pub fn id(&self) -> Result<Option<Uuid>, DatasetError> {
        let config = self.config()?;
        match config.get(DATASET_ID_KEY) {
            Some(text) => Uuid::parse_str(text)
                .map(Some)
                .map_err(|_| DatasetError::InvalidId {
                    text: text.to_string(),
                }),
            None => Ok(None),
        }
    }

    /// Records `id` as this dataset's identity.
    ///
    /// The identity is immutable: recording a different UUID for a dataset
    /// that already has one is an error.
    pub fn record_id(&self, id: Uuid) -> Result<(), DatasetError> {
        if let Some(existing) = self.id()? {
            if existing == id {
                return Ok(());
            }
            return Err(DatasetError::IdMismatch {
                root: self.root.clone(),
                existing,
                proposed: id,
            });
        }
        let mut config = self.config()?;
        config.set(DATASET_ID_KEY, &id.to_string(), ConfigScope::Branch)?;
        Ok(())
    }

    /// The currently checked-out branch, or `None` on a detached head.
    ///
    /// Read from the head file directly so no subprocess is needed on this
    /// hot path.
    pub fn current_branch(&self) -> Option<String> {
        let head = fs::read_to_string(self.root.join(".git").join("HEAD")).ok()?;
        head.trim()
            .strip_prefix("ref: refs/heads/")
            .map(|name| name.to_string())
    }

    /// Present when the working tree is on an adjusted branch.
    pub fn adjusted_branch(&self) -> Option<AdjustedBranch> {
        parse_adjusted_branch(&self.current_branch()?)
    }

    /// Commit hash of `HEAD`, or `None` before the first commit.
    pub fn head_commit(&self) -> Result<Option<String>, DatasetError> {
        let output = self.repo.call_git_unchecked(
            &["rev-parse".into(), "--verify".into(), "-q".into(), "HEAD".into()],
            RunOptions::default(),
        )?;
        if !output.success() {
            return Ok(None);
        }
        Ok(Some(
            String::from_utf8_lossy(&output.stdout).trim().to_string(),
        ))
    }

    /// Resolves a path argument given to this dataset handle: relative
    /// paths are taken relative to the dataset root.
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            file_util::normalize_path(path)
        } else {
            file_util::normalize_path(&self.root.join(path))
        }
    }

    /// Creates a new dataset at `path`.
    pub fn create(path: &Path, options: &CreateOptions) -> Result<Arc<Self>, DatasetError> {
        if !options.force
            && let Some(parent_root) = discover(path.parent().unwrap_or(path))
        {
            return Err(DatasetError::NestedCreate {
                path: path.to_path_buf(),
                parent: parent_root,
            });
        }
        fs::create_dir_all(path).map_err(|source| PathError {
            path: path.to_path_buf(),
            source,
        })?;
        let repo = Repo::new(path);
        repo.call_git(&["init".into()], RunOptions::default())?;
        let dataset = Self::at(path)?;
        dataset.record_id(options.id.unwrap_or_else(Uuid::new_v4))?;
        if options.annex {
            dataset
                .repo()
                .call_annex(&["init".into()], RunOptions::default())?;
        }
        for procedure in &options.procedures {
            run_procedure(&dataset, procedure)?;
        }
        dataset.repo().add_paths(&[".".into()])?;
        dataset
            .repo()
            .commit_paths("[DATALAD] new dataset", &[".".into()])?;
        Ok(dataset)
    }

    /// Deletes this dataset's working tree after dropping annexed content.
    ///
    /// With `check_availability` the annex verifies enough copies exist
    /// elsewhere before letting content go.
    pub fn remove(&self, check_availability: bool) -> Result<(), DatasetError> {
        if self.is_annexed() {
            let mut args: Vec<std::ffi::OsString> = vec!["drop".into(), "--all".into()];
            if !check_availability {
                args.push("--force".into());
            }
            self.repo.call_annex(&args, RunOptions::default())?;
        }
        fs::remove_dir_all(&self.root).map_err(|source| PathError {
            path: self.root.clone(),
            source,
        })?;
        let mut registry = REGISTRY.lock().expect("dataset registry poisoned");
        registry.remove(&self.root);
        Ok(())
    }
}

/// Knobs for dataset creation.
#[derive(Debug, Default)]
pub struct CreateOptions {
    /// Initialize a content annex as well.
    pub annex: bool,
    /// Permit creation nested in a foreign dataset without registration.
    pub force: bool,
    /// Identity to record; a fresh random UUID when absent.
    pub id: Option<Uuid>,
    /// Procedures to run before the initial commit.
    pub procedures: Vec<String>,
}

/// Runs a named configuration procedure on a freshly created dataset.
fn run_procedure(dataset: &Dataset, name: &str) -> Result<(), DatasetError> {
    match name {
        // Keep text files in the VCS, only binaries in the annex.
        "text2git" => {
            let attributes = dataset.root().join(".gitattributes");
            let mut content = fs::read_to_string(&attributes).unwrap_or_default();
            content.push_str("* annex.largefiles=((mimeencoding=binary)and(largerthan=0))\n");
            file_util::write_atomic(&attributes, content.as_bytes())?;
            Ok(())
        }
        _ => Err(DatasetError::UnknownProcedure(name.to_string())),
    }
}

/// True if `path` looks like a dataset root (a repository lives there).
pub fn is_dataset_root(path: &Path) -> bool {
    // `.git` may be a directory or a gitfile pointer in linked worktrees.
    path.join(".git").exists()
}

/// Walks upward to the nearest enclosing dataset root.
pub fn discover(start: &Path) -> Option<PathBuf> {
    let mut cursor = Some(start);
    while let Some(dir) = cursor {
        if is_dataset_root(dir) {
            return Some(dir.to_path_buf());
        }
        cursor = dir.parent();
    }
    None
}

/// Walks upward to the topmost enclosing dataset root.
pub fn discover_topmost(start: &Path) -> Option<PathBuf> {
    let mut found = None;
    let mut cursor = Some(start);
    while let Some(dir) = cursor {
        if is_dataset_root(dir) {
            found = Some(dir.to_path_buf());
        }
        cursor = dir.parent();
    }
    found
}

/// Resolves the dataset shorthand tokens against `cwd`: `^` names the
/// topmost enclosing dataset, `^.` the closest one. Anything else is a
/// plain path.
pub fn resolve_dataset_token(token: &str, cwd: &Path) -> Result<PathBuf, DatasetError> {
    let no_dataset = |purpose: &str| DatasetError::NoDataset {
        purpose: purpose.to_string(),
        start: cwd.to_path_buf(),
    };
    match token {
        "^" => discover_topmost(cwd).ok_or_else(|| no_dataset("to resolve the topmost dataset")),
        "^." => discover(cwd).ok_or_else(|| no_dataset("to resolve the containing dataset")),
        other => Ok(resolve_cli_path(Path::new(other), cwd)),
    }
}

/// Resolves a path argument given on a command line: relative paths are
/// taken relative to the process working directory.
pub fn resolve_cli_path(path: &Path, cwd: &Path) -> PathBuf {
    if path.is_absolute() {
        file_util::normalize_path(path)
    } else {
        file_util::normalize_path(&cwd.join(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Lays out a bare-bones dataset root without any subprocess.
    fn scaffold(root: &Path) {
        fs::create_dir_all(root.join(".git")).unwrap();
    }

    #[test]
    fn test_flyweight_identity() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("ds");
        scaffold(&root);
        let a = Dataset::at(&root).unwrap();
        let b = Dataset::at(&root).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        // A differently spelled path to the same root hits the same handle.
        let spelled = root.join("..").join("ds");
        let c = Dataset::at(&spelled).unwrap();
        assert!(Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_discover_walks_upward() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("top");
        scaffold(&root);
        let deep = root.join("a").join("b");
        fs::create_dir_all(&deep).unwrap();
        assert_eq!(discover(&deep), Some(root.clone()));
        assert_eq!(discover(dir.path()), None);
    }

    #[test]
    fn test_discover_topmost_prefers_outer() {
        let dir = tempfile::tempdir().unwrap();
        let outer = dir.path().join("outer");
        let inner = outer.join("inner");
        scaffold(&outer);
        scaffold(&inner);
        let deep = inner.join("x");
        fs::create_dir_all(&deep).unwrap();
        assert_eq!(discover(&deep), Some(inner.clone()));
        assert_eq!(discover_topmost(&deep), Some(outer));
    }

    #[test]
    fn test_resolve_dataset_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let outer = dir.path().join("outer");
        let inner = outer.join("inner");
        scaffold(&outer);
        scaffold(&inner);
        let cwd = inner.join("sub");
        fs::create_dir_all(&cwd).unwrap();
        assert_eq!(resolve_dataset_token("^", &cwd).unwrap(), outer);
        assert_eq!(resolve_dataset_token("^.", &cwd).unwrap(), inner);
        assert_eq!(
            resolve_dataset_token("rel/path", &cwd).unwrap(),
            cwd.join("rel/path")
        );
        let missing = resolve_dataset_token("^", Path::new("/nonexistent-root-xyz"));
        assert!(missing.is_err());
    }

    #[test]
    fn test_path_resolution_cli_vs_handle() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("ds");
        scaffold(&root);
        let dataset = Dataset::at(&root).unwrap();
        let cwd = dir.path().join("elsewhere");
        // CLI-style resolution follows the working directory; handle-style
        // resolution follows the dataset root.
        assert_eq!(resolve_cli_path(Path::new("f"), &cwd), cwd.join("f"));
        assert_eq!(
            dataset.resolve_path(Path::new("f")),
            dataset.root().join("f")
        );
    }

    #[test]
    fn test_adjusted_branch_parsing() {
        assert_eq!(
            parse_adjusted_branch("adjusted/main(unlocked)"),
            Some(AdjustedBranch {
                base_branch: "main".into(),
                kind: "unlocked".into(),
            })
        );
        assert_eq!(parse_adjusted_branch("main"), None);
        assert_eq!(parse_adjusted_branch("adjusted/main"), None);
        assert_eq!(parse_adjusted_branch("adjusted/(unlocked)"), None);
    }

    #[test]
    fn test_current_branch_from_head_file() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("ds");
        scaffold(&root);
        fs::write(
            root.join(".git").join("HEAD"),
            "ref: refs/heads/adjusted/main(unlocked)\n",
        )
        .unwrap();
        let dataset = Dataset::at(&root).unwrap();
        assert_eq!(
            dataset.current_branch().as_deref(),
            Some("adjusted/main(unlocked)")
        );
        assert_eq!(
            dataset.adjusted_branch().unwrap().base_branch,
            "main"
        );
    }

    #[test]
    fn test_recorded_id_round_trip_and_immutability() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("ds");
        scaffold(&root);
        let dataset = Dataset::at(&root).unwrap();
        assert_eq!(dataset.id().unwrap(), None);
        let id = Uuid::new_v4();
        dataset.record_id(id).unwrap();
        assert_eq!(dataset.id().unwrap(), Some(id));
        // Same id again is fine; a different one is rejected.
        dataset.record_id(id).unwrap();
        let err = dataset.record_id(Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, DatasetError::IdMismatch { .. }));
    }
}
