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

//! The content transfer engine.
//!
//! "Where are the bytes" and "how do I move them" meet here. For each
//! wanted key the engine resolves the known locations into an ordered
//! list of candidate sources (cost-prefixed labels first), then drives a
//! bounded worker pool through the per-file stage sequence: resolve,
//! reserve, transfer, verify, commit availability. Stages of one file are
//! strictly ordered; files among each other are not. Failed transfers
//! retry with bounded exponential backoff and jitter, a single
//! cancellation token reaches every worker, and partial downloads are
//! discarded on every exit path so they are never advertised as
//! available.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs;
use std::io::Read as _;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use rand::Rng as _;
use thiserror::Error;
use threadpool::ThreadPool;

use crate::config::ConfigManager;
use crate::credentials::Provider;
use crate::dataset::Dataset;
use crate::dataset::DatasetError;
use crate::error::ErrorKind;
use crate::error::ErrorReport;
use crate::file_util::IoResultExt as _;
use crate::file_util::PathError;
use crate::http::HttpClient;
use crate::key::AnnexKey;
use crate::resultbus::Message;
use crate::resultbus::PathType;
use crate::resultbus::ResultRecord;
use crate::resultbus::ResultStatus;
use crate::runner::CancelToken;
use crate::runner::RunOptions;
use crate::subdataset::SubdatasetRecord;
use crate::vcs::Repo;
use crate::vcs::VcsError;
use crate::vcs::WhereisLocation;

const RETRY_BASE: Duration = Duration::from_millis(500);
const RETRY_CAP: Duration = Duration::from_secs(10);

/// Error of one transfer task.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("No valid source is known for {key}")]
    NoValidSource { key: String },
    #[error("All sources failed for {key}; last: {last}")]
    AllSourcesFailed { key: String, last: String },
    #[error("Content of {key} hashed to {actual}, expected {expected}")]
    IntegrityMismatch {
        key: String,
        expected: String,
        actual: String,
    },
    #[error("Content of {key} is {actual} bytes, expected {expected}")]
    SizeMismatch {
        key: String,
        expected: u64,
        actual: u64,
    },
    #[error("Transfer was cancelled")]
    Cancelled,
    #[error("{0}")]
    Source(String),
    #[error(transparent)]
    Io(#[from] PathError),
    #[error(transparent)]
    Vcs(#[from] VcsError),
}

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoValidSource { .. } => ErrorKind::Transfer,
            Self::AllSourcesFailed { .. } => ErrorKind::Transfer,
            Self::IntegrityMismatch { .. } => ErrorKind::IntegrityMismatch,
            Self::SizeMismatch { .. } => ErrorKind::IntegrityMismatch,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Source(_) => ErrorKind::Transfer,
            Self::Io(_) => ErrorKind::Permission,
            Self::Vcs(_) => ErrorKind::External,
        }
    }
}

/// A place bytes can come from.
pub trait ContentSource: Send + Sync {
    fn describe(&self) -> String;

    fn cost(&self) -> u32;

    /// Obtains the key's content into `dest` (a staging path).
    fn fetch(
        &self,
        key: &AnnexKey,
        dest: &Path,
        progress: &mut dyn FnMut(u64, Option<u64>),
        cancel: &CancelToken,
    ) -> Result<(), TransferError>;
}

/// A place fetched bytes land: the local annex, or a plain directory.
pub trait ContentSink: Send + Sync {
    fn has(&self, key: &AnnexKey) -> bool;

    /// Stage path for an in-flight transfer of `key`.
    fn reserve(&self, key: &AnnexKey) -> Result<PathBuf, TransferError>;

    /// Moves verified staged content into place and announces
    /// availability.
    fn commit(&self, key: &AnnexKey, staged: &Path) -> Result<(), TransferError>;

    /// Removes leftover staging state; runs on every failure path.
    fn discard(&self, key: &AnnexKey, staged: &Path);
}

/// Key-addressed flat directory sink (tests, export-style layouts).
pub struct DirSink {
    root: PathBuf,
}

impl DirSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, key: &AnnexKey) -> PathBuf {
        self.root.join(key.as_str())
    }
}

impl ContentSink for DirSink {
    fn has(&self, key: &AnnexKey) -> bool {
        self.object_path(key).exists()
    }

    fn reserve(&self, key: &AnnexKey) -> Result<PathBuf, TransferError> {
        let staging = self.root.join("transfer");
        fs::create_dir_all(&staging).context(&staging)?;
        Ok(staging.join(key.as_str()))
    }

    fn commit(&self, key: &AnnexKey, staged: &Path) -> Result<(), TransferError> {
        let target = self.object_path(key);
        fs::create_dir_all(target.parent().expect("object path has a parent"))
            .context(&target)?;
        fs::rename(staged, &target).context(&target)?;
        Ok(())
    }

    fn discard(&self, _key: &AnnexKey, staged: &Path) {
        let _ = fs::remove_file(staged);
    }
}

/// Sink injecting verified content into the dataset's annex.
pub struct AnnexSink {
    repo: Repo,
}

impl AnnexSink {
    pub fn new(repo: Repo) -> Self {
        Self { repo }
    }
}

impl ContentSink for AnnexSink {
    fn has(&self, key: &AnnexKey) -> bool {
        self.repo
            .call_annex(
                &["checkpresentkey".into(), key.as_str().into()],
                RunOptions::default(),
            )
            .map(|output| output.success())
            .unwrap_or(false)
    }

    fn reserve(&self, key: &AnnexKey) -> Result<PathBuf, TransferError> {
        let staging = self.repo.git_dir().join("datalad").join("transfer");
        fs::create_dir_all(&staging).context(&staging)?;
        Ok(staging.join(key.as_str()))
    }

    fn commit(&self, key: &AnnexKey, staged: &Path) -> Result<(), TransferError> {
        // The annex re-verifies and moves the object into its store; only
        // then is the key advertised as locally present.
        self.repo.call_annex(
            &[
                "setkey".into(),
                key.as_str().into(),
                staged.as_os_str().to_os_string(),
            ],
            RunOptions::default(),
        )?;
        Ok(())
    }

    fn discard(&self, _key: &AnnexKey, staged: &Path) {
        let _ = fs::remove_file(staged);
    }
}

/// One ordered candidate for obtaining a key.
#[derive(Clone)]
pub struct Candidate {
    pub label: String,
    pub cost: u32,
    pub source: Arc<dyn ContentSource>,
}

/// Extracts the cost from a label with a 3-digit numeric prefix
/// (`100-http` → 100).
pub fn cost_from_label(label: &str) -> Option<u32> {
    let (digits, rest) = label.split_at_checked(3)?;
    if !rest.is_empty() && !rest.starts_with('-') {
        return None;
    }
    digits
        .chars()
        .all(|c| c.is_ascii_digit())
        .then(|| digits.parse().ok())
        .flatten()
}

/// Sorts candidates for trial order: cheapest cost first, label as the
/// tiebreaker.
pub fn order_candidates(mut candidates: Vec<Candidate>) -> Vec<Candidate> {
    candidates.sort_by(|a, b| a.cost.cmp(&b.cost).then_with(|| a.label.cmp(&b.label)));
    candidates
}

/// A configured source-candidate template:
/// `datalad.get.subdataset-source-candidate-<label>` with an optional
/// cost prefix in the label.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CandidateTemplate {
    pub label: String,
    pub cost: u32,
    pub template: String,
}

/// Reads candidate templates from configuration, cost order applied.
pub fn candidate_templates(config: &ConfigManager) -> Vec<CandidateTemplate> {
    const PREFIX: &str = "datalad.get.subdataset-source-candidate-";
    let mut templates: Vec<CandidateTemplate> = config
        .keys_with_prefix(PREFIX)
        .into_iter()
        .filter_map(|key| {
            let label = key.strip_prefix(PREFIX)?.to_string();
            let template = config.get(&key)?.to_string();
            // Labels without a numeric prefix rank last among candidates.
            let cost = cost_from_label(&label).unwrap_or(700);
            Some(CandidateTemplate {
                label,
                cost,
                template,
            })
        })
        .collect();
    templates.sort_by(|a, b| a.cost.cmp(&b.cost).then_with(|| a.label.cmp(&b.label)));
    templates
}

/// Substitutes `{name}` placeholders; `None` when a placeholder has no
/// value (such a candidate is skipped, not mangled).
pub fn expand_template(template: &str, props: &HashMap<String, String>) -> Option<String> {
    let mut out = String::new();
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after.find('}')?;
        let name = &after[..close];
        out.push_str(props.get(name)?);
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Some(out)
}

/// Substitution properties available to candidate templates.
pub fn subdataset_properties(
    parent: &Dataset,
    record: &SubdatasetRecord,
) -> HashMap<String, String> {
    let mut props = HashMap::new();
    if let Some(id) = &record.id {
        props.insert("id".to_string(), id.to_string());
    }
    props.insert("path".to_string(), record.path.clone());
    props.insert("name".to_string(), record.name.clone());
    if let Some(url) = &record.url {
        props.insert("url".to_string(), url.clone());
    }
    if let Some(datalad_url) = &record.datalad_url {
        props.insert("datalad-url".to_string(), datalad_url.clone());
    }
    props.insert(
        "parent-path".to_string(),
        parent.root().display().to_string(),
    );
    props
}

/// Asks the annex where a key currently is.
///
/// For a key present in the local annex the reply includes the local
/// repository's own UUID (`here`).
pub fn locations(repo: &Repo, path: &Path) -> Result<Vec<WhereisLocation>, TransferError> {
    let records = repo.call_annex_json(
        "whereis",
        &[path.as_os_str().to_os_string()],
        RunOptions::default(),
    )?;
    Ok(records.into_iter().flat_map(|r| r.whereis).collect())
}

/// Worker count policy.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Jobs {
    /// Resolve from configuration / machine shape.
    Auto,
    Count(usize),
}

/// `auto` for annex-bound work: `datalad.runtime.max-annex-jobs`,
/// defaulting to 1 to keep file descriptors in check on huge trees.
pub fn annex_jobs(jobs: Jobs, config: &ConfigManager) -> usize {
    match jobs {
        Jobs::Count(n) => n.max(1),
        Jobs::Auto => config
            .get_int("datalad.runtime.max-annex-jobs")
            .ok()
            .flatten()
            .map(|n| n.max(1) as usize)
            .unwrap_or(1),
    }
}

/// `auto` for core-level parallelism: `min(8, max(3, ncpu))`.
pub fn core_jobs(jobs: Jobs) -> usize {
    match jobs {
        Jobs::Count(n) => n.max(1),
        Jobs::Auto => num_cpus::get().clamp(3, 8),
    }
}

/// Progress of one task: (task id, bytes done, total when known, label).
#[derive(Clone, Debug, PartialEq)]
pub struct ProgressEvent {
    pub task: usize,
    pub done: u64,
    pub total: Option<u64>,
    pub label: String,
}

/// One unit of work for the pool.
pub struct TransferTask {
    pub key: AnnexKey,
    /// Path the record will be about.
    pub path: PathBuf,
    pub candidates: Vec<Candidate>,
}

#[derive(Clone)]
pub struct EngineOptions {
    pub jobs: usize,
    /// Retries per task (get/copy only), `datalad.annex.retry`.
    pub retries: u32,
    pub cancel: CancelToken,
}

impl EngineOptions {
    pub fn from_config(config: &ConfigManager, jobs: Jobs) -> Self {
        Self {
            jobs: annex_jobs(jobs, config),
            retries: config
                .get_int("datalad.annex.retry")
                .ok()
                .flatten()
                .map(|n| n.max(0) as u32)
                .unwrap_or(3),
            cancel: CancelToken::new(),
        }
    }
}

/// The bounded-pool transfer engine.
pub struct TransferEngine {
    sink: Arc<dyn ContentSink>,
    options: EngineOptions,
}

impl TransferEngine {
    pub fn new(sink: Arc<dyn ContentSink>, options: EngineOptions) -> Self {
        Self { sink, options }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.options.cancel.clone()
    }

    /// Runs all tasks to completion and returns one record per task.
    ///
    /// No ordering guarantee exists between tasks; the stage order within
    /// one task is strict. `progress` is called from worker threads.
    pub fn run(
        &self,
        tasks: Vec<TransferTask>,
        progress: impl Fn(ProgressEvent) + Send + Sync + 'static,
    ) -> Vec<ResultRecord> {
        let pool = ThreadPool::new(self.options.jobs.max(1));
        let (tx, rx) = mpsc::channel();
        let progress = Arc::new(progress);
        let total = tasks.len();
        for (index, task) in tasks.into_iter().enumerate() {
            let sink = self.sink.clone();
            let options = self.options.clone();
            let tx = tx.clone();
            let progress = progress.clone();
            pool.execute(move || {
                let record = execute_task(index, &task, sink.as_ref(), &options, &*progress);
                // The receiver outlives the pool; a send failure means the
                // caller is gone and there is nobody to report to.
                let _ = tx.send(record);
            });
        }
        drop(tx);
        let mut records: Vec<ResultRecord> = rx.iter().take(total).collect();
        pool.join();
        // Deterministic report order regardless of completion order.
        records.sort_by(|a, b| a.path.cmp(&b.path));
        records
    }
}

/// Stage sequence for one task; cleanup runs on every exit path.
fn execute_task(
    index: usize,
    task: &TransferTask,
    sink: &dyn ContentSink,
    options: &EngineOptions,
    progress: &(dyn Fn(ProgressEvent) + Send + Sync),
) -> ResultRecord {
    let base = |status: ResultStatus, message: Message| {
        ResultRecord::new("get", status, message)
            .with_path(task.path.clone(), PathType::Key)
            .with_extra("key", task.key.as_str())
    };

    if sink.has(&task.key) {
        return base(
            ResultStatus::NotNeeded,
            Message::plain("content is already present"),
        );
    }
    let candidates = order_candidates(task.candidates.clone());
    if candidates.is_empty() {
        let err = TransferError::NoValidSource {
            key: task.key.as_str().to_string(),
        };
        let mut record = base(ResultStatus::Impossible, Message::plain(err.to_string()));
        record.error = Some(ErrorReport::from_error(err.kind(), &err));
        return record;
    }

    let mut last_error = TransferError::NoValidSource {
        key: task.key.as_str().to_string(),
    };
    for attempt in 0..=options.retries {
        if attempt > 0 {
            std::thread::sleep(backoff_delay(attempt));
        }
        for candidate in &candidates {
            if options.cancel.is_cancelled() {
                let err = TransferError::Cancelled;
                let mut record =
                    base(ResultStatus::Error, Message::plain(err.to_string()));
                record.error = Some(ErrorReport::new(ErrorKind::Cancelled, err.to_string()));
                return record;
            }
            match try_candidate(index, task, candidate, sink, options, progress) {
                Ok(bytes) => {
                    return base(
                        ResultStatus::Ok,
                        Message::templated(
                            "obtained from {}",
                            vec![candidate.source.describe()],
                        ),
                    )
                    .with_extra("bytes", bytes)
                    .with_extra("source", candidate.label.clone());
                }
                Err(err @ TransferError::Cancelled) => {
                    let mut record =
                        base(ResultStatus::Error, Message::plain(err.to_string()));
                    record.error = Some(ErrorReport::new(ErrorKind::Cancelled, err.to_string()));
                    return record;
                }
                Err(err) => {
                    tracing::debug!(
                        key = task.key.as_str(),
                        candidate = %candidate.label,
                        %err,
                        "candidate failed"
                    );
                    last_error = err;
                }
            }
        }
    }
    let err = TransferError::AllSourcesFailed {
        key: task.key.as_str().to_string(),
        last: last_error.to_string(),
    };
    let mut record = base(ResultStatus::Error, Message::plain(err.to_string()));
    record.error = Some(ErrorReport::new(last_error.kind(), err.to_string()));
    record
}

/// Reserve → transfer → verify → commit for one candidate.
fn try_candidate(
    index: usize,
    task: &TransferTask,
    candidate: &Candidate,
    sink: &dyn ContentSink,
    options: &EngineOptions,
    progress: &(dyn Fn(ProgressEvent) + Send + Sync),
) -> Result<u64, TransferError> {
    let staged = sink.reserve(&task.key)?;
    let label = candidate.label.clone();
    let result = (|| {
        let mut report = |done: u64, total: Option<u64>| {
            progress(ProgressEvent {
                task: index,
                done,
                total,
                label: label.clone(),
            });
        };
        candidate
            .source
            .fetch(&task.key, &staged, &mut report, &options.cancel)?;
        verify_content(&task.key, &staged)?;
        let bytes = fs::metadata(&staged).map(|m| m.len()).unwrap_or(0);
        sink.commit(&task.key, &staged)?;
        Ok(bytes)
    })();
    if result.is_err() {
        // Failed or mismatching content must never be advertised.
        sink.discard(&task.key, &staged);
    }
    result
}

/// Bounded exponential backoff with jitter.
fn backoff_delay(attempt: u32) -> Duration {
    let exp = RETRY_BASE
        .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
        .min(RETRY_CAP);
    exp.mul_f64(rand::rng().random_range(0.5..1.5))
}

/// Checks staged content against what the key promises.
///
/// The size prefix is always enforced when present; checksum backends are
/// re-hashed. Keys without either (URL backend, missing size) pass: the
/// key itself makes no promise to check.
pub fn verify_content(key: &AnnexKey, path: &Path) -> Result<(), TransferError> {
    if let Some(expected) = key.size() {
        let actual = fs::metadata(path).context(path)?.len();
        if actual != expected {
            return Err(TransferError::SizeMismatch {
                key: key.as_str().to_string(),
                expected,
                actual,
            });
        }
    }
    let digest = key.digest();
    let expected_hash = match key.carries_extension() {
        true => digest.split('.').next().unwrap_or(digest),
        false => digest,
    };
    let hashed = match key.backend() {
        "SHA256" | "SHA256E" => Some(hex_digest::<sha2::Sha256>(path)?),
        "SHA512" | "SHA512E" => Some(hex_digest::<sha2::Sha512>(path)?),
        _ => None,
    };
    if let Some(actual) = hashed
        && actual != expected_hash.to_ascii_lowercase()
    {
        return Err(TransferError::IntegrityMismatch {
            key: key.as_str().to_string(),
            expected: expected_hash.to_string(),
            actual,
        });
    }
    Ok(())
}

fn hex_digest<D: sha2::Digest>(path: &Path) -> Result<String, TransferError> {
    let mut file = fs::File::open(path).context(path)?;
    let mut hasher = D::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).context(path)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest = hasher.finalize();
    Ok(digest
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<String>())
}

/// Content source reading from another local clone's flat object layout.
pub struct LocalCloneSource {
    pub root: PathBuf,
    pub cost: u32,
}

impl ContentSource for LocalCloneSource {
    fn describe(&self) -> String {
        format!("clone at {}", self.root.display())
    }

    fn cost(&self) -> u32 {
        self.cost
    }

    fn fetch(
        &self,
        key: &AnnexKey,
        dest: &Path,
        progress: &mut dyn FnMut(u64, Option<u64>),
        cancel: &CancelToken,
    ) -> Result<(), TransferError> {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        let source = self.root.join(key.as_str());
        let total = fs::metadata(&source)
            .map(|m| m.len())
            .map_err(|source_err| PathError {
                path: source.clone(),
                source: source_err,
            })?;
        fs::copy(&source, dest).context(dest)?;
        progress(total, Some(total));
        Ok(())
    }
}

/// Content source downloading over HTTP(S).
pub struct HttpSource {
    pub client: Arc<HttpClient>,
    pub url: String,
    pub credential: Option<Provider>,
    pub cost: u32,
}

impl ContentSource for HttpSource {
    fn describe(&self) -> String {
        self.url.clone()
    }

    fn cost(&self) -> u32 {
        self.cost
    }

    fn fetch(
        &self,
        _key: &AnnexKey,
        dest: &Path,
        progress: &mut dyn FnMut(u64, Option<u64>),
        cancel: &CancelToken,
    ) -> Result<(), TransferError> {
        self.client
            .download(
                &self.url,
                dest,
                true,
                self.credential.as_ref(),
                cancel,
                progress,
            )
            .map_err(|err| {
                if matches!(err, crate::http::DownloadError::Cancelled { .. }) {
                    TransferError::Cancelled
                } else {
                    TransferError::Source(err.to_string())
                }
            })?;
        Ok(())
    }
}

/// Data policy of a push.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum DataSelection {
    /// Push all annexed content reachable from the pushed refs.
    Anything,
    /// Refs only.
    Nothing,
    /// Let the sibling's preferred-content expressions decide.
    #[default]
    AutoIfWanted,
}

/// Resolves the transitive publication-dependency order for a push to
/// `sibling`: dependencies first, the target last, each sibling once.
pub fn publication_order(
    sibling: &str,
    depends_of: &dyn Fn(&str) -> Vec<String>,
) -> Vec<String> {
    let mut order = vec![];
    let mut in_progress = vec![];
    visit(sibling, depends_of, &mut order, &mut in_progress);
    order
}

fn visit(
    name: &str,
    depends_of: &dyn Fn(&str) -> Vec<String>,
    order: &mut Vec<String>,
    in_progress: &mut Vec<String>,
) {
    if order.iter().any(|n| n == name) || in_progress.iter().any(|n| n == name) {
        return;
    }
    in_progress.push(name.to_string());
    for dep in depends_of(name) {
        visit(&dep, depends_of, order, in_progress);
    }
    in_progress.retain(|n| n != name);
    order.push(name.to_string());
}

/// Pushes one dataset hierarchy to a sibling: subdatasets bottom-up,
/// publication dependencies first, data before refs.
pub fn push(
    dataset: &Dataset,
    to: &str,
    data: DataSelection,
) -> Result<Vec<ResultRecord>, DatasetError> {
    let mut results = vec![];
    push_inner(dataset, to, data, &mut results)?;
    Ok(results)
}

fn push_inner(
    dataset: &Dataset,
    to: &str,
    data: DataSelection,
    results: &mut Vec<ResultRecord>,
) -> Result<(), DatasetError> {
    // Bottom-up, so receiving-side hooks observe updated subdataset
    // pointers when the parent's refs arrive.
    let children = crate::subdataset::subdatasets(dataset, &Default::default())?;
    for child in &children {
        if child.state == crate::subdataset::SubdatasetState::Absent {
            continue;
        }
        let sub = Dataset::at(&child.abspath(dataset.root()))?;
        push_inner(&sub, to, data, results)?;
    }

    let config = dataset.config()?;
    let depends_of = |name: &str| -> Vec<String> {
        config
            .get_all(&format!("remote.{name}.datalad-publish-depends"))
            .into_iter()
            .map(str::to_string)
            .collect()
    };
    for target in publication_order(to, &depends_of) {
        results.push(push_single(dataset, &target, data)?);
    }
    Ok(())
}

fn push_single(
    dataset: &Dataset,
    to: &str,
    data: DataSelection,
) -> Result<ResultRecord, DatasetError> {
    let mut transferred = 0usize;
    // Data travels before refs so the sibling never announces refs whose
    // content it cannot serve.
    if dataset.is_annexed() && data != DataSelection::Nothing {
        let mut args: Vec<OsString> = vec!["--to".into(), to.into()];
        if data == DataSelection::AutoIfWanted {
            args.push("--auto".into());
        }
        let records = dataset
            .repo()
            .call_annex_json("copy", &args, RunOptions::default())?;
        transferred = records
            .iter()
            .filter(|record| record.success == Some(true))
            .count();
    }

    let mut refs: Vec<OsString> = vec!["push".into(), to.into()];
    if let Some(branch) = dataset.current_branch() {
        let branch = match crate::dataset::parse_adjusted_branch(&branch) {
            Some(adjusted) => adjusted.base_branch,
            None => branch,
        };
        refs.push(branch.into());
    }
    if dataset.is_annexed() {
        refs.push("git-annex".into());
    }
    dataset.repo().call_git(&refs, RunOptions::default())?;

    Ok(ResultRecord::ok("publish", "pushed data and refs")
        .with_path(dataset.root(), PathType::Dataset)
        .with_dataset(dataset.root())
        .with_sibling(to)
        .with_extra("transferred", transferred))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use super::*;

    /// Source handing out fixed bytes, with scripted failures.
    struct FakeSource {
        content: Vec<u8>,
        fail_times: AtomicUsize,
        cost: u32,
        label: String,
        fetches: AtomicUsize,
        block_until_cancelled: bool,
    }

    impl FakeSource {
        fn ok(label: &str, cost: u32, content: &[u8]) -> Arc<Self> {
            Arc::new(Self {
                content: content.to_vec(),
                fail_times: AtomicUsize::new(0),
                cost,
                label: label.to_string(),
                fetches: AtomicUsize::new(0),
                block_until_cancelled: false,
            })
        }

        fn failing(label: &str, cost: u32, times: usize) -> Arc<Self> {
            Arc::new(Self {
                content: b"payload".to_vec(),
                fail_times: AtomicUsize::new(times),
                cost,
                label: label.to_string(),
                fetches: AtomicUsize::new(0),
                block_until_cancelled: false,
            })
        }
    }

    impl ContentSource for FakeSource {
        fn describe(&self) -> String {
            self.label.clone()
        }

        fn cost(&self) -> u32 {
            self.cost
        }

        fn fetch(
            &self,
            _key: &AnnexKey,
            dest: &Path,
            progress: &mut dyn FnMut(u64, Option<u64>),
            cancel: &CancelToken,
        ) -> Result<(), TransferError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.block_until_cancelled {
                while !cancel.is_cancelled() {
                    std::thread::sleep(Duration::from_millis(5));
                }
                return Err(TransferError::Cancelled);
            }
            if self.fail_times.load(Ordering::SeqCst) > 0 {
                self.fail_times.fetch_sub(1, Ordering::SeqCst);
                return Err(TransferError::Source(format!("{} is down", self.label)));
            }
            fs::write(dest, &self.content).unwrap();
            progress(self.content.len() as u64, Some(self.content.len() as u64));
            Ok(())
        }
    }

    fn candidate(source: Arc<FakeSource>) -> Candidate {
        Candidate {
            label: source.label.clone(),
            cost: source.cost,
            source,
        }
    }

    fn plain_key(name: &str, size: u64) -> AnnexKey {
        AnnexKey::parse(&format!("WORM-s{size}--{name}")).unwrap()
    }

    fn engine(dir: &Path, retries: u32) -> (TransferEngine, CancelToken) {
        let options = EngineOptions {
            jobs: 4,
            retries,
            cancel: CancelToken::new(),
        };
        let cancel = options.cancel.clone();
        (
            TransferEngine::new(Arc::new(DirSink::new(dir)), options),
            cancel,
        )
    }

    #[test]
    fn test_cost_from_label() {
        assert_eq!(cost_from_label("100-http"), Some(100));
        assert_eq!(cost_from_label("010-s3"), Some(10));
        assert_eq!(cost_from_label("050"), Some(50));
        assert_eq!(cost_from_label("origin"), None);
        assert_eq!(cost_from_label("12-short"), None);
    }

    #[test]
    fn test_candidate_templates_cost_order() {
        let mut config = ConfigManager::default();
        config.add_layer(crate::config::ConfigLayer::parse(
            crate::config::ConfigScope::Local,
            br#"[datalad "get"]
    subdataset-source-candidate-100-http = https://example.com/{id}
    subdataset-source-candidate-010-s3 = s3://bucket/{id}?versionId=x
    subdataset-source-candidate-origin = https://fallback.example.com/{id}
    subdataset-source-candidate-050-ora = ria+ssh://store/#{id}
"#,
        ));
        let templates = candidate_templates(&config);
        let labels: Vec<&str> = templates.iter().map(|t| t.label.as_str()).collect();
        assert_eq!(labels, ["010-s3", "050-ora", "100-http", "origin"]);
    }

    #[test]
    fn test_expand_template() {
        let mut props = HashMap::new();
        props.insert("id".to_string(), "abc".to_string());
        assert_eq!(
            expand_template("https://x/{id}/y", &props).as_deref(),
            Some("https://x/abc/y")
        );
        assert_eq!(expand_template("https://x/{missing}", &props), None);
        assert_eq!(
            expand_template("no placeholders", &props).as_deref(),
            Some("no placeholders")
        );
    }

    #[test]
    fn test_get_prefers_cheapest_then_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _cancel) = engine(dir.path(), 0);
        // Mirrors a cost layout of 010-s3 < 050-ora < 100-http where the
        // cheap source throttles.
        let s3 = FakeSource::failing("010-s3", 10, usize::MAX);
        let ora = FakeSource::ok("050-ora", 50, b"payload");
        let http = FakeSource::ok("100-http", 100, b"payload");
        let task = TransferTask {
            key: plain_key("k1", 7),
            path: dir.path().join("k1"),
            candidates: vec![
                candidate(http.clone()),
                candidate(s3.clone()),
                candidate(ora.clone()),
            ],
        };
        let records = engine.run(vec![task], |_| {});
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, ResultStatus::Ok);
        assert_eq!(
            records[0].extra.get("source").and_then(|v| v.as_str()),
            Some("050-ora")
        );
        // S3 was tried first, ORA rescued, HTTP never needed.
        assert_eq!(s3.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(ora.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(http.fetches.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_retry_with_eventual_success() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _cancel) = engine(dir.path(), 3);
        let flaky = FakeSource::failing("200-flaky", 200, 2);
        let task = TransferTask {
            key: plain_key("k2", 7),
            path: dir.path().join("k2"),
            candidates: vec![candidate(flaky.clone())],
        };
        let records = engine.run(vec![task], |_| {});
        assert_eq!(records[0].status, ResultStatus::Ok);
        assert_eq!(flaky.fetches.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_all_sources_failed_after_retries() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _cancel) = engine(dir.path(), 1);
        let dead = FakeSource::failing("300-dead", 300, usize::MAX);
        let task = TransferTask {
            key: plain_key("k3", 7),
            path: dir.path().join("k3"),
            candidates: vec![candidate(dead.clone())],
        };
        let records = engine.run(vec![task], |_| {});
        assert_eq!(records[0].status, ResultStatus::Error);
        // Initial sweep plus one retry.
        assert_eq!(dead.fetches.load(Ordering::SeqCst), 2);
        let report = records[0].error.as_ref().unwrap();
        assert_eq!(report.kind, ErrorKind::Transfer);
    }

    #[test]
    fn test_no_candidates_is_impossible() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _cancel) = engine(dir.path(), 0);
        let task = TransferTask {
            key: plain_key("k4", 7),
            path: dir.path().join("k4"),
            candidates: vec![],
        };
        let records = engine.run(vec![task], |_| {});
        assert_eq!(records[0].status, ResultStatus::Impossible);
    }

    #[test]
    fn test_already_present_is_notneeded() {
        let dir = tempfile::tempdir().unwrap();
        let key = plain_key("k5", 7);
        fs::create_dir_all(dir.path()).unwrap();
        fs::write(dir.path().join(key.as_str()), b"payload").unwrap();
        let (engine, _cancel) = engine(dir.path(), 0);
        let source = FakeSource::ok("100-x", 100, b"payload");
        let task = TransferTask {
            key,
            path: dir.path().join("k5"),
            candidates: vec![candidate(source.clone())],
        };
        let records = engine.run(vec![task], |_| {});
        assert_eq!(records[0].status, ResultStatus::NotNeeded);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_size_mismatch_discards_partial() {
        let dir = tempfile::tempdir().unwrap();
        let sink_dir = dir.path().join("sink");
        let (engine, _cancel) = engine(&sink_dir, 0);
        let short = FakeSource::ok("100-short", 100, b"123");
        let key = plain_key("k6", 999);
        let task = TransferTask {
            key: key.clone(),
            path: dir.path().join("k6"),
            candidates: vec![candidate(short)],
        };
        let records = engine.run(vec![task], |_| {});
        assert_eq!(records[0].status, ResultStatus::Error);
        // Neither the object nor any staging leftover may remain.
        assert!(!sink_dir.join(key.as_str()).exists());
        assert!(!sink_dir.join("transfer").join(key.as_str()).exists());
    }

    #[test]
    fn test_integrity_mismatch_is_reported_and_not_advertised() {
        let dir = tempfile::tempdir().unwrap();
        let sink_dir = dir.path().join("sink");
        let (engine, _cancel) = engine(&sink_dir, 0);
        // Correct size, wrong digest.
        let key = AnnexKey::parse(&format!("SHA256E-s11--{}.dat", "0".repeat(64))).unwrap();
        let source = FakeSource::ok("100-x", 100, b"hello world");
        let task = TransferTask {
            key: key.clone(),
            path: dir.path().join("f"),
            candidates: vec![candidate(source)],
        };
        let records = engine.run(vec![task], |_| {});
        assert_eq!(records[0].status, ResultStatus::Error);
        assert_eq!(
            records[0].error.as_ref().unwrap().kind,
            ErrorKind::IntegrityMismatch
        );
        assert!(!sink_dir.join(key.as_str()).exists());
    }

    #[test]
    fn test_verify_content_accepts_correct_sha256() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c");
        fs::write(&path, b"hello world").unwrap();
        let key = AnnexKey::parse(
            "SHA256E-s11--b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9.dat",
        )
        .unwrap();
        verify_content(&key, &path).unwrap();
    }

    #[test]
    fn test_url_key_without_size_still_transfers() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _cancel) = engine(dir.path(), 0);
        let key = AnnexKey::parse("URL--http&c%%example.com%f").unwrap();
        let source = FakeSource::ok("100-web", 100, b"whatever came back");
        let task = TransferTask {
            key,
            path: dir.path().join("f"),
            candidates: vec![candidate(source)],
        };
        let records = engine.run(vec![task], |_| {});
        assert_eq!(records[0].status, ResultStatus::Ok);
    }

    #[test]
    fn test_cancellation_stops_workers_and_leaves_no_partials() {
        let dir = tempfile::tempdir().unwrap();
        let sink_dir = dir.path().join("sink");
        let options = EngineOptions {
            jobs: 4,
            retries: 0,
            cancel: CancelToken::new(),
        };
        let cancel = options.cancel.clone();
        let engine = TransferEngine::new(Arc::new(DirSink::new(&sink_dir)), options);
        let tasks: Vec<TransferTask> = (0..12)
            .map(|i| {
                let source = Arc::new(FakeSource {
                    content: b"payload".to_vec(),
                    fail_times: AtomicUsize::new(0),
                    cost: 100,
                    label: format!("100-slow-{i}"),
                    fetches: AtomicUsize::new(0),
                    block_until_cancelled: true,
                });
                TransferTask {
                    key: plain_key(&format!("c{i}"), 7),
                    path: dir.path().join(format!("c{i}")),
                    candidates: vec![Candidate {
                        label: source.label.clone(),
                        cost: 100,
                        source,
                    }],
                }
            })
            .collect();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            cancel.cancel();
        });
        let records = engine.run(tasks, |_| {});
        canceller.join().unwrap();
        assert_eq!(records.len(), 12);
        assert!(
            records
                .iter()
                .all(|record| record.status == ResultStatus::Error)
        );
        let leftovers: Vec<_> = fs::read_dir(sink_dir.join("transfer"))
            .map(|entries| entries.filter_map(Result::ok).collect())
            .unwrap_or_default();
        assert!(leftovers.is_empty(), "partial files remained: {leftovers:?}");
    }

    #[test]
    fn test_progress_events_carry_task_and_label() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _cancel) = engine(dir.path(), 0);
        let source = FakeSource::ok("100-x", 100, b"payload");
        let task = TransferTask {
            key: plain_key("p", 7),
            path: dir.path().join("p"),
            candidates: vec![candidate(source)],
        };
        let events: Arc<Mutex<Vec<ProgressEvent>>> = Arc::new(Mutex::new(vec![]));
        let sink = events.clone();
        let records = engine.run(vec![task], move |event| {
            sink.lock().unwrap().push(event);
        });
        assert_eq!(records[0].status, ResultStatus::Ok);
        let events = events.lock().unwrap();
        assert_eq!(
            *events,
            [ProgressEvent {
                task: 0,
                done: 7,
                total: Some(7),
                label: "100-x".into(),
            }]
        );
    }

    #[test]
    fn test_publication_order() {
        let deps: HashMap<&str, Vec<String>> = [
            ("git", vec!["storage".to_string(), "backup".to_string()]),
            ("backup", vec!["storage".to_string()]),
        ]
        .into_iter()
        .collect();
        let depends_of = |name: &str| deps.get(name).cloned().unwrap_or_default();
        assert_eq!(
            publication_order("git", &depends_of),
            ["storage", "backup", "git"]
        );
        // A dependency cycle terminates and keeps each sibling once.
        let cyclic = |name: &str| -> Vec<String> {
            match name {
                "a" => vec!["b".to_string()],
                "b" => vec!["a".to_string()],
                _ => vec![],
            }
        };
        assert_eq!(publication_order("a", &cyclic), ["b", "a"]);
    }

    #[test]
    fn test_jobs_policies() {
        let config = ConfigManager::default();
        assert_eq!(annex_jobs(Jobs::Auto, &config), 1);
        assert_eq!(annex_jobs(Jobs::Count(5), &config), 5);
        let mut config = ConfigManager::default();
        config.add_layer(crate::config::ConfigLayer::parse(
            crate::config::ConfigScope::Local,
            b"[datalad \"runtime\"]\n\tmax-annex-jobs = 6\n",
        ));
        assert_eq!(annex_jobs(Jobs::Auto, &config), 6);
        let cores = core_jobs(Jobs::Auto);
        assert!((3..=8).contains(&cores));
    }
}
