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

//! Structured result records and the bus that processes them.
//!
//! Commands report outcomes as a stream of [`ResultRecord`]s instead of
//! raising: one record per path, dataset, or sibling. The bus is
//! single-threaded at the consumption point; worker threads hand records
//! over a bounded channel. It applies filters, renders records (with a
//! rate limiter collapsing long runs of similar records), fires configured
//! result hooks, enforces the on-failure policy, and keeps the counts that
//! the process exit code is derived from.

use std::collections::HashMap;
use std::io;
use std::io::Write;
use std::path::PathBuf;
use std::sync::mpsc;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::config::ConfigManager;
use crate::error::ErrorReport;

/// Records a worker can queue before it blocks on the bus.
pub const CHANNEL_BOUND: usize = 1024;

/// Consecutive similar records rendered before the limiter elides.
const SIMILAR_LIMIT: usize = 10;

/// Outcome class of one result record.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Ok,
    #[serde(rename = "notneeded")]
    NotNeeded,
    Impossible,
    Error,
}

impl std::fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Ok => "ok",
            Self::NotNeeded => "notneeded",
            Self::Impossible => "impossible",
            Self::Error => "error",
        };
        write!(f, "{name}")
    }
}

/// What kind of object a record is about.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathType {
    Dataset,
    File,
    Directory,
    Key,
    Symlink,
}

/// Message with deferred argument interpolation.
///
/// Keeping template and arguments separate lets renderers group records
/// that differ only in their arguments.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub template: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

impl Message {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            template: text.into(),
            args: vec![],
        }
    }

    pub fn templated(template: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            template: template.into(),
            args,
        }
    }

    /// Replaces each `{}` in the template with the next argument.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let mut rest = self.template.as_str();
        let mut args = self.args.iter();
        while let Some(pos) = rest.find("{}") {
            out.push_str(&rest[..pos]);
            match args.next() {
                Some(arg) => out.push_str(arg),
                None => out.push_str("{}"),
            }
            rest = &rest[pos + 2..];
        }
        out.push_str(rest);
        out
    }
}

/// One unit of outcome reported by a command.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResultRecord {
    pub action: String,
    pub status: ResultStatus,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub path: Option<PathBuf>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none", default)]
    pub kind: Option<PathType>,
    pub message: Message,
    /// Root of the dataset the record pertains to.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub dataset: Option<PathBuf>,
    /// Sibling name, for records about remotes.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sibling: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<ErrorReport>,
    /// Action-specific fields (byte counts, keys, and the like).
    #[serde(flatten, default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ResultRecord {
    pub fn new(action: impl Into<String>, status: ResultStatus, message: Message) -> Self {
        Self {
            action: action.into(),
            status,
            path: None,
            kind: None,
            message,
            dataset: None,
            sibling: None,
            error: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn ok(action: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(action, ResultStatus::Ok, Message::plain(message))
    }

    pub fn error(
        action: impl Into<String>,
        message: impl Into<String>,
        report: ErrorReport,
    ) -> Self {
        let mut record = Self::new(action, ResultStatus::Error, Message::plain(message));
        record.error = Some(report);
        record
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>, kind: PathType) -> Self {
        self.path = Some(path.into());
        self.kind = Some(kind);
        self
    }

    pub fn with_dataset(mut self, root: impl Into<PathBuf>) -> Self {
        self.dataset = Some(root.into());
        self
    }

    pub fn with_sibling(mut self, name: impl Into<String>) -> Self {
        self.sibling = Some(name.into());
        self
    }

    pub fn with_extra(mut self, name: &str, value: impl Into<serde_json::Value>) -> Self {
        self.extra.insert(name.to_string(), value.into());
        self
    }
}

/// Reaction of the bus to an error record.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum OnFailure {
    /// Keep going; the summary still reflects the failure.
    #[default]
    Continue,
    /// Halt after the offending record.
    Stop,
    /// Suppress rendering; internal accounting still happens.
    Ignore,
}

/// Record filters corresponding to report-status/report-type/path options.
#[derive(Clone, Debug, Default)]
pub struct ResultFilter {
    pub statuses: Option<Vec<ResultStatus>>,
    pub types: Option<Vec<PathType>>,
    pub path_prefixes: Option<Vec<PathBuf>>,
}

impl ResultFilter {
    pub fn matches(&self, record: &ResultRecord) -> bool {
        if let Some(statuses) = &self.statuses
            && !statuses.contains(&record.status)
        {
            return false;
        }
        if let Some(types) = &self.types
            && !record.kind.is_some_and(|kind| types.contains(&kind))
        {
            return false;
        }
        if let Some(prefixes) = &self.path_prefixes {
            let Some(path) = &record.path else {
                return false;
            };
            if !prefixes.iter().any(|prefix| path.starts_with(prefix)) {
                return false;
            }
        }
        true
    }
}

/// Renders records to an output stream.
pub trait Renderer: Send {
    fn render(&mut self, record: &ResultRecord, out: &mut dyn Write) -> io::Result<()>;
    /// Flushes any pending state (e.g. an open suppression streak).
    fn finish(&mut self, out: &mut dyn Write) -> io::Result<()> {
        let _ = out;
        Ok(())
    }
}

/// One line per record, eliding long runs of similar records.
///
/// Records are "similar" when action, status, and dataset agree. After
/// ten consecutive similar records the rest of the run is suppressed and a
/// single summary line is emitted when the run ends.
#[derive(Default)]
pub struct GenericRenderer {
    streak_key: Option<(String, ResultStatus, Option<PathBuf>)>,
    streak_len: usize,
    suppressed: usize,
}

impl GenericRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    fn flush_suppressed(&mut self, out: &mut dyn Write) -> io::Result<()> {
        if self.suppressed > 0 {
            writeln!(out, "  [{} similar message(s) suppressed]", self.suppressed)?;
            self.suppressed = 0;
        }
        Ok(())
    }
}

impl Renderer for GenericRenderer {
    fn render(&mut self, record: &ResultRecord, out: &mut dyn Write) -> io::Result<()> {
        let key = (
            record.action.clone(),
            record.status,
            record.dataset.clone(),
        );
        if self.streak_key.as_ref() == Some(&key) {
            self.streak_len += 1;
        } else {
            self.flush_suppressed(out)?;
            self.streak_key = Some(key);
            self.streak_len = 1;
        }
        if self.streak_len >= SIMILAR_LIMIT {
            self.suppressed += 1;
            return Ok(());
        }
        let mut line = format!("{}({})", record.action, record.status);
        if let Some(path) = &record.path {
            line.push_str(&format!(": {}", path.display()));
        }
        let message = record.message.render();
        if !message.is_empty() {
            line.push_str(&format!(" [{message}]"));
        }
        if let Some(error) = &record.error {
            line.push_str(&format!(" <{}>", error.render_short()));
        }
        writeln!(out, "{line}")
    }

    fn finish(&mut self, out: &mut dyn Write) -> io::Result<()> {
        self.flush_suppressed(out)
    }
}

/// Per-command registry of tailored renderers with a generic fallback.
#[derive(Default)]
pub struct RendererRegistry {
    tailored: HashMap<String, fn() -> Box<dyn Renderer>>,
}

impl RendererRegistry {
    pub fn register(&mut self, command: impl Into<String>, make: fn() -> Box<dyn Renderer>) {
        self.tailored.insert(command.into(), make);
    }

    pub fn for_command(&self, command: &str) -> Box<dyn Renderer> {
        match self.tailored.get(command) {
            Some(make) => make(),
            None => Box::new(GenericRenderer::new()),
        }
    }
}

/// A configured result hook: a matcher over record fields paired with a
/// command template to run on match.
#[derive(Clone, Debug, PartialEq)]
pub struct ResultHook {
    pub name: String,
    pub matcher: serde_json::Map<String, serde_json::Value>,
    pub action: String,
}

impl ResultHook {
    /// Equality match per field; an array value means set membership.
    pub fn matches(&self, record: &ResultRecord) -> bool {
        let record_value =
            serde_json::to_value(record).expect("result records serialize infallibly");
        self.matcher.iter().all(|(field, wanted)| {
            let Some(actual) = record_value.get(field) else {
                return false;
            };
            match wanted {
                serde_json::Value::Array(choices) => choices.contains(actual),
                single => actual == single,
            }
        })
    }

    /// Substitutes `{field}` placeholders in the action template with the
    /// record's field values.
    pub fn render_action(&self, record: &ResultRecord) -> String {
        let record_value =
            serde_json::to_value(record).expect("result records serialize infallibly");
        let mut out = String::new();
        let mut rest = self.action.as_str();
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            match after.find('}') {
                Some(close) => {
                    let field = &after[..close];
                    match record_value.get(field) {
                        Some(serde_json::Value::String(s)) => out.push_str(s),
                        Some(other) => out.push_str(&other.to_string()),
                        None => {
                            out.push('{');
                            out.push_str(field);
                            out.push('}');
                        }
                    }
                    rest = &after[close + 1..];
                }
                None => {
                    out.push('{');
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        out
    }
}

/// Reads `datalad.result-hook.<name>.match` / `.action` pairs.
pub fn hooks_from_config(config: &ConfigManager) -> Vec<ResultHook> {
    let mut names = vec![];
    for key in config.keys_with_prefix("datalad.result-hook.") {
        if let Some(name) = key
            .strip_prefix("datalad.result-hook.")
            .and_then(|rest| rest.strip_suffix(".match"))
            && !names.contains(&name.to_string())
        {
            names.push(name.to_string());
        }
    }
    names
        .into_iter()
        .filter_map(|name| {
            let matcher = config.get(&format!("datalad.result-hook.{name}.match"))?;
            let action = config.get(&format!("datalad.result-hook.{name}.action"))?;
            let matcher: serde_json::Map<String, serde_json::Value> =
                match serde_json::from_str(matcher) {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        tracing::warn!(hook = %name, ?err, "ignoring hook with malformed matcher");
                        return None;
                    }
                };
            Some(ResultHook {
                name,
                matcher,
                action: action.to_string(),
            })
        })
        .collect()
}

/// The bus halted because of the on-failure policy.
#[derive(Debug, Error)]
#[error("Halted on error record from action {action:?}")]
pub struct BusHalt {
    pub action: String,
    pub record: Box<ResultRecord>,
}

/// Tallies per status, the source of the process exit code.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Summary {
    counts: HashMap<ResultStatus, usize>,
}

impl Summary {
    pub fn count(&self, status: ResultStatus) -> usize {
        self.counts.get(&status).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }
}

/// Maps a finished command's summary to a process exit code.
///
/// Any error record makes the overall invocation fail. The code is
/// distinct from exit codes of child processes a command ran; those travel
/// inside the records.
pub fn exit_code(summary: &Summary) -> i32 {
    if summary.count(ResultStatus::Error) > 0 {
        1
    } else {
        0
    }
}

/// Consumes result records: filter, render, hooks, failure policy.
pub struct ResultBus<'a> {
    on_failure: OnFailure,
    filter: ResultFilter,
    renderer: Box<dyn Renderer>,
    out: Box<dyn Write + Send + 'a>,
    hooks: Vec<ResultHook>,
    hook_runner: Option<Box<dyn FnMut(&ResultHook, &ResultRecord) + Send + 'a>>,
    summary: Summary,
}

impl<'a> ResultBus<'a> {
    pub fn new(out: impl Write + Send + 'a) -> Self {
        Self {
            on_failure: OnFailure::default(),
            filter: ResultFilter::default(),
            renderer: Box::new(GenericRenderer::new()),
            out: Box::new(out),
            hooks: vec![],
            hook_runner: None,
            summary: Summary::default(),
        }
    }

    pub fn on_failure(mut self, policy: OnFailure) -> Self {
        self.on_failure = policy;
        self
    }

    pub fn filter(mut self, filter: ResultFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn renderer(mut self, renderer: Box<dyn Renderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn hooks(
        mut self,
        hooks: Vec<ResultHook>,
        runner: impl FnMut(&ResultHook, &ResultRecord) + Send + 'a,
    ) -> Self {
        self.hooks = hooks;
        self.hook_runner = Some(Box::new(runner));
        self
    }

    /// Bounded channel pair for worker threads feeding this bus.
    pub fn channel() -> (
        mpsc::SyncSender<ResultRecord>,
        mpsc::Receiver<ResultRecord>,
    ) {
        mpsc::sync_channel(CHANNEL_BOUND)
    }

    /// Processes one record.
    pub fn handle(&mut self, record: ResultRecord) -> Result<(), BusHalt> {
        *self.summary.counts.entry(record.status).or_default() += 1;

        for hook in &self.hooks {
            if hook.matches(&record)
                && let Some(runner) = &mut self.hook_runner
            {
                runner(hook, &record);
            }
        }

        let render = self.filter.matches(&record)
            && !(record.status == ResultStatus::Error && self.on_failure == OnFailure::Ignore);
        if render && let Err(err) = self.renderer.render(&record, &mut self.out) {
            tracing::warn!(?err, "failed to render result record");
        }

        if record.status == ResultStatus::Error && self.on_failure == OnFailure::Stop {
            return Err(BusHalt {
                action: record.action.clone(),
                record: Box::new(record),
            });
        }
        Ok(())
    }

    /// Drains a channel until all senders hang up or the policy halts.
    pub fn pump(&mut self, rx: &mpsc::Receiver<ResultRecord>) -> Result<(), BusHalt> {
        for record in rx.iter() {
            self.handle(record)?;
        }
        Ok(())
    }

    /// Flushes the renderer and returns the tallies.
    pub fn finish(mut self) -> Summary {
        if let Err(err) = self.renderer.finish(&mut self.out) {
            tracing::warn!(?err, "failed to flush renderer");
        }
        self.summary
    }

    pub fn summary(&self) -> &Summary {
        &self.summary
    }
}

/// Color policy for rendered output.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ColorWhen {
    #[default]
    Auto,
    Always,
    Never,
}

impl ColorWhen {
    pub fn from_config(config: &ConfigManager) -> Self {
        match config.get("datalad.ui.color") {
            Some("always") => Self::Always,
            Some("never") => Self::Never,
            _ => Self::Auto,
        }
    }

    /// `auto` colors only a TTY, and `NO_COLOR` wins over it.
    pub fn enabled(self, stdout_is_tty: bool, no_color_env: bool) -> bool {
        match self {
            Self::Always => true,
            Self::Never => false,
            Self::Auto => stdout_is_tty && !no_color_env,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Mutex;

    use assert_matches::assert_matches;

    use crate::config::ConfigLayer;
    use crate::config::ConfigScope;
    use crate::error::ErrorKind;

    use super::*;

    fn record(action: &str, status: ResultStatus) -> ResultRecord {
        ResultRecord::new(action, status, Message::plain("done"))
    }

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    #[test]
    fn test_message_render() {
        let message = Message::templated("copied {} to {}", vec!["a".into(), "b".into()]);
        assert_eq!(message.render(), "copied a to b");
        assert_eq!(Message::plain("x").render(), "x");
        // Missing arguments leave the placeholder visible.
        assert_eq!(Message::templated("{} {}", vec!["a".into()]).render(), "a {}");
    }

    #[test]
    fn test_bus_counts_and_exit_code() {
        let buf = SharedBuf::default();
        let mut bus = ResultBus::new(buf.clone());
        bus.handle(record("get", ResultStatus::Ok)).unwrap();
        bus.handle(record("get", ResultStatus::NotNeeded)).unwrap();
        bus.handle(record("get", ResultStatus::Error)).unwrap();
        let summary = bus.finish();
        assert_eq!(summary.count(ResultStatus::Ok), 1);
        assert_eq!(summary.count(ResultStatus::Error), 1);
        assert_eq!(exit_code(&summary), 1);
        assert_eq!(exit_code(&Summary::default()), 0);
    }

    #[test]
    fn test_on_failure_stop_halts() {
        let buf = SharedBuf::default();
        let mut bus = ResultBus::new(buf.clone()).on_failure(OnFailure::Stop);
        bus.handle(record("save", ResultStatus::Ok)).unwrap();
        assert_matches!(bus.handle(record("save", ResultStatus::Error)), Err(BusHalt { .. }));
    }

    #[test]
    fn test_on_failure_ignore_suppresses_rendering_not_counting() {
        let buf = SharedBuf::default();
        let mut bus = ResultBus::new(buf.clone()).on_failure(OnFailure::Ignore);
        bus.handle(record("drop", ResultStatus::Error)).unwrap();
        let summary = bus.finish();
        assert_eq!(summary.count(ResultStatus::Error), 1);
        assert_eq!(buf.text(), "");
    }

    #[test]
    fn test_rate_limiter_elides_similar_runs() {
        let buf = SharedBuf::default();
        let mut bus = ResultBus::new(buf.clone());
        for _ in 0..25 {
            bus.handle(
                record("get", ResultStatus::Ok).with_dataset("/ds"),
            )
            .unwrap();
        }
        bus.handle(record("save", ResultStatus::Ok)).unwrap();
        let text = bus.finish();
        let rendered = buf.text();
        let get_lines = rendered.lines().filter(|l| l.starts_with("get(ok)")).count();
        assert_eq!(get_lines, SIMILAR_LIMIT - 1);
        assert!(rendered.contains("[16 similar message(s) suppressed]"));
        assert!(rendered.contains("save(ok)"));
        assert_eq!(text.count(ResultStatus::Ok), 26);
    }

    #[test]
    fn test_filter_by_status_and_path() {
        let filter = ResultFilter {
            statuses: Some(vec![ResultStatus::Error]),
            types: None,
            path_prefixes: Some(vec![PathBuf::from("/data")]),
        };
        let mut matching =
            record("get", ResultStatus::Error).with_path("/data/x", PathType::File);
        assert!(filter.matches(&matching));
        matching.status = ResultStatus::Ok;
        assert!(!filter.matches(&matching));
        let elsewhere = record("get", ResultStatus::Error).with_path("/tmp/x", PathType::File);
        assert!(!filter.matches(&elsewhere));
    }

    #[test]
    fn test_hook_matching_and_action_rendering() {
        let hook = ResultHook {
            name: "annoy".into(),
            matcher: serde_json::from_str(r#"{"action": "get", "status": ["error", "impossible"]}"#)
                .unwrap(),
            action: "unlock {path} in {status}".into(),
        };
        let hit = record("get", ResultStatus::Error).with_path("/d/f", PathType::File);
        let miss = record("get", ResultStatus::Ok).with_path("/d/f", PathType::File);
        assert!(hook.matches(&hit));
        assert!(!hook.matches(&miss));
        assert_eq!(hook.render_action(&hit), "unlock /d/f in error");
    }

    #[test]
    fn test_hooks_from_config_and_dispatch() {
        let mut config = ConfigManager::default();
        config.add_layer(ConfigLayer::parse(
            ConfigScope::Local,
            br#"[datalad "result-hook.retry"]
    match = "{\"status\": \"error\"}"
    action = "get {path}"
"#,
        ));
        let hooks = hooks_from_config(&config);
        assert_eq!(hooks.len(), 1);
        assert_eq!(hooks[0].name, "retry");

        let fired = Arc::new(Mutex::new(vec![]));
        let fired_in = fired.clone();
        let buf = SharedBuf::default();
        let mut bus = ResultBus::new(buf.clone()).hooks(hooks, move |hook, record| {
            fired_in
                .lock()
                .unwrap()
                .push(hook.render_action(record));
        });
        bus.handle(record("get", ResultStatus::Ok)).unwrap();
        bus.handle(
            record("get", ResultStatus::Error).with_path("/d/f", PathType::File),
        )
        .unwrap();
        assert_eq!(*fired.lock().unwrap(), vec!["get /d/f".to_string()]);
    }

    #[test]
    fn test_channel_pump() {
        let (tx, rx) = ResultBus::channel();
        let worker = std::thread::spawn(move || {
            for _ in 0..5 {
                tx.send(record("get", ResultStatus::Ok)).unwrap();
            }
        });
        let buf = SharedBuf::default();
        let mut bus = ResultBus::new(buf.clone());
        worker.join().unwrap();
        bus.pump(&rx).unwrap();
        assert_eq!(bus.summary().count(ResultStatus::Ok), 5);
    }

    #[test]
    fn test_color_policy() {
        assert!(ColorWhen::Always.enabled(false, true));
        assert!(!ColorWhen::Never.enabled(true, false));
        assert!(ColorWhen::Auto.enabled(true, false));
        assert!(!ColorWhen::Auto.enabled(true, true));
        assert!(!ColorWhen::Auto.enabled(false, false));
    }

    #[test]
    fn test_record_serialization_shape() {
        let rec = record("get", ResultStatus::Error)
            .with_path("/d/f", PathType::File)
            .with_extra("bytes", 42)
            .with_sibling("origin");
        let mut rec = rec;
        rec.error = Some(ErrorReport::new(ErrorKind::Transfer, "boom"));
        let value = serde_json::to_value(&rec).unwrap();
        assert_eq!(value["action"], "get");
        assert_eq!(value["status"], "error");
        assert_eq!(value["type"], "file");
        assert_eq!(value["bytes"], 42);
        assert_eq!(value["error"]["kind"], "transfer");
    }
}
