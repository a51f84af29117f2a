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

//! Layered configuration with scope precedence.
//!
//! Configuration is a stack of layers sorted by [`ConfigScope`], the lowest
//! precedence first: system file, user file, committed dataset-branch file
//! (`.datalad/config`), uncommitted dataset-local file (`.git/config`),
//! mapped environment variables, and finally explicit process overrides.
//! File-backed scopes hold git-config syntax because those files are shared
//! with the external VCS; a tolerant subset parser lives here so lookups
//! and writes do not need a subprocess round-trip. Writes go to one
//! explicit scope, guarded by a cross-process advisory lock on the scope
//! file, and reloads are detected by an (mtime, size) fingerprint.

use std::collections::hash_map::DefaultHasher;
use std::env;
use std::fs;
use std::hash::Hash as _;
use std::hash::Hasher as _;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::SystemTime;

use bstr::BString;
use bstr::ByteSlice as _;
use thiserror::Error;

use crate::file_util::IoResultExt as _;
use crate::file_util::PathError;
use crate::file_util::write_atomic;
use crate::lock;
use crate::lock::LockError;

/// Environment variable holding a JSON object of config overrides, for keys
/// whose characters cannot be expressed in an environment variable name.
pub const OVERRIDES_JSON_VAR: &str = "DATALAD_CONFIG_OVERRIDES_JSON";

const WRITE_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// Source of configuration variables in order of precedence.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ConfigScope {
    /// System-wide configuration file (lowest precedence).
    System,
    /// Per-user configuration file.
    User,
    /// Dataset configuration committed on the branch (`.datalad/config`).
    Branch,
    /// Uncommitted dataset-local configuration (`.git/config`).
    Local,
    /// Mapped environment variables.
    Env,
    /// Process-level overrides (highest precedence).
    Override,
}

impl std::fmt::Display for ConfigScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::System => "system",
            Self::User => "user",
            Self::Branch => "branch",
            Self::Local => "local",
            Self::Env => "env",
            Self::Override => "override",
        };
        write!(f, "{name}")
    }
}

/// Error reading, coercing, or writing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid {wanted} value {value:?} for {name}")]
    Type {
        name: String,
        value: String,
        wanted: &'static str,
    },
    #[error("Cannot write to scope {scope}: {reason}")]
    UnwritableScope { scope: ConfigScope, reason: String },
    #[error("Malformed {OVERRIDES_JSON_VAR}: {0}")]
    OverridesJson(#[source] serde_json::Error),
    #[error(transparent)]
    Read(#[from] PathError),
    #[error(transparent)]
    Lock(#[from] LockError),
}

/// (mtime, size) pair used to detect stale file-backed layers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FileFingerprint {
    mtime: Option<SystemTime>,
    size: u64,
}

impl FileFingerprint {
    fn of(path: &Path) -> Option<Self> {
        let meta = fs::metadata(path).ok()?;
        Some(Self {
            mtime: meta.modified().ok(),
            size: meta.len(),
        })
    }
}

/// One configuration layer: ordered multi-valued entries of one scope.
///
/// An entry value of `None` means the key was set without a value, which
/// git-config semantics interpret as boolean true.
#[derive(Clone, Debug)]
pub struct ConfigLayer {
    pub scope: ConfigScope,
    pub path: Option<PathBuf>,
    fingerprint: Option<FileFingerprint>,
    entries: Vec<(String, Option<String>)>,
}

impl ConfigLayer {
    pub fn empty(scope: ConfigScope) -> Self {
        Self {
            scope,
            path: None,
            fingerprint: None,
            entries: vec![],
        }
    }

    /// Parses git-config text into a layer.
    pub fn parse(scope: ConfigScope, text: &[u8]) -> Self {
        let file = GitConfigFile::parse(text);
        Self {
            scope,
            path: None,
            fingerprint: None,
            entries: file.entries().collect(),
        }
    }

    fn load_from_file(scope: ConfigScope, path: PathBuf) -> Result<Self, PathError> {
        let fingerprint = FileFingerprint::of(&path);
        let text = match fs::read(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => vec![],
            Err(err) => {
                return Err(PathError { path, source: err });
            }
        };
        let mut layer = Self::parse(scope, &text);
        layer.path = Some(path);
        layer.fingerprint = fingerprint;
        Ok(layer)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((key.into(), Some(value.into())));
    }
}

/// Stack of configuration layers with precedence-ordered lookup.
#[derive(Clone, Debug, Default)]
pub struct ConfigManager {
    /// Layers sorted by scope, the lowest precedence one first.
    layers: Vec<ConfigLayer>,
    /// Root of the dataset the Branch/Local scopes belong to, if any.
    dataset_root: Option<PathBuf>,
}

/// Assembles a [`ConfigManager`] from explicit sources.
///
/// Defaults resolve the usual file locations; tests inject temp files.
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    system_file: Option<PathBuf>,
    user_file: Option<PathBuf>,
    dataset_root: Option<PathBuf>,
    branch_blob: Option<Vec<u8>>,
    env_vars: Option<Vec<(String, String)>>,
    cli_overrides: Vec<(String, String)>,
}

impl ConfigBuilder {
    pub fn system_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.system_file = Some(path.into());
        self
    }

    pub fn user_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.user_file = Some(path.into());
        self
    }

    /// Attaches a dataset so its Branch and Local scopes are loaded.
    pub fn dataset_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.dataset_root = Some(root.into());
        self
    }

    /// Supplies `.datalad/config` content read from a committed blob, for
    /// repositories without a working tree.
    pub fn branch_blob(mut self, blob: Vec<u8>) -> Self {
        self.branch_blob = Some(blob);
        self
    }

    /// Replaces the process environment (used by tests).
    pub fn env_vars(mut self, vars: Vec<(String, String)>) -> Self {
        self.env_vars = Some(vars);
        self
    }

    /// Adds a `-c key=value` style override.
    pub fn cli_override(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.cli_overrides.push((key.into(), value.into()));
        self
    }

    pub fn load(self) -> Result<ConfigManager, ConfigError> {
        let mut manager = ConfigManager {
            layers: vec![],
            dataset_root: self.dataset_root.clone(),
        };

        let system_file = self
            .system_file
            .or_else(|| cfg!(unix).then(|| PathBuf::from("/etc/gitconfig")));
        if let Some(path) = system_file {
            manager.add_layer(ConfigLayer::load_from_file(ConfigScope::System, path)?);
        }
        let user_file = self
            .user_file
            .or_else(|| env::var_os("HOME").map(|home| PathBuf::from(home).join(".gitconfig")));
        if let Some(path) = user_file {
            manager.add_layer(ConfigLayer::load_from_file(ConfigScope::User, path)?);
        }
        if let Some(root) = &self.dataset_root {
            manager.add_layer(ConfigLayer::load_from_file(
                ConfigScope::Branch,
                root.join(".datalad").join("config"),
            )?);
            manager.add_layer(ConfigLayer::load_from_file(
                ConfigScope::Local,
                root.join(".git").join("config"),
            )?);
        } else if let Some(blob) = self.branch_blob {
            manager.add_layer(ConfigLayer::parse(ConfigScope::Branch, &blob));
        }

        let env_vars: Vec<(String, String)> =
            self.env_vars.unwrap_or_else(|| env::vars().collect());
        manager.add_layer(env_layer(&env_vars)?);

        let mut overrides = ConfigLayer::empty(ConfigScope::Override);
        for (key, value) in self.cli_overrides {
            overrides.push(key, value);
        }
        manager.add_layer(overrides);
        Ok(manager)
    }
}

/// Maps `DATALAD_SECTION_SUB__KEY` to `datalad.section.sub-key`.
///
/// A double underscore becomes a hyphen, single underscores become dots,
/// and the result is lowercased.
pub fn env_name_to_key(name: &str) -> Option<String> {
    let rest = name.strip_prefix("DATALAD_")?;
    if rest.is_empty() || name == OVERRIDES_JSON_VAR {
        return None;
    }
    // Placeholder byte keeps "__" from being split by the "_" pass.
    let mapped = rest
        .replace("__", "\u{0}")
        .replace('_', ".")
        .replace('\u{0}', "-");
    Some(format!("datalad.{}", mapped.to_lowercase()))
}

fn env_layer(vars: &[(String, String)]) -> Result<ConfigLayer, ConfigError> {
    let mut layer = ConfigLayer::empty(ConfigScope::Env);
    let mut mapped: Vec<(String, String)> = vars
        .iter()
        .filter_map(|(name, value)| env_name_to_key(name).map(|key| (key, value.clone())))
        .collect();
    mapped.sort();
    for (key, value) in mapped {
        layer.push(key, value);
    }
    if let Some((_, blob)) = vars.iter().find(|(name, _)| name == OVERRIDES_JSON_VAR) {
        let parsed: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(blob).map_err(ConfigError::OverridesJson)?;
        for (key, value) in parsed {
            match value {
                serde_json::Value::Array(items) => {
                    for item in items {
                        layer.push(&key, json_scalar_to_string(&item));
                    }
                }
                other => layer.push(&key, json_scalar_to_string(&other)),
            }
        }
    }
    Ok(layer)
}

fn json_scalar_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl ConfigManager {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Loads configuration for the dataset rooted at `root` with default
    /// system/user locations.
    pub fn for_dataset(root: &Path) -> Result<Self, ConfigError> {
        Self::builder().dataset_root(root).load()
    }

    /// Inserts a layer at the position determined by its scope.
    pub fn add_layer(&mut self, layer: ConfigLayer) {
        // Search from the end; layers are usually added in order.
        let skip = self
            .layers
            .iter()
            .rev()
            .take_while(|l| l.scope > layer.scope)
            .count();
        let index = self.layers.len() - skip;
        self.layers.insert(index, layer);
    }

    /// Layers sorted by precedence, lowest first.
    pub fn layers(&self) -> &[ConfigLayer] {
        &self.layers
    }

    /// Returns the highest-precedence value for `key`.
    ///
    /// A key set without a value reports the empty string. Within one
    /// layer the last occurrence wins, matching the file semantics of the
    /// external VCS.
    pub fn get(&self, key: &str) -> Option<&str> {
        let key = normalize_key(key);
        for layer in self.layers.iter().rev() {
            if let Some((_, value)) = layer.entries.iter().rev().find(|(k, _)| *k == key) {
                return Some(value.as_deref().unwrap_or(""));
            }
        }
        None
    }

    /// Returns all values for `key`, lowest-precedence first.
    pub fn get_all(&self, key: &str) -> Vec<&str> {
        let key = normalize_key(key);
        self.layers
            .iter()
            .flat_map(|layer| layer.entries.iter())
            .filter(|(k, _)| *k == key)
            .map(|(_, value)| value.as_deref().unwrap_or(""))
            .collect()
    }

    /// Coerces the value to bool with git-config semantics.
    ///
    /// A key set without a value is true; malformed text is an explicit
    /// error, never a silent default.
    pub fn get_bool(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        let Some(value) = self.get(key) else {
            return Ok(None);
        };
        parse_bool(value)
            .map(Some)
            .ok_or_else(|| self.type_error(key, value, "boolean"))
    }

    pub fn get_int(&self, key: &str) -> Result<Option<i64>, ConfigError> {
        let Some(value) = self.get(key) else {
            return Ok(None);
        };
        parse_int(value)
            .map(Some)
            .ok_or_else(|| self.type_error(key, value, "integer"))
    }

    pub fn get_float(&self, key: &str) -> Result<Option<f64>, ConfigError> {
        let Some(value) = self.get(key) else {
            return Ok(None);
        };
        value
            .trim()
            .parse()
            .ok()
            .map(Some)
            .ok_or_else(|| self.type_error(key, value, "float"))
    }

    fn type_error(&self, key: &str, value: &str, wanted: &'static str) -> ConfigError {
        ConfigError::Type {
            name: key.to_string(),
            value: value.to_string(),
            wanted,
        }
    }

    /// Writes `key = value` to the given scope.
    ///
    /// File-backed scopes take a cross-process lock, rewrite the file
    /// atomically, and refresh the in-memory layer. Writing to the Branch
    /// scope stages `.datalad/config` content for commit by the caller.
    pub fn set(&mut self, key: &str, value: &str, scope: ConfigScope) -> Result<(), ConfigError> {
        self.update_scope(key, scope, Some(value))
    }

    /// Removes all values of `key` from the given scope.
    pub fn unset(&mut self, key: &str, scope: ConfigScope) -> Result<(), ConfigError> {
        self.update_scope(key, scope, None)
    }

    fn update_scope(
        &mut self,
        key: &str,
        scope: ConfigScope,
        value: Option<&str>,
    ) -> Result<(), ConfigError> {
        let key = normalize_key(key);
        match scope {
            ConfigScope::Env => Err(ConfigError::UnwritableScope {
                scope,
                reason: "environment variables cannot be written back".into(),
            }),
            ConfigScope::Override => {
                let layer = self.layer_mut(scope);
                layer.entries.retain(|(k, _)| *k != key);
                if let Some(value) = value {
                    layer.push(key, value);
                }
                Ok(())
            }
            _ => {
                let path =
                    self.scope_file(scope)
                        .ok_or_else(|| ConfigError::UnwritableScope {
                            scope,
                            reason: "no file location known for this scope".into(),
                        })?;
                let _guard = lock::acquire(
                    &self.lock_path_for(&path),
                    WRITE_LOCK_TIMEOUT,
                    Some(Duration::from_secs(600)),
                )?;
                let text = match fs::read(&path) {
                    Ok(text) => text,
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => vec![],
                    Err(err) => {
                        return Err(ConfigError::Read(PathError { path, source: err }));
                    }
                };
                let mut file = GitConfigFile::parse(&text);
                match value {
                    Some(value) => file.set(&key, value),
                    None => file.unset_all(&key),
                }
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).context(parent)?;
                }
                write_atomic(&path, &file.to_bytes())?;
                let refreshed = ConfigLayer::load_from_file(scope, path)?;
                *self.layer_mut(scope) = refreshed;
                Ok(())
            }
        }
    }

    fn layer_mut(&mut self, scope: ConfigScope) -> &mut ConfigLayer {
        if let Some(index) = self.layers.iter().position(|l| l.scope == scope) {
            return &mut self.layers[index];
        }
        self.add_layer(ConfigLayer::empty(scope));
        self.layers
            .iter_mut()
            .find(|l| l.scope == scope)
            .expect("layer was just inserted")
    }

    fn scope_file(&self, scope: ConfigScope) -> Option<PathBuf> {
        match scope {
            ConfigScope::Branch => Some(self.dataset_root.as_ref()?.join(".datalad/config")),
            ConfigScope::Local => Some(self.dataset_root.as_ref()?.join(".git/config")),
            _ => self
                .layers
                .iter()
                .find(|l| l.scope == scope)
                .and_then(|l| l.path.clone()),
        }
    }

    /// Directory holding config write locks (`datalad.locations.locks`).
    fn lock_dir(&self) -> PathBuf {
        if let Some(dir) = self.get("datalad.locations.locks") {
            return PathBuf::from(dir);
        }
        match &self.dataset_root {
            Some(root) => root.join(".git").join("datalad").join("locks"),
            None => env::temp_dir().join("datalad-locks"),
        }
    }

    fn lock_path_for(&self, scope_file: &Path) -> PathBuf {
        let dir = self.lock_dir();
        let _ = fs::create_dir_all(&dir);
        let mut hasher = DefaultHasher::new();
        scope_file.hash(&mut hasher);
        let name = scope_file
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("config");
        dir.join(format!("{name}-{:016x}.lck", hasher.finish()))
    }

    /// All distinct keys starting with `prefix`, in first-seen order
    /// across layers from lowest to highest precedence.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut seen = vec![];
        for layer in &self.layers {
            for (key, _) in &layer.entries {
                if key.starts_with(prefix) && !seen.contains(key) {
                    seen.push(key.clone());
                }
            }
        }
        seen
    }

    /// Reloads file-backed layers whose on-disk fingerprint changed.
    ///
    /// After a writer released its lock, readers calling this observe the
    /// written value.
    pub fn reload(&mut self) -> Result<(), ConfigError> {
        for index in 0..self.layers.len() {
            let Some(path) = self.layers[index].path.clone() else {
                continue;
            };
            let current = FileFingerprint::of(&path);
            if current != self.layers[index].fingerprint {
                tracing::debug!(?path, "config layer changed on disk; reloading");
                self.layers[index] = ConfigLayer::load_from_file(self.layers[index].scope, path)?;
            }
        }
        Ok(())
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    // A key without a value means true in git-config syntax.
    if value.is_empty() {
        return Some(true);
    }
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

fn parse_int(value: &str) -> Option<i64> {
    let value = value.trim();
    let (digits, scale) = match value.as_bytes().last()? {
        b'k' | b'K' => (&value[..value.len() - 1], 1024i64),
        b'm' | b'M' => (&value[..value.len() - 1], 1024 * 1024),
        b'g' | b'G' => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        _ => (value, 1),
    };
    digits.parse::<i64>().ok()?.checked_mul(scale)
}

/// Normalizes a dotted key: section and final key lowercased, any middle
/// subsection kept verbatim (git-config case rules).
pub fn normalize_key(key: &str) -> String {
    let Some((section, rest)) = key.split_once('.') else {
        return key.to_lowercase();
    };
    match rest.rsplit_once('.') {
        Some((middle, name)) => format!(
            "{}.{}.{}",
            section.to_lowercase(),
            middle,
            name.to_lowercase()
        ),
        None => format!("{}.{}", section.to_lowercase(), rest.to_lowercase()),
    }
}

/// One physical line of a git-config file.
#[derive(Clone, Debug)]
enum FileLine {
    /// `[section]` or `[section "subsection"]`.
    Section {
        raw: BString,
        section: String,
        subsection: Option<String>,
    },
    /// `key = value`, or a bare `key`.
    Entry {
        raw: BString,
        key: String,
        value: Option<String>,
    },
    /// Blank line, comment, or anything the subset parser passed over.
    Other(BString),
}

/// Minimal git-config document model preserving unrelated lines verbatim.
///
/// The parser covers the subset the external VCS writes into dataset
/// configuration: section headers with optional quoted subsections,
/// `key = value` entries with quote/backslash escapes and trailing
/// comments, and bare boolean keys. Unrecognized lines are carried through
/// untouched so a rewrite never destroys what it does not understand.
#[derive(Clone, Debug, Default)]
pub struct GitConfigFile {
    lines: Vec<FileLine>,
}

impl GitConfigFile {
    pub fn parse(text: &[u8]) -> Self {
        let mut lines = vec![];
        let mut current_section: Option<(String, Option<String>)> = None;
        for raw in text.lines_with_terminator() {
            let raw = BString::from(raw);
            let stripped = raw.trim();
            if stripped.is_empty() || stripped.starts_with(b"#") || stripped.starts_with(b";") {
                lines.push(FileLine::Other(raw));
                continue;
            }
            if let Some((section, subsection)) = parse_section_header(stripped) {
                current_section = Some((section.clone(), subsection.clone()));
                lines.push(FileLine::Section {
                    raw,
                    section,
                    subsection,
                });
                continue;
            }
            match (&current_section, parse_entry_line(stripped)) {
                (Some((section, subsection)), Some((name, value))) => {
                    let key = match subsection {
                        Some(sub) => format!("{section}.{sub}.{name}"),
                        None => format!("{section}.{name}"),
                    };
                    lines.push(FileLine::Entry { raw, key, value });
                }
                _ => lines.push(FileLine::Other(raw)),
            }
        }
        Self { lines }
    }

    /// All entries in file order as (normalized key, value) pairs.
    pub fn entries(&self) -> impl Iterator<Item = (String, Option<String>)> + '_ {
        self.lines.iter().filter_map(|line| match line {
            FileLine::Entry { key, value, .. } => Some((key.clone(), value.clone())),
            _ => None,
        })
    }

    /// Values recorded for `key`, in file order.
    pub fn get_all(&self, key: &str) -> Vec<Option<String>> {
        let key = normalize_key(key);
        self.lines
            .iter()
            .filter_map(|line| match line {
                FileLine::Entry { key: k, value, .. } if *k == key => Some(value.clone()),
                _ => None,
            })
            .collect()
    }

    /// Sets `key` to `value`, replacing the last existing occurrence or
    /// appending to the proper section (creating it at the end of file).
    pub fn set(&mut self, key: &str, value: &str) {
        let key = normalize_key(key);
        let raw = {
            let (_, _, name) = split_key(&key);
            format_entry_line(&name, value)
        };
        if let Some(index) = self
            .lines
            .iter()
            .rposition(|line| matches!(line, FileLine::Entry { key: k, .. } if *k == key))
        {
            self.lines[index] = FileLine::Entry {
                raw,
                key,
                value: Some(value.to_string()),
            };
            return;
        }
        self.insert_entry(key, value);
    }

    /// Appends an additional value for `key` (multi-valued entry).
    pub fn add(&mut self, key: &str, value: &str) {
        self.insert_entry(normalize_key(key), value);
    }

    fn insert_entry(&mut self, key: String, value: &str) {
        let (section, subsection, name) = split_key(&key);
        let insert_at = match self.section_end(&section, subsection.as_deref()) {
            Some(at) => at,
            None => {
                self.lines.push(FileLine::Section {
                    raw: format_section_header(&section, subsection.as_deref()),
                    section,
                    subsection,
                });
                self.lines.len()
            }
        };
        self.lines.insert(
            insert_at,
            FileLine::Entry {
                raw: format_entry_line(&name, value),
                key,
                value: Some(value.to_string()),
            },
        );
    }

    /// Removes every occurrence of `key`.
    pub fn unset_all(&mut self, key: &str) {
        let key = normalize_key(key);
        self.lines
            .retain(|line| !matches!(line, FileLine::Entry { key: k, .. } if *k == key));
    }

    /// Index just past the last line belonging to the given section.
    fn section_end(&self, section: &str, subsection: Option<&str>) -> Option<usize> {
        let mut in_section = false;
        let mut end = None;
        for (i, line) in self.lines.iter().enumerate() {
            match line {
                FileLine::Section {
                    section: s,
                    subsection: sub,
                    ..
                } => {
                    in_section = s == section && sub.as_deref() == subsection;
                    if in_section {
                        end = Some(i + 1);
                    }
                }
                FileLine::Entry { .. } if in_section => {
                    end = Some(i + 1);
                }
                _ => {}
            }
        }
        end
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out: Vec<u8> = vec![];
        for line in &self.lines {
            let raw = match line {
                FileLine::Section { raw, .. }
                | FileLine::Entry { raw, .. }
                | FileLine::Other(raw) => raw,
            };
            out.extend_from_slice(raw);
            if !out.ends_with(b"\n") {
                out.push(b'\n');
            }
        }
        out
    }
}

fn split_key(key: &str) -> (String, Option<String>, String) {
    let (section, rest) = key.split_once('.').expect("key must be dotted");
    match rest.rsplit_once('.') {
        Some((middle, name)) => (
            section.to_string(),
            Some(middle.to_string()),
            name.to_string(),
        ),
        None => (section.to_string(), None, rest.to_string()),
    }
}

fn parse_section_header(line: &[u8]) -> Option<(String, Option<String>)> {
    let line = line.strip_prefix(b"[")?;
    let line = line.strip_suffix(b"]")?;
    let line = line.to_str().ok()?;
    match line.split_once(' ') {
        Some((name, sub)) => {
            let sub = sub.trim();
            let sub = sub.strip_prefix('"')?.strip_suffix('"')?;
            let sub = sub.replace("\\\\", "\\").replace("\\\"", "\"");
            Some((name.trim().to_lowercase(), Some(sub)))
        }
        None => Some((line.trim().to_lowercase(), None)),
    }
}

fn parse_entry_line(line: &[u8]) -> Option<(String, Option<String>)> {
    let line = line.to_str().ok()?;
    let (name, value) = match line.split_once('=') {
        Some((name, value)) => (name.trim(), Some(value)),
        None => (line.trim(), None),
    };
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return None;
    }
    let value = value.map(parse_value);
    Some((name.to_lowercase(), value))
}

/// Unquotes a git-config value, stopping at an unquoted comment char.
fn parse_value(raw: &str) -> String {
    let mut out = String::new();
    let mut chars = raw.trim_start().chars();
    let mut in_quotes = false;
    // Whitespace inside quotes is significant and survives the final trim.
    let mut protected = 0;
    while let Some(c) = chars.next() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                if !in_quotes {
                    protected = out.len();
                }
            }
            '\\' => match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some('b') => out.push('\u{8}'),
                Some(other) => out.push(other),
                None => {}
            },
            '#' | ';' if !in_quotes => break,
            _ => out.push(c),
        }
    }
    let tail_len = out[protected..].trim_end().len();
    out.truncate(protected + tail_len);
    out
}

fn format_entry_line(name: &str, value: &str) -> BString {
    let needs_quoting = value.is_empty()
        || value.starts_with(' ')
        || value.ends_with(' ')
        || value.contains(['#', ';', '"', '\\', '\n']);
    if needs_quoting {
        let escaped = value
            .replace('\\', "\\\\")
            .replace('"', "\\\"")
            .replace('\n', "\\n");
        format!("\t{name} = \"{escaped}\"").into()
    } else {
        format!("\t{name} = {value}").into()
    }
}

fn format_section_header(section: &str, subsection: Option<&str>) -> BString {
    match subsection {
        Some(sub) => {
            let escaped = sub.replace('\\', "\\\\").replace('"', "\\\"");
            format!("[{section} \"{escaped}\"]").into()
        }
        None => format!("[{section}]").into(),
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    const SAMPLE: &str = indoc! {r#"
        # user config
        [core]
            repositoryformatversion = 0
            bare = false
        [datalad "dataset"]
            id = 8b5ca4b0-8c4c-11ec-b909-0242ac120002
        [annex]
            uuid = f5a3e6c2-0000-4c6e-9d55-2f3b1e6a9b01
            backend = SHA256E
        [remote "origin"]
            url = ssh://example.com/store
            annex-ignore = true
        [datalad "runtime"]
            max-batched = 20
    "#};

    fn manager_with(branch: &str, local: &str) -> ConfigManager {
        let mut manager = ConfigManager::default();
        manager.add_layer(ConfigLayer::parse(ConfigScope::Branch, branch.as_bytes()));
        manager.add_layer(ConfigLayer::parse(ConfigScope::Local, local.as_bytes()));
        manager
    }

    #[test]
    fn test_parse_sample() {
        let file = GitConfigFile::parse(SAMPLE.as_bytes());
        let entries: Vec<_> = file.entries().collect();
        assert_eq!(entries.len(), 8);
        assert_eq!(
            file.get_all("datalad.dataset.id"),
            [Some("8b5ca4b0-8c4c-11ec-b909-0242ac120002".to_string())]
        );
        assert_eq!(
            file.get_all("remote.origin.url"),
            [Some("ssh://example.com/store".to_string())]
        );
    }

    #[test]
    fn test_round_trip_preserves_unrelated_lines() {
        let mut file = GitConfigFile::parse(SAMPLE.as_bytes());
        file.set("annex.backend", "MD5E");
        let out = String::from_utf8(file.to_bytes()).unwrap();
        assert!(out.contains("# user config"));
        assert!(out.contains("\tbackend = MD5E"));
        assert!(out.contains("repositoryformatversion = 0"));
    }

    #[test]
    fn test_set_creates_missing_section() {
        let mut file = GitConfigFile::parse(b"");
        file.set("datalad.locations.sockets", "/tmp/socks");
        let out = String::from_utf8(file.to_bytes()).unwrap();
        assert_eq!(out, "[datalad \"locations\"]\n\tsockets = /tmp/socks\n");
    }

    #[test]
    fn test_add_appends_multi_value() {
        let mut file = GitConfigFile::parse(b"[remote \"storage\"]\n\turl = a\n");
        file.add("remote.storage.url", "b");
        assert_eq!(
            file.get_all("remote.storage.url"),
            [Some("a".to_string()), Some("b".to_string())]
        );
    }

    #[test]
    fn test_quoted_values_and_comments() {
        let text = indoc! {r#"
            [alpha]
                one = "a # not a comment"
                two = plain value ; trailing comment
                three
        "#};
        let file = GitConfigFile::parse(text.as_bytes());
        assert_eq!(
            file.get_all("alpha.one"),
            [Some("a # not a comment".to_string())]
        );
        assert_eq!(file.get_all("alpha.two"), [Some("plain value".to_string())]);
        assert_eq!(file.get_all("alpha.three"), [None]);
    }

    #[test]
    fn test_precedence_local_over_branch() {
        let manager = manager_with(
            "[datalad]\n\tsetting = branch\n",
            "[datalad]\n\tsetting = local\n",
        );
        assert_eq!(manager.get("datalad.setting"), Some("local"));
        assert_eq!(manager.get_all("datalad.setting"), ["branch", "local"]);
    }

    #[test]
    fn test_env_mapping() {
        assert_eq!(
            env_name_to_key("DATALAD_RUNTIME_MAX__BATCHED").as_deref(),
            Some("datalad.runtime.max-batched")
        );
        assert_eq!(
            env_name_to_key("DATALAD_SSH_MULTIPLEX__CONNECTIONS").as_deref(),
            Some("datalad.ssh.multiplex-connections")
        );
        assert_eq!(env_name_to_key("HOME"), None);
        assert_eq!(env_name_to_key(OVERRIDES_JSON_VAR), None);
    }

    #[test]
    fn test_env_layer_and_json_overrides() {
        let manager = ConfigManager::builder()
            .system_file("/nonexistent/system-config")
            .user_file("/nonexistent/user-config")
            .env_vars(vec![
                ("DATALAD_ANNEX_RETRY".into(), "5".into()),
                (
                    OVERRIDES_JSON_VAR.into(),
                    r#"{"datalad.fancy key.x": ["a", "b"]}"#.into(),
                ),
            ])
            .load()
            .unwrap();
        assert_eq!(manager.get("datalad.annex.retry"), Some("5"));
        assert_eq!(manager.get_all("datalad.fancy key.x"), ["a", "b"]);
    }

    #[test]
    fn test_cli_override_beats_env() {
        let manager = ConfigManager::builder()
            .system_file("/nonexistent/system-config")
            .user_file("/nonexistent/user-config")
            .env_vars(vec![("DATALAD_ANNEX_RETRY".into(), "5".into())])
            .cli_override("datalad.annex.retry", "9")
            .load()
            .unwrap();
        assert_eq!(manager.get("datalad.annex.retry"), Some("9"));
    }

    #[test]
    fn test_typed_getters() {
        let manager = manager_with(
            indoc! {"
                [datalad]
                \tflag = yes
                \tcount = 3
                \tbig = 2k
                \tratio = 0.5
                \tbad = certainly
                [bare]
                \tswitch
            "},
            "",
        );
        assert_eq!(manager.get_bool("datalad.flag").unwrap(), Some(true));
        assert_eq!(manager.get_int("datalad.count").unwrap(), Some(3));
        assert_eq!(manager.get_int("datalad.big").unwrap(), Some(2048));
        assert_eq!(manager.get_float("datalad.ratio").unwrap(), Some(0.5));
        assert_eq!(manager.get_bool("bare.switch").unwrap(), Some(true));
        assert_matches::assert_matches!(
            manager.get_bool("datalad.bad"),
            Err(ConfigError::Type { .. })
        );
        assert_eq!(manager.get_bool("datalad.absent").unwrap(), None);
    }

    #[test]
    fn test_set_and_reload_file_scope() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("ds");
        fs::create_dir_all(root.join(".git")).unwrap();
        fs::create_dir_all(root.join(".datalad")).unwrap();
        let mut writer = ConfigManager::builder()
            .system_file("/nonexistent/system-config")
            .user_file("/nonexistent/user-config")
            .env_vars(vec![])
            .dataset_root(&root)
            .load()
            .unwrap();
        writer
            .set(
                "datalad.dataset.id",
                "0000-set-by-writer",
                ConfigScope::Branch,
            )
            .unwrap();
        assert_eq!(writer.get("datalad.dataset.id"), Some("0000-set-by-writer"));

        // A second reader observes the value after reload.
        let mut reader = ConfigManager::builder()
            .system_file("/nonexistent/system-config")
            .user_file("/nonexistent/user-config")
            .env_vars(vec![])
            .dataset_root(&root)
            .load()
            .unwrap();
        assert_eq!(reader.get("datalad.dataset.id"), Some("0000-set-by-writer"));
        writer
            .set("datalad.dataset.id", "1111-rewritten", ConfigScope::Branch)
            .unwrap();
        reader.reload().unwrap();
        assert_eq!(reader.get("datalad.dataset.id"), Some("1111-rewritten"));
    }

    #[test]
    fn test_unset() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("ds");
        fs::create_dir_all(root.join(".git")).unwrap();
        let mut manager = ConfigManager::builder()
            .system_file("/nonexistent/system-config")
            .user_file("/nonexistent/user-config")
            .env_vars(vec![])
            .dataset_root(&root)
            .load()
            .unwrap();
        manager.set("a.b", "1", ConfigScope::Local).unwrap();
        manager.unset("a.b", ConfigScope::Local).unwrap();
        assert_eq!(manager.get("a.b"), None);
    }

    #[test]
    fn test_normalize_key_subsection_case() {
        assert_eq!(normalize_key("Remote.Origin.URL"), "remote.Origin.url");
        assert_eq!(normalize_key("CORE.BARE"), "core.bare");
    }
}
