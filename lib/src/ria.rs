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

//! RIA object stores.
//!
//! A RIA store holds the annex objects of many datasets in one layered
//! directory tree: `<store>/<first-3-of-id>/<rest-of-id>/annex/objects/…`,
//! with an `alias/` directory of friendly names and a mandatory
//! `ria-layout-version` file at the root that is checked before any read
//! or write. The same store is reachable over `ria+file`, `ria+ssh`, and
//! `ria+http(s)` URLs; availability checks are uniform across access
//! protocols, and uploads recover from interruption by resuming partial
//! transfer files. A `push-url` may differ from the read URL.

use std::fs;
use std::io::Read as _;
use std::io::Seek as _;
use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

use crate::file_util::IoResultExt as _;
use crate::file_util::PathError;
use crate::http::DownloadError;
use crate::http::HttpClient;
use crate::key::AnnexKey;
use crate::runner;
use crate::runner::CancelToken;
use crate::runner::RunOptions;
use crate::runner::StdinSource;
use crate::ssh::SshError;
use crate::ssh::SshShim;
use crate::ssh::SshUrl;

/// The store generation this implementation speaks.
pub const SUPPORTED_LAYOUT_VERSION: u32 = 1;

const LAYOUT_FILE: &str = "ria-layout-version";

/// Error talking to a RIA store.
#[derive(Debug, Error)]
pub enum RiaError {
    #[error("Not a ria+ URL: {url} ({reason})")]
    BadUrl { url: String, reason: String },
    #[error("Store at {store} has layout version {found}, supported is {SUPPORTED_LAYOUT_VERSION}")]
    IncompatibleLayout { store: String, found: String },
    #[error("Store at {store} has no readable {LAYOUT_FILE}")]
    MissingLayoutFile { store: String },
    #[error("{spec:?} is both an alias and a dataset id prefix in this store")]
    AliasCollision { spec: String },
    #[error("{spec:?} names no dataset in this store")]
    UnknownDataset { spec: String },
    #[error("The store is reachable read-only over this protocol")]
    ReadOnly,
    #[error("Remote side failed: {detail}")]
    Remote { detail: String },
    #[error("Transfer was cancelled")]
    Cancelled,
    #[error(transparent)]
    Io(#[from] PathError),
    #[error(transparent)]
    Ssh(#[from] SshError),
    #[error(transparent)]
    Download(#[from] DownloadError),
}

/// Parsed `ria+<proto>://…#<dataset>[@<version>]` URL.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RiaUrl {
    /// Protocol and store base, e.g. `file` + `/data/store`.
    pub protocol: String,
    pub base: String,
    /// Dataset UUID or alias from the fragment.
    pub dataset: Option<String>,
}

impl RiaUrl {
    pub fn parse(text: &str) -> Result<Self, RiaError> {
        let bad = |reason: &str| RiaError::BadUrl {
            url: text.to_string(),
            reason: reason.to_string(),
        };
        let rest = text.strip_prefix("ria+").ok_or_else(|| bad("missing ria+ prefix"))?;
        let (without_fragment, dataset) = match rest.split_once('#') {
            Some((head, fragment)) => (head, Some(fragment.to_string())),
            None => (rest, None),
        };
        let (protocol, _) = without_fragment
            .split_once("://")
            .ok_or_else(|| bad("no protocol separator"))?;
        match protocol {
            "file" | "ssh" | "http" | "https" => {}
            other => return Err(bad(&format!("unsupported protocol {other:?}"))),
        }
        Ok(Self {
            protocol: protocol.to_string(),
            base: without_fragment.to_string(),
            dataset,
        })
    }
}

/// Relative location of a key's object file and its in-flight twin.
pub fn object_location(dataset: Uuid, key: &AnnexKey) -> (String, String) {
    let id = dataset.simple().to_string();
    let prefix = format!("{}/{}", &id[..3], &id[3..]);
    let digest = key.digest();
    let fanout = &digest[..digest.len().min(3)];
    (
        format!("{prefix}/annex/objects/{fanout}/{key}/{key}"),
        format!("{prefix}/annex/transfer/{key}"),
    )
}

/// One access protocol to a store.
pub enum RiaAccess {
    File(PathBuf),
    Ssh { shim: SshShim, target: SshUrl },
    Http { client: HttpClient, base: String },
}

/// Handle on one RIA store over one access protocol.
pub struct RiaStore {
    access: RiaAccess,
    /// Separate write access, when pushes go elsewhere (`push-url`).
    push_access: Option<Box<RiaAccess>>,
}

impl RiaStore {
    pub fn new(access: RiaAccess) -> Self {
        Self {
            access,
            push_access: None,
        }
    }

    pub fn with_push_access(mut self, push: RiaAccess) -> Self {
        self.push_access = Some(Box::new(push));
        self
    }

    fn describe(&self) -> String {
        match &self.access {
            RiaAccess::File(path) => path.display().to_string(),
            RiaAccess::Ssh { target, .. } => format!("ssh://{}{}", target.host, target.path),
            RiaAccess::Http { base, .. } => base.clone(),
        }
    }

    /// Reads and checks `ria-layout-version`; every operation starts here.
    pub fn verify_layout(&self) -> Result<u32, RiaError> {
        let content =
            read_small(&self.access, LAYOUT_FILE)?.ok_or_else(|| RiaError::MissingLayoutFile {
                store: self.describe(),
            })?;
        let text = String::from_utf8_lossy(&content);
        let text = text.trim();
        // The file carries `major[.minor…][|flags]`; only the major number
        // gates compatibility.
        let major: u32 = text
            .split(['.', '|'])
            .next()
            .and_then(|major| major.parse().ok())
            .ok_or_else(|| RiaError::IncompatibleLayout {
                store: self.describe(),
                found: text.to_string(),
            })?;
        if major != SUPPORTED_LAYOUT_VERSION {
            return Err(RiaError::IncompatibleLayout {
                store: self.describe(),
                found: text.to_string(),
            });
        }
        Ok(major)
    }

    /// Resolves a dataset spec (UUID or alias) to the dataset UUID.
    ///
    /// A spec that is simultaneously a valid alias and a dataset id in the
    /// store is ambiguous and refused rather than silently preferred.
    pub fn resolve_dataset(&self, spec: &str) -> Result<Uuid, RiaError> {
        self.verify_layout()?;
        let alias_content = read_small(&self.access, &format!("alias/{spec}"))?;
        let direct = Uuid::parse_str(spec).ok().filter(|id| {
            let prefix = {
                let id = id.simple().to_string();
                format!("{}/{}", &id[..3], &id[3..])
            };
            exists(&self.access, &prefix).unwrap_or(false)
        });
        match (alias_content, direct) {
            (Some(_), Some(_)) => Err(RiaError::AliasCollision {
                spec: spec.to_string(),
            }),
            (Some(content), None) => {
                let text = String::from_utf8_lossy(&content);
                Uuid::parse_str(text.trim()).map_err(|_| RiaError::UnknownDataset {
                    spec: spec.to_string(),
                })
            }
            (None, Some(id)) => Ok(id),
            (None, None) => Err(RiaError::UnknownDataset {
                spec: spec.to_string(),
            }),
        }
    }

    /// Uniform availability check, independent of access protocol.
    pub fn check_present(&self, dataset: Uuid, key: &AnnexKey) -> Result<bool, RiaError> {
        self.verify_layout()?;
        let (object, _) = object_location(dataset, key);
        exists(&self.access, &object)
    }

    /// Fetches the object into `dest`.
    ///
    /// `progress` must be `Send`: over SSH the byte stream is pumped on a
    /// reader thread.
    pub fn get(
        &self,
        dataset: Uuid,
        key: &AnnexKey,
        dest: &Path,
        cancel: &CancelToken,
        progress: &mut (dyn FnMut(u64, Option<u64>) + Send),
    ) -> Result<(), RiaError> {
        self.verify_layout()?;
        let (object, _) = object_location(dataset, key);
        fetch(&self.access, &object, dest, cancel, progress)
    }

    /// Uploads `src` as the object for `key`, resuming a partial upload
    /// left behind by an interrupted earlier attempt.
    pub fn put(
        &self,
        dataset: Uuid,
        key: &AnnexKey,
        src: &Path,
        cancel: &CancelToken,
    ) -> Result<(), RiaError> {
        self.verify_layout()?;
        let access = self.push_access.as_deref().unwrap_or(&self.access);
        let (object, transfer) = object_location(dataset, key);
        store_file(access, src, &object, &transfer, cancel)
    }
}

fn read_small(access: &RiaAccess, rel: &str) -> Result<Option<Vec<u8>>, RiaError> {
    match access {
        RiaAccess::File(root) => match fs::read(root.join(rel)) {
            Ok(content) => Ok(Some(content)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(PathError {
                path: root.join(rel),
                source,
            }
            .into()),
        },
        RiaAccess::Ssh { shim, target } => {
            let remote = format!("{}/{rel}", target.path.trim_end_matches('/'));
            let output = shim.run(
                target,
                &["cat".to_string(), shell_quote(&remote)],
                RunOptions::default(),
            )?;
            if output.success() {
                Ok(Some(output.stdout))
            } else {
                Ok(None)
            }
        }
        RiaAccess::Http { client, base } => {
            let url = format!("{}/{rel}", base.trim_end_matches('/'));
            if !client.exists(&url)? {
                return Ok(None);
            }
            let temp = tempfile::NamedTempFile::new().map_err(|source| PathError {
                path: PathBuf::from("tempfile"),
                source,
            })?;
            client.download(&url, temp.path(), false, None, &CancelToken::new(), &mut |_, _| {})?;
            let content = fs::read(temp.path()).context(temp.path())?;
            Ok(Some(content))
        }
    }
}

fn exists(access: &RiaAccess, rel: &str) -> Result<bool, RiaError> {
    match access {
        RiaAccess::File(root) => Ok(root.join(rel).exists()),
        RiaAccess::Ssh { shim, target } => {
            let remote = format!("{}/{rel}", target.path.trim_end_matches('/'));
            let output = shim.run(
                target,
                &["test".to_string(), "-e".to_string(), shell_quote(&remote)],
                RunOptions::default(),
            )?;
            Ok(output.success())
        }
        RiaAccess::Http { client, base } => {
            let url = format!("{}/{rel}", base.trim_end_matches('/'));
            Ok(client.exists(&url)?)
        }
    }
}

fn fetch(
    access: &RiaAccess,
    rel: &str,
    dest: &Path,
    cancel: &CancelToken,
    progress: &mut (dyn FnMut(u64, Option<u64>) + Send),
) -> Result<(), RiaError> {
    match access {
        RiaAccess::File(root) => {
            let source = root.join(rel);
            let total = fs::metadata(&source).context(&source)?.len();
            let mut reader = fs::File::open(&source).context(&source)?;
            let mut writer = fs::File::create(dest).context(dest)?;
            let mut buf = [0u8; 64 * 1024];
            let mut done = 0u64;
            loop {
                if cancel.is_cancelled() {
                    return Err(RiaError::Cancelled);
                }
                let n = reader.read(&mut buf).context(&source)?;
                if n == 0 {
                    break;
                }
                writer.write_all(&buf[..n]).context(dest)?;
                done += n as u64;
                progress(done, Some(total));
            }
            Ok(())
        }
        RiaAccess::Ssh { shim, target } => {
            let remote = format!("{}/{rel}", target.path.trim_end_matches('/'));
            let cmd = shim.command(target, &["cat".to_string(), shell_quote(&remote)])?;
            let mut file = fs::File::create(dest).context(dest)?;
            let mut done = 0u64;
            let mut write_error = None;
            let mut stderr = vec![];
            let status = runner::run_streamed(
                cmd,
                RunOptions {
                    cancel: Some(cancel.clone()),
                    ..Default::default()
                },
                &mut |chunk| {
                    if write_error.is_none() {
                        if let Err(err) = file.write_all(chunk) {
                            write_error = Some(err);
                        }
                        done += chunk.len() as u64;
                        progress(done, None);
                    }
                },
                &mut |chunk| stderr.extend_from_slice(chunk),
            )
            .map_err(SshError::from)?;
            if let Some(source) = write_error {
                return Err(PathError {
                    path: dest.to_path_buf(),
                    source,
                }
                .into());
            }
            if !status.success() {
                return Err(RiaError::Remote {
                    detail: String::from_utf8_lossy(&stderr).trim().to_string(),
                });
            }
            Ok(())
        }
        RiaAccess::Http { client, base } => {
            let url = format!("{}/{rel}", base.trim_end_matches('/'));
            client.download(&url, dest, true, None, cancel, progress)?;
            Ok(())
        }
    }
}

fn store_file(
    access: &RiaAccess,
    src: &Path,
    rel_final: &str,
    rel_part: &str,
    cancel: &CancelToken,
) -> Result<(), RiaError> {
    let src_len = fs::metadata(src).context(src)?.len();
    match access {
        RiaAccess::File(root) => {
            let part = root.join(rel_part);
            let target = root.join(rel_final);
            if let Some(parent) = part.parent() {
                fs::create_dir_all(parent).context(parent)?;
            }
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).context(parent)?;
            }
            // Resume: keep what an interrupted upload already shipped.
            let offset = fs::metadata(&part).map(|m| m.len()).unwrap_or(0);
            let offset = if offset <= src_len { offset } else { 0 };
            let mut reader = fs::File::open(src).context(src)?;
            reader
                .seek(std::io::SeekFrom::Start(offset))
                .context(src)?;
            let mut writer = if offset > 0 {
                fs::OpenOptions::new().append(true).open(&part).context(&part)?
            } else {
                fs::File::create(&part).context(&part)?
            };
            let mut buf = [0u8; 64 * 1024];
            loop {
                if cancel.is_cancelled() {
                    return Err(RiaError::Cancelled);
                }
                let n = reader.read(&mut buf).context(src)?;
                if n == 0 {
                    break;
                }
                writer.write_all(&buf[..n]).context(&part)?;
            }
            writer.flush().context(&part)?;
            drop(writer);
            fs::rename(&part, &target).context(&target)?;
            Ok(())
        }
        RiaAccess::Ssh { shim, target } => {
            let base = target.path.trim_end_matches('/');
            let part = format!("{base}/{rel_part}");
            let final_path = format!("{base}/{rel_final}");
            // Ask the remote side how much already arrived.
            let probe = shim.run(
                target,
                &[
                    "sh".to_string(),
                    "-c".to_string(),
                    format!("wc -c < {} 2>/dev/null || echo 0", shell_quote(&part)),
                ],
                RunOptions::default(),
            )?;
            let offset: u64 = String::from_utf8_lossy(&probe.stdout)
                .trim()
                .parse()
                .unwrap_or(0);
            let offset = if offset <= src_len { offset } else { 0 };
            let append = if offset > 0 { ">>" } else { ">" };
            let script = format!(
                "mkdir -p {part_dir} {final_dir} && cat {append} {part} && mv {part} {final_path}",
                part_dir = shell_quote(parent_of(&part)),
                final_dir = shell_quote(parent_of(&final_path)),
                part = shell_quote(&part),
                final_path = shell_quote(&final_path),
            );
            let output = shim.run(
                target,
                &["sh".to_string(), "-c".to_string(), script],
                RunOptions {
                    stdin: StdinSource::File {
                        path: src.to_path_buf(),
                        offset,
                    },
                    cancel: Some(cancel.clone()),
                    ..Default::default()
                },
            )?;
            if !output.success() {
                return Err(RiaError::Remote {
                    detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                });
            }
            Ok(())
        }
        RiaAccess::Http { .. } => Err(RiaError::ReadOnly),
    }
}

fn parent_of(path: &str) -> &str {
    path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or(".")
}

/// Single-quotes a string for `sh -c` remote command lines.
fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    const DATASET: &str = "8b5ca4b0-8c4c-41ec-b909-0242ac120002";
    const KEY: &str = "SHA256E-s14--0011223344556677.dat";

    fn file_store(root: &Path) -> RiaStore {
        fs::create_dir_all(root).unwrap();
        fs::write(root.join(LAYOUT_FILE), "1\n").unwrap();
        RiaStore::new(RiaAccess::File(root.to_path_buf()))
    }

    #[test]
    fn test_parse_ria_urls() {
        let url = RiaUrl::parse(&format!("ria+ssh://store.example.com/data/store#{DATASET}"))
            .unwrap();
        assert_eq!(url.protocol, "ssh");
        assert_eq!(url.base, "ssh://store.example.com/data/store");
        assert_eq!(url.dataset.as_deref(), Some(DATASET));

        let plain = RiaUrl::parse("ria+file:///data/store").unwrap();
        assert_eq!(plain.protocol, "file");
        assert_eq!(plain.dataset, None);

        assert!(RiaUrl::parse("ssh://host/x").is_err());
        assert!(RiaUrl::parse("ria+ftp://host/x").is_err());
    }

    #[test]
    fn test_object_location_shape() {
        let id = Uuid::parse_str(DATASET).unwrap();
        let key = AnnexKey::parse(KEY).unwrap();
        let (object, transfer) = object_location(id, &key);
        assert_eq!(
            object,
            format!("8b5/ca4b08c4c41ecb9090242ac120002/annex/objects/001/{KEY}/{KEY}")
        );
        assert_eq!(
            transfer,
            format!("8b5/ca4b08c4c41ecb9090242ac120002/annex/transfer/{KEY}")
        );
    }

    #[test]
    fn test_layout_version_gate() {
        let dir = tempfile::tempdir().unwrap();
        let store = file_store(dir.path());
        assert_eq!(store.verify_layout().unwrap(), 1);

        fs::write(dir.path().join(LAYOUT_FILE), "2|c\n").unwrap();
        assert_matches!(
            store.verify_layout(),
            Err(RiaError::IncompatibleLayout { .. })
        );

        fs::remove_file(dir.path().join(LAYOUT_FILE)).unwrap();
        assert_matches!(store.verify_layout(), Err(RiaError::MissingLayoutFile { .. }));
    }

    #[test]
    fn test_put_get_round_trip_with_resume() {
        let dir = tempfile::tempdir().unwrap();
        let store = file_store(&dir.path().join("store"));
        let id = Uuid::parse_str(DATASET).unwrap();
        let key = AnnexKey::parse(KEY).unwrap();

        let src = dir.path().join("content.dat");
        fs::write(&src, b"full content\xEF\xBC\x81").unwrap();

        // Simulate an interrupted earlier upload: a partial transfer file
        // already holds the first bytes.
        let (_, transfer) = object_location(id, &key);
        let part = dir.path().join("store").join(&transfer);
        fs::create_dir_all(part.parent().unwrap()).unwrap();
        fs::write(&part, b"full ").unwrap();

        store.put(id, &key, &src, &CancelToken::new()).unwrap();
        assert!(store.check_present(id, &key).unwrap());
        assert!(!part.exists());

        let dest = dir.path().join("fetched.dat");
        let mut seen = vec![];
        store
            .get(id, &key, &dest, &CancelToken::new(), &mut |done, total| {
                seen.push((done, total));
            })
            .unwrap();
        assert_eq!(fs::read(&dest).unwrap(), fs::read(&src).unwrap());
        assert!(!seen.is_empty());
    }

    #[test]
    fn test_alias_resolution_and_collision() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("store");
        let store = file_store(&root);
        let id = Uuid::parse_str(DATASET).unwrap();

        // Unknown spec.
        assert_matches!(
            store.resolve_dataset("nothing"),
            Err(RiaError::UnknownDataset { .. })
        );

        // Plain alias.
        fs::create_dir_all(root.join("alias")).unwrap();
        fs::write(root.join("alias/mystudy"), format!("{DATASET}\n")).unwrap();
        assert_eq!(store.resolve_dataset("mystudy").unwrap(), id);

        // Direct UUID.
        let simple = id.simple().to_string();
        fs::create_dir_all(root.join(&simple[..3]).join(&simple[3..])).unwrap();
        assert_eq!(store.resolve_dataset(DATASET).unwrap(), id);

        // An alias spelled like an existing dataset UUID is ambiguous.
        fs::write(root.join("alias").join(DATASET), format!("{DATASET}\n")).unwrap();
        assert_matches!(
            store.resolve_dataset(DATASET),
            Err(RiaError::AliasCollision { .. })
        );
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("with 'quote'"), r"'with '\''quote'\'''");
    }
}
