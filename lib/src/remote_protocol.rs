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

//! The special-remote stdio protocol.
//!
//! The annex drives pluggable storage backends over a line-oriented
//! protocol on stdin/stdout: newline-terminated messages, space-separated
//! fields, the last field read to end-of-line. The helper announces
//! `VERSION 1` and then serves verbs (`PREPARE`, `TRANSFER`,
//! `CHECKPRESENT`, `REMOVE`, `CLAIMURL`, `CHECKURL`, `GETCOST`, …) until
//! EOF, which is what makes batched mode work. `INFO` text must have its
//! newlines escaped or the stream would be corrupted, and a helper that
//! would have to prompt for credentials without a controlling terminal
//! errors out instead of hanging. Three backends ship in-crate: the
//! web-like URL resolver, the archive-member extractor, and the RIA
//! object store.

use std::collections::HashMap;
use std::io::BufRead;
use std::io::IsTerminal as _;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

use crate::archives::ArchiveCache;
use crate::archives::ArchiveError;
use crate::archives::ArchiveMemberUrl;
use crate::http::DownloadError;
use crate::http::HttpClient;
use crate::http::S3Url;
use crate::key::AnnexKey;
use crate::ria::RiaError;
use crate::ria::RiaStore;
use crate::runner::CancelToken;

/// Protocol generation spoken by this implementation.
pub const PROTOCOL_VERSION: u32 = 1;

/// Failure of the protocol layer itself (I/O, stream corruption).
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("The annex reported an error: {0}")]
    Driver(String),
    #[error("Protocol stream failed")]
    Io(#[from] std::io::Error),
    #[error("Malformed message from the annex: {0:?}")]
    Malformed(String),
}

/// Failure of one backend operation, reported as a `*-FAILURE` reply.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("operation is not supported by this remote")]
    Unsupported,
    #[error("credentials for {provider} required but no terminal to ask on")]
    NeedsCredentials { provider: String },
    #[error("{0}")]
    Failed(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<DownloadError> for RemoteError {
    fn from(err: DownloadError) -> Self {
        Self::Failed(err.to_string())
    }
}

impl From<ArchiveError> for RemoteError {
    fn from(err: ArchiveError) -> Self {
        Self::Failed(err.to_string())
    }
}

impl From<RiaError> for RemoteError {
    fn from(err: RiaError) -> Self {
        Self::Failed(err.to_string())
    }
}

/// Presence answer for `CHECKPRESENT`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Presence {
    Present,
    Absent,
    /// The remote cannot currently tell; carries the reason.
    Unknown(String),
}

/// One resolvable URL for a key, as answered to `CHECKURL`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UrlInfo {
    pub url: String,
    pub size: Option<u64>,
    pub filename: String,
}

/// Mid-request conversation channel back to the annex.
pub trait AnnexSide {
    /// `GETCONFIG name` → configured value, if any.
    fn get_config(&mut self, name: &str) -> Result<Option<String>, ProtocolError>;
    /// Registered URLs of a key with the given prefix.
    fn get_urls(&mut self, key: &str, prefix: &str) -> Result<Vec<String>, ProtocolError>;
    /// Free-form message to the user; newlines are escaped on the wire.
    fn info(&mut self, message: &str) -> Result<(), ProtocolError>;
    /// Transfer progress in bytes.
    fn progress(&mut self, bytes: u64) -> Result<(), ProtocolError>;
}

/// A pluggable storage backend served over the protocol.
pub trait SpecialRemote: Send {
    fn name(&self) -> &str;

    fn cost(&self) -> u32 {
        200
    }

    fn prepare(&mut self, annex: &mut dyn AnnexSide) -> Result<(), RemoteError>;

    fn transfer_retrieve(
        &mut self,
        key: &str,
        file: &Path,
        annex: &mut dyn AnnexSide,
    ) -> Result<(), RemoteError>;

    fn transfer_store(
        &mut self,
        _key: &str,
        _file: &Path,
        _annex: &mut dyn AnnexSide,
    ) -> Result<(), RemoteError> {
        Err(RemoteError::Unsupported)
    }

    fn checkpresent(
        &mut self,
        key: &str,
        annex: &mut dyn AnnexSide,
    ) -> Result<Presence, RemoteError>;

    fn remove(&mut self, _key: &str, _annex: &mut dyn AnnexSide) -> Result<(), RemoteError> {
        Err(RemoteError::Unsupported)
    }

    fn claimurl(&self, _url: &str) -> bool {
        false
    }

    fn checkurl(
        &mut self,
        _url: &str,
        _annex: &mut dyn AnnexSide,
    ) -> Result<Vec<UrlInfo>, RemoteError> {
        Err(RemoteError::Unsupported)
    }
}

/// Escapes text for an `INFO` message: embedded line breaks would
/// otherwise corrupt the line-oriented stream.
pub fn escape_info(text: &str) -> String {
    text.replace('\\', "\\\\").replace('\n', "\\n").replace('\r', "\\r")
}

/// Errors instead of prompting when no terminal is attached.
///
/// A helper spawned by the annex usually has no controlling terminal; it
/// must never sit waiting for input nobody can give.
pub fn require_terminal_for_prompt(provider: &str) -> Result<(), RemoteError> {
    if std::io::stdin().is_terminal() {
        Ok(())
    } else {
        Err(RemoteError::NeedsCredentials {
            provider: provider.to_string(),
        })
    }
}

struct AnnexIo<'a> {
    reader: &'a mut dyn BufRead,
    writer: &'a mut dyn Write,
}

impl AnnexIo<'_> {
    fn send(&mut self, line: &str) -> Result<(), ProtocolError> {
        writeln!(self.writer, "{line}")?;
        self.writer.flush()?;
        Ok(())
    }

    fn recv(&mut self) -> Result<Option<String>, ProtocolError> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(Some(line))
    }
}

impl AnnexSide for AnnexIo<'_> {
    fn get_config(&mut self, name: &str) -> Result<Option<String>, ProtocolError> {
        self.send(&format!("GETCONFIG {name}"))?;
        let reply = self
            .recv()?
            .ok_or_else(|| ProtocolError::Malformed("EOF awaiting VALUE".into()))?;
        match reply.strip_prefix("VALUE") {
            Some("") => Ok(None),
            Some(value) => Ok(Some(value.trim_start().to_string())),
            None => Err(ProtocolError::Malformed(reply)),
        }
    }

    fn get_urls(&mut self, key: &str, prefix: &str) -> Result<Vec<String>, ProtocolError> {
        self.send(&format!("GETURLS {key} {prefix}"))?;
        let mut urls = vec![];
        loop {
            let reply = self
                .recv()?
                .ok_or_else(|| ProtocolError::Malformed("EOF awaiting VALUE".into()))?;
            match reply.strip_prefix("VALUE") {
                // An empty VALUE terminates the list.
                Some("") => return Ok(urls),
                Some(url) => urls.push(url.trim_start().to_string()),
                None => return Err(ProtocolError::Malformed(reply)),
            }
        }
    }

    fn info(&mut self, message: &str) -> Result<(), ProtocolError> {
        self.send(&format!("INFO {}", escape_info(message)))
    }

    fn progress(&mut self, bytes: u64) -> Result<(), ProtocolError> {
        self.send(&format!("PROGRESS {bytes}"))
    }
}

/// Serves `remote` over the given streams until the annex hangs up.
pub fn serve(
    remote: &mut dyn SpecialRemote,
    reader: &mut dyn BufRead,
    writer: &mut dyn Write,
) -> Result<(), ProtocolError> {
    let mut io = AnnexIo { reader, writer };
    io.send(&format!("VERSION {PROTOCOL_VERSION}"))?;
    loop {
        let Some(line) = io.recv()? else {
            // EOF: the annex is done with us. One helper instance may have
            // served many requests by now.
            return Ok(());
        };
        if line.is_empty() {
            continue;
        }
        let (verb, rest) = match line.split_once(' ') {
            Some((verb, rest)) => (verb, rest),
            None => (line.as_str(), ""),
        };
        match verb {
            "INITREMOTE" => io.send("INITREMOTE-SUCCESS")?,
            "PREPARE" => match remote.prepare(&mut io) {
                Ok(()) => io.send("PREPARE-SUCCESS")?,
                Err(err) => io.send(&format!("PREPARE-FAILURE {}", escape_info(&err.to_string())))?,
            },
            "TRANSFER" => {
                // `TRANSFER <direction> <key> <file…to EOL>`
                let mut fields = rest.splitn(3, ' ');
                let (Some(direction), Some(key), Some(file)) =
                    (fields.next(), fields.next(), fields.next())
                else {
                    return Err(ProtocolError::Malformed(line));
                };
                let file = PathBuf::from(file);
                let result = match direction {
                    "RETRIEVE" => remote.transfer_retrieve(key, &file, &mut io),
                    "STORE" => remote.transfer_store(key, &file, &mut io),
                    other => {
                        return Err(ProtocolError::Malformed(format!(
                            "TRANSFER direction {other:?}"
                        )));
                    }
                };
                match result {
                    Ok(()) => io.send(&format!("TRANSFER-SUCCESS {direction} {key}"))?,
                    Err(err) => io.send(&format!(
                        "TRANSFER-FAILURE {direction} {key} {}",
                        escape_info(&err.to_string())
                    ))?,
                }
            }
            "CHECKPRESENT" => match remote.checkpresent(rest, &mut io) {
                Ok(Presence::Present) => io.send(&format!("CHECKPRESENT-SUCCESS {rest}"))?,
                Ok(Presence::Absent) => io.send(&format!("CHECKPRESENT-FAILURE {rest}"))?,
                Ok(Presence::Unknown(reason)) => io.send(&format!(
                    "CHECKPRESENT-UNKNOWN {rest} {}",
                    escape_info(&reason)
                ))?,
                Err(err) => io.send(&format!(
                    "CHECKPRESENT-UNKNOWN {rest} {}",
                    escape_info(&err.to_string())
                ))?,
            },
            "REMOVE" => match remote.remove(rest, &mut io) {
                Ok(()) => io.send(&format!("REMOVE-SUCCESS {rest}"))?,
                Err(err) => io.send(&format!(
                    "REMOVE-FAILURE {rest} {}",
                    escape_info(&err.to_string())
                ))?,
            },
            "CLAIMURL" => {
                if remote.claimurl(rest) {
                    io.send("CLAIMURL-SUCCESS")?;
                } else {
                    io.send("CLAIMURL-FAILURE")?;
                }
            }
            "CHECKURL" => match remote.checkurl(rest, &mut io) {
                Ok(infos) if infos.len() == 1 => {
                    let info = &infos[0];
                    let size = info
                        .size
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "UNKNOWN".into());
                    io.send(&format!("CHECKURL-CONTENTS {size} {}", info.filename))?;
                }
                Ok(infos) if !infos.is_empty() => {
                    let mut reply = String::from("CHECKURL-MULTI");
                    for info in &infos {
                        let size = info
                            .size
                            .map(|s| s.to_string())
                            .unwrap_or_else(|| "UNKNOWN".into());
                        reply.push_str(&format!(" {} {size} {}", info.url, info.filename));
                    }
                    io.send(&reply)?;
                }
                Ok(_) => io.send("CHECKURL-FAILURE")?,
                Err(err) => {
                    io.send(&format!("CHECKURL-FAILURE {}", escape_info(&err.to_string())))?;
                }
            },
            "GETCOST" => {
                let cost = remote.cost();
                io.send(&format!("COST {cost}"))?;
            }
            "GETAVAILABILITY" => io.send("AVAILABILITY GLOBAL")?,
            "EXPORTSUPPORTED" => io.send("EXPORTSUPPORTED-FAILURE")?,
            "ERROR" => return Err(ProtocolError::Driver(rest.to_string())),
            _ => io.send("UNSUPPORTED-REQUEST")?,
        }
    }
}

/// Registry of backend constructors, scanned once at startup.
#[derive(Default)]
pub struct RemoteRegistry {
    constructors: HashMap<String, Box<dyn Fn() -> Box<dyn SpecialRemote> + Send + Sync>>,
}

impl RemoteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the three in-crate backends.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("datalad", || Box::new(WebRemote::new()));
        registry.register("datalad-archives", || {
            Box::new(ArchivesRemote::new(
                ArchiveCache::new(std::env::temp_dir().join("datalad-archives")),
                None,
            ))
        });
        registry
    }

    pub fn register(
        &mut self,
        name: &str,
        make: impl Fn() -> Box<dyn SpecialRemote> + Send + Sync + 'static,
    ) {
        self.constructors.insert(name.to_string(), Box::new(make));
    }

    pub fn create(&self, name: &str) -> Option<Box<dyn SpecialRemote>> {
        self.constructors.get(name).map(|make| make())
    }

    pub fn names(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }
}

/// The web-like backend: claims a closed set of URI schemes and resolves
/// each to a concrete HTTP(S) GET.
pub struct WebRemote {
    client: Option<HttpClient>,
    cancel: CancelToken,
}

impl WebRemote {
    pub fn new() -> Self {
        Self {
            client: None,
            cancel: CancelToken::new(),
        }
    }

    fn client(&mut self) -> Result<&HttpClient, RemoteError> {
        if self.client.is_none() {
            self.client = Some(HttpClient::new(None)?);
        }
        Ok(self.client.as_ref().expect("client was just created"))
    }

    /// Rewrites a claimed URL to the HTTP(S) URL it stands for.
    pub fn resolve(url: &str) -> Option<String> {
        if url.starts_with("http://") || url.starts_with("https://") {
            return Some(url.to_string());
        }
        if let Some(rest) = url.strip_prefix("shub://") {
            return Some(format!("https://singularity-hub.org/api/container/{rest}"));
        }
        if url.starts_with("s3://") {
            return S3Url::parse(url).ok().map(|s3| s3.to_https());
        }
        None
    }
}

impl Default for WebRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl SpecialRemote for WebRemote {
    fn name(&self) -> &str {
        "datalad"
    }

    fn prepare(&mut self, _annex: &mut dyn AnnexSide) -> Result<(), RemoteError> {
        self.client()?;
        Ok(())
    }

    fn claimurl(&self, url: &str) -> bool {
        // The closed scheme set: container hub URLs, RIA stores,
        // versioned S3 objects, and the default-dataset shorthand.
        url.starts_with("shub://")
            || url.starts_with("ria+")
            || (url.starts_with("s3://") && url.contains("versionId="))
            || url.starts_with("///")
    }

    fn checkurl(
        &mut self,
        url: &str,
        _annex: &mut dyn AnnexSide,
    ) -> Result<Vec<UrlInfo>, RemoteError> {
        let resolved =
            Self::resolve(url).ok_or_else(|| RemoteError::Failed(format!("cannot resolve {url}")))?;
        let filename = resolved
            .rsplit('/')
            .next()
            .unwrap_or("content")
            .split('?')
            .next()
            .unwrap_or("content")
            .to_string();
        Ok(vec![UrlInfo {
            url: resolved,
            size: None,
            filename,
        }])
    }

    fn transfer_retrieve(
        &mut self,
        key: &str,
        file: &Path,
        annex: &mut dyn AnnexSide,
    ) -> Result<(), RemoteError> {
        let urls = annex.get_urls(key, "")?;
        let cancel = self.cancel.clone();
        let mut last_error = RemoteError::Failed(format!("no usable URL known for {key}"));
        for url in urls {
            let Some(resolved) = Self::resolve(&url) else {
                continue;
            };
            let mut report = |done: u64, _total: Option<u64>| {
                let _ = annex.progress(done);
            };
            match self
                .client()?
                .download(&resolved, file, true, None, &cancel, &mut report)
            {
                Ok(_) => return Ok(()),
                Err(err) => last_error = err.into(),
            }
        }
        Err(last_error)
    }

    fn checkpresent(
        &mut self,
        key: &str,
        annex: &mut dyn AnnexSide,
    ) -> Result<Presence, RemoteError> {
        let urls = annex.get_urls(key, "")?;
        for url in urls {
            let Some(resolved) = Self::resolve(&url) else {
                continue;
            };
            if self.client()?.exists(&resolved).unwrap_or(false) {
                return Ok(Presence::Present);
            }
        }
        Ok(Presence::Unknown("no URL answered".into()))
    }
}

/// Source of a local copy of an archive, by its key.
///
/// In production this fetches through the transfer engine; tests inject a
/// directory lookup.
pub type ArchiveProvider = dyn Fn(&AnnexKey) -> Result<PathBuf, RemoteError> + Send;

/// The archive-member backend: content addressed as
/// `dl+archive:<archive-key>#path=<member>&size=<n>`.
pub struct ArchivesRemote {
    cache: ArchiveCache,
    provider: Option<Box<ArchiveProvider>>,
    cancel: CancelToken,
}

impl ArchivesRemote {
    pub fn new(cache: ArchiveCache, provider: Option<Box<ArchiveProvider>>) -> Self {
        Self {
            cache,
            provider,
            cancel: CancelToken::new(),
        }
    }

    fn member_url(url: &str) -> Result<ArchiveMemberUrl, RemoteError> {
        ArchiveMemberUrl::parse(url).map_err(|err| RemoteError::Failed(err.to_string()))
    }

    fn archive_path(&self, key: &AnnexKey) -> Result<PathBuf, RemoteError> {
        match &self.provider {
            Some(provider) => provider(key),
            None => Err(RemoteError::Failed(
                "no way to obtain the containing archive".into(),
            )),
        }
    }
}

impl SpecialRemote for ArchivesRemote {
    fn name(&self) -> &str {
        "datalad-archives"
    }

    fn cost(&self) -> u32 {
        // More expensive than a plain clone, cheaper than the web.
        150
    }

    fn prepare(&mut self, _annex: &mut dyn AnnexSide) -> Result<(), RemoteError> {
        Ok(())
    }

    fn claimurl(&self, url: &str) -> bool {
        url.starts_with("dl+archive:")
    }

    fn checkurl(
        &mut self,
        url: &str,
        _annex: &mut dyn AnnexSide,
    ) -> Result<Vec<UrlInfo>, RemoteError> {
        let parsed = Self::member_url(url)?;
        let filename = parsed
            .member
            .rsplit('/')
            .next()
            .unwrap_or("member")
            .to_string();
        Ok(vec![UrlInfo {
            url: url.to_string(),
            size: parsed.size,
            filename,
        }])
    }

    fn transfer_retrieve(
        &mut self,
        key: &str,
        file: &Path,
        annex: &mut dyn AnnexSide,
    ) -> Result<(), RemoteError> {
        let urls = annex.get_urls(key, "dl+archive:")?;
        let mut last_error = RemoteError::Failed(format!("no archive URL known for {key}"));
        for url in urls {
            let parsed = match Self::member_url(&url) {
                Ok(parsed) => parsed,
                Err(err) => {
                    last_error = err;
                    continue;
                }
            };
            let archive = match self.archive_path(&parsed.archive_key) {
                Ok(path) => path,
                Err(err) => {
                    last_error = err;
                    continue;
                }
            };
            annex.info(&format!(
                "extracting {} from {}",
                parsed.member, parsed.archive_key
            ))?;
            match self.cache.provide_member(
                &parsed.archive_key,
                &archive,
                &parsed.member,
                file,
                &self.cancel,
            ) {
                Ok(()) => {
                    if let Some(size) = parsed.size {
                        let _ = annex.progress(size);
                    }
                    return Ok(());
                }
                Err(err) => last_error = err.into(),
            }
        }
        Err(last_error)
    }

    fn checkpresent(
        &mut self,
        key: &str,
        annex: &mut dyn AnnexSide,
    ) -> Result<Presence, RemoteError> {
        let urls = annex.get_urls(key, "dl+archive:")?;
        if urls.is_empty() {
            return Ok(Presence::Absent);
        }
        // Without fetching the archive the best honest answer is unknown.
        Ok(Presence::Unknown(
            "member presence requires obtaining the archive".into(),
        ))
    }
}

/// The RIA object-store backend.
pub struct OraRemote {
    store: RiaStore,
    dataset: Uuid,
    cancel: CancelToken,
}

impl OraRemote {
    pub fn new(store: RiaStore, dataset: Uuid) -> Self {
        Self {
            store,
            dataset,
            cancel: CancelToken::new(),
        }
    }

    fn key(text: &str) -> Result<AnnexKey, RemoteError> {
        AnnexKey::parse(text).map_err(|err| RemoteError::Failed(err.to_string()))
    }
}

impl SpecialRemote for OraRemote {
    fn name(&self) -> &str {
        "ora"
    }

    fn cost(&self) -> u32 {
        100
    }

    fn prepare(&mut self, _annex: &mut dyn AnnexSide) -> Result<(), RemoteError> {
        self.store.verify_layout()?;
        Ok(())
    }

    fn transfer_retrieve(
        &mut self,
        key: &str,
        file: &Path,
        annex: &mut dyn AnnexSide,
    ) -> Result<(), RemoteError> {
        let key = Self::key(key)?;
        let cancel = self.cancel.clone();
        // Progress arrives on a pump thread when the store is remote, but
        // the annex stream is not shareable across threads; collect and
        // forward the latest figure afterwards.
        let (tx, rx) = std::sync::mpsc::channel();
        let mut report = move |done: u64, _total: Option<u64>| {
            let _ = tx.send(done);
        };
        self.store
            .get(self.dataset, &key, file, &cancel, &mut report)?;
        drop(report);
        if let Some(done) = rx.try_iter().last() {
            let _ = annex.progress(done);
        }
        Ok(())
    }

    fn transfer_store(
        &mut self,
        key: &str,
        file: &Path,
        _annex: &mut dyn AnnexSide,
    ) -> Result<(), RemoteError> {
        let key = Self::key(key)?;
        self.store.put(self.dataset, &key, file, &self.cancel)?;
        Ok(())
    }

    fn checkpresent(
        &mut self,
        key: &str,
        _annex: &mut dyn AnnexSide,
    ) -> Result<Presence, RemoteError> {
        let key = Self::key(key)?;
        match self.store.check_present(self.dataset, &key)? {
            true => Ok(Presence::Present),
            false => Ok(Presence::Absent),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use pretty_assertions::assert_eq;

    use super::*;

    /// Records calls; scripted presence/transfer outcomes.
    #[derive(Default)]
    struct MockRemote {
        calls: Vec<String>,
        present: bool,
        fail_transfer: bool,
    }

    impl SpecialRemote for MockRemote {
        fn name(&self) -> &str {
            "mock"
        }

        fn cost(&self) -> u32 {
            123
        }

        fn prepare(&mut self, annex: &mut dyn AnnexSide) -> Result<(), RemoteError> {
            self.calls.push("prepare".into());
            annex.info("ready\nto go")?;
            Ok(())
        }

        fn transfer_retrieve(
            &mut self,
            key: &str,
            file: &Path,
            _annex: &mut dyn AnnexSide,
        ) -> Result<(), RemoteError> {
            self.calls.push(format!("retrieve {key} {}", file.display()));
            if self.fail_transfer {
                Err(RemoteError::Failed("boom".into()))
            } else {
                Ok(())
            }
        }

        fn checkpresent(
            &mut self,
            key: &str,
            _annex: &mut dyn AnnexSide,
        ) -> Result<Presence, RemoteError> {
            self.calls.push(format!("checkpresent {key}"));
            if self.present {
                Ok(Presence::Present)
            } else {
                Ok(Presence::Absent)
            }
        }

        fn claimurl(&self, url: &str) -> bool {
            url.starts_with("mock://")
        }
    }

    fn drive(remote: &mut dyn SpecialRemote, script: &str) -> Vec<String> {
        let mut reader = Cursor::new(script.as_bytes().to_vec());
        let mut written = vec![];
        serve(remote, &mut reader, &mut written).unwrap();
        String::from_utf8(written)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_version_and_prepare() {
        let mut remote = MockRemote::default();
        let replies = drive(&mut remote, "PREPARE\n");
        assert_eq!(
            replies,
            ["VERSION 1", "INFO ready\\nto go", "PREPARE-SUCCESS"]
        );
        assert_eq!(remote.calls, ["prepare"]);
    }

    #[test]
    fn test_transfer_retrieve_with_space_in_path() {
        let mut remote = MockRemote::default();
        let replies = drive(
            &mut remote,
            "TRANSFER RETRIEVE KEY-s1--aa /tmp/with space/file\n",
        );
        assert_eq!(replies[1], "TRANSFER-SUCCESS RETRIEVE KEY-s1--aa");
        // The last field runs to end-of-line, spaces included.
        assert_eq!(remote.calls, ["retrieve KEY-s1--aa /tmp/with space/file"]);
    }

    #[test]
    fn test_transfer_failure_reply() {
        let mut remote = MockRemote {
            fail_transfer: true,
            ..Default::default()
        };
        let replies = drive(&mut remote, "TRANSFER RETRIEVE K--a /x\n");
        assert_eq!(replies[1], "TRANSFER-FAILURE RETRIEVE K--a boom");
    }

    #[test]
    fn test_checkpresent_variants() {
        let mut present = MockRemote {
            present: true,
            ..Default::default()
        };
        assert_eq!(
            drive(&mut present, "CHECKPRESENT K--a\n")[1],
            "CHECKPRESENT-SUCCESS K--a"
        );
        let mut absent = MockRemote::default();
        assert_eq!(
            drive(&mut absent, "CHECKPRESENT K--a\n")[1],
            "CHECKPRESENT-FAILURE K--a"
        );
    }

    #[test]
    fn test_claimurl_and_cost_and_unsupported() {
        let mut remote = MockRemote::default();
        let replies = drive(
            &mut remote,
            "CLAIMURL mock://x\nCLAIMURL https://no\nGETCOST\nWHATEVER\n",
        );
        assert_eq!(
            replies[1..],
            [
                "CLAIMURL-SUCCESS",
                "CLAIMURL-FAILURE",
                "COST 123",
                "UNSUPPORTED-REQUEST"
            ]
        );
    }

    #[test]
    fn test_batched_mode_serves_until_eof() {
        let mut remote = MockRemote {
            present: true,
            ..Default::default()
        };
        let replies = drive(
            &mut remote,
            "CHECKPRESENT A--1\nCHECKPRESENT B--2\nCHECKPRESENT C--3\n",
        );
        assert_eq!(replies.len(), 4); // VERSION + three answers
        assert_eq!(remote.calls.len(), 3);
    }

    #[test]
    fn test_escape_info() {
        assert_eq!(escape_info("one\ntwo\rthree\\"), "one\\ntwo\\rthree\\\\");
    }

    #[test]
    fn test_web_remote_claims_closed_scheme_set() {
        let remote = WebRemote::new();
        assert!(remote.claimurl("shub://org/container:tag"));
        assert!(remote.claimurl("ria+ssh://store.example.com/x#id"));
        assert!(remote.claimurl("s3://bucket/key?versionId=v7"));
        assert!(remote.claimurl("///default/location"));
        assert!(!remote.claimurl("s3://bucket/key"));
        assert!(!remote.claimurl("https://plain.example.com/f"));
    }

    #[test]
    fn test_web_remote_resolution() {
        assert_eq!(
            WebRemote::resolve("s3://b/k?versionId=v1").unwrap(),
            "https://b.s3.amazonaws.com/k?versionId=v1"
        );
        assert_eq!(
            WebRemote::resolve("shub://org/img").unwrap(),
            "https://singularity-hub.org/api/container/org/img"
        );
        assert_eq!(WebRemote::resolve("gopher://x"), None);
    }

    #[test]
    fn test_archives_remote_retrieves_member() {
        let dir = tempfile::tempdir().unwrap();
        // Build a small archive for the member to come out of.
        let archive_path = dir.path().join("arch.tar.gz");
        {
            let file = std::fs::File::create(&archive_path).unwrap();
            let gz = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            let mut builder = tar::Builder::new(gz);
            let mut header = tar::Header::new_gnu();
            header.set_size(5);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, "d/m.dat", &b"bytes"[..]).unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }
        let archive_for = archive_path.clone();
        let mut remote = ArchivesRemote::new(
            ArchiveCache::new(dir.path().join("cache")),
            Some(Box::new(move |_key| Ok(archive_for.clone()))),
        );
        let key = "SHA256E-s999--caches.tar.gz";
        let url = format!("dl+archive:{key}#path=d/m.dat&size=5");
        let dest = dir.path().join("out.dat");
        // The scripted stream interleaves the GETURLS replies the remote
        // will ask for mid-transfer.
        let script = format!(
            "TRANSFER RETRIEVE MD5-s5--abc {}\nVALUE {url}\nVALUE\n",
            dest.display()
        );
        let mut reader = Cursor::new(script.into_bytes());
        let mut written = vec![];
        serve(&mut remote, &mut reader, &mut written).unwrap();
        let replies = String::from_utf8(written).unwrap();
        assert!(replies.contains("TRANSFER-SUCCESS RETRIEVE MD5-s5--abc"));
        assert_eq!(std::fs::read(&dest).unwrap(), b"bytes");
    }

    #[test]
    fn test_registry_builtins() {
        let registry = RemoteRegistry::with_builtins();
        let mut names = registry.names();
        names.sort_unstable();
        assert_eq!(names, ["datalad", "datalad-archives"]);
        assert!(registry.create("datalad").is_some());
        assert!(registry.create("nonsense").is_none());
    }
}
