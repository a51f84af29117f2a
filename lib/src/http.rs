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

//! HTTP(S) downloads, including S3 object URLs.
//!
//! Downloads stream to disk (never into memory), support resumption via
//! range requests, follow at most one cross-host (authentication)
//! redirect, send a configurable User-Agent, and report progress per
//! chunk. S3 objects are fetched over plain HTTPS object URLs; a
//! versioned URL carries its `versionId` query parameter. Credentials come
//! from a matched provider; a 429 response is reported as such so retry
//! logic never re-prompts for credentials on throttling.

use std::fs;
use std::fs::OpenOptions;
use std::io::Read as _;
use std::io::Write as _;
use std::path::Path;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::redirect;
use thiserror::Error;
use url::Url;

use crate::credentials::Provider;
use crate::file_util::IoResultExt as _;
use crate::file_util::PathError;
use crate::runner::CancelToken;

const CHUNK: usize = 64 * 1024;
const DEFAULT_USER_AGENT: &str = concat!("datalad-core/", env!("CARGO_PKG_VERSION"));

/// Error of one HTTP transfer.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("{url} answered {status}")]
    Status { url: String, status: StatusCode },
    #[error("Download of {url} was cancelled")]
    Cancelled { url: String },
    #[error("Not an S3 object URL: {0}")]
    BadS3Url(String),
    #[error(transparent)]
    Request(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] PathError),
}

impl DownloadError {
    /// True for failures where retrying must not re-ask for credentials
    /// (throttling is not an authentication problem).
    pub fn is_throttled(&self) -> bool {
        matches!(
            self,
            Self::Status {
                status: StatusCode::TOO_MANY_REQUESTS,
                ..
            }
        )
    }
}

/// Counts host changes along a redirect chain.
///
/// Authentication gateways bounce to a different host; everything beyond
/// one such hop is refused.
pub fn cross_host_hops(chain: &[Url]) -> usize {
    chain
        .windows(2)
        .filter(|pair| pair[0].host_str() != pair[1].host_str())
        .count()
}

/// Blocking HTTP client with this crate's policies applied.
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    pub fn new(user_agent: Option<&str>) -> Result<Self, DownloadError> {
        let client = Client::builder()
            .user_agent(user_agent.unwrap_or(DEFAULT_USER_AGENT))
            .connect_timeout(Duration::from_secs(30))
            .redirect(redirect::Policy::custom(|attempt| {
                if attempt.previous().len() >= 10 {
                    return attempt.error("too many redirects");
                }
                let mut chain: Vec<Url> = attempt.previous().to_vec();
                chain.push(attempt.url().clone());
                if cross_host_hops(&chain) > 1 {
                    return attempt.error("more than one authentication redirect");
                }
                attempt.follow()
            }))
            .build()?;
        Ok(Self { client })
    }

    /// Probes `url` with a HEAD request.
    pub fn exists(&self, url: &str) -> Result<bool, DownloadError> {
        let response = self.client.head(url).send()?;
        match response.status() {
            StatusCode::OK | StatusCode::PARTIAL_CONTENT => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(DownloadError::Status {
                url: url.to_string(),
                status,
            }),
        }
    }

    /// Streams `url` into `dest`.
    ///
    /// With `resume`, an existing partial `dest` continues via a range
    /// request; a server without range support restarts from zero.
    /// Returns the total size of `dest` afterwards.
    pub fn download(
        &self,
        url: &str,
        dest: &Path,
        resume: bool,
        credential: Option<&Provider>,
        cancel: &CancelToken,
        progress: &mut dyn FnMut(u64, Option<u64>),
    ) -> Result<u64, DownloadError> {
        let offset = if resume {
            fs::metadata(dest).map(|m| m.len()).unwrap_or(0)
        } else {
            0
        };
        let mut request = self.client.get(url);
        if offset > 0 {
            request = request.header("Range", format!("bytes={offset}-"));
        }
        if let Some(provider) = credential {
            request = match (&provider.token, &provider.user) {
                (Some(token), _) => request.bearer_auth(token),
                (None, Some(user)) => request.basic_auth(user, provider.secret.as_deref()),
                _ => request,
            };
        }
        tracing::debug!(url, offset, "starting download");
        let mut response = request.send()?;
        let status = response.status();
        let (mut file, mut written) = match status {
            StatusCode::PARTIAL_CONTENT => {
                let file = OpenOptions::new()
                    .append(true)
                    .open(dest)
                    .context(dest)?;
                (file, offset)
            }
            StatusCode::OK => {
                // Either a fresh download or a server without range
                // support; start over.
                let file = fs::File::create(dest).context(dest)?;
                (file, 0)
            }
            status => {
                return Err(DownloadError::Status {
                    url: url.to_string(),
                    status,
                });
            }
        };
        let total = response
            .content_length()
            .map(|remaining| remaining + written);

        let mut buf = [0u8; CHUNK];
        loop {
            if cancel.is_cancelled() {
                return Err(DownloadError::Cancelled {
                    url: url.to_string(),
                });
            }
            let n = response.read(&mut buf).map_err(|source| PathError {
                path: dest.to_path_buf(),
                source,
            })?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n]).context(dest)?;
            written += n as u64;
            progress(written, total);
        }
        file.flush().context(dest)?;
        Ok(written)
    }
}

/// Parsed S3 object address.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct S3Url {
    pub bucket: String,
    pub key: String,
    /// Present for versioned object URLs.
    pub version_id: Option<String>,
}

impl S3Url {
    /// Parses `s3://bucket/key[?versionId=…]`.
    pub fn parse(text: &str) -> Result<Self, DownloadError> {
        let bad = || DownloadError::BadS3Url(text.to_string());
        let url = Url::parse(text).map_err(|_| bad())?;
        if url.scheme() != "s3" {
            return Err(bad());
        }
        let bucket = url.host_str().ok_or_else(bad)?.to_string();
        let key = url.path().trim_start_matches('/').to_string();
        if key.is_empty() {
            return Err(bad());
        }
        let version_id = url
            .query_pairs()
            .find(|(name, _)| name == "versionId")
            .map(|(_, value)| value.into_owned());
        Ok(Self {
            bucket,
            key,
            version_id,
        })
    }

    /// The plain HTTPS object URL this address resolves to.
    ///
    /// Unversioned public buckets serve straight GETs (no range games
    /// assumed); versioned addresses pin the exact object generation.
    pub fn to_https(&self) -> String {
        let mut out = format!("https://{}.s3.amazonaws.com/{}", self.bucket, self.key);
        if let Some(version) = &self.version_id {
            out.push_str("?versionId=");
            out.push_str(version);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_s3_url_versioned_round_trip() {
        let url = S3Url::parse("s3://mybucket/path/to/obj.dat?versionId=abc123").unwrap();
        assert_eq!(url.bucket, "mybucket");
        assert_eq!(url.key, "path/to/obj.dat");
        assert_eq!(url.version_id.as_deref(), Some("abc123"));
        assert_eq!(
            url.to_https(),
            "https://mybucket.s3.amazonaws.com/path/to/obj.dat?versionId=abc123"
        );
    }

    #[test]
    fn test_s3_url_unversioned() {
        let url = S3Url::parse("s3://bucket/key.bin").unwrap();
        assert_eq!(url.version_id, None);
        assert_eq!(url.to_https(), "https://bucket.s3.amazonaws.com/key.bin");
    }

    #[test]
    fn test_s3_url_rejects_malformed() {
        assert!(S3Url::parse("https://bucket/key").is_err());
        assert!(S3Url::parse("s3://bucket").is_err());
        assert!(S3Url::parse("s3://bucket/").is_err());
    }

    #[test]
    fn test_cross_host_hops() {
        let chain: Vec<Url> = [
            "https://a.example.com/x",
            "https://a.example.com/y",
            "https://login.example.com/auth",
            "https://a.example.com/x",
        ]
        .iter()
        .map(|u| Url::parse(u).unwrap())
        .collect();
        assert_eq!(cross_host_hops(&chain[..2]), 0);
        assert_eq!(cross_host_hops(&chain[..3]), 1);
        assert_eq!(cross_host_hops(&chain), 2);
    }

    #[test]
    fn test_throttling_detection() {
        let throttled = DownloadError::Status {
            url: "https://x".into(),
            status: StatusCode::TOO_MANY_REQUESTS,
        };
        let denied = DownloadError::Status {
            url: "https://x".into(),
            status: StatusCode::UNAUTHORIZED,
        };
        assert!(throttled.is_throttled());
        assert!(!denied.is_throttled());
    }
}
