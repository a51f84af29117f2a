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

//! Credential providers.
//!
//! Providers are declared in configuration under
//! `datalad.credential.<name>.<field>` with fields type, url, user, token,
//! secret, and host. A provider is selected for a download by matching its
//! `url` pattern (a regular expression, or a plain prefix when the pattern
//! does not compile) against the target URL; anonymous access is the
//! fallback when nothing matches. The process-wide credential cache is
//! guarded by an inter-process lock with a caller-visible timeout.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::sync::Mutex;
use std::time::Duration;

use regex::Regex;
use thiserror::Error;

use crate::config::ConfigManager;
use crate::lock;
use crate::lock::LockError;
use crate::lock::LockGuard;

/// How long a caller waits for the credential store lock before giving up
/// with an explanation.
pub const STORE_LOCK_TIMEOUT: Duration = Duration::from_secs(300);

/// Error accessing credentials.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error(
        "Could not lock the credential store within {:.0?}; another process holds it \
         (remove {path} if that process is gone)",
        STORE_LOCK_TIMEOUT
    )]
    StoreBusy { path: PathBuf },
    #[error(transparent)]
    Lock(LockError),
}

/// One declared provider.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Provider {
    pub name: String,
    /// Authentication type, e.g. `http-basic`, `token`, `aws-s3`.
    pub kind: Option<String>,
    /// URL pattern this provider applies to.
    pub url_pattern: Option<String>,
    pub user: Option<String>,
    pub token: Option<String>,
    pub secret: Option<String>,
    pub host: Option<String>,
}

impl Provider {
    /// True if this provider covers `url`.
    pub fn covers(&self, url: &str) -> bool {
        if let Some(pattern) = &self.url_pattern {
            return match Regex::new(pattern) {
                Ok(re) => re.is_match(url),
                Err(_) => url.starts_with(pattern.as_str()),
            };
        }
        if let Some(host) = &self.host {
            return url::Url::parse(url)
                .ok()
                .and_then(|u| u.host_str().map(|h| h == host))
                .unwrap_or(false);
        }
        false
    }
}

/// Reads all providers from `datalad.credential.<name>.<field>` keys.
pub fn providers_from_config(config: &ConfigManager) -> Vec<Provider> {
    let mut names: Vec<String> = vec![];
    for key in config.keys_with_prefix("datalad.credential.") {
        if let Some(rest) = key.strip_prefix("datalad.credential.")
            && let Some((name, _field)) = rest.rsplit_once('.')
            && !names.iter().any(|n| n == name)
        {
            names.push(name.to_string());
        }
    }
    names
        .into_iter()
        .map(|name| {
            let field = |field: &str| {
                config
                    .get(&format!("datalad.credential.{name}.{field}"))
                    .map(str::to_string)
            };
            Provider {
                kind: field("type"),
                url_pattern: field("url"),
                user: field("user"),
                token: field("token"),
                secret: field("secret"),
                host: field("host"),
                name,
            }
        })
        .collect()
}

/// Picks the provider covering `url`, or `None` for anonymous access.
pub fn provider_for_url<'a>(providers: &'a [Provider], url: &str) -> Option<&'a Provider> {
    providers.iter().find(|provider| provider.covers(url))
}

/// Process-wide cache of resolved secrets, keyed by provider name.
///
/// Shared across threads; mutation additionally takes the inter-process
/// store lock so concurrent processes serialize their updates.
pub struct CredentialCache {
    entries: Mutex<HashMap<String, String>>,
    lock_path: PathBuf,
}

static CACHE: LazyLock<CredentialCache> = LazyLock::new(|| CredentialCache {
    entries: Mutex::new(HashMap::new()),
    lock_path: std::env::temp_dir().join("datalad-credential-store.lck"),
});

impl CredentialCache {
    pub fn global() -> &'static Self {
        &CACHE
    }

    /// For tests: a cache with its own lock file.
    pub fn with_lock_path(lock_path: PathBuf) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            lock_path,
        }
    }

    pub fn get(&self, provider: &str) -> Option<String> {
        self.entries
            .lock()
            .expect("credential cache poisoned")
            .get(provider)
            .cloned()
    }

    /// Stores a secret under the inter-process store lock.
    pub fn store(&self, provider: &str, secret: &str) -> Result<(), CredentialError> {
        let _guard = self.lock_store()?;
        self.entries
            .lock()
            .expect("credential cache poisoned")
            .insert(provider.to_string(), secret.to_string());
        Ok(())
    }

    fn lock_store(&self) -> Result<LockGuard, CredentialError> {
        match lock::acquire(&self.lock_path, STORE_LOCK_TIMEOUT, None) {
            Ok(guard) => Ok(guard),
            Err(LockError::Timeout { path, .. }) => Err(CredentialError::StoreBusy { path }),
            Err(err) => Err(CredentialError::Lock(err)),
        }
    }
}
