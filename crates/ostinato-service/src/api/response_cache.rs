//! Response-level cache with conditional-request support.
//!
//! Every read against the service goes through here. An entry keeps the
//! last response body together with its `ETag`, so an expired entry is
//! still useful: its etag turns the next fetch into a conditional request
//! that the service can answer with a cheap `304 Not Modified`.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use url::Url;

/// Query parameters that carry no request semantics and would fracture the
/// cache key space.
const VOLATILE_QUERY_PARAMS: &[&str] = &["timestamp"];

/// How long a response stays servable without revalidation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CacheTtl {
    /// Never serve from cache. The response is still recorded when the
    /// service sends an `ETag`, as a revalidation hint.
    None,
    /// Serve from cache for the given duration.
    For(Duration),
    /// Serve from cache for the lifetime of this process.
    Session,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Expiry {
    At(SystemTime),
    Session,
}

/// A cached response body plus the metadata needed to revalidate it.
#[derive(Clone, Debug)]
pub struct CachedResponse {
    pub etag: Option<String>,
    pub body: Bytes,
    expiry: Expiry,
}

impl CachedResponse {
    /// Whether the body may be served without asking the service.
    pub fn is_valid(&self) -> bool {
        match self.expiry {
            Expiry::At(until) => SystemTime::now() < until,
            Expiry::Session => true,
        }
    }
}

/// On-disk form of one entry. Session entries are written with an expiry
/// that has already elapsed, keeping the etag usable across runs without
/// ever serving the stale body directly.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedResponse {
    etag: Option<String>,
    body: String,
    /// Epoch milliseconds.
    cached_until: u64,
}

#[derive(Debug, Default)]
pub struct ResponseCache {
    path: Option<PathBuf>,
    entries: Mutex<BTreeMap<String, CachedResponse>>,
}

impl ResponseCache {
    /// Opens the cache, reading previously persisted responses if there are
    /// any. An absent or unreadable file just means a cold cache.
    pub fn load(path: Option<PathBuf>) -> Self {
        let mut entries = BTreeMap::new();
        if let Some(path) = &path
            && let Ok(raw) = fs::read_to_string(path)
        {
            match serde_json::from_str::<BTreeMap<String, PersistedResponse>>(&raw) {
                Ok(persisted) => {
                    for (key, entry) in persisted {
                        entries.insert(
                            key,
                            CachedResponse {
                                etag: entry.etag,
                                body: Bytes::from(entry.body),
                                expiry: Expiry::At(
                                    UNIX_EPOCH + Duration::from_millis(entry.cached_until),
                                ),
                            },
                        );
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        error = &error as &dyn std::error::Error,
                        path = %path.display(),
                        "ignoring malformed response cache file"
                    );
                }
            }
        }

        tracing::debug!(entries = entries.len(), "opened response cache");
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, CachedResponse>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Reduces a request URL to its cache key.
    ///
    /// Query parameters are sorted so that semantically identical URLs
    /// produced by different call sites share an entry, and volatile
    /// parameters are dropped entirely.
    pub fn normalize_url(url: &Url) -> String {
        let mut pairs: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(key, _)| !VOLATILE_QUERY_PARAMS.contains(&key.as_ref()))
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();
        pairs.sort();

        let mut key = format!("{}{}", url.host_str().unwrap_or_default(), url.path());
        for (i, (name, value)) in pairs.iter().enumerate() {
            key.push(if i == 0 { '?' } else { '&' });
            key.push_str(name);
            key.push('=');
            key.push_str(value);
        }
        key
    }

    pub fn lookup(&self, key: &str) -> Option<CachedResponse> {
        self.lock().get(key).cloned()
    }

    pub fn is_cached(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    /// Records a fresh response.
    ///
    /// With [`CacheTtl::None`] the body is only kept when the service sent
    /// an etag, and it is stored already stale.
    pub fn store(&self, key: &str, etag: Option<&str>, body: &Bytes, ttl: CacheTtl) {
        let expiry = match ttl {
            CacheTtl::None => {
                if etag.is_none() {
                    return;
                }
                Expiry::At(SystemTime::now())
            }
            CacheTtl::For(duration) => Expiry::At(SystemTime::now() + duration),
            CacheTtl::Session => Expiry::Session,
        };

        self.lock().insert(
            key.to_owned(),
            CachedResponse {
                etag: etag.map(str::to_owned),
                body: body.clone(),
                expiry,
            },
        );
    }

    /// Extends an entry's lifetime after a `304 Not Modified`.
    ///
    /// The service may rotate the etag on a 304; if it does, the new one
    /// replaces the stored one.
    pub fn refresh(&self, key: &str, etag: Option<&str>, ttl: CacheTtl) {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(key) else {
            return;
        };
        if let Some(etag) = etag {
            entry.etag = Some(etag.to_owned());
        }
        match ttl {
            CacheTtl::None => {}
            CacheTtl::For(duration) => entry.expiry = Expiry::At(SystemTime::now() + duration),
            CacheTtl::Session => entry.expiry = Expiry::Session,
        }
    }

    /// Drops every entry whose key contains `fragment`.
    ///
    /// Write commands call this with a path fragment like `me/player` to
    /// force the next read of the mutated resource onto the network.
    pub fn invalidate(&self, fragment: &str) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|key, _| !key.contains(fragment));
        let removed = before - entries.len();
        if removed > 0 {
            tracing::debug!(fragment, removed, "invalidated cached responses");
        }
        removed
    }

    /// Writes the cache out for the next run.
    ///
    /// Session-scoped entries are demoted to already-expired etag hints.
    pub fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let persisted: BTreeMap<String, PersistedResponse> = {
            let entries = self.lock();
            entries
                .iter()
                .map(|(key, entry)| {
                    let cached_until = match entry.expiry {
                        Expiry::At(until) => until
                            .duration_since(UNIX_EPOCH)
                            .unwrap_or_default()
                            .as_millis() as u64,
                        Expiry::Session => 0,
                    };
                    (
                        key.clone(),
                        PersistedResponse {
                            etag: entry.etag.clone(),
                            body: String::from_utf8_lossy(&entry.body).into_owned(),
                            cached_until,
                        },
                    )
                })
                .collect()
        };

        let serialized =
            serde_json::to_string(&persisted).context("failed to serialize response cache")?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("failed to create cache directory")?;
        }
        fs::write(path, serialized).context("failed to write response cache file")
    }
}
