//! Talking to the music service.
//!
//! [`ApiContext`] is the single authenticated gateway: it owns the HTTP
//! client, the credentials, the [`ResponseCache`] consulted by every read
//! and the worker pool used for concurrent page fetches. The requester
//! types in the submodules layer decoding and pagination on top of it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::Future;
use reqwest::header;
use reqwest::{Method, StatusCode};
use url::Url;

use crate::config::{Config, Fetching};
use crate::events::EventBus;
use crate::workers::WorkerPool;

pub mod batch;
pub mod collection;
mod error;
pub mod requester;
pub mod response_cache;

pub use self::batch::BatchRequest;
pub use self::collection::CollectionRequest;
pub use self::error::{FetchError, FetchResult};
pub use self::requester::ItemRequest;
pub use self::response_cache::{CacheTtl, ResponseCache};

/// How a successful fetch was satisfied.
///
/// The ordering matters: a merged result is as fresh as its freshest part,
/// see [`Freshness::merge`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Freshness {
    /// Served from the response cache, no network round trip at all.
    FromCache,
    /// The service confirmed the cached body is still current (304).
    Revalidated,
    /// A fresh body was downloaded.
    Modified,
}

impl Freshness {
    pub fn merge(self, other: Self) -> Self {
        self.max(other)
    }

    pub fn is_from_cache(self) -> bool {
        matches!(self, Freshness::FromCache)
    }
}

/// A successfully fetched value plus how it was obtained.
#[derive(Clone, Debug)]
pub struct FetchOutcome<T> {
    pub value: T,
    pub freshness: Freshness,
}

impl<T> FetchOutcome<T> {
    pub fn new(value: T, freshness: Freshness) -> Self {
        Self { value, freshness }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> FetchOutcome<U> {
        FetchOutcome {
            value: f(self.value),
            freshness: self.freshness,
        }
    }
}

/// A raw response body plus its freshness, before decoding.
#[derive(Clone, Debug)]
pub struct ApiResponse {
    pub body: Bytes,
    pub freshness: Freshness,
}

/// Retries a rate-limited request with exponential backoff.
///
/// Only [`FetchError::RateLimited`] is worth repeating; every other error
/// is handed back immediately. The total number of attempts is bounded by
/// [`Fetching::max_retries`], and a server-provided `Retry-After` larger
/// than the current backoff wins.
pub async fn retry_rate_limited<G, F, T>(fetching: &Fetching, task_gen: G) -> FetchResult<T>
where
    G: Fn() -> F,
    F: Future<Output = FetchResult<T>>,
{
    let mut backoff = fetching.retry_backoff;
    let mut tries = 0;
    loop {
        tries += 1;
        let result = task_gen().await;

        let should_retry = matches!(&result, Err(error) if error.is_retryable());
        if !should_retry || tries >= fetching.max_retries {
            break result;
        }

        let wait = match &result {
            Err(FetchError::RateLimited {
                retry_after: Some(after),
            }) if *after > backoff => *after,
            _ => backoff,
        };

        metric!(counter("api.retry") += 1);
        tracing::debug!(tries, wait = ?wait, "rate limited, backing off");
        tokio::time::sleep(wait).await;
        backoff *= 2;
    }
}

/// The authenticated gateway to the remote service.
///
/// Cheap to share as `Arc<ApiContext>`; page fetch tasks hold their own
/// clone of the `Arc`.
#[derive(Debug)]
pub struct ApiContext {
    client: reqwest::Client,
    base_url: Url,
    /// Bearer token attached to every request. Without one, reads come back
    /// as [`FetchError::NotAuthorized`].
    token: Option<String>,
    response_cache: ResponseCache,
    fetch_pool: WorkerPool,
    fetching: Fetching,
    events: EventBus,
}

impl ApiContext {
    pub fn new(
        config: &Config,
        response_cache: ResponseCache,
        fetch_pool: WorkerPool,
        events: EventBus,
    ) -> Result<Arc<Self>> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.api.connect_timeout)
            .timeout(config.api.request_timeout)
            .build()
            .context("failed to create HTTP client")?;

        // `Url::join` drops the last path segment of a base without a
        // trailing slash.
        let mut base = config.api.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base).context("invalid API base URL")?;

        Ok(Arc::new(Self {
            client,
            base_url,
            token: config.api.token.clone(),
            response_cache,
            fetch_pool,
            fetching: config.fetching,
            events,
        }))
    }

    pub fn response_cache(&self) -> &ResponseCache {
        &self.response_cache
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn fetching(&self) -> &Fetching {
        &self.fetching
    }

    pub(crate) fn fetch_pool(&self) -> &WorkerPool {
        &self.fetch_pool
    }

    /// Drops queued fetch work, typically right before shutdown.
    pub fn purge_fetches(&self) {
        self.fetch_pool.purge();
    }

    /// Builds an absolute request URL from a service path and query pairs.
    pub fn request_url(&self, path: &str, query: &[(&str, String)]) -> FetchResult<Url> {
        let mut url = self
            .base_url
            .join(path.trim_start_matches('/'))
            .map_err(|_| FetchError::InternalError)?;
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in query {
                pairs.append_pair(name, value);
            }
        }
        Ok(url)
    }

    /// Issues a read, going through the response cache.
    ///
    /// A still-valid cached body short-circuits the network entirely. An
    /// expired entry with an etag becomes a conditional request. Rate
    /// limiting is retried here, so callers never see a transient 429.
    pub async fn get(self: &Arc<Self>, url: &Url, ttl: CacheTtl) -> FetchResult<ApiResponse> {
        let key = ResponseCache::normalize_url(url);
        metric!(counter("api.read") += 1);

        if let Some(entry) = self.response_cache.lookup(&key)
            && entry.is_valid()
        {
            metric!(counter("api.read.cached") += 1);
            return Ok(ApiResponse {
                body: entry.body,
                freshness: Freshness::FromCache,
            });
        }

        retry_rate_limited(&self.fetching, || self.fetch_conditional(url, &key, ttl)).await
    }

    async fn fetch_conditional(
        &self,
        url: &Url,
        key: &str,
        ttl: CacheTtl,
    ) -> FetchResult<ApiResponse> {
        let etag = self.response_cache.lookup(key).and_then(|entry| entry.etag);

        let mut request = self.client.get(url.clone());
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        if let Some(etag) = &etag {
            request = request.header(header::IF_NONE_MATCH, etag.as_str());
        }

        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::NOT_MODIFIED {
            let new_etag = header_str(&response, header::ETAG);
            self.response_cache.refresh(key, new_etag.as_deref(), ttl);
            let Some(entry) = self.response_cache.lookup(key) else {
                // The entry was invalidated while the request was in flight.
                return Err(FetchError::InternalError);
            };
            metric!(counter("api.read.revalidated") += 1);
            tracing::trace!(url = %url, "not modified");
            return Ok(ApiResponse {
                body: entry.body,
                freshness: Freshness::Revalidated,
            });
        }

        if status == StatusCode::NO_CONTENT {
            return Ok(ApiResponse {
                body: Bytes::new(),
                freshness: Freshness::Modified,
            });
        }

        if status.is_success() {
            let new_etag = header_str(&response, header::ETAG);
            let body = response.bytes().await?;
            self.response_cache.store(key, new_etag.as_deref(), &body, ttl);
            metric!(counter("api.read.fetched") += 1);
            return Ok(ApiResponse {
                body,
                freshness: Freshness::Modified,
            });
        }

        Err(classify_error(response).await)
    }

    /// Issues a mutating request, bypassing the response cache.
    ///
    /// Callers invalidate the affected cache fragment themselves after a
    /// success, so the next read sees the change.
    pub async fn send_write(
        self: &Arc<Self>,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<serde_json::Value>,
    ) -> FetchResult<()> {
        let url = self.request_url(path, query)?;
        metric!(counter("api.write") += 1, "method" => method.as_str());

        retry_rate_limited(&self.fetching, || {
            let method = method.clone();
            let url = url.clone();
            let body = body.clone();
            async move {
                let mut request = self.client.request(method, url.clone());
                if let Some(token) = &self.token {
                    request = request.bearer_auth(token);
                }
                if let Some(body) = body {
                    request = request.json(&body);
                }

                let response = request.send().await?;
                if response.status().is_success() {
                    tracing::debug!(url = %url, "write accepted");
                    Ok(())
                } else {
                    Err(classify_error(response).await)
                }
            }
        })
        .await
    }
}

fn header_str(response: &reqwest::Response, name: header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
}

async fn classify_error(response: reqwest::Response) -> FetchError {
    let status = response.status();
    let url = response.url().clone();

    match status {
        StatusCode::TOO_MANY_REQUESTS => {
            let retry_after = header_str(&response, header::RETRY_AFTER)
                .and_then(|value| value.parse::<u64>().ok())
                .map(Duration::from_secs);
            FetchError::RateLimited { retry_after }
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            let details = response.text().await.unwrap_or_default();
            tracing::warn!(url = %url, "service rejected credentials");
            FetchError::NotAuthorized(details)
        }
        _ => {
            tracing::warn!(url = %url, status = status.as_u16(), "unexpected response status");
            FetchError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            }
        }
    }
}
