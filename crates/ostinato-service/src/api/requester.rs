//! Fetching and decoding a single JSON document.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use url::Url;

use super::response_cache::ResponseCache;
use super::{ApiContext, CacheTtl, FetchError, FetchOutcome, FetchResult, Freshness};

/// One authenticated read returning one decoded document.
///
/// The request is configured with a [`CacheTtl`] deciding how long the raw
/// response stays servable from the response cache, and optionally with the
/// name of an envelope field to unwrap, for endpoints that nest their
/// payload one level deep.
#[derive(Debug)]
pub struct ItemRequest<T> {
    url: Url,
    ttl: CacheTtl,
    envelope: Option<&'static str>,
    _decoded: PhantomData<fn() -> T>,
}

impl<T> ItemRequest<T>
where
    T: DeserializeOwned + Default,
{
    /// A request against a service path, relative to the configured base URL.
    pub fn get(
        api: &ApiContext,
        path: &str,
        query: &[(&str, String)],
    ) -> FetchResult<Self> {
        Ok(Self::from_url(api.request_url(path, query)?))
    }

    /// A request against an absolute URL, as found in `next` page links.
    pub fn from_url(url: Url) -> Self {
        Self {
            url,
            ttl: CacheTtl::None,
            envelope: None,
            _decoded: PhantomData,
        }
    }

    pub fn cache_ttl(mut self, ttl: CacheTtl) -> Self {
        self.ttl = ttl;
        self
    }

    /// Decode the payload out of the named envelope field instead of the
    /// document root.
    pub fn unwrap_field(mut self, field: &'static str) -> Self {
        self.envelope = Some(field);
        self
    }

    pub(crate) fn maybe_unwrap(mut self, field: Option<&'static str>) -> Self {
        self.envelope = field;
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Runs the request through the response cache and decodes the result.
    ///
    /// A `204 No Content` answer decodes as `T::default()`, that is how the
    /// service reports "no active player" and similar absences.
    pub async fn execute(&self, api: &Arc<ApiContext>) -> FetchResult<FetchOutcome<T>> {
        let response = api.get(&self.url, self.ttl).await?;
        let value = self.decode(&response.body)?;
        Ok(FetchOutcome::new(value, response.freshness))
    }

    /// Decodes the cached response for this URL, never touching the network.
    ///
    /// Presence is all that matters here, an expired entry is decoded just
    /// the same. Returns `Ok(None)` when nothing is cached, a deliberate
    /// no-op for call sites that must not block on the service.
    pub fn execute_if_cached(&self, api: &ApiContext) -> FetchResult<Option<FetchOutcome<T>>> {
        let key = ResponseCache::normalize_url(&self.url);
        let Some(entry) = api.response_cache().lookup(&key) else {
            return Ok(None);
        };
        let value = self.decode(&entry.body)?;
        Ok(Some(FetchOutcome::new(value, Freshness::FromCache)))
    }

    fn decode(&self, body: &[u8]) -> FetchResult<T> {
        if body.is_empty() {
            return Ok(T::default());
        }

        let result = match self.envelope {
            Some(field) => {
                let mut document: serde_json::Value = serde_json::from_slice(body)?;
                match document.get_mut(field) {
                    Some(payload) => serde_json::from_value(payload.take()),
                    None => {
                        tracing::warn!(
                            url = %self.url,
                            field,
                            "envelope field missing from response"
                        );
                        return Err(FetchError::Malformed(format!(
                            "missing envelope field `{field}`"
                        )));
                    }
                }
            }
            None => serde_json::from_slice(body),
        };

        result.map_err(|error| {
            let snippet = String::from_utf8_lossy(&body[..body.len().min(256)]);
            tracing::warn!(
                url = %self.url,
                error = &error as &dyn std::error::Error,
                body = %snippet,
                "failed to decode response"
            );
            FetchError::Malformed(error.to_string())
        })
    }
}
