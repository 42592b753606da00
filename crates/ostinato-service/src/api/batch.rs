//! Looking up many entities by id in bounded groups.

use std::fmt::Display;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use super::{ApiContext, CacheTtl, FetchOutcome, FetchResult, Freshness, ItemRequest};

/// Fetches a set of entities through an `?ids=` endpoint.
///
/// Ids are split into consecutive chunks no larger than the configured
/// chunk size and fetched sequentially; the decoded chunks are concatenated
/// in input order. The first failing chunk aborts the whole batch, partial
/// results never escape.
#[derive(Debug)]
pub struct BatchRequest<T> {
    path: &'static str,
    envelope: &'static str,
    ttl: CacheTtl,
    _decoded: PhantomData<fn() -> T>,
}

impl<T> BatchRequest<T>
where
    T: DeserializeOwned,
{
    /// A batch against `path`, decoding the array out of `envelope`.
    ///
    /// Batched endpoints always wrap their payload, `/albums?ids=` answers
    /// with `{"albums": [...]}`.
    pub fn new(path: &'static str, envelope: &'static str) -> Self {
        Self {
            path,
            envelope,
            ttl: CacheTtl::None,
            _decoded: PhantomData,
        }
    }

    pub fn cache_ttl(mut self, ttl: CacheTtl) -> Self {
        self.ttl = ttl;
        self
    }

    pub async fn execute<I>(
        &self,
        api: &Arc<ApiContext>,
        ids: &[I],
    ) -> FetchResult<FetchOutcome<Vec<T>>>
    where
        I: Display,
    {
        let chunk_size = api.fetching().chunk_size.max(1);
        let mut items = Vec::with_capacity(ids.len());
        let mut freshness = Freshness::FromCache;

        for chunk in joined_chunks(ids, chunk_size) {
            let request = ItemRequest::<Vec<T>>::get(api, self.path, &[("ids", chunk)])?
                .cache_ttl(self.ttl)
                .unwrap_field(self.envelope);
            let outcome = request.execute(api).await?;
            freshness = freshness.merge(outcome.freshness);
            items.extend(outcome.value);
        }

        metric!(
            counter("api.batch") += 1,
            "resource" => self.path.trim_start_matches('/'),
        );
        Ok(FetchOutcome::new(items, freshness))
    }
}

/// Joins ids into comma-separated groups of at most `chunk_size`.
fn joined_chunks<I: Display>(ids: &[I], chunk_size: usize) -> Vec<String> {
    ids.chunks(chunk_size)
        .map(|chunk| {
            let mut joined = String::new();
            for (i, id) in chunk.iter().enumerate() {
                if i > 0 {
                    joined.push(',');
                }
                joined.push_str(&id.to_string());
            }
            joined
        })
        .collect()
}
