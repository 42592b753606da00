//! Fetching complete paginated collections.
//!
//! A [`CollectionRequest`] names the first page of a collection; the two
//! fetch strategies differ in how they reach the rest:
//!
//! - [`fetch_sequential`](CollectionRequest::fetch_sequential) walks the
//!   `next` links one page at a time. Works for offset and cursor
//!   pagination alike.
//! - [`fetch_concurrent`](CollectionRequest::fetch_concurrent) reads page 0
//!   to learn the total, then fans the remaining pages out across the
//!   fetch pool and reassembles them by page index. Requires offset
//!   pagination.
//!
//! Both are all-or-nothing: one failed page fails the collection and no
//! partial result escapes.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

use serde::de::DeserializeOwned;
use url::Url;

use crate::events::Event;
use crate::types::{CursorPage, Page};

use super::{ApiContext, CacheTtl, FetchError, FetchOutcome, FetchResult, Freshness, ItemRequest};

/// A paginated envelope, independent of the pagination flavor.
pub trait Paged: DeserializeOwned + Default + Send + 'static {
    type Item: Send + 'static;

    /// Total size of the collection, as reported by this page.
    fn total(&self) -> u64;

    /// Absolute URL of the following page, `None` on the last one.
    fn next(&self) -> Option<&str>;

    fn into_items(self) -> Vec<Self::Item>;
}

impl<T> Paged for Page<T>
where
    T: DeserializeOwned + Send + 'static,
{
    type Item = T;

    fn total(&self) -> u64 {
        self.total
    }

    fn next(&self) -> Option<&str> {
        self.next.as_deref()
    }

    fn into_items(self) -> Vec<T> {
        self.items
    }
}

impl<T> Paged for CursorPage<T>
where
    T: DeserializeOwned + Send + 'static,
{
    type Item = T;

    fn total(&self) -> u64 {
        self.total
    }

    fn next(&self) -> Option<&str> {
        self.next.as_deref()
    }

    fn into_items(self) -> Vec<T> {
        self.items
    }
}

/// A whole paginated collection, named by its first-page URL.
#[derive(Debug)]
pub struct CollectionRequest<P> {
    resource: &'static str,
    url: Url,
    envelope: Option<&'static str>,
    ttl: CacheTtl,
    _page: PhantomData<fn() -> P>,
}

impl<P: Paged> CollectionRequest<P> {
    /// A collection rooted at a service path.
    ///
    /// `resource` names the collection in progress events and logs. The
    /// query must not contain pagination parameters, those are appended per
    /// page.
    pub fn new(
        api: &ApiContext,
        resource: &'static str,
        path: &str,
        query: &[(&str, String)],
    ) -> FetchResult<Self> {
        Ok(Self {
            resource,
            url: api.request_url(path, query)?,
            envelope: None,
            ttl: CacheTtl::None,
            _page: PhantomData,
        })
    }

    pub fn cache_ttl(mut self, ttl: CacheTtl) -> Self {
        self.ttl = ttl;
        self
    }

    /// Decode pages out of the named envelope field.
    pub fn unwrap_field(mut self, field: &'static str) -> Self {
        self.envelope = Some(field);
        self
    }

    fn page_request(&self, index: u64, page_size: u64) -> ItemRequest<P> {
        let mut url = self.url.clone();
        url.query_pairs_mut()
            .append_pair("limit", &page_size.to_string())
            .append_pair("offset", &(index * page_size).to_string());
        ItemRequest::from_url(url)
            .cache_ttl(self.ttl)
            .maybe_unwrap(self.envelope)
    }

    /// The collection's total size according to the cached first page.
    ///
    /// This never makes a network call: with no cached first page it simply
    /// answers 0. Used to size UI lists before a real fetch happened.
    pub fn peek_total(&self, api: &ApiContext) -> u64 {
        let request = self.page_request(0, api.fetching().page_size);
        match request.execute_if_cached(api) {
            Ok(Some(outcome)) => outcome.value.total(),
            _ => 0,
        }
    }

    /// Fetches the whole collection by walking the `next` chain.
    pub async fn fetch_sequential(
        &self,
        api: &Arc<ApiContext>,
    ) -> FetchResult<FetchOutcome<Vec<P::Item>>> {
        let max_pages = api.fetching().max_pages;
        let page_size = api.fetching().page_size;
        let started = Instant::now();
        let mut items = Vec::new();
        let mut freshness = Freshness::FromCache;
        let mut request = self.page_request(0, page_size);
        let mut pages = 0;

        loop {
            let outcome = request.execute(api).await?;
            freshness = freshness.merge(outcome.freshness);
            pages += 1;

            let page = outcome.value;
            let total = page.total();
            if items.is_empty() {
                // The total is server-supplied; never reserve more than the
                // page bound can deliver.
                items.reserve(total.min(max_pages.saturating_mul(page_size)) as usize);
            }
            let next = page.next().map(str::to_owned);
            items.extend(page.into_items());

            api.events().notify(Event::FetchProgress {
                resource: self.resource,
                fetched: items.len() as u64,
                total,
            });

            match next {
                Some(_) if pages >= max_pages => {
                    tracing::warn!(
                        resource = self.resource,
                        pages,
                        "page chain exceeds configured bound, stopping early"
                    );
                    break;
                }
                Some(next) => {
                    let url = Url::parse(&next)
                        .map_err(|_| FetchError::Malformed(format!("bad next link: {next}")))?;
                    request = ItemRequest::from_url(url)
                        .cache_ttl(self.ttl)
                        .maybe_unwrap(self.envelope);
                }
                None => break,
            }
        }

        metric!(
            counter("api.collection") += 1,
            "resource" => self.resource,
            "strategy" => "sequential",
        );
        metric!(
            timer("api.collection.duration") = started.elapsed(),
            "resource" => self.resource,
            "strategy" => "sequential",
        );
        Ok(FetchOutcome::new(items, freshness))
    }

    /// Fetches the whole collection with concurrent page fan-out.
    ///
    /// Page 0 is read first to learn the total; pages `1..n` then run as
    /// independent tasks on the fetch pool. Results are reassembled in page
    /// order regardless of completion order. The merged freshness is
    /// [`Freshness::Modified`] as soon as any page carried a fresh body.
    pub async fn fetch_concurrent(
        &self,
        api: &Arc<ApiContext>,
    ) -> FetchResult<FetchOutcome<Vec<P::Item>>> {
        let page_size = api.fetching().page_size.max(1);
        let started = Instant::now();

        let first = self.page_request(0, page_size).execute(api).await?;
        let mut freshness = first.freshness;
        let total = first.value.total();
        let page_count = total.div_ceil(page_size).max(1).min(api.fetching().max_pages);

        let mut slots: Vec<Option<Vec<P::Item>>> = Vec::new();
        slots.resize_with(page_count as usize, || None);

        let first_items = first.value.into_items();
        let mut fetched = first_items.len() as u64;
        slots[0] = Some(first_items);
        api.events().notify(Event::FetchProgress {
            resource: self.resource,
            fetched,
            total,
        });

        let tasks = api.fetch_pool().submit_sequence(1..page_count, |index| {
            let api = Arc::clone(api);
            let request = self.page_request(index, page_size);
            async move { request.execute(&api).await }
        });

        // An early return drops the remaining handles, aborting their pages.
        for (index, task) in tasks {
            let outcome = match task.await {
                Ok(Some(result)) => result?,
                Ok(None) => return Err(FetchError::Canceled),
                Err(join_error) if join_error.is_cancelled() => return Err(FetchError::Canceled),
                Err(_) => return Err(FetchError::InternalError),
            };

            freshness = freshness.merge(outcome.freshness);
            let page_items = outcome.value.into_items();
            fetched += page_items.len() as u64;
            slots[index as usize] = Some(page_items);

            api.events().notify(Event::FetchProgress {
                resource: self.resource,
                fetched,
                total,
            });
        }

        // As above, the total is server-supplied and not to be trusted for
        // a reservation.
        let mut items = Vec::with_capacity(total.min(page_count.saturating_mul(page_size)) as usize);
        for slot in slots {
            match slot {
                Some(page_items) => items.extend(page_items),
                None => return Err(FetchError::InternalError),
            }
        }

        metric!(
            counter("api.collection") += 1,
            "resource" => self.resource,
            "strategy" => "concurrent",
        );
        metric!(
            timer("api.collection.duration") = started.elapsed(),
            "resource" => self.resource,
            "strategy" => "concurrent",
        );
        Ok(FetchOutcome::new(items, freshness))
    }
}
