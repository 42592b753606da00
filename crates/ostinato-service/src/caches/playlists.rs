//! The user's playlists.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::api::{ApiContext, CacheTtl, CollectionRequest, FetchOutcome, FetchResult};
use crate::caching::{CachedResource, TtlCache};
use crate::events::Event;
use crate::types::{Page, Playlist};

pub type PlaylistsCache = TtlCache<Playlists>;

/// Playlists page by `limit`/`offset`, so the whole collection can be fanned
/// out across the fetch pool once the first page reports its total.
pub struct Playlists {
    interval: Duration,
}

impl Playlists {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl CachedResource for Playlists {
    type Value = Vec<Playlist>;

    fn name(&self) -> &'static str {
        "Playlists"
    }

    fn sync_interval(&self) -> Duration {
        self.interval
    }

    fn request<'a>(
        &'a self,
        api: &'a Arc<ApiContext>,
    ) -> BoxFuture<'a, FetchResult<FetchOutcome<Vec<Playlist>>>> {
        Box::pin(async move {
            CollectionRequest::<Page<Playlist>>::new(api, "playlists", "me/playlists", &[])?
                .cache_ttl(CacheTtl::For(self.interval))
                .fetch_concurrent(api)
                .await
        })
    }

    fn changed_event(&self, new: Arc<Vec<Playlist>>, old: Arc<Vec<Playlist>>) -> Option<Event> {
        Some(Event::PlaylistsChanged { new, old })
    }
}
