//! The artists the user follows.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::api::{ApiContext, CacheTtl, CollectionRequest, FetchOutcome, FetchResult};
use crate::caching::{CachedResource, TtlCache};
use crate::events::Event;
use crate::types::{Artist, CursorPage};

pub type FollowedArtistsCache = TtlCache<FollowedArtists>;

/// The following endpoint pages with opaque `after` cursors, so page URLs
/// cannot be computed up front and the fetch walks the chain sequentially.
pub struct FollowedArtists {
    interval: Duration,
}

impl FollowedArtists {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl CachedResource for FollowedArtists {
    type Value = Vec<Artist>;

    fn name(&self) -> &'static str {
        "FollowedArtists"
    }

    fn sync_interval(&self) -> Duration {
        self.interval
    }

    fn request<'a>(
        &'a self,
        api: &'a Arc<ApiContext>,
    ) -> BoxFuture<'a, FetchResult<FetchOutcome<Vec<Artist>>>> {
        Box::pin(async move {
            CollectionRequest::<CursorPage<Artist>>::new(
                api,
                "followed_artists",
                "me/following",
                &[("type", "artist".to_owned())],
            )?
            .cache_ttl(CacheTtl::For(self.interval))
            .unwrap_field("artists")
            .fetch_sequential(api)
            .await
        })
    }

    fn changed_event(&self, new: Arc<Vec<Artist>>, old: Arc<Vec<Artist>>) -> Option<Event> {
        Some(Event::FollowedArtistsChanged { new, old })
    }
}
