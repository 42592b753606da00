//! The playback state of the active player.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::api::{ApiContext, CacheTtl, FetchOutcome, FetchResult, ItemRequest};
use crate::caching::{CachedResource, TtlCache};
use crate::events::Event;
use crate::types::PlaybackState;

use super::Activity;

pub type PlaybackCache = TtlCache<Playback>;

/// The most frequently polled resource, and the only one with an activity
/// gate: while nobody holds an observer guard, the poll tick skips it.
pub struct Playback {
    interval: Duration,
    activity: Activity,
}

impl Playback {
    pub fn new(interval: Duration, activity: Activity) -> Self {
        Self { interval, activity }
    }
}

impl CachedResource for Playback {
    type Value = PlaybackState;

    fn name(&self) -> &'static str {
        "PlaybackState"
    }

    fn sync_interval(&self) -> Duration {
        self.interval
    }

    fn is_active(&self) -> bool {
        self.activity.is_observed()
    }

    // The player endpoint answers `204 No Content` when nothing is playing,
    // which decodes as the inactive default state. The body changes with
    // every progress tick, so it is never worth caching beyond an etag hint.
    fn request<'a>(
        &'a self,
        api: &'a Arc<ApiContext>,
    ) -> BoxFuture<'a, FetchResult<FetchOutcome<PlaybackState>>> {
        Box::pin(async move {
            ItemRequest::get(api, "me/player", &[])?
                .cache_ttl(CacheTtl::None)
                .execute(api)
                .await
        })
    }

    fn changed_event(
        &self,
        new: Arc<PlaybackState>,
        old: Arc<PlaybackState>,
    ) -> Option<Event> {
        Some(Event::PlaybackChanged { new, old })
    }
}
