//! The devices available for playback.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::api::{ApiContext, CacheTtl, FetchOutcome, FetchResult, ItemRequest};
use crate::caching::{CachedResource, TtlCache};
use crate::events::Event;
use crate::types::Device;

pub type DevicesCache = TtlCache<Devices>;

pub struct Devices {
    interval: Duration,
}

impl Devices {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl CachedResource for Devices {
    type Value = Vec<Device>;

    fn name(&self) -> &'static str {
        "Devices"
    }

    fn sync_interval(&self) -> Duration {
        self.interval
    }

    fn request<'a>(
        &'a self,
        api: &'a Arc<ApiContext>,
    ) -> BoxFuture<'a, FetchResult<FetchOutcome<Vec<Device>>>> {
        Box::pin(async move {
            ItemRequest::get(api, "me/player/devices", &[])?
                .cache_ttl(CacheTtl::For(self.interval))
                .unwrap_field("devices")
                .execute(api)
                .await
        })
    }

    fn changed_event(&self, new: Arc<Vec<Device>>, old: Arc<Vec<Device>>) -> Option<Event> {
        Some(Event::DevicesChanged { new, old })
    }
}
