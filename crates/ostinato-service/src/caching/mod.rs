//! # Resource caching
//!
//! Every piece of remote state the engine mirrors locally (playback state,
//! devices, followed artists, playlists, recent releases) lives in one
//! [`TtlCache`]. A cache cycles through three states:
//!
//! - **Stale**: the value is older than the resource's sync interval, or
//!   was never fetched, or was explicitly invalidated. The next poll tick
//!   triggers a resync.
//! - **Syncing**: a fetch against the service is in flight. Reads keep
//!   serving the previous value; a second resync request is a no-op.
//! - **Fresh**: [`TtlCache::resync`] stored an authoritative value within
//!   the sync interval. Unforced resyncs are no-ops until it expires.
//!
//! ## Optimistic patches
//!
//! Write commands do not wait for a subsequent read to confirm their
//! effect. They queue a patch closure describing the local consequence
//! (pause clears `is_playing`, seek rewrites the progress) and invalidate
//! the cache. The next resync fetches the authoritative value and applies
//! the queued patches on top before storing and notifying, so observers
//! see the user's intent even while the service still reports the old
//! state. A patch not consumed within a short window is dropped unused;
//! from then on, server truth wins.
//!
//! ## Persistence
//!
//! A cache persists its value and last-sync instant through the settings
//! store under two keys, `<Name>` and `<Name>Time`. Restoring tolerates
//! missing or malformed data by starting cold.

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::api::{ApiContext, FetchOutcome, FetchResult};
use crate::events::{Event, EventBus};
use crate::settings::SettingsStore;

/// A queued local effect, applied to the next authoritative value.
pub type Patch<V> = Box<dyn FnOnce(&mut V) + Send>;

/// A remote resource that can live in a [`TtlCache`].
pub trait CachedResource: Send + Sync + 'static {
    type Value: Clone
        + Default
        + PartialEq
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static;

    /// Name used in settings keys, metrics and logs.
    fn name(&self) -> &'static str;

    /// How long a synced value counts as current.
    fn sync_interval(&self) -> Duration;

    /// Whether anything observes this resource right now.
    ///
    /// Unforced resyncs of inactive resources are skipped, so a resource
    /// nobody looks at costs no requests.
    fn is_active(&self) -> bool {
        true
    }

    /// Fetches the authoritative value from the service.
    fn request<'a>(
        &'a self,
        api: &'a Arc<ApiContext>,
    ) -> BoxFuture<'a, FetchResult<FetchOutcome<Self::Value>>>;

    /// The event broadcast when a resync changed the value.
    fn changed_event(&self, new: Arc<Self::Value>, old: Arc<Self::Value>) -> Option<Event>;
}

struct CacheState<V> {
    value: Arc<V>,
    last_sync_at: SystemTime,
    pending_patches: Vec<(SystemTime, Patch<V>)>,
    syncing: bool,
}

/// Clears the syncing flag on drop, so a resync future that is dropped
/// mid-await cannot wedge the cache in the syncing state.
struct SyncingReset<'a, V>(&'a Mutex<CacheState<V>>);

impl<V> Drop for SyncingReset<'_, V> {
    fn drop(&mut self) {
        let mut state = match self.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.syncing = false;
    }
}

/// A TTL-governed local mirror of one remote resource.
pub struct TtlCache<R: CachedResource> {
    resource: R,
    patch_expiry: Duration,
    events: EventBus,
    state: Mutex<CacheState<R::Value>>,
}

impl<R: CachedResource> TtlCache<R> {
    pub fn new(resource: R, patch_expiry: Duration, events: EventBus) -> Self {
        Self {
            resource,
            patch_expiry,
            events,
            state: Mutex::new(CacheState {
                value: Arc::new(R::Value::default()),
                last_sync_at: UNIX_EPOCH,
                pending_patches: Vec::new(),
                syncing: false,
            }),
        }
    }

    pub fn resource(&self) -> &R {
        &self.resource
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheState<R::Value>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// The current value. Never blocks on the network.
    pub fn get(&self) -> Arc<R::Value> {
        Arc::clone(&self.lock().value)
    }

    /// Whether the value is within its sync interval.
    pub fn is_valid(&self) -> bool {
        let last_sync_at = self.lock().last_sync_at;
        last_sync_at + self.resource.sync_interval() > SystemTime::now()
    }

    /// Marks the value stale so the next poll tick refetches it.
    pub fn invalidate(&self) {
        self.lock().last_sync_at = UNIX_EPOCH;
    }

    /// Queues a local effect and marks the value stale.
    ///
    /// The patch is applied on top of the next fetched value, bridging the
    /// gap until the service reports the command's effect itself. Patching
    /// never notifies; the resync that consumes the patch does.
    pub fn patch(&self, patch: impl FnOnce(&mut R::Value) + Send + 'static) {
        metric!(counter("caches.patch") += 1, "cache" => self.resource.name());
        let mut state = self.lock();
        state
            .pending_patches
            .push((SystemTime::now(), Box::new(patch)));
        state.last_sync_at = UNIX_EPOCH;
    }

    /// Brings the value in step with the service.
    ///
    /// Without `force` this is a no-op while the value is still valid, the
    /// resource is inactive, or another resync is in flight. On a fetch
    /// error the previously held value stays untouched and the cache stays
    /// stale, so the next tick tries again.
    pub async fn resync(&self, api: &Arc<ApiContext>, force: bool) -> FetchResult<()> {
        let name = self.resource.name();
        {
            let mut state = self.lock();
            if state.syncing {
                return Ok(());
            }
            if !force {
                if !self.resource.is_active() {
                    metric!(counter("caches.resync.skipped") += 1, "cache" => name, "reason" => "inactive");
                    return Ok(());
                }
                let valid =
                    state.last_sync_at + self.resource.sync_interval() > SystemTime::now();
                if valid {
                    return Ok(());
                }
            }
            state.syncing = true;
        }
        let _reset = SyncingReset(&self.state);

        metric!(counter("caches.resync") += 1, "cache" => name);
        let result = self.resource.request(api).await;

        match result {
            Ok(outcome) => {
                let (old, new, event) = {
                    let mut state = self.lock();

                    let mut value = outcome.value;
                    let now = SystemTime::now();
                    let expiry = self.patch_expiry;
                    for (queued_at, patch) in state.pending_patches.drain(..) {
                        let age = now.duration_since(queued_at).unwrap_or_default();
                        if age > expiry {
                            metric!(counter("caches.patch.expired") += 1, "cache" => name);
                            continue;
                        }
                        patch(&mut value);
                    }

                    let old = Arc::clone(&state.value);
                    let new = Arc::new(value);
                    let changed = *old != *new;
                    state.value = Arc::clone(&new);
                    state.last_sync_at = now;

                    let event = changed
                        .then(|| self.resource.changed_event(Arc::clone(&new), Arc::clone(&old)))
                        .flatten();
                    (old, new, event)
                };

                if let Some(event) = event {
                    tracing::debug!(cache = name, "value changed");
                    self.events.notify(event);
                }
                drop((old, new));
                Ok(())
            }
            Err(error) => {
                metric!(counter("caches.resync.failed") += 1, "cache" => name);
                tracing::warn!(
                    cache = name,
                    error = &error as &dyn std::error::Error,
                    "resync failed, keeping previous value"
                );
                Err(error)
            }
        }
    }

    /// Writes the value and its sync instant to the settings store.
    pub fn persist(&self, settings: &dyn SettingsStore) {
        let name = self.resource.name();
        let (value, last_sync_at) = {
            let state = self.lock();
            (Arc::clone(&state.value), state.last_sync_at)
        };

        match serde_json::to_string(&*value) {
            Ok(serialized) => {
                settings.set_str(name, serialized);
                let millis = last_sync_at
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_millis() as i64;
                settings.set_i64(&format!("{name}Time"), millis);
            }
            Err(error) => {
                tracing::warn!(
                    cache = name,
                    error = &error as &dyn std::error::Error,
                    "failed to serialize cache value"
                );
            }
        }
    }

    /// Reads a previously persisted value back, staying cold when there is
    /// none or it does not deserialize anymore.
    pub fn restore(&self, settings: &dyn SettingsStore) {
        let name = self.resource.name();
        let Some(serialized) = settings.get_str(name) else {
            return;
        };

        let value: R::Value = match serde_json::from_str(&serialized) {
            Ok(value) => value,
            Err(error) => {
                tracing::warn!(
                    cache = name,
                    error = &error as &dyn std::error::Error,
                    "discarding unreadable persisted value"
                );
                return;
            }
        };

        let millis = settings.get_i64(&format!("{name}Time")).unwrap_or_default();
        let last_sync_at = UNIX_EPOCH + Duration::from_millis(millis.max(0) as u64);

        let mut state = self.lock();
        state.value = Arc::new(value);
        state.last_sync_at = last_sync_at;
        tracing::debug!(cache = name, "restored persisted value");
    }
}
