//! One running engine instance.
//!
//! A [`Session`] assembles the transport, the response cache, the resource
//! caches and the release scanner according to the provided
//! [`Config`], and owns the command surface that mutates remote state.
//! Every write bypasses the response cache, invalidates the cached responses
//! it made stale, and optimistically patches the affected resource cache so
//! observers see the intended state before the service reports it.

use std::sync::Arc;

use anyhow::Result;
use reqwest::Method;
use serde_json::json;
use tokio::runtime::Handle;
use tokio::sync::broadcast;

use crate::api::{ApiContext, BatchRequest, CacheTtl, FetchResult, ResponseCache};
use crate::caches::{
    Activity, Devices, DevicesCache, FollowedArtists, FollowedArtistsCache, ObserverGuard,
    Playback, PlaybackCache, Playlists, PlaylistsCache,
};
use crate::caching::TtlCache;
use crate::config::Config;
use crate::events::{Event, EventBus};
use crate::releases::{ReleaseScanner, ReleasesCache};
use crate::settings::{JsonSettings, MemorySettings, SettingsStore};
use crate::types::{Album, AlbumId, ArtistId, DeviceId, RepeatState};
use crate::workers::{CancelOnDrop, WorkerPool};

pub struct Session {
    pub config: Config,
    pub api: Arc<ApiContext>,
    pub events: EventBus,
    pub playback: PlaybackCache,
    pub devices: DevicesCache,
    pub followed_artists: FollowedArtistsCache,
    pub playlists: PlaylistsCache,
    pub releases: ReleasesCache,
    settings: Arc<dyn SettingsStore>,
    activity: Activity,
    runtime: Handle,
}

impl Session {
    pub fn new(config: Config, runtime: Handle) -> Result<Arc<Self>> {
        let events = EventBus::new();
        let activity = Activity::new();

        let settings: Arc<dyn SettingsStore> = match config.data_file("settings.json") {
            Some(path) => Arc::new(JsonSettings::open(path)),
            None => Arc::new(MemorySettings::new()),
        };
        let response_cache = ResponseCache::load(config.data_file("http_cache.json"));

        let fetch_pool = WorkerPool::new(
            "fetch",
            config.fetching.max_concurrent_fetches,
            runtime.clone(),
        );
        let api = ApiContext::new(&config, response_cache, fetch_pool, events.clone())?;

        let patch_expiry = config.sync.patch_expiry;
        let playback = TtlCache::new(
            Playback::new(config.sync.playback, activity.clone()),
            patch_expiry,
            events.clone(),
        );
        let devices = TtlCache::new(
            Devices::new(config.sync.devices),
            patch_expiry,
            events.clone(),
        );
        let followed_artists = TtlCache::new(
            FollowedArtists::new(config.sync.followed_artists),
            patch_expiry,
            events.clone(),
        );
        let playlists = TtlCache::new(
            Playlists::new(config.sync.playlists),
            patch_expiry,
            events.clone(),
        );
        let releases = TtlCache::new(
            ReleaseScanner::new(&config, activity.clone(), runtime.clone()),
            patch_expiry,
            events.clone(),
        );

        let session = Self {
            config,
            api,
            events,
            playback,
            devices,
            followed_artists,
            playlists,
            releases,
            settings,
            activity,
            runtime,
        };
        session.restore();
        Ok(Arc::new(session))
    }

    fn restore(&self) {
        let settings = self.settings.as_ref();
        self.playback.restore(settings);
        self.devices.restore(settings);
        self.followed_artists.restore(settings);
        self.playlists.restore(settings);
        self.releases.restore(settings);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Marks playback as observed for the lifetime of the guard.
    ///
    /// While at least one guard is alive the poll tick keeps the playback
    /// state fresh and the release sweep runs in its careful mode.
    pub fn observe_playback(&self) -> ObserverGuard {
        self.activity.observe()
    }

    /// Brings every cache in step with the service.
    ///
    /// Individual failures are already logged and absorbed by the caches;
    /// the stale cache simply tries again on the next call.
    pub async fn resync_all(&self, force: bool) {
        let _ = tokio::join!(
            self.playback.resync(&self.api, force),
            self.devices.resync(&self.api, force),
            self.followed_artists.resync(&self.api, force),
            self.playlists.resync(&self.api, force),
        );
        let _ = self.releases.resync(&self.api, force).await;
    }

    /// Spawns the background loops driving unforced resyncs.
    ///
    /// The interactive caches share a fast loop. The release sweep gets its
    /// own, since a sweep legitimately runs for minutes and must never hold
    /// up the playback poll. Dropping the returned [`Poller`] stops both.
    pub fn spawn_poller(self: &Arc<Self>) -> Poller {
        let poll = self.config.sync.poll;

        let session = Arc::clone(self);
        let interactive = self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(poll);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let _ = tokio::join!(
                    session.playback.resync(&session.api, false),
                    session.devices.resync(&session.api, false),
                    session.followed_artists.resync(&session.api, false),
                    session.playlists.resync(&session.api, false),
                );
            }
        });

        let session = Arc::clone(self);
        let sweeps = self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(poll);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let _ = session.releases.resync(&session.api, false).await;
            }
        });

        Poller {
            _interactive: CancelOnDrop::new(interactive),
            _sweeps: CancelOnDrop::new(sweeps),
        }
    }

    /// Stops queued background work and writes all persistent state out.
    ///
    /// Steps already running are left to finish; they only touch in-memory
    /// state and must tolerate completing after this returns.
    pub fn shutdown(&self) {
        tracing::info!("shutting down session");
        self.api.purge_fetches();
        self.releases.resource().purge();

        let settings = self.settings.as_ref();
        self.playback.persist(settings);
        self.devices.persist(settings);
        self.followed_artists.persist(settings);
        self.playlists.persist(settings);
        self.releases.persist(settings);

        if let Err(error) = self.settings.flush() {
            tracing::warn!("failed to flush settings: {error:?}");
        }
        if let Err(error) = self.api.response_cache().persist() {
            tracing::warn!("failed to persist response cache: {error:?}");
        }
    }

    /// Issues a write, reporting a rejection through the bus.
    async fn send_command(
        &self,
        command: &'static str,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<serde_json::Value>,
    ) -> FetchResult<()> {
        metric!(counter("commands") += 1, "command" => command);
        match self.api.send_write(method, path, query, body).await {
            Ok(()) => Ok(()),
            Err(error) => {
                metric!(counter("commands.failed") += 1, "command" => command);
                tracing::warn!(
                    command,
                    error = &error as &dyn std::error::Error,
                    "command rejected"
                );
                self.events.notify(Event::CommandFailed {
                    command,
                    message: error.to_string(),
                });
                Err(error)
            }
        }
    }

    pub async fn play(&self) -> FetchResult<()> {
        self.send_command("play", Method::PUT, "me/player/play", &[], None)
            .await?;
        self.api.response_cache().invalidate("me/player");
        self.playback.patch(|state| state.is_playing = true);
        Ok(())
    }

    pub async fn pause(&self) -> FetchResult<()> {
        self.send_command("pause", Method::PUT, "me/player/pause", &[], None)
            .await?;
        self.api.response_cache().invalidate("me/player");
        self.playback.patch(|state| state.is_playing = false);
        Ok(())
    }

    pub async fn next_track(&self) -> FetchResult<()> {
        self.send_command("next_track", Method::POST, "me/player/next", &[], None)
            .await?;
        self.api.response_cache().invalidate("me/player");
        self.playback.invalidate();
        Ok(())
    }

    pub async fn previous_track(&self) -> FetchResult<()> {
        self.send_command(
            "previous_track",
            Method::POST,
            "me/player/previous",
            &[],
            None,
        )
        .await?;
        self.api.response_cache().invalidate("me/player");
        self.playback.invalidate();
        Ok(())
    }

    pub async fn seek(&self, position_ms: u64) -> FetchResult<()> {
        self.send_command(
            "seek",
            Method::PUT,
            "me/player/seek",
            &[("position_ms", position_ms.to_string())],
            None,
        )
        .await?;
        self.api.response_cache().invalidate("me/player");
        self.playback
            .patch(move |state| state.progress_ms = Some(position_ms));
        Ok(())
    }

    pub async fn set_volume(&self, percent: u32) -> FetchResult<()> {
        self.send_command(
            "set_volume",
            Method::PUT,
            "me/player/volume",
            &[("volume_percent", percent.to_string())],
            None,
        )
        .await?;
        self.api.response_cache().invalidate("me/player");
        self.playback.patch(move |state| {
            if let Some(device) = &mut state.device {
                device.volume_percent = Some(percent);
            }
        });
        Ok(())
    }

    pub async fn set_shuffle(&self, shuffle: bool) -> FetchResult<()> {
        self.send_command(
            "set_shuffle",
            Method::PUT,
            "me/player/shuffle",
            &[("state", shuffle.to_string())],
            None,
        )
        .await?;
        self.api.response_cache().invalidate("me/player");
        self.playback.patch(move |state| state.shuffle_state = shuffle);
        Ok(())
    }

    pub async fn set_repeat(&self, repeat: RepeatState) -> FetchResult<()> {
        self.send_command(
            "set_repeat",
            Method::PUT,
            "me/player/repeat",
            &[("state", repeat.as_str().to_owned())],
            None,
        )
        .await?;
        self.api.response_cache().invalidate("me/player");
        self.playback.patch(move |state| state.repeat_state = repeat);
        Ok(())
    }

    /// Moves playback onto another device.
    pub async fn transfer_playback(&self, device: DeviceId) -> FetchResult<()> {
        self.send_command(
            "transfer_playback",
            Method::PUT,
            "me/player",
            &[],
            Some(json!({ "device_ids": [device] })),
        )
        .await?;
        self.api.response_cache().invalidate("me/player");
        self.playback.invalidate();
        self.devices.invalidate();
        Ok(())
    }

    pub async fn follow_artist(&self, id: ArtistId) -> FetchResult<()> {
        self.send_command(
            "follow_artist",
            Method::PUT,
            "me/following",
            &[("type", "artist".to_owned()), ("ids", id.to_string())],
            None,
        )
        .await?;
        self.after_membership_change(id, true);
        Ok(())
    }

    pub async fn unfollow_artist(&self, id: ArtistId) -> FetchResult<()> {
        self.send_command(
            "unfollow_artist",
            Method::DELETE,
            "me/following",
            &[("type", "artist".to_owned()), ("ids", id.to_string())],
            None,
        )
        .await?;
        // The library list can be fixed up locally while the next resync is
        // on its way; a follow cannot, the artist's name is not known here.
        let gone = id.clone();
        self.followed_artists
            .patch(move |artists| artists.retain(|artist| artist.id != gone));
        self.after_membership_change(id, false);
        Ok(())
    }

    fn after_membership_change(&self, id: ArtistId, followed: bool) {
        self.api.response_cache().invalidate("me/following");
        self.followed_artists.invalidate();
        if !self.releases.resource().membership_changed(id, followed) {
            // No sweep running that could pick the change up incrementally.
            self.releases.invalidate();
        }
    }

    /// Looks up full album records in bulk, through the batch endpoint.
    pub async fn albums_by_ids(&self, ids: &[AlbumId]) -> FetchResult<Vec<Album>> {
        let outcome = BatchRequest::<Album>::new("albums", "albums")
            .cache_ttl(CacheTtl::Session)
            .execute(&self.api, ids)
            .await?;
        Ok(outcome.value)
    }
}

/// Handle to the background resync loops; dropping it stops them.
pub struct Poller {
    _interactive: CancelOnDrop<()>,
    _sweeps: CancelOnDrop<()>,
}
