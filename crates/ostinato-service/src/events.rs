//! Change notifications fanned out to whoever is watching the session.
//!
//! Notification is fire-and-forget on the sending task. Consumers get their
//! own [`broadcast::Receiver`] and are responsible for keeping up; a slow
//! consumer only loses its own backlog, never blocks a sync.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::types::{Album, Artist, Device, PlaybackState, Playlist};

/// Everything the engine reports to the outside world.
#[derive(Clone, Debug)]
pub enum Event {
    /// The playback snapshot differs from the previous one.
    PlaybackChanged {
        new: Arc<PlaybackState>,
        old: Arc<PlaybackState>,
    },
    /// The set of available devices changed.
    DevicesChanged {
        new: Arc<Vec<Device>>,
        old: Arc<Vec<Device>>,
    },
    /// The followed-artists library changed.
    FollowedArtistsChanged {
        new: Arc<Vec<Artist>>,
        old: Arc<Vec<Artist>>,
    },
    /// The user's playlists changed.
    PlaylistsChanged {
        new: Arc<Vec<Playlist>>,
        old: Arc<Vec<Playlist>>,
    },
    /// A release scan finished and found albums that were not known before.
    ReleasesFound {
        fresh: Arc<Vec<Album>>,
        all: Arc<Vec<Album>>,
    },
    /// A multi-page fetch finished another page.
    FetchProgress {
        resource: &'static str,
        fetched: u64,
        total: u64,
    },
    /// A write command was rejected by the service.
    CommandFailed {
        command: &'static str,
        message: String,
    },
}

/// Broadcast fan-out of [`Event`]s.
///
/// Cloning shares the underlying channel.
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Delivers an event to all current subscribers.
    ///
    /// Having no subscribers is not an error, the event is simply dropped.
    pub fn notify(&self, event: Event) {
        metric!(counter("events.notify") += 1);
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
