//! The concrete cached resources.
//!
//! Each submodule pairs one remote resource with its
//! [`CachedResource`](crate::caching::CachedResource) implementation: where
//! it lives on the service, how long a synced value stays current, and which
//! event a change broadcasts. The generic cache machinery lives in
//! [`crate::caching`]; nothing here touches the network directly.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

pub mod artists;
pub mod devices;
pub mod playback;
pub mod playlists;

pub use self::artists::{FollowedArtists, FollowedArtistsCache};
pub use self::devices::{Devices, DevicesCache};
pub use self::playback::{Playback, PlaybackCache};
pub use self::playlists::{Playlists, PlaylistsCache};

/// Tracks whether anyone currently observes playback.
///
/// The playback cache only resyncs while at least one [`ObserverGuard`] is
/// alive, and the release scanner stretches its delays while one is, since
/// the polling loop is already keeping the service busy.
#[derive(Clone, Debug, Default)]
pub struct Activity {
    observers: Arc<AtomicUsize>,
}

impl Activity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an observer for the lifetime of the returned guard.
    #[must_use = "observation ends when the guard is dropped"]
    pub fn observe(&self) -> ObserverGuard {
        self.observers.fetch_add(1, Ordering::SeqCst);
        ObserverGuard {
            observers: Arc::clone(&self.observers),
        }
    }

    pub fn is_observed(&self) -> bool {
        self.observers.load(Ordering::SeqCst) > 0
    }
}

#[derive(Debug)]
pub struct ObserverGuard {
    observers: Arc<AtomicUsize>,
}

impl Drop for ObserverGuard {
    fn drop(&mut self) {
        self.observers.fetch_sub(1, Ordering::SeqCst);
    }
}
