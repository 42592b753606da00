//! Background discovery of recently released albums.
//!
//! The scanner is a [`CachedResource`] whose `request` is a whole sweep
//! rather than a single fetch: it pulls the followed-artists list, then walks
//! every artist's album collection through a small private worker pool,
//! keeping albums released within the configured age window. The pool slot is
//! held through an adaptive pause after every step that had to talk to the
//! service, so a sweep over a large library spreads its requests out instead
//! of bursting into the rate limiter. Steps answered straight from the
//! response cache pause not at all, which is what makes a re-sweep shortly
//! after a completed one close to free.
//!
//! Follow and unfollow commands during a running sweep do not restart it.
//! They are queued and replayed as incremental steps before the sweep drains:
//! a follow scans the one new artist, an unfollow prunes the artist's albums
//! from the interim set. Steps for artists unfollowed after they were
//! enqueued notice at execution time and skip themselves.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use futures::future::BoxFuture;
use tokio::runtime::Handle;

use crate::api::{
    ApiContext, CacheTtl, CollectionRequest, FetchError, FetchOutcome, FetchResult, Freshness,
};
use crate::caches::Activity;
use crate::caching::{CachedResource, TtlCache};
use crate::config::{Config, Scanner, SyncIntervals};
use crate::events::Event;
use crate::types::{Album, AlbumId, Artist, ArtistId, CursorPage, Page};
use crate::workers::{CancelOnDrop, WorkerPool};

pub type ReleasesCache = TtlCache<ReleaseScanner>;

/// Follow-set bookkeeping shared between the sweep and the command side.
struct ScanState {
    scanning: bool,
    followed: BTreeSet<ArtistId>,
    /// Membership changes that arrived while a sweep was running, replayed
    /// as incremental steps before it drains.
    queued: Vec<(ArtistId, bool)>,
}

/// Leaves the scanning state on drop, whether the sweep finished, failed or
/// was dropped mid-flight. Queued membership changes are discarded with it;
/// the next sweep's followed-list fetch supersedes them.
struct ScanReset(Arc<Mutex<ScanState>>);

impl Drop for ScanReset {
    fn drop(&mut self) {
        let mut state = lock(&self.0);
        state.scanning = false;
        state.queued.clear();
    }
}

pub struct ReleaseScanner {
    sync: SyncIntervals,
    scanner: Scanner,
    activity: Activity,
    pool: WorkerPool,
    state: Arc<Mutex<ScanState>>,
}

impl ReleaseScanner {
    pub fn new(config: &Config, activity: Activity, runtime: Handle) -> Self {
        Self {
            sync: config.sync,
            scanner: config.scanner,
            activity,
            pool: WorkerPool::new("scan", config.scanner.concurrency, runtime),
            state: Arc::new(Mutex::new(ScanState {
                scanning: false,
                followed: BTreeSet::new(),
                queued: Vec::new(),
            })),
        }
    }

    /// Records a follow or unfollow.
    ///
    /// Returns true when a sweep is running and picked the change up as an
    /// incremental step. Otherwise the caller invalidates the releases cache
    /// so the next poll tick starts a sweep.
    pub fn membership_changed(&self, id: ArtistId, followed: bool) -> bool {
        let mut state = lock(&self.state);
        if followed {
            state.followed.insert(id.clone());
        } else {
            state.followed.remove(&id);
        }
        if state.scanning {
            state.queued.push((id, followed));
            true
        } else {
            false
        }
    }

    /// Drops sweep steps that have not started yet.
    pub fn purge(&self) {
        self.pool.purge();
    }

    async fn run_scan(&self, api: &Arc<ApiContext>) -> FetchResult<FetchOutcome<Vec<Album>>> {
        let followed = CollectionRequest::<CursorPage<Artist>>::new(
            api,
            "followed_artists",
            "me/following",
            &[("type", "artist".to_owned())],
        )?
        .cache_ttl(CacheTtl::For(self.sync.followed_artists))
        .unwrap_field("artists")
        .fetch_sequential(api)
        .await?;

        let mut freshness = followed.freshness;
        let ids: Vec<ArtistId> = {
            let mut state = lock(&self.state);
            let mut set: BTreeSet<ArtistId> =
                followed.value.into_iter().map(|artist| artist.id).collect();
            // Commands that raced the list fetch win over the fetched state.
            for (id, followed) in &state.queued {
                if *followed {
                    set.insert(id.clone());
                } else {
                    set.remove(id);
                }
            }
            state.followed = set;
            state.followed.iter().cloned().collect()
        };

        tracing::debug!(artists = ids.len(), "starting release sweep");
        metric!(gauge("releases.scan.artists") = ids.len() as u64);

        let found = Arc::new(Mutex::new(BTreeMap::new()));
        let steps: Vec<_> = ids
            .into_iter()
            .map(|id| self.pool.submit(self.scan_step(api, &found, id, true)))
            .collect();
        for step in steps {
            freshness = freshness.merge(join_step(step).await?);
        }

        // Replay queued membership changes until none are left; leaving the
        // scanning state and seeing an empty queue happen under one lock, so
        // no change can fall between sweep end and the idle path.
        loop {
            let pending = {
                let mut state = lock(&self.state);
                if state.queued.is_empty() {
                    state.scanning = false;
                    break;
                }
                mem::take(&mut state.queued)
            };
            for (id, now_followed) in pending {
                if now_followed {
                    let step = self.pool.submit(self.scan_step(api, &found, id, false));
                    freshness = freshness.merge(join_step(step).await?);
                } else {
                    let followed = lock(&self.state).followed.clone();
                    lock(&found).retain(|_, album: &mut Album| {
                        album
                            .artists
                            .iter()
                            .any(|artist| followed.contains(&artist.id))
                    });
                }
            }
        }

        let mut albums: Vec<Album> = mem::take(&mut *lock(&found)).into_values().collect();
        albums.sort_by(|a, b| {
            b.released_at()
                .cmp(&a.released_at())
                .then_with(|| a.name.cmp(&b.name))
        });
        tracing::debug!(albums = albums.len(), "release sweep drained");
        Ok(FetchOutcome::new(albums, freshness))
    }

    /// One sweep step: fetch an artist's albums, keep the recent ones, then
    /// hold the pool slot through the adaptive pause.
    fn scan_step(
        &self,
        api: &Arc<ApiContext>,
        found: &Arc<Mutex<BTreeMap<AlbumId, Album>>>,
        artist_id: ArtistId,
        check_membership: bool,
    ) -> impl Future<Output = FetchResult<Freshness>> + Send + 'static {
        let api = Arc::clone(api);
        let found = Arc::clone(found);
        let state = Arc::clone(&self.state);
        let activity = self.activity.clone();
        let scanner = self.scanner;
        let ttl = CacheTtl::For(self.sync.releases);

        async move {
            if check_membership && !lock(&state).followed.contains(&artist_id) {
                metric!(counter("releases.scan.skipped") += 1);
                tracing::trace!(artist = %artist_id, "skipping unfollowed artist");
                return Ok(Freshness::FromCache);
            }

            let outcome = CollectionRequest::<Page<Album>>::new(
                &api,
                "artist_albums",
                &format!("artists/{artist_id}/albums"),
                &[("include_groups", "album,single".to_owned())],
            )?
            .cache_ttl(ttl)
            .fetch_concurrent(&api)
            .await?;

            let cutoff = recent_cutoff(scanner.age_window);
            let freshness = outcome.freshness;
            let mut recent = 0;
            {
                let mut found = lock(&found);
                for album in outcome.value {
                    if album.released_at().is_some_and(|date| date >= cutoff) {
                        found.insert(album.id.clone(), album);
                        recent += 1;
                    }
                }
            }
            tracing::trace!(artist = %artist_id, recent, freshness = ?freshness, "scanned artist");

            if let Some(delay) = scan_delay(&scanner, activity.is_observed(), freshness) {
                tracing::trace!(
                    artist = %artist_id,
                    pause = %humantime::format_duration(delay),
                    "holding scan slot"
                );
                tokio::time::sleep(delay).await;
            }
            Ok(freshness)
        }
    }
}

impl CachedResource for ReleaseScanner {
    type Value = Vec<Album>;

    fn name(&self) -> &'static str {
        "Releases"
    }

    fn sync_interval(&self) -> Duration {
        self.sync.releases
    }

    fn request<'a>(
        &'a self,
        api: &'a Arc<ApiContext>,
    ) -> BoxFuture<'a, FetchResult<FetchOutcome<Vec<Album>>>> {
        Box::pin(async move {
            lock(&self.state).scanning = true;
            let _reset = ScanReset(Arc::clone(&self.state));
            metric!(counter("releases.scan") += 1);

            // A failed sweep keeps the cache stale and retries on the next
            // tick; the guard drops its queued changes.
            self.run_scan(api).await
        })
    }

    fn changed_event(&self, new: Arc<Vec<Album>>, old: Arc<Vec<Album>>) -> Option<Event> {
        let known: BTreeSet<&AlbumId> = old.iter().map(|album| &album.id).collect();
        let fresh: Vec<Album> = new
            .iter()
            .filter(|album| !known.contains(&album.id))
            .cloned()
            .collect();
        if fresh.is_empty() {
            // Albums only aged out of the window, nothing to announce.
            return None;
        }
        metric!(counter("releases.found") += fresh.len() as i64);
        Some(Event::ReleasesFound {
            fresh: Arc::new(fresh),
            all: new,
        })
    }
}

/// The oldest release date that still counts as recent.
fn recent_cutoff(age_window: Duration) -> NaiveDate {
    let days = (age_window.as_secs() / 86_400).min(36_500) as i64;
    Utc::now().naive_utc().date() - chrono::Duration::days(days)
}

/// The pause a sweep step holds its pool slot for.
///
/// Steps served purely from cache pause not at all. Fresh data while someone
/// watches playback means the engine is already busy talking to the service,
/// so those steps wait longest.
fn scan_delay(scanner: &Scanner, observed: bool, freshness: Freshness) -> Option<Duration> {
    match (observed, freshness) {
        (_, Freshness::FromCache) => None,
        (true, Freshness::Modified) => Some(scanner.delay_observed_modified),
        (true, Freshness::Revalidated) => Some(scanner.delay_observed_revalidated),
        (false, Freshness::Modified) => Some(scanner.delay_idle_modified),
        (false, Freshness::Revalidated) => Some(scanner.delay_idle_revalidated),
    }
}

async fn join_step(step: CancelOnDrop<Option<FetchResult<Freshness>>>) -> FetchResult<Freshness> {
    match step.await {
        Ok(Some(result)) => result,
        Ok(None) => Err(FetchError::Canceled),
        Err(error) if error.is_cancelled() => Err(FetchError::Canceled),
        Err(_) => Err(FetchError::InternalError),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
