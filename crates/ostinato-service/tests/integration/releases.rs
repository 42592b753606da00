//! The release scanner end to end: sweeping, caching, pacing and
//! membership changes.

use std::sync::Arc;
use std::time::Duration;

use ostinato_service::events::Event;
use ostinato_service::types::ArtistId;
use ostinato_test::{album, artist};

use crate::utils::{days_ago, drain_events, setup_session};

/// Extracts the fresh album ids and the window size out of a release event.
fn release_ids(event: &Event) -> Option<(Vec<String>, usize)> {
    match event {
        Event::ReleasesFound { fresh, all } => Some((
            fresh.iter().map(|album| album.id.0.clone()).collect(),
            all.len(),
        )),
        _ => None,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_scan_collects_recent_releases() {
    let (session, service) = setup_session(|_| ());
    service.set_followed(vec![
        artist("a1", "Nils Frahm"),
        artist("a2", "Anna Meredith"),
    ]);
    service.set_artist_albums(
        "a1",
        vec![
            album("r1", "Music For Animals", &days_ago(3), &[("a1", "Nils Frahm")]),
            album("old1", "Spaces", "2013-11-15", &[("a1", "Nils Frahm")]),
        ],
    );
    service.set_artist_albums(
        "a2",
        vec![album("r2", "Fibs", &days_ago(1), &[("a2", "Anna Meredith")])],
    );

    let mut receiver = session.subscribe();
    session.releases.resync(&session.api, true).await.unwrap();

    let albums = session.releases.get();
    let ids: Vec<&str> = albums.iter().map(|album| album.id.0.as_str()).collect();
    assert_eq!(ids, vec!["r2", "r1"]);

    let (mut fresh, all) = drain_events(&mut receiver)
        .iter()
        .find_map(release_ids)
        .expect("no release announcement");
    fresh.sort();
    assert_eq!(fresh, vec!["r1", "r2"]);
    assert_eq!(all, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rescan_announces_only_new_releases() {
    let (session, service) = setup_session(|config| config.sync.releases = Duration::ZERO);
    service.set_followed(vec![artist("a1", "Nils Frahm")]);
    service.set_artist_albums(
        "a1",
        vec![album("r1", "Day", &days_ago(5), &[("a1", "Nils Frahm")])],
    );
    session.releases.resync(&session.api, true).await.unwrap();

    service.set_artist_albums(
        "a1",
        vec![
            album("r1", "Day", &days_ago(5), &[("a1", "Nils Frahm")]),
            album("r2", "Night", &days_ago(0), &[("a1", "Nils Frahm")]),
        ],
    );

    let mut receiver = session.subscribe();
    session.releases.resync(&session.api, true).await.unwrap();

    let (fresh, all) = drain_events(&mut receiver)
        .iter()
        .find_map(release_ids)
        .expect("no release announcement");
    assert_eq!(fresh, vec!["r2"]);
    assert_eq!(all, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unchanged_artists_are_served_from_cache() {
    let (session, service) = setup_session(|_| ());
    service.set_followed(vec![
        artist("a1", "Nils Frahm"),
        artist("a2", "Anna Meredith"),
    ]);
    service.set_artist_albums(
        "a1",
        vec![album("r1", "Day", &days_ago(2), &[("a1", "Nils Frahm")])],
    );
    service.set_artist_albums(
        "a2",
        vec![album("r2", "Fibs", &days_ago(1), &[("a2", "Anna Meredith")])],
    );

    session.releases.resync(&session.api, true).await.unwrap();
    assert_eq!(service.requests_to("/v1/artists/"), 2);

    // Within the release interval the per-artist fetches are cache-served.
    let mut receiver = session.subscribe();
    session.releases.resync(&session.api, true).await.unwrap();
    assert_eq!(service.requests_to("/v1/artists/"), 2);
    assert!(drain_events(&mut receiver).iter().find_map(release_ids).is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_sweep_keeps_the_previous_window() {
    let (session, service) = setup_session(|config| config.sync.releases = Duration::ZERO);
    service.set_followed(vec![
        artist("a1", "Nils Frahm"),
        artist("a2", "Anna Meredith"),
    ]);
    service.set_artist_albums(
        "a1",
        vec![album("r1", "Day", &days_ago(2), &[("a1", "Nils Frahm")])],
    );
    service.set_artist_albums(
        "a2",
        vec![album("r2", "Fibs", &days_ago(1), &[("a2", "Anna Meredith")])],
    );
    session.releases.resync(&session.api, true).await.unwrap();
    assert_eq!(session.releases.get().len(), 2);

    service.enqueue_statuses("/v1/artists/a2/albums", &[500]);
    let result = session.releases.resync(&session.api, true).await;
    assert!(result.is_err());
    assert_eq!(session.releases.get().len(), 2);

    // The recovered sweep sees the same window and stays silent.
    let mut receiver = session.subscribe();
    session.releases.resync(&session.api, true).await.unwrap();
    assert_eq!(session.releases.get().len(), 2);
    assert!(drain_events(&mut receiver).iter().find_map(release_ids).is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_follow_expands_the_next_sweep() {
    let (session, service) = setup_session(|_| ());
    service.set_followed(vec![artist("a1", "Nils Frahm")]);
    service.set_artist_albums(
        "a1",
        vec![album("r1", "Day", &days_ago(2), &[("a1", "Nils Frahm")])],
    );
    session.releases.resync(&session.api, true).await.unwrap();
    assert_eq!(session.releases.get().len(), 1);

    service.set_artist_albums(
        "a3",
        vec![album("r3", "New Energy", &days_ago(1), &[("a3", "Four Tet")])],
    );
    session.follow_artist(ArtistId::from("a3")).await.unwrap();

    session.releases.resync(&session.api, true).await.unwrap();
    let albums = session.releases.get();
    let ids: Vec<&str> = albums.iter().map(|album| album.id.0.as_str()).collect();
    assert_eq!(ids, vec!["r3", "r1"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unfollow_during_scan_skips_the_artist() {
    let (session, service) = setup_session(|config| {
        config.scanner.concurrency = 1;
        config.scanner.delay_idle_modified = Duration::from_millis(200);
    });
    service.set_followed(vec![
        artist("a1", "Nils Frahm"),
        artist("a2", "Anna Meredith"),
    ]);
    service.set_artist_albums(
        "a1",
        vec![album("r1", "Day", &days_ago(2), &[("a1", "Nils Frahm")])],
    );
    service.set_artist_albums(
        "a2",
        vec![album("r2", "Fibs", &days_ago(1), &[("a2", "Anna Meredith")])],
    );

    let sweep = tokio::spawn({
        let session = Arc::clone(&session);
        async move { session.releases.resync(&session.api, true).await }
    });
    // The first artist's step holds the only scan slot through its pause,
    // so the second artist's step has not started yet.
    tokio::time::sleep(Duration::from_millis(50)).await;
    session.unfollow_artist(ArtistId::from("a2")).await.unwrap();
    sweep.await.unwrap().unwrap();

    // The queued step noticed the unfollow and never touched the endpoint.
    let albums = session.releases.get();
    let ids: Vec<&str> = albums.iter().map(|album| album.id.0.as_str()).collect();
    assert_eq!(ids, vec!["r1"]);
    assert_eq!(service.requests_to("/v1/artists/a2/albums"), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_aborted_sweep_recovers_on_the_next_resync() {
    let (session, service) = setup_session(|config| {
        config.scanner.delay_idle_modified = Duration::from_millis(300);
    });
    service.set_followed(vec![artist("a1", "Nils Frahm")]);
    service.set_artist_albums(
        "a1",
        vec![album("r1", "Day", &days_ago(2), &[("a1", "Nils Frahm")])],
    );

    let sweep = tokio::spawn({
        let session = Arc::clone(&session);
        async move { session.releases.resync(&session.api, true).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    sweep.abort();
    assert!(sweep.await.unwrap_err().is_cancelled());
    assert!(session.releases.get().is_empty());

    // The aborted sweep left neither the cache nor the scanner in their
    // in-flight states; a fresh resync runs and drains.
    session.releases.resync(&session.api, true).await.unwrap();
    assert_eq!(session.releases.get().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fresh_fetches_pace_the_sweep() {
    let (session, service) = setup_session(|config| {
        config.scanner.delay_idle_modified = Duration::from_millis(150);
    });
    service.set_followed(vec![
        artist("a1", "Nils Frahm"),
        artist("a2", "Anna Meredith"),
    ]);
    service.set_artist_albums(
        "a1",
        vec![album("r1", "Day", &days_ago(2), &[("a1", "Nils Frahm")])],
    );
    service.set_artist_albums(
        "a2",
        vec![album("r2", "Fibs", &days_ago(1), &[("a2", "Anna Meredith")])],
    );

    let started = std::time::Instant::now();
    session.releases.resync(&session.api, true).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(150));

    // Cache-served steps skip the pause entirely.
    let started = std::time::Instant::now();
    session.releases.resync(&session.api, true).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(150));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cache_served_artists_skip_the_pause() {
    let (session, service) = setup_session(|config| {
        config.scanner.concurrency = 1;
        config.scanner.delay_idle_modified = Duration::from_millis(150);
    });
    service.set_followed(vec![artist("a1", "Nils Frahm")]);
    service.set_artist_albums(
        "a1",
        vec![album("r1", "Day", &days_ago(2), &[("a1", "Nils Frahm")])],
    );
    session.releases.resync(&session.api, true).await.unwrap();

    service.set_artist_albums(
        "a2",
        vec![album("r2", "Fibs", &days_ago(1), &[("a2", "Anna Meredith")])],
    );
    service.set_artist_albums(
        "a3",
        vec![album("r3", "New Energy", &days_ago(1), &[("a3", "Four Tet")])],
    );
    session.follow_artist(ArtistId::from("a2")).await.unwrap();
    session.follow_artist(ArtistId::from("a3")).await.unwrap();

    // The first artist's pages are still cache-valid, so only the two new
    // artists hold their slot for a pause.
    let started = std::time::Instant::now();
    session.releases.resync(&session.api, true).await.unwrap();
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(300));
    assert!(elapsed < Duration::from_millis(450));
    assert_eq!(session.releases.get().len(), 3);
}
