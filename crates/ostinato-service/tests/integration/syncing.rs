//! Whole-session behavior: polling, persistence and the observer lifecycle.

use std::time::Duration;

use ostinato_service::config::Config;
use ostinato_service::session::Session;
use ostinato_service::types::PlaybackState;
use ostinato_test::{album, artist, device, playback, playlist, MusicService};

use crate::utils::{days_ago, drain_events, setup_session};

#[tokio::test(flavor = "multi_thread")]
async fn test_resync_all_fills_every_cache() {
    let (session, service) = setup_session(|_| ());
    service.set_playback(Some(playback(
        device("d1", "Kitchen", true, 40),
        "t1",
        true,
        5_000,
    )));
    service.set_devices(vec![
        device("d1", "Kitchen", true, 40),
        device("d2", "Desk", false, 80),
    ]);
    service.set_followed(vec![artist("a1", "Nils Frahm")]);
    service.set_playlists(vec![playlist("p1", "Focus", "snap-1", 42)]);
    service.set_artist_albums(
        "a1",
        vec![album("r1", "Day", &days_ago(2), &[("a1", "Nils Frahm")])],
    );

    session.resync_all(true).await;

    assert!(session.playback.get().is_playing);
    assert_eq!(session.devices.get().len(), 2);
    assert_eq!(session.followed_artists.get().len(), 1);
    assert_eq!(session.playlists.get().len(), 1);
    assert_eq!(session.releases.get().len(), 1);
}

#[tokio::test]
async fn test_playback_resyncs_only_while_observed() {
    let (session, service) = setup_session(|config| config.sync.playback = Duration::ZERO);
    service.set_playback(Some(playback(device("d1", "Kitchen", true, 40), "t1", true, 0)));

    session.playback.resync(&session.api, false).await.unwrap();
    assert_eq!(service.requests_to("/v1/me/player"), 0);
    assert!(!session.playback.get().is_playing);

    let guard = session.observe_playback();
    session.playback.resync(&session.api, false).await.unwrap();
    assert_eq!(service.requests_to("/v1/me/player"), 1);
    assert!(session.playback.get().is_playing);

    drop(guard);
    session.playback.resync(&session.api, false).await.unwrap();
    assert_eq!(service.requests_to("/v1/me/player"), 1);
}

#[tokio::test]
async fn test_inactive_player_maps_to_the_default_state() {
    let (session, service) = setup_session(|_| ());
    service.set_playback(None);

    let mut receiver = session.subscribe();
    session.playback.resync(&session.api, true).await.unwrap();
    assert_eq!(*session.playback.get(), PlaybackState::default());
    assert!(drain_events(&mut receiver).is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_poller_drives_the_caches() {
    let (session, service) = setup_session(|config| {
        config.sync.poll = Duration::from_millis(50);
        config.sync.playback = Duration::ZERO;
    });
    service.set_playback(Some(playback(device("d1", "Kitchen", true, 40), "t1", true, 0)));
    let _guard = session.observe_playback();

    // Polls of the playback endpoint itself, without its sub-paths.
    let playback_polls =
        |service: &MusicService| service.requests_to("/v1/me/player") - service.requests_to("/v1/me/player/");

    let poller = session.spawn_poller();
    tokio::time::sleep(Duration::from_millis(400)).await;
    let polled = playback_polls(&service);
    assert!(polled >= 2, "expected repeated polls, got {polled}");

    drop(poller);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let settled = playback_polls(&service);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(playback_polls(&service), settled);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_state_survives_a_restart() {
    ostinato_test::setup();
    let service = MusicService::new();
    let data_dir = tempfile::tempdir().unwrap();

    let mut config = Config::default();
    config.api.base_url = service.base_url();
    config.api.token = Some("test-token".to_owned());
    config.data_dir = Some(data_dir.path().to_owned());
    config.sync.devices = Duration::ZERO;

    let session = Session::new(config.clone(), tokio::runtime::Handle::current()).unwrap();
    service.set_devices(vec![device("d1", "Kitchen", true, 40)]);
    session.devices.resync(&session.api, true).await.unwrap();
    assert_eq!(service.requests_to("/v1/me/player/devices"), 1);
    session.shutdown();
    drop(session);

    // The restored value is served without any request.
    let restarted = Session::new(config, tokio::runtime::Handle::current()).unwrap();
    assert_eq!(restarted.devices.get().len(), 1);
    assert_eq!(service.requests_to("/v1/me/player/devices"), 1);

    // The persisted etag turns the next fetch into a revalidation of the
    // same body.
    restarted.devices.resync(&restarted.api, true).await.unwrap();
    assert_eq!(service.requests_to("/v1/me/player/devices"), 2);
    assert_eq!(restarted.devices.get()[0].name, "Kitchen");
}
