//! Write commands: optimistic patches, invalidation and failure reporting.

use std::time::Duration;

use ostinato_service::api::FetchError;
use ostinato_service::events::Event;
use ostinato_service::types::{ArtistId, DeviceId, RepeatState};
use ostinato_test::{artist, device, playback};

use crate::utils::{drain_events, setup_session};

#[tokio::test]
async fn test_play_patch_survives_a_stale_server() {
    let (session, service) = setup_session(|_| ());
    let stale = playback(device("d1", "Kitchen", true, 40), "t1", false, 1_000);
    service.set_playback(Some(stale.clone()));

    session.playback.resync(&session.api, true).await.unwrap();
    assert!(!session.playback.get().is_playing);

    session.play().await.unwrap();
    // The service accepted the write but still serves the old snapshot.
    service.set_playback(Some(stale));

    let mut receiver = session.subscribe();
    session.playback.resync(&session.api, true).await.unwrap();
    assert!(session.playback.get().is_playing);

    let announced = drain_events(&mut receiver)
        .into_iter()
        .find_map(|event| match event {
            Event::PlaybackChanged { new, .. } => Some(new.is_playing),
            _ => None,
        });
    assert_eq!(announced, Some(true));

    // The patch is consumed, the next resync surfaces the server truth.
    session.playback.resync(&session.api, true).await.unwrap();
    assert!(!session.playback.get().is_playing);
}

#[tokio::test]
async fn test_expired_patch_is_not_applied() {
    let (session, service) =
        setup_session(|config| config.sync.patch_expiry = Duration::from_millis(40));
    let stale = playback(device("d1", "Kitchen", true, 40), "t1", false, 1_000);
    service.set_playback(Some(stale.clone()));
    session.playback.resync(&session.api, true).await.unwrap();

    session.play().await.unwrap();
    service.set_playback(Some(stale));

    tokio::time::sleep(Duration::from_millis(80)).await;
    session.playback.resync(&session.api, true).await.unwrap();
    assert!(!session.playback.get().is_playing);
}

#[tokio::test]
async fn test_unfollow_applies_before_the_server_catches_up() {
    let (session, service) = setup_session(|_| ());
    let library = vec![artist("a1", "Nils Frahm"), artist("a2", "Anna Meredith")];
    service.set_followed(library.clone());
    session
        .followed_artists
        .resync(&session.api, true)
        .await
        .unwrap();
    assert_eq!(session.followed_artists.get().len(), 2);

    session.unfollow_artist(ArtistId::from("a2")).await.unwrap();
    // Replication lag: the service still lists the unfollowed artist.
    service.set_followed(library);

    session
        .followed_artists
        .resync(&session.api, true)
        .await
        .unwrap();
    let artists = session.followed_artists.get();
    assert_eq!(artists.len(), 1);
    assert_eq!(artists[0].id, ArtistId::from("a1"));
}

#[tokio::test]
async fn test_commands_reach_their_endpoints() {
    let (session, service) = setup_session(|_| ());
    service.set_playback(Some(playback(device("d1", "Kitchen", true, 40), "t1", true, 0)));
    service.set_devices(vec![
        device("d1", "Kitchen", true, 40),
        device("d2", "Desk", false, 80),
    ]);

    session.seek(90_500).await.unwrap();
    session.set_volume(65).await.unwrap();
    session.set_shuffle(true).await.unwrap();
    session.set_repeat(RepeatState::Track).await.unwrap();
    session.next_track().await.unwrap();
    session.transfer_playback(DeviceId::from("d2")).await.unwrap();

    let writes = service.writes();
    assert_eq!(
        writes.iter().map(String::as_str).collect::<Vec<_>>(),
        vec![
            "PUT /v1/me/player/seek?position_ms=90500",
            "PUT /v1/me/player/volume?volume_percent=65",
            "PUT /v1/me/player/shuffle?state=true",
            "PUT /v1/me/player/repeat?state=track",
            "POST /v1/me/player/next",
            "PUT /v1/me/player",
        ]
    );

    let devices = service.state().devices.clone();
    assert_eq!(devices[0]["is_active"], serde_json::json!(false));
    assert_eq!(devices[1]["is_active"], serde_json::json!(true));
}

#[tokio::test]
async fn test_rejected_command_reports_failure() {
    let (session, service) = setup_session(|_| ());
    service.set_playback(Some(playback(device("d1", "Kitchen", true, 40), "t1", false, 0)));
    session.playback.resync(&session.api, true).await.unwrap();
    service.enqueue_statuses("/v1/me/player/play", &[403]);

    let mut receiver = session.subscribe();
    let result = session.play().await;
    assert!(matches!(result, Err(FetchError::NotAuthorized(_))));

    let failed = drain_events(&mut receiver).into_iter().any(|event| {
        matches!(
            event,
            Event::CommandFailed {
                command: "play",
                ..
            }
        )
    });
    assert!(failed);

    // The failed write queued no optimistic patch.
    session.playback.resync(&session.api, true).await.unwrap();
    assert!(!session.playback.get().is_playing);
}
