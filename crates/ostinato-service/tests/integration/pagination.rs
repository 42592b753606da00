//! Collection fetching: concurrent fan-out, sequential cursor walks, the
//! batched id lookup and their all-or-nothing failure behavior.

use ostinato_service::api::{CollectionRequest, FetchError};
use ostinato_service::events::Event;
use ostinato_service::types::{AlbumId, Page, Playlist};
use ostinato_test::{album, artist, playlist};

use crate::utils::{drain_events, setup_session};

fn scripted_playlists() -> Vec<serde_json::Value> {
    (0..120)
        .map(|i| playlist(&format!("p{i:03}"), &format!("Playlist {i}"), "snap-1", i))
        .collect()
}

#[tokio::test]
async fn test_concurrent_fetch_reassembles_pages_in_order() {
    let (session, service) = setup_session(|_| ());
    service.set_playlists(scripted_playlists());

    session.playlists.resync(&session.api, true).await.unwrap();

    let playlists = session.playlists.get();
    assert_eq!(playlists.len(), 120);
    assert!(playlists
        .iter()
        .enumerate()
        .all(|(i, playlist)| playlist.id == format!("p{i:03}")));

    // One request per page, nothing else.
    assert_eq!(
        service.all_hits(),
        vec![
            ("/v1/me/playlists?limit=50&offset=0".to_owned(), 1),
            ("/v1/me/playlists?limit=50&offset=100".to_owned(), 1),
            ("/v1/me/playlists?limit=50&offset=50".to_owned(), 1),
        ]
    );
}

#[tokio::test]
async fn test_failing_page_fails_the_whole_collection() {
    let (session, service) = setup_session(|_| ());
    service.set_playlists(scripted_playlists());
    service.enqueue_statuses("/v1/me/playlists?limit=50&offset=100", &[500]);

    let result = session.playlists.resync(&session.api, true).await;
    assert!(matches!(result, Err(FetchError::Status { status: 500, .. })));
    assert!(session.playlists.get().is_empty());

    // The next attempt is clean and completes the collection.
    session.playlists.resync(&session.api, true).await.unwrap();
    assert_eq!(session.playlists.get().len(), 120);
}

#[tokio::test]
async fn test_peek_total_never_touches_the_network() {
    let (session, service) = setup_session(|_| ());
    service.set_playlists(scripted_playlists());

    let request =
        CollectionRequest::<Page<Playlist>>::new(&session.api, "playlists", "me/playlists", &[])
            .unwrap();

    // Nothing cached yet: the answer is 0, not a blocking fetch.
    assert_eq!(request.peek_total(&session.api), 0);
    assert_eq!(service.accesses(), 0);

    session.playlists.resync(&session.api, true).await.unwrap();
    service.accesses();

    assert_eq!(request.peek_total(&session.api), 120);
    assert_eq!(service.accesses(), 0);
}

#[tokio::test]
async fn test_oversized_total_is_not_trusted() {
    let (session, service) = setup_session(|config| config.fetching.max_pages = 2);

    // An envelope claiming an absurd total must not panic the fetch or
    // blow up the reservation; the fan-out stays within the page bound.
    service.override_body(
        "/v1/me/playlists",
        serde_json::json!({ "items": [], "total": u64::MAX, "next": null }),
    );
    session.playlists.resync(&session.api, true).await.unwrap();
    assert!(session.playlists.get().is_empty());
    assert_eq!(service.requests_to("/v1/me/playlists"), 2);

    // Same for the sequential cursor walk.
    service.override_body(
        "/v1/me/following",
        serde_json::json!({
            "artists": { "items": [], "total": u64::MAX, "next": null }
        }),
    );
    session
        .followed_artists
        .resync(&session.api, true)
        .await
        .unwrap();
    assert!(session.followed_artists.get().is_empty());
}

#[tokio::test]
async fn test_cursor_walk_fetches_all_pages_in_order() {
    let (session, service) = setup_session(|_| ());
    service.set_followed(
        (0..120)
            .map(|i| artist(&format!("a{i:03}"), &format!("Artist {i}")))
            .collect(),
    );

    let mut receiver = session.subscribe();
    session
        .followed_artists
        .resync(&session.api, true)
        .await
        .unwrap();

    let artists = session.followed_artists.get();
    assert_eq!(artists.len(), 120);
    assert!(artists
        .iter()
        .enumerate()
        .all(|(i, artist)| artist.id.0 == format!("a{i:03}")));
    assert_eq!(service.requests_to("/v1/me/following"), 3);

    let progress: Vec<(u64, u64)> = drain_events(&mut receiver)
        .into_iter()
        .filter_map(|event| match event {
            Event::FetchProgress {
                resource: "followed_artists",
                fetched,
                total,
            } => Some((fetched, total)),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![(50, 120), (100, 120), (120, 120)]);
}

#[tokio::test]
async fn test_batched_album_lookup_chunks_ids() {
    let (session, service) = setup_session(|config| config.fetching.chunk_size = 2);
    service.set_artist_albums(
        "a1",
        vec![
            album("r1", "Day", "2024-05-01", &[("a1", "Nils Frahm")]),
            album("r2", "Night", "2024-06-01", &[("a1", "Nils Frahm")]),
            album("r3", "Dawn", "2024-07-01", &[("a1", "Nils Frahm")]),
        ],
    );

    let ids = [
        AlbumId::from("r1"),
        AlbumId::from("r2"),
        AlbumId::from("r3"),
    ];
    let albums = session.albums_by_ids(&ids).await.unwrap();
    assert_eq!(albums.len(), 3);
    assert!(albums
        .iter()
        .zip(&ids)
        .all(|(album, id)| album.id == *id));
    assert_eq!(service.requests_to("/v1/albums"), 2);

    // Album records do not change within a run, the second lookup is free.
    session.albums_by_ids(&ids).await.unwrap();
    assert_eq!(service.requests_to("/v1/albums"), 2);
}

#[tokio::test]
async fn test_unknown_album_id_fails_the_batch() {
    let (session, service) = setup_session(|_| ());
    service.set_artist_albums(
        "a1",
        vec![album("r1", "Day", "2024-05-01", &[("a1", "Nils Frahm")])],
    );

    let ids = [AlbumId::from("r1"), AlbumId::from("missing")];
    let result = session.albums_by_ids(&ids).await;
    assert!(matches!(result, Err(FetchError::Malformed(_))));
}
