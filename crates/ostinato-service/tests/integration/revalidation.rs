//! The response cache over the wire: TTL windows, etag revalidation, the
//! hint entries kept for uncacheable endpoints and the rate-limit retry.

use std::time::Duration;

use ostinato_service::api::{CacheTtl, FetchError, Freshness, ItemRequest};
use ostinato_service::types::Device;
use ostinato_test::device;

use crate::utils::setup_session;

#[tokio::test]
async fn test_ttl_window_short_circuits_the_network() {
    let (session, service) = setup_session(|_| ());
    service.set_devices(vec![device("d1", "Kitchen", true, 40)]);

    let ttl = CacheTtl::For(Duration::from_millis(150));
    let request = || {
        ItemRequest::<Vec<Device>>::get(&session.api, "me/player/devices", &[])
            .unwrap()
            .cache_ttl(ttl)
            .unwrap_field("devices")
    };

    let first = request().execute(&session.api).await.unwrap();
    assert_eq!(first.freshness, Freshness::Modified);

    let second = request().execute(&session.api).await.unwrap();
    assert_eq!(second.freshness, Freshness::FromCache);
    assert_eq!(second.value, first.value);
    assert_eq!(service.requests_to("/v1/me/player/devices"), 1);

    tokio::time::sleep(Duration::from_millis(200)).await;

    let third = request().execute(&session.api).await.unwrap();
    assert_eq!(third.freshness, Freshness::Revalidated);
    assert_eq!(third.value, first.value);
    assert_eq!(service.requests_to("/v1/me/player/devices"), 2);
}

#[tokio::test]
async fn test_uncacheable_responses_keep_an_etag_hint() {
    let (session, service) = setup_session(|_| ());
    service.set_devices(vec![device("d1", "Kitchen", true, 40)]);

    let request = || {
        ItemRequest::<Vec<Device>>::get(&session.api, "me/player/devices", &[])
            .unwrap()
            .cache_ttl(CacheTtl::None)
            .unwrap_field("devices")
    };

    let first = request().execute(&session.api).await.unwrap();
    assert_eq!(first.freshness, Freshness::Modified);

    // No TTL: the request goes out again, but the stored etag turns the
    // unchanged answer into a 304 with the cached body.
    let second = request().execute(&session.api).await.unwrap();
    assert_eq!(second.freshness, Freshness::Revalidated);
    assert_eq!(second.value, first.value);
    assert_eq!(service.requests_to("/v1/me/player/devices"), 2);

    service.set_devices(vec![
        device("d1", "Kitchen", true, 40),
        device("d2", "Desk", false, 80),
    ]);
    let third = request().execute(&session.api).await.unwrap();
    assert_eq!(third.freshness, Freshness::Modified);
    assert_eq!(third.value.len(), 2);
}

#[tokio::test]
async fn test_session_ttl_lives_for_the_whole_run() {
    let (session, service) = setup_session(|_| ());
    service.set_devices(vec![device("d1", "Kitchen", true, 40)]);

    let request = || {
        ItemRequest::<Vec<Device>>::get(&session.api, "me/player/devices", &[])
            .unwrap()
            .cache_ttl(CacheTtl::Session)
            .unwrap_field("devices")
    };

    let first = request().execute(&session.api).await.unwrap();
    assert_eq!(first.freshness, Freshness::Modified);

    tokio::time::sleep(Duration::from_millis(100)).await;

    let second = request().execute(&session.api).await.unwrap();
    assert_eq!(second.freshness, Freshness::FromCache);
    assert_eq!(service.requests_to("/v1/me/player/devices"), 1);
}

#[tokio::test]
async fn test_rate_limited_requests_are_retried() {
    let (session, service) = setup_session(|_| ());
    service.set_devices(vec![device("d1", "Kitchen", true, 40)]);
    service.enqueue_statuses("/v1/me/player/devices", &[429]);

    session.devices.resync(&session.api, true).await.unwrap();
    assert_eq!(session.devices.get().len(), 1);
    assert_eq!(service.requests_to("/v1/me/player/devices"), 2);
}

#[tokio::test]
async fn test_rate_limiting_gives_up_after_the_configured_attempts() {
    let (session, service) = setup_session(|_| ());
    service.set_devices(vec![device("d1", "Kitchen", true, 40)]);
    service.enqueue_statuses("/v1/me/player/devices", &[429, 429, 429]);

    let result = session.devices.resync(&session.api, true).await;
    assert!(matches!(result, Err(FetchError::RateLimited { .. })));
    assert_eq!(service.requests_to("/v1/me/player/devices"), 3);
    assert!(session.devices.get().is_empty());
}
