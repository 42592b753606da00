use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use ostinato_service::config::Config;
use ostinato_service::events::Event;
use ostinato_service::session::Session;
use ostinato_test::MusicService;

/// Builds a session wired to a scripted service.
///
/// The scanner pacing delays and the retry backoff are zeroed so tests run
/// at full speed; individual tests opt back into the intervals they
/// exercise through `update_config`. Keep the returned service alive for
/// the whole test, dropping it aborts the server.
pub fn setup_session(update_config: impl FnOnce(&mut Config)) -> (Arc<Session>, MusicService) {
    ostinato_test::setup();

    let service = MusicService::new();
    let mut config = Config::default();
    config.api.base_url = service.base_url();
    config.api.token = Some("test-token".to_owned());
    config.fetching.retry_backoff = Duration::from_millis(5);
    config.scanner.delay_observed_modified = Duration::ZERO;
    config.scanner.delay_observed_revalidated = Duration::ZERO;
    config.scanner.delay_idle_modified = Duration::ZERO;
    config.scanner.delay_idle_revalidated = Duration::ZERO;
    update_config(&mut config);

    let session = Session::new(config, tokio::runtime::Handle::current())
        .expect("failed to build the session");
    (session, service)
}

/// Drains whatever events are queued on the receiver right now.
pub fn drain_events(receiver: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        events.push(event);
    }
    events
}

/// A `YYYY-MM-DD` release date `days` days in the past.
pub fn days_ago(days: i64) -> String {
    (chrono::Utc::now().naive_utc().date() - chrono::Duration::days(days)).to_string()
}
