//! Helpers shared by the unit tests in this crate.

use std::sync::Arc;

use tokio::runtime::Handle;

use crate::api::{ApiContext, ResponseCache};
use crate::config::Config;
use crate::events::EventBus;
use crate::workers::WorkerPool;

/// An [`ApiContext`] with default configuration and an in-memory response
/// cache. Must be called from within a tokio runtime.
pub fn api_context() -> Arc<ApiContext> {
    api_context_for(Config::default())
}

/// Like [`api_context`], but honoring the given configuration.
pub fn api_context_for(config: Config) -> Arc<ApiContext> {
    let response_cache = ResponseCache::load(None);
    let fetch_pool = WorkerPool::new(
        "fetch",
        config.fetching.max_concurrent_fetches,
        Handle::current(),
    );
    ApiContext::new(&config, response_cache, fetch_pool, EventBus::new())
        .expect("failed to build test API context")
}
