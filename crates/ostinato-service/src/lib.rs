//! The core synchronization engine keeping local caches of a remote music
//! service in step with the upstream Web API.
//!
//! The [`session::Session`] type assembles everything: the authenticated
//! transport, the HTTP response cache, the per-resource TTL caches, the
//! background release scanner and the observer bus.

#[macro_use]
pub mod metrics;

pub mod api;
pub mod caches;
pub mod caching;
pub mod config;
pub mod events;
pub mod logging;
pub mod releases;
pub mod session;
pub mod settings;
pub mod types;
pub mod workers;

#[cfg(test)]
pub(crate) mod testutil;
