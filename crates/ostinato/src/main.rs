//! Ostinato.
//!
//! Ostinato is a standalone daemon that mirrors a music streaming account
//! into local caches. It polls playback state, devices, followed artists and
//! playlists on a fixed tick, sweeps followed artists for recent releases in
//! the background, and announces every observed change on an event bus.

#![warn(
    missing_docs,
    missing_debug_implementations,
    unused_crate_dependencies,
    clippy::all
)]

mod cli;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            ostinato_service::logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
