//! Exposes the command line application.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;

use ostinato_service::config::Config;
use ostinato_service::session::Session;
use ostinato_service::types::Album;
use ostinato_service::{logging, metric, metrics};

/// Ostinato commands.
#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Run the sync daemon until interrupted.
    Run,

    /// Perform a single release sweep and print what it found.
    Scan {
        /// Print the releases as JSON instead of formatted text.
        #[arg(long)]
        json: bool,
    },
}

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(bin_name = "ostinato", version)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long = "config", short = 'c', global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    // SAFETY: The daemon has not spawned any threads at this point.
    unsafe { logging::init_logging(&config) };
    if let Some(ref statsd) = config.metrics.statsd {
        let hostname = config.metrics.hostname_tag.clone().and_then(|tag| {
            hostname::get()
                .ok()
                .and_then(|s| s.into_string().ok())
                .map(|name| (tag, name))
        });
        let mut tags = config.metrics.custom_tags.clone();
        tags.extend(hostname);
        metrics::configure_statsd(&config.metrics.prefix, statsd, tags);
    }

    match cli.command {
        Command::Run => run(config).context("failed to run the sync daemon")?,
        Command::Scan { json } => scan(config, json).context("failed to run the release sweep")?,
    }

    Ok(())
}

/// Builds the session and polls until the process is interrupted.
fn run(config: Config) -> Result<()> {
    metric!(counter("daemon.starting") += 1);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("ostinato")
        .enable_all()
        .build()?;

    let session = Session::new(config, runtime.handle().to_owned())
        .context("failed to create the session")?;
    let poller = session.spawn_poller();
    tracing::info!("sync daemon running");

    runtime
        .block_on(tokio::signal::ctrl_c())
        .context("failed to wait for the shutdown signal")?;
    tracing::info!("interrupt received");

    drop(poller);
    session.shutdown();
    tracing::info!("daemon shutdown complete");

    Ok(())
}

/// Runs one forced release sweep and prints the resulting window.
fn scan(config: Config, json: bool) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("ostinato")
        .enable_all()
        .build()?;

    let session = Session::new(config, runtime.handle().to_owned())
        .context("failed to create the session")?;
    runtime
        .block_on(session.releases.resync(&session.api, true))
        .context("release sweep failed")?;

    let albums = session.releases.get();
    if json {
        println!("{}", serde_json::to_string_pretty(&*albums)?);
    } else if albums.is_empty() {
        println!("no releases within the configured window");
    } else {
        print_albums(&albums);
    }

    session.shutdown();
    Ok(())
}

fn print_albums(albums: &[Album]) {
    for album in albums {
        let date = album
            .released_at()
            .map(|date| date.to_string())
            .unwrap_or_else(|| album.release_date.clone());
        let artists = album
            .artists
            .iter()
            .map(|artist| artist.name.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        println!(
            "{}  {}  {}",
            console::style(date).dim(),
            console::style(&album.name).bold(),
            artists
        );
    }
}
