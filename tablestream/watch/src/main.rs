//! Tablestream Watch - Live Table Availability Watcher
//!
//! Subscribes to one (restaurant, date, party size) key and logs every
//! availability change until interrupted.
//!
//! # Usage
//!
//! ```bash
//! # Watch restaurant 42 for four guests on 1 June
//! tablestream-watch --restaurant-id 42 --date 2025-06-01 --party-size 4
//!
//! # Signed-in stream against a custom server
//! tablestream-watch -r 42 -d 2025-06-01 -p 4 --api-url https://api.example.com --token "$TOKEN"
//!
//! # Polling only, every 10 seconds
//! tablestream-watch -r 42 -d 2025-06-01 -p 4 --no-stream --poll-interval-ms 10000
//!
//! # Verbose logging
//! RUST_LOG=debug tablestream-watch -r 42 -d 2025-06-01 -p 4
//! ```
//!
//! # Configuration
//!
//! Settings are layered: `$XDG_CONFIG_HOME/tablestream/config.toml` (or
//! `--config`), then `TABLESTREAM_*` environment variables, then flags.
//!
//! # Signals
//!
//! - `SIGINT` (Ctrl-C): unsubscribe and exit

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::Parser;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use tablestream_core::{
    load_config, load_config_from_path, AvailabilityEvent, AvailabilitySnapshot,
    AvailabilityStream, ClientConfig, ConfigOverrides, ConfigSource, HttpAvailabilityClient,
    StaticTokenStore, SubscriptionKey,
};

/// Tablestream Watch - follow live table availability for one restaurant
#[derive(Parser, Debug)]
#[command(name = "tablestream-watch")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Restaurant to watch
    #[arg(short = 'r', long, value_name = "ID")]
    restaurant_id: i64,

    /// Reservation date (YYYY-MM-DD)
    #[arg(short = 'd', long, value_name = "DATE")]
    date: NaiveDate,

    /// Number of guests
    #[arg(short = 'p', long, value_name = "N")]
    party_size: u32,

    /// Configuration file path
    #[arg(short = 'c', long, env = "TABLESTREAM_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// API base URL
    #[arg(long, value_name = "URL")]
    api_url: Option<String>,

    /// Bearer access token; omit for an anonymous stream
    #[arg(long, env = "TABLESTREAM_TOKEN", value_name = "TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Do not open a live stream
    #[arg(long)]
    no_stream: bool,

    /// Never fall back to polling
    #[arg(long)]
    no_poll: bool,

    /// Poll period in milliseconds
    #[arg(long, value_name = "MS")]
    poll_interval_ms: Option<u64>,
}

impl Args {
    /// Overrides taken from the command line
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            base_url: self.api_url.clone(),
            streaming_enabled: self.no_stream.then_some(false),
            polling_enabled: self.no_poll.then_some(false),
            polling_interval_ms: self.poll_interval_ms,
            ..Default::default()
        }
    }
}

/// Load the file layer, then apply environment and flag overrides
fn resolve_config(args: &Args) -> Result<ClientConfig> {
    let (mut config, source) = match args.config {
        Some(ref path) => load_config_from_path(path)
            .with_context(|| format!("Failed to load config file: {path:?}"))?,
        None => load_config().context("Failed to load config file")?,
    };

    match source {
        ConfigSource::File(ref path) => info!(path = ?path, "Loaded configuration"),
        ConfigSource::Default => info!("No config file found, using defaults"),
    }

    ConfigOverrides::from_env()
        .merge(args.overrides())
        .apply(&mut config);
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn describe(snapshot: &AvailabilitySnapshot) -> String {
    let open: Vec<String> = snapshot
        .available_slots()
        .map(|slot| match slot.available_capacity {
            Some(capacity) => format!("{} ({capacity})", slot.time),
            None => slot.time.clone(),
        })
        .collect();

    if open.is_empty() {
        "no tables available".to_string()
    } else {
        open.join(", ")
    }
}

fn log_event(event: &AvailabilityEvent) {
    match event {
        AvailabilityEvent::Initial(snapshot) => {
            info!(slots = snapshot.slots.len(), "Availability: {}", describe(snapshot));
        }
        AvailabilityEvent::Update(snapshot) => {
            info!(slots = snapshot.slots.len(), "Update: {}", describe(snapshot));
        }
        AvailabilityEvent::Error(e) => warn!(error = %e, "Stream error"),
        AvailabilityEvent::ConnectionChanged(state) => info!(state = %state, "Connection"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tablestream_watch=info".parse()?)
                .add_directive("tablestream_core=info".parse()?),
        )
        .with_target(true)
        .init();

    let args = Args::parse();
    let key = SubscriptionKey::new(args.restaurant_id, args.date, args.party_size)?;
    let config = resolve_config(&args)?;

    info!(
        key = %key,
        api = %config.api.base_url,
        streaming = config.stream.streaming_enabled,
        polling = config.stream.polling_enabled,
        signed_in = args.token.is_some(),
        "Starting availability watch"
    );

    let tokens = Arc::new(StaticTokenStore::new(args.token.clone()));
    let client = HttpAvailabilityClient::new(config.api.clone(), tokens.clone())
        .context("Failed to create HTTP client")?;
    let stream = AvailabilityStream::with_client(Arc::new(client), tokens, config.stream)
        .context("Invalid stream configuration")?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = stream.subscribe(key, tx);

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => log_event(&event),
                None => {
                    error!("Subscription ended unexpectedly");
                    break;
                }
            },
            result = signal::ctrl_c() => {
                if let Err(e) = result {
                    error!(error = %e, "Failed to listen for Ctrl-C");
                }
                info!("Interrupted, unsubscribing");
                break;
            }
        }
    }

    subscription.unsubscribe();
    // Give the unsubscribe notification a moment to leave
    tokio::time::sleep(std::time::Duration::from_millis(250)).await;

    info!("Availability watch stopped");
    Ok(())
}
