//! Weightfeed CLI
//!
//! Command-line interface for the live weight feed:
//! - Fetch a single reading
//! - Watch live readings
//! - Check connection status
//! - Print a default config file

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use weightfeed::config::{generate_default_config, Config};
use weightfeed::{MqttTransport, WeightFeed};

#[derive(Parser)]
#[command(name = "weightfeed")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Live weight readings from a networked scale")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: search the usual locations)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the broker URL
    #[arg(long, global = true)]
    pub broker_url: Option<String>,

    /// Override the sensor topic
    #[arg(long, global = true)]
    pub topic: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Read the scale once
    Fetch,

    /// Stream live readings until Ctrl-C
    Watch {
        /// Stop after this many readings
        #[arg(short = 'n', long)]
        count: Option<usize>,
    },

    /// Connect and report connection status
    Status,

    /// Print a default configuration file
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Config = cli.command {
        print!("{}", generate_default_config());
        return Ok(());
    }

    let mut config = match &cli.config {
        Some(path) => Config::load_with_env(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::load_default(),
    };
    if let Some(url) = cli.broker_url {
        config.broker.url = url;
    }
    if let Some(topic) = cli.topic {
        config.broker.topic = topic;
    }

    weightfeed::telemetry::init(&config.logging);
    tracing::info!("Weightfeed v{}", env!("CARGO_PKG_VERSION"));

    let transport = Arc::new(MqttTransport::new(config.broker.clone()));
    let fetch_budget = config.feed.fetch_timeout();
    let feed = WeightFeed::new(config.broker, config.feed, transport);

    let result = match cli.command {
        Commands::Fetch => fetch(&feed).await,
        Commands::Watch { count } => watch(&feed, count).await,
        Commands::Status => status(&feed, fetch_budget).await,
        Commands::Config => Ok(()),
    };

    feed.disconnect().await;
    result
}

async fn fetch(feed: &WeightFeed) -> anyhow::Result<()> {
    let grams = feed
        .fetch_current_weight()
        .await
        .context("fetching weight from the scale")?;
    println!("{} g", grams);
    Ok(())
}

async fn watch(feed: &WeightFeed, count: Option<usize>) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let live = feed.on_weight_update(move |grams| {
        tracing::info!(grams, "Live weight update");
        let _ = tx.send(grams);
    });

    feed.connect();
    println!("Watching {} (Ctrl-C to stop)", feed.topic());

    let mut seen = 0usize;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
            reading = rx.recv() => {
                let Some(grams) = reading else { break };
                println!("{} g", grams);
                seen += 1;
                if count.is_some_and(|limit| seen >= limit) {
                    break;
                }
            }
        }
    }

    live.unsubscribe();
    Ok(())
}

async fn status(feed: &WeightFeed, budget: Duration) -> anyhow::Result<()> {
    feed.connect();
    let mut state = feed.watch_state();
    let _ = tokio::time::timeout(budget, state.wait_for(|s| s.is_connected())).await;

    println!("Topic:     {}", feed.topic());
    println!("Client id: {}", feed.client_id());
    println!("State:     {}", feed.connection_state());
    println!("Attempts:  {}", feed.connection_attempts());
    match feed.last_reading() {
        Some(reading) => println!(
            "Reading:   {} g at {}",
            reading.grams,
            reading.received_at.to_rfc3339()
        ),
        None => println!("Reading:   none yet"),
    }
    Ok(())
}
