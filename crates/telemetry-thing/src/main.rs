// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Telemetry Thing CLI
//!
//! Replays a telemetry file to an MQTT broker as a device would.
//!
//! # Usage
//!
//! ```bash
//! # Replay to AWS IoT with mutual TLS
//! telemetry-thing -e abc123-ats.iot.eu-west-1.amazonaws.com \
//!     -r root-CA.crt -c Bot.cert.pem -k Bot.private.key -n Bot
//!
//! # Replay a configured trip without a broker
//! telemetry-thing --config replay.toml --dry-run
//!
//! # Generate an example configuration
//! telemetry-thing gen-config --output replay.toml
//! ```

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use telemetry_replay::{
    pacing, LogPublisher, Pacing, PublishDriver, Publisher, RecordCursor, ReplayConfig,
    StateStore, ThreadSleeper,
};
use telemetry_thing::{ConnectionSettings, MqttConnection, TlsFiles};
use tracing_subscriber::EnvFilter;

/// Telemetry file replay to an MQTT broker
#[derive(Parser, Debug)]
#[command(name = "telemetry-thing")]
#[command(about = "Replay recorded telemetry to an MQTT broker with device shadow sync")]
#[command(version)]
struct Args {
    /// Broker endpoint
    #[arg(short, long)]
    endpoint: Option<String>,

    /// Broker port
    #[arg(short, long, default_value = "8883")]
    port: u16,

    /// Root CA file path
    #[arg(short = 'r', long)]
    root_ca: Option<PathBuf>,

    /// Certificate file path
    #[arg(short, long)]
    cert: Option<PathBuf>,

    /// Private key file path
    #[arg(short, long)]
    key: Option<PathBuf>,

    /// Thing name (client id and default device id)
    #[arg(short = 'n', long, default_value = "Bot")]
    thing_name: String,

    /// Configuration file path
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log messages instead of publishing them
    #[arg(long)]
    dry_run: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate example configuration file
    GenConfig {
        /// Output file path
        #[arg(short, long, default_value = "replay.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },
}

/// How long to wait for the first ConnAck before ticking anyway.
const CONNECT_WAIT: Duration = Duration::from_secs(10);

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if let Some(cmd) = args.command {
        return match cmd {
            Commands::GenConfig { output } => cmd_gen_config(output),
            Commands::Validate { config } => cmd_validate(config),
        };
    }

    let mut config = match &args.config {
        Some(path) => ReplayConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ReplayConfig::default(),
    };
    if config.state.deviceid.is_empty() {
        config.state.deviceid = args.thing_name.clone();
    }
    config.validate()?;

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("installing Ctrl+C handler")?;

    let state = config.state.clone();
    let pacing = Pacing::from_rate(state.message_publish_rate, config.driver.poll_interval());
    let cursor = RecordCursor::new(config.resolver(), state.record_format());
    let (store, deltas) = StateStore::new(state);

    let publisher: Box<dyn Publisher> = if args.dry_run {
        let mut publisher = LogPublisher::new();
        publisher.connect()?;
        Box::new(publisher)
    } else {
        let settings = connection_settings(&args)?;
        let mut connection = MqttConnection::new(&settings, deltas)?;
        connection.connect()?;
        if !connection.wait_connected(CONNECT_WAIT) {
            tracing::warn!("No ConnAck after {:?}, publishes will back off", CONNECT_WAIT);
        }
        Box::new(connection)
    };

    let mut driver = PublishDriver::new(cursor, store, publisher, config.driver.clone())?
        .with_running(Arc::clone(&running));
    let mut sleeper = ThreadSleeper::with_running(Arc::clone(&running));

    println!("Telemetry Thing v{}", env!("CARGO_PKG_VERSION"));
    println!("Device: {}", config.state.deviceid);
    println!("Source: {}", config.state.file);
    println!("Press Ctrl+C to stop...");
    println!();

    let stats = pacing::run(&mut driver, pacing, &mut sleeper, &running);

    if let Err(e) = driver.publisher_mut().disconnect() {
        tracing::warn!("Disconnect failed: {}", e);
    }

    let cursor_stats = driver.cursor().stats();
    println!();
    println!("Final Statistics:");
    println!("  Messages:      {}", stats.messages);
    println!("  Published:     {}", stats.published);
    println!("  Retries:       {}", stats.retries);
    println!("  Escalations:   {}", stats.escalations);
    println!("  Skipped:       {}", stats.skipped + cursor_stats.malformed_skipped);
    println!("  Abandoned:     {}", stats.abandoned);
    println!("  Loops:         {}", cursor_stats.loops_completed);
    Ok(())
}

fn connection_settings(args: &Args) -> anyhow::Result<ConnectionSettings> {
    let Some(endpoint) = &args.endpoint else {
        bail!("Missing --endpoint (or use --dry-run)");
    };
    let settings = ConnectionSettings::new(endpoint.clone(), args.port, args.thing_name.clone());

    match (&args.root_ca, &args.cert, &args.key) {
        (Some(root_ca), Some(cert), Some(key)) => Ok(settings.with_tls(TlsFiles {
            root_ca: root_ca.clone(),
            cert: cert.clone(),
            key: key.clone(),
        })),
        (None, None, None) => {
            tracing::warn!("No TLS files given, connecting over plain TCP");
            Ok(settings)
        }
        _ => bail!("--root-ca, --cert and --key must be given together"),
    }
}

fn cmd_gen_config(output: PathBuf) -> anyhow::Result<()> {
    let toml_str = ReplayConfig::example().to_toml()?;

    let content = format!(
        r#"# Telemetry Thing Configuration
# Generated by telemetry-thing gen-config
#
# timestamp_offset accepts seconds or "yesterday" (local midnight).
# message_publish_rate accepts messages/second or "source" (recorded pace).

{}
"#,
        toml_str
    );

    std::fs::write(&output, content)
        .with_context(|| format!("writing {}", output.display()))?;
    println!("Generated configuration file: {}", output.display());
    Ok(())
}

fn cmd_validate(config_path: PathBuf) -> anyhow::Result<()> {
    match ReplayConfig::from_file(&config_path) {
        Ok(config) => {
            let state = &config.state;
            println!("Configuration valid!");
            println!();
            println!("Source:   {}", state.file);
            println!("Strategy: {}", state.payload_strategy);
            println!("Topic:    {}", state.topic_name);
            match state.message_publish_rate {
                Some(rate) => println!("Rate:     {} msg/s", rate),
                None => println!("Rate:     source paced"),
            }
            println!("At end:   {:?}", state.at_end);
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration invalid: {}", e);
            std::process::exit(1);
        }
    }
}
