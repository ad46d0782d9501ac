//! direct-tcpip forwarder
//!
//! Runs the configured local port forwards over an in-process loopback
//! session, so every relayed connection goes through the full channel
//! machinery (open handshake, windows, close handshake).

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use direct_tcpip::{
    config::{generate_example_config, Config, ForwardConfig, LoggingConfig},
    session::spawn_loopback,
    ForwardingListener,
};
use std::path::Path;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

/// Local port forwarding over direct-tcpip channels
#[derive(Parser, Debug)]
#[command(name = "tcpip-forward")]
#[command(about = "Local port forwarding over direct-tcpip channels")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Listen address (adds a forward, needs --target)
    #[arg(short, long, requires = "target")]
    listen: Option<String>,

    /// Target host:port for --listen
    #[arg(short, long, requires = "listen")]
    target: Option<String>,

    /// Log level (trace, debug, info, warn, error), overrides config
    #[arg(short = 'v', long)]
    log_level: Option<String>,

    /// Print an example configuration and exit
    #[arg(long)]
    generate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_config {
        let text = toml::to_string_pretty(&generate_example_config())
            .context("Failed to serialize example configuration")?;
        println!("{}", text);
        return Ok(());
    }

    let mut config = if Path::new(&args.config).exists() {
        Config::load(&args.config).context("Failed to load configuration")?
    } else {
        Config::default()
    };
    if let (Some(listen), Some(target)) = (&args.listen, &args.target) {
        config.forward.push(ForwardConfig::new(listen.clone(), target.clone()));
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    config.validate().context("Invalid configuration")?;

    init_logging(&config.logging)?;

    if config.forward.is_empty() {
        return Err(anyhow!(
            "No forwards configured; add [[forward]] to {} or pass --listen/--target",
            args.config
        ));
    }

    info!("tcpip-forward v{} starting", direct_tcpip::VERSION);
    let (mux, session) = spawn_loopback(config.channel.clone());

    let mut listeners = Vec::with_capacity(config.forward.len());
    for forward in &config.forward {
        let mut listener = ForwardingListener::from_config(mux.clone(), forward)?;
        match listener.start().await {
            Ok(addr) => info!("Listening on {} for {}", addr, forward.target),
            Err(e) => {
                error!("Forward {} -> {} not started: {}", forward.listen, forward.target, e);
                continue;
            }
        }
        listeners.push(listener);
    }
    if listeners.is_empty() {
        return Err(anyhow!("No forward could be started"));
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for Ctrl-C")?;
    info!("Shutting down...");

    for listener in &mut listeners {
        listener.close().await;
    }
    session.close();
    mux.shutdown().await;

    if mux.channel_count() > 0 {
        warn!("{} channels still registered at exit", mux.channel_count());
    }
    Ok(())
}

fn init_logging(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_new(&logging.level)
        .with_context(|| format!("Invalid log level {}", logging.level))?;

    let (writer, ansi) = match &logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path))?;
            (BoxMakeWriter::new(std::sync::Mutex::new(file)), false)
        }
        None => (BoxMakeWriter::new(std::io::stderr), true),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(ansi);

    match logging.format.as_str() {
        "json" => builder.json().init(),
        "compact" => builder.compact().init(),
        "pretty" => builder.pretty().init(),
        other => {
            builder.init();
            warn!("Unknown log format {}, using default", other);
        }
    }
    Ok(())
}
