//! membership-daemon: disconnect confirmation for one realm over stdio.
//!
//! Reads detector signals and witness messages as JSON lines on stdin and
//! writes outgoing witness messages and membership events to stdout. Logs
//! go to stderr.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader, Stdout};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use membership_core::{DisconnectConfig, PeerId, RealmId};
use membership_daemon::{Daemon, LineReader, OutputLine, RawLine};

#[derive(Parser, Debug)]
#[command(name = "membership-daemon")]
#[command(about = "Disconnect confirmation and membership stability daemon")]
struct Args {
    /// Realm to monitor
    #[arg(short, long)]
    realm: String,

    /// Peer ID (generated if not provided)
    #[arg(long)]
    peer_id: Option<String>,

    /// Initial realm member (repeatable)
    #[arg(short, long = "member")]
    members: Vec<String>,

    /// JSON config file; flags below override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Grace period in milliseconds (0 disables)
    #[arg(long)]
    grace_period_ms: Option<u64>,

    #[arg(long)]
    flap_window_ms: Option<u64>,

    #[arg(long)]
    flap_threshold: Option<usize>,

    #[arg(long)]
    protection_duration_ms: Option<u64>,

    /// Realms smaller than this confirm on one witness
    #[arg(long)]
    fast_path_cutoff: Option<usize>,

    #[arg(long)]
    vote_timeout_ms: Option<u64>,

    /// Reports per target per window
    #[arg(long)]
    max_reports: Option<u32>,

    #[arg(long)]
    report_window_ms: Option<u64>,

    /// Seconds between purges of stale tracker entries
    #[arg(long, default_value = "30")]
    purge_interval_secs: u64,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

impl Args {
    fn load_config(&self) -> Result<DisconnectConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let data = std::fs::read(path)
                    .with_context(|| format!("Failed to read config {:?}", path))?;
                DisconnectConfig::from_json(&data)
                    .with_context(|| format!("Invalid config {:?}", path))?
            }
            None => DisconnectConfig::default(),
        };

        if let Some(v) = self.grace_period_ms {
            config.grace_period_ms = v;
        }
        if let Some(v) = self.flap_window_ms {
            config.flap_window_ms = v;
        }
        if let Some(v) = self.flap_threshold {
            config.flap_threshold = v;
        }
        if let Some(v) = self.protection_duration_ms {
            config.protection_duration_ms = v;
        }
        if let Some(v) = self.fast_path_cutoff {
            config.fast_path_cutoff = v;
        }
        if let Some(v) = self.vote_timeout_ms {
            config.vote_timeout_ms = v;
        }
        if let Some(v) = self.max_reports {
            config.max_reports = v;
        }
        if let Some(v) = self.report_window_ms {
            config.report_window_ms = v;
        }
        Ok(config)
    }
}

async fn emit(stdout: &mut Stdout, line: &OutputLine) {
    let text = match line.to_line() {
        Ok(text) => text,
        Err(e) => {
            error!("Failed to encode output: {}", e);
            return;
        }
    };
    let written = async {
        stdout.write_all(text.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await
    };
    if let Err(e) = written.await {
        error!("Failed to write output: {}", e);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Respects RUST_LOG, defaults to info (or debug with --verbose). Stdout
    // carries protocol lines, so logs go to stderr.
    let default_filter = if args.verbose {
        "debug,membership_core=debug,membership_daemon=debug"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    info!("Starting membership-daemon");

    let config = args.load_config()?;
    debug!("Config: {:?}", config);

    let realm = RealmId::new(args.realm.clone())?;
    let peer_id = match &args.peer_id {
        Some(id) => id.parse::<PeerId>()?,
        None => {
            let id = PeerId::generate();
            info!("Generated peer ID: {}", id);
            id
        }
    };
    let members = args
        .members
        .iter()
        .map(|m| m.parse::<PeerId>())
        .collect::<Result<Vec<_>, _>>()
        .context("Invalid --member")?;

    let (daemon, mut channels) = Daemon::new(peer_id, realm, &config, &members);

    let mut stdin = LineReader::new(BufReader::new(tokio::io::stdin()));
    let mut stdout = tokio::io::stdout();
    let mut purge = tokio::time::interval(Duration::from_secs(args.purge_interval_secs.max(1)));

    info!("Daemon running. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            line = stdin.next_line() => {
                match line {
                    Ok(Some(RawLine::Text(line))) => {
                        if let Some(reply) = daemon.handle_line(&line) {
                            emit(&mut stdout, &reply).await;
                        }
                    }
                    Ok(Some(RawLine::TooLong(len))) => {
                        warn!("Skipping input line: {} bytes exceeds limit", len);
                    }
                    Ok(Some(RawLine::InvalidUtf8)) => {
                        warn!("Skipping input line: not valid UTF-8");
                    }
                    Ok(None) => {
                        info!("Input closed");
                        break;
                    }
                    Err(e) => {
                        error!("Failed to read input: {}", e);
                        break;
                    }
                }
            }

            Some(notice) = channels.expired.recv() => {
                daemon.on_grace_expired(notice);
            }

            Some(outbound) = channels.outbound.recv() => {
                let line = OutputLine::Witness {
                    to: outbound.to,
                    message: outbound.message,
                };
                emit(&mut stdout, &line).await;
            }

            Some(event) = channels.events.recv() => {
                emit(&mut stdout, &OutputLine::Event { event }).await;
            }

            _ = purge.tick() => {
                daemon.purge_expired();
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    info!("Shutting down");
    Ok(())
}
