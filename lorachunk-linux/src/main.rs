// lorachunk: send and receive files over a LoRa UART module.

mod config;
mod node;
mod transport;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use lorachunk_core::{NodeCore, SenderState};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::node::Node;
use crate::transport::SerialTransport;

#[derive(Parser, Debug)]
#[command(name = "lorachunk", version, about = "Chunked file transfer over LoRa")]
struct Cli {
    /// Config file (default: ~/.config/lorachunk/config.toml, then /etc/lorachunk/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Serial device of the radio module
    #[arg(long, global = true)]
    serial: Option<PathBuf>,
    /// UART baud rate of the radio module
    #[arg(long, global = true)]
    baud: Option<u32>,
    /// Directory for received files
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a file and wait for the receiver to confirm it
    Send {
        file: PathBuf,
        /// Destination address (65535 = broadcast)
        dest: Option<u16>,
    },
    /// Receive files until interrupted
    Receive {
        /// Own address
        addr: Option<u16>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut cfg = config::load(cli.config.as_deref())?;
    if let Some(serial) = cli.serial {
        cfg.serial = serial;
    }
    if let Some(baud) = cli.baud {
        cfg.baud = baud;
    }
    if let Some(dir) = cli.output_dir {
        cfg.output_dir = dir;
    }

    // Read the input before touching the radio so a bad path fails fast.
    let job = match cli.command {
        Command::Send { file, dest } => {
            let bytes = std::fs::read(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            Job::Send {
                dest: dest.unwrap_or(cfg.dest_address),
                bytes,
            }
        }
        Command::Receive { addr } => {
            if let Some(addr) = addr {
                cfg.radio.address = addr;
            }
            std::fs::create_dir_all(&cfg.output_dir)
                .with_context(|| format!("creating {}", cfg.output_dir.display()))?;
            Job::Receive
        }
    };

    let core = NodeCore::new(cfg.radio, cfg.protocol.to_protocol())?;
    let transport = SerialTransport::open(&cfg.serial, cfg.baud)
        .with_context(|| format!("opening {} at {} baud", cfg.serial.display(), cfg.baud))?;
    let node = Node::new(core, transport, cfg.output_dir.clone(), cfg.poll_interval());

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(node, job))
}

enum Job {
    Send { dest: u16, bytes: Vec<u8> },
    Receive,
}

/// Run the blocking polling loop on a worker thread; a signal sets its stop flag.
async fn run(mut node: Node<SerialTransport>, job: Job) -> anyhow::Result<()> {
    let stop = Arc::new(AtomicBool::new(false));
    let signal_stop = stop.clone();
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            warn!(error = %e, "signal handler failed");
            return;
        }
        info!("shutting down");
        signal_stop.store(true, Ordering::SeqCst);
    });

    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        match job {
            Job::Receive => {
                node.run(&stop)?;
                let stats = node.core().resync_stats();
                info!(
                    frames = stats.frames,
                    skipped_bytes = stats.skipped_bytes,
                    noise_discards = stats.noise_discards,
                    "receiver stopped"
                );
                Ok(())
            }
            Job::Send { dest, bytes } => match node.run_transfer(dest, &bytes, &stop)? {
                Some(SenderState::Complete { rounds }) => {
                    info!(rounds, "transfer confirmed by receiver");
                    Ok(())
                }
                Some(SenderState::Failed { rounds }) => {
                    bail!("transfer to {} failed after {} rounds", dest, rounds)
                }
                Some(other) => bail!("transfer ended in unexpected state {:?}", other),
                None => bail!("transfer interrupted"),
            },
        }
    })
    .await
    .context("polling loop panicked")?
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
