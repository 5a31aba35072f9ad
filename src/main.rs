//! wgcore CLI
//!
//! Key utilities, and a UDP-hosted engine driven by a JSON configuration.

use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use wgcore::config::encoding::parse_key;
use wgcore::crypto::x25519;
use wgcore::driver::Driver;
use wgcore::{Device, DeviceConfig, WgError};

/// wgcore - WireGuard protocol engine
#[derive(Parser, Debug)]
#[command(name = "wgcore")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a new base64 private key
    Genkey,
    /// Read a base64 private key on stdin and print its public key
    Pubkey,
    /// Run the engine on a UDP socket
    Run {
        /// Path to the JSON device configuration
        #[arg(short, long)]
        config: PathBuf,

        /// Log a status summary every N seconds (0 disables)
        #[arg(long, default_value_t = 0)]
        status_interval: u64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            match e.downcast_ref::<WgError>() {
                Some(wg) => ExitCode::from(wg.exit_code() as u8),
                None => ExitCode::FAILURE,
            }
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    match args.command {
        Command::Genkey => {
            let (private, _) = x25519::generate_keypair();
            println!("{}", BASE64.encode(private));
            Ok(())
        }
        Command::Pubkey => {
            let mut input = String::new();
            std::io::stdin()
                .read_to_string(&mut input)
                .context("reading private key from stdin")?;
            let private = parse_key(&input, "private_key").map_err(WgError::from)?;
            println!("{}", BASE64.encode(x25519::public_key(&private)));
            Ok(())
        }
        Command::Run {
            config,
            status_interval,
        } => run_device(config, status_interval).await,
    }
}

async fn run_device(path: PathBuf, status_interval: u64) -> anyhow::Result<()> {
    tracing::info!("Loading configuration from: {}", path.display());
    let config = DeviceConfig::from_file(&path).map_err(WgError::from)?;

    let driver = Driver::bind(&config).await?;
    let device = std::sync::Arc::clone(driver.device());

    // No tunnel side here: count what would be delivered
    let (tx, mut rx) = tokio::sync::mpsc::channel::<Vec<u8>>(256);
    tokio::spawn(async move {
        while let Some(packet) = rx.recv().await {
            tracing::trace!("Inner packet: {} bytes", packet.len());
        }
    });

    if status_interval > 0 {
        let device = std::sync::Arc::clone(&device);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(status_interval));
            loop {
                ticker.tick().await;
                log_status(&device);
            }
        });
    }

    driver.run(tx, shutdown_signal()).await?;
    log_status(&device);
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}

fn log_status(device: &Device) {
    let status = device.status();
    tracing::info!(
        "Interface {} port {}: {} peers, {} sessions",
        BASE64.encode(status.public_key),
        status.listen_port,
        status.peers.len(),
        device.session_count()
    );
    for peer in &status.peers {
        tracing::info!(
            "  {} [{}] endpoint {:?} stable {} unstable {} handshake {:?}",
            peer.name
                .clone()
                .unwrap_or_else(|| BASE64.encode(&peer.public_key[..8])),
            peer.state.as_str(),
            peer.endpoint,
            peer.stable,
            peer.unstable,
            peer.last_handshake
        );
    }
}
