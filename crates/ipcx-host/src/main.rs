//! ipcx host - serves demo collections over a local IPC endpoint.
//!
//! Registers a `math` and a `sys` collection, prints the endpoint for the
//! parent process to read and runs until Ctrl-C.

mod collections;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "ipcx-host")]
#[command(about = "Expose demo collections over a local IPC endpoint")]
struct Args {
    /// Socket path (Unix) or pipe name (Windows); defaults to a per-platform location
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting ipcx host");

    let endpoint = args.socket.unwrap_or_else(ipcx::default_endpoint);

    let server = ipcx::Server::new();
    server.set_connect_handler(|client| {
        info!("Client {} connected", client);
        true
    });
    server.set_disconnect_handler(|client| info!("Client {} disconnected", client));

    for collection in collections::all() {
        server
            .register_collection(collection)
            .context("Failed to register demo collection")?;
    }

    server
        .initialize(&endpoint)
        .with_context(|| format!("Failed to listen on {}", endpoint.display()))?;

    // Print endpoint for the parent process to read (intentional stdout for IPC)
    println!("IPCX_ENDPOINT={}", endpoint.display());

    info!("Serving {:?} on {}", server.collection_names(), endpoint.display());

    // Wait for shutdown signal
    let (shutdown_tx, shutdown_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(());
    })
    .context("Failed to install Ctrl-C handler")?;
    let _ = shutdown_rx.recv();

    info!("Shutdown signal received, exiting");
    server.finalize();

    Ok(())
}
