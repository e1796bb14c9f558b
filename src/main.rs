//! pixelrelay - A Pixel-Stream Relay for Display Walls
//!
//! This is the main entry point for the relay server. It binds the
//! listener and, standing in for a wall compositor, logs stream activity
//! and drains each stream's freshest frame as it becomes ready.
//!
//! # Usage
//!
//! ```bash
//! # Start on the default port (1701)
//! pixelrelay
//!
//! # Custom address and handshake timeout
//! pixelrelay --host 127.0.0.1 --port 1702 --handshake-timeout-ms 2000
//!
//! # Verbose logging
//! RUST_LOG=pixelrelay=debug pixelrelay
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use pixelrelay::{Notification, RelayConfig, Server};
use std::time::Duration;
use tokio::signal;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Relay remote pixel streams to a display wall
#[derive(Parser, Debug)]
#[command(name = "pixelrelay")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Host to bind to
    #[arg(long, default_value = pixelrelay::DEFAULT_HOST)]
    host: String,

    /// Port to listen on
    #[arg(short = 'p', long, default_value_t = pixelrelay::DEFAULT_PORT)]
    port: u16,

    /// Milliseconds a new connection has to send its handshake
    #[arg(long, default_value_t = 5000, value_name = "MS")]
    handshake_timeout_ms: u64,

    /// Largest accepted message body in bytes
    #[arg(
        long,
        default_value_t = pixelrelay::protocol::DEFAULT_MAX_MESSAGE_SIZE,
        value_name = "BYTES"
    )]
    max_message_size: usize,

    /// Largest tile count a frame may declare
    #[arg(
        long,
        default_value_t = pixelrelay::protocol::DEFAULT_MAX_TILES_PER_FRAME,
        value_name = "TILES"
    )]
    max_tiles_per_frame: u32,
}

impl Args {
    fn into_config(self) -> RelayConfig {
        RelayConfig {
            host: self.host,
            port: self.port,
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            max_message_size: self.max_message_size,
            max_tiles_per_frame: self.max_tiles_per_frame,
            ..RelayConfig::default()
        }
    }
}

fn print_banner(server: &Server) {
    println!(
        r#"
pixelrelay v{} - Pixel-Stream Relay
──────────────────────────────────────────────────────────────
Listening on {} ({})
Ready to accept producers.

Use Ctrl+C to shutdown gracefully.
"#,
        pixelrelay::VERSION,
        server.local_addr(),
        server.config().service_name
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Args::parse().into_config();

    // Set up logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    let bind_address = config.bind_address();
    let server = Server::start(config)
        .await
        .with_context(|| format!("failed to start relay on {}", bind_address))?;
    print_banner(&server);

    let mut notifications = server.subscribe();

    // Set up graceful shutdown
    let shutdown = signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            notification = notifications.recv() => match notification {
                Some(notification) => on_notification(&server, notification),
                None => break,
            },
            result = &mut shutdown => {
                result.context("failed to listen for Ctrl+C")?;
                info!("Shutdown signal received, stopping server...");
                break;
            }
        }
    }

    server.shutdown().await;
    info!("Server shutdown complete");
    Ok(())
}

/// Minimal compositor: pull ready frames, log lifecycle changes.
fn on_notification(server: &Server, notification: Notification) {
    match notification {
        Notification::FrameReady { uri } => {
            if let Some(frame) = server.frame_dispatcher().take_latest_frame(&uri) {
                debug!(
                    uri = %uri,
                    frame = frame.index(),
                    tiles = frame.tile_count(),
                    bytes = frame.payload_len(),
                    "Frame pulled"
                );
            }
        }
        Notification::StreamOpened { uri } => info!(uri = %uri, "Stream opened"),
        Notification::StreamClosed { uri } => info!(uri = %uri, "Stream closed"),
        Notification::EventSubscription { uri, success } => {
            info!(uri = %uri, success, "Event subscription")
        }
        Notification::SizeHintsChanged { uri, hints } => {
            info!(uri = %uri, ?hints, "Size hints changed");
            if let Err(e) = server.acknowledge_size_hints(&uri, hints) {
                debug!(uri = %uri, error = %e, "Size hints not acknowledged");
            }
        }
    }
}
