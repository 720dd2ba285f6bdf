use anyhow::Result;
use clap::Parser;
use gpg_bridge::{BridgeConfig, ListingFormat, server};
use gpg_bridge_protocol::default_listen_addr;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Loopback WebSocket bridge between browser pages and the local OpenPGP agent"
)]
struct Args {
    /// Loopback address to listen on.
    #[arg(long, default_value_t = default_listen_addr())]
    listen: SocketAddr,

    /// OpenPGP executable to delegate to.
    #[arg(long, default_value = "gpg")]
    gpg: PathBuf,

    /// GnuPG home directory (passed to the agent as --homedir).
    #[arg(long)]
    homedir: Option<PathBuf>,

    /// Parse the machine-readable `--with-colons` key listing.
    #[arg(long)]
    colon_listing: bool,

    /// Pending results buffered per command.
    #[arg(long, default_value_t = 5)]
    queue_capacity: usize,

    /// Seconds in-flight sessions may run after shutdown is requested.
    #[arg(long, default_value_t = 10)]
    shutdown_grace_secs: u64,
}

impl Args {
    fn into_config(self) -> BridgeConfig {
        BridgeConfig {
            listen: self.listen,
            gpg_program: self.gpg,
            homedir: self.homedir,
            listing_format: if self.colon_listing {
                ListingFormat::Colons
            } else {
                ListingFormat::Human
            },
            result_queue_capacity: self.queue_capacity,
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gpg_bridge=info".into()),
        )
        .init();

    let config = Args::parse().into_config();
    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    server::serve(config, shutdown).await?;
    tracing::info!("gpg-bridge shut down");
    Ok(())
}

/// Cancel `shutdown` on SIGINT or SIGTERM.
async fn watch_signals(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("failed to install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    tracing::info!("received shutdown signal");
    shutdown.cancel();
}
