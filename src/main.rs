//! Binary entry point: parses configuration, brings the broker up in the
//! order the design calls for (store → restore → control listener →
//! shutdown wait), and tears it down within a bounded deadline.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use tunnelbroker_core::Lifecycle;

/// Private TCP tunnel broker.
#[derive(Debug, Parser)]
#[command(name = "tunnelbroker", version, about)]
struct Config {
    /// Address the control listener binds to.
    #[arg(long, env = "TUNNELBROKER_BIND_ADDR", default_value = "0.0.0.0")]
    bind_addr: IpAddr,

    /// Port agents connect to for the control protocol.
    #[arg(long, env = "TUNNELBROKER_CONTROL_PORT", default_value_t = tunnelbroker_shared::CONTROL_PORT)]
    control_port: u16,

    /// Admin API port. Reserved for a future release; the broker does
    /// not yet serve anything on it.
    #[arg(long, env = "TUNNELBROKER_ADMIN_API_PORT")]
    admin_api_port: Option<u16>,

    /// Postgres connection string.
    #[arg(long, env = "TUNNELBROKER_DATABASE_URL")]
    database_url: String,

    /// Age beyond which a session still marked active at startup is
    /// considered stale and swept before restoration runs.
    #[arg(
        long,
        env = "TUNNELBROKER_STALE_SESSION_SECS",
        default_value_t = tunnelbroker_shared::STALE_SESSION_THRESHOLD.as_secs()
    )]
    stale_session_secs: u64,

    /// How long to wait, after a shutdown signal, for open tunnels to
    /// drain before exiting anyway.
    #[arg(long, env = "TUNNELBROKER_DRAIN_DEADLINE_SECS", default_value_t = 30)]
    drain_deadline_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::parse();

    if config.admin_api_port.is_some() {
        tracing::warn!("admin_api_port is configured but the admin API is not yet implemented");
    }

    let lifecycle = Lifecycle::bootstrap(&config.database_url, config.bind_addr).await?;

    let summary = lifecycle
        .restore(Duration::from_secs(config.stale_session_secs))
        .await?;
    tracing::info!(?summary, "startup restoration finished");

    let bind_addr = SocketAddr::new(config.bind_addr, config.control_port);
    let listener_fut = lifecycle.run_control_listener(bind_addr, Duration::from_secs(config.drain_deadline_secs));
    tokio::pin!(listener_fut);

    tokio::select! {
        result = &mut listener_fut => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received shutdown signal");
            lifecycle.request_shutdown();
            listener_fut.await?;
        }
    }

    Ok(())
}
