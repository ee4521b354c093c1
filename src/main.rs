mod auth;
mod buffer_pool;
mod config;
mod connection;
mod downstream;
mod listener;
mod quota;
mod request;
mod response;
mod session;
mod store;
mod traffic;
mod tunnel;

use crate::auth::CredentialVerifier;
use crate::config::{Cli, GatewayConfig};
use crate::connection::{load_level, LoadLevel, SessionGuard};
use crate::downstream::DownstreamConnector;
use crate::quota::QuotaEnforcer;
use crate::store::RedisStore;
use crate::tunnel::Gateway;
use clap::Parser;
use color_eyre::eyre::Result;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;

/// How long shutdown waits for open tunnels to drain
const SHUTDOWN_GRACE_SECS: u64 = 30;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("flash_auth_proxy=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    color_eyre::install()?;

    let args = Cli::parse();
    let config = GatewayConfig::from_cli(args).await?;

    let store = Arc::new(
        RedisStore::connect(
            &config.redis_addr,
            config.redis_password.clone(),
            config.redis_db,
            config.redis_timeout,
        )
        .await?,
    );

    let gateway = Arc::new(Gateway {
        verifier: CredentialVerifier::new(store.clone()),
        quota: QuotaEnforcer::new(store, config.limit_bytes, config.quota_window),
        downstream: DownstreamConnector::new(
            config.backend_addr,
            config.downstream_auth.clone(),
            config.connect_timeout,
        ),
        realm: config.realm.clone(),
        handshake_timeout: config.handshake_timeout,
    });

    let listener = TcpListener::bind(config.listen_addr).await?;

    info!("Gateway listening on {}", config.listen_addr);
    info!("Downstream proxy: {}", config.backend_addr);
    info!(
        "Per-user cap: {} bytes per {}ms window",
        config.limit_bytes,
        config.quota_window.as_millis()
    );

    tokio::task::spawn(monitor(config.status_interval));

    tokio::select! {
        _ = listener::serve(listener, gateway) => {}
        result = signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received");
            drain().await;
        }
    }

    Ok(())
}

/// Periodic status line with session gauge and byte totals
async fn monitor(every: Duration) {
    let mut interval = tokio::time::interval(every);
    let mut last_active_count = 0;
    let mut stable_count_intervals = 0;

    loop {
        interval.tick().await;

        let active = SessionGuard::active_count();
        let (upstream, downstream) = traffic::totals();

        if active > 0 && active != last_active_count {
            info!(
                "Status - active sessions: {}, total bytes up: {}, down: {}",
                active, upstream, downstream
            );
        }

        // Stable high counts usually mean leaked sessions
        if active == last_active_count && active > 1000 {
            stable_count_intervals += 1;
            if stable_count_intervals >= 3 {
                warn!(
                    "Potential session leak detected: {} sessions stable for {} intervals",
                    active, stable_count_intervals
                );
            }
        } else {
            stable_count_intervals = 0;
        }

        match load_level(active) {
            LoadLevel::Normal => {}
            LoadLevel::Moderate => info!("Moderate session load: {} active", active),
            LoadLevel::High => warn!("High session load: {} active", active),
            LoadLevel::Critical => error!("CRITICAL session load: {} active", active),
        }

        last_active_count = active;
    }
}

/// Wait for open sessions to finish, up to the grace period
async fn drain() {
    let active = SessionGuard::active_count();
    if active == 0 {
        return;
    }
    info!("Waiting for {} sessions to close...", active);

    for i in 1..=SHUTDOWN_GRACE_SECS {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let remaining = SessionGuard::active_count();

        if remaining == 0 {
            info!("All sessions closed gracefully");
            return;
        }

        if i % 5 == 0 {
            info!(
                "Still waiting for {} sessions... ({}/{}s)",
                remaining, i, SHUTDOWN_GRACE_SECS
            );
        }
    }

    warn!(
        "Forced shutdown with {} sessions still active",
        SessionGuard::active_count()
    );
}
