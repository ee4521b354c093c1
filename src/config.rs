use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use color_eyre::eyre::{eyre, Result};

use crate::auth::Auth;
use crate::quota::{limit_from_gbps, DEFAULT_QUOTA_WINDOW};

/// Command line interface configuration
#[derive(Parser, Debug)]
#[command(
    author, version,
    about = "Authenticating CONNECT gateway with per-user bandwidth quotas",
    long_about = "flash-auth-proxy terminates HTTP CONNECT tunnels, checks the client's \
Proxy-Authorization against bcrypt hashes in redis, enforces a per-user byte quota \
through redis counters, and relays the tunnel to a fixed downstream proxy using the \
gateway's own credential.\n\nRedis layout:\n- user:<name>  hash, field pwd = bcrypt hash\n\
- bw:<name>    byte counter, expires shortly after a quota violation\n"
)]
pub struct Cli {
    /// Public listen address
    #[arg(long, default_value = "0.0.0.0:443")]
    pub listen: SocketAddr,

    /// Downstream proxy address or hostname:port
    #[arg(long, default_value = "127.0.0.1:8443", value_name = "HOST:PORT")]
    pub backend: String,

    /// Redis host:port
    #[arg(long, default_value = "127.0.0.1:6379", value_name = "HOST:PORT")]
    pub redis: String,

    /// Redis AUTH password
    #[arg(long, env = "REDIS_PASS", hide_env_values = true)]
    pub redis_password: Option<String>,

    /// Redis DB number
    #[arg(long, default_value_t = 0)]
    pub redis_db: i64,

    /// Redis dial/command timeout in milliseconds
    #[arg(long, default_value_t = 500)]
    pub redis_timeout_ms: u64,

    /// Per-user bandwidth cap (Gb/s)
    #[arg(long, default_value_t = 1.0)]
    pub max_gbps: f64,

    /// How long a user's counter lives after a quota violation, in milliseconds
    #[arg(long, default_value_t = DEFAULT_QUOTA_WINDOW.as_millis() as u64)]
    pub quota_window_ms: u64,

    /// Credential presented to the downstream proxy (format: user:pass)
    #[arg(long, env = "DOWNSTREAM_AUTH", hide_env_values = true)]
    pub downstream_auth: String,

    /// Realm named in the 407 challenge
    #[arg(long, default_value = "FlashProxy")]
    pub realm: String,

    /// Seconds a client gets to complete the CONNECT handshake (0 disables)
    #[arg(long, default_value_t = 10)]
    pub handshake_timeout: u64,

    /// Seconds allowed for the downstream TCP connect (0 disables)
    #[arg(long, default_value_t = 5)]
    pub connect_timeout: u64,

    /// Interval seconds between status log lines
    #[arg(long, default_value_t = 300)]
    pub status_interval: u64,
}

/// Gateway configuration derived from CLI arguments
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub listen_addr: SocketAddr,
    pub backend_addr: SocketAddr,
    pub redis_addr: String,
    pub redis_password: Option<String>,
    pub redis_db: i64,
    pub redis_timeout: Duration,
    pub limit_bytes: u64,
    pub quota_window: Duration,
    pub downstream_auth: Auth,
    pub realm: String,
    pub handshake_timeout: Option<Duration>,
    pub connect_timeout: Duration,
    pub status_interval: Duration,
}

impl GatewayConfig {
    /// Validate CLI arguments and resolve the backend address
    pub async fn from_cli(args: Cli) -> Result<Self> {
        let backend_addr = match tokio::net::lookup_host(&args.backend).await {
            Ok(mut addrs) => match addrs.next() {
                Some(addr) => addr,
                None => return Err(eyre!("No addresses found for {}", args.backend)),
            },
            Err(e) => return Err(eyre!("Failed to resolve {}: {}", args.backend, e)),
        };

        Self::from_cli_with_backend(args, backend_addr)
    }

    fn from_cli_with_backend(args: Cli, backend_addr: SocketAddr) -> Result<Self> {
        if !args.max_gbps.is_finite() || args.max_gbps <= 0.0 {
            return Err(eyre!("--max-gbps must be a positive number"));
        }
        let limit_bytes = limit_from_gbps(args.max_gbps);
        if limit_bytes == 0 {
            return Err(eyre!("--max-gbps {} rounds to a zero-byte cap", args.max_gbps));
        }

        if args.quota_window_ms == 0 {
            return Err(eyre!("--quota-window-ms must be at least 1"));
        }

        let downstream_auth = Auth::parse(&args.downstream_auth)
            .ok_or_else(|| eyre!("Invalid --downstream-auth, expected user:pass"))?;

        if args.realm.contains('"') || args.realm.contains('\r') || args.realm.contains('\n') {
            return Err(eyre!("--realm may not contain quotes or line breaks"));
        }

        let handshake_timeout =
            (args.handshake_timeout > 0).then(|| Duration::from_secs(args.handshake_timeout));

        Ok(Self {
            listen_addr: args.listen,
            backend_addr,
            redis_addr: args.redis,
            redis_password: args.redis_password.filter(|p| !p.is_empty()),
            redis_db: args.redis_db,
            redis_timeout: Duration::from_millis(args.redis_timeout_ms.max(1)),
            limit_bytes,
            quota_window: Duration::from_millis(args.quota_window_ms),
            downstream_auth,
            realm: args.realm,
            handshake_timeout,
            connect_timeout: Duration::from_secs(args.connect_timeout),
            status_interval: Duration::from_secs(args.status_interval.max(1)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Cli {
        let mut argv = vec!["flash-auth-proxy", "--downstream-auth", "gw:secret"];
        argv.extend_from_slice(extra);
        Cli::try_parse_from(argv).expect("arguments should parse")
    }

    fn backend() -> SocketAddr {
        "127.0.0.1:8443".parse().unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::from_cli_with_backend(parse(&[]), backend()).unwrap();

        assert_eq!(config.listen_addr, "0.0.0.0:443".parse().unwrap());
        assert_eq!(config.redis_addr, "127.0.0.1:6379");
        assert_eq!(config.limit_bytes, 125_000_000);
        assert_eq!(config.quota_window, Duration::from_secs(1));
        assert_eq!(config.realm, "FlashProxy");
        assert_eq!(config.handshake_timeout, Some(Duration::from_secs(10)));
        assert_eq!(config.downstream_auth, Auth::new("gw".into(), "secret".into()));
    }

    #[test]
    fn test_fractional_rate() {
        let config =
            GatewayConfig::from_cli_with_backend(parse(&["--max-gbps", "0.001"]), backend())
                .unwrap();
        assert_eq!(config.limit_bytes, 125_000);
    }

    #[test]
    fn test_handshake_timeout_can_be_disabled() {
        let config =
            GatewayConfig::from_cli_with_backend(parse(&["--handshake-timeout", "0"]), backend())
                .unwrap();
        assert!(config.handshake_timeout.is_none());
    }

    #[test]
    fn test_rejects_bad_values() {
        for extra in [
            &["--max-gbps", "0"][..],
            &["--max-gbps=-1"][..],
            &["--quota-window-ms", "0"][..],
            &["--realm", "a\"b"][..],
        ] {
            assert!(
                GatewayConfig::from_cli_with_backend(parse(extra), backend()).is_err(),
                "{extra:?} should be rejected"
            );
        }

        let mut args = parse(&[]);
        args.downstream_auth = "missing-colon".into();
        assert!(GatewayConfig::from_cli_with_backend(args, backend()).is_err());
    }

    #[test]
    fn test_downstream_auth_is_required() {
        // Only meaningful when the variable is not set in the test environment
        if std::env::var_os("DOWNSTREAM_AUTH").is_none() {
            assert!(Cli::try_parse_from(["flash-auth-proxy"]).is_err());
        }
    }
}
