/// Command line / environment configuration
///
/// Parsed once at startup into an immutable `ProxyConfig`.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use hyper::Uri;

use crate::address::{split_worker, AddressValidator, Identity};
use crate::error::ConfigError;
use crate::nonce::{DEFAULT_PREFIX_BITS, MAX_PREFIX_BITS};

pub const MIN_LOG_INTERVAL_SECS: u64 = 60;
pub const MAX_LOG_INTERVAL_SECS: u64 = 3600;
pub const DEFAULT_LOG_INTERVAL_SECS: u64 = 60;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "getwork-proxy",
    version,
    about = "Getwork mining proxy - many miners behind one daemon identity",
    long_about = None
)]
pub struct Args {
    /// Address miners connect to (host:port)
    #[arg(long, env = "PROXY_LISTEN_ADDRESS", default_value = "0.0.0.0:10100")]
    pub listen_address: String,

    /// Daemon RPC address (host:port or http://host:port/json_rpc)
    #[arg(long, env = "PROXY_DAEMON_ADDRESS")]
    pub daemon_address: String,

    /// Wallet address, optionally suffixed with .workername
    #[arg(long, env = "PROXY_WALLET_ADDRESS")]
    pub wallet_address: Option<String>,

    /// Seconds between stats reports (60..=3600, anything else means 60)
    #[arg(long, env = "PROXY_LOG_INTERVAL", default_value_t = DEFAULT_LOG_INTERVAL_SECS)]
    pub log_interval: u64,

    /// Give every miner its own nonce range
    #[arg(long, env = "PROXY_NONCE")]
    pub nonce: bool,

    /// Pool mode: miners log in with their own wallets
    #[arg(long, env = "PROXY_POOL")]
    pub pool: bool,

    /// Width of the per-miner nonce prefix
    #[arg(long, env = "PROXY_NONCE_PREFIX_BITS", default_value_t = DEFAULT_PREFIX_BITS)]
    pub nonce_prefix_bits: u8,

    /// Daemon template poll interval
    #[arg(long, env = "PROXY_POLL_INTERVAL_MS", default_value_t = 500)]
    pub poll_interval_ms: u64,

    #[arg(long, env = "PROXY_HANDSHAKE_TIMEOUT_SECS", default_value_t = 10)]
    pub handshake_timeout_secs: u64,

    #[arg(long, env = "PROXY_IDLE_TIMEOUT_SECS", default_value_t = 300)]
    pub idle_timeout_secs: u64,

    #[arg(long, env = "PROXY_MAX_CONNECTIONS", default_value_t = 10_000)]
    pub max_connections: usize,

    /// Stats file rewritten every log interval (empty disables)
    #[arg(long, env = "PROXY_STATS_FILE", default_value = "stats.json")]
    pub stats_file: String,

    /// Log file mirrored alongside stdout (empty disables)
    #[arg(long, env = "PROXY_LOG_FILE", default_value = "proxy.log")]
    pub log_file: String,

    /// Optional HTTP listener for /health, /stats and /metrics
    #[arg(long, env = "PROXY_API_LISTEN")]
    pub api_listen: Option<String>,

    /// Accepted human-readable wallet prefixes
    #[arg(
        long,
        env = "PROXY_ADDRESS_PREFIXES",
        value_delimiter = ',',
        default_value = "dero,deto"
    )]
    pub address_prefixes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Every session mines under the configured identity
    Solo,
    /// Every session brings its own wallet
    Pool,
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    pub daemon_url: String,
    pub identity: Option<Identity>,
    pub mode: Mode,
    pub nonce_editing: bool,
    pub prefix_bits: u8,
    pub log_interval: Duration,
    pub poll_interval: Duration,
    pub handshake_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_connections: usize,
    pub stats_file: Option<PathBuf>,
    pub api_listen: Option<SocketAddr>,
}

impl ProxyConfig {
    pub fn from_args(args: &Args, validator: &dyn AddressValidator) -> Result<Self, ConfigError> {
        let mode = if args.pool { Mode::Pool } else { Mode::Solo };

        if !(1..=MAX_PREFIX_BITS).contains(&args.nonce_prefix_bits) {
            return Err(ConfigError::PrefixBits(args.nonce_prefix_bits));
        }
        if args.poll_interval_ms == 0 {
            return Err(ConfigError::Zero("poll interval"));
        }
        if args.handshake_timeout_secs == 0 {
            return Err(ConfigError::Zero("handshake timeout"));
        }
        if args.idle_timeout_secs == 0 {
            return Err(ConfigError::Zero("idle timeout"));
        }
        if args.max_connections == 0 {
            return Err(ConfigError::Zero("max connections"));
        }

        let identity = match args.wallet_address.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => match Identity::parse(raw, validator) {
                Ok(identity) => Some(identity),
                Err(e) if mode == Mode::Solo => {
                    let (wallet, _) = split_worker(raw);
                    return Err(ConfigError::Wallet(wallet.to_string(), e));
                }
                Err(e) => {
                    tracing::warn!("⚠️  Ignoring invalid wallet address '{}' in pool mode: {}", raw, e);
                    None
                }
            },
        };

        let api_listen = match args.api_listen.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(
                raw.parse::<SocketAddr>()
                    .map_err(|e| ConfigError::ApiAddress(raw.to_string(), e.to_string()))?,
            ),
        };

        Ok(Self {
            listen_addr: parse_listen_address(&args.listen_address)?,
            daemon_url: normalize_daemon_url(&args.daemon_address)?,
            identity,
            mode,
            nonce_editing: args.nonce,
            prefix_bits: args.nonce_prefix_bits,
            log_interval: clamp_log_interval(args.log_interval),
            poll_interval: Duration::from_millis(args.poll_interval_ms),
            handshake_timeout: Duration::from_secs(args.handshake_timeout_secs),
            idle_timeout: Duration::from_secs(args.idle_timeout_secs),
            max_connections: args.max_connections,
            stats_file: non_empty_path(&args.stats_file),
            api_listen,
        })
    }

    /// Config for an in-process proxy on an ephemeral loopback port.
    pub fn local(daemon_url: impl Into<String>) -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            daemon_url: daemon_url.into(),
            identity: None,
            mode: Mode::Solo,
            nonce_editing: false,
            prefix_bits: DEFAULT_PREFIX_BITS,
            log_interval: Duration::from_secs(DEFAULT_LOG_INTERVAL_SECS),
            poll_interval: Duration::from_millis(500),
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300),
            max_connections: 10_000,
            stats_file: None,
            api_listen: None,
        }
    }
}

/// Reporting interval in seconds; anything outside [60, 3600] falls back to 60.
pub fn clamp_log_interval(secs: u64) -> Duration {
    if (MIN_LOG_INTERVAL_SECS..=MAX_LOG_INTERVAL_SECS).contains(&secs) {
        Duration::from_secs(secs)
    } else {
        Duration::from_secs(DEFAULT_LOG_INTERVAL_SECS)
    }
}

pub fn non_empty_path(raw: &str) -> Option<PathBuf> {
    let raw = raw.trim();
    (!raw.is_empty()).then(|| PathBuf::from(raw))
}

/// Resolve `host:port` (or `:port`) to a bindable address with a non-zero port.
pub fn parse_listen_address(raw: &str) -> Result<SocketAddr, ConfigError> {
    let raw = raw.trim();
    let with_host = if raw.starts_with(':') {
        format!("0.0.0.0{}", raw)
    } else {
        raw.to_string()
    };

    let (_, port) = with_host
        .rsplit_once(':')
        .ok_or_else(|| ConfigError::MissingPort(raw.to_string()))?;
    match port.parse::<u16>() {
        Ok(0) => return Err(ConfigError::MissingPort(raw.to_string())),
        Ok(_) => {}
        Err(_) => return Err(ConfigError::MissingPort(raw.to_string())),
    }

    with_host
        .to_socket_addrs()
        .map_err(|e| ConfigError::ListenAddress(raw.to_string(), e.to_string()))?
        .next()
        .ok_or_else(|| ConfigError::ListenAddress(raw.to_string(), "no addresses".to_string()))
}

/// Turn `host:port` into `http://host:port/json_rpc`; keep explicit URLs.
pub fn normalize_daemon_url(raw: &str) -> Result<String, ConfigError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ConfigError::DaemonAddress(raw.to_string(), "empty".to_string()));
    }
    if raw.starts_with("https://") {
        return Err(ConfigError::DaemonAddress(
            raw.to_string(),
            "only plain http is supported".to_string(),
        ));
    }

    let mut url = if raw.starts_with("http://") {
        raw.to_string()
    } else {
        format!("http://{}", raw)
    };

    let uri = url
        .parse::<Uri>()
        .map_err(|e| ConfigError::DaemonAddress(raw.to_string(), e.to_string()))?;
    if uri.host().is_none() {
        return Err(ConfigError::DaemonAddress(raw.to_string(), "missing host".to_string()));
    }
    if uri.path() == "/" || uri.path().is_empty() {
        url = format!("{}/json_rpc", url.trim_end_matches('/'));
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Bech32AddressValidator;

    const WALLET: &str = "dero1qyw4fl3dupcg5qlrcsvcedze507q9u67lxfpu8kgnzp04aq73yheqqg2ctjn4";

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["getwork-proxy", "--daemon-address", "127.0.0.1:10102"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_log_interval_clamp() {
        assert_eq!(clamp_log_interval(59), Duration::from_secs(60));
        assert_eq!(clamp_log_interval(60), Duration::from_secs(60));
        assert_eq!(clamp_log_interval(600), Duration::from_secs(600));
        assert_eq!(clamp_log_interval(3600), Duration::from_secs(3600));
        assert_eq!(clamp_log_interval(3601), Duration::from_secs(60));
    }

    #[test]
    fn test_listen_address() {
        assert_eq!(parse_listen_address("127.0.0.1:10100").unwrap().port(), 10100);
        assert_eq!(parse_listen_address(":4444").unwrap().port(), 4444);
        assert!(matches!(parse_listen_address("127.0.0.1"), Err(ConfigError::MissingPort(_))));
        assert!(matches!(parse_listen_address("127.0.0.1:0"), Err(ConfigError::MissingPort(_))));
    }

    #[test]
    fn test_daemon_url() {
        assert_eq!(
            normalize_daemon_url("127.0.0.1:10102").unwrap(),
            "http://127.0.0.1:10102/json_rpc"
        );
        assert_eq!(
            normalize_daemon_url("http://node:10102/rpc").unwrap(),
            "http://node:10102/rpc"
        );
        assert!(normalize_daemon_url("https://node:443").is_err());
        assert!(normalize_daemon_url("").is_err());
    }

    #[test]
    fn test_defaults() {
        let validator = Bech32AddressValidator::default();
        let config = ProxyConfig::from_args(&args(&[]), &validator).unwrap();
        assert_eq!(config.mode, Mode::Solo);
        assert!(!config.nonce_editing);
        assert!(config.identity.is_none());
        assert_eq!(config.listen_addr.port(), 10100);
        assert_eq!(config.log_interval, Duration::from_secs(60));
        assert_eq!(config.stats_file, Some(PathBuf::from("stats.json")));
    }

    #[test]
    fn test_wallet_with_worker() {
        let validator = Bech32AddressValidator::default();
        let wallet = format!("{}.rig1", WALLET);
        let config = ProxyConfig::from_args(
            &args(&["--wallet-address", &wallet, "--nonce", "--log-interval", "10"]),
            &validator,
        )
        .unwrap();
        let identity = config.identity.unwrap();
        assert_eq!(identity.wallet, WALLET);
        assert_eq!(identity.worker.as_deref(), Some("rig1"));
        assert!(config.nonce_editing);
        assert_eq!(config.log_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_invalid_wallet_fatal_only_in_solo() {
        let validator = Bech32AddressValidator::default();
        let solo = ProxyConfig::from_args(&args(&["--wallet-address", "nonsense"]), &validator);
        assert!(matches!(solo, Err(ConfigError::Wallet(_, _))));

        let pool = ProxyConfig::from_args(&args(&["--wallet-address", "nonsense", "--pool"]), &validator)
            .unwrap();
        assert_eq!(pool.mode, Mode::Pool);
        assert!(pool.identity.is_none());
    }

    #[test]
    fn test_prefix_bits_bounds() {
        let validator = Bech32AddressValidator::default();
        let err = ProxyConfig::from_args(&args(&["--nonce-prefix-bits", "17"]), &validator);
        assert!(matches!(err, Err(ConfigError::PrefixBits(17))));

        // Wider prefixes would reach bits a nicehash miner is free to change.
        let err = ProxyConfig::from_args(&args(&["--nonce-prefix-bits", "9"]), &validator);
        assert!(matches!(err, Err(ConfigError::PrefixBits(9))));
        let ok = ProxyConfig::from_args(&args(&["--nonce-prefix-bits", "8"]), &validator).unwrap();
        assert_eq!(ok.prefix_bits, 8);
    }
}
