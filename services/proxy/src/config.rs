//! Proxy configuration (env-driven).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use interpose_layers::Address;

/// Proxy configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to accept client connections on.
    pub listen_addr: SocketAddr,

    /// Server every accepted connection is destined for.
    pub upstream: Address,

    /// Patterns of hosts relayed untouched (whitespace separated).
    pub ignore_hosts: Vec<String>,

    /// Patterns of hosts whose non-TLS traffic is relayed as raw TCP.
    pub tcp_hosts: Vec<String>,

    /// Optional TOML file with more patterns, re-read on SIGHUP.
    pub policy_file: Option<PathBuf>,

    /// Total time to wait for enough bytes to choose a layer.
    pub sniff_timeout: Duration,

    /// Time a single peek waits for more client bytes.
    pub peek_timeout: Duration,

    /// Maximum concurrent connections.
    pub max_connections: usize,

    /// Idle timeout for relayed connections.
    pub idle_timeout: Option<Duration>,

    /// Timeout for connecting to the upstream.
    pub connect_timeout: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen_addr: SocketAddr = lookup("INTERPOSE_LISTEN_ADDR")
            .unwrap_or_else(|| "127.0.0.1:8080".to_string())
            .parse()
            .context("INTERPOSE_LISTEN_ADDR must be a socket address (example: 0.0.0.0:8080).")?;

        let upstream: Address = lookup("INTERPOSE_UPSTREAM")
            .context("Missing upstream. Set INTERPOSE_UPSTREAM (example: example.com:443).")?
            .parse()
            .context("INTERPOSE_UPSTREAM must be host:port.")?;

        let ignore_hosts = split_patterns(lookup("INTERPOSE_IGNORE_HOSTS"));
        let tcp_hosts = split_patterns(lookup("INTERPOSE_TCP_HOSTS"));

        let policy_file = lookup("INTERPOSE_POLICY_FILE").map(PathBuf::from);

        let sniff_timeout_ms: u64 = parse_number(&lookup, "INTERPOSE_SNIFF_TIMEOUT_MS")?
            .unwrap_or(5000);
        let peek_timeout_ms: u64 = parse_number(&lookup, "INTERPOSE_PEEK_TIMEOUT_MS")?
            .unwrap_or(200);
        let connect_timeout_ms: u64 = parse_number(&lookup, "INTERPOSE_CONNECT_TIMEOUT_MS")?
            .unwrap_or(10_000);

        let max_connections = parse_number::<usize, _>(&lookup, "INTERPOSE_MAX_CONNECTIONS")?
            .unwrap_or(10_000)
            .max(1);

        let idle_timeout = parse_number::<u64, _>(&lookup, "INTERPOSE_IDLE_TIMEOUT_MS")?
            .map(Duration::from_millis);

        let log_level = lookup("INTERPOSE_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            listen_addr,
            upstream,
            ignore_hosts,
            tcp_hosts,
            policy_file,
            sniff_timeout: Duration::from_millis(sniff_timeout_ms.max(1)),
            peek_timeout: Duration::from_millis(peek_timeout_ms.max(1)),
            max_connections,
            idle_timeout,
            connect_timeout: Duration::from_millis(connect_timeout_ms.max(1)),
            log_level,
        })
    }
}

fn split_patterns(value: Option<String>) -> Vec<String> {
    value
        .map(|v| v.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

fn parse_number<N, F>(lookup: &F, key: &str) -> Result<Option<N>>
where
    N: std::str::FromStr,
    N::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().parse::<N>())
        .transpose()
        .with_context(|| format!("{key} must be a non-negative integer."))
}
