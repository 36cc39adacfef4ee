//! interpose
//!
//! Intercepting proxy front end.
//!
//! This service:
//! - Accepts TCP connections on the configured address
//! - Picks protocol layers per connection from sniffed bytes and host policy
//! - Relays every connection to the configured upstream
//! - Reloads the policy file on SIGHUP

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use interpose_layers::{Channel, DEFAULT_CHANNEL_CAPACITY};
use interpose_proxy::{
    build_policy, record_events, Config, Listener, ListenerConfig, SharedPolicy,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to INTERPOSE_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting interpose proxy");
    info!(
        listen_addr = %config.listen_addr,
        upstream = %config.upstream,
        ignore_patterns = config.ignore_hosts.len(),
        tcp_patterns = config.tcp_hosts.len(),
        policy_file = ?config.policy_file,
        "Configuration loaded"
    );

    let policy = Arc::new(SharedPolicy::new(build_policy(
        &config.ignore_hosts,
        &config.tcp_hosts,
        config.policy_file.as_deref(),
    )?));

    let (channel, events) = Channel::new(DEFAULT_CHANNEL_CAPACITY);

    let mut listener_config = ListenerConfig::new(config.listen_addr, config.upstream.clone());
    listener_config.max_connections = config.max_connections;
    listener_config.stack.sniff_timeout = config.sniff_timeout;
    listener_config.peek_timeout = config.peek_timeout;
    listener_config.connect_timeout = config.connect_timeout;
    listener_config.idle_timeout = config.idle_timeout;

    let listener = Arc::new(Listener::bind(listener_config, policy.clone(), channel).await?);

    tokio::spawn(record_events(events, listener.stats()));

    #[cfg(unix)]
    tokio::spawn(reload_on_hangup(config.clone(), Arc::clone(&policy)));

    if let Err(e) = listener.run().await {
        error!(error = %e, "Listener error");
        return Err(e.into());
    }
    Ok(())
}

/// Re-read the policy file and environment patterns on every SIGHUP.
#[cfg(unix)]
async fn reload_on_hangup(config: Config, policy: Arc<SharedPolicy>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            error!(error = %e, "Failed to install SIGHUP handler");
            return;
        }
    };

    while hangup.recv().await.is_some() {
        info!(policy_file = ?config.policy_file, "Reloading policy");
        match build_policy(
            &config.ignore_hosts,
            &config.tcp_hosts,
            config.policy_file.as_deref(),
        ) {
            Ok(reloaded) => policy.replace(reloaded),
            Err(e) => warn!(error = %format!("{e:#}"), "Policy reload failed, keeping current policy"),
        }
    }
}
