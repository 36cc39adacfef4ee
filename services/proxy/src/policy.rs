//! Host-pattern interception policy.
//!
//! Patterns are regular expressions searched (unanchored, case-insensitive)
//! in the `host:port` form of the server address, e.g. `^internal\.example:443$`
//! or just `example\.com`.
//!
//! Patterns come from the environment and, optionally, a TOML policy file:
//!
//! ```toml
//! ignore_hosts = ['^internal\.example:443$']
//! tcp_hosts = ['^db\.example:5432$']
//! ```
//!
//! The file can be reloaded at runtime; connections see either the old or
//! the new pattern set, never a mix.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use regex::{RegexSet, RegexSetBuilder};
use serde::Deserialize;
use tracing::info;

use interpose_layers::{Address, Policy, PolicyError};

/// Compiled ignore and TCP passthrough patterns.
#[derive(Debug, Clone)]
pub struct HostPolicy {
    ignore: RegexSet,
    tcp: RegexSet,
}

impl HostPolicy {
    /// Compile a policy from pattern lists.
    pub fn new<I, T>(ignore_hosts: I, tcp_hosts: T) -> Result<Self, PolicyError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
        T: IntoIterator,
        T::Item: AsRef<str>,
    {
        Ok(Self {
            ignore: compile(ignore_hosts)?,
            tcp: compile(tcp_hosts)?,
        })
    }

    /// A policy that matches no host.
    pub fn empty() -> Self {
        Self {
            ignore: RegexSet::empty(),
            tcp: RegexSet::empty(),
        }
    }

    pub fn ignore_pattern_count(&self) -> usize {
        self.ignore.len()
    }

    pub fn tcp_pattern_count(&self) -> usize {
        self.tcp.len()
    }
}

fn compile<I>(patterns: I) -> Result<RegexSet, PolicyError>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let patterns: Vec<String> = patterns
        .into_iter()
        .map(|p| p.as_ref().to_string())
        .collect();

    // Compile one by one first so the error names the offending pattern.
    for pattern in &patterns {
        RegexSetBuilder::new([pattern])
            .case_insensitive(true)
            .build()
            .map_err(|e| PolicyError::InvalidPattern {
                pattern: pattern.clone(),
                message: e.to_string(),
            })?;
    }

    RegexSetBuilder::new(&patterns)
        .case_insensitive(true)
        .build()
        .map_err(|e| PolicyError::InvalidPattern {
            pattern: patterns.join(" "),
            message: e.to_string(),
        })
}

impl Policy for HostPolicy {
    fn should_ignore(&self, server: &Address) -> Result<bool, PolicyError> {
        Ok(self.ignore.is_match(&server.to_string()))
    }

    fn should_passthrough_tcp(&self, server: &Address) -> Result<bool, PolicyError> {
        Ok(self.tcp.is_match(&server.to_string()))
    }
}

/// Pattern lists as written in a policy file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyFile {
    #[serde(default)]
    pub ignore_hosts: Vec<String>,
    #[serde(default)]
    pub tcp_hosts: Vec<String>,
}

impl PolicyFile {
    /// Read and parse a TOML policy file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read policy file {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("Failed to parse policy file {}", path.display()))
    }
}

/// Policy shared by all connections, swappable at runtime.
#[derive(Debug)]
pub struct SharedPolicy {
    current: ArcSwap<HostPolicy>,
}

impl SharedPolicy {
    pub fn new(policy: HostPolicy) -> Self {
        Self {
            current: ArcSwap::from_pointee(policy),
        }
    }

    /// Atomically replace the pattern set.
    pub fn replace(&self, policy: HostPolicy) {
        info!(
            ignore_patterns = policy.ignore_pattern_count(),
            tcp_patterns = policy.tcp_pattern_count(),
            "Policy replaced"
        );
        self.current.store(Arc::new(policy));
    }

    /// The current pattern set.
    pub fn snapshot(&self) -> Arc<HostPolicy> {
        self.current.load_full()
    }
}

impl Policy for SharedPolicy {
    fn should_ignore(&self, server: &Address) -> Result<bool, PolicyError> {
        self.current.load().should_ignore(server)
    }

    fn should_passthrough_tcp(&self, server: &Address) -> Result<bool, PolicyError> {
        self.current.load().should_passthrough_tcp(server)
    }
}

/// Build the policy from environment patterns plus an optional file.
pub fn build_policy(
    ignore_hosts: &[String],
    tcp_hosts: &[String],
    policy_file: Option<&Path>,
) -> Result<HostPolicy> {
    let file = match policy_file {
        Some(path) => PolicyFile::load(path)?,
        None => PolicyFile::default(),
    };

    let policy = HostPolicy::new(
        ignore_hosts.iter().chain(&file.ignore_hosts),
        tcp_hosts.iter().chain(&file.tcp_hosts),
    )?;
    Ok(policy)
}
