//! Server address used as the policy lookup key.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use crate::error::AddressError;

/// The logical upstream server a client intends to reach.
///
/// Immutable once resolved for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    host: String,
    port: u16,
}

impl Address {
    /// Create an address from a host and a port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// The host part (hostname or IP literal, without brackets).
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Parse `host:port`, accepting bracketed IPv6 literals (`[::1]:443`).
    pub fn parse(s: &str) -> Result<Self, AddressError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(AddressError::Empty);
        }

        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let Some((host, tail)) = rest.split_once(']') else {
                return Err(AddressError::InvalidHost(s.to_string()));
            };
            let Some(port) = tail.strip_prefix(':') else {
                return Err(AddressError::MissingPort(s.to_string()));
            };
            (host, port)
        } else {
            let Some((host, port)) = s.rsplit_once(':') else {
                return Err(AddressError::MissingPort(s.to_string()));
            };
            if host.contains(':') {
                // Unbracketed IPv6 literal
                return Err(AddressError::InvalidHost(s.to_string()));
            }
            (host, port)
        };

        if host.is_empty() {
            return Err(AddressError::InvalidHost(s.to_string()));
        }

        let port: u16 = port
            .parse()
            .map_err(|_| AddressError::InvalidPort(s.to_string()))?;

        Ok(Self::new(host, port))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}
