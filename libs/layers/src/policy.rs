//! Host policy predicates consulted by the dispatcher.

use crate::address::Address;
use crate::error::PolicyError;

/// Interception policy for server addresses.
///
/// Implementations are shared by every connection and must be safe to
/// call concurrently. They must not depend on per-connection state.
pub trait Policy: Send + Sync {
    /// Traffic to this server is relayed untouched, without any sniffing.
    fn should_ignore(&self, server: &Address) -> Result<bool, PolicyError>;

    /// Non-TLS traffic to this server is relayed as raw TCP.
    fn should_passthrough_tcp(&self, server: &Address) -> Result<bool, PolicyError>;
}

/// Policy that neither ignores nor passes through any host.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPolicy;

impl Policy for NoPolicy {
    fn should_ignore(&self, _server: &Address) -> Result<bool, PolicyError> {
        Ok(false)
    }

    fn should_passthrough_tcp(&self, _server: &Address) -> Result<bool, PolicyError> {
        Ok(false)
    }
}
