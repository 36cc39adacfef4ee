//! interpose proxy service
//!
//! Accepts client connections, decides per connection which protocol layers
//! to stack (raw TCP, TLS, HTTP/1, HTTP/2) and relays the bytes to a fixed
//! upstream.

pub mod config;
pub mod policy;
pub mod proxy;

pub use config::Config;
pub use policy::{build_policy, HostPolicy, PolicyFile, SharedPolicy};
pub use proxy::{
    record_events, BufferedStream, Listener, ListenerConfig, ListenerStats, RelayDriver,
    Relayed,
};
