//! Connection handling for the intercepting proxy.
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> LayerStack -> RelayDriver -> Upstream
//!                          |               |
//!                   Policy + sniff    BufferedStream (peeked bytes replayed)
//!                          |
//!                   Channel -> event consumer -> ListenerStats
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let (channel, events) = Channel::new(DEFAULT_CHANNEL_CAPACITY);
//! let config = ListenerConfig::new("127.0.0.1:8080".parse()?, "example.com:443".parse()?);
//! let listener = Arc::new(Listener::bind(config, policy, channel).await?);
//! tokio::spawn(record_events(events, listener.stats()));
//! listener.run().await?;
//! ```

mod buffered;
mod events;
mod listener;
mod relay;

pub use buffered::{BufferedStream, DEFAULT_MAX_PEEK_BYTES, DEFAULT_PEEK_TIMEOUT};
pub use events::{record, record_events};
pub use listener::{
    Listener, ListenerConfig, ListenerStats, DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_CONNECTIONS,
};
pub use relay::{relay, Relayed, RelayDriver};
