//! # interpose-layers
//!
//! Protocol-layer dispatch for the interpose intercepting proxy.
//!
//! Every accepted connection is processed by a stack of protocol layers
//! that is built lazily: the root placeholder asks the [`RootContext`] which
//! layer comes first, that layer runs, and when it is ready to hand off it
//! asks again with itself as the current top. A single connection can
//! therefore pass through `Tls -> Http2`, or end in a raw TCP relay.
//!
//! ## Decision order
//!
//! ```text
//! 1. ignored host            -> RawTcp     (no bytes peeked)
//! 2. TLS ClientHello header  -> Tls (client + server interception)
//! 3. TCP passthrough host    -> RawTcp
//! 4. ALPN of the TLS top     -> Http2 / Http1
//! 5. default                 -> Http1 (transparent)
//! ```
//!
//! The order is security relevant. Swapping 2 and 3 would let a host
//! marked for passthrough evade TLS interception.
//!
//! ## Collaborators
//!
//! The byte-level TLS handshake, HTTP framing and the raw relay are not
//! part of this crate. They plug in through [`PeekSource`] (non-consuming
//! reads of the client stream), [`Policy`] (host predicates) and
//! [`LayerDriver`] (running one layer until it hands off or owns the
//! connection).

mod address;
mod alpn;
mod channel;
mod dispatcher;
mod error;
mod layer;
mod peek;
mod policy;
mod sniff;
mod stack;

pub use address::Address;
pub use alpn::{select_http_layer, ALPN_HTTP1, ALPN_HTTP2};
pub use channel::{Channel, LayerEvent, DEFAULT_CHANNEL_CAPACITY};
pub use dispatcher::{Dispatch, RootContext};
pub use error::{AddressError, DispatchError, PolicyError, StackError};
pub use layer::{ConnectionContext, HttpMode, Layer, LayerKind, TlsLayer};
pub use peek::PeekSource;
pub use policy::{NoPolicy, Policy};
pub use sniff::{classify_tls, client_hello_sni, SniResult, TlsSniff, TLS_SNIFF_LEN};
pub use stack::{Handoff, LayerDriver, LayerStack, StackConfig};
