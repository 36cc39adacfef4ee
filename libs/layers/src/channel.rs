//! Channel from connection stacks to the controlling master.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

use crate::address::Address;
use crate::layer::LayerKind;

/// Default capacity of the event channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Events reported by connection stacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerEvent {
    /// A layer was pushed onto a connection's stack.
    Pushed {
        connection_id: u64,
        server: Address,
        kind: LayerKind,
        depth: usize,
    },
    /// The stack gave up waiting for enough bytes to pick a layer.
    Undecidable {
        connection_id: u64,
        server: Address,
        available: usize,
    },
}

/// Sending half shared by all layers of a connection.
#[derive(Debug, Clone)]
pub struct Channel {
    tx: Option<mpsc::Sender<LayerEvent>>,
}

impl Channel {
    /// Create a channel and its receiving half.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<LayerEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx: Some(tx) }, rx)
    }

    /// A channel with no master attached; every event is dropped.
    pub fn disconnected() -> Self {
        Self { tx: None }
    }

    /// Report an event without waiting.
    ///
    /// A full or closed channel drops the event. Connection handling never
    /// blocks on the master.
    pub fn tell(&self, event: LayerEvent) {
        let Some(tx) = &self.tx else {
            return;
        };

        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                debug!(?event, "Event channel full, dropping event");
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Event channel closed");
            }
        }
    }
}
