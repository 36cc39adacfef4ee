//! Consumer of layer events reported by connection stacks.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use interpose_layers::{LayerEvent, LayerKind};

use super::listener::ListenerStats;

/// Fold one event into the listener statistics.
pub fn record(stats: &ListenerStats, event: &LayerEvent) {
    match event {
        LayerEvent::Pushed { kind, .. } => {
            let counter = match kind {
                LayerKind::Tls(_) => &stats.layers_tls,
                LayerKind::RawTcp => &stats.layers_raw_tcp,
                LayerKind::Http1(_) => &stats.layers_http1,
                LayerKind::Http2(_) => &stats.layers_http2,
                LayerKind::Root => return,
            };
            counter.fetch_add(1, Ordering::Relaxed);
        }
        LayerEvent::Undecidable { .. } => {
            stats.undecidable.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Drain `events` until every sender is gone.
pub async fn record_events(mut events: mpsc::Receiver<LayerEvent>, stats: Arc<ListenerStats>) {
    while let Some(event) = events.recv().await {
        record(&stats, &event);

        if let LayerEvent::Pushed {
            connection_id,
            server,
            kind,
            depth: 1,
        } = &event
        {
            info!(connection_id, server = %server, layer = %kind, "Connection classified");
        }
    }
    debug!("Event channel closed");
}
