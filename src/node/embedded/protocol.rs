//! Regtest protocol handler
//!
//! Tracks the best height announced by peers and relays new local blocks
//! through the peer server.

use super::{BlockchainEngine, PeerServer, ProtocolHandler};
use crate::node::events::{EventSink, NodeEvent};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

pub struct RegtestProtocol {
    engine: Arc<dyn BlockchainEngine>,
    peer_server: RwLock<Option<Weak<dyn PeerServer>>>,
    observed_height: AtomicU64,
    observer: Mutex<Option<EventSink>>,
}

impl RegtestProtocol {
    pub fn new(engine: Arc<dyn BlockchainEngine>) -> Self {
        Self {
            engine,
            peer_server: RwLock::new(None),
            observed_height: AtomicU64::new(0),
            observer: Mutex::new(None),
        }
    }

    fn peer_server(&self) -> Option<Arc<dyn PeerServer>> {
        self.peer_server.read().as_ref().and_then(Weak::upgrade)
    }

    fn notify(&self, event: NodeEvent) {
        if let Some(observer) = self.observer.lock().as_ref() {
            observer.emit(event);
        }
    }
}

impl ProtocolHandler for RegtestProtocol {
    fn set_peer_server(&self, server: Weak<dyn PeerServer>) {
        *self.peer_server.write() = Some(server);
    }

    fn subscribe(&self, events: EventSink) {
        *self.observer.lock() = Some(events);
    }

    fn unsubscribe(&self) {
        *self.observer.lock() = None;
    }

    fn local_height(&self) -> u64 {
        self.engine.top_height()
    }

    fn known_height(&self) -> u64 {
        self.observed_height
            .load(Ordering::SeqCst)
            .max(self.engine.top_height())
    }

    fn on_peer_height(&self, height: u64) {
        let previous = self.observed_height.fetch_max(height, Ordering::SeqCst);
        if height > previous {
            debug!(height, "Peer announced a higher chain");
            self.notify(NodeEvent::KnownHeightChanged(self.known_height()));
        }
    }

    fn on_peer_count_changed(&self, count: usize) {
        self.notify(NodeEvent::PeerCountChanged(count));
    }

    fn relay_block(&self, height: u64) {
        self.notify(NodeEvent::KnownHeightChanged(self.known_height()));
        if let Some(server) = self.peer_server() {
            server.broadcast_height(height);
        }
    }
}
