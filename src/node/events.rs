//! Node notifications
//!
//! Each node owns the send half ([`EventSink`]) of an unbounded channel; the
//! single consumer holds the [`EventStream`]. Values equal to the last one
//! sent are dropped so the consumer only sees changes.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

/// Asynchronous node notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEvent {
    PeerCountChanged(usize),
    LocalHeightChanged(u64),
    KnownHeightChanged(u64),
    ConnectivityChanged(bool),
}

#[derive(Debug, Default)]
struct LastSent {
    peer_count: Option<usize>,
    local_height: Option<u64>,
    known_height: Option<u64>,
    connected: Option<bool>,
}

impl LastSent {
    /// Record `event`, returning false when it repeats the previous value
    fn update(&mut self, event: NodeEvent) -> bool {
        fn swap<T: PartialEq>(slot: &mut Option<T>, value: T) -> bool {
            if slot.as_ref() == Some(&value) {
                false
            } else {
                *slot = Some(value);
                true
            }
        }

        match event {
            NodeEvent::PeerCountChanged(count) => swap(&mut self.peer_count, count),
            NodeEvent::LocalHeightChanged(height) => swap(&mut self.local_height, height),
            NodeEvent::KnownHeightChanged(height) => swap(&mut self.known_height, height),
            NodeEvent::ConnectivityChanged(connected) => swap(&mut self.connected, connected),
        }
    }
}

/// Send half of the notification channel
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<NodeEvent>,
    last: Arc<Mutex<LastSent>>,
}

/// Receive half of the notification channel
pub type EventStream = mpsc::UnboundedReceiver<NodeEvent>;

impl EventSink {
    /// Create a connected sink/stream pair
    pub fn channel() -> (EventSink, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            EventSink {
                tx,
                last: Arc::new(Mutex::new(LastSent::default())),
            },
            rx,
        )
    }

    /// Forward an event unless it repeats the previous value of its kind
    ///
    /// A dropped consumer is not an error for the node.
    pub fn emit(&self, event: NodeEvent) {
        // Held across the send so the channel order matches the history
        let mut last = self.last.lock();
        if !last.update(event) {
            return;
        }
        if self.tx.send(event).is_err() {
            trace!(?event, "Event consumer gone, dropping notification");
        }
    }

    /// Whether the consumer still listens
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplicate_values_suppressed() {
        let (sink, mut stream) = EventSink::channel();

        sink.emit(NodeEvent::PeerCountChanged(3));
        sink.emit(NodeEvent::PeerCountChanged(3));
        sink.emit(NodeEvent::LocalHeightChanged(3));
        sink.emit(NodeEvent::PeerCountChanged(4));

        assert_eq!(stream.recv().await, Some(NodeEvent::PeerCountChanged(3)));
        assert_eq!(stream.recv().await, Some(NodeEvent::LocalHeightChanged(3)));
        assert_eq!(stream.recv().await, Some(NodeEvent::PeerCountChanged(4)));
        assert!(stream.try_recv().is_err());
    }

    #[test]
    fn test_closed_consumer_is_harmless() {
        let (sink, stream) = EventSink::channel();
        drop(stream);
        assert!(sink.is_closed());
        sink.emit(NodeEvent::ConnectivityChanged(true));
    }

    #[test]
    fn test_concurrent_emitters_never_repeat() {
        let (sink, mut stream) = EventSink::channel();

        let emitters: Vec<_> = (0..4u64)
            .map(|offset| {
                let sink = sink.clone();
                std::thread::spawn(move || {
                    for i in 0..2_000u64 {
                        sink.emit(NodeEvent::LocalHeightChanged((i + offset) % 3));
                    }
                })
            })
            .collect();
        for emitter in emitters {
            emitter.join().unwrap();
        }

        let mut received = Vec::new();
        while let Ok(event) = stream.try_recv() {
            received.push(event);
        }
        assert!(received.windows(2).all(|pair| pair[0] != pair[1]));
        let last = sink.last.lock().local_height;
        assert_eq!(
            received.last(),
            last.map(NodeEvent::LocalHeightChanged).as_ref()
        );
    }

    #[tokio::test]
    async fn test_clones_share_history() {
        let (sink, mut stream) = EventSink::channel();
        let other = sink.clone();

        sink.emit(NodeEvent::KnownHeightChanged(10));
        other.emit(NodeEvent::KnownHeightChanged(10));

        assert_eq!(stream.recv().await, Some(NodeEvent::KnownHeightChanged(10)));
        assert!(stream.try_recv().is_err());
    }
}
