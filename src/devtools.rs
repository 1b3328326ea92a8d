//! Devtools event bus: a bounded, multi-producer/single-consumer channel of
//! connection lifecycle events (spec §5, §9 "Global state").
//!
//! The only process-wide shared state in the design. Constructed once at
//! startup and cloned into every plugin factory, mirroring the teacher's
//! preference for sharing state via a cloneable handle
//! (`Arc<Mutex<HashMap<..>>>` in `Client`) rather than a singleton.

use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};

/// One notable event a connection handler may want to surface to an
/// attached devtools dashboard.
#[derive(Clone, Debug)]
pub enum DevtoolsEvent {
    ConnectionOpened { peer: String },
    RequestReceived { peer: String, method: String, path: String },
    ConnectionClosed { peer: String, bytes_relayed: u64 },
}

/// Producer handle. Cheap to clone; every worker thread/process gets one.
#[derive(Clone)]
pub struct DevtoolsSender {
    tx: SyncSender<DevtoolsEvent>,
}

impl DevtoolsSender {
    /// Drops the event rather than blocking when the queue is full — a
    /// slow or absent dashboard consumer must never back-pressure the
    /// proxy's own I/O loop.
    pub fn publish(&self, event: DevtoolsEvent) {
        match self.tx.try_send(event) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(_)) => {
                log::warn!("devtools event bus full, dropping event");
            }
        }
    }
}

/// Single-consumer handle, held by the code driving the devtools WebSocket
/// route (see `plugins::web`).
pub struct DevtoolsReceiver {
    rx: Receiver<DevtoolsEvent>,
}

impl DevtoolsReceiver {
    pub fn try_recv(&self) -> Option<DevtoolsEvent> {
        self.rx.try_recv().ok()
    }
}

/// Builds a bounded devtools event bus with room for `capacity` buffered
/// events.
pub fn channel(capacity: usize) -> (DevtoolsSender, DevtoolsReceiver) {
    let (tx, rx) = sync_channel(capacity.max(1));
    (DevtoolsSender { tx }, DevtoolsReceiver { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_published_are_received_in_order() {
        let (tx, rx) = channel(4);
        tx.publish(DevtoolsEvent::ConnectionOpened { peer: "1.2.3.4:9".into() });
        tx.publish(DevtoolsEvent::ConnectionClosed { peer: "1.2.3.4:9".into(), bytes_relayed: 10 });

        assert!(matches!(rx.try_recv(), Some(DevtoolsEvent::ConnectionOpened { .. })));
        assert!(matches!(rx.try_recv(), Some(DevtoolsEvent::ConnectionClosed { .. })));
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn full_queue_drops_events_without_blocking() {
        let (tx, rx) = channel(1);
        tx.publish(DevtoolsEvent::ConnectionOpened { peer: "a".into() });
        tx.publish(DevtoolsEvent::ConnectionOpened { peer: "b".into() });
        assert!(rx.try_recv().is_some());
    }
}
