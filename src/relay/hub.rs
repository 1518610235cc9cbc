use crate::forward::SinkForwarder;
use crate::wire::{self, Frame};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Identifier assigned to a peer for the lifetime of its connection
pub type PeerId = u64;

/// One frame moving through the fan-out channel
#[derive(Debug, Clone)]
pub struct Broadcast {
    /// Peer the frame arrived from; delivery skips it
    pub origin: PeerId,
    /// Raw wire text, retransmitted byte for byte
    pub text: String,
}

/// A registered peer's view of the relay
pub struct PeerSession {
    pub id: PeerId,
    /// Live fan-out subscription
    pub frames: broadcast::Receiver<Broadcast>,
    /// Retained reading to deliver before any live frame
    pub catch_up: Option<String>,
}

/// Connection metadata kept per peer
struct PeerInfo {
    connected_at: DateTime<Utc>,
}

/// Relay hub maintains the peer registry, the retained reading, and the
/// fan-out channel every peer task subscribes to
pub struct RelayHub {
    /// Connected peers
    peers: DashMap<PeerId, PeerInfo>,

    /// Next peer id to hand out
    next_peer_id: AtomicU64,

    /// Most recent accepted frame; the lock also orders fan-out sends
    /// against peer registration
    latest: Mutex<Option<String>>,

    /// Broadcast channel for fan-out to peer tasks
    fan_out: broadcast::Sender<Broadcast>,

    /// Optional copy of every reading to the downstream sink
    forwarder: Option<SinkForwarder>,

    /// Hub start time for status reporting
    started_at: DateTime<Utc>,
}

impl RelayHub {
    /// Create a new hub. `fan_out_buffer` bounds how far a slow peer may
    /// fall behind before it starts skipping frames.
    pub fn new(fan_out_buffer: usize, forwarder: Option<SinkForwarder>) -> Self {
        let (fan_out, _) = broadcast::channel(fan_out_buffer);

        Self {
            peers: DashMap::new(),
            next_peer_id: AtomicU64::new(0),
            latest: Mutex::new(None),
            fan_out,
            forwarder,
            started_at: Utc::now(),
        }
    }

    /// Register a connecting peer.
    ///
    /// The retained-reading lock orders this against `ingest` so the caller
    /// sees each frame exactly once: in `catch_up` or live, never both.
    pub fn register(&self) -> PeerSession {
        let id = self.next_peer_id.fetch_add(1, Ordering::SeqCst);

        let latest = self.latest.lock().expect("lock poisoned");
        let frames = self.fan_out.subscribe();
        let catch_up = latest.clone();
        drop(latest);

        self.peers.insert(
            id,
            PeerInfo {
                connected_at: Utc::now(),
            },
        );
        info!(peer_id = id, peers = self.peers.len(), "Peer connected");

        PeerSession {
            id,
            frames,
            catch_up,
        }
    }

    /// Remove a peer from the registry.
    pub fn unregister(&self, id: PeerId) {
        if let Some((_, info)) = self.peers.remove(&id) {
            let connected_secs = (Utc::now() - info.connected_at).num_seconds();
            info!(
                peer_id = id,
                peers = self.peers.len(),
                connected_secs,
                "Peer disconnected"
            );
        }
    }

    /// Handle one inbound text frame from a peer.
    ///
    /// Malformed frames are logged and dropped; the peer stays connected.
    /// Accepted frames overwrite the retained reading and fan out to every
    /// other peer. Readings are additionally copied to the sink.
    pub fn ingest(&self, origin: PeerId, text: &str) {
        let frame = match wire::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(peer_id = origin, error = %e, "Dropping undecodable frame");
                return;
            }
        };

        match &frame {
            Frame::Emit(reading) => {
                if reading.is_alarm() {
                    warn!(peer_id = origin, symbol = ?reading.symbol, "Reading raised an alarm");
                }
                if let Some(forwarder) = &self.forwarder {
                    forwarder.dispatch(text.to_string());
                }
            }
            Frame::Subscribe { symbol } | Frame::Unsubscribe { symbol } => {
                debug!(
                    peer_id = origin,
                    kind = frame.kind(),
                    symbol = %symbol,
                    "Relaying control frame"
                );
            }
        }

        // Overwrite the retained reading and fan out under one lock so a
        // peer registering concurrently sees this frame exactly once
        let mut latest = self.latest.lock().expect("lock poisoned");
        *latest = Some(text.to_string());
        let _ = self.fan_out.send(Broadcast {
            origin,
            text: text.to_string(),
        });
    }

    /// Number of connected peers
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Retained reading, if any frame has been accepted yet
    pub fn latest(&self) -> Option<String> {
        self.latest.lock().expect("lock poisoned").clone()
    }

    /// True once any frame has been retained
    pub fn has_latest(&self) -> bool {
        self.latest.lock().expect("lock poisoned").is_some()
    }

    /// Seconds since the hub was created
    pub fn uptime_seconds(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_hub() -> RelayHub {
        RelayHub::new(16, None)
    }

    #[test]
    fn test_register_assigns_unique_ids() {
        let hub = make_hub();
        let first = hub.register();
        let second = hub.register();

        assert_ne!(first.id, second.id);
        assert_eq!(hub.peer_count(), 2);

        hub.unregister(first.id);
        assert_eq!(hub.peer_count(), 1);
    }

    #[test]
    fn test_first_peer_gets_no_catch_up() {
        let hub = make_hub();
        let session = hub.register();
        assert_eq!(session.catch_up, None);
        assert!(!hub.has_latest());
    }

    #[test]
    fn test_catch_up_is_latest_accepted_frame() {
        let hub = make_hub();
        let producer = hub.register();
        hub.ingest(producer.id, r#"{"type":"emit","temperature":20.0}"#);
        hub.ingest(producer.id, r#"{"type":"emit","temperature":21.5}"#);

        let late = hub.register();
        assert_eq!(
            late.catch_up.as_deref(),
            Some(r#"{"type":"emit","temperature":21.5}"#)
        );
    }

    #[test]
    fn test_fan_out_carries_origin_and_text() {
        let hub = make_hub();
        let producer = hub.register();
        let mut consumer = hub.register();

        hub.ingest(producer.id, r#"{"type":"emit","humidity":55.0}"#);

        let broadcast = consumer.frames.try_recv().unwrap();
        assert_eq!(broadcast.origin, producer.id);
        assert_eq!(broadcast.text, r#"{"type":"emit","humidity":55.0}"#);
    }

    #[test]
    fn test_malformed_frame_is_dropped() {
        let hub = make_hub();
        let producer = hub.register();
        let mut consumer = hub.register();

        hub.ingest(producer.id, "not json at all");
        hub.ingest(producer.id, r#"{"type":"mystery"}"#);
        assert!(!hub.has_latest());
        assert!(consumer.frames.try_recv().is_err());

        hub.ingest(producer.id, r#"{"type":"emit","ok":true}"#);
        assert_eq!(hub.latest().as_deref(), Some(r#"{"type":"emit","ok":true}"#));
        assert!(consumer.frames.try_recv().is_ok());
    }

    #[test]
    fn test_control_frames_are_retained_and_relayed() {
        let hub = make_hub();
        let producer = hub.register();
        let mut consumer = hub.register();

        hub.ingest(producer.id, r#"{"type":"subscribe","symbol":"env-1"}"#);

        assert_eq!(
            hub.latest().as_deref(),
            Some(r#"{"type":"subscribe","symbol":"env-1"}"#)
        );
        let broadcast = consumer.frames.try_recv().unwrap();
        assert_eq!(broadcast.text, r#"{"type":"subscribe","symbol":"env-1"}"#);
    }

    #[test]
    fn test_ingest_without_peers_still_retains() {
        let hub = make_hub();
        hub.ingest(99, r#"{"type":"emit","lonely":true}"#);
        assert!(hub.has_latest());
    }
}
