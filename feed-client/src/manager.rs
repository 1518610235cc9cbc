//! Relay connection manager.
//!
//! Keeps one WebSocket connection to the relay alive for the whole process,
//! reconnecting on a fixed delay until told to disconnect. Incoming frames
//! are decoded once and dispatched to registered listeners; a failing
//! listener is contained so it cannot starve the rest.

use crate::config::ClientConfig;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use pulse::wire::{self, Frame};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection lifecycle as observed by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Errored,
}

/// Handle for a registered listener. Dispatch order follows handle order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&Frame) + Send + Sync>;

/// Why a live connection ended.
enum SessionEnd {
    /// disconnect() was called
    Shutdown,
    /// The relay closed the socket
    Closed,
    /// The transport failed
    Failed,
}

/// Running session task plus its shutdown signal.
struct Session {
    handle: JoinHandle<()>,
    shutdown: Arc<Notify>,
}

/// State shared between the manager and its session task.
struct Inner {
    config: ClientConfig,

    /// Last observed connection state
    state: Mutex<ConnectionState>,

    /// Registered frame listeners
    listeners: DashMap<ListenerId, Listener>,

    /// Next listener handle to hand out
    next_listener_id: AtomicU64,

    /// Refcounted symbol interest, replayed after every reconnect
    subscriptions: Mutex<HashMap<String, usize>>,

    /// Write queue into the live transport; None while not connected
    control_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

/// Owns the process's relay connection.
///
/// # Responsibilities
/// - Hold at most one transport at a time (`connect` is idempotent)
/// - Reconnect on a fixed delay until `disconnect` is called
/// - Decode each frame once and dispatch to listeners in handle order
/// - Track symbol interest and replay it after every reconnect
pub struct ConnectionManager {
    inner: Arc<Inner>,

    /// Current session task, if any
    session: Mutex<Option<Session>>,
}

impl ConnectionManager {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(ConnectionState::Disconnected),
                listeners: DashMap::new(),
                next_listener_id: AtomicU64::new(0),
                subscriptions: Mutex::new(HashMap::new()),
                control_tx: Mutex::new(None),
            }),
            session: Mutex::new(None),
        }
    }

    /// Open the relay connection. A second call while a session is live is
    /// ignored, so the process never holds more than one transport.
    pub fn connect(&self) {
        let mut slot = self.session.lock().expect("lock poisoned");
        if let Some(session) = slot.as_ref() {
            if !session.handle.is_finished() {
                debug!("connect() ignored, session already running");
                return;
            }
        }

        info!(url = %self.inner.config.relay_url, "Opening relay connection");
        self.inner.set_state(ConnectionState::Connecting);

        let shutdown = Arc::new(Notify::new());
        let inner = Arc::clone(&self.inner);
        let signal = Arc::clone(&shutdown);
        let handle = tokio::spawn(async move {
            inner.run_session(signal).await;
        });

        *slot = Some(Session { handle, shutdown });
    }

    /// Ask the current session to stop, cancelling any pending reconnect.
    /// Safe to call when already disconnected.
    pub fn disconnect(&self) {
        let slot = self.session.lock().expect("lock poisoned");
        match slot.as_ref() {
            Some(session) if !session.handle.is_finished() => {
                info!("Disconnect requested");
                session.shutdown.notify_one();
            }
            _ => {
                debug!("disconnect() ignored, no active session");
            }
        }
    }

    /// Connection state as last observed by the session task.
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Register a listener invoked for every decoded frame. Returns the
    /// handle that removes it again.
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Frame) + Send + Sync + 'static,
    {
        let id = ListenerId(self.inner.next_listener_id.fetch_add(1, Ordering::SeqCst));
        self.inner.listeners.insert(id, Arc::new(listener));
        debug!(
            listener_id = id.0,
            listeners = self.inner.listeners.len(),
            "Listener added"
        );
        id
    }

    /// Remove a listener. Unknown handles are ignored; a listener removed
    /// while a dispatch pass is running is skipped by that pass.
    pub fn remove_listener(&self, id: ListenerId) {
        if self.inner.listeners.remove(&id).is_some() {
            debug!(
                listener_id = id.0,
                listeners = self.inner.listeners.len(),
                "Listener removed"
            );
        }
    }

    /// Register interest in a symbol. The subscribe frame is sent on every
    /// call; the refcount keeps the symbol alive for replay after reconnects.
    pub fn subscribe_symbol(&self, symbol: &str) {
        {
            let mut subscriptions = self.inner.subscriptions.lock().expect("lock poisoned");
            *subscriptions.entry(symbol.to_string()).or_insert(0) += 1;
        }
        let frame = Frame::Subscribe {
            symbol: symbol.to_string(),
        };
        self.inner.queue_control(wire::encode(&frame));
    }

    /// Drop one registration of interest in a symbol. The unsubscribe frame
    /// is sent on every call, mirroring the relay's advisory contract.
    pub fn unsubscribe_symbol(&self, symbol: &str) {
        self.release_symbol(symbol);
        let frame = Frame::Unsubscribe {
            symbol: symbol.to_string(),
        };
        self.inner.queue_control(wire::encode(&frame));
    }

    /// Drop one registration of interest without emitting a control frame.
    /// Used by observers detaching while the transport is down.
    pub(crate) fn release_symbol(&self, symbol: &str) {
        let mut subscriptions = self.inner.subscriptions.lock().expect("lock poisoned");
        if let Some(count) = subscriptions.get_mut(symbol) {
            *count -= 1;
            if *count == 0 {
                subscriptions.remove(symbol);
            }
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        // Best effort: the session task holds no handle back to the manager,
        // so aborting here cannot leak a reconnect loop
        if let Ok(slot) = self.session.get_mut() {
            if let Some(session) = slot.take() {
                session.handle.abort();
            }
        }
    }
}

impl Inner {
    fn state(&self) -> ConnectionState {
        *self.state.lock().expect("lock poisoned")
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock().expect("lock poisoned");
        if *state != next {
            debug!(from = ?*state, to = ?next, "Connection state changed");
            *state = next;
        }
    }

    /// Connect, pump, retry. Runs until disconnect() fires or the task is
    /// aborted; each pass through the loop is one connection attempt.
    async fn run_session(self: Arc<Self>, shutdown: Arc<Notify>) {
        loop {
            self.set_state(ConnectionState::Connecting);
            info!(url = %self.config.relay_url, "Connecting to relay");

            let attempt = tokio::select! {
                result = connect_async(self.config.relay_url.as_str()) => result,
                _ = shutdown.notified() => {
                    info!("Disconnect requested while connecting");
                    self.set_state(ConnectionState::Disconnected);
                    return;
                }
            };

            match attempt {
                Ok((stream, _)) => {
                    let end = self.drive_connection(stream, &shutdown).await;
                    self.clear_control_channel();
                    match end {
                        SessionEnd::Shutdown => {
                            self.set_state(ConnectionState::Disconnected);
                            info!("Disconnected from relay");
                            return;
                        }
                        SessionEnd::Closed => {
                            self.set_state(ConnectionState::Disconnected);
                            warn!("Relay closed the connection");
                        }
                        SessionEnd::Failed => {
                            // Surface the error, then settle on disconnected
                            // for the retry wait
                            self.set_state(ConnectionState::Errored);
                            self.set_state(ConnectionState::Disconnected);
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "Failed to connect to relay");
                    self.set_state(ConnectionState::Errored);
                }
            }

            // Fixed-delay retry, cancellable by disconnect()
            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                _ = shutdown.notified() => {
                    info!("Disconnect requested, stopping reconnect attempts");
                    self.set_state(ConnectionState::Disconnected);
                    return;
                }
            }
        }
    }

    /// Pump one live connection until it ends.
    async fn drive_connection(&self, stream: WsStream, shutdown: &Notify) -> SessionEnd {
        let (mut write, mut read) = stream.split();

        let (control_tx, mut control_rx) = mpsc::unbounded_channel::<String>();
        self.install_control_channel(control_tx);
        self.set_state(ConnectionState::Connected);
        info!("Connected to relay");

        self.replay_subscriptions();

        loop {
            tokio::select! {
                // Frames from the relay
                message = read.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_text(text.as_str());
                        }
                        Some(Ok(Message::Close(_))) => {
                            return SessionEnd::Closed;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = write.send(Message::Pong(data)).await {
                                warn!(error = %e, "Failed to send pong");
                                return SessionEnd::Failed;
                            }
                        }
                        Some(Ok(_)) => {
                            // Ignore binary, pong messages
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "Relay socket error");
                            return SessionEnd::Failed;
                        }
                        None => {
                            return SessionEnd::Closed;
                        }
                    }
                }

                // Outbound control frames
                Some(payload) = control_rx.recv() => {
                    if let Err(e) = write.send(Message::text(payload)).await {
                        warn!(error = %e, "Failed to send control frame");
                        return SessionEnd::Failed;
                    }
                }

                _ = shutdown.notified() => {
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
            }
        }
    }

    fn handle_text(&self, text: &str) {
        match wire::decode(text) {
            Ok(frame) => self.dispatch(&frame),
            Err(e) => warn!(error = %e, "Ignoring undecodable frame from relay"),
        }
    }

    /// Deliver one frame to every registered listener.
    ///
    /// Listeners run outside the registry's shard locks, in handle order.
    /// A listener removed mid-pass is skipped, and a panicking listener is
    /// contained and logged.
    fn dispatch(&self, frame: &Frame) {
        let mut snapshot: Vec<(ListenerId, Listener)> = self
            .listeners
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();
        snapshot.sort_by_key(|(id, _)| *id);

        debug!(
            kind = frame.kind(),
            symbol = ?frame.symbol(),
            listeners = snapshot.len(),
            "Dispatching frame"
        );

        for (id, listener) in snapshot {
            if !self.listeners.contains_key(&id) {
                continue;
            }
            if panic::catch_unwind(AssertUnwindSafe(|| listener(frame))).is_err() {
                error!(listener_id = id.0, "Listener panicked while handling a frame");
            }
        }
    }

    /// Re-declare every refcounted symbol on a fresh connection.
    fn replay_subscriptions(&self) {
        let symbols: Vec<String> = {
            let subscriptions = self.subscriptions.lock().expect("lock poisoned");
            subscriptions.keys().cloned().collect()
        };
        for symbol in symbols {
            info!(symbol = %symbol, "Replaying subscription");
            let frame = Frame::Subscribe { symbol };
            self.queue_control(wire::encode(&frame));
        }
    }

    /// Push a control frame onto the live transport's write queue. Dropped
    /// with an error log when no transport is connected.
    fn queue_control(&self, payload: String) {
        let slot = self.control_tx.lock().expect("lock poisoned");
        match slot.as_ref() {
            Some(sender) => {
                if sender.send(payload).is_err() {
                    warn!("Control frame dropped, session ending");
                }
            }
            None => {
                error!("Cannot send control frame, not connected to relay");
            }
        }
    }

    fn install_control_channel(&self, sender: mpsc::UnboundedSender<String>) {
        *self.control_tx.lock().expect("lock poisoned") = Some(sender);
    }

    fn clear_control_channel(&self) {
        *self.control_tx.lock().expect("lock poisoned") = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use std::sync::atomic::AtomicUsize;

    fn make_manager() -> Arc<ConnectionManager> {
        Arc::new(ConnectionManager::new(ClientConfig::default()))
    }

    fn emit_frame() -> Frame {
        Frame::Emit(pulse::wire::Reading {
            symbol: Some("env-1".to_string()),
            fields: Map::new(),
        })
    }

    #[test]
    fn test_new_manager_starts_disconnected() {
        let manager = make_manager();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_listeners_run_in_handle_order() {
        let manager = make_manager();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in 0..3u64 {
            let order = Arc::clone(&order);
            manager.add_listener(move |_| {
                order.lock().unwrap().push(tag);
            });
        }

        manager.inner.dispatch(&emit_frame());
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_listener_removing_itself_keeps_others() {
        let manager = make_manager();
        let self_id: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));
        let first_hits = Arc::new(AtomicUsize::new(0));
        let second_hits = Arc::new(AtomicUsize::new(0));

        let mgr = Arc::clone(&manager);
        let slot = Arc::clone(&self_id);
        let hits = Arc::clone(&first_hits);
        let id = manager.add_listener(move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
            if let Some(id) = *slot.lock().unwrap() {
                mgr.remove_listener(id);
            }
        });
        *self_id.lock().unwrap() = Some(id);

        let hits = Arc::clone(&second_hits);
        manager.add_listener(move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
        });

        manager.inner.dispatch(&emit_frame());
        manager.inner.dispatch(&emit_frame());

        // The self-removing listener ran once; the later one ran both times
        assert_eq!(first_hits.load(Ordering::SeqCst), 1);
        assert_eq!(second_hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_listener_removed_mid_pass_is_skipped() {
        let manager = make_manager();
        let victim_id: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));
        let victim_hits = Arc::new(AtomicUsize::new(0));

        let mgr = Arc::clone(&manager);
        let slot = Arc::clone(&victim_id);
        manager.add_listener(move |_| {
            if let Some(id) = *slot.lock().unwrap() {
                mgr.remove_listener(id);
            }
        });

        let hits = Arc::clone(&victim_hits);
        let victim = manager.add_listener(move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
        });
        *victim_id.lock().unwrap() = Some(victim);

        manager.inner.dispatch(&emit_frame());
        assert_eq!(victim_hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panicking_listener_is_contained() {
        let manager = make_manager();
        let survivor_hits = Arc::new(AtomicUsize::new(0));

        manager.add_listener(|_| {
            panic!("listener failure");
        });
        let hits = Arc::clone(&survivor_hits);
        manager.add_listener(move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
        });

        manager.inner.dispatch(&emit_frame());
        manager.inner.dispatch(&emit_frame());
        assert_eq!(survivor_hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_subscription_refcount() {
        let manager = make_manager();

        manager.subscribe_symbol("env-1");
        manager.subscribe_symbol("env-1");
        manager.unsubscribe_symbol("env-1");
        assert!(manager
            .inner
            .subscriptions
            .lock()
            .unwrap()
            .contains_key("env-1"));

        manager.unsubscribe_symbol("env-1");
        assert!(!manager
            .inner
            .subscriptions
            .lock()
            .unwrap()
            .contains_key("env-1"));
    }

    #[test]
    fn test_unsubscribe_unknown_symbol_is_ignored() {
        let manager = make_manager();
        manager.unsubscribe_symbol("never-subscribed");
        assert!(manager.inner.subscriptions.lock().unwrap().is_empty());
    }

    #[test]
    fn test_remove_unknown_listener_is_ignored() {
        let manager = make_manager();
        let id = manager.add_listener(|_| {});
        manager.remove_listener(id);
        manager.remove_listener(id);
        assert!(manager.inner.listeners.is_empty());
    }
}
