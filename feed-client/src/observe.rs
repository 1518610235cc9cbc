//! Latest-reading observation.
//!
//! A [`ReadingObserver`] binds to a [`ConnectionManager`] and keeps two
//! things current: the most recent reading matching its symbol filter, and
//! a periodically polled connection status. Dropping the observer detaches
//! its listener, releases its subscription, and stops the poll.

use crate::manager::{ConnectionManager, ConnectionState, ListenerId};
use pulse::wire::{Frame, Reading};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Default cadence for the status poll
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Live view of the latest reading for one symbol, or for any symbol.
///
/// Construction registers a frame listener, connects the manager, and
/// declares symbol interest; current values are then read with `reading()`
/// and `status()`.
pub struct ReadingObserver {
    manager: Arc<ConnectionManager>,
    symbol: Option<String>,
    listener: ListenerId,
    reading: Arc<Mutex<Option<Reading>>>,
    status: Arc<Mutex<ConnectionState>>,
    poller: JoinHandle<()>,
}

impl ReadingObserver {
    /// Bind an observer with the default 1 second status poll.
    pub fn new(manager: Arc<ConnectionManager>, symbol: Option<&str>) -> Self {
        Self::with_poll_interval(manager, symbol, DEFAULT_POLL_INTERVAL)
    }

    /// Bind an observer with a custom status poll cadence.
    pub fn with_poll_interval(
        manager: Arc<ConnectionManager>,
        symbol: Option<&str>,
        poll_interval: Duration,
    ) -> Self {
        let symbol = symbol.map(str::to_string);
        let reading = Arc::new(Mutex::new(None));
        let status = Arc::new(Mutex::new(manager.state()));

        // Listener first, so the catch-up frame on a fresh connection is
        // not lost to a registration race
        let listener = {
            let reading = Arc::clone(&reading);
            let filter = symbol.clone();
            manager.add_listener(move |frame| {
                if let Frame::Emit(incoming) = frame {
                    if incoming.matches(filter.as_deref()) {
                        *reading.lock().expect("lock poisoned") = Some(incoming.clone());
                    }
                }
            })
        };

        manager.connect();

        if let Some(symbol) = &symbol {
            manager.subscribe_symbol(symbol);
        }

        let poller = {
            let status = Arc::clone(&status);
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(poll_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    *status.lock().expect("lock poisoned") = manager.state();
                }
            })
        };

        Self {
            manager,
            symbol,
            listener,
            reading,
            status,
            poller,
        }
    }

    /// Latest reading that matched the filter, if any has arrived.
    pub fn reading(&self) -> Option<Reading> {
        self.reading.lock().expect("lock poisoned").clone()
    }

    /// Connection status as of the last poll tick.
    pub fn status(&self) -> ConnectionState {
        *self.status.lock().expect("lock poisoned")
    }

    /// Symbol this observer filters on, if any.
    pub fn symbol(&self) -> Option<&str> {
        self.symbol.as_deref()
    }
}

impl Drop for ReadingObserver {
    fn drop(&mut self) {
        self.poller.abort();
        self.manager.remove_listener(self.listener);
        if let Some(symbol) = &self.symbol {
            // Only put an unsubscribe on the wire when a transport is up;
            // the interest refcount is released either way
            if self.manager.state() == ConnectionState::Connected {
                self.manager.unsubscribe_symbol(symbol);
            } else {
                self.manager.release_symbol(symbol);
            }
        }
        debug!(symbol = ?self.symbol, "Observer detached");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;

    #[tokio::test]
    async fn test_observer_reports_polled_status() {
        // Nothing listens on port 1, so every attempt fails fast
        let manager = Arc::new(ConnectionManager::new(ClientConfig {
            relay_url: "ws://127.0.0.1:1/feed".to_string(),
            reconnect_delay: Duration::from_secs(30),
        }));
        let observer = ReadingObserver::with_poll_interval(
            Arc::clone(&manager),
            Some("env-1"),
            Duration::from_millis(20),
        );

        assert_eq!(observer.reading(), None);
        assert_eq!(observer.symbol(), Some("env-1"));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(observer.status(), ConnectionState::Errored);

        manager.disconnect();
    }
}
