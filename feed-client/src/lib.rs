//! Feed Client - Managed connection to a Pulse relay.
//!
//! This crate keeps exactly one WebSocket connection to a relay alive on
//! behalf of the whole process and fans incoming frames out to registered
//! listeners. Consumers that only care about "the latest reading" bind a
//! [`ReadingObserver`] instead of talking to the socket directly.
//!
//! # Architecture
//!
//! ```text
//!        Pulse relay (WebSocket)
//!                  ↕
//! ┌──────────────────────────────────────┐
//! │          ConnectionManager           │
//! │  - One transport for the process     │
//! │  - Reconnects on a fixed delay       │
//! │  - Dispatches frames to listeners    │
//! │  - Replays subscriptions             │
//! └──────────────────────────────────────┘
//!                  ↕
//! ┌──────────────────────────────────────┐
//! │          ReadingObserver(s)          │
//! │  - Latest reading, symbol-filtered   │
//! │  - Polled connection status          │
//! └──────────────────────────────────────┘
//! ```
//!
//! # Core Types
//!
//! - [`ConnectionManager`] - Owns the relay connection and the listener registry
//! - [`ConnectionState`] - Connecting / Connected / Disconnected / Errored
//! - [`ListenerId`] - Handle returned by `add_listener`, used to remove it
//! - [`ReadingObserver`] - Self-contained latest-reading view for one symbol
//! - [`Frame`] / [`Reading`] - Re-exported wire model from the pulse crate
//!
//! # Example
//!
//! ```no_run
//! use feed_client::{ClientConfig, ConnectionManager, ReadingObserver};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let manager = Arc::new(ConnectionManager::new(ClientConfig {
//!     relay_url: "ws://localhost:8380/feed".to_string(),
//!     reconnect_delay: Duration::from_secs(3),
//! }));
//!
//! // React to every frame the relay delivers
//! let listener = manager.add_listener(|frame| {
//!     println!("frame: {:?}", frame);
//! });
//!
//! manager.connect();
//!
//! // Or bind a polled view of the latest reading for one symbol
//! let observer = ReadingObserver::new(Arc::clone(&manager), Some("env-1"));
//! # let _ = (listener, observer);
//! # }
//! ```

pub mod config;
pub mod manager;
pub mod observe;

// Re-export public types
pub use config::ClientConfig;
pub use manager::{ConnectionManager, ConnectionState, ListenerId};
pub use observe::ReadingObserver;

// Re-export the wire model from the pulse crate for convenience
pub use pulse::wire::{Frame, Reading};
