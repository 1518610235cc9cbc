// Relay core: peer registry, retained reading, fan-out

pub mod hub;
pub mod socket;

pub use hub::{Broadcast, PeerId, PeerSession, RelayHub};
pub use socket::{create_relay_router, StatusResponse};
