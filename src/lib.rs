// Wire protocol: frame model and codec
pub mod wire;

// Relay core: hub, peer sockets, status endpoint
pub mod relay;

// Downstream sink forwarding
pub mod forward;

// Configuration
pub mod config;
