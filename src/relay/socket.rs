use crate::config::ServerConfig;
use crate::relay::hub::{PeerSession, RelayHub};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Relay status reported by GET /api/status
#[derive(Serialize)]
pub struct StatusResponse {
    pub peers: usize,
    pub retained_reading: bool,
    pub uptime_seconds: i64,
}

/// GET /api/status - peer count, retained reading flag, uptime
async fn get_status(State(hub): State<Arc<RelayHub>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        peers: hub.peer_count(),
        retained_reading: hub.has_latest(),
        uptime_seconds: hub.uptime_seconds(),
    })
}

/// Feed WebSocket upgrade handler
async fn feed_handler(ws: WebSocketUpgrade, State(hub): State<Arc<RelayHub>>) -> Response {
    info!("Feed upgrade request received");
    ws.on_upgrade(|socket| handle_peer(socket, hub))
}

/// Create the relay router: the feed WebSocket plus the status endpoint.
/// CORS is permissive so browser dashboards can poll status directly.
pub fn create_relay_router(hub: Arc<RelayHub>, config: &ServerConfig) -> Router {
    Router::new()
        .route(&config.feed_path, get(feed_handler))
        .route("/api/status", get(get_status))
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(hub)
}

/// Drive one peer connection until it closes or errors.
///
/// The peer is seeded with the retained reading, then the loop pumps both
/// directions: inbound text goes to the hub, fan-out frames from other
/// peers go down the socket. A failure on either side only ends this peer.
async fn handle_peer(mut socket: WebSocket, hub: Arc<RelayHub>) {
    let PeerSession {
        id,
        mut frames,
        catch_up,
    } = hub.register();

    if let Some(text) = catch_up {
        if let Err(e) = socket.send(Message::Text(text)).await {
            warn!(peer_id = id, error = %e, "Failed to send catch-up frame");
            hub.unregister(id);
            return;
        }
    }

    loop {
        tokio::select! {
            // Inbound frames from this peer
            Some(msg) = socket.recv() => {
                match msg {
                    Ok(Message::Text(text)) => {
                        hub.ingest(id, &text);
                    }
                    Ok(Message::Close(_)) => {
                        info!(peer_id = id, "Peer closed connection");
                        break;
                    }
                    Ok(Message::Ping(data)) => {
                        if let Err(e) = socket.send(Message::Pong(data)).await {
                            error!(peer_id = id, error = %e, "Failed to send pong");
                            break;
                        }
                    }
                    Ok(_) => {
                        // Ignore binary, pong messages
                    }
                    Err(e) => {
                        warn!(peer_id = id, error = %e, "WebSocket error");
                        break;
                    }
                }
            }

            // Fan-out frames from the rest of the relay
            result = frames.recv() => {
                match result {
                    Ok(broadcast) if broadcast.origin == id => {
                        // Never echo a frame back to its sender
                    }
                    Ok(broadcast) => {
                        if let Err(e) = socket.send(Message::Text(broadcast.text)).await {
                            error!(peer_id = id, error = %e, "Failed to deliver frame");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(peer_id = id, skipped = skipped, "Peer lagged, skipped frames");
                        // Continue processing
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        error!(peer_id = id, "Fan-out channel closed");
                        break;
                    }
                }
            }

            else => {
                break;
            }
        }
    }

    hub.unregister(id);
}
