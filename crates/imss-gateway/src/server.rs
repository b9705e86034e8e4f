use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use imss_kv_store::KvStore;

use crate::state::GatewayState;
use crate::ws;

/// Builds the gateway's axum router: a single WebSocket upgrade endpoint.
/// Everything else (handshake, auth, the uplink/downlink split) lives behind
/// that one connection, per §4.4 and §6.
pub fn build_router<K: KvStore + 'static>(state: Arc<GatewayState<K>>) -> Router {
    Router::new().route("/ws", get(upgrade::<K>)).with_state(state)
}

async fn upgrade<K: KvStore + 'static>(
    ws: WebSocketUpgrade,
    State(state): State<Arc<GatewayState<K>>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws::handle_connection(socket, state, remote_addr))
}
