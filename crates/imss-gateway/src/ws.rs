use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use axum::extract::ws::{Message, WebSocket};
use futures::{stream::StreamExt, SinkExt};
use imss_kv_store::KvStore;
use imss_protocol::{
    kv_keys, ClientFrame, MessageType, HANDSHAKE_TIMEOUT_MS, HEARTBEAT_INTERVAL_SECS, MAX_PAYLOAD_BYTES, SESSION_TTL_SECS,
};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::handshake::{OpenSessionError, OpenSessionRequest};
use crate::session::{new_connection_id, ConnectedClient, SessionState};
use crate::state::GatewayState;

fn now_unix() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

#[derive(Serialize)]
struct UplinkAck {
    #[serde(rename = "ackId", skip_serializing_if = "Option::is_none")]
    ack_id: Option<String>,
    ok: bool,
    #[serde(rename = "messageId")]
    message_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Drives a single WebSocket connection through its full lifecycle (§4.4):
/// handshake with token auth, uplink message loop, cleanup. Mirrors the
/// split-socket / unbounded-channel write-loop shape the teacher's own
/// `ws.rs` uses for the same reason: a writer task owns the socket's write
/// half so the read loop never blocks on a slow client.
pub async fn handle_connection<K: KvStore + 'static>(socket: WebSocket, state: Arc<GatewayState<K>>, remote_addr: SocketAddr) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (client_tx, mut client_rx) = mpsc::unbounded_channel::<String>();

    let write_handle = tokio::spawn(async move {
        while let Some(msg) = client_rx.recv().await {
            if ws_tx.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    let open = match tokio::time::timeout(Duration::from_millis(HANDSHAKE_TIMEOUT_MS), wait_for_open(&mut ws_rx)).await {
        Ok(Ok(open)) => open,
        Ok(Err(e)) => {
            warn!(remote = %remote_addr, error = %e, "gateway: handshake failed");
            drop(client_tx);
            write_handle.abort();
            return;
        },
        Err(_) => {
            warn!(remote = %remote_addr, "gateway: handshake timeout");
            drop(client_tx);
            write_handle.abort();
            return;
        },
    };

    if !state.authenticator.authenticate(open.user_id, &open.token).await {
        warn!(user_id = open.user_id, "gateway: auth failed");
        let err = OpenSessionError { error: "invalid token".to_string() };
        let _ = client_tx.send(serde_json::to_string(&err).unwrap_or_default());
        drop(client_tx);
        write_handle.abort();
        return;
    }

    let now_ns = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos()).unwrap_or(0);
    let conn_id = new_connection_id(open.user_id, now_ns);

    if let Err(e) = open_session(&state, open.user_id, &conn_id).await {
        warn!(user_id = open.user_id, error = %e, "gateway: session open failed");
        let err = OpenSessionError { error: "session open failed".to_string() };
        let _ = client_tx.send(serde_json::to_string(&err).unwrap_or_default());
        drop(client_tx);
        write_handle.abort();
        return;
    }

    let ack = crate::handshake::OpenSessionAck { connection_id: conn_id.clone(), gateway_id: state.gateway_id.clone() };
    let _ = client_tx.send(serde_json::to_string(&ack).unwrap_or_default());
    info!(user_id = open.user_id, conn_id = %conn_id, "gateway: session opened");

    let now = Instant::now();
    let cancel = CancellationToken::new();
    if let Some(evicted) = state
        .register_client(ConnectedClient {
            conn_id: conn_id.clone(),
            user_id: open.user_id,
            state: SessionState::Active,
            sender: client_tx.clone(),
            connected_at: now,
            last_heartbeat: now,
            cancel: cancel.clone(),
            write_handle: write_handle.abort_handle(),
        })
        .await
    {
        debug!(conn_id = %evicted.conn_id, "gateway: evicted prior local session for same user");
        evicted.send(&serde_json::to_string(&OpenSessionError { error: "replaced by new session".to_string() }).unwrap_or_default());
        evicted.evict();
    }

    let heartbeat_timeout = Duration::from_secs(HEARTBEAT_INTERVAL_SECS * 3);

    loop {
        let msg = tokio::select! {
            result = tokio::time::timeout(heartbeat_timeout, ws_rx.next()) => match result {
                Ok(Some(msg)) => msg,
                Ok(None) => break,
                Err(_) => {
                    warn!(conn_id = %conn_id, "gateway: missed heartbeat threshold, closing");
                    break;
                },
            },
            () = cancel.cancelled() => {
                debug!(conn_id = %conn_id, "gateway: session evicted by a newer connection, closing");
                break;
            },
        };

        let text = match msg {
            Ok(Message::Text(t)) => t.to_string(),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(conn_id = %conn_id, error = %e, "gateway: read error");
                break;
            },
        };

        if text.len() > MAX_PAYLOAD_BYTES {
            warn!(conn_id = %conn_id, size = text.len(), "gateway: payload too large");
            continue;
        }

        let frame: ClientFrame = match serde_json::from_str(&text) {
            Ok(f) => f,
            Err(e) => {
                warn!(conn_id = %conn_id, error = %e, "gateway: invalid frame, dropping");
                continue;
            },
        };

        if let Some(client) = state.clients.write().await.get_mut(&conn_id) {
            client.touch_heartbeat();
        }

        handle_uplink_frame(&state, &conn_id, open.user_id, frame, &client_tx).await;
    }

    let removed_node = state.remove_client(&conn_id).await;
    if let Err(e) = close_session(&state, open.user_id, &conn_id).await {
        warn!(conn_id = %conn_id, error = %e, "gateway: session close cleanup failed");
    }
    if let Some(client) = removed_node {
        info!(conn_id = %conn_id, duration_secs = client.connected_at.elapsed().as_secs(), "gateway: connection closed");
    }

    drop(client_tx);
    write_handle.abort();
}

async fn handle_uplink_frame<K: KvStore>(
    state: &Arc<GatewayState<K>>,
    conn_id: &str,
    user_id: i64,
    frame: ClientFrame,
    client_tx: &mpsc::UnboundedSender<String>,
) {
    match frame.message_type {
        MessageType::Heartbeat => {
            if let Err(e) = state.kv.expire(&kv_keys::conn(user_id, conn_id), Duration::from_secs(SESSION_TTL_SECS as u64)).await {
                warn!(conn_id, error = %e, "gateway: heartbeat TTL refresh failed");
            }
        },
        MessageType::Text => {
            let outcome = state.orchestrator.process_message(frame.clone(), now_unix()).await;
            let ack = match outcome {
                Ok(result) => UplinkAck { ack_id: frame.ack_id.clone(), ok: true, message_id: result.message_id, error: None },
                Err(e) => UplinkAck { ack_id: frame.ack_id.clone(), ok: false, message_id: frame.message_id, error: Some(e.to_string()) },
            };
            let _ = client_tx.send(serde_json::to_string(&ack).unwrap_or_default());
        },
        MessageType::Ack => {
            if let Err(e) = state.orchestrator.handle_message_ack(user_id, frame.message_id).await {
                warn!(conn_id, error = %e, "gateway: ack handling failed");
            }
        },
        MessageType::SessionMgmt | MessageType::StatusEvent | MessageType::Unknown(_) => {
            debug!(conn_id, message_type = ?frame.message_type, "gateway: dropping unhandled frame type");
        },
    }
}

/// Best-effort rollback on partial failure: a failed write during session
/// open aborts and undoes whatever prior writes already landed (§4.4 failure
/// semantics).
async fn open_session<K: KvStore>(state: &Arc<GatewayState<K>>, user_id: i64, conn_id: &str) -> imss_common::Result<()> {
    let key = kv_keys::conn(user_id, conn_id);
    let now_str = now_unix().to_string();
    let fields = [("gatewayId", state.gateway_id.as_str()), ("connectedAtUnix", now_str.as_str()), ("lastHeartbeatUnix", now_str.as_str())];

    if let Err(e) = state.kv.hmset(&key, &fields).await {
        return Err(imss_common::CoreError::TransientInfra(e.to_string()));
    }
    if let Err(e) = state.kv.expire(&key, Duration::from_secs(SESSION_TTL_SECS as u64)).await {
        let _ = state.kv.del(&key).await;
        return Err(imss_common::CoreError::TransientInfra(e.to_string()));
    }
    if let Err(e) = state.kv.s_add(kv_keys::ONLINE_USERS, &user_id.to_string()).await {
        let _ = state.kv.del(&key).await;
        return Err(imss_common::CoreError::TransientInfra(e.to_string()));
    }
    Ok(())
}

async fn close_session<K: KvStore>(state: &Arc<GatewayState<K>>, user_id: i64, conn_id: &str) -> imss_common::Result<()> {
    state.kv.del(&kv_keys::conn(user_id, conn_id)).await.map_err(|e| imss_common::CoreError::TransientInfra(e.to_string()))?;
    state.kv.s_rem(kv_keys::ONLINE_USERS, &user_id.to_string()).await.map_err(|e| imss_common::CoreError::TransientInfra(e.to_string()))?;
    Ok(())
}

async fn wait_for_open(rx: &mut futures::stream::SplitStream<WebSocket>) -> anyhow::Result<OpenSessionRequest> {
    while let Some(msg) = rx.next().await {
        let text = match msg? {
            Message::Text(t) => t.to_string(),
            Message::Close(_) => anyhow::bail!("connection closed before handshake"),
            _ => continue,
        };
        return Ok(serde_json::from_str(&text)?);
    }
    anyhow::bail!("connection closed before handshake")
}
