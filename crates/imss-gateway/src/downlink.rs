use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use imss_kv_store::KvStore;
use imss_protocol::{channels, kv_keys, GatewayEnvelope, PUSH_DEDUP_TTL_SECS};
use tracing::{debug, warn};

use crate::state::GatewayState;

/// Subscribes to this gateway's own pub/sub channel and pushes each decoded
/// envelope to whichever local session owns `targetUser` (§4.4 "downlink
/// event"). Runs for the lifetime of the gateway process; the subscription
/// itself is what `shutdown` cancels by dropping the task.
pub async fn run<K: KvStore + 'static>(state: Arc<GatewayState<K>>) {
    let channel = channels::gateway_user_message(&state.gateway_id);
    let mut stream = match state.kv.subscribe(&channel).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(channel = %channel, error = %e, "gateway: downlink subscribe failed, no pushes will be delivered");
            return;
        },
    };

    while let Some(payload) = stream.next().await {
        let Ok(text) = String::from_utf8(payload) else {
            warn!("gateway: downlink payload was not valid utf8, dropping");
            continue;
        };
        let envelope = match GatewayEnvelope::from_wire(&text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "gateway: malformed downlink envelope, dropping");
                continue;
            },
        };
        deliver(&state, envelope).await;
    }
}

async fn deliver<K: KvStore>(state: &Arc<GatewayState<K>>, envelope: GatewayEnvelope) {
    let dedup_key = kv_keys::push_dedup(envelope.target_user, envelope.message.message_id);
    match state.kv.set_nx(&dedup_key, "1", Duration::from_secs(PUSH_DEDUP_TTL_SECS as u64)).await {
        Ok(false) => {
            debug!(target_user = envelope.target_user, message_id = envelope.message.message_id, "gateway: duplicate push suppressed");
            return;
        },
        Err(e) => {
            warn!(error = %e, "gateway: push dedup check failed, delivering anyway");
        },
        Ok(true) => {},
    }

    let conn_ids = state.local_sessions_for(envelope.target_user).await;
    if conn_ids.is_empty() {
        debug!(target_user = envelope.target_user, "gateway: downlink event for a user with no local session");
        return;
    }

    let Ok(wire) = serde_json::to_string(&envelope) else {
        warn!("gateway: failed to re-encode envelope for socket write");
        return;
    };

    let mut evicted = Vec::new();
    {
        let clients = state.clients.read().await;
        for conn_id in &conn_ids {
            if let Some(client) = clients.get(conn_id) {
                if !client.send(&wire) {
                    evicted.push(conn_id.clone());
                }
            }
        }
    }
    for conn_id in evicted {
        warn!(conn_id = %conn_id, "gateway: socket write failed, evicting session");
        state.remove_client(&conn_id).await;
    }
}
