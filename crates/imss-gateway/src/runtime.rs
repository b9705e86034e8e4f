use std::sync::Arc;

use imss_kv_store::KvStore;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::state::GatewayState;

/// Owns the gateway's background tasks (downlink subscriber, heartbeat
/// re-score loop) and the startup/shutdown sweep of `conn:*` rows (§4.4).
pub struct GatewayRuntime<K: KvStore> {
    pub state: Arc<GatewayState<K>>,
    shutdown_tx: watch::Sender<bool>,
    downlink_handle: tokio::task::JoinHandle<()>,
}

impl<K: KvStore + 'static> GatewayRuntime<K> {
    /// Performs the startup sequence: registers with the heartbeat manager,
    /// sweeps orphaned session rows this gateway id owned in a prior
    /// incarnation, then spawns the downlink subscriber and heartbeat loop.
    pub async fn start(state: Arc<GatewayState<K>>, host: &str, port: u16) -> imss_common::Result<Self> {
        state.heartbeat.register(host, port).await?;
        sweep_orphan_sessions(&state).await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        state.heartbeat.spawn_loop(shutdown_rx);

        let downlink_state = Arc::clone(&state);
        let downlink_handle = tokio::spawn(async move {
            crate::downlink::run(downlink_state).await;
        });

        info!(gateway_id = %state.gateway_id, "gateway: runtime started");
        Ok(Self { state, shutdown_tx, downlink_handle })
    }

    /// Graceful shutdown: cancels the downlink subscription, unregisters
    /// from the membership set, and purges this gateway's own session rows.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        self.downlink_handle.abort();
        if let Err(e) = self.state.heartbeat.deregister().await {
            warn!(error = %e, "gateway: deregister on shutdown failed");
        }
        purge_owned_sessions(&self.state).await;
        info!(gateway_id = %self.state.gateway_id, "gateway: runtime stopped");
    }
}

/// Best-effort cleanup of `conn:*` rows left behind by a prior process
/// incarnation with the same gateway id — these can never be resolved to a
/// local socket, so they'd otherwise dangle until their TTL expires.
async fn sweep_orphan_sessions<K: KvStore>(state: &Arc<GatewayState<K>>) {
    purge_matching(state, |gateway_id| gateway_id == state.gateway_id).await;
}

async fn purge_owned_sessions<K: KvStore>(state: &Arc<GatewayState<K>>) {
    purge_matching(state, |gateway_id| gateway_id == state.gateway_id).await;
}

async fn purge_matching<K: KvStore>(state: &Arc<GatewayState<K>>, owns: impl Fn(&str) -> bool) {
    let keys = match state.kv.keys("conn:*").await {
        Ok(keys) => keys,
        Err(e) => {
            warn!(error = %e, "gateway: session sweep failed to list keys");
            return;
        },
    };
    for key in keys {
        let fields = match state.kv.hget_all(&key).await {
            Ok(fields) => fields,
            Err(e) => {
                warn!(key = %key, error = %e, "gateway: session sweep failed to read row");
                continue;
            },
        };
        let Some(gateway_id) = fields.get("gatewayId") else {
            continue;
        };
        if owns(gateway_id)
            && let Err(e) = state.kv.del(&key).await
        {
            warn!(key = %key, error = %e, "gateway: session sweep failed to delete row");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::SharedSecretAuthenticator;
    use imss_durable_log::fake::{FakeBroker, FakeProducer};
    use imss_hash_ring::HashRing;
    use imss_kv_store::FakeKvStore;
    use imss_locator::{HeartbeatManager, SessionLocator};
    use imss_logic::{LogicOrchestrator, Services};

    async fn build_state() -> Arc<GatewayState<FakeKvStore>> {
        let kv = Arc::new(FakeKvStore::new());
        let ring = Arc::new(HashRing::default());
        let locator = Arc::new(SessionLocator::new(kv.clone(), ring));
        let broker = FakeBroker::new();
        let sync_producer = Arc::new(FakeProducer::new(broker.clone()));
        let async_producer = Arc::new(FakeProducer::new(broker));
        let id_gen = Arc::new(imss_id_gen::IdGenerator::new(1).unwrap());
        let services = Arc::new(Services::default());
        let orchestrator = Arc::new(LogicOrchestrator::new(id_gen, services, kv.clone(), locator, sync_producer, async_producer));
        let heartbeat = Arc::new(HeartbeatManager::new(kv.clone(), "gw-1"));
        GatewayState::new("gw-1", kv, orchestrator, heartbeat, Arc::new(SharedSecretAuthenticator::new("t")))
    }

    #[tokio::test]
    async fn startup_sweeps_orphan_rows_owned_by_this_gateway_id() {
        let state = build_state().await;
        state.kv.hmset("conn:7:conn-7-1", &[("gatewayId", "gw-1")]).await.unwrap();
        state.kv.hmset("conn:8:conn-8-1", &[("gatewayId", "gw-2")]).await.unwrap();

        let runtime = GatewayRuntime::start(state.clone(), "10.0.0.1", 9000).await.unwrap();
        assert!(state.kv.hget_all("conn:7:conn-7-1").await.unwrap().is_empty());
        assert!(!state.kv.hget_all("conn:8:conn-8-1").await.unwrap().is_empty());
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_deregisters_from_membership() {
        let state = build_state().await;
        let runtime = GatewayRuntime::start(state.clone(), "10.0.0.1", 9000).await.unwrap();
        assert_eq!(state.kv.z_card("active_gateways").await.unwrap(), 1);
        runtime.shutdown().await;
        assert_eq!(state.kv.z_card("active_gateways").await.unwrap(), 0);
    }
}
