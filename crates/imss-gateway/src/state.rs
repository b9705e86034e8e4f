use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use imss_kv_store::KvStore;
use imss_locator::HeartbeatManager;
use imss_logic::LogicOrchestrator;
use tokio::sync::RwLock;

use crate::auth::TokenAuthenticator;
use crate::session::ConnectedClient;

/// Shared gateway runtime state (§4.4), wrapped in `Arc` for use across the
/// per-connection tasks, the downlink subscriber, and the heartbeat loop.
/// `clients` is single-writer-many-reader: the message loop and the downlink
/// subscriber both read it far more often than a connection opens or closes.
pub struct GatewayState<K: KvStore> {
    pub gateway_id: String,
    pub kv: Arc<K>,
    pub clients: RwLock<HashMap<String, ConnectedClient>>,
    pub sessions_by_user: RwLock<HashMap<i64, HashSet<String>>>,
    pub orchestrator: Arc<LogicOrchestrator<K>>,
    pub heartbeat: Arc<HeartbeatManager<K>>,
    pub authenticator: Arc<dyn TokenAuthenticator>,
}

impl<K: KvStore> GatewayState<K> {
    #[must_use]
    pub fn new(
        gateway_id: impl Into<String>,
        kv: Arc<K>,
        orchestrator: Arc<LogicOrchestrator<K>>,
        heartbeat: Arc<HeartbeatManager<K>>,
        authenticator: Arc<dyn TokenAuthenticator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            gateway_id: gateway_id.into(),
            kv,
            clients: RwLock::new(HashMap::new()),
            sessions_by_user: RwLock::new(HashMap::new()),
            orchestrator,
            heartbeat,
            authenticator,
        })
    }

    /// Registers a new local session, evicting any prior local socket for
    /// the same user from the registry first — "on a second session arriving
    /// at the same gateway for the same user, the prior local socket is
    /// closed before the new one replaces it" (§3). Returns the evicted
    /// client so the caller can call [`ConnectedClient::evict`] on it and
    /// actually tear down its read/write tasks; this method only updates the
    /// registry.
    pub async fn register_client(&self, client: ConnectedClient) -> Option<ConnectedClient> {
        let user_id = client.user_id;
        let conn_id = client.conn_id.clone();

        let evicted = {
            let mut users = self.sessions_by_user.write().await;
            let existing = users.entry(user_id).or_default();
            let prior_conn_id = existing.iter().next().cloned();
            existing.clear();
            existing.insert(conn_id.clone());
            prior_conn_id
        };

        let mut clients = self.clients.write().await;
        let prior = evicted.and_then(|id| clients.remove(&id));
        clients.insert(conn_id, client);
        prior
    }

    /// Removes a client by conn_id, returning it if present.
    pub async fn remove_client(&self, conn_id: &str) -> Option<ConnectedClient> {
        let removed = self.clients.write().await.remove(conn_id);
        if let Some(client) = &removed {
            let mut users = self.sessions_by_user.write().await;
            if let Some(conns) = users.get_mut(&client.user_id) {
                conns.remove(conn_id);
                if conns.is_empty() {
                    users.remove(&client.user_id);
                }
            }
        }
        removed
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Local connection ids currently open for `user_id` on this gateway
    /// instance. Used by the downlink path to find who to write a socket
    /// frame to.
    pub async fn local_sessions_for(&self, user_id: i64) -> Vec<String> {
        self.sessions_by_user.read().await.get(&user_id).map(|set| set.iter().cloned().collect()).unwrap_or_default()
    }
}
