use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use imss_common::CoreError;
use imss_kv_store::KvStore;
use imss_protocol::{kv_keys, HEARTBEAT_INTERVAL_SECS, MEMBERSHIP_TTL_GRACE_SECS, MEMBERSHIP_WINDOW_SECS};
use tracing::warn;

use crate::instance::GatewayInstance;
use crate::Result;

fn now_unix() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

fn detail_ttl() -> Duration {
    Duration::from_secs((MEMBERSHIP_WINDOW_SECS + MEMBERSHIP_TTL_GRACE_SECS) as u64)
}

/// Registers the local gateway's membership and keeps it fresh (§4.5): every
/// [`HEARTBEAT_INTERVAL_SECS`], re-scores the membership entry with the
/// current time and refreshes the detail-hash TTL. On shutdown, removes both.
pub struct HeartbeatManager<K: KvStore> {
    kv: Arc<K>,
    gateway_id: String,
}

impl<K: KvStore> HeartbeatManager<K> {
    #[must_use]
    pub fn new(kv: Arc<K>, gateway_id: impl Into<String>) -> Self {
        Self { kv, gateway_id: gateway_id.into() }
    }

    /// Initial registration: writes the detail hash and the membership
    /// score. Called once at gateway startup.
    ///
    /// # Errors
    /// Propagates KV-store errors as [`CoreError::TransientInfra`].
    pub async fn register(&self, host: &str, port: u16) -> Result<()> {
        let now = now_unix();
        let instance = GatewayInstance::new(self.gateway_id.clone(), host, port, now);
        let key = kv_keys::gateway_instance(&self.gateway_id);
        let fields = instance.to_hash_fields();
        let field_refs: Vec<(&str, &str)> = fields.iter().map(|(k, v)| (*k, v.as_str())).collect();
        self.kv.hmset(&key, &field_refs).await.map_err(|e| CoreError::TransientInfra(e.to_string()))?;
        self.kv.expire(&key, detail_ttl()).await.map_err(|e| CoreError::TransientInfra(e.to_string()))?;
        self.kv
            .z_add(kv_keys::ACTIVE_GATEWAYS, now as f64, &self.gateway_id)
            .await
            .map_err(|e| CoreError::TransientInfra(e.to_string()))?;
        Ok(())
    }

    /// One re-score cycle: bumps the membership score to now and refreshes
    /// the detail-hash TTL.
    ///
    /// # Errors
    /// Propagates KV-store errors as [`CoreError::TransientInfra`].
    pub async fn beat_once(&self) -> Result<()> {
        let now = now_unix();
        self.kv
            .z_add(kv_keys::ACTIVE_GATEWAYS, now as f64, &self.gateway_id)
            .await
            .map_err(|e| CoreError::TransientInfra(e.to_string()))?;
        self.kv
            .expire(&kv_keys::gateway_instance(&self.gateway_id), detail_ttl())
            .await
            .map_err(|e| CoreError::TransientInfra(e.to_string()))?;
        Ok(())
    }

    /// Removes both the membership score and the detail hash. Called on
    /// graceful shutdown.
    ///
    /// # Errors
    /// Propagates KV-store errors as [`CoreError::TransientInfra`].
    pub async fn deregister(&self) -> Result<()> {
        self.kv
            .z_rem(kv_keys::ACTIVE_GATEWAYS, &self.gateway_id)
            .await
            .map_err(|e| CoreError::TransientInfra(e.to_string()))?;
        self.kv
            .del(&kv_keys::gateway_instance(&self.gateway_id))
            .await
            .map_err(|e| CoreError::TransientInfra(e.to_string()))?;
        Ok(())
    }

    /// Spawns the periodic re-score loop, stopping (without deregistering —
    /// that is the caller's explicit responsibility) once `shutdown` fires.
    pub fn spawn_loop(self: &Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>)
    where
        K: 'static,
    {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = manager.beat_once().await {
                            warn!(error = %e, "heartbeat re-score failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imss_kv_store::FakeKvStore;

    #[tokio::test]
    async fn register_then_deregister_clears_both_entries() {
        let kv = Arc::new(FakeKvStore::new());
        let manager = HeartbeatManager::new(kv.clone(), "gw-1");
        manager.register("10.0.0.1", 9000).await.unwrap();

        assert!(!kv.hget_all(&kv_keys::gateway_instance("gw-1")).await.unwrap().is_empty());
        assert_eq!(kv.z_card(kv_keys::ACTIVE_GATEWAYS).await.unwrap(), 1);

        manager.deregister().await.unwrap();
        assert!(kv.hget_all(&kv_keys::gateway_instance("gw-1")).await.unwrap().is_empty());
        assert_eq!(kv.z_card(kv_keys::ACTIVE_GATEWAYS).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn beat_once_bumps_the_membership_score() {
        let kv = Arc::new(FakeKvStore::new());
        let manager = HeartbeatManager::new(kv.clone(), "gw-1");
        manager.register("10.0.0.1", 9000).await.unwrap();
        let before = kv.z_range_by_score(kv_keys::ACTIVE_GATEWAYS, 0.0, f64::INFINITY).await.unwrap();
        assert_eq!(before, vec!["gw-1"]);
        manager.beat_once().await.unwrap();
        assert_eq!(kv.z_card(kv_keys::ACTIVE_GATEWAYS).await.unwrap(), 1);
    }
}
