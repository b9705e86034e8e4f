use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use imss_common::CoreError;
use imss_hash_ring::HashRing;
use imss_kv_store::KvStore;
use imss_protocol::{kv_keys, MEMBERSHIP_WINDOW_SECS};
use tracing::warn;

use crate::instance::GatewayInstance;
use crate::Result;

fn now_unix() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LocatorStats {
    pub active_gateways: usize,
}

/// Maintains a local copy of the consistent-hash ring and a
/// `gatewayId → gateway instance` map, periodically refreshed from the KV
/// store (§4.7). All lookup methods are pure and local; they never touch the
/// network and never block longer than one critical-section duration.
pub struct SessionLocator<K: KvStore> {
    kv: Arc<K>,
    ring: Arc<HashRing>,
    instances: RwLock<HashMap<String, GatewayInstance>>,
}

impl<K: KvStore> SessionLocator<K> {
    #[must_use]
    pub fn new(kv: Arc<K>, ring: Arc<HashRing>) -> Self {
        Self {
            kv,
            ring,
            instances: RwLock::new(HashMap::new()),
        }
    }

    /// One sync cycle: fetch the currently-active membership, then outside
    /// any lock fetch details for ids not yet known locally, then apply the
    /// whole diff (adds and removes) in a single critical section so no
    /// lookup observes a ring that reflects only half the new membership.
    ///
    /// # Errors
    /// Propagates KV-store errors as [`CoreError::TransientInfra`].
    pub async fn sync_once(&self) -> Result<()> {
        let now = now_unix();
        let active_ids: Vec<String> = self
            .kv
            .z_range_by_score(kv_keys::ACTIVE_GATEWAYS, (now - MEMBERSHIP_WINDOW_SECS) as f64, f64::INFINITY)
            .await
            .map_err(|e| CoreError::TransientInfra(e.to_string()))?;

        let known: Vec<String> = {
            let guard = self.instances.read().unwrap_or_else(|p| p.into_inner());
            guard.keys().cloned().collect()
        };

        let newly_seen: Vec<&String> = active_ids.iter().filter(|id| !known.contains(id)).collect();
        let mut fetched = Vec::with_capacity(newly_seen.len());
        for id in newly_seen {
            let fields = self
                .kv
                .hget_all(&kv_keys::gateway_instance(id))
                .await
                .map_err(|e| CoreError::TransientInfra(e.to_string()))?;
            match GatewayInstance::from_hash_fields(id, &fields, now) {
                Ok(instance) => fetched.push(instance),
                Err(e) => warn!(gateway_id = %id, error = %e, "dropping malformed gateway instance record"),
            }
        }

        let removed: Vec<String> = known.into_iter().filter(|id| !active_ids.contains(id)).collect();

        {
            let mut guard = self.instances.write().unwrap_or_else(|p| p.into_inner());
            for instance in fetched {
                self.ring.add((&instance).into());
                guard.insert(instance.gateway_id.clone(), instance);
            }
            for id in &removed {
                self.ring.remove(id);
                guard.remove(id);
            }
        }

        Ok(())
    }

    /// Spawns a background task that calls [`Self::sync_once`] on the
    /// locator's re-sync interval until `shutdown` resolves.
    pub fn spawn_sync_loop(self: &Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>)
    where
        K: 'static,
    {
        let locator = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(imss_protocol::LOCATOR_SYNC_INTERVAL_SECS));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = locator.sync_once().await {
                            warn!(error = %e, "locator sync failed");
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

    /// # Errors
    /// Returns [`CoreError::Delivery`] if no gateway is currently active.
    pub fn gateway_for(&self, user_id: i64) -> Result<GatewayInstance> {
        self.locate(&format!("user:{user_id}"))
    }

    /// # Errors
    /// Returns [`CoreError::Delivery`] if no gateway is currently active.
    pub fn gateway_for_room(&self, room_id: i64) -> Result<GatewayInstance> {
        self.locate(&format!("room:{room_id}"))
    }

    fn locate(&self, key: &str) -> Result<GatewayInstance> {
        let member = self.ring.locate(key).map_err(|e| CoreError::Delivery(e.to_string()))?;
        let guard = self.instances.read().unwrap_or_else(|p| p.into_inner());
        guard
            .get(&member.name)
            .cloned()
            .ok_or_else(|| CoreError::Delivery(format!("ring member {} has no instance record", member.name)))
    }

    #[must_use]
    pub fn all_active(&self) -> Vec<GatewayInstance> {
        let guard = self.instances.read().unwrap_or_else(|p| p.into_inner());
        guard.values().cloned().collect()
    }

    #[must_use]
    pub fn stats(&self) -> LocatorStats {
        LocatorStats {
            active_gateways: self.instances.read().unwrap_or_else(|p| p.into_inner()).len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imss_kv_store::FakeKvStore;

    async fn register(kv: &FakeKvStore, instance: &GatewayInstance) {
        kv.hmset(
            &kv_keys::gateway_instance(&instance.gateway_id),
            &[("host", instance.host.as_str()), ("port", "9000"), ("startedAtUnix", "1000")],
        )
        .await
        .unwrap();
        kv.z_add(kv_keys::ACTIVE_GATEWAYS, now_unix() as f64, &instance.gateway_id).await.unwrap();
    }

    #[tokio::test]
    async fn sync_picks_up_newly_active_gateways() {
        let kv = Arc::new(FakeKvStore::new());
        let ring = Arc::new(HashRing::default());
        let locator = SessionLocator::new(kv.clone(), ring);

        let gw = GatewayInstance::new("gw-1", "10.0.0.1", 9000, now_unix());
        register(&kv, &gw).await;

        locator.sync_once().await.unwrap();
        assert_eq!(locator.stats().active_gateways, 1);
        assert!(locator.gateway_for(42).is_ok());
    }

    #[tokio::test]
    async fn lookup_without_any_sync_errors() {
        let kv = Arc::new(FakeKvStore::new());
        let ring = Arc::new(HashRing::default());
        let locator = SessionLocator::new(kv, ring);
        assert!(locator.gateway_for(1).is_err());
    }

    #[tokio::test]
    async fn sync_removes_gateways_that_fall_out_of_window() {
        let kv = Arc::new(FakeKvStore::new());
        let ring = Arc::new(HashRing::default());
        let locator = SessionLocator::new(kv.clone(), ring);

        let gw = GatewayInstance::new("gw-1", "10.0.0.1", 9000, now_unix());
        register(&kv, &gw).await;
        locator.sync_once().await.unwrap();
        assert_eq!(locator.stats().active_gateways, 1);

        kv.z_rem(kv_keys::ACTIVE_GATEWAYS, "gw-1").await.unwrap();
        locator.sync_once().await.unwrap();
        assert_eq!(locator.stats().active_gateways, 0);
        assert!(locator.gateway_for(42).is_err());
    }

    #[tokio::test]
    async fn gateway_for_room_hashes_a_distinct_keyspace() {
        let kv = Arc::new(FakeKvStore::new());
        let ring = Arc::new(HashRing::default());
        let locator = SessionLocator::new(kv.clone(), ring);
        for id in ["gw-1", "gw-2", "gw-3"] {
            register(&kv, &GatewayInstance::new(id, "10.0.0.1", 9000, now_unix())).await;
        }
        locator.sync_once().await.unwrap();
        assert!(locator.gateway_for_room(7).is_ok());
    }
}
