use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use imss_common::CoreError;
use imss_kv_store::KvStore;
use imss_protocol::{kv_keys, CLEANER_PURGE_INTERVAL_SECS, LEADER_ELECTION_INTERVAL_SECS, LEADER_LOCK_TTL_SECS, MEMBERSHIP_WINDOW_SECS};
use tracing::{info, warn};

use crate::Result;

fn now_unix() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

/// Leader-elected expired-membership purge (§4.6). Every Logic replica runs
/// one of these; exactly one acts as leader at a time via a TTL'd lock in
/// the KV store. A lost lock demotes the process to follower mid-cycle —
/// any purge already in flight still completes, but no new cycle starts
/// until the lock is re-acquired.
pub struct MembershipCleaner<K: KvStore> {
    kv: Arc<K>,
    self_id: String,
    is_leader: AtomicBool,
}

impl<K: KvStore> MembershipCleaner<K> {
    #[must_use]
    pub fn new(kv: Arc<K>, self_id: impl Into<String>) -> Self {
        Self {
            kv,
            self_id: self_id.into(),
            is_leader: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// One election/refresh attempt. A non-leader tries to acquire the lock;
    /// the current leader refreshes its TTL.
    ///
    /// # Errors
    /// Propagates KV-store errors as [`CoreError::TransientInfra`].
    pub async fn elect_once(&self) -> Result<()> {
        let ttl = Duration::from_secs(LEADER_LOCK_TTL_SECS as u64);
        if self.is_leader() {
            self.kv
                .expire(kv_keys::LOGIC_LEADER_LOCK, ttl)
                .await
                .map_err(|e| CoreError::TransientInfra(e.to_string()))?;
            return Ok(());
        }

        let acquired = self
            .kv
            .set_nx(kv_keys::LOGIC_LEADER_LOCK, &self.self_id, ttl)
            .await
            .map_err(|e| CoreError::TransientInfra(e.to_string()))?;
        if acquired {
            info!(self_id = %self.self_id, "acquired membership cleaner leader lock");
            self.is_leader.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    /// One purge cycle: drops membership entries outside the freshness
    /// window, then deletes any `gateway_instances:*` hash with no matching
    /// membership entry. A no-op for followers.
    ///
    /// # Errors
    /// Propagates KV-store errors as [`CoreError::TransientInfra`].
    pub async fn purge_once(&self) -> Result<usize> {
        if !self.is_leader() {
            return Ok(0);
        }

        let cutoff = (now_unix() - MEMBERSHIP_WINDOW_SECS) as f64;
        let expired = self
            .kv
            .z_range_by_score(kv_keys::ACTIVE_GATEWAYS, 0.0, cutoff)
            .await
            .map_err(|e| CoreError::TransientInfra(e.to_string()))?;
        self.kv
            .z_rem_range_by_score(kv_keys::ACTIVE_GATEWAYS, 0.0, cutoff)
            .await
            .map_err(|e| CoreError::TransientInfra(e.to_string()))?;
        for id in &expired {
            self.kv
                .del(&kv_keys::gateway_instance(id))
                .await
                .map_err(|e| CoreError::TransientInfra(e.to_string()))?;
        }

        let current_members: Vec<String> = self
            .kv
            .z_range_by_score(kv_keys::ACTIVE_GATEWAYS, 0.0, f64::INFINITY)
            .await
            .map_err(|e| CoreError::TransientInfra(e.to_string()))?;
        let all_hashes = self
            .kv
            .keys("gateway_instances:*")
            .await
            .map_err(|e| CoreError::TransientInfra(e.to_string()))?;

        let mut orphans_removed = 0;
        for hash_key in all_hashes {
            let Some(id) = hash_key.strip_prefix("gateway_instances:") else {
                continue;
            };
            if !current_members.iter().any(|m| m == id) {
                self.kv.del(&hash_key).await.map_err(|e| CoreError::TransientInfra(e.to_string()))?;
                orphans_removed += 1;
            }
        }

        Ok(expired.len() + orphans_removed)
    }

    /// Releases the leader lock, if held. Called on graceful shutdown.
    ///
    /// # Errors
    /// Propagates KV-store errors as [`CoreError::TransientInfra`].
    pub async fn release(&self) -> Result<()> {
        if self.is_leader.swap(false, Ordering::SeqCst) {
            self.kv
                .del(kv_keys::LOGIC_LEADER_LOCK)
                .await
                .map_err(|e| CoreError::TransientInfra(e.to_string()))?;
        }
        Ok(())
    }

    /// Spawns the combined election-refresh and purge loop.
    pub fn spawn_loop(self: &Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>)
    where
        K: 'static,
    {
        let cleaner = Arc::clone(self);
        tokio::spawn(async move {
            let mut election = tokio::time::interval(Duration::from_secs(LEADER_ELECTION_INTERVAL_SECS));
            let mut purge = tokio::time::interval(Duration::from_secs(CLEANER_PURGE_INTERVAL_SECS));
            loop {
                tokio::select! {
                    _ = election.tick() => {
                        if let Err(e) = cleaner.elect_once().await {
                            warn!(error = %e, "leader election attempt failed");
                        }
                    }
                    _ = purge.tick() => {
                        match cleaner.purge_once().await {
                            Ok(removed) if removed > 0 => info!(removed, "membership purge cycle removed stale entries"),
                            Ok(_) => {},
                            Err(e) => warn!(error = %e, "membership purge cycle failed"),
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            let _ = cleaner.release().await;
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
    async fn only_one_of_two_replicas_becomes_leader() {
        let kv = Arc::new(FakeKvStore::new());
        let a = MembershipCleaner::new(kv.clone(), "logic-a");
        let b = MembershipCleaner::new(kv.clone(), "logic-b");

        a.elect_once().await.unwrap();
        b.elect_once().await.unwrap();

        assert!(a.is_leader());
        assert!(!b.is_leader());
    }

    #[tokio::test]
    async fn release_allows_a_new_leader_to_be_elected() {
        let kv = Arc::new(FakeKvStore::new());
        let a = MembershipCleaner::new(kv.clone(), "logic-a");
        let b = MembershipCleaner::new(kv.clone(), "logic-b");

        a.elect_once().await.unwrap();
        assert!(a.is_leader());
        a.release().await.unwrap();

        b.elect_once().await.unwrap();
        assert!(b.is_leader());
    }

    #[tokio::test]
    async fn purge_drops_expired_membership_and_orphan_hashes() {
        let kv = Arc::new(FakeKvStore::new());
        let cleaner = MembershipCleaner::new(kv.clone(), "logic-a");
        cleaner.elect_once().await.unwrap();

        kv.z_add(kv_keys::ACTIVE_GATEWAYS, 1.0, "gw-stale").await.unwrap();
        kv.hset(&kv_keys::gateway_instance("gw-stale"), "host", "10.0.0.1").await.unwrap();
        kv.hset(&kv_keys::gateway_instance("gw-orphan"), "host", "10.0.0.2").await.unwrap();

        let removed = cleaner.purge_once().await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(kv.z_card(kv_keys::ACTIVE_GATEWAYS).await.unwrap(), 0);
        assert!(kv.hget_all(&kv_keys::gateway_instance("gw-stale")).await.unwrap().is_empty());
        assert!(kv.hget_all(&kv_keys::gateway_instance("gw-orphan")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn follower_purge_is_a_no_op() {
        let kv = Arc::new(FakeKvStore::new());
        let cleaner = MembershipCleaner::new(kv.clone(), "logic-a");
        kv.z_add(kv_keys::ACTIVE_GATEWAYS, 1.0, "gw-stale").await.unwrap();
        assert_eq!(cleaner.purge_once().await.unwrap(), 0);
        assert_eq!(kv.z_card(kv_keys::ACTIVE_GATEWAYS).await.unwrap(), 1);
    }
}
