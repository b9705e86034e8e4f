use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{glob_match, KvStore, Message, Result};

#[derive(Default)]
struct Data {
    strings: HashMap<String, String>,
    hashes: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, HashSet<String>>,
    zsets: HashMap<String, Vec<(String, f64)>>,
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<Message>>>,
    /// TTLs tracked per key across all four backing maps above, uniformly —
    /// not just for `strings`. A key set via `expire()` on a hash (e.g. a
    /// `conn:*` session row) must actually expire, the same as a string lock.
    expirations: HashMap<String, Instant>,
}

impl Data {
    fn is_expired(&self, key: &str) -> bool {
        self.expirations.get(key).is_some_and(|at| Instant::now() >= *at)
    }

    fn exists(&self, key: &str) -> bool {
        self.strings.contains_key(key) || self.hashes.contains_key(key) || self.sets.contains_key(key) || self.zsets.contains_key(key)
    }

    /// Drops `key` from every backing map (and its TTL) if its TTL has
    /// elapsed. Called lazily on access, mirroring Redis's own lazy expiry.
    fn purge_if_expired(&mut self, key: &str) {
        if self.is_expired(key) {
            self.strings.remove(key);
            self.hashes.remove(key);
            self.sets.remove(key);
            self.zsets.remove(key);
            self.expirations.remove(key);
        }
    }
}

/// An in-memory [`KvStore`] used by unit tests for the Gateway, Session
/// Locator, Heartbeat Manager, and Membership Cleaner. Not a performance
/// stand-in for Redis — just enough fidelity (TTL expiry, atomic `setNX`,
/// sorted-set range queries) to exercise the real call sites.
#[derive(Default)]
pub struct FakeKvStore {
    data: Mutex<Data>,
}

impl FakeKvStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for FakeKvStore {
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut data = self.data.lock().await;
        data.purge_if_expired(key);
        if data.strings.contains_key(key) {
            return Ok(false);
        }
        data.strings.insert(key.to_string(), value.to_string());
        data.expirations.insert(key.to_string(), Instant::now() + ttl);
        Ok(true)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut data = self.data.lock().await;
        data.purge_if_expired(key);
        data.hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hmset(&self, key: &str, fields: &[(&str, &str)]) -> Result<()> {
        let mut data = self.data.lock().await;
        data.purge_if_expired(key);
        let hash = data.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert((*field).to_string(), (*value).to_string());
        }
        Ok(())
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut data = self.data.lock().await;
        data.purge_if_expired(key);
        Ok(data.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut data = self.data.lock().await;
        data.strings.remove(key);
        data.hashes.remove(key);
        data.sets.remove(key);
        data.zsets.remove(key);
        data.expirations.remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut data = self.data.lock().await;
        if data.exists(key) {
            data.expirations.insert(key.to_string(), Instant::now() + ttl);
        }
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut data = self.data.lock().await;
        let candidates: Vec<String> =
            data.strings.keys().chain(data.hashes.keys()).chain(data.sets.keys()).chain(data.zsets.keys()).cloned().collect();
        for key in &candidates {
            data.purge_if_expired(key);
        }
        let mut out: Vec<String> = data
            .strings
            .keys()
            .chain(data.hashes.keys())
            .chain(data.sets.keys())
            .chain(data.zsets.keys())
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect();
        out.sort();
        out.dedup();
        Ok(out)
    }

    async fn s_add(&self, key: &str, member: &str) -> Result<()> {
        let mut data = self.data.lock().await;
        data.sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn s_rem(&self, key: &str, member: &str) -> Result<()> {
        let mut data = self.data.lock().await;
        if let Some(set) = data.sets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn s_is_member(&self, key: &str, member: &str) -> Result<bool> {
        let mut data = self.data.lock().await;
        data.purge_if_expired(key);
        Ok(data.sets.get(key).is_some_and(|s| s.contains(member)))
    }

    async fn s_members(&self, key: &str) -> Result<Vec<String>> {
        let mut data = self.data.lock().await;
        data.purge_if_expired(key);
        Ok(data.sets.get(key).cloned().unwrap_or_default().into_iter().collect())
    }

    async fn z_add(&self, key: &str, score: f64, member: &str) -> Result<()> {
        let mut data = self.data.lock().await;
        let set = data.zsets.entry(key.to_string()).or_default();
        set.retain(|(m, _)| m != member);
        set.push((member.to_string(), score));
        Ok(())
    }

    async fn z_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>> {
        let mut data = self.data.lock().await;
        data.purge_if_expired(key);
        let mut members: Vec<(String, f64)> = data
            .zsets
            .get(key)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|(_, score)| *score >= min && *score <= max)
            .collect();
        members.sort_by(|a, b| a.1.total_cmp(&b.1));
        Ok(members.into_iter().map(|(m, _)| m).collect())
    }

    async fn z_rem(&self, key: &str, member: &str) -> Result<()> {
        let mut data = self.data.lock().await;
        if let Some(set) = data.zsets.get_mut(key) {
            set.retain(|(m, _)| m != member);
        }
        Ok(())
    }

    async fn z_card(&self, key: &str) -> Result<u64> {
        let mut data = self.data.lock().await;
        data.purge_if_expired(key);
        Ok(data.zsets.get(key).map_or(0, |s| s.len() as u64))
    }

    async fn z_rem_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<u64> {
        let mut data = self.data.lock().await;
        let Some(set) = data.zsets.get_mut(key) else {
            return Ok(0);
        };
        let before = set.len();
        set.retain(|(_, score)| !(*score >= min && *score <= max));
        Ok((before - set.len()) as u64)
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        let mut data = self.data.lock().await;
        if let Some(subs) = data.subscribers.get_mut(channel) {
            subs.retain(|tx| tx.send(payload.to_vec()).is_ok());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, Message>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut data = self.data.lock().await;
        data.subscribers.entry(channel.to_string()).or_default().push(tx);
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn set_nx_only_succeeds_once() {
        let store = FakeKvStore::new();
        assert!(store.set_nx("lock", "a", Duration::from_secs(60)).await.unwrap());
        assert!(!store.set_nx("lock", "b", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn hash_round_trips() {
        let store = FakeKvStore::new();
        store.hmset("gateway_instances:gw-1", &[("host", "10.0.0.1"), ("port", "9000")]).await.unwrap();
        let fields = store.hget_all("gateway_instances:gw-1").await.unwrap();
        assert_eq!(fields.get("host").map(String::as_str), Some("10.0.0.1"));
        assert_eq!(fields.get("port").map(String::as_str), Some("9000"));
    }

    #[tokio::test]
    async fn set_membership_round_trips() {
        let store = FakeKvStore::new();
        store.s_add("online_users", "7").await.unwrap();
        assert!(store.s_is_member("online_users", "7").await.unwrap());
        store.s_rem("online_users", "7").await.unwrap();
        assert!(!store.s_is_member("online_users", "7").await.unwrap());
    }

    #[tokio::test]
    async fn sorted_set_range_by_score_is_ordered() {
        let store = FakeKvStore::new();
        store.z_add("active_gateways", 100.0, "gw-1").await.unwrap();
        store.z_add("active_gateways", 50.0, "gw-2").await.unwrap();
        store.z_add("active_gateways", 75.0, "gw-3").await.unwrap();
        let members = store.z_range_by_score("active_gateways", 0.0, 1_000.0).await.unwrap();
        assert_eq!(members, vec!["gw-2", "gw-3", "gw-1"]);
    }

    #[tokio::test]
    async fn z_rem_range_by_score_purges_expired_members() {
        let store = FakeKvStore::new();
        store.z_add("active_gateways", 10.0, "gw-1").await.unwrap();
        store.z_add("active_gateways", 200.0, "gw-2").await.unwrap();
        let removed = store.z_rem_range_by_score("active_gateways", 0.0, 100.0).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.z_card("active_gateways").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn keys_glob_matches_prefix() {
        let store = FakeKvStore::new();
        store.hset("conn:7:abc", "gatewayId", "gw-1").await.unwrap();
        store.hset("conn:8:def", "gatewayId", "gw-1").await.unwrap();
        store.hset("gateway_instances:gw-1", "host", "x").await.unwrap();
        let mut keys = store.keys("conn:*").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["conn:7:abc", "conn:8:def"]);
    }

    #[tokio::test]
    async fn publish_delivers_to_subscribers() {
        let store = FakeKvStore::new();
        let mut stream = store.subscribe("gateway:gw-1:user_message").await.unwrap();
        store.publish("gateway:gw-1:user_message", b"hello").await.unwrap();
        let received = stream.next().await.expect("message delivered");
        assert_eq!(received, b"hello");
    }

    #[tokio::test]
    async fn expire_makes_set_nx_succeed_again_after_ttl() {
        let store = FakeKvStore::new();
        assert!(store.set_nx("lock", "a", Duration::from_millis(10)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.set_nx("lock", "b", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn expire_on_a_hash_key_actually_expires_it() {
        let store = FakeKvStore::new();
        store.hmset("conn:7:abc", &[("gatewayId", "gw-1")]).await.unwrap();
        store.expire("conn:7:abc", Duration::from_millis(10)).await.unwrap();
        assert!(!store.hget_all("conn:7:abc").await.unwrap().is_empty());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.hget_all("conn:7:abc").await.unwrap().is_empty());
        assert!(store.keys("conn:*").await.unwrap().is_empty());
    }
}
