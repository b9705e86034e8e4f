//! The KV/heartbeat store contract (§4.3): keyed get/set, hash maps,
//! sorted-by-score sets, and pub/sub channels. The Gateway, Session
//! Locator, Heartbeat Manager, and Membership Cleaner are all written
//! against the [`KvStore`] trait so they can run in tests against
//! [`fake::FakeKvStore`] without a live Redis.

mod fake;
mod redis_store;

pub use fake::FakeKvStore;
pub use redis_store::RedisKvStore;

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("kv backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, KvError>;

/// A byte payload delivered on a subscribed channel.
pub type Message = Vec<u8>;

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Atomic create-if-absent.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;
    async fn hmset(&self, key: &str, fields: &[(&str, &str)]) -> Result<()>;
    async fn hget_all(&self, key: &str) -> Result<std::collections::HashMap<String, String>>;
    async fn del(&self, key: &str) -> Result<()>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;
    /// Glob-style key scan, e.g. `conn:*`.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    async fn s_add(&self, key: &str, member: &str) -> Result<()>;
    async fn s_rem(&self, key: &str, member: &str) -> Result<()>;
    async fn s_is_member(&self, key: &str, member: &str) -> Result<bool>;
    async fn s_members(&self, key: &str) -> Result<Vec<String>>;

    async fn z_add(&self, key: &str, score: f64, member: &str) -> Result<()>;
    async fn z_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>>;
    async fn z_rem(&self, key: &str, member: &str) -> Result<()>;
    async fn z_card(&self, key: &str) -> Result<u64>;
    async fn z_rem_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<u64>;

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()>;
    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, Message>>;
}

/// `keys(pattern)` only ever needs to support the simple glob shapes this
/// system's key layout produces (`prefix:*`); this matches Redis `KEYS`
/// close enough for the fake store and for matching remote results locally
/// when the backend doesn't already filter.
pub(crate) fn glob_match(pattern: &str, candidate: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix('*') {
        candidate.starts_with(prefix)
    } else {
        pattern == candidate
    }
}

#[cfg(test)]
mod glob_tests {
    use super::glob_match;

    #[test]
    fn prefix_glob_matches() {
        assert!(glob_match("conn:*", "conn:7:abc"));
        assert!(!glob_match("conn:*", "online_users"));
    }

    #[test]
    fn exact_match_without_wildcard() {
        assert!(glob_match("online_users", "online_users"));
        assert!(!glob_match("online_users", "online_users2"));
    }
}
