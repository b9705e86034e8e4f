use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::{KvError, KvStore, Message, Result};

fn backend_err(e: redis::RedisError) -> KvError {
    KvError::Backend(e.to_string())
}

/// Redis-backed [`KvStore`]. Grounded on the `redis` crate's `tokio-comp` +
/// `connection-manager` dependency choice lifted from the reference corpus
/// (the teacher crate this workspace grows out of carries no KV-store
/// client of its own).
pub struct RedisKvStore {
    manager: ConnectionManager,
    client: redis::Client,
}

impl RedisKvStore {
    /// # Errors
    /// Returns an error if the Redis URL is malformed or the initial
    /// connection cannot be established.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(backend_err)?;
        let manager = client.get_connection_manager().await.map_err(backend_err)?;
        Ok(Self { manager, client })
    }
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.manager.clone();
        let ok: bool = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<Option<String>>(&mut conn)
            .await
            .map_err(backend_err)?
            .is_some();
        Ok(ok)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.hset(key, field, value).await.map_err(backend_err)?;
        Ok(())
    }

    async fn hmset(&self, key: &str, fields: &[(&str, &str)]) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.hset_multiple(key, fields).await.map_err(backend_err)?;
        Ok(())
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.manager.clone();
        conn.hgetall(key).await.map_err(backend_err)
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.del(key).await.map_err(backend_err)?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.expire(key, ttl.as_secs().max(1) as i64).await.map_err(backend_err)?;
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.manager.clone();
        conn.keys(pattern).await.map_err(backend_err)
    }

    async fn s_add(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.sadd(key, member).await.map_err(backend_err)?;
        Ok(())
    }

    async fn s_rem(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.srem(key, member).await.map_err(backend_err)?;
        Ok(())
    }

    async fn s_is_member(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.manager.clone();
        conn.sismember(key, member).await.map_err(backend_err)
    }

    async fn s_members(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.manager.clone();
        conn.smembers(key).await.map_err(backend_err)
    }

    async fn z_add(&self, key: &str, score: f64, member: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.zadd(key, member, score).await.map_err(backend_err)?;
        Ok(())
    }

    async fn z_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>> {
        let mut conn = self.manager.clone();
        conn.zrangebyscore(key, min, max).await.map_err(backend_err)
    }

    async fn z_rem(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.zrem(key, member).await.map_err(backend_err)?;
        Ok(())
    }

    async fn z_card(&self, key: &str) -> Result<u64> {
        let mut conn = self.manager.clone();
        conn.zcard(key).await.map_err(backend_err)
    }

    async fn z_rem_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<u64> {
        let mut conn = self.manager.clone();
        conn.zrembyscore(key, min, max).await.map_err(backend_err)
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.publish(channel, payload).await.map_err(backend_err)?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, Message>> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(backend_err)?;
        pubsub.subscribe(channel).await.map_err(backend_err)?;
        let stream = pubsub
            .into_on_message()
            .map(|msg| msg.get_payload_bytes().to_vec());
        Ok(Box::pin(stream))
    }
}
