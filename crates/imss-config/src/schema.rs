//! Configuration schema (server bind, KV/broker addresses, ring parameters,
//! heartbeat window, dedup TTLs, instance id). Corresponds to the gateway
//! and logic processes' `--config` surface.

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImssConfig {
    pub server: ServerConfig,
    pub kv: KvConfig,
    pub broker: BrokerConfig,
    pub ring: RingConfig,
    pub heartbeat: HeartbeatConfig,
    pub dedup: DedupConfig,
    pub instance_id: String,
}

impl Default for ImssConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            kv: KvConfig::default(),
            broker: BrokerConfig::default(),
            ring: RingConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            dedup: DedupConfig::default(),
            instance_id: "gw-1".into(),
        }
    }
}

/// Gateway bind address/port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Advertised host for heartbeat registration, if different from `bind`.
    pub advertise_host: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: "0.0.0.0".into(), port: 8080, advertise_host: None }
    }
}

/// KV/heartbeat store connection (redis-compatible).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KvConfig {
    pub url: String,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self { url: "redis://127.0.0.1:6379".into() }
    }
}

/// Durable log / broker connection (kafka-compatible).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub bootstrap_servers: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self { bootstrap_servers: "127.0.0.1:9092".into() }
    }
}

/// Consistent-hash ring parameters: partitions (P), replicas (R), load
/// factor (L). Defaults match `imss_hash_ring`'s own defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    pub partitions: u32,
    pub replicas: u32,
    pub load_factor: f64,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            partitions: imss_hash_ring::DEFAULT_PARTITIONS,
            replicas: imss_hash_ring::DEFAULT_REPLICAS,
            load_factor: imss_hash_ring::DEFAULT_LOAD_FACTOR,
        }
    }
}

/// Heartbeat window (membership sliding window, W) and related intervals.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub window_secs: i64,
    pub interval_secs: u64,
    pub locator_sync_interval_secs: u64,
    pub leader_lock_ttl_secs: i64,
    pub leader_election_interval_secs: u64,
    pub cleaner_purge_interval_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            window_secs: imss_protocol::MEMBERSHIP_WINDOW_SECS,
            interval_secs: imss_protocol::HEARTBEAT_INTERVAL_SECS,
            locator_sync_interval_secs: imss_protocol::LOCATOR_SYNC_INTERVAL_SECS,
            leader_lock_ttl_secs: imss_protocol::LEADER_LOCK_TTL_SECS,
            leader_election_interval_secs: imss_protocol::LEADER_ELECTION_INTERVAL_SECS,
            cleaner_purge_interval_secs: imss_protocol::CLEANER_PURGE_INTERVAL_SECS,
        }
    }
}

/// Dedup TTLs for push delivery and consumer offset replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub push_ttl_secs: i64,
    pub consumer_ttl_secs: i64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            push_ttl_secs: imss_protocol::PUSH_DEDUP_TTL_SECS,
            consumer_ttl_secs: imss_protocol::CONSUMER_DEDUP_TTL_SECS,
        }
    }
}
