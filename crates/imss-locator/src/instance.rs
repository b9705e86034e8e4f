use std::collections::HashMap;

use imss_common::CoreError;
use imss_hash_ring::Member;

/// The gateway instance record (§3): lives in the KV store as a hash, with
/// its liveness tracked separately as a score in the membership sorted set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayInstance {
    pub gateway_id: String,
    pub host: String,
    pub port: u16,
    pub started_at_unix: i64,
    pub last_ping_unix: i64,
}

impl GatewayInstance {
    #[must_use]
    pub fn new(gateway_id: impl Into<String>, host: impl Into<String>, port: u16, now: i64) -> Self {
        Self {
            gateway_id: gateway_id.into(),
            host: host.into(),
            port,
            started_at_unix: now,
            last_ping_unix: now,
        }
    }

    #[must_use]
    pub fn to_hash_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("host", self.host.clone()),
            ("port", self.port.to_string()),
            ("startedAtUnix", self.started_at_unix.to_string()),
        ]
    }

    /// Rebuild an instance from the KV store's `gateway_instances:{id}` hash
    /// plus the membership score, which carries `lastPingUnix` separately.
    ///
    /// # Errors
    /// Returns [`CoreError::InternalInvariant`] if a required field is
    /// missing or unparsable — the hash and the score are written together,
    /// so an incomplete record indicates a bug in the writer, not bad input.
    pub fn from_hash_fields(
        gateway_id: &str,
        fields: &HashMap<String, String>,
        last_ping_unix: i64,
    ) -> Result<Self, CoreError> {
        let host = fields
            .get("host")
            .ok_or_else(|| CoreError::InternalInvariant(format!("gateway {gateway_id} missing host field")))?
            .clone();
        let port: u16 = fields
            .get("port")
            .ok_or_else(|| CoreError::InternalInvariant(format!("gateway {gateway_id} missing port field")))?
            .parse()
            .map_err(|_| CoreError::InternalInvariant(format!("gateway {gateway_id} has non-numeric port")))?;
        let started_at_unix: i64 = fields
            .get("startedAtUnix")
            .ok_or_else(|| CoreError::InternalInvariant(format!("gateway {gateway_id} missing startedAtUnix field")))?
            .parse()
            .map_err(|_| CoreError::InternalInvariant(format!("gateway {gateway_id} has non-numeric startedAtUnix")))?;

        Ok(Self {
            gateway_id: gateway_id.to_string(),
            host,
            port,
            started_at_unix,
            last_ping_unix,
        })
    }
}

impl From<&GatewayInstance> for Member {
    fn from(instance: &GatewayInstance) -> Self {
        Member {
            name: instance.gateway_id.clone(),
            host: instance.host.clone(),
            port: instance.port,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_fields_round_trip() {
        let instance = GatewayInstance::new("gw-1", "10.0.0.1", 9000, 1_000);
        let fields: HashMap<String, String> = instance.to_hash_fields().into_iter().map(|(k, v)| (k.to_string(), v)).collect();
        let rebuilt = GatewayInstance::from_hash_fields("gw-1", &fields, 1_030).expect("parses");
        assert_eq!(rebuilt.host, "10.0.0.1");
        assert_eq!(rebuilt.port, 9000);
        assert_eq!(rebuilt.started_at_unix, 1_000);
        assert_eq!(rebuilt.last_ping_unix, 1_030);
    }

    #[test]
    fn missing_field_is_internal_invariant() {
        let fields = HashMap::new();
        let err = GatewayInstance::from_hash_fields("gw-1", &fields, 0).unwrap_err();
        assert!(matches!(err, CoreError::InternalInvariant(_)));
    }
}
