use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use imss_durable_log::{ConsumedRecord, ConsumerHandler, LogError};
use imss_kv_store::KvStore;
use imss_protocol::{channels, kv_keys, DownlinkEvent, GatewayEnvelope, CONSUMER_DEDUP_TTL_SECS};
use tracing::warn;

/// Consumes `downlink_messages` (§4.10): resolves the recipient's gateway by
/// reading the KV session row directly (the authoritative, Gateway-written
/// `conn:{userId}:*` hash — not the locator's ring estimate, which can be
/// stale by the time a fallback event is replayed), then publishes to that
/// gateway's channel. A `(partition, offset)` idempotency key suppresses
/// duplicate delivery under consumer-group rebalance.
pub struct PushConsumerHandler<K: KvStore> {
    kv: Arc<K>,
}

impl<K: KvStore> PushConsumerHandler<K> {
    #[must_use]
    pub fn new(kv: Arc<K>) -> Self {
        Self { kv }
    }

    async fn session_gateway_ids(&self, user_id: i64) -> Result<Vec<String>, LogError> {
        let pattern = format!("conn:{user_id}:*");
        let keys = self.kv.keys(&pattern).await.map_err(|e| LogError::Broker(e.to_string()))?;
        let mut gateway_ids = Vec::with_capacity(keys.len());
        for key in keys {
            let fields = self.kv.hget_all(&key).await.map_err(|e| LogError::Broker(e.to_string()))?;
            match fields.get("gatewayId") {
                Some(id) => gateway_ids.push(id.clone()),
                None => warn!(session_key = %key, "session row missing gatewayId field"),
            }
        }
        Ok(gateway_ids)
    }
}

#[async_trait]
impl<K: KvStore> ConsumerHandler for PushConsumerHandler<K> {
    async fn handle(&self, record: ConsumedRecord) -> Result<(), LogError> {
        let dedup_key = kv_keys::consumer_dedup(record.partition, record.offset);
        let first_delivery = self
            .kv
            .set_nx(&dedup_key, "1", Duration::from_secs(CONSUMER_DEDUP_TTL_SECS as u64))
            .await
            .map_err(|e| LogError::Broker(e.to_string()))?;
        if !first_delivery {
            return Ok(());
        }

        let event: DownlinkEvent = match serde_json::from_slice(&record.value) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "malformed downlink envelope, dropping");
                return Ok(());
            },
        };

        let DownlinkEvent::NewMessage { message, target_user, published_at_unix } = event else {
            warn!("push consumer received a non-new-message event, dropping");
            return Ok(());
        };

        let gateway_ids = self.session_gateway_ids(target_user).await?;
        if gateway_ids.is_empty() {
            // Recipient still offline; the event stays durable for a later redelivery.
            return Ok(());
        }

        let envelope = GatewayEnvelope::new_message(message, target_user, published_at_unix);
        let wire = envelope.to_wire().map_err(|e| LogError::Broker(e.to_string()))?;
        for gateway_id in gateway_ids {
            if let Err(e) = self.kv.publish(&channels::gateway_user_message(&gateway_id), wire.as_bytes()).await {
                warn!(gateway_id = %gateway_id, error = %e, "push consumer publish failed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imss_kv_store::FakeKvStore;
    use imss_protocol::{Message, MessageStatus, MessageType};

    fn sample_message(message_id: i64) -> Message {
        Message {
            message_id,
            from: 1,
            to: 2,
            group_id: 0,
            content: "hi".to_string(),
            message_type: MessageType::Text,
            timestamp_unix: 1_000,
            status: MessageStatus::Sent,
            created_at: 1_000,
            updated_at: 1_000,
        }
    }

    fn record(partition: i32, offset: i64, message_id: i64, target_user: i64) -> ConsumedRecord {
        let event = DownlinkEvent::NewMessage { message: sample_message(message_id), target_user, published_at_unix: 1_000 };
        ConsumedRecord {
            topic: "downlink_messages".to_string(),
            partition,
            offset,
            key: target_user.to_string(),
            value: serde_json::to_vec(&event).unwrap(),
        }
    }

    #[tokio::test]
    async fn delivers_to_every_active_session_for_the_recipient() {
        let kv = Arc::new(FakeKvStore::new());
        kv.hset("conn:2:conn-2-a", "gatewayId", "gw-1").await.unwrap();
        kv.hset("conn:2:conn-2-b", "gatewayId", "gw-2").await.unwrap();
        let handler = PushConsumerHandler::new(kv.clone());

        let mut gw1 = kv.subscribe(&channels::gateway_user_message("gw-1")).await.unwrap();
        let mut gw2 = kv.subscribe(&channels::gateway_user_message("gw-2")).await.unwrap();

        handler.handle(record(0, 0, 1, 2)).await.unwrap();

        use futures::StreamExt;
        assert!(gw1.next().await.is_some());
        assert!(gw2.next().await.is_some());
    }

    #[tokio::test]
    async fn offline_recipient_is_a_no_op_not_an_error() {
        let kv = Arc::new(FakeKvStore::new());
        let handler = PushConsumerHandler::new(kv);
        handler.handle(record(0, 0, 1, 999)).await.unwrap();
    }

    #[tokio::test]
    async fn redelivery_of_the_same_offset_is_suppressed() {
        let kv = Arc::new(FakeKvStore::new());
        kv.hset("conn:2:conn-2-a", "gatewayId", "gw-1").await.unwrap();
        let handler = PushConsumerHandler::new(kv.clone());

        let mut gw1 = kv.subscribe(&channels::gateway_user_message("gw-1")).await.unwrap();
        handler.handle(record(0, 5, 1, 2)).await.unwrap();
        handler.handle(record(0, 5, 1, 2)).await.unwrap();

        use futures::StreamExt;
        assert!(gw1.next().await.is_some());
        let second = tokio::time::timeout(Duration::from_millis(50), gw1.next()).await;
        assert!(second.is_err(), "redelivered offset should not publish a second time");
    }
}
