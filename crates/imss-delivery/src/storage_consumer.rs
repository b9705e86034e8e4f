use std::sync::Arc;

use async_trait::async_trait;
use imss_durable_log::{ConsumedRecord, ConsumerHandler, LogError};
use imss_protocol::DownlinkEvent;
use tracing::warn;

use crate::message_store::SqlMessageStore;

/// Consumes `message_persistence_log` (§4.9): decodes the archival envelope
/// and performs an optimistic insert. A duplicate `messageId` is success
/// (the store's unique index provides idempotency); any other store error
/// leaves the offset unacknowledged, causing redelivery. A `messageId == 0`
/// indicates an upstream bug and is dropped with an error log rather than
/// redelivered forever.
pub struct StorageConsumerHandler {
    store: Arc<SqlMessageStore>,
}

impl StorageConsumerHandler {
    #[must_use]
    pub fn new(store: Arc<SqlMessageStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ConsumerHandler for StorageConsumerHandler {
    async fn handle(&self, record: ConsumedRecord) -> Result<(), LogError> {
        let event: DownlinkEvent = match serde_json::from_slice(&record.value) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "malformed archival envelope, dropping");
                return Ok(());
            },
        };

        let DownlinkEvent::ArchiveMessage { message, .. } = event else {
            warn!("archival consumer received a non-archive event, dropping");
            return Ok(());
        };

        if message.message_id == 0 {
            warn!("dropping archival record with messageId == 0 (upstream bug)");
            return Ok(());
        }

        self.store.insert_if_absent(&message).await.map_err(|e| LogError::Broker(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imss_protocol::{Message, MessageStatus, MessageType};
    use sqlx::SqlitePool;

    fn event(message_id: i64) -> Vec<u8> {
        let message = Message {
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
        };
        serde_json::to_vec(&DownlinkEvent::ArchiveMessage { message, published_at_unix: 1_000 }).unwrap()
    }

    fn record(message_id: i64) -> ConsumedRecord {
        ConsumedRecord { topic: "message_persistence_log".to_string(), partition: 0, offset: 0, key: message_id.to_string(), value: event(message_id) }
    }

    #[tokio::test]
    async fn duplicate_archival_record_is_idempotent() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        SqlMessageStore::init(&pool).await.unwrap();
        let handler = StorageConsumerHandler::new(Arc::new(SqlMessageStore::new(pool)));

        handler.handle(record(1)).await.unwrap();
        handler.handle(record(1)).await.unwrap();
    }

    #[tokio::test]
    async fn zero_message_id_is_dropped_not_errored() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        SqlMessageStore::init(&pool).await.unwrap();
        let handler = StorageConsumerHandler::new(Arc::new(SqlMessageStore::new(pool)));
        handler.handle(record(0)).await.unwrap();
    }
}
