use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{AsyncProducer, ConsumedRecord, ConsumerHandler, Record, Result, SyncProducer};

#[derive(Default)]
struct Partition {
    records: Vec<Record>,
}

#[derive(Default)]
struct Topics {
    partitions: HashMap<String, Vec<Partition>>,
}

/// A single-partition-per-topic in-memory broker, shared between a
/// [`FakeProducer`] and [`FakeConsumer`] pair so tests can publish on one
/// handle and drain on the other, exercising offset/redelivery semantics
/// without a live Kafka cluster.
#[derive(Default)]
pub struct FakeBroker {
    topics: Mutex<Topics>,
    committed: Mutex<HashMap<(String, String), i64>>,
}

impl FakeBroker {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    async fn append(&self, topic: &str, record: Record) -> (i32, i64) {
        let mut topics = self.topics.lock().await;
        let partitions = topics.partitions.entry(topic.to_string()).or_insert_with(|| vec![Partition::default()]);
        let partition = &mut partitions[0];
        let offset = partition.records.len() as i64;
        partition.records.push(record);
        (0, offset)
    }

    async fn records_from(&self, topic: &str, offset: i64) -> Vec<ConsumedRecord> {
        let topics = self.topics.lock().await;
        let Some(partitions) = topics.partitions.get(topic) else {
            return Vec::new();
        };
        partitions[0]
            .records
            .iter()
            .enumerate()
            .skip(offset.max(0) as usize)
            .map(|(idx, rec)| ConsumedRecord {
                topic: topic.to_string(),
                partition: 0,
                offset: idx as i64,
                key: rec.key.clone(),
                value: rec.value.clone(),
            })
            .collect()
    }

    async fn committed_offset(&self, topic: &str, group: &str) -> i64 {
        let committed = self.committed.lock().await;
        committed.get(&(topic.to_string(), group.to_string())).copied().unwrap_or(0)
    }

    async fn commit(&self, topic: &str, group: &str, offset: i64) {
        let mut committed = self.committed.lock().await;
        committed.insert((topic.to_string(), group.to_string()), offset + 1);
    }
}

/// In-memory stand-in for both [`SyncProducer`] and [`AsyncProducer`],
/// backed by a shared [`FakeBroker`]. Used in place of the real Kafka
/// clients in unit tests for the Logic Orchestrator and Storage/Push
/// consumers.
pub struct FakeProducer {
    broker: Arc<FakeBroker>,
}

impl FakeProducer {
    #[must_use]
    pub fn new(broker: Arc<FakeBroker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl SyncProducer for FakeProducer {
    async fn send_sync(&self, topic: &str, record: Record) -> Result<(i32, i64)> {
        Ok(self.broker.append(topic, record).await)
    }
}

#[async_trait]
impl AsyncProducer for FakeProducer {
    async fn send_async(&self, topic: &str, record: Record) -> Result<()> {
        self.broker.append(topic, record).await;
        Ok(())
    }
}

/// In-memory consumer that replays unacknowledged records on every `run`
/// call, matching the at-least-once redelivery semantics of the real
/// `KafkaConsumer` when a handler fails.
pub struct FakeConsumer {
    broker: Arc<FakeBroker>,
}

impl FakeConsumer {
    #[must_use]
    pub fn new(broker: Arc<FakeBroker>) -> Self {
        Self { broker }
    }

    /// Drains every currently-uncommitted record once, in order, committing
    /// after each handler success. Returns the number of records for which
    /// the handler returned `Ok`. Unlike [`crate::Consumer::run`] this does
    /// not loop forever, which makes it usable directly from a test body.
    pub async fn drain_once(&self, topic: &str, group: &str, handler: &dyn ConsumerHandler) -> Result<usize> {
        let start = self.broker.committed_offset(topic, group).await;
        let records = self.broker.records_from(topic, start).await;
        let mut delivered = 0;
        for record in records {
            let offset = record.offset;
            if handler.handle(record).await.is_ok() {
                self.broker.commit(topic, group, offset).await;
                delivered += 1;
            } else {
                break;
            }
        }
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        seen: AtomicUsize,
        fail_first: bool,
    }

    #[async_trait]
    impl ConsumerHandler for CountingHandler {
        async fn handle(&self, _record: ConsumedRecord) -> Result<()> {
            let prior = self.seen.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && prior == 0 {
                return Err(crate::LogError::Broker("simulated failure".to_string()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn sync_producer_assigns_increasing_offsets() {
        let broker = FakeBroker::new();
        let producer = FakeProducer::new(broker);
        let (_, first) = producer.send_sync("message_persistence_log", Record::new("conv-1", vec![1])).await.unwrap();
        let (_, second) = producer.send_sync("message_persistence_log", Record::new("conv-1", vec![2])).await.unwrap();
        assert_eq!(first, 0);
        assert_eq!(second, 1);
    }

    #[tokio::test]
    async fn consumer_commits_only_after_handler_success() {
        let broker = FakeBroker::new();
        let producer = FakeProducer::new(broker.clone());
        producer.send_async("push_notifications", Record::new("u-1", vec![9])).await.unwrap();

        let consumer = FakeConsumer::new(broker);
        let handler = CountingHandler { seen: AtomicUsize::new(0), fail_first: true };
        let delivered = consumer.drain_once("push_notifications", "push-group", &handler).await.unwrap();
        assert_eq!(delivered, 0);

        let delivered_retry = consumer.drain_once("push_notifications", "push-group", &handler).await.unwrap();
        assert_eq!(delivered_retry, 1);
    }

    #[tokio::test]
    async fn consumer_groups_track_independent_offsets() {
        let broker = FakeBroker::new();
        let producer = FakeProducer::new(broker.clone());
        producer.send_async("archived_messages", Record::new("conv-1", vec![1])).await.unwrap();

        let consumer = FakeConsumer::new(broker);
        let storage_handler = CountingHandler { seen: AtomicUsize::new(0), fail_first: false };
        let push_handler = CountingHandler { seen: AtomicUsize::new(0), fail_first: false };

        let storage_delivered = consumer.drain_once("archived_messages", "storage-group", &storage_handler).await.unwrap();
        let push_delivered = consumer.drain_once("archived_messages", "push-group", &push_handler).await.unwrap();
        assert_eq!(storage_delivered, 1);
        assert_eq!(push_delivered, 1);
    }
}
