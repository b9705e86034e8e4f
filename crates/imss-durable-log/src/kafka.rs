use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer as _, StreamConsumer};
use rdkafka::message::Message as _;
use rdkafka::producer::{FutureProducer, FutureRecord};
use tokio::sync::{mpsc, Mutex};

use crate::{AsyncProducer, ConsumedRecord, Consumer, ConsumerHandler, LogError, Record, Result, SyncProducer};

const PRODUCER_MAX_RETRIES: u32 = 5;
const PRODUCER_BASE_BACKOFF_MS: u64 = 2_000;
const ASYNC_QUEUE_CAPACITY: usize = 10_000;

fn broker_err(e: impl std::fmt::Display) -> LogError {
    LogError::Broker(e.to_string())
}

/// Synchronous reliable producer: publishes and blocks until broker
/// acknowledgment. Used only for `message_persistence_log`.
pub struct KafkaSyncProducer {
    producer: FutureProducer,
}

impl KafkaSyncProducer {
    /// # Errors
    /// Returns an error if the producer configuration is invalid.
    pub fn new(brokers: &str) -> Result<Self> {
        let producer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("message.send.max.retries", PRODUCER_MAX_RETRIES.to_string())
            .create()
            .map_err(broker_err)?;
        Ok(Self { producer })
    }
}

#[async_trait]
impl SyncProducer for KafkaSyncProducer {
    async fn send_sync(&self, topic: &str, record: Record) -> Result<(i32, i64)> {
        let future_record = FutureRecord::to(topic).key(&record.key).payload(&record.value);
        match self.producer.send(future_record, Duration::from_secs(30)).await {
            Ok((partition, offset)) => Ok((partition, offset)),
            Err((err, _)) => Err(broker_err(err)),
        }
    }
}

struct RetryItem {
    topic: String,
    record: Record,
    attempt: u32,
}

/// Async retry producer: buffers in-flight messages; on error enqueues a
/// retry with capped backoff; success/failure handled by a dedicated drain
/// worker. A full queue drops the message with a logged warning rather than
/// applying backpressure to the caller.
pub struct KafkaAsyncProducer {
    producer: FutureProducer,
    retry_tx: mpsc::Sender<RetryItem>,
}

impl KafkaAsyncProducer {
    /// # Errors
    /// Returns an error if the producer configuration is invalid.
    pub fn new(brokers: &str) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .create()
            .map_err(broker_err)?;

        let (retry_tx, retry_rx) = mpsc::channel(ASYNC_QUEUE_CAPACITY);
        let worker_producer = producer.clone();
        tokio::spawn(Self::drain_retries(worker_producer, retry_rx));

        Ok(Self { producer, retry_tx })
    }

    async fn drain_retries(producer: FutureProducer, retry_rx: mpsc::Receiver<RetryItem>) {
        let retry_rx = Arc::new(Mutex::new(retry_rx));
        loop {
            let item = { retry_rx.lock().await.recv().await };
            let Some(item) = item else { break };
            let backoff = Duration::from_millis(PRODUCER_BASE_BACKOFF_MS * u64::from(item.attempt));
            tokio::time::sleep(backoff).await;

            let future_record = FutureRecord::to(&item.topic)
                .key(&item.record.key)
                .payload(&item.record.value);
            if producer.send(future_record, Duration::from_secs(5)).await.is_err() {
                if item.attempt < PRODUCER_MAX_RETRIES {
                    tracing::warn!(topic = %item.topic, attempt = item.attempt, "retrying async publish");
                } else {
                    tracing::warn!(topic = %item.topic, "async publish retries exhausted, dropping message");
                }
            }
        }
    }
}

#[async_trait]
impl AsyncProducer for KafkaAsyncProducer {
    async fn send_async(&self, topic: &str, record: Record) -> Result<()> {
        let future_record = FutureRecord::to(topic).key(&record.key).payload(&record.value);
        if self.producer.send(future_record, Duration::from_secs(0)).await.is_err() {
            let item = RetryItem {
                topic: topic.to_string(),
                record,
                attempt: 1,
            };
            self.retry_tx.try_send(item).map_err(|_| LogError::QueueFull)?;
        }
        Ok(())
    }
}

/// Group-subscribed consumer backed by `rdkafka`'s `StreamConsumer`.
pub struct KafkaConsumer {
    brokers: String,
}

impl KafkaConsumer {
    #[must_use]
    pub fn new(brokers: impl Into<String>) -> Self {
        Self { brokers: brokers.into() }
    }
}

#[async_trait]
impl Consumer for KafkaConsumer {
    async fn run(&self, topic: &str, group: &str, handler: Arc<dyn ConsumerHandler>) -> Result<()> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", group)
            .set("enable.auto.commit", "false")
            .create()
            .map_err(broker_err)?;
        consumer.subscribe(&[topic]).map_err(broker_err)?;

        loop {
            match consumer.recv().await {
                Ok(msg) => {
                    let record = ConsumedRecord {
                        topic: msg.topic().to_string(),
                        partition: msg.partition(),
                        offset: msg.offset(),
                        key: msg.key().map(|k| String::from_utf8_lossy(k).to_string()).unwrap_or_default(),
                        value: msg.payload().unwrap_or_default().to_vec(),
                    };
                    if handler.handle(record).await.is_ok() {
                        if let Err(e) = consumer.commit_message(&msg, CommitMode::Async) {
                            tracing::warn!(error = %e, "failed to commit offset");
                        }
                    }
                    // A handler error leaves the offset uncommitted,
                    // causing redelivery on the next poll/rebalance.
                },
                Err(e) => {
                    tracing::warn!(error = %e, "consumer poll error");
                },
            }
        }
    }
}
