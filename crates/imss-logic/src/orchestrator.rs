//! `ProcessMessage` / `HandleMessageAck` (§4.8): authorize, assign an id,
//! commit to the archival log synchronously, then fan out to whichever
//! gateways currently own the recipients.

use std::sync::Arc;

use imss_common::CoreError;
use imss_durable_log::{AsyncProducer, Record, SyncProducer};
use imss_id_gen::IdGenerator;
use imss_kv_store::KvStore;
use imss_locator::SessionLocator;
use imss_protocol::{channels, topics, ClientFrame, DownlinkEvent, GatewayEnvelope, Message, MessageStatus};
use tracing::warn;

use crate::services::{ServiceError, Services};

impl From<ServiceError> for CoreError {
    fn from(err: ServiceError) -> Self {
        CoreError::TransientInfra(err.to_string())
    }
}

/// Aggregate per-recipient fan-out outcome (§4.8 step 5).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub message_id: i64,
    pub success_count: usize,
    pub failure_count: usize,
    pub failed_users: Vec<i64>,
}

/// Ties the ID generator, the Social/Message/User collaborators, the
/// durable log producers, the KV store, and the session locator together
/// into the one operation the rest of the system calls into.
pub struct LogicOrchestrator<K: KvStore> {
    id_gen: Arc<IdGenerator>,
    services: Arc<Services>,
    kv: Arc<K>,
    locator: Arc<SessionLocator<K>>,
    sync_producer: Arc<dyn SyncProducer>,
    async_producer: Arc<dyn AsyncProducer>,
}

impl<K: KvStore> LogicOrchestrator<K> {
    #[must_use]
    pub fn new(
        id_gen: Arc<IdGenerator>,
        services: Arc<Services>,
        kv: Arc<K>,
        locator: Arc<SessionLocator<K>>,
        sync_producer: Arc<dyn SyncProducer>,
        async_producer: Arc<dyn AsyncProducer>,
    ) -> Self {
        Self { id_gen, services, kv, locator, sync_producer, async_producer }
    }

    /// # Errors
    /// - [`CoreError::Validation`] for a frame targeting neither or both of
    ///   `to`/`groupId`.
    /// - [`CoreError::Auth`] if the sender is not authorized to message the
    ///   target.
    /// - [`CoreError::TransientInfra`] on a Social RPC failure.
    /// - [`CoreError::Persistence`] on archival commit failure — fatal, no
    ///   fan-out occurs.
    /// - [`CoreError::InternalInvariant`] if the ID generator itself fails.
    pub async fn process_message(&self, frame: ClientFrame, now: i64) -> Result<ProcessOutcome, CoreError> {
        if !frame.has_valid_target() {
            return Err(CoreError::Validation("frame must target exactly one of to/groupId".to_string()));
        }

        let message_id = if frame.message_id == 0 {
            self.id_gen.next_id().map_err(|e| CoreError::InternalInvariant(e.to_string()))?
        } else {
            frame.message_id
        };

        let recipients = if frame.is_private() {
            if !self.services.social.validate_friendship(frame.from, frame.to).await? {
                return Err(CoreError::Auth(format!("{} and {} are not friends", frame.from, frame.to)));
            }
            vec![frame.to]
        } else {
            if !self.services.social.validate_group_member(frame.group_id, frame.from).await? {
                return Err(CoreError::Auth(format!("{} is not a member of group {}", frame.from, frame.group_id)));
            }
            self.services
                .social
                .get_group_member_ids(frame.group_id)
                .await?
                .into_iter()
                .filter(|id| *id != frame.from)
                .collect()
        };

        let message = Message {
            message_id,
            from: frame.from,
            to: frame.to,
            group_id: frame.group_id,
            content: frame.content,
            message_type: frame.message_type,
            timestamp_unix: frame.timestamp,
            status: MessageStatus::Sent,
            created_at: now,
            updated_at: now,
        };

        self.commit_archival(&message, now).await?;

        let mut outcome = ProcessOutcome { message_id, ..Default::default() };
        for recipient in recipients {
            if self.deliver_to(recipient, &message, now).await {
                outcome.success_count += 1;
            } else {
                outcome.failure_count += 1;
                outcome.failed_users.push(recipient);
            }
        }
        Ok(outcome)
    }

    async fn commit_archival(&self, message: &Message, now: i64) -> Result<(), CoreError> {
        let event = DownlinkEvent::ArchiveMessage { message: message.clone(), published_at_unix: now };
        let payload = serde_json::to_vec(&event).map_err(|e| CoreError::Persistence(e.to_string()))?;
        self.sync_producer
            .send_sync(topics::MESSAGE_PERSISTENCE_LOG, Record::new(message.message_id.to_string(), payload))
            .await
            .map_err(|e| CoreError::Persistence(e.to_string()))?;
        Ok(())
    }

    /// Resolves the recipient's gateway and publishes directly; on any
    /// failure (not located, or publish failure) falls back to the
    /// `downlink_messages` durable topic so the push consumer can retry
    /// later. Returns whether the recipient was delivered to *now*.
    async fn deliver_to(&self, recipient: i64, message: &Message, now: i64) -> bool {
        match self.locator.gateway_for(recipient) {
            Ok(instance) => {
                let envelope = GatewayEnvelope::new_message(message.clone(), recipient, now);
                match envelope.to_wire() {
                    Ok(wire) => {
                        if self.kv.publish(&channels::gateway_user_message(&instance.gateway_id), wire.as_bytes()).await.is_ok() {
                            return true;
                        }
                        warn!(recipient, gateway_id = %instance.gateway_id, "gateway channel publish failed, falling back to downlink log");
                    },
                    Err(e) => warn!(recipient, error = %e, "envelope encode failed, falling back to downlink log"),
                }
            },
            Err(_) => {
                // Recipient is offline or unknown; expected, not logged as an error.
            },
        }

        self.fallback_to_downlink_log(recipient, message, now).await;
        false
    }

    async fn fallback_to_downlink_log(&self, recipient: i64, message: &Message, now: i64) {
        let event = DownlinkEvent::NewMessage { message: message.clone(), target_user: recipient, published_at_unix: now };
        let Ok(payload) = serde_json::to_vec(&event) else {
            warn!(recipient, "failed to encode downlink fallback event");
            return;
        };
        if let Err(e) = self.async_producer.send_async(topics::DOWNLINK_MESSAGES, Record::new(recipient.to_string(), payload)).await {
            warn!(recipient, error = %e, "downlink fallback publish failed, message relies on archival only");
        }
    }

    /// Marks `message_id` read on behalf of `user_id`. Permission
    /// enforcement (recipient or group member) is delegated to the Message
    /// service implementation, which is the only component that knows the
    /// message's `to`/`groupId`.
    ///
    /// # Errors
    /// Propagates the Message service's error as [`CoreError::TransientInfra`].
    pub async fn handle_message_ack(&self, user_id: i64, message_id: i64) -> Result<(), CoreError> {
        self.services.message.mark_messages_as_read(user_id, &[message_id]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{NoopMessageService, NoopUserService, ServiceResult, SocialService};
    use async_trait::async_trait;
    use imss_durable_log::fake::{FakeBroker, FakeProducer};
    use imss_hash_ring::{HashRing, Member};
    use imss_kv_store::FakeKvStore;

    struct AllowAllSocial;

    #[async_trait]
    impl SocialService for AllowAllSocial {
        async fn validate_friendship(&self, _user_id: i64, _friend_id: i64) -> ServiceResult<bool> {
            Ok(true)
        }

        async fn validate_group_member(&self, _group_id: i64, _user_id: i64) -> ServiceResult<bool> {
            Ok(true)
        }

        async fn get_group_member_ids(&self, _group_id: i64) -> ServiceResult<Vec<i64>> {
            Ok(vec![2, 3, 4])
        }
    }

    fn frame(from: i64, to: i64, group_id: i64) -> ClientFrame {
        ClientFrame {
            message_id: 0,
            from,
            to,
            group_id,
            content: "hi".to_string(),
            message_type: imss_protocol::MessageType::Text,
            timestamp: 1_000,
            ack_id: None,
        }
    }

    async fn build_orchestrator(allow: bool) -> (LogicOrchestrator<FakeKvStore>, Arc<FakeKvStore>) {
        let kv = Arc::new(FakeKvStore::new());
        let ring = Arc::new(HashRing::default());
        let locator = Arc::new(SessionLocator::new(kv.clone(), ring));
        let broker = FakeBroker::new();
        let sync_producer = Arc::new(FakeProducer::new(broker.clone()));
        let async_producer = Arc::new(FakeProducer::new(broker));
        let services = Arc::new(Services {
            social: if allow { Arc::new(AllowAllSocial) } else { Arc::new(crate::services::NoopSocialService) },
            message: Arc::new(NoopMessageService),
            user: Arc::new(NoopUserService),
        });
        let id_gen = Arc::new(IdGenerator::new(1).unwrap());
        let orchestrator = LogicOrchestrator::new(id_gen, services, kv.clone(), locator, sync_producer, async_producer);
        (orchestrator, kv)
    }

    #[tokio::test]
    async fn unauthorized_private_message_is_rejected() {
        let (orchestrator, _kv) = build_orchestrator(false).await;
        let err = orchestrator.process_message(frame(1, 2, 0), 1_000).await.unwrap_err();
        assert!(matches!(err, CoreError::Auth(_)));
    }

    #[tokio::test]
    async fn offline_recipient_counts_as_a_failure_but_still_archives() {
        let (orchestrator, _kv) = build_orchestrator(true).await;
        let outcome = orchestrator.process_message(frame(1, 2, 0), 1_000).await.unwrap();
        assert_eq!(outcome.success_count, 0);
        assert_eq!(outcome.failure_count, 1);
        assert_eq!(outcome.failed_users, vec![2]);
    }

    #[tokio::test]
    async fn online_recipient_is_delivered_directly() {
        let (orchestrator, kv) = build_orchestrator(true).await;
        let ring = Arc::new(HashRing::default());
        ring.add(Member { name: "gw-1".to_string(), host: "10.0.0.1".to_string(), port: 9000 });
        let locator = Arc::new(SessionLocator::new(kv.clone(), ring));
        kv.hmset("gateway_instances:gw-1", &[("host", "10.0.0.1"), ("port", "9000"), ("startedAtUnix", "1000")]).await.unwrap();
        kv.z_add("active_gateways", 1_000.0, "gw-1").await.unwrap();
        locator.sync_once().await.unwrap();

        let broker = FakeBroker::new();
        let sync_producer = Arc::new(FakeProducer::new(broker.clone()));
        let async_producer = Arc::new(FakeProducer::new(broker));
        let services = Arc::new(Services { social: Arc::new(AllowAllSocial), message: Arc::new(NoopMessageService), user: Arc::new(NoopUserService) });
        let id_gen = Arc::new(IdGenerator::new(1).unwrap());
        let orchestrator = LogicOrchestrator::new(id_gen, services, kv, locator, sync_producer, async_producer);

        let outcome = orchestrator.process_message(frame(1, 2, 0), 1_000).await.unwrap();
        assert_eq!(outcome.success_count, 1);
        assert_eq!(outcome.failure_count, 0);
    }

    #[tokio::test]
    async fn group_fan_out_excludes_the_sender() {
        let (orchestrator, _kv) = build_orchestrator(true).await;
        let outcome = orchestrator.process_message(frame(1, 0, 99), 1_000).await.unwrap();
        assert_eq!(outcome.failed_users, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn invalid_target_is_rejected_before_id_assignment() {
        let (orchestrator, _kv) = build_orchestrator(true).await;
        let err = orchestrator.process_message(frame(1, 0, 0), 1_000).await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }
}
