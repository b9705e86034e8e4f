//! The Social/Message/User collaborators named out-of-scope by this system
//! (§1), modeled as async traits bundled into a [`Services`] struct with
//! `Noop*` fallbacks — grounded directly on `moltis_service_traits`'s
//! `Services`/`Noop*` pattern. This lets [`crate::orchestrator`] be exercised
//! in tests without a live Social/Message/User deployment, and lets a real
//! deployment wire in RPC-backed implementations behind the same trait.

use std::sync::Arc;

use async_trait::async_trait;
use imss_protocol::Message;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Message(String),
    #[error("service unavailable: {0}")]
    Unavailable(String),
}

impl ServiceError {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

/// `Social.ValidateFriendship`/`ValidateGroupMember`/`GetGroupMemberIDs`.
#[async_trait]
pub trait SocialService: Send + Sync {
    async fn validate_friendship(&self, user_id: i64, friend_id: i64) -> ServiceResult<bool>;
    async fn validate_group_member(&self, group_id: i64, user_id: i64) -> ServiceResult<bool>;
    async fn get_group_member_ids(&self, group_id: i64) -> ServiceResult<Vec<i64>>;
}

/// Rejects everything: a deployment with no Social service wired in cannot
/// authorize any send, which is the safe default.
pub struct NoopSocialService;

#[async_trait]
impl SocialService for NoopSocialService {
    async fn validate_friendship(&self, _user_id: i64, _friend_id: i64) -> ServiceResult<bool> {
        Ok(false)
    }

    async fn validate_group_member(&self, _group_id: i64, _user_id: i64) -> ServiceResult<bool> {
        Ok(false)
    }

    async fn get_group_member_ids(&self, _group_id: i64) -> ServiceResult<Vec<i64>> {
        Ok(Vec::new())
    }
}

/// `Message.SendWSMessage`/`GetHistoryMessages`/`MarkMessagesAsRead`. The
/// primary archival path goes through the durable log directly; this trait
/// only covers the legacy direct-store call and the read-side queries named
/// in §6.
#[async_trait]
pub trait MessageService: Send + Sync {
    async fn send_ws_message(&self, message: &Message) -> ServiceResult<i64>;
    async fn get_history_messages(&self, user_id: i64, group_id: i64, page: u32, size: u32) -> ServiceResult<(Vec<Message>, u64)>;
    async fn mark_messages_as_read(&self, user_id: i64, message_ids: &[i64]) -> ServiceResult<()>;
}

pub struct NoopMessageService;

#[async_trait]
impl MessageService for NoopMessageService {
    async fn send_ws_message(&self, _message: &Message) -> ServiceResult<i64> {
        Err(ServiceError::Unavailable("message service not configured".to_string()))
    }

    async fn get_history_messages(&self, _user_id: i64, _group_id: i64, _page: u32, _size: u32) -> ServiceResult<(Vec<Message>, u64)> {
        Ok((Vec::new(), 0))
    }

    async fn mark_messages_as_read(&self, _user_id: i64, _message_ids: &[i64]) -> ServiceResult<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct UserProfile {
    pub user_id: i64,
    pub display_name: String,
}

/// `User.GetUser`.
#[async_trait]
pub trait UserService: Send + Sync {
    async fn get_user(&self, user_id: i64) -> ServiceResult<Option<UserProfile>>;
}

pub struct NoopUserService;

#[async_trait]
impl UserService for NoopUserService {
    async fn get_user(&self, _user_id: i64) -> ServiceResult<Option<UserProfile>> {
        Ok(None)
    }
}

/// Bundles the collaborators the orchestrator depends on behind `Arc<dyn _>`
/// so a real deployment can swap in RPC-backed implementations without
/// touching [`crate::orchestrator::ProcessMessage`].
pub struct Services {
    pub social: Arc<dyn SocialService>,
    pub message: Arc<dyn MessageService>,
    pub user: Arc<dyn UserService>,
}

impl Default for Services {
    fn default() -> Self {
        Self {
            social: Arc::new(NoopSocialService),
            message: Arc::new(NoopMessageService),
            user: Arc::new(NoopUserService),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_social_service_rejects_all_authorization() {
        let social = NoopSocialService;
        assert!(!social.validate_friendship(1, 2).await.unwrap());
        assert!(!social.validate_group_member(10, 1).await.unwrap());
    }
}
