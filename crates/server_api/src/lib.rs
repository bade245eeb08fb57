use std::sync::Arc;

use async_trait::async_trait;
use shared::{
    domain::{ConversationId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{ConversationSummary, MessagePayload, SyncAccepted, UserSummary},
};
use storage::{ConversationRecord, Storage, StoredMessage, UserRecord};
use sync_core::Scheduler;
use tracing::{info, warn};

pub const DEFAULT_MESSAGE_LIMIT: u32 = 50;
pub const MAX_MESSAGE_LIMIT: u32 = 500;

/// Starts an on-demand pass for one account without waiting for it.
#[async_trait]
pub trait SyncTrigger: Send + Sync {
    async fn trigger(&self, user_id: UserId) -> Result<(), ApiError>;
}

pub struct MissingSyncTrigger;

#[async_trait]
impl SyncTrigger for MissingSyncTrigger {
    async fn trigger(&self, _user_id: UserId) -> Result<(), ApiError> {
        Err(ApiError::new(
            ErrorCode::Unavailable,
            "sync scheduler is not running",
        ))
    }
}

/// Runs `Scheduler::sync_now` on a background task.
pub struct SchedulerSyncTrigger {
    scheduler: Arc<Scheduler>,
}

impl SchedulerSyncTrigger {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl SyncTrigger for SchedulerSyncTrigger {
    async fn trigger(&self, user_id: UserId) -> Result<(), ApiError> {
        let scheduler = Arc::clone(&self.scheduler);
        tokio::spawn(async move {
            match scheduler.sync_now(user_id).await {
                Ok(report) => info!(
                    user_id = %user_id,
                    conversations = report.conversations,
                    messages = report.messages,
                    errors = report.errors,
                    "on-demand sync finished"
                ),
                Err(err) => warn!(user_id = %user_id, error = %err, "on-demand sync failed"),
            }
        });
        Ok(())
    }
}

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub sync: Arc<dyn SyncTrigger>,
}

impl ApiContext {
    pub fn new(storage: Storage, sync: Arc<dyn SyncTrigger>) -> Self {
        Self { storage, sync }
    }

    pub fn without_sync(storage: Storage) -> Self {
        Self::new(storage, Arc::new(MissingSyncTrigger))
    }
}

pub async fn list_users(ctx: &ApiContext) -> Result<Vec<UserSummary>, ApiError> {
    let users = ctx.storage.list_users().await.map_err(internal)?;
    Ok(users.into_iter().map(user_summary).collect())
}

pub async fn list_conversations(
    ctx: &ApiContext,
    user_id: UserId,
) -> Result<Vec<ConversationSummary>, ApiError> {
    let conversations = ctx
        .storage
        .list_conversations(user_id)
        .await
        .map_err(internal)?;
    Ok(conversations
        .into_iter()
        .map(conversation_summary)
        .collect())
}

pub async fn list_messages(
    ctx: &ApiContext,
    user_id: UserId,
    conversation_id: ConversationId,
    limit: Option<u32>,
    offset: Option<u32>,
) -> Result<Vec<MessagePayload>, ApiError> {
    let limit = limit.unwrap_or(DEFAULT_MESSAGE_LIMIT);
    if limit == 0 || limit > MAX_MESSAGE_LIMIT {
        return Err(ApiError::new(
            ErrorCode::Validation,
            format!("limit must be between 1 and {MAX_MESSAGE_LIMIT}"),
        ));
    }
    let messages = ctx
        .storage
        .list_messages(user_id, conversation_id, limit, offset.unwrap_or(0))
        .await
        .map_err(internal)?;
    Ok(messages.into_iter().map(message_payload).collect())
}

pub async fn trigger_sync(ctx: &ApiContext, user_id: UserId) -> Result<SyncAccepted, ApiError> {
    let user = ctx
        .storage
        .get_user(user_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found(format!("user {user_id} not found")))?;
    if !user.is_active {
        return Err(ApiError::new(
            ErrorCode::Unauthorized,
            format!("user {user_id} is not authenticated"),
        ));
    }
    ctx.sync.trigger(user_id).await?;
    Ok(SyncAccepted {
        accepted: true,
        user_id,
    })
}

fn user_summary(user: UserRecord) -> UserSummary {
    UserSummary {
        id: user.id,
        first_name: user.first_name,
        last_name: user.last_name,
        username: user.username,
        phone: user.phone,
        is_active: user.is_active,
        last_sync_time: user.last_sync_time,
    }
}

fn conversation_summary(conversation: ConversationRecord) -> ConversationSummary {
    ConversationSummary {
        id: conversation.id,
        user_id: conversation.user_id,
        kind: conversation.kind,
        title: conversation.title,
        username: conversation.username,
        avatar_url: conversation.avatar_url,
        last_message: conversation.last_message,
        last_time: conversation.last_time,
    }
}

fn message_payload(stored: StoredMessage) -> MessagePayload {
    let message = stored.record;
    MessagePayload {
        id: stored.id,
        user_id: message.user_id,
        conversation_id: message.conversation_id,
        remote_message_id: message.remote_message_id,
        sender_id: message.sender_id,
        sender_username: message.sender_username,
        sender_display_name: message.sender_display_name,
        body: message.body,
        kind: message.kind,
        media_url: message.media_url,
        timestamp: message.timestamp,
    }
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::internal(format!("{err:#}"))
}
