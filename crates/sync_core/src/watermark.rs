//! Bounded-lookback resync for channel-style conversations, whose traffic the
//! generic diff stream does not reliably carry.
//!
//! Only the newest [`WATERMARK_WINDOW`] messages are inspected. Anything older
//! that arrived since the previous pass is not backfilled here.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use shared::domain::{ConversationKind, UserId};
use storage::{ConversationRecord, MessageRecord, Storage};

use crate::{
    error::SyncError,
    normalize::normalize_message,
    peer::{self, PeerError, PeerTarget},
    raw::SenderDirectory,
    remote::RemoteSession,
};

pub const WATERMARK_WINDOW: u32 = 50;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatermarkReport {
    pub conversations: usize,
    pub fetched: usize,
    pub stored: usize,
    pub discarded: usize,
    /// Conversations that could not be addressed (no access hash).
    pub skipped: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConversationResync {
    pub watermark: i64,
    pub fetched: usize,
    pub stored: usize,
    pub discarded: usize,
    /// Messages that were fetched above the watermark but could not be stored.
    pub failed: usize,
}

pub fn qualifies(conversation: &ConversationRecord) -> bool {
    match conversation.kind {
        Some(ConversationKind::Channel | ConversationKind::Supergroup) => true,
        Some(ConversationKind::Group) => conversation.access_hash.is_some(),
        _ => false,
    }
}

pub async fn resync_conversation(
    storage: &Storage,
    session: &dyn RemoteSession,
    user_id: UserId,
    conversation: &ConversationRecord,
) -> Result<ConversationResync, SyncError> {
    let peer = match peer::resolve(
        conversation.id,
        conversation.kind,
        conversation.access_hash.as_deref(),
    )? {
        PeerTarget::Known(peer) => peer,
        PeerTarget::Probe(_) => {
            return Err(SyncError::Malformed(format!(
                "conversation {} has no usable kind for watermark resync",
                conversation.id
            )))
        }
    };

    let watermark = storage
        .max_remote_message_id(user_id, conversation.id)
        .await?
        .map(|id| id.0)
        .unwrap_or(0);

    let batch = session
        .fetch_history(peer, WATERMARK_WINDOW, 0)
        .await
        .map_err(|err| SyncError::from_remote(user_id, err))?;
    let senders = SenderDirectory::from_users(&batch.users);

    let mut outcome = ConversationResync {
        watermark,
        fetched: batch.messages.len(),
        ..ConversationResync::default()
    };
    let mut newest: Option<MessageRecord> = None;
    for raw in &batch.messages {
        if watermark != 0 && raw.id <= watermark {
            outcome.discarded += 1;
            continue;
        }
        let record = normalize_message(raw, &senders, user_id, conversation.id);
        match storage.upsert_message(&record).await {
            Ok(_) => {
                outcome.stored += 1;
                if newest
                    .as_ref()
                    .map_or(true, |current| record.timestamp >= current.timestamp)
                {
                    newest = Some(record);
                }
            }
            Err(err) => {
                warn!(
                    user_id = user_id.0,
                    conversation_id = conversation.id.0,
                    remote_message_id = raw.id,
                    error = %err,
                    "watermark: failed to store message"
                );
                outcome.failed += 1;
            }
        }
    }

    if let Some(newest) = newest {
        storage
            .update_conversation_preview(user_id, conversation.id, &newest.body, newest.timestamp)
            .await?;
    }

    debug!(
        user_id = user_id.0,
        conversation_id = conversation.id.0,
        watermark,
        fetched = outcome.fetched,
        stored = outcome.stored,
        "watermark: conversation resynced"
    );
    Ok(outcome)
}

/// Runs the resync for every qualifying conversation of `user_id`, one at a time.
pub async fn resync_user(
    storage: &Storage,
    session: &dyn RemoteSession,
    cancel: &CancellationToken,
    user_id: UserId,
) -> Result<WatermarkReport, SyncError> {
    let conversations = storage.list_conversations(user_id).await?;
    let mut report = WatermarkReport::default();

    for conversation in conversations.iter().filter(|c| qualifies(c)) {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled(user_id));
        }
        report.conversations += 1;
        match resync_conversation(storage, session, user_id, conversation).await {
            Ok(outcome) => {
                report.fetched += outcome.fetched;
                report.stored += outcome.stored;
                report.discarded += outcome.discarded;
                report.errors += outcome.failed;
            }
            Err(SyncError::Peer(PeerError::MissingAccessHash { .. })) => {
                debug!(
                    user_id = user_id.0,
                    conversation_id = conversation.id.0,
                    "watermark: no access hash, skipping"
                );
                report.skipped += 1;
            }
            Err(err) if err.is_unauthorized() => return Err(err),
            Err(err) => {
                warn!(
                    user_id = user_id.0,
                    conversation_id = conversation.id.0,
                    error = %err,
                    "watermark: conversation resync failed"
                );
                report.errors += 1;
            }
        }
    }

    if report.stored > 0 {
        info!(
            user_id = user_id.0,
            conversations = report.conversations,
            stored = report.stored,
            "watermark: new channel messages stored"
        );
    }
    Ok(report)
}

#[cfg(test)]
#[path = "tests/watermark_tests.rs"]
mod tests;
