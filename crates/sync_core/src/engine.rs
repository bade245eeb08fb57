use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use shared::domain::{SyncCursor, UserId};
use storage::{ConversationRecord, MessageRecord, Storage};

use crate::{
    clock::Clock,
    error::SyncError,
    normalize::{conversation_of, normalize_conversation, normalize_message},
    peer::{self, PeerError},
    raw::SenderDirectory,
    remote::RemoteSession,
    watermark::{self, WatermarkReport},
};

pub const SCHEDULED_HISTORY_LIMIT: u32 = 50;
pub const ON_DEMAND_HISTORY_LIMIT: u32 = 100;
pub const DEFAULT_HISTORY_DELAY: Duration = Duration::from_secs(1);

/// What triggered a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassMode {
    /// Periodic or startup pass: bootstrap only when no checkpoint exists.
    Scheduled,
    /// Operator "sync now": always a full listing with a deeper history window.
    OnDemand,
}

impl PassMode {
    pub fn history_limit(self) -> u32 {
        match self {
            PassMode::Scheduled => SCHEDULED_HISTORY_LIMIT,
            PassMode::OnDemand => ON_DEMAND_HISTORY_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassKind {
    Bootstrap,
    Incremental,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassReport {
    pub kind: PassKind,
    pub conversations: usize,
    pub messages: usize,
    /// Conversations that could not be addressed and were left alone.
    pub skipped: usize,
    /// Units (messages, conversations, the diff call) that failed and were absorbed.
    pub errors: usize,
    pub cursor: Option<SyncCursor>,
    pub watermark: WatermarkReport,
}

impl PassReport {
    fn new(kind: PassKind) -> Self {
        Self {
            kind,
            conversations: 0,
            messages: 0,
            skipped: 0,
            errors: 0,
            cursor: None,
            watermark: WatermarkReport::default(),
        }
    }
}

#[derive(Clone)]
pub struct SyncEngine {
    storage: Storage,
    clock: Arc<dyn Clock>,
    history_delay: Duration,
}

impl SyncEngine {
    pub fn new(storage: Storage, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            clock,
            history_delay: DEFAULT_HISTORY_DELAY,
        }
    }

    pub fn with_history_delay(mut self, delay: Duration) -> Self {
        self.history_delay = delay;
        self
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// One synchronization pass for `user_id` over an already validated
    /// session, followed by the watermark resync of channel-style conversations.
    pub async fn run_pass(
        &self,
        session: &dyn RemoteSession,
        cancel: &CancellationToken,
        user_id: UserId,
        mode: PassMode,
    ) -> Result<PassReport, SyncError> {
        let cursor = self.storage.get_sync_cursor(user_id).await?;
        let kind = if mode == PassMode::OnDemand || cursor.is_zero() {
            PassKind::Bootstrap
        } else {
            PassKind::Incremental
        };
        info!(user_id = user_id.0, ?kind, ?mode, %cursor, "sync pass starting");

        let mut report = PassReport::new(kind);
        match kind {
            PassKind::Bootstrap => {
                self.bootstrap(session, cancel, user_id, cursor, mode.history_limit(), &mut report)
                    .await?
            }
            PassKind::Incremental => {
                self.incremental(session, cancel, user_id, cursor, &mut report)
                    .await?
            }
        }

        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled(user_id));
        }
        report.watermark = watermark::resync_user(&self.storage, session, cancel, user_id).await?;
        self.storage
            .mark_user_synced(user_id, self.clock.now())
            .await?;

        info!(
            user_id = user_id.0,
            ?kind,
            conversations = report.conversations,
            messages = report.messages,
            errors = report.errors,
            watermark_stored = report.watermark.stored,
            "sync pass finished"
        );
        Ok(report)
    }

    async fn bootstrap(
        &self,
        session: &dyn RemoteSession,
        cancel: &CancellationToken,
        user_id: UserId,
        stored: SyncCursor,
        limit: u32,
        report: &mut PassReport,
    ) -> Result<(), SyncError> {
        let listing = session
            .list_conversations()
            .await
            .map_err(|err| SyncError::from_remote(user_id, err))?;

        let mut conversations = Vec::with_capacity(listing.len());
        for raw in &listing {
            let Some(record) = normalize_conversation(raw, user_id) else {
                debug!(user_id = user_id.0, "bootstrap: unsupported dialog skipped");
                continue;
            };
            match self.storage.upsert_conversation(&record).await {
                Ok(()) => conversations.push(record),
                Err(err) => {
                    warn!(user_id = user_id.0, conversation_id = record.id.0, error = %err, "bootstrap: failed to store conversation");
                    report.errors += 1;
                }
            }
        }
        report.conversations = conversations.len();

        for (index, conversation) in conversations.iter().enumerate() {
            if cancel.is_cancelled() {
                info!(user_id = user_id.0, done = index, "bootstrap: cancelled between conversations");
                return Err(SyncError::Cancelled(user_id));
            }
            if index > 0 {
                self.clock.sleep(self.history_delay).await;
            }
            match self
                .sync_history(session, user_id, conversation, limit, report)
                .await
            {
                Ok(stored) => report.messages += stored,
                Err(SyncError::Peer(PeerError::MissingAccessHash { .. })) => {
                    debug!(user_id = user_id.0, conversation_id = conversation.id.0, "bootstrap: no access hash, skipping history");
                    report.skipped += 1;
                }
                Err(err) if err.is_unauthorized() => return Err(err),
                Err(err) => {
                    warn!(user_id = user_id.0, conversation_id = conversation.id.0, error = %err, "bootstrap: history fetch failed");
                    report.errors += 1;
                }
            }
        }

        let state = match session.fetch_current_state().await {
            Ok(state) => state,
            Err(err) if err.is_unauthorized() => {
                return Err(SyncError::from_remote(user_id, err));
            }
            Err(err) => {
                warn!(user_id = user_id.0, error = %err, "bootstrap: state snapshot unavailable, cursor left as is");
                report.errors += 1;
                report.cursor = Some(stored);
                return Ok(());
            }
        };

        // A first bootstrap takes the snapshot verbatim; later ones fold it in.
        let next = if stored.is_zero() {
            if state.is_degenerate() {
                warn!(user_id = user_id.0, %state, "bootstrap: remote returned an empty state snapshot");
            }
            state
        } else {
            match stored.advance(&state) {
                Some(next) => next,
                None => {
                    warn!(user_id = user_id.0, %state, "bootstrap: empty state snapshot, keeping cursor");
                    stored
                }
            }
        };
        if next != stored {
            self.storage.set_sync_cursor(user_id, &next).await?;
        }
        report.cursor = Some(next);
        Ok(())
    }

    /// Fetches, normalizes and stores recent history for one conversation;
    /// returns how many messages were written.
    async fn sync_history(
        &self,
        session: &dyn RemoteSession,
        user_id: UserId,
        conversation: &ConversationRecord,
        limit: u32,
        report: &mut PassReport,
    ) -> Result<usize, SyncError> {
        let target = peer::resolve(
            conversation.id,
            conversation.kind,
            conversation.access_hash.as_deref(),
        )?;
        let (_, batch) = peer::fetch_history_for(session, target, limit, 0)
            .await
            .map_err(|err| SyncError::from_remote(user_id, err))?;

        let senders = SenderDirectory::from_users(&batch.users);
        let mut stored = 0;
        let mut newest: Option<MessageRecord> = None;
        for raw in &batch.messages {
            let record = normalize_message(raw, &senders, user_id, conversation.id);
            match self.storage.upsert_message(&record).await {
                Ok(_) => {
                    stored += 1;
                    if newest
                        .as_ref()
                        .map_or(true, |current| record.timestamp >= current.timestamp)
                    {
                        newest = Some(record);
                    }
                }
                Err(err) => {
                    warn!(user_id = user_id.0, conversation_id = conversation.id.0, remote_message_id = raw.id, error = %err, "failed to store message");
                    report.errors += 1;
                }
            }
        }

        if let Some(newest) = newest {
            self.storage
                .update_conversation_preview(user_id, conversation.id, &newest.body, newest.timestamp)
                .await?;
        }
        debug!(user_id = user_id.0, conversation_id = conversation.id.0, fetched = batch.messages.len(), stored, "history synced");
        Ok(stored)
    }

    async fn incremental(
        &self,
        session: &dyn RemoteSession,
        cancel: &CancellationToken,
        user_id: UserId,
        cursor: SyncCursor,
        report: &mut PassReport,
    ) -> Result<(), SyncError> {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled(user_id));
        }
        let diff = match session.fetch_diff(cursor).await {
            Ok(diff) => diff,
            Err(err) if err.is_unauthorized() => {
                return Err(SyncError::from_remote(user_id, err));
            }
            Err(err) => {
                // The watermark pass still runs; the cursor stays where it was.
                warn!(user_id = user_id.0, error = %err, "incremental: diff fetch failed");
                report.errors += 1;
                return Ok(());
            }
        };

        let senders = SenderDirectory::from_users(&diff.users);
        for raw in &diff.messages {
            let conversation_id = match conversation_of(raw) {
                Ok(id) => id,
                Err(err) => {
                    warn!(user_id = user_id.0, remote_message_id = raw.id, error = %err, "incremental: skipping message");
                    report.errors += 1;
                    continue;
                }
            };
            let record = normalize_message(raw, &senders, user_id, conversation_id);
            if let Err(err) = self.storage.upsert_message(&record).await {
                warn!(user_id = user_id.0, conversation_id = conversation_id.0, remote_message_id = raw.id, error = %err, "incremental: failed to store message");
                report.errors += 1;
                continue;
            }
            report.messages += 1;
            if let Err(err) = self
                .storage
                .update_conversation_preview(user_id, conversation_id, &record.body, record.timestamp)
                .await
            {
                warn!(user_id = user_id.0, conversation_id = conversation_id.0, error = %err, "incremental: failed to update preview");
            }
        }

        match cursor.advance(&diff.state) {
            Some(next) => {
                if next != cursor {
                    self.storage.set_sync_cursor(user_id, &next).await?;
                    debug!(user_id = user_id.0, from = %cursor, to = %next, "incremental: cursor advanced");
                }
                report.cursor = Some(next);
            }
            None => {
                debug!(user_id = user_id.0, "incremental: empty state in diff, keeping cursor");
                report.cursor = Some(cursor);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
mod tests;
