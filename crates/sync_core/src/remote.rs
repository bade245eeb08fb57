use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use shared::domain::{SessionId, SyncCursor};
use storage::AuthSession;

use crate::raw::{DiffBatch, HistoryBatch, RawConversation, RawUser};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("remote session is not authorized: {0}")]
    Unauthorized(String),
    #[error("transient remote failure: {0}")]
    Transient(String),
    #[error("remote rejected request: {0}")]
    Rejected(String),
}

impl RemoteError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, RemoteError::Unauthorized(_))
    }
}

/// Addressable remote peer. Channel-style peers always carry their access hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerRef {
    User {
        id: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        access_hash: Option<i64>,
    },
    Chat {
        id: i64,
    },
    Channel {
        id: i64,
        access_hash: i64,
    },
}

impl PeerRef {
    pub fn id(&self) -> i64 {
        match *self {
            PeerRef::User { id, .. } | PeerRef::Chat { id } | PeerRef::Channel { id, .. } => id,
        }
    }
}

/// Everything needed to open a remote session on behalf of one account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub session_id: SessionId,
    pub app_id: i64,
    pub app_hash: String,
    pub phone: String,
    pub session_data: String,
}

impl From<&AuthSession> for Credentials {
    fn from(session: &AuthSession) -> Self {
        Self {
            session_id: session.id,
            app_id: session.app_id,
            app_hash: session.app_hash.clone(),
            phone: session.phone.clone(),
            session_data: session.session_data.clone(),
        }
    }
}

#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Liveness probe: true only if the platform still accepts this session.
    async fn is_live(&self) -> bool;
    async fn self_user(&self) -> Result<RawUser, RemoteError>;
    async fn list_conversations(&self) -> Result<Vec<RawConversation>, RemoteError>;
    /// Newest first. `offset_id` of 0 starts from the latest message.
    async fn fetch_history(
        &self,
        peer: PeerRef,
        limit: u32,
        offset_id: i64,
    ) -> Result<HistoryBatch, RemoteError>;
    async fn fetch_diff(&self, cursor: SyncCursor) -> Result<DiffBatch, RemoteError>;
    async fn fetch_current_state(&self) -> Result<SyncCursor, RemoteError>;
    async fn close(&self);
}

#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn connect(&self, credentials: &Credentials)
        -> Result<Arc<dyn RemoteSession>, RemoteError>;
}

pub struct MissingRemoteConnector;

#[async_trait]
impl RemoteConnector for MissingRemoteConnector {
    async fn connect(
        &self,
        credentials: &Credentials,
    ) -> Result<Arc<dyn RemoteSession>, RemoteError> {
        Err(RemoteError::Transient(format!(
            "no remote connector configured for session {}",
            credentials.session_id
        )))
    }
}
