use thiserror::Error;

use shared::domain::UserId;

use crate::{peer::PeerError, remote::RemoteError};

#[derive(Debug, Error)]
pub enum SyncError {
    /// The platform rejected the session; the owning user must be flagged inactive.
    #[error("remote session for user {user_id} is no longer authorized: {reason}")]
    Unauthorized { user_id: UserId, reason: String },
    #[error("sync pass for user {0} was cancelled")]
    Cancelled(UserId),
    #[error("malformed remote record: {0}")]
    Malformed(String),
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error(transparent)]
    Remote(RemoteError),
    #[error("storage failure: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl SyncError {
    /// Lifts a remote failure into a pass-level error, keeping authorization
    /// failures distinguishable from everything else.
    pub fn from_remote(user_id: UserId, err: RemoteError) -> Self {
        match err {
            RemoteError::Unauthorized(reason) => SyncError::Unauthorized { user_id, reason },
            other => SyncError::Remote(other),
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, SyncError::Unauthorized { .. })
    }
}
