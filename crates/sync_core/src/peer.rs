//! Maps stored conversation metadata onto addressable remote peers.

use thiserror::Error;
use tracing::debug;

use shared::domain::{ConversationId, ConversationKind};

use crate::{
    raw::HistoryBatch,
    remote::{PeerRef, RemoteError, RemoteSession},
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeerError {
    #[error("{kind} conversation {conversation_id} has no access hash")]
    MissingAccessHash {
        conversation_id: ConversationId,
        kind: ConversationKind,
    },
    #[error("conversation {conversation_id} has an unparseable access hash '{value}'")]
    InvalidAccessHash {
        conversation_id: ConversationId,
        value: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerTarget {
    Known(PeerRef),
    /// Kind unknown: the peer style has to be discovered with live calls.
    Probe(ConversationId),
}

pub fn resolve(
    conversation_id: ConversationId,
    kind: Option<ConversationKind>,
    access_hash: Option<&str>,
) -> Result<PeerTarget, PeerError> {
    let id = conversation_id.0;
    let hash = access_hash.map(str::trim).filter(|hash| !hash.is_empty());

    let Some(kind) = kind else {
        return Ok(PeerTarget::Probe(conversation_id));
    };

    let peer = match kind {
        ConversationKind::Individual | ConversationKind::Bot => PeerRef::User {
            id,
            access_hash: hash.and_then(|raw| raw.parse().ok()),
        },
        ConversationKind::Channel | ConversationKind::Supergroup => PeerRef::Channel {
            id,
            access_hash: parse_required_hash(conversation_id, kind, hash)?,
        },
        // A group that carries an access hash has been migrated to a supergroup.
        ConversationKind::Group => match hash {
            Some(_) => PeerRef::Channel {
                id,
                access_hash: parse_required_hash(conversation_id, kind, hash)?,
            },
            None => PeerRef::Chat { id },
        },
    };
    Ok(PeerTarget::Known(peer))
}

fn parse_required_hash(
    conversation_id: ConversationId,
    kind: ConversationKind,
    hash: Option<&str>,
) -> Result<i64, PeerError> {
    let raw = hash.ok_or(PeerError::MissingAccessHash {
        conversation_id,
        kind,
    })?;
    raw.parse().map_err(|_| PeerError::InvalidAccessHash {
        conversation_id,
        value: raw.to_string(),
    })
}

/// Candidate addressing styles for a conversation of unknown kind, in the
/// order they are attempted.
pub fn probe_order(conversation_id: ConversationId) -> [PeerRef; 3] {
    let id = conversation_id.0;
    [
        PeerRef::User {
            id,
            access_hash: None,
        },
        PeerRef::Channel { id, access_hash: 0 },
        PeerRef::Chat { id },
    ]
}

/// Fetches history for a conversation of unknown kind by trying each
/// addressing style until a live call succeeds. An authorization failure stops
/// probing immediately; otherwise the last error is returned.
pub async fn fetch_history_probing(
    session: &dyn RemoteSession,
    conversation_id: ConversationId,
    limit: u32,
    offset_id: i64,
) -> Result<(PeerRef, HistoryBatch), RemoteError> {
    let mut last_err = None;
    for peer in probe_order(conversation_id) {
        match session.fetch_history(peer, limit, offset_id).await {
            Ok(batch) => {
                debug!(conversation_id = conversation_id.0, ?peer, "peer probe succeeded");
                return Ok((peer, batch));
            }
            Err(err) if err.is_unauthorized() => return Err(err),
            Err(err) => {
                debug!(conversation_id = conversation_id.0, ?peer, error = %err, "peer probe failed");
                last_err = Some(err);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| {
        RemoteError::Rejected(format!("no peer style accepted conversation {conversation_id}"))
    }))
}

/// Resolves and fetches in one step, probing when the kind is unknown.
pub async fn fetch_history_for(
    session: &dyn RemoteSession,
    target: PeerTarget,
    limit: u32,
    offset_id: i64,
) -> Result<(PeerRef, HistoryBatch), RemoteError> {
    match target {
        PeerTarget::Known(peer) => session
            .fetch_history(peer, limit, offset_id)
            .await
            .map(|batch| (peer, batch)),
        PeerTarget::Probe(conversation_id) => {
            fetch_history_probing(session, conversation_id, limit, offset_id).await
        }
    }
}

#[cfg(test)]
#[path = "tests/peer_tests.rs"]
mod tests;
