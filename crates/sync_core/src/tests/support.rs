//! Scripted remote collaborator shared by the unit tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use shared::domain::SyncCursor;
use storage::Storage;

use crate::{
    clock::ManualClock,
    raw::{
        DiffBatch, HistoryBatch, RawChannel, RawChat, RawConversation, RawMessage, RawPeer,
        RawUser,
    },
    remote::{Credentials, PeerRef, RemoteConnector, RemoteError, RemoteSession},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStyle {
    User,
    Chat,
    Channel,
}

impl PeerStyle {
    pub fn of(peer: &PeerRef) -> Self {
        match peer {
            PeerRef::User { .. } => PeerStyle::User,
            PeerRef::Chat { .. } => PeerStyle::Chat,
            PeerRef::Channel { .. } => PeerStyle::Channel,
        }
    }
}

#[derive(Default)]
pub struct FakeState {
    pub live: bool,
    pub unauthorized: bool,
    /// The session is revoked right after answering a liveness probe.
    pub revoke_after_probe: bool,
    pub self_user: RawUser,
    pub conversations: Vec<RawConversation>,
    /// Newest first, keyed by peer id.
    pub histories: HashMap<i64, Vec<RawMessage>>,
    pub history_users: Vec<RawUser>,
    /// Peer ids that only answer to one addressing style.
    pub accepted_style: HashMap<i64, PeerStyle>,
    pub failing_history: HashMap<i64, RemoteError>,
    pub diffs: VecDeque<Result<DiffBatch, RemoteError>>,
    pub state: SyncCursor,
    pub state_error: Option<RemoteError>,
    pub history_calls: Vec<(PeerRef, u32)>,
    pub diff_calls: Vec<SyncCursor>,
    pub closed: usize,
}

#[derive(Clone, Default)]
pub struct FakeRemote {
    pub state: Arc<Mutex<FakeState>>,
}

impl FakeRemote {
    pub fn live() -> Self {
        let remote = Self::default();
        remote.with(|s| s.live = true);
        remote
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        f(&mut self.state.lock().expect("fake state"))
    }

    pub fn history_calls(&self) -> Vec<(PeerRef, u32)> {
        self.with(|s| s.history_calls.clone())
    }
}

#[async_trait]
impl RemoteSession for FakeRemote {
    async fn is_live(&self) -> bool {
        self.with(|s| {
            let live = s.live && !s.unauthorized;
            if s.revoke_after_probe {
                s.unauthorized = true;
            }
            live
        })
    }

    async fn self_user(&self) -> Result<RawUser, RemoteError> {
        self.with(|s| {
            if s.unauthorized {
                return Err(RemoteError::Unauthorized("AUTH_KEY_UNREGISTERED".into()));
            }
            Ok(s.self_user.clone())
        })
    }

    async fn list_conversations(&self) -> Result<Vec<RawConversation>, RemoteError> {
        self.with(|s| {
            if s.unauthorized {
                return Err(RemoteError::Unauthorized("AUTH_KEY_UNREGISTERED".into()));
            }
            Ok(s.conversations.clone())
        })
    }

    async fn fetch_history(
        &self,
        peer: PeerRef,
        limit: u32,
        _offset_id: i64,
    ) -> Result<HistoryBatch, RemoteError> {
        self.with(|s| {
            s.history_calls.push((peer, limit));
            if s.unauthorized {
                return Err(RemoteError::Unauthorized("AUTH_KEY_UNREGISTERED".into()));
            }
            if let Some(err) = s.failing_history.get(&peer.id()) {
                return Err(err.clone());
            }
            if let Some(style) = s.accepted_style.get(&peer.id()) {
                if *style != PeerStyle::of(&peer) {
                    return Err(RemoteError::Rejected("PEER_ID_INVALID".into()));
                }
            }
            let messages = s
                .histories
                .get(&peer.id())
                .map(|all| all.iter().take(limit as usize).cloned().collect())
                .unwrap_or_default();
            Ok(HistoryBatch {
                messages,
                users: s.history_users.clone(),
            })
        })
    }

    async fn fetch_diff(&self, cursor: SyncCursor) -> Result<DiffBatch, RemoteError> {
        self.with(|s| {
            s.diff_calls.push(cursor);
            if s.unauthorized {
                return Err(RemoteError::Unauthorized("AUTH_KEY_UNREGISTERED".into()));
            }
            s.diffs.pop_front().unwrap_or_else(|| {
                Ok(DiffBatch {
                    state: SyncCursor::ZERO,
                    ..DiffBatch::default()
                })
            })
        })
    }

    async fn fetch_current_state(&self) -> Result<SyncCursor, RemoteError> {
        self.with(|s| {
            if s.unauthorized {
                return Err(RemoteError::Unauthorized("AUTH_KEY_UNREGISTERED".into()));
            }
            if let Some(err) = &s.state_error {
                return Err(err.clone());
            }
            Ok(s.state)
        })
    }

    async fn close(&self) {
        self.with(|s| s.closed += 1);
    }
}

/// Hands out one scripted remote per credential `session_data`.
#[derive(Clone, Default)]
pub struct FakeConnector {
    pub remotes: Arc<Mutex<HashMap<String, FakeRemote>>>,
    pub connects: Arc<Mutex<Vec<String>>>,
}

impl FakeConnector {
    pub fn register(&self, session_data: &str, remote: FakeRemote) {
        self.remotes
            .lock()
            .expect("remotes")
            .insert(session_data.to_string(), remote);
    }

    pub fn connects(&self) -> Vec<String> {
        self.connects.lock().expect("connects").clone()
    }
}

#[async_trait]
impl RemoteConnector for FakeConnector {
    async fn connect(
        &self,
        credentials: &Credentials,
    ) -> Result<Arc<dyn RemoteSession>, RemoteError> {
        self.connects
            .lock()
            .expect("connects")
            .push(credentials.session_data.clone());
        let remote = self
            .remotes
            .lock()
            .expect("remotes")
            .get(&credentials.session_data)
            .cloned();
        match remote {
            Some(remote) => Ok(Arc::new(remote)),
            None => Err(RemoteError::Transient("connection refused".into())),
        }
    }
}

pub async fn memory_storage() -> Storage {
    Storage::new("sqlite::memory:").await.expect("db")
}

pub fn manual_clock() -> ManualClock {
    ManualClock::starting_at(
        Utc.timestamp_opt(1_700_000_000, 0)
            .single()
            .expect("timestamp"),
    )
}

pub fn text_message(id: i64, peer: RawPeer, text: &str) -> RawMessage {
    RawMessage {
        id,
        peer: Some(peer),
        from: Some(RawPeer::User { user_id: 7 }),
        text: text.to_string(),
        date: 1_700_000_000 + id,
        media: None,
    }
}

/// Newest-first history of plain messages with the given ids.
pub fn history(peer: RawPeer, ids: &[i64]) -> Vec<RawMessage> {
    let mut messages: Vec<_> = ids
        .iter()
        .map(|id| text_message(*id, peer, &format!("message {id}")))
        .collect();
    messages.sort_by(|a, b| b.id.cmp(&a.id));
    messages
}

pub fn raw_user(id: i64, first_name: &str) -> RawUser {
    RawUser {
        id,
        access_hash: Some(id * 10),
        first_name: first_name.to_string(),
        ..RawUser::default()
    }
}

pub fn raw_channel(id: i64, access_hash: i64, broadcast: bool) -> RawChannel {
    RawChannel {
        id,
        access_hash,
        title: format!("channel {id}"),
        username: String::new(),
        broadcast,
        photo_id: None,
    }
}

pub fn raw_chat(id: i64) -> RawChat {
    RawChat {
        id,
        title: format!("chat {id}"),
        photo_id: None,
    }
}

pub fn credentials(session_id: i64, session_data: &str) -> Credentials {
    Credentials {
        session_id: shared::domain::SessionId(session_id),
        app_id: 1,
        app_hash: "app-hash".into(),
        phone: "+100".into(),
        session_data: session_data.to_string(),
    }
}
