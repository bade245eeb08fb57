//! Remote connections keyed by credential fingerprint.
//!
//! At most `max_live` leases exist at once and at most `max_live` sessions stay
//! open; idle sessions of other credentials are torn down before a new one is
//! connected. Each entry owns a child cancellation token of the registry root
//! that fires when the entry is evicted, released or the registry shuts down.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex as StdMutex},
};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::remote::{Credentials, RemoteConnector, RemoteError, RemoteSession};

const FINGERPRINT_LEN: usize = 22;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CredentialFingerprint(String);

impl CredentialFingerprint {
    pub fn of(credentials: &Credentials) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(credentials.app_id.to_be_bytes());
        hasher.update([0]);
        hasher.update(credentials.app_hash.as_bytes());
        hasher.update([0]);
        hasher.update(credentials.session_data.as_bytes());
        let mut encoded = URL_SAFE_NO_PAD.encode(hasher.finalize());
        encoded.truncate(FINGERPRINT_LEN);
        Self(encoded)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CredentialFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

type SessionSlot = Option<Arc<dyn RemoteSession>>;

struct Entry {
    slot: Arc<Mutex<SessionSlot>>,
    cancel: CancellationToken,
}

pub struct ConnectionRegistry {
    connector: Arc<dyn RemoteConnector>,
    root: CancellationToken,
    max_live: usize,
    leases: Arc<Semaphore>,
    entries: StdMutex<HashMap<CredentialFingerprint, Entry>>,
}

/// Exclusive use of one credential's session. Dropping the lease makes the
/// session available again without closing it.
pub struct ConnectionLease {
    fingerprint: CredentialFingerprint,
    session: Arc<dyn RemoteSession>,
    cancel: CancellationToken,
    _slot: OwnedMutexGuard<SessionSlot>,
    _permit: OwnedSemaphorePermit,
}

impl ConnectionLease {
    pub fn session(&self) -> &dyn RemoteSession {
        self.session.as_ref()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn fingerprint(&self) -> &CredentialFingerprint {
        &self.fingerprint
    }
}

impl ConnectionRegistry {
    pub fn new(connector: Arc<dyn RemoteConnector>, max_live: usize) -> Self {
        let max_live = max_live.max(1);
        Self {
            connector,
            root: CancellationToken::new(),
            max_live,
            leases: Arc::new(Semaphore::new(max_live)),
            entries: StdMutex::new(HashMap::new()),
        }
    }

    pub fn single(connector: Arc<dyn RemoteConnector>) -> Self {
        Self::new(connector, 1)
    }

    pub fn root_token(&self) -> &CancellationToken {
        &self.root
    }

    pub async fn acquire(&self, credentials: &Credentials) -> Result<ConnectionLease, RemoteError> {
        if self.root.is_cancelled() {
            return Err(RemoteError::Transient("connection registry is shut down".into()));
        }
        let permit = self
            .leases
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RemoteError::Transient("connection registry is shut down".into()))?;

        let fingerprint = CredentialFingerprint::of(credentials);
        let (slot, cancel) = self.entry_for(&fingerprint);
        let mut guard = slot.lock_owned().await;

        let session = match guard.as_ref() {
            Some(session) => session.clone(),
            None => {
                self.evict_idle_for(&fingerprint).await;
                let session = self.connector.connect(credentials).await?;
                info!(fingerprint = %fingerprint, session_id = credentials.session_id.0, "remote session connected");
                *guard = Some(session.clone());
                session
            }
        };

        Ok(ConnectionLease {
            fingerprint,
            session,
            cancel,
            _slot: guard,
            _permit: permit,
        })
    }

    /// Closes and forgets the session for `fingerprint`. Must not be called
    /// while the caller still holds a lease for the same fingerprint.
    pub async fn release(&self, fingerprint: &CredentialFingerprint) {
        let entry = self.lock_entries().remove(fingerprint);
        if let Some(entry) = entry {
            entry.cancel.cancel();
            if let Some(session) = entry.slot.lock().await.take() {
                session.close().await;
            }
            debug!(fingerprint = %fingerprint, "remote session released");
        }
    }

    pub async fn shutdown(&self) {
        self.root.cancel();
        self.leases.close();
        let entries: Vec<_> = self.lock_entries().drain().collect();
        for (fingerprint, entry) in entries {
            if let Some(session) = entry.slot.lock().await.take() {
                session.close().await;
            }
            debug!(fingerprint = %fingerprint, "remote session closed on shutdown");
        }
        info!("connection registry shut down");
    }

    pub fn live_sessions(&self) -> usize {
        self.lock_entries()
            .values()
            .filter(|entry| match entry.slot.try_lock() {
                Ok(slot) => slot.is_some(),
                Err(_) => true,
            })
            .count()
    }

    fn entry_for(
        &self,
        fingerprint: &CredentialFingerprint,
    ) -> (Arc<Mutex<SessionSlot>>, CancellationToken) {
        let mut entries = self.lock_entries();
        let entry = entries.entry(fingerprint.clone()).or_insert_with(|| Entry {
            slot: Arc::new(Mutex::new(None)),
            cancel: self.root.child_token(),
        });
        if entry.cancel.is_cancelled() {
            entry.cancel = self.root.child_token();
        }
        (entry.slot.clone(), entry.cancel.clone())
    }

    /// Tears down idle sessions of other credentials until a new connection
    /// fits under `max_live`.
    async fn evict_idle_for(&self, keep: &CredentialFingerprint) {
        let mut busy = 0;
        let mut idle = Vec::new();
        {
            let entries = self.lock_entries();
            for (fingerprint, entry) in entries.iter() {
                if fingerprint == keep {
                    continue;
                }
                match entry.slot.clone().try_lock_owned() {
                    Ok(slot) if slot.is_some() => {
                        idle.push((fingerprint.clone(), slot, entry.cancel.clone()))
                    }
                    Ok(_) => {}
                    Err(_) => busy += 1,
                }
            }
        }

        let mut live = busy + idle.len();
        for (fingerprint, mut slot, cancel) in idle {
            if live < self.max_live {
                break;
            }
            cancel.cancel();
            if let Some(session) = slot.take() {
                session.close().await;
            }
            live -= 1;
            info!(fingerprint = %fingerprint, "idle remote session evicted");
        }
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<CredentialFingerprint, Entry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod tests;
