use std::{future::Future, sync::Arc, time::Duration};

use anyhow::Context;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use shared::domain::UserId;

use crate::{
    engine::{PassMode, PassReport, SyncEngine},
    error::SyncError,
    normalize::normalize_user,
    registry::{ConnectionLease, ConnectionRegistry},
    remote::{Credentials, RemoteError},
};

pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum UserSyncError {
    #[error("user {0} has no active session")]
    NoSession(UserId),
    #[error("could not connect for user {user_id}: {source}")]
    Connect {
        user_id: UserId,
        #[source]
        source: RemoteError,
    },
    #[error("session for user {0} failed its liveness probe")]
    NotLive(UserId),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("storage failure: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl UserSyncError {
    /// True when the user was flagged inactive as a result of this failure.
    pub fn deactivated_user(&self) -> bool {
        match self {
            UserSyncError::NotLive(_) => true,
            UserSyncError::Sync(err) => err.is_unauthorized(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub synced: Vec<UserId>,
    pub skipped: Vec<UserId>,
    pub deactivated: Vec<UserId>,
    pub failed: Vec<UserId>,
}

impl TickReport {
    pub fn users(&self) -> usize {
        self.synced.len() + self.skipped.len() + self.deactivated.len() + self.failed.len()
    }
}

pub struct Scheduler {
    engine: SyncEngine,
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
}

impl Scheduler {
    pub fn new(engine: SyncEngine, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            engine,
            registry,
            interval: DEFAULT_SYNC_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Restores the most recently active session, confirms it with a liveness
    /// probe, records the owning account and runs one pass for it.
    pub async fn recover_startup(&self) -> anyhow::Result<Option<UserId>> {
        let storage = self.engine.storage();
        let Some(session) = storage
            .latest_active_session()
            .await
            .context("failed to look up the latest active session")?
        else {
            info!("startup: no active session to restore");
            return Ok(None);
        };

        let credentials = Credentials::from(&session);
        let lease = match self.registry.acquire(&credentials).await {
            Ok(lease) => lease,
            Err(err) => {
                warn!(session_id = session.id.0, error = %err, "startup: failed to restore session");
                return Ok(None);
            }
        };

        if !lease.session().is_live().await {
            warn!(session_id = session.id.0, "startup: restored session is not authorized");
            if let Some(user_id) = session.user_id {
                storage.set_user_active(user_id, false).await?;
            }
            self.retire(lease).await;
            return Ok(None);
        }

        let me = match lease.session().self_user().await {
            Ok(me) => me,
            Err(err) => {
                warn!(session_id = session.id.0, error = %err, "startup: failed to fetch account profile");
                return Ok(None);
            }
        };
        let user = normalize_user(&me);
        storage.upsert_user(&user).await?;
        storage.link_session_user(session.id, user.id).await?;
        info!(user_id = user.id.0, session_id = session.id.0, "startup: session restored");

        match self
            .engine
            .run_pass(lease.session(), lease.cancel_token(), user.id, PassMode::Scheduled)
            .await
        {
            Ok(_) => {}
            Err(err) if err.is_unauthorized() => {
                warn!(user_id = user.id.0, error = %err, "startup: pass rejected, marking user inactive");
                storage.set_user_active(user.id, false).await?;
                self.retire(lease).await;
            }
            Err(err) => warn!(user_id = user.id.0, error = %err, "startup: pass failed"),
        }
        Ok(Some(user.id))
    }

    /// One sequential pass over every active user. Per-user failures never
    /// stop the tick; only failing to list users does.
    pub async fn tick(&self) -> anyhow::Result<TickReport> {
        let users = self
            .engine
            .storage()
            .list_active_users()
            .await
            .context("failed to list active users")?;

        let mut report = TickReport::default();
        for user in users {
            match self.sync_user(user.id, PassMode::Scheduled).await {
                Ok(_) => report.synced.push(user.id),
                Err(err) if err.deactivated_user() => {
                    warn!(user_id = user.id.0, error = %err, "tick: user marked inactive");
                    report.deactivated.push(user.id);
                }
                Err(err @ (UserSyncError::NoSession(_) | UserSyncError::Connect { .. })) => {
                    info!(user_id = user.id.0, reason = %err, "tick: user skipped");
                    report.skipped.push(user.id);
                }
                Err(err) => {
                    warn!(user_id = user.id.0, error = %err, "tick: user pass failed");
                    report.failed.push(user.id);
                }
            }
        }
        info!(
            synced = report.synced.len(),
            skipped = report.skipped.len(),
            deactivated = report.deactivated.len(),
            failed = report.failed.len(),
            "tick complete"
        );
        Ok(report)
    }

    /// On-demand full pass for one user.
    pub async fn sync_now(&self, user_id: UserId) -> Result<PassReport, UserSyncError> {
        self.sync_user(user_id, PassMode::OnDemand).await
    }

    /// Startup recovery, then a tick every interval until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        if let Err(err) = self.until_shutdown(&shutdown, self.recover_startup()).await {
            warn!(error = %err, "startup recovery failed");
        }
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = self.engine.clock().sleep(self.interval) => {}
            }
            if shutdown.is_cancelled() {
                break;
            }
            if let Err(err) = self.until_shutdown(&shutdown, self.tick()).await {
                warn!(error = %err, "tick aborted");
            }
        }
        info!("scheduler stopped");
    }

    /// Drives `work` to completion. If `shutdown` fires first, every lease
    /// token is cancelled so the running pass stops at its next checkpoint.
    async fn until_shutdown<F: Future>(&self, shutdown: &CancellationToken, work: F) -> F::Output {
        tokio::pin!(work);
        tokio::select! {
            biased;
            out = &mut work => return out,
            _ = shutdown.cancelled() => {
                info!("shutdown requested, cancelling in-flight pass");
                self.registry.root_token().cancel();
            }
        }
        work.await
    }

    /// Gives up the lease and drops the session so a revoked login is never reused.
    async fn retire(&self, lease: ConnectionLease) {
        let fingerprint = lease.fingerprint().clone();
        drop(lease);
        self.registry.release(&fingerprint).await;
    }

    async fn sync_user(&self, user_id: UserId, mode: PassMode) -> Result<PassReport, UserSyncError> {
        let storage = self.engine.storage();
        let session = storage
            .active_session_for_user(user_id)
            .await?
            .ok_or(UserSyncError::NoSession(user_id))?;

        let lease = self
            .registry
            .acquire(&Credentials::from(&session))
            .await
            .map_err(|source| UserSyncError::Connect { user_id, source })?;

        if !lease.session().is_live().await {
            storage.set_user_active(user_id, false).await?;
            self.retire(lease).await;
            return Err(UserSyncError::NotLive(user_id));
        }

        let result = self
            .engine
            .run_pass(lease.session(), lease.cancel_token(), user_id, mode)
            .await;
        match result {
            Ok(report) => Ok(report),
            Err(err) => {
                if err.is_unauthorized() {
                    storage.set_user_active(user_id, false).await?;
                    self.retire(lease).await;
                }
                Err(err.into())
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/scheduler_tests.rs"]
mod tests;
