pub mod chat;
pub mod presence;

use std::sync::Arc;

use chrono::Utc;
use common_infra::metrics::session_metrics;
use serde::{Deserialize, Serialize};
use session_store::{
    ParticipantRef, Session, SessionKind, SessionStatus, SessionStore, SessionWatch, StoreError,
    TxAbort, UpdateError,
};
use thiserror::Error;
use tracing::{debug, info};

pub use chat::ChatChannel;
pub use presence::{PresenceConfig, PresenceEvent, PresenceTracker};

pub const DEFAULT_ACTIVE_THRESHOLD: u32 = 2;

/// What happens to a session when its host departs while others remain.
/// An explicit product decision, configured rather than guessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostLeavePolicy {
    /// The earliest-joined remaining participant becomes host.
    #[serde(rename = "transfer_host")]
    TransferHost,
    /// The session ends for everyone.
    #[serde(rename = "end_for_all")]
    EndForAll,
}

impl Default for HostLeavePolicy {
    fn default() -> Self {
        HostLeavePolicy::TransferHost
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Participant count at which a waiting session becomes active.
    pub active_threshold: u32,
    pub host_leave_policy: HostLeavePolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            active_threshold: DEFAULT_ACTIVE_THRESHOLD,
            host_leave_policy: HostLeavePolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error("session not found")]
    NotFound,
    #[error("session is full")]
    SessionFull,
    #[error("session is not joinable")]
    NotJoinable,
    #[error("only the host may end the session for everyone")]
    NotHost,
    #[error("capacity must be at least 1, got {0}")]
    InvalidCapacity(u32),
    #[error("chat is not enabled for this session")]
    ChatDisabled,
    #[error("session unavailable: {0}")]
    Unavailable(String),
}

fn map_update(err: UpdateError) -> SessionError {
    match err {
        UpdateError::Aborted(TxAbort::SessionFull) => SessionError::SessionFull,
        UpdateError::Aborted(TxAbort::NotHost) => SessionError::NotHost,
        UpdateError::Aborted(
            TxAbort::NotJoinable | TxAbort::Terminal | TxAbort::NotParticipant,
        ) => SessionError::NotJoinable,
        UpdateError::Store(err) => map_store(err),
    }
}

fn map_store(err: StoreError) -> SessionError {
    match err {
        StoreError::NotFound => SessionError::NotFound,
        // Optimistic retries exhausted; the caller sees an unavailable
        // session, not a spurious capacity verdict.
        StoreError::Conflict(attempts) => {
            SessionError::Unavailable(format!("write conflict after {attempts} attempts"))
        }
        StoreError::Unavailable(message) => SessionError::Unavailable(message),
    }
}

/// Session lifecycle state machine: waiting -> active -> ended/cancelled.
/// Every membership or status mutation goes through the store transaction,
/// so a capacity check always sees the snapshot it modifies and concurrent
/// joins cannot overbook.
#[derive(Clone)]
pub struct SessionCoordinator {
    store: Arc<dyn SessionStore>,
    config: CoordinatorConfig,
}

impl SessionCoordinator {
    pub fn new(store: Arc<dyn SessionStore>, config: CoordinatorConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub async fn create(
        &self,
        host: ParticipantRef,
        kind: SessionKind,
        capacity: u32,
    ) -> Result<Session, SessionError> {
        if capacity == 0 {
            return Err(SessionError::InvalidCapacity(capacity));
        }
        let session = Session::new(host, kind, capacity);
        self.store
            .create(session.clone())
            .await
            .map_err(map_store)?;
        session_metrics().inc_sessions_created();
        info!(session = %session.id, ?kind, capacity, "session created");
        Ok(session)
    }

    pub async fn get(&self, session_id: &str) -> Result<Session, SessionError> {
        self.store.get(session_id).await.map_err(map_store)
    }

    pub async fn subscribe(&self, session_id: &str) -> Result<SessionWatch, SessionError> {
        self.store.subscribe(session_id).await.map_err(map_store)
    }

    /// Join only in waiting/active and only under capacity, both checked in
    /// the transaction that inserts the participant. Joining a session the
    /// user is already in refreshes the heartbeat stamp; the keyed set makes
    /// duplicates structurally impossible.
    pub async fn join(
        &self,
        session_id: &str,
        user: ParticipantRef,
    ) -> Result<Session, SessionError> {
        let threshold = self.config.active_threshold;
        let result = self
            .store
            .transactional_update(session_id, &mut |session| {
                if !session.is_joinable() {
                    return Err(TxAbort::NotJoinable);
                }
                if let Some(existing) = session.participants.get_mut(&user.user_id) {
                    existing.last_heartbeat_at = Utc::now();
                    return Ok(());
                }
                if session.is_full() {
                    return Err(TxAbort::SessionFull);
                }
                session
                    .participants
                    .insert(user.user_id.clone(), user.clone());
                if session.status == SessionStatus::Waiting
                    && session.participants.len() as u32 >= threshold
                {
                    session.status = SessionStatus::Active;
                }
                Ok(())
            })
            .await;

        match result {
            Ok(session) => {
                session_metrics().set_active_participants(session.participants.len() as i64);
                info!(session = %session.id, user = %user.user_id, "participant joined");
                Ok(session)
            }
            Err(err) => {
                let mapped = map_update(err);
                if matches!(
                    mapped,
                    SessionError::SessionFull | SessionError::NotJoinable
                ) {
                    session_metrics().inc_joins_rejected();
                }
                Err(mapped)
            }
        }
    }

    /// Remove a participant. An empty session ends (a waiting one is
    /// cancelled); a departing host triggers the configured policy.
    /// Leaving a session the user is not in is a no-op.
    pub async fn leave(&self, session_id: &str, user_id: &str) -> Result<Session, SessionError> {
        let policy = self.config.host_leave_policy;
        let result = self
            .store
            .transactional_update(session_id, &mut |session| {
                if session.status.is_terminal() {
                    return Err(TxAbort::Terminal);
                }
                if session.participants.remove(user_id).is_none() {
                    return Err(TxAbort::NotParticipant);
                }
                if session.participants.is_empty() {
                    session.status = if session.status == SessionStatus::Waiting {
                        SessionStatus::Cancelled
                    } else {
                        SessionStatus::Ended
                    };
                    return Ok(());
                }
                if session.host_id == user_id {
                    match policy {
                        HostLeavePolicy::EndForAll => session.status = SessionStatus::Ended,
                        HostLeavePolicy::TransferHost => {
                            if let Some(next) = session
                                .participants
                                .values()
                                .min_by_key(|p| (p.joined_at, p.user_id.clone()))
                            {
                                session.host_id = next.user_id.clone();
                            }
                        }
                    }
                }
                Ok(())
            })
            .await;

        match result {
            Ok(session) => {
                session_metrics().set_active_participants(session.participants.len() as i64);
                info!(session = %session.id, user = user_id, status = ?session.status, "participant left");
                Ok(session)
            }
            Err(UpdateError::Aborted(TxAbort::NotParticipant)) => {
                debug!(session = session_id, user = user_id, "leave for absent participant");
                self.get(session_id).await
            }
            Err(err) => Err(map_update(err)),
        }
    }

    /// `for_all` ends the session for everyone (host only); otherwise this
    /// is a plain leave. A waiting session holding only its host is
    /// cancelled rather than ended.
    pub async fn end(
        &self,
        session_id: &str,
        user_id: &str,
        for_all: bool,
    ) -> Result<Session, SessionError> {
        if !for_all {
            return self.leave(session_id, user_id).await;
        }
        let result = self
            .store
            .transactional_update(session_id, &mut |session| {
                if session.status.is_terminal() {
                    return Err(TxAbort::Terminal);
                }
                if session.host_id != user_id {
                    return Err(TxAbort::NotHost);
                }
                terminate(session);
                Ok(())
            })
            .await;
        result
            .map(|session| {
                info!(session = %session.id, status = ?session.status, "session ended for all");
                session
            })
            .map_err(map_update)
    }

    /// Administrative close, bypassing the host check. Identity and role
    /// verification belong to the embedding application.
    pub async fn end_by_admin(&self, session_id: &str) -> Result<Session, SessionError> {
        self.store
            .transactional_update(session_id, &mut |session| {
                if session.status.is_terminal() {
                    return Err(TxAbort::Terminal);
                }
                terminate(session);
                Ok(())
            })
            .await
            .map_err(map_update)
    }
}

fn terminate(session: &mut Session) {
    session.status = if session.status == SessionStatus::Waiting && session.participants.len() <= 1
    {
        SessionStatus::Cancelled
    } else {
        SessionStatus::Ended
    };
}
