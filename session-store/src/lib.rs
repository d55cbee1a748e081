pub mod memory;
pub mod model;
pub mod remote;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

pub use memory::MemoryStore;
pub use model::{
    ChatMessage, ParticipantRef, Session, SessionId, SessionKind, SessionStatus, SignalKind,
    SignalingMessage, UserId,
};
pub use remote::RemoteStore;

/// How many times a transactional update re-reads the document and retries
/// after a write conflict before giving up.
pub const TX_MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document not found")]
    NotFound,
    #[error("write conflict persisted after {0} attempts")]
    Conflict(u32),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Typed refusal raised inside a transactional closure. Aborts the update
/// without retrying; the stored snapshot is left untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TxAbort {
    #[error("session is full")]
    SessionFull,
    #[error("session is not accepting participants")]
    NotJoinable,
    #[error("participant is not in the session")]
    NotParticipant,
    #[error("caller is not the host")]
    NotHost,
    #[error("session already reached a terminal status")]
    Terminal,
}

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Aborted(#[from] TxAbort),
}

/// Live snapshot feed for one session; the receiver always holds the latest
/// committed state.
pub type SessionWatch = watch::Receiver<Session>;

/// Mutation closure for `transactional_update`, object-safe on purpose.
pub type ApplyFn<'a> = &'a mut (dyn FnMut(&mut Session) -> Result<(), TxAbort> + Send);

/// Persistent session documents with realtime subscription semantics.
///
/// `transactional_update` is the only mutation path for participants and
/// status: the closure always runs against the freshest snapshot, and a
/// commit only lands if that snapshot is still current (optimistic
/// concurrency, bounded retries). Capacity checks therefore see the same
/// state they modify.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, session: Session) -> Result<SessionId, StoreError>;

    async fn get(&self, id: &str) -> Result<Session, StoreError>;

    async fn subscribe(&self, id: &str) -> Result<SessionWatch, StoreError>;

    async fn transactional_update(
        &self,
        id: &str,
        apply: ApplyFn<'_>,
    ) -> Result<Session, UpdateError>;
}

/// Append-only signaling mailbox. Messages addressed to a recipient (or
/// broadcast) are handed to that recipient's channel in append order.
/// Delivery is tracked per recipient: an addressed message is deleted once
/// its addressee consumed it, while a broadcast stays queued for anyone
/// subscribing later, until the retention window expires it. At-least-once
/// while the subscriber is live, nothing promised across longer
/// disconnects - callers renegotiate instead.
#[async_trait]
pub trait SignalMailbox: Send + Sync {
    async fn append(&self, message: SignalingMessage) -> Result<(), StoreError>;

    async fn subscribe(
        &self,
        session_id: &str,
        recipient: &str,
    ) -> Result<mpsc::UnboundedReceiver<SignalingMessage>, StoreError>;

    /// Drop undelivered messages older than `retention`. Returns how many
    /// were discarded.
    async fn purge_expired(&self, retention: Duration) -> Result<usize, StoreError>;
}

/// Append-only chat log ordered by (created_at, id).
#[async_trait]
pub trait ChatLog: Send + Sync {
    async fn append(&self, message: ChatMessage) -> Result<(), StoreError>;

    /// Backlog first, in order, then live messages as they arrive.
    async fn subscribe(
        &self,
        session_id: &str,
    ) -> Result<mpsc::UnboundedReceiver<ChatMessage>, StoreError>;
}
