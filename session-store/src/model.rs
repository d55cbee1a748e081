use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub type SessionId = String;
pub type UserId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionKind {
    #[serde(rename = "voice")]
    Voice,
    #[serde(rename = "chat")]
    Chat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    #[serde(rename = "waiting")]
    Waiting,
    #[serde(rename = "active")]
    Active,
    #[serde(rename = "ended")]
    Ended,
    #[serde(rename = "cancelled")]
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Ended | SessionStatus::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantRef {
    pub user_id: UserId,
    pub display_name: String,
    pub joined_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
}

impl ParticipantRef {
    pub fn new(user_id: impl Into<UserId>, display_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            joined_at: now,
            last_heartbeat_at: now,
        }
    }
}

/// A support session document. Participants are a keyed set, never a raw
/// array rebuilt by clients, so add/remove cannot lose concurrent updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub host_id: UserId,
    pub kind: SessionKind,
    pub capacity: u32,
    pub status: SessionStatus,
    pub participants: BTreeMap<UserId, ParticipantRef>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(host: ParticipantRef, kind: SessionKind, capacity: u32) -> Self {
        let now = Utc::now();
        let host_id = host.user_id.clone();
        let mut participants = BTreeMap::new();
        participants.insert(host_id.clone(), host);
        Self {
            id: Uuid::new_v4().to_string(),
            host_id,
            kind,
            capacity,
            status: SessionStatus::Waiting,
            participants,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_joinable(&self) -> bool {
        matches!(self.status, SessionStatus::Waiting | SessionStatus::Active)
    }

    pub fn is_full(&self) -> bool {
        self.participants.len() as u32 >= self.capacity
    }

    pub fn participant(&self, user_id: &str) -> Option<&ParticipantRef> {
        self.participants.get(user_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalKind {
    #[serde(rename = "offer")]
    Offer,
    #[serde(rename = "answer")]
    Answer,
    #[serde(rename = "ice-candidate")]
    IceCandidate,
    #[serde(rename = "bye")]
    Bye,
}

/// One mailbox entry. Created by a sender, consumed by the addressed
/// recipient(s), deleted after delivery. Never mutated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalingMessage {
    pub id: String,
    pub session_id: SessionId,
    pub from_user: UserId,
    /// `None` broadcasts to every other participant in the session.
    pub to_user: Option<UserId>,
    pub kind: SignalKind,
    /// Whatever the transport's offer/answer/candidate serialization
    /// produced, carried verbatim.
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl SignalingMessage {
    pub fn addressed(
        session_id: impl Into<SessionId>,
        from_user: impl Into<UserId>,
        to_user: impl Into<UserId>,
        kind: SignalKind,
        payload: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            from_user: from_user.into(),
            to_user: Some(to_user.into()),
            kind,
            payload,
            created_at: Utc::now(),
        }
    }

    pub fn broadcast(
        session_id: impl Into<SessionId>,
        from_user: impl Into<UserId>,
        kind: SignalKind,
        payload: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            from_user: from_user.into(),
            to_user: None,
            kind,
            payload,
            created_at: Utc::now(),
        }
    }

    /// Whether `user` should see this message. Senders never receive their
    /// own broadcasts back.
    pub fn is_for(&self, user: &str) -> bool {
        match &self.to_user {
            Some(to) => to == user,
            None => self.from_user != user,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub session_id: SessionId,
    pub user_id: UserId,
    pub display_name: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(
        session_id: impl Into<SessionId>,
        user_id: impl Into<UserId>,
        display_name: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            user_id: user_id.into(),
            display_name: display_name.into(),
            text: text.into(),
            created_at: Utc::now(),
        }
    }
}
