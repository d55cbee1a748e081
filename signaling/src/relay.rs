use std::{sync::Arc, time::Duration};

use common_infra::{metrics::signaling_metrics, shutdown::ShutdownSignal};
use serde_json::Value;
use session_store::{
    SessionId, SignalKind, SignalMailbox, SignalingMessage, StoreError, UserId,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::warn;

use crate::message::{IceCandidate, SdpPayload};

/// Store-backed signaling exchange for one participant in one session.
/// Messages are appended to the shared mailbox and consumed by their
/// addressee; the relay itself holds no state beyond the identifiers.
#[derive(Clone)]
pub struct SignalingRelay {
    mailbox: Arc<dyn SignalMailbox>,
    session_id: SessionId,
    local_user: UserId,
}

impl SignalingRelay {
    pub fn new(
        mailbox: Arc<dyn SignalMailbox>,
        session_id: impl Into<SessionId>,
        local_user: impl Into<UserId>,
    ) -> Self {
        Self {
            mailbox,
            session_id: session_id.into(),
            local_user: local_user.into(),
        }
    }

    pub fn local_user(&self) -> &str {
        &self.local_user
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn send(
        &self,
        kind: SignalKind,
        to_user: Option<&str>,
        payload: Value,
    ) -> Result<(), StoreError> {
        let message = match to_user {
            Some(to) => SignalingMessage::addressed(
                self.session_id.clone(),
                self.local_user.clone(),
                to,
                kind,
                payload,
            ),
            None => SignalingMessage::broadcast(
                self.session_id.clone(),
                self.local_user.clone(),
                kind,
                payload,
            ),
        };
        signaling_metrics().inc_messages_relayed();
        self.mailbox.append(message).await
    }

    pub async fn send_offer(&self, to_user: &str, offer: &SdpPayload) -> Result<(), StoreError> {
        self.send(SignalKind::Offer, Some(to_user), encode(offer)?)
            .await
    }

    pub async fn send_answer(&self, to_user: &str, answer: &SdpPayload) -> Result<(), StoreError> {
        self.send(SignalKind::Answer, Some(to_user), encode(answer)?)
            .await
    }

    pub async fn send_candidate(
        &self,
        to_user: &str,
        candidate: &IceCandidate,
    ) -> Result<(), StoreError> {
        self.send(SignalKind::IceCandidate, Some(to_user), encode(candidate)?)
            .await
    }

    /// Broadcast departure so peers tear down without waiting for the
    /// heartbeat sweep.
    pub async fn send_bye(&self) -> Result<(), StoreError> {
        self.send(SignalKind::Bye, None, Value::Null).await
    }

    /// Messages addressed to the local user (or broadcast by others), in
    /// append order, deleted after delivery.
    pub async fn subscribe_inbox(
        &self,
    ) -> Result<mpsc::UnboundedReceiver<SignalingMessage>, StoreError> {
        self.mailbox
            .subscribe(&self.session_id, &self.local_user)
            .await
    }

    /// Periodically drop undelivered messages past the retention window.
    /// Retention bounds mailbox growth, not correctness - reconnecting
    /// callers renegotiate instead of replaying stale offers.
    pub fn spawn_retention(
        &self,
        retention: Duration,
        mut shutdown: ShutdownSignal,
    ) -> JoinHandle<()> {
        let mailbox = self.mailbox.clone();
        let session_id = self.session_id.clone();
        tokio::spawn(async move {
            let sweep_every = retention.min(Duration::from_secs(60)).max(Duration::from_millis(50));
            let mut ticker = tokio::time::interval(sweep_every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = mailbox.purge_expired(retention).await {
                            warn!(session = %session_id, %err, "mailbox retention sweep failed");
                        }
                    }
                }
            }
        })
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Value, StoreError> {
    serde_json::to_value(value).map_err(|err| StoreError::Unavailable(err.to_string()))
}
