use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::debug;

use crate::{
    model::{ChatMessage, Session, SessionId, SignalingMessage},
    ApplyFn, ChatLog, SessionStore, SessionWatch, SignalMailbox, StoreError, UpdateError,
    TX_MAX_ATTEMPTS,
};

struct VersionedDoc {
    version: u64,
    session: Session,
    updates: watch::Sender<Session>,
}

struct InboxSubscriber {
    recipient: String,
    tx: mpsc::UnboundedSender<SignalingMessage>,
}

struct QueuedSignal {
    message: SignalingMessage,
    /// Recipients that already consumed this message. Addressed messages
    /// leave the queue once their recipient is in here; broadcasts have
    /// no closed recipient set and wait for retention instead.
    consumed_by: HashSet<String>,
}

#[derive(Default)]
struct MailboxState {
    /// Queued messages per session, in append order.
    pending: HashMap<SessionId, Vec<QueuedSignal>>,
    subscribers: HashMap<SessionId, Vec<InboxSubscriber>>,
}

#[derive(Default)]
struct ChatState {
    history: HashMap<SessionId, Vec<ChatMessage>>,
    subscribers: HashMap<SessionId, Vec<mpsc::UnboundedSender<ChatMessage>>>,
}

/// In-memory document store with the same contracts as the remote client:
/// versioned snapshots, compare-and-swap commits, watch-channel fanout.
/// Backs tests and the loopback demo, and keeps the optimistic-concurrency
/// path identical to what production traffic exercises.
#[derive(Clone, Default)]
pub struct MemoryStore {
    sessions: Arc<RwLock<HashMap<SessionId, VersionedDoc>>>,
    mailbox: Arc<Mutex<MailboxState>>,
    chat: Arc<Mutex<ChatState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create(&self, session: Session) -> Result<SessionId, StoreError> {
        let id = session.id.clone();
        let (updates, _) = watch::channel(session.clone());
        let mut sessions = self.sessions.write().await;
        sessions.insert(
            id.clone(),
            VersionedDoc {
                version: 0,
                session,
                updates,
            },
        );
        Ok(id)
    }

    async fn get(&self, id: &str) -> Result<Session, StoreError> {
        let sessions = self.sessions.read().await;
        sessions
            .get(id)
            .map(|doc| doc.session.clone())
            .ok_or(StoreError::NotFound)
    }

    async fn subscribe(&self, id: &str) -> Result<SessionWatch, StoreError> {
        let sessions = self.sessions.read().await;
        sessions
            .get(id)
            .map(|doc| doc.updates.subscribe())
            .ok_or(StoreError::NotFound)
    }

    async fn transactional_update(
        &self,
        id: &str,
        apply: ApplyFn<'_>,
    ) -> Result<Session, UpdateError> {
        for _ in 0..TX_MAX_ATTEMPTS {
            // Snapshot outside the write lock; commit only if the version
            // is still the one we read.
            let (read_version, mut working) = {
                let sessions = self.sessions.read().await;
                let doc = sessions.get(id).ok_or(StoreError::NotFound)?;
                (doc.version, doc.session.clone())
            };

            apply(&mut working)?;
            working.updated_at = Utc::now();

            let mut sessions = self.sessions.write().await;
            let doc = sessions.get_mut(id).ok_or(StoreError::NotFound)?;
            if doc.version != read_version {
                debug!(session = id, "stale snapshot, retrying update");
                continue;
            }
            doc.version += 1;
            doc.session = working.clone();
            doc.updates.send_replace(working.clone());
            return Ok(working);
        }
        Err(StoreError::Conflict(TX_MAX_ATTEMPTS).into())
    }
}

#[async_trait]
impl SignalMailbox for MemoryStore {
    async fn append(&self, message: SignalingMessage) -> Result<(), StoreError> {
        {
            // Terminal sessions accept no further signaling. The mailbox
            // stays usable for sessions this store never saw.
            let sessions = self.sessions.read().await;
            if let Some(doc) = sessions.get(&message.session_id) {
                if doc.session.status.is_terminal() {
                    return Err(StoreError::Unavailable(
                        "session reached a terminal status".to_string(),
                    ));
                }
            }
        }
        let mut mailbox = self.mailbox.lock().await;
        let mut consumed_by = HashSet::new();
        {
            let subscribers = mailbox
                .subscribers
                .entry(message.session_id.clone())
                .or_default();
            subscribers.retain(|sub| !sub.tx.is_closed());
            for sub in subscribers.iter() {
                if message.is_for(&sub.recipient) && sub.tx.send(message.clone()).is_ok() {
                    consumed_by.insert(sub.recipient.clone());
                }
            }
        }

        // Delivery is tracked per recipient: an addressed message is done
        // once its addressee has it, while a broadcast stays queued for
        // participants subscribing later. Retention bounds growth.
        let addressee_has_it = message
            .to_user
            .as_deref()
            .is_some_and(|to| consumed_by.contains(to));
        if !addressee_has_it {
            mailbox
                .pending
                .entry(message.session_id.clone())
                .or_default()
                .push(QueuedSignal {
                    message,
                    consumed_by,
                });
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        session_id: &str,
        recipient: &str,
    ) -> Result<mpsc::UnboundedReceiver<SignalingMessage>, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut mailbox = self.mailbox.lock().await;

        if let Some(pending) = mailbox.pending.get_mut(session_id) {
            for queued in pending.iter_mut() {
                if queued.message.is_for(recipient)
                    && queued.consumed_by.insert(recipient.to_string())
                {
                    let _ = tx.send(queued.message.clone());
                }
            }
            // Consumed addressed messages leave the queue; broadcasts stay
            // for whoever subscribes next, until retention expires them.
            pending.retain(|queued| match queued.message.to_user.as_deref() {
                Some(to) => !queued.consumed_by.contains(to),
                None => true,
            });
        }

        mailbox
            .subscribers
            .entry(session_id.to_string())
            .or_default()
            .push(InboxSubscriber {
                recipient: recipient.to_string(),
                tx,
            });
        Ok(rx)
    }

    async fn purge_expired(&self, retention: Duration) -> Result<usize, StoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention)
                .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        let mut mailbox = self.mailbox.lock().await;
        let mut dropped = 0;
        for pending in mailbox.pending.values_mut() {
            let before = pending.len();
            pending.retain(|queued| queued.message.created_at > cutoff);
            dropped += before - pending.len();
        }
        mailbox.pending.retain(|_, pending| !pending.is_empty());
        if dropped > 0 {
            debug!(dropped, "expired queued signaling messages");
        }
        Ok(dropped)
    }
}

#[async_trait]
impl ChatLog for MemoryStore {
    async fn append(&self, message: ChatMessage) -> Result<(), StoreError> {
        let mut chat = self.chat.lock().await;
        let history = chat.history.entry(message.session_id.clone()).or_default();
        history.push(message.clone());

        let subscribers = chat
            .subscribers
            .entry(message.session_id.clone())
            .or_default();
        subscribers.retain(|tx| tx.send(message.clone()).is_ok());
        Ok(())
    }

    async fn subscribe(
        &self,
        session_id: &str,
    ) -> Result<mpsc::UnboundedReceiver<ChatMessage>, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut chat = self.chat.lock().await;

        if let Some(history) = chat.history.get_mut(session_id) {
            history.sort_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a.id.cmp(&b.id))
            });
            for message in history.iter() {
                let _ = tx.send(message.clone());
            }
        }

        chat.subscribers
            .entry(session_id.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ParticipantRef, SessionKind, SessionStatus, SignalKind};
    use crate::TxAbort;
    use serde_json::json;

    fn voice_session(host: &str) -> Session {
        Session::new(ParticipantRef::new(host, host), SessionKind::Voice, 4)
    }

    #[tokio::test]
    async fn create_get_subscribe() {
        let store = MemoryStore::new();
        let session = voice_session("alice");
        let id = store.create(session.clone()).await.unwrap();

        assert_eq!(store.get(&id).await.unwrap(), session);

        let watch = SessionStore::subscribe(&store, &id).await.unwrap();
        assert_eq!(watch.borrow().id, id);

        assert!(matches!(
            store.get("missing").await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn update_commits_and_notifies() {
        let store = MemoryStore::new();
        let id = store.create(voice_session("alice")).await.unwrap();
        let mut watch = SessionStore::subscribe(&store, &id).await.unwrap();

        let updated = store
            .transactional_update(&id, &mut |session| {
                session.status = SessionStatus::Active;
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(updated.status, SessionStatus::Active);

        watch.changed().await.unwrap();
        assert_eq!(watch.borrow().status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn aborted_update_leaves_snapshot_untouched() {
        let store = MemoryStore::new();
        let id = store.create(voice_session("alice")).await.unwrap();

        let result = store
            .transactional_update(&id, &mut |session| {
                session.status = SessionStatus::Ended;
                Err(TxAbort::NotJoinable)
            })
            .await;
        assert!(matches!(
            result,
            Err(UpdateError::Aborted(TxAbort::NotJoinable))
        ));
        assert_eq!(store.get(&id).await.unwrap().status, SessionStatus::Waiting);
    }

    #[tokio::test]
    async fn mailbox_routes_to_addressee_only() {
        let store = MemoryStore::new();
        let mut bob_rx = SignalMailbox::subscribe(&store, "s1", "bob").await.unwrap();
        let mut carol_rx = SignalMailbox::subscribe(&store, "s1", "carol")
            .await
            .unwrap();

        SignalMailbox::append(
            &store,
            SignalingMessage::addressed("s1", "alice", "bob", SignalKind::Offer, json!({"sdp": "x"})),
        )
        .await
        .unwrap();

        let got = bob_rx.recv().await.unwrap();
        assert_eq!(got.kind, SignalKind::Offer);
        assert!(carol_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_reaches_everyone_but_sender() {
        let store = MemoryStore::new();
        let mut alice_rx = SignalMailbox::subscribe(&store, "s1", "alice")
            .await
            .unwrap();
        let mut bob_rx = SignalMailbox::subscribe(&store, "s1", "bob").await.unwrap();

        SignalMailbox::append(
            &store,
            SignalingMessage::broadcast("s1", "alice", SignalKind::Bye, json!({})),
        )
        .await
        .unwrap();

        assert_eq!(bob_rx.recv().await.unwrap().kind, SignalKind::Bye);
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_stays_for_late_subscribers_within_retention() {
        let store = MemoryStore::new();
        let mut bob_rx = SignalMailbox::subscribe(&store, "s1", "bob").await.unwrap();

        SignalMailbox::append(
            &store,
            SignalingMessage::broadcast("s1", "alice", SignalKind::Bye, json!({})),
        )
        .await
        .unwrap();
        assert_eq!(bob_rx.recv().await.unwrap().kind, SignalKind::Bye);

        // Carol reconnects after bob already consumed the bye; it must
        // still reach her.
        let mut carol_rx = SignalMailbox::subscribe(&store, "s1", "carol")
            .await
            .unwrap();
        assert_eq!(carol_rx.recv().await.unwrap().kind, SignalKind::Bye);

        // A second subscription by bob does not replay what he consumed.
        let mut bob_again = SignalMailbox::subscribe(&store, "s1", "bob").await.unwrap();
        assert!(bob_again.try_recv().is_err());
    }

    #[tokio::test]
    async fn pending_messages_flush_on_subscribe_in_order() {
        let store = MemoryStore::new();
        for n in 0..3 {
            SignalMailbox::append(
                &store,
                SignalingMessage::addressed(
                    "s1",
                    "alice",
                    "bob",
                    SignalKind::IceCandidate,
                    json!({ "n": n }),
                ),
            )
            .await
            .unwrap();
        }

        let mut bob_rx = SignalMailbox::subscribe(&store, "s1", "bob").await.unwrap();
        for n in 0..3 {
            let message = bob_rx.recv().await.unwrap();
            assert_eq!(message.payload["n"], n);
        }
    }

    #[tokio::test]
    async fn purge_drops_only_expired_pending() {
        let store = MemoryStore::new();
        let mut old = SignalingMessage::addressed("s1", "a", "b", SignalKind::Offer, json!({}));
        old.created_at = Utc::now() - chrono::Duration::minutes(10);
        SignalMailbox::append(&store, old).await.unwrap();
        SignalMailbox::append(
            &store,
            SignalingMessage::addressed("s1", "a", "b", SignalKind::Answer, json!({})),
        )
        .await
        .unwrap();

        let dropped = store
            .purge_expired(Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(dropped, 1);

        let mut rx = SignalMailbox::subscribe(&store, "s1", "b").await.unwrap();
        assert_eq!(rx.recv().await.unwrap().kind, SignalKind::Answer);
    }

    #[tokio::test]
    async fn terminal_sessions_reject_signaling() {
        let store = MemoryStore::new();
        let id = store.create(voice_session("alice")).await.unwrap();
        store
            .transactional_update(&id, &mut |session| {
                session.status = SessionStatus::Ended;
                Ok(())
            })
            .await
            .unwrap();

        let result = SignalMailbox::append(
            &store,
            SignalingMessage::addressed(id, "alice", "bob", SignalKind::Offer, json!({})),
        )
        .await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }

    #[tokio::test]
    async fn chat_backlog_ordered_by_time_then_id() {
        let store = MemoryStore::new();
        let stamp = Utc::now();
        let mut first = ChatMessage::new("s1", "u1", "Ada", "hello");
        let mut second = ChatMessage::new("s1", "u2", "Bea", "hi");
        first.created_at = stamp;
        second.created_at = stamp;
        first.id = "aaa".into();
        second.id = "bbb".into();

        // Append out of order; subscribe must still replay sorted.
        ChatLog::append(&store, second.clone()).await.unwrap();
        ChatLog::append(&store, first.clone()).await.unwrap();

        let mut rx = ChatLog::subscribe(&store, "s1").await.unwrap();
        assert_eq!(rx.recv().await.unwrap().id, "aaa");
        assert_eq!(rx.recv().await.unwrap().id, "bbb");
    }
}
