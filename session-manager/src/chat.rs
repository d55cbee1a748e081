use std::sync::Arc;

use session_store::{ChatLog, ChatMessage, SessionKind, SessionStore};
use tokio::sync::mpsc;
use tracing::debug;

use crate::SessionError;

/// Text messaging for chat sessions. Sends are validated against the live
/// session document; the log itself stays append-only.
#[derive(Clone)]
pub struct ChatChannel {
    store: Arc<dyn SessionStore>,
    log: Arc<dyn ChatLog>,
    session_id: String,
}

impl ChatChannel {
    pub fn new(
        store: Arc<dyn SessionStore>,
        log: Arc<dyn ChatLog>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            log,
            session_id: session_id.into(),
        }
    }

    /// Append a message. The sender must be a current participant of a
    /// live chat session.
    pub async fn send(&self, user_id: &str, text: impl Into<String>) -> Result<ChatMessage, SessionError> {
        let session = self
            .store
            .get(&self.session_id)
            .await
            .map_err(crate::map_store)?;
        if session.kind != SessionKind::Chat {
            return Err(SessionError::ChatDisabled);
        }
        if session.status.is_terminal() {
            return Err(SessionError::NotJoinable);
        }
        let sender = session
            .participant(user_id)
            .ok_or(SessionError::NotJoinable)?;

        let message = ChatMessage::new(
            &self.session_id,
            user_id,
            sender.display_name.clone(),
            text,
        );
        self.log
            .append(message.clone())
            .await
            .map_err(crate::map_store)?;
        debug!(session = %self.session_id, user = user_id, "chat message appended");
        Ok(message)
    }

    /// Backlog in order, then live messages.
    pub async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<ChatMessage>, SessionError> {
        self.log
            .subscribe(&self.session_id)
            .await
            .map_err(crate::map_store)
    }
}
