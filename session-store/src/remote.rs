use std::{collections::HashSet, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::{
    model::{ChatMessage, Session, SessionId, SignalingMessage},
    ApplyFn, ChatLog, SessionStore, SessionWatch, SignalMailbox, StoreError, UpdateError,
    TX_MAX_ATTEMPTS,
};

const SESSIONS: &str = "sessions";
const SIGNALS: &str = "signals";
const CHAT: &str = "chat_messages";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum RemoteStoreError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error: {message} (code: {code})")]
    Api { message: String, code: String },
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<RemoteStoreError> for StoreError {
    fn from(err: RemoteStoreError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Stored session plus the revision counter the service checks on update.
#[derive(Debug, Serialize, Deserialize)]
struct SessionRecord {
    version: u64,
    #[serde(flatten)]
    session: Session,
}

#[derive(Debug, Deserialize)]
struct RecordList<T> {
    items: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct StoredSignal {
    record_id: String,
    #[serde(flatten)]
    message: SignalingMessage,
}

/// HTTP client for a hosted document store exposing collection/record
/// endpoints with revision-checked updates (`?ifVersion=` returns 409 on a
/// stale revision) and no server-side compute. Change feeds are polled and
/// surfaced through the same watch/mpsc interfaces the in-memory store uses.
#[derive(Debug, Clone)]
pub struct RemoteStore {
    client: Client,
    base_url: String,
    auth_token: Option<String>,
    poll_interval: Duration,
}

impl RemoteStore {
    pub fn new(base_url: &str) -> Self {
        // Every request is bounded so a hung store can never stall the
        // caller's own cleanup.
        let client = Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_auth_token(mut self, token: String) -> Self {
        self.auth_token = Some(token);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn record_url(&self, collection: &str, id: &str) -> String {
        format!(
            "{}/api/collections/{}/records/{}",
            self.base_url, collection, id
        )
    }

    fn collection_url(&self, collection: &str) -> String {
        format!("{}/api/collections/{}/records", self.base_url, collection)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn api_failure(response: reqwest::Response) -> RemoteStoreError {
        let code = response.status().to_string();
        let body: Value = response.json().await.unwrap_or_default();
        RemoteStoreError::Api {
            message: body["message"]
                .as_str()
                .unwrap_or("unknown error")
                .to_string(),
            code,
        }
    }

    async fn fetch_record(&self, id: &str) -> Result<SessionRecord, StoreError> {
        let response = self
            .authorize(self.client.get(self.record_url(SESSIONS, id)))
            .send()
            .await
            .map_err(RemoteStoreError::from)?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(StoreError::NotFound),
            status if status.is_success() => {
                let record = response
                    .json::<SessionRecord>()
                    .await
                    .map_err(RemoteStoreError::from)?;
                Ok(record)
            }
            _ => Err(Self::api_failure(response).await.into()),
        }
    }

    /// Commit `session` only if the stored revision is still `version`.
    /// `Ok(false)` means somebody else won the race.
    async fn put_if_version(
        &self,
        session: &Session,
        version: u64,
    ) -> Result<bool, StoreError> {
        let url = format!(
            "{}?ifVersion={}",
            self.record_url(SESSIONS, &session.id),
            version
        );
        let record = SessionRecord {
            version: version + 1,
            session: session.clone(),
        };
        let response = self
            .authorize(self.client.patch(&url))
            .json(&record)
            .send()
            .await
            .map_err(RemoteStoreError::from)?;

        match response.status() {
            StatusCode::CONFLICT => Ok(false),
            StatusCode::NOT_FOUND => Err(StoreError::NotFound),
            status if status.is_success() => Ok(true),
            _ => Err(Self::api_failure(response).await.into()),
        }
    }

    async fn list_session_records<T: serde::de::DeserializeOwned>(
        &self,
        collection: &str,
        session_id: &str,
    ) -> Result<Vec<T>, StoreError> {
        let url = format!(
            "{}?filter=session_id='{}'&sort=created_at,id",
            self.collection_url(collection),
            session_id
        );
        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(RemoteStoreError::from)?;

        if !response.status().is_success() {
            return Err(Self::api_failure(response).await.into());
        }
        let list = response
            .json::<RecordList<T>>()
            .await
            .map_err(RemoteStoreError::from)?;
        Ok(list.items)
    }

    async fn delete_record(&self, collection: &str, record_id: &str) -> Result<(), StoreError> {
        let response = self
            .authorize(self.client.delete(self.record_url(collection, record_id)))
            .send()
            .await
            .map_err(RemoteStoreError::from)?;
        // Already-deleted is fine: another replica of the recipient got there first.
        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(Self::api_failure(response).await.into())
        }
    }
}

#[async_trait]
impl SessionStore for RemoteStore {
    async fn create(&self, session: Session) -> Result<SessionId, StoreError> {
        let record = SessionRecord {
            version: 0,
            session,
        };
        let response = self
            .authorize(self.client.post(self.collection_url(SESSIONS)))
            .json(&record)
            .send()
            .await
            .map_err(RemoteStoreError::from)?;

        if !response.status().is_success() {
            return Err(Self::api_failure(response).await.into());
        }
        debug!(session = %record.session.id, "created session record");
        Ok(record.session.id)
    }

    async fn get(&self, id: &str) -> Result<Session, StoreError> {
        Ok(self.fetch_record(id).await?.session)
    }

    async fn subscribe(&self, id: &str) -> Result<SessionWatch, StoreError> {
        let record = self.fetch_record(id).await?;
        let (tx, rx) = watch::channel(record.session);
        let mut last_version = record.version;

        let store = self.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(store.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if tx.is_closed() {
                    break;
                }
                match store.fetch_record(&id).await {
                    Ok(record) if record.version != last_version => {
                        last_version = record.version;
                        tx.send_replace(record.session);
                    }
                    Ok(_) => {}
                    Err(StoreError::NotFound) => break,
                    Err(err) => warn!(session = %id, %err, "session poll failed"),
                }
            }
        });
        Ok(rx)
    }

    async fn transactional_update(
        &self,
        id: &str,
        apply: ApplyFn<'_>,
    ) -> Result<Session, UpdateError> {
        for _ in 0..TX_MAX_ATTEMPTS {
            let record = self.fetch_record(id).await?;
            let mut working = record.session;
            apply(&mut working)?;
            working.updated_at = Utc::now();

            if self.put_if_version(&working, record.version).await? {
                return Ok(working);
            }
            debug!(session = id, "revision raced, retrying update");
        }
        Err(StoreError::Conflict(TX_MAX_ATTEMPTS).into())
    }
}

#[async_trait]
impl SignalMailbox for RemoteStore {
    async fn append(&self, message: SignalingMessage) -> Result<(), StoreError> {
        // Terminal sessions accept no further signaling; unknown sessions
        // keep the mailbox usable, same as the in-memory store.
        match self.fetch_record(&message.session_id).await {
            Ok(record) if record.session.status.is_terminal() => {
                return Err(StoreError::Unavailable(
                    "session reached a terminal status".to_string(),
                ));
            }
            Ok(_) | Err(StoreError::NotFound) => {}
            Err(err) => return Err(err),
        }

        let response = self
            .authorize(self.client.post(self.collection_url(SIGNALS)))
            .json(&message)
            .send()
            .await
            .map_err(RemoteStoreError::from)?;
        if !response.status().is_success() {
            return Err(Self::api_failure(response).await.into());
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        session_id: &str,
        recipient: &str,
    ) -> Result<mpsc::UnboundedReceiver<SignalingMessage>, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let store = self.clone();
        let session_id = session_id.to_string();
        let recipient = recipient.to_string();

        tokio::spawn(async move {
            // Broadcast records belong to every participant, so they stay
            // in the store for the others and retention reclaims them;
            // this subscriber just remembers which ones it handed over.
            let mut seen_broadcasts: HashSet<String> = HashSet::new();
            let mut ticker = tokio::time::interval(store.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if tx.is_closed() {
                    break;
                }
                let stored = match store
                    .list_session_records::<StoredSignal>(SIGNALS, &session_id)
                    .await
                {
                    Ok(stored) => stored,
                    Err(err) => {
                        warn!(session = %session_id, %err, "signal poll failed");
                        continue;
                    }
                };
                for signal in stored {
                    if !signal.message.is_for(&recipient) {
                        continue;
                    }
                    let addressed = signal.message.to_user.is_some();
                    if !addressed && !seen_broadcasts.insert(signal.record_id.clone()) {
                        continue;
                    }
                    if tx.send(signal.message).is_err() {
                        return;
                    }
                    // Only the addressee may ack-delete its own records;
                    // at-least-once, so a delete failure just means a
                    // duplicate on the next poll.
                    if addressed {
                        if let Err(err) = store.delete_record(SIGNALS, &signal.record_id).await {
                            warn!(session = %session_id, %err, "signal ack failed");
                        }
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn purge_expired(&self, retention: Duration) -> Result<usize, StoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention)
                .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        let url = format!(
            "{}?filter=created_at<'{}'",
            self.collection_url(SIGNALS),
            cutoff.to_rfc3339()
        );
        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(RemoteStoreError::from)?;
        if !response.status().is_success() {
            return Err(Self::api_failure(response).await.into());
        }
        let expired = response
            .json::<RecordList<StoredSignal>>()
            .await
            .map_err(RemoteStoreError::from)?;

        let mut dropped = 0;
        for signal in expired.items {
            if self.delete_record(SIGNALS, &signal.record_id).await.is_ok() {
                dropped += 1;
            }
        }
        Ok(dropped)
    }
}

#[async_trait]
impl ChatLog for RemoteStore {
    async fn append(&self, message: ChatMessage) -> Result<(), StoreError> {
        let response = self
            .authorize(self.client.post(self.collection_url(CHAT)))
            .json(&message)
            .send()
            .await
            .map_err(RemoteStoreError::from)?;
        if !response.status().is_success() {
            return Err(Self::api_failure(response).await.into());
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        session_id: &str,
    ) -> Result<mpsc::UnboundedReceiver<ChatMessage>, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let store = self.clone();
        let session_id = session_id.to_string();

        tokio::spawn(async move {
            let mut seen: Option<String> = None;
            let mut ticker = tokio::time::interval(store.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if tx.is_closed() {
                    break;
                }
                let messages = match store
                    .list_session_records::<ChatMessage>(CHAT, &session_id)
                    .await
                {
                    Ok(messages) => messages,
                    Err(err) => {
                        warn!(session = %session_id, %err, "chat poll failed");
                        continue;
                    }
                };
                // The list is (created_at, id) sorted; replay past the cursor.
                let fresh = match &seen {
                    None => messages,
                    Some(last) => messages
                        .into_iter()
                        .skip_while(|m| m.id != *last)
                        .skip(1)
                        .collect(),
                };
                for message in fresh {
                    let id = message.id.clone();
                    if tx.send(message).is_err() {
                        return;
                    }
                    seen = Some(id);
                }
            }
        });
        Ok(rx)
    }
}
