use std::fmt::{self, Display};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use common_infra::backoff::Backoff;
use common_infra::shutdown::{self, ShutdownHandle};
use serde::{Deserialize, Serialize};
use session_manager::{
    ChatChannel, CoordinatorConfig, HostLeavePolicy, PresenceConfig, PresenceEvent,
    PresenceTracker, SessionCoordinator, SessionError,
};
use session_store::{
    ChatLog, ParticipantRef, Session, SessionKind, SessionStore, SessionWatch, SignalMailbox,
    UserId,
};
use signaling::{
    IceServer, LoopbackFactory, MediaError, MediaHandle, MediaSource, PeerConnectionManager,
    PeerEvent, PeerManagerConfig, PeerTransportFactory, SignalingRelay, StaticMedia,
};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub use session_store::MemoryStore;

pub const DEFAULT_MAILBOX_RETENTION: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClientError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error("signaling unavailable: {0}")]
    Signaling(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: UserId,
    pub display_name: String,
}

impl Identity {
    pub fn new(user_id: impl Into<UserId>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
        }
    }

    fn participant(&self) -> ParticipantRef {
        ParticipantRef::new(self.user_id.clone(), self.display_name.clone())
    }
}

/// Declarative settings surface: every field optional, sourced from a JSON
/// file, the environment, or both (environment wins). Resolved into a
/// [`ClientConfig`] before use.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub active_threshold: Option<u32>,
    pub host_leave_policy: Option<HostLeavePolicy>,
    pub heartbeat_secs: Option<u64>,
    pub stale_multiplier: Option<u32>,
    pub retention_secs: Option<u64>,
    pub max_renegotiations: Option<u32>,
    pub ice_servers: Vec<IceServer>,
    pub store_url: Option<String>,
    pub store_token: Option<String>,
}

impl ClientSettings {
    pub fn from_env() -> Result<Self, ClientError> {
        let mut settings = Self::default();
        settings.merge_env()?;
        Ok(settings)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ClientError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|err| ClientError::Config(format!("{}: {err}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|err| ClientError::Config(format!("{}: {err}", path.display())))
    }

    /// Overlay environment variables onto these settings.
    pub fn merge_env(&mut self) -> Result<(), ClientError> {
        if let Some(threshold) = env_parse("SESSION_ACTIVE_THRESHOLD")? {
            self.active_threshold = Some(threshold);
        }
        if let Ok(raw) = std::env::var("SESSION_HOST_LEAVE_POLICY") {
            self.host_leave_policy = Some(match raw.trim() {
                "transfer_host" => HostLeavePolicy::TransferHost,
                "end_for_all" => HostLeavePolicy::EndForAll,
                other => {
                    return Err(ClientError::Config(format!(
                        "SESSION_HOST_LEAVE_POLICY: unknown policy {other:?}"
                    )))
                }
            });
        }
        if let Some(secs) = env_parse("PRESENCE_HEARTBEAT_SECS")? {
            self.heartbeat_secs = Some(secs);
        }
        if let Some(multiplier) = env_parse("PRESENCE_STALE_MULTIPLIER")? {
            self.stale_multiplier = Some(multiplier);
        }
        if let Some(secs) = env_parse("SIGNALING_RETENTION_SECS")? {
            self.retention_secs = Some(secs);
        }
        if let Some(budget) = env_parse("SIGNALING_MAX_RENEGOTIATIONS")? {
            self.max_renegotiations = Some(budget);
        }
        if let Ok(url) = std::env::var("STORE_URL") {
            self.store_url = Some(url);
        }
        if let Ok(token) = std::env::var("STORE_TOKEN") {
            self.store_token = Some(token);
        }
        Ok(())
    }

    pub fn into_config(self) -> ClientConfig {
        let mut config = ClientConfig::default();
        if let Some(threshold) = self.active_threshold {
            config.coordinator.active_threshold = threshold;
        }
        if let Some(policy) = self.host_leave_policy {
            config.coordinator.host_leave_policy = policy;
        }
        if let Some(secs) = self.heartbeat_secs {
            config.presence.heartbeat_interval = Duration::from_secs(secs);
            config.presence.sweep_interval = config.presence.heartbeat_interval;
        }
        if let Some(multiplier) = self.stale_multiplier {
            config.presence.stale_multiplier = multiplier;
        }
        if let Some(secs) = self.retention_secs {
            config.mailbox_retention = Duration::from_secs(secs);
        }
        if let Some(budget) = self.max_renegotiations {
            config.peer.max_renegotiations = budget;
        }
        config.peer.rtc.ice_servers = self.ice_servers;
        config.store_url = self.store_url;
        config.store_token = self.store_token;
        config
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub coordinator: CoordinatorConfig,
    pub presence: PresenceConfig,
    pub peer: PeerManagerConfig,
    pub mailbox_retention: Duration,
    /// Remote document-store endpoint; `None` means the embedder supplies
    /// its own backends (tests and the demo use the memory store).
    pub store_url: Option<String>,
    pub store_token: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            coordinator: CoordinatorConfig::default(),
            presence: PresenceConfig::default(),
            peer: PeerManagerConfig::default(),
            mailbox_retention: DEFAULT_MAILBOX_RETENTION,
            store_url: None,
            store_token: None,
        }
    }
}

impl ClientConfig {
    /// Defaults overridden by the environment.
    pub fn from_env() -> Result<Self, ClientError> {
        Ok(ClientSettings::from_env()?.into_config())
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>, ClientError>
where
    T: FromStr,
    T::Err: Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|err| ClientError::Config(format!("{key}: {err}"))),
        Err(_) => Ok(None),
    }
}

/// Everything the client talks to, behind trait objects so tests and the
/// loopback demo swap the backends without touching the client.
#[derive(Clone)]
pub struct ClientDeps {
    pub store: Arc<dyn SessionStore>,
    pub mailbox: Arc<dyn SignalMailbox>,
    pub chat: Arc<dyn ChatLog>,
    pub factory: Arc<dyn PeerTransportFactory>,
    pub media: Arc<dyn MediaSource>,
}

impl ClientDeps {
    /// In-process backends: one shared memory store, loopback transports,
    /// always-granting media.
    pub fn in_memory() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            store: store.clone(),
            mailbox: store.clone(),
            chat: store,
            factory: Arc::new(LoopbackFactory::new()),
            media: Arc::new(StaticMedia::granting()),
        }
    }
}

/// One participant's entry point. Creating or joining a session yields an
/// [`ActiveSession`] with presence, signaling, and peer connections already
/// running.
pub struct SessionClient {
    identity: Identity,
    deps: ClientDeps,
    config: ClientConfig,
}

impl SessionClient {
    pub fn new(identity: Identity, deps: ClientDeps, config: ClientConfig) -> Self {
        Self {
            identity,
            deps,
            config,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub async fn create_session(
        &self,
        kind: SessionKind,
        capacity: u32,
    ) -> Result<ActiveSession, ClientError> {
        // Media is acquired before anything is written: a denied microphone
        // must never leave a ghost participant behind.
        let media = self.acquire_media(kind).await?;
        let coordinator = self.coordinator();
        let session = coordinator
            .create(self.identity.participant(), kind, capacity)
            .await?;
        self.attach(coordinator, session, media).await
    }

    pub async fn join_session(&self, session_id: &str) -> Result<ActiveSession, ClientError> {
        let coordinator = self.coordinator();
        let current = coordinator.get(session_id).await?;
        let media = self.acquire_media(current.kind).await?;
        let session = coordinator
            .join(session_id, self.identity.participant())
            .await?;
        self.attach(coordinator, session, media).await
    }

    fn coordinator(&self) -> SessionCoordinator {
        SessionCoordinator::new(self.deps.store.clone(), self.config.coordinator.clone())
    }

    async fn acquire_media(&self, kind: SessionKind) -> Result<Option<MediaHandle>, ClientError> {
        match kind {
            SessionKind::Voice => Ok(Some(self.deps.media.acquire().await?)),
            SessionKind::Chat => Ok(None),
        }
    }

    async fn attach(
        &self,
        coordinator: SessionCoordinator,
        session: Session,
        media: Option<MediaHandle>,
    ) -> Result<ActiveSession, ClientError> {
        let relay = SignalingRelay::new(
            self.deps.mailbox.clone(),
            &session.id,
            &self.identity.user_id,
        );
        let inbox = relay
            .subscribe_inbox()
            .await
            .map_err(|err| ClientError::Signaling(err.to_string()))?;

        let manager = Arc::new(PeerConnectionManager::new(
            relay.clone(),
            self.deps.factory.clone(),
            self.config.peer.clone(),
        ));
        let presence = PresenceTracker::new(
            coordinator.clone(),
            &session.id,
            &self.identity.user_id,
            self.config.presence.clone(),
        );

        let (handle, signal) = shutdown::channel();
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        tasks.push(tokio::spawn(manager.clone().run(inbox, signal.clone())));
        tasks.push(relay.spawn_retention(self.config.mailbox_retention, signal.clone()));

        let tracker = presence.clone();
        let tracker_signal = signal.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(err) = tracker.run(tracker_signal).await {
                warn!(%err, "presence tracker stopped");
            }
        }));

        tasks.push(spawn_presence_bridge(
            manager.clone(),
            presence.subscribe(),
            signal,
        ));

        // Dial whoever is already in the room; later arrivals come through
        // the presence bridge.
        for peer in session.participants.keys() {
            if peer != &self.identity.user_id {
                manager.on_peer_joined(peer).await;
            }
        }

        let chat = ChatChannel::new(self.deps.store.clone(), self.deps.chat.clone(), &session.id);
        info!(session = %session.id, user = %self.identity.user_id, "attached to session");

        Ok(ActiveSession {
            session,
            identity: self.identity.clone(),
            coordinator,
            manager,
            presence,
            chat,
            media,
            shutdown: handle,
            tasks,
        })
    }
}

/// Translate membership changes into peer connection lifecycle. A terminal
/// session status tears every link down without a bye: the document already
/// told everyone.
fn spawn_presence_bridge(
    manager: Arc<PeerConnectionManager>,
    mut events: broadcast::Receiver<PresenceEvent>,
    mut signal: shutdown::ShutdownSignal,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = signal.wait() => break,
                event = events.recv() => match event {
                    Ok(PresenceEvent::Joined(participant)) => {
                        manager.on_peer_joined(&participant.user_id).await;
                    }
                    Ok(PresenceEvent::Left(user) | PresenceEvent::Evicted(user)) => {
                        manager.on_peer_left(&user).await;
                    }
                    Ok(PresenceEvent::StatusChanged(status)) if status.is_terminal() => {
                        manager.close_all(false).await;
                        break;
                    }
                    Ok(PresenceEvent::StatusChanged(_)) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "presence event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    })
}

/// A live membership. Dropping it without calling [`leave`] or
/// [`end_for_all`] stops the background tasks but leaves the document to
/// the heartbeat sweep, exactly like a crashed client.
///
/// [`leave`]: ActiveSession::leave
/// [`end_for_all`]: ActiveSession::end_for_all
pub struct ActiveSession {
    session: Session,
    identity: Identity,
    coordinator: SessionCoordinator,
    manager: Arc<PeerConnectionManager>,
    presence: PresenceTracker,
    chat: ChatChannel,
    media: Option<MediaHandle>,
    shutdown: ShutdownHandle,
    tasks: Vec<JoinHandle<()>>,
}

impl fmt::Debug for ActiveSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveSession")
            .field("session", &self.session)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl ActiveSession {
    pub fn id(&self) -> &str {
        &self.session.id
    }

    pub fn kind(&self) -> SessionKind {
        self.session.kind
    }

    pub fn has_media(&self) -> bool {
        self.media.is_some()
    }

    pub fn peer_events(&self) -> broadcast::Receiver<PeerEvent> {
        self.manager.subscribe_events()
    }

    pub fn presence_events(&self) -> broadcast::Receiver<PresenceEvent> {
        self.presence.subscribe()
    }

    pub fn chat(&self) -> &ChatChannel {
        &self.chat
    }

    pub async fn connected_peers(&self) -> Vec<UserId> {
        self.manager.connected_peers().await
    }

    pub async fn updates(&self) -> Result<SessionWatch, ClientError> {
        Ok(self.coordinator.subscribe(&self.session.id).await?)
    }

    /// Leave gracefully: bye the peers, stop heartbeating, release local
    /// media, remove this participant from the document.
    pub async fn leave(self) -> Result<Session, ClientError> {
        self.teardown(Departure::Leave).await
    }

    /// Host-only: end the session for every participant.
    pub async fn end_for_all(self) -> Result<Session, ClientError> {
        self.teardown(Departure::EndForAll).await
    }

    async fn teardown(mut self, departure: Departure) -> Result<Session, ClientError> {
        // Local cleanup never waits on the store: stop the tasks (the
        // manager's run loop closes every link on shutdown) and release
        // media before the first store write.
        self.shutdown.trigger();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        self.media.take();

        // The links are already gone; this only broadcasts the bye.
        self.manager.close_all(true).await;

        // Transient store trouble is retried rather than surfaced as a
        // stuck session.
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(2), 3);
        loop {
            let result = match departure {
                Departure::Leave => {
                    self.coordinator
                        .leave(&self.session.id, &self.identity.user_id)
                        .await
                }
                Departure::EndForAll => {
                    self.coordinator
                        .end(&self.session.id, &self.identity.user_id, true)
                        .await
                }
            };
            match result {
                Err(SessionError::Unavailable(reason)) => match backoff.next_delay() {
                    Some(delay) => {
                        warn!(session = %self.session.id, %reason, "departing write failed, retrying");
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(SessionError::Unavailable(reason).into()),
                },
                other => return Ok(other?),
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Departure {
    Leave,
    EndForAll,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_overlay_onto_defaults() {
        let settings = ClientSettings {
            active_threshold: Some(3),
            heartbeat_secs: Some(2),
            ..ClientSettings::default()
        };
        let config = settings.into_config();
        assert_eq!(config.coordinator.active_threshold, 3);
        assert_eq!(config.presence.heartbeat_interval, Duration::from_secs(2));
        assert_eq!(config.presence.sweep_interval, Duration::from_secs(2));
        assert_eq!(config.mailbox_retention, DEFAULT_MAILBOX_RETENTION);
    }

    #[test]
    fn settings_parse_from_json() {
        let raw = r#"{
            "active_threshold": 2,
            "ice_servers": [{"urls": ["stun:stun.example.org:3478"]}],
            "store_url": "https://store.example.org"
        }"#;
        let settings: ClientSettings = serde_json::from_str(raw).unwrap();
        let config = settings.into_config();
        assert_eq!(config.peer.rtc.ice_servers.len(), 1);
        assert_eq!(
            config.store_url.as_deref(),
            Some("https://store.example.org")
        );
    }
}
