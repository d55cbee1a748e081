use std::{collections::HashMap, sync::Arc, time::Duration};

use common_infra::{backoff::Backoff, metrics::signaling_metrics, shutdown::ShutdownSignal};
use session_store::{SignalKind, SignalingMessage, UserId};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    message::{IceCandidate, RtcConfig, SdpPayload},
    relay::SignalingRelay,
    transport::{LinkState, PeerTransport, PeerTransportFactory, TransportEvent},
};

#[derive(Debug, Clone)]
pub struct PeerManagerConfig {
    pub rtc: RtcConfig,
    /// Fresh offers issued after a transport failure before the peer is
    /// reported unreachable.
    pub max_renegotiations: u32,
    pub renegotiation_backoff: Duration,
}

impl Default for PeerManagerConfig {
    fn default() -> Self {
        Self {
            rtc: RtcConfig::default(),
            max_renegotiations: 2,
            renegotiation_backoff: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Connected(UserId),
    Unreachable(UserId),
    Closed(UserId),
}

enum LinkNote {
    Connected(UserId),
    Failed(UserId),
    LocalCandidate(UserId, IceCandidate),
}

struct PeerLink {
    transport: Arc<dyn PeerTransport>,
    backoff: Backoff,
    watcher: JoinHandle<()>,
}

impl PeerLink {
    async fn close(self) {
        self.transport.close().await;
        self.watcher.abort();
    }
}

/// Owns one transport per remote participant. The side with the
/// lexicographically smaller user id initiates; the other answers on its
/// own transport - an offer is never answered by the connection that
/// created it. Candidates that outrun the remote description are buffered
/// and flushed once negotiation lands.
pub struct PeerConnectionManager {
    relay: SignalingRelay,
    factory: Arc<dyn PeerTransportFactory>,
    config: PeerManagerConfig,
    links: Mutex<HashMap<UserId, PeerLink>>,
    early_candidates: Mutex<HashMap<UserId, Vec<IceCandidate>>>,
    notes_tx: mpsc::UnboundedSender<LinkNote>,
    notes_rx: Mutex<Option<mpsc::UnboundedReceiver<LinkNote>>>,
    events_tx: broadcast::Sender<PeerEvent>,
}

impl PeerConnectionManager {
    pub fn new(
        relay: SignalingRelay,
        factory: Arc<dyn PeerTransportFactory>,
        config: PeerManagerConfig,
    ) -> Self {
        let (notes_tx, notes_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(64);
        Self {
            relay,
            factory,
            config,
            links: Mutex::new(HashMap::new()),
            early_candidates: Mutex::new(HashMap::new()),
            notes_tx,
            notes_rx: Mutex::new(Some(notes_rx)),
            events_tx,
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PeerEvent> {
        self.events_tx.subscribe()
    }

    /// Deterministic initiator tie-break: the smaller user id offers.
    pub fn initiates_to(&self, remote: &str) -> bool {
        self.relay.local_user() < remote
    }

    pub async fn connected_peers(&self) -> Vec<UserId> {
        let links = self.links.lock().await;
        links
            .iter()
            .filter(|(_, link)| matches!(link.transport.state(), LinkState::Connected))
            .map(|(user, _)| user.clone())
            .collect()
    }

    /// Consume relay messages and transport notes until shutdown, then
    /// close every link.
    pub async fn run(
        self: Arc<Self>,
        mut inbox: mpsc::UnboundedReceiver<SignalingMessage>,
        mut shutdown: ShutdownSignal,
    ) {
        let mut notes_rx = self
            .notes_rx
            .lock()
            .await
            .take()
            .expect("peer manager run() called twice");

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                message = inbox.recv() => match message {
                    Some(message) => self.handle_signal(message).await,
                    None => break,
                },
                note = notes_rx.recv() => match note {
                    Some(note) => self.handle_note(note).await,
                    None => break,
                },
            }
        }

        self.close_all(false).await;
    }

    /// A new remote participant appeared. The initiating side opens a
    /// transport and offers; the other side waits for that offer.
    pub async fn on_peer_joined(self: &Arc<Self>, remote: &str) {
        if remote == self.relay.local_user() || !self.initiates_to(remote) {
            return;
        }
        if self.links.lock().await.contains_key(remote) {
            return;
        }
        let backoff = self.fresh_backoff();
        self.open_link(remote, backoff).await;
    }

    pub async fn on_peer_left(&self, remote: &str) {
        let removed = self.links.lock().await.remove(remote);
        self.early_candidates.lock().await.remove(remote);
        if let Some(link) = removed {
            link.close().await;
            debug!(peer = remote, "peer link closed");
            let _ = self.events_tx.send(PeerEvent::Closed(remote.to_string()));
        }
    }

    /// Close every link; optionally broadcast a bye first so peers tear
    /// down without waiting for the heartbeat sweep.
    pub async fn close_all(&self, send_bye: bool) {
        if send_bye {
            if let Err(err) = self.relay.send_bye().await {
                warn!(%err, "bye broadcast failed");
            }
        }
        let drained: Vec<(UserId, PeerLink)> = self.links.lock().await.drain().collect();
        self.early_candidates.lock().await.clear();
        for (remote, link) in drained {
            link.close().await;
            let _ = self.events_tx.send(PeerEvent::Closed(remote));
        }
    }

    pub async fn handle_signal(self: &Arc<Self>, message: SignalingMessage) {
        let from = message.from_user.clone();
        match message.kind {
            SignalKind::Offer => self.handle_offer(&from, message).await,
            SignalKind::Answer => self.handle_answer(&from, message).await,
            SignalKind::IceCandidate => self.handle_candidate(&from, message).await,
            SignalKind::Bye => self.on_peer_left(&from).await,
        }
    }

    async fn handle_offer(self: &Arc<Self>, from: &str, message: SignalingMessage) {
        if self.initiates_to(from) {
            // The tie-break says we offer to them; an inbound offer from
            // that side is a protocol violation, not a renegotiation.
            warn!(peer = from, "dropping offer from non-initiating peer");
            return;
        }
        let offer: SdpPayload = match serde_json::from_value(message.payload) {
            Ok(offer) => offer,
            Err(err) => {
                warn!(peer = from, %err, "undecodable offer payload");
                return;
            }
        };

        // A fresh offer replaces any previous transport (renegotiation).
        if let Some(old) = self.links.lock().await.remove(from) {
            old.close().await;
        }

        let transport = match self.factory.create(&self.config.rtc).await {
            Ok(transport) => transport,
            Err(err) => {
                warn!(peer = from, %err, "transport creation failed");
                return;
            }
        };
        let watcher = self.spawn_watcher(from.to_string(), transport.clone());

        let answer = match transport.accept_offer(offer).await {
            Ok(answer) => answer,
            Err(err) => {
                warn!(peer = from, %err, "offer rejected; waiting for renegotiation");
                transport.close().await;
                watcher.abort();
                return;
            }
        };
        if let Err(err) = self.relay.send_answer(from, &answer).await {
            warn!(peer = from, %err, "answer send failed");
        }

        self.links.lock().await.insert(
            from.to_string(),
            PeerLink {
                transport: transport.clone(),
                backoff: self.fresh_backoff(),
                watcher,
            },
        );
        self.flush_candidates(from, &transport).await;
    }

    async fn handle_answer(self: &Arc<Self>, from: &str, message: SignalingMessage) {
        let answer: SdpPayload = match serde_json::from_value(message.payload) {
            Ok(answer) => answer,
            Err(err) => {
                warn!(peer = from, %err, "undecodable answer payload");
                return;
            }
        };
        let transport = match self.links.lock().await.get(from) {
            Some(link) => link.transport.clone(),
            None => {
                debug!(peer = from, "answer for a link that no longer exists");
                return;
            }
        };
        if let Err(err) = transport.accept_answer(answer).await {
            warn!(peer = from, %err, "answer rejected");
            let _ = self.notes_tx.send(LinkNote::Failed(from.to_string()));
            return;
        }
        self.flush_candidates(from, &transport).await;
    }

    async fn handle_candidate(self: &Arc<Self>, from: &str, message: SignalingMessage) {
        let candidate: IceCandidate = match serde_json::from_value(message.payload) {
            Ok(candidate) => candidate,
            Err(err) => {
                warn!(peer = from, %err, "undecodable candidate payload");
                return;
            }
        };

        let ready = {
            let links = self.links.lock().await;
            links
                .get(from)
                .filter(|link| link.transport.has_remote_description())
                .map(|link| link.transport.clone())
        };

        match ready {
            Some(transport) => {
                if let Err(err) = transport.add_ice_candidate(candidate).await {
                    warn!(peer = from, %err, "candidate rejected");
                }
            }
            // Candidate outran the offer/answer; hold it until the remote
            // description is set.
            None => self
                .early_candidates
                .lock()
                .await
                .entry(from.to_string())
                .or_default()
                .push(candidate),
        }
    }

    async fn handle_note(self: &Arc<Self>, note: LinkNote) {
        match note {
            LinkNote::Connected(remote) => {
                if let Some(link) = self.links.lock().await.get_mut(&remote) {
                    link.backoff.reset();
                }
                info!(peer = %remote, "peer transport connected");
                let _ = self.events_tx.send(PeerEvent::Connected(remote));
            }
            LinkNote::LocalCandidate(remote, candidate) => {
                if let Err(err) = self.relay.send_candidate(&remote, &candidate).await {
                    warn!(peer = %remote, %err, "candidate send failed");
                }
            }
            LinkNote::Failed(remote) => self.handle_link_failure(remote).await,
        }
    }

    async fn handle_link_failure(self: &Arc<Self>, remote: UserId) {
        if !self.initiates_to(&remote) {
            // The initiating side renegotiates; this side just drops the
            // dead transport and waits for the fresh offer.
            if let Some(link) = self.links.lock().await.remove(&remote) {
                link.close().await;
            }
            debug!(peer = %remote, "link failed, awaiting renegotiation");
            return;
        }

        let (delay, backoff) = {
            let mut links = self.links.lock().await;
            let Some(link) = links.get_mut(&remote) else {
                return;
            };
            match link.backoff.next_delay() {
                Some(delay) => (delay, link.backoff.clone()),
                None => {
                    let link = links.remove(&remote).expect("link present");
                    drop(links);
                    link.close().await;
                    signaling_metrics().inc_peers_unreachable();
                    warn!(peer = %remote, "renegotiation budget exhausted");
                    let _ = self.events_tx.send(PeerEvent::Unreachable(remote));
                    return;
                }
            }
        };

        signaling_metrics().inc_renegotiations();
        if let Some(link) = self.links.lock().await.remove(&remote) {
            link.close().await;
        }
        let manager = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.open_link(&remote, backoff).await;
        });
    }

    /// Create a transport for `remote`, register the link, and (as the
    /// initiating side) send a fresh offer. Failures are funneled back as
    /// link-failure notes so the backoff budget governs them uniformly.
    async fn open_link(self: &Arc<Self>, remote: &str, backoff: Backoff) {
        let transport = match self.factory.create(&self.config.rtc).await {
            Ok(transport) => transport,
            Err(err) => {
                warn!(peer = remote, %err, "transport creation failed");
                return;
            }
        };
        let watcher = self.spawn_watcher(remote.to_string(), transport.clone());
        self.links.lock().await.insert(
            remote.to_string(),
            PeerLink {
                transport: transport.clone(),
                backoff,
                watcher,
            },
        );

        let offer = match transport.create_offer().await {
            Ok(offer) => offer,
            Err(err) => {
                debug!(peer = remote, %err, "offer creation failed");
                let _ = self.notes_tx.send(LinkNote::Failed(remote.to_string()));
                return;
            }
        };
        if let Err(err) = self.relay.send_offer(remote, &offer).await {
            warn!(peer = remote, %err, "offer send failed");
            let _ = self.notes_tx.send(LinkNote::Failed(remote.to_string()));
        }
    }

    async fn flush_candidates(&self, remote: &str, transport: &Arc<dyn PeerTransport>) {
        let held = self.early_candidates.lock().await.remove(remote);
        let Some(held) = held else { return };
        for candidate in held {
            if let Err(err) = transport.add_ice_candidate(candidate).await {
                warn!(peer = remote, %err, "buffered candidate rejected");
            }
        }
    }

    fn fresh_backoff(&self) -> Backoff {
        Backoff::new(
            self.config.renegotiation_backoff,
            self.config.renegotiation_backoff.saturating_mul(8),
            self.config.max_renegotiations,
        )
    }

    fn spawn_watcher(
        &self,
        remote: UserId,
        transport: Arc<dyn PeerTransport>,
    ) -> JoinHandle<()> {
        let notes = self.notes_tx.clone();
        let mut events = transport.subscribe_events();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(TransportEvent::StateChanged(LinkState::Connected)) => {
                        let _ = notes.send(LinkNote::Connected(remote.clone()));
                    }
                    Ok(TransportEvent::StateChanged(LinkState::Failed)) => {
                        let _ = notes.send(LinkNote::Failed(remote.clone()));
                    }
                    Ok(TransportEvent::StateChanged(LinkState::Closed)) => break,
                    Ok(TransportEvent::StateChanged(_)) => {}
                    Ok(TransportEvent::LocalCandidate(candidate)) => {
                        let _ = notes.send(LinkNote::LocalCandidate(remote.clone(), candidate));
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(peer = %remote, skipped, "transport event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
