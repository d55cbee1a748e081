use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::message::{IceCandidate, RtcConfig, SdpPayload};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    StateChanged(LinkState),
    LocalCandidate(IceCandidate),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("no remote description set")]
    NoRemoteDescription,
    #[error("unexpected sdp kind: {0}")]
    UnexpectedSdp(String),
    #[error("transport closed")]
    Closed,
    #[error("negotiation failed: {0}")]
    Negotiation(String),
}

/// One peer connection. Exactly one per remote participant: offers are
/// created on the initiating side's transport and answered on the receiving
/// side's own transport, never looped back.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SdpPayload, TransportError>;

    /// Set the remote offer and produce the local answer.
    async fn accept_offer(&self, offer: SdpPayload) -> Result<SdpPayload, TransportError>;

    async fn accept_answer(&self, answer: SdpPayload) -> Result<(), TransportError>;

    /// Requires the remote description; callers buffer early candidates.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    fn state(&self) -> LinkState;

    fn has_remote_description(&self) -> bool;

    fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent>;

    async fn close(&self);
}

#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    async fn create(&self, config: &RtcConfig) -> Result<Arc<dyn PeerTransport>, TransportError>;
}

#[derive(Default)]
struct LoopbackNet {
    offline: AtomicBool,
    endpoints: Mutex<Vec<Arc<LoopbackTransport>>>,
}

/// Channel-backed transport pair for tests and the loopback demo. Connects
/// as soon as the offer/answer round trip completes; candidates are counted
/// but carry no routing information.
pub struct LoopbackTransport {
    id: String,
    net: Arc<LoopbackNet>,
    state: Mutex<LinkState>,
    remote_set: AtomicBool,
    candidates_received: AtomicUsize,
    events: broadcast::Sender<TransportEvent>,
}

impl LoopbackTransport {
    fn new(net: Arc<LoopbackNet>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            id: Uuid::new_v4().to_string(),
            net,
            state: Mutex::new(LinkState::New),
            remote_set: AtomicBool::new(false),
            candidates_received: AtomicUsize::new(0),
            events,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn candidates_received(&self) -> usize {
        self.candidates_received.load(Ordering::SeqCst)
    }

    fn set_state(&self, next: LinkState) {
        *self.state.lock().expect("loopback state lock") = next;
        let _ = self.events.send(TransportEvent::StateChanged(next));
    }

    fn emit_local_candidate(&self) {
        let fragment: String = self.id.chars().take(8).collect();
        let _ = self.events.send(TransportEvent::LocalCandidate(IceCandidate {
            candidate: "candidate:1 1 UDP 2122252543 198.51.100.1 49152 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
            username_fragment: Some(fragment),
        }));
    }

    fn ensure_online(&self) -> Result<(), TransportError> {
        if self.net.offline.load(Ordering::SeqCst) {
            return Err(TransportError::Negotiation(
                "loopback network is offline".to_string(),
            ));
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if matches!(self.state(), LinkState::Closed) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn create_offer(&self) -> Result<SdpPayload, TransportError> {
        self.ensure_open()?;
        self.ensure_online()?;
        self.set_state(LinkState::Connecting);
        self.emit_local_candidate();
        Ok(SdpPayload::offer(format!("v=0 loopback endpoint={}", self.id)))
    }

    async fn accept_offer(&self, offer: SdpPayload) -> Result<SdpPayload, TransportError> {
        self.ensure_open()?;
        self.ensure_online()?;
        if !offer.is_offer() {
            return Err(TransportError::UnexpectedSdp(offer.kind));
        }
        self.remote_set.store(true, Ordering::SeqCst);
        self.set_state(LinkState::Connected);
        self.emit_local_candidate();
        debug!(endpoint = %self.id, "remote offer accepted");
        Ok(SdpPayload::answer(format!(
            "v=0 loopback endpoint={}",
            self.id
        )))
    }

    async fn accept_answer(&self, answer: SdpPayload) -> Result<(), TransportError> {
        self.ensure_open()?;
        if !answer.is_answer() {
            return Err(TransportError::UnexpectedSdp(answer.kind));
        }
        self.remote_set.store(true, Ordering::SeqCst);
        self.set_state(LinkState::Connected);
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<(), TransportError> {
        if !self.remote_set.load(Ordering::SeqCst) {
            return Err(TransportError::NoRemoteDescription);
        }
        self.candidates_received.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn state(&self) -> LinkState {
        *self.state.lock().expect("loopback state lock")
    }

    fn has_remote_description(&self) -> bool {
        self.remote_set.load(Ordering::SeqCst)
    }

    fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    async fn close(&self) {
        if !matches!(self.state(), LinkState::Closed) {
            self.set_state(LinkState::Closed);
        }
    }
}

/// Factory shared by every participant of a loopback run. Test hooks can
/// take the network offline or fail established links to drive the
/// renegotiation path.
#[derive(Clone, Default)]
pub struct LoopbackFactory {
    net: Arc<LoopbackNet>,
}

impl LoopbackFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.net.offline.store(offline, Ordering::SeqCst);
    }

    pub fn created_count(&self) -> usize {
        self.net.endpoints.lock().expect("loopback net lock").len()
    }

    pub fn endpoints(&self) -> Vec<Arc<LoopbackTransport>> {
        self.net
            .endpoints
            .lock()
            .expect("loopback net lock")
            .clone()
    }

    /// Mark every connected endpoint failed, as a dropped network would.
    pub fn fail_established_links(&self) -> usize {
        let endpoints = self.net.endpoints.lock().expect("loopback net lock");
        let mut failed = 0;
        for endpoint in endpoints.iter() {
            if matches!(endpoint.state(), LinkState::Connected) {
                endpoint.set_state(LinkState::Failed);
                failed += 1;
            }
        }
        failed
    }
}

#[async_trait]
impl PeerTransportFactory for LoopbackFactory {
    async fn create(&self, _config: &RtcConfig) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let transport = Arc::new(LoopbackTransport::new(self.net.clone()));
        self.net
            .endpoints
            .lock()
            .expect("loopback net lock")
            .push(transport.clone());
        Ok(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn offer_answer_connects_both_sides() {
        let factory = LoopbackFactory::new();
        let config = RtcConfig::default();
        let caller = factory.create(&config).await.unwrap();
        let callee = factory.create(&config).await.unwrap();

        let offer = caller.create_offer().await.unwrap();
        assert_eq!(caller.state(), LinkState::Connecting);

        let answer = callee.accept_offer(offer).await.unwrap();
        assert_eq!(callee.state(), LinkState::Connected);

        caller.accept_answer(answer).await.unwrap();
        assert_eq!(caller.state(), LinkState::Connected);
    }

    #[tokio::test]
    async fn candidate_requires_remote_description() {
        let factory = LoopbackFactory::new();
        let transport = factory.create(&RtcConfig::default()).await.unwrap();
        let candidate = IceCandidate {
            candidate: "candidate:1".into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        };

        assert_eq!(
            transport.add_ice_candidate(candidate.clone()).await,
            Err(TransportError::NoRemoteDescription)
        );

        transport
            .accept_offer(SdpPayload::offer("v=0"))
            .await
            .unwrap();
        transport.add_ice_candidate(candidate).await.unwrap();
    }

    #[tokio::test]
    async fn rejects_mismatched_sdp_kinds() {
        let factory = LoopbackFactory::new();
        let transport = factory.create(&RtcConfig::default()).await.unwrap();

        assert!(matches!(
            transport.accept_offer(SdpPayload::answer("v=0")).await,
            Err(TransportError::UnexpectedSdp(_))
        ));
        assert!(matches!(
            transport.accept_answer(SdpPayload::offer("v=0")).await,
            Err(TransportError::UnexpectedSdp(_))
        ));
    }

    #[tokio::test]
    async fn offline_network_fails_negotiation() {
        let factory = LoopbackFactory::new();
        let transport = factory.create(&RtcConfig::default()).await.unwrap();
        factory.set_offline(true);

        assert!(matches!(
            transport.create_offer().await,
            Err(TransportError::Negotiation(_))
        ));
    }

    #[tokio::test]
    async fn failing_links_emits_state_change() {
        let factory = LoopbackFactory::new();
        let transport = factory.create(&RtcConfig::default()).await.unwrap();
        let mut events = transport.subscribe_events();

        transport
            .accept_offer(SdpPayload::offer("v=0"))
            .await
            .unwrap();
        assert_eq!(factory.fail_established_links(), 1);

        let mut saw_failed = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, TransportEvent::StateChanged(LinkState::Failed)) {
                saw_failed = true;
            }
        }
        assert!(saw_failed);
    }
}
