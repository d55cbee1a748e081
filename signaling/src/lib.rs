pub mod media;
pub mod message;
pub mod peer;
pub mod relay;
pub mod transport;

pub use media::{MediaError, MediaHandle, MediaSource, StaticMedia};
pub use message::{IceCandidate, IceServer, RtcConfig, SdpPayload};
pub use peer::{PeerConnectionManager, PeerEvent, PeerManagerConfig};
pub use relay::SignalingRelay;
pub use transport::{
    LinkState, LoopbackFactory, PeerTransport, PeerTransportFactory, TransportError,
    TransportEvent,
};
