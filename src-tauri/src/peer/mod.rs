pub mod connection;
pub mod ice;
pub mod media;
pub mod types;

pub use connection::{RtcPeerFactory, RtcPeerLink};
pub use media::{LocalMedia, LocalTrack, MediaConstraints, MediaDevices, SampleDevices, TrackKind};
pub use types::{IceCandidate, SdpKind, ServerConfig, SessionDescription};

use crate::error::CallError;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::track::track_remote::TrackRemote;

/// Состояние транспортного соединения
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl From<RTCPeerConnectionState> for LinkState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => LinkState::Connecting,
            RTCPeerConnectionState::Connected => LinkState::Connected,
            RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
            RTCPeerConnectionState::Failed => LinkState::Failed,
            RTCPeerConnectionState::Closed => LinkState::Closed,
            _ => LinkState::New,
        }
    }
}

/// Удалённый трек (появляется асинхронно, когда приходит медиа собеседника)
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
    /// Handle for the renderer; absent for links that carry no real media.
    pub rtc: Option<Arc<TrackRemote>>,
}

impl std::fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    RemoteTrack(RemoteTrack),
    StateChanged(LinkState),
}

/// Callback handed to a link at creation; the coordinator tags everything it
/// receives with the call attempt that created the link.
#[derive(Clone)]
pub struct PeerEventSink(Arc<dyn Fn(PeerEvent) + Send + Sync>);

impl PeerEventSink {
    pub fn new(f: impl Fn(PeerEvent) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn emit(&self, event: PeerEvent) {
        (self.0)(event)
    }
}

/// Connection handle for one call.
///
/// `create_offer` / `create_answer` also install the result as the local
/// description, which is what starts candidate gathering.
#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, CallError>;
    async fn create_answer(&self) -> Result<SessionDescription, CallError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), CallError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CallError>;
    fn is_connected(&self) -> bool;
    async fn close(&self);
}

#[async_trait]
pub trait PeerFactory: Send + Sync {
    /// Builds a connection carrying `media`'s tracks.
    async fn connect(
        &self,
        media: &LocalMedia,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerLink>, CallError>;
}
