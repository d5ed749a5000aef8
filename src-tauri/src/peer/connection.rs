use crate::error::CallError;
use crate::logger::{dump_candidate, dump_selected_pair};
use crate::peer::ice::rtc_config;
use crate::peer::media::{LocalMedia, TrackKind};
use crate::peer::types::{IceCandidate, ServerConfig, SessionDescription};
use crate::peer::{LinkState, PeerEvent, PeerEventSink, PeerFactory, PeerLink, RemoteTrack};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::{Arc, PoisonError, RwLock};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Фабрика peer connection поверх webrtc-rs
pub struct RtcPeerFactory {
    ice_servers: RwLock<Vec<ServerConfig>>,
}

impl RtcPeerFactory {
    pub fn new(ice_servers: Vec<ServerConfig>) -> Self {
        Self {
            ice_servers: RwLock::new(ice_servers),
        }
    }

    /// Применяется к следующему звонку; текущее соединение не трогаем
    pub fn set_ice_servers(&self, servers: Vec<ServerConfig>) {
        info!("Using {} ICE servers for new calls", servers.len());
        *self.ice_servers.write().unwrap_or_else(PoisonError::into_inner) = servers;
    }

    pub fn ice_servers(&self) -> Vec<ServerConfig> {
        self.ice_servers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn connect(
        &self,
        media: &LocalMedia,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerLink>, CallError> {
        let mut engine = MediaEngine::default();
        engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut engine)?;
        let api = APIBuilder::new()
            .with_media_engine(engine)
            .with_interceptor_registry(registry)
            .build();

        let config = rtc_config(&self.ice_servers());
        let pc = Arc::new(api.new_peer_connection(config).await?);

        for track in media.tracks() {
            let sender = pc
                .add_track(Arc::clone(track.rtc()) as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
            debug!("Added local {} track to peer connection", track.kind().label());

            // RTCP надо вычитывать, иначе интерсепторы встанут
            tokio::spawn(async move {
                let mut rtcp_buf = vec![0u8; 1500];
                while let Ok((_, _)) = sender.read(&mut rtcp_buf).await {}
            });
        }

        // локальные кандидаты (Trickle-ICE)
        let sink = events.clone();
        pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
            match cand {
                Some(c) => match c.to_json() {
                    Ok(init) => {
                        let candidate = IceCandidate::from(init);
                        dump_candidate("LOCAL", &candidate);
                        sink.emit(PeerEvent::LocalCandidate(candidate));
                    }
                    Err(e) => warn!("Failed to serialize local ICE candidate: {e}"),
                },
                None => debug!("ICE candidate gathering completed"),
            }
            Box::pin(async {})
        }));

        let sink = events.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let kind = match track.kind() {
                    RTPCodecType::Video => TrackKind::Video,
                    _ => TrackKind::Audio,
                };
                info!("Remote {} track arrived: {}", kind.label(), track.id());
                sink.emit(PeerEvent::RemoteTrack(RemoteTrack {
                    id: track.id(),
                    stream_id: track.stream_id(),
                    kind,
                    rtc: Some(track),
                }));
                Box::pin(async {})
            },
        ));

        let pc_stats = Arc::downgrade(&pc);
        pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
            info!("Peer connection state changed to: {:?}", st);
            if matches!(
                st,
                RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed
            ) {
                if let Some(pc) = pc_stats.upgrade() {
                    tokio::spawn(async move {
                        dump_selected_pair(&pc, "BEFORE-FAIL").await;
                    });
                }
            }
            events.emit(PeerEvent::StateChanged(LinkState::from(st)));
            Box::pin(async {})
        }));

        Ok(Arc::new(RtcPeerLink { pc }))
    }
}

pub struct RtcPeerLink {
    pc: Arc<RTCPeerConnection>,
}

impl RtcPeerLink {
    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }
}

#[async_trait]
impl PeerLink for RtcPeerLink {
    async fn create_offer(&self) -> Result<SessionDescription, CallError> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(SessionDescription::try_from(offer)?)
    }

    async fn create_answer(&self) -> Result<SessionDescription, CallError> {
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(SessionDescription::try_from(answer)?)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), CallError> {
        let desc = RTCSessionDescription::try_from(desc)?;
        self.pc.set_remote_description(desc).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CallError> {
        dump_candidate("REMOTE", &candidate);
        self.pc.add_ice_candidate(candidate.into()).await?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.pc.connection_state() == RTCPeerConnectionState::Connected
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!("Failed to close peer connection: {e}");
        }
    }
}
