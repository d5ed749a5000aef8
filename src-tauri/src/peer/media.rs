use crate::error::{CallError, MediaAccessCause, MediaAccessError};
use crate::utils::random_id;
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// What the call asks the capture devices for. Audio is always requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    pub fn for_call(is_video: bool) -> Self {
        Self {
            audio: true,
            video: is_video,
        }
    }
}

/// Локальный трек захвата
///
/// Capture code feeds samples through [`LocalTrack::write_sample`]; the
/// `enabled` flag is what mute / camera-off flips.
pub struct LocalTrack {
    kind: TrackKind,
    enabled: AtomicBool,
    live: AtomicBool,
    rtc: Arc<TrackLocalStaticSample>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, stream_id: &str) -> Self {
        let codec = match kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                rtcp_feedback: vec![],
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
        };
        let track_id = format!("{}-{}", kind.label(), random_id());
        Self {
            kind,
            enabled: AtomicBool::new(true),
            live: AtomicBool::new(true),
            rtc: Arc::new(TrackLocalStaticSample::new(
                codec,
                track_id,
                stream_id.to_owned(),
            )),
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        self.rtc.id()
    }

    pub fn rtc(&self) -> &Arc<TrackLocalStaticSample> {
        &self.rtc
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Flips the enabled flag and returns the new value.
    pub fn toggle(&self) -> bool {
        !self.enabled.fetch_xor(true, Ordering::SeqCst)
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        if self.live.swap(false, Ordering::SeqCst) {
            debug!("Stopped local {} track {}", self.kind.label(), self.id());
        }
    }

    /// Пишет сэмпл в трек. Возвращает false, если трек выключен или остановлен.
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<bool, CallError> {
        if !self.is_live() || !self.is_enabled() {
            return Ok(false);
        }
        self.rtc
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await?;
        Ok(true)
    }
}

impl TrackKind {
    pub fn label(&self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }
}

/// Захваченный локальный поток: аудио всегда, видео опционально
#[derive(Clone)]
pub struct LocalMedia {
    pub stream_id: String,
    pub audio: Arc<LocalTrack>,
    pub video: Option<Arc<LocalTrack>>,
}

impl LocalMedia {
    pub fn new(constraints: MediaConstraints) -> Self {
        let stream_id = format!("ssc-{}", random_id());
        let audio = Arc::new(LocalTrack::new(TrackKind::Audio, &stream_id));
        let video = constraints
            .video
            .then(|| Arc::new(LocalTrack::new(TrackKind::Video, &stream_id)));
        Self {
            stream_id,
            audio,
            video,
        }
    }

    pub fn tracks(&self) -> impl Iterator<Item = &Arc<LocalTrack>> {
        std::iter::once(&self.audio).chain(self.video.iter())
    }

    pub fn track(&self, kind: TrackKind) -> Option<&Arc<LocalTrack>> {
        match kind {
            TrackKind::Audio => Some(&self.audio),
            TrackKind::Video => self.video.as_ref(),
        }
    }

    pub fn stop(&self) {
        for track in self.tracks() {
            track.stop();
        }
    }

    pub fn is_live(&self) -> bool {
        self.tracks().any(|t| t.is_live())
    }
}

impl std::fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMedia")
            .field("stream_id", &self.stream_id)
            .field("video", &self.video.is_some())
            .field("live", &self.is_live())
            .finish()
    }
}

/// Источник локального медиа (микрофон / камера)
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn open(&self, constraints: MediaConstraints) -> Result<LocalMedia, MediaAccessError>;
}

/// Devices backed by sample-fed tracks; the actual capture loop lives outside
/// and pushes encoded frames into the returned tracks.
pub struct SampleDevices {
    microphone: bool,
    camera: bool,
    current: Mutex<Option<LocalMedia>>,
}

impl SampleDevices {
    pub fn new(microphone: bool, camera: bool) -> Self {
        Self {
            microphone,
            camera,
            current: Mutex::new(None),
        }
    }
}

impl Default for SampleDevices {
    fn default() -> Self {
        Self::new(true, true)
    }
}

#[async_trait]
impl MediaDevices for SampleDevices {
    async fn open(&self, constraints: MediaConstraints) -> Result<LocalMedia, MediaAccessError> {
        if constraints.audio && !self.microphone {
            return Err(MediaAccessError::with_detail(
                MediaAccessCause::NotFound,
                "no audio input",
            ));
        }
        if constraints.video && !self.camera {
            return Err(MediaAccessError::with_detail(
                MediaAccessCause::NotFound,
                "no video input",
            ));
        }

        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if current.as_ref().is_some_and(LocalMedia::is_live) {
            return Err(MediaAccessError::new(MediaAccessCause::Busy));
        }

        let media = LocalMedia::new(constraints);
        info!(
            "Opened local media {} (video: {})",
            media.stream_id, constraints.video
        );
        *current = Some(media.clone());
        Ok(media)
    }
}
