use crate::peer::{IceCandidate, LocalMedia, PeerLink, RemoteTrack, SessionDescription};
use crate::utils::unix_millis;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Идентификатор собеседника. Сервер отдаёт числовые id пользователей, но
/// держим и строковые; на провод уходит в том же виде, в каком пришёл.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParticipantId {
    Numeric(i64),
    Named(String),
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParticipantId::Numeric(id) => write!(f, "{id}"),
            ParticipantId::Named(id) => f.write_str(id),
        }
    }
}

impl From<i64> for ParticipantId {
    fn from(id: i64) -> Self {
        ParticipantId::Numeric(id)
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        ParticipantId::Named(id.to_owned())
    }
}

/// Токен комнаты; им помечаются все сообщения одного звонка
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn generate() -> Self {
        RoomId(format!("call_{}", unix_millis()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(id: &str) -> Self {
        RoomId(id.to_owned())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone)]
pub struct CallSession {
    pub remote_id: ParticipantId,
    pub remote_name: Option<String>,
    pub room_id: RoomId,
    pub is_video: bool,
    pub role: Role,
    /// Remote candidates that arrived before there was a remote description to attach them to.
    pub(crate) pending_candidates: Vec<IceCandidate>,
    /// Local candidates gathered before our offer/answer went out.
    pub(crate) outbound_candidates: Vec<IceCandidate>,
    pub(crate) sent_candidates: Vec<IceCandidate>,
    pub(crate) description_sent: bool,
    pub(crate) connected_at: Option<DateTime<Utc>>,
}

impl CallSession {
    pub fn outgoing(remote_id: ParticipantId, is_video: bool) -> Self {
        Self::new(remote_id, None, RoomId::generate(), is_video, Role::Initiator)
    }

    pub fn incoming(
        remote_id: ParticipantId,
        remote_name: Option<String>,
        room_id: RoomId,
        is_video: bool,
    ) -> Self {
        Self::new(remote_id, remote_name, room_id, is_video, Role::Responder)
    }

    fn new(
        remote_id: ParticipantId,
        remote_name: Option<String>,
        room_id: RoomId,
        is_video: bool,
        role: Role,
    ) -> Self {
        Self {
            remote_id,
            remote_name,
            room_id,
            is_video,
            role,
            pending_candidates: Vec::new(),
            outbound_candidates: Vec::new(),
            sent_candidates: Vec::new(),
            description_sent: false,
            connected_at: None,
        }
    }

    /// Seconds since the call became active, if it ever did.
    pub fn duration_secs(&self) -> Option<i64> {
        self.connected_at
            .map(|at| (Utc::now() - at).num_seconds().max(0))
    }
}

/// Ресурсы звонка: локальный захват, соединение, удалённые треки
pub struct MediaResources {
    pub(crate) local: LocalMedia,
    pub(crate) link: Arc<dyn PeerLink>,
    pub(crate) remote: Vec<RemoteTrack>,
    /// Remote description applied; candidates can go straight to the link.
    pub(crate) remote_applied: bool,
}

impl MediaResources {
    pub fn new(local: LocalMedia, link: Arc<dyn PeerLink>) -> Self {
        Self {
            local,
            link,
            remote: Vec::new(),
            remote_applied: false,
        }
    }
}

pub enum Acquiring {
    Outgoing {
        remote_id: ParticipantId,
        is_video: bool,
    },
    /// The pending offer has been consumed by accept; `media` fills in once
    /// capture and the connection are up.
    Incoming {
        session: CallSession,
        media: Option<MediaResources>,
    },
}

/// Машина состояний звонка. Каждое состояние несёт только то, что в нём валидно.
pub enum CallState {
    Idle,
    AcquiringMedia(Acquiring),
    AwaitingAnswer {
        session: CallSession,
        media: MediaResources,
    },
    RingingIncoming {
        session: CallSession,
        offer: SessionDescription,
    },
    Active {
        session: CallSession,
        media: MediaResources,
    },
}

impl CallState {
    pub fn status(&self) -> CallStatus {
        match self {
            CallState::Idle => CallStatus::Idle,
            CallState::AcquiringMedia(Acquiring::Outgoing { .. }) => {
                CallStatus::AcquiringMedia(Direction::Outgoing)
            }
            CallState::AcquiringMedia(Acquiring::Incoming { .. }) => {
                CallStatus::AcquiringMedia(Direction::Incoming)
            }
            CallState::AwaitingAnswer { .. } => CallStatus::AwaitingAnswer,
            CallState::RingingIncoming { .. } => CallStatus::RingingIncoming,
            CallState::Active { .. } => CallStatus::Active,
        }
    }

    pub fn session(&self) -> Option<&CallSession> {
        match self {
            CallState::Idle | CallState::AcquiringMedia(Acquiring::Outgoing { .. }) => None,
            CallState::AcquiringMedia(Acquiring::Incoming { session, .. })
            | CallState::AwaitingAnswer { session, .. }
            | CallState::RingingIncoming { session, .. }
            | CallState::Active { session, .. } => Some(session),
        }
    }

    pub fn session_mut(&mut self) -> Option<&mut CallSession> {
        match self {
            CallState::Idle | CallState::AcquiringMedia(Acquiring::Outgoing { .. }) => None,
            CallState::AcquiringMedia(Acquiring::Incoming { session, .. })
            | CallState::AwaitingAnswer { session, .. }
            | CallState::RingingIncoming { session, .. }
            | CallState::Active { session, .. } => Some(session),
        }
    }

    pub fn media(&self) -> Option<&MediaResources> {
        match self {
            CallState::AcquiringMedia(Acquiring::Incoming { media, .. }) => media.as_ref(),
            CallState::AwaitingAnswer { media, .. } | CallState::Active { media, .. } => {
                Some(media)
            }
            _ => None,
        }
    }

    pub fn media_mut(&mut self) -> Option<&mut MediaResources> {
        match self {
            CallState::AcquiringMedia(Acquiring::Incoming { media, .. }) => media.as_mut(),
            CallState::AwaitingAnswer { media, .. } | CallState::Active { media, .. } => {
                Some(media)
            }
            _ => None,
        }
    }

    /// Session and resources split apart, for handlers that touch both.
    pub(crate) fn parts_mut(&mut self) -> (Option<&mut CallSession>, Option<&mut MediaResources>) {
        match self {
            CallState::Idle | CallState::AcquiringMedia(Acquiring::Outgoing { .. }) => (None, None),
            CallState::AcquiringMedia(Acquiring::Incoming { session, media }) => {
                (Some(session), media.as_mut())
            }
            CallState::AwaitingAnswer { session, media } | CallState::Active { session, media } => {
                (Some(session), Some(media))
            }
            CallState::RingingIncoming { session, .. } => (Some(session), None),
        }
    }

    pub(crate) fn into_parts(self) -> (Option<CallSession>, Option<MediaResources>) {
        match self {
            CallState::Idle | CallState::AcquiringMedia(Acquiring::Outgoing { .. }) => (None, None),
            CallState::AcquiringMedia(Acquiring::Incoming { session, media }) => (Some(session), media),
            CallState::AwaitingAnswer { session, media } | CallState::Active { session, media } => {
                (Some(session), Some(media))
            }
            CallState::RingingIncoming { session, .. } => (Some(session), None),
        }
    }

    /// True when `room_id` belongs to the current session.
    pub fn is_room(&self, room_id: &RoomId) -> bool {
        self.session().is_some_and(|s| &s.room_id == room_id)
    }
}

/// Тег текущего состояния, без данных
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "direction", rename_all = "snake_case")]
pub enum CallStatus {
    Idle,
    AcquiringMedia(Direction),
    AwaitingAnswer,
    RingingIncoming,
    Active,
}

/// Read-only view of the coordinator for UI and diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct CallSnapshot {
    pub status: CallStatus,
    pub room_id: Option<RoomId>,
    pub remote_id: Option<ParticipantId>,
    pub role: Option<Role>,
    pub is_video: Option<bool>,
    pub has_local_media: bool,
    /// Peer link exists and reports connected.
    pub link_connected: bool,
    pub remote_tracks: usize,
    pub audio_enabled: Option<bool>,
    pub video_enabled: Option<bool>,
    pub duration_secs: Option<i64>,
}

impl CallSnapshot {
    pub(crate) fn of(state: &CallState) -> Self {
        let session = state.session();
        let media = state.media();
        Self {
            status: state.status(),
            room_id: session.map(|s| s.room_id.clone()),
            remote_id: session.map(|s| s.remote_id.clone()),
            role: session.map(|s| s.role),
            is_video: session.map(|s| s.is_video),
            has_local_media: media.is_some(),
            link_connected: media.is_some_and(|m| m.link.is_connected()),
            remote_tracks: media.map_or(0, |m| m.remote.len()),
            audio_enabled: media.map(|m| m.local.audio.is_enabled()),
            video_enabled: media.and_then(|m| m.local.video.as_ref().map(|v| v.is_enabled())),
            duration_secs: session.and_then(CallSession::duration_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_ids_carry_the_call_prefix() {
        let room = RoomId::generate();
        let millis: i64 = room.as_str().strip_prefix("call_").unwrap().parse().unwrap();
        assert!(millis > 0);
    }

    #[test]
    fn participant_ids_keep_their_wire_form() {
        let numeric: ParticipantId = serde_json::from_str("42").unwrap();
        assert_eq!(numeric, ParticipantId::Numeric(42));
        assert_eq!(serde_json::to_string(&numeric).unwrap(), "42");

        let named: ParticipantId = serde_json::from_str("\"alice\"").unwrap();
        assert_eq!(named.to_string(), "alice");
        assert_eq!(serde_json::to_string(&named).unwrap(), "\"alice\"");
    }

    #[test]
    fn ringing_state_has_session_but_no_media() {
        let state = CallState::RingingIncoming {
            session: CallSession::incoming(7.into(), None, "call_1".into(), true),
            offer: SessionDescription::offer("v=0"),
        };
        assert_eq!(state.status(), CallStatus::RingingIncoming);
        assert!(state.is_room(&"call_1".into()));
        assert!(!state.is_room(&"call_2".into()));
        assert!(state.media().is_none());

        let snapshot = CallSnapshot::of(&state);
        assert!(!snapshot.has_local_media);
        assert!(!snapshot.link_connected);
        assert_eq!(snapshot.role, Some(Role::Responder));
    }

    #[test]
    fn idle_has_no_session() {
        let state = CallState::Idle;
        assert!(state.session().is_none());
        assert_eq!(CallSnapshot::of(&state).status, CallStatus::Idle);
    }
}
