use crate::error::SignalError;
use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// SDP в том виде, в каком его шлёт браузер: `{ "type": "offer", "sdp": "..." }`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

impl TryFrom<RTCSessionDescription> for SessionDescription {
    type Error = SignalError;

    fn try_from(desc: RTCSessionDescription) -> Result<Self, Self::Error> {
        let kind = match desc.sdp_type {
            RTCSdpType::Offer => SdpKind::Offer,
            RTCSdpType::Answer => SdpKind::Answer,
            RTCSdpType::Pranswer => SdpKind::Pranswer,
            RTCSdpType::Rollback => SdpKind::Rollback,
            other => return Err(SignalError::UnsupportedDescription(format!("{other:?}"))),
        };
        Ok(Self {
            kind,
            sdp: desc.sdp,
        })
    }
}

impl TryFrom<SessionDescription> for RTCSessionDescription {
    type Error = SignalError;

    fn try_from(desc: SessionDescription) -> Result<Self, Self::Error> {
        let parsed = match desc.kind {
            SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
            SdpKind::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
            SdpKind::Rollback => return Err(SignalError::UnsupportedDescription("rollback".into())),
        };
        parsed.map_err(|e| SignalError::UnsupportedDescription(e.to_string()))
    }
}

/// ICE кандидат в браузерном JSON формате
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(c: IceCandidate) -> Self {
        RTCIceCandidateInit {
            candidate: c.candidate,
            sdp_mid: c.sdp_mid,
            sdp_mline_index: c.sdp_mline_index,
            username_fragment: c.username_fragment,
        }
    }
}

/// Конфигурация ICE сервера
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub id: String,
    pub r#type: String, // 'stun' or 'turn'
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn browser_candidate_json() {
        let raw = r#"{"candidate":"candidate:1 1 udp 2122260223 192.168.1.5 54321 typ host","sdpMid":"0","sdpMLineIndex":0,"usernameFragment":"abcd"}"#;
        let c: IceCandidate = serde_json::from_str(raw).unwrap();
        assert_eq!(c.sdp_mid.as_deref(), Some("0"));
        assert_eq!(c.sdp_mline_index, Some(0));
        assert_eq!(c.username_fragment.as_deref(), Some("abcd"));
    }

    #[test]
    fn rollback_cannot_be_applied() {
        let desc = SessionDescription {
            kind: SdpKind::Rollback,
            sdp: String::new(),
        };
        assert!(RTCSessionDescription::try_from(desc).is_err());
    }

    #[test]
    fn description_wire_shape() {
        let json = serde_json::to_value(SessionDescription::answer("v=0")).unwrap();
        assert_eq!(json, serde_json::json!({"type": "answer", "sdp": "v=0"}));
    }
}
