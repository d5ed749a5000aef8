//! Сообщения сигналинга звонков поверх общего websocket-канала.
//!
//! Outbound messages name the `recipient_id`; the relay replaces it with
//! `sender_id` (and `sender_name` on offers) before delivering.

use crate::error::SignalError;
use crate::peer::{IceCandidate, SessionDescription};
use crate::session::{ParticipantId, RoomId};
use serde::{Deserialize, Serialize};

const CALL_SIGNAL_TYPES: [&str; 5] = [
    "call_offer",
    "call_answer",
    "ice_candidate",
    "call_end",
    "call_declined",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundSignal {
    CallOffer {
        offer: SessionDescription,
        room_id: RoomId,
        recipient_id: ParticipantId,
        is_video: bool,
    },
    CallAnswer {
        answer: SessionDescription,
        room_id: RoomId,
        recipient_id: ParticipantId,
    },
    IceCandidate {
        candidate: IceCandidate,
        room_id: RoomId,
        recipient_id: ParticipantId,
    },
    CallEnd {
        room_id: RoomId,
        recipient_id: ParticipantId,
    },
    CallDeclined {
        room_id: RoomId,
        recipient_id: ParticipantId,
    },
}

impl OutboundSignal {
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundSignal::CallOffer { .. } => "call_offer",
            OutboundSignal::CallAnswer { .. } => "call_answer",
            OutboundSignal::IceCandidate { .. } => "ice_candidate",
            OutboundSignal::CallEnd { .. } => "call_end",
            OutboundSignal::CallDeclined { .. } => "call_declined",
        }
    }

    pub fn encode(&self) -> Result<String, SignalError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundSignal {
    CallOffer {
        offer: SessionDescription,
        room_id: RoomId,
        sender_id: ParticipantId,
        #[serde(default)]
        sender_name: Option<String>,
        #[serde(default)]
        is_video: bool,
    },
    CallAnswer {
        answer: SessionDescription,
        room_id: RoomId,
        sender_id: ParticipantId,
    },
    IceCandidate {
        candidate: IceCandidate,
        room_id: RoomId,
        sender_id: ParticipantId,
    },
    CallEnd {
        room_id: RoomId,
        sender_id: ParticipantId,
    },
    CallDeclined {
        room_id: RoomId,
        sender_id: ParticipantId,
    },
}

impl InboundSignal {
    pub fn room_id(&self) -> &RoomId {
        match self {
            InboundSignal::CallOffer { room_id, .. }
            | InboundSignal::CallAnswer { room_id, .. }
            | InboundSignal::IceCandidate { room_id, .. }
            | InboundSignal::CallEnd { room_id, .. }
            | InboundSignal::CallDeclined { room_id, .. } => room_id,
        }
    }

    pub fn sender_id(&self) -> &ParticipantId {
        match self {
            InboundSignal::CallOffer { sender_id, .. }
            | InboundSignal::CallAnswer { sender_id, .. }
            | InboundSignal::IceCandidate { sender_id, .. }
            | InboundSignal::CallEnd { sender_id, .. }
            | InboundSignal::CallDeclined { sender_id, .. } => sender_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InboundSignal::CallOffer { .. } => "call_offer",
            InboundSignal::CallAnswer { .. } => "call_answer",
            InboundSignal::IceCandidate { .. } => "ice_candidate",
            InboundSignal::CallEnd { .. } => "call_end",
            InboundSignal::CallDeclined { .. } => "call_declined",
        }
    }

    /// Декодирует входящий кадр. Чужие типы (чат, typing, presence) дают `Ok(None)`.
    pub fn decode(text: &str) -> Result<Option<Self>, SignalError> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        let is_call_signal = value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .is_some_and(|t| CALL_SIGNAL_TYPES.contains(&t));
        if !is_call_signal {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(value)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::SdpKind;
    use serde_json::json;

    #[test]
    fn decodes_relayed_offer() {
        let raw = json!({
            "type": "call_offer",
            "offer": {"type": "offer", "sdp": "v=0\r\n"},
            "room_id": "call_1700000000000",
            "sender_id": 12,
            "sender_name": "alice",
            "is_video": true
        })
        .to_string();

        let signal = InboundSignal::decode(&raw).unwrap().unwrap();
        match signal {
            InboundSignal::CallOffer {
                offer,
                room_id,
                sender_id,
                sender_name,
                is_video,
            } => {
                assert_eq!(offer.kind, SdpKind::Offer);
                assert_eq!(room_id.as_str(), "call_1700000000000");
                assert_eq!(sender_id, ParticipantId::Numeric(12));
                assert_eq!(sender_name.as_deref(), Some("alice"));
                assert!(is_video);
            }
            other => panic!("unexpected signal {other:?}"),
        }
    }

    #[test]
    fn offer_without_video_flag_is_voice() {
        let raw = r#"{"type":"call_offer","offer":{"type":"offer","sdp":""},"room_id":"call_1","sender_id":"bob"}"#;
        let signal = InboundSignal::decode(raw).unwrap().unwrap();
        assert!(matches!(
            signal,
            InboundSignal::CallOffer {
                is_video: false,
                sender_name: None,
                ..
            }
        ));
    }

    #[test]
    fn chat_traffic_is_not_a_call_signal() {
        let raw = r#"{"type":"chat_message","message":"hi","sender_id":3}"#;
        assert!(InboundSignal::decode(raw).unwrap().is_none());
        assert!(InboundSignal::decode(r#"{"no_type":true}"#).unwrap().is_none());
    }

    #[test]
    fn call_signal_missing_fields_is_an_error() {
        let raw = r#"{"type":"call_answer","room_id":"call_1","sender_id":3}"#;
        assert!(matches!(
            InboundSignal::decode(raw),
            Err(SignalError::Malformed(_))
        ));
        assert!(InboundSignal::decode("{not json").is_err());
    }

    #[test]
    fn outbound_offer_wire_shape() {
        let signal = OutboundSignal::CallOffer {
            offer: SessionDescription::offer("v=0"),
            room_id: "call_5".into(),
            recipient_id: 9.into(),
            is_video: false,
        };
        let value: serde_json::Value = serde_json::from_str(&signal.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "call_offer",
                "offer": {"type": "offer", "sdp": "v=0"},
                "room_id": "call_5",
                "recipient_id": 9,
                "is_video": false
            })
        );
    }

    #[test]
    fn outbound_candidate_carries_recipient() {
        let signal = OutboundSignal::IceCandidate {
            candidate: IceCandidate {
                candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            },
            room_id: "call_5".into(),
            recipient_id: "bob".into(),
        };
        let value: serde_json::Value = serde_json::from_str(&signal.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "ice_candidate");
        assert_eq!(value["recipient_id"], "bob");
        assert_eq!(value["candidate"]["sdpMLineIndex"], 0);
        assert!(value["candidate"].get("usernameFragment").is_none());
    }
}
