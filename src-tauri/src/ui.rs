use crate::error::ErrorCategory;
use crate::peer::TrackKind;
use crate::session::{ParticipantId, RoomId};
use log::warn;
use serde::Serialize;
use tokio::sync::mpsc;

/// Фаза звонка, как её показывает UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallPhase {
    Outgoing,
    Active,
    Ended,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CallNotice {
    IncomingCall {
        caller_id: ParticipantId,
        caller_name: Option<String>,
        is_video: bool,
        room_id: RoomId,
    },
    StateChanged {
        state: CallPhase,
        /// Only on `ended`, and only if the call got connected.
        duration_secs: Option<i64>,
    },
    RemoteStream {
        track_kind: TrackKind,
    },
    Declined,
    Error {
        category: ErrorCategory,
        message: String,
    },
}

impl CallNotice {
    pub fn state(state: CallPhase) -> Self {
        CallNotice::StateChanged {
            state,
            duration_secs: None,
        }
    }

    pub fn error(category: ErrorCategory, message: impl Into<String>) -> Self {
        CallNotice::Error {
            category,
            message: message.into(),
        }
    }

    /// Имя события для фронтенда
    pub fn event_name(&self) -> &'static str {
        match self {
            CallNotice::IncomingCall { .. } => "call-incoming",
            CallNotice::StateChanged { .. } => "call-state",
            CallNotice::RemoteStream { .. } => "call-remote-stream",
            CallNotice::Declined => "call-declined",
            CallNotice::Error { .. } => "call-error",
        }
    }
}

/// Куда координатор отправляет уведомления для UI
pub trait Notifier: Send + Sync {
    fn notify(&self, notice: CallNotice);
}

impl Notifier for mpsc::UnboundedSender<CallNotice> {
    fn notify(&self, notice: CallNotice) {
        if self.send(notice).is_err() {
            warn!("UI notice receiver dropped");
        }
    }
}

#[cfg(feature = "desktop")]
impl<R: tauri::Runtime> Notifier for tauri::AppHandle<R> {
    fn notify(&self, notice: CallNotice) {
        use tauri::Emitter;

        let event = notice.event_name();
        if let Err(e) = self.emit(event, &notice) {
            warn!("Failed to emit event {event}: {e:?}");
        }
    }
}
