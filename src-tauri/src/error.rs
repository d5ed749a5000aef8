use serde::Serialize;
use thiserror::Error;

/// Why local capture could not be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaAccessCause {
    Denied,
    NotFound,
    Busy,
    Overconstrained,
    Unknown,
}

impl MediaAccessCause {
    /// Текст для пользователя
    pub fn message(&self) -> &'static str {
        match self {
            Self::Denied => "Camera/microphone access denied. Please allow access and try again.",
            Self::NotFound => "No camera/microphone found. Please check your devices.",
            Self::Busy => {
                "Camera/microphone is already in use by another application. Please close it and try again."
            }
            Self::Overconstrained => {
                "Camera/microphone constraints cannot be satisfied. Try using a different device."
            }
            Self::Unknown => "Unable to access camera/microphone.",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}{}", .cause.message(), .detail.as_deref().map(|d| format!(" ({d})")).unwrap_or_default())]
pub struct MediaAccessError {
    pub cause: MediaAccessCause,
    pub detail: Option<String>,
}

impl MediaAccessError {
    pub fn new(cause: MediaAccessCause) -> Self {
        Self {
            cause,
            detail: None,
        }
    }

    pub fn with_detail(cause: MediaAccessCause, detail: impl Into<String>) -> Self {
        Self {
            cause,
            detail: Some(detail.into()),
        }
    }
}

/// Категория ошибки для UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    MediaAccess,
    NoConnection,
    AlreadyInCall,
    Negotiation,
    NoAnswer,
    ConnectionLost,
    Internal,
}

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("malformed signaling message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unsupported session description type: {0}")]
    UnsupportedDescription(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("signaling channel is closed")]
    Closed,
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error("A call is already in progress")]
    AlreadyInCall,
    #[error("No connection available. Please try again.")]
    NoConnection,
    #[error(transparent)]
    MediaAccess(#[from] MediaAccessError),
    #[error("call negotiation failed: {0}")]
    Negotiation(String),
    #[error("cannot {0} in the current call state")]
    InvalidState(&'static str),
    #[error("call attempt was cancelled")]
    Cancelled,
    #[error(transparent)]
    Signal(#[from] SignalError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl CallError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::AlreadyInCall => ErrorCategory::AlreadyInCall,
            Self::NoConnection | Self::Transport(_) => ErrorCategory::NoConnection,
            Self::MediaAccess(_) => ErrorCategory::MediaAccess,
            Self::Negotiation(_) | Self::Signal(_) => ErrorCategory::Negotiation,
            Self::InvalidState(_) | Self::Cancelled => ErrorCategory::Internal,
        }
    }
}

impl From<webrtc::Error> for CallError {
    fn from(err: webrtc::Error) -> Self {
        Self::Negotiation(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid ICE server: {0}")]
    InvalidIceServer(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_error_message_includes_detail() {
        let err = MediaAccessError::with_detail(MediaAccessCause::NotFound, "no video input");
        assert_eq!(
            err.to_string(),
            "No camera/microphone found. Please check your devices. (no video input)"
        );
        assert_eq!(
            MediaAccessError::new(MediaAccessCause::Denied).to_string(),
            MediaAccessCause::Denied.message()
        );
    }

    #[test]
    fn categories() {
        let media: CallError = MediaAccessError::new(MediaAccessCause::Busy).into();
        assert_eq!(media.category(), ErrorCategory::MediaAccess);
        assert_eq!(CallError::NoConnection.category(), ErrorCategory::NoConnection);
        assert_eq!(
            CallError::Negotiation("boom".into()).category(),
            ErrorCategory::Negotiation
        );
    }
}
