//! Error taxonomy for the live session
//!
//! Capture and channel-open failures abort a call start; transport failures
//! end a running call; decode failures only cost the offending fragment.

use tokio_tungstenite::tungstenite::Error as WsError;

/// Failure to acquire a capture track.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("capture cancelled by user")]
    UserCancelled,
}

/// Failure to open the session channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelOpenError {
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("timed out opening channel")]
    TimedOut,
}

/// A malformed inbound audio fragment.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid base64 payload: {0}")]
    Base64(String),

    #[error("PCM payload has odd length {0}")]
    OddLength(usize),

    #[error("empty audio fragment")]
    Empty,
}

/// Error type for Gemini wire operations
#[derive(Debug, thiserror::Error)]
pub enum GeminiError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Setup not complete")]
    SetupNotComplete,

    #[error("Server rejected session: {0}")]
    Rejected(String),
}

/// Anything that can end or refuse a call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Open(#[from] ChannelOpenError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("no call is connected")]
    NotConnected,

    #[error("session has shut down")]
    Closed,
}

pub type Result<T> = std::result::Result<T, SessionError>;
