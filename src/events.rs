//! Shared event and state types flowing between session components

use serde::Serialize;
use std::fmt;

/// Who a transcript fragment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Agent,
}

/// Typed events emitted by the session channel
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Incremental transcription text for the current turn
    TextFragment { speaker: Speaker, text: String },
    /// Base64 little-endian 16-bit mono PCM from the agent
    AudioFragment { data: String },
    TurnComplete,
    /// The agent detected barge-in; in-flight playback must stop
    Interrupted,
    Error(String),
    Closed,
}

/// Single-channel linear PCM ready for the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

impl AudioChunk {
    pub const CHANNEL_COUNT: u16 = 1;

    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    pub fn mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.sample_rate)
    }
}

/// One encoded screen sample. Never buffered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSample {
    pub encoded: Vec<u8>,
    pub mime_type: &'static str,
}

/// Media leaving the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Audio(AudioChunk),
    Frame(FrameSample),
    /// The microphone stream is ending
    AudioStreamEnd,
}

/// Top-level call lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Error,
    Ended,
}

impl CallState {
    /// States a new call may start from.
    pub fn can_start(self) -> bool {
        matches!(self, Self::Idle | Self::Ended | Self::Error)
    }

    /// States holding live resources.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
            Self::Ended => "ended",
        };
        f.write_str(s)
    }
}

/// Coarse agent activity shown next to the transcript
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityState {
    #[default]
    Idle,
    Listening,
    Thinking,
    Speaking,
}

impl fmt::Display for ActivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Thinking => "thinking",
            Self::Speaking => "speaking",
        };
        f.write_str(s)
    }
}
