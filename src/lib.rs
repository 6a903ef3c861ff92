//! ScreenLive - voice call with an AI agent that can see a shared screen
//!
//! The session streams microphone audio and sampled screen frames to a live
//! model, plays the agent's voice back gaplessly, keeps a turn-based
//! transcript and tracks what the agent is doing.

#![forbid(unsafe_code)]

pub mod activity;
/// PulseAudio microphone and playback (enabled with the "pulse" feature)
#[cfg(feature = "pulse")]
pub mod audio;
pub mod call;
pub mod capture;
pub mod channel;
pub mod config;
pub mod encoder;
pub mod error;
pub mod events;
pub mod frame_sampler;
/// Gemini Live session channel
pub mod gemini;
pub mod playback;
pub mod prompt;
/// Screen capture module (enabled with the "capture" feature)
#[cfg(feature = "capture")]
pub mod screen;
pub mod session;
pub mod timeline;
pub mod transcript;

#[cfg(test)]
mod testing;

pub use capture::{MediaCapture, SystemCapture};
pub use channel::ChannelOpener;
pub use config::LiveConfig;
pub use error::{SessionError, Result};
pub use events::{ActivityState, CallState, Speaker};
pub use gemini::GeminiConnector;
pub use session::{LiveSession, SessionHandle, SessionSnapshot};
pub use timeline::TimelineOutput;
pub use transcript::TranscriptEntry;
