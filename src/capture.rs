//! Media capture seams
//!
//! A capture backend hands out tracks: a microphone that pushes raw blocks
//! into a callback, and a screen whose latest frame can be grabbed on demand.
//! Tracks signal an external end (device unplugged, sharing revoked from OS
//! chrome) through [`TrackEnded`].

use crate::error::CaptureError;
use image::RgbaImage;
use tokio::sync::mpsc;
use tracing::debug;

/// Callback receiving interleaved f32 blocks at the source's native rate.
pub type BlockSink = Box<dyn FnMut(&[f32]) + Send>;

/// Which track ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Microphone,
    Screen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackEndedEvent {
    pub kind: TrackKind,
    /// Generation of the acquisition that produced the track
    pub generation: u64,
}

/// Handle a track uses to report that it ended on its own.
#[derive(Debug, Clone)]
pub struct TrackEnded {
    event: TrackEndedEvent,
    tx: mpsc::UnboundedSender<TrackEndedEvent>,
}

impl TrackEnded {
    pub fn new(kind: TrackKind, generation: u64, tx: mpsc::UnboundedSender<TrackEndedEvent>) -> Self {
        Self {
            event: TrackEndedEvent { kind, generation },
            tx,
        }
    }

    pub fn notify(&self) {
        debug!(kind = ?self.event.kind, "Track ended");
        // The session may already be gone
        let _ = self.tx.send(self.event);
    }
}

/// A live microphone track.
pub trait AudioSource: Send {
    fn sample_rate(&self) -> u32;
    fn channels(&self) -> u16;
    /// Start delivering blocks to `sink`.
    fn connect(&mut self, sink: BlockSink) -> Result<(), CaptureError>;
    /// Stop the track. Must not block on an in-flight callback.
    fn stop(&mut self);
}

/// A live screen track.
pub trait VideoSource: Send + Sync {
    /// The most recent frame, if one has arrived yet.
    fn grab_frame(&self) -> Option<RgbaImage>;
    fn stop(&self);
}

/// Acquires capture tracks from the operating environment.
pub trait MediaCapture: Send + Sync + 'static {
    fn acquire_microphone(
        &self,
        block_size: usize,
        ended: TrackEnded,
    ) -> Result<Box<dyn AudioSource>, CaptureError>;

    fn acquire_screen(&self, ended: TrackEnded) -> Result<Box<dyn VideoSource>, CaptureError>;
}

/// Desktop capture using whichever backends were compiled in.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCapture;

impl MediaCapture for SystemCapture {
    fn acquire_microphone(
        &self,
        block_size: usize,
        ended: TrackEnded,
    ) -> Result<Box<dyn AudioSource>, CaptureError> {
        #[cfg(feature = "pulse")]
        {
            let mic = crate::audio::PulseMicrophone::open("screenlive", block_size, ended)?;
            Ok(Box::new(mic))
        }
        #[cfg(not(feature = "pulse"))]
        {
            let _ = (block_size, ended);
            Err(CaptureError::DeviceUnavailable(
                "built without the `pulse` feature".to_string(),
            ))
        }
    }

    fn acquire_screen(&self, ended: TrackEnded) -> Result<Box<dyn VideoSource>, CaptureError> {
        #[cfg(feature = "capture")]
        {
            let screen = crate::screen::ScreenTrack::open(ended)?;
            Ok(Box::new(screen))
        }
        #[cfg(not(feature = "capture"))]
        {
            let _ = ended;
            Err(CaptureError::DeviceUnavailable(
                "built without the `capture` feature".to_string(),
            ))
        }
    }
}
