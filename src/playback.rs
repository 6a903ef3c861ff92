//! Gapless playback scheduling of inbound agent audio
//!
//! Every fragment is placed at a running "next free start time" instead of at
//! the device's current time, so network jitter never opens gaps or overlaps.
//! An interruption stops everything and rewinds the clock to zero, which makes
//! the next fragment schedule relative to the device's current time again.

use crate::error::DecodeError;
use base64::engine::general_purpose;
use base64::Engine;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

pub type UnitId = u64;

/// Accepts units at absolute device-clock times.
pub trait OutputDevice: Send + 'static {
    /// Current device time in seconds
    fn current_time(&self) -> f64;
    fn sample_rate(&self) -> u32;
    fn start(&self, id: UnitId, samples: Arc<[f32]>, at: f64);
    fn stop(&self, id: UnitId);
}

/// A decoded fragment owned by the scheduler until it finishes.
#[derive(Debug, Clone)]
pub struct PlaybackUnit {
    pub id: UnitId,
    pub samples: Arc<[f32]>,
    pub duration: f64,
}

/// Where a unit landed on the device clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledUnit {
    pub id: UnitId,
    pub start: f64,
    pub end: f64,
}

/// Decode base64 little-endian 16-bit mono PCM into f32 samples.
pub fn decode_pcm16(data: &str) -> Result<Vec<f32>, DecodeError> {
    let bytes = general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|e| DecodeError::Base64(e.to_string()))?;
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::OddLength(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
        .collect())
}

pub struct PlaybackScheduler<D> {
    device: D,
    next_start: f64,
    active: HashSet<UnitId>,
    next_id: UnitId,
}

impl<D: OutputDevice> PlaybackScheduler<D> {
    pub fn new(device: D) -> Self {
        Self {
            device,
            next_start: 0.0,
            active: HashSet::new(),
            next_id: 0,
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn next_start(&self) -> f64 {
        self.next_start
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_empty()
    }

    fn decode(&mut self, data: &str) -> Result<PlaybackUnit, DecodeError> {
        let samples = decode_pcm16(data)?;
        let duration = samples.len() as f64 / self.device.sample_rate() as f64;
        self.next_id += 1;
        Ok(PlaybackUnit {
            id: self.next_id,
            samples: samples.into(),
            duration,
        })
    }

    /// Decode a fragment and schedule it right after everything already queued.
    /// A malformed fragment leaves the clock and active set untouched.
    pub fn on_audio_fragment(&mut self, data: &str) -> Result<ScheduledUnit, DecodeError> {
        let unit = self.decode(data)?;
        self.next_start = self.next_start.max(self.device.current_time());

        let start = self.next_start;
        self.device.start(unit.id, unit.samples, start);
        self.next_start += unit.duration;
        self.active.insert(unit.id);

        debug!(unit = unit.id, start, duration = unit.duration, "Scheduled playback unit");
        Ok(ScheduledUnit {
            id: unit.id,
            start,
            end: self.next_start,
        })
    }

    /// A unit finished naturally. Returns true if this emptied the active set.
    pub fn on_unit_ended(&mut self, id: UnitId) -> bool {
        self.active.remove(&id) && self.active.is_empty()
    }

    /// Barge-in: stop every active unit and rewind the clock.
    pub fn on_interruption(&mut self) -> usize {
        let stopped = self.stop_all();
        if stopped > 0 {
            info!("Interrupted, stopped {} playback unit(s)", stopped);
        }
        stopped
    }

    /// Stop and release every active unit.
    pub fn stop_all(&mut self) -> usize {
        let stopped = self.active.len();
        for id in self.active.drain() {
            self.device.stop(id);
        }
        self.next_start = 0.0;
        stopped
    }
}
