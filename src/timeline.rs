//! Sample-accurate output timeline
//!
//! Units are placed at absolute frame positions and mixed as the driver pulls
//! frames. The device clock is the number of frames rendered so far.

use crate::playback::{OutputDevice, UnitId};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info};

/// Driver block length
pub const BLOCK_MS: u64 = 20;

#[derive(Debug)]
struct Placed {
    id: UnitId,
    start: u64,
    samples: Arc<[f32]>,
}

impl Placed {
    fn end(&self) -> u64 {
        self.start + self.samples.len() as u64
    }
}

#[derive(Debug)]
pub struct Timeline {
    rate: u32,
    position: u64,
    units: Vec<Placed>,
}

impl Timeline {
    pub fn new(rate: u32) -> Self {
        Self {
            rate,
            position: 0,
            units: Vec::new(),
        }
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    /// Frames rendered so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn current_time(&self) -> f64 {
        self.position as f64 / self.rate as f64
    }

    /// Place `samples` at absolute time `at`. A start already in the past
    /// begins at the current position.
    pub fn schedule(&mut self, id: UnitId, samples: Arc<[f32]>, at: f64) {
        let requested = (at.max(0.0) * self.rate as f64).round() as u64;
        let start = requested.max(self.position);
        self.units.push(Placed { id, start, samples });
    }

    /// Remove a unit immediately. Returns false if it was not scheduled.
    pub fn cancel(&mut self, id: UnitId) -> bool {
        let before = self.units.len();
        self.units.retain(|u| u.id != id);
        self.units.len() != before
    }

    pub fn active_units(&self) -> usize {
        self.units.len()
    }

    /// Mix the next `out.len()` frames and return the units that finished.
    pub fn render(&mut self, out: &mut [f32]) -> Vec<UnitId> {
        out.iter_mut().for_each(|s| *s = 0.0);
        let block_start = self.position;
        let block_end = block_start + out.len() as u64;

        for unit in &self.units {
            let from = unit.start.max(block_start);
            let to = unit.end().min(block_end);
            for frame in from..to {
                let src = (frame - unit.start) as usize;
                let dst = (frame - block_start) as usize;
                out[dst] += unit.samples[src];
            }
        }
        for sample in out.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }

        self.position = block_end;
        let mut finished = Vec::new();
        self.units.retain(|u| {
            if u.end() <= block_end {
                finished.push(u.id);
                false
            } else {
                true
            }
        });
        finished
    }

    /// Render and discard `frames` frames.
    pub fn advance(&mut self, frames: usize) -> Vec<UnitId> {
        let mut scratch = vec![0.0; frames];
        self.render(&mut scratch)
    }
}

/// Output device backed by a shared [`Timeline`].
#[derive(Debug, Clone)]
pub struct TimelineOutput {
    timeline: Arc<Mutex<Timeline>>,
}

impl TimelineOutput {
    pub fn new(rate: u32) -> Self {
        Self {
            timeline: Arc::new(Mutex::new(Timeline::new(rate))),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Timeline> {
        self.timeline.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Frames per driver block.
    pub fn block_frames(&self) -> usize {
        (self.lock().rate() as u64 * BLOCK_MS / 1000) as usize
    }
}

impl OutputDevice for TimelineOutput {
    fn current_time(&self) -> f64 {
        self.lock().current_time()
    }

    fn sample_rate(&self) -> u32 {
        self.lock().rate()
    }

    fn start(&self, id: UnitId, samples: Arc<[f32]>, at: f64) {
        self.lock().schedule(id, samples, at);
    }

    fn stop(&self, id: UnitId) {
        self.lock().cancel(id);
    }
}

/// Drive the timeline in real time without a sound server, discarding output.
pub fn spawn_silent_driver(
    output: TimelineOutput,
    ended_tx: mpsc::UnboundedSender<UnitId>,
) -> JoinHandle<()> {
    info!("No playback device, agent audio is rendered silently");
    tokio::spawn(async move {
        let frames = output.block_frames();
        let mut ticker = interval(Duration::from_millis(BLOCK_MS));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
        loop {
            ticker.tick().await;
            let finished = output.lock().advance(frames);
            for id in finished {
                if ended_tx.send(id).is_err() {
                    debug!("Playback listener gone, stopping silent driver");
                    return;
                }
            }
        }
    })
}
