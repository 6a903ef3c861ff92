//! Microphone block encoding
//!
//! Raw f32 blocks at the device's native rate become 16-bit mono PCM chunks at
//! the wire rate. [`AudioPump`] runs inside the capture callback: it encodes,
//! hands the chunk to the channel without waiting, and counts drops.

use crate::channel::{MediaSender, SendFailure};
use crate::events::{AudioChunk, Outbound};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Down-mix interleaved multi-channel audio to mono by averaging channels.
fn to_mono(samples: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    let ch = channels as usize;
    samples
        .chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Streaming linear resampler on mono samples.
///
/// Positions are measured from the last sample of the previous block, so the
/// fractional phase carries over and consecutive blocks resample as one signal.
#[derive(Debug, Clone)]
struct LinearResampler {
    ratio: f64,
    /// Next output position; index 0 is the previous block's last sample
    pos: f64,
    last: f32,
}

impl LinearResampler {
    fn new(from_rate: u32, to_rate: u32) -> Self {
        Self {
            ratio: from_rate as f64 / to_rate as f64,
            pos: 1.0,
            last: 0.0,
        }
    }

    fn process(&mut self, input: &[f32]) -> Vec<f32> {
        let Some(&tail) = input.last() else {
            return Vec::new();
        };
        let last = self.last;
        let at = |i: usize| if i == 0 { last } else { input[i - 1] };

        let end = input.len() as f64;
        let mut output = Vec::with_capacity((end / self.ratio) as usize + 1);
        let mut pos = self.pos;
        while pos <= end {
            let idx0 = pos.floor() as usize;
            let frac = (pos - idx0 as f64) as f32;
            let s0 = at(idx0);
            let s1 = if idx0 < input.len() { at(idx0 + 1) } else { s0 };
            output.push(s0 + frac * (s1 - s0));
            pos += self.ratio;
        }

        self.pos = pos - end;
        self.last = tail;
        output
    }
}

fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

#[derive(Debug, Clone)]
pub struct AudioEncoder {
    channels: u16,
    target_rate: u32,
    /// `None` when the device already runs at the wire rate
    resampler: Option<LinearResampler>,
}

impl AudioEncoder {
    pub fn new(native_rate: u32, channels: u16, target_rate: u32) -> Self {
        Self {
            channels,
            target_rate,
            resampler: (native_rate != target_rate).then(|| LinearResampler::new(native_rate, target_rate)),
        }
    }

    pub fn encode(&mut self, block: &[f32]) -> AudioChunk {
        let mono = to_mono(block, self.channels);
        let resampled = match self.resampler.as_mut() {
            Some(resampler) => resampler.process(&mono),
            None => mono,
        };
        AudioChunk {
            samples: resampled.into_iter().map(to_i16).collect(),
            sample_rate: self.target_rate,
        }
    }
}

/// Counts consecutive send drops and trips once per streak.
#[derive(Debug, Clone)]
pub struct DropTracker {
    limit: Option<u32>,
    consecutive: u32,
    total: u64,
}

impl DropTracker {
    pub fn new(limit: Option<u32>) -> Self {
        Self {
            limit,
            consecutive: 0,
            total: 0,
        }
    }

    pub fn sent(&mut self) {
        self.consecutive = 0;
    }

    /// Record a drop; true exactly when the streak reaches the limit.
    pub fn dropped(&mut self) -> bool {
        self.consecutive += 1;
        self.total += 1;
        matches!(self.limit, Some(limit) if self.consecutive == limit)
    }

    pub fn total(&self) -> u64 {
        self.total
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpOutcome {
    /// The call is tearing down; the block was ignored
    Inactive,
    Sent,
    Dropped,
    /// Dropped, and the drop streak crossed the escalation limit
    Stalled,
}

/// Encoder graph between a microphone track and the channel.
pub struct AudioPump {
    encoder: AudioEncoder,
    sender: MediaSender,
    live: Arc<AtomicBool>,
    drops: DropTracker,
    stalled: bool,
    on_stalled: Box<dyn FnMut(SendFailure) + Send>,
}

impl AudioPump {
    pub fn new(
        encoder: AudioEncoder,
        sender: MediaSender,
        live: Arc<AtomicBool>,
        max_consecutive_drops: Option<u32>,
        on_stalled: impl FnMut(SendFailure) + Send + 'static,
    ) -> Self {
        Self {
            encoder,
            sender,
            live,
            drops: DropTracker::new(max_consecutive_drops),
            stalled: false,
            on_stalled: Box::new(on_stalled),
        }
    }

    /// Encode one capture block and queue it.
    pub fn push(&mut self, block: &[f32]) -> PumpOutcome {
        if !self.live.load(Ordering::Acquire) {
            return PumpOutcome::Inactive;
        }
        let chunk = self.encoder.encode(block);
        match self.sender.try_send(Outbound::Audio(chunk)) {
            Ok(()) => {
                self.drops.sent();
                PumpOutcome::Sent
            }
            Err(reason) => {
                debug!(?reason, total = self.drops.total(), "Dropped audio block");
                let tripped = self.drops.dropped();
                let escalate = match reason {
                    SendFailure::Full => tripped,
                    // nothing drains the queue any more
                    SendFailure::Closed => !self.stalled,
                };
                if escalate {
                    warn!(?reason, "Outbound audio is not getting through");
                    self.stalled = true;
                    (self.on_stalled)(reason);
                    PumpOutcome::Stalled
                } else {
                    PumpOutcome::Dropped
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    #[test]
    fn test_downsample_48k_block() {
        let mut encoder = AudioEncoder::new(48_000, 1, 16_000);
        let chunk = encoder.encode(&vec![0.5; 4096]);
        assert_eq!(chunk.sample_rate, 16_000);
        assert_eq!(chunk.samples.len(), 1366);
        assert!(chunk.samples.iter().all(|s| *s == 16383));
    }

    #[test]
    fn test_resampler_keeps_phase_across_blocks() {
        // a ramp split into blocks must come out as one decimated ramp
        let ramp: Vec<f32> = (0..12_288).map(|i| i as f32).collect();
        let mut resampler = LinearResampler::new(48_000, 16_000);
        let joined: Vec<f32> = ramp.chunks(4096).flat_map(|b| resampler.process(b)).collect();

        assert_eq!(joined.len(), 4096);
        assert!(joined.iter().enumerate().all(|(i, s)| *s == (3 * i) as f32));
    }

    #[test]
    fn test_resampler_interpolates_across_block_edge() {
        let mut resampler = LinearResampler::new(3, 2);
        assert_eq!(resampler.process(&[0.0, 3.0]), vec![0.0]);
        // the first output sits between the previous block's tail and this block's head
        assert_eq!(resampler.process(&[6.0, 9.0]), vec![4.5, 9.0]);
    }

    #[test]
    fn test_passthrough_rate_and_clipping() {
        let mut encoder = AudioEncoder::new(16_000, 1, 16_000);
        let chunk = encoder.encode(&[0.0, 1.0, -1.0, 2.0, -2.0]);
        assert_eq!(chunk.samples, vec![0, 32767, -32767, 32767, -32767]);
    }

    #[test]
    fn test_stereo_downmix() {
        let mut encoder = AudioEncoder::new(16_000, 2, 16_000);
        let chunk = encoder.encode(&[1.0, 0.0, -0.5, -0.5]);
        assert_eq!(chunk.samples, vec![16383, -16383]);
    }

    #[test]
    fn test_drop_tracker_trips_once_per_streak() {
        let mut drops = DropTracker::new(Some(3));
        assert!(!drops.dropped());
        assert!(!drops.dropped());
        assert!(drops.dropped());
        assert!(!drops.dropped());
        drops.sent();
        assert!(!drops.dropped());
        assert_eq!(drops.total(), 5);

        let mut unlimited = DropTracker::new(None);
        assert!((0..1000).all(|_| !unlimited.dropped()));
    }

    #[test]
    fn test_pump_drops_on_backpressure_and_escalates() {
        let (tx, mut rx) = mpsc::channel(1);
        let live = Arc::new(AtomicBool::new(true));
        let stalls = Arc::new(AtomicUsize::new(0));
        let counter = stalls.clone();
        let mut pump = AudioPump::new(
            AudioEncoder::new(16_000, 1, 16_000),
            MediaSender::new(tx),
            live.clone(),
            Some(2),
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );

        let block = [0.1f32; 16];
        assert_eq!(pump.push(&block), PumpOutcome::Sent);
        assert_eq!(pump.push(&block), PumpOutcome::Dropped);
        assert_eq!(pump.push(&block), PumpOutcome::Stalled);
        assert_eq!(stalls.load(Ordering::SeqCst), 1);

        assert!(matches!(rx.try_recv().unwrap(), Outbound::Audio(c) if c.samples.len() == 16));
        assert_eq!(pump.push(&block), PumpOutcome::Sent);

        live.store(false, Ordering::Release);
        assert_eq!(pump.push(&block), PumpOutcome::Inactive);
    }

    #[test]
    fn test_pump_escalates_once_when_channel_closes() {
        let (tx, rx) = mpsc::channel(4);
        let reasons = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = reasons.clone();
        let mut pump = AudioPump::new(
            AudioEncoder::new(16_000, 1, 16_000),
            MediaSender::new(tx),
            Arc::new(AtomicBool::new(true)),
            None,
            move |reason| seen.lock().unwrap().push(reason),
        );

        let block = [0.1f32; 16];
        assert_eq!(pump.push(&block), PumpOutcome::Sent);
        drop(rx);
        assert_eq!(pump.push(&block), PumpOutcome::Stalled);
        assert_eq!(pump.push(&block), PumpOutcome::Dropped);
        assert_eq!(*reasons.lock().unwrap(), vec![SendFailure::Closed]);
    }
}
