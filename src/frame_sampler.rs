//! Rate-limited screen sampling
//!
//! On every tick, while the call is live and the screen is both shared and
//! visible to the agent, the latest frame is downsampled, JPEG-encoded and
//! queued. Ticks are independent: a slow encode does not hold back the next
//! tick, and frames may arrive out of order at the remote end. At most
//! [`MAX_IN_FLIGHT`] ticks run at once; a tick with no free slot is skipped.

use crate::capture::VideoSource;
use crate::channel::MediaSender;
use crate::events::{FrameSample, Outbound};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageResult, RgbaImage};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info};

const JPEG_MIME: &str = "image/jpeg";

/// Sampler ticks allowed to capture and encode concurrently
pub const MAX_IN_FLIGHT: usize = 2;

#[derive(Debug, Clone, Copy)]
pub struct FrameEncoder {
    pub quality: u8,
    pub max_edge: Option<u32>,
}

impl FrameEncoder {
    pub fn encode(&self, frame: RgbaImage) -> ImageResult<FrameSample> {
        let mut image = DynamicImage::ImageRgba8(frame);
        if let Some(max) = self.max_edge {
            if image.width() > max || image.height() > max {
                image = image.resize(max, max, FilterType::Triangle);
            }
        }
        let rgb = image.to_rgb8();

        let mut encoded = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut encoded, self.quality.clamp(1, 100));
        encoder.encode_image(&rgb)?;

        Ok(FrameSample {
            encoded,
            mime_type: JPEG_MIME,
        })
    }
}

/// Screen flags shared between the session and in-flight sampler ticks.
///
/// Flag writes and [`ScreenFlags::emit_if_visible`] serialize on one gate, so
/// once `set_visible(false)` returns no further frame is queued.
#[derive(Debug, Clone, Default)]
pub struct ScreenFlags {
    shared: Arc<AtomicBool>,
    visible: Arc<AtomicBool>,
    gate: Arc<Mutex<()>>,
}

impl ScreenFlags {
    pub fn is_shared(&self) -> bool {
        self.shared.load(Ordering::Acquire)
    }

    pub fn is_visible(&self) -> bool {
        self.visible.load(Ordering::Acquire)
    }

    pub fn set_shared(&self, shared: bool) {
        let _gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        self.shared.store(shared, Ordering::Release);
    }

    pub fn set_visible(&self, visible: bool) {
        let _gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        self.visible.store(visible, Ordering::Release);
    }

    pub fn reset(&self) {
        self.set_shared(false);
        self.set_visible(false);
    }

    /// Run `emit` only if the screen is shared and visible, holding the gate
    /// so neither flag can flip mid-call. `emit` must not block.
    pub fn emit_if_visible<R>(&self, emit: impl FnOnce() -> R) -> Option<R> {
        let _gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        (self.is_shared() && self.is_visible()).then(emit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleOutcome {
    Sent,
    /// Not shared, not visible, or the call is tearing down
    Skipped,
    NoFrame,
    EncodeFailed,
    /// The channel queue was full or closed
    Dropped,
}

/// Everything one tick needs.
#[derive(Clone)]
pub struct SamplerContext {
    pub source: Arc<dyn VideoSource>,
    pub sender: MediaSender,
    pub flags: ScreenFlags,
    pub live: Arc<AtomicBool>,
    pub encoder: FrameEncoder,
}

impl SamplerContext {
    fn may_emit(&self) -> bool {
        self.live.load(Ordering::Acquire) && self.flags.is_shared() && self.flags.is_visible()
    }

    /// Capture, encode and queue one frame.
    pub async fn sample_once(&self) -> SampleOutcome {
        if !self.may_emit() {
            return SampleOutcome::Skipped;
        }
        let Some(frame) = self.source.grab_frame() else {
            return SampleOutcome::NoFrame;
        };

        let encoder = self.encoder;
        let sample = match tokio::task::spawn_blocking(move || encoder.encode(frame)).await {
            Ok(Ok(sample)) => sample,
            Ok(Err(e)) => {
                debug!("Frame encode failed: {}", e);
                return SampleOutcome::EncodeFailed;
            }
            Err(e) => {
                debug!("Frame encode task failed: {}", e);
                return SampleOutcome::EncodeFailed;
            }
        };

        // The call may have ended while encoding
        if !self.live.load(Ordering::Acquire) {
            return SampleOutcome::Skipped;
        }
        let size = sample.encoded.len();
        match self
            .flags
            .emit_if_visible(|| self.sender.try_send(Outbound::Frame(sample)))
        {
            None => SampleOutcome::Skipped,
            Some(Ok(())) => {
                debug!("Queued screen frame ({} KB)", size / 1024);
                SampleOutcome::Sent
            }
            Some(Err(reason)) => {
                debug!(?reason, "Dropped screen frame");
                SampleOutcome::Dropped
            }
        }
    }
}

/// Timer task driving [`SamplerContext::sample_once`].
pub struct FrameSampler {
    handle: JoinHandle<()>,
}

impl FrameSampler {
    pub fn start(context: SamplerContext, period: Duration) -> Self {
        info!("Starting frame sampler every {}ms", period.as_millis());
        let slots = Arc::new(Semaphore::new(MAX_IN_FLIGHT));
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Ok(permit) = slots.clone().try_acquire_owned() else {
                    debug!("Previous frames still encoding, skipping tick");
                    continue;
                };
                let context = context.clone();
                tokio::spawn(async move {
                    context.sample_once().await;
                    drop(permit);
                });
            }
        });
        Self { handle }
    }

    pub fn stop(self) {
        debug!("Stopping frame sampler");
        self.handle.abort();
    }
}
