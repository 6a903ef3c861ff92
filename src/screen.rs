//! Screen track backed by the `xcap` video recorder
//!
//! A recorder thread keeps only the most recent frame; the sampler grabs it on
//! its own schedule.

use crate::capture::{TrackEnded, VideoSource};
use crate::error::CaptureError;
use image::RgbaImage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};
use xcap::{Frame, Monitor, XCapError};

/// How often the recorder thread checks for a stop request
const POLL: Duration = Duration::from_millis(100);

fn capture_error(err: XCapError) -> CaptureError {
    let msg = err.to_string();
    if msg.to_lowercase().contains("permission") {
        CaptureError::PermissionDenied(msg)
    } else {
        CaptureError::DeviceUnavailable(msg)
    }
}

fn to_image(width: u32, height: u32, raw: Vec<u8>) -> Option<RgbaImage> {
    RgbaImage::from_raw(width, height, raw)
}

/// Primary monitor as a screen track.
pub struct ScreenTrack {
    latest: Arc<Mutex<Option<Frame>>>,
    stop: Arc<AtomicBool>,
}

impl ScreenTrack {
    pub fn open(ended: TrackEnded) -> Result<Self, CaptureError> {
        let latest = Arc::new(Mutex::new(None));
        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = sync_channel(1);

        let thread_latest = latest.clone();
        let thread_stop = stop.clone();
        std::thread::Builder::new()
            .name("screenlive-screen".to_string())
            .spawn(move || {
                let started = Monitor::all().and_then(|monitors| {
                    let monitor = monitors
                        .iter()
                        .find(|m| m.is_primary().unwrap_or(false))
                        .or_else(|| monitors.first())
                        .cloned()
                        .ok_or_else(|| XCapError::new("No monitors found"))?;
                    info!(
                        "Sharing monitor {} ({}x{})",
                        monitor.name().unwrap_or_else(|_| "Unknown".to_string()),
                        monitor.width().unwrap_or(0),
                        monitor.height().unwrap_or(0)
                    );
                    let (recorder, frames) = monitor.video_recorder()?;
                    recorder.start()?;
                    Ok((recorder, frames))
                });
                let (recorder, frames) = match started {
                    Ok(started) => {
                        let _ = ready_tx.send(Ok(()));
                        started
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(capture_error(e)));
                        return;
                    }
                };

                while !thread_stop.load(Ordering::Acquire) {
                    match frames.recv_timeout(POLL) {
                        Ok(frame) => {
                            *thread_latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(frame);
                        }
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => {
                            warn!("Screen recorder stopped delivering frames");
                            ended.notify();
                            break;
                        }
                    }
                }
                if let Err(e) = recorder.stop() {
                    debug!("Error stopping screen recorder: {}", e);
                }
                debug!("Screen thread finished");
            })
            .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self { latest, stop }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(CaptureError::DeviceUnavailable("screen thread exited".to_string())),
        }
    }
}

impl VideoSource for ScreenTrack {
    fn grab_frame(&self) -> Option<RgbaImage> {
        let guard = self.latest.lock().unwrap_or_else(PoisonError::into_inner);
        let frame = guard.as_ref()?;
        to_image(frame.width, frame.height, frame.raw.clone())
    }

    fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }
}

impl Drop for ScreenTrack {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}
