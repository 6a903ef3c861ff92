//! PulseAudio backends
//!
//! Microphone capture and agent playback through PulseAudio's simple API.
//! Each side runs on its own OS thread since the simple API blocks on every
//! read and write.

use crate::capture::{AudioSource, BlockSink, TrackEnded};
use crate::error::CaptureError;
use crate::playback::UnitId;
use crate::timeline::TimelineOutput;
use libpulse_binding::def::BufferAttr;
use libpulse_binding::error::{Code, PAErr};
use libpulse_binding::sample::{Format, Spec};
use libpulse_binding::stream::Direction;
use libpulse_simple_binding::Simple;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::sync_channel;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Native capture rate requested from the server
pub const CAPTURE_RATE: u32 = 48_000;

fn open_error(err: PAErr) -> CaptureError {
    if err == PAErr::from(Code::Access) {
        CaptureError::PermissionDenied(err.to_string())
    } else {
        CaptureError::DeviceUnavailable(err.to_string())
    }
}

fn decode_f32le(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

fn encode_s16le(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|s| ((s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16).to_le_bytes())
        .collect()
}

/// Run `open` on a new thread, hand the result back, and keep the stream on
/// that thread for `run`.
fn spawn_stream<F, R>(name: &str, open: F, run: R) -> Result<std::thread::JoinHandle<()>, CaptureError>
where
    F: FnOnce() -> Result<Simple, PAErr> + Send + 'static,
    R: FnOnce(Simple) + Send + 'static,
{
    let (ready_tx, ready_rx) = sync_channel(1);
    let handle = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || match open() {
            Ok(simple) => {
                let _ = ready_tx.send(Ok(()));
                run(simple);
            }
            Err(e) => {
                let _ = ready_tx.send(Err(open_error(e)));
            }
        })
        .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(handle),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(CaptureError::DeviceUnavailable(format!("{} thread exited", name))),
    }
}

/// Default PulseAudio source as a mono f32 track.
pub struct PulseMicrophone {
    sink: Arc<Mutex<Option<BlockSink>>>,
    stop: Arc<AtomicBool>,
}

impl PulseMicrophone {
    pub fn open(app_name: &str, block_size: usize, ended: TrackEnded) -> Result<Self, CaptureError> {
        let sink: Arc<Mutex<Option<BlockSink>>> = Arc::new(Mutex::new(None));
        let stop = Arc::new(AtomicBool::new(false));

        let app_name = app_name.to_string();
        let spec = Spec {
            format: Format::F32le,
            channels: 1,
            rate: CAPTURE_RATE,
        };

        let thread_sink = sink.clone();
        let thread_stop = stop.clone();
        spawn_stream(
            "screenlive-mic",
            move || Simple::new(None, &app_name, Direction::Record, None, "microphone", &spec, None, None),
            move |simple| {
                let mut buffer = vec![0u8; block_size * 4];
                while !thread_stop.load(Ordering::Acquire) {
                    if let Err(e) = simple.read(&mut buffer) {
                        if !thread_stop.load(Ordering::Acquire) {
                            warn!("Microphone read failed: {}", e);
                            ended.notify();
                        }
                        break;
                    }
                    let block = decode_f32le(&buffer);
                    let mut guard = thread_sink.lock().unwrap_or_else(PoisonError::into_inner);
                    if let Some(sink) = guard.as_mut() {
                        sink(&block);
                    }
                }
                // drop the sink and everything it holds
                thread_sink.lock().unwrap_or_else(PoisonError::into_inner).take();
                debug!("Microphone thread finished");
            },
        )?;

        info!("Opened PulseAudio microphone at {} Hz", CAPTURE_RATE);
        Ok(Self { sink, stop })
    }
}

impl AudioSource for PulseMicrophone {
    fn sample_rate(&self) -> u32 {
        CAPTURE_RATE
    }

    fn channels(&self) -> u16 {
        1
    }

    fn connect(&mut self, sink: BlockSink) -> Result<(), CaptureError> {
        if self.stop.load(Ordering::Acquire) {
            return Err(CaptureError::DeviceUnavailable("microphone already stopped".to_string()));
        }
        *self.sink.lock().unwrap_or_else(PoisonError::into_inner) = Some(sink);
        Ok(())
    }

    fn stop(&mut self) {
        // The thread notices at the next block boundary
        self.stop.store(true, Ordering::Release);
    }
}

impl Drop for PulseMicrophone {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

/// Play the timeline through the default PulseAudio sink.
///
/// The blocking write paces the render loop, so the timeline clock follows
/// the sound card. Finished units are reported on `ended_tx`.
pub fn spawn_pulse_driver(
    output: TimelineOutput,
    ended_tx: mpsc::UnboundedSender<UnitId>,
) -> Result<std::thread::JoinHandle<()>, CaptureError> {
    let frames = output.block_frames();
    let spec = Spec {
        format: Format::S16le,
        channels: 1,
        rate: output.lock().rate(),
    };
    // keep the server-side buffer at a few blocks so device time stays honest
    let attr = BufferAttr {
        maxlength: u32::MAX,
        tlength: (frames * 2 * 3) as u32,
        prebuf: u32::MAX,
        minreq: u32::MAX,
        fragsize: u32::MAX,
    };

    let handle = spawn_stream(
        "screenlive-playback",
        move || {
            Simple::new(
                None,
                "screenlive",
                Direction::Playback,
                None,
                "agent voice",
                &spec,
                None,
                Some(&attr),
            )
        },
        move |simple| {
            let mut block = vec![0.0f32; frames];
            loop {
                let finished = output.lock().render(&mut block);
                if let Err(e) = simple.write(&encode_s16le(&block)) {
                    error!("Playback write failed: {}", e);
                    break;
                }
                for id in finished {
                    if ended_tx.send(id).is_err() {
                        debug!("Playback listener gone, stopping driver");
                        return;
                    }
                }
            }
        },
    )?;

    info!("PulseAudio playback at {} Hz", spec.rate);
    Ok(handle)
}
