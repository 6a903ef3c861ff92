//! In-process fakes for capture, channel and screen used across unit tests.

use crate::capture::{AudioSource, BlockSink, MediaCapture, TrackEnded, VideoSource};
use crate::channel::{Channel, ChannelOpener, OpenedChannel};
use crate::config::LiveConfig;
use crate::error::{CaptureError, ChannelOpenError};
use crate::events::{Outbound, ServerEvent};
use crate::frame_sampler::ScreenFlags;
use image::RgbaImage;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use tokio::sync::mpsc;

/// Screen track with a fixed frame.
#[derive(Default)]
pub struct FakeScreen {
    frame: Mutex<Option<RgbaImage>>,
    grabs: AtomicUsize,
    hide_on_grab: Mutex<Option<ScreenFlags>>,
    held: (Mutex<bool>, Condvar),
    recorder: Option<Arc<Recorder>>,
}

impl FakeScreen {
    pub fn new(frame: Option<RgbaImage>) -> Self {
        Self {
            frame: Mutex::new(frame),
            ..Default::default()
        }
    }

    pub fn grabs(&self) -> usize {
        self.grabs.load(Ordering::SeqCst)
    }

    /// Switch visibility off while the frame is being captured.
    pub fn hide_on_grab(&self, flags: ScreenFlags) {
        *self.hide_on_grab.lock().unwrap() = Some(flags);
    }

    /// Make every capture block until [`FakeScreen::release_grabs`].
    pub fn block_grabs(&self) {
        *self.held.0.lock().unwrap() = true;
    }

    pub fn release_grabs(&self) {
        *self.held.0.lock().unwrap() = false;
        self.held.1.notify_all();
    }
}

impl VideoSource for FakeScreen {
    fn grab_frame(&self) -> Option<RgbaImage> {
        self.grabs.fetch_add(1, Ordering::SeqCst);
        let (held, released) = &self.held;
        let _held = released
            .wait_while(held.lock().unwrap(), |held| *held)
            .unwrap();
        if let Some(flags) = self.hide_on_grab.lock().unwrap().as_ref() {
            flags.set_visible(false);
        }
        self.frame.lock().unwrap().clone()
    }

    fn stop(&self) {
        if let Some(recorder) = &self.recorder {
            recorder.record("screen.stop");
        }
    }
}

struct FakeMicrophone {
    recorder: Arc<Recorder>,
}

impl AudioSource for FakeMicrophone {
    fn sample_rate(&self) -> u32 {
        16_000
    }

    fn channels(&self) -> u16 {
        1
    }

    fn connect(&mut self, sink: BlockSink) -> Result<(), CaptureError> {
        *self.recorder.mic_sink.lock().unwrap() = Some(sink);
        Ok(())
    }

    fn stop(&mut self) {
        self.recorder.mic_sink.lock().unwrap().take();
        self.recorder.record("mic.stop");
    }
}

/// Shared record of everything the fakes were asked to do.
#[derive(Default)]
pub struct Recorder {
    log: Mutex<Vec<&'static str>>,
    mic_sink: Mutex<Option<BlockSink>>,
    mic_ended: Mutex<Option<TrackEnded>>,
    screen_ended: Mutex<Option<TrackEnded>>,
    pub fail_mic: Mutex<Option<CaptureError>>,
    pub fail_screen: Mutex<Option<CaptureError>>,
    pub fail_open: Mutex<Option<ChannelOpenError>>,
    pub hang_open: std::sync::atomic::AtomicBool,
    pub screen_frame: Mutex<Option<RgbaImage>>,
    outbound: Mutex<Option<mpsc::Receiver<Outbound>>>,
    inbound: Mutex<Option<mpsc::Sender<ServerEvent>>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record(&self, what: &'static str) {
        self.log.lock().unwrap().push(what);
    }

    pub fn log(&self) -> Vec<&'static str> {
        self.log.lock().unwrap().clone()
    }

    pub fn count(&self, what: &str) -> usize {
        self.log().iter().filter(|w| **w == what).count()
    }

    /// Deliver a capture block through the connected microphone sink.
    pub fn push_mic(&self, block: &[f32]) -> bool {
        match self.mic_sink.lock().unwrap().as_mut() {
            Some(sink) => {
                sink(block);
                true
            }
            None => false,
        }
    }

    pub async fn emit(&self, event: ServerEvent) {
        let tx = self.inbound.lock().unwrap().clone().expect("channel not open");
        tx.send(event).await.expect("session dropped inbound events");
    }

    /// Everything queued on the outbound side so far.
    pub fn drain_outbound(&self) -> Vec<Outbound> {
        let mut guard = self.outbound.lock().unwrap();
        let mut out = Vec::new();
        if let Some(rx) = guard.as_mut() {
            while let Ok(msg) = rx.try_recv() {
                out.push(msg);
            }
        }
        out
    }

    /// Drop the outbound receiver, as a writer that died would.
    pub fn close_outbound(&self) {
        self.outbound.lock().unwrap().take();
    }

    pub fn end_screen(&self) {
        if let Some(ended) = self.screen_ended.lock().unwrap().as_ref() {
            ended.notify();
        }
    }

    pub fn end_mic(&self) {
        if let Some(ended) = self.mic_ended.lock().unwrap().as_ref() {
            ended.notify();
        }
    }
}

pub struct FakeCapture(pub Arc<Recorder>);

impl MediaCapture for FakeCapture {
    fn acquire_microphone(
        &self,
        _block_size: usize,
        ended: TrackEnded,
    ) -> Result<Box<dyn AudioSource>, CaptureError> {
        self.0.record("mic.acquire");
        if let Some(err) = self.0.fail_mic.lock().unwrap().clone() {
            return Err(err);
        }
        *self.0.mic_ended.lock().unwrap() = Some(ended);
        Ok(Box::new(FakeMicrophone {
            recorder: self.0.clone(),
        }))
    }

    fn acquire_screen(&self, ended: TrackEnded) -> Result<Box<dyn VideoSource>, CaptureError> {
        self.0.record("screen.acquire");
        if let Some(err) = self.0.fail_screen.lock().unwrap().clone() {
            return Err(err);
        }
        *self.0.screen_ended.lock().unwrap() = Some(ended);
        let frame = self.0.screen_frame.lock().unwrap().clone();
        Ok(Box::new(FakeScreen {
            frame: Mutex::new(frame),
            recorder: Some(self.0.clone()),
            ..Default::default()
        }))
    }
}

pub struct FakeOpener(pub Arc<Recorder>);

impl ChannelOpener for FakeOpener {
    fn open(
        &self,
        config: &LiveConfig,
    ) -> impl Future<Output = Result<OpenedChannel, ChannelOpenError>> + Send {
        let recorder = self.0.clone();
        let queue = config.outbound_queue;
        async move {
            recorder.record("channel.open");
            if recorder.hang_open.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if let Some(err) = recorder.fail_open.lock().unwrap().clone() {
                return Err(err);
            }
            let (out_tx, out_rx) = mpsc::channel(queue);
            let (in_tx, in_rx) = mpsc::channel(64);
            *recorder.outbound.lock().unwrap() = Some(out_rx);
            *recorder.inbound.lock().unwrap() = Some(in_tx);

            let closer = recorder.clone();
            let channel = Channel::new(out_tx, move || closer.record("channel.close"));
            Ok(OpenedChannel {
                channel,
                events: in_rx,
            })
        }
    }
}
