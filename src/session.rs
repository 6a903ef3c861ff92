//! Live call session
//!
//! A [`LiveSession`] is an actor task that owns every piece of mutable call
//! state: call lifecycle, transcript, playback clock and activity. Commands,
//! inbound channel events, playback completions and track notifications are
//! all funnelled into its loop, so each entity has exactly one writer.
//! Capture callbacks and sampler ticks run elsewhere and only touch the
//! outbound queue and atomic flags.

use crate::activity::{ActivitySignal, ActivityTracker};
use crate::call::{CallStateMachine, EndReason};
use crate::capture::{AudioSource, MediaCapture, TrackEnded, TrackEndedEvent, TrackKind, VideoSource};
use crate::channel::{Channel, ChannelOpener, OpenedChannel, SendFailure};
use crate::config::LiveConfig;
use crate::encoder::{AudioEncoder, AudioPump};
use crate::error::{CaptureError, ChannelOpenError, Result, SessionError};
use crate::events::{ActivityState, CallState, Outbound, ServerEvent, Speaker};
use crate::frame_sampler::{FrameEncoder, FrameSampler, SamplerContext, ScreenFlags};
use crate::playback::{OutputDevice, PlaybackScheduler, UnitId};
use crate::transcript::{TranscriptAggregator, TranscriptEntry};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// User commands accepted by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    StartCall,
    StopCall,
    ShareScreen,
    StopScreenShare,
    ToggleVisibility,
    Shutdown,
}

/// Read-only view of the session for the UI.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub call: CallState,
    pub activity: ActivityState,
    pub transcript: Vec<TranscriptEntry>,
    pub screen_shared: bool,
    pub visible_to_agent: bool,
    pub last_error: Option<String>,
}

/// Results of work spawned off the actor loop, tagged with the generation
/// that requested them so stale results can be discarded.
enum Internal {
    MicAcquired {
        generation: u64,
        result: std::result::Result<Box<dyn AudioSource>, CaptureError>,
    },
    ChannelOpened {
        generation: u64,
        result: std::result::Result<OpenedChannel, ChannelOpenError>,
    },
    ScreenAcquired {
        generation: u64,
        result: std::result::Result<Box<dyn VideoSource>, CaptureError>,
    },
    OutboundStalled {
        generation: u64,
        reason: SendFailure,
    },
}

/// Everything a call owns. Each slot is taken exactly once on teardown.
#[derive(Default)]
struct CallResources {
    sampler: Option<FrameSampler>,
    screen: Option<Arc<dyn VideoSource>>,
    mic: Option<Box<dyn AudioSource>>,
    /// Encoder graph connection; capture callbacks and sampler ticks no-op once cleared
    live: Arc<AtomicBool>,
    channel: Option<Channel>,
    events: Option<mpsc::Receiver<ServerEvent>>,
}

/// Cheap, cloneable front end of a running session.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| SessionError::Closed)
    }

    pub fn start_call(&self) -> Result<()> {
        self.send(Command::StartCall)
    }

    pub fn stop_call(&self) -> Result<()> {
        self.send(Command::StopCall)
    }

    pub fn share_screen(&self) -> Result<()> {
        self.send(Command::ShareScreen)
    }

    pub fn stop_screen_share(&self) -> Result<()> {
        self.send(Command::StopScreenShare)
    }

    pub fn toggle_visibility(&self) -> Result<()> {
        self.send(Command::ToggleVisibility)
    }

    /// Stop any call and end the session task.
    pub fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.clone()
    }

    /// Wait until the published snapshot satisfies `predicate`.
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&SessionSnapshot) -> bool,
    ) -> Result<SessionSnapshot> {
        let mut rx = self.state.clone();
        let snapshot = rx.wait_for(predicate).await.map_err(|_| SessionError::Closed)?;
        Ok(snapshot.clone())
    }
}

async fn next_event(events: &mut Option<mpsc::Receiver<ServerEvent>>) -> ServerEvent {
    match events {
        Some(rx) => rx.recv().await.unwrap_or(ServerEvent::Closed),
        None => std::future::pending().await,
    }
}

pub struct LiveSession<C, O, D> {
    config: LiveConfig,
    capture: Arc<C>,
    opener: Arc<O>,

    call: CallStateMachine,
    activity: ActivityTracker,
    transcript: TranscriptAggregator,
    scheduler: PlaybackScheduler<D>,
    flags: ScreenFlags,
    last_error: Option<String>,

    generation: u64,
    screen_generation: u64,
    screen_pending: bool,
    resources: CallResources,

    commands: mpsc::UnboundedReceiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    track_tx: mpsc::UnboundedSender<TrackEndedEvent>,
    track_rx: mpsc::UnboundedReceiver<TrackEndedEvent>,
    unit_ended: mpsc::UnboundedReceiver<UnitId>,
    state_tx: watch::Sender<SessionSnapshot>,
}

impl<C, O, D> LiveSession<C, O, D>
where
    C: MediaCapture,
    O: ChannelOpener,
    D: OutputDevice,
{
    /// Start the session task. `unit_ended` carries completions from the
    /// output device driver.
    pub fn spawn(
        config: LiveConfig,
        capture: C,
        opener: O,
        output: D,
        unit_ended: mpsc::UnboundedReceiver<UnitId>,
    ) -> (SessionHandle, JoinHandle<()>) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (track_tx, track_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionSnapshot::default());

        let session = Self {
            config,
            capture: Arc::new(capture),
            opener: Arc::new(opener),
            call: CallStateMachine::new(),
            activity: ActivityTracker::new(),
            transcript: TranscriptAggregator::new(),
            scheduler: PlaybackScheduler::new(output),
            flags: ScreenFlags::default(),
            last_error: None,
            generation: 0,
            screen_generation: 0,
            screen_pending: false,
            resources: CallResources::default(),
            commands,
            internal_tx,
            internal_rx,
            track_tx,
            track_rx,
            unit_ended,
            state_tx,
        };

        let handle = SessionHandle {
            commands: commands_tx,
            state: state_rx,
        };
        (handle, tokio::spawn(session.run()))
    }

    async fn run(mut self) {
        info!("Live session started");
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.on_command(command),
                },
                Some(msg) = self.internal_rx.recv() => self.on_internal(msg),
                Some(event) = self.track_rx.recv() => self.on_track_ended(event),
                Some(id) = self.unit_ended.recv() => self.on_unit_ended(id),
                event = next_event(&mut self.resources.events) => self.on_server_event(event),
            }
            self.publish();
        }

        self.finish(EndReason::UserStop);
        self.publish();
        info!("Live session shut down");
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            call: self.call.state(),
            activity: self.activity.state(),
            transcript: self.transcript.entries().to_vec(),
            screen_shared: self.flags.is_shared(),
            visible_to_agent: self.flags.is_visible(),
            last_error: self.last_error.clone(),
        }
    }

    fn publish(&self) {
        let next = self.snapshot();
        self.state_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            if current.call != next.call {
                info!("Call state: {} -> {}", current.call, next.call);
            }
            if current.activity != next.activity {
                debug!("Agent activity: {} -> {}", current.activity, next.activity);
            }
            *current = next;
            true
        });
    }

    fn on_command(&mut self, command: Command) {
        debug!(?command, "Session command");
        match command {
            Command::StartCall => self.start_call(),
            Command::StopCall => {
                if self.call.state().is_active() {
                    info!("Stopping call");
                    self.finish(EndReason::UserStop);
                } else {
                    debug!("No active call to stop");
                }
            }
            Command::ShareScreen => self.share_screen(),
            Command::StopScreenShare => self.stop_screen_share(),
            Command::ToggleVisibility => {
                if self.flags.is_shared() {
                    let visible = !self.flags.is_visible();
                    self.flags.set_visible(visible);
                    info!("Screen {} to agent", if visible { "visible" } else { "hidden" });
                } else {
                    warn!("Screen is not shared, ignoring visibility toggle");
                }
            }
            Command::Shutdown => {}
        }
    }

    fn start_call(&mut self) {
        if let Err(e) = self.call.begin_start() {
            warn!("Ignoring start request: {}", e);
            return;
        }
        self.generation += 1;
        self.transcript.clear();
        self.flags.reset();
        self.last_error = None;
        self.resources = CallResources {
            live: Arc::new(AtomicBool::new(true)),
            ..Default::default()
        };
        info!("Starting call #{}", self.generation);

        let generation = self.generation;
        let capture = self.capture.clone();
        let block_size = self.config.block_size;
        let ended = TrackEnded::new(TrackKind::Microphone, generation, self.track_tx.clone());
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || capture.acquire_microphone(block_size, ended))
                .await
                .unwrap_or_else(|e| Err(CaptureError::DeviceUnavailable(e.to_string())));
            let _ = internal.send(Internal::MicAcquired { generation, result });
        });
    }

    /// Whether a spawned result still belongs to the call in progress.
    fn is_current(&self, generation: u64, state: CallState) -> bool {
        generation == self.generation && self.call.state() == state
    }

    fn on_internal(&mut self, msg: Internal) {
        match msg {
            Internal::MicAcquired { generation, result } => {
                if !self.is_current(generation, CallState::Connecting) {
                    if let Ok(mut mic) = result {
                        debug!("Releasing microphone from abandoned start");
                        mic.stop();
                    }
                    return;
                }
                match result {
                    Ok(mic) => {
                        info!("Microphone acquired ({} Hz)", mic.sample_rate());
                        self.resources.mic = Some(mic);
                        self.open_channel();
                    }
                    Err(e) => self.fail(e.into()),
                }
            }
            Internal::ChannelOpened { generation, result } => {
                if !self.is_current(generation, CallState::Connecting) {
                    if let Ok(mut opened) = result {
                        debug!("Closing channel from abandoned start");
                        opened.channel.close();
                    }
                    return;
                }
                match result {
                    Ok(opened) => self.on_connected(opened),
                    Err(e) => self.fail(e.into()),
                }
            }
            Internal::ScreenAcquired { generation, result } => self.on_screen_acquired(generation, result),
            Internal::OutboundStalled { generation, reason } => {
                if self.is_current(generation, CallState::Connected) {
                    let msg = match reason {
                        SendFailure::Full => "outbound audio dropped continuously",
                        SendFailure::Closed => "outbound channel closed",
                    };
                    self.fail(SessionError::Transport(msg.to_string()));
                }
            }
        }
    }

    fn open_channel(&mut self) {
        let generation = self.generation;
        let opener = self.opener.clone();
        let config = self.config.clone();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            info!("Opening session channel");
            let result = tokio::time::timeout(config.connect_timeout, opener.open(&config))
                .await
                .unwrap_or(Err(ChannelOpenError::TimedOut));
            let _ = internal.send(Internal::ChannelOpened { generation, result });
        });
    }

    fn on_connected(&mut self, opened: OpenedChannel) {
        if let Err(e) = self.call.connected() {
            error!("Channel opened in unexpected state: {}", e);
            return;
        }
        let OpenedChannel { channel, events } = opened;
        let sender = channel.sender();
        self.resources.channel = Some(channel);
        self.resources.events = Some(events);
        self.activity.apply(ActivitySignal::CallStarted);

        let Some(mic) = self.resources.mic.as_mut() else {
            self.fail(SessionError::Capture(CaptureError::DeviceUnavailable(
                "microphone missing at connect".to_string(),
            )));
            return;
        };

        let encoder = AudioEncoder::new(mic.sample_rate(), mic.channels(), self.config.input_sample_rate);
        let generation = self.generation;
        let internal = self.internal_tx.clone();
        let mut pump = AudioPump::new(
            encoder,
            sender,
            self.resources.live.clone(),
            self.config.max_consecutive_drops,
            move |reason| {
                let _ = internal.send(Internal::OutboundStalled { generation, reason });
            },
        );

        if let Err(e) = mic.connect(Box::new(move |block: &[f32]| {
            pump.push(block);
        })) {
            self.fail(e.into());
            return;
        }
        info!("Call connected, streaming microphone");
    }

    fn share_screen(&mut self) {
        if self.call.state() != CallState::Connected {
            warn!("{}, cannot share screen", SessionError::NotConnected);
            return;
        }
        if self.flags.is_shared() || self.screen_pending {
            debug!("Screen share already active or pending");
            return;
        }
        self.screen_generation += 1;
        self.screen_pending = true;

        let generation = self.screen_generation;
        let capture = self.capture.clone();
        let ended = TrackEnded::new(TrackKind::Screen, generation, self.track_tx.clone());
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || capture.acquire_screen(ended))
                .await
                .unwrap_or_else(|e| Err(CaptureError::DeviceUnavailable(e.to_string())));
            let _ = internal.send(Internal::ScreenAcquired { generation, result });
        });
    }

    fn on_screen_acquired(
        &mut self,
        generation: u64,
        result: std::result::Result<Box<dyn VideoSource>, CaptureError>,
    ) {
        let current = generation == self.screen_generation;
        if current {
            self.screen_pending = false;
        }
        if !current || self.call.state() != CallState::Connected {
            if let Ok(source) = result {
                debug!("Releasing screen from abandoned share");
                source.stop();
            }
            return;
        }

        let source: Arc<dyn VideoSource> = match result {
            Ok(source) => Arc::from(source),
            Err(CaptureError::UserCancelled) => {
                info!("Screen share cancelled");
                return;
            }
            Err(e) => {
                warn!("Error starting screen share: {}", e);
                return;
            }
        };
        let Some(channel) = self.resources.channel.as_ref() else {
            source.stop();
            return;
        };

        self.flags.set_shared(true);
        self.flags.set_visible(true);
        let context = SamplerContext {
            source: source.clone(),
            sender: channel.sender(),
            flags: self.flags.clone(),
            live: self.resources.live.clone(),
            encoder: FrameEncoder {
                quality: self.config.jpeg_quality,
                max_edge: self.config.max_frame_edge,
            },
        };
        self.resources.sampler = Some(FrameSampler::start(context, self.config.frame_interval()));
        self.resources.screen = Some(source);
        info!("Screen shared and visible to agent");
    }

    /// Stop sharing without touching the rest of the call.
    fn stop_screen_share(&mut self) {
        // invalidates any acquisition still in flight
        self.screen_generation += 1;
        self.screen_pending = false;
        if let Some(sampler) = self.resources.sampler.take() {
            sampler.stop();
        }
        if let Some(screen) = self.resources.screen.take() {
            screen.stop();
            info!("Screen share stopped");
        }
        self.flags.reset();
    }

    fn on_track_ended(&mut self, event: TrackEndedEvent) {
        match event.kind {
            TrackKind::Screen if event.generation == self.screen_generation => {
                info!("Screen track ended externally");
                self.stop_screen_share();
            }
            TrackKind::Microphone if self.call.state().is_active() && event.generation == self.generation => {
                self.fail(SessionError::Capture(CaptureError::DeviceUnavailable(
                    "microphone track ended".to_string(),
                )));
            }
            _ => debug!(?event, "Ignoring stale track end"),
        }
    }

    fn on_unit_ended(&mut self, id: UnitId) {
        if self.scheduler.on_unit_ended(id) && self.call.state() == CallState::Connected {
            self.activity.apply(ActivitySignal::PlaybackDrained);
        }
    }

    fn on_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::TextFragment { speaker, text } => {
                // the user's own transcription says nothing about the agent
                if speaker == Speaker::Agent {
                    self.activity.apply(ActivitySignal::Fragment);
                }
                self.transcript.on_fragment(speaker, &text);
            }
            ServerEvent::AudioFragment { data } => {
                self.activity.apply(ActivitySignal::Fragment);
                if let Err(e) = self.scheduler.on_audio_fragment(&data) {
                    warn!("Dropping malformed audio fragment: {}", e);
                }
            }
            ServerEvent::TurnComplete => {
                for entry in self.transcript.on_turn_complete() {
                    info!("[{:?}] {}", entry.speaker, entry.text);
                }
                self.activity.apply(ActivitySignal::TurnComplete);
            }
            ServerEvent::Interrupted => {
                self.scheduler.on_interruption();
                self.activity.apply(ActivitySignal::Interrupted);
            }
            ServerEvent::Error(msg) => self.fail(SessionError::Transport(msg)),
            ServerEvent::Closed => {
                info!("Session channel closed by remote");
                self.finish(EndReason::RemoteClosed);
            }
        }
    }

    fn fail(&mut self, err: SessionError) {
        error!("Call failed: {}", err);
        self.last_error = Some(err.to_string());
        self.finish(EndReason::Failed);
    }

    /// Leave the active states, releasing every resource first.
    fn finish(&mut self, reason: EndReason) {
        if !self.call.state().is_active() {
            return;
        }
        self.teardown(reason == EndReason::UserStop);
        if let Err(e) = self.call.end(reason) {
            error!("{}", e);
        }
        self.activity.apply(ActivitySignal::CallEnded);
    }

    /// Release call resources in a fixed order. Idempotent.
    fn teardown(&mut self, orderly: bool) {
        if let Some(sampler) = self.resources.sampler.take() {
            sampler.stop();
        }
        if let Some(screen) = self.resources.screen.take() {
            debug!("Stopping screen track");
            screen.stop();
        }
        self.screen_generation += 1;
        self.screen_pending = false;
        self.flags.reset();

        if let Some(mut mic) = self.resources.mic.take() {
            debug!("Stopping microphone track");
            mic.stop();
        }
        self.resources.live.store(false, Ordering::Release);

        if let Some(mut channel) = self.resources.channel.take() {
            if orderly {
                let _ = channel.send(Outbound::AudioStreamEnd);
            }
            channel.close();
        }
        self.resources.events = None;

        let stopped = self.scheduler.stop_all();
        debug!("Released {} playback unit(s)", stopped);
    }
}
