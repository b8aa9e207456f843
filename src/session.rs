//! Session controller: owns one call from start to rating
//!
//! Everything runs on a single task. Network, media, AI and UI inputs
//! arrive on channels and are handled one at a time by [`SessionController::run`];
//! timers are plain deadlines polled by the same loop, so cancelling one
//! is clearing a field.

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::backend::{
    spawn_open, spawn_report, BackendClient, BackendEvent, SessionOpened, SessionReport,
};
use crate::commands::UiCommand;
use crate::config::SessionConfig;
use crate::error::{ReasonCode, SessionError, SessionResult};
use crate::events::SessionEvent;
use crate::interjection::{AiEvent, Grant, InterjectionCoordinator, Speaker, Turn};
use crate::logger::{self, EventEmitter};
use crate::media::{
    DeviceEvent, MediaDevices, MediaTrackController, MediaTrackState, TrackKind, TrackOrigin,
};
use crate::peer::manager::{ConnectionManager, SignalOutcome};
use crate::peer::transport::{PeerTransport, TransportEvent, TransportStats};
use crate::peer::types::{ConnectionState, IceServerConfig};
use crate::pose::{PoseFrame, PoseOverlayRenderer, RenderStats, Scale, Skeleton, Surface};
use crate::quality::{QualityMetrics, QualityMonitor, QualitySample};
use crate::signaling::SignalMessage;
use crate::utils::random_id;

const DURATION_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotStarted,
    Active,
    Ended,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub session_id: String,
    /// The first participant is the local user.
    pub participants: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub backend_session_id: Option<String>,
    pub ai_agent: bool,
    pub rating: Option<u8>,
}

/// Connected time, only ever counted up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallMetrics {
    elapsed: Duration,
}

impl CallMetrics {
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    fn tick(&mut self, by: Duration) {
        self.elapsed += by;
    }
}

/// Returned by [`SessionController::run`] once the session is over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub session: Session,
    pub duration: Duration,
    pub end_reason: ReasonCode,
}

/// Outbound channels shared with the surrounding application.
#[derive(Debug, Clone)]
pub struct SessionLinks {
    pub events: EventEmitter,
    pub signals_out: mpsc::UnboundedSender<SignalMessage>,
}

/// Inbound channels consumed by [`SessionController::run`].
pub struct SessionInputs {
    pub commands: mpsc::Receiver<UiCommand>,
    pub signals: mpsc::UnboundedReceiver<SignalMessage>,
    pub ai_events: mpsc::UnboundedReceiver<AiEvent>,
    pub devices: mpsc::UnboundedReceiver<DeviceEvent>,
}

pub struct SessionController<T: PeerTransport, D: MediaDevices, B: BackendClient> {
    config: SessionConfig,
    state: SessionState,
    session: Session,
    metrics: CallMetrics,
    connection: ConnectionManager<T>,
    media: MediaTrackController<D>,
    quality: QualityMonitor,
    interjection: InterjectionCoordinator,
    overlay: PoseOverlayRenderer,
    backend: Arc<B>,
    backend_tx: mpsc::UnboundedSender<BackendEvent>,
    backend_rx: mpsc::UnboundedReceiver<BackendEvent>,
    backend_task: Option<JoinHandle<()>>,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    signals_out: mpsc::UnboundedSender<SignalMessage>,
    emitter: EventEmitter,
    duration_deadline: Option<Instant>,
    sample_deadline: Option<Instant>,
    human_speaking: bool,
    recording: bool,
    minimized: bool,
    end_reason: Option<ReasonCode>,
    report_sent: bool,
}

impl<T, D, B> SessionController<T, D, B>
where
    T: PeerTransport,
    D: MediaDevices,
    B: BackendClient,
{
    /// Validates `config` and wires the components together. A bad
    /// configuration, including a broken skeleton topology, fails here.
    ///
    /// When `config.logging` is set this installs the global `tracing`
    /// subscriber via [`logger::init`], unless the process already has
    /// one. Applications with their own subscriber can leave it installed
    /// first or turn `logging` off.
    pub fn new(
        config: SessionConfig,
        transport: T,
        devices: D,
        backend: Arc<B>,
        links: SessionLinks,
    ) -> SessionResult<Self> {
        config.validate()?;
        logger::init(config.logging);

        let session_id = random_id();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (backend_tx, backend_rx) = mpsc::unbounded_channel();

        let connection = ConnectionManager::new(
            transport,
            session_id.clone(),
            &config,
            transport_tx,
            links.signals_out.clone(),
            links.events.clone(),
        );
        let media = MediaTrackController::new(devices, config.permissions, links.events.clone());
        let overlay = PoseOverlayRenderer::new(Skeleton::body()?, &config.overlay);

        info!(%session_id, ai_agent = config.ai_agent, "Session created");

        Ok(Self {
            state: SessionState::NotStarted,
            session: Session {
                session_id,
                participants: Vec::new(),
                started_at: None,
                backend_session_id: None,
                ai_agent: config.ai_agent,
                rating: None,
            },
            metrics: CallMetrics::default(),
            connection,
            media,
            quality: QualityMonitor::new(config.quality.clone()),
            interjection: InterjectionCoordinator::new(config.interjection.max_duration()),
            overlay,
            backend,
            backend_tx,
            backend_rx,
            backend_task: None,
            transport_rx,
            signals_out: links.signals_out,
            emitter: links.events,
            duration_deadline: None,
            sample_deadline: None,
            human_speaking: false,
            recording: false,
            minimized: false,
            end_reason: None,
            report_sent: false,
            config,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_id(&self) -> &str {
        &self.session.session_id
    }

    pub fn call_metrics(&self) -> CallMetrics {
        self.metrics
    }

    pub fn connection(&self) -> &ConnectionManager<T> {
        &self.connection
    }

    pub fn media(&self) -> &MediaTrackController<D> {
        &self.media
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    pub fn is_minimized(&self) -> bool {
        self.minimized
    }

    pub fn current_speaker(&self) -> Option<&Speaker> {
        self.interjection.holder().map(|t| &t.speaker)
    }

    /// Live view of the latest quality snapshot.
    pub fn quality_metrics(&self) -> watch::Receiver<QualityMetrics> {
        self.quality.subscribe()
    }

    /// Armed timers plus in-flight backend work. Zero once the call has
    /// ended.
    pub fn active_timers(&self) -> usize {
        self.connection.active_timers()
            + self.duration_deadline.is_some() as usize
            + self.sample_deadline.is_some() as usize
            + self.interjection.next_deadline().is_some() as usize
            + self
                .backend_task
                .as_ref()
                .map_or(0, |t| !t.is_finished() as usize)
    }

    /// Draws one pose frame with the configured threshold and scale.
    pub fn render_pose<S: Surface>(&self, frame: &PoseFrame, surface: &mut S) -> RenderStats {
        let overlay = &self.config.overlay;
        self.overlay.render(
            frame,
            overlay.confidence_threshold,
            Scale {
                x: overlay.scale_x,
                y: overlay.scale_y,
            },
            surface,
        )
    }

    /// Opens the call: backend correlation in the background, local media,
    /// then the peer connection. Any setup failure ends the session.
    pub async fn start(
        &mut self,
        ice: IceServerConfig,
        participants: Vec<String>,
    ) -> SessionResult<()> {
        if self.state != SessionState::NotStarted {
            return Err(SessionError::invalid_state("start", self.state));
        }

        self.state = SessionState::Active;
        self.session.participants = participants;
        self.session.started_at = Some(Utc::now());
        info!(
            session_id = %self.session.session_id,
            participants = self.session.participants.len(),
            "Session starting"
        );

        self.backend_task = Some(spawn_open(
            self.backend.clone(),
            self.config.backend.clone(),
            SessionOpened {
                session_id: self.session.session_id.clone(),
                participants: self.session.participants.clone(),
                ai_agent: self.session.ai_agent,
                started_at: Utc::now(),
            },
            self.backend_tx.clone(),
        ));

        self.connection.begin(ice)?;

        if let Err(e) = self.media.acquire_local().await {
            let e = self.connection.abort_setup(e).await;
            self.end_call(e.reason_code()).await;
            return Err(e);
        }

        if let Err(e) = self.connection.open().await {
            self.end_call(e.reason_code()).await;
            return Err(e);
        }

        self.sync_connection().await;
        Ok(())
    }

    /// Drives the session until it has ended and either a rating was
    /// captured or the UI dropped its command handle.
    pub async fn run(&mut self, mut inputs: SessionInputs) -> SessionSummary {
        let mut commands_open = true;
        let mut signals_open = true;
        let mut ai_open = true;
        let mut devices_open = true;

        loop {
            if self.state == SessionState::Active && !commands_open {
                info!("Command channel closed, ending call");
                self.end_call(ReasonCode::LocalHangup).await;
            }
            if self.state == SessionState::Ended
                && (self.session.rating.is_some() || !commands_open)
            {
                break;
            }

            let deadline = self.next_deadline();

            tokio::select! {
                command = inputs.commands.recv(), if commands_open => match command {
                    Some(command) => self.handle_command(command).await,
                    None => commands_open = false,
                },
                signal = inputs.signals.recv(), if signals_open => match signal {
                    Some(signal) => self.handle_signal(signal).await,
                    None => {
                        debug!("Signaling channel closed");
                        signals_open = false;
                    }
                },
                Some(event) = self.transport_rx.recv() => {
                    self.handle_transport_event(event).await;
                }
                event = inputs.ai_events.recv(), if ai_open => match event {
                    Some(event) => self.handle_ai_event(event),
                    None => ai_open = false,
                },
                event = inputs.devices.recv(), if devices_open => match event {
                    Some(event) => self.handle_device_event(event).await,
                    None => devices_open = false,
                },
                Some(event) = self.backend_rx.recv() => self.handle_backend_event(event),
                _ = wait_until(deadline) => self.handle_timer(Instant::now()).await,
            }
        }

        if !self.report_sent {
            self.send_report();
        }

        SessionSummary {
            session: self.session.clone(),
            duration: self.metrics.elapsed(),
            end_reason: self.end_reason.unwrap_or(ReasonCode::LocalHangup),
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        [
            self.connection.next_deadline(),
            self.duration_deadline,
            self.sample_deadline,
            self.interjection.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn reject(&self, error: SessionError) {
        warn!(reason = ?error.reason_code(), "Command rejected: {}", error);
        self.emitter.emit(SessionEvent::CommandRejected {
            reason: error.reason_code(),
            message: error.to_string(),
        });
    }

    async fn handle_command(&mut self, command: UiCommand) {
        debug!(command = command.name(), state = ?self.state, "Handling command");

        if let UiCommand::Rate(rating) = command {
            if let Err(e) = self.rate(rating) {
                self.reject(e);
            }
            return;
        }
        if self.state != SessionState::Active {
            self.reject(SessionError::invalid_state(command.name(), self.state));
            return;
        }

        match command {
            UiCommand::ToggleMute => {
                self.media.toggle_mute();
            }
            UiCommand::ToggleVideo => {
                self.media.toggle_video();
            }
            UiCommand::ToggleScreenShare => {
                self.media.toggle_screen_share(&mut self.connection).await;
            }
            UiCommand::SetVirtualBackground(on) => {
                self.media.set_virtual_background(on);
            }
            UiCommand::SetBeautyFilter(on) => {
                self.media.set_beauty_filter(on);
            }
            UiCommand::SetNoiseCancellation(on) => {
                self.media.set_noise_cancellation(on);
            }
            UiCommand::StartRecording | UiCommand::StopRecording => {
                let wanted = command == UiCommand::StartRecording;
                if let Err(e) = self.set_recording(wanted) {
                    self.reject(e);
                }
            }
            UiCommand::ToggleMinimize => {
                self.minimized = !self.minimized;
                self.emitter.emit(SessionEvent::MinimizeChanged {
                    minimized: self.minimized,
                });
            }
            UiCommand::EndCall => {
                self.end_call(ReasonCode::LocalHangup).await;
            }
            UiCommand::Rate(_) => {}
        }
    }

    /// Recording can only change while media is flowing.
    fn set_recording(&mut self, on: bool) -> SessionResult<()> {
        let connection = self.connection.state();
        if connection != ConnectionState::Connected {
            let op = if on { "start_recording" } else { "stop_recording" };
            return Err(SessionError::invalid_state(op, connection));
        }
        if self.recording != on {
            self.recording = on;
            info!(recording = on, "Recording toggled");
            self.emitter
                .emit(SessionEvent::RecordingChanged { recording: on });
        }
        Ok(())
    }

    /// Captures the end-of-call rating and sends the final report.
    pub fn rate(&mut self, rating: u8) -> SessionResult<()> {
        if self.state != SessionState::Ended {
            return Err(SessionError::invalid_state("rate", self.state));
        }
        if !(1..=5).contains(&rating) {
            return Err(SessionError::InvalidRating(rating));
        }
        if self.session.rating.is_some() {
            return Err(SessionError::InvalidState {
                op: "rate",
                state: "Rated".into(),
            });
        }

        self.session.rating = Some(rating);
        info!(session_id = %self.session.session_id, rating, "Rating recorded");
        self.emitter.emit(SessionEvent::RatingRecorded { rating });
        self.send_report();
        Ok(())
    }

    fn send_report(&mut self) {
        let report = SessionReport {
            session_id: self.session.session_id.clone(),
            backend_session_id: self.session.backend_session_id.clone(),
            duration_secs: self.metrics.elapsed().as_secs(),
            rating: self.session.rating,
            end_reason: self.end_reason.unwrap_or(ReasonCode::LocalHangup),
            ended_at: Utc::now(),
        };
        spawn_report(self.backend.clone(), self.config.backend.clone(), report);
        self.report_sent = true;
    }

    async fn handle_signal(&mut self, signal: SignalMessage) {
        if self.state != SessionState::Active {
            debug!(kind = signal.kind(), "Session not active, signal discarded");
            return;
        }
        match self.connection.handle_remote_signal(signal).await {
            Ok(SignalOutcome::EndCall) => {
                self.end_call(ReasonCode::RemoteEnded).await;
            }
            Ok(outcome) => debug!(?outcome, "Signal handled"),
            // Already reported by the connection as ConnectionFailed
            Err(e) => debug!("Signal failed the connection: {}", e),
        }
        self.sync_connection().await;
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        if self.state != SessionState::Active {
            return;
        }
        match event {
            TransportEvent::RemoteTrack { id, kind } => {
                let track = MediaTrackState::new(id, kind, TrackOrigin::Remote);
                self.media.mirror_remote(track.clone());
                self.emitter.emit(SessionEvent::TrackChanged { track });
            }
            event => {
                self.connection.on_transport_event(event).await;
                self.sync_connection().await;
            }
        }
    }

    async fn handle_device_event(&mut self, event: DeviceEvent) {
        if self.state != SessionState::Active {
            debug!(?event, "Session not active, device event dropped");
            return;
        }
        match event {
            DeviceEvent::TrackFailed { kind, error } => {
                self.media.on_track_failure(kind, error);
                if kind == TrackKind::Audio {
                    self.detect_speech(0.0, Instant::now());
                }
            }
            DeviceEvent::ScreenCaptureFailed(error) => {
                self.media
                    .on_screen_capture_failure(&mut self.connection, error)
                    .await;
            }
        }
    }

    fn handle_backend_event(&mut self, event: BackendEvent) {
        match event {
            BackendEvent::Correlated(id) => {
                self.emitter.emit(SessionEvent::BackendCorrelated {
                    backend_session_id: id.clone(),
                });
                self.session.backend_session_id = Some(id);
            }
            BackendEvent::Unreachable(e) => self.emitter.emit_warning(&e),
        }
        self.backend_task = None;
    }

    fn handle_ai_event(&mut self, event: AiEvent) {
        if self.state != SessionState::Active {
            debug!(?event, "Session not active, AI event dropped");
            return;
        }
        if !self.config.ai_agent {
            warn!("AI event in a session without an AI agent ignored");
            return;
        }
        let now = Instant::now();

        match event {
            AiEvent::Response(utterance) => {
                if !self.config.turn_taking {
                    self.emitter.emit(SessionEvent::AiSpeaking {
                        text: utterance.text,
                    });
                    return;
                }
                let grant = self.interjection.request(Speaker::Ai, Some(utterance), now);
                debug!(?grant, "AI asked to speak");
                if grant == Grant::Granted {
                    if let Some(turn) = self.interjection.holder() {
                        self.announce(turn);
                    }
                }
            }
            AiEvent::Finished => self.release_slot(&Speaker::Ai, now),
            AiEvent::TimedOut(after) => {
                self.emitter
                    .emit_warning(&SessionError::AiServiceTimeout(after));
                self.interjection.cancel_queued(&Speaker::Ai);
                self.release_slot(&Speaker::Ai, now);
            }
        }
    }

    fn announce(&self, turn: &Turn) {
        self.emitter.emit(SessionEvent::SpeakerChanged {
            speaker: Some(turn.speaker.clone()),
        });
        if let Some(utterance) = &turn.utterance {
            self.emitter.emit(SessionEvent::AiSpeaking {
                text: utterance.text.clone(),
            });
        }
    }

    fn release_slot(&mut self, speaker: &Speaker, now: Instant) {
        if self.interjection.holder().map(|t| &t.speaker) != Some(speaker) {
            debug!(?speaker, "Not holding the slot, nothing to release");
            return;
        }
        match self.interjection.release(speaker, now) {
            Some(next) => self.announce(&next),
            None => self.emitter.emit(SessionEvent::SpeakerChanged { speaker: None }),
        }
    }

    fn local_speaker(&self) -> Speaker {
        Speaker::Human(
            self.session
                .participants
                .first()
                .cloned()
                .unwrap_or_else(|| "local".to_owned()),
        )
    }

    /// Requests or releases the slot for the local user as the smoothed
    /// microphone level crosses the speech threshold.
    fn detect_speech(&mut self, level: f32, now: Instant) {
        if !(self.config.ai_agent && self.config.turn_taking) {
            return;
        }
        let speaking = level >= self.config.interjection.speech_threshold;
        if speaking == self.human_speaking {
            return;
        }
        self.human_speaking = speaking;
        let human = self.local_speaker();

        if speaking {
            let grant = self.interjection.request(human.clone(), None, now);
            debug!(?grant, level, "Human speech detected");
            if grant == Grant::Granted {
                self.emitter.emit(SessionEvent::SpeakerChanged {
                    speaker: Some(human),
                });
            }
        } else {
            debug!(level, "Human speech ended");
            self.interjection.cancel_queued(&human);
            self.release_slot(&human, now);
        }
    }

    async fn handle_timer(&mut self, now: Instant) {
        self.connection.on_timer(now).await;
        self.sync_connection().await;
        if self.state != SessionState::Active {
            return;
        }

        if let Some(deadline) = self.duration_deadline.filter(|d| *d <= now) {
            self.metrics.tick(DURATION_TICK);
            self.duration_deadline = Some(deadline + DURATION_TICK);
            self.emitter.emit(SessionEvent::Duration {
                elapsed: self.metrics.elapsed(),
            });
        }

        if let Some(deadline) = self.sample_deadline.filter(|d| *d <= now) {
            self.sample_deadline = Some(deadline + self.config.quality.sample_interval());
            self.sample_quality(now).await;
        }

        if let Some(expired) = self.interjection.on_timer(now) {
            info!(speaker = ?expired.speaker, "Turn ran over the maximum duration");
            match expired.next {
                Some(next) => self.announce(&next),
                None => self.emitter.emit(SessionEvent::SpeakerChanged { speaker: None }),
            }
        }
    }

    async fn sample_quality(&mut self, now: Instant) {
        let stats = match self.connection.stats().await {
            Ok(stats) => stats,
            Err(e) => {
                debug!("No transport stats, sampling as unusable: {}", e);
                TransportStats {
                    packet_loss: 1.0,
                    rtt_ms: f64::INFINITY,
                }
            }
        };

        let sample = QualitySample {
            packet_loss: stats.packet_loss,
            rtt_ms: stats.rtt_ms,
            audio_level: self.media.input_level(),
            participant_count: self.session.participants.len(),
        };
        let adaptation = self.quality.ingest(sample);
        let metrics = self.quality.current();
        self.emitter.emit(SessionEvent::Quality { metrics });

        if let Some(command) = adaptation {
            self.media.apply_adaptation(&command);
            self.emitter.emit(SessionEvent::Adaptation { command });
        }

        // The smoothed level lags behind a mute
        let level = if self.media.is_muted() {
            0.0
        } else {
            metrics.audio_level
        };
        self.detect_speech(level, now);
    }

    /// Arms or pauses the session timers to match the connection state,
    /// and ends the call once the connection has failed.
    async fn sync_connection(&mut self) {
        if self.state != SessionState::Active {
            return;
        }
        let now = Instant::now();

        match self.connection.state() {
            ConnectionState::Connected => {
                if self.duration_deadline.is_none() {
                    self.duration_deadline = Some(now + DURATION_TICK);
                }
            }
            _ => self.duration_deadline = None,
        }

        match self.connection.state() {
            ConnectionState::Connected | ConnectionState::Reconnecting => {
                if self.sample_deadline.is_none() {
                    self.sample_deadline = Some(now + self.config.quality.sample_interval());
                }
            }
            _ => self.sample_deadline = None,
        }

        if self.connection.state() == ConnectionState::Failed {
            let reason = self
                .connection
                .failure()
                .map_or(ReasonCode::NetworkUnreachable, |e| e.reason_code());
            self.end_call(reason).await;
        }
    }

    /// Ends the call and releases everything it holds. Later calls do
    /// nothing.
    pub async fn end_call(&mut self, reason: ReasonCode) -> bool {
        if self.state == SessionState::Ended {
            debug!(?reason, "Call already ended");
            return false;
        }

        info!(session_id = %self.session.session_id, ?reason, "Ending call");

        let live = !matches!(
            self.connection.state(),
            ConnectionState::Idle | ConnectionState::Failed | ConnectionState::Closed
        );
        if reason == ReasonCode::LocalHangup && live {
            let end = SignalMessage::EndCall {
                session_id: self.session.session_id.clone(),
            };
            if self.signals_out.send(end).is_err() {
                warn!("Signaling channel closed, EndCall not delivered");
            }
        }

        self.connection.close().await;
        self.media.release_all();
        self.interjection.clear();
        self.human_speaking = false;
        self.duration_deadline = None;
        self.sample_deadline = None;
        if let Some(task) = self.backend_task.take() {
            task.abort();
        }
        if self.recording {
            self.recording = false;
            self.emitter
                .emit(SessionEvent::RecordingChanged { recording: false });
        }

        self.state = SessionState::Ended;
        self.end_reason = Some(reason);
        self.emitter.emit(SessionEvent::CallEnded { reason });
        true
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}
