//! Peer connection state machine: signaling, ICE negotiation, reconnection

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::{SessionError, SessionResult};
use crate::events::SessionEvent;
use crate::logger::EventEmitter;
use crate::peer::ice::{analyze_candidates, CandidateBuffer};
use crate::peer::reconnect::Backoff;
use crate::peer::state::can_transition;
use crate::peer::transport::{PeerTransport, TransportEvent, TransportStats, VideoSource};
use crate::peer::types::{ConnectionState, IceCandidate, IceServerConfig};
use crate::signaling::SignalMessage;

/// What happened to an inbound signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalOutcome {
    Applied,
    /// Queued until the remote description is set.
    Buffered,
    /// Dropped: duplicate, stale, or arrived after close.
    Discarded,
    /// The remote side ended this session.
    EndCall,
}

/// How a video source change reached the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceOutcome {
    Replaced,
    Renegotiated,
}

pub struct ConnectionManager<T: PeerTransport> {
    transport: T,
    state: ConnectionState,
    session_id: String,
    initiator: bool,
    negotiation_timeout: Duration,
    ice: Option<IceServerConfig>,
    candidates: CandidateBuffer,
    local_candidates: Vec<IceCandidate>,
    remote_description_set: bool,
    awaiting_answer: bool,
    backoff: Backoff,
    setup_deadline: Option<Instant>,
    reconnect_deadline: Option<Instant>,
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    outbound: mpsc::UnboundedSender<SignalMessage>,
    emitter: EventEmitter,
    failure: Option<SessionError>,
    teardowns: u32,
}

impl<T: PeerTransport> ConnectionManager<T> {
    /// `transport_tx` is handed to the transport on every `open()`; the
    /// owner of the matching receiver feeds events back through
    /// [`ConnectionManager::on_transport_event`].
    pub fn new(
        transport: T,
        session_id: impl Into<String>,
        config: &SessionConfig,
        transport_tx: mpsc::UnboundedSender<TransportEvent>,
        outbound: mpsc::UnboundedSender<SignalMessage>,
        emitter: EventEmitter,
    ) -> Self {
        Self {
            transport,
            state: ConnectionState::Idle,
            session_id: session_id.into(),
            initiator: config.initiator,
            negotiation_timeout: config.negotiation_timeout(),
            ice: None,
            candidates: CandidateBuffer::new(),
            local_candidates: Vec::new(),
            remote_description_set: false,
            awaiting_answer: false,
            backoff: Backoff::new(config.reconnect.clone()),
            setup_deadline: None,
            reconnect_deadline: None,
            transport_tx,
            outbound,
            emitter,
            failure: None,
            teardowns: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn ice_config(&self) -> Option<&IceServerConfig> {
        self.ice.as_ref()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Number of completed teardowns; never exceeds one.
    pub fn teardowns(&self) -> u32 {
        self.teardowns
    }

    /// Error that moved the connection to `Failed`, if any.
    pub fn failure(&self) -> Option<&SessionError> {
        self.failure.as_ref()
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.backoff.attempt()
    }

    pub fn pending_candidates(&self) -> usize {
        self.candidates.pending_len()
    }

    pub fn active_timers(&self) -> usize {
        self.setup_deadline.is_some() as usize + self.reconnect_deadline.is_some() as usize
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.setup_deadline, self.reconnect_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn transition(&mut self, to: ConnectionState) {
        if self.state == to {
            return;
        }
        if !can_transition(self.state, to) {
            warn!(from = ?self.state, ?to, "Rejected connection state transition");
            return;
        }
        info!(session_id = %self.session_id, from = ?self.state, ?to, "Connection state");
        self.state = to;
        self.emitter.emit(SessionEvent::StateChanged { state: to });
    }

    fn send_signal(&self, message: SignalMessage) {
        debug!(kind = message.kind(), "Sending signal");
        if self.outbound.send(message).is_err() {
            warn!("Signaling channel closed, outbound message dropped");
        }
    }

    /// Begins a call: `begin` followed by `open`.
    pub async fn start(&mut self, ice: IceServerConfig) -> SessionResult<()> {
        self.begin(ice)?;
        self.open().await
    }

    /// Enters `Gathering` and arms the setup deadline. Valid from `Idle`,
    /// or from `Failed` for a fresh attempt. Local media can be acquired
    /// between `begin` and `open`.
    pub fn begin(&mut self, ice: IceServerConfig) -> SessionResult<()> {
        if !matches!(self.state, ConnectionState::Idle | ConnectionState::Failed) {
            return Err(SessionError::invalid_state("start", self.state));
        }

        info!(
            session_id = %self.session_id,
            servers = ice.len(),
            initiator = self.initiator,
            "Starting connection"
        );

        self.candidates.clear();
        self.local_candidates.clear();
        self.remote_description_set = false;
        self.awaiting_answer = false;
        self.failure = None;
        self.backoff.reset();
        self.reconnect_deadline = None;
        self.ice = Some(ice);

        self.transition(ConnectionState::Gathering);
        self.setup_deadline = Some(Instant::now() + self.negotiation_timeout);
        Ok(())
    }

    /// Opens the transport and, on the initiating side, sends the offer.
    pub async fn open(&mut self) -> SessionResult<()> {
        if self.state != ConnectionState::Gathering {
            return Err(SessionError::invalid_state("open", self.state));
        }
        let Some(ice) = self.ice.clone() else {
            return Err(SessionError::invalid_state("open", self.state));
        };

        if let Err(e) = self.transport.open(&ice, self.transport_tx.clone()).await {
            return Err(self.fail(e).await);
        }

        if self.initiator {
            match self.transport.create_offer(false).await {
                Ok(sdp) => {
                    self.awaiting_answer = true;
                    self.transition(ConnectionState::Negotiating);
                    self.send_signal(SignalMessage::Offer { sdp });
                }
                Err(e) => return Err(self.fail(e).await),
            }
        }

        Ok(())
    }

    /// Fails a call that is still being set up, e.g. when local media
    /// could not be acquired.
    pub async fn abort_setup(&mut self, error: SessionError) -> SessionError {
        if !self.state.is_setup() {
            return error;
        }
        self.fail(error).await
    }

    /// Applies one inbound signaling message, in arrival order.
    pub async fn handle_remote_signal(
        &mut self,
        message: SignalMessage,
    ) -> SessionResult<SignalOutcome> {
        if self.state == ConnectionState::Closed {
            debug!(kind = message.kind(), "Connection closed, signal discarded");
            return Ok(SignalOutcome::Discarded);
        }

        match message {
            SignalMessage::Offer { sdp } => self.on_remote_offer(&sdp).await,
            SignalMessage::Answer { sdp } => self.on_remote_answer(&sdp).await,
            SignalMessage::IceCandidate {
                candidate,
                sdp_mid,
                sdp_m_line_index,
            } => {
                self.on_remote_candidate(IceCandidate {
                    candidate,
                    sdp_mid,
                    sdp_m_line_index,
                })
                .await
            }
            SignalMessage::EndCall { session_id } => {
                if session_id == self.session_id {
                    info!(%session_id, "Remote ended the call");
                    Ok(SignalOutcome::EndCall)
                } else {
                    warn!(%session_id, expected = %self.session_id, "EndCall for another session ignored");
                    Ok(SignalOutcome::Discarded)
                }
            }
        }
    }

    async fn on_remote_offer(&mut self, sdp: &str) -> SessionResult<SignalOutcome> {
        let accepting = match self.state {
            ConnectionState::Gathering => !self.initiator,
            ConnectionState::Negotiating => !self.initiator && !self.remote_description_set,
            ConnectionState::Connected | ConnectionState::Reconnecting => true,
            _ => false,
        };
        if !accepting {
            warn!(state = ?self.state, "Unexpected offer discarded");
            return Ok(SignalOutcome::Discarded);
        }

        if self.state == ConnectionState::Reconnecting {
            self.candidates.clear();
        }

        match self.transport.create_answer(sdp).await {
            Ok(answer) => {
                self.remote_description_set = true;
                self.flush_pending_candidates().await;
                if self.state == ConnectionState::Gathering {
                    self.transition(ConnectionState::Negotiating);
                }
                self.send_signal(SignalMessage::Answer { sdp: answer });
                Ok(SignalOutcome::Applied)
            }
            Err(e) => self.negotiation_error(e).await,
        }
    }

    async fn on_remote_answer(&mut self, sdp: &str) -> SessionResult<SignalOutcome> {
        if !self.awaiting_answer {
            warn!(state = ?self.state, "Answer without a pending offer discarded");
            return Ok(SignalOutcome::Discarded);
        }

        match self.transport.set_remote_answer(sdp).await {
            Ok(()) => {
                self.awaiting_answer = false;
                self.remote_description_set = true;
                self.flush_pending_candidates().await;
                Ok(SignalOutcome::Applied)
            }
            Err(e) => self.negotiation_error(e).await,
        }
    }

    async fn on_remote_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> SessionResult<SignalOutcome> {
        if self.state == ConnectionState::Idle || self.state == ConnectionState::Failed {
            debug!(state = ?self.state, "No live connection, candidate discarded");
            return Ok(SignalOutcome::Discarded);
        }
        if !self.candidates.admit(&candidate) {
            return Ok(SignalOutcome::Discarded);
        }
        if !self.remote_description_set {
            self.candidates.defer(candidate);
            return Ok(SignalOutcome::Buffered);
        }

        if let Err(e) = self.transport.add_remote_candidate(&candidate).await {
            warn!("Failed to add ICE candidate: {}", e);
        }
        Ok(SignalOutcome::Applied)
    }

    async fn flush_pending_candidates(&mut self) {
        for candidate in self.candidates.drain_pending() {
            debug!(candidate = %candidate.candidate, "Applying pending candidate");
            if let Err(e) = self.transport.add_remote_candidate(&candidate).await {
                warn!("Failed to apply pending candidate: {}", e);
            }
        }
    }

    /// Fatal errors fail the connection during setup. Anything else is a
    /// warning: later on the reconnection policy keeps running, and during
    /// setup the negotiation deadline still applies.
    async fn negotiation_error(&mut self, e: SessionError) -> SessionResult<SignalOutcome> {
        if self.state.is_setup() && e.is_fatal() {
            Err(self.fail(e).await)
        } else {
            self.emitter.emit_warning(&e);
            Ok(SignalOutcome::Discarded)
        }
    }

    pub async fn on_transport_event(&mut self, event: TransportEvent) {
        if self.state == ConnectionState::Closed || self.state == ConnectionState::Failed {
            debug!(?event, state = ?self.state, "Transport event after teardown ignored");
            return;
        }

        match event {
            TransportEvent::LocalCandidate(candidate) => {
                self.local_candidates.push(candidate.clone());
                self.send_signal(candidate.into());
            }
            TransportEvent::GatheringComplete => {
                debug!(count = self.local_candidates.len(), "ICE gathering complete");
                analyze_candidates(&self.local_candidates);
            }
            TransportEvent::Connected => match self.state {
                ConnectionState::Negotiating => {
                    self.setup_deadline = None;
                    self.transition(ConnectionState::Connected);
                    self.emitter.emit_connected();
                }
                ConnectionState::Reconnecting => {
                    self.reconnect_deadline = None;
                    self.backoff.reset();
                    self.transition(ConnectionState::Connected);
                    self.emitter.emit_connection_recovered();
                }
                _ => debug!(state = ?self.state, "Transport connected, no transition"),
            },
            TransportEvent::RemoteTrack { id, kind } => {
                debug!(%id, ?kind, "Remote track announced");
            }
            TransportEvent::Disconnected => {
                if self.state == ConnectionState::Connected {
                    self.begin_reconnect().await;
                } else {
                    debug!(state = ?self.state, "Transport disconnected, no transition");
                }
            }
        }
    }

    async fn begin_reconnect(&mut self) {
        self.transition(ConnectionState::Reconnecting);
        self.emitter.emit_connection_problem();
        self.backoff.reset();
        self.next_reconnect_attempt().await;
    }

    /// Issues the next attempt and waits its backoff, or fails once the
    /// budget is spent.
    async fn next_reconnect_attempt(&mut self) {
        let Some((attempt, delay)) = self.backoff.next_attempt() else {
            let err = SessionError::NetworkUnreachable(format!(
                "reconnection failed after {} attempts",
                self.backoff.max_attempts()
            ));
            self.fail(err).await;
            return;
        };

        self.emitter
            .emit_connection_recovering(attempt, self.backoff.max_attempts());

        if self.initiator {
            // Restarted ICE reuses candidate strings under a new ufrag
            self.candidates.clear();
            match self.transport.create_offer(true).await {
                Ok(sdp) => {
                    self.awaiting_answer = true;
                    // Candidates for the new ufrag wait for the restart answer
                    self.remote_description_set = false;
                    self.send_signal(SignalMessage::Offer { sdp });
                }
                Err(e) => warn!(attempt, "ICE restart offer failed: {}", e),
            }
        }

        debug!(attempt, delay_ms = delay.as_millis() as u64, "Waiting for recovery");
        self.reconnect_deadline = Some(Instant::now() + delay);
    }

    /// Fires expired setup or backoff timers.
    pub async fn on_timer(&mut self, now: Instant) {
        if let Some(deadline) = self.setup_deadline {
            if deadline <= now {
                self.setup_deadline = None;
                if self.state.is_setup() {
                    let err = if self.state == ConnectionState::Gathering {
                        SessionError::IceGatheringTimeout(self.negotiation_timeout)
                    } else {
                        SessionError::NegotiationFailed(format!(
                            "not connected within {:?}",
                            self.negotiation_timeout
                        ))
                    };
                    self.fail(err).await;
                    return;
                }
            }
        }

        if let Some(deadline) = self.reconnect_deadline {
            if deadline <= now {
                self.reconnect_deadline = None;
                if self.state == ConnectionState::Reconnecting {
                    self.next_reconnect_attempt().await;
                }
            }
        }
    }

    /// Swaps the outbound video source on the live connection, in place when
    /// the transport allows it, otherwise through a new offer.
    pub async fn replace_video_source(
        &mut self,
        source: VideoSource,
    ) -> SessionResult<ReplaceOutcome> {
        if !matches!(
            self.state,
            ConnectionState::Negotiating | ConnectionState::Connected | ConnectionState::Reconnecting
        ) {
            return Err(SessionError::invalid_state("replace_video_source", self.state));
        }

        if self.transport.supports_track_replacement() {
            self.transport.replace_video_source(source).await?;
            info!(?source, "Video track replaced in place");
            return Ok(ReplaceOutcome::Replaced);
        }

        self.transport.swap_video_source(source).await?;
        let sdp = self
            .transport
            .create_offer(false)
            .await
            .map_err(|e| SessionError::TrackReplacementFailed(e.to_string()))?;
        self.awaiting_answer = true;
        self.send_signal(SignalMessage::Offer { sdp });
        info!(?source, "Video track swapped, renegotiating");
        Ok(ReplaceOutcome::Renegotiated)
    }

    pub async fn stats(&self) -> SessionResult<TransportStats> {
        self.transport.stats().await
    }

    async fn fail(&mut self, error: SessionError) -> SessionError {
        self.setup_deadline = None;
        self.reconnect_deadline = None;
        self.awaiting_answer = false;
        self.candidates.clear();
        self.transport.close().await;
        self.transition(ConnectionState::Failed);
        self.emitter.emit_connection_failed(&error);
        self.failure = Some(error.clone());
        error
    }

    /// Tears the connection down. Returns `false` if it was already closed.
    pub async fn close(&mut self) -> bool {
        if self.state == ConnectionState::Closed {
            debug!("close() on closed connection ignored");
            return false;
        }

        self.setup_deadline = None;
        self.reconnect_deadline = None;
        self.awaiting_answer = false;
        self.candidates.clear();
        self.local_candidates.clear();
        self.transport.close().await;
        self.transition(ConnectionState::Closed);
        self.teardowns += 1;
        self.emitter.emit_disconnected();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconnectPolicy;
    use crate::peer::types::IceServer;
    use crate::testing::FakeTransport;

    struct Harness {
        manager: ConnectionManager<FakeTransport>,
        outbound: mpsc::UnboundedReceiver<SignalMessage>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        _transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    }

    fn harness(config: SessionConfig, transport: FakeTransport) -> Harness {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (out_tx, outbound) = mpsc::unbounded_channel();
        let (emitter, events) = EventEmitter::channel();
        Harness {
            manager: ConnectionManager::new(
                transport,
                "session-1",
                &config,
                transport_tx,
                out_tx,
                emitter,
            ),
            outbound,
            events,
            _transport_rx: transport_rx,
        }
    }

    fn two_servers() -> IceServerConfig {
        IceServerConfig::new(vec![
            IceServer::stun("stun.example.org:3478"),
            IceServer::turn("relay.example.org:3478", "u", "p"),
        ])
        .unwrap()
    }

    fn drain<M>(rx: &mut mpsc::UnboundedReceiver<M>) -> Vec<M> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    async fn connected(h: &mut Harness) {
        h.manager.start(two_servers()).await.unwrap();
        h.manager
            .handle_remote_signal(SignalMessage::Answer { sdp: "answer".into() })
            .await
            .unwrap();
        h.manager.on_transport_event(TransportEvent::Connected).await;
        assert_eq!(h.manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initiator_reaches_connected() {
        let mut h = harness(SessionConfig::default(), FakeTransport::default());
        h.manager.start(two_servers()).await.unwrap();
        assert_eq!(h.manager.state(), ConnectionState::Negotiating);
        assert!(matches!(
            drain(&mut h.outbound).as_slice(),
            [SignalMessage::Offer { .. }]
        ));

        h.manager
            .handle_remote_signal(SignalMessage::Answer { sdp: "answer".into() })
            .await
            .unwrap();
        h.manager.on_transport_event(TransportEvent::Connected).await;

        assert_eq!(h.manager.state(), ConnectionState::Connected);
        assert_eq!(h.manager.active_timers(), 0);
        assert_eq!(h.manager.ice_config().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_responder_buffers_early_candidates() {
        let config = SessionConfig {
            initiator: false,
            ..Default::default()
        };
        let mut h = harness(config, FakeTransport::default());
        h.manager.start(two_servers()).await.unwrap();
        assert_eq!(h.manager.state(), ConnectionState::Gathering);

        let cand = SignalMessage::IceCandidate {
            candidate: "candidate:1 1 udp 1 1.2.3.4 9 typ host".into(),
            sdp_mid: None,
            sdp_m_line_index: Some(0),
        };
        assert_eq!(
            h.manager.handle_remote_signal(cand.clone()).await.unwrap(),
            SignalOutcome::Buffered
        );
        assert_eq!(
            h.manager.handle_remote_signal(cand).await.unwrap(),
            SignalOutcome::Discarded
        );
        assert_eq!(h.manager.pending_candidates(), 1);

        h.manager
            .handle_remote_signal(SignalMessage::Offer { sdp: "offer".into() })
            .await
            .unwrap();

        assert_eq!(h.manager.state(), ConnectionState::Negotiating);
        assert_eq!(h.manager.pending_candidates(), 0);
        assert_eq!(h.manager.transport().applied_candidates().len(), 1);
        assert!(matches!(
            drain(&mut h.outbound).as_slice(),
            [SignalMessage::Answer { .. }]
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_negotiation_error_fatal_only_during_setup() {
        let transport = FakeTransport {
            fail_negotiation: Some(SessionError::NegotiationFailed("bad sdp".into())),
            ..Default::default()
        };
        let mut h = harness(SessionConfig::default(), transport);
        h.manager.start(two_servers()).await.unwrap();
        let err = h
            .manager
            .handle_remote_signal(SignalMessage::Answer { sdp: "garbage".into() })
            .await
            .unwrap_err();
        assert_eq!(err.reason_code(), crate::error::ReasonCode::NegotiationFailed);
        assert_eq!(h.manager.state(), ConnectionState::Failed);

        let transport = FakeTransport {
            fail_negotiation: Some(SessionError::NetworkUnreachable("relay down".into())),
            ..Default::default()
        };
        let mut h = harness(SessionConfig::default(), transport);
        h.manager.start(two_servers()).await.unwrap();
        let outcome = h
            .manager
            .handle_remote_signal(SignalMessage::Answer { sdp: "a".into() })
            .await
            .unwrap();
        assert_eq!(outcome, SignalOutcome::Discarded);
        assert_eq!(h.manager.state(), ConnectionState::Negotiating);
        assert!(drain(&mut h.events).iter().any(|e| matches!(
            e,
            SessionEvent::Warning {
                reason: crate::error::ReasonCode::NetworkUnreachable,
                ..
            }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_failure_is_terminal_failed() {
        let transport = FakeTransport {
            fail_open: Some(SessionError::DevicePermissionDenied("camera".into())),
            ..Default::default()
        };
        let mut h = harness(SessionConfig::default(), transport);

        let err = h.manager.start(two_servers()).await.unwrap_err();
        assert_eq!(err, SessionError::DevicePermissionDenied("camera".into()));
        assert_eq!(h.manager.state(), ConnectionState::Failed);
        assert!(drain(&mut h.events)
            .iter()
            .any(|e| matches!(e, SessionEvent::ConnectionFailed { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_during_gathering() {
        let mut h = harness(SessionConfig::default(), FakeTransport::default());
        h.manager.begin(two_servers()).unwrap();
        assert_eq!(h.manager.state(), ConnectionState::Gathering);
        assert_eq!(h.manager.active_timers(), 1);

        let err = h
            .manager
            .abort_setup(SessionError::DeviceUnavailable("no camera".into()))
            .await;
        assert_eq!(err.reason_code(), crate::error::ReasonCode::DeviceUnavailable);
        assert_eq!(h.manager.state(), ConnectionState::Failed);
        assert_eq!(h.manager.failure(), Some(&err));
        assert_eq!(h.manager.active_timers(), 0);
        assert!(drain(&mut h.outbound).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_timeout_fails_negotiation() {
        let mut h = harness(SessionConfig::default(), FakeTransport::default());
        h.manager.start(two_servers()).await.unwrap();

        tokio::time::advance(Duration::from_secs(16)).await;
        h.manager.on_timer(Instant::now()).await;

        assert_eq!(h.manager.state(), ConnectionState::Failed);
        assert_eq!(h.manager.active_timers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_responder_gathering_timeout() {
        let config = SessionConfig {
            initiator: false,
            ..Default::default()
        };
        let mut h = harness(config, FakeTransport::default());
        h.manager.start(two_servers()).await.unwrap();

        tokio::time::advance(Duration::from_secs(16)).await;
        h.manager.on_timer(Instant::now()).await;

        let failed = drain(&mut h.events).into_iter().find_map(|e| match e {
            SessionEvent::ConnectionFailed { reason, .. } => Some(reason),
            _ => None,
        });
        assert_eq!(failed, Some(crate::error::ReasonCode::IceGatheringTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_is_bounded() {
        let mut h = harness(SessionConfig::default(), FakeTransport::default());
        connected(&mut h).await;
        drain(&mut h.outbound);

        h.manager.on_transport_event(TransportEvent::Disconnected).await;
        assert_eq!(h.manager.state(), ConnectionState::Reconnecting);

        let mut waits = Vec::new();
        while h.manager.state() == ConnectionState::Reconnecting {
            let deadline = h.manager.next_deadline().unwrap();
            waits.push((deadline - Instant::now()).as_secs());
            tokio::time::advance(deadline - Instant::now()).await;
            h.manager.on_timer(Instant::now()).await;
        }

        assert_eq!(waits, vec![1, 2, 4, 8, 16]);
        assert_eq!(h.manager.state(), ConnectionState::Failed);
        // One ICE-restart offer per attempt
        let restarts = drain(&mut h.outbound)
            .into_iter()
            .filter(|m| matches!(m, SignalMessage::Offer { .. }))
            .count();
        assert_eq!(restarts, 5);
        assert_eq!(h.manager.transport().ice_restarts(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_candidates_wait_for_answer() {
        let mut h = harness(SessionConfig::default(), FakeTransport::default());
        connected(&mut h).await;
        h.manager.on_transport_event(TransportEvent::Disconnected).await;

        let cand = SignalMessage::IceCandidate {
            candidate: "candidate:2 1 udp 1 5.6.7.8 9 typ srflx".into(),
            sdp_mid: None,
            sdp_m_line_index: Some(0),
        };
        assert_eq!(
            h.manager.handle_remote_signal(cand).await.unwrap(),
            SignalOutcome::Buffered
        );
        assert!(h.manager.transport().applied_candidates().is_empty());

        h.manager
            .handle_remote_signal(SignalMessage::Answer { sdp: "restart".into() })
            .await
            .unwrap();
        assert_eq!(h.manager.pending_candidates(), 0);
        assert_eq!(h.manager.transport().applied_candidates().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_resets_backoff() {
        let config = SessionConfig {
            reconnect: ReconnectPolicy {
                max_attempts: 2,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut h = harness(config, FakeTransport::default());
        connected(&mut h).await;

        h.manager.on_transport_event(TransportEvent::Disconnected).await;
        tokio::time::advance(Duration::from_secs(1)).await;
        h.manager.on_timer(Instant::now()).await;
        assert_eq!(h.manager.reconnect_attempt(), 2);

        h.manager.on_transport_event(TransportEvent::Connected).await;
        assert_eq!(h.manager.state(), ConnectionState::Connected);
        assert_eq!(h.manager.reconnect_attempt(), 0);
        assert_eq!(h.manager.active_timers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_idempotent_and_absorbing() {
        let mut h = harness(SessionConfig::default(), FakeTransport::default());
        connected(&mut h).await;

        assert!(h.manager.close().await);
        assert!(!h.manager.close().await);
        assert_eq!(h.manager.teardowns(), 1);
        assert_eq!(h.manager.transport().closes(), 1);

        h.manager.on_transport_event(TransportEvent::Connected).await;
        let outcome = h
            .manager
            .handle_remote_signal(SignalMessage::Offer { sdp: "late".into() })
            .await
            .unwrap();
        assert_eq!(outcome, SignalOutcome::Discarded);
        assert_eq!(h.manager.state(), ConnectionState::Closed);
        assert!(h.manager.start(two_servers()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_call_matches_session() {
        let mut h = harness(SessionConfig::default(), FakeTransport::default());
        connected(&mut h).await;

        let other = SignalMessage::EndCall {
            session_id: "other".into(),
        };
        assert_eq!(
            h.manager.handle_remote_signal(other).await.unwrap(),
            SignalOutcome::Discarded
        );
        let ours = SignalMessage::EndCall {
            session_id: "session-1".into(),
        };
        assert_eq!(
            h.manager.handle_remote_signal(ours).await.unwrap(),
            SignalOutcome::EndCall
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_replace_falls_back_to_renegotiation() {
        let transport = FakeTransport {
            in_place_replacement: false,
            ..Default::default()
        };
        let mut h = harness(SessionConfig::default(), transport);
        connected(&mut h).await;
        drain(&mut h.outbound);

        let outcome = h
            .manager
            .replace_video_source(VideoSource::Screen)
            .await
            .unwrap();
        assert_eq!(outcome, ReplaceOutcome::Renegotiated);
        assert!(matches!(
            drain(&mut h.outbound).as_slice(),
            [SignalMessage::Offer { .. }]
        ));
        assert_eq!(h.manager.transport().video_source(), VideoSource::Screen);
        assert_eq!(h.manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_candidates_trickle_out() {
        let mut h = harness(SessionConfig::default(), FakeTransport::default());
        h.manager.start(two_servers()).await.unwrap();
        drain(&mut h.outbound);

        h.manager
            .on_transport_event(TransportEvent::LocalCandidate(IceCandidate::new(
                "candidate:1 1 udp 1 10.0.0.1 5000 typ host",
                Some(0),
            )))
            .await;
        h.manager.on_transport_event(TransportEvent::GatheringComplete).await;

        assert!(matches!(
            drain(&mut h.outbound).as_slice(),
            [SignalMessage::IceCandidate { .. }]
        ));
    }
}
