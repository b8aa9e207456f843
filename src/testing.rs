//! In-memory collaborators for unit tests

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::backend::{BackendClient, SessionOpened, SessionReport};
use crate::error::{SessionError, SessionResult};
use crate::media::{Capability, MediaDevices, TrackKind};
use crate::peer::transport::{PeerTransport, TransportEvent, TransportStats, VideoSource};
use crate::peer::types::{IceCandidate, IceServerConfig};
use crate::quality::AdaptationCommand;

#[derive(Debug, Default)]
struct LinkState {
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
    stats: TransportStats,
}

/// Test-side handle onto a [`FakeTransport`] that has been moved into a
/// connection manager.
#[derive(Debug, Clone, Default)]
pub struct TransportLink(Arc<Mutex<LinkState>>);

impl TransportLink {
    /// Raises a transport event as if the network produced it.
    pub fn emit(&self, event: TransportEvent) {
        let state = self.0.lock().unwrap();
        state
            .events
            .as_ref()
            .expect("transport not opened")
            .send(event)
            .unwrap();
    }

    pub fn set_stats(&self, packet_loss: f64, rtt_ms: f64) {
        self.0.lock().unwrap().stats = TransportStats {
            packet_loss,
            rtt_ms,
        };
    }
}

#[derive(Debug)]
pub struct FakeTransport {
    pub fail_open: Option<SessionError>,
    /// Returned by `create_answer` and `set_remote_answer`.
    pub fail_negotiation: Option<SessionError>,
    pub in_place_replacement: bool,
    pub(crate) link: TransportLink,
    pub(crate) applied: Vec<IceCandidate>,
    pub(crate) offers: u32,
    pub(crate) ice_restarts: u32,
    pub(crate) closes: u32,
    pub(crate) source: VideoSource,
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self {
            fail_open: None,
            fail_negotiation: None,
            in_place_replacement: true,
            link: TransportLink::default(),
            applied: Vec::new(),
            offers: 0,
            ice_restarts: 0,
            closes: 0,
            source: VideoSource::Camera,
        }
    }
}

impl FakeTransport {
    pub fn link(&self) -> TransportLink {
        self.link.clone()
    }

    pub fn applied_candidates(&self) -> &[IceCandidate] {
        &self.applied
    }

    pub fn ice_restarts(&self) -> u32 {
        self.ice_restarts
    }

    pub fn closes(&self) -> u32 {
        self.closes
    }

    pub fn video_source(&self) -> VideoSource {
        self.source
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn open(
        &mut self,
        _ice: &IceServerConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> SessionResult<()> {
        if let Some(e) = self.fail_open.clone() {
            return Err(e);
        }
        self.link.0.lock().unwrap().events = Some(events);
        Ok(())
    }

    async fn create_offer(&mut self, ice_restart: bool) -> SessionResult<String> {
        self.offers += 1;
        if ice_restart {
            self.ice_restarts += 1;
        }
        Ok(format!("offer-{}", self.offers))
    }

    async fn create_answer(&mut self, remote_offer: &str) -> SessionResult<String> {
        if let Some(e) = self.fail_negotiation.clone() {
            return Err(e);
        }
        Ok(format!("answer-to-{}", remote_offer))
    }

    async fn set_remote_answer(&mut self, _sdp: &str) -> SessionResult<()> {
        if let Some(e) = self.fail_negotiation.clone() {
            return Err(e);
        }
        Ok(())
    }

    async fn add_remote_candidate(&mut self, candidate: &IceCandidate) -> SessionResult<()> {
        self.applied.push(candidate.clone());
        Ok(())
    }

    fn supports_track_replacement(&self) -> bool {
        self.in_place_replacement
    }

    async fn replace_video_source(&mut self, source: VideoSource) -> SessionResult<()> {
        self.source = source;
        Ok(())
    }

    async fn swap_video_source(&mut self, source: VideoSource) -> SessionResult<()> {
        self.source = source;
        Ok(())
    }

    async fn stats(&self) -> SessionResult<TransportStats> {
        Ok(self.link.0.lock().unwrap().stats)
    }

    async fn close(&mut self) {
        self.closes += 1;
        self.link.0.lock().unwrap().events = None;
    }
}

#[derive(Debug, Default)]
pub struct FakeDevices {
    pub fail_acquire: Option<SessionError>,
    pub fail_effect: Option<Capability>,
    /// Raw microphone level, shared so tests can change it mid-call.
    pub level: Arc<Mutex<f32>>,
    pub(crate) next_id: u32,
    pub(crate) screen: bool,
    pub(crate) encoding: Option<AdaptationCommand>,
    pub(crate) released: bool,
}

impl FakeDevices {
    pub fn screen_acquired(&self) -> bool {
        self.screen
    }

    pub fn last_encoding(&self) -> Option<AdaptationCommand> {
        self.encoding.clone()
    }

    pub fn released(&self) -> bool {
        self.released
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn acquire(&mut self, kind: TrackKind) -> SessionResult<String> {
        if let Some(e) = self.fail_acquire.clone() {
            return Err(e);
        }
        self.next_id += 1;
        Ok(format!("{:?}-{}", kind, self.next_id).to_lowercase())
    }

    async fn acquire_screen(&mut self) -> SessionResult<()> {
        self.screen = true;
        Ok(())
    }

    fn release_screen(&mut self) {
        self.screen = false;
    }

    fn set_enabled(&mut self, _kind: TrackKind, _enabled: bool) -> SessionResult<()> {
        Ok(())
    }

    fn set_effect(&mut self, capability: Capability, _on: bool) -> SessionResult<()> {
        if self.fail_effect == Some(capability) {
            return Err(SessionError::DeviceUnavailable(format!(
                "{:?} not supported",
                capability
            )));
        }
        Ok(())
    }

    fn apply_encoding(&mut self, command: &AdaptationCommand) -> SessionResult<()> {
        self.encoding = Some(command.clone());
        Ok(())
    }

    fn input_level(&self) -> f32 {
        *self.level.lock().unwrap()
    }

    fn release_all(&mut self) {
        self.screen = false;
        self.released = true;
    }
}

/// Backend that fails its first `failures` open requests.
#[derive(Debug, Default)]
pub struct FakeBackend {
    failures: u32,
    open_calls: AtomicU32,
    reports: Mutex<Vec<SessionReport>>,
}

impl FakeBackend {
    pub fn failing(failures: u32) -> Self {
        Self {
            failures,
            ..Default::default()
        }
    }

    pub fn open_calls(&self) -> u32 {
        self.open_calls.load(Ordering::SeqCst)
    }

    pub fn reports(&self) -> Vec<SessionReport> {
        self.reports.lock().unwrap().clone()
    }
}

#[async_trait]
impl BackendClient for FakeBackend {
    async fn open_session(&self, request: &SessionOpened) -> SessionResult<String> {
        let n = self.open_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.failures {
            return Err(SessionError::BackendUnreachable("503".into()));
        }
        Ok(format!("backend-{}", request.session_id))
    }

    async fn complete_session(&self, report: &SessionReport) -> SessionResult<()> {
        self.reports.lock().unwrap().push(report.clone());
        Ok(())
    }
}
