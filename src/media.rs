//! Local and remote media track state

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::MediaPermissions;
use crate::error::{SessionError, SessionResult};
use crate::events::SessionEvent;
use crate::logger::EventEmitter;
use crate::peer::manager::ConnectionManager;
use crate::peer::transport::{PeerTransport, VideoSource};
use crate::quality::AdaptationCommand;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackOrigin {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    NoiseCancellation,
    BeautyFilter,
    VirtualBackground,
    ScreenSharing,
}

impl Capability {
    /// Track kind the capability belongs to.
    pub fn track_kind(self) -> TrackKind {
        match self {
            Capability::NoiseCancellation => TrackKind::Audio,
            Capability::BeautyFilter
            | Capability::VirtualBackground
            | Capability::ScreenSharing => TrackKind::Video,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub noise_cancellation: bool,
    pub beauty_filter: bool,
    pub virtual_background: bool,
    pub screen_sharing: bool,
}

impl Capabilities {
    pub fn get(&self, capability: Capability) -> bool {
        match capability {
            Capability::NoiseCancellation => self.noise_cancellation,
            Capability::BeautyFilter => self.beauty_filter,
            Capability::VirtualBackground => self.virtual_background,
            Capability::ScreenSharing => self.screen_sharing,
        }
    }

    fn set(&mut self, capability: Capability, on: bool) {
        match capability {
            Capability::NoiseCancellation => self.noise_cancellation = on,
            Capability::BeautyFilter => self.beauty_filter = on,
            Capability::VirtualBackground => self.virtual_background = on,
            Capability::ScreenSharing => self.screen_sharing = on,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaTrackState {
    pub id: String,
    pub kind: TrackKind,
    pub origin: TrackOrigin,
    pub enabled: bool,
    pub capabilities: Capabilities,
}

impl MediaTrackState {
    pub fn new(id: impl Into<String>, kind: TrackKind, origin: TrackOrigin) -> Self {
        Self {
            id: id.into(),
            kind,
            origin,
            enabled: true,
            capabilities: Capabilities::default(),
        }
    }

    /// Rejects capabilities that do not belong to this track's kind.
    pub fn set_capability(&mut self, capability: Capability, on: bool) -> SessionResult<()> {
        if capability.track_kind() != self.kind {
            return Err(SessionError::InvalidConfig(format!(
                "{:?} does not apply to a {:?} track",
                capability, self.kind
            )));
        }
        self.capabilities.set(capability, on);
        Ok(())
    }
}

/// Failures raised by the capture pipeline after a device was acquired.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// A local device stopped producing media: unplugged, revoked, or its
    /// permission withdrawn.
    TrackFailed { kind: TrackKind, error: SessionError },
    /// The shared screen or window went away.
    ScreenCaptureFailed(SessionError),
}

/// Hardware access for local capture devices.
#[async_trait]
pub trait MediaDevices: Send {
    /// Opens the device, prompting for permission if needed. Returns a
    /// track id.
    async fn acquire(&mut self, kind: TrackKind) -> SessionResult<String>;

    async fn acquire_screen(&mut self) -> SessionResult<()>;

    fn release_screen(&mut self);

    fn set_enabled(&mut self, kind: TrackKind, enabled: bool) -> SessionResult<()>;

    fn set_effect(&mut self, capability: Capability, on: bool) -> SessionResult<()>;

    fn apply_encoding(&mut self, command: &AdaptationCommand) -> SessionResult<()>;

    /// Current raw microphone input level in [0, 1].
    fn input_level(&self) -> f32;

    fn release_all(&mut self);
}

/// Owns the local tracks and their toggles.
pub struct MediaTrackController<D: MediaDevices> {
    devices: D,
    permissions: MediaPermissions,
    audio: Option<MediaTrackState>,
    video: Option<MediaTrackState>,
    remote: HashMap<String, MediaTrackState>,
    encoding: Option<AdaptationCommand>,
    emitter: EventEmitter,
}

impl<D: MediaDevices> MediaTrackController<D> {
    pub fn new(devices: D, permissions: MediaPermissions, emitter: EventEmitter) -> Self {
        Self {
            devices,
            permissions,
            audio: None,
            video: None,
            remote: HashMap::new(),
            encoding: None,
            emitter,
        }
    }

    pub fn devices(&self) -> &D {
        &self.devices
    }

    pub fn audio(&self) -> Option<&MediaTrackState> {
        self.audio.as_ref()
    }

    pub fn video(&self) -> Option<&MediaTrackState> {
        self.video.as_ref()
    }

    pub fn is_muted(&self) -> bool {
        self.audio.as_ref().map_or(true, |t| !t.enabled)
    }

    pub fn encoding(&self) -> Option<&AdaptationCommand> {
        self.encoding.as_ref()
    }

    pub fn input_level(&self) -> f32 {
        if self.is_muted() {
            0.0
        } else {
            self.devices.input_level().clamp(0.0, 1.0)
        }
    }

    /// Opens the permitted local devices. Errors here abort call setup.
    pub async fn acquire_local(&mut self) -> SessionResult<()> {
        if self.permissions.microphone {
            let id = self.devices.acquire(TrackKind::Audio).await?;
            info!(%id, "Microphone acquired");
            self.audio = Some(MediaTrackState::new(id, TrackKind::Audio, TrackOrigin::Local));
        }
        if self.permissions.camera {
            let id = self.devices.acquire(TrackKind::Video).await?;
            info!(%id, "Camera acquired");
            self.video = Some(MediaTrackState::new(id, TrackKind::Video, TrackOrigin::Local));
        }
        Ok(())
    }

    fn track_mut(&mut self, kind: TrackKind) -> Option<&mut MediaTrackState> {
        match kind {
            TrackKind::Audio => self.audio.as_mut(),
            TrackKind::Video => self.video.as_mut(),
        }
    }

    fn report(&self, error: SessionError) {
        warn!(reason = ?error.reason_code(), "Track error: {}", error);
        self.emitter.emit(SessionEvent::TrackError {
            reason: error.reason_code(),
            message: error.to_string(),
        });
    }

    fn publish(&self, kind: TrackKind) {
        let track = match kind {
            TrackKind::Audio => self.audio.clone(),
            TrackKind::Video => self.video.clone(),
        };
        if let Some(track) = track {
            self.emitter.emit(SessionEvent::TrackChanged { track });
        }
    }

    fn toggle_enabled(&mut self, kind: TrackKind) -> Option<bool> {
        let Some(track) = self.track_mut(kind) else {
            self.report(SessionError::DeviceUnavailable(format!(
                "no local {:?} track",
                kind
            )));
            return None;
        };

        let previous = track.enabled;
        track.enabled = !previous;
        let wanted = track.enabled;

        if let Err(e) = self.devices.set_enabled(kind, wanted) {
            if let Some(track) = self.track_mut(kind) {
                track.enabled = previous;
            }
            self.report(e);
            return Some(previous);
        }

        debug!(?kind, enabled = wanted, "Track toggled");
        self.publish(kind);
        Some(wanted)
    }

    /// Returns whether the microphone is muted afterwards.
    pub fn toggle_mute(&mut self) -> bool {
        self.toggle_enabled(TrackKind::Audio);
        self.is_muted()
    }

    /// Returns whether the camera is off afterwards.
    pub fn toggle_video(&mut self) -> bool {
        self.toggle_enabled(TrackKind::Video).map_or(true, |enabled| !enabled)
    }

    pub fn set_virtual_background(&mut self, on: bool) -> bool {
        self.set_capability(Capability::VirtualBackground, on)
    }

    pub fn set_beauty_filter(&mut self, on: bool) -> bool {
        self.set_capability(Capability::BeautyFilter, on)
    }

    pub fn set_noise_cancellation(&mut self, on: bool) -> bool {
        self.set_capability(Capability::NoiseCancellation, on)
    }

    /// Applies an effect flag; on device failure the last good value is
    /// kept. Returns the effective value.
    fn set_capability(&mut self, capability: Capability, on: bool) -> bool {
        let kind = capability.track_kind();
        let Some(track) = self.track_mut(kind) else {
            self.report(SessionError::DeviceUnavailable(format!(
                "no local {:?} track for {:?}",
                kind, capability
            )));
            return false;
        };

        let previous = track.capabilities.get(capability);
        if previous == on {
            return on;
        }
        track.capabilities.set(capability, on);

        if let Err(e) = self.devices.set_effect(capability, on) {
            if let Some(track) = self.track_mut(kind) {
                track.capabilities.set(capability, previous);
            }
            self.report(e);
            return previous;
        }

        debug!(?capability, on, "Capability changed");
        self.publish(kind);
        on
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.video
            .as_ref()
            .map_or(false, |t| t.capabilities.screen_sharing)
    }

    /// Starts or stops screen sharing on the live connection. The flag
    /// flips immediately and is reverted if the device or the peer
    /// connection refuses the change. Returns the effective value.
    pub async fn toggle_screen_share<T: PeerTransport>(
        &mut self,
        connection: &mut ConnectionManager<T>,
    ) -> bool {
        let previous = self.is_screen_sharing();
        let wanted = !previous;

        if wanted && !self.permissions.screen_share {
            self.report(SessionError::DevicePermissionDenied(
                "screen sharing not permitted for this session".into(),
            ));
            return previous;
        }
        let Some(track) = self.video.as_mut() else {
            self.report(SessionError::DeviceUnavailable(
                "no local video track to carry the screen".into(),
            ));
            return previous;
        };
        track.capabilities.screen_sharing = wanted;

        let result = if wanted {
            match self.devices.acquire_screen().await {
                Ok(()) => connection
                    .replace_video_source(VideoSource::Screen)
                    .await
                    .map_err(|e| {
                        self.devices.release_screen();
                        e
                    }),
                Err(e) => Err(e),
            }
        } else {
            connection
                .replace_video_source(VideoSource::Camera)
                .await
                .map(|outcome| {
                    self.devices.release_screen();
                    outcome
                })
        };

        match result {
            Ok(outcome) => {
                info!(sharing = wanted, ?outcome, "Screen share toggled");
                self.publish(TrackKind::Video);
                wanted
            }
            Err(e) => {
                if let Some(track) = self.video.as_mut() {
                    track.capabilities.screen_sharing = previous;
                }
                let e = match e {
                    SessionError::InvalidState { .. } | SessionError::NegotiationFailed(_) => {
                        SessionError::TrackReplacementFailed(e.to_string())
                    }
                    other => other,
                };
                self.report(e);
                previous
            }
        }
    }

    /// Handles a device lost mid-call. The track is marked disabled and
    /// its effects are switched off, since none of them can run without
    /// the device. Screen sharing uses its own capture source and is kept.
    pub fn on_track_failure(&mut self, kind: TrackKind, error: SessionError) {
        let Some(track) = self.track_mut(kind) else {
            debug!(?kind, "Failure for a track never acquired ignored");
            return;
        };

        track.enabled = false;
        let sharing = track.capabilities.screen_sharing;
        track.capabilities = Capabilities {
            screen_sharing: sharing,
            ..Capabilities::default()
        };
        warn!(?kind, "Local track lost");

        self.report(error);
        self.publish(kind);
    }

    /// Handles the screen source ending on its own. The outbound video goes
    /// back to the camera.
    pub async fn on_screen_capture_failure<T: PeerTransport>(
        &mut self,
        connection: &mut ConnectionManager<T>,
        error: SessionError,
    ) {
        if !self.is_screen_sharing() {
            debug!("Screen capture failure while not sharing ignored");
            return;
        }

        if let Some(track) = self.video.as_mut() {
            track.capabilities.screen_sharing = false;
        }
        self.devices.release_screen();
        self.report(error);

        if let Err(e) = connection.replace_video_source(VideoSource::Camera).await {
            self.report(SessionError::TrackReplacementFailed(e.to_string()));
        }
        self.publish(TrackKind::Video);
    }

    /// Applies a quality adaptation to the outbound video encoder.
    pub fn apply_adaptation(&mut self, command: &AdaptationCommand) {
        if self.video.is_none() {
            debug!("No local video track, adaptation skipped");
            return;
        }
        match self.devices.apply_encoding(command) {
            Ok(()) => {
                info!(
                    quality = ?command.quality,
                    width = command.width,
                    height = command.height,
                    kbps = command.max_bitrate_kbps,
                    "Video encoding adapted"
                );
                self.encoding = Some(command.clone());
            }
            Err(e) => self.report(e),
        }
    }

    /// Mirrors peer-reported state for a remote track.
    pub fn mirror_remote(&mut self, mut track: MediaTrackState) {
        track.origin = TrackOrigin::Remote;
        self.remote.insert(track.id.clone(), track);
    }

    pub fn remote_tracks(&self) -> impl Iterator<Item = &MediaTrackState> {
        self.remote.values()
    }

    pub fn release_all(&mut self) {
        self.devices.release_all();
        self.audio = None;
        self.video = None;
        self.remote.clear();
        self.encoding = None;
    }
}
