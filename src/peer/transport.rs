//! Seam between the connection state machine and the media transport

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::SessionResult;
use crate::media::TrackKind;
use crate::peer::types::{IceCandidate, IceServerConfig};

/// Asynchronous notifications raised by the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    GatheringComplete,
    /// Media path is up.
    Connected,
    /// Media path was lost.
    Disconnected,
    /// The peer started sending a track.
    RemoteTrack { id: String, kind: TrackKind },
}

/// Source feeding the outbound video track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoSource {
    Camera,
    Screen,
}

/// Loss and round trip of outbound media, as reported back by the peer.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TransportStats {
    /// Fraction in [0, 1].
    pub packet_loss: f64,
    pub rtt_ms: f64,
}

#[async_trait]
pub trait PeerTransport: Send {
    /// Creates the peer connection, attaches local tracks and starts ICE
    /// gathering. Events are delivered on `events` in the order they occur.
    async fn open(
        &mut self,
        ice: &IceServerConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> SessionResult<()>;

    /// Creates and applies a local offer, returning its SDP.
    async fn create_offer(&mut self, ice_restart: bool) -> SessionResult<String>;

    /// Applies a remote offer and returns the local answer SDP.
    async fn create_answer(&mut self, remote_offer: &str) -> SessionResult<String>;

    async fn set_remote_answer(&mut self, sdp: &str) -> SessionResult<()>;

    async fn add_remote_candidate(&mut self, candidate: &IceCandidate) -> SessionResult<()>;

    /// Whether `replace_video_source` swaps the track without renegotiation.
    fn supports_track_replacement(&self) -> bool;

    /// Replaces the outbound video track in place.
    async fn replace_video_source(&mut self, source: VideoSource) -> SessionResult<()>;

    /// Detaches the current video track and attaches a new one. The caller
    /// must renegotiate afterwards.
    async fn swap_video_source(&mut self, source: VideoSource) -> SessionResult<()>;

    async fn stats(&self) -> SessionResult<TransportStats>;

    /// Releases the peer connection. Safe to call more than once.
    async fn close(&mut self);
}
