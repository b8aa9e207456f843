use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::stats::{StatsReport, StatsReportType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;
use webrtc::{
    api::APIBuilder,
    ice_transport::ice_server::RTCIceServer,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, RTCPeerConnection,
    },
};

use crate::error::{SessionError, SessionResult};
use crate::media::TrackKind;
use crate::peer::transport::{PeerTransport, TransportEvent, TransportStats, VideoSource};
use crate::peer::types::{IceCandidate, IceServerConfig};

const STREAM_ID: &str = "movecall";

/// `PeerTransport` backed by the `webrtc` crate.
///
/// Owns one audio track and two video tracks (camera and screen); only one
/// video track is attached to the connection at a time. The capture
/// pipeline writes samples through [`WebRtcTransport::audio_track`] and
/// [`WebRtcTransport::video_track`].
pub struct WebRtcTransport {
    pc: Option<Arc<RTCPeerConnection>>,
    audio: Arc<TrackLocalStaticSample>,
    camera: Arc<TrackLocalStaticSample>,
    screen: Arc<TrackLocalStaticSample>,
    video_sender: Option<Arc<RTCRtpSender>>,
    source: VideoSource,
}

impl WebRtcTransport {
    pub fn new() -> Self {
        let codec = |mime: &str| RTCRtpCodecCapability {
            mime_type: mime.to_owned(),
            ..Default::default()
        };

        Self {
            pc: None,
            audio: Arc::new(TrackLocalStaticSample::new(
                codec(MIME_TYPE_OPUS),
                "audio".to_owned(),
                STREAM_ID.to_owned(),
            )),
            camera: Arc::new(TrackLocalStaticSample::new(
                codec(MIME_TYPE_VP8),
                "camera".to_owned(),
                STREAM_ID.to_owned(),
            )),
            screen: Arc::new(TrackLocalStaticSample::new(
                codec(MIME_TYPE_VP8),
                "screen".to_owned(),
                STREAM_ID.to_owned(),
            )),
            video_sender: None,
            source: VideoSource::Camera,
        }
    }

    pub fn audio_track(&self) -> Arc<TrackLocalStaticSample> {
        self.audio.clone()
    }

    /// Track currently carrying outbound video.
    pub fn video_track(&self) -> Arc<TrackLocalStaticSample> {
        self.track_for(self.source)
    }

    fn track_for(&self, source: VideoSource) -> Arc<TrackLocalStaticSample> {
        match source {
            VideoSource::Camera => self.camera.clone(),
            VideoSource::Screen => self.screen.clone(),
        }
    }

    fn peer(&self) -> SessionResult<Arc<RTCPeerConnection>> {
        self.pc
            .clone()
            .ok_or_else(|| SessionError::NegotiationFailed("peer connection not open".into()))
    }

    fn video_sender(&self) -> SessionResult<Arc<RTCRtpSender>> {
        self.video_sender
            .clone()
            .ok_or_else(|| SessionError::TrackReplacementFailed("no video sender attached".into()))
    }
}

impl Default for WebRtcTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the peer connection configuration
fn rtc_config(ice: &IceServerConfig) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: rtc_ice_servers(ice),
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

fn rtc_ice_servers(ice: &IceServerConfig) -> Vec<RTCIceServer> {
    ice.servers()
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
        })
        .collect()
}

/// What the peer reported back about one of our outbound streams.
#[derive(Debug, Clone, Copy, PartialEq)]
struct StreamReport {
    /// Fraction in [0, 1] from the last RTCP receiver report.
    fraction_lost: f64,
    rtt_secs: Option<f64>,
}

/// Pulls the remote-inbound RTP entries and the nominated candidate pair
/// RTT out of a stats report.
fn collect_reports(report: StatsReport) -> (Vec<StreamReport>, Option<f64>) {
    let mut streams = Vec::new();
    let mut pair_rtt = None;

    for (_, entry) in report.reports {
        match entry {
            StatsReportType::RemoteInboundRTP(remote) => {
                debug!(
                    fraction_lost = remote.fraction_lost,
                    rtt = ?remote.round_trip_time,
                    "RTCP receiver report"
                );
                streams.push(StreamReport {
                    fraction_lost: remote.fraction_lost,
                    rtt_secs: remote.round_trip_time,
                });
            }
            StatsReportType::CandidatePair(pair) if pair.nominated => {
                if pair.current_round_trip_time > 0.0 {
                    pair_rtt = Some(pair.current_round_trip_time);
                }
            }
            _ => {}
        }
    }
    (streams, pair_rtt)
}

/// Reduces receiver reports to one sample: the worst stream's loss and
/// RTT. RTT falls back to the candidate pair when no report carries one.
/// `None` when there is no RTT from either source.
fn reduce_stats(streams: &[StreamReport], pair_rtt_secs: Option<f64>) -> Option<TransportStats> {
    let usable = |v: &f64| v.is_finite() && *v >= 0.0;

    let packet_loss = streams
        .iter()
        .map(|s| s.fraction_lost)
        .filter(usable)
        .fold(0.0, f64::max)
        .min(1.0);
    let rtt_secs = streams
        .iter()
        .filter_map(|s| s.rtt_secs)
        .filter(usable)
        .reduce(f64::max)
        .or(pair_rtt_secs.filter(usable))?;

    Some(TransportStats {
        packet_loss,
        rtt_ms: rtt_secs * 1000.0,
    })
}

fn as_track_local(track: Arc<TrackLocalStaticSample>) -> Arc<dyn TrackLocal + Send + Sync> {
    track
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn open(
        &mut self,
        ice: &IceServerConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> SessionResult<()> {
        let mut media = MediaEngine::default();
        media.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media)?;

        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(
            api.new_peer_connection(rtc_config(ice))
                .await
                .map_err(|e| SessionError::NetworkUnreachable(e.to_string()))?,
        );

        let candidate_tx = events.clone();
        pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
            let tx = candidate_tx.clone();
            Box::pin(async move {
                let event = match cand {
                    Some(c) => match c.to_json() {
                        Ok(init) => {
                            debug!(candidate = %init.candidate, "Local ICE candidate");
                            TransportEvent::LocalCandidate(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_m_line_index: init.sdp_mline_index,
                            })
                        }
                        Err(e) => {
                            warn!("Failed to serialize local candidate: {}", e);
                            return;
                        }
                    },
                    // None marks the end of gathering
                    None => TransportEvent::GatheringComplete,
                };
                let _ = tx.send(event);
            })
        }));

        pc.on_ice_gathering_state_change(Box::new(move |state| {
            debug!("ICE gathering state changed to: {:?}", state);
            Box::pin(async {})
        }));

        let track_tx = events.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let kind = match track.kind() {
                    RTPCodecType::Audio => Some(TrackKind::Audio),
                    RTPCodecType::Video => Some(TrackKind::Video),
                    _ => None,
                };
                if let Some(kind) = kind {
                    info!(id = %track.id(), ?kind, "Remote track");
                    let _ = track_tx.send(TransportEvent::RemoteTrack {
                        id: track.id(),
                        kind,
                    });
                }
                Box::pin(async {})
            },
        ));

        let state_tx = events;
        pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
            info!("Peer connection state changed to: {:?}", st);
            let event = match st {
                RTCPeerConnectionState::Connected => Some(TransportEvent::Connected),
                RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed => {
                    Some(TransportEvent::Disconnected)
                }
                _ => None,
            };
            if let Some(event) = event {
                let _ = state_tx.send(event);
            }
            Box::pin(async {})
        }));

        pc.add_track(as_track_local(self.audio.clone())).await?;
        let sender = pc.add_track(as_track_local(self.track_for(self.source))).await?;
        self.video_sender = Some(sender);
        self.pc = Some(pc);
        Ok(())
    }

    async fn create_offer(&mut self, ice_restart: bool) -> SessionResult<String> {
        let pc = self.peer()?;
        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });

        let offer = pc.create_offer(options).await?;
        pc.set_local_description(offer).await?;
        pc.local_description()
            .await
            .map(|d| d.sdp)
            .ok_or_else(|| SessionError::NegotiationFailed("local offer missing".into()))
    }

    async fn create_answer(&mut self, remote_offer: &str) -> SessionResult<String> {
        let pc = self.peer()?;
        pc.set_remote_description(RTCSessionDescription::offer(remote_offer.to_owned())?)
            .await?;

        let answer = pc.create_answer(None).await?;
        pc.set_local_description(answer).await?;
        pc.local_description()
            .await
            .map(|d| d.sdp)
            .ok_or_else(|| SessionError::NegotiationFailed("local answer missing".into()))
    }

    async fn set_remote_answer(&mut self, sdp: &str) -> SessionResult<()> {
        let pc = self.peer()?;
        pc.set_remote_description(RTCSessionDescription::answer(sdp.to_owned())?)
            .await?;
        Ok(())
    }

    async fn add_remote_candidate(&mut self, candidate: &IceCandidate) -> SessionResult<()> {
        let pc = self.peer()?;
        pc.add_ice_candidate(RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: None,
        })
        .await?;
        Ok(())
    }

    fn supports_track_replacement(&self) -> bool {
        true
    }

    async fn replace_video_source(&mut self, source: VideoSource) -> SessionResult<()> {
        let sender = self.video_sender()?;
        sender
            .replace_track(Some(as_track_local(self.track_for(source))))
            .await
            .map_err(|e| SessionError::TrackReplacementFailed(e.to_string()))?;
        self.source = source;
        Ok(())
    }

    async fn swap_video_source(&mut self, source: VideoSource) -> SessionResult<()> {
        let pc = self.peer()?;
        let old = self.video_sender()?;
        pc.remove_track(&old)
            .await
            .map_err(|e| SessionError::TrackReplacementFailed(e.to_string()))?;
        let sender = pc
            .add_track(as_track_local(self.track_for(source)))
            .await
            .map_err(|e| SessionError::TrackReplacementFailed(e.to_string()))?;
        self.video_sender = Some(sender);
        self.source = source;
        Ok(())
    }

    async fn stats(&self) -> SessionResult<TransportStats> {
        let pc = self.peer()?;
        let (streams, pair_rtt) = collect_reports(pc.get_stats().await);
        reduce_stats(&streams, pair_rtt)
            .ok_or_else(|| SessionError::NetworkUnreachable("no RTCP or candidate pair stats".into()))
    }

    async fn close(&mut self) {
        self.video_sender = None;
        if let Some(pc) = self.pc.take() {
            if let Err(e) = pc.close().await {
                warn!("Peer connection close failed: {}", e);
            }
        }
    }
}
