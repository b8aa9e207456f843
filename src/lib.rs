pub mod backend;
pub mod commands;
pub mod config;
pub mod error;
pub mod events;
pub mod interjection;
pub mod logger;
pub mod media;
pub mod peer;
pub mod pose;
pub mod quality;
pub mod session;
pub mod signaling;
pub mod utils;

#[cfg(test)]
mod testing;

pub use backend::{BackendClient, SessionOpened, SessionReport};
pub use commands::{SessionHandle, UiCommand};
pub use config::SessionConfig;
pub use error::{ReasonCode, SessionError, SessionResult};
pub use events::SessionEvent;
pub use interjection::{AiEvent, Speaker, Utterance};
pub use logger::EventEmitter;
pub use media::{DeviceEvent, MediaDevices, MediaTrackState, TrackKind};
pub use peer::{ConnectionState, IceServer, IceServerConfig, PeerTransport, WebRtcTransport};
pub use pose::{DisplayList, Keypoint, PoseFrame, Surface};
pub use quality::{QualityMetrics, VideoQuality};
pub use session::{SessionController, SessionInputs, SessionLinks, SessionSummary};
pub use signaling::{SignalEnvelope, SignalMessage};
