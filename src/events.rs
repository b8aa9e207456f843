//! Messages the session engine publishes to its UI collaborator

use std::time::Duration;

use serde::Serialize;

use crate::error::ReasonCode;
use crate::interjection::Speaker;
use crate::media::MediaTrackState;
use crate::peer::types::ConnectionState;
use crate::quality::{AdaptationCommand, QualityMetrics};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    StateChanged {
        state: ConnectionState,
    },
    Connected,
    /// Media path lost, reconnection about to start.
    ConnectionProblem,
    Recovering {
        attempt: u32,
        max_attempts: u32,
    },
    Recovered,
    ConnectionFailed {
        reason: ReasonCode,
        message: String,
    },
    Disconnected,
    TrackChanged {
        track: MediaTrackState,
    },
    TrackError {
        reason: ReasonCode,
        message: String,
    },
    Quality {
        metrics: QualityMetrics,
    },
    Adaptation {
        command: AdaptationCommand,
    },
    SpeakerChanged {
        speaker: Option<Speaker>,
    },
    AiSpeaking {
        text: String,
    },
    Duration {
        #[serde(with = "duration_secs")]
        elapsed: Duration,
    },
    RecordingChanged {
        recording: bool,
    },
    MinimizeChanged {
        minimized: bool,
    },
    BackendCorrelated {
        backend_session_id: String,
    },
    Warning {
        reason: ReasonCode,
        message: String,
    },
    CommandRejected {
        reason: ReasonCode,
        message: String,
    },
    CallEnded {
        reason: ReasonCode,
    },
    RatingRecorded {
        rating: u8,
    },
}

mod duration_secs {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
}
