//! Signaling messages exchanged with the remote peer or relay

use std::io::{Read, Write};

use base64::{engine::general_purpose, Engine as _};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde::{Deserialize, Serialize};

use crate::error::SessionResult;
use crate::peer::types::IceCandidate;
use crate::utils::unix_timestamp;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SignalMessage {
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        candidate: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdp_mid: Option<String>,
        sdp_m_line_index: Option<u16>,
    },
    #[serde(rename_all = "camelCase")]
    EndCall {
        session_id: String,
    },
}

impl SignalMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalMessage::Offer { .. } => "offer",
            SignalMessage::Answer { .. } => "answer",
            SignalMessage::IceCandidate { .. } => "iceCandidate",
            SignalMessage::EndCall { .. } => "endCall",
        }
    }
}

impl From<IceCandidate> for SignalMessage {
    fn from(c: IceCandidate) -> Self {
        SignalMessage::IceCandidate {
            candidate: c.candidate,
            sdp_mid: c.sdp_mid,
            sdp_m_line_index: c.sdp_m_line_index,
        }
    }
}

/// Signal tagged with its session and send time.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SignalEnvelope {
    pub session_id: String,
    pub ts: i64,
    pub message: SignalMessage,
}

impl SignalEnvelope {
    pub fn new(session_id: impl Into<String>, message: SignalMessage) -> Self {
        Self {
            session_id: session_id.into(),
            ts: unix_timestamp(),
            message,
        }
    }

    pub fn to_json(&self) -> SessionResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> SessionResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// gzip + base64 form for copy/paste or QR transfer.
    pub fn encode_compact(&self) -> SessionResult<String> {
        let json = serde_json::to_vec(self)?;
        let mut gz = GzEncoder::new(Vec::new(), Compression::fast());
        gz.write_all(&json)?;
        let compressed = gz.finish()?;
        Ok(general_purpose::STANDARD.encode(compressed))
    }

    pub fn decode_compact(encoded: &str) -> SessionResult<Self> {
        let compressed = general_purpose::STANDARD.decode(encoded.trim())?;
        let mut json = Vec::new();
        GzDecoder::new(compressed.as_slice()).read_to_end(&mut json)?;
        Ok(serde_json::from_slice(&json)?)
    }
}
