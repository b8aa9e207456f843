use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{SessionError, SessionResult};
use crate::utils::add_ice_url_scheme;

/// ICE candidate exchanged with the remote side
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>, sdp_m_line_index: Option<u16>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index,
        }
    }
}

/// A single STUN/TURN server descriptor
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    #[serde(deserialize_with = "one_or_many")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }

    pub fn has_credentials(&self) -> bool {
        self.username.is_some() && self.credential.is_some()
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(url) => vec![url],
        OneOrMany::Many(urls) => urls,
    })
}

/// Ordered, validated ICE server list. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IceServerConfig {
    servers: Vec<IceServer>,
}

impl IceServerConfig {
    /// Validates and normalises the descriptors. An empty list falls back to
    /// public STUN servers.
    pub fn new(servers: Vec<IceServer>) -> SessionResult<Self> {
        if servers.is_empty() {
            return Ok(Self::default());
        }

        let mut normalised = Vec::with_capacity(servers.len());
        for server in servers {
            if server.urls.is_empty() || server.urls.iter().any(|u| u.trim().is_empty()) {
                return Err(SessionError::InvalidConfig(
                    "ICE server URL cannot be empty".into(),
                ));
            }

            let urls: Vec<String> = server
                .urls
                .iter()
                .map(|u| add_ice_url_scheme(u.trim(), server.has_credentials()))
                .collect();

            let is_turn = urls.iter().any(|u| u.starts_with("turn"));
            if is_turn && !server.has_credentials() {
                return Err(SessionError::InvalidConfig(format!(
                    "TURN server {} requires username and credential",
                    urls[0]
                )));
            }

            normalised.push(IceServer {
                urls,
                username: server.username,
                credential: server.credential,
            });
        }

        Ok(Self {
            servers: normalised,
        })
    }

    pub fn from_json_str(json: &str) -> SessionResult<Self> {
        let servers: Vec<IceServer> =
            serde_json::from_str(json).map_err(|e| SessionError::InvalidConfig(e.to_string()))?;
        Self::new(servers)
    }

    pub fn servers(&self) -> &[IceServer] {
        &self.servers
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

impl Default for IceServerConfig {
    fn default() -> Self {
        Self {
            servers: vec![IceServer {
                urls: vec![
                    "stun:stun.l.google.com:19302".into(),
                    "stun:stun1.l.google.com:19302".into(),
                ],
                username: None,
                credential: None,
            }],
        }
    }
}

/// Peer connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Idle,
    Gathering,
    Negotiating,
    Connected,
    Reconnecting,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }

    /// Still working towards a first connection.
    pub fn is_setup(&self) -> bool {
        matches!(
            self,
            ConnectionState::Gathering | ConnectionState::Negotiating
        )
    }
}
