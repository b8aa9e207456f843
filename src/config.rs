// Session configuration
// Logging is on by default only in debug builds

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SessionError, SessionResult};

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true;

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false;

/// Session-scoped configuration handed to every component at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// This side creates the offer.
    pub initiator: bool,
    /// An AI agent takes part in the session.
    pub ai_agent: bool,
    /// Serialize AI speech against human speech.
    pub turn_taking: bool,
    pub logging: bool,
    pub negotiation_timeout_ms: u64,
    pub permissions: MediaPermissions,
    pub reconnect: ReconnectPolicy,
    pub quality: QualityPolicy,
    pub interjection: InterjectionPolicy,
    pub overlay: OverlayConfig,
    pub backend: BackendPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            initiator: true,
            ai_agent: false,
            turn_taking: true,
            logging: LOGGING_ENABLED,
            negotiation_timeout_ms: 15_000,
            permissions: MediaPermissions::default(),
            reconnect: ReconnectPolicy::default(),
            quality: QualityPolicy::default(),
            interjection: InterjectionPolicy::default(),
            overlay: OverlayConfig::default(),
            backend: BackendPolicy::default(),
        }
    }
}

impl SessionConfig {
    pub fn from_json_str(json: &str) -> SessionResult<Self> {
        let config: SessionConfig = serde_json::from_str(json)
            .map_err(|e| SessionError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> SessionResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SessionError::InvalidConfig(format!("{}: {}", path.display(), e))
        })?;
        Self::from_json_str(&raw)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    pub fn validate(&self) -> SessionResult<()> {
        if self.negotiation_timeout_ms == 0 {
            return Err(SessionError::InvalidConfig(
                "negotiation_timeout_ms must be positive".into(),
            ));
        }
        self.reconnect.validate()?;
        self.quality.validate()?;
        self.interjection.validate()?;
        self.overlay.validate()?;
        self.backend.validate()
    }
}

/// Which local devices the session may open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaPermissions {
    pub microphone: bool,
    pub camera: bool,
    pub screen_share: bool,
}

impl Default for MediaPermissions {
    fn default() -> Self {
        Self {
            microphone: true,
            camera: true,
            screen_share: true,
        }
    }
}

/// Bounded exponential backoff for reconnection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 16_000,
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    fn validate(&self) -> SessionResult<()> {
        if self.max_attempts == 0 {
            return Err(SessionError::InvalidConfig(
                "reconnect.max_attempts must be at least 1".into(),
            ));
        }
        if self.base_delay_ms == 0 || self.max_delay_ms < self.base_delay_ms {
            return Err(SessionError::InvalidConfig(format!(
                "reconnect delays must satisfy 0 < base ({}) <= max ({})",
                self.base_delay_ms, self.max_delay_ms
            )));
        }
        Ok(())
    }
}

/// Upper bounds a sample must stay under to reach a tier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierThreshold {
    /// Packet loss as a fraction in [0, 1].
    pub max_loss: f64,
    pub max_rtt_ms: f64,
}

impl TierThreshold {
    pub const fn new(max_loss: f64, max_rtt_ms: f64) -> Self {
        Self {
            max_loss,
            max_rtt_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityPolicy {
    pub sample_interval_ms: u64,
    /// Weight of the newest audio sample in the moving average.
    pub audio_smoothing: f32,
    /// Consecutive improved samples required before upgrading.
    pub upgrade_hold_samples: u32,
    /// Thresholds from the best tier down; tier = len - index.
    pub tiers: Vec<TierThreshold>,
}

impl Default for QualityPolicy {
    fn default() -> Self {
        Self {
            sample_interval_ms: 1_000,
            audio_smoothing: 0.3,
            upgrade_hold_samples: 2,
            tiers: vec![
                TierThreshold::new(0.01, 100.0),
                TierThreshold::new(0.03, 200.0),
                TierThreshold::new(0.08, 400.0),
                TierThreshold::new(0.20, 1_000.0),
            ],
        }
    }
}

impl QualityPolicy {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    /// Highest tier this policy can report.
    pub fn max_tier(&self) -> u8 {
        self.tiers.len() as u8
    }

    fn validate(&self) -> SessionResult<()> {
        if self.sample_interval_ms == 0 {
            return Err(SessionError::InvalidConfig(
                "quality.sample_interval_ms must be positive".into(),
            ));
        }
        if !(self.audio_smoothing > 0.0 && self.audio_smoothing <= 1.0) {
            return Err(SessionError::InvalidConfig(format!(
                "quality.audio_smoothing must be in (0, 1], got {}",
                self.audio_smoothing
            )));
        }
        if self.upgrade_hold_samples == 0 {
            return Err(SessionError::InvalidConfig(
                "quality.upgrade_hold_samples must be at least 1".into(),
            ));
        }
        if self.tiers.is_empty() || self.tiers.len() > u8::MAX as usize {
            return Err(SessionError::InvalidConfig(
                "quality.tiers must list between 1 and 255 thresholds".into(),
            ));
        }
        let ordered = self
            .tiers
            .windows(2)
            .all(|w| w[0].max_loss <= w[1].max_loss && w[0].max_rtt_ms <= w[1].max_rtt_ms);
        if !ordered {
            return Err(SessionError::InvalidConfig(
                "quality.tiers must loosen from best to worst".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterjectionPolicy {
    pub max_duration_ms: u64,
    /// Smoothed local audio level treated as human speech.
    pub speech_threshold: f32,
}

impl Default for InterjectionPolicy {
    fn default() -> Self {
        Self {
            max_duration_ms: 15_000,
            speech_threshold: 0.12,
        }
    }
}

impl InterjectionPolicy {
    pub fn max_duration(&self) -> Duration {
        Duration::from_millis(self.max_duration_ms)
    }

    fn validate(&self) -> SessionResult<()> {
        if self.max_duration_ms == 0 {
            return Err(SessionError::InvalidConfig(
                "interjection.max_duration_ms must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.speech_threshold) {
            return Err(SessionError::InvalidConfig(format!(
                "interjection.speech_threshold must be in [0, 1], got {}",
                self.speech_threshold
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    pub confidence_threshold: f32,
    pub scale_x: f32,
    pub scale_y: f32,
    pub joint_radius: f32,
    pub line_width: f32,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            scale_x: 1.0,
            scale_y: 1.0,
            joint_radius: 4.0,
            line_width: 2.0,
        }
    }
}

impl OverlayConfig {
    fn validate(&self) -> SessionResult<()> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(SessionError::InvalidConfig(format!(
                "overlay.confidence_threshold must be in [0, 1], got {}",
                self.confidence_threshold
            )));
        }
        if !(self.scale_x.is_finite() && self.scale_y.is_finite())
            || self.scale_x <= 0.0
            || self.scale_y <= 0.0
        {
            return Err(SessionError::InvalidConfig(
                "overlay scale factors must be finite and positive".into(),
            ));
        }
        Ok(())
    }
}

/// Retry policy for the out-of-band backend calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendPolicy {
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for BackendPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay_ms: 2_000,
            request_timeout_ms: 5_000,
        }
    }
}

impl BackendPolicy {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    fn validate(&self) -> SessionResult<()> {
        if self.max_attempts == 0 || self.request_timeout_ms == 0 {
            return Err(SessionError::InvalidConfig(
                "backend.max_attempts and backend.request_timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}
