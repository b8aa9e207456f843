//! Network and audio quality sampling with hysteresis

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::QualityPolicy;

/// Outbound video quality label
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoQuality {
    Low,
    Medium,
    High,
}

impl VideoQuality {
    /// Label for a tier on a `0..=max_tier` scale: the top two tiers are
    /// high, the next one medium, the rest low.
    pub fn from_tier(tier: u8, max_tier: u8) -> Self {
        let (tier, max_tier) = (u16::from(tier), u16::from(max_tier));
        if tier == 0 {
            VideoQuality::Low
        } else if tier + 1 >= max_tier {
            VideoQuality::High
        } else if tier + 2 >= max_tier {
            VideoQuality::Medium
        } else {
            VideoQuality::Low
        }
    }
}

/// Encoder target for a quality label
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdaptationCommand {
    pub quality: VideoQuality,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub max_bitrate_kbps: u32,
}

impl AdaptationCommand {
    pub fn for_quality(quality: VideoQuality) -> Self {
        let (width, height, frame_rate, max_bitrate_kbps) = match quality {
            VideoQuality::Low => (320, 180, 15, 250),
            VideoQuality::Medium => (640, 360, 24, 800),
            VideoQuality::High => (1280, 720, 30, 2_500),
        };
        Self {
            quality,
            width,
            height,
            frame_rate,
            max_bitrate_kbps,
        }
    }
}

/// One raw measurement.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QualitySample {
    pub packet_loss: f64,
    pub rtt_ms: f64,
    pub audio_level: f32,
    pub participant_count: usize,
}

/// Snapshot of every quality signal, replaced as a whole each tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QualityMetrics {
    /// Smoothed, in [0, 1].
    pub audio_level: f32,
    pub network_tier: u8,
    pub participant_count: usize,
    pub video_quality: VideoQuality,
    /// Number of samples taken so far.
    pub sample: u64,
}

/// Maps packet loss and RTT to a tier in `0..=policy.max_tier()`.
pub fn network_tier(policy: &QualityPolicy, packet_loss: f64, rtt_ms: f64) -> u8 {
    let max = policy.max_tier();
    policy
        .tiers
        .iter()
        .position(|t| packet_loss < t.max_loss && rtt_ms < t.max_rtt_ms)
        .map_or(0, |i| max - i as u8)
}

/// Single writer of `QualityMetrics`; readers hold `watch` receivers.
pub struct QualityMonitor {
    policy: QualityPolicy,
    smoothed_audio: f32,
    label: VideoQuality,
    upgrade_streak: u32,
    upgrade_target: Option<VideoQuality>,
    samples: u64,
    tx: watch::Sender<QualityMetrics>,
}

impl QualityMonitor {
    pub fn new(policy: QualityPolicy) -> Self {
        let initial = QualityMetrics {
            audio_level: 0.0,
            network_tier: policy.max_tier(),
            participant_count: 0,
            video_quality: VideoQuality::High,
            sample: 0,
        };
        let (tx, _rx) = watch::channel(initial);
        Self {
            policy,
            smoothed_audio: 0.0,
            label: VideoQuality::High,
            upgrade_streak: 0,
            upgrade_target: None,
            samples: 0,
            tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<QualityMetrics> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> QualityMetrics {
        *self.tx.borrow()
    }

    pub fn video_quality(&self) -> VideoQuality {
        self.label
    }

    /// Folds a sample in and publishes the new snapshot. Returns an
    /// adaptation command when the video label changes.
    pub fn ingest(&mut self, sample: QualitySample) -> Option<AdaptationCommand> {
        let level = if sample.audio_level.is_finite() {
            sample.audio_level.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let a = self.policy.audio_smoothing;
        self.smoothed_audio = a * level + (1.0 - a) * self.smoothed_audio;

        let tier = network_tier(&self.policy, sample.packet_loss, sample.rtt_ms);
        let candidate = VideoQuality::from_tier(tier, self.policy.max_tier());
        let changed = self.apply_hysteresis(candidate);

        self.samples += 1;
        let metrics = QualityMetrics {
            audio_level: self.smoothed_audio,
            network_tier: tier,
            participant_count: sample.participant_count,
            video_quality: self.label,
            sample: self.samples,
        };
        self.tx.send_replace(metrics);
        debug!(
            tier,
            loss = sample.packet_loss,
            rtt_ms = sample.rtt_ms,
            quality = ?self.label,
            "Quality sample"
        );

        changed.then(|| AdaptationCommand::for_quality(self.label))
    }

    /// Downgrades at once; upgrades only after the improvement holds for
    /// `upgrade_hold_samples` consecutive samples.
    fn apply_hysteresis(&mut self, candidate: VideoQuality) -> bool {
        if candidate < self.label {
            info!(from = ?self.label, to = ?candidate, "Video quality downgraded");
            self.label = candidate;
            self.upgrade_streak = 0;
            self.upgrade_target = None;
            return true;
        }

        if candidate == self.label {
            self.upgrade_streak = 0;
            self.upgrade_target = None;
            return false;
        }

        self.upgrade_streak += 1;
        let target = self
            .upgrade_target
            .map_or(candidate, |t| t.min(candidate));
        self.upgrade_target = Some(target);

        if self.upgrade_streak >= self.policy.upgrade_hold_samples {
            info!(from = ?self.label, to = ?target, "Video quality upgraded");
            self.label = target;
            self.upgrade_streak = 0;
            self.upgrade_target = None;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample(loss: f64, rtt: f64) -> QualitySample {
        QualitySample {
            packet_loss: loss,
            rtt_ms: rtt,
            audio_level: 0.0,
            participant_count: 2,
        }
    }

    const GOOD: (f64, f64) = (0.0, 50.0);
    const POOR: (f64, f64) = (0.15, 800.0);
    const FAIR: (f64, f64) = (0.05, 300.0);

    #[test]
    fn test_tier_thresholds() {
        let policy = QualityPolicy::default();
        assert_eq!(network_tier(&policy, 0.0, 50.0), 4);
        assert_eq!(network_tier(&policy, 0.02, 150.0), 3);
        assert_eq!(network_tier(&policy, 0.05, 300.0), 2);
        assert_eq!(network_tier(&policy, 0.15, 800.0), 1);
        assert_eq!(network_tier(&policy, 0.5, 50.0), 0);
        assert_eq!(network_tier(&policy, f64::NAN, 50.0), 0);
    }

    #[test]
    fn test_label_mapping() {
        assert_eq!(VideoQuality::from_tier(4, 4), VideoQuality::High);
        assert_eq!(VideoQuality::from_tier(3, 4), VideoQuality::High);
        assert_eq!(VideoQuality::from_tier(2, 4), VideoQuality::Medium);
        assert_eq!(VideoQuality::from_tier(1, 4), VideoQuality::Low);
        assert_eq!(VideoQuality::from_tier(0, 4), VideoQuality::Low);
    }

    #[test]
    fn test_downgrade_immediate_upgrade_after_two() {
        let mut monitor = QualityMonitor::new(QualityPolicy::default());

        let cmd = monitor.ingest(sample(POOR.0, POOR.1)).unwrap();
        assert_eq!(cmd.quality, VideoQuality::Low);

        assert!(monitor.ingest(sample(GOOD.0, GOOD.1)).is_none());
        assert_eq!(monitor.video_quality(), VideoQuality::Low);

        let cmd = monitor.ingest(sample(GOOD.0, GOOD.1)).unwrap();
        assert_eq!(cmd.quality, VideoQuality::High);
    }

    #[test]
    fn test_interrupted_upgrade_restarts() {
        let mut monitor = QualityMonitor::new(QualityPolicy::default());
        monitor.ingest(sample(POOR.0, POOR.1));

        monitor.ingest(sample(GOOD.0, GOOD.1));
        monitor.ingest(sample(POOR.0, POOR.1));
        assert!(monitor.ingest(sample(GOOD.0, GOOD.1)).is_none());
        assert_eq!(monitor.video_quality(), VideoQuality::Low);
    }

    #[test]
    fn test_upgrade_goes_to_weakest_of_streak() {
        let mut monitor = QualityMonitor::new(QualityPolicy::default());
        monitor.ingest(sample(POOR.0, POOR.1));

        monitor.ingest(sample(GOOD.0, GOOD.1));
        let cmd = monitor.ingest(sample(FAIR.0, FAIR.1)).unwrap();
        assert_eq!(cmd.quality, VideoQuality::Medium);
    }

    #[test]
    fn test_audio_is_smoothed() {
        let mut monitor = QualityMonitor::new(QualityPolicy::default());
        let mut s = sample(GOOD.0, GOOD.1);
        s.audio_level = 1.0;
        monitor.ingest(s);
        assert!((monitor.current().audio_level - 0.3).abs() < 1e-6);
        monitor.ingest(s);
        assert!((monitor.current().audio_level - 0.51).abs() < 1e-6);
    }

    #[test]
    fn test_snapshot_published_to_readers() {
        let mut monitor = QualityMonitor::new(QualityPolicy::default());
        let rx = monitor.subscribe();
        monitor.ingest(sample(FAIR.0, FAIR.1));

        let seen = *rx.borrow();
        assert_eq!(seen.sample, 1);
        assert_eq!(seen.network_tier, 2);
        assert_eq!(seen.participant_count, 2);
        assert_eq!(seen.video_quality, VideoQuality::Medium);
    }

    proptest! {
        #[test]
        fn prop_degraded_sample_always_downgrades(
            history in proptest::collection::vec((0.0f64..0.5, 0.0f64..1500.0), 0..20),
            loss in 0.0f64..0.5,
            rtt in 0.0f64..1500.0,
        ) {
            let mut monitor = QualityMonitor::new(QualityPolicy::default());
            for (l, r) in history {
                monitor.ingest(sample(l, r));
            }
            let before = monitor.video_quality();
            monitor.ingest(sample(loss, rtt));
            let policy = QualityPolicy::default();
            let candidate = VideoQuality::from_tier(network_tier(&policy, loss, rtt), policy.max_tier());

            if candidate < before {
                prop_assert_eq!(monitor.video_quality(), candidate);
            } else {
                prop_assert!(monitor.video_quality() >= before);
            }
        }

        #[test]
        fn prop_single_good_sample_never_upgrades(loss in 0.0f64..0.5, rtt in 0.0f64..1500.0) {
            let mut monitor = QualityMonitor::new(QualityPolicy::default());
            monitor.ingest(sample(POOR.0, POOR.1));
            monitor.ingest(sample(loss, rtt));
            prop_assert_eq!(monitor.video_quality(), VideoQuality::Low);
        }
    }
}
