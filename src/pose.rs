//! Pose overlay - skeleton drawing over the video surface
//!
//! Pose estimation happens elsewhere. This module only takes finished
//! keypoint frames and turns them into draw calls.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::OverlayConfig;
use crate::error::{SessionError, SessionResult};

/// Keypoints per frame in the 33-landmark body model
pub const MAX_KEYPOINTS: usize = 33;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub confidence: f32,
}

impl Keypoint {
    pub fn new(x: f32, y: f32, confidence: f32) -> Self {
        Self { x, y, confidence }
    }

    /// Corrupt (non-finite) keypoints never pass.
    pub fn passes(&self, threshold: f32) -> bool {
        self.x.is_finite()
            && self.y.is_finite()
            && self.confidence.is_finite()
            && self.confidence >= threshold
    }
}

/// One frame of keypoints, indexed by joint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoseFrame {
    keypoints: Vec<Keypoint>,
}

impl PoseFrame {
    /// Keeps at most [`MAX_KEYPOINTS`]; extra points are dropped.
    pub fn new(mut keypoints: Vec<Keypoint>) -> Self {
        if keypoints.len() > MAX_KEYPOINTS {
            debug!(len = keypoints.len(), "Pose frame truncated");
            keypoints.truncate(MAX_KEYPOINTS);
        }
        Self { keypoints }
    }

    pub fn keypoints(&self) -> &[Keypoint] {
        &self.keypoints
    }

    pub fn get(&self, joint: usize) -> Option<&Keypoint> {
        self.keypoints.get(joint)
    }

    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }
}

/// Body region an edge belongs to, used for colouring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BodyRegion {
    Face,
    Torso,
    LeftArm,
    RightArm,
    LeftHand,
    RightHand,
    LeftLeg,
    RightLeg,
}

impl BodyRegion {
    pub fn color(self) -> Rgba {
        match self {
            BodyRegion::Face => Rgba(255, 255, 255, 255),
            BodyRegion::Torso => Rgba(0, 200, 120, 255),
            BodyRegion::LeftArm | BodyRegion::LeftLeg => Rgba(255, 140, 0, 255),
            BodyRegion::RightArm | BodyRegion::RightLeg => Rgba(0, 180, 255, 255),
            BodyRegion::LeftHand => Rgba(255, 200, 80, 255),
            BodyRegion::RightHand => Rgba(120, 220, 255, 255),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub from: usize,
    pub to: usize,
    pub region: BodyRegion,
}

use BodyRegion::*;

/// Landmark connections of the 33-point body model.
const BODY_EDGES: &[(usize, usize, BodyRegion)] = &[
    // Face
    (0, 1, Face),
    (1, 2, Face),
    (2, 3, Face),
    (3, 7, Face),
    (0, 4, Face),
    (4, 5, Face),
    (5, 6, Face),
    (6, 8, Face),
    (9, 10, Face),
    // Torso
    (11, 12, Torso),
    (11, 23, Torso),
    (12, 24, Torso),
    (23, 24, Torso),
    // Arms
    (11, 13, LeftArm),
    (13, 15, LeftArm),
    (12, 14, RightArm),
    (14, 16, RightArm),
    // Hands
    (15, 17, LeftHand),
    (15, 19, LeftHand),
    (15, 21, LeftHand),
    (17, 19, LeftHand),
    (16, 18, RightHand),
    (16, 20, RightHand),
    (16, 22, RightHand),
    (18, 20, RightHand),
    // Legs
    (23, 25, LeftLeg),
    (25, 27, LeftLeg),
    (27, 29, LeftLeg),
    (29, 31, LeftLeg),
    (27, 31, LeftLeg),
    (24, 26, RightLeg),
    (26, 28, RightLeg),
    (28, 30, RightLeg),
    (30, 32, RightLeg),
    (28, 32, RightLeg),
];

/// Validated joint topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Skeleton {
    joint_count: usize,
    edges: Vec<Edge>,
}

impl Skeleton {
    /// Checks every edge against the joint set. Bad indices are a
    /// configuration error, raised here rather than at render time.
    pub fn new(joint_count: usize, edges: Vec<Edge>) -> SessionResult<Self> {
        if joint_count == 0 || joint_count > MAX_KEYPOINTS {
            return Err(SessionError::InvalidConfig(format!(
                "skeleton joint count must be in 1..={}, got {}",
                MAX_KEYPOINTS, joint_count
            )));
        }
        for edge in &edges {
            if edge.from >= joint_count || edge.to >= joint_count {
                return Err(SessionError::InvalidConfig(format!(
                    "skeleton edge {}-{} references a joint outside 0..{}",
                    edge.from, edge.to, joint_count
                )));
            }
            if edge.from == edge.to {
                return Err(SessionError::InvalidConfig(format!(
                    "skeleton edge {0}-{0} is a self loop",
                    edge.from
                )));
            }
        }
        Ok(Self { joint_count, edges })
    }

    /// The 33-landmark body model.
    pub fn body() -> SessionResult<Self> {
        let edges = BODY_EDGES
            .iter()
            .map(|&(from, to, region)| Edge { from, to, region })
            .collect();
        Self::new(MAX_KEYPOINTS, edges)
    }

    pub fn joint_count(&self) -> usize {
        self.joint_count
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rgba(pub u8, pub u8, pub u8, pub u8);

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

/// Per-axis factor from keypoint space to surface pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scale {
    pub x: f32,
    pub y: f32,
}

impl Scale {
    pub fn uniform(factor: f32) -> Self {
        Self {
            x: factor,
            y: factor,
        }
    }

    fn apply(&self, k: &Keypoint) -> Point {
        Point {
            x: k.x * self.x,
            y: k.y * self.y,
        }
    }
}

/// Drawing target.
pub trait Surface {
    fn draw_line(&mut self, from: Point, to: Point, width: f32, color: Rgba);
    fn draw_circle(&mut self, center: Point, radius: f32, color: Rgba);
}

#[derive(Debug, Clone, PartialEq)]
pub enum DrawOp {
    Line {
        from: Point,
        to: Point,
        width: f32,
        color: Rgba,
    },
    Circle {
        center: Point,
        radius: f32,
        color: Rgba,
    },
}

/// Surface that records draw calls for a compositor to replay.
#[derive(Debug, Default, Clone)]
pub struct DisplayList {
    ops: Vec<DrawOp>,
}

impl DisplayList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ops(&self) -> &[DrawOp] {
        &self.ops
    }

    pub fn clear(&mut self) {
        self.ops.clear();
    }
}

impl Surface for DisplayList {
    fn draw_line(&mut self, from: Point, to: Point, width: f32, color: Rgba) {
        self.ops.push(DrawOp::Line {
            from,
            to,
            width,
            color,
        });
    }

    fn draw_circle(&mut self, center: Point, radius: f32, color: Rgba) {
        self.ops.push(DrawOp::Circle {
            center,
            radius,
            color,
        });
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RenderStats {
    pub joints_drawn: usize,
    pub edges_drawn: usize,
    pub joints_skipped: usize,
}

const JOINT_COLOR: Rgba = Rgba(255, 64, 64, 255);

/// Stateless skeleton renderer. Nothing from one frame survives into the next.
#[derive(Debug, Clone)]
pub struct PoseOverlayRenderer {
    skeleton: Skeleton,
    joint_radius: f32,
    line_width: f32,
}

impl PoseOverlayRenderer {
    pub fn new(skeleton: Skeleton, config: &OverlayConfig) -> Self {
        Self {
            skeleton,
            joint_radius: config.joint_radius,
            line_width: config.line_width,
        }
    }

    pub fn skeleton(&self) -> &Skeleton {
        &self.skeleton
    }

    pub fn render<S: Surface>(
        &self,
        frame: &PoseFrame,
        confidence_threshold: f32,
        scale: Scale,
        surface: &mut S,
    ) -> RenderStats {
        let mut stats = RenderStats::default();
        let visible = |joint: usize| {
            frame
                .get(joint)
                .filter(|k| k.passes(confidence_threshold))
        };

        for edge in self.skeleton.edges() {
            if let (Some(a), Some(b)) = (visible(edge.from), visible(edge.to)) {
                surface.draw_line(
                    scale.apply(a),
                    scale.apply(b),
                    self.line_width,
                    edge.region.color(),
                );
                stats.edges_drawn += 1;
            }
        }

        for keypoint in frame.keypoints().iter().take(self.skeleton.joint_count()) {
            if keypoint.passes(confidence_threshold) {
                surface.draw_circle(scale.apply(keypoint), self.joint_radius, JOINT_COLOR);
                stats.joints_drawn += 1;
            } else {
                stats.joints_skipped += 1;
            }
        }

        stats
    }
}
