// Planar rigid-body geometry: poses, twists and angle wrapping.
//
// Poses live in the field frame (metres, radians, CCW positive). Twists are
// displacements along a constant-curvature arc and connect two poses through
// exp/log.

use std::f64::consts::{PI, TAU};

use nalgebra::{Rotation2, Vector2};
use serde::{Deserialize, Serialize};

/// Below this rotation the closed-form exp/log terms switch to their Taylor
/// expansions.
const SMALL_ANGLE: f64 = 1e-9;

/// Wrap an angle into (-π, π]
pub fn wrap_angle(radians: f64) -> f64 {
    let wrapped = radians.rem_euclid(TAU);
    if wrapped > PI { wrapped - TAU } else { wrapped }
}

/// Robot position and orientation in the field frame
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pose2d {
    pub x: f64,
    pub y: f64,
    pub heading: f64,
}

/// Displacement along an arc, expressed in the frame of the starting pose
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Twist2d {
    pub dx: f64,
    pub dy: f64,
    pub dtheta: f64,
}

impl Twist2d {
    pub fn new(dx: f64, dy: f64, dtheta: f64) -> Self {
        Self { dx, dy, dtheta }
    }

    pub fn scaled(&self, factor: f64) -> Self {
        Self::new(self.dx * factor, self.dy * factor, self.dtheta * factor)
    }
}

impl Pose2d {
    /// Create a pose, wrapping the heading into (-π, π]
    pub fn new(x: f64, y: f64, heading: f64) -> Self {
        Self {
            x,
            y,
            heading: wrap_angle(heading),
        }
    }

    pub fn translation(&self) -> Vector2<f64> {
        Vector2::new(self.x, self.y)
    }

    pub fn rotation(&self) -> Rotation2<f64> {
        Rotation2::new(self.heading)
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.heading.is_finite()
    }

    /// Apply `other`, expressed in this pose's frame, on top of this pose
    pub fn compose(&self, other: &Pose2d) -> Pose2d {
        let t = self.translation() + self.rotation() * other.translation();
        Pose2d::new(t.x, t.y, self.heading + other.heading)
    }

    pub fn inverse(&self) -> Pose2d {
        let t = -(self.rotation().inverse() * self.translation());
        Pose2d::new(t.x, t.y, -self.heading)
    }

    /// The pose of `end` as seen from this pose
    pub fn delta_to(&self, end: &Pose2d) -> Pose2d {
        self.inverse().compose(end)
    }

    /// Follow `twist` from this pose along a constant-curvature arc
    pub fn exp(&self, twist: &Twist2d) -> Pose2d {
        let Twist2d { dx, dy, dtheta } = *twist;
        let (sin, cos) = dtheta.sin_cos();

        let (s, c) = if dtheta.abs() < SMALL_ANGLE {
            (1.0 - dtheta * dtheta / 6.0, 0.5 * dtheta)
        } else {
            (sin / dtheta, (1.0 - cos) / dtheta)
        };

        let local = Pose2d::new(dx * s - dy * c, dx * c + dy * s, dtheta);
        self.compose(&local)
    }

    /// The twist that takes this pose to `end`; inverse of [`Pose2d::exp`]
    pub fn log(&self, end: &Pose2d) -> Twist2d {
        let delta = self.delta_to(end);
        let dtheta = delta.heading;
        let half_dtheta = dtheta / 2.0;
        let cos_minus_one = dtheta.cos() - 1.0;

        let half_theta_by_tan = if cos_minus_one.abs() < SMALL_ANGLE {
            1.0 - dtheta * dtheta / 12.0
        } else {
            -(half_dtheta * dtheta.sin()) / cos_minus_one
        };

        Twist2d::new(
            delta.x * half_theta_by_tan + delta.y * half_dtheta,
            delta.y * half_theta_by_tan - delta.x * half_dtheta,
            dtheta,
        )
    }

    /// Pose a `fraction` of the way along the arc from this pose to `end`
    pub fn interpolate(&self, end: &Pose2d, fraction: f64) -> Pose2d {
        let fraction = fraction.clamp(0.0, 1.0);
        self.exp(&self.log(end).scaled(fraction))
    }
}
