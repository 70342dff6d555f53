// Swerve kinematics for an N-module base
// Converts chassis velocities to per-module (speed, angle) targets and back.
//
// The forward map stacks two rows per module, [1, 0, -y] and [0, 1, x], so a
// chassis velocity [vx, vy, omega] becomes each module's wheel velocity
// vector. The inverse map is the least-squares pseudo-inverse of that matrix.

use nalgebra::{DMatrix, DVector, Vector2};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::geometry::{Pose2d, Twist2d, wrap_angle};

/// Wheel speeds below this (m/s) are treated as stopped; the module keeps its
/// previous angle instead of snapping to atan2(0, 0).
pub const MIN_MODULE_SPEED: f64 = 1e-6;

/// Singular values below this are treated as zero when inverting the geometry
const RANK_EPSILON: f64 = 1e-9;

#[derive(Debug, thiserror::Error)]
pub enum KinematicsError {
    #[error("At least two modules are required, got {0}")]
    TooFewModules(usize),

    #[error("Module translation {index} is not finite")]
    NonFiniteTranslation { index: usize },

    #[error("Module geometry is rank deficient (rank {rank}, need 3)")]
    RankDeficient { rank: usize },
}

/// Linear and angular velocity of the whole chassis
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ChassisVelocity {
    pub vx: f64,
    pub vy: f64,
    pub omega: f64,
}

impl ChassisVelocity {
    pub fn new(vx: f64, vy: f64, omega: f64) -> Self {
        Self { vx, vy, omega }
    }

    pub fn zero() -> Self {
        Self::default()
    }

    pub fn is_finite(&self) -> bool {
        self.vx.is_finite() && self.vy.is_finite() && self.omega.is_finite()
    }

    pub fn scaled(&self, factor: f64) -> Self {
        Self::new(self.vx * factor, self.vy * factor, self.omega * factor)
    }

    /// Convert a field-relative velocity into the robot frame, given the
    /// robot's heading in the field frame (radians, CCW positive)
    pub fn from_field_relative(vx: f64, vy: f64, omega: f64, heading: f64) -> Self {
        let (sin, cos) = heading.sin_cos();
        Self::new(vx * cos + vy * sin, -vx * sin + vy * cos, omega)
    }
}

/// Target or measured velocity of one module
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ModuleState {
    /// Signed wheel speed, m/s
    pub speed: f64,
    /// Steering angle, radians in (-π, π]
    pub angle: f64,
}

impl ModuleState {
    pub fn new(speed: f64, angle: f64) -> Self {
        Self {
            speed,
            angle: wrap_angle(angle),
        }
    }
}

/// Cumulative wheel travel and current steering angle of one module
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ModulePosition {
    /// Signed distance travelled since power-on, metres
    pub distance: f64,
    /// Steering angle, radians
    pub angle: f64,
}

impl ModulePosition {
    pub fn new(distance: f64, angle: f64) -> Self {
        Self { distance, angle }
    }
}

/// Fixed module layout plus its forward and least-squares inverse matrices
#[derive(Debug, Clone)]
pub struct SwerveKinematics {
    translations: Vec<Vector2<f64>>,
    forward: DMatrix<f64>,
    inverse: DMatrix<f64>,
}

impl SwerveKinematics {
    /// Build kinematics from module offsets relative to the rotation center
    pub fn new(translations: Vec<Vector2<f64>>) -> Result<Self, KinematicsError> {
        if translations.len() < 2 {
            return Err(KinematicsError::TooFewModules(translations.len()));
        }
        if let Some(index) = translations
            .iter()
            .position(|t| !(t.x.is_finite() && t.y.is_finite()))
        {
            return Err(KinematicsError::NonFiniteTranslation { index });
        }

        let mut forward = DMatrix::<f64>::zeros(translations.len() * 2, 3);
        for (i, t) in translations.iter().enumerate() {
            forward[(i * 2, 0)] = 1.0;
            forward[(i * 2, 2)] = -t.y;
            forward[(i * 2 + 1, 1)] = 1.0;
            forward[(i * 2 + 1, 2)] = t.x;
        }

        let rank = forward.rank(RANK_EPSILON);
        if rank < 3 {
            return Err(KinematicsError::RankDeficient { rank });
        }

        let inverse = forward
            .clone()
            .pseudo_inverse(RANK_EPSILON)
            .map_err(|_| KinematicsError::RankDeficient { rank })?;

        Ok(Self {
            translations,
            forward,
            inverse,
        })
    }

    pub fn num_modules(&self) -> usize {
        self.translations.len()
    }

    pub fn translations(&self) -> &[Vector2<f64>] {
        &self.translations
    }

    /// Convert a chassis velocity to one target state per module
    ///
    /// # Arguments
    /// * `chassis` - Robot-frame velocity (m/s, m/s, rad/s)
    /// * `previous_angles` - Last commanded angle of each module, used when a
    ///   module's resulting speed is zero and its angle is undefined
    pub fn to_module_states(
        &self,
        chassis: &ChassisVelocity,
        previous_angles: &[f64],
    ) -> Vec<ModuleState> {
        let command = DVector::from_column_slice(&[chassis.vx, chassis.vy, chassis.omega]);
        let wheel_vectors = &self.forward * command;

        (0..self.num_modules())
            .map(|i| {
                let vx = wheel_vectors[i * 2];
                let vy = wheel_vectors[i * 2 + 1];
                let speed = vx.hypot(vy);

                if speed < MIN_MODULE_SPEED {
                    let held = previous_angles.get(i).copied().unwrap_or(0.0);
                    ModuleState::new(0.0, held)
                } else {
                    ModuleState::new(speed, vy.atan2(vx))
                }
            })
            .collect()
    }

    /// Least-squares chassis velocity that best explains the module states
    pub fn to_chassis_velocity(&self, states: &[ModuleState]) -> ChassisVelocity {
        let solved = self.solve(states.iter().map(|s| (s.speed, s.angle)));
        ChassisVelocity::new(solved[0], solved[1], solved[2])
    }

    /// Least-squares robot-frame twist from per-module travel since the last
    /// update. Each delta carries the distance travelled and the current angle.
    pub fn to_twist(&self, deltas: &[ModulePosition]) -> Twist2d {
        let solved = self.solve(deltas.iter().map(|d| (d.distance, d.angle)));
        Twist2d::new(solved[0], solved[1], solved[2])
    }

    fn solve(&self, polar: impl ExactSizeIterator<Item = (f64, f64)>) -> [f64; 3] {
        if polar.len() != self.num_modules() {
            warn!(
                "Expected {} module values, got {}; reporting no motion",
                self.num_modules(),
                polar.len()
            );
            return [0.0; 3];
        }

        let mut wheel_vectors = DVector::<f64>::zeros(self.num_modules() * 2);
        for (i, (magnitude, angle)) in polar.enumerate() {
            let (sin, cos) = angle.sin_cos();
            wheel_vectors[i * 2] = magnitude * cos;
            wheel_vectors[i * 2 + 1] = magnitude * sin;
        }

        let solved = &self.inverse * wheel_vectors;
        [solved[0], solved[1], solved[2]]
    }
}

/// Scale all module speeds down uniformly so none exceeds `max_speed`
///
/// Relative speeds between modules are preserved, so the chassis keeps moving
/// in the commanded direction, only slower. Safe to call every cycle: states
/// already within the limit are left untouched.
pub fn desaturate_wheel_speeds(states: &mut [ModuleState], max_speed: f64) {
    let max_speed = max_speed.abs();
    let max_computed = states.iter().map(|s| s.speed.abs()).fold(0.0f64, f64::max);

    if max_computed > max_speed {
        let scale = max_speed / max_computed;
        for state in states.iter_mut() {
            state.speed *= scale;
        }
    }

    // Rounding in the scale must never push a module past the limit
    for state in states.iter_mut() {
        state.speed = state.speed.clamp(-max_speed, max_speed);
    }
}

/// Correct a chassis velocity for the skew of holding it constant over `dt`
///
/// Holding (vx, vy, omega) fixed for a whole cycle moves the robot along a
/// straight line in the frame it started in, while the robot rotates under
/// it. Taking the log of the displacement pose gives the arc twist that ends
/// at the same pose; dividing by `dt` turns it back into a velocity.
/// With omega == 0 this is the identity.
///
/// A cycle that would turn half a revolution or more has no well-defined arc
/// (the pose heading wraps), so such commands pass through uncorrected.
pub fn discretize(chassis: &ChassisVelocity, dt: f64) -> ChassisVelocity {
    if !(dt.is_finite() && dt > 0.0) {
        return *chassis;
    }
    if (chassis.omega * dt).abs() >= std::f64::consts::PI {
        warn!(
            "Rotation of {:.2} rad in one cycle is too fast to discretize",
            chassis.omega * dt
        );
        return *chassis;
    }

    let desired_delta = Pose2d::new(chassis.vx * dt, chassis.vy * dt, chassis.omega * dt);
    let twist = Pose2d::default().log(&desired_delta);

    ChassisVelocity::new(twist.dx / dt, twist.dy / dt, twist.dtheta / dt)
}
