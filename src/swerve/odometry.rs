// Wheel odometry: integrates module travel and heading into a field pose

use tracing::warn;

use super::kinematics::{ModulePosition, SwerveKinematics};
use crate::geometry::{Pose2d, wrap_angle};

/// Dead-reckoned pose from module distances plus an absolute heading
///
/// Translation comes from the wheels; rotation always comes from the heading
/// sample, offset so that it agrees with the pose the track was last reset to.
#[derive(Debug, Clone)]
pub struct SwerveOdometry {
    pose: Pose2d,
    heading_offset: f64,
    previous_heading: f64,
    last_heading_sample: f64,
    previous_positions: Vec<ModulePosition>,
}

impl SwerveOdometry {
    pub fn new(heading: f64, positions: &[ModulePosition], initial_pose: Pose2d) -> Self {
        Self {
            pose: initial_pose,
            heading_offset: initial_pose.heading - heading,
            previous_heading: initial_pose.heading,
            last_heading_sample: heading,
            previous_positions: positions.to_vec(),
        }
    }

    pub fn pose(&self) -> Pose2d {
        self.pose
    }

    /// Jump to `pose`, re-basing on the given sensor readings
    ///
    /// Encoder accumulators are untouched; only the mapping from them to the
    /// field changes.
    pub fn reset(&mut self, heading: f64, positions: &[ModulePosition], pose: Pose2d) {
        *self = Self::new(heading, positions, pose);
    }

    /// Jump to `pose`, keeping the readings from the last update as the base
    pub fn reset_pose(&mut self, pose: Pose2d) {
        self.pose = pose;
        self.heading_offset = pose.heading - self.last_heading_sample;
        self.previous_heading = pose.heading;
    }

    /// Integrate the motion since the previous update
    pub fn update(
        &mut self,
        kinematics: &SwerveKinematics,
        heading: f64,
        positions: &[ModulePosition],
    ) -> Pose2d {
        let angle = wrap_angle(heading + self.heading_offset);

        if positions.len() != self.previous_positions.len() {
            warn!(
                "Odometry expected {} module positions, got {}; re-basing",
                self.previous_positions.len(),
                positions.len()
            );
            self.previous_positions = positions.to_vec();
            return self.pose;
        }

        let deltas: Vec<ModulePosition> = positions
            .iter()
            .zip(&self.previous_positions)
            .map(|(now, before)| ModulePosition::new(now.distance - before.distance, now.angle))
            .collect();

        let mut twist = kinematics.to_twist(&deltas);
        twist.dtheta = wrap_angle(angle - self.previous_heading);

        let moved = self.pose.exp(&twist);
        self.pose = Pose2d::new(moved.x, moved.y, angle);

        self.previous_heading = angle;
        self.last_heading_sample = heading;
        self.previous_positions = positions.to_vec();
        self.pose
    }
}
