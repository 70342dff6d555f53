// Pose estimation: wheel odometry fused with intermittent vision fixes
//
// Two tracks run side by side from the same sensor data. The odometry track
// is pure dead reckoning. The fused track additionally gets pulled towards
// each accepted vision sample by a fixed per-axis gain, applied at the time
// the image was captured and carried forward to the present.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::kinematics::{ModulePosition, SwerveKinematics};
use super::odometry::SwerveOdometry;
use crate::geometry::{Pose2d, Twist2d};
use crate::messages::VisionSample;

/// Trust settings, fixed for the lifetime of an estimator
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    /// Odometry standard deviations: x (m), y (m), heading (rad)
    pub state_std_devs: [f64; 3],
    /// Vision standard deviations: x (m), y (m), heading (rad)
    pub vision_std_devs: [f64; 3],
    /// Vision samples older than this (seconds) are ignored
    pub max_vision_age: f64,
    /// How much pose history is kept for latency compensation (seconds)
    pub history_window: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            state_std_devs: [0.1, 0.1, 0.1],
            vision_std_devs: [0.9, 0.9, 0.9],
            max_vision_age: 0.5,
            history_window: 1.5,
        }
    }
}

impl EstimatorConfig {
    /// Steady-state Kalman gain per axis: q / (q + sqrt(q·r))
    pub fn gains(&self) -> [f64; 3] {
        let mut gains = [0.0; 3];
        for (i, gain) in gains.iter_mut().enumerate() {
            let q = self.state_std_devs[i].powi(2);
            let r = self.vision_std_devs[i].powi(2);
            *gain = if q == 0.0 { 0.0 } else { q / (q + (q * r).sqrt()) };
        }
        gains
    }
}

pub struct PoseEstimator {
    kinematics: SwerveKinematics,
    odometry: SwerveOdometry,
    fused: SwerveOdometry,
    history: VecDeque<(f64, Pose2d)>,
    gains: [f64; 3],
    max_vision_age: f64,
    history_window: f64,
    latest_timestamp: Option<f64>,
}

impl PoseEstimator {
    pub fn new(
        kinematics: SwerveKinematics,
        config: &EstimatorConfig,
        heading: f64,
        positions: &[ModulePosition],
        initial_pose: Pose2d,
    ) -> Self {
        let odometry = SwerveOdometry::new(heading, positions, initial_pose);
        Self {
            kinematics,
            fused: odometry.clone(),
            odometry,
            history: VecDeque::new(),
            gains: config.gains(),
            max_vision_age: config.max_vision_age,
            history_window: config.history_window,
            latest_timestamp: None,
        }
    }

    /// Best estimate: odometry corrected by vision
    pub fn pose(&self) -> Pose2d {
        self.fused.pose()
    }

    /// Wheel odometry alone
    pub fn odometry_pose(&self) -> Pose2d {
        self.odometry.pose()
    }

    pub fn gains(&self) -> [f64; 3] {
        self.gains
    }

    /// Move both tracks to `pose` and forget the pose history
    pub fn reset_pose(&mut self, heading: f64, positions: &[ModulePosition], pose: Pose2d) {
        self.odometry.reset(heading, positions, pose);
        self.fused.reset(heading, positions, pose);
        self.history.clear();
    }

    /// Advance both tracks with this cycle's readings, taken at `timestamp`
    pub fn update(&mut self, timestamp: f64, heading: f64, positions: &[ModulePosition]) -> Pose2d {
        self.odometry.update(&self.kinematics, heading, positions);
        let fused = self.fused.update(&self.kinematics, heading, positions);

        if self.latest_timestamp.is_some_and(|latest| timestamp < latest) {
            debug!("Clock went backwards, dropping pose history");
            self.history.clear();
        }
        self.latest_timestamp = Some(timestamp);

        self.history.push_back((timestamp, fused));
        while self.history.len() > 1
            && self
                .history
                .front()
                .is_some_and(|&(t, _)| timestamp - t > self.history_window)
        {
            self.history.pop_front();
        }

        fused
    }

    /// Fold a vision sample into the fused track
    ///
    /// Returns false when the sample was skipped: marked invalid, not finite,
    /// older than the vision age limit, or older than the kept history.
    /// Samples stamped slightly after the latest update are applied at the
    /// latest update; those further ahead than the age limit are skipped.
    pub fn add_vision_measurement(&mut self, sample: &VisionSample) -> bool {
        if !sample.valid {
            return false;
        }
        if !(sample.pose.is_finite() && sample.timestamp.is_finite()) {
            debug!("Ignoring non-finite vision sample");
            return false;
        }
        let Some(latest) = self.latest_timestamp else {
            return false;
        };
        if latest - sample.timestamp > self.max_vision_age {
            debug!(
                "Ignoring stale vision sample ({:.3}s old)",
                latest - sample.timestamp
            );
            return false;
        }
        if sample.timestamp - latest > self.max_vision_age {
            debug!(
                "Ignoring vision sample {:.3}s ahead of the pose clock",
                sample.timestamp - latest
            );
            return false;
        }
        // Small clock skew ahead of the last update counts as "now"; history
        // timestamps must never run past the latest update
        let timestamp = sample.timestamp.min(latest);

        let Some(pose_at_sample) = self.sample_history(timestamp) else {
            debug!("Vision sample at {:.3}s predates pose history", timestamp);
            return false;
        };

        let error = pose_at_sample.log(&sample.pose);
        let step = Twist2d::new(
            error.dx * self.gains[0],
            error.dy * self.gains[1],
            error.dtheta * self.gains[2],
        );
        let corrected = pose_at_sample.exp(&step);

        // Motion since the capture time is re-applied on top of the correction
        let carry = |pose: &Pose2d| corrected.compose(&pose_at_sample.delta_to(pose));

        self.history.retain(|&(t, _)| t >= timestamp);
        for entry in self.history.iter_mut() {
            entry.1 = carry(&entry.1);
        }
        if self.history.front().is_none_or(|&(t, _)| t > timestamp) {
            self.history.push_front((timestamp, corrected));
        }

        let current = carry(&self.fused.pose());
        self.fused.reset_pose(current);
        true
    }

    /// Fused pose at `timestamp`, interpolated between history entries
    fn sample_history(&self, timestamp: f64) -> Option<Pose2d> {
        let &(first_t, _) = self.history.front()?;
        let &(last_t, last_pose) = self.history.back()?;

        if timestamp < first_t {
            return None;
        }
        if timestamp >= last_t {
            return Some(last_pose);
        }

        let after = self.history.iter().position(|&(t, _)| t > timestamp)?;
        let (t0, p0) = self.history[after - 1];
        let (t1, p1) = self.history[after];
        let span = t1 - t0;
        if span <= 0.0 {
            return Some(p1);
        }
        Some(p0.interpolate(&p1, (timestamp - t0) / span))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use nalgebra::Vector2;

    const DT: f64 = 0.02;

    fn estimator() -> PoseEstimator {
        let kinematics = SwerveKinematics::new(vec![
            Vector2::new(0.3, 0.3),
            Vector2::new(0.3, -0.3),
            Vector2::new(-0.3, 0.3),
            Vector2::new(-0.3, -0.3),
        ])
        .unwrap();
        PoseEstimator::new(
            kinematics,
            &EstimatorConfig::default(),
            0.0,
            &positions(0.0),
            Pose2d::default(),
        )
    }

    fn positions(distance: f64) -> Vec<ModulePosition> {
        vec![ModulePosition::new(distance, 0.0); 4]
    }

    /// Drive forward at 1 m/s for `cycles` cycles starting at cycle `from`
    fn drive_forward(estimator: &mut PoseEstimator, from: usize, cycles: usize) {
        for i in from..from + cycles {
            let t = i as f64 * DT;
            estimator.update(t, 0.0, &positions(t));
        }
    }

    fn vision(pose: Pose2d, timestamp: f64) -> VisionSample {
        VisionSample {
            pose,
            timestamp,
            valid: true,
        }
    }

    #[test]
    fn test_default_gains() {
        let gains = EstimatorConfig::default().gains();
        for gain in gains {
            assert_abs_diff_eq!(gain, 0.1, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_fused_matches_odometry_without_vision() {
        let mut estimator = estimator();
        drive_forward(&mut estimator, 0, 50);

        assert_abs_diff_eq!(estimator.pose().x, 0.98, epsilon = 1e-9);
        assert_eq!(estimator.pose(), estimator.odometry_pose());
    }

    #[test]
    fn test_vision_at_current_pose_changes_nothing() {
        let mut estimator = estimator();
        drive_forward(&mut estimator, 0, 25);
        let before = estimator.pose();

        let applied = estimator.add_vision_measurement(&vision(estimator.odometry_pose(), 24.0 * DT));

        assert!(applied);
        assert_abs_diff_eq!(estimator.pose().x, before.x, epsilon = 1e-12);
        assert_abs_diff_eq!(estimator.pose().y, before.y, epsilon = 1e-12);
        assert_abs_diff_eq!(estimator.pose().heading, before.heading, epsilon = 1e-12);
    }

    #[test]
    fn test_vision_offset_pulls_partway() {
        let mut estimator = estimator();
        drive_forward(&mut estimator, 0, 10);
        let odometry = estimator.odometry_pose();
        let target = Pose2d::new(odometry.x, odometry.y + 1.0, 0.0);

        assert!(estimator.add_vision_measurement(&vision(target, 9.0 * DT)));

        let pose = estimator.pose();
        assert_abs_diff_eq!(pose.y, 0.1, epsilon = 1e-9);
        assert_abs_diff_eq!(pose.x, odometry.x, epsilon = 1e-9);
        // The odometry track never sees vision
        assert_eq!(estimator.odometry_pose(), odometry);
    }

    #[test]
    fn test_repeated_vision_converges() {
        let mut estimator = estimator();
        let target = Pose2d::new(1.0, -1.0, 0.0);
        estimator.update(0.0, 0.0, &positions(0.0));

        for i in 1..=60 {
            let t = i as f64 * DT;
            estimator.update(t, 0.0, &positions(0.0));
            assert!(estimator.add_vision_measurement(&vision(target, t)));
            let pose = estimator.pose();
            // Never jumps past the target
            assert!(pose.x <= 1.0 && pose.y >= -1.0);
        }

        // 0.9^60 of the initial 1 m error remains
        assert_abs_diff_eq!(estimator.pose().x, 1.0, epsilon = 0.01);
        assert_abs_diff_eq!(estimator.pose().y, -1.0, epsilon = 0.01);
    }

    #[test]
    fn test_latency_compensation_carries_motion_forward() {
        let mut estimator = estimator();
        drive_forward(&mut estimator, 0, 20);

        // Captured at t = 0.2 s (x = 0.2) but reported after the robot moved on
        let captured = Pose2d::new(0.2, 0.5, 0.0);
        assert!(estimator.add_vision_measurement(&vision(captured, 10.0 * DT)));

        let pose = estimator.pose();
        assert_abs_diff_eq!(pose.x, 0.38, epsilon = 1e-9);
        assert_abs_diff_eq!(pose.y, 0.05, epsilon = 1e-9);
    }

    #[test]
    fn test_invalid_and_stale_samples_skipped() {
        let mut estimator = estimator();
        drive_forward(&mut estimator, 0, 50);
        let before = estimator.pose();
        let far = Pose2d::new(5.0, 5.0, 1.0);

        let mut invalid = vision(far, 49.0 * DT);
        invalid.valid = false;
        assert!(!estimator.add_vision_measurement(&invalid));

        // 0.6 s old with a 0.5 s limit
        assert!(!estimator.add_vision_measurement(&vision(far, 49.0 * DT - 0.6)));

        let nan = vision(Pose2d::new(f64::NAN, 0.0, 0.0), 49.0 * DT);
        assert!(!estimator.add_vision_measurement(&nan));

        assert_eq!(estimator.pose(), before);
    }

    #[test]
    fn test_vision_from_fast_clock_does_not_block_later_samples() {
        let mut estimator = estimator();
        estimator.update(1.0, 0.0, &positions(0.0));

        // Camera clock runs 0.3 s ahead: applied as of the latest update
        let target = Pose2d::new(0.0, 1.0, 0.0);
        assert!(estimator.add_vision_measurement(&vision(target, 1.3)));
        assert_abs_diff_eq!(estimator.pose().y, 0.1, epsilon = 1e-9);

        // A correctly stamped sample right after is still fused
        estimator.update(1.02, 0.0, &positions(0.0));
        assert!(estimator.add_vision_measurement(&vision(target, 1.02)));
        assert_abs_diff_eq!(estimator.pose().y, 0.19, epsilon = 1e-9);

        // Far ahead of the pose clock is rejected like a stale sample
        assert!(!estimator.add_vision_measurement(&vision(target, 1.02 + 0.6)));
    }

    #[test]
    fn test_vision_before_any_update_skipped() {
        let mut estimator = estimator();
        assert!(!estimator.add_vision_measurement(&vision(Pose2d::default(), 0.0)));
    }

    #[test]
    fn test_reset_pose_reads_back_exactly() {
        let mut estimator = estimator();
        drive_forward(&mut estimator, 0, 10);

        let target = Pose2d::new(3.25, -1.5, 2.0);
        estimator.reset_pose(0.0, &positions(9.0 * DT), target);

        assert_eq!(estimator.pose(), target);
        assert_eq!(estimator.odometry_pose(), target);
    }
}
