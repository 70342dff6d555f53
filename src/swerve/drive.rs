// Drive coordinator: one read-compute-write pass per control cycle
//
// Owns the modules, kinematics, pose estimator and heading sensor. Motion
// commands go through frame selection, speed scaling, discretization,
// kinematics and desaturation before reaching the modules; sensor readings go
// to the estimator. Nothing in a cycle returns an error: faults are logged,
// counted and the cycle carries on with the last good values.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::estimator::{EstimatorConfig, PoseEstimator};
use super::kinematics::{
    ChassisVelocity, KinematicsError, ModulePosition, ModuleState, SwerveKinematics,
    desaturate_wheel_speeds, discretize,
};
use super::module::SwerveModule;
use crate::geometry::{Pose2d, wrap_angle};
use crate::messages::{DriveCommand, DriveTelemetry, VisionSample};
use crate::sensor::{HeadingSensor, SensorError};

/// How incoming translation is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriveMode {
    /// Relative to the field, using the robot heading
    #[default]
    FieldCentric,
    /// Relative to the robot's own front
    RobotCentric,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeedScale {
    #[default]
    Normal,
    Slow,
}

/// Limits and timing the coordinator needs from configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriveSettings {
    /// Fastest any wheel may be commanded, m/s
    pub max_linear_speed: f64,
    /// Fastest chassis rotation accepted from a command, rad/s
    pub max_angular_speed: f64,
    /// Multiplier applied to commands in slow mode
    pub slow_speed_scale: f64,
    /// Control period used when the caller's dt is unusable, seconds
    pub nominal_dt: f64,
}

pub struct SwerveDrive {
    modules: Vec<SwerveModule>,
    kinematics: SwerveKinematics,
    estimator: PoseEstimator,
    gyro: Box<dyn HeadingSensor>,
    settings: DriveSettings,
    mode: DriveMode,
    speed_scale: SpeedScale,
    heading_zero: f64,
    raw_heading: f64,
    commanded: Vec<ModuleState>,
    faults: usize,
}

impl SwerveDrive {
    pub fn new(
        modules: Vec<SwerveModule>,
        gyro: Box<dyn HeadingSensor>,
        settings: DriveSettings,
        estimator_config: &EstimatorConfig,
    ) -> Result<Self, KinematicsError> {
        let kinematics = SwerveKinematics::new(modules.iter().map(|m| m.translation()).collect())?;
        let commanded = vec![ModuleState::default(); modules.len()];

        let mut drive = Self {
            estimator: PoseEstimator::new(
                kinematics.clone(),
                estimator_config,
                0.0,
                &[],
                Pose2d::default(),
            ),
            modules,
            kinematics,
            gyro,
            settings,
            mode: DriveMode::default(),
            speed_scale: SpeedScale::default(),
            heading_zero: 0.0,
            raw_heading: 0.0,
            commanded,
            faults: 0,
        };

        // Seed both pose tracks from the real readings
        let heading = drive.read_heading();
        let positions = drive.module_positions();
        drive.estimator.reset_pose(heading, &positions, Pose2d::default());

        info!(
            "Swerve drive ready: {} modules, max {:.2} m/s",
            drive.modules.len(),
            settings.max_linear_speed
        );
        Ok(drive)
    }

    /// Command the drivetrain for one cycle
    ///
    /// # Arguments
    /// * `command` - Desired velocity; non-finite values are treated as a stop
    /// * `dt` - Seconds this command will be held, used for skew correction
    pub fn drive(&mut self, command: &DriveCommand, dt: f64) {
        let mut chassis = ChassisVelocity::from(command);
        if !chassis.is_finite() {
            warn!("Non-finite drive command {:?}, stopping", command);
            chassis = ChassisVelocity::zero();
        }

        chassis = chassis.scaled(self.speed_factor());
        let max_omega = self.settings.max_angular_speed;
        if chassis.omega.abs() > max_omega {
            debug!("Clamping rotation {:.2} rad/s to {:.2}", chassis.omega, max_omega);
            chassis.omega = chassis.omega.clamp(-max_omega, max_omega);
        }

        if command.frame.unwrap_or(self.mode) == DriveMode::FieldCentric {
            chassis = ChassisVelocity::from_field_relative(
                chassis.vx,
                chassis.vy,
                chassis.omega,
                self.heading(),
            );
        }

        let dt = if dt.is_finite() && dt > 0.0 {
            dt
        } else {
            self.settings.nominal_dt
        };
        self.drive_modules(&discretize(&chassis, dt));
    }

    /// Drive the modules with a robot-relative velocity, no frame handling
    pub fn drive_modules(&mut self, chassis: &ChassisVelocity) {
        let previous: Vec<f64> = self.modules.iter().map(|m| m.last_commanded_angle()).collect();
        let mut states = self.kinematics.to_module_states(chassis, &previous);
        desaturate_wheel_speeds(&mut states, self.settings.max_linear_speed);

        for (module, state) in self.modules.iter_mut().zip(&states) {
            if let Err(e) = module.drive(state) {
                warn!("Module {}: drive failed: {}", module.name(), e);
                self.faults += 1;
            }
        }
        self.commanded = states;
    }

    /// Advance the pose estimate with this cycle's sensor readings
    ///
    /// # Arguments
    /// * `now` - Seconds on the runtime clock
    /// * `vision` - Latest vision sample, if any arrived this cycle
    pub fn periodic(&mut self, now: f64, vision: Option<&VisionSample>) -> Pose2d {
        let heading = self.read_heading() - self.heading_zero;
        let positions = self.module_positions();
        self.estimator.update(now, heading, &positions);

        if let Some(sample) = vision {
            if self.estimator.add_vision_measurement(sample) {
                debug!("Applied vision sample from {:.3}s", sample.timestamp);
            }
        }
        self.estimator.pose()
    }

    pub fn set_drive_mode(&mut self, mode: DriveMode) {
        info!("Drive mode: {:?}", mode);
        self.mode = mode;
    }

    pub fn toggle_drive_mode(&mut self) {
        self.set_drive_mode(match self.mode {
            DriveMode::FieldCentric => DriveMode::RobotCentric,
            DriveMode::RobotCentric => DriveMode::FieldCentric,
        });
    }

    pub fn drive_mode(&self) -> DriveMode {
        self.mode
    }

    pub fn set_speed_scale(&mut self, scale: SpeedScale) {
        info!("Speed scale: {:?}", scale);
        self.speed_scale = scale;
    }

    pub fn speed_scale(&self) -> SpeedScale {
        self.speed_scale
    }

    /// Set the field-centric zero to `offset` radians (CCW) from the robot's
    /// current facing; afterwards the robot heading reads `-offset`.
    ///
    /// Both pose tracks keep their position and take the new heading.
    pub fn reset_heading(&mut self, offset: f64) {
        let raw = self.read_heading();
        self.heading_zero = raw + offset;
        info!("Reset heading zero to {:.3} rad (offset {:.3})", self.heading_zero, offset);

        let positions = self.module_positions();
        let heading = raw - self.heading_zero;
        let fused = self.estimator.pose();
        self.estimator
            .reset_pose(heading, &positions, Pose2d::new(fused.x, fused.y, heading));
    }

    /// Move both pose tracks to `pose`; encoder accumulators are untouched
    pub fn reset_pose(&mut self, pose: Pose2d) {
        let heading = self.read_heading() - self.heading_zero;
        let positions = self.module_positions();
        self.estimator.reset_pose(heading, &positions, pose);
        info!("Reset pose to ({:.3}, {:.3}, {:.3})", pose.x, pose.y, pose.heading);
    }

    /// Command zero speed and zero angle to every module
    pub fn zero_modules(&mut self) {
        for module in self.modules.iter_mut() {
            if let Err(e) = module.zero() {
                warn!("Module {}: zeroing failed: {}", module.name(), e);
                self.faults += 1;
            }
        }
        self.commanded = vec![ModuleState::default(); self.modules.len()];
    }

    /// Stop every wheel, leaving steering where it is
    pub fn stop(&mut self) {
        for module in self.modules.iter_mut() {
            if let Err(e) = module.set_velocity(0.0) {
                warn!("Module {}: stop failed: {}", module.name(), e);
                self.faults += 1;
            }
        }
    }

    pub fn pose(&self) -> Pose2d {
        self.estimator.pose()
    }

    pub fn odometry_pose(&self) -> Pose2d {
        self.estimator.odometry_pose()
    }

    /// Robot heading relative to the field-centric zero, wrapped
    pub fn heading(&self) -> f64 {
        wrap_angle(self.raw_heading - self.heading_zero)
    }

    pub fn heading_zero(&self) -> f64 {
        self.heading_zero
    }

    /// States sent to the modules on the last drive call
    pub fn commanded_states(&self) -> &[ModuleState] {
        &self.commanded
    }

    pub fn module_states(&mut self) -> Vec<ModuleState> {
        self.modules.iter_mut().map(|m| m.state()).collect()
    }

    pub fn module_positions(&mut self) -> Vec<ModulePosition> {
        self.modules.iter_mut().map(|m| m.position()).collect()
    }

    /// Measured chassis velocity, robot frame
    pub fn chassis_velocity(&mut self) -> ChassisVelocity {
        let states = self.module_states();
        self.kinematics.to_chassis_velocity(&states)
    }

    pub fn kinematics(&self) -> &SwerveKinematics {
        &self.kinematics
    }

    /// Motor faults logged since the last call
    pub fn cycle_faults(&mut self) -> usize {
        std::mem::take(&mut self.faults)
    }

    pub fn telemetry(&mut self, now: f64) -> DriveTelemetry {
        let modules = self.module_states();
        DriveTelemetry {
            timestamp: now,
            pose: self.pose(),
            odometry_pose: self.odometry_pose(),
            heading: self.heading(),
            chassis: self.kinematics.to_chassis_velocity(&modules),
            modules,
            mode: self.mode,
            speed_scale: self.speed_scale,
        }
    }

    fn speed_factor(&self) -> f64 {
        match self.speed_scale {
            SpeedScale::Normal => 1.0,
            SpeedScale::Slow => self.settings.slow_speed_scale,
        }
    }

    /// Raw heading sample, holding the last good one on failure
    fn read_heading(&mut self) -> f64 {
        match self.gyro.get_heading() {
            Ok(heading) if heading.is_finite() => self.raw_heading = heading,
            Ok(_) => warn!("Non-finite heading sample, holding {:.3}", self.raw_heading),
            Err(SensorError::NoSample) => debug!("No heading sample yet"),
            Err(e) => warn!("Heading read failed ({}), holding {:.3}", e, self.raw_heading),
        }
        self.raw_heading
    }
}

impl Drop for SwerveDrive {
    fn drop(&mut self) {
        // Never leave wheels spinning on shutdown
        self.stop();
    }
}
