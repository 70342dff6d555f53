// One swerve module: a drive motor and a steer motor on a fixed offset
//
// Turns a kinematic target state into motor commands: optimizes the steering
// path, scales speed by heading error and converts wheel units to motor units.

use std::f64::consts::{FRAC_PI_2, PI};

use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::kinematics::{ModulePosition, ModuleState};
use crate::geometry::wrap_angle;
use crate::motor::{EncodedMotor, MotorError, MotorSettings};

/// Gearing between motor shafts and the wheel
///
/// Ratios are output/input: a drive ratio of 1/6.75 means the wheel turns
/// once per 6.75 motor turns. The same constants convert commands and
/// readback, otherwise odometry drifts from what was commanded.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModuleRatios {
    pub drive_ratio: f64,
    pub steer_ratio: f64,
    /// Metres
    pub wheel_diameter: f64,
}

impl ModuleRatios {
    /// Metres of wheel travel per radian of drive motor rotation
    fn metres_per_motor_radian(&self) -> f64 {
        self.drive_ratio * self.wheel_diameter / 2.0
    }

    pub fn wheel_speed(&self, motor_radians_per_sec: f64) -> f64 {
        motor_radians_per_sec * self.metres_per_motor_radian()
    }

    pub fn drive_motor_velocity(&self, wheel_speed: f64) -> f64 {
        wheel_speed / self.metres_per_motor_radian()
    }

    pub fn wheel_distance(&self, motor_radians: f64) -> f64 {
        motor_radians * self.metres_per_motor_radian()
    }

    pub fn module_angle(&self, steer_motor_radians: f64) -> f64 {
        steer_motor_radians * self.steer_ratio
    }

    pub fn steer_motor_angle(&self, module_angle: f64) -> f64 {
        module_angle / self.steer_ratio
    }
}

/// Final command for one module
///
/// Unlike `ModuleState`, `angle` is not wrapped: it sits in the continuous
/// band around the steering encoder's current reading so the steer motor
/// never winds through a wrap-around.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SteeringCommand {
    pub speed: f64,
    pub angle: f64,
}

/// Place `angle` within ±π of `reference`, keeping it equivalent mod 2π
pub fn place_in_scope(reference: f64, angle: f64) -> f64 {
    reference + wrap_angle(angle - reference)
}

/// Pick the steering target needing the least rotation from `current_angle`
///
/// The target is first moved into the band around the (unwrapped) current
/// angle. If it is still more than 90° away, steering to the opposite
/// direction and reversing the wheel gives the same motion with less rotation.
pub fn optimize(target: &ModuleState, current_angle: f64) -> SteeringCommand {
    let mut angle = place_in_scope(current_angle, target.angle);
    let mut speed = target.speed;

    let delta = angle - current_angle;
    if delta.abs() > FRAC_PI_2 {
        speed = -speed;
        angle += if delta > FRAC_PI_2 { -PI } else { PI };
    }

    SteeringCommand { speed, angle }
}

pub struct SwerveModule {
    name: String,
    drive: Box<dyn EncodedMotor>,
    steer: Box<dyn EncodedMotor>,
    translation: Vector2<f64>,
    ratios: ModuleRatios,
    // Last good readback, reused when the bus fails mid-cycle
    last_speed: f64,
    last_distance: f64,
    last_angle: f64,
    last_commanded_angle: f64,
}

impl SwerveModule {
    pub fn new(
        name: impl Into<String>,
        drive: Box<dyn EncodedMotor>,
        steer: Box<dyn EncodedMotor>,
        translation: Vector2<f64>,
        ratios: ModuleRatios,
    ) -> Self {
        Self {
            name: name.into(),
            drive,
            steer,
            translation,
            ratios,
            last_speed: 0.0,
            last_distance: 0.0,
            last_angle: 0.0,
            last_commanded_angle: 0.0,
        }
    }

    pub fn configure(&mut self, drive: &MotorSettings, steer: &MotorSettings) -> Result<(), MotorError> {
        self.drive.configure(drive)?;
        self.steer.configure(steer)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn translation(&self) -> Vector2<f64> {
        self.translation
    }

    /// Angle of the last command, wrapped; held when a target has no direction
    pub fn last_commanded_angle(&self) -> f64 {
        self.last_commanded_angle
    }

    /// Drive towards `target`, returning what was actually commanded
    ///
    /// The optimized speed is scaled by the cosine of the remaining steering
    /// error. This deliberately gives up tracking effort while the module is
    /// still turning, so a wheel pointing the wrong way does not push the
    /// chassis sideways. Past 90° of error the cosine goes negative, which
    /// still drives along the target direction.
    pub fn drive(&mut self, target: &ModuleState) -> Result<SteeringCommand, MotorError> {
        let current = self.unwrapped_angle();
        let optimized = optimize(target, current);
        let command = SteeringCommand {
            speed: optimized.speed * (optimized.angle - current).cos(),
            angle: optimized.angle,
        };

        self.last_commanded_angle = wrap_angle(command.angle);
        self.set_velocity(command.speed)?;
        self.set_angle(command.angle)?;
        Ok(command)
    }

    /// Measured speed and wrapped angle
    pub fn state(&mut self) -> ModuleState {
        let angle = self.unwrapped_angle();
        match self.read_drive(|m| m.get_angular_velocity(), "velocity") {
            Some(velocity) => self.last_speed = self.ratios.wheel_speed(velocity),
            None => warn!("Module {}: using last speed {:.3} m/s", self.name, self.last_speed),
        }
        ModuleState::new(self.last_speed, angle)
    }

    /// Measured cumulative distance and angle
    pub fn position(&mut self) -> ModulePosition {
        let angle = self.unwrapped_angle();
        match self.read_drive(|m| m.get_angle(), "position") {
            Some(radians) => self.last_distance = self.ratios.wheel_distance(radians),
            None => warn!("Module {}: using last distance {:.3} m", self.name, self.last_distance),
        }
        ModulePosition::new(self.last_distance, angle)
    }

    pub fn set_velocity(&mut self, wheel_speed: f64) -> Result<(), MotorError> {
        self.drive
            .set_angular_velocity(self.ratios.drive_motor_velocity(wheel_speed))
    }

    pub fn set_angle(&mut self, module_angle: f64) -> Result<(), MotorError> {
        self.steer.set_angle(self.ratios.steer_motor_angle(module_angle))
    }

    /// Stop the wheel and point it straight ahead
    pub fn zero(&mut self) -> Result<(), MotorError> {
        self.last_commanded_angle = 0.0;
        self.set_velocity(0.0)?;
        self.set_angle(0.0)
    }

    /// Steering angle without wrapping, falling back to the last reading
    fn unwrapped_angle(&mut self) -> f64 {
        match self.steer.get_angle() {
            Ok(radians) if radians.is_finite() => {
                self.last_angle = self.ratios.module_angle(radians);
            }
            Ok(_) => warn!("Module {}: steer encoder returned a non-finite angle", self.name),
            Err(e) => warn!("Module {}: failed to read steer angle: {}", self.name, e),
        }
        self.last_angle
    }

    fn read_drive(
        &mut self,
        read: impl FnOnce(&mut dyn EncodedMotor) -> Result<f64, MotorError>,
        quantity: &str,
    ) -> Option<f64> {
        match read(self.drive.as_mut()) {
            Ok(value) if value.is_finite() => Some(value),
            Ok(_) => {
                warn!("Module {}: drive {} is not finite", self.name, quantity);
                None
            }
            Err(e) => {
                warn!("Module {}: failed to read drive {}: {}", self.name, quantity, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::{SimMotor, SimMotorHandle};
    use approx::assert_abs_diff_eq;
    use std::f64::consts::FRAC_PI_4;

    const RATIOS: ModuleRatios = ModuleRatios {
        drive_ratio: 1.0 / 6.75,
        steer_ratio: 7.0 / 150.0,
        wheel_diameter: 0.1016,
    };

    fn sim_module() -> (SwerveModule, SimMotorHandle, SimMotorHandle) {
        let drive = SimMotor::new();
        let steer = SimMotor::new();
        let (drive_handle, steer_handle) = (drive.handle(), steer.handle());
        let module = SwerveModule::new(
            "front_left",
            Box::new(drive),
            Box::new(steer),
            Vector2::new(0.3, 0.3),
            RATIOS,
        );
        (module, drive_handle, steer_handle)
    }

    #[test]
    fn test_optimize_golden_vector() {
        // At 170° wanting 10°: reverse the wheel and steer to 190° instead
        let target = ModuleState::new(3.0, 10f64.to_radians());
        let command = optimize(&target, 170f64.to_radians());

        assert_abs_diff_eq!(command.angle.to_degrees(), 190.0, epsilon = 1e-9);
        assert_abs_diff_eq!(command.speed, -3.0);
    }

    #[test]
    fn test_optimize_stays_in_encoder_band() {
        // Two full turns plus 5°, target just below zero: stay near 725°
        let target = ModuleState::new(1.0, (-10f64).to_radians());
        let command = optimize(&target, 725f64.to_radians());

        assert_abs_diff_eq!(command.angle.to_degrees(), 710.0, epsilon = 1e-9);
        assert_abs_diff_eq!(command.speed, 1.0);
    }

    #[test]
    fn test_optimize_small_change_keeps_direction() {
        let target = ModuleState::new(2.0, FRAC_PI_4);
        let command = optimize(&target, 0.0);
        assert_abs_diff_eq!(command.angle, FRAC_PI_4);
        assert_abs_diff_eq!(command.speed, 2.0);
    }

    #[test]
    fn test_optimize_bounds_and_equivalence() {
        for current_deg in (-720..=720).step_by(35) {
            for target_deg in (-180..180).step_by(17) {
                let current = (current_deg as f64).to_radians();
                let target = ModuleState::new(1.5, (target_deg as f64).to_radians());
                let command = optimize(&target, current);

                assert!(
                    (command.angle - current).abs() <= FRAC_PI_2 + 1e-9,
                    "current {} target {} -> {}",
                    current_deg,
                    target_deg,
                    command.angle.to_degrees()
                );
                // Same wheel velocity vector as the unoptimized target
                assert_abs_diff_eq!(
                    command.speed * command.angle.cos(),
                    target.speed * target.angle.cos(),
                    epsilon = 1e-9
                );
                assert_abs_diff_eq!(
                    command.speed * command.angle.sin(),
                    target.speed * target.angle.sin(),
                    epsilon = 1e-9
                );
                assert_abs_diff_eq!(command.speed.abs(), 1.5);
            }
        }
    }

    #[test]
    fn test_ratio_conversions_are_consistent() {
        let motor = RATIOS.drive_motor_velocity(2.0);
        assert_abs_diff_eq!(RATIOS.wheel_speed(motor), 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(RATIOS.wheel_distance(motor), 2.0, epsilon = 1e-12);

        let steer = RATIOS.steer_motor_angle(1.0);
        assert_abs_diff_eq!(RATIOS.module_angle(steer), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_drive_commands_motors_in_motor_units() {
        let (mut module, drive, steer) = sim_module();

        let command = module.drive(&ModuleState::new(1.0, 0.5)).unwrap();

        // Sim steering settles immediately, but the cosine used the old angle
        assert_abs_diff_eq!(command.speed, 0.5f64.cos(), epsilon = 1e-12);
        assert_abs_diff_eq!(steer.angle(), RATIOS.steer_motor_angle(0.5), epsilon = 1e-12);
        assert_abs_diff_eq!(
            drive.velocity(),
            RATIOS.drive_motor_velocity(command.speed),
            epsilon = 1e-9
        );

        // Readback goes through the same ratios
        let state = module.state();
        assert_abs_diff_eq!(state.speed, command.speed, epsilon = 1e-9);
        assert_abs_diff_eq!(state.angle, 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_drive_with_heading_error_scales_speed() {
        let (mut module, _drive, steer) = sim_module();
        steer.set_angle(RATIOS.steer_motor_angle(170f64.to_radians()));

        let command = module.drive(&ModuleState::new(3.0, 10f64.to_radians())).unwrap();

        assert_abs_diff_eq!(command.angle.to_degrees(), 190.0, epsilon = 1e-9);
        assert_abs_diff_eq!(command.speed, -3.0 * 20f64.to_radians().cos(), epsilon = 1e-9);
        assert_abs_diff_eq!(
            module.last_commanded_angle().to_degrees(),
            -170.0,
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_position_accumulates_distance() {
        let (mut module, drive, _steer) = sim_module();
        module.drive(&ModuleState::new(2.0, 0.0)).unwrap();
        for _ in 0..50 {
            drive.step(0.02);
        }

        let position = module.position();
        assert_abs_diff_eq!(position.distance, 2.0, epsilon = 1e-9);
        assert_abs_diff_eq!(position.angle, 0.0);
    }

    #[test]
    fn test_zero_stops_and_centers() {
        let (mut module, drive, steer) = sim_module();
        module.drive(&ModuleState::new(2.0, 1.0)).unwrap();
        module.zero().unwrap();

        assert_eq!(drive.velocity(), 0.0);
        assert_eq!(steer.angle(), 0.0);
        assert_eq!(module.last_commanded_angle(), 0.0);
    }
}
