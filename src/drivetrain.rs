// Assembles a SwerveDrive from configuration, on hardware or in simulation
use nalgebra::Vector2;
use tracing::info;

use crate::config::DriveConfig;
use crate::motor::feetech::MAX_ANGULAR_VELOCITY;
use crate::motor::{ControlMode, EncodedMotor, FeetechBus, FeetechError, FeetechMotor, MotorError};
use crate::sensor::{HeadingSensor, SharedHeading};
use crate::swerve::{KinematicsError, SwerveDrive, SwerveModule};

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Invalid module geometry: {0}")]
    Kinematics(#[from] KinematicsError),

    #[error("Motor setup failed: {0}")]
    Motor(#[from] MotorError),

    #[error("Motor bus unavailable: {0}")]
    Feetech(#[from] FeetechError),

    #[error("Config lists {modules} modules but {motors} motor pairs were provided")]
    MotorCount { modules: usize, motors: usize },

    #[error("Steer ratio {0} unsupported: single-turn position servos need 1.0")]
    SteerRatio(f64),

    #[error("max_linear_speed {requested:.3} m/s exceeds the {limit:.3} m/s the drive servos can reach")]
    SpeedLimit { requested: f64, limit: f64 },
}

/// Drive and steer motor of one module, in config order
pub type MotorPair = (Box<dyn EncodedMotor>, Box<dyn EncodedMotor>);

/// Wrap motors into configured modules and hand them to a new drive
pub fn build_drive(
    config: &DriveConfig,
    motors: Vec<MotorPair>,
    gyro: Box<dyn HeadingSensor>,
) -> Result<SwerveDrive, BuildError> {
    if motors.len() != config.modules.len() {
        return Err(BuildError::MotorCount {
            modules: config.modules.len(),
            motors: motors.len(),
        });
    }

    let mut modules = Vec::with_capacity(motors.len());
    for (module_config, (drive, steer)) in config.modules.iter().zip(motors) {
        let [x, y] = module_config.translation;
        let mut module = SwerveModule::new(
            module_config.name.clone(),
            drive,
            steer,
            Vector2::new(x, y),
            config.ratios,
        );
        module.configure(&module_config.drive, &module_config.steer)?;
        modules.push(module);
    }

    Ok(SwerveDrive::new(
        modules,
        gyro,
        config.drive_settings(),
        &config.estimator,
    )?)
}

/// Check a config against what Feetech servos can execute
///
/// The steer servo folds its goal into one revolution, so it must turn the
/// module 1:1. The drive servo's velocity register saturates, so every wheel
/// speed the desaturation step allows has to stay below that limit.
pub fn check_feetech_limits(config: &DriveConfig) -> Result<(), BuildError> {
    if config.ratios.steer_ratio != 1.0 {
        return Err(BuildError::SteerRatio(config.ratios.steer_ratio));
    }
    let limit = config.ratios.wheel_speed(MAX_ANGULAR_VELOCITY);
    if config.max_linear_speed > limit {
        return Err(BuildError::SpeedLimit {
            requested: config.max_linear_speed,
            limit,
        });
    }
    Ok(())
}

/// Open the servo bus and build the drive on Feetech motors
///
/// Returns the drive plus the heading handle the runtime feeds with IMU samples.
pub fn build_hardware(config: &DriveConfig) -> Result<(SwerveDrive, SharedHeading), BuildError> {
    check_feetech_limits(config)?;
    info!("Opening motor bus on {}", config.motor_port);
    let bus = FeetechBus::open(&config.motor_port)?.shared();

    let mut motors: Vec<MotorPair> = Vec::with_capacity(config.modules.len());
    for module in &config.modules {
        let mut drive = FeetechMotor::new(bus.clone(), module.drive_id, ControlMode::Velocity);
        let mut steer = FeetechMotor::new(bus.clone(), module.steer_id, ControlMode::Position);
        drive.initialize()?;
        steer.initialize()?;
        info!(
            "Module {}: drive servo {}, steer servo {}",
            module.name,
            drive.id(),
            steer.id()
        );
        motors.push((Box::new(drive), Box::new(steer)));
    }

    let heading = SharedHeading::new();
    let drive = build_drive(config, motors, Box::new(heading.clone()))?;
    Ok((drive, heading))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::DriveCommand;
    use crate::motor::SimMotor;
    use crate::motor::feetech::goal_velocity;
    use crate::sensor::SimGyro;
    use crate::sim::build_sim_drive;
    use crate::swerve::DriveMode;
    use approx::assert_relative_eq;

    fn sim_motors(count: usize) -> Vec<MotorPair> {
        (0..count)
            .map(|_| -> MotorPair { (Box::new(SimMotor::new()), Box::new(SimMotor::new())) })
            .collect()
    }

    #[test]
    fn test_build_applies_motor_settings() {
        let mut config = DriveConfig::default();
        config.modules[0].steer.current_limit = 1.5;

        let steer = SimMotor::new();
        let handle = steer.handle();
        let mut motors = sim_motors(3);
        motors.insert(0, (Box::new(SimMotor::new()), Box::new(steer)));

        let drive = build_drive(&config, motors, Box::new(SimGyro::new())).unwrap();
        assert_eq!(drive.kinematics().num_modules(), 4);
        assert_eq!(handle.current_limit(), 1.5);
    }

    #[test]
    fn test_motor_count_mismatch() {
        let config = DriveConfig::default();
        let err = build_drive(&config, sim_motors(3), Box::new(SimGyro::new())).err();
        assert!(matches!(
            err,
            Some(BuildError::MotorCount { modules: 4, motors: 3 })
        ));
    }

    #[test]
    fn test_coincident_modules_rejected() {
        let mut config = DriveConfig::default();
        for module in config.modules.iter_mut() {
            module.translation = [0.2, 0.2];
        }
        let err = build_drive(&config, sim_motors(4), Box::new(SimGyro::new())).err();
        assert!(matches!(err, Some(BuildError::Kinematics(_))));
    }

    #[test]
    fn test_default_config_fits_feetech_limits() {
        check_feetech_limits(&DriveConfig::default()).unwrap();
    }

    #[test]
    fn test_geared_steering_rejected_for_feetech() {
        let mut config = DriveConfig::default();
        config.ratios.steer_ratio = 7.0 / 150.0;
        assert!(matches!(
            check_feetech_limits(&config),
            Err(BuildError::SteerRatio(_))
        ));
    }

    #[test]
    fn test_speed_beyond_servo_rate_rejected() {
        let mut config = DriveConfig::default();
        config.ratios.drive_ratio = 1.0 / 6.75;
        let err = check_feetech_limits(&config).unwrap_err();
        match err {
            BuildError::SpeedLimit { requested, limit } => {
                assert_eq!(requested, config.max_linear_speed);
                assert!(limit < 0.4);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_saturated_mixed_command_keeps_ratios_in_registers() {
        // Translate and spin well past every limit
        let config = DriveConfig::default();
        let (mut drive, _plant) = build_sim_drive(&config).unwrap();
        drive.drive(
            &DriveCommand::new(10.0, 4.0, 50.0).in_frame(DriveMode::RobotCentric),
            0.02,
        );

        let states = drive.commanded_states().to_vec();
        let registers: Vec<i16> = states
            .iter()
            .map(|s| goal_velocity(config.ratios.drive_motor_velocity(s.speed)))
            .collect();

        let fastest = states.iter().map(|s| s.speed.abs()).fold(0.0, f64::max);
        let fastest_register = registers.iter().map(|r| r.unsigned_abs()).max().unwrap_or(0);
        assert!(fastest_register < i16::MAX as u16);

        // Register values stay proportional to the desaturated wheel speeds
        for (state, register) in states.iter().zip(&registers) {
            assert_relative_eq!(
                *register as f64 / fastest_register as f64,
                state.speed / fastest,
                epsilon = 1e-3
            );
        }
    }
}
