// Simulated drivetrain plant
//
// Stands in for the physical robot: drive motors integrate their commanded
// rate into shaft position, and the gyro integrates the yaw rate implied by
// the modules' actual wheel states.

use tracing::info;

use crate::config::DriveConfig;
use crate::drivetrain::{BuildError, MotorPair, build_drive};
use crate::motor::{SimMotor, SimMotorHandle};
use crate::sensor::SimGyro;
use crate::swerve::{ModuleRatios, ModuleState, SwerveDrive, SwerveKinematics};

struct SimModule {
    drive: SimMotorHandle,
    steer: SimMotorHandle,
    // Physical shaft direction relative to the module frame
    drive_sign: f64,
    steer_sign: f64,
}

pub struct SimPlant {
    modules: Vec<SimModule>,
    gyro: SimGyro,
    kinematics: SwerveKinematics,
    ratios: ModuleRatios,
}

impl SimPlant {
    pub fn gyro(&self) -> &SimGyro {
        &self.gyro
    }

    /// Wheel states as they physically are
    pub fn module_states(&self) -> Vec<ModuleState> {
        self.modules
            .iter()
            .map(|m| {
                ModuleState::new(
                    self.ratios.wheel_speed(m.drive.velocity() * m.drive_sign),
                    self.ratios.module_angle(m.steer.angle() * m.steer_sign),
                )
            })
            .collect()
    }

    /// Advance the plant by `dt` seconds
    pub fn step(&self, dt: f64) {
        let chassis = self.kinematics.to_chassis_velocity(&self.module_states());
        for module in &self.modules {
            module.drive.step(dt);
            module.steer.step(dt);
        }
        self.gyro.rotate(chassis.omega * dt);
    }
}

/// Build a drive on simulated motors plus the plant that moves them
pub fn build_sim_drive(config: &DriveConfig) -> Result<(SwerveDrive, SimPlant), BuildError> {
    let gyro = SimGyro::new();
    let mut motors: Vec<MotorPair> = Vec::with_capacity(config.modules.len());
    let mut modules = Vec::with_capacity(config.modules.len());

    for module in &config.modules {
        let (drive, steer) = (SimMotor::new(), SimMotor::new());
        modules.push(SimModule {
            drive: drive.handle(),
            steer: steer.handle(),
            drive_sign: if module.drive.inverted { -1.0 } else { 1.0 },
            steer_sign: if module.steer.inverted { -1.0 } else { 1.0 },
        });
        motors.push((Box::new(drive), Box::new(steer)));
    }

    let drive = build_drive(config, motors, Box::new(gyro.clone()))?;
    let plant = SimPlant {
        modules,
        gyro,
        kinematics: drive.kinematics().clone(),
        ratios: config.ratios,
    };
    info!("Simulated drivetrain with {} modules", plant.modules.len());
    Ok((drive, plant))
}
