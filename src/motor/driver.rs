// Motor capability interface
//
// Every motor family the drive can run on (serial-bus servos, simulation)
// implements `EncodedMotor`, so module control never names a vendor type.
// All angles are radians and all rates radians/second at the motor shaft.

use serde::{Deserialize, Serialize};

use super::feetech::FeetechError;

/// Closed-loop gains handed to the motor's onboard controller
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PidGains {
    pub p: f64,
    pub i: f64,
    pub d: f64,
}

impl PidGains {
    pub fn new(p: f64, i: f64, d: f64) -> Self {
        Self { p, i, d }
    }
}

/// Which setpoint the motor's onboard loop tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlMode {
    Position,
    Velocity,
}

/// Per-motor setup applied once when a module is built
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotorSettings {
    pub inverted: bool,
    /// Amps
    pub current_limit: f64,
    pub pid: PidGains,
}

impl Default for MotorSettings {
    fn default() -> Self {
        Self {
            inverted: false,
            current_limit: 3.0,
            pid: PidGains::new(32.0, 0.0, 32.0),
        }
    }
}

/// Error types for motor access, independent of the hardware family
#[derive(Debug, thiserror::Error)]
pub enum MotorError {
    #[error("Feetech bus error: {0}")]
    Feetech(#[from] FeetechError),

    #[error("Motor bus lock poisoned")]
    BusPoisoned,

    #[error("Motor {id} cannot {action} while in {mode:?} mode")]
    WrongMode {
        id: u8,
        action: &'static str,
        mode: ControlMode,
    },

    #[error("Motor {id} reported a non-finite {quantity}")]
    NonFinite { id: u8, quantity: &'static str },
}

/// A motor with an encoder: the capability set module control relies on
pub trait EncodedMotor: Send {
    /// Command the shaft to an angle (radians)
    fn set_angle(&mut self, radians: f64) -> Result<(), MotorError>;

    /// Read the shaft angle (radians), continuous across revolutions
    fn get_angle(&mut self) -> Result<f64, MotorError>;

    /// Command a shaft rate (radians/second)
    fn set_angular_velocity(&mut self, radians_per_sec: f64) -> Result<(), MotorError>;

    /// Read the shaft rate (radians/second)
    fn get_angular_velocity(&mut self) -> Result<f64, MotorError>;

    fn set_pid(&mut self, gains: PidGains) -> Result<(), MotorError>;

    /// Limit the motor current (amps)
    fn set_current_limit(&mut self, amps: f64) -> Result<(), MotorError>;

    /// Flip the sign of every command and reading
    fn set_inverted(&mut self, inverted: bool);

    /// Apply inversion, current limit and gains in one go
    fn configure(&mut self, settings: &MotorSettings) -> Result<(), MotorError> {
        self.set_inverted(settings.inverted);
        self.set_current_limit(settings.current_limit)?;
        self.set_pid(settings.pid)
    }
}
