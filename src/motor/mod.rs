// Motor layer for the swerve base
//
// Provides:
// - The `EncodedMotor` capability interface shared by all motor families
// - Feetech STS serial-bus servos (protocol + per-servo motor)
// - A simulated motor for running without hardware

mod driver;
pub mod feetech;
pub mod sim;

pub use driver::{ControlMode, EncodedMotor, MotorError, MotorSettings, PidGains};
pub use feetech::{FeetechBus, FeetechError, FeetechMotor, SharedBus};
pub use sim::{SimMotor, SimMotorHandle};
