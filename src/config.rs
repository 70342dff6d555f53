// Timeouts, topics, drivetrain geometry, motor configuration
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::motor::MotorSettings;
use crate::swerve::{DriveSettings, EstimatorConfig, ModuleRatios};

// Runtime loop frequency
pub const LOOP_HZ: u64 = 50;

// Command timeout for watchdog
pub const CMD_TIMEOUT: Duration = Duration::from_millis(250);

// Zenoh topics
pub const TOPIC_CMD_DRIVE: &str = "swerve/cmd/drive"; // motion commands
pub const TOPIC_CMD_CONTROL: &str = "swerve/cmd/control"; // mode/reset requests
pub const TOPIC_SENSOR_VISION: &str = "swerve/sensor/vision"; // vision pose fixes
pub const TOPIC_SENSOR_HEADING: &str = "swerve/sensor/heading"; // IMU yaw
pub const TOPIC_RT_MODULES: &str = "swerve/rt/modules"; // actuation
pub const TOPIC_STATE_POSE: &str = "swerve/state/pose"; // telemetry
pub const TOPIC_HEALTH: &str = "swerve/state/health"; // health status

// Motor configuration
// Serial port for Feetech motor controller
pub const MOTOR_PORT: &str = "/dev/ttyACM0";

// Enable hardware motor control (set to false for simulation/testing)
pub const MOTOR_ENABLED: bool = true;

// Drivetrain
// Wheel and steering servos drive the module directly; the wheel speed limit
// sits just under what the servo's velocity register can express.
pub const MAX_LINEAR_SPEED: f64 = 2.5; // m/s
pub const MAX_ANGULAR_SPEED: f64 = std::f64::consts::TAU; // rad/s
pub const SLOW_SPEED_SCALE: f64 = 0.25;
pub const DRIVE_RATIO: f64 = 1.0; // wheel turns per motor turn
pub const STEER_RATIO: f64 = 1.0; // module turns per steer motor turn
pub const WHEEL_DIAMETER: f64 = 0.1016; // m
pub const MODULE_OFFSET: f64 = 0.3; // m, from chassis centre along each axis

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// One swerve module's placement and motors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleConfig {
    pub name: String,
    /// Metres from the chassis centre, x forward, y left
    pub translation: [f64; 2],
    pub drive_id: u8,
    pub steer_id: u8,
    #[serde(default)]
    pub drive: MotorSettings,
    #[serde(default)]
    pub steer: MotorSettings,
}

impl ModuleConfig {
    fn new(name: &str, x: f64, y: f64, drive_id: u8, steer_id: u8) -> Self {
        Self {
            name: name.to_string(),
            translation: [x, y],
            drive_id,
            steer_id,
            drive: MotorSettings::default(),
            steer: MotorSettings::default(),
        }
    }
}

/// Everything the runtime needs to build and run the drivetrain.
/// Any field missing from a config file takes its default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveConfig {
    pub loop_hz: u64,
    pub cmd_timeout_ms: u64,
    pub max_linear_speed: f64,
    pub max_angular_speed: f64,
    pub slow_speed_scale: f64,
    pub ratios: ModuleRatios,
    pub modules: Vec<ModuleConfig>,
    pub estimator: EstimatorConfig,
    pub motor_port: String,
    pub motor_enabled: bool,
}

impl Default for DriveConfig {
    fn default() -> Self {
        let d = MODULE_OFFSET;
        Self {
            loop_hz: LOOP_HZ,
            cmd_timeout_ms: CMD_TIMEOUT.as_millis() as u64,
            max_linear_speed: MAX_LINEAR_SPEED,
            max_angular_speed: MAX_ANGULAR_SPEED,
            slow_speed_scale: SLOW_SPEED_SCALE,
            ratios: ModuleRatios {
                drive_ratio: DRIVE_RATIO,
                steer_ratio: STEER_RATIO,
                wheel_diameter: WHEEL_DIAMETER,
            },
            modules: vec![
                ModuleConfig::new("front_left", d, d, 1, 2),
                ModuleConfig::new("front_right", d, -d, 3, 4),
                ModuleConfig::new("back_left", -d, d, 5, 6),
                ModuleConfig::new("back_right", -d, -d, 7, 8),
            ],
            estimator: EstimatorConfig::default(),
            motor_port: MOTOR_PORT.to_string(),
            motor_enabled: MOTOR_ENABLED,
        }
    }
}

impl DriveConfig {
    /// Load a JSON config file and check it
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: DriveConfig = serde_json::from_str(&text)?;
        config.validate()?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.loop_hz == 0 || self.loop_hz > 1000 {
            return Err(ConfigError::Invalid(format!("loop_hz {} out of range", self.loop_hz)));
        }
        if !(self.max_linear_speed.is_finite() && self.max_linear_speed > 0.0) {
            return Err(ConfigError::Invalid("max_linear_speed must be positive".into()));
        }
        if !(self.max_angular_speed.is_finite() && self.max_angular_speed > 0.0) {
            return Err(ConfigError::Invalid("max_angular_speed must be positive".into()));
        }
        if !(self.slow_speed_scale > 0.0 && self.slow_speed_scale <= 1.0) {
            return Err(ConfigError::Invalid("slow_speed_scale must be in (0, 1]".into()));
        }
        let ratios = [
            self.ratios.drive_ratio,
            self.ratios.steer_ratio,
            self.ratios.wheel_diameter,
        ];
        if ratios.iter().any(|r| !(r.is_finite() && *r > 0.0)) {
            return Err(ConfigError::Invalid("module ratios must be positive".into()));
        }
        if self.modules.len() < 2 {
            return Err(ConfigError::Invalid(format!(
                "need at least 2 modules, got {}",
                self.modules.len()
            )));
        }

        let mut ids: Vec<u8> = self
            .modules
            .iter()
            .flat_map(|m| [m.drive_id, m.steer_id])
            .collect();
        ids.sort_unstable();
        if ids.windows(2).any(|w| w[0] == w[1]) {
            return Err(ConfigError::Invalid("motor ids must be unique".into()));
        }
        Ok(())
    }

    pub fn loop_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.loop_hz as f64)
    }

    pub fn cmd_timeout(&self) -> Duration {
        Duration::from_millis(self.cmd_timeout_ms)
    }

    pub fn drive_settings(&self) -> DriveSettings {
        DriveSettings {
            max_linear_speed: self.max_linear_speed,
            max_angular_speed: self.max_angular_speed,
            slow_speed_scale: self.slow_speed_scale,
            nominal_dt: self.loop_period().as_secs_f64(),
        }
    }
}
