// Message types exchanged with the runtime's collaborators (JSON over zenoh)

use serde::{Deserialize, Serialize};

use crate::geometry::Pose2d;
use crate::swerve::{ChassisVelocity, DriveMode, ModuleState, SpeedScale};

// Command from teleop/autonomous -> runtime
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DriveCommand {
    /// m/s, forward
    pub vx: f64,
    /// m/s, left
    pub vy: f64,
    /// rad/s, CCW
    pub omega: f64,
    /// Frame for this command only; the drive's current mode when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame: Option<DriveMode>,
}

impl DriveCommand {
    pub fn new(vx: f64, vy: f64, omega: f64) -> Self {
        Self {
            vx,
            vy,
            omega,
            frame: None,
        }
    }

    pub fn in_frame(mut self, frame: DriveMode) -> Self {
        self.frame = Some(frame);
        self
    }
}

impl From<&DriveCommand> for ChassisVelocity {
    fn from(cmd: &DriveCommand) -> Self {
        ChassisVelocity::new(cmd.vx, cmd.vy, cmd.omega)
    }
}

/// Requests that change drive state rather than motion
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    SetDriveMode { mode: DriveMode },
    ToggleDriveMode,
    SetSpeedScale { scale: SpeedScale },
    /// Field-centric zero relative to the robot's current facing, radians CCW
    ResetHeading {
        #[serde(default)]
        offset: f64,
    },
    ResetPose { pose: Pose2d },
    ZeroModules,
}

/// Heading from an external IMU, radians CCW, not wrapped
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeadingSample {
    pub heading: f64,
}

/// Robot pose estimated by the vision system
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VisionSample {
    pub pose: Pose2d,
    /// Capture time in seconds on the runtime clock (see `DriveTelemetry::timestamp`)
    pub timestamp: f64,
    pub valid: bool,
}

// Actuation output from runtime -> hardware monitors
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ModuleActuation {
    pub modules: Vec<ModuleState>,
}

/// Drive state published every cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriveTelemetry {
    /// Seconds since the runtime started
    pub timestamp: f64,
    /// Vision-corrected pose
    pub pose: Pose2d,
    /// Wheel odometry only
    pub odometry_pose: Pose2d,
    /// Robot heading relative to the field-centric zero, radians
    pub heading: f64,
    /// Measured chassis velocity, robot frame
    pub chassis: ChassisVelocity,
    /// Measured module states
    pub modules: Vec<ModuleState>,
    pub mode: DriveMode,
    pub speed_scale: SpeedScale,
}

/// Health status published by runtime
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeHealth {
    Ok,
    CmdStale,
    MotorFault,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drive_command_frame_is_optional() {
        let cmd: DriveCommand = serde_json::from_str(r#"{"vx":1.0,"vy":0.5,"omega":-0.2}"#).unwrap();
        assert_eq!(cmd, DriveCommand::new(1.0, 0.5, -0.2));

        let cmd: DriveCommand =
            serde_json::from_str(r#"{"vx":0,"vy":0,"omega":0,"frame":"robot_centric"}"#).unwrap();
        assert_eq!(cmd.frame, Some(DriveMode::RobotCentric));
    }

    #[test]
    fn test_control_request_wire_format() {
        let req: ControlRequest = serde_json::from_str(r#"{"type":"reset_heading"}"#).unwrap();
        assert_eq!(req, ControlRequest::ResetHeading { offset: 0.0 });

        let req: ControlRequest =
            serde_json::from_str(r#"{"type":"set_speed_scale","scale":"slow"}"#).unwrap();
        assert_eq!(req, ControlRequest::SetSpeedScale { scale: SpeedScale::Slow });

        let json = serde_json::to_string(&ControlRequest::ZeroModules).unwrap();
        assert_eq!(json, r#"{"type":"zero_modules"}"#);
    }

    #[test]
    fn test_health_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&RuntimeHealth::CmdStale).unwrap(), r#""cmd_stale""#);
    }
}
