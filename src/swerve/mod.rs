mod drive;
mod estimator;
mod kinematics;
mod module;
mod odometry;

pub use drive::{DriveMode, DriveSettings, SpeedScale, SwerveDrive};
pub use estimator::{EstimatorConfig, PoseEstimator};
pub use kinematics::{
    ChassisVelocity, KinematicsError, MIN_MODULE_SPEED, ModulePosition, ModuleState,
    SwerveKinematics, desaturate_wheel_speeds, discretize,
};
pub use module::{ModuleRatios, SteeringCommand, SwerveModule, optimize, place_in_scope};
pub use odometry::SwerveOdometry;
