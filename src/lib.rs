pub mod config;
pub mod drivetrain;
pub mod geometry;
pub mod messages;
pub mod motor;
pub mod runtime;
pub mod sensor;
pub mod sim;
pub mod swerve;
