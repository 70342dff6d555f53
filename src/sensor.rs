// Heading sources for the drive
//
// A heading sample is the robot's yaw in radians, CCW positive, and keeps
// counting past ±π instead of wrapping.

use std::sync::{Arc, Mutex};

#[derive(Debug, thiserror::Error)]
pub enum SensorError {
    #[error("No heading sample received yet")]
    NoSample,

    #[error("Heading sample lock poisoned")]
    Poisoned,
}

pub trait HeadingSensor: Send {
    fn get_heading(&mut self) -> Result<f64, SensorError>;
}

/// Heading fed from outside the drive, e.g. an IMU publishing over the network.
/// Clones share the same latest sample.
#[derive(Debug, Clone, Default)]
pub struct SharedHeading {
    latest: Arc<Mutex<Option<f64>>>,
}

impl SharedHeading {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a new sample; non-finite samples are dropped
    pub fn publish(&self, heading: f64) {
        if !heading.is_finite() {
            return;
        }
        if let Ok(mut latest) = self.latest.lock() {
            *latest = Some(heading);
        }
    }
}

impl HeadingSensor for SharedHeading {
    fn get_heading(&mut self) -> Result<f64, SensorError> {
        let latest = self.latest.lock().map_err(|_| SensorError::Poisoned)?;
        latest.ok_or(SensorError::NoSample)
    }
}

/// Simulated gyro; the plant integrates the robot's yaw rate into it
#[derive(Debug, Clone, Default)]
pub struct SimGyro {
    heading: Arc<Mutex<f64>>,
}

impl SimGyro {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rotate(&self, radians: f64) {
        if let Ok(mut heading) = self.heading.lock() {
            *heading += radians;
        }
    }
}

impl HeadingSensor for SimGyro {
    fn get_heading(&mut self) -> Result<f64, SensorError> {
        self.heading
            .lock()
            .map(|h| *h)
            .map_err(|_| SensorError::Poisoned)
    }
}
