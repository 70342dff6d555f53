// Simulated motor for running the drive without hardware
//
// Position commands settle instantly; velocity commands are integrated into
// the shaft angle whenever the owner of a `SimMotorHandle` steps time forward.

use std::sync::{Arc, Mutex};

use super::driver::{ControlMode, EncodedMotor, MotorError, PidGains};

#[derive(Debug, Clone)]
struct SimMotorState {
    angle: f64,
    velocity: f64,
    mode: ControlMode,
    pid: PidGains,
    current_limit: f64,
}

impl Default for SimMotorState {
    fn default() -> Self {
        Self {
            angle: 0.0,
            velocity: 0.0,
            mode: ControlMode::Velocity,
            pid: PidGains::default(),
            current_limit: 0.0,
        }
    }
}

/// Motor side of a simulated shaft
pub struct SimMotor {
    state: Arc<Mutex<SimMotorState>>,
    inverted: bool,
}

/// Plant side of a simulated shaft: steps time and inspects the physical state
#[derive(Clone)]
pub struct SimMotorHandle {
    state: Arc<Mutex<SimMotorState>>,
}

impl SimMotor {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimMotorState::default())),
            inverted: false,
        }
    }

    pub fn handle(&self) -> SimMotorHandle {
        SimMotorHandle {
            state: Arc::clone(&self.state),
        }
    }

    fn direction(&self) -> f64 {
        if self.inverted { -1.0 } else { 1.0 }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut SimMotorState) -> T) -> Result<T, MotorError> {
        let mut state = self.state.lock().map_err(|_| MotorError::BusPoisoned)?;
        Ok(f(&mut state))
    }
}

impl Default for SimMotor {
    fn default() -> Self {
        Self::new()
    }
}

impl SimMotorHandle {
    /// Advance the shaft by `dt` seconds at its current velocity
    pub fn step(&self, dt: f64) {
        if let Ok(mut state) = self.state.lock() {
            if state.mode == ControlMode::Velocity {
                state.angle += state.velocity * dt;
            }
        }
    }

    /// Physical shaft angle, radians
    pub fn angle(&self) -> f64 {
        self.state.lock().map(|s| s.angle).unwrap_or(0.0)
    }

    /// Physical shaft rate, radians/second
    pub fn velocity(&self) -> f64 {
        self.state
            .lock()
            .map(|s| if s.mode == ControlMode::Velocity { s.velocity } else { 0.0 })
            .unwrap_or(0.0)
    }

    /// Force the shaft to an angle, e.g. to start a test from a known pose
    pub fn set_angle(&self, radians: f64) {
        if let Ok(mut state) = self.state.lock() {
            state.angle = radians;
        }
    }

    pub fn pid(&self) -> PidGains {
        self.state.lock().map(|s| s.pid).unwrap_or_default()
    }

    pub fn current_limit(&self) -> f64 {
        self.state.lock().map(|s| s.current_limit).unwrap_or(0.0)
    }
}

impl EncodedMotor for SimMotor {
    fn set_angle(&mut self, radians: f64) -> Result<(), MotorError> {
        let target = radians * self.direction();
        self.with_state(|s| {
            s.mode = ControlMode::Position;
            s.velocity = 0.0;
            s.angle = target;
        })
    }

    fn get_angle(&mut self) -> Result<f64, MotorError> {
        let direction = self.direction();
        self.with_state(|s| s.angle * direction)
    }

    fn set_angular_velocity(&mut self, radians_per_sec: f64) -> Result<(), MotorError> {
        let target = radians_per_sec * self.direction();
        self.with_state(|s| {
            s.mode = ControlMode::Velocity;
            s.velocity = target;
        })
    }

    fn get_angular_velocity(&mut self) -> Result<f64, MotorError> {
        let direction = self.direction();
        self.with_state(|s| match s.mode {
            ControlMode::Velocity => s.velocity * direction,
            ControlMode::Position => 0.0,
        })
    }

    fn set_pid(&mut self, gains: PidGains) -> Result<(), MotorError> {
        self.with_state(|s| s.pid = gains)
    }

    fn set_current_limit(&mut self, amps: f64) -> Result<(), MotorError> {
        self.with_state(|s| s.current_limit = amps)
    }

    fn set_inverted(&mut self, inverted: bool) {
        self.inverted = inverted;
    }
}
