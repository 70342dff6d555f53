// Feetech STS-series serial bus servos
//
// Wire format (Dynamixel Protocol 1.0 style):
// [0xFF, 0xFF, ID, Length, Instruction, Params..., Checksum]
// where Length counts instruction + params + checksum and the checksum is the
// inverted low byte of the sum of everything after the header.
//
// `FeetechBus` speaks the protocol; `FeetechMotor` puts one servo on a shared
// bus behind the `EncodedMotor` capability interface.

use std::f64::consts::TAU;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serialport::SerialPort;
use tracing::{debug, info, warn};

use super::driver::{ControlMode, EncodedMotor, MotorError, PidGains};

/// Default serial configuration for Feetech servos
pub const DEFAULT_BAUDRATE: u32 = 1_000_000;
pub const DEFAULT_TIMEOUT_MS: u64 = 100;

/// Encoder resolution: 4096 steps per shaft revolution
pub const STEPS_PER_REVOLUTION: i64 = 4096;
const STEPS_PER_RADIAN: f64 = STEPS_PER_REVOLUTION as f64 / TAU;

/// Fastest rate the velocity register can express, radians/second
pub const MAX_ANGULAR_VELOCITY: f64 = i16::MAX as f64 / STEPS_PER_RADIAN;

/// Protection current register unit, milliamps
const CURRENT_UNIT_MA: f64 = 6.5;

const HEADER: [u8; 2] = [0xFF, 0xFF];

#[repr(u8)]
#[derive(Debug, Clone, Copy)]
pub enum Instruction {
    Ping = 0x01,
    Read = 0x02,
    Write = 0x03,
}

/// Register addresses used by the drive
#[repr(u8)]
#[derive(Debug, Clone, Copy)]
pub enum Register {
    // EEPROM area, writes need the lock released
    PidP = 21,
    PidD = 22,
    PidI = 23,
    ProtectionCurrent = 28, // 2 bytes

    // RAM area
    OperatingMode = 33,   // 0=position, 1=velocity
    TorqueEnable = 40,    // 0=off, 1=on
    GoalPosition = 42,    // 2 bytes
    GoalVelocity = 46,    // 2 bytes, sign-magnitude
    Lock = 55,            // 0=EEPROM writable, 1=locked
    PresentPosition = 56, // 2 bytes, 0..4095
    PresentVelocity = 58, // 2 bytes, sign-magnitude
}

impl From<ControlMode> for u8 {
    fn from(mode: ControlMode) -> Self {
        match mode {
            ControlMode::Position => 0,
            ControlMode::Velocity => 1,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FeetechError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid response from servo {id}: {reason}")]
    InvalidResponse { id: u8, reason: String },

    #[error("Checksum mismatch for servo {id}")]
    ChecksumMismatch { id: u8 },

    #[error("Servo {id} returned error status: 0x{status:02X}")]
    ServoError { id: u8, status: u8 },

    #[error("Timeout waiting for response from servo {id}")]
    Timeout { id: u8 },
}

pub type Result<T> = std::result::Result<T, FeetechError>;

/// Serial connection to a chain of Feetech servos
pub struct FeetechBus {
    port: Box<dyn SerialPort>,
}

/// A bus shared by every servo on the same serial line
pub type SharedBus = Arc<Mutex<FeetechBus>>;

impl FeetechBus {
    pub fn open(port_name: &str) -> Result<Self> {
        Self::open_with_baudrate(port_name, DEFAULT_BAUDRATE)
    }

    pub fn open_with_baudrate(port_name: &str, baudrate: u32) -> Result<Self> {
        info!("Opening servo bus on {} at {} baud", port_name, baudrate);
        let port = serialport::new(port_name, baudrate)
            .timeout(Duration::from_millis(DEFAULT_TIMEOUT_MS))
            .open()?;
        Ok(Self { port })
    }

    pub fn shared(self) -> SharedBus {
        Arc::new(Mutex::new(self))
    }

    fn checksum(bytes: &[u8]) -> u8 {
        let sum = bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
        !sum
    }

    fn encode_packet(id: u8, instruction: Instruction, params: &[u8]) -> Vec<u8> {
        let mut packet = Vec::with_capacity(HEADER.len() + 4 + params.len());
        packet.extend_from_slice(&HEADER);
        packet.extend_from_slice(&[id, (params.len() + 2) as u8, instruction as u8]);
        packet.extend_from_slice(params);
        packet.push(Self::checksum(&packet[HEADER.len()..]));
        packet
    }

    fn send(&mut self, id: u8, instruction: Instruction, params: &[u8]) -> Result<()> {
        let packet = Self::encode_packet(id, instruction, params);
        self.port.write_all(&packet)?;
        self.port.flush()?;
        Ok(())
    }

    /// Read one status packet and return its parameter bytes
    fn receive(&mut self, expected_id: u8) -> Result<Vec<u8>> {
        let timed_out = |e: std::io::Error| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                FeetechError::Timeout { id: expected_id }
            } else {
                FeetechError::Io(e)
            }
        };

        // header (2) + id (1) + length (1)
        let mut preamble = [0u8; 4];
        self.port.read_exact(&mut preamble).map_err(timed_out)?;

        if preamble[..2] != HEADER {
            return Err(FeetechError::InvalidResponse {
                id: expected_id,
                reason: format!("Invalid header: {:02X?}", &preamble[..2]),
            });
        }
        let id = preamble[2];
        if id != expected_id {
            return Err(FeetechError::InvalidResponse {
                id: expected_id,
                reason: format!("ID mismatch: expected {}, got {}", expected_id, id),
            });
        }

        let length = preamble[3] as usize;
        if length < 2 {
            return Err(FeetechError::InvalidResponse {
                id,
                reason: format!("Length {} too short for a status packet", length),
            });
        }

        // status byte + params + checksum
        let mut body = vec![0u8; length];
        self.port.read_exact(&mut body).map_err(timed_out)?;

        let (payload, checksum) = body.split_at(length - 1);
        let mut summed = vec![id, preamble[3]];
        summed.extend_from_slice(payload);
        if Self::checksum(&summed) != checksum[0] {
            return Err(FeetechError::ChecksumMismatch { id });
        }

        if payload[0] != 0 {
            return Err(FeetechError::ServoError {
                id,
                status: payload[0],
            });
        }

        Ok(payload[1..].to_vec())
    }

    /// Check whether a servo answers on the bus
    pub fn ping(&mut self, id: u8) -> Result<bool> {
        self.send(id, Instruction::Ping, &[])?;
        match self.receive(id) {
            Ok(_) => Ok(true),
            Err(FeetechError::Timeout { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn write_bytes(&mut self, id: u8, register: Register, bytes: &[u8]) -> Result<()> {
        let mut params = Vec::with_capacity(bytes.len() + 1);
        params.push(register as u8);
        params.extend_from_slice(bytes);
        debug!("Write to servo {}: reg={:?}, bytes={:02X?}", id, register, bytes);
        self.send(id, Instruction::Write, &params)?;
        self.receive(id).map(|_| ())
    }

    fn read_bytes(&mut self, id: u8, register: Register, count: u8) -> Result<Vec<u8>> {
        self.send(id, Instruction::Read, &[register as u8, count])?;
        let data = self.receive(id)?;
        if data.len() < count as usize {
            return Err(FeetechError::InvalidResponse {
                id,
                reason: format!("Expected {} bytes, got {}", count, data.len()),
            });
        }
        Ok(data)
    }

    pub fn write_u8(&mut self, id: u8, register: Register, value: u8) -> Result<()> {
        self.write_bytes(id, register, &[value])
    }

    pub fn write_u16(&mut self, id: u8, register: Register, value: u16) -> Result<()> {
        self.write_bytes(id, register, &value.to_le_bytes())
    }

    pub fn write_i16(&mut self, id: u8, register: Register, value: i16) -> Result<()> {
        self.write_u16(id, register, encode_sign_magnitude(value))
    }

    pub fn read_u16(&mut self, id: u8, register: Register) -> Result<u16> {
        let data = self.read_bytes(id, register, 2)?;
        Ok(u16::from_le_bytes([data[0], data[1]]))
    }

    pub fn read_i16(&mut self, id: u8, register: Register) -> Result<i16> {
        Ok(decode_sign_magnitude(self.read_u16(id, register)?))
    }

    pub fn set_torque(&mut self, id: u8, enabled: bool) -> Result<()> {
        self.write_u8(id, Register::TorqueEnable, enabled as u8)?;
        self.write_u8(id, Register::Lock, enabled as u8)
    }

    /// Run `writes` with the EEPROM lock released, re-locking afterwards
    pub fn with_eeprom_unlocked<T>(
        &mut self,
        id: u8,
        writes: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        self.write_u8(id, Register::Lock, 0)?;
        let result = writes(self);
        self.write_u8(id, Register::Lock, 1)?;
        result
    }
}

/// Bit 15 = sign (1 = negative), bits 0-14 = magnitude
fn encode_sign_magnitude(value: i16) -> u16 {
    let magnitude = value.unsigned_abs().min(0x7FFF);
    if value < 0 { 0x8000 | magnitude } else { magnitude }
}

fn decode_sign_magnitude(raw: u16) -> i16 {
    let magnitude = (raw & 0x7FFF) as i16;
    if raw & 0x8000 != 0 { -magnitude } else { magnitude }
}

fn radians_to_steps(radians: f64) -> i64 {
    (radians * STEPS_PER_RADIAN).round() as i64
}

fn steps_to_radians(steps: i64) -> f64 {
    steps as f64 / STEPS_PER_RADIAN
}

fn clamp_i16(value: i64) -> i16 {
    value.clamp(i16::MIN as i64 + 1, i16::MAX as i64) as i16
}

/// Goal position register value for a shaft angle
///
/// Position mode is single-turn: the register holds 0..4095, so the angle is
/// folded into one revolution. Only a shaft that maps 1:1 onto the output it
/// positions keeps its meaning through the fold.
pub fn goal_position(radians: f64) -> u16 {
    radians_to_steps(radians).rem_euclid(STEPS_PER_REVOLUTION) as u16
}

/// Goal velocity register value for a shaft rate, saturating at
/// `MAX_ANGULAR_VELOCITY`
pub fn goal_velocity(radians_per_sec: f64) -> i16 {
    clamp_i16(radians_to_steps(radians_per_sec))
}

/// Turns the servo's single-revolution position register into a continuous
/// step count by watching for wrap-arounds between reads.
#[derive(Debug, Clone, Default)]
pub struct PositionTracker {
    last_raw: Option<u16>,
    steps: i64,
}

impl PositionTracker {
    /// Feed a raw 0..4095 reading; returns the continuous step count
    pub fn update(&mut self, raw: u16) -> i64 {
        let raw = raw as i64 % STEPS_PER_REVOLUTION;
        match self.last_raw {
            None => self.steps = raw,
            Some(last) => {
                let half = STEPS_PER_REVOLUTION / 2;
                let mut delta = raw - last as i64;
                if delta > half {
                    delta -= STEPS_PER_REVOLUTION;
                } else if delta < -half {
                    delta += STEPS_PER_REVOLUTION;
                }
                self.steps += delta;
            }
        }
        self.last_raw = Some(raw as u16);
        self.steps
    }
}

/// One Feetech servo behind the `EncodedMotor` interface
pub struct FeetechMotor {
    bus: SharedBus,
    id: u8,
    mode: ControlMode,
    inverted: bool,
    tracker: PositionTracker,
}

impl FeetechMotor {
    pub fn new(bus: SharedBus, id: u8, mode: ControlMode) -> Self {
        Self {
            bus,
            id,
            mode,
            inverted: false,
            tracker: PositionTracker::default(),
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    /// Check the servo answers, then switch it into this motor's control mode
    ///
    /// Torque is disabled while the operating mode changes, as the servo
    /// requires, and re-enabled afterwards.
    pub fn initialize(&mut self) -> std::result::Result<(), MotorError> {
        let (id, mode) = (self.id, self.mode);
        info!("Initializing servo {} for {:?} control", id, mode);

        self.with_bus(|bus| {
            if !bus.ping(id)? {
                warn!("Servo {} not responding to ping", id);
                return Err(FeetechError::Timeout { id });
            }
            bus.set_torque(id, false)?;
            bus.write_u8(id, Register::OperatingMode, mode.into())?;
            bus.set_torque(id, true)
        })
    }

    fn with_bus<T>(
        &self,
        f: impl FnOnce(&mut FeetechBus) -> Result<T>,
    ) -> std::result::Result<T, MotorError> {
        let mut bus = self.bus.lock().map_err(|_| MotorError::BusPoisoned)?;
        Ok(f(&mut bus)?)
    }

    fn direction(&self) -> f64 {
        if self.inverted { -1.0 } else { 1.0 }
    }

    fn require_mode(&self, mode: ControlMode, action: &'static str) -> std::result::Result<(), MotorError> {
        if self.mode == mode {
            Ok(())
        } else {
            Err(MotorError::WrongMode {
                id: self.id,
                action,
                mode: self.mode,
            })
        }
    }
}

impl EncodedMotor for FeetechMotor {
    fn set_angle(&mut self, radians: f64) -> std::result::Result<(), MotorError> {
        self.require_mode(ControlMode::Position, "set an angle")?;
        let goal = goal_position(radians * self.direction());
        let id = self.id;
        self.with_bus(|bus| bus.write_u16(id, Register::GoalPosition, goal))
    }

    fn get_angle(&mut self) -> std::result::Result<f64, MotorError> {
        let id = self.id;
        let raw = self.with_bus(|bus| bus.read_u16(id, Register::PresentPosition))?;
        let steps = self.tracker.update(raw);
        Ok(steps_to_radians(steps) * self.direction())
    }

    fn set_angular_velocity(&mut self, radians_per_sec: f64) -> std::result::Result<(), MotorError> {
        self.require_mode(ControlMode::Velocity, "set a velocity")?;
        if !radians_per_sec.is_finite() {
            return Err(MotorError::NonFinite {
                id: self.id,
                quantity: "velocity command",
            });
        }
        if radians_per_sec.abs() > MAX_ANGULAR_VELOCITY {
            warn!(
                "Servo {}: {:.1} rad/s exceeds the {:.1} rad/s register limit",
                self.id, radians_per_sec, MAX_ANGULAR_VELOCITY
            );
        }
        let steps_per_sec = goal_velocity(radians_per_sec * self.direction());
        let id = self.id;
        self.with_bus(|bus| bus.write_i16(id, Register::GoalVelocity, steps_per_sec))
    }

    fn get_angular_velocity(&mut self) -> std::result::Result<f64, MotorError> {
        let id = self.id;
        let steps_per_sec = self.with_bus(|bus| bus.read_i16(id, Register::PresentVelocity))?;
        Ok(steps_to_radians(steps_per_sec as i64) * self.direction())
    }

    fn set_pid(&mut self, gains: PidGains) -> std::result::Result<(), MotorError> {
        let to_raw = |gain: f64| gain.round().clamp(0.0, 254.0) as u8;
        let (p, i, d) = (to_raw(gains.p), to_raw(gains.i), to_raw(gains.d));
        let id = self.id;
        debug!("Servo {} gains: P={} I={} D={}", id, p, i, d);

        self.with_bus(|bus| {
            bus.with_eeprom_unlocked(id, |bus| {
                bus.write_u8(id, Register::PidP, p)?;
                bus.write_u8(id, Register::PidI, i)?;
                bus.write_u8(id, Register::PidD, d)
            })
        })
    }

    fn set_current_limit(&mut self, amps: f64) -> std::result::Result<(), MotorError> {
        let raw = (amps.max(0.0) * 1000.0 / CURRENT_UNIT_MA)
            .round()
            .min(u16::MAX as f64) as u16;
        let id = self.id;
        self.with_bus(|bus| {
            bus.with_eeprom_unlocked(id, |bus| bus.write_u16(id, Register::ProtectionCurrent, raw))
        })
    }

    fn set_inverted(&mut self, inverted: bool) {
        self.inverted = inverted;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum() {
        // ID=1, Length=4, Instruction=WRITE, Addr=30, Data=0, 2
        let data = [1u8, 4, 0x03, 30, 0, 2];
        // ~(1+4+3+30+0+2) = ~40 = 215
        assert_eq!(FeetechBus::checksum(&data), 215);
    }

    #[test]
    fn test_checksum_wraps_past_one_byte() {
        let data = [0xFE, 0x80, 0x83];
        // (0xFE + 0x80 + 0x83) & 0xFF = 0x01
        assert_eq!(FeetechBus::checksum(&data), !0x01u8);
    }

    #[test]
    fn test_encode_ping_packet() {
        let packet = FeetechBus::encode_packet(1, Instruction::Ping, &[]);
        assert_eq!(packet, vec![0xFF, 0xFF, 1, 2, 0x01, !(1u8 + 2 + 1)]);
    }

    #[test]
    fn test_encode_write_packet() {
        let packet = FeetechBus::encode_packet(3, Instruction::Write, &[Register::GoalVelocity as u8, 0x10, 0x80]);
        assert_eq!(packet.len(), 9);
        assert_eq!(packet[3], 5); // params (3) + instruction + checksum
        assert_eq!(packet[5], 46);
    }

    #[test]
    fn test_sign_magnitude_encoding() {
        assert_eq!(encode_sign_magnitude(0), 0);
        assert_eq!(encode_sign_magnitude(100), 100);
        assert_eq!(encode_sign_magnitude(-100), 0x8064);
        assert_eq!(encode_sign_magnitude(-1), 0x8001);
        assert_eq!(encode_sign_magnitude(i16::MIN), 0xFFFF);

        assert_eq!(decode_sign_magnitude(0), 0);
        assert_eq!(decode_sign_magnitude(100), 100);
        assert_eq!(decode_sign_magnitude(0x8064), -100);
        assert_eq!(decode_sign_magnitude(0x8001), -1);
    }

    #[test]
    fn test_position_tracker_unwraps_forward_and_back() {
        let mut tracker = PositionTracker::default();
        assert_eq!(tracker.update(4000), 4000);
        // Crossing the top of the register going forward
        assert_eq!(tracker.update(100), 4196);
        assert_eq!(tracker.update(2000), 6096);
        // And back down through zero
        assert_eq!(tracker.update(10), 4106);
        assert_eq!(tracker.update(4090), 4090);
    }

    #[test]
    fn test_goal_position_round_trips_through_tracker() {
        for degrees in (-720..=720).step_by(15) {
            let angle = (degrees as f64).to_radians();
            let mut tracker = PositionTracker::default();
            let read_back = steps_to_radians(tracker.update(goal_position(angle)));

            let error = crate::geometry::wrap_angle(read_back - angle);
            assert!(
                error.abs() <= 0.5 / STEPS_PER_RADIAN + 1e-12,
                "{} deg read back as {} rad",
                degrees,
                read_back
            );
        }
    }

    #[test]
    fn test_goal_velocity_saturates_at_register_limit() {
        assert_eq!(goal_velocity(TAU), 4096);
        assert_eq!(goal_velocity(-TAU), -4096);
        assert_eq!(goal_velocity(MAX_ANGULAR_VELOCITY), i16::MAX);
        assert_eq!(goal_velocity(10.0 * MAX_ANGULAR_VELOCITY), i16::MAX);
        assert_eq!(goal_velocity(-10.0 * MAX_ANGULAR_VELOCITY), -i16::MAX);
    }

    #[test]
    fn test_step_conversion() {
        assert_eq!(radians_to_steps(TAU), 4096);
        assert_eq!(radians_to_steps(-TAU / 4.0), -1024);
        assert!((steps_to_radians(2048) - std::f64::consts::PI).abs() < 1e-12);
        assert_eq!(clamp_i16(1_000_000), i16::MAX);
        assert_eq!(clamp_i16(-1_000_000), -i16::MAX);
    }
}
