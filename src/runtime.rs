// Control loop with watchdog
// Note: a watchdog is a safety mechanism that triggers a safe action if something goes wrong
// Eg. without it if teleop crashes and stops sending commands, the robot would keep driving on the last one

use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::config::{
    ConfigError, DriveConfig, TOPIC_CMD_CONTROL, TOPIC_CMD_DRIVE, TOPIC_HEALTH, TOPIC_RT_MODULES,
    TOPIC_SENSOR_HEADING, TOPIC_SENSOR_VISION, TOPIC_STATE_POSE,
};
use crate::drivetrain::{BuildError, build_hardware};
use crate::messages::{
    ControlRequest, DriveCommand, DriveTelemetry, HeadingSample, ModuleActuation, RuntimeHealth,
    VisionSample,
};
use crate::sensor::SharedHeading;
use crate::sim::{SimPlant, build_sim_drive};
use crate::swerve::SwerveDrive;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Zenoh error: {0}")]
    Zenoh(zenoh::Error),

    #[error("Failed to build drivetrain: {0}")]
    Build(#[from] BuildError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to encode message: {0}")]
    Json(#[from] serde_json::Error),
}

// zenoh::Error is a boxed trait object, so it cannot be a `#[from]` source
impl From<zenoh::Error> for RuntimeError {
    fn from(e: zenoh::Error) -> Self {
        RuntimeError::Zenoh(e)
    }
}

/// Everything published after one control cycle
#[derive(Debug, Clone)]
pub struct CycleOutput {
    pub actuation: ModuleActuation,
    pub telemetry: DriveTelemetry,
    pub health: RuntimeHealth,
}

/// Period to discretize over: the measured one, unless it is implausible
pub fn effective_dt(measured: Duration, nominal: Duration) -> f64 {
    let (measured, nominal) = (measured.as_secs_f64(), nominal.as_secs_f64());
    if measured >= 0.5 * nominal && measured <= 2.0 * nominal {
        measured
    } else {
        nominal
    }
}

pub struct Runtime {
    drive: SwerveDrive,
    plant: Option<SimPlant>,
    heading: Option<SharedHeading>,
    latest_cmd: Option<DriveCommand>,
    cmd_received_at: Instant,
    cmd_timeout: Duration,
    period: Duration,
    started_at: Instant,
    last_cycle: Option<Instant>,
    health: RuntimeHealth,
}

impl Runtime {
    pub fn new(drive: SwerveDrive, config: &DriveConfig, now: Instant) -> Self {
        Self {
            drive,
            plant: None,
            heading: None,
            latest_cmd: None,
            cmd_received_at: now,
            cmd_timeout: config.cmd_timeout(),
            period: config.loop_period(),
            started_at: now,
            last_cycle: None,
            health: RuntimeHealth::CmdStale, // Start stale until first cmd
        }
    }

    /// Step this plant before every cycle (simulation)
    pub fn with_plant(mut self, plant: SimPlant) -> Self {
        self.plant = Some(plant);
        self
    }

    /// Feed heading samples into this handle (hardware)
    pub fn with_heading(mut self, heading: SharedHeading) -> Self {
        self.heading = Some(heading);
        self
    }

    pub fn drive(&self) -> &SwerveDrive {
        &self.drive
    }

    pub fn health(&self) -> RuntimeHealth {
        self.health
    }

    /// Process incoming motion command
    pub fn on_command(&mut self, cmd: DriveCommand, now: Instant) {
        debug!("Received command: {:?}", &cmd);
        self.latest_cmd = Some(cmd);
        self.cmd_received_at = now;
    }

    /// Process incoming mode/reset request
    pub fn on_control(&mut self, request: ControlRequest) {
        info!("Received control request: {:?}", &request);
        match request {
            ControlRequest::SetDriveMode { mode } => self.drive.set_drive_mode(mode),
            ControlRequest::ToggleDriveMode => self.drive.toggle_drive_mode(),
            ControlRequest::SetSpeedScale { scale } => self.drive.set_speed_scale(scale),
            ControlRequest::ResetHeading { offset } => self.drive.reset_heading(offset),
            ControlRequest::ResetPose { pose } => self.drive.reset_pose(pose),
            ControlRequest::ZeroModules => {
                // Hold the wheels still until the next fresh command
                self.latest_cmd = None;
                self.drive.zero_modules();
            }
        }
    }

    pub fn on_heading(&mut self, sample: HeadingSample) {
        match &self.heading {
            Some(heading) => heading.publish(sample.heading),
            None => debug!("Ignoring heading sample, drive has its own gyro"),
        }
    }

    /// One read-compute-write pass
    pub fn cycle(&mut self, now: Instant, vision: Option<&VisionSample>) -> CycleOutput {
        let measured = self
            .last_cycle
            .map_or(self.period, |last| now.saturating_duration_since(last));
        let dt = effective_dt(measured, self.period);
        self.last_cycle = Some(now);

        if let Some(plant) = &self.plant {
            plant.step(dt);
        }

        // 1. Sensors in
        let t = now.saturating_duration_since(self.started_at).as_secs_f64();
        self.drive.periodic(t, vision);

        // 2. Watchdog picks the command
        let cmd = self.watchdog(now);

        // 3. Actuate
        self.drive.drive(&cmd, dt);
        if self.drive.cycle_faults() > 0 {
            self.health = RuntimeHealth::MotorFault;
        }

        CycleOutput {
            actuation: ModuleActuation {
                modules: self.drive.commanded_states().to_vec(),
            },
            telemetry: self.drive.telemetry(t),
            health: self.health,
        }
    }

    /// Latest command while fresh, otherwise a stop
    fn watchdog(&mut self, now: Instant) -> DriveCommand {
        let cmd_age = now.saturating_duration_since(self.cmd_received_at);

        if cmd_age > self.cmd_timeout {
            // Watchdog triggered - stop the robot
            if self.health != RuntimeHealth::CmdStale && self.latest_cmd.is_some() {
                warn!("Command stale ({:?} old), stopping robot", cmd_age);
            }
            self.health = RuntimeHealth::CmdStale;
            DriveCommand::default()
        } else if let Some(cmd) = self.latest_cmd {
            self.health = RuntimeHealth::Ok;
            cmd
        } else {
            // No command since start or since modules were zeroed
            self.health = RuntimeHealth::CmdStale;
            DriveCommand::default()
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.drive.zero_modules();
    }
}

fn parse<T: DeserializeOwned>(sample: &zenoh::sample::Sample, what: &str) -> Option<T> {
    let payload = sample.payload().to_bytes();
    match serde_json::from_slice::<T>(&payload) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Failed to parse {}: {}", what, e);
            None
        }
    }
}

pub async fn run(config: DriveConfig, sim: bool) -> Result<(), RuntimeError> {
    let start = Instant::now();
    let mut runtime = if sim || !config.motor_enabled {
        info!("Motors disabled, running simulated drivetrain");
        let (drive, plant) = build_sim_drive(&config)?;
        Runtime::new(drive, &config, start).with_plant(plant)
    } else {
        let (drive, heading) = build_hardware(&config)?;
        Runtime::new(drive, &config, start).with_heading(heading)
    };

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;

    info!("Setting up publishers and subscribers...");
    let sub_drive = session.declare_subscriber(TOPIC_CMD_DRIVE).await?;
    let sub_control = session.declare_subscriber(TOPIC_CMD_CONTROL).await?;
    let sub_vision = session.declare_subscriber(TOPIC_SENSOR_VISION).await?;
    let sub_heading = session.declare_subscriber(TOPIC_SENSOR_HEADING).await?;
    let pub_actuation = session.declare_publisher(TOPIC_RT_MODULES).await?;
    let pub_pose = session.declare_publisher(TOPIC_STATE_POSE).await?;
    let pub_health = session.declare_publisher(TOPIC_HEALTH).await?;

    let mut tick = interval(config.loop_period());

    info!(
        "Runtime started: {}Hz loop, {}ms watchdog timeout",
        config.loop_hz,
        config.cmd_timeout().as_millis()
    );
    info!(
        "Subscribed to: {}, {}, {}, {}",
        TOPIC_CMD_DRIVE, TOPIC_CMD_CONTROL, TOPIC_SENSOR_VISION, TOPIC_SENSOR_HEADING
    );
    info!("Publishing to: {}, {}, {}", TOPIC_RT_MODULES, TOPIC_STATE_POSE, TOPIC_HEALTH);

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down, zeroing modules");
                break;
            }
        }
        let now = Instant::now();

        // 1. Drain all pending messages (non-blocking), keep latest
        while let Ok(Some(sample)) = sub_heading.try_recv() {
            if let Some(heading) = parse::<HeadingSample>(&sample, "heading") {
                runtime.on_heading(heading);
            }
        }
        while let Ok(Some(sample)) = sub_control.try_recv() {
            if let Some(request) = parse::<ControlRequest>(&sample, "control request") {
                runtime.on_control(request);
            }
        }
        while let Ok(Some(sample)) = sub_drive.try_recv() {
            if let Some(cmd) = parse::<DriveCommand>(&sample, "command") {
                runtime.on_command(cmd, now);
            }
        }
        let mut vision = None;
        while let Ok(Some(sample)) = sub_vision.try_recv() {
            if let Some(v) = parse::<VisionSample>(&sample, "vision sample") {
                vision = Some(v);
            }
        }

        // 2. Run the drive (includes watchdog logic)
        let output = runtime.cycle(now, vision.as_ref());

        // 3. Publish actuation, telemetry and health
        pub_actuation.put(serde_json::to_string(&output.actuation)?).await?;
        pub_pose.put(serde_json::to_string(&output.telemetry)?).await?;
        pub_health.put(serde_json::to_string(&output.health)?).await?;
    }

    drop(runtime);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Pose2d;
    use crate::swerve::{DriveMode, SpeedScale};
    use approx::assert_abs_diff_eq;

    const PERIOD: Duration = Duration::from_millis(20);

    fn sim_runtime() -> (Runtime, Instant) {
        let config = DriveConfig::default();
        let (drive, plant) = build_sim_drive(&config).unwrap();
        let start = Instant::now();
        (Runtime::new(drive, &config, start).with_plant(plant), start)
    }

    #[test]
    fn test_effective_dt_falls_back_to_nominal() {
        assert_abs_diff_eq!(effective_dt(Duration::from_millis(22), PERIOD), 0.022);
        assert_abs_diff_eq!(effective_dt(Duration::from_millis(5), PERIOD), 0.02);
        assert_abs_diff_eq!(effective_dt(Duration::from_millis(100), PERIOD), 0.02);
        assert_abs_diff_eq!(effective_dt(Duration::ZERO, PERIOD), 0.02);
    }

    #[test]
    fn test_stale_until_first_command() {
        let (mut runtime, start) = sim_runtime();
        let output = runtime.cycle(start + PERIOD, None);

        assert_eq!(output.health, RuntimeHealth::CmdStale);
        assert!(output.actuation.modules.iter().all(|m| m.speed == 0.0));
    }

    #[test]
    fn test_fresh_command_drives() {
        let (mut runtime, start) = sim_runtime();
        runtime.on_command(DriveCommand::new(1.0, 0.0, 0.0), start);

        let output = runtime.cycle(start + PERIOD, None);
        assert_eq!(output.health, RuntimeHealth::Ok);
        assert_eq!(output.actuation.modules.len(), 4);
        for module in &output.actuation.modules {
            assert_abs_diff_eq!(module.speed, 1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_watchdog_stops_robot() {
        let (mut runtime, start) = sim_runtime();
        runtime.on_command(DriveCommand::new(1.0, 0.0, 0.0), start);

        let mut now = start;
        for _ in 0..12 {
            now += PERIOD;
            assert_eq!(runtime.cycle(now, None).health, RuntimeHealth::Ok);
        }
        // 260 ms without a command
        now += PERIOD;
        let output = runtime.cycle(now, None);
        assert_eq!(output.health, RuntimeHealth::CmdStale);
        assert!(output.actuation.modules.iter().all(|m| m.speed == 0.0));
        assert!(output.telemetry.modules.iter().all(|m| m.speed == 0.0));
    }

    #[test]
    fn test_sim_pose_tracks_commanded_motion() {
        let (mut runtime, start) = sim_runtime();
        let mut now = start;
        for _ in 0..50 {
            runtime.on_command(DriveCommand::new(0.5, 0.0, 0.0), now);
            now += PERIOD;
            runtime.cycle(now, None);
        }
        // The plant integrates the previous cycle's command, so one cycle lags
        let output = runtime.cycle(now + PERIOD, None);
        assert_abs_diff_eq!(output.telemetry.pose.x, 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(output.telemetry.pose.y, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_control_requests_reach_drive() {
        let (mut runtime, start) = sim_runtime();

        runtime.on_control(ControlRequest::ToggleDriveMode);
        runtime.on_control(ControlRequest::SetSpeedScale { scale: SpeedScale::Slow });
        let target = Pose2d::new(1.0, 2.0, 0.5);
        runtime.on_control(ControlRequest::ResetPose { pose: target });

        let output = runtime.cycle(start + PERIOD, None);
        assert_eq!(output.telemetry.mode, DriveMode::RobotCentric);
        assert_eq!(output.telemetry.speed_scale, SpeedScale::Slow);
        assert_abs_diff_eq!(output.telemetry.pose.x, 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(output.telemetry.pose.heading, 0.5, epsilon = 1e-9);
    }

    #[test]
    fn test_zero_modules_clears_command() {
        let (mut runtime, start) = sim_runtime();
        runtime.on_command(DriveCommand::new(0.0, 1.0, 0.0), start);
        runtime.cycle(start + PERIOD, None);

        runtime.on_control(ControlRequest::ZeroModules);
        let output = runtime.cycle(start + 2 * PERIOD, None);

        assert_eq!(output.health, RuntimeHealth::CmdStale);
        for module in &output.telemetry.modules {
            assert_abs_diff_eq!(module.angle, 0.0);
            assert_abs_diff_eq!(module.speed, 0.0);
        }
    }

    #[test]
    fn test_vision_sample_moves_fused_pose() {
        let (mut runtime, start) = sim_runtime();
        let mut now = start;
        for _ in 0..5 {
            now += PERIOD;
            runtime.cycle(now, None);
        }

        let sample = VisionSample {
            pose: Pose2d::new(0.0, 1.0, 0.0),
            timestamp: 0.1,
            valid: true,
        };
        let output = runtime.cycle(now + PERIOD, Some(&sample));

        assert_abs_diff_eq!(output.telemetry.pose.y, 0.1, epsilon = 1e-9);
        assert_abs_diff_eq!(output.telemetry.odometry_pose.y, 0.0);
    }
}
