// Minimal keyboard driver for trying the runtime by hand
//
// Arrow keys translate, , and . rotate, Space toggles field/robot frame,
// H resets the heading, Esc quits. Each key press drives for one watchdog
// window; releasing the key lets the runtime stop the robot.
use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use tracing::info;

use swerve_zenoh_runtime::config::{TOPIC_CMD_CONTROL, TOPIC_CMD_DRIVE};
use swerve_zenoh_runtime::messages::{ControlRequest, DriveCommand};

const SPEED: f64 = 0.5; // m/s
const TURN_RATE: f64 = 1.0; // rad/s

enum Input {
    Drive(DriveCommand),
    Control(ControlRequest),
    Quit,
}

fn map_key(code: KeyCode) -> Option<Input> {
    let drive = |vx, vy, omega| Some(Input::Drive(DriveCommand::new(vx, vy, omega)));
    match code {
        KeyCode::Up => drive(SPEED, 0.0, 0.0),
        KeyCode::Down => drive(-SPEED, 0.0, 0.0),
        KeyCode::Left => drive(0.0, SPEED, 0.0),
        KeyCode::Right => drive(0.0, -SPEED, 0.0),
        KeyCode::Char(',') => drive(0.0, 0.0, TURN_RATE),
        KeyCode::Char('.') => drive(0.0, 0.0, -TURN_RATE),
        KeyCode::Char(' ') => Some(Input::Control(ControlRequest::ToggleDriveMode)),
        KeyCode::Char('h') => Some(Input::Control(ControlRequest::ResetHeading { offset: 0.0 })),
        KeyCode::Esc => Some(Input::Quit),
        _ => None,
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let session = zenoh::open(zenoh::Config::default()).await?;
    let pub_drive = session.declare_publisher(TOPIC_CMD_DRIVE).await?;
    let pub_control = session.declare_publisher(TOPIC_CMD_CONTROL).await?;
    info!("Arrows=move, ,/.=rotate, Space=frame, H=reset heading, Esc=quit");

    enable_raw_mode()?;
    let result = async {
        loop {
            if !event::poll(Duration::from_millis(100))? {
                continue;
            }
            let Event::Key(key) = event::read()? else { continue };
            if key.kind == KeyEventKind::Release {
                continue;
            }
            match map_key(key.code) {
                Some(Input::Drive(cmd)) => pub_drive.put(serde_json::to_string(&cmd)?).await?,
                Some(Input::Control(req)) => pub_control.put(serde_json::to_string(&req)?).await?,
                Some(Input::Quit) => break,
                None => {}
            }
        }
        Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
    }
    .await;
    disable_raw_mode()?;

    result
}
