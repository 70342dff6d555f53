use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use swerve_zenoh_runtime::config::DriveConfig;

#[derive(Parser, Debug)]
#[command(version, about = "Swerve drive runtime over Zenoh")]
struct Args {
    /// JSON drive config; built-in defaults when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run against the simulated drivetrain instead of the motor bus
    #[arg(long)]
    sim: bool,

    /// Serial port of the motor bus, overrides the config file
    #[arg(long)]
    port: Option<String>,
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init(); // installs the subscriber globally

    let args = Args::parse();

    let mut config = match args.config {
        Some(path) => match DriveConfig::load(&path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Config error: {}", e);
                std::process::exit(1);
            }
        },
        None => DriveConfig::default(),
    };
    if let Some(port) = args.port {
        config.motor_port = port;
    }

    if let Err(e) = swerve_zenoh_runtime::runtime::run(config, args.sim).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}
