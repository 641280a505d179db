//! CLI entry point for behavior_rig.
//!
//! Subcommands:
//! - `run` starts a session for a subject
//! - `check` validates the configuration and calibration without touching
//!   hardware
//! - `flush` pulses the reward valve to clear the water line
//!
//! # Usage
//!
//! ```bash
//! behavior_rig run --subject M001
//! behavior_rig check
//! behavior_rig flush --secs 2
//! ```

use anyhow::{bail, Context, Result};
use behavior_rig::calibration::CalibrationCurve;
use behavior_rig::config::RigConfig;
use behavior_rig::logging;
use behavior_rig::protocol::corridor::CorridorProtocol;
use behavior_rig::session::collaborators::{NullCameraTrigger, NullCorridor, NullRegistry};
use behavior_rig::session::SessionStatus;
use behavior_rig::{Collaborators, HardwareFactories, Rig, SessionRunner};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "behavior_rig")]
#[command(about = "Controller for wheel-based behavior rigs", long_about = None)]
struct Cli {
    /// Hardware configuration file
    #[arg(long, default_value = "config/hardware.toml")]
    hardware: PathBuf,

    /// Task configuration file
    #[arg(long, default_value = "config/task.toml")]
    task: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a session
    Run {
        /// Subject identifier (its directory name under the data root)
        #[arg(long)]
        subject: String,
    },

    /// Validate configuration and calibration without touching hardware
    Check,

    /// Pulse the reward valve to clear the water line
    Flush {
        /// Seconds to hold the valve open
        #[arg(long, default_value = "1.0")]
        secs: f64,
    },

    /// List serial ports visible on this machine
    Ports,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        // port discovery must work before any configuration exists
        Commands::Ports => list_ports(),
        Commands::Run { subject } => run_session(load_config(&cli)?, subject).await,
        Commands::Check => check(load_config(&cli)?),
        Commands::Flush { secs } => flush(load_config(&cli)?, *secs).await,
    }
}

fn load_config(cli: &Cli) -> Result<RigConfig> {
    let config = RigConfig::load(&cli.hardware, &cli.task)
        .with_context(|| format!("loading {} and {}", cli.hardware.display(), cli.task.display()))?;
    logging::init_from_config(&config)?;
    Ok(config)
}

#[cfg(feature = "instrument_serial")]
fn list_ports() -> Result<()> {
    let ports = serialport::available_ports().context("enumerating serial ports")?;
    if ports.is_empty() {
        println!("no serial ports found");
    }
    for port in ports {
        println!("{}  {:?}", port.port_name, port.port_type);
    }
    Ok(())
}

#[cfg(not(feature = "instrument_serial"))]
fn list_ports() -> Result<()> {
    bail!(
        "this build has no serial hardware support; rebuild with \
         --features instrument_serial"
    )
}

async fn run_session(config: RigConfig, subject: &str) -> Result<()> {
    let rig = Rig::new(config, hardware_factories()?);
    let collaborators = Collaborators {
        view: Arc::new(NullCorridor::default()),
        camera: Arc::new(NullCameraTrigger),
        registry: Arc::new(NullRegistry),
    };
    let protocol = {
        let task = rig.config().task.clone();
        let reward_event = rig.encoder().reward_event();
        Box::new(CorridorProtocol::new(task, reward_event))
    };

    let runner = SessionRunner::start(rig, protocol, collaborators, subject).await?;
    info!(path = %runner.paths().session_dir().display(), "session starting");
    let summary = runner.run().await?;
    match summary.status {
        SessionStatus::Complete | SessionStatus::Stopped => {
            info!(
                trials = summary.trials_completed,
                "session data at {}",
                summary.paths.raw_data_dir().display()
            );
            Ok(())
        }
        status => {
            error!(?status, trials = summary.trials_completed, "session did not complete");
            bail!("session ended with status {status:?}");
        }
    }
}

fn check(config: RigConfig) -> Result<()> {
    config.validate()?;
    let curve = CalibrationCurve::from_config(&config.hardware.valve)?;
    curve.validate()?;
    let open_secs = curve.time_for_volume(config.task.reward_amount_ul);
    info!(
        reward_ul = config.task.reward_amount_ul,
        open_secs, "configuration and calibration are valid"
    );
    Ok(())
}

async fn flush(config: RigConfig, secs: f64) -> Result<()> {
    use behavior_rig::device::Controller;
    use behavior_rig::peripherals::valve::Valve;

    config.validate()?;
    let curve = CalibrationCurve::from_config(&config.hardware.valve)?;
    let port = config
        .hardware
        .controller
        .port
        .clone()
        .context("hardware.controller.port is not set")?;
    let factories = hardware_factories()?;
    let controller = Controller::acquire(&port, |p| (factories.transport)(p)).await?;

    let valve = Valve::new(curve);
    info!(secs, "flushing the water line");
    valve.open_for(&controller, secs).await?;
    controller.close().await?;
    Ok(())
}

#[cfg(feature = "instrument_serial")]
fn hardware_factories() -> Result<HardwareFactories> {
    use behavior_rig::device::serial::{
        SerialEncoderLink, SerialLightSensorLink, SerialTransport,
    };
    use behavior_rig::peripherals::sound::NullAudio;

    Ok(HardwareFactories {
        transport: Box::new(|port| Box::new(SerialTransport::new(port))),
        encoder_link: Box::new(|port| Box::new(SerialEncoderLink::new(port))),
        light_sensor_link: Box::new(|port| Box::new(SerialLightSensorLink::new(port))),
        audio: Arc::new(NullAudio),
    })
}

#[cfg(not(feature = "instrument_serial"))]
fn hardware_factories() -> Result<HardwareFactories> {
    bail!(
        "this build has no serial hardware support; rebuild with \
         --features instrument_serial"
    )
}
