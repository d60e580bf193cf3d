// src/main.rs - Thermostat host: config, logging, bus and task wiring
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::fmt::writer::MakeWriterExt;

use thermo_rs::actuator::{ActuatorSettings, CommandSender, MotorCommand};
use thermo_rs::bus::{LocalBus, MessageBus};
use thermo_rs::config::{self, Config};
use thermo_rs::controller::Controller;
use thermo_rs::shutdown::Shutdown;
use thermo_rs::simulator::SimulatedRig;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Parser, Debug)]
#[command(name = "thermostat-host", version, about = "PID radiator valve controller")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "thermostat.toml")]
    config: String,
}

fn init_logging(config: &Config) {
    // Below WARN to stdout, WARN and above to stderr.
    let stdout = std::io::stdout.with_min_level(tracing::Level::INFO);
    let stderr = std::io::stderr.with_max_level(tracing::Level::WARN);
    tracing_subscriber::fmt()
        .with_max_level(config.tracing_level())
        .with_writer(stderr.or_else(stdout))
        .init();
}

#[cfg(unix)]
async fn wait_for_termination() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = term.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

/// Re-read the config on SIGHUP and hand the actuator section to the driver.
#[cfg(unix)]
fn spawn_reload(path: String, commands: CommandSender) -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut hangup = signal(SignalKind::hangup())?;
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            tracing::info!("SIGHUP received, reloading {}", path);
            match config::load_config(&path) {
                Ok(config) => {
                    let settings = ActuatorSettings::from(&config.actuator);
                    if commands.send(MotorCommand::UpdateSettings(settings)).is_err() {
                        break;
                    }
                }
                Err(e) => tracing::error!("Reload failed, keeping current settings: {}", e),
            }
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn spawn_reload(_path: String, _commands: CommandSender) -> std::io::Result<()> {
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let args = Args::parse();

    let config = config::load_config(&args.config).map_err(|e| {
        eprintln!("Failed to load config from '{}': {}", args.config, e);
        Box::new(e) as BoxError
    })?;
    init_logging(&config);

    tracing::info!("Starting thermostat host {}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Device: {} ({})", config.device.name, config.device.id);
    tracing::info!(
        "Update every {:?}, report every {:?}, travel {}..{}",
        config.update_period(),
        config.report_period(),
        config.control.pos_min,
        config.control.pos_max
    );

    let shutdown = Shutdown::new();
    // The publish journal is a test aid; a long-running host keeps none.
    let (bus, dispatcher) = LocalBus::with_journal_capacity(0);
    let dispatcher_task = tokio::spawn(dispatcher.run(shutdown.subscribe()));
    let bus: Arc<dyn MessageBus> = Arc::new(bus);

    let (controller, link) = Controller::new(&config)?;
    controller.registry().connect(bus)?;
    spawn_reload(args.config.clone(), controller.commands())?;

    let rig = SimulatedRig::new(config.control.pos_max);
    let control_task = tokio::spawn(controller.run(
        link,
        rig.position_sensor(),
        rig.motor(),
        rig.climate_sensor(),
        shutdown.subscribe(),
    ));

    if let Err(e) = wait_for_termination().await {
        tracing::error!("Signal handling failed: {}", e);
    }
    shutdown.trigger();

    if let Err(e) = control_task.await {
        tracing::error!("Control task failed: {}", e);
    }
    if let Err(e) = dispatcher_task.await {
        tracing::error!("Bus dispatcher task failed: {}", e);
    }
    tracing::info!("Thermostat host stopped");
    Ok(())
}
