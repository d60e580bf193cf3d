//! Thermostat controller: the bus entity set, the command handlers that feed
//! the PID, and the wiring of the control loop to the actuator driver.

pub mod control_loop;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::actuator::{
    ActuatorDriver, ActuatorSettings, CommandReceiver, CommandSender, FeedbackReceiver, FeedbackSender, MotorCommand,
    command_queue, feedback_queue,
};
use crate::bus::DeviceInfo;
use crate::config::{Config, ConfigError};
use crate::entity::climate::{ModeHandler, TemperatureHandler};
use crate::entity::{
    ClimateEntity, ClimateOptions, CommandError, CommandHandler, EntityError, EntityRegistry, Mode, ParamValue,
    Parameter, ParameterOptions,
};
use crate::hardware::{ClimateSensor, MotorDriver, PositionSensor};
use crate::pid::{Gain, Pid};
use crate::schedule::Schedule;
use crate::shutdown::ShutdownListener;

pub use control_loop::ControlLoop;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Entity error: {0}")]
    Entity(#[from] EntityError),
}

/// State shared between the control loop and the bus command handlers.
pub struct ControlCore {
    pid: Mutex<Pid>,
    /// Last position sent to the actuator. Only changed with the PID lock held.
    issued: Mutex<Option<i32>>,
    commands: CommandSender,
}

impl ControlCore {
    pub fn new(pid: Pid, commands: CommandSender) -> Self {
        Self { pid: Mutex::new(pid), issued: Mutex::new(None), commands }
    }

    /// Keep the guard short: never hold it across a publish.
    pub fn pid(&self) -> MutexGuard<'_, Pid> {
        self.pid.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn issued_position(&self) -> Option<i32> {
        *self.issued.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send `position` unless it is the one last sent. The `&mut Pid` borrow
    /// proves the caller holds the PID lock, which keeps control-loop positions
    /// and manual overrides in a single order.
    pub fn issue_position(&self, _pid: &mut Pid, position: i32) -> bool {
        let mut issued = self.issued.lock().unwrap_or_else(PoisonError::into_inner);
        if *issued == Some(position) {
            return false;
        }
        *issued = Some(position);
        self.send(MotorCommand::SetPosition(position))
    }

    /// Put the PID in manual mode and send `position` unconditionally.
    pub fn override_position(&self, position: i32) -> bool {
        let mut pid = self.pid();
        pid.set_auto_mode(false);
        *self.issued.lock().unwrap_or_else(PoisonError::into_inner) = Some(position);
        self.send(MotorCommand::SetPosition(position))
    }

    pub fn send(&self, command: MotorCommand) -> bool {
        match self.commands.send(command) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Actuator command dropped, driver gone: {:?}", e.0);
                false
            }
        }
    }
}

/// Every entity the controller exposes.
pub struct Entities {
    pub manual_position: Arc<Parameter>,
    pub target_position: Arc<Parameter>,
    pub actual_position: Arc<Parameter>,
    pub kp: Arc<Parameter>,
    pub ki: Arc<Parameter>,
    pub kd: Arc<Parameter>,
    pub proportional: Arc<Parameter>,
    pub integral: Arc<Parameter>,
    pub derivative: Arc<Parameter>,
    pub desired_temp: Arc<Parameter>,
    pub actual_temp: Arc<Parameter>,
    pub actual_humidity: Arc<Parameter>,
    pub climate: Arc<ClimateEntity>,
}

/// The actuator's ends of the two queues.
pub struct ActuatorLink {
    pub commands: CommandReceiver,
    pub feedback: FeedbackSender,
}

pub struct Controller {
    core: Arc<ControlCore>,
    entities: Arc<Entities>,
    registry: EntityRegistry,
    schedule: Schedule,
    /// Timestamp of the schedule entry already in effect.
    schedule_applied: Option<String>,
    feedback: FeedbackReceiver,
    settings: ActuatorSettings,
    update_period: Duration,
    report_period: Duration,
}

pub(crate) fn local_time_of_day() -> String {
    chrono::Local::now().format("%H:%M").to_string()
}

fn gain_handler(core: &Arc<ControlCore>, gain: Gain) -> CommandHandler {
    let core = core.clone();
    Arc::new(move |value: &ParamValue| -> Result<(), CommandError> {
        let value = value.as_f64().ok_or_else(|| CommandError::InvalidPayload(value.to_string()))?;
        core.pid().set_gain(gain, value);
        tracing::info!("PID {:?} gain set to {}", gain, value);
        Ok(())
    })
}

impl Controller {
    pub fn new(config: &Config) -> Result<(Self, ActuatorLink), ControllerError> {
        Self::new_at(config, &local_time_of_day())
    }

    /// Build the controller as if started at `time_of_day` ("HH:MM"). The
    /// schedule entry active at that time seeds the setpoint and counts as applied.
    pub fn new_at(config: &Config, time_of_day: &str) -> Result<(Self, ActuatorLink), ControllerError> {
        let device = DeviceInfo::from(&config.device);
        let schedule = config.schedule()?;
        let active = schedule.active_entry(time_of_day).cloned();
        let setpoint = active.as_ref().map(|e| e.temperature).unwrap_or(config.climate.min_temp);
        let control = &config.control;

        let pid = Pid::new(config.pid.kp, config.pid.ki, config.pid.kd, setpoint)
            .with_output_limits(control.pos_min as f64, control.pos_max as f64)
            .with_sample_time(config.update_period())
            .with_auto_mode(false);
        let (command_tx, command_rx) = command_queue();
        let (feedback_tx, feedback_rx) = feedback_queue();
        let core = Arc::new(ControlCore::new(pid, command_tx));

        let mut registry = EntityRegistry::new(device.clone(), config.bootstrap_timeout());
        let entities = Arc::new(Self::build_entities(&mut registry, &device, config, &core, setpoint)?);

        let controller = Self {
            core,
            entities,
            registry,
            schedule,
            schedule_applied: active.map(|e| e.timestamp),
            feedback: feedback_rx,
            settings: ActuatorSettings::from(&config.actuator),
            update_period: config.update_period(),
            report_period: config.report_period(),
        };
        Ok((controller, ActuatorLink { commands: command_rx, feedback: feedback_tx }))
    }

    fn build_entities(
        registry: &mut EntityRegistry,
        device: &DeviceInfo,
        config: &Config,
        core: &Arc<ControlCore>,
        setpoint: f64,
    ) -> Result<Entities, ControllerError> {
        let sensor = |id: &str, name: &str, options: ParameterOptions| -> Result<Arc<Parameter>, EntityError> {
            Ok(Arc::new(Parameter::sensor(device, id, name, options)?))
        };
        let temperature = || ParameterOptions::default().unit("°C").device_class("temperature");
        let control = &config.control;

        let target_position = registry.register(sensor("targetposition", "Target Position", ParameterOptions::default().unit("mm").value(0))?);
        let actual_position = registry.register(sensor("actualposition", "Actual Position", ParameterOptions::default().unit("mm"))?);
        let proportional = registry.register(sensor("ap", "Calc'd Prop.", ParameterOptions::default())?);
        let integral = registry.register(sensor("ai", "Calc'd Int.", ParameterOptions::default())?);
        let derivative = registry.register(sensor("ad", "Calc'd Deriv.", ParameterOptions::default())?);
        let desired_temp = registry.register(sensor("desiredtemp", "Desired Temp.", temperature().value(setpoint))?);
        let actual_temp = registry.register(sensor("actualtemp", "Actual Temp.", temperature())?);
        let actual_humidity = registry.register(sensor(
            "actualhumidity",
            "Actual Humid.",
            ParameterOptions::default().unit("%").device_class("humidity"),
        )?);

        let on_temperature: TemperatureHandler = {
            let core = core.clone();
            let desired_temp = desired_temp.clone();
            Arc::new(move |value: f64| {
                core.pid().setpoint = value;
                desired_temp.set(value);
                tracing::info!("Setpoint changed to {}", value);
                Ok(())
            })
        };
        let on_mode: ModeHandler = {
            let core = core.clone();
            Arc::new(move |mode: Mode| {
                core.pid().set_auto_mode(mode.is_active());
                tracing::info!("Mode changed to {}", mode);
                Ok(())
            })
        };
        let climate_options = ClimateOptions {
            temp_step: config.climate.temp_step,
            min_temp: config.climate.min_temp,
            max_temp: config.climate.max_temp,
            target_temperature: setpoint,
            ..ClimateOptions::default()
        };
        let climate = registry.register(Arc::new(ClimateEntity::new(
            device,
            "climate",
            "Climate",
            climate_options,
            on_temperature,
            on_mode,
        )?));

        let on_manual_position: CommandHandler = {
            let core = core.clone();
            let climate = climate.clone();
            let target_position = target_position.clone();
            Arc::new(move |value: &ParamValue| {
                let position = value
                    .as_f64()
                    .map(|v| v.round() as i32)
                    .ok_or_else(|| CommandError::InvalidPayload(value.to_string()))?;
                if position <= 0 {
                    return Err(CommandError::Rejected(format!("manual position {} must be positive", position)));
                }
                core.override_position(position);
                climate.set_mode(Mode::Off);
                target_position.set(position);
                tracing::info!("Manual position {} (mode forced off)", position);
                Ok(())
            })
        };
        let manual_position = registry.register(Arc::new(Parameter::number(
            device,
            "manualposition",
            "Manual Position",
            ParameterOptions::default()
                .unit("mm")
                .value(0)
                .bounds(control.pos_min as f64, control.pos_max as f64, 1.0),
            on_manual_position,
        )?));

        let gain = |id: &str, name: &str, max: f64, initial: f64, which: Gain| -> Result<Arc<Parameter>, EntityError> {
            let options = ParameterOptions::default().value(initial).bounds(0.0, max, 0.1);
            Ok(Arc::new(Parameter::number(device, id, name, options, gain_handler(core, which))?))
        };
        let kp = registry.register(gain("kp", "Proportional", 64000.0, config.pid.kp, Gain::Proportional)?);
        let ki = registry.register(gain("ki", "Integral", 100.0, config.pid.ki, Gain::Integral)?);
        let kd = registry.register(gain("kd", "Derivative", 64000.0, config.pid.kd, Gain::Derivative)?);

        Ok(Entities {
            manual_position,
            target_position,
            actual_position,
            kp,
            ki,
            kd,
            proportional,
            integral,
            derivative,
            desired_temp,
            actual_temp,
            actual_humidity,
            climate,
        })
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    pub fn entities(&self) -> &Arc<Entities> {
        &self.entities
    }

    pub fn core(&self) -> &Arc<ControlCore> {
        &self.core
    }

    /// Sender for out-of-band actuator commands (settings reload).
    pub fn commands(&self) -> CommandSender {
        self.core.commands.clone()
    }

    pub fn control_loop<C: ClimateSensor>(self, sensor: C) -> ControlLoop<C> {
        ControlLoop {
            core: self.core,
            entities: self.entities,
            schedule: self.schedule,
            schedule_applied: self.schedule_applied,
            sensor,
            feedback: self.feedback,
            update_period: self.update_period,
            report_period: self.report_period,
            temperature: None,
            humidity: None,
            actual_position: None,
        }
    }

    /// Spawn the actuator driver and run the control loop until shutdown.
    /// Returns once the driver has stopped the motor, or was aborted.
    pub async fn run<P, M, C>(self, link: ActuatorLink, position: P, motor: M, climate: C, shutdown: ShutdownListener)
    where
        P: PositionSensor + 'static,
        M: MotorDriver + 'static,
        C: ClimateSensor,
    {
        let driver = ActuatorDriver::new(position, motor, self.settings.clone());
        let actuator: JoinHandle<()> = tokio::spawn(driver.run(link.commands, link.feedback, shutdown.clone()));
        self.control_loop(climate).run(actuator, shutdown).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> (Controller, ActuatorLink) {
        let config = Config { schedule: vec!["06:00 20".into(), "22:00 17".into()], ..Config::default() };
        Controller::new_at(&config, "07:30").unwrap()
    }

    #[test]
    fn test_entity_set() {
        let (controller, _link) = controller();
        assert_eq!(controller.registry().len(), 13);
        assert_eq!(controller.entities().climate.target_temperature(), 20.0);
        assert_eq!(controller.entities().desired_temp.get_f64(), 20.0);
        assert_eq!(controller.core().pid().setpoint, 20.0);
        assert!(!controller.core().pid().auto_mode());
    }

    #[test]
    fn test_gain_command_updates_tuning() {
        let (controller, _link) = controller();
        controller.entities().ki.handle_command("0.5").unwrap();
        assert_eq!(controller.core().pid().tunings(), (1.5, 0.5, 1.1));
        assert!(controller.entities().ki.handle_command("500").is_err());
        assert_eq!(controller.core().pid().tunings().1, 0.5);
    }

    #[test]
    fn test_manual_position_forces_off() {
        let (controller, mut link) = controller();
        let entities = controller.entities().clone();
        entities.climate.handle_mode_command("heat").unwrap();
        assert!(controller.core().pid().auto_mode());

        entities.manual_position.handle_command("1200").unwrap();
        assert_eq!(entities.climate.mode(), Mode::Off);
        assert!(!controller.core().pid().auto_mode());
        assert_eq!(entities.target_position.get(), Some(ParamValue::Integer(1200)));
        assert_eq!(link.commands.try_recv().unwrap(), MotorCommand::SetPosition(1200));
    }

    #[test]
    fn test_manual_position_zero_rejected() {
        let (controller, mut link) = controller();
        assert!(controller.entities().manual_position.handle_command("0").is_err());
        assert!(link.commands.try_recv().is_err());
    }
}
