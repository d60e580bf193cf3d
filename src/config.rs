//! # Thermostat Configuration
//!
//! Loaded once at startup from a TOML file. The `[actuator]` section may be
//! reloaded at runtime (SIGHUP) and forwarded to the actuator task.
//!
//! ## Example
//!
//! ```toml
//! log_level = "info"
//! schedule = ["06:00 20C", "22:00 17C"]
//!
//! [control]
//! update_rate = 0.5
//! report_rate = 5.0
//! pos_min = 0
//! pos_max = 30000
//!
//! [actuator]
//! pos_margin = 10
//! speed = 480
//! up_dir = 1
//!
//! [pid]
//! kp = 1.5
//! ki = 1.2
//! kd = 1.1
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::schedule::{Schedule, ScheduleError};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration struct for the thermostat controller.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub actuator: ActuatorConfig,
    #[serde(default)]
    pub pid: PidConfig,
    #[serde(default)]
    pub climate: ClimateConfig,
    /// Raw rows, e.g. `"06:00 20C"`. Parsed by [`Config::schedule`].
    #[serde(default)]
    pub schedule: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            device: DeviceConfig::default(),
            bus: BusConfig::default(),
            control: ControlConfig::default(),
            actuator: ActuatorConfig::default(),
            pid: PidConfig::default(),
            climate: ClimateConfig::default(),
            schedule: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceConfig {
    #[serde(default = "default_device_id")]
    pub id: String,
    #[serde(default = "default_device_name")]
    pub name: String,
    #[serde(default = "default_manufacturer")]
    pub manufacturer: String,
    #[serde(default = "default_device_version")]
    pub version: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            id: default_device_id(),
            name: default_device_name(),
            manufacturer: default_manufacturer(),
            version: default_device_version(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BusConfig {
    /// How long to wait for a retained state message before publishing defaults.
    #[serde(default = "default_bootstrap_timeout")]
    pub bootstrap_timeout_secs: f64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self { bootstrap_timeout_secs: default_bootstrap_timeout() }
    }
}

/// Control loop timing and actuator travel bounds (also the PID output limits).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControlConfig {
    #[serde(default = "default_update_rate")]
    pub update_rate: f64,
    #[serde(default = "default_report_rate")]
    pub report_rate: f64,
    #[serde(default = "default_pos_min")]
    pub pos_min: i32,
    #[serde(default = "default_pos_max")]
    pub pos_max: i32,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            update_rate: default_update_rate(),
            report_rate: default_report_rate(),
            pos_min: default_pos_min(),
            pos_max: default_pos_max(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ActuatorConfig {
    #[serde(default = "default_pos_margin")]
    pub pos_margin: i32,
    #[serde(default = "default_speed")]
    pub speed: u16,
    /// +1 when forward motor rotation raises the actuator, -1 otherwise.
    #[serde(default = "default_up_dir")]
    pub up_dir: i8,
    #[serde(default = "default_filter_offset")]
    pub filter_offset: i32,
    #[serde(default = "default_idle_filter_limit")]
    pub idle_filter_limit: i32,
    #[serde(default = "default_reversal_dwell")]
    pub reversal_dwell_secs: f64,
    #[serde(default = "default_moving_tick")]
    pub moving_tick_secs: f64,
    #[serde(default = "default_idle_tick")]
    pub idle_tick_secs: f64,
    #[serde(default = "default_feedback_interval")]
    pub feedback_interval_secs: f64,
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            pos_margin: default_pos_margin(),
            speed: default_speed(),
            up_dir: default_up_dir(),
            filter_offset: default_filter_offset(),
            idle_filter_limit: default_idle_filter_limit(),
            reversal_dwell_secs: default_reversal_dwell(),
            moving_tick_secs: default_moving_tick(),
            idle_tick_secs: default_idle_tick(),
            feedback_interval_secs: default_feedback_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PidConfig {
    #[serde(default = "default_kp")]
    pub kp: f64,
    #[serde(default = "default_ki")]
    pub ki: f64,
    #[serde(default = "default_kd")]
    pub kd: f64,
}

impl Default for PidConfig {
    fn default() -> Self {
        Self { kp: default_kp(), ki: default_ki(), kd: default_kd() }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClimateConfig {
    #[serde(default = "default_min_temp")]
    pub min_temp: f64,
    #[serde(default = "default_max_temp")]
    pub max_temp: f64,
    #[serde(default = "default_temp_step")]
    pub temp_step: f64,
}

impl Default for ClimateConfig {
    fn default() -> Self {
        Self {
            min_temp: default_min_temp(),
            max_temp: default_max_temp(),
            temp_step: default_temp_step(),
        }
    }
}

impl Config {
    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.control;
        let a = &self.actuator;
        let seconds = [
            ("control.update_rate", c.update_rate),
            ("control.report_rate", c.report_rate),
            ("actuator.reversal_dwell_secs", a.reversal_dwell_secs),
            ("actuator.moving_tick_secs", a.moving_tick_secs),
            ("actuator.idle_tick_secs", a.idle_tick_secs),
            ("actuator.feedback_interval_secs", a.feedback_interval_secs),
            ("bus.bootstrap_timeout_secs", self.bus.bootstrap_timeout_secs),
        ];
        // Everything later turned into a Duration must convert without panicking.
        if let Some((name, value)) = seconds.iter().find(|(_, v)| Duration::try_from_secs_f64(*v).is_err()) {
            return Err(ConfigError::Invalid(format!(
                "{} must be a finite, non-negative number of seconds, got {}",
                name, value
            )));
        }
        let numbers = [
            ("pid.kp", self.pid.kp),
            ("pid.ki", self.pid.ki),
            ("pid.kd", self.pid.kd),
            ("climate.min_temp", self.climate.min_temp),
            ("climate.max_temp", self.climate.max_temp),
            ("climate.temp_step", self.climate.temp_step),
        ];
        if let Some((name, value)) = numbers.iter().find(|(_, v)| !v.is_finite()) {
            return Err(ConfigError::Invalid(format!("{} must be finite, got {}", name, value)));
        }
        if c.pos_min >= c.pos_max {
            return Err(ConfigError::Invalid(format!(
                "pos_min ({}) must be below pos_max ({})",
                c.pos_min, c.pos_max
            )));
        }
        if c.update_rate <= 0.0 || c.report_rate <= 0.0 {
            return Err(ConfigError::Invalid("update_rate and report_rate must be > 0".to_string()));
        }
        if c.report_rate < c.update_rate {
            return Err(ConfigError::Invalid("report_rate must not be shorter than update_rate".to_string()));
        }
        if a.up_dir != 1 && a.up_dir != -1 {
            return Err(ConfigError::Invalid(format!("up_dir must be 1 or -1, got {}", a.up_dir)));
        }
        if a.filter_offset < 1 || a.idle_filter_limit < 1 {
            return Err(ConfigError::Invalid("filter limits must be >= 1".to_string()));
        }
        if a.pos_margin < 0 {
            return Err(ConfigError::Invalid("pos_margin must be >= 0".to_string()));
        }
        if a.moving_tick_secs <= 0.0 || a.idle_tick_secs <= 0.0 || a.feedback_interval_secs <= 0.0 {
            return Err(ConfigError::Invalid("actuator intervals must be > 0".to_string()));
        }
        Ok(())
    }

    /// Parse, normalize and sort the configured schedule rows.
    pub fn schedule(&self) -> Result<Schedule, ConfigError> {
        Ok(Schedule::parse(&self.schedule)?)
    }

    pub fn update_period(&self) -> Duration {
        Duration::from_secs_f64(self.control.update_rate)
    }

    pub fn report_period(&self) -> Duration {
        Duration::from_secs_f64(self.control.report_rate)
    }

    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.bus.bootstrap_timeout_secs)
    }

    pub fn tracing_level(&self) -> tracing::Level {
        self.log_level.parse().unwrap_or(tracing::Level::INFO)
    }
}

// Default value functions
fn default_log_level() -> String { "info".to_string() }
fn default_device_id() -> String { "janky-thermostat".to_string() }
fn default_device_name() -> String { "Janky Thermostat".to_string() }
fn default_manufacturer() -> String { "Janky Thermo v1".to_string() }
fn default_device_version() -> String { "1".to_string() }
fn default_bootstrap_timeout() -> f64 { 10.0 }
fn default_update_rate() -> f64 { 0.5 }
fn default_report_rate() -> f64 { 5.0 }
fn default_pos_min() -> i32 { 0 }
fn default_pos_max() -> i32 { 30000 }
fn default_pos_margin() -> i32 { 10 }
fn default_speed() -> u16 { 480 }
fn default_up_dir() -> i8 { 1 }
fn default_filter_offset() -> i32 { 4 }
fn default_idle_filter_limit() -> i32 { 5 }
fn default_reversal_dwell() -> f64 { 2.0 }
fn default_moving_tick() -> f64 { 0.02 }
fn default_idle_tick() -> f64 { 0.2 }
fn default_feedback_interval() -> f64 { 2.0 }
fn default_kp() -> f64 { 1.5 }
fn default_ki() -> f64 { 1.2 }
fn default_kd() -> f64 { 1.1 }
fn default_min_temp() -> f64 { 15.0 }
fn default_max_temp() -> f64 { 30.0 }
fn default_temp_step() -> f64 { 0.1 }

/// Load configuration from a TOML file at the given path.
pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    let config: Config = match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!("Failed to parse config TOML: {}", e);
                return Err(ConfigError::Toml(e));
            }
        },
        Err(e) => {
            tracing::error!("Failed to read config file '{}': {}", path, e);
            return Err(ConfigError::Io(e));
        }
    };
    config.validate()?;
    Ok(config)
}
