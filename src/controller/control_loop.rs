// src/controller/control_loop.rs - Periodic temperature control
//
// Every update period: pick up the newest actuator feedback, read the climate
// sensor and, unless the mode is off, turn the PID output into a target position.
// Every report period: publish telemetry and check the schedule.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

use super::{ControlCore, Entities, local_time_of_day};
use crate::actuator::{FeedbackReceiver, MotorCommand, drain_feedback};
use crate::hardware::ClimateSensor;
use crate::schedule::Schedule;
use crate::shutdown::ShutdownListener;

/// How long to wait for the actuator driver after asking it to stop.
pub const ACTUATOR_STOP_TIMEOUT: Duration = Duration::from_secs(5);

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub struct ControlLoop<C: ClimateSensor> {
    pub(super) core: Arc<ControlCore>,
    pub(super) entities: Arc<Entities>,
    pub(super) schedule: Schedule,
    pub(super) schedule_applied: Option<String>,
    pub(super) sensor: C,
    pub(super) feedback: FeedbackReceiver,
    pub(super) update_period: Duration,
    pub(super) report_period: Duration,
    pub(super) temperature: Option<f64>,
    pub(super) humidity: Option<f64>,
    pub(super) actual_position: Option<i32>,
}

impl<C: ClimateSensor> ControlLoop<C> {
    pub fn temperature(&self) -> Option<f64> {
        self.temperature
    }

    pub fn actual_position(&self) -> Option<i32> {
        self.actual_position
    }

    /// One control tick. Returns the position sent to the actuator, if any.
    pub fn tick(&mut self, now: Instant) -> Option<i32> {
        if let Some(position) = drain_feedback(&mut self.feedback) {
            self.actual_position = Some(position);
        }

        match self.sensor.read_temperature_humidity() {
            Ok((temperature, humidity)) => {
                self.temperature = Some(round2(temperature));
                self.humidity = Some(round2(humidity));
            }
            Err(e) => tracing::warn!("Climate sensor read failed: {}", e),
        }

        let temperature = self.temperature?;
        let position = {
            // Decide and send under the PID lock: a manual override takes the same
            // lock, so no PID position can be queued behind it.
            let mut pid = self.core.pid();
            if !pid.auto_mode() {
                return None;
            }
            let output = pid.update(temperature, now.into_std())?;
            let position = output.round() as i32;
            if !self.core.issue_position(&mut pid, position) {
                return None;
            }
            tracing::debug!("PID {:.2} -> target position {}", output, position);
            position
        };
        if let Some(issued) = self.core.issued_position() {
            self.entities.target_position.set(issued);
        }
        Some(position)
    }

    /// Publish telemetry, then apply the schedule for `time_of_day` ("HH:MM").
    pub fn report(&mut self, time_of_day: &str) {
        let entities = self.entities.clone();
        if let (Some(temperature), Some(humidity)) = (self.temperature, self.humidity) {
            entities.actual_temp.set(temperature);
            entities.actual_humidity.set(humidity);
            entities.climate.set_current_temperature(temperature);
            entities.climate.set_current_humidity(humidity);
        }
        if let Some(position) = self.actual_position {
            entities.actual_position.set(position);
        }
        let (p, i, d) = self.core.pid().components();
        entities.proportional.set(round2(p));
        entities.integral.set(round2(i));
        entities.derivative.set(round2(d));

        self.apply_schedule(time_of_day);
    }

    /// Switch the setpoint when a new schedule entry becomes active. A setpoint
    /// changed by hand in between is left alone until the next boundary.
    pub fn apply_schedule(&mut self, time_of_day: &str) -> bool {
        let Some(entry) = self.schedule.active_entry(time_of_day) else {
            return false;
        };
        if self.schedule_applied.as_deref() == Some(entry.timestamp.as_str()) {
            return false;
        }
        let (timestamp, temperature) = (entry.timestamp.clone(), entry.temperature);
        tracing::info!("Schedule entry {} active, setpoint {}", timestamp, temperature);
        self.schedule_applied = Some(timestamp);

        self.core.pid().setpoint = temperature;
        self.entities.climate.set_target_temperature(temperature);
        self.entities.desired_temp.set(temperature);
        true
    }

    /// Run until shutdown, then stop the actuator driver and wait for it.
    pub async fn run(mut self, mut actuator: JoinHandle<()>, mut shutdown: ShutdownListener) {
        tracing::info!(
            "Control loop started (update {:?}, report {:?})",
            self.update_period,
            self.report_period
        );
        let mut next_report = Instant::now();
        loop {
            let started = Instant::now();
            self.tick(started);
            if started >= next_report {
                self.report(&local_time_of_day());
                next_report = started + self.report_period;
            }

            let wait = self.update_period.saturating_sub(started.elapsed());
            tokio::select! {
                _ = shutdown.triggered() => {
                    tracing::info!("Control loop shutting down");
                    break;
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }

        self.core.send(MotorCommand::Shutdown);
        match tokio::time::timeout(ACTUATOR_STOP_TIMEOUT, &mut actuator).await {
            Ok(Ok(())) => tracing::info!("Actuator driver stopped"),
            Ok(Err(e)) => tracing::error!("Actuator driver task failed: {}", e),
            Err(_) => {
                tracing::error!("Actuator driver did not stop within {:?}, aborting", ACTUATOR_STOP_TIMEOUT);
                actuator.abort();
            }
        }
    }
}
