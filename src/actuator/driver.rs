// src/actuator/driver.rs - Actuator state machine
//
// Turns a target position into motor direction commands. Raw position reads are
// rate limited by a state-dependent filter so sensor jitter never looks like motion,
// and a reversal dwell keeps the motor from flapping between directions.

use tokio::time::{Duration, Instant};

use super::{ActuatorSettings, CommandReceiver, FeedbackSample, FeedbackSender, drain_commands};
use crate::hardware::{MotorDirection, MotorDriver, PositionSensor};
use crate::shutdown::ShutdownListener;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActuatorState {
    Idle,
    MovingUp,
    MovingDown,
}

/// Owns the motor. Dropping the guard stops and disables it, whichever way the
/// driver task ends.
pub struct MotorGuard<M: MotorDriver> {
    motor: M,
}

impl<M: MotorDriver> MotorGuard<M> {
    pub fn new(motor: M) -> Self {
        Self { motor }
    }

    pub fn get_mut(&mut self) -> &mut M {
        &mut self.motor
    }
}

impl<M: MotorDriver> Drop for MotorGuard<M> {
    fn drop(&mut self) {
        match self.motor.stop_and_disable() {
            Ok(()) => tracing::info!("Motor stopped and disabled"),
            Err(e) => tracing::error!("Failed to stop motor: {}", e),
        }
    }
}

pub struct ActuatorDriver<P: PositionSensor, M: MotorDriver> {
    sensor: P,
    motor: MotorGuard<M>,
    settings: ActuatorSettings,
    state: ActuatorState,
    filtered: Option<i32>,
    target: Option<i32>,
    /// When the driver last entered `Idle`; reversal dwell counts from here.
    idle_since: Instant,
}

impl<P: PositionSensor, M: MotorDriver> ActuatorDriver<P, M> {
    pub fn new(sensor: P, motor: M, settings: ActuatorSettings) -> Self {
        Self {
            sensor,
            motor: MotorGuard::new(motor),
            settings,
            state: ActuatorState::Idle,
            filtered: None,
            target: None,
            idle_since: Instant::now(),
        }
    }

    pub fn state(&self) -> ActuatorState {
        self.state
    }

    pub fn filtered_position(&self) -> Option<i32> {
        self.filtered
    }

    pub fn target(&self) -> Option<i32> {
        self.target
    }

    pub fn settings(&self) -> &ActuatorSettings {
        &self.settings
    }

    pub fn set_target(&mut self, target: i32) {
        if self.target != Some(target) {
            tracing::debug!("Actuator target {:?} -> {}", self.target, target);
        }
        self.target = Some(target);
    }

    pub fn apply_settings(&mut self, settings: ActuatorSettings) {
        tracing::info!("Actuator settings updated: {:?}", settings);
        self.settings = settings;
    }

    /// Clamp a raw reading against the previous filtered value. Moving up, the
    /// estimate may rise by `filter_offset` per tick but fall by one less;
    /// moving down it is mirrored; idle is symmetric.
    pub fn filter(&self, raw: i32) -> i32 {
        let Some(previous) = self.filtered else {
            return raw;
        };
        let offset = self.settings.filter_offset;
        let (down, up) = match self.state {
            ActuatorState::MovingUp => (offset - 1, offset),
            ActuatorState::MovingDown => (offset, offset - 1),
            ActuatorState::Idle => (self.settings.idle_filter_limit, self.settings.idle_filter_limit),
        };
        raw.clamp(previous - down.max(0), previous + up.max(0))
    }

    /// Read and filter the position. One immediate retry on failure, after that
    /// the previous estimate stands.
    pub fn sample_position(&mut self) -> Option<i32> {
        let raw = match self.sensor.read_position() {
            Ok(raw) => Some(raw),
            Err(first) => {
                tracing::debug!("Position read failed ({}), retrying", first);
                match self.sensor.read_position() {
                    Ok(raw) => Some(raw),
                    Err(e) => {
                        tracing::warn!("Position read failed twice, keeping {:?}: {}", self.filtered, e);
                        None
                    }
                }
            }
        };
        if let Some(raw) = raw {
            self.filtered = Some(self.filter(raw));
        }
        self.filtered
    }

    /// Direction decision for one tick.
    pub fn step(&mut self, now: Instant) {
        let (Some(target), Some(position)) = (self.target, self.filtered) else {
            return;
        };
        let margin = self.settings.pos_margin;
        let state = self.state;

        if position < target - margin && matches!(state, ActuatorState::Idle | ActuatorState::MovingUp) {
            if state == ActuatorState::Idle && self.dwell_elapsed(now) {
                self.start(ActuatorState::MovingUp, now);
            }
        } else if position > target + margin && matches!(state, ActuatorState::Idle | ActuatorState::MovingDown) {
            if state == ActuatorState::Idle && self.dwell_elapsed(now) {
                self.start(ActuatorState::MovingDown, now);
            }
        } else if state != ActuatorState::Idle {
            // In the window, or past the target in the direction of travel.
            self.stop(now);
        }
    }

    fn dwell_elapsed(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.idle_since) > self.settings.reversal_dwell
    }

    fn direction_for(&self, state: ActuatorState) -> MotorDirection {
        let up = if self.settings.up_dir > 0 { MotorDirection::Forward } else { MotorDirection::Reverse };
        match (state, up) {
            (ActuatorState::MovingUp, up) => up,
            (ActuatorState::MovingDown, MotorDirection::Forward) => MotorDirection::Reverse,
            (ActuatorState::MovingDown, _) => MotorDirection::Forward,
            (ActuatorState::Idle, _) => MotorDirection::Stopped,
        }
    }

    fn start(&mut self, state: ActuatorState, now: Instant) {
        let direction = self.direction_for(state);
        match self.motor.get_mut().set_motor_direction(direction, self.settings.speed) {
            Ok(()) => {
                tracing::info!(
                    "Actuator {:?} -> {:?} (position {:?}, target {:?})",
                    self.state,
                    state,
                    self.filtered,
                    self.target
                );
                self.state = state;
            }
            Err(e) => {
                tracing::error!("Motor start failed: {}", e);
                self.idle_since = now;
            }
        }
    }

    fn stop(&mut self, now: Instant) {
        if let Err(e) = self.motor.get_mut().set_motor_direction(MotorDirection::Stopped, 0) {
            tracing::error!("Motor stop failed: {}", e);
        }
        tracing::info!("Actuator {:?} -> Idle at {:?} (target {:?})", self.state, self.filtered, self.target);
        self.state = ActuatorState::Idle;
        self.idle_since = now;
    }

    fn cadence(&self) -> Duration {
        match self.state {
            ActuatorState::Idle => self.settings.idle_tick,
            _ => self.settings.moving_tick,
        }
    }

    /// Drive the actuator until a `Shutdown` command, a closed command queue or
    /// the shutdown signal. The motor is stopped and disabled on return.
    pub async fn run(mut self, mut commands: CommandReceiver, feedback: FeedbackSender, mut shutdown: ShutdownListener) {
        if let Err(e) = self.motor.get_mut().enable() {
            tracing::error!("Motor enable failed, actuator driver not started: {}", e);
            return;
        }
        tracing::info!("Actuator driver started");
        self.idle_since = Instant::now();
        let mut next_feedback = Instant::now();

        loop {
            let batch = drain_commands(&mut commands);
            if let Some(settings) = batch.settings {
                self.apply_settings(settings);
            }
            if let Some(target) = batch.target {
                self.set_target(target);
            }
            if batch.shutdown {
                tracing::info!("Actuator driver received shutdown");
                break;
            }

            let now = Instant::now();
            if let Some(position) = self.sample_position() {
                if now >= next_feedback {
                    if feedback.send(FeedbackSample::ActualPosition(position)).is_err() {
                        tracing::debug!("Feedback queue closed");
                    }
                    next_feedback = now + self.settings.feedback_interval;
                }
            }
            self.step(now);

            tokio::select! {
                _ = shutdown.triggered() => {
                    tracing::info!("Actuator driver shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.cadence()) => {}
            }
        }
    }
}
