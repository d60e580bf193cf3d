//! Actuator side of the controller: the driver task and the two queues that
//! connect it to the control loop.
//!
//! Both queues are unbounded and drained fully, without blocking, once per
//! consumer tick. Only the newest position matters, so bursts coalesce.

pub mod driver;

use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, error::TryRecvError};

use crate::config::ActuatorConfig;

pub use driver::{ActuatorDriver, ActuatorState, MotorGuard};

/// Control loop -> driver.
#[derive(Debug, Clone, PartialEq)]
pub enum MotorCommand {
    SetPosition(i32),
    UpdateSettings(ActuatorSettings),
    Shutdown,
}

/// Driver -> control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackSample {
    ActualPosition(i32),
}

/// Runtime tuning of the driver, replaceable through `MotorCommand::UpdateSettings`.
#[derive(Debug, Clone, PartialEq)]
pub struct ActuatorSettings {
    pub pos_margin: i32,
    pub speed: u16,
    pub up_dir: i8,
    pub filter_offset: i32,
    pub idle_filter_limit: i32,
    pub reversal_dwell: Duration,
    pub moving_tick: Duration,
    pub idle_tick: Duration,
    pub feedback_interval: Duration,
}

impl From<&ActuatorConfig> for ActuatorSettings {
    fn from(config: &ActuatorConfig) -> Self {
        Self {
            pos_margin: config.pos_margin,
            speed: config.speed,
            up_dir: config.up_dir,
            filter_offset: config.filter_offset,
            idle_filter_limit: config.idle_filter_limit,
            reversal_dwell: Duration::from_secs_f64(config.reversal_dwell_secs),
            moving_tick: Duration::from_secs_f64(config.moving_tick_secs),
            idle_tick: Duration::from_secs_f64(config.idle_tick_secs),
            feedback_interval: Duration::from_secs_f64(config.feedback_interval_secs),
        }
    }
}

impl Default for ActuatorSettings {
    fn default() -> Self {
        Self::from(&ActuatorConfig::default())
    }
}

pub type CommandSender = UnboundedSender<MotorCommand>;
pub type CommandReceiver = UnboundedReceiver<MotorCommand>;
pub type FeedbackSender = UnboundedSender<FeedbackSample>;
pub type FeedbackReceiver = UnboundedReceiver<FeedbackSample>;

pub fn command_queue() -> (CommandSender, CommandReceiver) {
    mpsc::unbounded_channel()
}

pub fn feedback_queue() -> (FeedbackSender, FeedbackReceiver) {
    mpsc::unbounded_channel()
}

/// Everything the driver picked up from one drain of the command queue.
#[derive(Debug, Default, PartialEq)]
pub struct CommandBatch {
    pub target: Option<i32>,
    pub settings: Option<ActuatorSettings>,
    /// Set on an explicit `Shutdown` or when every sender is gone.
    pub shutdown: bool,
}

/// Drain the command queue. Later positions and settings replace earlier ones;
/// anything queued after a `Shutdown` is left unread.
pub fn drain_commands(rx: &mut CommandReceiver) -> CommandBatch {
    let mut batch = CommandBatch::default();
    loop {
        match rx.try_recv() {
            Ok(MotorCommand::SetPosition(position)) => batch.target = Some(position),
            Ok(MotorCommand::UpdateSettings(settings)) => batch.settings = Some(settings),
            Ok(MotorCommand::Shutdown) => {
                batch.shutdown = true;
                break;
            }
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Disconnected) => {
                batch.shutdown = true;
                break;
            }
        }
    }
    batch
}

/// Drain the feedback queue down to the most recent actual position.
pub fn drain_feedback(rx: &mut FeedbackReceiver) -> Option<i32> {
    let mut latest = None;
    while let Ok(FeedbackSample::ActualPosition(position)) = rx.try_recv() {
        latest = Some(position);
    }
    latest
}
