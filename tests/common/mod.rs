// Hand-written hardware doubles shared by the integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use thermo_rs::hardware::{ClimateSensor, HardwareError, MotorDirection, MotorDriver, PositionSensor};

/// Plays back queued readings, then repeats the last successful one.
#[derive(Clone)]
pub struct ScriptedPosition {
    script: Arc<Mutex<VecDeque<Option<i32>>>>,
    last: Arc<Mutex<i32>>,
}

impl ScriptedPosition {
    /// `None` entries are read failures.
    pub fn new(script: &[Option<i32>], then: i32) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.iter().copied().collect())),
            last: Arc::new(Mutex::new(then)),
        }
    }

    pub fn constant(value: i32) -> Self {
        Self::new(&[], value)
    }
}

impl PositionSensor for ScriptedPosition {
    fn read_position(&mut self) -> Result<i32, HardwareError> {
        match self.script.lock().unwrap().pop_front() {
            Some(Some(value)) => Ok(value),
            Some(None) => Err(HardwareError::Read("scripted failure".to_string())),
            None => Ok(*self.last.lock().unwrap()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorCall {
    Enable,
    Direction(MotorDirection, u16),
    StopAndDisable,
}

#[derive(Clone, Default)]
pub struct RecordingMotor {
    calls: Arc<Mutex<Vec<MotorCall>>>,
}

impl RecordingMotor {
    pub fn calls(&self) -> Vec<MotorCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Direction commands only, without enable/disable.
    pub fn directions(&self) -> Vec<MotorDirection> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                MotorCall::Direction(direction, _) => Some(direction),
                _ => None,
            })
            .collect()
    }
}

impl MotorDriver for RecordingMotor {
    fn enable(&mut self) -> Result<(), HardwareError> {
        self.calls.lock().unwrap().push(MotorCall::Enable);
        Ok(())
    }

    fn set_motor_direction(&mut self, direction: MotorDirection, speed: u16) -> Result<(), HardwareError> {
        self.calls.lock().unwrap().push(MotorCall::Direction(direction, speed));
        Ok(())
    }

    fn stop_and_disable(&mut self) -> Result<(), HardwareError> {
        self.calls.lock().unwrap().push(MotorCall::StopAndDisable);
        Ok(())
    }
}

/// Climate sensor whose reading the test can change.
#[derive(Clone)]
pub struct FixedClimate {
    reading: Arc<Mutex<(f64, f64)>>,
}

impl FixedClimate {
    pub fn new(temperature: f64, humidity: f64) -> Self {
        Self { reading: Arc::new(Mutex::new((temperature, humidity))) }
    }

    pub fn set(&self, temperature: f64, humidity: f64) {
        *self.reading.lock().unwrap() = (temperature, humidity);
    }
}

impl ClimateSensor for FixedClimate {
    fn read_temperature_humidity(&mut self) -> Result<(f64, f64), HardwareError> {
        Ok(*self.reading.lock().unwrap())
    }
}
