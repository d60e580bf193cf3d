// src/hardware/mod.rs - Collaborator interfaces for sensors and the actuator motor
//
// Raw device access (ADC, I2C humidity sensor, H-bridge) lives outside this crate.
// The control tasks only see these traits; `crate::simulator` provides a software rig.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Sensor read failed: {0}")]
    Read(String),
    #[error("Motor driver fault: {0}")]
    Motor(String),
}

/// Direction requested from the motor driver. Which way is "up" for the
/// actuator is decided by the configured direction sign, not here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorDirection {
    Forward,
    Reverse,
    Stopped,
}

/// Absolute actuator position (raw ADC counts).
pub trait PositionSensor: Send {
    fn read_position(&mut self) -> Result<i32, HardwareError>;
}

/// Temperature (°C) and relative humidity (%).
pub trait ClimateSensor: Send {
    fn read_temperature_humidity(&mut self) -> Result<(f64, f64), HardwareError>;
}

pub trait MotorDriver: Send {
    fn enable(&mut self) -> Result<(), HardwareError>;
    fn set_motor_direction(&mut self, direction: MotorDirection, speed: u16) -> Result<(), HardwareError>;
    fn stop_and_disable(&mut self) -> Result<(), HardwareError>;
}

impl<T: PositionSensor + ?Sized> PositionSensor for Box<T> {
    fn read_position(&mut self) -> Result<i32, HardwareError> {
        (**self).read_position()
    }
}

impl<T: ClimateSensor + ?Sized> ClimateSensor for Box<T> {
    fn read_temperature_humidity(&mut self) -> Result<(f64, f64), HardwareError> {
        (**self).read_temperature_humidity()
    }
}

impl<T: MotorDriver + ?Sized> MotorDriver for Box<T> {
    fn enable(&mut self) -> Result<(), HardwareError> {
        (**self).enable()
    }
    fn set_motor_direction(&mut self, direction: MotorDirection, speed: u16) -> Result<(), HardwareError> {
        (**self).set_motor_direction(direction, speed)
    }
    fn stop_and_disable(&mut self) -> Result<(), HardwareError> {
        (**self).stop_and_disable()
    }
}
