// src/simulator/mod.rs - Software stand-in for the radiator valve rig
//
// One shared plant: the actuator travels proportionally to motor speed while the
// motor is enabled, and the room temperature relaxes toward an equilibrium set by
// how far the valve is open. Reads carry noise and the position ADC occasionally
// fails, so the retry paths get exercised.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use crate::hardware::{ClimateSensor, HardwareError, MotorDirection, MotorDriver, PositionSensor};

/// Position counts per second per unit of motor speed.
const TRAVEL_RATE: f64 = 0.4;
const AMBIENT_TEMP: f64 = 12.0;
/// Temperature rise over ambient with the valve fully open.
const VALVE_GAIN: f64 = 18.0;
/// Fraction of the gap to equilibrium closed per second.
const RELAX_RATE: f64 = 0.01;
const POSITION_NOISE: f64 = 3.0;
const TEMP_NOISE: f64 = 0.05;
const READ_FAILURE_RATE: f64 = 0.005;

#[derive(Debug, Clone)]
pub struct PlantState {
    pub position: f64,
    pub temperature: f64,
    pub humidity: f64,
    pub direction: MotorDirection,
    pub speed: u16,
    pub enabled: bool,
    pos_max: f64,
    last_update: Instant,
}

impl PlantState {
    fn new(pos_max: i32) -> Self {
        Self {
            position: 0.0,
            temperature: AMBIENT_TEMP + 6.0,
            humidity: 45.0,
            direction: MotorDirection::Stopped,
            speed: 0,
            enabled: false,
            pos_max: pos_max.max(1) as f64,
            last_update: Instant::now(),
        }
    }

    /// Integrate the plant up to `now`.
    pub fn update(&mut self, now: Instant) {
        let dt = now.saturating_duration_since(self.last_update).as_secs_f64();
        self.last_update = now;

        if self.enabled {
            let sign = match self.direction {
                MotorDirection::Forward => 1.0,
                MotorDirection::Reverse => -1.0,
                MotorDirection::Stopped => 0.0,
            };
            self.position = (self.position + sign * self.speed as f64 * TRAVEL_RATE * dt).clamp(0.0, self.pos_max);
        }

        let opening = self.position / self.pos_max;
        let equilibrium = AMBIENT_TEMP + VALVE_GAIN * opening;
        self.temperature += (equilibrium - self.temperature) * (RELAX_RATE * dt).min(1.0);
        // Warmer air holds the same water at lower relative humidity.
        self.humidity = (60.0 - (self.temperature - AMBIENT_TEMP) * 1.2).clamp(20.0, 80.0);
    }
}

/// Hands out the three hardware collaborators, all backed by one plant.
#[derive(Clone)]
pub struct SimulatedRig {
    plant: Arc<Mutex<PlantState>>,
}

impl SimulatedRig {
    pub fn new(pos_max: i32) -> Self {
        tracing::info!("Simulated rig initialized (travel 0..{})", pos_max);
        Self { plant: Arc::new(Mutex::new(PlantState::new(pos_max))) }
    }

    pub fn snapshot(&self) -> PlantState {
        let mut plant = self.plant.lock().unwrap_or_else(PoisonError::into_inner);
        plant.update(Instant::now());
        plant.clone()
    }

    pub fn position_sensor(&self) -> SimPositionSensor {
        SimPositionSensor { plant: self.plant.clone() }
    }

    pub fn motor(&self) -> SimMotor {
        SimMotor { plant: self.plant.clone() }
    }

    pub fn climate_sensor(&self) -> SimClimateSensor {
        SimClimateSensor { plant: self.plant.clone() }
    }

    fn with_plant<T>(plant: &Mutex<PlantState>, f: impl FnOnce(&mut PlantState) -> T) -> T {
        let mut plant = plant.lock().unwrap_or_else(PoisonError::into_inner);
        plant.update(Instant::now());
        f(&mut plant)
    }
}

fn noise(amplitude: f64) -> f64 {
    (rand::random::<f64>() - 0.5) * 2.0 * amplitude
}

pub struct SimPositionSensor {
    plant: Arc<Mutex<PlantState>>,
}

impl PositionSensor for SimPositionSensor {
    fn read_position(&mut self) -> Result<i32, HardwareError> {
        if rand::random::<f64>() < READ_FAILURE_RATE {
            return Err(HardwareError::Read("ADC conversion timed out".to_string()));
        }
        let position = SimulatedRig::with_plant(&self.plant, |p| p.position);
        Ok((position + noise(POSITION_NOISE)).round() as i32)
    }
}

pub struct SimMotor {
    plant: Arc<Mutex<PlantState>>,
}

impl MotorDriver for SimMotor {
    fn enable(&mut self) -> Result<(), HardwareError> {
        SimulatedRig::with_plant(&self.plant, |p| p.enabled = true);
        tracing::debug!("Simulated motor enabled");
        Ok(())
    }

    fn set_motor_direction(&mut self, direction: MotorDirection, speed: u16) -> Result<(), HardwareError> {
        SimulatedRig::with_plant(&self.plant, |p| {
            p.direction = direction;
            p.speed = if direction == MotorDirection::Stopped { 0 } else { speed };
        });
        tracing::debug!("Simulated motor {:?} at {}", direction, speed);
        Ok(())
    }

    fn stop_and_disable(&mut self) -> Result<(), HardwareError> {
        SimulatedRig::with_plant(&self.plant, |p| {
            p.direction = MotorDirection::Stopped;
            p.speed = 0;
            p.enabled = false;
        });
        Ok(())
    }
}

pub struct SimClimateSensor {
    plant: Arc<Mutex<PlantState>>,
}

impl ClimateSensor for SimClimateSensor {
    fn read_temperature_humidity(&mut self) -> Result<(f64, f64), HardwareError> {
        let (temperature, humidity) = SimulatedRig::with_plant(&self.plant, |p| (p.temperature, p.humidity));
        Ok((temperature + noise(TEMP_NOISE), humidity + noise(TEMP_NOISE * 10.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_motor_moves_plant_only_when_enabled() {
        let mut plant = PlantState::new(30000);
        let start = plant.last_update;
        plant.direction = MotorDirection::Forward;
        plant.speed = 480;
        plant.update(start + Duration::from_secs(1));
        assert_eq!(plant.position, 0.0);

        plant.enabled = true;
        plant.update(start + Duration::from_secs(2));
        assert!((plant.position - 192.0).abs() < 1e-6);

        plant.direction = MotorDirection::Reverse;
        plant.update(start + Duration::from_secs(10));
        assert_eq!(plant.position, 0.0);
    }

    #[test]
    fn test_open_valve_warms_room() {
        let mut plant = PlantState::new(30000);
        let start = plant.last_update;
        plant.position = 30000.0;
        let before = plant.temperature;
        plant.update(start + Duration::from_secs(60));
        assert!(plant.temperature > before);
        assert!(plant.temperature <= AMBIENT_TEMP + VALVE_GAIN);
    }

    #[test]
    fn test_stop_and_disable() {
        let rig = SimulatedRig::new(30000);
        let mut motor = rig.motor();
        motor.enable().unwrap();
        motor.set_motor_direction(MotorDirection::Forward, 480).unwrap();
        motor.stop_and_disable().unwrap();
        let state = rig.snapshot();
        assert!(!state.enabled);
        assert_eq!(state.speed, 0);
    }
}
