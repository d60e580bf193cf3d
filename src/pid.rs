// src/pid.rs - PID controller mapping temperature error to actuator position
use std::time::{Duration, Instant};

/// Index into the `(kp, ki, kd)` tuning tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gain {
    Proportional = 0,
    Integral = 1,
    Derivative = 2,
}

#[derive(Debug, Clone)]
pub struct Pid {
    /// PID parameters (kp, ki, kd)
    tunings: [f64; 3],
    pub setpoint: f64,
    output_limits: (f64, f64),
    sample_time: Option<Duration>,
    auto_mode: bool,

    /// PID state
    proportional: f64,
    integral: f64,
    derivative: f64,
    last_error: Option<f64>,
    last_time: Option<Instant>,
    last_output: Option<f64>,
}

impl Pid {
    pub fn new(kp: f64, ki: f64, kd: f64, setpoint: f64) -> Self {
        Self {
            tunings: [kp, ki, kd],
            setpoint,
            output_limits: (f64::NEG_INFINITY, f64::INFINITY),
            sample_time: None,
            auto_mode: true,
            proportional: 0.0,
            integral: 0.0,
            derivative: 0.0,
            last_error: None,
            last_time: None,
            last_output: None,
        }
    }

    pub fn with_output_limits(mut self, lower: f64, upper: f64) -> Self {
        self.output_limits = (lower, upper);
        self.integral = self.clamp(self.integral);
        self
    }

    pub fn with_sample_time(mut self, sample_time: Duration) -> Self {
        self.sample_time = Some(sample_time);
        self
    }

    pub fn with_auto_mode(mut self, enabled: bool) -> Self {
        self.auto_mode = enabled;
        self
    }

    fn clamp(&self, value: f64) -> f64 {
        let (lower, upper) = self.output_limits;
        value.max(lower).min(upper)
    }

    /// Feed a new measurement. Returns the last output without recomputing when
    /// called within `sample_time` of the previous evaluation or in manual mode.
    pub fn update(&mut self, measurement: f64, now: Instant) -> Option<f64> {
        if !self.auto_mode {
            return self.last_output;
        }

        let dt = match self.last_time {
            Some(prev) => now.saturating_duration_since(prev).as_secs_f64(),
            None => 1e-16,
        };
        if let (Some(sample_time), Some(_)) = (self.sample_time, self.last_output) {
            if dt < sample_time.as_secs_f64() {
                return self.last_output;
            }
        }
        let dt = dt.max(1e-16);

        let [kp, ki, kd] = self.tunings;
        let error = self.setpoint - measurement;
        let d_error = error - self.last_error.unwrap_or(error);

        self.proportional = kp * error;
        // Anti-windup: the integral alone never exceeds the output range.
        self.integral = self.clamp(self.integral + ki * error * dt);
        self.derivative = kd * d_error / dt;

        let output = self.clamp(self.proportional + self.integral + self.derivative);

        self.last_output = Some(output);
        self.last_error = Some(error);
        self.last_time = Some(now);
        Some(output)
    }

    pub fn tunings(&self) -> (f64, f64, f64) {
        let [kp, ki, kd] = self.tunings;
        (kp, ki, kd)
    }

    pub fn set_tunings(&mut self, kp: f64, ki: f64, kd: f64) {
        self.tunings = [kp, ki, kd];
    }

    pub fn set_gain(&mut self, gain: Gain, value: f64) {
        self.tunings[gain as usize] = value;
        tracing::debug!("PID tunings now {:?}", self.tunings);
    }

    /// Proportional, integral and derivative terms of the last evaluation.
    pub fn components(&self) -> (f64, f64, f64) {
        (self.proportional, self.integral, self.derivative)
    }

    pub fn auto_mode(&self) -> bool {
        self.auto_mode
    }

    /// Switching from manual to auto resets the terms and seeds the integral with
    /// the last output so the position does not jump.
    pub fn set_auto_mode(&mut self, enabled: bool) {
        if enabled && !self.auto_mode {
            let seed = self.last_output.unwrap_or(0.0);
            self.reset();
            self.integral = self.clamp(seed);
        }
        self.auto_mode = enabled;
    }

    pub fn last_output(&self) -> Option<f64> {
        self.last_output
    }

    /// Reset PID controller
    pub fn reset(&mut self) {
        self.proportional = 0.0;
        self.integral = 0.0;
        self.derivative = 0.0;
        self.last_error = None;
        self.last_time = None;
        self.last_output = None;
    }
}
