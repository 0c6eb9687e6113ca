//! A phase-tracking PID controller with optional output and integral saturation

use serde::{Deserialize, Serialize};

use super::{clamp_opt, wrap_phase};

/// Decomposition of one PID evaluation, for diagnostics and plotting
#[derive(Serialize, Deserialize, Default, Debug, Clone, Copy, PartialEq)]
pub struct PidTerms {
    pub error: f64,
    pub proportional: f64,
    pub integral: f64,
    pub derivative: f64,
    pub output: f64,
    pub setpoint: f64,
    pub measured_value: f64,
}

/// Digital PID controller that turns a measured phase (degrees) into a
/// frequency correction rate (Hz/s).
///
/// The error is taken on the circle, so a setpoint near +180 degrees and a
/// measurement near -180 degrees produce a small error rather than a full turn.
///
/// The first call to [`DigitalPid::compute`] after construction or [`DigitalPid::reset`]
/// only establishes a time baseline and returns zero. Calls that arrive less than
/// `sample_time` after the last effective update return zero without moving the baseline.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DigitalPid {
    // User inputs
    kp: f64,
    ki: f64,
    kd: f64,
    setpoint: f64,
    sample_time: f64,
    output_min: Option<f64>,
    output_max: Option<f64>,
    integral_min: Option<f64>,
    integral_max: Option<f64>,

    // Internal state
    #[serde(skip)]
    last_error: f64,
    #[serde(skip)]
    integral: f64,
    #[serde(skip)]
    last_time: Option<f64>,
    #[serde(skip)]
    reset_pending: bool,
}

impl Default for DigitalPid {
    fn default() -> Self {
        Self::new(1.0, 0.1, 0.01, 0.0, 0.1)
    }
}

impl DigitalPid {
    pub fn new(kp: f64, ki: f64, kd: f64, setpoint: f64, sample_time: f64) -> Self {
        Self {
            kp,
            ki,
            kd,
            setpoint,
            sample_time,
            output_min: None,
            output_max: None,
            integral_min: None,
            integral_max: None,

            last_error: 0.0,
            integral: 0.0,
            last_time: None,
            reset_pending: false,
        }
    }

    pub fn configure(&mut self, kp: f64, ki: f64, kd: f64) {
        self.kp = kp;
        self.ki = ki;
        self.kd = kd;
    }

    /// Target phase in degrees
    pub fn set_setpoint(&mut self, setpoint: f64) {
        self.setpoint = setpoint;
    }

    /// Minimum time in seconds between effective updates
    pub fn set_sample_time(&mut self, sample_time: f64) {
        self.sample_time = sample_time;
    }

    pub fn set_output_limits(&mut self, min: Option<f64>, max: Option<f64>) {
        self.output_min = min;
        self.output_max = max;
    }

    /// Anti-windup bounds on the accumulated error integral
    pub fn set_integral_limits(&mut self, min: Option<f64>, max: Option<f64>) {
        self.integral_min = min;
        self.integral_max = max;
    }

    pub fn setpoint(&self) -> f64 {
        self.setpoint
    }

    pub fn gains(&self) -> (f64, f64, f64) {
        (self.kp, self.ki, self.kd)
    }

    /// Accumulated error integral (degree-seconds)
    pub fn integral(&self) -> f64 {
        self.integral
    }

    pub fn last_error(&self) -> f64 {
        self.last_error
    }

    /// Time of the last effective update, if any
    pub fn last_time(&self) -> Option<f64> {
        self.last_time
    }

    /// Clear accumulated state. The next call to `compute` re-initializes
    /// and returns zero. Gains and setpoint are kept.
    pub fn reset(&mut self) {
        self.last_error = 0.0;
        self.integral = 0.0;
        self.last_time = None;
        self.reset_pending = true;
    }

    /// Get the next correction for a measured phase at time `now` (seconds).
    pub fn compute(&mut self, measured_value: f64, now: f64) -> f64 {
        let last_time = match self.last_time {
            Some(t) if !self.reset_pending => t,
            _ => {
                self.last_time = Some(now);
                self.last_error = 0.0;
                self.integral = 0.0;
                self.reset_pending = false;
                return 0.0;
            }
        };

        // Coalesce calls that come in faster than the sample time
        let dt = now - last_time;
        if dt < self.sample_time {
            return 0.0;
        }

        let error = wrap_phase(self.setpoint - measured_value);
        let proportional = self.kp * error;

        self.integral += error * dt;
        self.integral = clamp_opt(self.integral, self.integral_min, self.integral_max);
        let integral_term = self.ki * self.integral;

        let derivative = if dt > 0.0 {
            (error - self.last_error) / dt
        } else {
            0.0
        };
        let derivative_term = self.kd * derivative;

        let output = clamp_opt(
            proportional + integral_term + derivative_term,
            self.output_min,
            self.output_max,
        );

        self.last_error = error;
        self.last_time = Some(now);

        output
    }

    /// Evaluate each term against the stored state without changing it.
    /// All zeros if the controller has not been initialized yet.
    pub fn terms(&self, measured_value: f64, now: f64) -> PidTerms {
        let Some(last_time) = self.last_time else {
            return PidTerms::default();
        };

        let error = wrap_phase(self.setpoint - measured_value);
        let proportional = self.kp * error;
        let integral = self.ki * self.integral;

        let dt = now - last_time;
        let derivative = if dt > 0.0 {
            self.kd * (error - self.last_error) / dt
        } else {
            0.0
        };

        PidTerms {
            error,
            proportional,
            integral,
            derivative,
            output: proportional + integral + derivative,
            setpoint: self.setpoint,
            measured_value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p_only() -> DigitalPid {
        DigitalPid::new(1.0, 0.0, 0.0, 0.0, 0.1)
    }

    #[test]
    fn proportional_step() {
        let mut pid = p_only();
        assert_eq!(pid.compute(10.0, 0.0), 0.0);

        let out = pid.compute(10.0, 0.2);
        assert_eq!(out, -10.0);
        assert_eq!(pid.last_error(), -10.0);
        assert_eq!(pid.last_time(), Some(0.2));
    }

    #[test]
    fn error_is_taken_on_the_circle() {
        let mut pid = DigitalPid::new(1.0, 0.0, 0.0, 170.0, 0.0);
        pid.compute(-170.0, 0.0);
        let out = pid.compute(-170.0, 1.0);
        assert_eq!(out, -20.0);
        assert_eq!(pid.terms(-170.0, 1.0).error, -20.0);

        // Every error stays within half a turn
        for (sp, meas) in [(179.0, -179.0), (-179.0, 179.0), (0.0, 180.0), (90.0, -90.0)] {
            pid.set_setpoint(sp);
            let t = pid.terms(meas, 2.0);
            assert!(t.error > -180.0 && t.error <= 180.0, "{sp} {meas} -> {}", t.error);
        }
    }

    #[test]
    fn error_stays_positive_just_above_half_turn() {
        let mut pid = DigitalPid::new(1.0, 0.0, 0.0, f64::from_bits(180f64.to_bits() + 1), 0.0);
        pid.compute(0.0, 0.0);
        let out = pid.compute(0.0, 1.0);
        assert!(out > -180.0 && out <= 180.0, "{out}");
        let e = pid.terms(0.0, 1.0).error;
        assert!(e > -180.0 && e <= 180.0, "{e}");
    }

    #[test]
    fn integral_saturates() {
        let mut pid = DigitalPid::new(0.0, 2.0, 0.0, 0.0, 0.1);
        pid.set_integral_limits(Some(-5000.0), Some(5000.0));

        let mut t = 0.0;
        pid.compute(-170.0, t);
        for _ in 0..10_000 {
            t += 0.5;
            let out = pid.compute(-170.0, t);
            let terms = pid.terms(-170.0, t);
            assert!(terms.integral <= 2.0 * 5000.0 && terms.integral >= 2.0 * -5000.0);
            assert!(out <= 10_000.0);
        }
        assert_eq!(pid.integral(), 5000.0);

        // And in the other direction
        for _ in 0..10_000 {
            t += 0.5;
            pid.compute(170.0, t);
        }
        assert_eq!(pid.integral(), -5000.0);
    }

    #[test]
    fn fast_calls_are_coalesced() {
        let mut pid = p_only();
        pid.compute(10.0, 1.0);

        assert_eq!(pid.compute(50.0, 1.04), 0.0);
        assert_eq!(pid.compute(50.0, 1.08), 0.0);
        assert_eq!(pid.last_time(), Some(1.0));
        assert_eq!(pid.last_error(), 0.0);

        // Baseline did not move, so this one is 0.12 s after it
        assert_eq!(pid.compute(50.0, 1.12), -50.0);
    }

    #[test]
    fn first_call_after_reset_is_zero() {
        let mut pid = DigitalPid::new(3.0, 1.0, 1.0, 45.0, 0.0);
        assert_eq!(pid.compute(-100.0, 5.0), 0.0);
        assert_ne!(pid.compute(-100.0, 6.0), 0.0);

        pid.reset();
        assert_eq!(pid.integral(), 0.0);
        assert_eq!(pid.last_time(), None);
        assert_eq!(pid.compute(-100.0, 7.0), 0.0);
        assert_eq!(pid.gains(), (3.0, 1.0, 1.0));
        assert_eq!(pid.setpoint(), 45.0);
        assert_ne!(pid.compute(-100.0, 8.0), 0.0);
    }

    #[test]
    fn output_saturates() {
        let mut pid = DigitalPid::new(100.0, 0.0, 0.0, 0.0, 0.0);
        pid.set_output_limits(Some(-1000.0), Some(1000.0));
        pid.compute(0.0, 0.0);
        assert_eq!(pid.compute(-90.0, 1.0), 1000.0);
        assert_eq!(pid.compute(90.0, 2.0), -1000.0);
    }

    #[test]
    fn derivative_uses_last_error() {
        let mut pid = DigitalPid::new(0.0, 0.0, 1.0, 0.0, 0.0);
        pid.compute(0.0, 0.0);
        // last_error starts at zero, so the first step sees the whole error as a change
        assert_eq!(pid.compute(-10.0, 1.0), 10.0);
        assert_eq!(pid.compute(-10.0, 2.0), 0.0);
        assert_eq!(pid.compute(-14.0, 4.0), 2.0);
    }

    #[test]
    fn terms_do_not_mutate() {
        let mut pid = DigitalPid::new(1.0, 1.0, 1.0, 0.0, 0.0);
        assert_eq!(pid.terms(10.0, 0.0), PidTerms::default());

        pid.compute(10.0, 0.0);
        pid.compute(10.0, 1.0);
        let before = (pid.integral(), pid.last_error(), pid.last_time());
        let t = pid.terms(20.0, 3.0);
        assert_eq!(before, (pid.integral(), pid.last_error(), pid.last_time()));
        assert_eq!(t.error, -20.0);
        assert_eq!(t.measured_value, 20.0);
        assert_eq!(t.integral, -10.0);
        assert_eq!(t.derivative, -5.0);
        assert_eq!(t.output, t.proportional + t.integral + t.derivative);
    }

    #[test]
    fn ser_roundtrip_drops_state() {
        let mut pid = DigitalPid::new(1.0, 0.5, 0.25, 10.0, 0.1);
        pid.set_output_limits(Some(-1.0), Some(1.0));
        pid.compute(0.0, 0.0);
        pid.compute(0.0, 1.0);

        let s = serde_json::to_string(&pid).unwrap();
        let de: DigitalPid = serde_json::from_str(&s).unwrap();
        assert_eq!(de.gains(), (1.0, 0.5, 0.25));
        assert_eq!(de.last_time(), None);
        assert_eq!(de.integral(), 0.0);
        assert_eq!(serde_json::to_string(&de).unwrap(), s);
    }
}
