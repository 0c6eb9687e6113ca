//! Frequency stepping for sweeps

use serde::{Deserialize, Serialize};

/// Spacing of frequencies across a sweep
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Spacing {
    #[default]
    Linear,
    Logarithmic,
}

/// Number of whole steps of `interval_s` that fit in `sweep_time_s`
pub fn step_count(sweep_time_s: f64, interval_s: f64) -> usize {
    if !(interval_s > 0.0) || !(sweep_time_s > 0.0) {
        return 0;
    }
    (sweep_time_s / interval_s).floor() as usize
}

/// Evenly spaced frequencies from `start_hz` toward `stop_hz`.
///
/// Step `i` is `start_hz + i * (stop_hz - start_hz) / steps`,
/// so the last step lands one increment short of `stop_hz`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrequencyLadder {
    start_hz: f64,
    increment_hz: f64,
    steps: usize,
}

impl FrequencyLadder {
    pub fn new(start_hz: f64, stop_hz: f64, steps: usize) -> Self {
        let increment_hz = if steps > 0 {
            (stop_hz - start_hz) / steps as f64
        } else {
            0.0
        };
        Self {
            start_hz,
            increment_hz,
            steps,
        }
    }

    pub fn len(&self) -> usize {
        self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps == 0
    }

    pub fn increment_hz(&self) -> f64 {
        self.increment_hz
    }

    /// Frequency of step `i`
    pub fn get(&self, i: usize) -> Option<f64> {
        (i < self.steps).then(|| self.start_hz + i as f64 * self.increment_hz)
    }

    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        (0..self.steps).filter_map(|i| self.get(i))
    }
}

/// Where a sweep is expected to be after a fraction `progress` of its duration,
/// used when the generator cannot be read back.
pub fn estimate_frequency(start_hz: f64, stop_hz: f64, progress: f64, spacing: Spacing) -> f64 {
    match spacing {
        Spacing::Linear => start_hz + (stop_hz - start_hz) * progress,
        Spacing::Logarithmic => start_hz * (stop_hz / start_hz).powf(progress),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_count_floors() {
        assert_eq!(step_count(10.0, 0.5), 20);
        assert_eq!(step_count(10.2, 0.5), 20);
        assert_eq!(step_count(0.4, 0.5), 0);
        assert_eq!(step_count(10.0, 0.0), 0);
        assert_eq!(step_count(f64::NAN, 0.5), 0);
    }

    #[test]
    fn ladder_is_linear() {
        let ladder = FrequencyLadder::new(1000.0, 2000.0, 4);
        let steps: Vec<f64> = ladder.iter().collect();
        assert_eq!(steps, vec![1000.0, 1250.0, 1500.0, 1750.0]);
        assert_eq!(ladder.get(4), None);
        assert!(FrequencyLadder::new(1.0, 2.0, 0).is_empty());
    }

    #[test]
    fn estimates_match_spacing() {
        assert_eq!(estimate_frequency(100.0, 200.0, 0.5, Spacing::Linear), 150.0);
        let f = estimate_frequency(10.0, 1000.0, 0.5, Spacing::Logarithmic);
        assert!((f - 100.0).abs() < 1e-9);
        assert_eq!(estimate_frequency(10.0, 1000.0, 0.0, Spacing::Logarithmic), 10.0);
    }
}
