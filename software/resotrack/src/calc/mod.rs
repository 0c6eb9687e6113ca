//! Calculations that run inside the control tasks.
//!
//! Nothing in here performs I/O; every function takes its inputs (including the
//! current time) explicitly so that it can be exercised without instruments.

mod ladder;
mod pid;

pub use ladder::{FrequencyLadder, Spacing, estimate_frequency, step_count};
pub use pid::{DigitalPid, PidTerms};

/// Wrap a phase difference in degrees into `(-180, 180]`,
/// i.e. the shortest angular path between two phases.
pub fn wrap_phase(deg: f64) -> f64 {
    let w = 180.0 - (180.0 - deg).rem_euclid(360.0);
    // Rounding just above +180 can land on -180
    if w <= -180.0 { w + 360.0 } else { w }
}

/// Clamp to whichever bounds are present
pub(crate) fn clamp_opt(x: f64, min: Option<f64>, max: Option<f64>) -> f64 {
    let mut y = x;
    if let Some(lo) = min {
        if y < lo {
            y = lo;
        }
    }
    if let Some(hi) = max {
        if y > hi {
            y = hi;
        }
    }
    y
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_phase_stays_in_half_open_interval() {
        let mut x = -1080.0;
        while x <= 1080.0 {
            let w = wrap_phase(x);
            assert!(w > -180.0 && w <= 180.0, "{x} wrapped to {w}");
            // Same angle modulo a full turn
            let turns = (x - w) / 360.0;
            assert!((turns - turns.round()).abs() < 1e-9, "{x} -> {w}");
            x += 7.5;
        }
    }

    #[test]
    fn wrap_phase_edges() {
        assert_eq!(wrap_phase(180.0), 180.0);
        assert_eq!(wrap_phase(-180.0), 180.0);
        assert_eq!(wrap_phase(340.0), -20.0);
        assert_eq!(wrap_phase(-340.0), 20.0);
        assert_eq!(wrap_phase(0.0), 0.0);
    }

    #[test]
    fn wrap_phase_just_above_half_turn() {
        let mut x = 180.0_f64;
        for _ in 0..8 {
            x = f64::from_bits(x.to_bits() + 1);
            let w = wrap_phase(x);
            assert!(w > -180.0 && w <= 180.0, "{x} wrapped to {w}");
        }
        let below = -180.0_f64 - 1e-13;
        assert!(wrap_phase(below) > -180.0);
    }

    #[test]
    fn clamp_opt_ignores_missing_bounds() {
        assert_eq!(clamp_opt(5.0, None, None), 5.0);
        assert_eq!(clamp_opt(5.0, None, Some(1.0)), 1.0);
        assert_eq!(clamp_opt(-5.0, Some(-1.0), None), -1.0);
    }
}
