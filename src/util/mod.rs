//! Utility module
//! 
//! Phase arithmetic shared by the clock components and the scheduler.

/// Wraps any finite value into [0, 1)
pub fn wrap_phase(phase: f64) -> f64 {
    let wrapped = phase.rem_euclid(1.0);
    // rem_euclid can round up to exactly 1.0 for tiny negative inputs
    if wrapped >= 1.0 {
        0.0
    } else {
        wrapped
    }
}

/// Folds a phase difference into (-0.5, 0.5]
pub fn fold_phase_error(error: f64) -> f64 {
    let mut folded = error;
    while folded > 0.5 {
        folded -= 1.0;
    }
    while folded <= -0.5 {
        folded += 1.0;
    }
    folded
}

/// Forward distance travelled from `from` to `to` on the unit circle, in [0, 1)
pub fn forward_distance(from: f64, to: f64) -> f64 {
    wrap_phase(to - from)
}

/// Whether a step from `prev` to `current` is a cycle boundary (EOC)
pub fn is_cycle_boundary(prev: f64, current: f64) -> bool {
    prev > 0.9 && current < 0.1
}

/// Converts milliseconds to seconds
pub fn ms_to_secs(ms: f64) -> f64 {
    ms / 1000.0
}
