//! Numeric edge-case policies shared by the solvers and the estimator.
use ndarray::Array1;

/// Floor applied to every denominator inside the CG recurrence.
pub const CG_DENOMINATOR_EPSILON: f64 = 1e-10;

/// A Neumann term whose squared size relative to the previous one exceeds this
/// value ends the series.
pub const NEUMANN_STALL_THRESHOLD: f64 = 0.9999;

/// Denominators below half the floor (including negative ones) are replaced by
/// the floor. Nothing is raised.
pub fn clamp_denominator(d: f64) -> f64 {
    if d < CG_DENOMINATOR_EPSILON / 2.0 {
        CG_DENOMINATOR_EPSILON
    } else {
        d
    }
}

pub fn neumann_stalled(rel_change: f64) -> bool {
    rel_change > NEUMANN_STALL_THRESHOLD
}

/// Replaces NaN entries with zero, returning how many were replaced.
pub fn scrub_nan(v: &mut Array1<f64>) -> usize {
    let mut count = 0;
    v.mapv_inplace(|x| {
        if x.is_nan() {
            count += 1;
            0.0
        } else {
            x
        }
    });
    count
}

/// Squashes a raw reweighting output into a strictly positive loss weight in
/// `(0.1, 2.1)`.
pub fn loss_weight(raw: f64) -> f64 {
    sigmoid(raw / 10.0) * 2.0 + 0.1
}

/// Derivative of [`loss_weight`] with respect to its raw input.
pub fn loss_weight_slope(raw: f64) -> f64 {
    let s = sigmoid(raw / 10.0);
    s * (1.0 - s) / 5.0
}

pub fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}
