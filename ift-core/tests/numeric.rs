use ift_core::numeric::{
    clamp_denominator, loss_weight, loss_weight_slope, neumann_stalled, scrub_nan,
    CG_DENOMINATOR_EPSILON,
};
use ndarray::array;

#[test]
fn test_clamp_denominator() {
    assert_eq!(clamp_denominator(0.0), CG_DENOMINATOR_EPSILON);
    assert_eq!(clamp_denominator(-5.0), CG_DENOMINATOR_EPSILON);
    assert_eq!(clamp_denominator(4e-11), CG_DENOMINATOR_EPSILON);
    // Exactly half the floor is kept.
    assert_eq!(clamp_denominator(5e-11), 5e-11);
    assert_eq!(clamp_denominator(1e-3), 1e-3);
}

#[test]
fn test_neumann_stalled() {
    assert!(!neumann_stalled(0.5));
    assert!(!neumann_stalled(0.9999));
    assert!(neumann_stalled(0.99995));
    assert!(neumann_stalled(2.0));
    assert!(!neumann_stalled(f64::NAN));
}

#[test]
fn test_scrub_nan() {
    let mut v = array![1.0, f64::NAN, -2.0, f64::NAN, f64::INFINITY];
    assert_eq!(scrub_nan(&mut v), 2);
    assert_eq!(v, array![1.0, 0.0, -2.0, 0.0, f64::INFINITY]);
}

#[test]
fn test_loss_weight_range() {
    assert!((loss_weight(0.0) - 1.1).abs() < 1e-12);
    assert!(loss_weight(-1e6) > 0.1 - 1e-12);
    assert!(loss_weight(1e6) < 2.1 + 1e-12);
    assert!((loss_weight_slope(0.0) - 0.05).abs() < 1e-12);

    let h = 1e-6;
    for &x in &[-20.0, -1.0, 0.3, 7.0] {
        let fd = (loss_weight(x + h) - loss_weight(x - h)) / (2.0 * h);
        assert!((fd - loss_weight_slope(x)).abs() < 1e-8);
    }
}
