use ift_core::{cg_batch, CgOptions, Identity};
use ndarray::{Array, Array3};

/// Batched diagonal operator, `diag` has the same shape as the iterates.
fn diagonal(diag: Array3<f64>) -> impl Fn(&Array3<f64>) -> Array3<f64> {
    move |x: &Array3<f64>| x * &diag
}

fn spd_problem() -> (Array3<f64>, Array3<f64>) {
    // K = 2 systems, n = 3, m = 2 right-hand sides each.
    let diag = Array::from_shape_fn((2, 3, 2), |(k, i, _)| (1 + k + 2 * i) as f64);
    let b = Array::from_shape_fn((2, 3, 2), |(k, i, j)| {
        k as f64 - i as f64 + 0.5 * j as f64 + 1.0
    });
    (diag, b)
}

fn opts(max_iter: Option<usize>) -> CgOptions {
    CgOptions {
        rtol: 1e-10,
        atol: 0.0,
        max_iter,
    }
}

#[test]
fn test_solves_batched_diagonal_systems() {
    let (diag, b) = spd_problem();
    let a = diagonal(diag.clone());
    let (x, info) = cg_batch(&a, &b, None, Some(Array3::zeros(b.raw_dim())), &opts(None)).unwrap();
    assert!(info.converged);
    assert!(info.iterations <= 3);
    let expected = &b / &diag;
    for (x, e) in x.iter().zip(expected.iter()) {
        assert!((x - e).abs() < 1e-8, "{} != {}", x, e);
    }
}

#[test]
fn test_identity_converges_in_one_iteration() {
    let (_, b) = spd_problem();
    let (x, info) = cg_batch(&Identity, &b, None, None, &CgOptions::default()).unwrap();
    assert!(info.converged);
    assert_eq!(info.iterations, 1);
    assert_eq!(x, b);
}

#[test]
fn test_jacobi_preconditioner() {
    let (diag, b) = spd_problem();
    let a = diagonal(diag.clone());
    let m = diagonal(diag.mapv(|d| 1.0 / d));
    let (x, info) = cg_batch(&a, &b, Some(&m), None, &CgOptions::default()).unwrap();
    assert!(info.converged);
    assert_eq!(info.iterations, 1);
    let expected = &b / &diag;
    for (x, e) in x.iter().zip(expected.iter()) {
        assert!((x - e).abs() < 1e-12);
    }
}

#[test]
fn test_reports_non_convergence() {
    let (diag, b) = spd_problem();
    let a = diagonal(diag);
    let (x, info) = cg_batch(&a, &b, None, Some(Array3::zeros(b.raw_dim())), &opts(Some(1))).unwrap();
    assert!(!info.converged);
    assert_eq!(info.iterations, 1);
    assert!(x.iter().all(|v| v.is_finite()));
}

#[test]
fn test_zero_iterations_returns_initial_guess() {
    let (diag, b) = spd_problem();
    let a = diagonal(diag);
    let x0 = Array3::from_elem(b.raw_dim(), 0.25);
    let (x, info) = cg_batch(&a, &b, None, Some(x0.clone()), &opts(Some(0))).unwrap();
    assert_eq!(info.iterations, 0);
    assert!(!info.converged);
    assert_eq!(x, x0);
}

#[test]
fn test_zero_rhs_is_handled() {
    let (diag, _) = spd_problem();
    let a = diagonal(diag);
    let b = Array3::<f64>::zeros((2, 3, 2));
    let (x, info) = cg_batch(&a, &b, None, None, &CgOptions::default()).unwrap();
    assert!(x.iter().all(|&v| v == 0.0));
    assert_eq!(info.iterations, 1);
}

#[test]
fn test_rejects_bad_arguments() {
    let (diag, b) = spd_problem();
    let a = diagonal(diag);
    let no_tolerance = CgOptions {
        rtol: 0.0,
        atol: 0.0,
        max_iter: Some(5),
    };
    assert!(cg_batch(&a, &b, None, None, &no_tolerance).is_err());

    let wrong_x0 = Array3::zeros((2, 3, 1));
    assert!(cg_batch(&a, &b, None, Some(wrong_x0), &CgOptions::default()).is_err());

    let shrink = |x: &Array3<f64>| x.slice(ndarray::s![.., ..2, ..]).to_owned();
    assert!(cg_batch(&shrink, &b, None, None, &CgOptions::default()).is_err());
}

#[test]
fn test_rank_one_operator() {
    // A(v) = g (g·v) with rhs g has the solution g / |g|².
    let g = Array::from_shape_vec((1, 4, 1), vec![1.0, -2.0, 0.5, 3.0]).unwrap();
    let g_op = g.clone();
    let a = move |v: &Array3<f64>| {
        let dot = (&g_op * v).sum();
        &g_op * dot
    };
    let (x, info) = cg_batch(&a, &g, None, None, &CgOptions::default()).unwrap();
    assert!(info.converged);
    let norm_sq = g.mapv(|v| v * v).sum();
    for (x, g) in x.iter().zip(g.iter()) {
        assert!((x - g / norm_sq).abs() < 1e-10);
    }
}
