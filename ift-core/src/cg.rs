//! Preconditioned conjugate gradient over a batch of symmetric positive
//! definite systems `A_i X_i = B_i`, where `B` has shape `(K, n, m)` and the
//! operators are only available as batched apply functions.
use crate::numeric::clamp_denominator;
use anyhow::{ensure, Result};
use log::debug;
use ndarray::{Array2, Array3, Axis};
use std::time::Instant;

pub trait LinearOperator {
    fn apply(&self, x: &Array3<f64>) -> Array3<f64>;
}

impl<F> LinearOperator for F
where
    F: Fn(&Array3<f64>) -> Array3<f64>,
{
    fn apply(&self, x: &Array3<f64>) -> Array3<f64> {
        self(x)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Identity;

impl LinearOperator for Identity {
    fn apply(&self, x: &Array3<f64>) -> Array3<f64> {
        x.clone()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CgOptions {
    pub rtol: f64,
    pub atol: f64,
    /// `None` runs up to `5n` iterations.
    pub max_iter: Option<usize>,
}

impl Default for CgOptions {
    fn default() -> Self {
        Self {
            rtol: 1e-4,
            atol: 0.0,
            max_iter: Some(5),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CgInfo {
    pub iterations: usize,
    pub converged: bool,
}

/// Runs preconditioned CG and returns the last iterate with its status.
/// Running out of iterations is reported through [`CgInfo::converged`], not
/// as an error.
pub fn cg_batch(
    a: &dyn LinearOperator,
    b: &Array3<f64>,
    m: Option<&dyn LinearOperator>,
    x0: Option<Array3<f64>>,
    opts: &CgOptions,
) -> Result<(Array3<f64>, CgInfo)> {
    let (_, n, _) = b.dim();
    let m = m.unwrap_or(&Identity);
    let x0 = match x0 {
        Some(x0) => x0,
        None => m.apply(b),
    };
    let max_iter = opts.max_iter.unwrap_or(5 * n);

    ensure!(
        opts.rtol > 0.0 || opts.atol > 0.0,
        "Either rtol ({}) or atol ({}) must be positive",
        opts.rtol,
        opts.atol
    );
    ensure!(
        x0.dim() == b.dim(),
        "Initial guess shape {:?} does not match right-hand side shape {:?}",
        x0.shape(),
        b.shape()
    );

    let mut x = x0;
    let ax = a.apply(&x);
    ensure!(
        ax.dim() == b.dim(),
        "Operator returned shape {:?} for input shape {:?}",
        ax.shape(),
        b.shape()
    );
    let mut r = b - &ax;
    let mut p = Array3::<f64>::zeros(b.raw_dim());
    let mut rz_prev: Option<Array2<f64>> = None;

    let stopping = column_norms(b).mapv(|norm| (opts.rtol * norm).max(opts.atol));
    debug!(
        "it | excess {:e} | it/s",
        max_excess(&column_norms(&(&ax - b)), &stopping)
    );

    let start = Instant::now();
    let mut info = CgInfo::default();
    for k in 1..=max_iter {
        let start_iter = Instant::now();
        let z = m.apply(&r);
        let rz = batch_dot(&r, &z);

        p = match rz_prev {
            None => z,
            Some(prev) => {
                let beta = &rz / &prev.mapv(clamp_denominator);
                &z + &(&p * &beta.insert_axis(Axis(1)))
            }
        };

        let ap = a.apply(&p);
        let alpha = &rz / &batch_dot(&p, &ap).mapv(clamp_denominator);
        let alpha = alpha.insert_axis(Axis(1));
        x = &x + &(&p * &alpha);
        r = &r - &(&ap * &alpha);
        rz_prev = Some(rz);
        let iter_secs = start_iter.elapsed().as_secs_f64();

        let residual = column_norms(&(&a.apply(&x) - b));
        debug!(
            "{:03} | {:8.6e} {:4.2}",
            k,
            max_excess(&residual, &stopping),
            1.0 / iter_secs.max(f64::EPSILON)
        );

        info.iterations = k;
        if residual.iter().zip(stopping.iter()).all(|(r, s)| r <= s) {
            info.converged = true;
            break;
        }
    }

    debug!(
        "Terminated in {} steps ({}). Took {:.3} ms.",
        info.iterations,
        if info.converged { "optimal" } else { "reached maxiter" },
        start.elapsed().as_secs_f64() * 1000.0
    );
    Ok((x, info))
}

/// Sum over the `n` axis of the elementwise product, shape `(K, m)`.
fn batch_dot(a: &Array3<f64>, b: &Array3<f64>) -> Array2<f64> {
    (a * b).sum_axis(Axis(1))
}

fn column_norms(x: &Array3<f64>) -> Array2<f64> {
    x.mapv(|v| v * v).sum_axis(Axis(1)).mapv(f64::sqrt)
}

fn max_excess(residual: &Array2<f64>, stopping: &Array2<f64>) -> f64 {
    (residual - stopping).fold(f64::NEG_INFINITY, |acc, &v| acc.max(v))
}
