use crate::numeric::neumann_stalled;
use log::debug;
use ndarray::{Array1, ArrayView1};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct NeumannInfo {
    pub terms_used: usize,
    pub stalled: bool,
    pub rel_changes: Vec<f64>,
}

/// Truncated Neumann series approximating `g H⁻¹`, where the Hessian is
/// replaced by the outer product of the training gradient `d` with itself.
///
/// Each term multiplies the running counter by `I - lr·d dᵀ`. The series ends
/// after `num_terms` terms or as soon as a term fails to shrink the counter.
pub fn neumann_preconditioner(
    g: ArrayView1<f64>,
    d: ArrayView1<f64>,
    lr: f64,
    num_terms: usize,
) -> (Array1<f64>, NeumannInfo) {
    let mut preconditioner = g.to_owned();
    let mut counter = g.to_owned();
    let mut old_size = counter.dot(&counter);
    let mut info = NeumannInfo::default();
    debug!("term -1: size = {}", old_size);

    for i in 0..num_terms {
        let old_counter = counter.clone();
        // Two dot products, never the n×n matrix.
        let hessian_term = &d * counter.dot(&d);
        counter.scaled_add(-lr, &hessian_term);

        let size = counter.dot(&counter);
        let step = &counter - &old_counter;
        let diff = step.dot(&step);
        let rel_change = size / old_size;
        info.rel_changes.push(rel_change);
        debug!(
            "term {}: size = {}, rel_change = {}, diff = {}",
            i, size, rel_change, diff
        );
        if neumann_stalled(rel_change) {
            info.stalled = true;
            break;
        }

        preconditioner += &counter;
        old_size = size;
        info.terms_used += 1;
    }
    (preconditioner, info)
}
