//! One implicit-function-theorem hypergradient computation.
//!
//! The hypergradient of the validation loss `L_v` with respect to the
//! hyperparameters `λ` is
//!
//! ```text
//! dL_v/dλ = ∂L_v/∂λ + v · ∂²L_t/(∂w ∂λ),   v ≈ (∂L_v/∂w) H⁻¹
//! ```
//!
//! where `v` comes from a Neumann series or from CG, and the mixed term is a
//! vector-Jacobian product against the graph retained from the training
//! gradient.
use crate::{
    cg::{cg_batch, CgInfo, CgOptions},
    data::{Batch, DataLoader},
    flat_grad::{self, flatten_tensors},
    neumann::{neumann_preconditioner, NeumannInfo},
    nn::Parameter,
    numeric::scrub_nan,
};
use anyhow::{ensure, Result};
use ift_structs::config::HyperConfig;
use log::debug;
use logging_timer::time;
use ndarray::{Array1, Array3, ArrayD, ArrayView1, Axis};

/// The training-gradient computation kept alive for differentiation with
/// respect to the hyperparameters.
pub trait RetainedGraph {
    /// Returns `Σ_j upstream_j ∂g_j/∂λ`, where `g` is the flattened training
    /// gradient this graph was built from. The result is laid out like the
    /// flattened hyperparameter group.
    fn vjp_hyper(&self, upstream: ArrayView1<f64>) -> Result<Array1<f64>>;
}

pub struct TrainGradient {
    pub loss: f64,
    /// One tensor per inner parameter, in inner-parameter order.
    pub grads: Vec<ArrayD<f64>>,
    pub predictions: Vec<usize>,
    pub graph: Box<dyn RetainedGraph>,
}

impl TrainGradient {
    pub fn flat(&self) -> Array1<f64> {
        flatten_tensors(&self.grads)
    }
}

pub struct ValidationGradient {
    pub loss: f64,
    pub inner_grads: Vec<ArrayD<f64>>,
    /// Gradient of the validation loss taken directly with respect to the
    /// hyperparameters. Only present when a regularizer was requested.
    pub direct_grads: Option<Vec<ArrayD<f64>>>,
}

/// A model trained by an inner optimizer whose hyperparameters are tuned
/// through implicit differentiation.
pub trait ImplicitModel {
    fn inner_parameters(&self) -> Vec<&Parameter>;
    fn inner_parameters_mut(&mut self) -> Vec<&mut Parameter>;
    fn hyper_parameters(&self) -> Vec<&Parameter>;
    fn hyper_parameters_mut(&mut self) -> Vec<&mut Parameter>;

    fn train_loss_grad(&mut self, batch: &Batch) -> Result<TrainGradient>;
    fn val_loss_grad(&mut self, batch: &Batch, regularize: bool) -> Result<ValidationGradient>;

    fn num_hyper_parameters(&self) -> usize {
        self.hyper_parameters().iter().map(|p| p.len()).sum()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum InverseApproximation {
    Neumann { num_terms: usize },
    ConjugateGradient(CgOptions),
}

impl InverseApproximation {
    /// `None` when tuning is switched off by a negative number of terms.
    pub fn from_config(hyper: &HyperConfig) -> Option<Self> {
        if hyper.num_neumann_terms < 0 {
            None
        } else if hyper.use_cg {
            Some(Self::ConjugateGradient(CgOptions {
                rtol: hyper.cg_rtol,
                atol: hyper.cg_atol,
                max_iter: Some(hyper.cg_max_iter),
            }))
        } else {
            Some(Self::Neumann {
                num_terms: hyper.num_neumann_terms as usize,
            })
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SolverReport {
    Neumann(NeumannInfo),
    ConjugateGradient(CgInfo),
}

#[derive(Clone, Debug)]
pub struct HyperStep {
    pub val_loss: f64,
    pub hypergrad_norm: f64,
    pub hypergrad: Array1<f64>,
    pub solver: SolverReport,
}

/// Estimates the hypergradient and stores it in the gradient slots of the
/// model's hyperparameters. Exactly one validation batch is drawn.
#[time]
pub fn hyper_step<M: ImplicitModel + ?Sized>(
    model: &mut M,
    val_loader: &mut DataLoader,
    train: &TrainGradient,
    elementary_lr: f64,
    regularize: bool,
    approximation: &InverseApproximation,
) -> Result<HyperStep> {
    let num_hypers = model.num_hyper_parameters();
    ensure!(num_hypers > 0, "Hyperparameter group is empty");
    flat_grad::zero(model.hyper_parameters_mut());

    let d_train_loss_d_w = train.flat();

    let batch = val_loader.next_batch()?;
    let val = model.val_loss_grad(&batch, regularize)?;
    let d_val_loss_d_theta = flatten_tensors(&val.inner_grads);
    ensure!(
        d_val_loss_d_theta.len() == d_train_loss_d_w.len(),
        "Validation gradient has {} entries but training gradient has {}",
        d_val_loss_d_theta.len(),
        d_train_loss_d_w.len()
    );

    let mut direct_grad = Array1::zeros(num_hypers);
    if regularize {
        if let Some(direct) = &val.direct_grads {
            direct_grad = flatten_tensors(direct);
            let scrubbed = scrub_nan(&mut direct_grad);
            if scrubbed > 0 {
                debug!("Zeroed {} NaN entries of the direct gradient", scrubbed);
            }
        }
    }
    ensure!(
        direct_grad.len() == num_hypers,
        "Direct gradient has {} entries but hyperparameters hold {}",
        direct_grad.len(),
        num_hypers
    );

    let (preconditioner, solver) = match approximation {
        InverseApproximation::Neumann { num_terms } => {
            let (preconditioner, info) = neumann_preconditioner(
                d_val_loss_d_theta.view(),
                d_train_loss_d_w.view(),
                elementary_lr,
                *num_terms,
            );
            (preconditioner, SolverReport::Neumann(info))
        }
        InverseApproximation::ConjugateGradient(opts) => {
            let n = d_val_loss_d_theta.len();
            let g = d_val_loss_d_theta.view().insert_axis(Axis(0)).insert_axis(Axis(2));
            // Rank-1 surrogate: A(v) = g (g·v)
            let rank_one = |v: &Array3<f64>| -> Array3<f64> {
                let projection = (v * &g).sum_axis(Axis(1)).insert_axis(Axis(1));
                &g * &projection
            };
            let rhs = d_val_loss_d_theta.clone().into_shape((1, n, 1))?;
            let (x, info) = cg_batch(&rank_one, &rhs, None, None, opts)?;
            (
                Array1::from_iter(x.iter().cloned()),
                SolverReport::ConjugateGradient(info),
            )
        }
    };

    let indirect_grad = train.graph.vjp_hyper(preconditioner.view())?;
    ensure!(
        indirect_grad.len() == num_hypers,
        "Indirect gradient has {} entries but hyperparameters hold {}",
        indirect_grad.len(),
        num_hypers
    );
    let hypergrad = &direct_grad + &indirect_grad;
    flat_grad::unflatten_into(model.hyper_parameters_mut(), hypergrad.view())?;

    let hypergrad_norm = hypergrad.dot(&hypergrad).sqrt();
    Ok(HyperStep {
        val_loss: val.loss,
        hypergrad_norm,
        hypergrad,
        solver,
    })
}
