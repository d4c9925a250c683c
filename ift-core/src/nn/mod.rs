mod augment;
pub use augment::*;
mod bilevel;
pub use bilevel::*;
mod classifier;
pub use classifier::*;
mod reweight;
pub use reweight::*;

use crate::{data::Batch, hypergrad::ImplicitModel};
use anyhow::{anyhow, Result};
use ift_structs::core::TensorState;
use ndarray::{Array1, Array2, ArrayD, ArrayView1, ArrayView2, Axis, Ix1, Ix2, IxDyn};

#[derive(Clone, Debug, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub value: ArrayD<f64>,
    pub grad: Option<ArrayD<f64>>,
}

impl Parameter {
    pub fn new(name: &str, value: ArrayD<f64>) -> Self {
        Self {
            name: name.to_string(),
            value,
            grad: None,
        }
    }

    pub fn zeros(name: &str, shape: &[usize]) -> Self {
        Self::new(name, ArrayD::zeros(IxDyn(shape)))
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    pub fn to_state(&self) -> TensorState {
        TensorState {
            name: self.name.clone(),
            shape: self.value.shape().to_vec(),
            data: self.value.iter().cloned().collect(),
        }
    }

    pub fn load_state(&mut self, state: &TensorState) -> Result<()> {
        if state.shape != self.value.shape() {
            return Err(anyhow!(
                "Shape mismatch for parameter '{}': expected {:?}, got {:?}",
                self.name,
                self.value.shape(),
                state.shape
            ));
        }
        self.value = ArrayD::from_shape_vec(IxDyn(&state.shape), state.data.clone())
            .map_err(|e| anyhow!("Invalid tensor state for '{}': {}", self.name, e))?;
        Ok(())
    }
}

/// An ordered, fixed collection of parameters. The order defines the layout
/// of every flat vector built from the group.
pub trait ParameterGroup {
    fn parameters(&self) -> Vec<&Parameter>;
    fn parameters_mut(&mut self) -> Vec<&mut Parameter>;

    fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|p| p.len()).sum()
    }

    fn state(&self) -> Vec<TensorState> {
        self.parameters().iter().map(|p| p.to_state()).collect()
    }

    fn load_state(&mut self, state: &[TensorState]) -> Result<()> {
        let mut params = self.parameters_mut();
        if params.len() != state.len() {
            return Err(anyhow!(
                "Expected {} tensors in state, got {}",
                params.len(),
                state.len()
            ));
        }
        for (p, s) in params.iter_mut().zip(state.iter()) {
            p.load_state(s)?;
        }
        Ok(())
    }
}

impl ParameterGroup for Vec<Parameter> {
    fn parameters(&self) -> Vec<&Parameter> {
        self.iter().collect()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        self.iter_mut().collect()
    }
}

/// A bilevel model that can also be evaluated and snapshotted.
pub trait TrainableModel: ImplicitModel {
    /// Mean cross entropy over the batch and the predicted class per row.
    fn evaluate(&mut self, batch: &Batch) -> Result<(f64, Vec<usize>)>;

    fn elementary_state(&self) -> Vec<TensorState>;
    fn load_elementary_state(&mut self, state: &[TensorState]) -> Result<()>;
    fn augment_state(&self) -> Vec<TensorState>;
    fn load_augment_state(&mut self, state: &[TensorState]) -> Result<()>;
    fn reweighting_state(&self) -> Option<Vec<TensorState>>;
    fn load_reweighting_state(&mut self, state: &[TensorState]) -> Result<()>;
}

pub(crate) fn matrix(p: &Parameter) -> Result<ArrayView2<f64>> {
    p.value
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|e| anyhow!("Parameter '{}' is not a matrix: {}", p.name, e))
}

pub(crate) fn vector(p: &Parameter) -> Result<ArrayView1<f64>> {
    p.value
        .view()
        .into_dimensionality::<Ix1>()
        .map_err(|e| anyhow!("Parameter '{}' is not a vector: {}", p.name, e))
}

/// Row-wise softmax.
pub fn softmax(logits: &Array2<f64>) -> Array2<f64> {
    let mut out = logits.clone();
    for mut row in out.axis_iter_mut(Axis(0)) {
        let max = row.fold(f64::NEG_INFINITY, |a, &b| a.max(b));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
    out
}

/// Per-row cross entropy of `logits` against integer labels.
pub fn cross_entropy(logits: &Array2<f64>, labels: &[usize]) -> Array1<f64> {
    Array1::from_iter(
        logits
            .axis_iter(Axis(0))
            .zip(labels.iter())
            .map(|(row, &y)| {
                let max = row.fold(f64::NEG_INFINITY, |a, &b| a.max(b));
                let lse = max + row.mapv(|v| (v - max).exp()).sum().ln();
                lse - row[y]
            }),
    )
}

pub fn argmax_rows(logits: &Array2<f64>) -> Vec<usize> {
    logits
        .axis_iter(Axis(0))
        .map(|row| {
            let mut best = 0;
            for (j, &v) in row.iter().enumerate() {
                if v > row[best] {
                    best = j;
                }
            }
            best
        })
        .collect()
}

pub fn one_hot(labels: &[usize], num_classes: usize) -> Array2<f64> {
    let mut out = Array2::zeros((labels.len(), num_classes));
    for (i, &y) in labels.iter().enumerate() {
        out[[i, y]] = 1.0;
    }
    out
}
