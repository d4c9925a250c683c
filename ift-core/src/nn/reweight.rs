use super::{vector, Parameter, ParameterGroup};
use crate::numeric::{loss_weight, loss_weight_slope};
use anyhow::{ensure, Result};
use ndarray::{Array1, Array2};

/// Linear scorer producing one raw value per example, squashed into a loss
/// weight by [`loss_weight`].
#[derive(Clone, Debug, PartialEq)]
pub struct ReweightNet {
    pub input_dims: usize,
    pub weight: Parameter,
    pub bias: Parameter,
}

impl ReweightNet {
    pub fn new(input_dims: usize) -> Self {
        Self {
            input_dims,
            weight: Parameter::zeros("reweight.weight", &[input_dims]),
            bias: Parameter::zeros("reweight.bias", &[1]),
        }
    }

    pub fn raw(&self, inputs: &Array2<f64>) -> Result<Array1<f64>> {
        ensure!(
            inputs.ncols() == self.input_dims,
            "Expected {} input columns, got {}",
            self.input_dims,
            inputs.ncols()
        );
        let a = vector(&self.weight)?;
        let c = vector(&self.bias)?;
        Ok(inputs.dot(&a) + c[0])
    }

    /// Loss weights and their derivatives with respect to the raw scores.
    pub fn weights(&self, inputs: &Array2<f64>) -> Result<(Array1<f64>, Array1<f64>)> {
        let raw = self.raw(inputs)?;
        Ok((raw.mapv(loss_weight), raw.mapv(loss_weight_slope)))
    }
}

impl ParameterGroup for ReweightNet {
    fn parameters(&self) -> Vec<&Parameter> {
        vec![&self.weight, &self.bias]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        vec![&mut self.weight, &mut self.bias]
    }
}
