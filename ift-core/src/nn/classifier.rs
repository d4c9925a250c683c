use super::{matrix, vector, Parameter, ParameterGroup};
use anyhow::{ensure, Result};
use ndarray::{Array2, ArrayD, IxDyn};
use rand::{prelude::*, rngs::StdRng};

/// Linear softmax classifier `z = x Wᵀ + b`. Inner parameter order is
/// `[weight, bias]`.
#[derive(Clone, Debug, PartialEq)]
pub struct SoftmaxClassifier {
    pub input_dims: usize,
    pub num_classes: usize,
    pub weight: Parameter,
    pub bias: Parameter,
}

impl SoftmaxClassifier {
    /// Uniform initialisation in `±1/√input_dims`.
    pub fn new(input_dims: usize, num_classes: usize, seed: [u8; 32]) -> Result<Self> {
        ensure!(input_dims > 0, "input_dims must be positive");
        ensure!(num_classes > 0, "num_classes must be positive");
        let mut rng = StdRng::from_seed(seed);
        let bound = 1.0 / (input_dims as f64).sqrt();
        let weight = ArrayD::from_shape_fn(IxDyn(&[num_classes, input_dims]), |_| {
            rng.gen_range(-bound..bound)
        });
        let bias = ArrayD::from_shape_fn(IxDyn(&[num_classes]), |_| rng.gen_range(-bound..bound));
        Ok(Self {
            input_dims,
            num_classes,
            weight: Parameter::new("classifier.weight", weight),
            bias: Parameter::new("classifier.bias", bias),
        })
    }

    pub fn logits(&self, inputs: &Array2<f64>) -> Result<Array2<f64>> {
        ensure!(
            inputs.ncols() == self.input_dims,
            "Expected {} input columns, got {}",
            self.input_dims,
            inputs.ncols()
        );
        let w = matrix(&self.weight)?;
        let b = vector(&self.bias)?;
        Ok(inputs.dot(&w.t()) + &b)
    }
}

impl ParameterGroup for SoftmaxClassifier {
    fn parameters(&self) -> Vec<&Parameter> {
        vec![&self.weight, &self.bias]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        vec![&mut self.weight, &mut self.bias]
    }
}
