use super::{vector, Parameter, ParameterGroup};
use anyhow::{ensure, Result};
use ndarray::{Array2, ArrayD, IxDyn};
use rand::Rng;
use rand_distr::StandardNormal;

pub const INITIAL_NOISE_SCALE: f64 = 0.1;

/// Stochastic per-feature affine augmentation
/// `x̃ = x ⊙ (1 + scale) + shift + ε ⊙ noise` with `ε ~ N(0, 1)`.
///
/// Starts as identity plus a small amount of noise.
#[derive(Clone, Debug, PartialEq)]
pub struct AugmentNet {
    pub input_dims: usize,
    pub scale: Parameter,
    pub shift: Parameter,
    pub noise: Parameter,
}

impl AugmentNet {
    pub fn new(input_dims: usize) -> Self {
        Self {
            input_dims,
            scale: Parameter::zeros("augment.scale", &[input_dims]),
            shift: Parameter::zeros("augment.shift", &[input_dims]),
            noise: Parameter::new(
                "augment.noise",
                ArrayD::from_elem(IxDyn(&[input_dims]), INITIAL_NOISE_SCALE),
            ),
        }
    }

    pub fn sample_noise<R: Rng>(&self, rows: usize, rng: &mut R) -> Array2<f64> {
        Array2::from_shape_fn((rows, self.input_dims), |_| rng.sample(StandardNormal))
    }

    pub fn forward(&self, inputs: &Array2<f64>, eps: &Array2<f64>) -> Result<Array2<f64>> {
        ensure!(
            inputs.dim() == eps.dim() && inputs.ncols() == self.input_dims,
            "Augmentation got inputs {:?} and noise {:?} for {} features",
            inputs.shape(),
            eps.shape(),
            self.input_dims
        );
        let scale = vector(&self.scale)?;
        let shift = vector(&self.shift)?;
        let noise = vector(&self.noise)?;
        Ok(inputs * &scale.mapv(|s| 1.0 + s) + &shift + &(eps * &noise))
    }
}

impl ParameterGroup for AugmentNet {
    fn parameters(&self) -> Vec<&Parameter> {
        vec![&self.scale, &self.shift, &self.noise]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        vec![&mut self.scale, &mut self.shift, &mut self.noise]
    }
}
