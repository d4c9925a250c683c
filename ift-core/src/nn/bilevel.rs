use super::{
    argmax_rows, cross_entropy, matrix, one_hot, softmax, vector, AugmentNet, Parameter,
    ParameterGroup, ReweightNet, SoftmaxClassifier, TrainableModel,
};
use crate::{
    data::Batch,
    hypergrad::{ImplicitModel, RetainedGraph, TrainGradient, ValidationGradient},
};
use anyhow::{anyhow, ensure, Result};
use ift_structs::{config::TrainConfig, core::TensorState};
use ndarray::{s, Array1, Array2, Array3, ArrayD, ArrayView1, Axis, IxDyn};
use rand::{prelude::*, rngs::StdRng};
use statrs::statistics::Statistics;

#[derive(Clone, Debug, PartialEq)]
pub struct HyperOptions {
    pub use_augment: bool,
    pub use_reweight: bool,
    pub reg_weight: f64,
    pub num_reg_samples: usize,
    /// Augmented copies averaged into the logits at evaluation. Zero
    /// evaluates the clean input only.
    pub test_augment_samples: usize,
}

impl HyperOptions {
    pub fn from_config(config: &TrainConfig) -> Self {
        let use_augment = config.hyper.use_augment_net;
        Self {
            use_augment,
            use_reweight: config.hyper.use_reweighting_net,
            reg_weight: config.hyper.reg_weight,
            num_reg_samples: config.hyper.num_reg_samples,
            test_augment_samples: if use_augment && config.tuning_enabled() {
                config.test_augment_samples
            } else {
                0
            },
        }
    }

    /// The augmentation spread penalty needs a sample standard deviation.
    pub fn regularizes(&self) -> bool {
        self.use_augment && self.reg_weight != 0.0
    }
}

/// Softmax classifier trained on augmented, reweighted examples.
///
/// Inner parameters are the classifier's. Hyperparameters are the
/// augmentation net's `[scale, shift, noise]` followed by the reweighting
/// net's `[weight, bias]`, each block present only when that net is enabled.
/// Both nets always exist so their state can be checkpointed.
#[derive(Clone, Debug)]
pub struct HyperClassifier {
    pub classifier: SoftmaxClassifier,
    pub augment: AugmentNet,
    pub reweight: ReweightNet,
    pub options: HyperOptions,
    rng: StdRng,
}

impl HyperClassifier {
    pub fn new(
        input_dims: usize,
        num_classes: usize,
        options: HyperOptions,
        seed: [u8; 32],
    ) -> Result<Self> {
        ensure!(
            !options.regularizes() || options.num_reg_samples >= 2,
            "num_reg_samples must be at least 2 when regularizing, got {}",
            options.num_reg_samples
        );
        let mut rng = StdRng::from_seed(seed);
        Ok(Self {
            classifier: SoftmaxClassifier::new(input_dims, num_classes, rng.gen())?,
            augment: AugmentNet::new(input_dims),
            reweight: ReweightNet::new(input_dims),
            options,
            rng,
        })
    }

    pub fn from_config(config: &TrainConfig, seed: [u8; 32]) -> Result<Self> {
        Self::new(
            config.dataset.input_dims,
            config.dataset.num_classes,
            HyperOptions::from_config(config),
            seed,
        )
    }

    fn check_batch(&self, batch: &Batch) -> Result<()> {
        ensure!(!batch.is_empty(), "Empty batch");
        ensure!(
            batch.inputs.nrows() == batch.len(),
            "Batch has {} rows but {} labels",
            batch.inputs.nrows(),
            batch.len()
        );
        if let Some(&label) = batch
            .labels
            .iter()
            .find(|&&y| y >= self.classifier.num_classes)
        {
            return Err(anyhow!(
                "Label {} out of range for {} classes",
                label,
                self.classifier.num_classes
            ));
        }
        Ok(())
    }

    /// `reg_weight · (mean|mean_k x̃_k − x| − mean std_k x̃_k)` over
    /// `num_reg_samples` augmentations of `inputs`, with its gradient laid
    /// out like the hyperparameter group.
    fn regularizer(&mut self, inputs: &Array2<f64>) -> Result<(f64, Vec<ArrayD<f64>>)> {
        let (rows, dims) = inputs.dim();
        let mut reg = 0.0;
        let mut grads = Vec::new();
        if self.options.regularizes() {
            let k = self.options.num_reg_samples;
            let mut eps = Array3::<f64>::zeros((k, rows, dims));
            let mut augmented = Array3::<f64>::zeros((k, rows, dims));
            for i in 0..k {
                let e = self.augment.sample_noise(rows, &mut self.rng);
                augmented
                    .index_axis_mut(Axis(0), i)
                    .assign(&self.augment.forward(inputs, &e)?);
                eps.index_axis_mut(Axis(0), i).assign(&e);
            }
            let count = (rows * dims) as f64;
            let factor = self.options.reg_weight / count;

            let shift_from_input = augmented.map_axis(Axis(0), |lane| lane.iter().mean()) - inputs;
            let spread = augmented.map_axis(Axis(0), |lane| lane.iter().std_dev());
            reg = factor * (shift_from_input.mapv(f64::abs).sum() - spread.sum());

            let direction = shift_from_input.mapv(sign);
            let eps_mean = eps.map_axis(Axis(0), |lane| lane.iter().mean());
            let eps_spread = eps.map_axis(Axis(0), |lane| lane.iter().std_dev());
            let noise = vector(&self.augment.noise)?;

            let d_scale = (&direction * inputs).sum_axis(Axis(0)) * factor;
            let d_shift = direction.sum_axis(Axis(0)) * factor;
            let d_noise = ((&direction * &eps_mean).sum_axis(Axis(0))
                - &(noise.mapv(sign) * &eps_spread.sum_axis(Axis(0))))
                * factor;
            grads.extend([d_scale.into_dyn(), d_shift.into_dyn(), d_noise.into_dyn()]);
        } else if self.options.use_augment {
            grads.extend(zeros_like(self.augment.parameters()));
        }
        if self.options.use_reweight {
            grads.extend(zeros_like(self.reweight.parameters()));
        }
        Ok((reg, grads))
    }
}

impl ImplicitModel for HyperClassifier {
    fn inner_parameters(&self) -> Vec<&Parameter> {
        self.classifier.parameters()
    }

    fn inner_parameters_mut(&mut self) -> Vec<&mut Parameter> {
        self.classifier.parameters_mut()
    }

    fn hyper_parameters(&self) -> Vec<&Parameter> {
        let mut params = Vec::new();
        if self.options.use_augment {
            params.extend(self.augment.parameters());
        }
        if self.options.use_reweight {
            params.extend(self.reweight.parameters());
        }
        params
    }

    fn hyper_parameters_mut(&mut self) -> Vec<&mut Parameter> {
        let mut params = Vec::new();
        if self.options.use_augment {
            params.extend(self.augment.parameters_mut());
        }
        if self.options.use_reweight {
            params.extend(self.reweight.parameters_mut());
        }
        params
    }

    fn train_loss_grad(&mut self, batch: &Batch) -> Result<TrainGradient> {
        self.check_batch(batch)?;
        let n = batch.len() as f64;

        let eps = if self.options.use_augment {
            Some(self.augment.sample_noise(batch.len(), &mut self.rng))
        } else {
            None
        };
        let augmented = match &eps {
            Some(eps) => self.augment.forward(&batch.inputs, eps)?,
            None => batch.inputs.clone(),
        };

        let logits = self.classifier.logits(&augmented)?;
        let probs = softmax(&logits);
        let losses = cross_entropy(&logits, &batch.labels);
        // The reweighting net scores the augmented example.
        let (loss_weights, slopes) = if self.options.use_reweight {
            self.reweight.weights(&augmented)?
        } else {
            (Array1::ones(batch.len()), Array1::zeros(batch.len()))
        };
        let loss = (&losses * &loss_weights).sum() / n;

        let residual = &probs - &one_hot(&batch.labels, self.classifier.num_classes);
        let scaled = &residual * &loss_weights.view().insert_axis(Axis(1)) / n;
        let d_weight = scaled.t().dot(&augmented);
        let d_bias = scaled.sum_axis(Axis(0));

        let graph = BilevelGraph {
            inputs: batch.inputs.clone(),
            eps,
            augmented,
            weight: matrix(&self.classifier.weight)?.to_owned(),
            probs,
            residual,
            loss_weights,
            slopes,
            reweight_weight: vector(&self.reweight.weight)?.to_owned(),
            use_augment: self.options.use_augment,
            use_reweight: self.options.use_reweight,
        };
        Ok(TrainGradient {
            loss,
            grads: vec![d_weight.into_dyn(), d_bias.into_dyn()],
            predictions: argmax_rows(&logits),
            graph: Box::new(graph),
        })
    }

    fn val_loss_grad(&mut self, batch: &Batch, regularize: bool) -> Result<ValidationGradient> {
        self.check_batch(batch)?;
        let n = batch.len() as f64;

        // Validation sees the clean inputs, unweighted.
        let logits = self.classifier.logits(&batch.inputs)?;
        let residual = softmax(&logits) - &one_hot(&batch.labels, self.classifier.num_classes);
        let mut loss = cross_entropy(&logits, &batch.labels).sum() / n;
        let d_weight = residual.t().dot(&batch.inputs) / n;
        let d_bias = residual.sum_axis(Axis(0)) / n;

        let direct_grads = if regularize {
            let (reg, grads) = self.regularizer(&batch.inputs)?;
            loss += reg;
            Some(grads)
        } else {
            None
        };
        Ok(ValidationGradient {
            loss,
            inner_grads: vec![d_weight.into_dyn(), d_bias.into_dyn()],
            direct_grads,
        })
    }
}

impl TrainableModel for HyperClassifier {
    fn evaluate(&mut self, batch: &Batch) -> Result<(f64, Vec<usize>)> {
        self.check_batch(batch)?;
        let mut logits = self.classifier.logits(&batch.inputs)?;
        let k = if self.options.use_augment {
            self.options.test_augment_samples
        } else {
            0
        };
        if k > 0 {
            for _ in 0..k {
                let eps = self.augment.sample_noise(batch.len(), &mut self.rng);
                let augmented = self.augment.forward(&batch.inputs, &eps)?;
                logits += &self.classifier.logits(&augmented)?;
            }
            logits /= (k + 1) as f64;
        }
        let loss = cross_entropy(&logits, &batch.labels).sum() / batch.len() as f64;
        Ok((loss, argmax_rows(&logits)))
    }

    fn elementary_state(&self) -> Vec<TensorState> {
        self.classifier.state()
    }

    fn load_elementary_state(&mut self, state: &[TensorState]) -> Result<()> {
        self.classifier.load_state(state)
    }

    fn augment_state(&self) -> Vec<TensorState> {
        self.augment.state()
    }

    fn load_augment_state(&mut self, state: &[TensorState]) -> Result<()> {
        self.augment.load_state(state)
    }

    fn reweighting_state(&self) -> Option<Vec<TensorState>> {
        Some(self.reweight.state())
    }

    fn load_reweighting_state(&mut self, state: &[TensorState]) -> Result<()> {
        self.reweight.load_state(state)
    }
}

/// Everything the training gradient depends on, kept to differentiate it
/// with respect to the hyperparameters.
struct BilevelGraph {
    inputs: Array2<f64>,
    eps: Option<Array2<f64>>,
    augmented: Array2<f64>,
    weight: Array2<f64>,
    probs: Array2<f64>,
    residual: Array2<f64>,
    loss_weights: Array1<f64>,
    slopes: Array1<f64>,
    reweight_weight: Array1<f64>,
    use_augment: bool,
    use_reweight: bool,
}

impl RetainedGraph for BilevelGraph {
    // With upstream (V, vb) over (W, b), the contracted gradient is
    // S = (1/N) Σ_i w_i r_iᵀ u_i, u_i = V x̃_i + vb, r_i = p_i − y_i.
    // Differentiate S through x̃ (augmentation) and w (reweighting).
    fn vjp_hyper(&self, upstream: ArrayView1<f64>) -> Result<Array1<f64>> {
        let (classes, dims) = self.weight.dim();
        ensure!(
            upstream.len() == classes * dims + classes,
            "Upstream vector has {} entries but classifier holds {}",
            upstream.len(),
            classes * dims + classes
        );
        let n = self.probs.nrows() as f64;
        let v = upstream
            .slice(s![..classes * dims])
            .to_owned()
            .into_shape((classes, dims))?;
        let vb = upstream.slice(s![classes * dims..]);

        let u = self.augmented.dot(&v.t()) + &vb;
        let s = (&self.residual * &u).sum_axis(Axis(1));
        let s_slope = &s * &self.slopes;

        let mut hypergrad = Vec::new();
        if self.use_augment {
            let eps = self
                .eps
                .as_ref()
                .ok_or_else(|| anyhow!("Augmentation noise was not retained"))?;
            let pu = (&self.probs * &u).sum_axis(Axis(1)).insert_axis(Axis(1));
            let softmax_jvp = &self.probs * &(&u - &pu);
            let d_augmented = softmax_jvp.dot(&self.weight) + self.residual.dot(&v);
            let mut q = &d_augmented * &self.loss_weights.view().insert_axis(Axis(1));
            if self.use_reweight {
                q += &s_slope
                    .view()
                    .insert_axis(Axis(1))
                    .dot(&self.reweight_weight.view().insert_axis(Axis(0)));
            }
            q /= n;
            hypergrad.extend((&q * &self.inputs).sum_axis(Axis(0)).iter().cloned());
            hypergrad.extend(q.sum_axis(Axis(0)).iter().cloned());
            hypergrad.extend((&q * eps).sum_axis(Axis(0)).iter().cloned());
        }
        if self.use_reweight {
            hypergrad.extend((self.augmented.t().dot(&s_slope) / n).iter().cloned());
            hypergrad.push(s_slope.sum() / n);
        }
        Ok(Array1::from_vec(hypergrad))
    }
}

fn zeros_like(params: Vec<&Parameter>) -> Vec<ArrayD<f64>> {
    params
        .iter()
        .map(|p| ArrayD::zeros(IxDyn(p.value.shape())))
        .collect()
}

/// Subgradient of `|x|` that is zero at zero.
fn sign(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}
