//! Inner SGD and outer Adam optimizers with closed-form step schedules.
//!
//! Update rules follow the usual deep-learning conventions: weight decay is
//! added to the gradient, the first momentum buffer is the gradient itself,
//! and Adam corrects both moment estimates for their zero initialisation.
use crate::nn::Parameter;
use anyhow::{anyhow, ensure, Result};
use ift_structs::{
    config::{AdamConfig, SgdConfig},
    core::{AdamSlot, AdamState, SgdState, TensorState},
};
use ndarray::{ArrayD, IxDyn};

#[derive(Clone, Debug, PartialEq)]
pub struct Sgd {
    pub lr: f64,
    pub momentum: f64,
    pub weight_decay: f64,
    pub nesterov: bool,
    momentum_buffers: Vec<Option<ArrayD<f64>>>,
}

impl Sgd {
    pub fn new(config: &SgdConfig) -> Result<Self> {
        ensure!(config.lr >= 0.0, "Invalid learning rate: {}", config.lr);
        ensure!(
            !config.nesterov || config.momentum > 0.0,
            "Nesterov momentum requires a positive momentum"
        );
        Ok(Self {
            lr: config.lr,
            momentum: config.momentum,
            weight_decay: config.weight_decay,
            nesterov: config.nesterov,
            momentum_buffers: Vec::new(),
        })
    }

    /// Updates every parameter that has a gradient.
    pub fn step<'a>(&mut self, params: impl IntoIterator<Item = &'a mut Parameter>) {
        for (i, p) in params.into_iter().enumerate() {
            if self.momentum_buffers.len() <= i {
                self.momentum_buffers.resize(i + 1, None);
            }
            let grad = match &p.grad {
                Some(grad) => grad,
                None => continue,
            };
            let mut d_p = grad.clone();
            if self.weight_decay != 0.0 {
                d_p.scaled_add(self.weight_decay, &p.value);
            }
            if self.momentum != 0.0 {
                let buf = match self.momentum_buffers[i].take() {
                    Some(mut buf) => {
                        buf *= self.momentum;
                        buf += &d_p;
                        buf
                    }
                    None => d_p.clone(),
                };
                if self.nesterov {
                    d_p.scaled_add(self.momentum, &buf);
                } else {
                    d_p = buf.clone();
                }
                self.momentum_buffers[i] = Some(buf);
            }
            p.value.scaled_add(-self.lr, &d_p);
        }
    }

    pub fn state(&self) -> SgdState {
        SgdState {
            lr: self.lr,
            momentum_buffers: self
                .momentum_buffers
                .iter()
                .enumerate()
                .map(|(i, buf)| {
                    buf.as_ref()
                        .map(|b| to_tensor_state(&format!("momentum_buffer.{}", i), b))
                })
                .collect(),
        }
    }

    pub fn load_state(&mut self, state: &SgdState) -> Result<()> {
        self.lr = state.lr;
        self.momentum_buffers = state
            .momentum_buffers
            .iter()
            .map(|buf| buf.as_ref().map(from_tensor_state).transpose())
            .collect::<Result<Vec<_>>>()?;
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
struct AdamMoments {
    step: u64,
    exp_avg: ArrayD<f64>,
    exp_avg_sq: ArrayD<f64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Adam {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    slots: Vec<Option<AdamMoments>>,
}

impl Adam {
    pub fn new(config: &AdamConfig) -> Result<Self> {
        ensure!(config.lr >= 0.0, "Invalid learning rate: {}", config.lr);
        ensure!(
            (0.0..1.0).contains(&config.beta1) && (0.0..1.0).contains(&config.beta2),
            "Betas must be within [0, 1), got ({}, {})",
            config.beta1,
            config.beta2
        );
        Ok(Self {
            lr: config.lr,
            beta1: config.beta1,
            beta2: config.beta2,
            eps: config.eps,
            slots: Vec::new(),
        })
    }

    pub fn step<'a>(&mut self, params: impl IntoIterator<Item = &'a mut Parameter>) {
        for (i, p) in params.into_iter().enumerate() {
            if self.slots.len() <= i {
                self.slots.resize(i + 1, None);
            }
            let grad = match &p.grad {
                Some(grad) => grad,
                None => continue,
            };
            let slot = self.slots[i].get_or_insert_with(|| AdamMoments {
                step: 0,
                exp_avg: ArrayD::zeros(p.value.raw_dim()),
                exp_avg_sq: ArrayD::zeros(p.value.raw_dim()),
            });
            slot.step += 1;
            slot.exp_avg *= self.beta1;
            slot.exp_avg.scaled_add(1.0 - self.beta1, grad);
            slot.exp_avg_sq *= self.beta2;
            slot.exp_avg_sq
                .scaled_add(1.0 - self.beta2, &grad.mapv(|g| g * g));

            let bias_correction1 = 1.0 - self.beta1.powi(slot.step as i32);
            let bias_correction2 = 1.0 - self.beta2.powi(slot.step as i32);
            let step_size = self.lr / bias_correction1;
            let denom = slot
                .exp_avg_sq
                .mapv(|v| v.sqrt() / bias_correction2.sqrt() + self.eps);
            p.value.scaled_add(-step_size, &(&slot.exp_avg / &denom));
        }
    }

    pub fn state(&self) -> AdamState {
        AdamState {
            lr: self.lr,
            slots: self
                .slots
                .iter()
                .enumerate()
                .map(|(i, slot)| {
                    slot.as_ref().map(|s| AdamSlot {
                        step: s.step,
                        exp_avg: to_tensor_state(&format!("exp_avg.{}", i), &s.exp_avg),
                        exp_avg_sq: to_tensor_state(&format!("exp_avg_sq.{}", i), &s.exp_avg_sq),
                    })
                })
                .collect(),
        }
    }

    pub fn load_state(&mut self, state: &AdamState) -> Result<()> {
        self.lr = state.lr;
        self.slots = state
            .slots
            .iter()
            .map(|slot| {
                slot.as_ref()
                    .map(|s| {
                        Ok(AdamMoments {
                            step: s.step,
                            exp_avg: from_tensor_state(&s.exp_avg)?,
                            exp_avg_sq: from_tensor_state(&s.exp_avg_sq)?,
                        })
                    })
                    .transpose()
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(())
    }
}

/// Learning rate decayed by `gamma` at every milestone epoch.
#[derive(Clone, Debug, PartialEq)]
pub struct MultiStepLr {
    pub base_lr: f64,
    pub milestones: Vec<usize>,
    pub gamma: f64,
}

impl MultiStepLr {
    pub fn new(base_lr: f64, milestones: &[usize], gamma: f64) -> Self {
        Self {
            base_lr,
            milestones: milestones.to_vec(),
            gamma,
        }
    }

    /// Rate in effect once `epoch` has completed.
    pub fn lr_at(&self, epoch: usize) -> f64 {
        let passed = self.milestones.iter().filter(|&&m| m <= epoch).count();
        self.base_lr * self.gamma.powi(passed as i32)
    }
}

fn to_tensor_state(name: &str, tensor: &ArrayD<f64>) -> TensorState {
    TensorState {
        name: name.to_string(),
        shape: tensor.shape().to_vec(),
        data: tensor.iter().cloned().collect(),
    }
}

fn from_tensor_state(state: &TensorState) -> Result<ArrayD<f64>> {
    ArrayD::from_shape_vec(IxDyn(&state.shape), state.data.clone())
        .map_err(|e| anyhow!("Invalid tensor state '{}': {}", state.name, e))
}
