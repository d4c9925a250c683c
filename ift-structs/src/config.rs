use crate::serializable_struct_with_getters;
use ift_utils::u8s_from_str;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    Blobs,
    NoisyBlobs,
}

impl DatasetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetKind::Blobs => "blobs",
            DatasetKind::NoisyBlobs => "noisy_blobs",
        }
    }
}

serializable_struct_with_getters! {
    TrainConfig {
        dataset: DatasetConfig,
        batch_size: usize,
        num_epochs: usize,
        seed: u64,
        hyper: HyperConfig,
        elementary_optimizer: SgdConfig,
        hyper_optimizer: AdamConfig,
        test_augment_samples: usize,
        num_tune_hyper: Option<usize>,
    }
}
serializable_struct_with_getters! {
    DatasetConfig {
        kind: DatasetKind,
        input_dims: usize,
        num_classes: usize,
        train_size: usize,
        validation_size: usize,
        test_size: usize,
        label_noise: f64,
        class_separation: f64,
    }
}
serializable_struct_with_getters! {
    HyperConfig {
        use_augment_net: bool,
        use_reweighting_net: bool,
        num_neumann_terms: i32,
        use_cg: bool,
        cg_max_iter: usize,
        cg_rtol: f64,
        cg_atol: f64,
        reg_weight: f64,
        stop_reg_epoch: usize,
        num_reg_samples: usize,
    }
}
serializable_struct_with_getters! {
    SgdConfig {
        lr: f64,
        momentum: f64,
        weight_decay: f64,
        nesterov: bool,
        milestones: Vec<usize>,
        gamma: f64,
    }
}
serializable_struct_with_getters! {
    AdamConfig {
        lr: f64,
        beta1: f64,
        beta2: f64,
        eps: f64,
        milestones: Vec<usize>,
        gamma: f64,
    }
}

impl TrainConfig {
    pub fn calc_seed(&self) -> [u8; 32] {
        u8s_from_str(&self.seed.to_string())
    }

    /// Number of training batches per hyperparameter step. Defaults to the
    /// ratio of training to validation set size.
    pub fn tune_interval(&self) -> usize {
        match self.num_tune_hyper() {
            Some(&n) => n.max(1),
            None => (self.dataset.train_size / self.dataset.validation_size.max(1)).max(1),
        }
    }

    /// A negative number of Neumann terms switches hyperparameter tuning off.
    pub fn tuning_enabled(&self) -> bool {
        self.hyper.num_neumann_terms >= 0
    }

    pub fn use_reg(&self) -> bool {
        self.hyper.use_augment_net && self.hyper.reg_weight != 0.0
    }

    pub fn run_id(&self) -> String {
        let solver = if !self.tuning_enabled() {
            "notune".to_string()
        } else if self.hyper.use_cg {
            format!("cg{}", self.hyper.cg_max_iter)
        } else {
            format!("neumann{}", self.hyper.num_neumann_terms)
        };
        format!(
            "{}_aug{}_rw{}_{}_reg{}_lr{}_hlr{}_seed{}",
            self.dataset.kind.as_str(),
            self.hyper.use_augment_net as u8,
            self.hyper.use_reweighting_net as u8,
            solver,
            self.hyper.reg_weight,
            self.elementary_optimizer.lr,
            self.hyper_optimizer.lr,
            self.seed
        )
    }
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            dataset: DatasetConfig::default(),
            batch_size: 128,
            num_epochs: 20,
            seed: 7777,
            hyper: HyperConfig::default(),
            elementary_optimizer: SgdConfig::default(),
            hyper_optimizer: AdamConfig::default(),
            test_augment_samples: 10,
            num_tune_hyper: None,
        }
    }
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            kind: DatasetKind::NoisyBlobs,
            input_dims: 16,
            num_classes: 4,
            train_size: 4500,
            validation_size: 500,
            test_size: 1000,
            label_noise: 0.2,
            class_separation: 2.0,
        }
    }
}

impl Default for HyperConfig {
    fn default() -> Self {
        Self {
            use_augment_net: true,
            use_reweighting_net: true,
            num_neumann_terms: 3,
            use_cg: false,
            cg_max_iter: 5,
            cg_rtol: 1e-4,
            cg_atol: 0.0,
            reg_weight: 0.5,
            stop_reg_epoch: 200,
            num_reg_samples: 10,
        }
    }
}

impl Default for SgdConfig {
    fn default() -> Self {
        Self {
            lr: 0.1,
            momentum: 0.9,
            weight_decay: 5e-4,
            nesterov: true,
            milestones: vec![60, 120, 160],
            gamma: 0.2,
        }
    }
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            milestones: vec![40, 100, 140],
            gamma: 0.2,
        }
    }
}
