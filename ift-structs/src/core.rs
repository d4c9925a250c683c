use crate::serializable_struct_with_getters;
use serde::{Deserialize, Serialize};

serializable_struct_with_getters! {
    TensorState {
        name: String,
        shape: Vec<usize>,
        data: Vec<f64>,
    }
}
impl TensorState {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

// Optimizer state
serializable_struct_with_getters! {
    SgdState {
        lr: f64,
        momentum_buffers: Vec<Option<TensorState>>,
    }
}
serializable_struct_with_getters! {
    AdamSlot {
        step: u64,
        exp_avg: TensorState,
        exp_avg_sq: TensorState,
    }
}
serializable_struct_with_getters! {
    AdamState {
        lr: f64,
        slots: Vec<Option<AdamSlot>>,
    }
}

serializable_struct_with_getters! {
    Checkpoint {
        epoch: usize,
        elementary_model: Vec<TensorState>,
        elementary_optimizer: SgdState,
        augment_model: Vec<TensorState>,
        // Absent in checkpoints written before the reweighting net existed
        reweighting_model: Option<Vec<TensorState>>,
        hyper_optimizer: AdamState,
        // Base of the elementary lr schedule, reduced when fine-tuning a baseline
        elementary_base_lr: Option<f64>,
    }
}

serializable_struct_with_getters! {
    MetricsRow {
        epoch: usize,
        train_loss: f64,
        train_acc: f64,
        val_loss: f64,
        val_acc: f64,
        test_loss: f64,
        test_acc: f64,
        run_time: f64,
        iteration: usize,
    }
}

serializable_struct_with_getters! {
    EvaluationReport {
        epoch: usize,
        val_loss: f64,
        val_acc: f64,
        test_loss: f64,
        test_acc: f64,
    }
}
