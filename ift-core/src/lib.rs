pub mod cg;
pub mod checkpoint;
pub mod data;
pub mod flat_grad;
pub mod hypergrad;
pub mod metrics;
pub mod neumann;
pub mod nn;
pub mod numeric;
pub mod optim;
pub mod training;

pub use cg::{cg_batch, CgInfo, CgOptions, Identity, LinearOperator};
pub use checkpoint::{load_checkpoint, CheckpointSink, FileCheckpointSink, CHECKPOINT_FILE};
pub use data::{generate_splits, Batch, DataLoader, Splits};
pub use hypergrad::{
    hyper_step, HyperStep, ImplicitModel, InverseApproximation, RetainedGraph, SolverReport,
    TrainGradient, ValidationGradient,
};
pub use metrics::{JsonLinesSink, MetricsSink};
pub use neumann::{neumann_preconditioner, NeumannInfo};
pub use nn::{HyperClassifier, Parameter, ParameterGroup, TrainableModel};
pub use training::Trainer;
