use anyhow::Result;
use ift_core::{
    generate_splits,
    training::{is_checkpoint_step, is_hyper_step, BASELINE_LR_FACTOR},
    Batch, HyperClassifier, ImplicitModel, Parameter, ParameterGroup, RetainedGraph, Splits,
    TrainGradient, Trainer, TrainableModel, ValidationGradient,
};
use ift_structs::{
    config::{DatasetKind, TrainConfig},
    core::{Checkpoint, MetricsRow, TensorState},
};
use ndarray::{array, Array1, ArrayD, ArrayView1, IxDyn};

/// Records on which training batches a hyper step happened.
struct Recorder {
    w: Vec<Parameter>,
    lambda: Vec<Parameter>,
    train_calls: usize,
    hyper_batches: Vec<usize>,
}

struct ZeroGraph;

impl RetainedGraph for ZeroGraph {
    fn vjp_hyper(&self, _upstream: ArrayView1<f64>) -> Result<Array1<f64>> {
        Ok(array![0.0])
    }
}

impl Recorder {
    fn new() -> Self {
        Self {
            w: vec![Parameter::zeros("w", &[1])],
            lambda: vec![Parameter::zeros("lambda", &[1])],
            train_calls: 0,
            hyper_batches: Vec::new(),
        }
    }
}

impl ImplicitModel for Recorder {
    fn inner_parameters(&self) -> Vec<&Parameter> {
        self.w.iter().collect()
    }

    fn inner_parameters_mut(&mut self) -> Vec<&mut Parameter> {
        self.w.iter_mut().collect()
    }

    fn hyper_parameters(&self) -> Vec<&Parameter> {
        self.lambda.iter().collect()
    }

    fn hyper_parameters_mut(&mut self) -> Vec<&mut Parameter> {
        self.lambda.iter_mut().collect()
    }

    fn train_loss_grad(&mut self, batch: &Batch) -> Result<TrainGradient> {
        self.train_calls += 1;
        Ok(TrainGradient {
            loss: 1.0,
            grads: vec![ArrayD::from_elem(IxDyn(&[1]), 1.0)],
            predictions: batch.labels.clone(),
            graph: Box::new(ZeroGraph),
        })
    }

    fn val_loss_grad(&mut self, _batch: &Batch, _regularize: bool) -> Result<ValidationGradient> {
        self.hyper_batches.push(self.train_calls - 1);
        Ok(ValidationGradient {
            loss: 0.5,
            inner_grads: vec![ArrayD::from_elem(IxDyn(&[1]), 1.0)],
            direct_grads: None,
        })
    }
}

impl TrainableModel for Recorder {
    fn evaluate(&mut self, batch: &Batch) -> Result<(f64, Vec<usize>)> {
        Ok((0.25, batch.labels.clone()))
    }

    fn elementary_state(&self) -> Vec<TensorState> {
        self.w.state()
    }

    fn load_elementary_state(&mut self, state: &[TensorState]) -> Result<()> {
        self.w.load_state(state)
    }

    fn augment_state(&self) -> Vec<TensorState> {
        self.lambda.state()
    }

    fn load_augment_state(&mut self, state: &[TensorState]) -> Result<()> {
        self.lambda.load_state(state)
    }

    fn reweighting_state(&self) -> Option<Vec<TensorState>> {
        None
    }

    fn load_reweighting_state(&mut self, _state: &[TensorState]) -> Result<()> {
        Ok(())
    }
}

fn config(train_size: usize) -> TrainConfig {
    let mut config = TrainConfig::default();
    config.dataset.kind = DatasetKind::NoisyBlobs;
    config.dataset.input_dims = 3;
    config.dataset.num_classes = 2;
    config.dataset.train_size = train_size;
    config.dataset.validation_size = 20;
    config.dataset.test_size = 20;
    config.batch_size = 10;
    config.num_epochs = 1;
    config.num_tune_hyper = Some(2);
    config.test_augment_samples = 2;
    config.hyper.num_neumann_terms = 3;
    config.hyper.num_reg_samples = 4;
    config
}

fn splits(config: &TrainConfig) -> Splits {
    generate_splits(&config.dataset, config.batch_size, config.calc_seed()).unwrap()
}

fn classifier(config: &TrainConfig, seed: u8) -> HyperClassifier {
    HyperClassifier::from_config(config, [seed; 32]).unwrap()
}

#[test]
fn test_cadence() {
    let hyper: Vec<usize> = (0..10).filter(|&i| is_hyper_step(i, 2)).collect();
    assert_eq!(hyper, vec![0, 2, 4, 6, 8]);
    let checkpoints: Vec<usize> = (0..10).filter(|&i| is_checkpoint_step(i, 2)).collect();
    assert_eq!(checkpoints, vec![0, 4, 8]);
    assert!((0..5).all(|i| is_hyper_step(i, 1) && is_checkpoint_step(i, 1)));
}

#[test]
fn test_hyper_steps_follow_cadence() {
    let config = config(100);
    let mut splits = splits(&config);
    let mut trainer = Trainer::new(Recorder::new(), &config).unwrap();
    let mut checkpoints: Vec<Checkpoint> = Vec::new();
    let mut metrics: Vec<MetricsRow> = Vec::new();
    let rows = trainer.run(&mut splits, &mut checkpoints, &mut metrics).unwrap();

    assert_eq!(trainer.model.hyper_batches, vec![0, 2, 4, 6, 8]);
    assert_eq!(trainer.iteration(), 10);
    assert_eq!(trainer.epoch(), 1);
    assert_eq!(rows.len(), 1);
    assert_eq!(checkpoints.len(), 3);
    assert_eq!(metrics.len(), 4);
    assert_eq!(metrics.last(), rows.last());
    assert_eq!(rows[0].train_acc, 1.0);
    assert_eq!(rows[0].val_loss, 0.25);
    assert_eq!(rows[0].test_acc, 1.0);

    // SGD moved the inner weight by the constant training gradient.
    assert!(trainer.model.w[0].value.iter().all(|&w| w < 0.0));
}

#[test]
fn test_no_checkpoints_without_augmentation() {
    let mut config = config(100);
    config.hyper.use_augment_net = false;
    let mut splits = splits(&config);
    let mut trainer = Trainer::new(Recorder::new(), &config).unwrap();
    let mut checkpoints: Vec<Checkpoint> = Vec::new();
    let mut metrics: Vec<MetricsRow> = Vec::new();
    trainer.run(&mut splits, &mut checkpoints, &mut metrics).unwrap();
    assert!(checkpoints.is_empty());
    assert_eq!(metrics.len(), 1);
}

#[test]
fn test_tuning_off_skips_hyper_steps() {
    let mut config = config(100);
    config.hyper.num_neumann_terms = -1;
    let mut splits = splits(&config);
    let mut trainer = Trainer::new(Recorder::new(), &config).unwrap();
    let mut checkpoints: Vec<Checkpoint> = Vec::new();
    let mut metrics: Vec<MetricsRow> = Vec::new();
    trainer.run(&mut splits, &mut checkpoints, &mut metrics).unwrap();
    assert!(trainer.model.hyper_batches.is_empty());
    assert_eq!(trainer.iteration(), 10);
}

#[test]
fn test_tuning_requires_hyperparameters() {
    let mut config = config(40);
    config.hyper.use_augment_net = false;
    config.hyper.use_reweighting_net = false;
    assert!(Trainer::new(classifier(&config, 1), &config).is_err());
    config.hyper.num_neumann_terms = -1;
    assert!(Trainer::new(classifier(&config, 1), &config).is_ok());
}

#[test]
fn test_end_to_end_bilevel_run() {
    let config = config(40);
    let mut splits = splits(&config);
    let model = classifier(&config, 1);
    let initial_augment = model.augment.clone();
    let initial_reweight = model.reweight.clone();
    let mut trainer = Trainer::new(model, &config).unwrap();
    assert_eq!(trainer.num_tune_hyper(), 2);
    assert!(trainer.regularize());

    let mut checkpoints: Vec<Checkpoint> = Vec::new();
    let mut metrics: Vec<MetricsRow> = Vec::new();
    let rows = trainer.run(&mut splits, &mut checkpoints, &mut metrics).unwrap();

    // Four batches: hyper steps on 0 and 2, a checkpoint on 0.
    assert_eq!(rows.len(), 1);
    assert_eq!(checkpoints.len(), 1);
    assert_eq!(checkpoints[0].epoch, 0);
    assert_eq!(metrics.len(), 2);
    assert_eq!(trainer.iteration(), 4);

    let row = &rows[0];
    assert_eq!(row.epoch, 0);
    assert_eq!(row.iteration, 4);
    for value in [row.train_loss, row.val_loss, row.test_loss] {
        assert!(value.is_finite() && value > 0.0);
    }
    for value in [row.train_acc, row.val_acc, row.test_acc] {
        assert!((0.0..=1.0).contains(&value));
    }

    assert_ne!(trainer.model.augment, initial_augment);
    assert_ne!(trainer.model.reweight, initial_reweight);
    assert!(trainer.adam().state().slots.iter().all(|slot| slot.is_some()));
}

#[test]
fn test_learning_rate_schedule() {
    let mut config = config(40);
    config.num_epochs = 2;
    config.elementary_optimizer.milestones = vec![1];
    config.elementary_optimizer.gamma = 0.5;
    config.hyper_optimizer.milestones = vec![0];
    config.hyper_optimizer.gamma = 0.1;
    let mut splits = splits(&config);
    let mut trainer = Trainer::new(classifier(&config, 1), &config).unwrap();
    let mut checkpoints: Vec<Checkpoint> = Vec::new();
    let mut metrics: Vec<MetricsRow> = Vec::new();

    trainer
        .train_epoch(&mut splits, &mut checkpoints, &mut metrics)
        .unwrap();
    assert!((trainer.sgd().lr - config.elementary_optimizer.lr).abs() < 1e-15);
    assert!((trainer.adam().lr - config.hyper_optimizer.lr * 0.1).abs() < 1e-15);

    trainer
        .train_epoch(&mut splits, &mut checkpoints, &mut metrics)
        .unwrap();
    assert!((trainer.sgd().lr - config.elementary_optimizer.lr * 0.5).abs() < 1e-15);
    assert_eq!(trainer.epoch(), 2);
}

#[test]
fn test_regularization_stops_at_epoch() {
    let mut config = config(40);
    config.num_epochs = 2;
    config.hyper.stop_reg_epoch = 1;
    let mut splits = splits(&config);
    let mut trainer = Trainer::new(classifier(&config, 1), &config).unwrap();
    assert!(trainer.regularize());
    trainer
        .train_epoch(&mut splits, &mut Vec::<Checkpoint>::new(), &mut Vec::<MetricsRow>::new())
        .unwrap();
    assert!(!trainer.regularize());
}

#[test]
fn test_resume_restores_state() {
    let config = config(40);
    let mut splits = splits(&config);
    let mut trainer = Trainer::new(classifier(&config, 1), &config).unwrap();
    trainer
        .run(&mut splits, &mut Vec::<Checkpoint>::new(), &mut Vec::<MetricsRow>::new())
        .unwrap();
    let checkpoint = trainer.checkpoint();
    assert_eq!(checkpoint.epoch, 1);
    assert!(checkpoint.reweighting_model.is_some());

    let mut resumed = Trainer::new(classifier(&config, 2), &config).unwrap();
    resumed.resume(&checkpoint).unwrap();
    assert_eq!(resumed.epoch(), 1);
    // Checkpoints carry parameter values, not gradients.
    assert_eq!(resumed.model.classifier.state(), trainer.model.classifier.state());
    assert_eq!(resumed.model.augment.state(), trainer.model.augment.state());
    assert_eq!(resumed.model.reweight.state(), trainer.model.reweight.state());
    assert_eq!(resumed.sgd(), trainer.sgd());
    assert_eq!(resumed.adam(), trainer.adam());

    // Already at num_epochs, so nothing more is trained.
    let rows = resumed
        .run(&mut splits, &mut Vec::<Checkpoint>::new(), &mut Vec::<MetricsRow>::new())
        .unwrap();
    assert!(rows.is_empty());
}

#[test]
fn test_resume_without_reweighting_state() {
    let config = config(40);
    let source = Trainer::new(classifier(&config, 1), &config).unwrap();
    let mut checkpoint = source.checkpoint();
    checkpoint.reweighting_model = None;

    let fresh = classifier(&config, 2);
    let fresh_reweight = fresh.reweight.state();
    let mut resumed = Trainer::new(fresh, &config).unwrap();
    resumed.resume(&checkpoint).unwrap();
    assert_eq!(resumed.model.reweight.state(), fresh_reweight);
    assert_eq!(resumed.model.classifier.state(), source.model.classifier.state());
}

#[test]
fn test_resume_rejects_mismatched_model() {
    let config = config(40);
    let source = Trainer::new(classifier(&config, 1), &config).unwrap();
    let checkpoint = source.checkpoint();

    let mut other_config = config.clone();
    other_config.dataset.input_dims = 4;
    let mut other = Trainer::new(classifier(&other_config, 1), &other_config).unwrap();
    assert!(other.resume(&checkpoint).is_err());
}

#[test]
fn test_load_baseline_scales_learning_rate() {
    let config = config(40);
    let baseline = Trainer::new(classifier(&config, 1), &config)
        .unwrap()
        .checkpoint();
    let mut trainer = Trainer::new(classifier(&config, 2), &config).unwrap();
    trainer.load_baseline(&baseline).unwrap();
    assert_eq!(trainer.model.classifier.state(), baseline.elementary_model);
    assert!((trainer.sgd().lr - config.elementary_optimizer.lr * 0.008).abs() < 1e-15);
    assert!((BASELINE_LR_FACTOR - 0.008).abs() < 1e-15);
    assert_eq!(trainer.epoch(), 0);
}

#[test]
fn test_resume_keeps_baseline_learning_rate() {
    let mut config = config(40);
    config.num_epochs = 2;
    config.elementary_optimizer.milestones = vec![5];
    let baseline = Trainer::new(classifier(&config, 1), &config)
        .unwrap()
        .checkpoint();

    let mut uninterrupted = Trainer::new(classifier(&config, 2), &config).unwrap();
    uninterrupted.load_baseline(&baseline).unwrap();
    let mut splits_a = splits(&config);
    uninterrupted
        .run(&mut splits_a, &mut Vec::<Checkpoint>::new(), &mut Vec::<MetricsRow>::new())
        .unwrap();
    assert_eq!(uninterrupted.epoch(), 2);

    let mut first = Trainer::new(classifier(&config, 2), &config).unwrap();
    first.load_baseline(&baseline).unwrap();
    let mut splits_b = splits(&config);
    first
        .train_epoch(&mut splits_b, &mut Vec::<Checkpoint>::new(), &mut Vec::<MetricsRow>::new())
        .unwrap();
    let checkpoint = first.checkpoint();
    assert_eq!(checkpoint.epoch, 1);
    assert_eq!(
        checkpoint.elementary_base_lr,
        Some(config.elementary_optimizer.lr * BASELINE_LR_FACTOR)
    );

    let mut resumed = Trainer::new(classifier(&config, 3), &config).unwrap();
    resumed.resume(&checkpoint).unwrap();
    resumed
        .run(&mut splits_b, &mut Vec::<Checkpoint>::new(), &mut Vec::<MetricsRow>::new())
        .unwrap();
    assert_eq!(resumed.epoch(), 2);

    let expected = config.elementary_optimizer.lr * BASELINE_LR_FACTOR;
    assert!((uninterrupted.sgd().lr - expected).abs() < 1e-15);
    assert!((resumed.sgd().lr - uninterrupted.sgd().lr).abs() < 1e-15);
}
