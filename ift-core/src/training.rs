use crate::{
    checkpoint::CheckpointSink,
    data::{DataLoader, Splits},
    flat_grad,
    hypergrad::{hyper_step, InverseApproximation},
    metrics::MetricsSink,
    nn::TrainableModel,
    optim::{Adam, MultiStepLr, Sgd},
};
use anyhow::{ensure, Result};
use ift_structs::{
    config::TrainConfig,
    core::{Checkpoint, EvaluationReport, MetricsRow},
};
use log::{debug, info, warn};
use logging_timer::time;
use std::time::Instant;

/// Scale applied to the elementary learning rate when fine-tuning from a
/// baseline model.
pub const BASELINE_LR_FACTOR: f64 = 0.2 * 0.2 * 0.2;

/// Hyperparameters are tuned on every `num_tune_hyper`-th batch of an epoch.
pub fn is_hyper_step(batch_idx: usize, num_tune_hyper: usize) -> bool {
    batch_idx % num_tune_hyper == 0
}

pub fn is_checkpoint_step(batch_idx: usize, num_tune_hyper: usize) -> bool {
    batch_idx % (num_tune_hyper * num_tune_hyper) == 0
}

/// Alternates inner SGD steps on the classifier with outer Adam steps on the
/// hyperparameters.
pub struct Trainer<M: TrainableModel> {
    pub model: M,
    config: TrainConfig,
    sgd: Sgd,
    sgd_schedule: MultiStepLr,
    adam: Adam,
    adam_schedule: MultiStepLr,
    approximation: Option<InverseApproximation>,
    num_tune_hyper: usize,
    epoch: usize,
    iteration: usize,
    last_test: (f64, f64),
    start: Instant,
}

impl<M: TrainableModel> Trainer<M> {
    pub fn new(model: M, config: &TrainConfig) -> Result<Self> {
        ensure!(config.batch_size > 0, "batch_size must be positive");
        let approximation = InverseApproximation::from_config(&config.hyper);
        if approximation.is_some() {
            ensure!(
                model.num_hyper_parameters() > 0,
                "Hyperparameter tuning is enabled but no hyperparameter net is in use"
            );
        }
        let sgd = Sgd::new(&config.elementary_optimizer)?;
        let sgd_schedule = MultiStepLr::new(
            config.elementary_optimizer.lr,
            &config.elementary_optimizer.milestones,
            config.elementary_optimizer.gamma,
        );
        let adam = Adam::new(&config.hyper_optimizer)?;
        let adam_schedule = MultiStepLr::new(
            config.hyper_optimizer.lr,
            &config.hyper_optimizer.milestones,
            config.hyper_optimizer.gamma,
        );
        Ok(Self {
            model,
            config: config.clone(),
            sgd,
            sgd_schedule,
            adam,
            adam_schedule,
            approximation,
            num_tune_hyper: config.tune_interval(),
            epoch: 0,
            iteration: 0,
            last_test: (0.0, 0.0),
            start: Instant::now(),
        })
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn num_tune_hyper(&self) -> usize {
        self.num_tune_hyper
    }

    pub fn sgd(&self) -> &Sgd {
        &self.sgd
    }

    pub fn adam(&self) -> &Adam {
        &self.adam
    }

    /// Regularization is switched off from `stop_reg_epoch` on.
    pub fn regularize(&self) -> bool {
        self.config.use_reg() && self.epoch < self.config.hyper.stop_reg_epoch
    }

    /// Starts from a pre-trained classifier. Fine-tuning runs at a reduced
    /// elementary learning rate.
    pub fn load_baseline(&mut self, checkpoint: &Checkpoint) -> Result<()> {
        self.model
            .load_elementary_state(&checkpoint.elementary_model)?;
        self.sgd_schedule.base_lr *= BASELINE_LR_FACTOR;
        self.sgd.lr = self.sgd_schedule.base_lr;
        info!(
            "Loaded baseline model from epoch {}, elementary lr set to {}",
            checkpoint.epoch, self.sgd.lr
        );
        Ok(())
    }

    pub fn resume(&mut self, checkpoint: &Checkpoint) -> Result<()> {
        self.model
            .load_elementary_state(&checkpoint.elementary_model)?;
        self.sgd.load_state(&checkpoint.elementary_optimizer)?;
        if let Some(&base_lr) = checkpoint.elementary_base_lr() {
            self.sgd_schedule.base_lr = base_lr;
        }
        self.model.load_augment_state(&checkpoint.augment_model)?;
        match checkpoint.reweighting_model() {
            Some(state) => self.model.load_reweighting_state(state)?,
            None => warn!("Checkpoint has no reweighting net state, keeping the fresh one"),
        }
        self.adam.load_state(&checkpoint.hyper_optimizer)?;
        self.epoch = checkpoint.epoch;
        info!("Resumed from checkpoint at epoch {}", checkpoint.epoch);
        Ok(())
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            epoch: self.epoch,
            elementary_model: self.model.elementary_state(),
            elementary_optimizer: self.sgd.state(),
            augment_model: self.model.augment_state(),
            reweighting_model: self.model.reweighting_state(),
            hyper_optimizer: self.adam.state(),
            elementary_base_lr: Some(self.sgd_schedule.base_lr),
        }
    }

    /// Mean per-batch loss and accuracy over one sequential pass.
    #[time]
    pub fn evaluate(&mut self, loader: &DataLoader) -> Result<(f64, f64)> {
        let mut losses = Vec::new();
        let mut correct = 0;
        let mut total = 0;
        for batch in loader.batches() {
            let (loss, predictions) = self.model.evaluate(&batch)?;
            losses.push(loss);
            correct += count_correct(&predictions, &batch.labels);
            total += batch.len();
        }
        ensure!(total > 0, "Cannot evaluate an empty split");
        let avg_loss = losses.iter().sum::<f64>() / losses.len() as f64;
        Ok((avg_loss, correct as f64 / total as f64))
    }

    pub fn report(&mut self, splits: &Splits) -> Result<EvaluationReport> {
        let (val_loss, val_acc) = self.evaluate(&splits.validation)?;
        let (test_loss, test_acc) = self.evaluate(&splits.test)?;
        Ok(EvaluationReport {
            epoch: self.epoch,
            val_loss,
            val_acc,
            test_loss,
            test_acc,
        })
    }

    #[time]
    pub fn train_epoch(
        &mut self,
        splits: &mut Splits,
        checkpoints: &mut dyn CheckpointSink,
        metrics: &mut dyn MetricsSink,
    ) -> Result<MetricsRow> {
        let regularize = self.regularize();
        let mut train_loss_sum = 0.0;
        let mut total_val_loss = 0.0;
        let mut hyper_num = 0;
        let mut correct = 0;
        let mut total = 0;
        let mut weight_norm = 0.0;
        let mut grad_norm = 0.0;

        let batches = splits.train.shuffled_batches();
        let num_batches = batches.len();
        for (i, batch) in batches.iter().enumerate() {
            flat_grad::zero(self.model.inner_parameters_mut());
            let train = self.model.train_loss_grad(batch)?;
            train_loss_sum += train.loss;

            if let Some(approximation) = &self.approximation {
                if is_hyper_step(i, self.num_tune_hyper) {
                    let step = hyper_step(
                        &mut self.model,
                        &mut splits.validation,
                        &train,
                        self.sgd.lr,
                        regularize,
                        approximation,
                    )?;
                    self.adam.step(self.model.hyper_parameters_mut());

                    let hyper_values = flat_grad::flatten_values(self.model.hyper_parameters());
                    weight_norm = hyper_values.dot(&hyper_values).sqrt();
                    grad_norm = step.hypergrad_norm;
                    total_val_loss += step.val_loss;
                    hyper_num += 1;
                }
            }

            // The inner step always uses the training gradient, after any hyper step.
            flat_grad::unflatten_into(self.model.inner_parameters_mut(), train.flat().view())?;
            self.sgd.step(self.model.inner_parameters_mut());
            self.iteration += 1;

            correct += count_correct(&train.predictions, &batch.labels);
            total += batch.len();
            let train_loss = train_loss_sum / (i + 1) as f64;
            let accuracy = correct as f64 / total as f64;
            debug!(
                "Finetune Epoch {} [{}/{}] train={:.4} val={:.4} acc={:.4} weight={:.3} update={:.3}",
                self.epoch,
                i + 1,
                num_batches,
                train_loss,
                total_val_loss / hyper_num.max(1) as f64,
                accuracy,
                weight_norm,
                grad_norm
            );

            if is_checkpoint_step(i, self.num_tune_hyper) && self.config.hyper.use_augment_net {
                checkpoints.save(&self.checkpoint())?;
                let (val_loss, val_acc) = self.evaluate(&splits.validation)?;
                let row = self.metrics_row(train_loss, accuracy, val_loss, val_acc);
                metrics.write_row(&row)?;
            }
        }

        let (val_loss, val_acc) = self.evaluate(&splits.validation)?;
        let (test_loss, test_acc) = self.evaluate(&splits.test)?;
        self.last_test = (test_loss, test_acc);
        info!(
            "epoch {} | val loss: {:6.4} | val acc: {:6.4} | test loss: {:6.4} | test acc: {:6.4}",
            self.epoch, val_loss, val_acc, test_loss, test_acc
        );

        self.sgd.lr = self.sgd_schedule.lr_at(self.epoch);
        self.adam.lr = self.adam_schedule.lr_at(self.epoch);

        let row = self.metrics_row(
            train_loss_sum / num_batches.max(1) as f64,
            correct as f64 / total.max(1) as f64,
            val_loss,
            val_acc,
        );
        metrics.write_row(&row)?;
        self.epoch += 1;
        Ok(row)
    }

    /// Trains until `num_epochs`, returning the per-epoch rows.
    pub fn run(
        &mut self,
        splits: &mut Splits,
        checkpoints: &mut dyn CheckpointSink,
        metrics: &mut dyn MetricsSink,
    ) -> Result<Vec<MetricsRow>> {
        self.start = Instant::now();
        let (val_loss, val_acc) = self.evaluate(&splits.validation)?;
        let (test_loss, test_acc) = self.evaluate(&splits.test)?;
        self.last_test = (test_loss, test_acc);
        info!("Initial val loss: {:.4}, acc: {:.4}", val_loss, val_acc);
        info!("Initial test loss: {:.4}, acc: {:.4}", test_loss, test_acc);

        let mut rows = Vec::new();
        while self.epoch < self.config.num_epochs {
            rows.push(self.train_epoch(splits, checkpoints, metrics)?);
        }
        Ok(rows)
    }

    fn metrics_row(&self, train_loss: f64, train_acc: f64, val_loss: f64, val_acc: f64) -> MetricsRow {
        MetricsRow {
            epoch: self.epoch,
            train_loss,
            train_acc,
            val_loss,
            val_acc,
            test_loss: self.last_test.0,
            test_acc: self.last_test.1,
            run_time: self.start.elapsed().as_secs_f64(),
            iteration: self.iteration,
        }
    }
}

fn count_correct(predictions: &[usize], labels: &[usize]) -> usize {
    predictions
        .iter()
        .zip(labels.iter())
        .filter(|(p, y)| p == y)
        .count()
}
