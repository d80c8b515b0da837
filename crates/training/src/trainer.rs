use std::{
    path::Path,
    sync::Arc,
    time::{Duration, Instant},
};

use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    DType, Device, Tensor, Var,
};

use crate::{
    checkpoint::{self, latest_label, CheckpointManifest, SaveRequest, BEST_LABEL},
    classifier::{count_parameters, ImageClassifier},
    config::{DevicePreference, NonFinitePolicy},
    data::{BlockingDataLoader, DataBatch, DataSource},
    loss::{to_runtime_error, CrossEntropyLoss, LossFunction},
    metrics::{top_k_accuracy, AverageMeter, EpochSummary, EvaluationSummary},
    observer::{
        EvaluationBatchEvent, EvaluationProgress, EvaluationTrigger, ObserverSet, Running,
        SessionSummary, TrainBatchEvent, TrainProgress, TrainingObserver,
    },
    optimizer::{clip_grad_norm, GradientScaler, OptimizerConfig, TrainerOptimizer},
    scheduler::{LRScheduler, LambdaScheduler},
    TrainingConfig, TrainingError,
};

/// Mutable session state: best accuracy only ever increases.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainingState {
    pub epoch: usize,
    pub best_accuracy: f64,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepMetrics {
    pub loss: f64,
    pub top1: f64,
    pub top5: f64,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub grad_norm: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Applied(StepMetrics),
    /// No update was applied; accumulators and the schedule are untouched.
    Skipped { reason: String },
}

pub struct Trainer<M: ImageClassifier> {
    config: TrainingConfig,
    device: Device,
    model: M,
    train_source: Arc<dyn DataSource>,
    val_source: Arc<dyn DataSource>,
    trainable: Vec<(String, Var)>,
    optimizer: TrainerOptimizer,
    scheduler: LambdaScheduler,
    scaler: GradientScaler,
    loss: Box<dyn LossFunction>,
    observers: ObserverSet,
    state: TrainingState,
    start_epoch: usize,
}

impl<M: ImageClassifier> Trainer<M> {
    pub fn new(
        config: TrainingConfig,
        model: M,
        train_source: Box<dyn DataSource>,
        val_source: Box<dyn DataSource>,
        device: Device,
    ) -> Result<Self, TrainingError> {
        config.validate()?;

        let num_classes = config.num_classes();
        if model.num_classes() != num_classes {
            return Err(TrainingError::validation(vec![format!(
                "model predicts {} classes but {} has {}",
                model.num_classes(),
                config.data.dataset,
                num_classes
            )]));
        }

        let num_batches = train_source.num_batches();
        if num_batches == 0 {
            return Err(TrainingError::initialization("training stream is empty"));
        }
        if val_source.num_batches() == 0 {
            return Err(TrainingError::initialization("validation stream is empty"));
        }

        let trainable = model.trainable_parameters();
        if trainable.is_empty() {
            return Err(TrainingError::initialization(
                "model exposes no trainable parameters",
            ));
        }
        log::info!(
            "Total Parameter: \t{:.1}M",
            count_parameters(&trainable) as f64 / 1_000_000.0
        );

        let optimizer = TrainerOptimizer::new(
            trainable.clone(),
            OptimizerConfig::try_from(&config.optimizer)?,
        )?;
        let total_steps = num_batches * config.runtime.epochs;
        let scheduler = LambdaScheduler::from_training_config(
            &config.scheduler,
            config.optimizer.learning_rate,
            total_steps,
        )?;
        let scaler = GradientScaler::from_runtime(config.runtime.precision, config.runtime.loss_scale);

        let state = TrainingState {
            epoch: config.runtime.start_epoch - 1,
            best_accuracy: config.runtime.initial_best_accuracy,
            elapsed: Duration::ZERO,
        };
        let start_epoch = config.runtime.start_epoch;

        Ok(Self {
            config,
            device,
            model,
            train_source: Arc::from(train_source),
            val_source: Arc::from(val_source),
            trainable,
            optimizer,
            scheduler,
            scaler,
            loss: Box::new(CrossEntropyLoss::new()),
            observers: ObserverSet::new(),
            state,
            start_epoch,
        })
    }

    /// Replaces the default cross entropy.
    pub fn with_loss(mut self, loss: Box<dyn LossFunction>) -> Self {
        self.loss = loss;
        self
    }

    pub fn add_observer(&mut self, observer: Box<dyn TrainingObserver>) {
        self.observers.push(observer);
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn state(&self) -> TrainingState {
        self.state
    }

    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    /// Completed optimization steps, the schedule's counter.
    pub fn global_step(&self) -> usize {
        self.scheduler.steps_taken()
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    /// Restores weights, optimizer, schedule, scaler and best accuracy from a
    /// checkpoint directory; training continues at the epoch after it.
    pub fn resume_from(&mut self, directory: &Path) -> Result<CheckpointManifest, TrainingError> {
        let outcome = checkpoint::load_checkpoint(directory)?;
        checkpoint::apply_model_weights(&self.model, &outcome.model_weights_path)?;
        self.optimizer.load_state(outcome.optimizer_state)?;
        self.scheduler.load_snapshot(outcome.scheduler_state)?;
        self.optimizer.set_learning_rate(self.scheduler.learning_rate());
        self.scaler.load_state(outcome.scaler_state);

        let manifest = outcome.manifest;
        self.state.best_accuracy = self.state.best_accuracy.max(manifest.best_accuracy);
        self.state.epoch = manifest.epoch;
        self.start_epoch = manifest.epoch + 1;
        log::info!(
            "resumed '{}' from {} (epoch {}, step {}, best {:.4})",
            manifest.label,
            directory.display(),
            manifest.epoch,
            manifest.global_step,
            manifest.best_accuracy
        );
        if self.start_epoch > self.config.runtime.epochs {
            log::warn!(
                "checkpoint already covers all {} epoch(s); nothing left to train",
                self.config.runtime.epochs
            );
        }
        Ok(manifest)
    }

    /// Runs epochs `start_epoch..=epochs`. Each epoch writes `Latest-epoch<N>`,
    /// then evaluates and writes `Best` on strict improvement.
    pub fn train(&mut self) -> Result<SessionSummary, TrainingError> {
        let session_start = Instant::now();
        let previous = self.state.elapsed;
        let epochs = self.config.runtime.epochs;
        log::info!("***** Running training *****");
        log::info!("  Total epochs = {}", epochs);
        log::info!("  Train batches per epoch = {}", self.train_source.num_batches());
        log::info!("  Train batch size = {}", self.config.data.train_batch_size);
        log::info!("  Total optimization steps = {}", self.train_source.num_batches() * epochs);

        let mut epochs_completed = 0usize;
        for epoch in self.start_epoch..=epochs {
            self.state.epoch = epoch;
            self.train_epoch(epoch)?;
            self.save_checkpoint(&latest_label(epoch), epoch)?;
            self.evaluate_and_track(epoch, EvaluationTrigger::EpochEnd)?;
            epochs_completed += 1;
            self.state.elapsed = previous + session_start.elapsed();
        }
        self.start_epoch = epochs + 1;

        self.state.elapsed = previous + session_start.elapsed();
        let summary = SessionSummary {
            epochs_completed,
            best_accuracy: self.state.best_accuracy,
            global_step: self.global_step(),
            elapsed: self.state.elapsed,
        };
        self.observers.on_training_end(&summary);
        Ok(summary)
    }

    /// One pass over the training stream with mid-epoch evaluation every
    /// `eval_every_n_steps` batches (never at batch 0).
    pub fn train_epoch(&mut self, epoch: usize) -> Result<EpochSummary, TrainingError> {
        let source = Arc::clone(&self.train_source);
        let num_batches = source.num_batches();
        let mut loader = BlockingDataLoader::new(source.loader(epoch)?);
        let log_every = self.config.runtime.log_every_n_steps;
        let eval_every = self.config.runtime.eval_every_n_steps;

        self.model.set_training(true);
        let mut losses = AverageMeter::new();
        let mut top1 = AverageMeter::new();
        let mut top5 = AverageMeter::new();
        let mut batch_time = AverageMeter::new();
        let mut skipped = 0usize;

        let epoch_start = Instant::now();
        let mut tick = Instant::now();
        let mut index = 0usize;
        while let Some(batch) = loader.next_batch()? {
            match self.train_step(&batch, epoch)? {
                StepOutcome::Applied(step) => {
                    losses.update(step.loss, step.batch_size);
                    top1.update(step.top1, step.batch_size);
                    top5.update(step.top5, step.batch_size);
                    batch_time.update(tick.elapsed().as_secs_f64(), 1);

                    self.observers.on_train_batch(&TrainBatchEvent {
                        epoch,
                        batch_index: index,
                        num_batches,
                        batch_size: step.batch_size,
                        loss: step.loss,
                        top1: step.top1,
                        top5: step.top5,
                        learning_rate: step.learning_rate,
                        grad_norm: step.grad_norm,
                    });

                    if index % log_every == 0 {
                        let remaining = num_batches.saturating_sub(index);
                        self.observers.on_train_progress(&TrainProgress {
                            epoch,
                            epochs: self.config.runtime.epochs,
                            batch_index: index,
                            num_batches,
                            eta: Duration::from_secs_f64(batch_time.average()? * remaining as f64),
                            time: running(&batch_time)?,
                            loss: running(&losses)?,
                            top1: running(&top1)?,
                            top5: running(&top5)?,
                        });
                    }
                }
                StepOutcome::Skipped { reason } => {
                    skipped += 1;
                    self.observers.on_batch_skipped(epoch, index, &reason);
                }
            }

            if index % eval_every == 0 && index > 0 {
                self.evaluate_and_track(epoch, EvaluationTrigger::MidEpoch { batch_index: index })?;
                self.model.set_training(true);
            }

            index += 1;
            tick = Instant::now();
        }

        if losses.count() == 0 {
            return Err(TrainingError::runtime(format!(
                "epoch {} finished without a single optimization step ({} batch(es) skipped)",
                epoch, skipped
            )));
        }

        let summary = EpochSummary {
            epoch,
            loss: losses.average()?,
            top1: top1.average()?,
            steps: index - skipped,
            skipped_batches: skipped,
            duration: epoch_start.elapsed(),
        };
        self.observers.on_epoch_end(&summary);
        Ok(summary)
    }

    /// Forward, loss, backward, clip, schedule and update for one batch.
    pub fn train_step(&mut self, batch: &DataBatch, epoch: usize) -> Result<StepOutcome, TrainingError> {
        batch.validate(self.config.num_classes())?;
        let images = batch.images.to_device(&self.device).map_err(to_runtime_error)?;
        let labels = batch.labels.to_device(&self.device).map_err(to_runtime_error)?;

        let (logits, _) = self.model.forward(&images).map_err(to_runtime_error)?;
        let loss = self.loss.compute(&logits, &labels)?;
        let loss_value = scalar_value(&loss)?;
        if !loss_value.is_finite() {
            return self.non_finite(epoch, batch.batch_index, format!("loss is {}", loss_value));
        }

        let top1 = top_k_accuracy(&logits, &labels, 1).map_err(to_runtime_error)?;
        let top5 = top_k_accuracy(&logits, &labels, 5).map_err(to_runtime_error)?;

        let scaled = self.scaler.scale(&loss)?;
        let mut grads = scaled.backward().map_err(to_runtime_error)?;
        if !self.scaler.unscale_grads(&self.trainable, &mut grads)? {
            self.optimizer.zero_grad(&mut grads);
            if self.scaler.is_enabled() {
                let scale = self.scaler.loss_scale();
                self.scaler.update(true);
                return Ok(StepOutcome::Skipped {
                    reason: format!("gradient overflow at loss scale {}", scale),
                });
            }
            return self.non_finite(epoch, batch.batch_index, "non-finite gradients".to_string());
        }

        let grad_norm = clip_grad_norm(
            &self.trainable,
            &mut grads,
            self.config.optimizer.max_grad_norm,
        )?;
        self.scaler.update(false);

        let learning_rate = self.scheduler.step();
        self.optimizer.set_learning_rate(learning_rate);
        self.optimizer.step(&grads)?;
        self.optimizer.zero_grad(&mut grads);

        Ok(StepOutcome::Applied(StepMetrics {
            loss: loss_value,
            top1,
            top5,
            batch_size: batch.batch_size(),
            learning_rate,
            grad_norm,
        }))
    }

    /// Full validation pass in inference mode. The model is left in eval mode.
    pub fn evaluate(
        &mut self,
        epoch: usize,
        trigger: EvaluationTrigger,
    ) -> Result<EvaluationSummary, TrainingError> {
        let source = Arc::clone(&self.val_source);
        run_evaluation(
            &self.model,
            self.loss.as_ref(),
            source.as_ref(),
            &self.device,
            EvaluationContext {
                epoch,
                trigger,
                num_classes: self.config.num_classes(),
                log_every: self.config.runtime.eval_log_every_n_steps,
            },
            &mut self.observers,
        )
    }

    fn evaluate_and_track(
        &mut self,
        epoch: usize,
        trigger: EvaluationTrigger,
    ) -> Result<EvaluationSummary, TrainingError> {
        let summary = self.evaluate(epoch, trigger)?;
        if summary.top1 > self.state.best_accuracy {
            self.state.best_accuracy = summary.top1;
            self.observers.on_new_best(epoch, summary.top1);
            self.save_checkpoint(BEST_LABEL, epoch)?;
        }
        Ok(summary)
    }

    fn save_checkpoint(&mut self, label: &str, epoch: usize) -> Result<(), TrainingError> {
        let run_dir = self.config.run_dir();
        let request = SaveRequest {
            run_dir: &run_dir,
            label,
            epoch,
            best_accuracy: self.state.best_accuracy,
            global_step: self.scheduler.steps_taken(),
            config: &self.config,
            parameters: self.model.named_parameters(),
            optimizer: &self.optimizer,
            scheduler: &self.scheduler,
            scaler: &self.scaler,
        };
        let descriptor = checkpoint::save_with_retry(&request, &self.config.runtime.checkpoint)?;
        self.observers.on_checkpoint_saved(label, &descriptor.directory);
        Ok(())
    }

    fn non_finite(
        &self,
        epoch: usize,
        batch_index: usize,
        detail: String,
    ) -> Result<StepOutcome, TrainingError> {
        match self.config.runtime.non_finite {
            NonFinitePolicy::Abort => Err(TrainingError::NumericInstability {
                epoch,
                batch_index,
                detail,
            }),
            NonFinitePolicy::SkipBatch => Ok(StepOutcome::Skipped { reason: detail }),
        }
    }
}

/// Where an evaluation pass sits in the session.
#[derive(Debug, Clone, Copy)]
pub struct EvaluationContext {
    pub epoch: usize,
    pub trigger: EvaluationTrigger,
    pub num_classes: usize,
    /// Progress is reported every `log_every` batches.
    pub log_every: usize,
}

/// Iterates `source` once with fresh meters. Outputs are detached, so the
/// parameters and optimizer buffers are never touched.
pub fn run_evaluation<M>(
    model: &M,
    loss_fn: &dyn LossFunction,
    source: &dyn DataSource,
    device: &Device,
    context: EvaluationContext,
    observer: &mut dyn TrainingObserver,
) -> Result<EvaluationSummary, TrainingError>
where
    M: ImageClassifier + ?Sized,
{
    let EvaluationContext {
        epoch,
        trigger,
        num_classes,
        log_every,
    } = context;
    let log_every = log_every.max(1);

    model.set_training(false);
    observer.on_evaluation_start(epoch, trigger);

    let num_batches = source.num_batches();
    let mut loader = BlockingDataLoader::new(source.loader(epoch)?);
    let mut losses = AverageMeter::new();
    let mut top1 = AverageMeter::new();
    let mut top5 = AverageMeter::new();
    let mut batch_time = AverageMeter::new();

    let mut tick = Instant::now();
    let mut index = 0usize;
    while let Some(batch) = loader.next_batch()? {
        batch.validate(num_classes)?;
        let images = batch.images.to_device(device).map_err(to_runtime_error)?;
        let labels = batch.labels.to_device(device).map_err(to_runtime_error)?;
        let (logits, _) = model.forward(&images).map_err(to_runtime_error)?;
        let logits = logits.detach();

        let loss = scalar_value(&loss_fn.compute(&logits, &labels)?)?;
        let acc1 = top_k_accuracy(&logits, &labels, 1).map_err(to_runtime_error)?;
        let acc5 = top_k_accuracy(&logits, &labels, 5).map_err(to_runtime_error)?;
        let batch_size = batch.batch_size();

        losses.update(loss, batch_size);
        top1.update(acc1, batch_size);
        top5.update(acc5, batch_size);
        batch_time.update(tick.elapsed().as_secs_f64(), 1);

        observer.on_evaluation_batch(&EvaluationBatchEvent {
            epoch,
            batch_index: index,
            num_batches,
            loss,
            top1: acc1,
        });
        if index % log_every == 0 {
            observer.on_evaluation_progress(&EvaluationProgress {
                epoch,
                batch_index: index,
                num_batches,
                time: running(&batch_time)?,
                loss: running(&losses)?,
                top1: running(&top1)?,
                top5: running(&top5)?,
            });
        }

        index += 1;
        tick = Instant::now();
    }

    let summary = EvaluationSummary {
        loss: losses.average()?,
        top1: top1.average()?,
        top5: top5.average()?,
        samples: losses.count(),
    };
    observer.on_evaluation_end(epoch, trigger, &summary);
    Ok(summary)
}

/// Resolves the configured device. `Auto` prefers Metal, then CUDA, then CPU.
pub fn select_device(preference: DevicePreference) -> Result<Device, TrainingError> {
    let device = match preference {
        DevicePreference::Cpu => Device::Cpu,
        DevicePreference::Cuda => Device::new_cuda(0)
            .map_err(|err| TrainingError::initialization(format!("cuda device: {err}")))?,
        DevicePreference::Metal => Device::new_metal(0)
            .map_err(|err| TrainingError::initialization(format!("metal device: {err}")))?,
        DevicePreference::Auto => {
            if metal_is_available() {
                Device::new_metal(0).unwrap_or_else(|err| {
                    log::warn!("failed to initialize metal device, falling back to CPU: {}", err);
                    Device::Cpu
                })
            } else if cuda_is_available() {
                Device::new_cuda(0).unwrap_or_else(|err| {
                    log::warn!("cuda reported available but initialization failed: {}", err);
                    Device::Cpu
                })
            } else {
                Device::Cpu
            }
        }
    };
    log::info!(
        "device selected: is_cuda={} is_metal={} is_cpu={}",
        device.is_cuda(),
        device.is_metal(),
        device.is_cpu()
    );
    Ok(device)
}

/// Seeds the device generator. Data order is seeded separately by the sources.
pub fn set_seed(device: &Device, seed: u64) {
    if device.is_cpu() {
        return;
    }
    if let Err(err) = device.set_seed(seed) {
        log::warn!("failed to seed device RNG: {}", err);
    }
}

fn running(meter: &AverageMeter) -> Result<Running, TrainingError> {
    Ok(Running {
        value: meter.value(),
        average: meter.average()?,
    })
}

fn scalar_value(tensor: &Tensor) -> Result<f64, TrainingError> {
    tensor
        .to_dtype(DType::F64)
        .and_then(|t| t.to_vec0::<f64>())
        .map_err(to_runtime_error)
}
