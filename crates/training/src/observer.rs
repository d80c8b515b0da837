//! Events the trainer emits at defined points of the loop.
//!
//! Sinks (text logs, TensorBoard, test recorders) implement
//! [`TrainingObserver`] and are injected into the trainer; the loop itself
//! never formats or writes anything.

use std::{path::Path, time::Duration};

use crate::metrics::{EpochSummary, EvaluationSummary};

/// Latest value and running average of a meter.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Running {
    pub value: f64,
    pub average: f64,
}

/// Per-batch scalars of one optimization step.
#[derive(Debug, Clone)]
pub struct TrainBatchEvent {
    pub epoch: usize,
    pub batch_index: usize,
    pub num_batches: usize,
    pub batch_size: usize,
    pub loss: f64,
    pub top1: f64,
    pub top5: f64,
    pub learning_rate: f64,
    pub grad_norm: f64,
}

impl TrainBatchEvent {
    /// `(epoch - 1) * num_batches + batch_index`, the x-axis of per-batch scalars.
    pub fn global_index(&self) -> usize {
        self.epoch.saturating_sub(1) * self.num_batches + self.batch_index
    }
}

#[derive(Debug, Clone)]
pub struct TrainProgress {
    pub epoch: usize,
    pub epochs: usize,
    pub batch_index: usize,
    pub num_batches: usize,
    pub eta: Duration,
    pub time: Running,
    pub loss: Running,
    pub top1: Running,
    pub top5: Running,
}

#[derive(Debug, Clone)]
pub struct EvaluationBatchEvent {
    pub epoch: usize,
    pub batch_index: usize,
    pub num_batches: usize,
    pub loss: f64,
    pub top1: f64,
}

impl EvaluationBatchEvent {
    pub fn global_index(&self) -> usize {
        self.epoch.saturating_sub(1) * self.num_batches + self.batch_index
    }
}

#[derive(Debug, Clone)]
pub struct EvaluationProgress {
    pub epoch: usize,
    pub batch_index: usize,
    pub num_batches: usize,
    pub time: Running,
    pub loss: Running,
    pub top1: Running,
    pub top5: Running,
}

/// Why an evaluation pass ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationTrigger {
    MidEpoch { batch_index: usize },
    EpochEnd,
}

#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub epochs_completed: usize,
    pub best_accuracy: f64,
    pub global_step: usize,
    pub elapsed: Duration,
}

#[allow(unused_variables)]
pub trait TrainingObserver {
    fn on_train_batch(&mut self, event: &TrainBatchEvent) {}
    fn on_train_progress(&mut self, progress: &TrainProgress) {}
    fn on_batch_skipped(&mut self, epoch: usize, batch_index: usize, reason: &str) {}
    fn on_evaluation_start(&mut self, epoch: usize, trigger: EvaluationTrigger) {}
    fn on_evaluation_batch(&mut self, event: &EvaluationBatchEvent) {}
    fn on_evaluation_progress(&mut self, progress: &EvaluationProgress) {}
    fn on_evaluation_end(
        &mut self,
        epoch: usize,
        trigger: EvaluationTrigger,
        summary: &EvaluationSummary,
    ) {
    }
    fn on_new_best(&mut self, epoch: usize, accuracy: f64) {}
    fn on_checkpoint_saved(&mut self, label: &str, path: &Path) {}
    fn on_epoch_end(&mut self, summary: &EpochSummary) {}
    fn on_training_end(&mut self, summary: &SessionSummary) {}
}

/// Fans every event out to the attached observers in insertion order.
#[derive(Default)]
pub struct ObserverSet {
    observers: Vec<Box<dyn TrainingObserver>>,
}

impl ObserverSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, observer: Box<dyn TrainingObserver>) {
        self.observers.push(observer);
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl TrainingObserver for ObserverSet {
    fn on_train_batch(&mut self, event: &TrainBatchEvent) {
        self.observers.iter_mut().for_each(|o| o.on_train_batch(event));
    }

    fn on_train_progress(&mut self, progress: &TrainProgress) {
        self.observers
            .iter_mut()
            .for_each(|o| o.on_train_progress(progress));
    }

    fn on_batch_skipped(&mut self, epoch: usize, batch_index: usize, reason: &str) {
        self.observers
            .iter_mut()
            .for_each(|o| o.on_batch_skipped(epoch, batch_index, reason));
    }

    fn on_evaluation_start(&mut self, epoch: usize, trigger: EvaluationTrigger) {
        self.observers
            .iter_mut()
            .for_each(|o| o.on_evaluation_start(epoch, trigger));
    }

    fn on_evaluation_batch(&mut self, event: &EvaluationBatchEvent) {
        self.observers
            .iter_mut()
            .for_each(|o| o.on_evaluation_batch(event));
    }

    fn on_evaluation_progress(&mut self, progress: &EvaluationProgress) {
        self.observers
            .iter_mut()
            .for_each(|o| o.on_evaluation_progress(progress));
    }

    fn on_evaluation_end(
        &mut self,
        epoch: usize,
        trigger: EvaluationTrigger,
        summary: &EvaluationSummary,
    ) {
        self.observers
            .iter_mut()
            .for_each(|o| o.on_evaluation_end(epoch, trigger, summary));
    }

    fn on_new_best(&mut self, epoch: usize, accuracy: f64) {
        self.observers
            .iter_mut()
            .for_each(|o| o.on_new_best(epoch, accuracy));
    }

    fn on_checkpoint_saved(&mut self, label: &str, path: &Path) {
        self.observers
            .iter_mut()
            .for_each(|o| o.on_checkpoint_saved(label, path));
    }

    fn on_epoch_end(&mut self, summary: &EpochSummary) {
        self.observers.iter_mut().for_each(|o| o.on_epoch_end(summary));
    }

    fn on_training_end(&mut self, summary: &SessionSummary) {
        self.observers
            .iter_mut()
            .for_each(|o| o.on_training_end(summary));
    }
}
