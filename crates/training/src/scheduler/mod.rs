use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::{config, TrainingError};

pub trait LRScheduler: Send {
    /// Advances the step counter by one and returns the new learning rate.
    fn step(&mut self) -> f64;
    fn learning_rate(&self) -> f64;
    fn steps_taken(&self) -> usize;
    fn snapshot(&self) -> SchedulerState;
    fn load_snapshot(&mut self, state: SchedulerState) -> Result<(), TrainingError>;
}

/// Learning-rate multiplier as a function of the optimization step.
pub trait DecayCurve: Send + std::fmt::Debug {
    fn multiplier(&self, step: usize) -> f64;
}

/// Linear warmup to 1, then a half cosine down to 0 at `total_steps`.
#[derive(Debug, Clone, Copy)]
pub struct WarmupCosine {
    pub warmup_steps: usize,
    pub total_steps: usize,
    pub cycles: f64,
}

impl DecayCurve for WarmupCosine {
    fn multiplier(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return warmup(step, self.warmup_steps);
        }
        let progress = (step - self.warmup_steps) as f64
            / (self.total_steps.saturating_sub(self.warmup_steps)).max(1) as f64;
        (0.5 * (1.0 + (PI * self.cycles * 2.0 * progress).cos())).max(0.0)
    }
}

/// Linear warmup to 1, then a straight line down to 0 at `total_steps`.
#[derive(Debug, Clone, Copy)]
pub struct WarmupLinear {
    pub warmup_steps: usize,
    pub total_steps: usize,
}

impl DecayCurve for WarmupLinear {
    fn multiplier(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return warmup(step, self.warmup_steps);
        }
        let remaining = self.total_steps as f64 - step as f64;
        let span = (self.total_steps.saturating_sub(self.warmup_steps)).max(1) as f64;
        (remaining / span).max(0.0)
    }
}

/// Linear warmup to 1, then flat.
#[derive(Debug, Clone, Copy)]
pub struct WarmupConstant {
    pub warmup_steps: usize,
}

impl DecayCurve for WarmupConstant {
    fn multiplier(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            warmup(step, self.warmup_steps)
        } else {
            1.0
        }
    }
}

fn warmup(step: usize, warmup_steps: usize) -> f64 {
    step as f64 / warmup_steps.max(1) as f64
}

/// `lr = max(min_lr, base_lr * curve(step))`, with the counter advanced
/// before the rate is computed.
#[derive(Debug)]
pub struct LambdaScheduler {
    base_lr: f64,
    min_lr: f64,
    curve: Box<dyn DecayCurve>,
    step: usize,
    current_lr: f64,
}

impl LambdaScheduler {
    pub fn new(base_lr: f64, min_lr: f64, curve: Box<dyn DecayCurve>) -> Result<Self, TrainingError> {
        if base_lr <= 0.0 {
            return Err(TrainingError::initialization(
                "scheduler requires base learning rate > 0",
            ));
        }
        if min_lr < 0.0 || min_lr > base_lr {
            return Err(TrainingError::initialization(
                "scheduler min_lr must be in [0, base_lr]",
            ));
        }
        let current_lr = (base_lr * curve.multiplier(0)).max(min_lr);
        Ok(Self {
            base_lr,
            min_lr,
            curve,
            step: 0,
            current_lr,
        })
    }

    pub fn from_training_config(
        cfg: &config::SchedulerConfig,
        base_lr: f64,
        total_steps: usize,
    ) -> Result<Self, TrainingError> {
        if total_steps == 0 {
            return Err(TrainingError::initialization(
                "scheduler requires total_steps greater than zero",
            ));
        }
        let warmup_steps = cfg.warmup_steps;
        let curve: Box<dyn DecayCurve> = match cfg.decay_type {
            config::DecayType::Cosine => Box::new(WarmupCosine {
                warmup_steps,
                total_steps,
                cycles: 0.5,
            }),
            config::DecayType::Linear => Box::new(WarmupLinear {
                warmup_steps,
                total_steps,
            }),
            config::DecayType::Constant => Box::new(WarmupConstant { warmup_steps }),
        };
        Self::new(base_lr, cfg.min_lr.unwrap_or(0.0), curve)
    }

    fn rate_at(&self, step: usize) -> f64 {
        (self.base_lr * self.curve.multiplier(step)).max(self.min_lr)
    }
}

impl LRScheduler for LambdaScheduler {
    fn step(&mut self) -> f64 {
        self.step = self.step.saturating_add(1);
        self.current_lr = self.rate_at(self.step);
        self.current_lr
    }

    fn learning_rate(&self) -> f64 {
        self.current_lr
    }

    fn steps_taken(&self) -> usize {
        self.step
    }

    fn snapshot(&self) -> SchedulerState {
        SchedulerState {
            step: self.step,
            base_lr: self.base_lr,
            learning_rate: self.current_lr,
        }
    }

    fn load_snapshot(&mut self, state: SchedulerState) -> Result<(), TrainingError> {
        if (state.base_lr - self.base_lr).abs() > f64::EPSILON * self.base_lr.max(1.0) {
            log::warn!(
                "scheduler snapshot base lr {} differs from configured {}; keeping the configured value",
                state.base_lr,
                self.base_lr
            );
        }
        self.step = state.step;
        self.current_lr = self.rate_at(self.step);
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerState {
    pub step: usize,
    pub base_lr: f64,
    pub learning_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn cosine_warms_up_then_decays_to_zero() {
        let curve = WarmupCosine {
            warmup_steps: 10,
            total_steps: 110,
            cycles: 0.5,
        };
        assert!(approx(curve.multiplier(0), 0.0));
        assert!(approx(curve.multiplier(5), 0.5));
        assert!(approx(curve.multiplier(10), 1.0));
        assert!(approx(curve.multiplier(60), 0.5));
        assert!(approx(curve.multiplier(110), 0.0));
        assert!(curve.multiplier(500) >= 0.0);
    }

    #[test]
    fn linear_reaches_zero_at_total_steps() {
        let curve = WarmupLinear {
            warmup_steps: 4,
            total_steps: 12,
        };
        assert!(approx(curve.multiplier(2), 0.5));
        assert!(approx(curve.multiplier(4), 1.0));
        assert!(approx(curve.multiplier(8), 0.5));
        assert!(approx(curve.multiplier(12), 0.0));
        assert!(approx(curve.multiplier(20), 0.0));
    }

    #[test]
    fn counter_advances_once_per_step() {
        let mut scheduler = LambdaScheduler::new(
            0.1,
            0.0,
            Box::new(WarmupLinear {
                warmup_steps: 2,
                total_steps: 6,
            }),
        )
        .unwrap();
        assert_eq!(scheduler.steps_taken(), 0);
        assert!(approx(scheduler.learning_rate(), 0.0));

        let mut previous = 0;
        for expected in 1..=8 {
            scheduler.step();
            assert_eq!(scheduler.steps_taken(), expected);
            assert!(scheduler.steps_taken() > previous);
            previous = scheduler.steps_taken();
        }
        assert!(approx(scheduler.learning_rate(), 0.0));
    }

    #[test]
    fn first_step_uses_post_increment_rate() {
        let mut scheduler = LambdaScheduler::new(
            1.0,
            0.0,
            Box::new(WarmupConstant { warmup_steps: 4 }),
        )
        .unwrap();
        assert!(approx(scheduler.step(), 0.25));
        assert!(approx(scheduler.step(), 0.5));
    }

    #[test]
    fn snapshot_restores_counter_and_rate() {
        let cfg = config::SchedulerConfig::default();
        let mut first = LambdaScheduler::from_training_config(&cfg, 0.03, 1_000).unwrap();
        for _ in 0..37 {
            first.step();
        }
        let mut second = LambdaScheduler::from_training_config(&cfg, 0.03, 1_000).unwrap();
        second.load_snapshot(first.snapshot()).unwrap();
        assert_eq!(second.steps_taken(), 37);
        assert!(approx(second.learning_rate(), first.learning_rate()));
        assert!(approx(second.step(), first.step()));
    }

    #[test]
    fn rejects_min_lr_above_base() {
        assert!(LambdaScheduler::new(0.1, 0.2, Box::new(WarmupConstant { warmup_steps: 0 })).is_err());
    }
}
