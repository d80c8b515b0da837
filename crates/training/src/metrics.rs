use std::{fmt, time::Duration};

use candle_core::{DType, Tensor};

use crate::TrainingError;

/// Running weighted average of a scalar stream, reset per accumulation window.
#[derive(Debug, Clone, Default)]
pub struct AverageMeter {
    val: f64,
    sum: f64,
    count: usize,
}

impl AverageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `value` observed over `weight` samples (usually the batch size).
    pub fn update(&mut self, value: f64, weight: usize) {
        self.val = value;
        self.sum += value * weight as f64;
        self.count += weight;
    }

    /// Most recent value passed to [`AverageMeter::update`].
    pub fn value(&self) -> f64 {
        self.val
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn average(&self) -> Result<f64, MetricError> {
        if self.count == 0 {
            return Err(MetricError::DivideByZero);
        }
        Ok(self.sum / self.count as f64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricError {
    DivideByZero,
}

impl fmt::Display for MetricError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricError::DivideByZero => f.write_str("average requested before any update"),
        }
    }
}

impl std::error::Error for MetricError {}

impl From<MetricError> for TrainingError {
    fn from(value: MetricError) -> Self {
        TrainingError::runtime(value.to_string())
    }
}

/// Percentage of rows whose label ranks within the `k` highest logits.
///
/// Ties are broken toward the lower class index, the same order `argmax`
/// uses. `k` is clamped to the number of classes.
pub fn top_k_accuracy(logits: &Tensor, labels: &Tensor, k: usize) -> candle_core::Result<f64> {
    let (batch, classes) = logits.dims2()?;
    if batch == 0 {
        return Ok(0.0);
    }
    let k = k.clamp(1, classes);

    let labels = labels.to_dtype(DType::U32)?.unsqueeze(1)?;
    let target = logits.gather(&labels, 1)?;

    let higher = logits.broadcast_gt(&target)?.to_dtype(DType::F32)?;
    let tied = logits.broadcast_eq(&target)?.to_dtype(DType::F32)?;
    let lower_index = Tensor::arange(0u32, classes as u32, logits.device())?
        .unsqueeze(0)?
        .broadcast_lt(&labels)?
        .to_dtype(DType::F32)?;
    let rank = (higher + (tied * lower_index)?)?.sum(1)?;

    let correct = rank
        .lt(k as f32)?
        .to_dtype(DType::F32)?
        .sum_all()?
        .to_vec0::<f32>()?;
    Ok(100.0 * correct as f64 / batch as f64)
}

/// Aggregates of one full validation pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvaluationSummary {
    pub loss: f64,
    pub top1: f64,
    pub top5: f64,
    pub samples: usize,
}

/// Aggregates of one training epoch.
#[derive(Debug, Clone)]
pub struct EpochSummary {
    pub epoch: usize,
    pub loss: f64,
    pub top1: f64,
    pub steps: usize,
    pub skipped_batches: usize,
    pub duration: Duration,
}

/// `h:mm:ss`, the layout used for epoch and session durations.
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    format!("{}:{:02}:{:02}", total / 3600, (total / 60) % 60, total % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn weighted_mean_of_updates() {
        let mut meter = AverageMeter::new();
        meter.update(2.0, 4);
        meter.update(6.0, 4);
        assert_eq!(meter.average().unwrap(), 4.0);
        assert_eq!(meter.value(), 6.0);
        assert_eq!(meter.count(), 8);

        let mut uneven = AverageMeter::new();
        uneven.update(1.0, 1);
        uneven.update(4.0, 3);
        assert!((uneven.average().unwrap() - 3.25).abs() < 1e-12);
    }

    #[test]
    fn empty_meter_has_no_average() {
        assert_eq!(AverageMeter::new().average(), Err(MetricError::DivideByZero));
    }

    #[test]
    fn meters_are_independent() {
        let mut loss = AverageMeter::new();
        let mut acc = AverageMeter::new();
        loss.update(0.5, 2);
        acc.update(100.0, 2);
        assert_eq!(loss.average().unwrap(), 0.5);
        assert_eq!(acc.average().unwrap(), 100.0);
    }

    #[test]
    fn top_k_counts_label_rank() {
        let logits = Tensor::new(
            &[
                [0.1f32, 0.9, 0.0, 0.0, 0.0, 0.0],
                [0.5, 0.1, 0.2, 0.3, 0.4, 0.0],
                [0.0, 0.1, 0.2, 0.3, 0.4, 0.5],
            ],
            &Device::Cpu,
        )
        .unwrap();
        let labels = Tensor::new(&[1u32, 1, 0], &Device::Cpu).unwrap();

        let top1 = top_k_accuracy(&logits, &labels, 1).unwrap();
        let top5 = top_k_accuracy(&logits, &labels, 5).unwrap();
        assert!((top1 - 100.0 / 3.0).abs() < 1e-4);
        assert!((top5 - 200.0 / 3.0).abs() < 1e-4);
    }

    #[test]
    fn ties_favor_lower_class_index() {
        let logits = Tensor::zeros((2, 10), DType::F32, &Device::Cpu).unwrap();
        let labels = Tensor::new(&[0u32, 7], &Device::Cpu).unwrap();
        assert_eq!(top_k_accuracy(&logits, &labels, 1).unwrap(), 50.0);
        assert_eq!(top_k_accuracy(&logits, &labels, 5).unwrap(), 50.0);
    }

    #[test]
    fn k_is_clamped_to_class_count() {
        let logits = Tensor::new(&[[0.2f32, 0.1, 0.7]], &Device::Cpu).unwrap();
        let labels = Tensor::new(&[1u32], &Device::Cpu).unwrap();
        assert_eq!(top_k_accuracy(&logits, &labels, 5).unwrap(), 100.0);
    }

    #[test]
    fn formats_hours_minutes_seconds() {
        assert_eq!(format_duration(Duration::from_secs(3_725)), "1:02:05");
        assert_eq!(format_duration(Duration::from_millis(999)), "0:00:00");
    }
}
