use candle_core::{DType, Tensor, D};
use candle_nn::ops;

use crate::TrainingError;

/// Maps `(logits [batch, classes], labels [batch])` to a scalar loss tensor
/// that stays attached to the autograd graph.
pub trait LossFunction {
    fn compute(&self, logits: &Tensor, labels: &Tensor) -> Result<Tensor, TrainingError>;
}

/// Mean cross entropy over the batch.
#[derive(Debug, Clone, Default)]
pub struct CrossEntropyLoss;

impl CrossEntropyLoss {
    pub fn new() -> Self {
        Self
    }
}

impl LossFunction for CrossEntropyLoss {
    fn compute(&self, logits: &Tensor, labels: &Tensor) -> Result<Tensor, TrainingError> {
        let (batch, classes) = logits.dims2().map_err(|_| {
            TrainingError::data_stream(format!(
                "cross entropy expects [batch, classes] logits, got {:?}",
                logits.dims()
            ))
        })?;
        if batch == 0 || classes == 0 {
            return Err(TrainingError::data_stream(
                "cross entropy requires a non-empty batch and at least one class",
            ));
        }
        if labels.dims() != [batch] {
            return Err(TrainingError::data_stream(format!(
                "labels shaped {:?} do not match {} logit rows",
                labels.dims(),
                batch
            )));
        }

        let labels = match labels.dtype() {
            DType::U32 => labels.clone(),
            DType::I64 | DType::U8 => labels.to_dtype(DType::U32).map_err(to_runtime_error)?,
            dtype => {
                return Err(TrainingError::data_stream(format!(
                    "unsupported label dtype {:?} for cross entropy",
                    dtype
                )))
            }
        };

        let log_probs = ops::log_softmax(logits, D::Minus1).map_err(to_runtime_error)?;
        let nll = log_probs
            .gather(&labels.unsqueeze(1).map_err(to_runtime_error)?, 1)
            .map_err(to_runtime_error)?
            .squeeze(1)
            .map_err(to_runtime_error)?
            .neg()
            .map_err(to_runtime_error)?;

        nll.mean_all().map_err(to_runtime_error)
    }
}

pub(crate) fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn uniform_logits_give_log_class_count() {
        let logits = Tensor::zeros((3, 10), DType::F32, &Device::Cpu).unwrap();
        let labels = Tensor::new(&[0u32, 4, 9], &Device::Cpu).unwrap();
        let loss = CrossEntropyLoss::new()
            .compute(&logits, &labels)
            .unwrap()
            .to_vec0::<f32>()
            .unwrap();
        assert!((loss - 10f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn confident_correct_prediction_has_small_loss() {
        let logits = Tensor::new(&[[10f32, 0.0, 0.0]], &Device::Cpu).unwrap();
        let labels = Tensor::new(&[0u32], &Device::Cpu).unwrap();
        let loss = CrossEntropyLoss::new()
            .compute(&logits, &labels)
            .unwrap()
            .to_vec0::<f32>()
            .unwrap();
        assert!(loss < 1e-3);
    }

    #[test]
    fn rejects_mismatched_labels() {
        let logits = Tensor::zeros((2, 4), DType::F32, &Device::Cpu).unwrap();
        let labels = Tensor::new(&[0u32, 1, 2], &Device::Cpu).unwrap();
        let err = CrossEntropyLoss::new().compute(&logits, &labels).unwrap_err();
        assert!(matches!(err, TrainingError::DataStream(_)));
    }
}
