use std::collections::HashMap;

pub mod scaler;

pub use scaler::{GradientScaler, GradientScalerState, LossScaleConfig};

use candle_core::{backprop::GradStore, DType, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::{config, loss::to_runtime_error, TrainingError};

const EPS: f64 = 1e-12;

#[derive(Debug, Clone)]
pub enum OptimizerConfig {
    Sgd(SgdConfig),
    AdamW(AdamWConfig),
}

#[derive(Debug, Clone, Copy)]
pub struct SgdConfig {
    pub learning_rate: f64,
    pub momentum: f64,
    pub weight_decay: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct AdamWConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
}

impl TryFrom<&config::OptimizerConfig> for OptimizerConfig {
    type Error = TrainingError;

    fn try_from(value: &config::OptimizerConfig) -> Result<Self, Self::Error> {
        if value.learning_rate <= 0.0 {
            return Err(TrainingError::initialization(
                "optimizer learning rate must be greater than zero",
            ));
        }
        match value.algorithm {
            config::OptimizerType::Sgd => Ok(OptimizerConfig::Sgd(SgdConfig {
                learning_rate: value.learning_rate,
                momentum: value.momentum,
                weight_decay: value.weight_decay,
            })),
            config::OptimizerType::AdamW => Ok(OptimizerConfig::AdamW(AdamWConfig {
                learning_rate: value.learning_rate,
                beta1: value.beta1,
                beta2: value.beta2,
                epsilon: value.epsilon,
                weight_decay: value.weight_decay,
            })),
        }
    }
}

/// Applies parameter updates from a [`GradStore`] and owns the per-parameter
/// buffers (SGD momentum, AdamW moments).
#[derive(Debug)]
pub struct TrainerOptimizer {
    config: OptimizerConfig,
    params: Vec<ParameterSlot>,
    step: usize,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    first_moment: Option<Tensor>,
    second_moment: Option<Tensor>,
}

impl TrainerOptimizer {
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        config: OptimizerConfig,
    ) -> Result<Self, TrainingError> {
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }

        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            if var.as_tensor().dtype() != DType::F32 {
                return Err(TrainingError::initialization(format!(
                    "optimizer expects f32 parameters, '{}' is {:?}",
                    name,
                    var.as_tensor().dtype()
                )));
            }
            params.push(ParameterSlot {
                name,
                param: var,
                first_moment: None,
                second_moment: None,
            });
        }

        Ok(Self {
            config,
            params,
            step: 0,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        match self.config {
            OptimizerConfig::Sgd(cfg) => cfg.learning_rate,
            OptimizerConfig::AdamW(cfg) => cfg.learning_rate,
        }
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        match &mut self.config {
            OptimizerConfig::Sgd(cfg) => cfg.learning_rate = lr,
            OptimizerConfig::AdamW(cfg) => cfg.learning_rate = lr,
        }
    }

    /// Number of updates applied so far.
    pub fn steps(&self) -> usize {
        self.step
    }

    /// One update over every parameter that has a gradient in `grads`.
    pub fn step(&mut self, grads: &GradStore) -> Result<(), TrainingError> {
        self.step += 1;
        match self.config {
            OptimizerConfig::Sgd(cfg) => self.step_sgd(cfg, grads),
            OptimizerConfig::AdamW(cfg) => self.step_adamw(cfg, grads),
        }
    }

    fn step_sgd(&mut self, cfg: SgdConfig, grads: &GradStore) -> Result<(), TrainingError> {
        for slot in &mut self.params {
            let Some(grad) = grads.get(slot.param.as_tensor()) else {
                continue;
            };
            // Optimizer state never joins the autograd graph of the parameter.
            let param = slot.param.as_tensor().detach();
            let grad = grad.detach();

            let mut direction = if cfg.weight_decay != 0.0 {
                (&grad + param.affine(cfg.weight_decay, 0.0).map_err(to_runtime_error)?)
                    .map_err(to_runtime_error)?
            } else {
                grad
            };

            if cfg.momentum != 0.0 {
                let buffer = match slot.first_moment.take() {
                    Some(previous) => (previous.affine(cfg.momentum, 0.0).map_err(to_runtime_error)?
                        + &direction)
                        .map_err(to_runtime_error)?,
                    None => direction.copy().map_err(to_runtime_error)?,
                };
                let buffer = buffer.detach();
                direction = buffer.clone();
                slot.first_moment = Some(buffer);
            }

            let update = direction
                .affine(cfg.learning_rate, 0.0)
                .map_err(to_runtime_error)?;
            let next = param.sub(&update).map_err(to_runtime_error)?;
            slot.param.set(&next).map_err(to_runtime_error)?;
        }
        Ok(())
    }

    fn step_adamw(&mut self, cfg: AdamWConfig, grads: &GradStore) -> Result<(), TrainingError> {
        let bias_correction1 = 1.0 - cfg.beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - cfg.beta2.powi(self.step as i32);
        let scale_m = if bias_correction1.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction1
        };
        let scale_v = if bias_correction2.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction2
        };

        for slot in &mut self.params {
            let Some(grad) = grads.get(slot.param.as_tensor()) else {
                continue;
            };
            let param = slot.param.as_tensor().detach();
            let grad = grad.detach();

            let prev_m = match slot.first_moment.take() {
                Some(m) => m,
                None => grad.zeros_like().map_err(to_runtime_error)?,
            };
            let prev_v = match slot.second_moment.take() {
                Some(v) => v,
                None => grad.zeros_like().map_err(to_runtime_error)?,
            };

            let new_m = (prev_m.affine(cfg.beta1, 0.0).map_err(to_runtime_error)?
                + grad.affine(1.0 - cfg.beta1, 0.0).map_err(to_runtime_error)?)
            .map_err(to_runtime_error)?;
            let new_v = (prev_v.affine(cfg.beta2, 0.0).map_err(to_runtime_error)?
                + grad
                    .sqr()
                    .map_err(to_runtime_error)?
                    .affine(1.0 - cfg.beta2, 0.0)
                    .map_err(to_runtime_error)?)
            .map_err(to_runtime_error)?;

            let m_hat = new_m.affine(scale_m, 0.0).map_err(to_runtime_error)?;
            let denom = new_v
                .affine(scale_v, 0.0)
                .map_err(to_runtime_error)?
                .sqrt()
                .map_err(to_runtime_error)?
                .affine(1.0, cfg.epsilon)
                .map_err(to_runtime_error)?;
            let update = m_hat
                .div(&denom)
                .map_err(to_runtime_error)?
                .affine(cfg.learning_rate, 0.0)
                .map_err(to_runtime_error)?;

            let decayed = if cfg.weight_decay != 0.0 {
                param
                    .affine(1.0 - cfg.learning_rate * cfg.weight_decay, 0.0)
                    .map_err(to_runtime_error)?
            } else {
                param.clone()
            };
            let next = decayed.sub(&update).map_err(to_runtime_error)?;
            slot.param.set(&next).map_err(to_runtime_error)?;

            slot.first_moment = Some(new_m.detach());
            slot.second_moment = Some(new_v.detach());
        }
        Ok(())
    }

    pub fn zero_grad(&self, grads: &mut GradStore) {
        for slot in &self.params {
            let _ = grads.remove(slot.param.as_tensor());
        }
    }

    pub fn state(&self) -> Result<OptimizerState, TrainingError> {
        let mut parameters = Vec::with_capacity(self.params.len());
        for slot in &self.params {
            parameters.push(ParameterState {
                name: slot.name.clone(),
                shape: slot.param.as_tensor().dims().to_vec(),
                first_moment: slot.first_moment.as_ref().map(flatten).transpose()?,
                second_moment: slot.second_moment.as_ref().map(flatten).transpose()?,
            });
        }
        Ok(OptimizerState {
            step: self.step,
            learning_rate: self.learning_rate(),
            parameters,
        })
    }

    pub fn load_state(&mut self, state: OptimizerState) -> Result<(), TrainingError> {
        let mut by_name: HashMap<_, _> = state
            .parameters
            .into_iter()
            .map(|param| (param.name.clone(), param))
            .collect();

        for slot in &mut self.params {
            let saved = by_name.remove(&slot.name).ok_or_else(|| {
                TrainingError::runtime(format!("optimizer state missing parameter '{}'", slot.name))
            })?;
            let tensor = slot.param.as_tensor();
            if tensor.dims() != saved.shape.as_slice() {
                return Err(TrainingError::runtime(format!(
                    "optimizer state shape mismatch for '{}'",
                    slot.name
                )));
            }
            slot.first_moment = saved
                .first_moment
                .map(|values| restore(values, tensor))
                .transpose()?;
            slot.second_moment = saved
                .second_moment
                .map(|values| restore(values, tensor))
                .transpose()?;
        }

        if !by_name.is_empty() {
            return Err(TrainingError::runtime(
                "optimizer state has extra parameters not present in the model",
            ));
        }

        self.step = state.step;
        self.set_learning_rate(state.learning_rate);
        Ok(())
    }
}

/// Scales every gradient by `max_norm / norm` when the global L2 norm exceeds
/// `max_norm`. Returns the norm measured before clipping.
pub fn clip_grad_norm(
    params: &[(String, Var)],
    grads: &mut GradStore,
    max_norm: f64,
) -> Result<f64, TrainingError> {
    let norm = global_grad_norm(params, grads)?;
    let Some(coefficient) = clip_coefficient(norm, max_norm) else {
        return Ok(norm);
    };
    for (_, var) in params {
        let tensor = var.as_tensor();
        if let Some(grad) = grads.get(tensor) {
            let clipped = grad.affine(coefficient, 0.0).map_err(to_runtime_error)?;
            grads.insert(tensor, clipped);
        }
    }
    Ok(norm)
}

/// `Some(max_norm / norm)` when clipping applies.
pub fn clip_coefficient(norm: f64, max_norm: f64) -> Option<f64> {
    if norm.is_finite() && norm > max_norm && norm > 0.0 {
        Some(max_norm / norm)
    } else {
        None
    }
}

pub fn global_grad_norm(params: &[(String, Var)], grads: &GradStore) -> Result<f64, TrainingError> {
    let mut total = 0f64;
    for (_, var) in params {
        if let Some(grad) = grads.get(var.as_tensor()) {
            let squared = grad
                .sqr()
                .map_err(to_runtime_error)?
                .sum_all()
                .map_err(to_runtime_error)?
                .to_dtype(DType::F64)
                .map_err(to_runtime_error)?
                .to_vec0::<f64>()
                .map_err(to_runtime_error)?;
            total += squared;
        }
    }
    Ok(total.sqrt())
}

fn flatten(tensor: &Tensor) -> Result<Vec<f32>, TrainingError> {
    tensor
        .flatten_all()
        .map_err(to_runtime_error)?
        .to_dtype(DType::F32)
        .map_err(to_runtime_error)?
        .to_vec1::<f32>()
        .map_err(to_runtime_error)
}

fn restore(values: Vec<f32>, like: &Tensor) -> Result<Tensor, TrainingError> {
    if values.len() != like.elem_count() {
        return Err(TrainingError::runtime(
            "optimizer state element count does not match parameter",
        ));
    }
    Tensor::from_vec(values, like.dims(), like.device()).map_err(to_runtime_error)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerState {
    pub step: usize,
    pub learning_rate: f64,
    pub parameters: Vec<ParameterState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterState {
    pub name: String,
    pub shape: Vec<usize>,
    pub first_moment: Option<Vec<f32>>,
    pub second_moment: Option<Vec<f32>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn var(values: &[f32]) -> Var {
        Var::from_tensor(&Tensor::new(values, &Device::Cpu).unwrap()).unwrap()
    }

    /// Gradient of `sum(w * c)` with respect to `w` is `c`.
    fn grads_for(w: &Var, c: &[f32]) -> GradStore {
        let c = Tensor::new(c, &Device::Cpu).unwrap();
        w.as_tensor()
            .mul(&c)
            .unwrap()
            .sum_all()
            .unwrap()
            .backward()
            .unwrap()
    }

    fn sgd(lr: f64, momentum: f64, weight_decay: f64) -> OptimizerConfig {
        OptimizerConfig::Sgd(SgdConfig {
            learning_rate: lr,
            momentum,
            weight_decay,
        })
    }

    #[test]
    fn clipping_leaves_norm_at_limit_untouched() {
        let w = var(&[0.0, 0.0]);
        let params = vec![("w".to_string(), w.clone())];
        let mut grads = grads_for(&w, &[3.0, 4.0]);

        let norm = clip_grad_norm(&params, &mut grads, 5.0).unwrap();
        assert_eq!(norm, 5.0);
        let grad = grads.get(w.as_tensor()).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(grad, vec![3.0, 4.0]);
    }

    #[test]
    fn clipping_halves_gradients_at_twice_the_limit() {
        let w = var(&[0.0, 0.0]);
        let b = var(&[0.0]);
        let params = vec![("b".to_string(), b.clone()), ("w".to_string(), w.clone())];
        let c = Tensor::new(&[3f32, 4.0], &Device::Cpu).unwrap();
        let loss = (w.as_tensor().mul(&c).unwrap().sum_all().unwrap()
            + b.as_tensor().sum_all().unwrap().affine(0.0, 0.0).unwrap())
        .unwrap();
        let mut grads = loss.backward().unwrap();

        let norm = clip_grad_norm(&params, &mut grads, 2.5).unwrap();
        assert_eq!(norm, 5.0);
        let grad = grads.get(w.as_tensor()).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(grad, vec![1.5, 2.0]);
    }

    #[test]
    fn clip_coefficient_boundary() {
        assert_eq!(clip_coefficient(1.0, 1.0), None);
        assert_eq!(clip_coefficient(2.0, 1.0), Some(0.5));
        assert_eq!(clip_coefficient(0.5, 1.0), None);
    }

    #[test]
    fn sgd_momentum_matches_reference_updates() {
        let w = var(&[1.0]);
        let mut optimizer =
            TrainerOptimizer::new(vec![("w".to_string(), w.clone())], sgd(0.1, 0.9, 0.0)).unwrap();

        // grad 1.0: buf = 1.0, w = 1.0 - 0.1
        let grads = grads_for(&w, &[1.0]);
        optimizer.step(&grads).unwrap();
        let after_first = w.as_tensor().to_vec1::<f32>().unwrap()[0];
        assert!((after_first - 0.9).abs() < 1e-6);

        // grad 1.0: buf = 0.9 + 1.0, w = 0.9 - 0.19
        let grads = grads_for(&w, &[1.0]);
        optimizer.step(&grads).unwrap();
        let after_second = w.as_tensor().to_vec1::<f32>().unwrap()[0];
        assert!((after_second - 0.71).abs() < 1e-6);
        assert_eq!(optimizer.steps(), 2);
    }

    #[test]
    fn sgd_applies_coupled_weight_decay() {
        let w = var(&[2.0]);
        let mut optimizer =
            TrainerOptimizer::new(vec![("w".to_string(), w.clone())], sgd(0.5, 0.0, 0.1)).unwrap();
        let grads = grads_for(&w, &[0.0]);
        optimizer.step(&grads).unwrap();
        let value = w.as_tensor().to_vec1::<f32>().unwrap()[0];
        assert!((value - 1.9).abs() < 1e-6);
    }

    #[test]
    fn momentum_buffer_does_not_reach_back_to_parameters() {
        let w = var(&[1.0, -2.0]);
        let mut optimizer =
            TrainerOptimizer::new(vec![("w".to_string(), w.clone())], sgd(0.1, 0.9, 0.1)).unwrap();
        for _ in 0..3 {
            optimizer.step(&grads_for(&w, &[1.0, 1.0])).unwrap();
        }

        let buffer = optimizer.params[0].first_moment.clone().unwrap();
        let grads = buffer.sum_all().unwrap().backward().unwrap();
        assert!(grads.get(w.as_tensor()).is_none());
    }

    #[test]
    fn adamw_moments_do_not_reach_back_to_parameters() {
        let w = var(&[0.5]);
        let config = OptimizerConfig::AdamW(AdamWConfig {
            learning_rate: 0.01,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.05,
        });
        let mut optimizer = TrainerOptimizer::new(vec![("w".to_string(), w.clone())], config).unwrap();
        for _ in 0..2 {
            optimizer.step(&grads_for(&w, &[1.5])).unwrap();
        }

        let slot = &optimizer.params[0];
        for moment in [&slot.first_moment, &slot.second_moment] {
            let grads = moment.clone().unwrap().sum_all().unwrap().backward().unwrap();
            assert!(grads.get(w.as_tensor()).is_none());
        }
    }

    #[test]
    fn adamw_first_step_moves_by_learning_rate() {
        let w = var(&[1.0, -1.0]);
        let config = OptimizerConfig::AdamW(AdamWConfig {
            learning_rate: 0.01,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
        });
        let mut optimizer = TrainerOptimizer::new(vec![("w".to_string(), w.clone())], config).unwrap();
        let grads = grads_for(&w, &[2.0, -3.0]);
        optimizer.step(&grads).unwrap();
        let values = w.as_tensor().to_vec1::<f32>().unwrap();
        assert!((values[0] - 0.99).abs() < 1e-5);
        assert!((values[1] + 0.99).abs() < 1e-5);
    }

    #[test]
    fn state_round_trip_restores_momentum() {
        let w = var(&[1.0]);
        let mut optimizer =
            TrainerOptimizer::new(vec![("w".to_string(), w.clone())], sgd(0.1, 0.9, 0.0)).unwrap();
        optimizer.step(&grads_for(&w, &[1.0])).unwrap();
        optimizer.set_learning_rate(0.05);
        let state = optimizer.state().unwrap();
        let json = serde_json::to_string(&state).unwrap();

        let restored_w = var(&[0.9]);
        let mut restored = TrainerOptimizer::new(
            vec![("w".to_string(), restored_w.clone())],
            sgd(0.1, 0.9, 0.0),
        )
        .unwrap();
        restored.load_state(serde_json::from_str(&json).unwrap()).unwrap();
        assert_eq!(restored.steps(), 1);
        assert_eq!(restored.learning_rate(), 0.05);

        optimizer.step(&grads_for(&w, &[1.0])).unwrap();
        restored.step(&grads_for(&restored_w, &[1.0])).unwrap();
        let a = w.as_tensor().to_vec1::<f32>().unwrap()[0];
        let b = restored_w.as_tensor().to_vec1::<f32>().unwrap()[0];
        assert!((a - b).abs() < 1e-6);
    }

    #[test]
    fn load_state_rejects_unknown_parameters() {
        let w = var(&[1.0]);
        let mut optimizer =
            TrainerOptimizer::new(vec![("w".to_string(), w)], sgd(0.1, 0.9, 0.0)).unwrap();
        let state = OptimizerState {
            step: 0,
            learning_rate: 0.1,
            parameters: vec![ParameterState {
                name: "other".to_string(),
                shape: vec![1],
                first_moment: None,
                second_moment: None,
            }],
        };
        assert!(optimizer.load_state(state).is_err());
    }
}
