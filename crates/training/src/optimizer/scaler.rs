use candle_core::{backprop::GradStore, DType, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::{config::Precision, loss::to_runtime_error, TrainingError};

#[derive(Debug, Clone)]
pub struct LossScaleConfig {
    pub initial_scale: f32,
    pub growth_factor: f32,
    pub backoff_factor: f32,
    pub growth_interval: usize,
    pub min_scale: f32,
    pub max_scale: f32,
}

impl Default for LossScaleConfig {
    fn default() -> Self {
        Self {
            initial_scale: 2f32.powi(15),
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            min_scale: 1.0,
            max_scale: 2f32.powi(24),
        }
    }
}

/// Precision policy applied inside the training step: identity for full
/// precision, loss scaling with overflow detection for scaled precision.
#[derive(Debug, Clone)]
pub struct GradientScaler {
    state: ScalerState,
}

#[derive(Debug, Clone)]
enum ScalerState {
    Disabled,
    Enabled(EnabledState),
}

#[derive(Debug, Clone)]
struct EnabledState {
    loss_scale: f32,
    stable_steps: usize,
    dynamic: bool,
    config: LossScaleConfig,
}

impl GradientScaler {
    pub fn new(precision: Precision) -> Self {
        Self::with_config(LossScaleConfig::default(), precision)
    }

    /// `loss_scale == 0` selects dynamic scaling; any positive value is held fixed.
    pub fn from_runtime(precision: Precision, loss_scale: f32) -> Self {
        if loss_scale > 0.0 {
            Self::fixed(loss_scale, precision)
        } else {
            Self::new(precision)
        }
    }

    pub fn fixed(loss_scale: f32, precision: Precision) -> Self {
        let mut scaler = Self::with_config(
            LossScaleConfig {
                initial_scale: loss_scale,
                min_scale: loss_scale.min(1.0),
                max_scale: loss_scale.max(1.0),
                ..LossScaleConfig::default()
            },
            precision,
        );
        if let ScalerState::Enabled(state) = &mut scaler.state {
            state.dynamic = false;
        }
        scaler
    }

    pub fn with_config(config: LossScaleConfig, precision: Precision) -> Self {
        if precision == Precision::Fp32 {
            return Self {
                state: ScalerState::Disabled,
            };
        }

        let cfg = sanitize_config(config);
        let state = EnabledState {
            loss_scale: cfg.initial_scale,
            stable_steps: 0,
            dynamic: true,
            config: cfg,
        };
        Self {
            state: ScalerState::Enabled(state),
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self.state, ScalerState::Enabled(_))
    }

    pub fn loss_scale(&self) -> f32 {
        match &self.state {
            ScalerState::Disabled => 1.0,
            ScalerState::Enabled(state) => state.loss_scale,
        }
    }

    pub fn scale(&self, tensor: &Tensor) -> Result<Tensor, TrainingError> {
        match &self.state {
            ScalerState::Disabled => Ok(tensor.clone()),
            ScalerState::Enabled(state) => tensor
                .affine(state.loss_scale as f64, 0.0)
                .map_err(to_runtime_error),
        }
    }

    pub fn unscale(&self, tensor: &Tensor) -> Result<Tensor, TrainingError> {
        match &self.state {
            ScalerState::Disabled => Ok(tensor.clone()),
            ScalerState::Enabled(state) => {
                let scale = 1.0 / state.loss_scale as f64;
                tensor.affine(scale, 0.0).map_err(to_runtime_error)
            }
        }
    }

    /// Unscales every parameter gradient in place. Returns `false` when any
    /// gradient holds a NaN or infinity.
    pub fn unscale_grads(
        &self,
        params: &[(String, Var)],
        grads: &mut GradStore,
    ) -> Result<bool, TrainingError> {
        let mut finite = true;
        for (_, var) in params {
            let tensor = var.as_tensor();
            let Some(grad) = grads.get(tensor) else {
                continue;
            };
            let grad = self.unscale(grad)?;
            if finite && contains_non_finite(&grad)? {
                finite = false;
            }
            grads.insert(tensor, grad);
        }
        Ok(finite)
    }

    pub fn update(&mut self, found_inf: bool) {
        if let ScalerState::Enabled(state) = &mut self.state {
            if !state.dynamic {
                return;
            }
            if found_inf {
                state.loss_scale =
                    (state.loss_scale * state.config.backoff_factor).max(state.config.min_scale);
                state.stable_steps = 0;
            } else {
                state.stable_steps += 1;
                if state.stable_steps >= state.config.growth_interval {
                    state.loss_scale =
                        (state.loss_scale * state.config.growth_factor).min(state.config.max_scale);
                    state.stable_steps = 0;
                }
            }
        }
    }

    pub fn state(&self) -> GradientScalerState {
        match &self.state {
            ScalerState::Disabled => GradientScalerState {
                enabled: false,
                loss_scale: 1.0,
                stable_steps: 0,
            },
            ScalerState::Enabled(state) => GradientScalerState {
                enabled: true,
                loss_scale: state.loss_scale,
                stable_steps: state.stable_steps,
            },
        }
    }

    pub fn load_state(&mut self, saved: GradientScalerState) {
        if let ScalerState::Enabled(state) = &mut self.state {
            if saved.enabled && saved.loss_scale > 0.0 {
                state.loss_scale = saved.loss_scale;
                state.stable_steps = saved.stable_steps;
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GradientScalerState {
    pub enabled: bool,
    pub loss_scale: f32,
    pub stable_steps: usize,
}

pub(crate) fn contains_non_finite(tensor: &Tensor) -> Result<bool, TrainingError> {
    if tensor.elem_count() == 0 {
        return Ok(false);
    }
    let sum = tensor
        .to_dtype(DType::F32)
        .map_err(to_runtime_error)?
        .abs()
        .map_err(to_runtime_error)?
        .sum_all()
        .map_err(to_runtime_error)?
        .to_vec0::<f32>()
        .map_err(to_runtime_error)?;
    Ok(!sum.is_finite())
}

fn sanitize_config(mut config: LossScaleConfig) -> LossScaleConfig {
    if config.growth_factor < 1.0 {
        config.growth_factor = 1.0;
    }
    if !(0.0..1.0).contains(&config.backoff_factor) {
        config.backoff_factor = 0.5;
    }
    if config.growth_interval == 0 {
        config.growth_interval = 1;
    }
    if config.min_scale <= 0.0 {
        config.min_scale = 1.0;
    }
    if config.max_scale < config.min_scale {
        config.max_scale = config.min_scale;
    }
    config.initial_scale = config
        .initial_scale
        .clamp(config.min_scale, config.max_scale);
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor};

    fn tensor_from(data: &[f32]) -> Tensor {
        Tensor::from_slice(data, (data.len(),), &Device::Cpu).unwrap()
    }

    #[test]
    fn grows_after_interval() {
        let mut scaler = GradientScaler::with_config(
            LossScaleConfig {
                initial_scale: 512.0,
                growth_interval: 2,
                ..LossScaleConfig::default()
            },
            Precision::Fp16,
        );

        assert!(scaler.is_enabled());
        assert_eq!(scaler.loss_scale(), 512.0);
        scaler.update(false);
        assert_eq!(scaler.loss_scale(), 512.0);
        scaler.update(false);
        assert_eq!(scaler.loss_scale(), 1024.0);
    }

    #[test]
    fn backs_off_on_overflow() {
        let mut scaler = GradientScaler::with_config(
            LossScaleConfig {
                initial_scale: 1024.0,
                backoff_factor: 0.25,
                ..LossScaleConfig::default()
            },
            Precision::Fp16,
        );

        scaler.update(true);
        assert_eq!(scaler.loss_scale(), 256.0);
    }

    #[test]
    fn static_scale_never_moves() {
        let mut scaler = GradientScaler::from_runtime(Precision::Fp16, 128.0);
        scaler.update(true);
        scaler.update(false);
        assert_eq!(scaler.loss_scale(), 128.0);
    }

    #[test]
    fn detects_non_finite_values() {
        assert!(!contains_non_finite(&tensor_from(&[1.0, -3.0])).unwrap());
        assert!(contains_non_finite(&tensor_from(&[f32::INFINITY])).unwrap());
        assert!(contains_non_finite(&tensor_from(&[0.0, f32::NAN])).unwrap());
    }

    #[test]
    fn unscales_gradient_store() {
        let scaler = GradientScaler::fixed(4.0, Precision::Fp16);
        let w = Var::from_tensor(&tensor_from(&[1.0, 1.0])).unwrap();
        let loss = scaler
            .scale(&w.as_tensor().sum_all().unwrap())
            .unwrap();
        let mut grads = loss.backward().unwrap();
        let params = vec![("w".to_string(), w.clone())];

        assert!(scaler.unscale_grads(&params, &mut grads).unwrap());
        let grad = grads.get(w.as_tensor()).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(grad, vec![1.0, 1.0]);
    }

    #[test]
    fn no_op_for_fp32() {
        let scaler = GradientScaler::from_runtime(Precision::Fp32, 0.0);
        assert!(!scaler.is_enabled());
        assert_eq!(scaler.loss_scale(), 1.0);

        let tensor = tensor_from(&[2.0, 4.0]);
        let scaled = scaler.scale(&tensor).unwrap();
        let unscaled = scaler.unscale(&tensor).unwrap();

        assert_eq!(scaled.to_vec1::<f32>().unwrap(), vec![2.0, 4.0]);
        assert_eq!(unscaled.to_vec1::<f32>().unwrap(), vec![2.0, 4.0]);
    }

    #[test]
    fn state_round_trip() {
        let mut scaler = GradientScaler::new(Precision::Fp16);
        scaler.update(true);
        let saved = scaler.state();
        let mut restored = GradientScaler::new(Precision::Fp16);
        restored.load_state(saved.clone());
        assert_eq!(restored.state(), saved);
    }
}
