use serde::{Deserialize, Serialize};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
};
use vit_model::{ViTConfig, KNOWN_MODELS};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path(path)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.run.name.trim().is_empty() {
            errors.push("run.name must not be empty".to_string());
        }

        if self.data.train_batch_size == 0 {
            errors.push("data.train_batch_size must be greater than 0".to_string());
        }

        if self.data.eval_batch_size == 0 {
            errors.push("data.eval_batch_size must be greater than 0".to_string());
        }

        if let Some(classes) = self.data.num_classes {
            if classes != self.data.dataset.num_classes() {
                errors.push(format!(
                    "data.num_classes ({}) does not match {} ({} classes)",
                    classes,
                    self.data.dataset,
                    self.data.dataset.num_classes()
                ));
            }
        }

        match ViTConfig::named(&self.model.name) {
            Some(vit) => {
                if self.data.img_size == 0 || self.data.img_size % vit.patch_size != 0 {
                    errors.push(format!(
                        "data.img_size ({}) must be a positive multiple of the {} patch size ({})",
                        self.data.img_size, self.model.name, vit.patch_size
                    ));
                }
            }
            None => errors.push(format!(
                "model.name '{}' is not one of: {}",
                self.model.name,
                KNOWN_MODELS.join(", ")
            )),
        }

        if self.optimizer.learning_rate <= 0.0 {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }

        if !(0.0..1.0).contains(&self.optimizer.momentum) {
            errors.push("optimizer.momentum must be in [0, 1)".to_string());
        }

        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }

        if !(0.0 < self.optimizer.beta1 && self.optimizer.beta1 < 1.0) {
            errors.push("optimizer.beta1 must be in (0, 1)".to_string());
        }

        if !(0.0 < self.optimizer.beta2 && self.optimizer.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in (0, 1)".to_string());
        }

        if self.optimizer.max_grad_norm <= 0.0 {
            errors.push("optimizer.max_grad_norm must be greater than 0".to_string());
        }

        if let Some(min_lr) = self.scheduler.min_lr {
            if min_lr < 0.0 || min_lr > self.optimizer.learning_rate {
                errors.push("scheduler.min_lr must be in [0, optimizer.learning_rate]".to_string());
            }
        }

        if self.runtime.epochs == 0 {
            errors.push("runtime.epochs must be greater than 0".to_string());
        }

        if self.runtime.start_epoch == 0 || self.runtime.start_epoch > self.runtime.epochs {
            errors.push(format!(
                "runtime.start_epoch must be in [1, {}]",
                self.runtime.epochs
            ));
        }

        if self.runtime.log_every_n_steps == 0 {
            errors.push("runtime.log_every_n_steps must be greater than 0".to_string());
        }

        if self.runtime.eval_every_n_steps == 0 {
            errors.push("runtime.eval_every_n_steps must be greater than 0".to_string());
        }

        if self.runtime.eval_log_every_n_steps == 0 {
            errors.push("runtime.eval_log_every_n_steps must be greater than 0".to_string());
        }

        if self.runtime.loss_scale < 0.0 {
            errors.push("runtime.loss_scale must be >= 0 (0 selects dynamic scaling)".to_string());
        }

        if !self.runtime.initial_best_accuracy.is_finite() {
            errors.push("runtime.initial_best_accuracy must be finite".to_string());
        }

        if self.logging.tensorboard_flush_every_n == 0 {
            errors.push("logging.tensorboard_flush_every_n must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    /// `<save_dir>/<dataset>/<name>`: logs, event files and checkpoints land here.
    pub fn run_dir(&self) -> PathBuf {
        self.run
            .save_dir
            .join(self.data.dataset.to_string())
            .join(&self.run.name)
    }

    pub fn num_classes(&self) -> usize {
        self.data
            .num_classes
            .unwrap_or_else(|| self.data.dataset.num_classes())
    }

    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.run.save_dir, base);
        absolutize_in_place(&mut self.data.data_path, base);
        if let Some(path) = self.model.pretrained.as_mut() {
            absolutize_in_place(path, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_run_name")]
    pub name: String,
    #[serde(default = "default_save_dir")]
    pub save_dir: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            name: default_run_name(),
            save_dir: default_save_dir(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Dataset {
    Cifar10,
    Cifar100,
}

impl Dataset {
    pub fn num_classes(self) -> usize {
        match self {
            Dataset::Cifar10 => 10,
            Dataset::Cifar100 => 100,
        }
    }
}

impl Default for Dataset {
    fn default() -> Self {
        Self::Cifar100
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dataset::Cifar10 => f.write_str("cifar10"),
            Dataset::Cifar100 => f.write_str("cifar100"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default)]
    pub dataset: Dataset,
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,
    #[serde(default)]
    pub num_classes: Option<usize>,
    #[serde(default = "default_img_size")]
    pub img_size: usize,
    #[serde(default = "default_batch_size")]
    pub train_batch_size: usize,
    #[serde(default = "default_batch_size")]
    pub eval_batch_size: usize,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            dataset: Dataset::default(),
            data_path: default_data_path(),
            num_classes: None,
            img_size: default_img_size(),
            train_batch_size: default_batch_size(),
            eval_batch_size: default_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_model_name")]
    pub name: String,
    #[serde(default)]
    pub pretrained: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub zero_head: bool,
    #[serde(default)]
    pub freeze_backbone: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: default_model_name(),
            pretrained: None,
            zero_head: true,
            freeze_backbone: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default)]
    pub algorithm: OptimizerType,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_momentum")]
    pub momentum: f64,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_adam_eps")]
    pub epsilon: f64,
    #[serde(default = "default_max_grad_norm")]
    pub max_grad_norm: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            algorithm: OptimizerType::default(),
            learning_rate: default_learning_rate(),
            momentum: default_momentum(),
            weight_decay: 0.0,
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_adam_eps(),
            max_grad_norm: default_max_grad_norm(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerType {
    Sgd,
    AdamW,
}

impl Default for OptimizerType {
    fn default() -> Self {
        Self::Sgd
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub decay_type: DecayType,
    #[serde(default = "default_warmup_steps")]
    pub warmup_steps: usize,
    #[serde(default)]
    pub min_lr: Option<f64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            decay_type: DecayType::default(),
            warmup_steps: default_warmup_steps(),
            min_lr: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecayType {
    Cosine,
    Linear,
    Constant,
}

impl Default for DecayType {
    fn default() -> Self {
        Self::Cosine
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_start_epoch")]
    pub start_epoch: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub device: DevicePreference,
    #[serde(default)]
    pub precision: Precision,
    /// Static loss scale for scaled precision; `0` selects dynamic scaling.
    #[serde(default)]
    pub loss_scale: f32,
    #[serde(default)]
    pub initial_best_accuracy: f64,
    #[serde(default = "default_log_every_n_steps")]
    pub log_every_n_steps: usize,
    #[serde(default = "default_eval_every_n_steps")]
    pub eval_every_n_steps: usize,
    #[serde(default = "default_eval_log_every_n_steps")]
    pub eval_log_every_n_steps: usize,
    #[serde(default)]
    pub non_finite: NonFinitePolicy,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            start_epoch: default_start_epoch(),
            seed: default_seed(),
            device: DevicePreference::default(),
            precision: Precision::default(),
            loss_scale: 0.0,
            initial_best_accuracy: 0.0,
            log_every_n_steps: default_log_every_n_steps(),
            eval_every_n_steps: default_eval_every_n_steps(),
            eval_log_every_n_steps: default_eval_log_every_n_steps(),
            non_finite: NonFinitePolicy::default(),
            checkpoint: CheckpointConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DevicePreference {
    Auto,
    Cpu,
    Cuda,
    Metal,
}

impl Default for DevicePreference {
    fn default() -> Self {
        Self::Auto
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    Fp32,
    Fp16,
}

impl Default for Precision {
    fn default() -> Self {
        Precision::Fp32
    }
}

/// What to do when a step produces a non-finite loss or gradient.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NonFinitePolicy {
    Abort,
    SkipBatch,
}

impl Default for NonFinitePolicy {
    fn default() -> Self {
        Self::Abort
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_checkpoint_retries")]
    pub max_retries: usize,
    #[serde(default = "default_checkpoint_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            max_retries: default_checkpoint_retries(),
            retry_backoff_ms: default_checkpoint_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_true")]
    pub enable_stdout: bool,
    #[serde(default = "default_true")]
    pub log_file: bool,
    #[serde(default = "default_true")]
    pub tensorboard: bool,
    #[serde(default = "default_tensorboard_flush")]
    pub tensorboard_flush_every_n: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enable_stdout: true,
            log_file: true,
            tensorboard: true,
            tensorboard_flush_every_n: default_tensorboard_flush(),
        }
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_run_name() -> String {
    "vit-finetune".to_string()
}

fn default_save_dir() -> PathBuf {
    PathBuf::from("./logs")
}

fn default_data_path() -> PathBuf {
    PathBuf::from("./data")
}

fn default_img_size() -> usize {
    224
}

fn default_batch_size() -> usize {
    32
}

fn default_model_name() -> String {
    "ViT-B_16".to_string()
}

fn default_true() -> bool {
    true
}

fn default_learning_rate() -> f64 {
    3e-2
}

fn default_momentum() -> f64 {
    0.9
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn default_adam_eps() -> f64 {
    1e-8
}

fn default_max_grad_norm() -> f64 {
    1.0
}

fn default_warmup_steps() -> usize {
    500
}

fn default_epochs() -> usize {
    10
}

fn default_start_epoch() -> usize {
    1
}

fn default_seed() -> u64 {
    42
}

fn default_log_every_n_steps() -> usize {
    50
}

fn default_eval_every_n_steps() -> usize {
    200
}

fn default_eval_log_every_n_steps() -> usize {
    100
}

fn default_checkpoint_retries() -> usize {
    1
}

fn default_checkpoint_backoff_ms() -> u64 {
    500
}

fn default_tensorboard_flush() -> usize {
    50
}

#[derive(Debug)]
pub enum TrainingError {
    Io(std::io::Error),
    ConfigFormat(String),
    Validation(Vec<String>),
    Initialization(String),
    DataStream(String),
    NumericInstability {
        epoch: usize,
        batch_index: usize,
        detail: String,
    },
    Storage(String),
    Runtime(String),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }

    pub fn data_stream(message: impl Into<String>) -> Self {
        Self::DataStream(message.into())
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }
}

impl fmt::Display for TrainingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingError::Io(err) => write!(f, "failed to read config: {}", err),
            TrainingError::ConfigFormat(err) => write!(f, "failed to parse config: {}", err),
            TrainingError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            TrainingError::Initialization(msg) => {
                write!(f, "trainer initialization failed: {}", msg)
            }
            TrainingError::DataStream(msg) => write!(f, "malformed data batch: {}", msg),
            TrainingError::NumericInstability {
                epoch,
                batch_index,
                detail,
            } => write!(
                f,
                "numeric instability at epoch {} batch {}: {}",
                epoch, batch_index, detail
            ),
            TrainingError::Storage(msg) => write!(f, "checkpoint storage failed: {}", msg),
            TrainingError::Runtime(msg) => write!(f, "training failed: {}", msg),
        }
    }
}

impl std::error::Error for TrainingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrainingError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TrainingError {
    fn from(value: std::io::Error) -> Self {
        TrainingError::Io(value)
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        TrainingConfig::default().validate().unwrap();
    }

    #[test]
    fn collects_every_violation() {
        let mut config = TrainingConfig::default();
        config.runtime.epochs = 0;
        config.data.train_batch_size = 0;
        config.data.num_classes = Some(10);
        config.model.name = "ViT-Z_99".to_string();

        let err = config.validate().unwrap_err();
        let TrainingError::Validation(messages) = err else {
            panic!("expected validation error, got {err}");
        };
        assert!(messages.iter().any(|m| m.contains("runtime.epochs")));
        assert!(messages.iter().any(|m| m.contains("runtime.start_epoch")));
        assert!(messages.iter().any(|m| m.contains("train_batch_size")));
        assert!(messages.iter().any(|m| m.contains("num_classes")));
        assert!(messages.iter().any(|m| m.contains("ViT-Z_99")));
    }

    #[test]
    fn rejects_image_size_not_divisible_by_patch() {
        let mut config = TrainingConfig::default();
        config.data.img_size = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn loads_toml_and_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.toml");
        fs::write(
            &path,
            r#"
[run]
name = "cifar10-test"
save_dir = "out"

[data]
dataset = "cifar10"
img_size = 32

[model]
name = "testing"

[runtime]
epochs = 2
"#,
        )
        .unwrap();

        let config = TrainingConfig::load(&path).unwrap();
        assert_eq!(config.num_classes(), 10);
        assert_eq!(config.optimizer.algorithm, OptimizerType::Sgd);
        assert_eq!(config.runtime.eval_every_n_steps, 200);
        assert_eq!(
            config.run_dir(),
            dir.path().join("out").join("cifar10").join("cifar10-test")
        );
    }
}
