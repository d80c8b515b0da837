use std::{
    collections::HashMap,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use candle_core::{safetensors::load as load_safetensors, Device, Var};
use hex::encode as hex_encode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    classifier::{assign_parameters, ImageClassifier},
    config::CheckpointConfig,
    logging::current_unix_timestamp,
    optimizer::{GradientScaler, GradientScalerState, OptimizerState, TrainerOptimizer},
    scheduler::{LRScheduler, SchedulerState},
    TrainingConfig, TrainingError,
};

pub const CHECKPOINT_VERSION: u32 = 1;
pub const BEST_LABEL: &str = "Best";
const MODEL_FILENAME: &str = "model.safetensors";
const OPTIMIZER_FILENAME: &str = "optimizer.json";
const SCHEDULER_FILENAME: &str = "scheduler.json";
const SCALER_FILENAME: &str = "scaler.json";
const MANIFEST_FILENAME: &str = "manifest.json";

/// `Latest-epoch<N>`: one directory per completed epoch.
pub fn latest_label(epoch: usize) -> String {
    format!("Latest-epoch{}", epoch)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub label: String,
    pub epoch: usize,
    pub best_accuracy: f64,
    pub global_step: usize,
    pub created_unix_timestamp: u64,
    pub config_sha256: String,
    pub model: FileRecord,
    pub optimizer: FileRecord,
    pub scheduler: FileRecord,
    pub scaler: FileRecord,
}

pub struct SaveRequest<'a> {
    pub run_dir: &'a Path,
    pub label: &'a str,
    pub epoch: usize,
    pub best_accuracy: f64,
    pub global_step: usize,
    pub config: &'a TrainingConfig,
    pub parameters: Vec<(String, Var)>,
    pub optimizer: &'a TrainerOptimizer,
    pub scheduler: &'a dyn LRScheduler,
    pub scaler: &'a GradientScaler,
}

#[derive(Debug, Clone)]
pub struct CheckpointDescriptor {
    pub directory: PathBuf,
    pub manifest: CheckpointManifest,
}

pub struct LoadOutcome {
    pub manifest: CheckpointManifest,
    pub optimizer_state: OptimizerState,
    pub scheduler_state: SchedulerState,
    pub scaler_state: GradientScalerState,
    pub model_weights_path: PathBuf,
}

/// Writes `<run_dir>/<label>/`. Files are staged in a sibling directory and
/// swapped in at the end, so an existing label is replaced as a whole.
pub fn save_checkpoint(request: &SaveRequest<'_>) -> Result<CheckpointDescriptor, TrainingError> {
    if request.label.is_empty() || request.label.contains(['/', '\\']) || request.label.starts_with('.') {
        return Err(TrainingError::storage(format!(
            "invalid checkpoint label '{}'",
            request.label
        )));
    }
    fs::create_dir_all(request.run_dir)
        .map_err(|err| storage_error("create checkpoint directory", request.run_dir, err))?;

    let target = request.run_dir.join(request.label);
    let staging = request.run_dir.join(format!(".{}.partial", request.label));
    let retired = retired_path(&target);
    restore_retired(&target)?;
    for leftover in [&staging, &retired] {
        if leftover.exists() {
            fs::remove_dir_all(leftover)
                .map_err(|err| storage_error("remove stale directory", leftover, err))?;
        }
    }
    fs::create_dir(&staging).map_err(|err| storage_error("create staging directory", &staging, err))?;

    let model_path = staging.join(MODEL_FILENAME);
    save_model_weights(&request.parameters, &model_path)?;
    let model_record = file_record(&model_path)?;

    let optimizer_path = staging.join(OPTIMIZER_FILENAME);
    write_json(&optimizer_path, &request.optimizer.state()?)?;
    let optimizer_record = file_record(&optimizer_path)?;

    let scheduler_path = staging.join(SCHEDULER_FILENAME);
    write_json(&scheduler_path, &request.scheduler.snapshot())?;
    let scheduler_record = file_record(&scheduler_path)?;

    let scaler_path = staging.join(SCALER_FILENAME);
    write_json(&scaler_path, &request.scaler.state())?;
    let scaler_record = file_record(&scaler_path)?;

    let manifest = CheckpointManifest {
        version: CHECKPOINT_VERSION,
        label: request.label.to_string(),
        epoch: request.epoch,
        best_accuracy: request.best_accuracy,
        global_step: request.global_step,
        created_unix_timestamp: current_unix_timestamp(),
        config_sha256: fingerprint_config(request.config)?,
        model: model_record,
        optimizer: optimizer_record,
        scheduler: scheduler_record,
        scaler: scaler_record,
    };
    write_json(&staging.join(MANIFEST_FILENAME), &manifest)?;

    if target.exists() {
        fs::rename(&target, &retired)
            .map_err(|err| storage_error("retire previous checkpoint", &target, err))?;
    }
    if let Err(err) = fs::rename(&staging, &target) {
        let publish_error = storage_error("publish checkpoint", &target, err);
        if let Err(restore_error) = restore_retired(&target) {
            log::warn!("{}", restore_error);
        }
        return Err(publish_error);
    }
    if retired.exists() {
        if let Err(err) = fs::remove_dir_all(&retired) {
            log::warn!("failed to remove {}: {}", retired.display(), err);
        }
    }

    Ok(CheckpointDescriptor {
        directory: target,
        manifest,
    })
}

/// [`save_checkpoint`] with `policy.max_retries` further attempts after a
/// backoff of `policy.retry_backoff_ms`.
pub fn save_with_retry(
    request: &SaveRequest<'_>,
    policy: &CheckpointConfig,
) -> Result<CheckpointDescriptor, TrainingError> {
    let mut attempt = 0usize;
    loop {
        match save_checkpoint(request) {
            Ok(descriptor) => return Ok(descriptor),
            Err(err) if attempt < policy.max_retries => {
                attempt += 1;
                log::warn!(
                    "checkpoint '{}' failed ({}); retrying in {} ms ({}/{})",
                    request.label,
                    err,
                    policy.retry_backoff_ms,
                    attempt,
                    policy.max_retries
                );
                thread::sleep(Duration::from_millis(policy.retry_backoff_ms));
            }
            Err(TrainingError::Storage(msg)) => return Err(TrainingError::Storage(msg)),
            Err(err) => {
                return Err(TrainingError::storage(format!(
                    "checkpoint '{}': {}",
                    request.label, err
                )))
            }
        }
    }
}

pub fn load_checkpoint(directory: &Path) -> Result<LoadOutcome, TrainingError> {
    restore_retired(directory)?;
    let manifest = load_manifest(directory)?;
    ensure_version_supported(manifest.version)?;

    let model_path = directory.join(&manifest.model.filename);
    validate_file(&model_path, &manifest.model)?;

    let optimizer_path = directory.join(&manifest.optimizer.filename);
    validate_file(&optimizer_path, &manifest.optimizer)?;
    let optimizer_state: OptimizerState = read_json(&optimizer_path)?;

    let scheduler_path = directory.join(&manifest.scheduler.filename);
    validate_file(&scheduler_path, &manifest.scheduler)?;
    let scheduler_state: SchedulerState = read_json(&scheduler_path)?;

    let scaler_path = directory.join(&manifest.scaler.filename);
    validate_file(&scaler_path, &manifest.scaler)?;
    let scaler_state: GradientScalerState = read_json(&scaler_path)?;

    Ok(LoadOutcome {
        manifest,
        optimizer_state,
        scheduler_state,
        scaler_state,
        model_weights_path: model_path,
    })
}

pub fn apply_model_weights<M>(model: &M, weights_path: &Path) -> Result<usize, TrainingError>
where
    M: ImageClassifier + ?Sized,
{
    let tensors: HashMap<_, _> = load_safetensors(weights_path, &Device::Cpu)
        .map_err(|err| TrainingError::runtime(format!("failed to read {}: {err}", weights_path.display())))?;
    let applied = assign_parameters(model, &tensors)?;
    if applied != tensors.len() {
        let known: Vec<String> = model.named_parameters().into_iter().map(|(name, _)| name).collect();
        let mut extra: Vec<&String> = tensors.keys().filter(|name| !known.contains(name)).collect();
        extra.sort();
        return Err(TrainingError::runtime(format!(
            "checkpoint contains unused parameters: {}",
            extra.iter().map(|name| name.as_str()).collect::<Vec<_>>().join(", ")
        )));
    }
    Ok(applied)
}

/// `<run_dir>/.<label>.old`, where a replaced checkpoint waits until the new
/// one is published.
fn retired_path(target: &Path) -> PathBuf {
    let label = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{}.old", label))
}

/// Moves a retired checkpoint back into place when the swap that retired it
/// never published a replacement.
fn restore_retired(target: &Path) -> Result<(), TrainingError> {
    let retired = retired_path(target);
    if target.exists() || !retired.is_dir() {
        return Ok(());
    }
    log::warn!(
        "restoring {} from interrupted save {}",
        target.display(),
        retired.display()
    );
    fs::rename(&retired, target).map_err(|err| storage_error("restore retired checkpoint", target, err))
}

fn save_model_weights(parameters: &[(String, Var)], path: &Path) -> Result<(), TrainingError> {
    if parameters.is_empty() {
        return Err(TrainingError::storage(
            "model contains no parameters to checkpoint",
        ));
    }
    let tensors: HashMap<String, candle_core::Tensor> = parameters
        .iter()
        .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
        .collect();
    candle_core::safetensors::save(&tensors, path).map_err(|err| {
        TrainingError::storage(format!(
            "failed to serialize model weights to {}: {err}",
            path.display()
        ))
    })
}

fn fingerprint_config(config: &TrainingConfig) -> Result<String, TrainingError> {
    let json = serde_json::to_vec(config)
        .map_err(|err| TrainingError::storage(format!("failed to hash config: {err}")))?;
    Ok(hex_encode(Sha256::digest(json)))
}

fn file_record(path: &Path) -> Result<FileRecord, TrainingError> {
    let sha256 = sha256_file(path)?;
    let bytes = path
        .metadata()
        .map_err(|err| storage_error("stat checkpoint file", path, err))?
        .len();
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            TrainingError::storage(format!(
                "checkpoint file name is not valid UTF-8: {}",
                path.display()
            ))
        })?
        .to_string();
    Ok(FileRecord {
        filename,
        sha256,
        bytes,
    })
}

fn load_manifest(directory: &Path) -> Result<CheckpointManifest, TrainingError> {
    let manifest_path = directory.join(MANIFEST_FILENAME);
    if !manifest_path.is_file() {
        return Err(TrainingError::runtime(format!(
            "checkpoint manifest not found at {}",
            manifest_path.display()
        )));
    }
    read_json(&manifest_path)
}

fn ensure_version_supported(version: u32) -> Result<(), TrainingError> {
    if version != CHECKPOINT_VERSION {
        return Err(TrainingError::runtime(format!(
            "unsupported checkpoint version {} (expected {})",
            version, CHECKPOINT_VERSION
        )));
    }
    Ok(())
}

fn validate_file(path: &Path, record: &FileRecord) -> Result<(), TrainingError> {
    let actual = sha256_file(path)?;
    if actual != record.sha256 {
        return Err(TrainingError::runtime(format!(
            "checkpoint file {} failed checksum validation",
            path.display()
        )));
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String, TrainingError> {
    let mut file = File::open(path).map_err(|err| storage_error("open", path, err))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1024 * 1024];
    loop {
        let read = file
            .read(&mut buffer)
            .map_err(|err| storage_error("read", path, err))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TrainingError> {
    let mut file = File::create(path).map_err(|err| storage_error("create", path, err))?;
    let data = serde_json::to_vec_pretty(value)
        .map_err(|err| TrainingError::storage(format!("failed to serialize JSON: {err}")))?;
    file.write_all(&data)
        .and_then(|_| file.write_all(b"\n"))
        .and_then(|_| file.sync_all())
        .map_err(|err| storage_error("write", path, err))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, TrainingError> {
    let file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    serde_json::from_reader(file).map_err(|err| {
        TrainingError::runtime(format!("failed to parse JSON {}: {err}", path.display()))
    })
}

fn storage_error(action: &str, path: &Path, err: std::io::Error) -> TrainingError {
    TrainingError::storage(format!("failed to {} {}: {}", action, path.display(), err))
}
