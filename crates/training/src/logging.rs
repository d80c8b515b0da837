use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use prost::Message;

use crate::{
    config::TrainingConfig,
    metrics::{format_duration, EpochSummary, EvaluationSummary},
    observer::{
        EvaluationBatchEvent, EvaluationProgress, EvaluationTrigger, SessionSummary,
        TrainBatchEvent, TrainProgress, TrainingObserver,
    },
    TrainingError,
};

#[derive(Clone, Debug)]
pub struct LoggingSettings {
    pub enable_stdout: bool,
    pub tensorboard_dir: Option<PathBuf>,
    pub tensorboard_flush_every_n: usize,
    pub run_dir: PathBuf,
}

impl LoggingSettings {
    pub fn from_config(config: &TrainingConfig) -> Self {
        let run_dir = config.run_dir();
        Self {
            enable_stdout: config.logging.enable_stdout,
            tensorboard_dir: config.logging.tensorboard.then(|| run_dir.clone()),
            tensorboard_flush_every_n: config.logging.tensorboard_flush_every_n.max(1),
            run_dir,
        }
    }
}

/// Observer that renders training events as text lines through `log` and
/// as scalars in a TensorBoard event file.
pub struct Logger {
    settings: LoggingSettings,
    tensorboard: Option<TensorBoardWriter>,
}

impl Logger {
    pub fn new(settings: LoggingSettings) -> Result<Self, TrainingError> {
        let tensorboard = if let Some(dir) = settings.tensorboard_dir.as_ref() {
            Some(TensorBoardWriter::create(
                dir,
                settings.tensorboard_flush_every_n,
            )?)
        } else {
            None
        };
        Ok(Self {
            settings,
            tensorboard,
        })
    }

    pub fn flush(&mut self) {
        if let Some(writer) = self.tensorboard.as_mut() {
            if let Err(err) = writer.flush() {
                log::warn!("{}", err);
            }
        }
    }

    fn scalar(&mut self, tag: &str, step: usize, value: f64) {
        if let Some(writer) = self.tensorboard.as_mut() {
            if let Err(err) = writer.write_scalar(tag, step as i64, value) {
                log::warn!("dropping tensorboard scalar '{}': {}", tag, err);
            }
        }
    }
}

impl TrainingObserver for Logger {
    fn on_train_batch(&mut self, event: &TrainBatchEvent) {
        let step = event.global_index();
        self.scalar("train_loss", step, event.loss);
        self.scalar("train_acc", step, event.top1);
        self.scalar("train_lr", step, event.learning_rate);
    }

    fn on_train_progress(&mut self, p: &TrainProgress) {
        if !self.settings.enable_stdout {
            return;
        }
        log::info!(
            "Train: [{}/{}][{}/{}]\tEta {}\tTime {:.4} ({:.4})\tLoss {:.4} ({:.4})\tAcc@1 {:.3} ({:.3})\tAcc@5 {:.3} ({:.3})",
            p.epoch,
            p.epochs,
            p.batch_index,
            p.num_batches,
            format_duration(p.eta),
            p.time.value,
            p.time.average,
            p.loss.value,
            p.loss.average,
            p.top1.value,
            p.top1.average,
            p.top5.value,
            p.top5.average
        );
    }

    fn on_batch_skipped(&mut self, epoch: usize, batch_index: usize, reason: &str) {
        log::warn!("epoch {} batch {} skipped: {}", epoch, batch_index, reason);
    }

    fn on_evaluation_start(&mut self, epoch: usize, trigger: EvaluationTrigger) {
        if !self.settings.enable_stdout {
            return;
        }
        match trigger {
            EvaluationTrigger::MidEpoch { batch_index } => {
                log::info!("eval epoch {} (after batch {})", epoch, batch_index)
            }
            EvaluationTrigger::EpochEnd => log::info!("eval epoch {}", epoch),
        }
    }

    fn on_evaluation_batch(&mut self, event: &EvaluationBatchEvent) {
        let step = event.global_index();
        self.scalar("val_loss", step, event.loss);
        self.scalar("val_acc", step, event.top1);
    }

    fn on_evaluation_progress(&mut self, p: &EvaluationProgress) {
        if !self.settings.enable_stdout {
            return;
        }
        log::info!(
            "Test: [{}/{}]\ttime {:.3} ({:.3})\tloss {:.4} ({:.4})\tacc@1 {:.3} ({:.3})\tacc@5 {:.3} ({:.3})",
            p.batch_index,
            p.num_batches,
            p.time.value,
            p.time.average,
            p.loss.value,
            p.loss.average,
            p.top1.value,
            p.top1.average,
            p.top5.value,
            p.top5.average
        );
    }

    fn on_evaluation_end(
        &mut self,
        _epoch: usize,
        trigger: EvaluationTrigger,
        summary: &EvaluationSummary,
    ) {
        if !self.settings.enable_stdout {
            return;
        }
        log::info!(
            "Eval Avg: acc@1 {:.3} acc@5 {:.3}",
            summary.top1,
            summary.top5
        );
        if trigger == EvaluationTrigger::EpochEnd {
            log::info!("Exp path: {}", self.settings.run_dir.display());
        }
    }

    fn on_new_best(&mut self, _epoch: usize, accuracy: f64) {
        log::info!("Max accuracy: {:.4}", accuracy);
    }

    fn on_checkpoint_saved(&mut self, label: &str, path: &Path) {
        log::info!("Saved {} checkpoint to [DIR: {}]", label, path.display());
    }

    fn on_epoch_end(&mut self, summary: &EpochSummary) {
        if summary.skipped_batches > 0 {
            log::warn!(
                "EPOCH {} skipped {} batch(es) with non-finite values",
                summary.epoch,
                summary.skipped_batches
            );
        }
        log::info!(
            "EPOCH {} training takes {}",
            summary.epoch,
            format_duration(summary.duration)
        );
        self.flush();
    }

    fn on_training_end(&mut self, summary: &SessionSummary) {
        log::info!("Training time {}", format_duration(summary.elapsed));
        log::info!(
            "Best accuracy: {:.4} after {} epoch(s), {} optimizer steps",
            summary.best_accuracy,
            summary.epochs_completed,
            summary.global_step
        );
        self.flush();
    }
}

/// Installs the global `log` backend: `<time> - <LEVEL> - <target> - <msg>`
/// lines on stderr and, when enabled, in `<run_dir>/<unix-ts>-<name>-train.log`.
/// Returns the log file path.
pub fn init_logging(config: &TrainingConfig) -> Result<Option<PathBuf>, TrainingError> {
    let log_path = if config.logging.log_file {
        let run_dir = config.run_dir();
        fs::create_dir_all(&run_dir)?;
        Some(run_dir.join(format!(
            "{}-{}-train.log",
            current_unix_timestamp(),
            config.run.name
        )))
    } else {
        None
    };

    let file = match &log_path {
        Some(path) => Some(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|err| {
                    TrainingError::initialization(format!(
                        "failed to open log file {}: {}",
                        path.display(),
                        err
                    ))
                })?,
        ),
        None => None,
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            writeln!(
                buf,
                "{} - {} - {} - {}",
                buf.timestamp_millis(),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .target(env_logger::Target::Pipe(Box::new(TeeWriter { file })))
        .try_init()
        .map_err(|err| TrainingError::initialization(format!("logger already installed: {}", err)))?;

    Ok(log_path)
}

/// Copies every formatted line to stderr and the optional log file.
struct TeeWriter {
    file: Option<File>,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        if let Some(file) = self.file.as_mut() {
            file.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
        }
        Ok(())
    }
}

struct TensorBoardWriter {
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl TensorBoardWriter {
    fn create(dir: &Path, flush_every: usize) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::initialization(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let filename = format!(
            "events.out.tfevents.{}.{}",
            current_unix_timestamp(),
            hostname()
        );
        let path = dir.join(filename);
        let file = File::create(&path).map_err(|err| {
            TrainingError::initialization(format!(
                "failed to create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        let mut writer = Self {
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        };
        writer.write_event(&Event {
            wall_time: current_wall_time(),
            step: 0,
            file_version: Some("brain.Event:2".to_string()),
            summary: None,
        })?;
        writer.flush()?;
        Ok(writer)
    }

    fn write_scalar(&mut self, tag: &str, step: i64, value: f64) -> Result<(), TrainingError> {
        let summary = Summary {
            value: vec![summary::Value {
                tag: tag.to_string(),
                simple_value: Some(value as f32),
            }],
        };
        let event = Event {
            wall_time: current_wall_time(),
            step,
            file_version: None,
            summary: Some(summary),
        };
        self.write_event(&event)
    }

    fn write_event(&mut self, event: &Event) -> Result<(), TrainingError> {
        let mut buffer = BytesMut::with_capacity(128);
        event.encode(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to encode tensorboard event: {err}"))
        })?;

        let data = buffer.freeze();
        let len_bytes = (data.len() as u64).to_le_bytes();
        let len_crc_bytes = masked_crc32(&len_bytes).to_le_bytes();
        let data_crc_bytes = masked_crc32(data.as_ref()).to_le_bytes();

        self.writer
            .write_all(&len_bytes)
            .and_then(|_| self.writer.write_all(&len_crc_bytes))
            .and_then(|_| self.writer.write_all(&data))
            .and_then(|_| self.writer.write_all(&data_crc_bytes))
            .map_err(|err| {
                TrainingError::runtime(format!("failed to write tensorboard event: {err}"))
            })?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush().map_err(|err| {
            TrainingError::runtime(format!("failed to flush tensorboard file: {err}"))
        })?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for TensorBoardWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

pub(crate) fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn current_wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(string, optional, tag = "3")]
    file_version: Option<String>,
    #[prost(message, optional, tag = "5")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "1")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Splits a TFRecord stream into payloads, checking both CRCs.
    fn read_records(bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut records = Vec::new();
        let mut offset = 0;
        while offset < bytes.len() {
            let len_bytes: [u8; 8] = bytes[offset..offset + 8].try_into().unwrap();
            let len = u64::from_le_bytes(len_bytes) as usize;
            let len_crc = u32::from_le_bytes(bytes[offset + 8..offset + 12].try_into().unwrap());
            assert_eq!(len_crc, masked_crc32(&len_bytes));
            let data = &bytes[offset + 12..offset + 12 + len];
            let data_crc = u32::from_le_bytes(
                bytes[offset + 12 + len..offset + 16 + len].try_into().unwrap(),
            );
            assert_eq!(data_crc, masked_crc32(data));
            records.push(data.to_vec());
            offset += 16 + len;
        }
        records
    }

    #[test]
    fn writes_framed_scalar_events() {
        let dir = tempfile::tempdir().unwrap();
        let settings = LoggingSettings {
            enable_stdout: false,
            tensorboard_dir: Some(dir.path().to_path_buf()),
            tensorboard_flush_every_n: 1,
            run_dir: dir.path().to_path_buf(),
        };
        let mut logger = Logger::new(settings).unwrap();
        logger.on_train_batch(&TrainBatchEvent {
            epoch: 2,
            batch_index: 3,
            num_batches: 10,
            batch_size: 4,
            loss: 1.5,
            top1: 25.0,
            top5: 75.0,
            learning_rate: 0.01,
            grad_norm: 0.3,
        });
        drop(logger);

        let path = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .find(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with("events.out.tfevents."))
            })
            .unwrap();
        let records = read_records(&fs::read(path).unwrap());
        assert_eq!(records.len(), 4);

        let header = Event::decode(records[0].as_slice()).unwrap();
        assert_eq!(header.file_version.as_deref(), Some("brain.Event:2"));

        let tags: Vec<(String, i64, f32)> = records[1..]
            .iter()
            .map(|raw| {
                let event = Event::decode(raw.as_slice()).unwrap();
                let value = &event.summary.unwrap().value[0];
                (value.tag.clone(), event.step, value.simple_value.unwrap())
            })
            .collect();
        assert_eq!(
            tags,
            vec![
                ("train_loss".to_string(), 13, 1.5),
                ("train_acc".to_string(), 13, 25.0),
                ("train_lr".to_string(), 13, 0.01),
            ]
        );
    }
}
