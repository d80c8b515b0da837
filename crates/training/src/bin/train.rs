use std::{path::PathBuf, str::FromStr};

use clap::Parser;
use serde_json::{Map, Number, Value};
use training::{
    build_model, init_logging, select_device, set_seed, CifarDataSource, Logger, LoggingSettings,
    Trainer, TrainingConfig, TrainingError,
};

fn main() {
    if let Err(err) = run() {
        log::error!("training failed: {}", err);
        eprintln!("training failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Fine-tune a Vision Transformer on CIFAR-10/100", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "PATH", help = "Path to training config file (TOML or JSON)")]
    config: PathBuf,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override configuration value using dot-separated paths"
    )]
    overrides: Vec<OverrideArg>,

    #[arg(long, value_name = "CHECKPOINT_DIR", help = "Resume from a saved checkpoint directory")]
    resume: Option<PathBuf>,
}

#[derive(Debug, Clone)]
struct OverrideArg {
    path: String,
    value: String,
}

impl FromStr for OverrideArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();

    let mut config = TrainingConfig::load(&args.config)?;
    if !args.overrides.is_empty() {
        config = apply_overrides(config, &args.overrides)?;
        config.validate()?;
    }

    if let Some(log_path) = init_logging(&config)? {
        log::info!("writing logs to {}", log_path.display());
    }
    log::info!("Training parameters {:?}", config);

    let device = select_device(config.runtime.device)?;
    set_seed(&device, config.runtime.seed);

    let model = build_model(&config, &device)?;
    let train_source = CifarDataSource::open(
        config.data.dataset,
        &config.data.data_path,
        true,
        config.data.train_batch_size,
        config.data.img_size,
        config.runtime.seed,
    )?;
    let val_source = CifarDataSource::open(
        config.data.dataset,
        &config.data.data_path,
        false,
        config.data.eval_batch_size,
        config.data.img_size,
        config.runtime.seed,
    )?;

    let logger = Logger::new(LoggingSettings::from_config(&config))?;
    let mut trainer = Trainer::new(
        config,
        model,
        Box::new(train_source),
        Box::new(val_source),
        device,
    )?;
    trainer.add_observer(Box::new(logger));

    if let Some(directory) = &args.resume {
        trainer.resume_from(directory)?;
    }

    let summary = trainer.train()?;
    println!(
        "finished {} epoch(s) in {:.1}s: best accuracy {:.4}, {} optimizer steps",
        summary.epochs_completed,
        summary.elapsed.as_secs_f64(),
        summary.best_accuracy,
        summary.global_step
    );
    Ok(())
}

fn apply_overrides(
    config: TrainingConfig,
    overrides: &[OverrideArg],
) -> Result<TrainingConfig, TrainingError> {
    let mut value = serde_json::to_value(config).map_err(|err| {
        TrainingError::runtime(format!("failed to serialize config for overrides: {err}"))
    })?;

    for override_arg in overrides {
        let new_value = parse_override_value(&override_arg.value);
        set_value_at_path(&mut value, &override_arg.path, new_value)?;
    }

    serde_json::from_value(value).map_err(|err| {
        TrainingError::ConfigFormat(format!("invalid config after overrides: {err}"))
    })
}

fn parse_override_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if trimmed.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Ok(float_val) = trimmed.parse::<f64>() {
        if let Some(number) = Number::from_f64(float_val) {
            return Value::Number(number);
        }
    }
    Value::String(trimmed.to_string())
}

fn set_value_at_path(target: &mut Value, path: &str, new_value: Value) -> Result<(), TrainingError> {
    let segments: Vec<&str> = path.split('.').map(str::trim).collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(TrainingError::ConfigFormat(format!(
            "invalid override path '{}'",
            path
        )));
    }

    let Some((last, parents)) = segments.split_last() else {
        return Err(TrainingError::ConfigFormat("override path must not be empty".into()));
    };

    let mut current = target;
    for segment in parents {
        let map = as_object(current, segment)?;
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    as_object(current, last)?.insert(last.to_string(), new_value);
    Ok(())
}

fn as_object<'a>(value: &'a mut Value, segment: &str) -> Result<&'a mut Map<String, Value>, TrainingError> {
    if value.is_null() {
        *value = Value::Object(Map::new());
    }
    value.as_object_mut().ok_or_else(|| {
        TrainingError::ConfigFormat(format!(
            "override path segment '{}' points into a non-object value",
            segment
        ))
    })
}
