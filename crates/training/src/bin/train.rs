use std::{path::PathBuf, str::FromStr, sync::Arc};

use candle_core::Device;
use clap::Parser;
use multitrain::{
    DatasetBinding, InMemoryDataset, LinearModel, TrainableModel, Trainer, TrainingConfig,
    TrainingError,
};
use serde_json::{Number, Value};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = run() {
        error!(error = %err, "training failed");
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Multi-dataset training CLI", long_about = None)]
struct Args {
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Path to training config file"
    )]
    config: PathBuf,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override configuration value using dot-separated paths"
    )]
    overrides: Vec<OverrideArg>,

    #[arg(long, help = "Resume from the latest checkpoint if available")]
    resume: bool,
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
    }
    config.validate()?;

    if config.models.is_empty() || config.datasets.is_empty() {
        return Err(TrainingError::validation(vec![
            "the train binary needs at least one [[models]] and one [[datasets]] entry"
                .to_string(),
        ]));
    }

    let device = Device::Cpu;
    let models = config
        .models
        .iter()
        .enumerate()
        .map(|(idx, spec)| {
            let seed = config.runtime.seed.wrapping_add(idx as u64);
            LinearModel::from_spec(spec, seed, &device)
                .map(|model| Arc::new(model) as Arc<dyn TrainableModel>)
        })
        .collect::<Result<Vec<_>, _>>()?;

    let bindings = config
        .datasets
        .iter()
        .enumerate()
        .map(|(idx, spec)| -> Result<DatasetBinding, TrainingError> {
            let train = InMemoryDataset::from_safetensors(&spec.train, spec.batch_size, &device)?;
            let eval = InMemoryDataset::from_safetensors(&spec.eval, spec.batch_size, &device)?;
            Ok(DatasetBinding::new(
                format!("data{idx}"),
                spec.model,
                Arc::new(train),
                Arc::new(eval),
            )
            .with_weight(spec.weight))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut trainer = Trainer::new(config, models, bindings)?;

    if args.resume {
        match trainer.resume_from_latest()? {
            Some(point) => info!(
                epoch = point.epoch,
                global_step = point.global_step,
                "resuming training"
            ),
            None => info!("no checkpoint found; starting from scratch"),
        }
    }

    let summary = trainer.train()?;
    info!(
        epochs_run = summary.epochs_run,
        next_epoch = summary.next_epoch,
        global_step = summary.global_step,
        stopped_early = summary.stopped_early,
        "training finished"
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
        TrainingError::ConfigFormat(format!(
            "failed to deserialize config after overrides: {err}"
        ))
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
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(json_val) = serde_json::from_str::<Value>(trimmed) {
            return json_val;
        }
    }
    Value::String(trimmed.to_string())
}

#[derive(Debug)]
struct PathSegment {
    key: String,
    index: Option<usize>,
}

fn parse_path(path: &str) -> Result<Vec<PathSegment>, TrainingError> {
    path.split('.')
        .map(|segment| match segment.split_once('[') {
            Some((base, idx_part)) => {
                let index = idx_part.trim_end_matches(']').parse::<usize>().map_err(|err| {
                    TrainingError::runtime(format!(
                        "invalid index in override path '{}': {}",
                        segment, err
                    ))
                })?;
                Ok(PathSegment {
                    key: base.to_string(),
                    index: Some(index),
                })
            }
            None => Ok(PathSegment {
                key: segment.to_string(),
                index: None,
            }),
        })
        .collect()
}

fn set_value_at_path(value: &mut Value, path: &str, new_value: Value) -> Result<(), TrainingError> {
    let segments = parse_path(path)?;
    if segments.is_empty() {
        return Err(TrainingError::runtime("override path must not be empty"));
    }
    assign_at_path(value, &segments, new_value)
}

fn assign_at_path(
    target: &mut Value,
    segments: &[PathSegment],
    new_value: Value,
) -> Result<(), TrainingError> {
    let Some((segment, rest)) = segments.split_first() else {
        *target = new_value;
        return Ok(());
    };

    if target.is_null() {
        *target = Value::Object(serde_json::Map::new());
    }
    let map = target.as_object_mut().ok_or_else(|| {
        TrainingError::runtime(format!(
            "override path segment '{}' points to non-object value",
            segment.key
        ))
    })?;
    let entry = map.entry(segment.key.clone()).or_insert(Value::Null);

    let Some(array_index) = segment.index else {
        return assign_at_path(entry, rest, new_value);
    };
    if entry.is_null() {
        *entry = Value::Array(Vec::new());
    }
    let array = entry.as_array_mut().ok_or_else(|| {
        TrainingError::runtime(format!(
            "override path segment '{}' expects array value",
            segment.key
        ))
    })?;
    while array.len() <= array_index {
        array.push(Value::Null);
    }
    assign_at_path(&mut array[array_index], rest, new_value)
}
