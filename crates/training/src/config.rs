use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default)]
    pub loss: LossConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub clip: Option<ClipConfig>,
    #[serde(default)]
    pub early_stopping: EarlyStoppingConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub models: Vec<ModelSpec>,
    #[serde(default)]
    pub datasets: Vec<DatasetSpec>,
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

        if self.loss.spec_weight < 0.0 {
            errors.push("loss.spec_weight must be >= 0".to_string());
        }
        if self.loss.total_weight < 0.0 {
            errors.push("loss.total_weight must be >= 0".to_string());
        }

        let opt = &self.optimizer;
        if !(0.0..1.0).contains(&opt.momentum) {
            errors.push("optimizer.momentum must be in [0, 1)".to_string());
        }
        if !(0.0..1.0).contains(&opt.beta1) {
            errors.push("optimizer.beta1 must be in [0, 1)".to_string());
        }
        if !(0.0..1.0).contains(&opt.beta2) {
            errors.push("optimizer.beta2 must be in [0, 1)".to_string());
        }
        if opt.epsilon <= 0.0 {
            errors.push("optimizer.epsilon must be greater than 0".to_string());
        }
        if opt.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }
        if let Some(scale) = &opt.loss_scale {
            if scale.min_scale <= 0.0 || scale.max_scale < scale.min_scale {
                errors.push(
                    "optimizer.loss_scale needs 0 < min_scale <= max_scale".to_string(),
                );
            }
            if !(scale.min_scale..=scale.max_scale).contains(&scale.initial_scale) {
                errors.push(
                    "optimizer.loss_scale.initial_scale must lie within [min_scale, max_scale]"
                        .to_string(),
                );
            }
            if scale.growth_factor < 1.0 {
                errors.push("optimizer.loss_scale.growth_factor must be >= 1".to_string());
            }
            if !(scale.backoff_factor > 0.0 && scale.backoff_factor < 1.0) {
                errors.push("optimizer.loss_scale.backoff_factor must be in (0, 1)".to_string());
            }
            if scale.growth_interval == 0 {
                errors.push("optimizer.loss_scale.growth_interval must be greater than 0".to_string());
            }
        }

        let schedule = &self.schedule;
        if let Some(lr) = schedule.learning_rate {
            if lr < 0.0 {
                errors.push("schedule.learning_rate must be >= 0".to_string());
            }
        }
        for (label, value) in [
            ("schedule.initial_learning_rate", schedule.initial_learning_rate),
            ("schedule.maximal_learning_rate", schedule.maximal_learning_rate),
            ("schedule.final_learning_rate", schedule.final_learning_rate),
        ] {
            if let Some(value) = value {
                if value < 0.0 {
                    errors.push(format!("{} must be >= 0", label));
                }
            }
        }
        if let Some(0) = schedule.train_epochs_cycle1 {
            errors.push("schedule.train_epochs_cycle1 must be greater than 0".to_string());
        }
        if let Some(0) = schedule.warmup_steps {
            errors.push("schedule.warmup_steps must be greater than 0".to_string());
        }
        if schedule.warmup_power < 0.0 {
            errors.push("schedule.warmup_power must be >= 0".to_string());
        }

        match &self.clip {
            Some(ClipConfig::GlobalNorm { threshold }) | Some(ClipConfig::PerTensorNorm { threshold })
                if *threshold <= 0.0 =>
            {
                errors.push("clip.threshold must be greater than 0".to_string());
            }
            Some(ClipConfig::Adaptive { clip_factor, eps }) => {
                if *clip_factor <= 0.0 {
                    errors.push("clip.clip_factor must be greater than 0".to_string());
                }
                if *eps <= 0.0 {
                    errors.push("clip.eps must be greater than 0".to_string());
                }
            }
            _ => {}
        }

        let stopping = &self.early_stopping;
        if stopping.min_epoch > stopping.max_epoch {
            errors.push(format!(
                "early_stopping.min_epoch ({}) cannot exceed early_stopping.max_epoch ({})",
                stopping.min_epoch, stopping.max_epoch
            ));
        }
        if stopping.min_delta < 0.0 {
            errors.push("early_stopping.min_delta must be >= 0".to_string());
        }

        if self.runtime.replicas == 0 {
            errors.push("runtime.replicas must be greater than 0".to_string());
        }
        if self.runtime.data_retry.backoff_secs < 0.0 {
            errors.push("runtime.data_retry.backoff_secs must be >= 0".to_string());
        }
        if self.runtime.output_dir.as_os_str().is_empty() {
            errors.push("runtime.output_dir must not be empty".to_string());
        }

        for (idx, model) in self.models.iter().enumerate() {
            if model.input_dim == 0 || model.output_dim == 0 {
                errors.push(format!("models[{}] dimensions must be greater than 0", idx));
            }
            if model.l2 < 0.0 {
                errors.push(format!("models[{}].l2 must be >= 0", idx));
            }
        }

        for (idx, dataset) in self.datasets.iter().enumerate() {
            if dataset.batch_size == 0 {
                errors.push(format!("datasets[{}].batch_size must be greater than 0", idx));
            }
            if dataset.weight < 0.0 {
                errors.push(format!("datasets[{}].weight must be >= 0", idx));
            }
            if !self.models.is_empty() && dataset.model >= self.models.len() {
                errors.push(format!(
                    "datasets[{}].model refers to model {} but only {} model(s) are configured",
                    idx,
                    dataset.model,
                    self.models.len()
                ));
            }
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    fn apply_base_path(&mut self, base: &Path) {
        self.runtime.apply_base_path(base);
        for dataset in &mut self.datasets {
            absolutize_in_place(&mut dataset.train, base);
            absolutize_in_place(&mut dataset.eval, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LossConfig {
    #[serde(default)]
    pub kind: LossKind,
    #[serde(default = "default_loss_weight")]
    pub spec_weight: f64,
    #[serde(default = "default_loss_weight")]
    pub total_weight: f64,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            kind: LossKind::default(),
            spec_weight: default_loss_weight(),
            total_weight: default_loss_weight(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    Mse,
    Bce,
    #[default]
    Poisson,
    #[serde(alias = "poisson-kl")]
    PoissonKl,
    #[serde(rename = "poisson_mn", alias = "poisson_multinomial", alias = "poisson-multinomial")]
    PoissonMultinomial,
    #[serde(alias = "custom_weighted", alias = "custom-weighted")]
    MseUdot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default)]
    pub algorithm: OptimizerType,
    #[serde(default = "default_momentum")]
    pub momentum: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_adam_eps")]
    pub epsilon: f64,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default)]
    pub loss_scale: Option<LossScaleConfig>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            algorithm: OptimizerType::default(),
            momentum: default_momentum(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_adam_eps(),
            weight_decay: 0.0,
            loss_scale: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossScaleConfig {
    #[serde(default = "default_initial_loss_scale")]
    pub initial_scale: f64,
    #[serde(default = "default_growth_factor")]
    pub growth_factor: f64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_growth_interval")]
    pub growth_interval: usize,
    #[serde(default = "default_min_loss_scale")]
    pub min_scale: f64,
    #[serde(default = "default_max_loss_scale")]
    pub max_scale: f64,
}

impl Default for LossScaleConfig {
    fn default() -> Self {
        Self {
            initial_scale: default_initial_loss_scale(),
            growth_factor: default_growth_factor(),
            backoff_factor: default_backoff_factor(),
            growth_interval: default_growth_interval(),
            min_scale: default_min_loss_scale(),
            max_scale: default_max_loss_scale(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerType {
    #[default]
    #[serde(alias = "momentum")]
    Sgd,
    Adam,
    #[serde(rename = "adamw")]
    AdamW,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default)]
    pub learning_rate: Option<f64>,
    #[serde(default)]
    pub initial_learning_rate: Option<f64>,
    #[serde(default)]
    pub maximal_learning_rate: Option<f64>,
    #[serde(default)]
    pub final_learning_rate: Option<f64>,
    #[serde(default)]
    pub train_epochs_cycle1: Option<usize>,
    #[serde(default)]
    pub warmup_steps: Option<usize>,
    #[serde(default = "default_warmup_power")]
    pub warmup_power: f64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            learning_rate: None,
            initial_learning_rate: None,
            maximal_learning_rate: None,
            final_learning_rate: None,
            train_epochs_cycle1: None,
            warmup_steps: None,
            warmup_power: default_warmup_power(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ClipConfig {
    GlobalNorm {
        threshold: f64,
    },
    PerTensorNorm {
        threshold: f64,
    },
    Adaptive {
        clip_factor: f64,
        #[serde(default = "default_agc_eps")]
        eps: f64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EarlyStoppingConfig {
    #[serde(default = "default_patience")]
    pub patience: usize,
    #[serde(default = "default_min_epoch")]
    pub min_epoch: usize,
    #[serde(default = "default_max_epoch")]
    pub max_epoch: usize,
    #[serde(default)]
    pub min_delta: f64,
    #[serde(default)]
    pub restore_state: bool,
}

impl Default for EarlyStoppingConfig {
    fn default() -> Self {
        Self {
            patience: default_patience(),
            min_epoch: default_min_epoch(),
            max_epoch: default_max_epoch(),
            min_delta: 0.0,
            restore_state: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_replicas")]
    pub replicas: usize,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub data_retry: RetryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            replicas: default_replicas(),
            output_dir: default_output_dir(),
            data_retry: RetryConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl RuntimeConfig {
    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.output_dir, base);
        if let Some(dir) = self.logging.tensorboard.as_mut() {
            absolutize_in_place(dir, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_attempts")]
    pub attempts: usize,
    #[serde(default = "default_retry_backoff_secs")]
    pub backoff_secs: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: default_retry_attempts(),
            backoff_secs: default_retry_backoff_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub tensorboard: Option<PathBuf>,
    #[serde(default = "default_tensorboard_flush")]
    pub tensorboard_flush_every_n: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            tensorboard: None,
            tensorboard_flush_every_n: default_tensorboard_flush(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    pub input_dim: usize,
    pub output_dim: usize,
    #[serde(default)]
    pub activation: Activation,
    #[serde(default)]
    pub l2: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    #[default]
    Identity,
    Softplus,
    Sigmoid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetSpec {
    pub train: PathBuf,
    pub eval: PathBuf,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub model: usize,
    #[serde(default = "default_loss_weight")]
    pub weight: f64,
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_loss_weight() -> f64 {
    1.0
}

fn default_momentum() -> f64 {
    0.99
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn default_adam_eps() -> f64 {
    1e-7
}

fn default_initial_loss_scale() -> f64 {
    2f64.powi(15)
}

fn default_growth_factor() -> f64 {
    2.0
}

fn default_backoff_factor() -> f64 {
    0.5
}

fn default_growth_interval() -> usize {
    2000
}

fn default_min_loss_scale() -> f64 {
    1.0
}

fn default_max_loss_scale() -> f64 {
    2f64.powi(24)
}

fn default_warmup_power() -> f64 {
    1.0
}

fn default_agc_eps() -> f64 {
    1e-3
}

fn default_patience() -> usize {
    20
}

fn default_min_epoch() -> usize {
    1
}

fn default_max_epoch() -> usize {
    10_000
}

fn default_seed() -> u64 {
    42
}

fn default_replicas() -> usize {
    1
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("train_out")
}

fn default_retry_attempts() -> usize {
    5
}

fn default_retry_backoff_secs() -> f64 {
    10.0
}

fn default_tensorboard_flush() -> usize {
    1
}

fn default_batch_size() -> usize {
    64
}

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ConfigFormat(String),
    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("trainer initialization failed: {0}")]
    Initialization(String),
    #[error("data source unavailable: {0}")]
    DataUnavailable(String),
    #[error("compute step failed: {0}")]
    Compute(String),
    #[error("checkpoint error: {0}")]
    Checkpoint(String),
    #[error("training failed: {0}")]
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

    pub fn compute(message: impl Into<String>) -> Self {
        Self::Compute(message.into())
    }

    pub fn checkpoint(message: impl Into<String>) -> Self {
        Self::Checkpoint(message.into())
    }

    pub fn data_unavailable(message: impl Into<String>) -> Self {
        Self::DataUnavailable(message.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, TrainingError::DataUnavailable(_))
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
    fn parses_toml_with_defaults() {
        let config: TrainingConfig = toml::from_str(
            r#"
            [loss]
            kind = "poisson_mn"
            total_weight = 0.2

            [optimizer]
            algorithm = "adamw"
            weight_decay = 0.01

            [clip]
            policy = "adaptive"
            clip_factor = 0.1

            [early_stopping]
            patience = 3
            max_epoch = 12
            "#,
        )
        .unwrap();

        assert_eq!(config.loss.kind, LossKind::PoissonMultinomial);
        assert_eq!(config.optimizer.algorithm, OptimizerType::AdamW);
        assert_eq!(config.optimizer.beta2, 0.999);
        assert_eq!(
            config.clip,
            Some(ClipConfig::Adaptive {
                clip_factor: 0.1,
                eps: 1e-3
            })
        );
        assert_eq!(config.early_stopping.min_epoch, 1);
        assert_eq!(config.runtime.replicas, 1);
        config.validate().unwrap();
    }

    #[test]
    fn loss_scale_table_enables_scaling() {
        let config: TrainingConfig = toml::from_str(
            r#"
            [optimizer.loss_scale]
            initial_scale = 1024.0
            growth_interval = 10
            "#,
        )
        .unwrap();
        let scale = config.optimizer.loss_scale.unwrap();
        assert_eq!(scale.initial_scale, 1024.0);
        assert_eq!(scale.backoff_factor, 0.5);
        config.validate().unwrap();

        assert!(TrainingConfig::default().optimizer.loss_scale.is_none());

        let mut bad = TrainingConfig::default();
        bad.optimizer.loss_scale = Some(LossScaleConfig {
            backoff_factor: 1.5,
            ..LossScaleConfig::default()
        });
        assert!(matches!(bad.validate(), Err(TrainingError::Validation(_))));
    }

    #[test]
    fn rejects_unknown_loss_name() {
        let err = toml::from_str::<TrainingConfig>("[loss]\nkind = \"hinge\"\n").unwrap_err();
        let err = TrainingError::from(err);
        assert!(matches!(err, TrainingError::ConfigFormat(_)));
    }

    #[test]
    fn momentum_alias_maps_to_sgd() {
        let config: TrainingConfig =
            toml::from_str("[optimizer]\nalgorithm = \"momentum\"\n").unwrap();
        assert_eq!(config.optimizer.algorithm, OptimizerType::Sgd);
    }

    #[test]
    fn validation_collects_every_violation() {
        let mut config = TrainingConfig::default();
        config.early_stopping.min_epoch = 10;
        config.early_stopping.max_epoch = 5;
        config.schedule.warmup_steps = Some(0);
        config.runtime.replicas = 0;

        match config.validate() {
            Err(TrainingError::Validation(messages)) => {
                assert_eq!(messages.len(), 3, "{messages:?}");
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }
}
