pub mod checkpoint;
pub mod config;
pub mod data;
pub mod early_stopping;
pub mod executor;
pub mod interleave;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod optimizer;
pub mod scheduler;
pub mod trainer;

pub use checkpoint::CheckpointManager;
pub use config::{TrainingConfig, TrainingError};
pub use data::{Batch, BatchStream, Dataset, DatasetBinding, InMemoryDataset};
pub use early_stopping::{EarlyStopping, MonitorMode};
pub use executor::{ReplicaPool, StepExecutor};
pub use loss::{Loss, Reduction};
pub use metrics::{EpochResult, Metric};
pub use model::{LinearModel, TrainableModel};
pub use optimizer::{OptimizerConfig, OptimizerState, TrainerOptimizer};
pub use scheduler::{LearningRateSchedule, SchedulerConfig};
pub use trainer::{ResumePoint, Trainer, TrainingSummary};
