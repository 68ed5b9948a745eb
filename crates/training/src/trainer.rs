use std::{sync::Arc, time::Instant};

use tracing::info;

use crate::{
    checkpoint::{self, CheckpointManager, SaveRequest, StoppingRecord},
    config::LossKind,
    data::{next_with_retry, BatchStream, DatasetBinding, RetryPolicy},
    early_stopping::{EarlyStopping, MonitorMode},
    executor::{ReplicaPool, StepExecutor},
    interleave::DatasetInterleaver,
    logging::{Logger, LoggingSettings},
    loss::Loss,
    metrics::{EpochResult, TaskMetrics},
    model::TrainableModel,
    optimizer::{clip::GradientClipper, GradientScaler, OptimizerConfig, TrainerOptimizer},
    scheduler::SchedulerConfig,
    TrainingConfig, TrainingError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumePoint {
    pub epoch: usize,
    pub global_step: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrainingSummary {
    pub epochs_run: usize,
    pub next_epoch: usize,
    pub global_step: usize,
    pub stopped_early: bool,
}

pub struct Trainer {
    config: TrainingConfig,
    models: Vec<Arc<dyn TrainableModel>>,
    bindings: Vec<DatasetBinding>,
    executors: Vec<StepExecutor>,
    optimizer: TrainerOptimizer,
    interleaver: DatasetInterleaver,
    stopping: Vec<EarlyStopping>,
    metrics: Vec<TaskMetrics>,
    checkpoints: CheckpointManager,
    retry: RetryPolicy,
    logger: Logger,
    start_epoch: usize,
    history: Vec<EpochResult>,
}

impl Trainer {
    pub fn new(
        config: TrainingConfig,
        models: Vec<Arc<dyn TrainableModel>>,
        bindings: Vec<DatasetBinding>,
    ) -> Result<Self, TrainingError> {
        config.validate()?;
        validate_bindings(&models, &bindings)?;

        let loss_kind = config.loss.kind;
        let loss: Arc<dyn Loss> = Arc::from(LossKind::build(&config.loss));

        let mut named_parameters = Vec::new();
        for (model_index, model) in models.iter().enumerate() {
            for (name, var) in model.parameters() {
                named_parameters.push((format!("model{model_index}/{name}"), var));
            }
        }

        let batch_counts: Vec<usize> = bindings.iter().map(DatasetBinding::train_batches).collect();
        let train_batches_per_epoch = batch_counts.iter().sum();
        let schedule =
            SchedulerConfig::from_training_config(&config.schedule, train_batches_per_epoch)?
                .build()?;
        let clipper = config.clip.as_ref().map(GradientClipper::from_config);
        let optimizer_config = OptimizerConfig::try_from(&config.optimizer)?;
        let scaler = GradientScaler::from_config(config.optimizer.loss_scale.as_ref());
        let optimizer =
            TrainerOptimizer::new(named_parameters, optimizer_config, schedule, clipper)?
                .with_loss_scale(scaler);

        let pool = Arc::new(ReplicaPool::new(config.runtime.replicas)?);
        let executors = bindings
            .iter()
            .enumerate()
            .map(|(dataset, binding)| {
                StepExecutor::new(
                    dataset,
                    binding.model_index(),
                    binding.weight(),
                    Arc::clone(&loss),
                    Arc::clone(&pool),
                )
            })
            .collect();

        let monitor = loss_kind.monitor_mode();
        let stopping = bindings
            .iter()
            .map(|_| EarlyStopping::from_config(&config.early_stopping, monitor))
            .collect();
        let metrics = bindings
            .iter()
            .map(|_| TaskMetrics::new(loss_kind.metric_kind()))
            .collect();

        let interleaver = DatasetInterleaver::new(&batch_counts, config.runtime.seed);
        let checkpoints = CheckpointManager::new(&config.runtime.output_dir, &config)?;
        let retry = RetryPolicy::from(&config.runtime.data_retry);
        let logger = Logger::new(LoggingSettings::from_config(&config.runtime.logging))?;

        info!(
            models = models.len(),
            datasets = bindings.len(),
            replicas = pool.replicas(),
            train_batches_per_epoch,
            loss = ?loss_kind,
            "trainer initialised"
        );

        Ok(Self {
            config,
            models,
            bindings,
            executors,
            optimizer,
            interleaver,
            stopping,
            metrics,
            checkpoints,
            retry,
            logger,
            start_epoch: 0,
            history: Vec::new(),
        })
    }

    pub fn resume_from_latest(&mut self) -> Result<Option<ResumePoint>, TrainingError> {
        let Some(records) = self.checkpoints.restore_latest(self.models.len())? else {
            return Ok(None);
        };
        let Some(first) = records.first() else {
            return Ok(None);
        };
        let epoch = first.manifest.epoch;

        for (model_index, outcome) in records.iter().enumerate() {
            checkpoint::apply_model_weights(
                self.models[model_index].as_ref(),
                &outcome.model_weights_path,
            )?;

            if self.config.early_stopping.restore_state {
                for record in &outcome.manifest.early_stopping {
                    let controller = self.stopping.get_mut(record.dataset).ok_or_else(|| {
                        TrainingError::checkpoint(format!(
                            "checkpoint for model {} records early stopping for unknown dataset {}",
                            model_index, record.dataset
                        ))
                    })?;
                    controller.restore(record.snapshot);
                }
            }
        }

        self.optimizer.load_state(first.optimizer_state.clone())?;
        self.start_epoch = epoch + 1;

        let point = ResumePoint {
            epoch: self.start_epoch,
            global_step: self.optimizer.global_step(),
        };
        info!(
            epoch = point.epoch,
            global_step = point.global_step,
            restored_early_stopping = self.config.early_stopping.restore_state,
            "resumed from checkpoint"
        );
        Ok(Some(point))
    }

    pub fn train(&mut self) -> Result<TrainingSummary, TrainingError> {
        let max_epoch = self.config.early_stopping.max_epoch;
        let mut epoch = self.start_epoch;
        let mut epochs_run = 0;
        let mut stopped_early = false;

        while epoch < max_epoch {
            if !self.stopping.is_empty() && self.stopping.iter().all(EarlyStopping::is_stopped) {
                info!(epoch, "every dataset has stopped improving");
                stopped_early = true;
                break;
            }
            self.run_epoch(epoch)?;
            epochs_run += 1;
            epoch += 1;
            self.start_epoch = epoch;
        }

        self.logger.flush();
        Ok(TrainingSummary {
            epochs_run,
            next_epoch: epoch,
            global_step: self.optimizer.global_step(),
            stopped_early,
        })
    }

    pub fn run_epoch(&mut self, epoch: usize) -> Result<Vec<EpochResult>, TrainingError> {
        let started = Instant::now();

        let mut streams = self
            .bindings
            .iter()
            .map(|binding| binding.train().open())
            .collect::<Result<Vec<Box<dyn BatchStream>>, _>>()?;

        let order = self.interleaver.epoch_order(epoch).to_vec();
        for dataset in order {
            let batch = next_with_retry(streams[dataset].as_mut(), &self.retry)?.ok_or_else(|| {
                TrainingError::runtime(format!(
                    "training stream for dataset {} ended before its {} batches",
                    dataset,
                    self.bindings[dataset].train_batches()
                ))
            })?;
            let model = self.models[self.bindings[dataset].model_index()].as_ref();
            let outcome = self.executors[dataset].train_step(
                model,
                &mut self.optimizer,
                &batch,
                &mut self.metrics[dataset],
            )?;
            self.logger.log_step(&outcome);
        }
        drop(streams);

        for (dataset, binding) in self.bindings.iter().enumerate() {
            let model = self.models[binding.model_index()].as_ref();
            let mut stream = binding.eval().open()?;
            while let Some(batch) = next_with_retry(stream.as_mut(), &self.retry)? {
                self.executors[dataset].eval_step(model, &batch, &mut self.metrics[dataset])?;
            }
        }

        let improved: Vec<bool> = self
            .stopping
            .iter_mut()
            .zip(&self.metrics)
            .map(|(controller, metrics)| {
                let monitored = match controller.mode() {
                    MonitorMode::Maximize => metrics.valid.primary.result(),
                    MonitorMode::Minimize => metrics.valid_loss.result(),
                };
                controller.observe(epoch, monitored).improved
            })
            .collect();

        self.save_checkpoints(epoch, &improved)?;

        let duration = started.elapsed();
        let results: Vec<EpochResult> = self
            .metrics
            .iter()
            .zip(&improved)
            .enumerate()
            .map(|(dataset, (metrics, &best))| {
                EpochResult::from_metrics(dataset, epoch, metrics, duration, best)
            })
            .collect();
        self.logger.log_epoch(epoch, duration, &results);

        for metrics in &mut self.metrics {
            metrics.reset();
        }
        self.history.extend(results.iter().cloned());
        Ok(results)
    }

    fn save_checkpoints(&self, epoch: usize, improved: &[bool]) -> Result<(), TrainingError> {
        for (model_index, model) in self.models.iter().enumerate() {
            let early_stopping = self
                .bindings
                .iter()
                .enumerate()
                .filter(|(_, binding)| binding.model_index() == model_index)
                .map(|(dataset, _)| StoppingRecord {
                    dataset,
                    snapshot: self.stopping[dataset].snapshot(),
                })
                .collect();
            let descriptor = self.checkpoints.save(SaveRequest {
                model_index,
                epoch,
                model: model.as_ref(),
                optimizer: &self.optimizer,
                early_stopping,
            })?;
            self.checkpoints.save_check(model_index, model.as_ref())?;
            info!(
                model = model_index,
                epoch,
                global_step = descriptor.manifest.global_step,
                path = %descriptor.directory.display(),
                "saved checkpoint"
            );
        }
        // Older records go only once every model holds this epoch.
        for model_index in 0..self.models.len() {
            self.checkpoints.prune(model_index, epoch)?;
        }

        for (dataset, &best) in improved.iter().enumerate() {
            if !best {
                continue;
            }
            let model_index = self.bindings[dataset].model_index();
            let path = self
                .checkpoints
                .save_best(model_index, self.models[model_index].as_ref())?;
            info!(dataset, model = model_index, path = %path.display(), "saved best model");
        }
        Ok(())
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn optimizer(&self) -> &TrainerOptimizer {
        &self.optimizer
    }

    pub fn global_step(&self) -> usize {
        self.optimizer.global_step()
    }

    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    pub fn history(&self) -> &[EpochResult] {
        &self.history
    }

    pub fn early_stopping(&self, dataset: usize) -> Option<&EarlyStopping> {
        self.stopping.get(dataset)
    }

    pub fn bindings(&self) -> &[DatasetBinding] {
        &self.bindings
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }
}

fn validate_bindings(
    models: &[Arc<dyn TrainableModel>],
    bindings: &[DatasetBinding],
) -> Result<(), TrainingError> {
    let mut errors = Vec::new();
    if models.is_empty() {
        errors.push("at least one model is required".to_string());
    }
    if bindings.is_empty() {
        errors.push("at least one dataset binding is required".to_string());
    }
    for (dataset, binding) in bindings.iter().enumerate() {
        if binding.model_index() >= models.len() {
            errors.push(format!(
                "dataset {} ({}) refers to model {} but only {} model(s) were given",
                dataset,
                binding.name(),
                binding.model_index(),
                models.len()
            ));
        }
        if binding.weight() < 0.0 {
            errors.push(format!("dataset {} weight must be >= 0", dataset));
        }
    }
    for model_index in 0..models.len() {
        if !bindings.iter().any(|binding| binding.model_index() == model_index) {
            errors.push(format!("model {} has no dataset bound to it", model_index));
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(TrainingError::validation(errors))
    }
}
