use std::fmt;

use crate::{config, TrainingError};

const DEFAULT_LEARNING_RATE: f64 = 0.01;

pub trait LearningRateSchedule: Send + Sync + fmt::Debug {
    fn rate(&self, step: usize) -> f64;
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    base: BaseSchedule,
    warmup: Option<WarmupSettings>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BaseSchedule {
    Constant {
        learning_rate: f64,
    },
    Cyclical {
        initial: f64,
        maximal: f64,
        final_rate: f64,
        step_size: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WarmupSettings {
    pub warmup_steps: usize,
    pub power: f64,
}

impl SchedulerConfig {
    pub fn from_training_config(
        cfg: &config::ScheduleConfig,
        train_batches_per_epoch: usize,
    ) -> Result<Self, TrainingError> {
        let base = match (
            cfg.initial_learning_rate,
            cfg.maximal_learning_rate,
            cfg.final_learning_rate,
            cfg.train_epochs_cycle1,
        ) {
            (Some(initial), Some(maximal), Some(final_rate), Some(epochs)) => {
                let step_size = epochs.saturating_mul(train_batches_per_epoch);
                BaseSchedule::Cyclical {
                    initial,
                    maximal,
                    final_rate,
                    step_size,
                }
            }
            _ => BaseSchedule::Constant {
                learning_rate: cfg.learning_rate.unwrap_or(DEFAULT_LEARNING_RATE),
            },
        };

        let warmup = cfg.warmup_steps.map(|warmup_steps| WarmupSettings {
            warmup_steps,
            power: cfg.warmup_power,
        });

        Ok(Self { base, warmup })
    }

    pub fn base(&self) -> BaseSchedule {
        self.base
    }

    pub fn warmup(&self) -> Option<WarmupSettings> {
        self.warmup
    }

    pub fn initial_learning_rate(&self) -> f64 {
        match self.base {
            BaseSchedule::Constant { learning_rate } => learning_rate,
            BaseSchedule::Cyclical { initial, .. } => initial,
        }
    }

    pub fn build(self) -> Result<Box<dyn LearningRateSchedule>, TrainingError> {
        let initial = self.initial_learning_rate();
        let inner: Box<dyn LearningRateSchedule> = match self.base {
            BaseSchedule::Constant { learning_rate } => {
                Box::new(ConstantSchedule::new(learning_rate)?)
            }
            BaseSchedule::Cyclical {
                initial,
                maximal,
                final_rate,
                step_size,
            } => Box::new(CyclicalSchedule::new(initial, maximal, final_rate, step_size)?),
        };

        match self.warmup {
            Some(settings) => Ok(Box::new(WarmUp::new(
                initial,
                settings.warmup_steps,
                settings.power,
                inner,
            )?)),
            None => Ok(inner),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConstantSchedule {
    learning_rate: f64,
}

impl ConstantSchedule {
    pub fn new(learning_rate: f64) -> Result<Self, TrainingError> {
        if !learning_rate.is_finite() || learning_rate < 0.0 {
            return Err(TrainingError::initialization(
                "constant schedule requires a finite learning rate >= 0",
            ));
        }
        Ok(Self { learning_rate })
    }
}

impl LearningRateSchedule for ConstantSchedule {
    fn rate(&self, _step: usize) -> f64 {
        self.learning_rate
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CyclicalSchedule {
    initial: f64,
    maximal: f64,
    final_rate: f64,
    step_size: usize,
}

impl CyclicalSchedule {
    pub fn new(
        initial: f64,
        maximal: f64,
        final_rate: f64,
        step_size: usize,
    ) -> Result<Self, TrainingError> {
        if step_size == 0 {
            return Err(TrainingError::initialization(
                "cyclical schedule requires a step size greater than zero",
            ));
        }
        if [initial, maximal, final_rate]
            .iter()
            .any(|rate| !rate.is_finite() || *rate < 0.0)
        {
            return Err(TrainingError::initialization(
                "cyclical schedule rates must be finite and >= 0",
            ));
        }
        Ok(Self {
            initial,
            maximal,
            final_rate,
            step_size,
        })
    }

    pub fn step_size(&self) -> usize {
        self.step_size
    }
}

impl LearningRateSchedule for CyclicalSchedule {
    fn rate(&self, step: usize) -> f64 {
        let step = step as f64;
        let size = self.step_size as f64;
        if step > 2.0 * size {
            return self.final_rate;
        }
        let cycle = (1.0 + step / (2.0 * size)).floor();
        let x = (step / size - 2.0 * cycle + 1.0).abs();
        self.initial + (self.maximal - self.initial) * (1.0 - x).max(0.0)
    }
}

#[derive(Debug)]
pub struct WarmUp {
    initial_learning_rate: f64,
    warmup_steps: usize,
    power: f64,
    inner: Box<dyn LearningRateSchedule>,
}

impl WarmUp {
    pub fn new(
        initial_learning_rate: f64,
        warmup_steps: usize,
        power: f64,
        inner: Box<dyn LearningRateSchedule>,
    ) -> Result<Self, TrainingError> {
        if warmup_steps == 0 {
            return Err(TrainingError::initialization(
                "warmup requires warmup_steps greater than zero",
            ));
        }
        if !power.is_finite() || power < 0.0 {
            return Err(TrainingError::initialization(
                "warmup power must be finite and >= 0",
            ));
        }
        Ok(Self {
            initial_learning_rate,
            warmup_steps,
            power,
            inner,
        })
    }
}

impl LearningRateSchedule for WarmUp {
    fn rate(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            let progress = step as f64 / self.warmup_steps as f64;
            self.initial_learning_rate * progress.powf(self.power)
        } else {
            self.inner.rate(step - self.warmup_steps)
        }
    }
}
