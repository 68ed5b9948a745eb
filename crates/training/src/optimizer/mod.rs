use std::collections::{HashMap, HashSet};

pub mod clip;
pub mod scaler;

pub use clip::{ClipPolicy, GradientClipper};
pub use scaler::{GradientScaler, LossScaleState};

use candle_core::{backprop::GradStore, DType, Tensor, Var};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{config, scheduler::LearningRateSchedule, TrainingError};

const EPS: f64 = 1e-12;

#[derive(Debug, Clone, Copy)]
pub enum OptimizerConfig {
    Sgd(SgdConfig),
    Adam(AdamConfig),
    AdamW(AdamConfig),
}

#[derive(Debug, Clone, Copy)]
pub struct SgdConfig {
    pub momentum: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct AdamConfig {
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
}

impl TryFrom<&config::OptimizerConfig> for OptimizerConfig {
    type Error = TrainingError;

    fn try_from(value: &config::OptimizerConfig) -> Result<Self, Self::Error> {
        let adam = AdamConfig {
            beta1: value.beta1,
            beta2: value.beta2,
            epsilon: value.epsilon,
            weight_decay: value.weight_decay,
        };
        match value.algorithm {
            config::OptimizerType::Sgd => {
                if !(0.0..1.0).contains(&value.momentum) {
                    return Err(TrainingError::initialization(
                        "sgd momentum must be in [0, 1)",
                    ));
                }
                Ok(OptimizerConfig::Sgd(SgdConfig {
                    momentum: value.momentum,
                }))
            }
            config::OptimizerType::Adam => Ok(OptimizerConfig::Adam(adam)),
            config::OptimizerType::AdamW => Ok(OptimizerConfig::AdamW(adam)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct UpdateReport {
    pub step: usize,
    pub learning_rate: f64,
    pub grad_norm: f64,
    pub skipped: bool,
}

#[derive(Debug)]
pub struct TrainerOptimizer {
    config: OptimizerConfig,
    schedule: Box<dyn LearningRateSchedule>,
    clipper: Option<GradientClipper>,
    scaler: GradientScaler,
    params: Vec<ParameterSlot>,
    step: usize,
}

struct PendingUpdate {
    index: usize,
    next: Tensor,
    first_moment: Tensor,
    second_moment: Option<Tensor>,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    dtype: DType,
    first_moment: Tensor,
    second_moment: Tensor,
}

impl TrainerOptimizer {
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        config: OptimizerConfig,
        schedule: Box<dyn LearningRateSchedule>,
        clipper: Option<GradientClipper>,
    ) -> Result<Self, TrainingError> {
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }

        let mut seen = HashSet::new();
        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            if !seen.insert(name.clone()) {
                return Err(TrainingError::initialization(format!(
                    "duplicate parameter name '{}'",
                    name
                )));
            }
            let tensor = var.as_tensor();
            if !tensor.dtype().is_float() {
                return Err(TrainingError::initialization(format!(
                    "optimizer received non-floating parameter '{}'",
                    name
                )));
            }
            if let Some(clipper) = &clipper {
                clipper.check_parameter(&name, tensor)?;
            }

            let device = tensor.device();
            let shape = tensor.dims().to_vec();
            let first_moment =
                Tensor::zeros(shape.as_slice(), DType::F32, device).map_err(to_runtime_error)?;
            let second_moment =
                Tensor::zeros(shape.as_slice(), DType::F32, device).map_err(to_runtime_error)?;

            params.push(ParameterSlot {
                name,
                dtype: tensor.dtype(),
                param: var,
                first_moment,
                second_moment,
            });
        }

        Ok(Self {
            config,
            schedule,
            clipper,
            scaler: GradientScaler::disabled(),
            params,
            step: 0,
        })
    }

    pub fn with_loss_scale(mut self, scaler: GradientScaler) -> Self {
        self.scaler = scaler;
        self
    }

    pub fn loss_scale(&self) -> f64 {
        self.scaler.loss_scale()
    }

    pub fn global_step(&self) -> usize {
        self.step
    }

    pub fn learning_rate(&self) -> f64 {
        self.schedule.rate(self.step)
    }

    pub fn parameter_names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|slot| slot.name.as_str())
    }

    pub fn apply(&mut self, grads: &mut GradStore) -> Result<UpdateReport, TrainingError> {
        let mut indices = Vec::new();
        let mut params = Vec::new();
        let mut gradients = Vec::new();

        for (idx, slot) in self.params.iter().enumerate() {
            let tensor = slot.param.as_tensor();
            let grad = match grads.remove(tensor) {
                Some(grad) => grad,
                None => continue,
            };
            let grad = grad.to_dtype(DType::F32).map_err(to_runtime_error)?;
            gradients.push(self.scaler.unscale(&grad)?);
            params.push(tensor.to_dtype(DType::F32).map_err(to_runtime_error)?);
            indices.push(idx);
        }

        if indices.is_empty() {
            return Err(TrainingError::compute(
                "no gradients were produced for any tracked parameter",
            ));
        }

        let step = self.step;
        let learning_rate = self.schedule.rate(step);

        if self.scaler.has_overflow(&gradients)? {
            let scale = self.scaler.loss_scale();
            self.scaler.update(true);
            // the schedule keeps counting batches
            self.step += 1;
            warn!(
                step,
                loss_scale = scale,
                next_loss_scale = self.scaler.loss_scale(),
                "non-finite gradients; skipping update"
            );
            return Ok(UpdateReport {
                step,
                learning_rate,
                grad_norm: f64::INFINITY,
                skipped: true,
            });
        }

        let grad_norm = clip::global_norm(&gradients)?;
        let gradients = match &self.clipper {
            Some(clipper) => clipper.apply(&params, &gradients)?,
            None => gradients,
        };

        let updates = indices.into_iter().zip(params).zip(gradients);
        let pending = match self.config {
            OptimizerConfig::Sgd(cfg) => updates
                .map(|((idx, param), grad)| self.step_sgd(cfg, learning_rate, idx, param, grad))
                .collect::<Result<Vec<_>, _>>()?,
            OptimizerConfig::Adam(cfg) => updates
                .map(|((idx, param), grad)| {
                    self.step_adam(cfg, learning_rate, step + 1, false, idx, param, grad)
                })
                .collect::<Result<Vec<_>, _>>()?,
            OptimizerConfig::AdamW(cfg) => updates
                .map(|((idx, param), grad)| {
                    self.step_adam(cfg, learning_rate, step + 1, true, idx, param, grad)
                })
                .collect::<Result<Vec<_>, _>>()?,
        };

        // commit only once every update computed
        for update in pending {
            let slot = &mut self.params[update.index];
            slot.param.set(&update.next).map_err(to_runtime_error)?;
            slot.first_moment = update.first_moment;
            if let Some(second) = update.second_moment {
                slot.second_moment = second;
            }
        }
        self.step += 1;
        self.scaler.update(false);

        Ok(UpdateReport {
            step,
            learning_rate,
            grad_norm,
            skipped: false,
        })
    }

    fn step_sgd(
        &self,
        cfg: SgdConfig,
        learning_rate: f64,
        index: usize,
        param: Tensor,
        grad: Tensor,
    ) -> Result<PendingUpdate, TrainingError> {
        let slot = &self.params[index];
        let descent = grad.affine(learning_rate, 0.0).map_err(to_runtime_error)?;
        let velocity = slot
            .first_moment
            .affine(cfg.momentum, 0.0)
            .map_err(to_runtime_error)?
            .sub(&descent)
            .map_err(to_runtime_error)?;
        let next = param.add(&velocity).map_err(to_runtime_error)?;
        Ok(PendingUpdate {
            index,
            next: slot.cast(next)?,
            first_moment: velocity,
            second_moment: None,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn step_adam(
        &self,
        cfg: AdamConfig,
        learning_rate: f64,
        t: usize,
        decoupled_decay: bool,
        index: usize,
        param: Tensor,
        grad: Tensor,
    ) -> Result<PendingUpdate, TrainingError> {
        let bias_correction1 = 1.0 - cfg.beta1.powi(t as i32);
        let bias_correction2 = 1.0 - cfg.beta2.powi(t as i32);
        let scale_m = if bias_correction1.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction1
        };
        let scale_v = if bias_correction2.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction2
        };

        let slot = &self.params[index];

        let prev_m = slot
            .first_moment
            .affine(cfg.beta1, 0.0)
            .map_err(to_runtime_error)?;
        let grad_term = grad.affine(1.0 - cfg.beta1, 0.0).map_err(to_runtime_error)?;
        let new_m = prev_m.add(&grad_term).map_err(to_runtime_error)?;

        let grad_sq = grad.sqr().map_err(to_runtime_error)?;
        let prev_v = slot
            .second_moment
            .affine(cfg.beta2, 0.0)
            .map_err(to_runtime_error)?;
        let grad_sq_term = grad_sq.affine(1.0 - cfg.beta2, 0.0).map_err(to_runtime_error)?;
        let new_v = prev_v.add(&grad_sq_term).map_err(to_runtime_error)?;

        let m_hat = new_m.affine(scale_m, 0.0).map_err(to_runtime_error)?;
        let v_hat = new_v.affine(scale_v, 0.0).map_err(to_runtime_error)?;
        let denom = v_hat
            .sqrt()
            .map_err(to_runtime_error)?
            .affine(1.0, cfg.epsilon)
            .map_err(to_runtime_error)?;
        let update = m_hat
            .div(&denom)
            .map_err(to_runtime_error)?
            .affine(learning_rate, 0.0)
            .map_err(to_runtime_error)?;

        let base = if decoupled_decay && cfg.weight_decay != 0.0 {
            param
                .affine(1.0 - learning_rate * cfg.weight_decay, 0.0)
                .map_err(to_runtime_error)?
        } else {
            param
        };

        let next = base.sub(&update).map_err(to_runtime_error)?;
        Ok(PendingUpdate {
            index,
            next: slot.cast(next)?,
            first_moment: new_m,
            second_moment: Some(new_v),
        })
    }

    pub fn state(&self) -> Result<OptimizerState, TrainingError> {
        let mut parameters = Vec::with_capacity(self.params.len());
        for slot in &self.params {
            let shape = slot.param.as_tensor().dims().to_vec();
            let numel = numel(&shape);
            parameters.push(ParameterState {
                name: slot.name.clone(),
                first_moment: flatten_to_vec(&slot.first_moment, numel)?,
                second_moment: flatten_to_vec(&slot.second_moment, numel)?,
                shape,
            });
        }

        Ok(OptimizerState {
            step: self.step,
            parameters,
            loss_scale: self.scaler.state(),
        })
    }

    pub fn load_state(&mut self, state: OptimizerState) -> Result<(), TrainingError> {
        let mut by_name: HashMap<_, _> = state
            .parameters
            .into_iter()
            .map(|param| (param.name.clone(), param))
            .collect();

        let mut restored = Vec::with_capacity(self.params.len());
        for slot in &self.params {
            let saved = by_name.remove(&slot.name).ok_or_else(|| {
                TrainingError::checkpoint(format!(
                    "optimizer state missing parameter '{}'",
                    slot.name
                ))
            })?;

            let dims = slot.param.as_tensor().dims();
            if dims != saved.shape.as_slice() {
                return Err(TrainingError::checkpoint(format!(
                    "optimizer state shape mismatch for '{}': expected {:?}, found {:?}",
                    slot.name, dims, saved.shape
                )));
            }
            let expected = numel(dims);
            if expected != saved.first_moment.len() || expected != saved.second_moment.len() {
                return Err(TrainingError::checkpoint(format!(
                    "optimizer state size mismatch for '{}'",
                    slot.name
                )));
            }

            let device = slot.param.as_tensor().device();
            let first = Tensor::from_vec(saved.first_moment, dims, device)
                .map_err(to_checkpoint_error)?;
            let second = Tensor::from_vec(saved.second_moment, dims, device)
                .map_err(to_checkpoint_error)?;
            restored.push((first, second));
        }

        if !by_name.is_empty() {
            let mut extra: Vec<_> = by_name.into_keys().collect();
            extra.sort();
            return Err(TrainingError::checkpoint(format!(
                "optimizer state has parameters not present in the models: {}",
                extra.join(", ")
            )));
        }

        for (slot, (first, second)) in self.params.iter_mut().zip(restored) {
            slot.first_moment = first;
            slot.second_moment = second;
        }
        self.step = state.step;
        if let Some(saved) = state.loss_scale {
            self.scaler.restore(saved);
        }

        Ok(())
    }
}

impl ParameterSlot {
    fn cast(&self, next: Tensor) -> Result<Tensor, TrainingError> {
        if self.dtype == DType::F32 {
            Ok(next)
        } else {
            next.to_dtype(self.dtype).map_err(to_runtime_error)
        }
    }
}

fn flatten_to_vec(tensor: &Tensor, expected: usize) -> Result<Vec<f32>, TrainingError> {
    let flat = tensor
        .flatten_all()
        .map_err(to_runtime_error)?
        .to_vec1::<f32>()
        .map_err(to_runtime_error)?;
    if flat.len() != expected {
        return Err(TrainingError::runtime(
            "unexpected element count during serialization",
        ));
    }
    Ok(flat)
}

fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerState {
    pub step: usize,
    pub parameters: Vec<ParameterState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loss_scale: Option<LossScaleState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterState {
    pub name: String,
    pub shape: Vec<usize>,
    pub first_moment: Vec<f32>,
    pub second_moment: Vec<f32>,
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

fn to_checkpoint_error(err: candle_core::Error) -> TrainingError {
    TrainingError::checkpoint(err.to_string())
}
