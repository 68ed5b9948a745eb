use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::{config::LossScaleConfig, TrainingError};

#[derive(Debug, Clone)]
pub struct GradientScaler {
    state: ScalerState,
}

#[derive(Debug, Clone)]
enum ScalerState {
    Disabled,
    Enabled {
        scale: f64,
        stable_steps: usize,
        config: LossScaleConfig,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossScaleState {
    pub scale: f64,
    pub stable_steps: usize,
}

impl GradientScaler {
    pub fn disabled() -> Self {
        Self {
            state: ScalerState::Disabled,
        }
    }

    pub fn from_config(config: Option<&LossScaleConfig>) -> Self {
        match config {
            Some(config) => {
                let config = sanitize_config(*config);
                Self {
                    state: ScalerState::Enabled {
                        scale: config.initial_scale,
                        stable_steps: 0,
                        config,
                    },
                }
            }
            None => Self::disabled(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self.state, ScalerState::Enabled { .. })
    }

    pub fn loss_scale(&self) -> f64 {
        match &self.state {
            ScalerState::Disabled => 1.0,
            ScalerState::Enabled { scale, .. } => *scale,
        }
    }

    pub fn unscale(&self, tensor: &Tensor) -> Result<Tensor, TrainingError> {
        match &self.state {
            ScalerState::Disabled => Ok(tensor.clone()),
            ScalerState::Enabled { scale, .. } => tensor
                .affine(1.0 / *scale, 0.0)
                .map_err(to_runtime_error),
        }
    }

    pub fn has_overflow(&self, tensors: &[Tensor]) -> Result<bool, TrainingError> {
        if !self.is_enabled() {
            return Ok(false);
        }
        for tensor in tensors {
            if contains_non_finite(tensor)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn update(&mut self, found_inf: bool) {
        if let ScalerState::Enabled {
            scale,
            stable_steps,
            config,
        } = &mut self.state
        {
            if found_inf {
                *scale = (*scale * config.backoff_factor).max(config.min_scale);
                *stable_steps = 0;
            } else {
                *stable_steps += 1;
                if *stable_steps >= config.growth_interval {
                    *scale = (*scale * config.growth_factor).min(config.max_scale);
                    *stable_steps = 0;
                }
            }
        }
    }

    pub fn state(&self) -> Option<LossScaleState> {
        match &self.state {
            ScalerState::Disabled => None,
            ScalerState::Enabled {
                scale,
                stable_steps,
                ..
            } => Some(LossScaleState {
                scale: *scale,
                stable_steps: *stable_steps,
            }),
        }
    }

    pub fn restore(&mut self, saved: LossScaleState) {
        if let ScalerState::Enabled {
            scale,
            stable_steps,
            config,
        } = &mut self.state
        {
            *scale = saved.scale.clamp(config.min_scale, config.max_scale);
            *stable_steps = saved.stable_steps;
        }
    }
}

fn contains_non_finite(tensor: &Tensor) -> Result<bool, TrainingError> {
    if tensor.elem_count() == 0 {
        return Ok(false);
    }
    let sum = tensor
        .to_dtype(DType::F32)
        .map_err(to_runtime_error)?
        .sqr()
        .map_err(to_runtime_error)?
        .sum_all()
        .map_err(to_runtime_error)?
        .to_vec0::<f32>()
        .map_err(to_runtime_error)?;
    Ok(!sum.is_finite())
}

fn sanitize_config(mut config: LossScaleConfig) -> LossScaleConfig {
    if config.growth_factor < 1.0 {
        config.growth_factor = 1.0;
    }
    if !(config.backoff_factor > 0.0 && config.backoff_factor < 1.0) {
        config.backoff_factor = 0.5;
    }
    if config.growth_interval == 0 {
        config.growth_interval = 1;
    }
    if config.min_scale <= 0.0 {
        config.min_scale = 1.0;
    }
    if config.max_scale < config.min_scale {
        config.max_scale = config.min_scale;
    }
    config.initial_scale = config
        .initial_scale
        .clamp(config.min_scale, config.max_scale);
    config
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
