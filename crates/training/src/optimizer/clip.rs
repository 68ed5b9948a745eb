use candle_core::Tensor;

use crate::{config, TrainingError};

const AGC_MIN_GRAD_NORM: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClipPolicy {
    GlobalNorm { threshold: f64 },
    PerTensorNorm { threshold: f64 },
    Adaptive { clip_factor: f64, eps: f64 },
}

impl From<&config::ClipConfig> for ClipPolicy {
    fn from(value: &config::ClipConfig) -> Self {
        match *value {
            config::ClipConfig::GlobalNorm { threshold } => ClipPolicy::GlobalNorm { threshold },
            config::ClipConfig::PerTensorNorm { threshold } => {
                ClipPolicy::PerTensorNorm { threshold }
            }
            config::ClipConfig::Adaptive { clip_factor, eps } => {
                ClipPolicy::Adaptive { clip_factor, eps }
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GradientClipper {
    policy: ClipPolicy,
}

impl GradientClipper {
    pub fn new(policy: ClipPolicy) -> Self {
        Self { policy }
    }

    pub fn from_config(cfg: &config::ClipConfig) -> Self {
        Self::new(ClipPolicy::from(cfg))
    }

    pub fn policy(&self) -> ClipPolicy {
        self.policy
    }

    pub fn check_parameter(&self, name: &str, param: &Tensor) -> Result<(), TrainingError> {
        if let ClipPolicy::Adaptive { .. } = self.policy {
            if param.rank() > 4 {
                return Err(TrainingError::initialization(format!(
                    "adaptive clipping does not support rank {} parameter '{}'",
                    param.rank(),
                    name
                )));
            }
        }
        Ok(())
    }

    pub fn apply(&self, params: &[Tensor], grads: &[Tensor]) -> Result<Vec<Tensor>, TrainingError> {
        match self.policy {
            ClipPolicy::GlobalNorm { threshold } => clip_by_global_norm(grads, threshold),
            ClipPolicy::PerTensorNorm { threshold } => clip_by_tensor_norm(grads, threshold),
            ClipPolicy::Adaptive { clip_factor, eps } => {
                adaptive_clip(params, grads, clip_factor, eps)
            }
        }
    }
}

pub fn l2_norm(tensor: &Tensor) -> Result<f64, TrainingError> {
    let squared = tensor
        .sqr()
        .map_err(to_compute_error)?
        .sum_all()
        .map_err(to_compute_error)?
        .to_dtype(candle_core::DType::F64)
        .map_err(to_compute_error)?;
    let value = squared.to_vec0::<f64>().map_err(to_compute_error)?;
    Ok(value.sqrt())
}

pub fn global_norm(grads: &[Tensor]) -> Result<f64, TrainingError> {
    let mut total = 0.0;
    for grad in grads {
        let norm = l2_norm(grad)?;
        total += norm * norm;
    }
    Ok(total.sqrt())
}

pub fn clip_by_global_norm(grads: &[Tensor], threshold: f64) -> Result<Vec<Tensor>, TrainingError> {
    let norm = global_norm(grads)?;
    if norm <= threshold {
        return Ok(grads.to_vec());
    }
    let scale = threshold / norm;
    grads
        .iter()
        .map(|grad| grad.affine(scale, 0.0).map_err(to_compute_error))
        .collect()
}

pub fn clip_by_tensor_norm(grads: &[Tensor], threshold: f64) -> Result<Vec<Tensor>, TrainingError> {
    grads
        .iter()
        .map(|grad| {
            let norm = l2_norm(grad)?;
            if norm <= threshold {
                Ok(grad.clone())
            } else {
                grad.affine(threshold / norm, 0.0).map_err(to_compute_error)
            }
        })
        .collect()
}

pub fn unitwise_norm(tensor: &Tensor) -> Result<Tensor, TrainingError> {
    let squared = tensor.sqr().map_err(to_compute_error)?;
    let reduced = match tensor.rank() {
        0 | 1 => squared.sum_all().map_err(to_compute_error)?,
        2..=4 => {
            let mut acc = squared;
            for dim in 0..tensor.rank() - 1 {
                acc = acc.sum_keepdim(dim).map_err(to_compute_error)?;
            }
            acc
        }
        rank => {
            return Err(TrainingError::initialization(format!(
                "unit-wise norm is undefined for rank {} tensors",
                rank
            )))
        }
    };
    reduced.sqrt().map_err(to_compute_error)
}

pub fn adaptive_clip(
    params: &[Tensor],
    grads: &[Tensor],
    clip_factor: f64,
    eps: f64,
) -> Result<Vec<Tensor>, TrainingError> {
    if params.len() != grads.len() {
        return Err(TrainingError::compute(format!(
            "adaptive clipping received {} parameters for {} gradients",
            params.len(),
            grads.len()
        )));
    }

    params
        .iter()
        .zip(grads)
        .map(|(param, grad)| clip_unitwise(param, grad, clip_factor, eps))
        .collect()
}

fn clip_unitwise(
    param: &Tensor,
    grad: &Tensor,
    clip_factor: f64,
    eps: f64,
) -> Result<Tensor, TrainingError> {
    let max_norm = unitwise_norm(param)?
        .maximum(eps)
        .map_err(to_compute_error)?
        .affine(clip_factor, 0.0)
        .map_err(to_compute_error)?;
    let grad_norm = unitwise_norm(grad)?;

    let scale = max_norm
        .div(&grad_norm.maximum(AGC_MIN_GRAD_NORM).map_err(to_compute_error)?)
        .map_err(to_compute_error)?;
    let clipped = grad.broadcast_mul(&scale).map_err(to_compute_error)?;

    // Units below the bound keep their gradient bit for bit.
    let keep = grad_norm
        .lt(&max_norm)
        .map_err(to_compute_error)?
        .broadcast_as(grad.shape())
        .map_err(to_compute_error)?
        .contiguous()
        .map_err(to_compute_error)?;
    keep.where_cond(grad, &clipped).map_err(to_compute_error)
}

fn to_compute_error(err: candle_core::Error) -> TrainingError {
    TrainingError::compute(err.to_string())
}
