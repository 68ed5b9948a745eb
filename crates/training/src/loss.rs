use std::fmt;

use candle_core::Tensor;

use crate::{
    config::{LossConfig, LossKind},
    early_stopping::MonitorMode,
    metrics::MetricKind,
    TrainingError,
};

const POISSON_EPS: f64 = 1e-7;
const BCE_EPS: f64 = 1e-7;
const KL_EPS: f64 = 1e-3;
const MULTINOMIAL_EPS: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    Mean,
    None,
}

pub trait Loss: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Loss per example, shape `[batch]`.
    fn per_example(&self, labels: &Tensor, predictions: &Tensor) -> Result<Tensor, TrainingError>;

    fn compute(
        &self,
        labels: &Tensor,
        predictions: &Tensor,
        reduction: Reduction,
    ) -> Result<Tensor, TrainingError> {
        let per_example = self.per_example(labels, predictions)?;
        match reduction {
            Reduction::None => Ok(per_example),
            Reduction::Mean => per_example.mean_all().map_err(to_compute_error),
        }
    }
}

impl LossKind {
    pub fn build(cfg: &LossConfig) -> Box<dyn Loss> {
        match cfg.kind {
            LossKind::Mse => Box::new(MeanSquaredError),
            LossKind::Bce => Box::new(BinaryCrossEntropy),
            LossKind::Poisson => Box::new(PoissonLoss),
            LossKind::PoissonKl => Box::new(PoissonKl {
                kl_weight: cfg.spec_weight,
            }),
            LossKind::PoissonMultinomial => Box::new(PoissonMultinomial {
                total_weight: cfg.total_weight,
            }),
            LossKind::MseUdot => Box::new(MseUdot {
                udot_weight: cfg.spec_weight,
            }),
        }
    }

    pub fn monitor_mode(self) -> MonitorMode {
        match self {
            LossKind::Bce => MonitorMode::Minimize,
            _ => MonitorMode::Maximize,
        }
    }

    pub fn metric_kind(self) -> MetricKind {
        match self {
            LossKind::Bce => MetricKind::Classification,
            _ => MetricKind::Regression,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MeanSquaredError;

impl Loss for MeanSquaredError {
    fn name(&self) -> &'static str {
        "mse"
    }

    fn per_example(&self, labels: &Tensor, predictions: &Tensor) -> Result<Tensor, TrainingError> {
        check_shapes(labels, predictions)?;
        let squared = predictions
            .sub(labels)
            .map_err(to_compute_error)?
            .sqr()
            .map_err(to_compute_error)?;
        mean_per_example(&squared)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryCrossEntropy;

impl Loss for BinaryCrossEntropy {
    fn name(&self) -> &'static str {
        "bce"
    }

    fn per_example(&self, labels: &Tensor, predictions: &Tensor) -> Result<Tensor, TrainingError> {
        check_shapes(labels, predictions)?;
        let probs = predictions
            .clamp(BCE_EPS, 1.0 - BCE_EPS)
            .map_err(to_compute_error)?;
        let log_p = probs.log().map_err(to_compute_error)?;
        let log_not_p = probs
            .affine(-1.0, 1.0)
            .map_err(to_compute_error)?
            .log()
            .map_err(to_compute_error)?;
        let not_labels = labels.affine(-1.0, 1.0).map_err(to_compute_error)?;

        let likelihood = labels
            .mul(&log_p)
            .map_err(to_compute_error)?
            .add(&not_labels.mul(&log_not_p).map_err(to_compute_error)?)
            .map_err(to_compute_error)?
            .neg()
            .map_err(to_compute_error)?;
        mean_per_example(&likelihood)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PoissonLoss;

impl Loss for PoissonLoss {
    fn name(&self) -> &'static str {
        "poisson"
    }

    fn per_example(&self, labels: &Tensor, predictions: &Tensor) -> Result<Tensor, TrainingError> {
        check_shapes(labels, predictions)?;
        mean_per_example(&poisson_terms(labels, predictions)?)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PoissonKl {
    pub kl_weight: f64,
}

impl Loss for PoissonKl {
    fn name(&self) -> &'static str {
        "poisson_kl"
    }

    fn per_example(&self, labels: &Tensor, predictions: &Tensor) -> Result<Tensor, TrainingError> {
        check_shapes(labels, predictions)?;
        let poisson = mean_per_example(&poisson_terms(labels, predictions)?)?;

        let labels = as_positional(labels)?
            .affine(1.0, KL_EPS)
            .map_err(to_compute_error)?;
        let predictions = as_positional(predictions)?
            .affine(1.0, KL_EPS)
            .map_err(to_compute_error)?;
        let label_profile = normalise_positions(&labels)?;
        let pred_profile = normalise_positions(&predictions)?;

        // [batch, targets] after summing over positions.
        let kl = label_profile
            .mul(
                &label_profile
                    .div(&pred_profile)
                    .map_err(to_compute_error)?
                    .log()
                    .map_err(to_compute_error)?,
            )
            .map_err(to_compute_error)?
            .sum(1)
            .map_err(to_compute_error)?
            .mean(1)
            .map_err(to_compute_error)?;

        poisson
            .add(&kl.affine(self.kl_weight, 0.0).map_err(to_compute_error)?)
            .map_err(to_compute_error)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PoissonMultinomial {
    pub total_weight: f64,
}

impl Loss for PoissonMultinomial {
    fn name(&self) -> &'static str {
        "poisson_mn"
    }

    fn per_example(&self, labels: &Tensor, predictions: &Tensor) -> Result<Tensor, TrainingError> {
        check_shapes(labels, predictions)?;
        let labels = as_positional(labels)?
            .affine(1.0, MULTINOMIAL_EPS)
            .map_err(to_compute_error)?;
        let predictions = as_positional(predictions)?
            .affine(1.0, MULTINOMIAL_EPS)
            .map_err(to_compute_error)?;
        let seq_len = labels.dim(1).map_err(to_compute_error)? as f64;

        let label_totals = labels.sum_keepdim(1).map_err(to_compute_error)?;
        let pred_totals = predictions.sum_keepdim(1).map_err(to_compute_error)?;

        // Poisson on totals: [batch, 1, targets] -> [batch]
        let total_term = pred_totals
            .sub(
                &label_totals
                    .mul(&pred_totals.log().map_err(to_compute_error)?)
                    .map_err(to_compute_error)?,
            )
            .map_err(to_compute_error)?
            .squeeze(1)
            .map_err(to_compute_error)?
            .mean(1)
            .map_err(to_compute_error)?;

        let log_probs = predictions
            .broadcast_div(&pred_totals)
            .map_err(to_compute_error)?
            .log()
            .map_err(to_compute_error)?;
        let multinomial_term = labels
            .mul(&log_probs)
            .map_err(to_compute_error)?
            .sum(1)
            .map_err(to_compute_error)?
            .neg()
            .map_err(to_compute_error)?
            .mean(1)
            .map_err(to_compute_error)?;

        multinomial_term
            .add(
                &total_term
                    .affine(self.total_weight, 0.0)
                    .map_err(to_compute_error)?,
            )
            .map_err(to_compute_error)?
            .affine(1.0 / seq_len, 0.0)
            .map_err(to_compute_error)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MseUdot {
    pub udot_weight: f64,
}

impl Loss for MseUdot {
    fn name(&self) -> &'static str {
        "mse_udot"
    }

    fn per_example(&self, labels: &Tensor, predictions: &Tensor) -> Result<Tensor, TrainingError> {
        let mse = MeanSquaredError.per_example(labels, predictions)?;

        let last = labels.rank().saturating_sub(1);
        let centred_labels = labels
            .broadcast_sub(&labels.mean_keepdim(last).map_err(to_compute_error)?)
            .map_err(to_compute_error)?;
        let centred_preds = predictions
            .broadcast_sub(&predictions.mean_keepdim(last).map_err(to_compute_error)?)
            .map_err(to_compute_error)?;
        let udot = mean_per_example(&centred_labels.mul(&centred_preds).map_err(to_compute_error)?)?;

        mse.sub(&udot.affine(self.udot_weight, 0.0).map_err(to_compute_error)?)
            .map_err(to_compute_error)
    }
}

fn poisson_terms(labels: &Tensor, predictions: &Tensor) -> Result<Tensor, TrainingError> {
    let log_pred = predictions
        .affine(1.0, POISSON_EPS)
        .map_err(to_compute_error)?
        .log()
        .map_err(to_compute_error)?;
    predictions
        .sub(&labels.mul(&log_pred).map_err(to_compute_error)?)
        .map_err(to_compute_error)
}

fn check_shapes(labels: &Tensor, predictions: &Tensor) -> Result<(), TrainingError> {
    if labels.dims() != predictions.dims() {
        return Err(TrainingError::compute(format!(
            "label shape {:?} does not match prediction shape {:?}",
            labels.dims(),
            predictions.dims()
        )));
    }
    if labels.rank() == 0 {
        return Err(TrainingError::compute(
            "loss inputs need a leading batch axis",
        ));
    }
    Ok(())
}

fn mean_per_example(values: &Tensor) -> Result<Tensor, TrainingError> {
    if values.rank() == 1 {
        return Ok(values.clone());
    }
    values
        .flatten_from(1)
        .map_err(to_compute_error)?
        .mean(1)
        .map_err(to_compute_error)
}

fn as_positional(values: &Tensor) -> Result<Tensor, TrainingError> {
    let dims = values.dims();
    let shape = match dims.len() {
        0 => {
            return Err(TrainingError::compute(
                "loss inputs need a leading batch axis",
            ))
        }
        1 => (dims[0], 1, 1),
        2 => (dims[0], dims[1], 1),
        3 => (dims[0], dims[1], dims[2]),
        _ => (dims[0], dims[1], dims[2..].iter().product()),
    };
    values.reshape(shape).map_err(to_compute_error)
}

fn normalise_positions(values: &Tensor) -> Result<Tensor, TrainingError> {
    let totals = values.sum_keepdim(1).map_err(to_compute_error)?;
    values.broadcast_div(&totals).map_err(to_compute_error)
}

fn to_compute_error(err: candle_core::Error) -> TrainingError {
    TrainingError::compute(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn tensor(values: &[f32], shape: &[usize]) -> Tensor {
        Tensor::from_vec(values.to_vec(), shape, &Device::Cpu).unwrap()
    }

    fn values(t: &Tensor) -> Vec<f32> {
        t.to_vec1::<f32>().unwrap()
    }

    fn build(kind: LossKind) -> Box<dyn Loss> {
        LossKind::build(&LossConfig {
            kind,
            ..LossConfig::default()
        })
    }

    #[test]
    fn mse_reduces_per_example() {
        let labels = tensor(&[0.0, 0.0, 1.0, 1.0], &[2, 2]);
        let preds = tensor(&[1.0, 1.0, 1.0, 3.0], &[2, 2]);
        let per = build(LossKind::Mse)
            .compute(&labels, &preds, Reduction::None)
            .unwrap();
        assert_eq!(values(&per), vec![1.0, 2.0]);

        let mean = build(LossKind::Mse)
            .compute(&labels, &preds, Reduction::Mean)
            .unwrap();
        assert!((mean.to_vec0::<f32>().unwrap() - 1.5).abs() < 1e-6);
    }

    #[test]
    fn poisson_matches_closed_form() {
        let labels = tensor(&[2.0, 0.0], &[2]);
        let preds = tensor(&[1.0, 3.0], &[2]);
        let per = values(&build(LossKind::Poisson).per_example(&labels, &preds).unwrap());
        let expected0 = 1.0 - 2.0 * (1.0f32 + 1e-7).ln();
        assert!((per[0] - expected0).abs() < 1e-5);
        assert!((per[1] - 3.0).abs() < 1e-5);
    }

    #[test]
    fn bce_is_small_for_confident_correct_predictions() {
        let labels = tensor(&[1.0, 0.0], &[2, 1]);
        let good = tensor(&[0.99, 0.01], &[2, 1]);
        let bad = tensor(&[0.01, 0.99], &[2, 1]);
        let loss = build(LossKind::Bce);
        let good = values(&loss.per_example(&labels, &good).unwrap());
        let bad = values(&loss.per_example(&labels, &bad).unwrap());
        assert!(good.iter().all(|v| *v < 0.02));
        assert!(bad.iter().all(|v| *v > 4.0));
    }

    #[test]
    fn bce_survives_saturated_predictions() {
        let labels = tensor(&[1.0, 0.0], &[2]);
        let preds = tensor(&[0.0, 1.0], &[2]);
        let per = values(&build(LossKind::Bce).per_example(&labels, &preds).unwrap());
        assert!(per.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn kl_term_vanishes_for_matching_profiles() {
        let labels = tensor(&[1.0, 2.0, 3.0, 4.0], &[1, 4]);
        let preds = labels.clone();
        let plain = values(&build(LossKind::Poisson).per_example(&labels, &preds).unwrap());
        let kl = values(&build(LossKind::PoissonKl).per_example(&labels, &preds).unwrap());
        assert!((plain[0] - kl[0]).abs() < 1e-5);

        let shifted = tensor(&[4.0, 3.0, 2.0, 1.0], &[1, 4]);
        let plain = values(&build(LossKind::Poisson).per_example(&labels, &shifted).unwrap());
        let kl = values(&build(LossKind::PoissonKl).per_example(&labels, &shifted).unwrap());
        assert!(kl[0] > plain[0]);
    }

    #[test]
    fn poisson_multinomial_yields_one_value_per_example() {
        let labels = tensor(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let preds = tensor(&[1.5, 2.0, 2.5, 4.0, 4.0, 4.0], &[2, 3]);
        let per = build(LossKind::PoissonMultinomial)
            .per_example(&labels, &preds)
            .unwrap();
        assert_eq!(per.dims(), &[2]);
        assert!(values(&per).iter().all(|v| v.is_finite()));
    }

    #[test]
    fn mse_udot_rewards_aligned_predictions() {
        let labels = tensor(&[0.0, 1.0, 2.0], &[1, 3]);
        let preds = tensor(&[0.0, 1.0, 2.0], &[1, 3]);
        let per = values(&build(LossKind::MseUdot).per_example(&labels, &preds).unwrap());
        // mse 0, centred dot (1 + 0 + 1) / 3
        assert!((per[0] + 2.0 / 3.0).abs() < 1e-5);
    }

    #[test]
    fn shape_mismatch_is_a_compute_error() {
        let labels = tensor(&[1.0, 2.0], &[2]);
        let preds = tensor(&[1.0, 2.0], &[1, 2]);
        let err = build(LossKind::Mse).per_example(&labels, &preds).unwrap_err();
        assert!(matches!(err, TrainingError::Compute(_)));
    }

    #[test]
    fn monitor_modes_follow_loss() {
        assert_eq!(LossKind::Bce.monitor_mode(), MonitorMode::Minimize);
        assert_eq!(LossKind::Poisson.monitor_mode(), MonitorMode::Maximize);
        assert_eq!(LossKind::Mse.metric_kind(), MetricKind::Regression);
    }
}
