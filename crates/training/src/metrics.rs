use std::{cmp::Ordering, fmt, time::Duration};

use candle_core::{DType, Tensor};

use crate::TrainingError;

pub trait Metric: Send + fmt::Debug {
    fn name(&self) -> &'static str;
    fn update(&mut self, labels: &Tensor, predictions: &Tensor) -> Result<(), TrainingError>;
    fn result(&self) -> f64;
    fn reset(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Regression,
    Classification,
}

impl MetricKind {
    pub fn build(self) -> (Box<dyn Metric>, Box<dyn Metric>) {
        let (primary, secondary): (Box<dyn Metric>, Box<dyn Metric>) = match self {
            MetricKind::Regression => (Box::new(PearsonR::default()), Box::new(R2::default())),
            MetricKind::Classification => (Box::new(Auroc::default()), Box::new(Auprc::default())),
        };
        (primary, secondary)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MeanMetric {
    total: f64,
    count: u64,
}

impl MeanMetric {
    pub fn update(&mut self, value: f64) {
        self.total += value;
        self.count += 1;
    }

    pub fn result(&self) -> f64 {
        if self.count == 0 {
            f64::NAN
        } else {
            self.total / self.count as f64
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Clone, Default)]
struct TargetMoments {
    count: Vec<f64>,
    sum_x: Vec<f64>,
    sum_y: Vec<f64>,
    sum_xx: Vec<f64>,
    sum_yy: Vec<f64>,
    sum_xy: Vec<f64>,
    sum_sq_err: Vec<f64>,
}

impl TargetMoments {
    fn update(&mut self, labels: &Tensor, predictions: &Tensor) -> Result<(), TrainingError> {
        let (targets, ys) = host_values(labels)?;
        let (pred_targets, xs) = host_values(predictions)?;
        if targets != pred_targets || ys.len() != xs.len() {
            return Err(TrainingError::compute(format!(
                "metric labels {:?} and predictions {:?} disagree in shape",
                labels.dims(),
                predictions.dims()
            )));
        }
        if self.count.is_empty() {
            self.resize(targets);
        } else if self.count.len() != targets {
            return Err(TrainingError::compute(format!(
                "metric tracked {} targets but received {}",
                self.count.len(),
                targets
            )));
        }

        for (idx, (&y, &x)) in ys.iter().zip(&xs).enumerate() {
            let t = idx % targets;
            let (x, y) = (x as f64, y as f64);
            self.count[t] += 1.0;
            self.sum_x[t] += x;
            self.sum_y[t] += y;
            self.sum_xx[t] += x * x;
            self.sum_yy[t] += y * y;
            self.sum_xy[t] += x * y;
            self.sum_sq_err[t] += (y - x) * (y - x);
        }
        Ok(())
    }

    fn resize(&mut self, targets: usize) {
        for column in [
            &mut self.count,
            &mut self.sum_x,
            &mut self.sum_y,
            &mut self.sum_xx,
            &mut self.sum_yy,
            &mut self.sum_xy,
            &mut self.sum_sq_err,
        ] {
            *column = vec![0.0; targets];
        }
    }

    fn mean_over_targets(&self, per_target: impl Fn(usize) -> f64) -> f64 {
        if self.count.is_empty() {
            return f64::NAN;
        }
        let total: f64 = (0..self.count.len()).map(per_target).sum();
        total / self.count.len() as f64
    }
}

#[derive(Debug, Clone, Default)]
pub struct PearsonR {
    moments: TargetMoments,
}

impl Metric for PearsonR {
    fn name(&self) -> &'static str {
        "r"
    }

    fn update(&mut self, labels: &Tensor, predictions: &Tensor) -> Result<(), TrainingError> {
        self.moments.update(labels, predictions)
    }

    fn result(&self) -> f64 {
        let m = &self.moments;
        m.mean_over_targets(|t| {
            let n = m.count[t];
            let mean_x = m.sum_x[t] / n;
            let mean_y = m.sum_y[t] / n;
            let covariance = m.sum_xy[t] / n - mean_x * mean_y;
            let var_x = m.sum_xx[t] / n - mean_x * mean_x;
            let var_y = m.sum_yy[t] / n - mean_y * mean_y;
            covariance / (var_x.sqrt() * var_y.sqrt())
        })
    }

    fn reset(&mut self) {
        self.moments = TargetMoments::default();
    }
}

#[derive(Debug, Clone, Default)]
pub struct R2 {
    moments: TargetMoments,
}

impl Metric for R2 {
    fn name(&self) -> &'static str {
        "r2"
    }

    fn update(&mut self, labels: &Tensor, predictions: &Tensor) -> Result<(), TrainingError> {
        self.moments.update(labels, predictions)
    }

    fn result(&self) -> f64 {
        let m = &self.moments;
        m.mean_over_targets(|t| {
            let n = m.count[t];
            let mean_y = m.sum_y[t] / n;
            let total = m.sum_yy[t] - n * mean_y * mean_y;
            1.0 - m.sum_sq_err[t] / total
        })
    }

    fn reset(&mut self) {
        self.moments = TargetMoments::default();
    }
}

#[derive(Debug, Clone, Default)]
struct ScoredLabels {
    scores: Vec<f64>,
    positives: Vec<bool>,
}

impl ScoredLabels {
    fn update(&mut self, labels: &Tensor, predictions: &Tensor) -> Result<(), TrainingError> {
        let (_, ys) = host_values(labels)?;
        let (_, xs) = host_values(predictions)?;
        if ys.len() != xs.len() {
            return Err(TrainingError::compute(format!(
                "metric labels {:?} and predictions {:?} disagree in shape",
                labels.dims(),
                predictions.dims()
            )));
        }
        self.scores.extend(xs.iter().map(|&x| x as f64));
        self.positives.extend(ys.iter().map(|&y| y > 0.5));
        Ok(())
    }

    fn ranked(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.scores.len()).collect();
        order.sort_by(|&a, &b| {
            self.scores[b]
                .partial_cmp(&self.scores[a])
                .unwrap_or(Ordering::Equal)
        });
        order
    }

    fn class_counts(&self) -> (usize, usize) {
        let positives = self.positives.iter().filter(|p| **p).count();
        (positives, self.positives.len() - positives)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Auroc {
    collected: ScoredLabels,
}

impl Metric for Auroc {
    fn name(&self) -> &'static str {
        "auroc"
    }

    fn update(&mut self, labels: &Tensor, predictions: &Tensor) -> Result<(), TrainingError> {
        self.collected.update(labels, predictions)
    }

    fn result(&self) -> f64 {
        let (positives, negatives) = self.collected.class_counts();
        if positives == 0 || negatives == 0 {
            return f64::NAN;
        }

        // Mann-Whitney U with tied scores sharing their average rank.
        let mut order = self.collected.ranked();
        order.reverse();
        let scores = &self.collected.scores;
        let mut positive_rank_sum = 0.0;
        let mut start = 0;
        while start < order.len() {
            let mut end = start + 1;
            while end < order.len() && scores[order[end]] == scores[order[start]] {
                end += 1;
            }
            let average_rank = (start + end + 1) as f64 / 2.0;
            for &idx in &order[start..end] {
                if self.collected.positives[idx] {
                    positive_rank_sum += average_rank;
                }
            }
            start = end;
        }

        let p = positives as f64;
        let n = negatives as f64;
        (positive_rank_sum - p * (p + 1.0) / 2.0) / (p * n)
    }

    fn reset(&mut self) {
        self.collected = ScoredLabels::default();
    }
}

#[derive(Debug, Clone, Default)]
pub struct Auprc {
    collected: ScoredLabels,
}

impl Metric for Auprc {
    fn name(&self) -> &'static str {
        "auprc"
    }

    fn update(&mut self, labels: &Tensor, predictions: &Tensor) -> Result<(), TrainingError> {
        self.collected.update(labels, predictions)
    }

    fn result(&self) -> f64 {
        let (positives, _) = self.collected.class_counts();
        if positives == 0 {
            return f64::NAN;
        }

        let mut hits = 0usize;
        let mut precision_sum = 0.0;
        for (rank, idx) in self.collected.ranked().into_iter().enumerate() {
            if self.collected.positives[idx] {
                hits += 1;
                precision_sum += hits as f64 / (rank + 1) as f64;
            }
        }
        precision_sum / positives as f64
    }

    fn reset(&mut self) {
        self.collected = ScoredLabels::default();
    }
}

#[derive(Debug)]
pub struct TaskMetrics {
    kind: MetricKind,
    pub train_loss: MeanMetric,
    pub train: MetricPair,
    pub valid_loss: MeanMetric,
    pub valid: MetricPair,
}

impl TaskMetrics {
    pub fn new(kind: MetricKind) -> Self {
        Self {
            kind,
            train_loss: MeanMetric::default(),
            train: MetricPair::new(kind),
            valid_loss: MeanMetric::default(),
            valid: MetricPair::new(kind),
        }
    }

    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    pub fn reset(&mut self) {
        self.train_loss.reset();
        self.train.reset();
        self.valid_loss.reset();
        self.valid.reset();
    }
}

#[derive(Debug)]
pub struct MetricPair {
    pub primary: Box<dyn Metric>,
    pub secondary: Box<dyn Metric>,
}

impl MetricPair {
    pub fn new(kind: MetricKind) -> Self {
        let (primary, secondary) = kind.build();
        Self { primary, secondary }
    }

    pub fn update(&mut self, labels: &Tensor, predictions: &Tensor) -> Result<(), TrainingError> {
        self.primary.update(labels, predictions)?;
        self.secondary.update(labels, predictions)
    }

    pub fn reset(&mut self) {
        self.primary.reset();
        self.secondary.reset();
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EpochResult {
    pub dataset: usize,
    pub epoch: usize,
    pub train_loss: f64,
    pub train_primary: f64,
    pub train_secondary: f64,
    pub valid_loss: f64,
    pub valid_primary: f64,
    pub valid_secondary: f64,
    pub primary_name: &'static str,
    pub secondary_name: &'static str,
    pub duration: Duration,
    pub improved: bool,
}

impl EpochResult {
    pub fn from_metrics(
        dataset: usize,
        epoch: usize,
        metrics: &TaskMetrics,
        duration: Duration,
        improved: bool,
    ) -> Self {
        Self {
            dataset,
            epoch,
            train_loss: metrics.train_loss.result(),
            train_primary: metrics.train.primary.result(),
            train_secondary: metrics.train.secondary.result(),
            valid_loss: metrics.valid_loss.result(),
            valid_primary: metrics.valid.primary.result(),
            valid_secondary: metrics.valid.secondary.result(),
            primary_name: metrics.valid.primary.name(),
            secondary_name: metrics.valid.secondary.name(),
            duration,
            improved,
        }
    }
}

fn host_values(tensor: &Tensor) -> Result<(usize, Vec<f32>), TrainingError> {
    let targets = match tensor.rank() {
        0 | 1 => 1,
        _ => tensor.dims().last().copied().unwrap_or(1).max(1),
    };
    let values = tensor
        .to_dtype(DType::F32)
        .map_err(to_compute_error)?
        .flatten_all()
        .map_err(to_compute_error)?
        .to_vec1::<f32>()
        .map_err(to_compute_error)?;
    Ok((targets, values))
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

    #[test]
    fn mean_metric_averages_and_resets() {
        let mut mean = MeanMetric::default();
        assert!(mean.result().is_nan());
        mean.update(1.0);
        mean.update(3.0);
        assert_eq!(mean.result(), 2.0);
        mean.reset();
        assert_eq!(mean.count(), 0);
    }

    #[test]
    fn pearson_is_one_for_linear_relation() {
        let mut r = PearsonR::default();
        let labels = tensor(&[1.0, 10.0, 2.0, 20.0, 3.0, 30.0], &[3, 2]);
        let preds = tensor(&[2.0, -10.0, 4.0, -20.0, 6.0, -30.0], &[3, 2]);
        r.update(&labels, &preds).unwrap();
        // +1 on the first target, -1 on the second.
        assert!(r.result().abs() < 1e-9);

        r.reset();
        r.update(&labels, &labels).unwrap();
        assert!((r.result() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn pearson_accumulates_across_batches() {
        let mut whole = PearsonR::default();
        whole
            .update(&tensor(&[1.0, 2.0, 3.0, 5.0], &[4, 1]), &tensor(&[1.1, 1.9, 3.4, 4.0], &[4, 1]))
            .unwrap();
        let mut split = PearsonR::default();
        split
            .update(&tensor(&[1.0, 2.0], &[2, 1]), &tensor(&[1.1, 1.9], &[2, 1]))
            .unwrap();
        split
            .update(&tensor(&[3.0, 5.0], &[2, 1]), &tensor(&[3.4, 4.0], &[2, 1]))
            .unwrap();
        assert!((whole.result() - split.result()).abs() < 1e-9);
    }

    #[test]
    fn r2_is_one_for_exact_predictions() {
        let mut r2 = R2::default();
        let labels = tensor(&[1.0, 2.0, 4.0], &[3, 1]);
        r2.update(&labels, &labels).unwrap();
        assert!((r2.result() - 1.0).abs() < 1e-9);

        r2.reset();
        let mean_pred = tensor(&[7.0 / 3.0; 3], &[3, 1]);
        r2.update(&labels, &mean_pred).unwrap();
        assert!(r2.result().abs() < 1e-6);
    }

    #[test]
    fn target_count_must_stay_fixed() {
        let mut r = PearsonR::default();
        r.update(&tensor(&[1.0, 2.0], &[1, 2]), &tensor(&[1.0, 2.0], &[1, 2]))
            .unwrap();
        let err = r
            .update(&tensor(&[1.0, 2.0, 3.0], &[1, 3]), &tensor(&[1.0, 2.0, 3.0], &[1, 3]))
            .unwrap_err();
        assert!(matches!(err, TrainingError::Compute(_)));
    }

    #[test]
    fn auroc_ranks_perfect_and_tied_scores() {
        let labels = tensor(&[0.0, 0.0, 1.0, 1.0], &[4]);
        let mut auroc = Auroc::default();
        auroc.update(&labels, &tensor(&[0.1, 0.2, 0.8, 0.9], &[4])).unwrap();
        assert!((auroc.result() - 1.0).abs() < 1e-12);

        auroc.reset();
        auroc.update(&labels, &tensor(&[0.5; 4], &[4])).unwrap();
        assert!((auroc.result() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn auprc_rewards_positives_ranked_first() {
        let labels = tensor(&[1.0, 0.0, 1.0, 0.0], &[4]);
        let mut auprc = Auprc::default();
        auprc.update(&labels, &tensor(&[0.9, 0.1, 0.8, 0.2], &[4])).unwrap();
        assert!((auprc.result() - 1.0).abs() < 1e-12);

        auprc.reset();
        auprc.update(&labels, &tensor(&[0.9, 0.8, 0.1, 0.2], &[4])).unwrap();
        // hits at ranks 1 and 4: (1 + 2/4) / 2
        assert!((auprc.result() - 0.75).abs() < 1e-12);
    }

    #[test]
    fn ranking_metrics_need_both_classes() {
        let mut auroc = Auroc::default();
        auroc
            .update(&tensor(&[1.0, 1.0], &[2]), &tensor(&[0.2, 0.3], &[2]))
            .unwrap();
        assert!(auroc.result().is_nan());
    }
}
