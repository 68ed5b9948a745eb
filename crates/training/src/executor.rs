use std::sync::Arc;

use candle_core::{backprop::GradStore, DType, Tensor};
use rayon::prelude::*;

use crate::{
    data::Batch,
    loss::{Loss, Reduction},
    metrics::TaskMetrics,
    model::TrainableModel,
    optimizer::{TrainerOptimizer, UpdateReport},
    TrainingError,
};

#[derive(Debug)]
pub struct ReplicaPool {
    replicas: usize,
    pool: Option<rayon::ThreadPool>,
}

impl ReplicaPool {
    pub fn new(replicas: usize) -> Result<Self, TrainingError> {
        if replicas == 0 {
            return Err(TrainingError::initialization(
                "replica count must be greater than zero",
            ));
        }
        let pool = if replicas > 1 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(replicas)
                .thread_name(|idx| format!("replica-{idx}"))
                .build()
                .map_err(|err| {
                    TrainingError::initialization(format!("failed to start replica pool: {err}"))
                })?;
            Some(pool)
        } else {
            None
        };
        Ok(Self { replicas, pool })
    }

    pub fn replicas(&self) -> usize {
        self.replicas
    }

    fn run<T, F>(&self, shards: &[Batch], task: F) -> Result<Vec<T>, TrainingError>
    where
        T: Send,
        F: Fn(&Batch) -> Result<T, TrainingError> + Send + Sync,
    {
        match &self.pool {
            Some(pool) => pool.install(|| shards.par_iter().map(&task).collect()),
            None => shards.iter().map(task).collect(),
        }
    }
}

pub fn split_batch(batch: &Batch, replicas: usize) -> Result<Vec<Batch>, TrainingError> {
    let rows = batch.len();
    let shards = replicas.min(rows).max(1);
    if shards == 1 {
        return Ok(vec![batch.clone()]);
    }
    let base = rows / shards;
    let extra = rows % shards;
    let mut out = Vec::with_capacity(shards);
    let mut start = 0;
    for shard in 0..shards {
        let len = base + usize::from(shard < extra);
        out.push(batch.narrow(start, len)?);
        start += len;
    }
    Ok(out)
}

#[derive(Debug, Clone, Copy)]
pub struct StepOutcome {
    pub dataset: usize,
    pub loss: f64,
    pub update: UpdateReport,
}

struct ReplicaOutput {
    loss: f64,
    grads: GradStore,
    labels: Tensor,
    predictions: Tensor,
}

#[derive(Debug, Clone)]
pub struct StepExecutor {
    dataset: usize,
    model_index: usize,
    weight: f64,
    loss: Arc<dyn Loss>,
    pool: Arc<ReplicaPool>,
}

impl StepExecutor {
    pub fn new(
        dataset: usize,
        model_index: usize,
        weight: f64,
        loss: Arc<dyn Loss>,
        pool: Arc<ReplicaPool>,
    ) -> Self {
        Self {
            dataset,
            model_index,
            weight,
            loss,
            pool,
        }
    }

    pub fn dataset(&self) -> usize {
        self.dataset
    }

    pub fn model_index(&self) -> usize {
        self.model_index
    }

    pub fn train_step(
        &self,
        model: &dyn TrainableModel,
        optimizer: &mut TrainerOptimizer,
        batch: &Batch,
        metrics: &mut TaskMetrics,
    ) -> Result<StepOutcome, TrainingError> {
        if batch.is_empty() {
            return Err(TrainingError::compute(format!(
                "dataset {} produced an empty training batch",
                self.dataset
            )));
        }

        let global_batch = batch.len() as f64;
        let shards = split_batch(batch, self.pool.replicas())?;
        let participating = shards.len() as f64;
        let loss_scale = optimizer.loss_scale();

        let outputs = self.pool.run(&shards, |shard| {
            self.replica_train(model, shard, global_batch, participating, loss_scale)
        })?;

        let mut loss = 0.0;
        let mut reduced: Option<GradStore> = None;
        for output in outputs {
            loss += output.loss;
            metrics
                .train
                .update(&output.labels, &output.predictions)?;
            reduced = Some(match reduced {
                None => output.grads,
                Some(mut accum) => {
                    merge_gradient_store(model, &mut accum, output.grads)?;
                    accum
                }
            });
        }
        let mut grads = reduced.ok_or_else(|| {
            TrainingError::compute(format!("dataset {} step ran on no replicas", self.dataset))
        })?;

        let update = optimizer.apply(&mut grads)?;
        metrics.train_loss.update(loss);

        Ok(StepOutcome {
            dataset: self.dataset,
            loss,
            update,
        })
    }

    pub fn eval_step(
        &self,
        model: &dyn TrainableModel,
        batch: &Batch,
        metrics: &mut TaskMetrics,
    ) -> Result<(), TrainingError> {
        if batch.is_empty() {
            return Ok(());
        }
        let global_batch = batch.len() as f64;
        let shards = split_batch(batch, self.pool.replicas())?;
        let outputs = self
            .pool
            .run(&shards, |shard| self.replica_eval(model, shard, global_batch))?;

        let mut loss = 0.0;
        for (share, labels, predictions) in outputs {
            loss += share;
            metrics.valid.update(&labels, &predictions)?;
        }
        if let Some(penalty) = model.regularization_loss().map_err(to_compute_error)? {
            loss += scalar_value(&penalty.sum_all().map_err(to_compute_error)?)?;
        }
        metrics.valid_loss.update(loss);
        Ok(())
    }

    fn replica_train(
        &self,
        model: &dyn TrainableModel,
        shard: &Batch,
        global_batch: f64,
        replicas: f64,
        loss_scale: f64,
    ) -> Result<ReplicaOutput, TrainingError> {
        let predictions = model
            .forward(&shard.inputs, true)
            .map_err(to_compute_error)?;
        let per_example = self
            .loss
            .compute(&shard.labels, &predictions, Reduction::None)?;

        // Summed over replicas this is the full-batch objective.
        let mut objective = per_example
            .sum_all()
            .map_err(to_compute_error)?
            .affine(self.weight / global_batch, 0.0)
            .map_err(to_compute_error)?;
        if let Some(penalty) = model.regularization_loss().map_err(to_compute_error)? {
            let share = penalty
                .sum_all()
                .map_err(to_compute_error)?
                .affine(1.0 / replicas, 0.0)
                .map_err(to_compute_error)?;
            objective = objective.add(&share).map_err(to_compute_error)?;
        }

        let loss = scalar_value(&objective)?;
        let scaled = if loss_scale == 1.0 {
            objective
        } else {
            objective.affine(loss_scale, 0.0).map_err(to_compute_error)?
        };
        let grads = scaled.backward().map_err(to_compute_error)?;

        Ok(ReplicaOutput {
            loss,
            grads,
            labels: shard.labels.clone(),
            predictions: predictions.detach(),
        })
    }

    fn replica_eval(
        &self,
        model: &dyn TrainableModel,
        shard: &Batch,
        global_batch: f64,
    ) -> Result<(f64, Tensor, Tensor), TrainingError> {
        let predictions = model
            .forward(&shard.inputs, false)
            .map_err(to_compute_error)?
            .detach();
        let share = self
            .loss
            .compute(&shard.labels, &predictions, Reduction::None)?
            .sum_all()
            .map_err(to_compute_error)?
            .affine(1.0 / global_batch, 0.0)
            .map_err(to_compute_error)?;
        Ok((scalar_value(&share)?, shard.labels.clone(), predictions))
    }
}

fn merge_gradient_store(
    model: &dyn TrainableModel,
    accum: &mut GradStore,
    mut new_grads: GradStore,
) -> Result<(), TrainingError> {
    for (_, var) in model.parameters() {
        let tensor = var.as_tensor();
        if let Some(grad) = new_grads.remove(tensor) {
            let combined = match accum.remove(tensor) {
                Some(existing) => existing.add(&grad).map_err(to_compute_error)?,
                None => grad,
            };
            accum.insert(tensor, combined);
        }
    }
    Ok(())
}

fn scalar_value(tensor: &Tensor) -> Result<f64, TrainingError> {
    let value = tensor
        .to_dtype(DType::F64)
        .map_err(to_compute_error)?
        .to_vec0::<f64>()
        .map_err(to_compute_error)?;
    if !value.is_finite() {
        return Err(TrainingError::compute(format!("loss is not finite ({value})")));
    }
    Ok(value)
}

fn to_compute_error(err: candle_core::Error) -> TrainingError {
    TrainingError::compute(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn batch(rows: usize) -> Batch {
        let inputs = Tensor::arange(0f32, rows as f32, &Device::Cpu)
            .unwrap()
            .reshape((rows, 1))
            .unwrap();
        let labels = inputs.clone();
        Batch::new(inputs, labels).unwrap()
    }

    #[test]
    fn shards_differ_by_at_most_one_row() {
        let shards = split_batch(&batch(7), 3).unwrap();
        let sizes: Vec<_> = shards.iter().map(Batch::len).collect();
        assert_eq!(sizes, vec![3, 2, 2]);

        let first_rows = shards[1].inputs.to_vec2::<f32>().unwrap();
        assert_eq!(first_rows, vec![vec![3.0], vec![4.0]]);
    }

    #[test]
    fn small_batches_use_fewer_replicas() {
        let shards = split_batch(&batch(2), 4).unwrap();
        assert_eq!(shards.len(), 2);
        assert!(shards.iter().all(|s| s.len() == 1));

        assert_eq!(split_batch(&batch(5), 1).unwrap().len(), 1);
    }

    #[test]
    fn pool_rejects_zero_replicas() {
        assert!(matches!(
            ReplicaPool::new(0),
            Err(TrainingError::Initialization(_))
        ));
        assert_eq!(ReplicaPool::new(3).unwrap().replicas(), 3);
    }

    #[test]
    fn pool_preserves_shard_order() {
        let pool = ReplicaPool::new(4).unwrap();
        let shards = split_batch(&batch(8), 4).unwrap();
        let firsts = pool
            .run(&shards, |shard| {
                Ok(shard.inputs.flatten_all().unwrap().to_vec1::<f32>().unwrap()[0])
            })
            .unwrap();
        assert_eq!(firsts, vec![0.0, 2.0, 4.0, 6.0]);
    }
}
