use std::{fmt, path::Path, sync::Arc, thread, time::Duration};

use candle_core::{Device, Tensor};
use tracing::warn;

use crate::{config::RetryConfig, TrainingError};

pub type Result<T> = std::result::Result<T, TrainingError>;

pub const INPUTS_TENSOR: &str = "inputs";
pub const LABELS_TENSOR: &str = "labels";

#[derive(Debug, Clone)]
pub struct Batch {
    pub inputs: Tensor,
    pub labels: Tensor,
}

impl Batch {
    pub fn new(inputs: Tensor, labels: Tensor) -> Result<Self> {
        let input_rows = leading_dim(&inputs, "inputs")?;
        let label_rows = leading_dim(&labels, "labels")?;
        if input_rows != label_rows {
            return Err(TrainingError::compute(format!(
                "batch inputs have {} rows but labels have {}",
                input_rows, label_rows
            )));
        }
        Ok(Self { inputs, labels })
    }

    pub fn len(&self) -> usize {
        self.inputs.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn narrow(&self, start: usize, len: usize) -> Result<Self> {
        let inputs = self
            .inputs
            .narrow(0, start, len)
            .map_err(to_compute_error)?;
        let labels = self
            .labels
            .narrow(0, start, len)
            .map_err(to_compute_error)?;
        Ok(Self { inputs, labels })
    }
}

pub trait BatchStream: Send {
    /// `Ok(None)` once the pass is exhausted. Transient failures surface as
    /// [`TrainingError::DataUnavailable`].
    fn next_batch(&mut self) -> Result<Option<Batch>>;
}

pub trait Dataset: Send + Sync {
    fn batches_per_epoch(&self) -> usize;
    fn open(&self) -> Result<Box<dyn BatchStream>>;
}

#[derive(Debug, Clone)]
pub struct InMemoryDataset {
    batches: Arc<Vec<Batch>>,
}

impl InMemoryDataset {
    pub fn new(batches: Vec<Batch>) -> Self {
        Self {
            batches: Arc::new(batches),
        }
    }

    pub fn from_tensors(inputs: Tensor, labels: Tensor, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(TrainingError::initialization(
                "batch size must be greater than zero",
            ));
        }
        let full = Batch::new(inputs, labels)?;
        let rows = full.len();
        let mut batches = Vec::with_capacity(rows.div_ceil(batch_size));
        let mut start = 0;
        while start < rows {
            let len = batch_size.min(rows - start);
            batches.push(full.narrow(start, len)?);
            start += len;
        }
        Ok(Self::new(batches))
    }

    pub fn from_safetensors(
        path: impl AsRef<Path>,
        batch_size: usize,
        device: &Device,
    ) -> Result<Self> {
        let path = path.as_ref();
        let mut tensors = candle_core::safetensors::load(path, device).map_err(|err| {
            TrainingError::initialization(format!(
                "failed to load dataset {}: {}",
                path.display(),
                err
            ))
        })?;
        let mut take = |name: &str| {
            tensors.remove(name).ok_or_else(|| {
                TrainingError::initialization(format!(
                    "dataset {} has no '{}' tensor",
                    path.display(),
                    name
                ))
            })
        };
        let inputs = take(INPUTS_TENSOR)?;
        let labels = take(LABELS_TENSOR)?;
        Self::from_tensors(inputs, labels, batch_size)
    }

    pub fn batches(&self) -> &[Batch] {
        &self.batches
    }
}

impl Dataset for InMemoryDataset {
    fn batches_per_epoch(&self) -> usize {
        self.batches.len()
    }

    fn open(&self) -> Result<Box<dyn BatchStream>> {
        Ok(Box::new(InMemoryStream {
            batches: Arc::clone(&self.batches),
            cursor: 0,
        }))
    }
}

struct InMemoryStream {
    batches: Arc<Vec<Batch>>,
    cursor: usize,
}

impl BatchStream for InMemoryStream {
    fn next_batch(&mut self) -> Result<Option<Batch>> {
        let batch = self.batches.get(self.cursor).cloned();
        if batch.is_some() {
            self.cursor += 1;
        }
        Ok(batch)
    }
}

/// A training dataset, its evaluation dataset, and the model it trains.
/// Batch counts are read once at construction.
#[derive(Clone)]
pub struct DatasetBinding {
    name: String,
    model_index: usize,
    weight: f64,
    train: Arc<dyn Dataset>,
    eval: Arc<dyn Dataset>,
    train_batches: usize,
    eval_batches: usize,
}

impl DatasetBinding {
    pub fn new(
        name: impl Into<String>,
        model_index: usize,
        train: Arc<dyn Dataset>,
        eval: Arc<dyn Dataset>,
    ) -> Self {
        let train_batches = train.batches_per_epoch();
        let eval_batches = eval.batches_per_epoch();
        Self {
            name: name.into(),
            model_index,
            weight: 1.0,
            train,
            eval,
            train_batches,
            eval_batches,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn model_index(&self) -> usize {
        self.model_index
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn train(&self) -> &dyn Dataset {
        self.train.as_ref()
    }

    pub fn eval(&self) -> &dyn Dataset {
        self.eval.as_ref()
    }

    pub fn train_batches(&self) -> usize {
        self.train_batches
    }

    pub fn eval_batches(&self) -> usize {
        self.eval_batches
    }
}

impl fmt::Debug for DatasetBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatasetBinding")
            .field("name", &self.name)
            .field("model_index", &self.model_index)
            .field("weight", &self.weight)
            .field("train_batches", &self.train_batches())
            .field("eval_batches", &self.eval_batches())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: usize, backoff: Duration) -> Self {
        Self { attempts, backoff }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(value: &RetryConfig) -> Self {
        Self::new(
            value.attempts,
            Duration::from_secs_f64(value.backoff_secs.max(0.0)),
        )
    }
}

/// Pulls the next batch, retrying transient failures `policy.attempts` times
/// with a fixed backoff. One last attempt follows and its error propagates.
pub fn next_with_retry(stream: &mut dyn BatchStream, policy: &RetryPolicy) -> Result<Option<Batch>> {
    for attempt in 1..=policy.attempts {
        match stream.next_batch() {
            Err(err) if err.is_transient() => {
                warn!(
                    attempt,
                    attempts = policy.attempts,
                    backoff_secs = policy.backoff.as_secs_f64(),
                    error = %err,
                    "transient data error; retrying"
                );
                if !policy.backoff.is_zero() {
                    thread::sleep(policy.backoff);
                }
            }
            other => return other,
        }
    }
    stream.next_batch()
}

fn leading_dim(tensor: &Tensor, label: &str) -> Result<usize> {
    tensor.dims().first().copied().ok_or_else(|| {
        TrainingError::compute(format!("batch {} need a leading batch axis", label))
    })
}

fn to_compute_error(err: candle_core::Error) -> TrainingError {
    TrainingError::compute(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn rows(n: usize) -> (Tensor, Tensor) {
        let inputs = Tensor::arange(0f32, (n * 2) as f32, &Device::Cpu)
            .unwrap()
            .reshape((n, 2))
            .unwrap();
        let labels = Tensor::zeros((n, 1), DType::F32, &Device::Cpu).unwrap();
        (inputs, labels)
    }

    struct FlakyStream {
        failures_left: usize,
        calls: usize,
        fatal: bool,
    }

    impl BatchStream for FlakyStream {
        fn next_batch(&mut self) -> Result<Option<Batch>> {
            self.calls += 1;
            if self.fatal {
                return Err(TrainingError::compute("decode failed"));
            }
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(TrainingError::data_unavailable("bucket timeout"));
            }
            let (inputs, labels) = rows(1);
            Ok(Some(Batch::new(inputs, labels)?))
        }
    }

    fn no_wait(attempts: usize) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::ZERO)
    }

    #[test]
    fn splits_into_batches_with_remainder() {
        let (inputs, labels) = rows(5);
        let dataset = InMemoryDataset::from_tensors(inputs, labels, 2).unwrap();
        assert_eq!(dataset.batches_per_epoch(), 3);
        let lens: Vec<_> = dataset.batches().iter().map(Batch::len).collect();
        assert_eq!(lens, vec![2, 2, 1]);

        let mut stream = dataset.open().unwrap();
        let mut seen = 0;
        while stream.next_batch().unwrap().is_some() {
            seen += 1;
        }
        assert_eq!(seen, 3);
    }

    #[test]
    fn mismatched_rows_are_rejected() {
        let (inputs, _) = rows(3);
        let labels = Tensor::zeros((2, 1), DType::F32, &Device::Cpu).unwrap();
        assert!(Batch::new(inputs, labels).is_err());
    }

    #[test]
    fn retry_recovers_from_transient_failures() {
        let mut stream = FlakyStream {
            failures_left: 3,
            calls: 0,
            fatal: false,
        };
        let batch = next_with_retry(&mut stream, &no_wait(5)).unwrap();
        assert!(batch.is_some());
        assert_eq!(stream.calls, 4);
    }

    #[test]
    fn retry_gives_up_after_final_attempt() {
        let mut stream = FlakyStream {
            failures_left: 10,
            calls: 0,
            fatal: false,
        };
        let err = next_with_retry(&mut stream, &no_wait(2)).unwrap_err();
        assert!(matches!(err, TrainingError::DataUnavailable(_)));
        assert_eq!(stream.calls, 3);
    }

    #[test]
    fn non_transient_errors_are_not_retried() {
        let mut stream = FlakyStream {
            failures_left: 0,
            calls: 0,
            fatal: true,
        };
        let err = next_with_retry(&mut stream, &no_wait(5)).unwrap_err();
        assert!(matches!(err, TrainingError::Compute(_)));
        assert_eq!(stream.calls, 1);
    }

    struct CountingDataset {
        inner: InMemoryDataset,
        queries: std::sync::atomic::AtomicUsize,
    }

    impl Dataset for CountingDataset {
        fn batches_per_epoch(&self) -> usize {
            let seen = self
                .queries
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.inner.batches_per_epoch() + seen
        }

        fn open(&self) -> Result<Box<dyn BatchStream>> {
            self.inner.open()
        }
    }

    #[test]
    fn binding_reads_batch_counts_once() {
        let (inputs, labels) = rows(4);
        let train = Arc::new(CountingDataset {
            inner: InMemoryDataset::from_tensors(inputs.clone(), labels.clone(), 2).unwrap(),
            queries: Default::default(),
        });
        let eval = Arc::new(InMemoryDataset::from_tensors(inputs, labels, 4).unwrap());
        let binding = DatasetBinding::new("counted", 0, train.clone(), eval);

        assert_eq!(binding.train_batches(), 2);
        assert_eq!(binding.train_batches(), 2);
        assert_eq!(binding.eval_batches(), 1);
        assert_eq!(train.queries.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn loads_safetensors_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.safetensors");
        let (inputs, labels) = rows(4);
        let tensors = std::collections::HashMap::from([
            (INPUTS_TENSOR.to_string(), inputs),
            (LABELS_TENSOR.to_string(), labels),
        ]);
        candle_core::safetensors::save(&tensors, &path).unwrap();

        let dataset = InMemoryDataset::from_safetensors(&path, 3, &Device::Cpu).unwrap();
        assert_eq!(dataset.batches_per_epoch(), 2);

        let missing = dir.path().join("missing.safetensors");
        let err = InMemoryDataset::from_safetensors(&missing, 3, &Device::Cpu).unwrap_err();
        assert!(matches!(err, TrainingError::Initialization(_)));
    }
}
