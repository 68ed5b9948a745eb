use std::{
    collections::HashMap,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::safetensors::load as load_safetensors;
use hex::encode as hex_encode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::{
    early_stopping::EarlyStoppingSnapshot,
    model::TrainableModel,
    optimizer::{OptimizerState, TrainerOptimizer},
    TrainingConfig, TrainingError,
};

pub const CHECKPOINT_VERSION: u32 = 1;
const MODEL_FILENAME: &str = "model.safetensors";
const OPTIMIZER_FILENAME: &str = "optimizer.json";
const MANIFEST_FILENAME: &str = "manifest.json";
const CHECKPOINT_PREFIX: &str = "ckpt-";
const STAGING_PREFIX: &str = ".staging-";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StoppingRecord {
    pub dataset: usize,
    pub snapshot: EarlyStoppingSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub created_unix_timestamp: u64,
    pub config_sha256: String,
    pub model_index: usize,
    pub epoch: usize,
    pub global_step: usize,
    pub model: FileRecord,
    pub optimizer: FileRecord,
    #[serde(default)]
    pub early_stopping: Vec<StoppingRecord>,
}

pub struct SaveRequest<'a> {
    pub model_index: usize,
    pub epoch: usize,
    pub model: &'a dyn TrainableModel,
    pub optimizer: &'a TrainerOptimizer,
    pub early_stopping: Vec<StoppingRecord>,
}

#[derive(Debug, Clone)]
pub struct CheckpointDescriptor {
    pub directory: PathBuf,
    pub manifest: CheckpointManifest,
}

#[derive(Debug, Clone)]
pub struct LoadOutcome {
    pub manifest: CheckpointManifest,
    pub optimizer_state: OptimizerState,
    pub model_weights_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct CheckpointManager {
    output_dir: PathBuf,
    config_sha256: String,
}

impl CheckpointManager {
    pub fn new(output_dir: impl Into<PathBuf>, config: &TrainingConfig) -> Result<Self, TrainingError> {
        let output_dir = output_dir.into();
        fs::create_dir_all(&output_dir).map_err(|err| {
            TrainingError::checkpoint(format!(
                "failed to create output directory {}: {err}",
                output_dir.display()
            ))
        })?;
        Ok(Self {
            output_dir,
            config_sha256: fingerprint_config(config)?,
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn model_dir(&self, model_index: usize) -> PathBuf {
        self.output_dir.join(format!("model{model_index}"))
    }

    pub fn check_path(&self, model_index: usize) -> PathBuf {
        self.output_dir
            .join(format!("model{model_index}_check.safetensors"))
    }

    pub fn best_path(&self, model_index: usize) -> PathBuf {
        self.output_dir
            .join(format!("model{model_index}_best.safetensors"))
    }

    pub fn save(&self, request: SaveRequest<'_>) -> Result<CheckpointDescriptor, TrainingError> {
        let model_dir = self.model_dir(request.model_index);
        fs::create_dir_all(&model_dir).map_err(|err| {
            TrainingError::checkpoint(format!(
                "failed to create checkpoint directory {}: {err}",
                model_dir.display()
            ))
        })?;

        remove_staging_directories(&model_dir)?;

        let dir_name = format!("{CHECKPOINT_PREFIX}{}", request.epoch);
        let staging_dir = model_dir.join(format!("{STAGING_PREFIX}{dir_name}"));
        fs::create_dir(&staging_dir).map_err(|err| {
            TrainingError::checkpoint(format!(
                "failed to create staging directory {}: {err}",
                staging_dir.display()
            ))
        })?;

        let model_path = staging_dir.join(MODEL_FILENAME);
        save_model_weights(request.model, &model_path)?;
        let model_record = file_record(&model_path)?;

        let optimizer_state = request.optimizer.state()?;
        let optimizer_path = staging_dir.join(OPTIMIZER_FILENAME);
        write_json(&optimizer_path, &optimizer_state)?;
        let optimizer_record = file_record(&optimizer_path)?;

        let manifest = CheckpointManifest {
            version: CHECKPOINT_VERSION,
            created_unix_timestamp: unix_timestamp(),
            config_sha256: self.config_sha256.clone(),
            model_index: request.model_index,
            epoch: request.epoch,
            global_step: optimizer_state.step,
            model: model_record,
            optimizer: optimizer_record,
            early_stopping: request.early_stopping,
        };
        write_json(&staging_dir.join(MANIFEST_FILENAME), &manifest)?;

        let checkpoint_dir = model_dir.join(&dir_name);
        remove_dir_if_exists(&checkpoint_dir)?;
        fs::rename(&staging_dir, &checkpoint_dir).map_err(|err| {
            TrainingError::checkpoint(format!(
                "failed to move checkpoint into {}: {err}",
                checkpoint_dir.display()
            ))
        })?;

        Ok(CheckpointDescriptor {
            directory: checkpoint_dir,
            manifest,
        })
    }

    pub fn save_check(
        &self,
        model_index: usize,
        model: &dyn TrainableModel,
    ) -> Result<PathBuf, TrainingError> {
        let path = self.check_path(model_index);
        write_weights_atomically(model, &path)?;
        Ok(path)
    }

    pub fn save_best(
        &self,
        model_index: usize,
        model: &dyn TrainableModel,
    ) -> Result<PathBuf, TrainingError> {
        let path = self.best_path(model_index);
        write_weights_atomically(model, &path)?;
        Ok(path)
    }

    pub fn prune(&self, model_index: usize, keep_epoch: usize) -> Result<(), TrainingError> {
        for (epoch, stale) in checkpoint_directories(&self.model_dir(model_index))? {
            if epoch != keep_epoch {
                remove_dir_if_exists(&stale)?;
            }
        }
        Ok(())
    }

    pub fn epochs(&self, model_index: usize) -> Result<Vec<usize>, TrainingError> {
        let mut epochs: Vec<usize> = checkpoint_directories(&self.model_dir(model_index))?
            .into_iter()
            .map(|(epoch, _)| epoch)
            .collect();
        epochs.sort_unstable();
        Ok(epochs)
    }

    pub fn descriptor(
        &self,
        model_index: usize,
        epoch: usize,
    ) -> Result<CheckpointDescriptor, TrainingError> {
        let directory = self
            .model_dir(model_index)
            .join(format!("{CHECKPOINT_PREFIX}{epoch}"));
        let manifest = load_manifest(&directory)?;
        if manifest.model_index != model_index || manifest.epoch != epoch {
            return Err(TrainingError::checkpoint(format!(
                "checkpoint {} records model {} epoch {}",
                directory.display(),
                manifest.model_index,
                manifest.epoch
            )));
        }
        Ok(CheckpointDescriptor {
            directory,
            manifest,
        })
    }

    pub fn load(&self, descriptor: &CheckpointDescriptor) -> Result<LoadOutcome, TrainingError> {
        let directory = &descriptor.directory;
        let manifest = descriptor.manifest.clone();
        ensure_version_supported(manifest.version)?;
        if manifest.config_sha256 != self.config_sha256 {
            warn!(
                checkpoint = %directory.display(),
                "checkpoint was written with a different configuration"
            );
        }

        let model_path = directory.join(&manifest.model.filename);
        validate_file(&model_path, &manifest.model)?;

        let optimizer_path = directory.join(&manifest.optimizer.filename);
        validate_file(&optimizer_path, &manifest.optimizer)?;
        let optimizer_state: OptimizerState = read_json(&optimizer_path)?;
        if optimizer_state.step != manifest.global_step {
            return Err(TrainingError::checkpoint(format!(
                "optimizer state in {} is at step {} but manifest records {}",
                directory.display(),
                optimizer_state.step,
                manifest.global_step
            )));
        }

        Ok(LoadOutcome {
            manifest,
            optimizer_state,
            model_weights_path: model_path,
        })
    }

    // Newest epoch every model has a record for; no common epoch is an error.
    pub fn restore_latest(
        &self,
        model_count: usize,
    ) -> Result<Option<Vec<LoadOutcome>>, TrainingError> {
        let per_model = (0..model_count)
            .map(|model_index| self.epochs(model_index))
            .collect::<Result<Vec<_>, _>>()?;
        if per_model.iter().all(Vec::is_empty) {
            return Ok(None);
        }

        let common = per_model[0]
            .iter()
            .rev()
            .copied()
            .find(|epoch| per_model.iter().all(|epochs| epochs.contains(epoch)))
            .ok_or_else(|| {
                TrainingError::checkpoint(format!(
                    "model checkpoints share no epoch (per model: {per_model:?})"
                ))
            })?;

        let records = (0..model_count)
            .map(|model_index| self.load(&self.descriptor(model_index, common)?))
            .collect::<Result<Vec<_>, _>>()?;
        if let Some(outlier) = records
            .iter()
            .find(|record| record.optimizer_state.step != records[0].optimizer_state.step)
        {
            return Err(TrainingError::checkpoint(format!(
                "epoch {common} records disagree on the global step ({} vs {})",
                records[0].optimizer_state.step, outlier.optimizer_state.step
            )));
        }
        Ok(Some(records))
    }
}

pub fn apply_model_weights(
    model: &dyn TrainableModel,
    weights_path: &Path,
) -> Result<(), TrainingError> {
    let named_parameters = model.parameters();
    let device = named_parameters
        .first()
        .map(|(_, var)| var.as_tensor().device().clone())
        .ok_or_else(|| TrainingError::checkpoint("model contains no parameters to restore"))?;
    let tensors = load_safetensors(weights_path, &device).map_err(|err| {
        TrainingError::checkpoint(format!(
            "failed to read model weights {}: {err}",
            weights_path.display()
        ))
    })?;
    let mut params_by_name: HashMap<_, _> = tensors.into_iter().collect();

    let mut restored = Vec::with_capacity(named_parameters.len());
    for (name, var) in named_parameters {
        let tensor = params_by_name.remove(&name).ok_or_else(|| {
            TrainingError::checkpoint(format!("checkpoint missing parameter {name}"))
        })?;
        if tensor.dims() != var.as_tensor().dims() {
            return Err(TrainingError::checkpoint(format!(
                "checkpoint parameter {name} has shape {:?}, model expects {:?}",
                tensor.dims(),
                var.as_tensor().dims()
            )));
        }
        let desired_dtype = var.as_tensor().dtype();
        let tensor = if tensor.dtype() == desired_dtype {
            tensor
        } else {
            tensor
                .to_dtype(desired_dtype)
                .map_err(candle_to_checkpoint_error)?
        };
        restored.push((var, tensor));
    }

    if !params_by_name.is_empty() {
        let mut extra = params_by_name.into_keys().collect::<Vec<_>>();
        extra.sort();
        return Err(TrainingError::checkpoint(format!(
            "checkpoint contains unused parameters: {}",
            extra.join(", ")
        )));
    }

    for (var, tensor) in restored {
        var.set(&tensor).map_err(candle_to_checkpoint_error)?;
    }
    Ok(())
}

pub fn save_model_weights(model: &dyn TrainableModel, path: &Path) -> Result<(), TrainingError> {
    let named_parameters = model.parameters();
    if named_parameters.is_empty() {
        return Err(TrainingError::checkpoint(
            "model contains no parameters to checkpoint",
        ));
    }
    let mut tensors = HashMap::with_capacity(named_parameters.len());
    for (name, var) in named_parameters {
        tensors.insert(name, var.as_tensor().clone());
    }
    candle_core::safetensors::save(&tensors, path).map_err(|err| {
        TrainingError::checkpoint(format!(
            "failed to serialize model weights to {}: {err}",
            path.display()
        ))
    })
}

fn write_weights_atomically(model: &dyn TrainableModel, path: &Path) -> Result<(), TrainingError> {
    let staging = path.with_extension("safetensors.tmp");
    save_model_weights(model, &staging)?;
    fs::rename(&staging, path).map_err(|err| {
        TrainingError::checkpoint(format!(
            "failed to move weights into {}: {err}",
            path.display()
        ))
    })
}

fn fingerprint_config(config: &TrainingConfig) -> Result<String, TrainingError> {
    let json = serde_json::to_vec(config)
        .map_err(|err| TrainingError::checkpoint(format!("failed to hash config: {err}")))?;
    Ok(hex_encode(Sha256::digest(json)))
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn file_record(path: &Path) -> Result<FileRecord, TrainingError> {
    let sha = sha256_file(path)?;
    let bytes = path
        .metadata()
        .map_err(|err| {
            TrainingError::checkpoint(format!(
                "failed to stat checkpoint file {}: {err}",
                path.display()
            ))
        })?
        .len();
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            TrainingError::checkpoint(format!(
                "checkpoint file name is not valid UTF-8: {}",
                path.display()
            ))
        })?
        .to_string();
    Ok(FileRecord {
        filename,
        sha256: sha,
        bytes,
    })
}

fn checkpoint_directories(base: &Path) -> Result<Vec<(usize, PathBuf)>, TrainingError> {
    let mut dirs = Vec::new();
    if !base.exists() {
        return Ok(dirs);
    }
    for entry in fs::read_dir(base).map_err(|err| {
        TrainingError::checkpoint(format!(
            "failed to read checkpoint directory {}: {err}",
            base.display()
        ))
    })? {
        let entry = entry.map_err(|err| {
            TrainingError::checkpoint(format!("failed to read checkpoint entry: {err}"))
        })?;
        let file_type = entry.file_type().map_err(|err| {
            TrainingError::checkpoint(format!(
                "failed to inspect checkpoint entry {}: {err}",
                entry.path().display()
            ))
        })?;
        if !file_type.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let Some(suffix) = name.strip_prefix(CHECKPOINT_PREFIX) else {
            continue;
        };
        let epoch = suffix.parse::<usize>().map_err(|_| {
            TrainingError::checkpoint(format!(
                "unrecognised checkpoint directory {}",
                entry.path().display()
            ))
        })?;
        dirs.push((epoch, entry.path()));
    }
    Ok(dirs)
}

fn remove_staging_directories(base: &Path) -> Result<(), TrainingError> {
    let entries = fs::read_dir(base).map_err(|err| {
        TrainingError::checkpoint(format!(
            "failed to read checkpoint directory {}: {err}",
            base.display()
        ))
    })?;
    for entry in entries {
        let entry = entry.map_err(|err| {
            TrainingError::checkpoint(format!("failed to read checkpoint entry: {err}"))
        })?;
        if entry.file_name().to_string_lossy().starts_with(STAGING_PREFIX) {
            remove_dir_if_exists(&entry.path())?;
        }
    }
    Ok(())
}

fn remove_dir_if_exists(path: &Path) -> Result<(), TrainingError> {
    if !path.exists() {
        return Ok(());
    }
    fs::remove_dir_all(path).map_err(|err| {
        TrainingError::checkpoint(format!("failed to remove {}: {err}", path.display()))
    })
}

fn load_manifest(directory: &Path) -> Result<CheckpointManifest, TrainingError> {
    let manifest_path = directory.join(MANIFEST_FILENAME);
    if !manifest_path.is_file() {
        return Err(TrainingError::checkpoint(format!(
            "checkpoint manifest not found at {}",
            manifest_path.display()
        )));
    }
    read_json(&manifest_path)
}

fn ensure_version_supported(version: u32) -> Result<(), TrainingError> {
    if version != CHECKPOINT_VERSION {
        return Err(TrainingError::checkpoint(format!(
            "unsupported checkpoint version {} (expected {})",
            version, CHECKPOINT_VERSION
        )));
    }
    Ok(())
}

fn validate_file(path: &Path, record: &FileRecord) -> Result<(), TrainingError> {
    let actual = sha256_file(path)?;
    if actual != record.sha256 {
        return Err(TrainingError::checkpoint(format!(
            "checkpoint file {} failed checksum validation",
            path.display()
        )));
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String, TrainingError> {
    let mut file = File::open(path).map_err(|err| {
        TrainingError::checkpoint(format!("failed to open {}: {err}", path.display()))
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(|err| {
            TrainingError::checkpoint(format!("failed to read {}: {err}", path.display()))
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TrainingError> {
    let mut file = File::create(path).map_err(|err| {
        TrainingError::checkpoint(format!("failed to create {}: {err}", path.display()))
    })?;
    let data = serde_json::to_vec_pretty(value)
        .map_err(|err| TrainingError::checkpoint(format!("failed to serialize JSON: {err}")))?;
    file.write_all(&data).map_err(|err| {
        TrainingError::checkpoint(format!("failed to write {}: {err}", path.display()))
    })?;
    file.write_all(b"\n").map_err(|err| {
        TrainingError::checkpoint(format!("failed to write {}: {err}", path.display()))
    })
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, TrainingError> {
    let file = File::open(path).map_err(|err| {
        TrainingError::checkpoint(format!("failed to open {}: {err}", path.display()))
    })?;
    serde_json::from_reader(file).map_err(|err| {
        TrainingError::checkpoint(format!("failed to parse JSON {}: {err}", path.display()))
    })
}

fn candle_to_checkpoint_error(err: candle_core::Error) -> TrainingError {
    TrainingError::checkpoint(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Activation,
        early_stopping::StoppingState,
        model::LinearModel,
        optimizer::{OptimizerConfig, SgdConfig},
        scheduler::ConstantSchedule,
    };
    use candle_core::Device;

    fn fixture(seed: u64) -> (LinearModel, TrainerOptimizer) {
        let model = LinearModel::new(3, 2, Activation::Identity, seed, &Device::Cpu).unwrap();
        let named = model
            .parameters()
            .into_iter()
            .map(|(name, var)| (format!("model0/{name}"), var))
            .collect();
        let optimizer = TrainerOptimizer::new(
            named,
            OptimizerConfig::Sgd(SgdConfig { momentum: 0.9 }),
            Box::new(ConstantSchedule::new(0.1).unwrap()),
            None,
        )
        .unwrap();
        (model, optimizer)
    }

    fn step(model: &LinearModel, optimizer: &mut TrainerOptimizer) {
        let inputs = candle_core::Tensor::ones((4, 3), candle_core::DType::F32, &Device::Cpu).unwrap();
        let loss = model.forward(&inputs, true).unwrap().sum_all().unwrap();
        optimizer.apply(&mut loss.backward().unwrap()).unwrap();
    }

    fn save(manager: &CheckpointManager, epoch: usize, model: &LinearModel, opt: &TrainerOptimizer) -> CheckpointDescriptor {
        save_as(manager, 0, epoch, model, opt)
    }

    fn save_as(
        manager: &CheckpointManager,
        model_index: usize,
        epoch: usize,
        model: &LinearModel,
        opt: &TrainerOptimizer,
    ) -> CheckpointDescriptor {
        manager
            .save(SaveRequest {
                model_index,
                epoch,
                model,
                optimizer: opt,
                early_stopping: vec![StoppingRecord {
                    dataset: 0,
                    snapshot: EarlyStoppingSnapshot {
                        best_metric: Some(0.5),
                        unimproved: 1,
                        state: StoppingState::Tracking,
                    },
                }],
            })
            .unwrap()
    }

    #[test]
    fn round_trip_restores_weights_and_step() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), &TrainingConfig::default()).unwrap();
        let (model, mut optimizer) = fixture(1);
        step(&model, &mut optimizer);
        step(&model, &mut optimizer);
        save(&manager, 3, &model, &optimizer);

        let (fresh_model, mut fresh_opt) = fixture(2);
        let records = manager.restore_latest(1).unwrap().unwrap();
        let outcome = &records[0];
        assert_eq!(outcome.manifest.epoch, 3);
        assert_eq!(outcome.manifest.early_stopping.len(), 1);

        apply_model_weights(&fresh_model, &outcome.model_weights_path).unwrap();
        fresh_opt.load_state(outcome.optimizer_state.clone()).unwrap();

        assert_eq!(fresh_opt.global_step(), 2);
        assert_eq!(
            fresh_model.weight().to_vec2::<f32>().unwrap(),
            model.weight().to_vec2::<f32>().unwrap()
        );
    }

    #[test]
    fn only_the_latest_record_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), &TrainingConfig::default()).unwrap();
        let (model, optimizer) = fixture(1);
        for epoch in 0..3 {
            save(&manager, epoch, &model, &optimizer);
        }
        assert_eq!(manager.epochs(0).unwrap(), vec![0, 1, 2]);
        manager.prune(0, 2).unwrap();
        let dirs = checkpoint_directories(&manager.model_dir(0)).unwrap();
        assert_eq!(dirs.len(), 1);
        assert_eq!(dirs[0].0, 2);
        assert_eq!(manager.descriptor(0, 2).unwrap().manifest.epoch, 2);
    }

    #[test]
    fn restore_uses_the_newest_epoch_every_model_has() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), &TrainingConfig::default()).unwrap();
        let (model, optimizer) = fixture(1);
        save_as(&manager, 0, 4, &model, &optimizer);
        save_as(&manager, 1, 4, &model, &optimizer);
        // model 1 never reached epoch 5
        save_as(&manager, 0, 5, &model, &optimizer);

        let records = manager.restore_latest(2).unwrap().unwrap();
        assert_eq!(
            records.iter().map(|r| r.manifest.epoch).collect::<Vec<_>>(),
            vec![4, 4]
        );
    }

    #[test]
    fn models_without_a_shared_epoch_cannot_restore() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), &TrainingConfig::default()).unwrap();
        let (model, optimizer) = fixture(1);
        save_as(&manager, 0, 2, &model, &optimizer);

        let err = manager.restore_latest(2).unwrap_err();
        assert!(matches!(err, TrainingError::Checkpoint(_)));
    }

    #[test]
    fn leftover_staging_directories_are_swept() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), &TrainingConfig::default()).unwrap();
        let (model, optimizer) = fixture(1);
        let leftover = manager.model_dir(0).join(format!("{STAGING_PREFIX}{CHECKPOINT_PREFIX}7"));
        fs::create_dir_all(&leftover).unwrap();
        fs::write(leftover.join(MODEL_FILENAME), b"partial").unwrap();

        save(&manager, 1, &model, &optimizer);
        assert!(!leftover.exists());
        assert_eq!(manager.epochs(0).unwrap(), vec![1]);
    }

    #[test]
    fn empty_output_has_nothing_to_restore() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), &TrainingConfig::default()).unwrap();
        assert!(manager.restore_latest(2).unwrap().is_none());
    }

    #[test]
    fn corrupted_weights_fail_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), &TrainingConfig::default()).unwrap();
        let (model, optimizer) = fixture(1);
        let descriptor = save(&manager, 0, &model, &optimizer);

        let weights = descriptor.directory.join(MODEL_FILENAME);
        let mut bytes = fs::read(&weights).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&weights, bytes).unwrap();

        let err = manager.restore_latest(1).unwrap_err();
        assert!(matches!(err, TrainingError::Checkpoint(_)));
    }

    #[test]
    fn missing_manifest_is_not_treated_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), &TrainingConfig::default()).unwrap();
        let (model, optimizer) = fixture(1);
        let descriptor = save(&manager, 0, &model, &optimizer);
        fs::remove_file(descriptor.directory.join(MANIFEST_FILENAME)).unwrap();

        let err = manager.restore_latest(1).unwrap_err();
        assert!(matches!(err, TrainingError::Checkpoint(_)));
    }

    #[test]
    fn check_and_best_snapshots_are_model_only() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), &TrainingConfig::default()).unwrap();
        let (model, _) = fixture(1);
        let check = manager.save_check(0, &model).unwrap();
        let best = manager.save_best(0, &model).unwrap();
        assert!(check.ends_with("model0_check.safetensors"));
        assert!(best.is_file());

        let (other, _) = fixture(5);
        apply_model_weights(&other, &best).unwrap();
        assert_eq!(
            other.bias().to_vec1::<f32>().unwrap(),
            model.bias().to_vec1::<f32>().unwrap()
        );
    }
}
