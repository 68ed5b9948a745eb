use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use prost::Message;
use tracing::{debug, info, warn};

use crate::{config::LoggingConfig, executor::StepOutcome, metrics::EpochResult, TrainingError};

#[derive(Clone, Debug, Default)]
pub struct LoggingSettings {
    pub tensorboard_dir: Option<PathBuf>,
    pub tensorboard_flush_every_n: usize,
}

impl LoggingSettings {
    pub fn from_config(cfg: &LoggingConfig) -> Self {
        Self {
            tensorboard_dir: cfg.tensorboard.clone(),
            tensorboard_flush_every_n: cfg.tensorboard_flush_every_n.max(1),
        }
    }
}

pub struct Logger {
    tensorboard: Option<TensorBoardWriter>,
}

impl Logger {
    pub fn new(settings: LoggingSettings) -> Result<Self, TrainingError> {
        let tensorboard = match settings.tensorboard_dir.as_ref() {
            Some(dir) => Some(TensorBoardWriter::create(
                dir,
                settings.tensorboard_flush_every_n,
            )?),
            None => None,
        };
        Ok(Self { tensorboard })
    }

    pub fn log_step(&mut self, outcome: &StepOutcome) {
        debug!(
            dataset = outcome.dataset,
            step = outcome.update.step,
            loss = outcome.loss,
            lr = outcome.update.learning_rate,
            grad_norm = outcome.update.grad_norm,
            skipped = outcome.update.skipped,
            "train step"
        );

        if let Some(writer) = self.tensorboard.as_mut() {
            let step = outcome.update.step as i64;
            let tag = format!("data{}/step_loss", outcome.dataset);
            let results = [
                writer.write_scalar(&tag, step, outcome.loss),
                writer.write_scalar("optimizer/learning_rate", step, outcome.update.learning_rate),
                writer.write_scalar("optimizer/grad_norm", step, outcome.update.grad_norm),
            ];
            report_write_failures(results);
        }
    }

    pub fn log_epoch(&mut self, epoch: usize, duration: Duration, results: &[EpochResult]) {
        info!(epoch, seconds = duration.as_secs(), "Epoch {} - {}s", epoch, duration.as_secs());
        for result in results {
            info!(dataset = result.dataset, epoch, "{}", format_result(result));
        }

        if let Some(writer) = self.tensorboard.as_mut() {
            let step = epoch as i64;
            for result in results {
                let prefix = format!("data{}", result.dataset);
                let scalars = [
                    ("train_loss".to_string(), result.train_loss),
                    (format!("train_{}", result.primary_name), result.train_primary),
                    (format!("train_{}", result.secondary_name), result.train_secondary),
                    ("valid_loss".to_string(), result.valid_loss),
                    (format!("valid_{}", result.primary_name), result.valid_primary),
                    (format!("valid_{}", result.secondary_name), result.valid_secondary),
                ];
                let results = scalars
                    .iter()
                    .map(|(name, value)| writer.write_scalar(&format!("{prefix}/{name}"), step, *value));
                report_write_failures(results);
            }
        }
    }

    pub fn flush(&mut self) {
        if let Some(writer) = self.tensorboard.as_mut() {
            if let Err(err) = writer.flush() {
                warn!(error = %err, "failed to flush tensorboard events");
            }
        }
    }
}

pub fn format_result(result: &EpochResult) -> String {
    let mut line = format!(
        "Data {} - train_loss: {:.4} - train_{}: {:.4} - train_{}: {:.4} - valid_loss: {:.4} - valid_{}: {:.4} - valid_{}: {:.4}",
        result.dataset,
        result.train_loss,
        result.primary_name,
        result.train_primary,
        result.secondary_name,
        result.train_secondary,
        result.valid_loss,
        result.primary_name,
        result.valid_primary,
        result.secondary_name,
        result.valid_secondary,
    );
    if result.improved {
        line.push_str(" - best!");
    }
    line
}

fn report_write_failures(results: impl IntoIterator<Item = Result<(), TrainingError>>) {
    for result in results {
        if let Err(err) = result {
            warn!(error = %err, "failed to write tensorboard scalar");
        }
    }
}

struct TensorBoardWriter {
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl TensorBoardWriter {
    fn create(dir: &Path, flush_every: usize) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let timestamp = current_unix_timestamp();
        let hostname = hostname();
        let filename = format!("events.out.tfevents.{}.{}", timestamp, hostname);
        let path = dir.join(filename);
        let file = File::create(&path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        let mut writer = Self {
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        };
        writer.write_event(&Event {
            wall_time: current_wall_time(),
            step: 0,
            file_version: Some("brain.Event:2".to_string()),
            summary: None,
        })?;
        Ok(writer)
    }

    fn write_scalar(&mut self, tag: &str, step: i64, value: f64) -> Result<(), TrainingError> {
        let summary = Summary {
            value: vec![summary::Value {
                tag: tag.to_string(),
                simple_value: Some(value as f32),
            }],
        };
        let event = Event {
            wall_time: current_wall_time(),
            step,
            file_version: None,
            summary: Some(summary),
        };
        self.write_event(&event)
    }

    fn write_event(&mut self, event: &Event) -> Result<(), TrainingError> {
        let mut buffer = BytesMut::with_capacity(128);
        event.encode(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to encode tensorboard event: {err}"))
        })?;

        let data = buffer.freeze();
        let len_bytes = (data.len() as u64).to_le_bytes();
        let len_crc_bytes = masked_crc32(&len_bytes).to_le_bytes();
        let data_crc_bytes = masked_crc32(data.as_ref()).to_le_bytes();

        self.writer
            .write_all(&len_bytes)
            .and_then(|_| self.writer.write_all(&len_crc_bytes))
            .and_then(|_| self.writer.write_all(&data))
            .and_then(|_| self.writer.write_all(&data_crc_bytes))
            .map_err(|err| {
                TrainingError::runtime(format!("failed to write tensorboard event: {err}"))
            })?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush().map_err(|err| {
            TrainingError::runtime(format!("failed to flush tensorboard file: {err}"))
        })?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for TensorBoardWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn current_wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(string, optional, tag = "3")]
    file_version: Option<String>,
    #[prost(message, optional, tag = "5")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "1")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(improved: bool) -> EpochResult {
        EpochResult {
            dataset: 1,
            epoch: 4,
            train_loss: 0.5,
            train_primary: 0.25,
            train_secondary: 0.125,
            valid_loss: 0.75,
            valid_primary: 0.3,
            valid_secondary: 0.2,
            primary_name: "r",
            secondary_name: "r2",
            duration: Duration::from_secs(3),
            improved,
        }
    }

    #[test]
    fn report_line_marks_new_best() {
        let line = format_result(&result(true));
        assert!(line.starts_with("Data 1 - train_loss: 0.5000 - train_r: 0.2500"));
        assert!(line.contains("valid_r2: 0.2000"));
        assert!(line.ends_with(" - best!"));
        assert!(!format_result(&result(false)).contains("best!"));
    }

    #[test]
    fn tensorboard_events_are_framed() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = Logger::new(LoggingSettings {
            tensorboard_dir: Some(dir.path().to_path_buf()),
            tensorboard_flush_every_n: 1,
        })
        .unwrap();
        logger.log_epoch(0, Duration::from_secs(1), &[result(false)]);
        logger.flush();

        let entry = fs::read_dir(dir.path()).unwrap().next().unwrap().unwrap();
        let bytes = fs::read(entry.path()).unwrap();
        let len = u64::from_le_bytes(bytes[..8].try_into().unwrap()) as usize;
        let len_crc = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        assert_eq!(len_crc, masked_crc32(&bytes[..8]));
        let first = Event::decode(&bytes[12..12 + len]).unwrap();
        assert_eq!(first.file_version.as_deref(), Some("brain.Event:2"));
        // version record plus six scalars
        let mut offset = 0;
        let mut records = 0;
        while offset < bytes.len() {
            let len = u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap()) as usize;
            offset += 8 + 4 + len + 4;
            records += 1;
        }
        assert_eq!(records, 7);
    }
}
