use serde::{Deserialize, Serialize};

use crate::config::EarlyStoppingConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorMode {
    Maximize,
    Minimize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoppingState {
    Tracking,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EarlyStoppingSnapshot {
    pub best_metric: Option<f64>,
    pub unimproved: usize,
    pub state: StoppingState,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub improved: bool,
    pub state: StoppingState,
}

#[derive(Debug, Clone)]
pub struct EarlyStopping {
    mode: MonitorMode,
    patience: usize,
    min_epoch: usize,
    min_delta: f64,
    best: f64,
    unimproved: usize,
    state: StoppingState,
}

impl EarlyStopping {
    pub fn new(mode: MonitorMode, patience: usize, min_epoch: usize, min_delta: f64) -> Self {
        Self {
            mode,
            patience,
            min_epoch,
            min_delta,
            best: initial_best(mode),
            unimproved: 0,
            state: StoppingState::Tracking,
        }
    }

    pub fn from_config(cfg: &EarlyStoppingConfig, mode: MonitorMode) -> Self {
        Self::new(mode, cfg.patience, cfg.min_epoch, cfg.min_delta)
    }

    pub fn observe(&mut self, epoch: usize, metric: f64) -> Observation {
        let improved = match self.mode {
            MonitorMode::Maximize => metric - self.min_delta > self.best,
            MonitorMode::Minimize => metric + self.min_delta < self.best,
        };

        if improved {
            self.best = metric;
            self.unimproved = 0;
            self.state = StoppingState::Tracking;
        } else {
            self.unimproved += 1;
        }

        if epoch >= self.min_epoch && self.unimproved >= self.patience {
            self.state = StoppingState::Stopped;
        }

        Observation {
            improved,
            state: self.state,
        }
    }

    pub fn mode(&self) -> MonitorMode {
        self.mode
    }

    pub fn best_metric(&self) -> f64 {
        self.best
    }

    pub fn unimproved(&self) -> usize {
        self.unimproved
    }

    pub fn state(&self) -> StoppingState {
        self.state
    }

    pub fn is_stopped(&self) -> bool {
        self.state == StoppingState::Stopped
    }

    pub fn snapshot(&self) -> EarlyStoppingSnapshot {
        EarlyStoppingSnapshot {
            best_metric: self.best.is_finite().then_some(self.best),
            unimproved: self.unimproved,
            state: self.state,
        }
    }

    pub fn restore(&mut self, snapshot: EarlyStoppingSnapshot) {
        self.best = snapshot
            .best_metric
            .unwrap_or_else(|| initial_best(self.mode));
        self.unimproved = snapshot.unimproved;
        self.state = snapshot.state;
    }
}

fn initial_best(mode: MonitorMode) -> f64 {
    match mode {
        MonitorMode::Maximize => f64::NEG_INFINITY,
        MonitorMode::Minimize => f64::INFINITY,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stops_after_patience_once_past_min_epoch() {
        let mut stopping = EarlyStopping::new(MonitorMode::Maximize, 2, 0, 0.0);
        let metrics = [0.5, 0.6, 0.6, 0.55];
        let states: Vec<_> = metrics
            .iter()
            .enumerate()
            .map(|(epoch, &m)| stopping.observe(epoch, m))
            .collect();

        assert!(states[0].improved && states[1].improved);
        assert!(!states[2].improved);
        assert_eq!(states[2].state, StoppingState::Tracking);
        assert_eq!(states[3].state, StoppingState::Stopped);
        assert_eq!(stopping.best_metric(), 0.6);
    }

    #[test]
    fn min_epoch_defers_stopping() {
        let mut stopping = EarlyStopping::new(MonitorMode::Maximize, 1, 5, 0.0);
        stopping.observe(0, 1.0);
        for epoch in 1..5 {
            assert_eq!(stopping.observe(epoch, 0.0).state, StoppingState::Tracking);
        }
        assert_eq!(stopping.observe(5, 0.0).state, StoppingState::Stopped);
        assert_eq!(stopping.unimproved(), 5);
    }

    #[test]
    fn min_epoch_five_patience_two() {
        let mut stalled = EarlyStopping::new(MonitorMode::Maximize, 2, 5, 0.0);
        assert!(stalled.observe(0, 1.0).improved);
        for epoch in 1..5 {
            assert_eq!(stalled.observe(epoch, 0.5).state, StoppingState::Tracking);
        }
        assert_eq!(stalled.observe(5, 0.5).state, StoppingState::Stopped);

        let mut climbing = EarlyStopping::new(MonitorMode::Maximize, 2, 5, 0.0);
        for epoch in 0..5 {
            assert!(climbing.observe(epoch, epoch as f64).improved);
        }
        let at_min_epoch = climbing.observe(5, 0.0);
        assert_eq!(climbing.unimproved(), 1);
        assert_eq!(at_min_epoch.state, StoppingState::Tracking);
        assert_eq!(climbing.observe(6, 0.0).state, StoppingState::Stopped);
    }

    #[test]
    fn improvement_after_stop_resumes_tracking() {
        let mut stopping = EarlyStopping::new(MonitorMode::Maximize, 1, 0, 0.0);
        stopping.observe(0, 1.0);
        assert!(stopping.observe(1, 0.5).state == StoppingState::Stopped);
        let observation = stopping.observe(2, 2.0);
        assert!(observation.improved);
        assert_eq!(observation.state, StoppingState::Tracking);
    }

    #[test]
    fn minimize_mode_respects_min_delta() {
        let mut stopping = EarlyStopping::new(MonitorMode::Minimize, 3, 0, 0.1);
        assert!(stopping.observe(0, 1.0).improved);
        assert!(!stopping.observe(1, 0.95).improved);
        assert!(stopping.observe(2, 0.8).improved);
        assert_eq!(stopping.best_metric(), 0.8);
    }

    #[test]
    fn nan_never_counts_as_improvement() {
        let mut stopping = EarlyStopping::new(MonitorMode::Maximize, 5, 0, 0.0);
        assert!(!stopping.observe(0, f64::NAN).improved);
        assert_eq!(stopping.unimproved(), 1);
    }

    #[test]
    fn snapshot_round_trips_through_json() {
        let mut stopping = EarlyStopping::new(MonitorMode::Maximize, 4, 0, 0.0);
        let fresh = serde_json::to_string(&stopping.snapshot()).unwrap();
        stopping.observe(0, 0.3);
        stopping.observe(1, 0.2);
        let json = serde_json::to_string(&stopping.snapshot()).unwrap();

        let mut restored = EarlyStopping::new(MonitorMode::Maximize, 4, 0, 0.0);
        restored.restore(serde_json::from_str(&json).unwrap());
        assert_eq!(restored.best_metric(), 0.3);
        assert_eq!(restored.unimproved(), 1);

        restored.restore(serde_json::from_str(&fresh).unwrap());
        assert_eq!(restored.best_metric(), f64::NEG_INFINITY);
    }
}
