//! Event hooks.
//!
//! A hook observes shots as the engine merges them and receives every
//! `METRICS` entry. Metrics never appear in parsed results; a hook is the
//! only place they go.

use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;

use crate::stream::ResultValue;

/// Observer of a run's shots and metrics.
pub trait EventHook: Send + Sync {
    /// Whether workers should emit metrics for this hook.
    fn wants_metrics(&self) -> bool {
        true
    }

    /// Called before the first entry of a shot is delivered.
    fn on_shot_start(&mut self, _shot_id: u64) {}

    /// Called for every `METRICS:<TYPE>:<category>:<name>` entry.
    fn on_metric(&mut self, shot_id: u64, category: &str, name: &str, value: &ResultValue);

    /// Called after the last entry of a shot.
    fn on_shot_end(&mut self, _shot_id: u64) {}
}

/// Metrics of one shot, grouped by category.
pub type ShotMetrics = FxHashMap<String, FxHashMap<String, ResultValue>>;

/// Hook that keeps every metric, one map per shot.
#[derive(Debug, Clone, Default)]
pub struct MetricStore {
    shots: Vec<(u64, ShotMetrics)>,
}

impl MetricStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Metrics per shot, in delivery order.
    pub fn shots(&self) -> &[(u64, ShotMetrics)] {
        &self.shots
    }

    /// Metrics of the shot with id `shot_id`.
    pub fn for_shot(&self, shot_id: u64) -> Option<&ShotMetrics> {
        self.shots
            .iter()
            .find(|(id, _)| *id == shot_id)
            .map(|(_, metrics)| metrics)
    }

    /// Look up one value.
    pub fn get(&self, shot_id: u64, category: &str, name: &str) -> Option<&ResultValue> {
        self.for_shot(shot_id)?.get(category)?.get(name)
    }

    pub fn len(&self) -> usize {
        self.shots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shots.is_empty()
    }
}

impl EventHook for MetricStore {
    fn on_shot_start(&mut self, shot_id: u64) {
        self.shots.push((shot_id, ShotMetrics::default()));
    }

    fn on_metric(&mut self, shot_id: u64, category: &str, name: &str, value: &ResultValue) {
        if self.shots.last().is_none_or(|(id, _)| *id != shot_id) {
            self.shots.push((shot_id, ShotMetrics::default()));
        }
        if let Some((_, metrics)) = self.shots.last_mut() {
            metrics
                .entry(category.to_string())
                .or_default()
                .insert(name.to_string(), value.clone());
        }
    }
}

/// Shared handle, so the caller can inspect a hook the engine owns.
/// A poisoned lock drops events.
impl<H: EventHook> EventHook for Arc<Mutex<H>> {
    fn wants_metrics(&self) -> bool {
        self.lock().is_ok_and(|hook| hook.wants_metrics())
    }

    fn on_shot_start(&mut self, shot_id: u64) {
        if let Ok(mut hook) = self.lock() {
            hook.on_shot_start(shot_id);
        }
    }

    fn on_metric(&mut self, shot_id: u64, category: &str, name: &str, value: &ResultValue) {
        if let Ok(mut hook) = self.lock() {
            hook.on_metric(shot_id, category, name, value);
        }
    }

    fn on_shot_end(&mut self, shot_id: u64) {
        if let Ok(mut hook) = self.lock() {
            hook.on_shot_end(shot_id);
        }
    }
}

/// Split a metric name `category:name`. Names without a category land in
/// the empty category.
pub fn split_metric_name(qualified: &str) -> (&str, &str) {
    qualified.split_once(':').unwrap_or(("", qualified))
}
