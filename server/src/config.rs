//! Room tuning and runtime overrides.
//!
//! `RoomConfig` is fixed when a room is created. `RuntimeConfig` is a shared
//! handle over the operator-editable overrides file; rooms read it when a
//! match finishes, so an edit applies to every match that has not finished
//! yet.

use crate::combat::CombatConfig;
use crate::regen::RegenConfig;
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Duration of one simulation tick.
    pub fixed_step_ms: f64,
    pub snapshot_every_ticks: u64,
    /// Elapsed time beyond this is discarded after a stall.
    pub max_frame_ms: f64,
    pub start_timeout_ms: f64,
    pub start_countdown_secs: u32,
    pub grace_ms: f64,
    pub diagnostics_interval_ms: f64,
    pub regen: RegenConfig,
    pub combat: CombatConfig,
}

impl RoomConfig {
    pub fn with_tick_rate(tick_rate_hz: u32, snapshot_every_ticks: u64) -> Self {
        Self {
            fixed_step_ms: 1000.0 / tick_rate_hz.max(1) as f64,
            snapshot_every_ticks: snapshot_every_ticks.max(1),
            ..Self::default()
        }
    }
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            fixed_step_ms: 1000.0 / shared::TICK_RATE_HZ as f64,
            snapshot_every_ticks: shared::SNAPSHOT_EVERY_TICKS,
            max_frame_ms: 1000.0,
            start_timeout_ms: 10_000.0,
            start_countdown_secs: 3,
            grace_ms: 15_000.0,
            diagnostics_interval_ms: 1000.0,
            regen: RegenConfig::default(),
            combat: CombatConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardMultipliers {
    pub coins: f64,
    pub gems: f64,
}

impl Default for RewardMultipliers {
    fn default() -> Self {
        Self {
            coins: 1.0,
            gems: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RuntimeOverrides {
    pub maintenance_mode: bool,
    pub announcements: String,
    pub reward_multipliers: RewardMultipliers,
    pub reward_floor: u32,
    pub reward_ceiling: u32,
}

impl Default for RuntimeOverrides {
    fn default() -> Self {
        Self {
            maintenance_mode: false,
            announcements: String::new(),
            reward_multipliers: RewardMultipliers::default(),
            reward_floor: 5,
            reward_ceiling: 500,
        }
    }
}

/// Shared handle over runtime overrides, optionally backed by a JSON file.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    data: Arc<RwLock<RuntimeOverrides>>,
    path: Option<PathBuf>,
}

impl RuntimeConfig {
    pub fn in_memory(overrides: RuntimeOverrides) -> Self {
        Self {
            data: Arc::new(RwLock::new(overrides)),
            path: None,
        }
    }

    /// Loads overrides from `path`, falling back to defaults when the file is
    /// missing or unreadable.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let overrides = if path.exists() {
            match Self::read_file(&path) {
                Ok(overrides) => overrides,
                Err(e) => {
                    warn!("Failed to load overrides from {}: {}", path.display(), e);
                    RuntimeOverrides::default()
                }
            }
        } else {
            RuntimeOverrides::default()
        };

        Self {
            data: Arc::new(RwLock::new(overrides)),
            path: Some(path),
        }
    }

    fn read_file(path: &Path) -> Result<RuntimeOverrides, ConfigError> {
        let text = fs::read_to_string(path)?;
        let patch: Value = serde_json::from_str(&text)?;
        let mut merged = serde_json::to_value(RuntimeOverrides::default())?;
        deep_merge(&mut merged, patch);
        Ok(serde_json::from_value(merged)?)
    }

    pub fn get(&self) -> RuntimeOverrides {
        match self.data.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Deep-merges `patch` into the current overrides and persists the
    /// result when file-backed. The in-memory value is updated even if the
    /// write fails.
    pub fn update(&self, patch: Value) -> Result<RuntimeOverrides, ConfigError> {
        let next = {
            let mut guard = match self.data.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let mut merged = serde_json::to_value(&*guard)?;
            deep_merge(&mut merged, patch);
            *guard = serde_json::from_value(merged)?;
            guard.clone()
        };

        if let Some(path) = &self.path {
            fs::write(path, serde_json::to_string_pretty(&next)?)?;
        }
        Ok(next)
    }
}

/// Recursively merges object keys of `patch` into `target`; any other value
/// replaces the target outright.
fn deep_merge(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(target_map), Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                let nested = value.is_object()
                    && target_map.get(&key).is_some_and(|existing| existing.is_object());
                if nested {
                    if let Some(existing) = target_map.get_mut(&key) {
                        deep_merge(existing, value);
                    }
                } else {
                    target_map.insert(key, value);
                }
            }
        }
        (target, patch) => *target = patch,
    }
}
