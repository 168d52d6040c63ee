//! Configuration loading, validation, and hot reload.

pub mod watcher;

pub use watcher::ConfigWatcher;

use crate::engine::{
    clamp_tick_ms, DirectionSetting, ExtensionMode, ObjectKind, ParallelSide, DEFAULT_TICK_MS,
};
use crate::state::DEFAULT_DEBOUNCE_MS;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::warn;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    pub devices: DevicesConfig,
    #[serde(default)]
    pub topology: TopologyConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    /// Objects created at startup when no snapshot is restored.
    #[serde(default)]
    pub objects: Vec<ObjectConfig>,
}

/// Network addresses of the redundant device pair.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DevicesConfig {
    pub first: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub second: Option<String>,
}

/// Extension mode of the device pair.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TopologyConfig {
    #[serde(default = "default_mode")]
    pub mode: ExtensionMode,
    #[serde(default = "default_side")]
    pub active_side: ParallelSide,
}

/// Dispatch loop settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_true")]
    pub online: bool,
}

/// Snapshot persistence settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SnapshotConfig {
    #[serde(default = "default_snapshot_dir")]
    pub dir: String,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_true")]
    pub restore_on_start: bool,
}

/// One object to create at startup.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObjectConfig {
    pub kind: ObjectKind,
    pub object_id: u16,
    #[serde(default)]
    pub mapping_id: u8,
    #[serde(default = "default_direction")]
    pub direction: DirectionSetting,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
}

impl AppConfig {
    /// Load and validate a YAML configuration file.
    pub async fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file: {path}"))?;

        let mut config: AppConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse YAML config: {path}"))?;

        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, path: &str) -> Result<()> {
        let yaml = serde_yaml::to_string(self).context("failed to serialize config")?;
        fs::write(path, yaml)
            .await
            .with_context(|| format!("failed to write config file: {path}"))?;
        Ok(())
    }

    /// Validate and normalize. Out-of-range values are clamped with a
    /// warning rather than rejected.
    pub fn validate(&mut self) -> Result<()> {
        if self.devices.first.is_empty() {
            anyhow::bail!("devices.first address cannot be empty");
        }
        if self.topology.mode != ExtensionMode::Off && self.devices.second.is_none() {
            anyhow::bail!(
                "topology mode '{}' needs devices.second",
                self.topology.mode.label()
            );
        }
        if self.topology.mode == ExtensionMode::Parallel
            && self.topology.active_side == ParallelSide::None
        {
            warn!("parallel mode with no active side configured; inbound telemetry will be dropped until one is set");
        }

        self.engine.tick_ms = clamp_tick_ms(self.engine.tick_ms);

        if self.snapshot.dir.is_empty() {
            anyhow::bail!("snapshot.dir cannot be empty");
        }

        for (idx, obj) in self.objects.iter().enumerate() {
            if obj.object_id == 0 || obj.object_id > crate::engine::MAX_OBJECT_ID {
                anyhow::bail!(
                    "objects[{idx}] object_id {} out of range 1..={}",
                    obj.object_id,
                    crate::engine::MAX_OBJECT_ID
                );
            }
            if obj.mapping_id > crate::engine::MAX_MAPPING_ID {
                anyhow::bail!(
                    "objects[{idx}] mapping_id {} out of range 0..={}",
                    obj.mapping_id,
                    crate::engine::MAX_MAPPING_ID
                );
            }
            if obj.mapping_id != 0 && obj.kind != ObjectKind::SoundObject {
                anyhow::bail!("objects[{idx}]: only sound objects carry a mapping id");
            }
        }

        Ok(())
    }
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            active_side: default_side(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            online: true,
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            dir: default_snapshot_dir(),
            debounce_ms: default_debounce_ms(),
            restore_on_start: true,
        }
    }
}

fn default_mode() -> ExtensionMode {
    ExtensionMode::Off
}
fn default_side() -> ParallelSide {
    ParallelSide::None
}
fn default_tick_ms() -> u64 {
    DEFAULT_TICK_MS
}
fn default_true() -> bool {
    true
}
fn default_snapshot_dir() -> String {
    ".state/snapshot.sled".to_string()
}
fn default_debounce_ms() -> u64 {
    DEFAULT_DEBOUNCE_MS
}
fn default_direction() -> DirectionSetting {
    DirectionSetting::Both
}
