//! HAL settings
//!
//! Loaded from an optional TOML file, then overridden by `CAMERA_HAL_*`
//! environment variables (e.g. `CAMERA_HAL_DEBUG_FPS=true`).

use crate::error::{HalError, HalResult};
use crate::state::StreamKind;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Runtime settings of the HAL
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HalSettings {
    /// Log preview frames per second every 250ms
    pub debug_fps: bool,

    /// Requested preview frame rate (0 = driver default)
    pub preview_fps: u32,

    /// Frame dump bitmask (0 = disabled)
    pub dump_mask: u32,

    /// Directory receiving dumped frames
    pub dump_dir: PathBuf,

    /// Upper bound on the prepare-snapshot wait
    pub prepare_snapshot_timeout_ms: u64,

    /// Drain driver events on a dedicated thread instead of the driver's
    pub queued_dispatch: bool,

    /// Buffers per stream
    pub preview_buffers: usize,
    pub record_buffers: usize,
    pub snapshot_buffers: usize,

    /// Default log filter for binaries
    pub log_level: String,
}

impl Default for HalSettings {
    fn default() -> Self {
        Self {
            debug_fps: false,
            preview_fps: 0,
            dump_mask: 0,
            dump_dir: PathBuf::from("/data"),
            prepare_snapshot_timeout_ms: 2000,
            queued_dispatch: false,
            preview_buffers: 4,
            record_buffers: 9,
            snapshot_buffers: 2,
            log_level: "info".to_string(),
        }
    }
}

impl HalSettings {
    /// Environment prefix for overrides
    pub const ENV_PREFIX: &'static str = "CAMERA_HAL";

    /// Load settings from an optional file plus the environment
    pub fn load(path: Option<&Path>) -> HalResult<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            info!("Loading HAL settings from {}", path.display());
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(Environment::with_prefix(Self::ENV_PREFIX).try_parsing(true));

        let settings: HalSettings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject settings the coordinator cannot run with
    pub fn validate(&self) -> HalResult<()> {
        for kind in StreamKind::ALL {
            if self.buffer_count(kind) == 0 {
                return Err(HalError::Settings(format!("{}_buffers must be at least 1", kind)));
            }
        }
        if self.prepare_snapshot_timeout_ms == 0 {
            return Err(HalError::Settings(
                "prepare_snapshot_timeout_ms must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn buffer_count(&self, kind: StreamKind) -> usize {
        match kind {
            StreamKind::Preview => self.preview_buffers,
            StreamKind::Record => self.record_buffers,
            StreamKind::Snapshot => self.snapshot_buffers,
        }
    }

    pub fn prepare_timeout(&self) -> Duration {
        Duration::from_millis(self.prepare_snapshot_timeout_ms)
    }
}
