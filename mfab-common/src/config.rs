//! Fabrication configuration loading and config file resolution

use crate::models::ChainConfig;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable naming a config file
pub const CONFIG_ENV_VAR: &str = "MFAB_CONFIG";

/// Top-level configuration, read from TOML
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricationConfig {
    pub work: WorkConfig,
    pub output: OutputConfig,
    pub fabrication: CraftConfig,
}

/// Scheduler timing and limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkConfig {
    pub boss_cycle_ms: u64,
    pub janitor_cycle_seconds: u64,
    pub medic_cycle_seconds: u64,
    pub janitor_enabled: bool,
    pub medic_enabled: bool,
    /// Backoff before a failed chain is dispatched again
    pub segment_requeue_seconds: u64,
    /// Janitor retention horizon
    pub erase_segments_older_than_seconds: u64,
    pub medic_heartbeat_timeout_seconds: u64,
    pub worker_concurrency: usize,
    pub dispatch_timeout_seconds: u64,
    pub sink_timeout_seconds: u64,
    /// Seconds of dubbed audio to keep ahead of now for production chains
    pub buffer_production_seconds: u64,
    pub buffer_preview_seconds: u64,
    pub ingest_cycle_seconds: u64,
    pub stuck_after_failures: u32,
}

impl Default for WorkConfig {
    fn default() -> Self {
        Self {
            boss_cycle_ms: 1_000,
            janitor_cycle_seconds: 60,
            medic_cycle_seconds: 30,
            janitor_enabled: true,
            medic_enabled: true,
            segment_requeue_seconds: 3,
            erase_segments_older_than_seconds: 3_600,
            medic_heartbeat_timeout_seconds: 120,
            worker_concurrency: 4,
            dispatch_timeout_seconds: 60,
            sink_timeout_seconds: 30,
            buffer_production_seconds: 180,
            buffer_preview_seconds: 30,
            ingest_cycle_seconds: 600,
            stuck_after_failures: 5,
        }
    }
}

impl WorkConfig {
    pub fn boss_cycle(&self) -> Duration {
        Duration::from_millis(self.boss_cycle_ms)
    }

    pub fn janitor_cycle(&self) -> Duration {
        Duration::from_secs(self.janitor_cycle_seconds)
    }

    pub fn medic_cycle(&self) -> Duration {
        Duration::from_secs(self.medic_cycle_seconds)
    }

    pub fn segment_requeue(&self) -> Duration {
        Duration::from_secs(self.segment_requeue_seconds)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_seconds)
    }

    pub fn sink_timeout(&self) -> Duration {
        Duration::from_secs(self.sink_timeout_seconds)
    }
}

/// Defaults applied to newly created chains
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub encoding: String,
    pub channels: u16,
    pub sample_rate: u32,
    pub frame_rate: u32,
    /// Stagger layer entries at the start of each main program
    pub delta_arc_enabled: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            encoding: "PCM_SIGNED".to_string(),
            channels: 2,
            sample_rate: 48_000,
            frame_rate: 48_000,
            delta_arc_enabled: false,
        }
    }
}

impl OutputConfig {
    /// Chain output settings seeded from these defaults
    pub fn chain_config(&self) -> ChainConfig {
        ChainConfig {
            output_encoding: self.encoding.clone(),
            output_channels: self.channels,
            output_sample_rate: self.sample_rate,
            output_frame_rate: self.frame_rate,
            delta_arc_enabled: self.delta_arc_enabled,
        }
    }
}

/// Craft feature toggles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CraftConfig {
    pub sticky_bun_enabled: bool,
    pub transition_enabled: bool,
    /// Voice name fragments that enter first in a delta arc
    pub delta_arc_priority: Vec<String>,
}

impl Default for CraftConfig {
    fn default() -> Self {
        Self {
            sticky_bun_enabled: true,
            transition_enabled: true,
            delta_arc_priority: vec!["kick".to_string()],
        }
    }
}

impl FabricationConfig {
    /// Resolve and load configuration
    ///
    /// Priority order:
    /// 1. Command-line argument (highest priority)
    /// 2. `MFAB_CONFIG` environment variable
    /// 3. `<config dir>/mfab/config.toml`
    /// 4. Compiled defaults (fallback)
    pub fn resolve(cli_arg: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var(CONFIG_ENV_VAR).ok().map(PathBuf::from);
        match resolve_config_path(cli_arg, env_path) {
            Some(path) => Self::load(&path),
            None => {
                warn!("No config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load configuration from a TOML file; a missing file yields defaults
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&content)?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let work = &self.work;
        let zeroes = [
            ("boss_cycle_ms", work.boss_cycle_ms),
            ("janitor_cycle_seconds", work.janitor_cycle_seconds),
            ("medic_cycle_seconds", work.medic_cycle_seconds),
            ("medic_heartbeat_timeout_seconds", work.medic_heartbeat_timeout_seconds),
            ("dispatch_timeout_seconds", work.dispatch_timeout_seconds),
            ("sink_timeout_seconds", work.sink_timeout_seconds),
            ("worker_concurrency", work.worker_concurrency as u64),
            ("stuck_after_failures", work.stuck_after_failures as u64),
        ];
        for (name, value) in zeroes {
            if value == 0 {
                return Err(Error::Config(format!("work.{} must be greater than zero", name)));
            }
        }
        if self.output.channels == 0 || self.output.sample_rate == 0 {
            return Err(Error::Config(
                "output channels and sample rate must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Pick the config file path by priority; `None` means use defaults
pub fn resolve_config_path(cli_arg: Option<&Path>, env_path: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }
    if let Some(path) = env_path {
        return Some(path);
    }
    default_config_path().filter(|p| p.exists())
}

/// Platform config file location, e.g. `~/.config/mfab/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("mfab").join("config.toml"))
}
