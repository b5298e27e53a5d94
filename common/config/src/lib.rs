// Licensed under the Apache-2.0 license

//! Tunables shared by the AP-side IPC runtime and the hub emulator.
//!
//! Both endpoints must be built from the same [`IpcGeometry`]: the shared
//! memory layout is derived from it and is not negotiated at runtime.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Placement of the hub memory regions inside the shared memory block.
/// These are the defaults the emulated boot loader publishes in the boot
/// descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubMemoryMap {
    pub shared_mem_size: u32,
    pub boot_desc_offset: u32,
    pub bootloader_offset: u32,
    pub bootloader_size: u32,
    pub firmware_offset: u32,
    pub firmware_size: u32,
    pub scratch_offset: u32,
    pub scratch_size: u32,
    pub ram_offset: u32,
    pub ram_size: u32,
    pub ipc_offset: u32,
    pub ipc_size: u32,
    pub dump_offset: u32,
    pub dump_size: u32,
}

impl Default for HubMemoryMap {
    fn default() -> Self {
        HubMemoryMap {
            shared_mem_size: 0x4_0000,
            boot_desc_offset: 0x100,
            bootloader_offset: 0x0,
            bootloader_size: 0x1000,
            firmware_offset: 0x1000,
            firmware_size: 0x1_f000,
            scratch_offset: 0x2_0000,
            scratch_size: 0x1000,
            ram_offset: 0x2_1000,
            ram_size: 0xf000,
            ipc_offset: 0x3_0000,
            ipc_size: 0xc000,
            dump_offset: 0x3_c000,
            dump_size: 0x4000,
        }
    }
}

/// Sizes of the rings living in the IPC map area.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcGeometry {
    /// Event descriptor slots per direction.
    pub evt_slots: u32,
    /// Packet slots per data direction.
    pub data_slots: u32,
    /// Maximum payload carried by one data slot, in bytes.
    pub packet_size: u32,
    pub log_records: u32,
    /// Text bytes per log record.
    pub log_record_size: u32,
    pub sensor_table_size: u32,
}

impl Default for IpcGeometry {
    fn default() -> Self {
        IpcGeometry {
            evt_slots: 16,
            data_slots: 8,
            packet_size: 272,
            log_records: 64,
            log_record_size: 120,
            sensor_table_size: 256,
        }
    }
}

/// Bounded wait used when a ring is full or no interrupt line is free.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub ceiling: u32,
    pub interval_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            ceiling: 20,
            interval_ms: 1,
        }
    }
}

impl RetryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AliveConfig {
    pub timeout_ms: u64,
    pub tries: u32,
}

impl Default for AliveConfig {
    fn default() -> Self {
        AliveConfig {
            timeout_ms: 500,
            tries: 3,
        }
    }
}

impl AliveConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Number of occurrences of an error class that triggers a reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorThresholds {
    pub critical: u32,
    pub major: u32,
    pub minor: u32,
}

impl Default for ErrorThresholds {
    fn default() -> Self {
        ErrorThresholds {
            critical: 1,
            major: 3,
            minor: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResetConfig {
    pub token_drain_tries: u32,
    pub token_drain_interval_ms: u64,
    /// Upper bound for the hub to drain AP→hub data before shutdown.
    pub shutdown_wait_ms: u64,
    /// A postmortem dump is skipped if the previous one is younger than this.
    pub dump_min_interval_ms: u64,
    pub firmware_slot: u32,
}

impl Default for ResetConfig {
    fn default() -> Self {
        ResetConfig {
            token_drain_tries: 50,
            token_drain_interval_ms: 2,
            shutdown_wait_ms: 50,
            dump_min_interval_ms: 5000,
            firmware_slot: 0,
        }
    }
}

impl ResetConfig {
    pub fn token_drain_interval(&self) -> Duration {
        Duration::from_millis(self.token_drain_interval_ms)
    }

    pub fn shutdown_wait(&self) -> Duration {
        Duration::from_millis(self.shutdown_wait_ms)
    }

    pub fn dump_min_interval(&self) -> Duration {
        Duration::from_millis(self.dump_min_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub drain_batch: u32,
    /// Occupancy (percent of capacity) at which the producer asks for a flush.
    pub flush_threshold_pct: u32,
    /// Hub runtime log verbosity written to the persisted block at cold boot.
    pub runtime_level: u32,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            drain_batch: 32,
            flush_threshold_pct: 50,
            runtime_level: 3,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub memory_map: HubMemoryMap,
    pub geometry: IpcGeometry,
    pub retry: RetryConfig,
    pub alive: AliveConfig,
    pub thresholds: ErrorThresholds,
    pub reset: ResetConfig,
    pub log: LogConfig,
}

impl HubConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: HubConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let g = &self.geometry;
        // A ring keeps one slot free to tell full from empty.
        if g.evt_slots < 2 || g.data_slots < 2 || g.log_records < 2 {
            return Err(ConfigError::Invalid(
                "every ring needs at least two slots".into(),
            ));
        }
        if g.packet_size == 0 || g.log_record_size == 0 {
            return Err(ConfigError::Invalid("slot sizes must be non-zero".into()));
        }
        if self.retry.ceiling == 0 || self.alive.tries == 0 {
            return Err(ConfigError::Invalid(
                "retry ceiling and alive tries must be non-zero".into(),
            ));
        }
        let t = &self.thresholds;
        if t.critical == 0 || t.major == 0 || t.minor == 0 {
            return Err(ConfigError::Invalid("thresholds must be non-zero".into()));
        }
        if self.log.flush_threshold_pct > 100 {
            return Err(ConfigError::Invalid(
                "flush threshold is a percentage".into(),
            ));
        }
        Ok(())
    }
}
