//! Pipeline configuration. Loaded from an optional JSON file, then overridden
//! from the command line.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{FlowError, Result};

/// How packets are grouped into flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyMode {
    /// Unordered address pair plus transport protocol.
    AddressPair,
    /// Unordered (address, port) pair plus transport protocol.
    FiveTuple,
    /// One flow for the whole capture (legacy output).
    SingleFlow,
}

impl Default for KeyMode {
    fn default() -> Self {
        KeyMode::AddressPair
    }
}

/// How much of the arrival history each flow keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Retention {
    /// Every arrival timestamp, in order.
    Full,
    /// Last timestamp plus running active/idle sums.
    Streaming,
}

impl Default for Retention {
    fn default() -> Self {
        Retention::Full
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Emit a progress line every this many frames
    pub progress_interval: u64,
    pub key_mode: KeyMode,
    pub retention: Retention,
    /// Gaps strictly below this many seconds count as active
    pub active_threshold_secs: f64,
    /// Finalize flows that saw no packet for this many seconds
    pub idle_timeout_secs: Option<f64>,
    /// Stop after this many frames (still finalizes tracked flows)
    pub max_packets: Option<u64>,
    /// Accumulator threads: 1 = sequential, 0 = one per CPU
    pub workers: usize,
    /// Value written to the Label column
    pub label: String,
    /// Treat UDP datagrams as a transport layer; by default only TCP is
    pub include_udp: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            progress_interval: 100,
            key_mode: KeyMode::default(),
            retention: Retention::default(),
            active_threshold_secs: 1.0,
            idle_timeout_secs: None,
            max_packets: None,
            workers: 1,
            label: "BENIGN".to_string(),
            include_udp: false,
        }
    }
}

impl PipelineConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let config: PipelineConfig = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.progress_interval == 0 {
            return Err(FlowError::ConfigError("progress_interval must be positive".into()));
        }
        if !(self.active_threshold_secs > 0.0) {
            return Err(FlowError::ConfigError(format!(
                "active_threshold_secs must be positive, got {}",
                self.active_threshold_secs
            )));
        }
        if let Some(timeout) = self.idle_timeout_secs {
            if !(timeout > 0.0) {
                return Err(FlowError::ConfigError(format!(
                    "idle_timeout_secs must be positive, got {}",
                    timeout
                )));
            }
            if self.effective_workers() > 1 {
                return Err(FlowError::ConfigError(
                    "idle_timeout_secs needs a single worker; sharded accumulation only closes flows at the end".into(),
                ));
            }
        }
        Ok(())
    }

    /// Worker count with `0` resolved to the number of CPUs.
    pub fn effective_workers(&self) -> usize {
        match self.workers {
            0 => num_cpus::get().max(1),
            n => n,
        }
    }
}
