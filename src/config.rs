// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Relay configuration.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

/// Deployment shape: the full four-subsystem relay, or the minimal
/// three-port pipe-only deployment with no registry or rendezvous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Full,
    DumbPipe,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Full
    }
}

/// Relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Address to bind every listener to.
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// Deployment shape.
    #[serde(default)]
    pub mode: Mode,

    /// Detector broadcast port (full mode).
    #[serde(default = "default_detector_port")]
    pub detector_port: u16,

    /// Display broadcast port (full mode).
    #[serde(default = "default_display_port")]
    pub display_port: u16,

    /// Paired control port (full mode).
    #[serde(default = "default_control_port")]
    pub control_port: u16,

    /// Rendezvous hello port (full mode).
    #[serde(default = "default_rendezvous_port")]
    pub rendezvous_port: u16,

    /// Registry port (full mode).
    #[serde(default = "default_registry_port")]
    pub registry_port: u16,

    /// Dumb-pipe control port (dumb-pipe mode).
    #[serde(default = "default_dumb_control_port")]
    pub dumb_control_port: u16,

    /// Dumb-pipe detector port (dumb-pipe mode).
    #[serde(default = "default_dumb_detector_port")]
    pub dumb_detector_port: u16,

    /// Dumb-pipe display port (dumb-pipe mode).
    #[serde(default = "default_dumb_display_port")]
    pub dumb_display_port: u16,

    /// First port handed out by the rendezvous allocator.
    #[serde(default = "default_rendezvous_port_base")]
    pub rendezvous_port_base: u16,

    /// Last port (inclusive) handed out by the rendezvous allocator.
    #[serde(default = "default_rendezvous_port_max")]
    pub rendezvous_port_max: u16,

    /// EdgeNode / SplitterSlot idle timeout in seconds.
    #[serde(default = "default_lease_duration")]
    pub lease_duration_secs: u64,

    /// Status report / idle-sweep cadence in seconds.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Maximum consumers per BroadcastPipe.
    #[serde(default = "default_max_consumers")]
    pub max_consumers_per_pipe: usize,

    /// Maximum concurrent SplitterSlots.
    #[serde(default = "default_max_splitter_slots")]
    pub max_splitter_slots: usize,

    /// Maximum concurrent EdgeNodes.
    #[serde(default = "default_max_edges")]
    pub max_edges: usize,

    /// Maximum concurrent Services.
    #[serde(default = "default_max_services")]
    pub max_services: usize,

    /// Detector ring buffer capacity in bytes (50 kHz * 30s worst case).
    #[serde(default = "default_ring_detector_bytes")]
    pub ring_buffer_detector_bytes: usize,

    /// Display ring buffer capacity in bytes (12 kHz * 30s worst case).
    #[serde(default = "default_ring_display_bytes")]
    pub ring_buffer_display_bytes: usize,

    /// Sample rate (Hz) advertised in the detector StreamHeader.
    #[serde(default = "default_detector_sample_rate")]
    pub detector_sample_rate_hz: u32,

    /// Sample rate (Hz) advertised in the display StreamHeader.
    #[serde(default = "default_display_sample_rate")]
    pub display_sample_rate_hz: u32,

    /// Maximum registry/rendezvous JSON message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

fn default_bind_address() -> IpAddr {
    "0.0.0.0".parse().unwrap()
}
fn default_detector_port() -> u16 {
    4410
}
fn default_display_port() -> u16 {
    4411
}
fn default_control_port() -> u16 {
    4409
}
fn default_rendezvous_port() -> u16 {
    3000
}
fn default_registry_port() -> u16 {
    5401
}
fn default_dumb_control_port() -> u16 {
    3001
}
fn default_dumb_detector_port() -> u16 {
    3002
}
fn default_dumb_display_port() -> u16 {
    3003
}
fn default_rendezvous_port_base() -> u16 {
    3001
}
fn default_rendezvous_port_max() -> u16 {
    3100
}
fn default_lease_duration() -> u64 {
    120
}
fn default_heartbeat_interval() -> u64 {
    5
}
fn default_max_consumers() -> usize {
    100
}
fn default_max_splitter_slots() -> usize {
    32
}
fn default_max_edges() -> usize {
    32
}
fn default_max_services() -> usize {
    128
}
fn default_ring_detector_bytes() -> usize {
    50_000 * 30
}
fn default_ring_display_bytes() -> usize {
    12_000 * 30
}
fn default_detector_sample_rate() -> u32 {
    50_000
}
fn default_display_sample_rate() -> u32 {
    12_000
}
fn default_max_message_size() -> usize {
    16 * 1024 * 1024
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            mode: Mode::default(),
            detector_port: default_detector_port(),
            display_port: default_display_port(),
            control_port: default_control_port(),
            rendezvous_port: default_rendezvous_port(),
            registry_port: default_registry_port(),
            dumb_control_port: default_dumb_control_port(),
            dumb_detector_port: default_dumb_detector_port(),
            dumb_display_port: default_dumb_display_port(),
            rendezvous_port_base: default_rendezvous_port_base(),
            rendezvous_port_max: default_rendezvous_port_max(),
            lease_duration_secs: default_lease_duration(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            max_consumers_per_pipe: default_max_consumers(),
            max_splitter_slots: default_max_splitter_slots(),
            max_edges: default_max_edges(),
            max_services: default_max_services(),
            ring_buffer_detector_bytes: default_ring_detector_bytes(),
            ring_buffer_display_bytes: default_ring_display_bytes(),
            detector_sample_rate_hz: default_detector_sample_rate(),
            display_sample_rate_hz: default_display_sample_rate(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        serde_json::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Save configuration to a JSON file.
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))
    }

    /// Get lease duration as Duration.
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_secs)
    }

    /// Get heartbeat/status interval as Duration.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lease_duration_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "lease_duration_secs cannot be 0".into(),
            ));
        }
        if self.max_consumers_per_pipe == 0 {
            return Err(ConfigError::InvalidValue(
                "max_consumers_per_pipe cannot be 0".into(),
            ));
        }
        if self.max_edges == 0 {
            return Err(ConfigError::InvalidValue("max_edges cannot be 0".into()));
        }
        if self.max_services == 0 {
            return Err(ConfigError::InvalidValue(
                "max_services cannot be 0".into(),
            ));
        }
        if self.rendezvous_port_base >= self.rendezvous_port_max {
            return Err(ConfigError::InvalidValue(
                "rendezvous_port_base must be < rendezvous_port_max".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration error types.
#[derive(Debug, Clone)]
pub enum ConfigError {
    IoError(String),
    ParseError(String),
    SerializeError(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IoError(s) => write!(f, "I/O error: {}", s),
            Self::ParseError(s) => write!(f, "Parse error: {}", s),
            Self::SerializeError(s) => write!(f, "Serialize error: {}", s),
            Self::InvalidValue(s) => write!(f, "Invalid value: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}
