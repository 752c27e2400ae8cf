//! Daemon configuration
//!
//! Stored as YAML. Default location: `~/.config/rackd/rackd.yaml`.
//! Every section has defaults, so a partial file only overrides what it names.

use std::path::{Path, PathBuf};

use rack_core::audio::StreamParams;
use rack_core::autotune::TuneConfig;
use rack_core::bus::SLOT_COUNT;
use serde::{Deserialize, Serialize};

/// Root configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RackConfig {
    /// One or two capture streams
    pub streams: Vec<StreamParams>,
    pub midi: MidiConfig,
    pub bus: BusConfig,
    pub tuning: TuneConfig,
    pub realtime: RealtimeConfig,
    pub system: SystemConfig,
}

impl Default for RackConfig {
    fn default() -> Self {
        Self {
            streams: vec![StreamParams::default()],
            midi: MidiConfig::default(),
            bus: BusConfig::default(),
            tuning: TuneConfig::default(),
            realtime: RealtimeConfig::default(),
            system: SystemConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MidiConfig {
    /// Case-insensitive substring of the MIDI port name
    pub port_match: String,
}

impl Default for MidiConfig {
    fn default() -> Self {
        Self {
            port_match: "rack".to_string(),
        }
    }
}

/// Backplane wiring
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub spi_bus: u8,
    pub spi_speed_hz: u32,
    pub i2c_device: String,
    /// I2C address of slot 0's ROM; slot N answers at base + N
    pub rom_base_address: u8,
    /// BCM pins driving the slot address decoder, least significant first
    pub address_gpio: Vec<u8>,
    /// BCM pin wired to each slot's tune output
    pub tune_gpio: [u8; SLOT_COUNT],
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            spi_bus: 0,
            spi_speed_hz: 10_000_000,
            i2c_device: "/dev/i2c-1".to_string(),
            rom_base_address: 0x50,
            address_gpio: vec![22, 23, 24],
            tune_gpio: [4, 5, 6, 12, 13, 16, 17, 27],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Promote the audio thread to SCHED_FIFO
    pub enabled: bool,
    pub priority: i32,
    /// mlockall before entering the tick loop
    pub lock_memory: bool,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            priority: 80,
            lock_memory: true,
        }
    }
}

/// Commands run for the vendor shutdown / restart requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub shutdown_command: Vec<String>,
    pub restart_command: Vec<String>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            shutdown_command: vec!["systemctl".to_string(), "poweroff".to_string()],
            restart_command: vec!["systemctl".to_string(), "reboot".to_string()],
        }
    }
}

/// Get the default config file path
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")))
        .join("rackd")
        .join("rackd.yaml")
}

pub fn load(path: &Path) -> RackConfig {
    rack_core::config::load_config(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rackd.yaml");
        std::fs::write(
            &path,
            "streams:\n  - pcm_device: \"USB Audio\"\n    channels: 8\nmidi:\n  port_match: \"Pico\"\n",
        )
        .unwrap();

        let config = load(&path);
        assert_eq!(config.streams.len(), 1);
        assert_eq!(config.streams[0].pcm_device, "USB Audio");
        assert_eq!(config.streams[0].channels, 8);
        assert_eq!(config.streams[0].sample_rate, 4000);
        assert_eq!(config.midi.port_match, "Pico");
        assert_eq!(config.bus, BusConfig::default());
        assert_eq!(config.tuning.max_rounds, 32);
    }

    #[test]
    fn test_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("rackd.yaml");
        let mut config = RackConfig::default();
        config.streams.push(StreamParams {
            pcm_device: "second".to_string(),
            ..StreamParams::default()
        });
        config.realtime.enabled = false;

        rack_core::config::save_config(&config, &path).unwrap();
        assert_eq!(load(&path), config);
    }

    #[test]
    fn test_default_path_ends_in_rackd_yaml() {
        let path = default_config_path();
        assert!(path.ends_with("rackd/rackd.yaml"));
    }
}
