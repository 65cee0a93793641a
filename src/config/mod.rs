//! Rig configuration.
//!
//! Every section carries `#[serde(default)]`, so a config file only needs the
//! keys it wants to override. The defaults describe the single fixture the rig
//! was built around.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// A point in machine coordinates (millimetres).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RigConfig {
    pub serial: SerialSettings,
    pub timing: ProtocolTiming,
    pub geometry: RackGeometry,
    pub motion: MotionProfile,
}

impl RigConfig {
    /// Load and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_json_str(&text)?;
        log::info!("Loaded rig configuration from {}", path.as_ref().display());
        Ok(config)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: RigConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.serial.baud_rate == 0 {
            return Err(ConfigError::Invalid("baud_rate must be non-zero".to_string()));
        }
        if self.serial.read_timeout_ms == 0 {
            return Err(ConfigError::Invalid("read_timeout_ms must be non-zero".to_string()));
        }

        let geometry = &self.geometry;
        for (name, pitch) in [
            ("tip_pitch", geometry.tip_pitch),
            ("reservoir_well_pitch", geometry.reservoir_well_pitch),
            ("reservoir_column_pitch", geometry.reservoir_column_pitch),
        ] {
            if !(pitch > 0.0) {
                return Err(ConfigError::Invalid(format!("{} must be positive, got {}", name, pitch)));
            }
        }

        for (name, breaks) in [
            ("tip_row_breaks", &geometry.tip_row_breaks),
            ("reservoir_column_breaks", &geometry.reservoir_column_breaks),
        ] {
            if breaks.windows(2).any(|w| w[0] >= w[1]) || breaks.first() == Some(&0) {
                return Err(ConfigError::Invalid(format!(
                    "{} must be strictly ascending positive counters: {:?}",
                    name, breaks
                )));
            }
        }

        Ok(())
    }
}

/// Controller description strings to look for, per host platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortSignatures {
    pub windows: Vec<String>,
    pub linux: Vec<String>,
    pub macos: Vec<String>,
}

impl Default for PortSignatures {
    fn default() -> Self {
        Self {
            windows: vec!["USB Serial Port".to_string()],
            linux: vec!["USB2.0-Serial".to_string(), "USB Serial".to_string()],
            macos: vec!["USB2.0-Serial".to_string(), "USB Serial".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    /// Skip discovery and open this port directly.
    pub port: Option<String>,
    /// Used when enumeration fails or finds no matching controller.
    pub default_port: Option<String>,
    pub baud_rate: u32,
    pub read_timeout_ms: u64,
    pub reset_settle_ms: u64,
    pub signatures: PortSignatures,
}

impl SerialSettings {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn reset_settle(&self) -> Duration {
        Duration::from_millis(self.reset_settle_ms)
    }
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: None,
            default_port: None,
            baud_rate: 250_000,
            read_timeout_ms: 1000,
            reset_settle_ms: 100,
            signatures: PortSignatures::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolTiming {
    /// Pause between writing a command and draining its response.
    pub post_write_settle_ms: u64,
    /// Pause between consecutive line reads while draining.
    pub inter_read_pause_ms: u64,
    /// Upper bound on a single drain. `None` drains until the firmware goes idle.
    pub drain_limit_ms: Option<u64>,
    /// Added to every step's dwell to absorb transmission latency.
    pub dwell_buffer_secs: u64,
}

impl ProtocolTiming {
    /// Zero pauses and no dwell buffer. Used by tests and dry runs.
    pub fn immediate() -> Self {
        Self {
            post_write_settle_ms: 0,
            inter_read_pause_ms: 0,
            drain_limit_ms: None,
            dwell_buffer_secs: 0,
        }
    }

    pub fn post_write_settle(&self) -> Duration {
        Duration::from_millis(self.post_write_settle_ms)
    }

    pub fn inter_read_pause(&self) -> Duration {
        Duration::from_millis(self.inter_read_pause_ms)
    }

    pub fn drain_limit(&self) -> Option<Duration> {
        self.drain_limit_ms.map(Duration::from_millis)
    }

    pub fn dwell_buffer(&self) -> Duration {
        Duration::from_secs(self.dwell_buffer_secs)
    }
}

impl Default for ProtocolTiming {
    fn default() -> Self {
        Self {
            post_write_settle_ms: 1000,
            inter_read_pause_ms: 100,
            drain_limit_ms: Some(120_000),
            dwell_buffer_secs: 20,
        }
    }
}

/// Tip rack and reservoir layout.
///
/// Break lists hold the counter values after which the rack moves to its next
/// row (tips) or column (reservoir). They are fixture data, not a formula.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RackGeometry {
    pub tip_origin: Point,
    pub tip_pitch: f64,
    pub tip_row_breaks: Vec<u32>,
    pub reservoir_origin: Point,
    pub reservoir_well_pitch: f64,
    pub reservoir_column_pitch: f64,
    pub reservoir_column_breaks: Vec<u32>,
}

impl Default for RackGeometry {
    fn default() -> Self {
        Self {
            tip_origin: Point::new(20.0, 120.0),
            tip_pitch: 9.0,
            tip_row_breaks: vec![5, 10, 15, 20],
            reservoir_origin: Point::new(110.0, 160.0),
            reservoir_well_pitch: 9.0,
            reservoir_column_pitch: 13.0,
            reservoir_column_breaks: vec![10, 20],
        }
    }
}

/// Fixed positions, heights and plunger targets used by the cycle routines.
///
/// Plunger values are absolute E-axis targets; zero is the rest position.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionProfile {
    pub travel_z: f64,
    pub tip_pickup_z: f64,
    pub reservoir_z: f64,
    pub well_z: f64,
    pub sensor: Point,
    pub waste: Point,
    pub clearance: Point,
    pub clearance_z: f64,
    pub plunger_air_gap: f64,
    pub plunger_draw: f64,
    pub plunger_inject: f64,
    pub plunger_compress: f64,
    pub plunger_eject: f64,
    pub travel_feed: u32,
    pub plunger_feed: u32,
}

impl Default for MotionProfile {
    fn default() -> Self {
        Self {
            travel_z: 60.0,
            tip_pickup_z: 12.0,
            reservoir_z: 20.0,
            well_z: 25.0,
            sensor: Point::new(180.0, 90.0),
            waste: Point::new(230.0, 20.0),
            clearance: Point::new(0.0, 0.0),
            clearance_z: 80.0,
            plunger_air_gap: 2.0,
            plunger_draw: 8.0,
            plunger_inject: -2.0,
            plunger_compress: -6.0,
            plunger_eject: -14.0,
            travel_feed: 3000,
            plunger_feed: 300,
        }
    }
}
