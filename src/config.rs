//! Machine configuration: per-drive envelopes, heater tuning, ring sizes.
//!
//! Loaded from a TOML file (see `printer.toml`) or built from defaults for
//! tests and the simulator. Every scalar the motion and heat cores consume
//! lives here; the hardware platform hands them out (see `hardware`).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of linear axes (X, Y, Z).
pub const AXES: usize = 3;
/// Total drives: the linear axes plus the extruders.
pub const DRIVES: usize = 5;
/// Heated elements (bed + nozzles).
pub const HEATERS: usize = 2;

/// Absolute zero in Celsius, used as the "no setpoint" sentinel.
pub const ABS_ZERO: f64 = -273.15;

pub const X_AXIS: usize = 0;
pub const Y_AXIS: usize = 1;
pub const Z_AXIS: usize = 2;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub motion: MotionSettings,
    #[serde(default)]
    pub heat: HeatSettings,
    #[serde(default = "default_drives")]
    pub drives: [DriveConfig; DRIVES],
    #[serde(default = "default_heaters")]
    pub heaters: [HeaterConfig; HEATERS],
}

impl Default for Config {
    fn default() -> Self {
        Self {
            motion: MotionSettings::default(),
            heat: HeatSettings::default(),
            drives: default_drives(),
            heaters: default_heaters(),
        }
    }
}

/// Ring sizes and stepping-timer tuning for the motion core.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MotionSettings {
    #[serde(default = "default_dda_ring_length")]
    pub dda_ring_length: usize,
    #[serde(default = "default_look_ahead_ring_length")]
    pub look_ahead_ring_length: usize,
    /// Queue depth above which the planner passes run.
    #[serde(default = "default_look_ahead")]
    pub look_ahead: usize,
    /// Timer period while no move is executing, seconds.
    #[serde(default = "default_standby_interrupt")]
    pub standby_interrupt: f64,
    /// Height above the bed at which the Z probe triggers, mm.
    #[serde(default = "default_z_probe_stop_height")]
    pub z_probe_stop_height: f64,
}

impl Default for MotionSettings {
    fn default() -> Self {
        Self {
            dda_ring_length: default_dda_ring_length(),
            look_ahead_ring_length: default_look_ahead_ring_length(),
            look_ahead: default_look_ahead(),
            standby_interrupt: default_standby_interrupt(),
            z_probe_stop_height: default_z_probe_stop_height(),
        }
    }
}

/// Thermal supervision thresholds shared by all heaters.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HeatSettings {
    /// Seconds between temperature samples.
    #[serde(default = "default_sample_time")]
    pub sample_time: f64,
    /// Below this a sensor is considered open-circuit.
    #[serde(default = "default_bad_low_temperature")]
    pub bad_low_temperature: f64,
    /// Above this a sensor is considered shorted.
    #[serde(default = "default_bad_high_temperature")]
    pub bad_high_temperature: f64,
    /// Consecutive bad samples tolerated before latching a fault.
    #[serde(default = "default_max_bad_temperature_count")]
    pub max_bad_temperature_count: u32,
    /// Degrees within which a heater counts as "at temperature".
    #[serde(default = "default_close_enough")]
    pub temperature_close_enough: f64,
    /// Setpoints below this are not waited for.
    #[serde(default = "default_low_so_dont_care")]
    pub temperature_low_so_dont_care: f64,
    /// Minimum nozzle temperature for extrusion.
    #[serde(default = "default_hot_enough_to_extrude")]
    pub hot_enough_to_extrude: f64,
    /// Seconds a heater may spend warming up before that is a fault.
    #[serde(default = "default_time_to_hot")]
    pub time_to_hot: f64,
}

impl Default for HeatSettings {
    fn default() -> Self {
        Self {
            sample_time: default_sample_time(),
            bad_low_temperature: default_bad_low_temperature(),
            bad_high_temperature: default_bad_high_temperature(),
            max_bad_temperature_count: default_max_bad_temperature_count(),
            temperature_close_enough: default_close_enough(),
            temperature_low_so_dont_care: default_low_so_dont_care(),
            hot_enough_to_extrude: default_hot_enough_to_extrude(),
            time_to_hot: default_time_to_hot(),
        }
    }
}

/// Per-drive mechanical limits. The first [`AXES`] entries are the linear
/// axes; the rest are extruders, for which `axis_length` is unused.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DriveConfig {
    pub steps_per_unit: f64,
    /// mm/s
    pub max_feedrate: f64,
    /// mm/s^2
    pub acceleration: f64,
    /// Largest step change in speed the drive tolerates, mm/s.
    pub instant_dv: f64,
    /// mm/s
    pub home_feedrate: f64,
    /// mm; meaningful for linear axes only.
    #[serde(default)]
    pub axis_length: f64,
}

/// Per-heater PID tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HeaterConfig {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    /// Error band outside which the output saturates, Celsius.
    pub full_band: f64,
    pub i_min: f64,
    pub i_max: f64,
    /// Low-pass mix for the derivative term, 0..1.
    pub d_mix: f64,
    /// False selects bang-bang control.
    pub use_pid: bool,
    /// The bed is exempt from the warm-up watchdog.
    #[serde(default)]
    pub is_bed: bool,
}

fn default_dda_ring_length() -> usize { 5 }
fn default_look_ahead_ring_length() -> usize { 30 }
fn default_look_ahead() -> usize { 20 }
fn default_standby_interrupt() -> f64 { 2.0e-4 }
fn default_z_probe_stop_height() -> f64 { 0.7 }
fn default_sample_time() -> f64 { 0.5 }
fn default_bad_low_temperature() -> f64 { -10.0 }
fn default_bad_high_temperature() -> f64 { 300.0 }
fn default_max_bad_temperature_count() -> u32 { 6 }
fn default_close_enough() -> f64 { 3.0 }
fn default_low_so_dont_care() -> f64 { 40.0 }
fn default_hot_enough_to_extrude() -> f64 { 170.0 }
fn default_time_to_hot() -> f64 { 120.0 }

fn default_drives() -> [DriveConfig; DRIVES] {
    let xy = DriveConfig {
        steps_per_unit: 80.0,
        max_feedrate: 200.0,
        acceleration: 1000.0,
        instant_dv: 15.0,
        home_feedrate: 50.0,
        axis_length: 200.0,
    };
    let extruder = DriveConfig {
        steps_per_unit: 420.0,
        max_feedrate: 40.0,
        acceleration: 1000.0,
        instant_dv: 2.0,
        home_feedrate: 10.0,
        axis_length: 0.0,
    };
    [
        xy.clone(),
        xy,
        DriveConfig {
            steps_per_unit: 400.0,
            max_feedrate: 4.0,
            acceleration: 100.0,
            instant_dv: 0.5,
            home_feedrate: 2.0,
            axis_length: 180.0,
        },
        extruder.clone(),
        extruder,
    ]
}

fn default_heaters() -> [HeaterConfig; HEATERS] {
    [
        // Bed
        HeaterConfig {
            kp: 10.0,
            ki: 0.1,
            kd: 100.0,
            full_band: 5.0,
            i_min: 0.0,
            i_max: 255.0,
            d_mix: 0.95,
            use_pid: false,
            is_bed: true,
        },
        // Nozzle
        HeaterConfig {
            kp: 12.0,
            ki: 0.45,
            kd: 80.0,
            full_band: 150.0,
            i_min: 0.0,
            i_max: 180.0,
            d_mix: 0.95,
            use_pid: true,
            is_bed: false,
        },
    ]
}

pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(config) => Ok(config),
            Err(e) => {
                tracing::error!("Failed to parse config TOML: {}", e);
                Err(ConfigError::Toml(e))
            }
        },
        Err(e) => {
            tracing::error!("Failed to read config file '{}': {}", path, e);
            Err(ConfigError::Io(e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.motion.dda_ring_length, 5);
        assert_eq!(config.motion.look_ahead_ring_length, 30);
        assert!(config.motion.look_ahead < config.motion.look_ahead_ring_length);
        for drive in &config.drives {
            assert!(drive.steps_per_unit > 0.0);
            assert!(drive.instant_dv > 0.0);
            assert!(drive.instant_dv <= drive.max_feedrate);
        }
    }

    #[test]
    fn parse_partial_toml() {
        let toml_str = r#"
            [motion]
            look_ahead_ring_length = 12
            look_ahead = 4

            [heat]
            sample_time = 0.25
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.motion.look_ahead_ring_length, 12);
        assert_eq!(config.motion.look_ahead, 4);
        // Untouched sections keep their defaults
        assert_eq!(config.motion.dda_ring_length, 5);
        assert_eq!(config.heat.sample_time, 0.25);
        assert_eq!(config.heat.max_bad_temperature_count, 6);
        assert_eq!(config.drives.len(), DRIVES);
    }
}
