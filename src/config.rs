//! Configuration loading for the behavior rig.
//!
//! Two documents are merged into one immutable [`RigConfig`] snapshot:
//! a hardware file (serial ports, valve calibration, corridor geometry)
//! and a task file (trial counts, timer durations, probabilities).
//! Loading uses `figment` so that either file can be overridden by
//! environment variables prefixed with `BEHAVIOR_RIG_`.
//!
//! The snapshot is validated once before any hardware is touched; a missing
//! required value for an enabled capability is a [`RigError::Configuration`]
//! raised pre-flight, never a mid-session surprise. The full snapshot is
//! also embedded in the session metadata file for reproducibility.
//!
//! # Example
//! ```no_run
//! use behavior_rig::config::RigConfig;
//!
//! # fn main() -> Result<(), behavior_rig::error::RigError> {
//! let config = RigConfig::load("config/hardware.toml", "config/task.toml")?;
//! config.validate()?;
//! # Ok(())
//! # }
//! ```

use crate::error::{RigError, RigResult};
use chrono::NaiveDate;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level merged configuration snapshot. Immutable once loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RigConfig {
    pub hardware: HardwareConfig,
    pub task: TaskConfig,
}

/// Hardware wiring and per-rig calibration values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Root directory for session data
    pub data_root: PathBuf,
    pub controller: ControllerConfig,
    pub rotary_encoder: RotaryEncoderConfig,
    pub light_sensor: LightSensorConfig,
    pub valve: ValveConfig,
    pub sound: SoundConfig,
    pub corridor: CorridorConfig,
}

/// The serial-attached state-machine controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Serial port of the behavior controller (e.g. "COM3", "/dev/ttyACM0")
    pub port: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotaryEncoderConfig {
    /// Serial port of the rotary encoder module
    pub port: Option<String>,
    /// Number of position thresholds programmed per trial
    #[serde(default = "default_threshold_count")]
    pub threshold_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LightSensorConfig {
    /// Serial port of the light-threshold sensor
    pub port: Option<String>,
    /// Set false on rigs without the sensor fitted
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub light_threshold: i32,
    pub dark_threshold: i32,
}

/// Reward valve calibration. Automatic mode interpolates over measured
/// sample pairs; manual mode applies a single operator-supplied scale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValveConfig {
    /// Use the interpolated calibration curve instead of the manual scale
    #[serde(default)]
    pub automatic_calibration: bool,
    /// Date the stored curve was measured
    pub calibration_date: Option<NaiveDate>,
    /// Most recent calibration run; the curve is stale if measured earlier
    pub last_calibration_run: Option<NaiveDate>,
    /// Measured weight per drop, in microliters
    #[serde(default)]
    pub calibration_weights_ul: Vec<f64>,
    /// Valve open times matching each weight sample, in milliseconds
    #[serde(default)]
    pub calibration_open_times_ms: Vec<f64>,
    /// Manual-mode scale factor
    pub manual_scale: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoundConfig {
    /// Audio sample rate in Hz
    #[serde(default = "default_samplerate")]
    pub samplerate_hz: u32,
    /// Go-tone frequency in Hz
    #[serde(default = "default_tone_hz")]
    pub go_tone_hz: f64,
    /// Go-tone duration in seconds
    #[serde(default = "default_tone_secs")]
    pub go_tone_secs: f64,
    /// White-noise burst duration in seconds
    #[serde(default = "default_noise_secs")]
    pub noise_secs: f64,
}

/// Geometry of the virtual corridor, used to derive the wheel rotation
/// that places the animal in the reward zone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorridorConfig {
    /// Distance from corridor start to the reward zone, in wheel-surface units
    pub distance_to_reward_zone: f64,
    /// Running wheel diameter, same units as the corridor distance
    pub wheel_diameter: f64,
}

/// Task parameters for one experiment protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Number of trials to run
    pub ntrials: usize,
    /// Reward volume per correct trial, in microliters
    pub reward_amount_ul: f64,
    /// Upper bound on a single trial, in seconds
    pub max_trial_time_secs: f64,
    /// Time allotted in the reward zone before the trial moves on, seconds
    pub reward_zone_time_secs: f64,
    /// Solenoid open time used by the reward pulse states, seconds
    pub solenoid_open_secs: f64,
    /// Inter-trial interval, seconds
    pub iti_secs: f64,
    /// Display refresh rate driving the closed-loop sampling period, Hz
    #[serde(default = "default_refresh_rate")]
    pub screen_refresh_hz: f64,
    /// Probability of drawing the rewarded stimulus on a trial
    #[serde(default = "default_reward_probability")]
    pub reward_probability: f64,
    /// Stimulus identifiers the protocol can draw from
    #[serde(default)]
    pub stimuli: Vec<String>,
    /// Which stimulus is rewarded
    pub rewarded_stimulus: Option<String>,
    /// Delay before the first trial, seconds
    #[serde(default)]
    pub session_delay_secs: f64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_threshold_count() -> usize {
    4
}

fn default_enabled() -> bool {
    true
}

fn default_samplerate() -> u32 {
    44_100
}

fn default_tone_hz() -> f64 {
    5_000.0
}

fn default_tone_secs() -> f64 {
    0.1
}

fn default_noise_secs() -> f64 {
    0.5
}

fn default_refresh_rate() -> f64 {
    60.0
}

fn default_reward_probability() -> f64 {
    0.67
}

impl RigConfig {
    /// Load and merge the hardware and task documents, with
    /// `BEHAVIOR_RIG_`-prefixed environment variables taking precedence.
    ///
    /// Example override: `BEHAVIOR_RIG_TASK.NTRIALS=50`
    pub fn load<P: AsRef<Path>, Q: AsRef<Path>>(
        hardware_file: P,
        task_file: Q,
    ) -> RigResult<Self> {
        let config: RigConfig = Figment::new()
            .merge(Toml::file(hardware_file.as_ref()).profile("default"))
            .merge(Toml::file(task_file.as_ref()).profile("default"))
            .merge(Env::prefixed("BEHAVIOR_RIG_").split("."))
            .extract()?;
        Ok(config)
    }

    /// Semantic validation, run once before any connection attempt.
    pub fn validate(&self) -> RigResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.hardware.log_level.as_str()) {
            return Err(RigError::Configuration(format!(
                "invalid log_level '{}', must be one of: {}",
                self.hardware.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.hardware.controller.port.is_none() {
            return Err(RigError::Configuration(
                "the value for hardware.controller.port is not set; \
                 please provide a valid port name"
                    .into(),
            ));
        }
        if self.hardware.rotary_encoder.port.is_none() {
            return Err(RigError::Configuration(
                "the value for hardware.rotary_encoder.port is not set; \
                 please provide a valid port name"
                    .into(),
            ));
        }
        if self.hardware.light_sensor.enabled && self.hardware.light_sensor.port.is_none() {
            return Err(RigError::Configuration(
                "hardware.light_sensor is enabled but hardware.light_sensor.port is not set"
                    .into(),
            ));
        }

        let valve = &self.hardware.valve;
        if valve.automatic_calibration {
            if valve.calibration_weights_ul.len() != valve.calibration_open_times_ms.len()
                || valve.calibration_weights_ul.len() < 2
            {
                return Err(RigError::Configuration(
                    "automatic calibration requires at least two matching \
                     (weight, open-time) sample pairs"
                        .into(),
                ));
            }
        } else if valve.manual_scale.is_none() {
            return Err(RigError::Configuration(
                "manual calibration requires hardware.valve.manual_scale".into(),
            ));
        }

        if self.hardware.corridor.wheel_diameter <= 0.0 {
            return Err(RigError::Configuration(
                "hardware.corridor.wheel_diameter must be positive".into(),
            ));
        }

        if self.task.ntrials == 0 {
            return Err(RigError::Configuration("task.ntrials must be nonzero".into()));
        }
        if !(0.0..=1.0).contains(&self.task.reward_probability) {
            return Err(RigError::Configuration(
                "task.reward_probability must be within [0, 1]".into(),
            ));
        }
        if self.task.screen_refresh_hz <= 0.0 {
            return Err(RigError::Configuration(
                "task.screen_refresh_hz must be positive".into(),
            ));
        }

        Ok(())
    }

    /// Degrees of forward wheel rotation that place the animal at the
    /// reward zone.
    pub fn position_at_reward(&self) -> f64 {
        self.hardware.corridor.distance_to_reward_zone / self.hardware.corridor.wheel_diameter
            * 360.0
    }
}

/// Ready-made configuration for tests and examples. Ports are
/// placeholders; swap them per test to keep connection registries
/// isolated.
pub mod test_support {
    use super::*;

    pub fn test_config() -> RigConfig {
        RigConfig {
            hardware: HardwareConfig {
                log_level: "info".into(),
                data_root: PathBuf::from("data"),
                controller: ControllerConfig {
                    port: Some("COM3".into()),
                },
                rotary_encoder: RotaryEncoderConfig {
                    port: Some("COM4".into()),
                    threshold_count: 4,
                },
                light_sensor: LightSensorConfig {
                    port: Some("COM5".into()),
                    enabled: true,
                    light_threshold: 41,
                    dark_threshold: 81,
                },
                valve: ValveConfig {
                    automatic_calibration: false,
                    calibration_date: None,
                    last_calibration_run: None,
                    calibration_weights_ul: vec![],
                    calibration_open_times_ms: vec![],
                    manual_scale: Some(0.3),
                },
                sound: SoundConfig {
                    samplerate_hz: 44_100,
                    go_tone_hz: 5_000.0,
                    go_tone_secs: 0.1,
                    noise_secs: 0.5,
                },
                corridor: CorridorConfig {
                    distance_to_reward_zone: 60.0,
                    wheel_diameter: 15.0,
                },
            },
            task: TaskConfig {
                ntrials: 5,
                reward_amount_ul: 3.0,
                max_trial_time_secs: 25.0,
                reward_zone_time_secs: 5.0,
                solenoid_open_secs: 0.05,
                iti_secs: 1.0,
                screen_refresh_hz: 60.0,
                reward_probability: 0.67,
                stimuli: vec!["black_bars".into(), "circles".into()],
                rewarded_stimulus: Some("black_bars".into()),
                session_delay_secs: 0.0,
            },
        }
    }
}

#[cfg(test)]
pub(crate) use test_support::test_config;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_test_config_passes() {
        assert!(test_config().validate().is_ok());
    }

    #[test]
    fn missing_controller_port_fails_fast() {
        let mut config = test_config();
        config.hardware.controller.port = None;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, RigError::Configuration(_)));
        assert!(err.to_string().contains("controller.port"));
    }

    #[test]
    fn enabled_light_sensor_requires_port() {
        let mut config = test_config();
        config.hardware.light_sensor.port = None;
        assert!(config.validate().is_err());
        config.hardware.light_sensor.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn manual_mode_requires_scale() {
        let mut config = test_config();
        config.hardware.valve.manual_scale = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn automatic_mode_requires_sample_pairs() {
        let mut config = test_config();
        config.hardware.valve.automatic_calibration = true;
        config.hardware.valve.calibration_weights_ul = vec![1.0];
        config.hardware.valve.calibration_open_times_ms = vec![10.0];
        assert!(config.validate().is_err());
    }

    #[test]
    fn position_at_reward_follows_geometry() {
        let config = test_config();
        // 60 / 15 * 360 = 1440 degrees of forward rotation
        assert!((config.position_at_reward() - 1440.0).abs() < f64::EPSILON);
    }

    #[test]
    fn snapshot_survives_a_toml_round_trip() {
        let config = test_config();
        let text = toml::to_string_pretty(&config).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("merged.toml");
        std::fs::write(&file, text).unwrap();
        // loading the serialized snapshot reproduces it
        let reloaded = RigConfig::load(&file, &file).unwrap();
        assert_eq!(reloaded.task.ntrials, config.task.ntrials);
        assert_eq!(
            reloaded.hardware.valve.manual_scale,
            config.hardware.valve.manual_scale
        );
        assert_eq!(
            reloaded.hardware.corridor.wheel_diameter,
            config.hardware.corridor.wheel_diameter
        );
    }

    #[test]
    fn loads_from_split_toml_documents() {
        let dir = tempfile::tempdir().unwrap();
        let hw = dir.path().join("hardware.toml");
        let task = dir.path().join("task.toml");
        std::fs::write(
            &hw,
            r#"
[hardware]
data_root = "data"

[hardware.controller]
port = "COM3"

[hardware.rotary_encoder]
port = "COM4"

[hardware.light_sensor]
port = "COM5"
light_threshold = 41
dark_threshold = 81

[hardware.valve]
manual_scale = 0.3

[hardware.sound]

[hardware.corridor]
distance_to_reward_zone = 60.0
wheel_diameter = 15.0
"#,
        )
        .unwrap();
        std::fs::write(
            &task,
            r#"
[task]
ntrials = 10
reward_amount_ul = 3.0
max_trial_time_secs = 25.0
reward_zone_time_secs = 5.0
solenoid_open_secs = 0.05
iti_secs = 1.0
rewarded_stimulus = "black_bars"
stimuli = ["black_bars", "circles"]
"#,
        )
        .unwrap();

        let config = RigConfig::load(&hw, &task).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.task.ntrials, 10);
        assert_eq!(config.hardware.controller.port.as_deref(), Some("COM3"));
        // defaults fill unspecified keys
        assert_eq!(config.task.screen_refresh_hz, 60.0);
        assert_eq!(config.hardware.sound.samplerate_hz, 44_100);
    }
}
