//! Acquisition settings and the command sequence that applies them.

use std::fs;
use std::path::Path;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::commands::{
    AcqMode, Command, DataFormat, FuncMode, OutputType, PowerEnd, PowerState, TriggerSource,
    FREQUENCY_OPTIONS,
};
use crate::errors::{ConfigError, Result};

const VOLTAGE_RANGE_MV: (u32, u32) = (1800, 3300);
const ACQUISITION_TIME_RANGE_S: (f64, f64) = (0.0001, 10.0);
const TRIGGER_DELAY_MAX_MS: u32 = 30_000;
const CURRENT_THRESHOLD_MAX_MA: f64 = 10.0;

/// Everything configurable before `start`.
///
/// Deserializes from JSON; absent fields take the defaults below.
///
/// ```json
/// { "voltage_mv": 1800, "frequency_hz": 10000, "infinite": true, "format": "bin_hexa" }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AcquisitionConfig {
    pub voltage_mv: u32,
    pub frequency_hz: u32,
    /// Ignored when `infinite` is set.
    pub acquisition_time_s: f64,
    pub infinite: bool,
    pub acq_mode: AcqMode,
    pub func_mode: FuncMode,
    pub output: OutputType,
    pub format: DataFormat,
    pub trigger_source: TriggerSource,
    pub trigger_delay_ms: u32,
    /// Only sent when set; older firmware rejects `currthre`.
    pub current_threshold_ma: Option<f64>,
    pub power: PowerState,
    pub power_end: PowerEnd,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            voltage_mv: 3300,
            frequency_hz: 100,
            acquisition_time_s: 10.0,
            infinite: false,
            acq_mode: AcqMode::Dyn,
            func_mode: FuncMode::Optim,
            output: OutputType::Current,
            format: DataFormat::AsciiDec,
            trigger_source: TriggerSource::Sw,
            trigger_delay_ms: 1,
            current_threshold_ma: None,
            power: PowerState::Auto,
            power_end: PowerEnd::On,
        }
    }
}

impl AcquisitionConfig {
    /// Read a JSON file and validate it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let config = Self::from_json(&text)?;
        debug!("loaded acquisition config from {}", path.display());
        Ok(config)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text).map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every field against the ranges the board accepts.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let (vmin, vmax) = VOLTAGE_RANGE_MV;
        if !(vmin..=vmax).contains(&self.voltage_mv) {
            return Err(out_of_range("voltage_mv", self.voltage_mv, "1800..=3300"));
        }

        if !FREQUENCY_OPTIONS.contains(&self.frequency_hz) {
            return Err(out_of_range(
                "frequency_hz",
                self.frequency_hz,
                "1, 2, 5, 10, 20, 50, 100, 200, 500, 1k, 2k, 5k, 10k, 20k, 50k, 100k",
            ));
        }

        let (tmin, tmax) = ACQUISITION_TIME_RANGE_S;
        if !self.infinite && !(tmin..=tmax).contains(&self.acquisition_time_s) {
            return Err(out_of_range(
                "acquisition_time_s",
                self.acquisition_time_s,
                "0.0001..=10",
            ));
        }

        if self.trigger_delay_ms > TRIGGER_DELAY_MAX_MS {
            return Err(out_of_range(
                "trigger_delay_ms",
                self.trigger_delay_ms,
                "0..=30000",
            ));
        }

        if let Some(ma) = self.current_threshold_ma {
            if !(0.0..=CURRENT_THRESHOLD_MAX_MA).contains(&ma) {
                return Err(out_of_range("current_threshold_ma", ma, "0..=10"));
            }
        }

        if self.power == PowerState::Get {
            return Err(out_of_range("power", self.power, "auto, on, off"));
        }

        Ok(())
    }

    /// Commands that apply this configuration, in the order the board expects.
    pub fn commands(&self) -> Vec<Command> {
        let mut cmds = vec![
            Command::Volt {
                millivolts: self.voltage_mv,
            },
            Command::Freq {
                hz: self.frequency_hz,
            },
            if self.infinite {
                Command::AcqTimeInf
            } else {
                Command::AcqTime {
                    seconds: self.acquisition_time_s,
                }
            },
            Command::AcqMode(self.acq_mode),
            Command::FuncMode(self.func_mode),
            Command::Output(self.output),
            Command::Format(self.format),
            Command::TrigSrc(self.trigger_source),
            Command::TrigDelay {
                ms: self.trigger_delay_ms,
            },
        ];
        if let Some(milliamps) = self.current_threshold_ma {
            cmds.push(Command::CurrThre { milliamps });
        }
        cmds.push(Command::Pwr(self.power));
        cmds.push(Command::PwrEnd(self.power_end));
        cmds
    }
}

fn out_of_range(field: &'static str, value: impl ToString, allowed: &'static str) -> ConfigError {
    ConfigError::OutOfRange {
        field,
        value: value.to_string(),
        allowed,
    }
}
