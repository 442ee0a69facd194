//! PowerShield command set.
//!
//! Every command is one newline-terminated ASCII line, `"<name> [args]\n"`.
//! The encoder performs no range checks; see [`crate::config`] for validation.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// Sampling frequencies supported by the board, fastest first.
pub const FREQUENCY_OPTIONS: [u32; 16] = [
    100_000, 50_000, 20_000, 10_000, 5_000, 2_000, 1_000, 500, 200, 100, 50, 20, 10, 5, 2, 1,
];

/// Maximum characters shown on one LCD line.
const LCD_WIDTH: usize = 16;

macro_rules! token_enum {
    ($(#[$meta:meta])* $name:ident, $kind:literal { $($variant:ident => $token:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $token)]
                $variant,
            )+
        }

        impl $name {
            /// Wire token for this value.
            pub fn as_token(self) -> &'static str {
                match self {
                    $($name::$variant => $token,)+
                }
            }
        }

        impl FromStr for $name {
            type Err = ConfigError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim() {
                    $($token => Ok($name::$variant),)+
                    other => Err(ConfigError::UnknownToken {
                        kind: $kind,
                        token: other.to_string(),
                    }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_token())
            }
        }
    };
}

token_enum!(
    /// Dynamic (100 nA - 10 mA, varying current) or static (2 nA - 200 mA, constant).
    AcqMode, "acquisition mode" { Dyn => "dyn", Stat => "stat" }
);
token_enum!(FuncMode, "function mode" { Optim => "optim", High => "high" });
token_enum!(
    /// Instantaneous current (A) or energy integrated over each sample period (J).
    OutputType, "output type" { Current => "current", Energy => "energy" }
);
token_enum!(
    /// Telemetry encoding. Also selects the local decoder.
    DataFormat, "data format" { AsciiDec => "ascii_dec", BinHexa => "bin_hexa" }
);
token_enum!(TriggerSource, "trigger source" { Sw => "sw", D7 => "d7" });
token_enum!(PowerState, "power state" { Auto => "auto", On => "on", Off => "off", Get => "get" });
token_enum!(PowerEnd, "power end state" { On => "on", Off => "off" });
token_enum!(TempUnit, "temperature unit" { DegC => "degc", DegF => "degf" });
token_enum!(AutotestArg, "autotest argument" { Start => "start", Status => "status" });

impl Default for DataFormat {
    fn default() -> Self {
        DataFormat::AsciiDec
    }
}

/// Encoded command waiting in the transmit queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommand {
    pub bytes: Vec<u8>,
    /// Name used to correlate the device's ack/err with the caller.
    pub name: String,
}

impl PendingCommand {
    pub fn new(bytes: impl Into<Vec<u8>>, name: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Echo(String),
    /// Board identification (`ack powershield PowerShield present <id>`).
    Powershield,
    Version,
    Status,
    /// Host takes control.
    Htc,
    /// Host releases control.
    Hrc,
    Lcd {
        line: u8,
        text: String,
    },
    Psrst,
    Volt {
        millivolts: u32,
    },
    VoltGet,
    Freq {
        hz: u32,
    },
    /// Zero or negative powers the target down.
    AcqTime {
        seconds: f64,
    },
    AcqTimeInf,
    AcqMode(AcqMode),
    FuncMode(FuncMode),
    Output(OutputType),
    Format(DataFormat),
    TrigSrc(TriggerSource),
    TrigDelay {
        ms: u32,
    },
    CurrThre {
        milliamps: f64,
    },
    Pwr(PowerState),
    PwrEnd(PowerEnd),
    Start,
    Stop,
    /// Cut target power for `ms` milliseconds.
    TargRst {
        ms: u32,
    },
    Temp(TempUnit),
    Autotest(AutotestArg),
    Calib,
    /// Free text typed by the user, sent as-is.
    Raw(String),
}

impl Command {
    /// Human-readable name, also the first word of the wire line.
    pub fn name(&self) -> String {
        let name = match self {
            Command::Help => "help",
            Command::Echo(_) => "echo",
            Command::Powershield => "powershield",
            Command::Version => "version",
            Command::Status => "status",
            Command::Htc => "htc",
            Command::Hrc => "hrc",
            Command::Lcd { .. } => "lcd",
            Command::Psrst => "psrst",
            Command::Volt { .. } | Command::VoltGet => "volt",
            Command::Freq { .. } => "freq",
            Command::AcqTime { .. } | Command::AcqTimeInf => "acqtime",
            Command::AcqMode(_) => "acqmode",
            Command::FuncMode(_) => "funcmode",
            Command::Output(_) => "output",
            Command::Format(_) => "format",
            Command::TrigSrc(_) => "trigsrc",
            Command::TrigDelay { .. } => "trigdelay",
            Command::CurrThre { .. } => "currthre",
            Command::Pwr(_) => "pwr",
            Command::PwrEnd(_) => "pwrend",
            Command::Start => "start",
            Command::Stop => "stop",
            Command::TargRst { .. } => "targrst",
            Command::Temp(_) => "temp",
            Command::Autotest(_) => "autotest",
            Command::Calib => "calib",
            Command::Raw(text) => return text.split_whitespace().next().unwrap_or("").to_string(),
        };
        name.to_string()
    }

    fn args(&self) -> Option<String> {
        let args = match self {
            Command::Echo(text) => text.clone(),
            Command::Lcd { line, text } => {
                let text: String = text.chars().take(LCD_WIDTH).collect();
                format!("{line} \"{text}\"")
            }
            Command::Volt { millivolts } => format!("{millivolts}m"),
            Command::VoltGet => "get".to_string(),
            Command::Freq { hz } => encode_frequency(*hz),
            Command::AcqTime { seconds } => encode_acquisition_time(*seconds),
            Command::AcqTimeInf => "inf".to_string(),
            Command::AcqMode(mode) => mode.to_string(),
            Command::FuncMode(mode) => mode.to_string(),
            Command::Output(output) => output.to_string(),
            Command::Format(format) => format.to_string(),
            Command::TrigSrc(source) => source.to_string(),
            Command::TrigDelay { ms } | Command::TargRst { ms } => encode_millis(*ms),
            Command::CurrThre { milliamps } => encode_current_threshold(*milliamps),
            Command::Pwr(state) => state.to_string(),
            Command::PwrEnd(state) => state.to_string(),
            Command::Temp(unit) => unit.to_string(),
            Command::Autotest(arg) => arg.to_string(),
            _ => return None,
        };
        Some(args)
    }

    /// Wire bytes, newline-terminated.
    pub fn encode(&self) -> Vec<u8> {
        let line = match self {
            Command::Raw(text) => text.trim().to_string(),
            _ => match self.args() {
                Some(args) => format!("{} {}", self.name(), args),
                None => self.name(),
            },
        };
        format!("{line}\n").into_bytes()
    }

    pub fn pending(&self) -> PendingCommand {
        PendingCommand::new(self.encode(), self.name())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.encode();
        f.write_str(String::from_utf8_lossy(&bytes).trim_end())
    }
}

fn encode_frequency(hz: u32) -> String {
    if hz >= 1000 {
        format!("{}k", hz / 1000)
    } else {
        hz.to_string()
    }
}

fn encode_acquisition_time(seconds: f64) -> String {
    if seconds <= 0.0 {
        return "0".to_string();
    }
    let ms = (seconds * 1000.0).round() as u64;
    if ms < 1000 {
        format!("{ms}m")
    } else {
        // Whole seconds of the rounded value, so 0.9996 s never becomes "0".
        (ms / 1000).to_string()
    }
}

fn encode_millis(ms: u32) -> String {
    if ms == 0 {
        "0".to_string()
    } else {
        format!("{ms}m")
    }
}

/// Integer microamps: the shell splits decimal literals and spaces badly.
fn encode_current_threshold(milliamps: f64) -> String {
    let microamps = (milliamps * 1000.0).round() as i64;
    format!("{microamps}u")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn wire(cmd: Command) -> String {
        String::from_utf8(cmd.encode()).unwrap()
    }

    #[test]
    fn frequency() {
        assert_eq!(wire(Command::Freq { hz: 100_000 }), "freq 100k\n");
        assert_eq!(wire(Command::Freq { hz: 1000 }), "freq 1k\n");
        assert_eq!(wire(Command::Freq { hz: 500 }), "freq 500\n");
    }

    #[test]
    fn acquisition_time() {
        assert_eq!(wire(Command::AcqTime { seconds: 5.0 }), "acqtime 5\n");
        assert_eq!(wire(Command::AcqTime { seconds: 0.0 }), "acqtime 0\n");
        assert_eq!(wire(Command::AcqTime { seconds: -1.0 }), "acqtime 0\n");
        assert_eq!(wire(Command::AcqTime { seconds: 0.25 }), "acqtime 250m\n");
        assert_eq!(wire(Command::AcqTime { seconds: 0.0001 }), "acqtime 0m\n");
        assert_eq!(wire(Command::AcqTime { seconds: 2.7 }), "acqtime 2\n");
        assert_eq!(wire(Command::AcqTime { seconds: 0.9996 }), "acqtime 1\n");
        assert_eq!(wire(Command::AcqTimeInf), "acqtime inf\n");
    }

    #[test]
    fn voltage_and_delays() {
        assert_eq!(wire(Command::Volt { millivolts: 3300 }), "volt 3300m\n");
        assert_eq!(wire(Command::VoltGet), "volt get\n");
        assert_eq!(wire(Command::TrigDelay { ms: 0 }), "trigdelay 0\n");
        assert_eq!(wire(Command::TrigDelay { ms: 15 }), "trigdelay 15m\n");
        assert_eq!(wire(Command::TargRst { ms: 100 }), "targrst 100m\n");
    }

    #[test]
    fn current_threshold_is_integer_microamps() {
        assert_eq!(wire(Command::CurrThre { milliamps: 1.5 }), "currthre 1500u\n");
        assert_eq!(wire(Command::CurrThre { milliamps: 0.0004 }), "currthre 0u\n");
        assert_eq!(wire(Command::CurrThre { milliamps: 0.0123 }), "currthre 12u\n");
    }

    #[test]
    fn enum_tokens_pass_through() {
        assert_eq!(wire(Command::AcqMode(AcqMode::Dyn)), "acqmode dyn\n");
        assert_eq!(wire(Command::FuncMode(FuncMode::High)), "funcmode high\n");
        assert_eq!(wire(Command::Output(OutputType::Energy)), "output energy\n");
        assert_eq!(wire(Command::Format(DataFormat::BinHexa)), "format bin_hexa\n");
        assert_eq!(wire(Command::TrigSrc(TriggerSource::D7)), "trigsrc d7\n");
        assert_eq!(wire(Command::Pwr(PowerState::Auto)), "pwr auto\n");
        assert_eq!(wire(Command::PwrEnd(PowerEnd::Off)), "pwrend off\n");
        assert_eq!(wire(Command::Temp(TempUnit::DegC)), "temp degc\n");
        assert_eq!(wire(Command::Autotest(AutotestArg::Start)), "autotest start\n");
    }

    #[test]
    fn lcd_text_is_truncated_and_quoted() {
        let cmd = Command::Lcd {
            line: 1,
            text: "power measurement board".into(),
        };
        assert_eq!(wire(cmd), "lcd 1 \"power measuremen\"\n");
    }

    #[test]
    fn bare_commands() {
        assert_eq!(wire(Command::Start), "start\n");
        assert_eq!(wire(Command::Stop), "stop\n");
        assert_eq!(wire(Command::Htc), "htc\n");
        assert_eq!(wire(Command::Echo("hi there".into())), "echo hi there\n");
    }

    #[test]
    fn raw_command_name_is_first_word() {
        let cmd = Command::Raw("  temp degf \r\n".into());
        assert_eq!(cmd.name(), "temp");
        assert_eq!(wire(cmd), "temp degf\n");
    }

    #[test]
    fn pending_carries_name() {
        let pending = Command::AcqTimeInf.pending();
        assert_eq!(pending.name, "acqtime");
        assert_eq!(pending.bytes, b"acqtime inf\n".to_vec());
    }

    #[test]
    fn tokens_parse_back() {
        assert_eq!("bin_hexa".parse::<DataFormat>().unwrap(), DataFormat::BinHexa);
        assert_eq!(" stat ".parse::<AcqMode>().unwrap(), AcqMode::Stat);
        assert!("binary".parse::<DataFormat>().is_err());
    }

    #[test]
    fn serde_uses_wire_tokens() {
        let json = serde_json::to_string(&DataFormat::AsciiDec).unwrap();
        assert_eq!(json, "\"ascii_dec\"");
        let parsed: PowerState = serde_json::from_str("\"off\"").unwrap();
        assert_eq!(parsed, PowerState::Off);
    }

    #[test]
    fn display_is_the_wire_line() {
        assert_eq!(Command::Freq { hz: 20_000 }.to_string(), "freq 20k");
    }
}
