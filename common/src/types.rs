use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// 64-bit one-wire ROM id. Zero is the "no sensor bound" sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SensorId(pub u64);

impl SensorId {
    pub const INVALID: SensorId = SensorId(0);

    pub fn from_rom(rom: [u8; 8]) -> Self {
        Self(u64::from_le_bytes(rom))
    }

    pub fn rom(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    pub fn family_code(self) -> u8 {
        self.rom()[0]
    }

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl fmt::Display for SensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for SensorId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: String = s
            .trim()
            .trim_start_matches("0x")
            .chars()
            .filter(|c| *c != ':' && *c != '-')
            .collect();
        u64::from_str_radix(&digits, 16).map(SensorId)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorRole {
    Ambient,
    BoilerIn,
    BoilerOut,
}

impl SensorRole {
    pub const ALL: [SensorRole; 3] = [Self::Ambient, Self::BoilerIn, Self::BoilerOut];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ambient => "ambient",
            Self::BoilerIn => "boiler-in",
            Self::BoilerOut => "boiler-out",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControllerState {
    WaitForValidConfig,
    Halted,
    Running,
    Faulted,
}

impl ControllerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WaitForValidConfig => "WaitForValidConfig",
            Self::Halted => "Halted",
            Self::Running => "Running",
            Self::Faulted => "Faulted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FaultReason {
    #[default]
    None,
    SensorNotFound,
    SensorReadFailed,
    BusCommError,
}

impl FaultReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "None",
            Self::SensorNotFound => "SensorNotFound",
            Self::SensorReadFailed => "SensorReadFailed",
            Self::BusCommError => "BusCommError",
        }
    }
}

/// Single-slot controller mailbox value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Command {
    #[default]
    Idle,
    Start,
    Stop,
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoilerMode {
    Off,
    Performance,
    Eco,
    #[default]
    Undefined,
}

impl BoilerMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Performance => "performance",
            Self::Eco => "eco",
            Self::Undefined => "undefined",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "off" => Some(Self::Off),
            "performance" => Some(Self::Performance),
            "eco" => Some(Self::Eco),
            _ => None,
        }
    }

    pub(crate) fn to_byte(self) -> u8 {
        match self {
            Self::Off => 0,
            Self::Performance => 1,
            Self::Eco => 2,
            Self::Undefined => 0xff,
        }
    }

    pub(crate) fn from_byte(raw: u8) -> Self {
        match raw {
            0 => Self::Off,
            1 => Self::Performance,
            2 => Self::Eco,
            _ => Self::Undefined,
        }
    }
}

/// Set-point and dead-band width, both in degrees Celsius.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetTemps {
    #[serde(rename = "setPoint")]
    pub set_point: f32,
    pub hysteresis: f32,
}

impl TargetTemps {
    pub const MIN_SET_POINT: f32 = 20.0;
    pub const MAX_SET_POINT: f32 = 80.0;
    pub const MAX_HYSTERESIS: f32 = 20.0;

    pub fn lower_threshold(&self) -> f32 {
        self.set_point - self.hysteresis
    }

    pub fn is_valid_set_point(value: f32) -> bool {
        value.is_finite() && (Self::MIN_SET_POINT..=Self::MAX_SET_POINT).contains(&value)
    }

    pub fn is_valid_hysteresis(value: f32) -> bool {
        value.is_finite() && value > 0.0 && value <= Self::MAX_HYSTERESIS
    }
}

impl Default for TargetTemps {
    fn default() -> Self {
        Self {
            set_point: 55.0,
            hysteresis: 5.0,
        }
    }
}

/// Live controller readings. `sequence` increments on every mutation so
/// consumers can detect change without comparing each field.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TemperatureState {
    pub sequence: u64,
    pub ambient: Option<f32>,
    #[serde(rename = "boilerIn")]
    pub boiler_in: Option<f32>,
    #[serde(rename = "boilerOut")]
    pub boiler_out: Option<f32>,
    #[serde(rename = "setPoint")]
    pub set_point: f32,
    pub hysteresis: f32,
    #[serde(rename = "heaterOn")]
    pub heater_on: bool,
}

impl TemperatureState {
    pub fn new(targets: TargetTemps) -> Self {
        Self {
            sequence: 0,
            ambient: None,
            boiler_in: None,
            boiler_out: None,
            set_point: targets.set_point,
            hysteresis: targets.hysteresis,
            heater_on: false,
        }
    }

    pub fn targets(&self) -> TargetTemps {
        TargetTemps {
            set_point: self.set_point,
            hysteresis: self.hysteresis,
        }
    }

    pub fn reading(&self, role: SensorRole) -> Option<f32> {
        match role {
            SensorRole::Ambient => self.ambient,
            SensorRole::BoilerIn => self.boiler_in,
            SensorRole::BoilerOut => self.boiler_out,
        }
    }

    pub(crate) fn reading_mut(&mut self, role: SensorRole) -> &mut Option<f32> {
        match role {
            SensorRole::Ambient => &mut self.ambient,
            SensorRole::BoilerIn => &mut self.boiler_in,
            SensorRole::BoilerOut => &mut self.boiler_out,
        }
    }
}

/// One-wire enumeration diagnostics. Counters only grow until cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct OneWireBusStats {
    pub enumerations: u32,
    pub errors: u32,
    #[serde(rename = "minMs")]
    pub min_ms: u32,
    #[serde(rename = "maxMs")]
    pub max_ms: u32,
    #[serde(rename = "totalMs")]
    pub total_ms: u64,
    #[serde(rename = "lastDeviceCount")]
    pub last_device_count: u32,
}

impl OneWireBusStats {
    pub fn record_enumeration(&mut self, duration_ms: u32, devices: u32) {
        self.min_ms = if self.enumerations == 0 {
            duration_ms
        } else {
            self.min_ms.min(duration_ms)
        };
        self.max_ms = self.max_ms.max(duration_ms);
        self.total_ms = self.total_ms.saturating_add(u64::from(duration_ms));
        self.enumerations = self.enumerations.saturating_add(1);
        self.last_device_count = devices;
    }

    pub fn record_error(&mut self) {
        self.errors = self.errors.saturating_add(1);
    }

    pub fn average_ms(&self) -> u32 {
        if self.enumerations == 0 {
            0
        } else {
            (self.total_ms / u64::from(self.enumerations)) as u32
        }
    }
}

/// Consistent copy of everything the controller publishes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ControllerSnapshot {
    pub state: ControllerState,
    pub fault: FaultReason,
    pub mode: BoilerMode,
    pub temperatures: TemperatureState,
}
