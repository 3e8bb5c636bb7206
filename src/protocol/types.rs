use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use strum::{EnumString, IntoStaticStr};

use super::encoding::*;

/// Operating mode, stored in the top three bits of the mode/setpoint byte.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, EnumString, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Mode {
    /// Nothing known yet; what an empty status snapshot encodes as.
    #[default]
    Unset = 0,
    Auto = 1,
    Cool = 2,
    Dry = 3,
    Heat = 4,
    FanOnly = 5,
    SmartDry = 6,
    #[strum(serialize = "invalid mode")]
    Unknown = 7,
}

impl From<u8> for Mode {
    fn from(byte: u8) -> Self {
        match byte & 0x07 {
            0 => Mode::Unset,
            1 => Mode::Auto,
            2 => Mode::Cool,
            3 => Mode::Dry,
            4 => Mode::Heat,
            5 => Mode::FanOnly,
            6 => Mode::SmartDry,
            _ => Mode::Unknown,
        }
    }
}

impl Mode {
    /// Modes a caller may select; `unset` and `invalid mode` only describe
    /// what the appliance reported.
    pub fn from_name(name: &str) -> Option<Self> {
        name.parse().ok().filter(|m| !matches!(m, Mode::Unset | Mode::Unknown))
    }

    pub fn name(self) -> &'static str {
        self.into()
    }
}

impl BitField for Mode {
    const SHIFT: u8 = 5;
    const MASK: u8 = 0x07;

    fn field_value(&self) -> u8 {
        *self as u8
    }
}

/// Fan speed as a percentage, with a few reserved codes above 100.
#[derive(Copy, Clone, Debug, Eq, PartialEq, EnumString, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum FanSpeed {
    Silent,
    Low,
    Medium,
    High,
    Fixed,
    Auto,
    #[strum(serialize = "custom")]
    Percent(u8),
}

impl Default for FanSpeed {
    fn default() -> Self {
        FanSpeed::Percent(0)
    }
}

impl FanSpeed {
    pub fn from_raw(raw: u8) -> Self {
        match raw & 0x7f {
            20 => FanSpeed::Silent,
            40 => FanSpeed::Low,
            60 => FanSpeed::Medium,
            80 => FanSpeed::High,
            101 => FanSpeed::Fixed,
            102 => FanSpeed::Auto,
            other => FanSpeed::Percent(other),
        }
    }

    /// Named speeds only; percentages are given as numbers.
    pub fn from_name(name: &str) -> Option<Self> {
        name.parse().ok().filter(|s| !matches!(s, FanSpeed::Percent(_)))
    }

    pub fn raw(self) -> u8 {
        match self {
            FanSpeed::Silent => 20,
            FanSpeed::Low => 40,
            FanSpeed::Medium => 60,
            FanSpeed::High => 80,
            FanSpeed::Fixed => 101,
            FanSpeed::Auto => 102,
            FanSpeed::Percent(p) => p,
        }
    }

    pub fn name(self) -> &'static str {
        self.into()
    }
}

impl BitField for FanSpeed {
    const SHIFT: u8 = 0;
    const MASK: u8 = 0xff;

    fn field_value(&self) -> u8 {
        self.raw()
    }
}

bit_field_encodable!(Mode, FanSpeed);

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, EnumString, IntoStaticStr)]
pub enum TemperatureUnit {
    /// Reported as `celcius`.
    #[default]
    #[strum(to_string = "celcius", serialize = "celsius")]
    Celsius,
    #[strum(serialize = "fahrenheit")]
    Fahrenheit,
}

impl TemperatureUnit {
    pub fn from_name(name: &str) -> Option<Self> {
        name.parse().ok()
    }

    pub fn name(self) -> &'static str {
        self.into()
    }

    /// Inclusive setpoint range accepted by the appliance in this unit.
    pub fn setpoint_range(self) -> (f64, f64) {
        match self {
            TemperatureUnit::Celsius => (16.0, 31.0),
            TemperatureUnit::Fahrenheit => (60.0, 87.0),
        }
    }
}

pub fn celsius_to_fahrenheit(c: f64) -> f64 {
    (c * 1.8 + 32.0).round()
}

/// Converts to Celsius rounded to the nearest half degree.
pub fn fahrenheit_to_celsius(f: f64) -> f64 {
    (((f - 32.0) / 1.8) * 2.0).round() / 2.0
}

/// On/off timer decoded from the 15-minute quantized timer bytes.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Timer {
    pub active: bool,
    pub hours: u8,
    pub minutes: u8,
}

impl Timer {
    /// `byte` holds active/hours/quarter, `elapsed` the minutes already gone
    /// from the current quarter.
    pub fn decode(byte: u8, elapsed: u8) -> Self {
        let active = byte & 0x80 != 0;
        if !active {
            return Timer::default();
        }
        let mut hours = (byte & 0x7c) >> 2;
        let quarter = byte & 0x03;
        let mut minutes = ((quarter as i16 + 1) * 15 - elapsed as i16).max(0) as u8;
        if minutes == 60 {
            hours += 1;
            minutes = 0;
        }
        Timer { active, hours, minutes }
    }

    /// Inverse of [`Timer::decode`]: (timer byte, elapsed nibble).
    pub fn encode(&self) -> (u8, u8) {
        if !self.active {
            return (0x00, 0x00);
        }
        let minutes = self.minutes.min(59);
        let (hours, quarter, elapsed) = if minutes >= 1 {
            let quarter = (minutes - 1) / 15;
            (self.hours, quarter, (quarter + 1) * 15 - minutes)
        } else if self.hours > 0 {
            (self.hours - 1, 3, 0)
        } else {
            (0, 0, 15)
        };
        (0x80 | ((hours & 0x1f) << 2) | quarter, elapsed & 0x0f)
    }
}

/// A decoded property value.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Integer(i64),
    Number(f64),
    Enum { value: u8, description: &'static str },
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<u8> for Value {
    fn from(n: u8) -> Self {
        Value::Integer(n as i64)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<Mode> for Value {
    fn from(mode: Mode) -> Self {
        Value::Enum { value: mode as u8, description: mode.name() }
    }
}

impl From<FanSpeed> for Value {
    fn from(speed: FanSpeed) -> Self {
        let description = match speed {
            FanSpeed::Percent(_) => "unknown",
            named => named.name(),
        };
        Value::Enum { value: speed.raw(), description }
    }
}

impl From<TemperatureUnit> for Value {
    fn from(unit: TemperatureUnit) -> Self {
        Value::Enum { value: unit as u8, description: unit.name() }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Integer(n) => write!(f, "{}", n),
            Value::Number(n) => write!(f, "{}", n),
            Value::Enum { value, description } => write!(f, "{} ({})", description, value),
        }
    }
}

/// Property name to value, ordered by name.
pub type Properties = BTreeMap<&'static str, Value>;

/// The subset of `current` that is new or different from `previous`.
pub fn diff(previous: &Properties, current: &Properties) -> Properties {
    current
        .iter()
        .filter(|(name, value)| previous.get(*name) != Some(*value))
        .map(|(name, value)| (*name, value.clone()))
        .collect()
}
