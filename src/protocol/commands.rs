//! Request builders: the fixed queries and the `setStatus` encoder.

use std::net::Ipv4Addr;

use bytes::Bytes;
use serde_json::Value as Json;

use super::encoding::{Encodable, EncodingError};
use super::frame::{DeviceClass, Frame, MessageType};
use super::status::Status;
use super::types::*;
use crate::error::{Error, Result};

/// What a queued command asks for; also its label in logs.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CommandKind {
    Status,
    SetStatus,
    Capabilities,
    PowerUsage,
    NetworkNotify,
    ElectronicId,
    Raw,
}

impl CommandKind {
    pub fn label(self) -> &'static str {
        match self {
            CommandKind::Status => "getStatus",
            CommandKind::SetStatus => "setStatus",
            CommandKind::Capabilities => "getCapabilities",
            CommandKind::PowerUsage => "getPowerUsage",
            CommandKind::NetworkNotify => "sendNetworkStatusNotification",
            CommandKind::ElectronicId => "getElectronicId",
            CommandKind::Raw => "raw",
        }
    }
}

fn frame(device_class: DeviceClass, message_type: MessageType, payload: &[u8]) -> Result<Bytes> {
    Frame::new(device_class, message_type, payload)
        .to_bytes()
        .map_err(|_| Error::Protocol(format!("payload of {} bytes does not fit a frame", payload.len())))
}

pub fn status_query() -> Result<Bytes> {
    let mut payload = [0u8; 21];
    payload[..8].copy_from_slice(&[0x41, 0x81, 0x00, 0xff, 0x03, 0xff, 0x00, 0x02]);
    payload[20] = 0x03;
    frame(DeviceClass::AirConditioner, MessageType::Query, &payload)
}

/// Capability pages are numbered from 1.
pub fn capabilities_query(page: u8) -> Result<Bytes> {
    frame(DeviceClass::AirConditioner, MessageType::Query, &[0xb5, 0x01, 0x01, page])
}

pub fn power_usage_query() -> Result<Bytes> {
    let mut payload = [0u8; 21];
    payload[..4].copy_from_slice(&[0x41, 0x21, 0x01, 0x44]);
    payload[20] = 0x01;
    frame(DeviceClass::AirConditioner, MessageType::Query, &payload)
}

pub fn electronic_id_query() -> Result<Bytes> {
    frame(DeviceClass::Any, MessageType::ElectronicId, &[0x00])
}

/// Tells the appliance the WiFi module is online so it lights the WiFi
/// indicator. `address` is the local address of the link, if known.
pub fn network_status_notification(address: Option<Ipv4Addr>) -> Result<Bytes> {
    let ip = address.unwrap_or(Ipv4Addr::LOCALHOST).octets();
    let payload: [u8; 20] = [
        0x01, // WiFi module
        0x01, // client mode
        0x04, // signal strong
        ip[3], ip[2], ip[1], ip[0],
        0xff, // no RF
        0x00, // router connected
        0x01, // cloud not connected
        0x01, // LAN connected
        0x01, // TCP connections
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    ];
    frame(DeviceClass::AirConditioner, MessageType::NetworkNotify, &payload)
}

/// A property change requested through `setStatus`.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Setting {
    Beep(bool),
    FanSpeed(FanSpeed),
    FrostProtection(bool),
    HorizontalSwing(bool),
    Mode(Mode),
    PowerOn(bool),
    /// In the target unit: the `TemperatureUnit` of the same request, or the
    /// unit the appliance currently reports.
    Setpoint(f64),
    Sleep(bool),
    TemperatureUnit(TemperatureUnit),
    Turbo(bool),
    VerticalSwing(bool),
}

fn flag(value: &Json) -> bool {
    value.as_bool() == Some(true)
}

impl Setting {
    /// Parses one `name: value` pair as accepted by the vendor API.
    pub fn parse(name: &str, value: &Json) -> Result<Self> {
        let setting = match name {
            "beep" => Setting::Beep(flag(value)),
            "frostProtectionModeActive" => Setting::FrostProtection(flag(value)),
            "horizontalSwingActive" => Setting::HorizontalSwing(flag(value)),
            "powerOn" => Setting::PowerOn(flag(value)),
            "sleepModeActive" => Setting::Sleep(flag(value)),
            "turboModeActive" => Setting::Turbo(flag(value)),
            "verticalSwingActive" => Setting::VerticalSwing(flag(value)),
            "fanSpeed" => {
                let speed = match value {
                    Json::String(s) => FanSpeed::from_name(s).filter(|s| *s != FanSpeed::Fixed),
                    Json::Number(n) => n.as_u64().filter(|p| *p <= 100).map(|p| FanSpeed::from_raw(p as u8)),
                    _ => None,
                };
                Setting::FanSpeed(speed.ok_or_else(|| {
                    Error::OutOfRange("fanSpeed must be one of: auto, silent, low, medium, high or 0 - 100".into())
                })?)
            }
            "mode" => {
                let mode = value.as_str().and_then(Mode::from_name);
                Setting::Mode(mode.ok_or_else(|| {
                    Error::OutOfRange("Mode must be one of: auto, cool, dry, heat, fanonly or smartdry".into())
                })?)
            }
            "setpoint" => Setting::Setpoint(
                value
                    .as_f64()
                    .ok_or_else(|| Error::OutOfRange("The setpoint must be a number".into()))?,
            ),
            "temperatureUnit" => {
                let unit = value.as_str().and_then(TemperatureUnit::from_name);
                Setting::TemperatureUnit(unit.ok_or_else(|| {
                    Error::OutOfRange("The temperatureUnit must either be fahrenheit or celcius".into())
                })?)
            }
            other => return Err(Error::OutOfRange(format!("Unsupported property to be set ({})", other))),
        };
        Ok(setting)
    }

    pub fn parse_all<'a, I>(properties: I) -> Result<Vec<Self>>
    where
        I: IntoIterator<Item = (&'a String, &'a Json)>,
    {
        properties.into_iter().map(|(name, value)| Setting::parse(name, value)).collect()
    }
}

const SET_STATUS_LEN: usize = 25;

/// The 25-byte payload of a set-status (message type 0x02) request.
#[derive(Clone, Debug, PartialEq)]
pub struct SetStatusCommand {
    pub status: Status,
    pub beep: bool,
    /// Written to byte 23 when present. Some appliances answer error 9999
    /// when this byte is set.
    pub message_id: Option<u8>,
}

impl SetStatusCommand {
    /// Merges `settings` onto the cached status, validating each in order.
    /// Nothing is encoded if any setting is rejected.
    pub fn build(cached: &Status, settings: &[Setting], message_id: Option<u8>) -> Result<Self> {
        let target_unit = settings
            .iter()
            .rev()
            .find_map(|s| match s {
                Setting::TemperatureUnit(unit) => Some(*unit),
                _ => None,
            })
            .unwrap_or(cached.temperature_unit);
        let switching_to_heat = settings.iter().any(|s| *s == Setting::Mode(Mode::Heat));

        let mut status = cached.clone();
        // the working copy keeps its setpoint in Celsius
        status.setpoint = cached.setpoint_celsius();
        let mut beep = true;

        for setting in settings {
            match *setting {
                Setting::Beep(on) => beep = on,
                Setting::FanSpeed(speed) => status.fan_speed = speed,
                Setting::FrostProtection(on) => {
                    if status.mode != Mode::Heat && !switching_to_heat {
                        return Err(Error::OutOfRange(
                            "frostProtection capability is only available in heat mode".into(),
                        ));
                    }
                    status.frost_protection = on;
                }
                Setting::HorizontalSwing(on) => status.horizontal_swing = on,
                Setting::Mode(mode) => status.mode = mode,
                Setting::PowerOn(on) => status.power_on = on,
                Setting::Setpoint(value) => {
                    let (low, high) = target_unit.setpoint_range();
                    if !(low..=high).contains(&value) {
                        return Err(Error::OutOfRange(match target_unit {
                            TemperatureUnit::Celsius => "The setpoint must be between 16 - 31°C".into(),
                            TemperatureUnit::Fahrenheit => "The setpoint must be between 60 - 87°F".into(),
                        }));
                    }
                    status.setpoint = match target_unit {
                        TemperatureUnit::Celsius => value,
                        TemperatureUnit::Fahrenheit => fahrenheit_to_celsius(value),
                    };
                }
                Setting::Sleep(on) => {
                    status.sleep = on;
                    status.sleep_flag = on;
                }
                Setting::TemperatureUnit(unit) => status.temperature_unit = unit,
                Setting::Turbo(on) => {
                    status.turbo = on;
                    status.strong = on;
                }
                Setting::VerticalSwing(on) => status.vertical_swing = on,
            }
        }

        Ok(Self { status, beep, message_id })
    }

    pub fn to_frame(&self) -> Result<Bytes> {
        let payload = self
            .to_bytes()
            .map_err(|_| Error::Protocol("set-status payload could not be encoded".into()))?;
        frame(DeviceClass::AirConditioner, MessageType::Set, &payload)
    }
}

fn set(on: bool, mask: u8) -> u8 {
    if on { mask } else { 0x00 }
}

impl Encodable for SetStatusCommand {
    fn encoded_len(&self) -> usize {
        SET_STATUS_LEN
    }

    fn encode<'a>(&self, into: &'a mut [u8]) -> core::result::Result<&'a [u8], EncodingError> {
        if into.len() < SET_STATUS_LEN {
            return Err(EncodingError);
        }
        let into = &mut into[..SET_STATUS_LEN];
        into.fill(0);
        let s = &self.status;

        into[0] = 0x40;
        // bit 1: commands come from a PC, not the remote
        into[1] = set(self.beep, 0x40)
            | set(s.fast_check, 0x20)
            | set(s.timer_mode, 0x10)
            | set(s.child_sleep, 0x08)
            | set(s.resume, 0x04)
            | 0x02
            | set(s.power_on, 0x01);

        // an empty snapshot has no setpoint yet; it encodes as zero
        let setpoint = s.setpoint.max(16.0);
        into[2] = set(setpoint.fract() != 0.0, 0x10) | ((setpoint.floor() as u8).saturating_sub(16) & 0x0f);
        s.mode.encode(&mut into[2..3])?;
        s.fan_speed.encode(&mut into[3..4])?;

        let (on_byte, on_elapsed) = s.on_timer.encode();
        let (off_byte, off_elapsed) = s.off_timer.encode();
        into[4] = on_byte;
        into[5] = off_byte;
        into[6] = (on_elapsed << 4) | off_elapsed;

        into[7] = 0x30 | set(s.horizontal_swing, 0x0c) | set(s.vertical_swing, 0x03);
        into[8] = set(s.personal_feeling, 0x80)
            | set(s.power_save, 0x40)
            | set(s.strong, 0x20)
            | set(s.low_frequency_fan, 0x10)
            | set(s.alarm_sleep, 0x04)
            | (s.cosy_sleep & 0x03);
        into[9] = set(s.eco, 0x80)
            | set(s.purifying, 0x40)
            | set(s.ptc_heater, 0x08)
            | set(s.dry_clean, 0x04)
            | set(s.natural_wind, 0x02)
            | set(s.wise_eye, 0x01);
        into[10] = set(s.dust_full, 0x40)
            | set(s.peak_valley, 0x20)
            | set(s.night_light, 0x10)
            | set(s.catch_cold, 0x08)
            | set(s.temperature_unit == TemperatureUnit::Fahrenheit, 0x04)
            | set(s.turbo, 0x02)
            | set(s.sleep, 0x01);
        into[21] = set(s.frost_protection, 0x80);
        if let Some(id) = self.message_id {
            into[23] = id;
        }

        Ok(into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::status::StatusRevision;
    use serde_json::json;

    fn set_status(settings: &[Setting]) -> String {
        let command = SetStatusCommand::build(&Status::default(), settings, None).unwrap();
        hex::encode(command.to_frame().unwrap())
    }

    fn parse(props: Json) -> Vec<Setting> {
        Setting::parse_all(props.as_object().unwrap()).unwrap()
    }

    #[test]
    fn status_query_test() {
        assert_eq!(
            "aa20ac00000000000303418100ff03ff000200000000000000000000000003cd99",
            hex::encode(status_query().unwrap())
        );
    }

    #[test]
    fn capabilities_query_test() {
        assert_eq!("aa0fac00000000000303b50101012166", hex::encode(capabilities_query(1).unwrap()));
    }

    #[test]
    fn electronic_id_query_test() {
        assert_eq!("aa0bff0000000000030700ec", hex::encode(electronic_id_query().unwrap()));
    }

    #[test]
    fn network_status_notification_test() {
        assert_eq!(
            "aa1eac0000000000030d0101040100007fff0001010100000000000000009e",
            hex::encode(network_status_notification(None).unwrap())
        );
    }

    #[test]
    fn beep_test() {
        assert_eq!(
            "aa24ac0000000000030240020000000000300000000000000000000000000000000000b405",
            set_status(&[Setting::Beep(false)])
        );
        assert!(set_status(&parse(json!({ "beep": true }))).ends_with("1c5d"));
        assert!(set_status(&[]).ends_with("1c5d"));
    }

    #[test]
    fn fan_speed_test() {
        let cases = [("auto", "a86b"), ("silent", "d392"), ("low", "9bb6"), ("medium", "54e9"), ("high", "0b1e")];
        for (name, tail) in cases {
            let encoded = set_status(&parse(json!({ "fanSpeed": name })));
            assert!(encoded.ends_with(tail), "{} -> {}", name, encoded);
        }
    }

    #[test]
    fn mode_test() {
        assert_eq!(
            "aa24ac0000000000030240424000000000300000000000000000000000000000000000f346",
            set_status(&parse(json!({ "mode": "cool" })))
        );
        let cases = [("auto", "e772"), ("dry", "0811"), ("fanonly", "20b9"), ("heat", "db1e")];
        for (name, tail) in cases {
            let encoded = set_status(&parse(json!({ "mode": name })));
            assert!(encoded.ends_with(tail), "{} -> {}", name, encoded);
        }
    }

    #[test]
    fn frost_protection_test() {
        assert_eq!(
            "aa24ac00000000000302404280000000003000000000000000000000000000800000000277",
            set_status(&parse(json!({ "mode": "heat", "frostProtectionModeActive": true })))
        );

        let err = SetStatusCommand::build(&Status::default(), &[Setting::FrostProtection(true)], None).unwrap_err();
        assert_eq!("frostProtection capability is only available in heat mode", err.to_string());
    }

    #[test]
    fn swing_and_power_test() {
        assert!(set_status(&parse(json!({ "horizontalSwingActive": true }))).ends_with("b6b7"));
        assert!(set_status(&parse(json!({ "verticalSwingActive": true }))).ends_with("babc"));
        assert!(set_status(&parse(json!({ "powerOn": true }))).ends_with("b1c7"));
    }

    #[test]
    fn setpoint_test() {
        assert!(set_status(&parse(json!({ "setpoint": 18 }))).ends_with("2156"));
        assert!(set_status(&parse(json!({ "setpoint": 23.5 }))).ends_with("382a"));
        assert!(set_status(&parse(json!({ "setpoint": 64, "temperatureUnit": "fahrenheit" }))).ends_with("1360"));
        assert_eq!(
            "aa24ac00000000000302404217000000003000000400000000000000000000000000000a54",
            set_status(&parse(json!({ "setpoint": 74, "temperatureUnit": "fahrenheit" })))
        );
    }

    #[test]
    fn setpoint_out_of_range_test() {
        for (value, unit, message) in [
            (13.0, "celcius", "The setpoint must be between 16 - 31°C"),
            (34.0, "celcius", "The setpoint must be between 16 - 31°C"),
            (13.0, "fahrenheit", "The setpoint must be between 60 - 87°F"),
            (90.0, "fahrenheit", "The setpoint must be between 60 - 87°F"),
        ] {
            let settings = parse(json!({ "setpoint": value, "temperatureUnit": unit }));
            let err = SetStatusCommand::build(&Status::default(), &settings, None).unwrap_err();
            assert_eq!(crate::ErrorKind::Validation, err.kind());
            assert_eq!(message, err.to_string());
        }
    }

    #[test]
    fn setpoint_uses_cached_unit_test() {
        let cached = Status { temperature_unit: TemperatureUnit::Fahrenheit, setpoint: 75.0, ..Default::default() };
        assert!(SetStatusCommand::build(&cached, &[Setting::Setpoint(80.0)], None).is_ok());
        assert!(SetStatusCommand::build(&cached, &[Setting::Setpoint(24.0)], None).is_err());
    }

    #[test]
    fn misc_flags_test() {
        assert!(set_status(&parse(json!({ "sleepModeActive": true }))).ends_with("9cdc"));
        assert!(set_status(&parse(json!({ "temperatureUnit": "fahrenheit" }))).ends_with("2e47"));
        assert!(set_status(&parse(json!({ "turboModeActive": true }))).ends_with("98bf"));
    }

    #[test]
    fn invalid_properties_test() {
        let err = Setting::parse("swingMode", &json!(true)).unwrap_err();
        assert_eq!("Unsupported property to be set (swingMode)", err.to_string());

        assert!(Setting::parse("mode", &json!("turbo")).is_err());
        assert!(Setting::parse("fanSpeed", &json!("fixed")).is_err());
        assert!(Setting::parse("fanSpeed", &json!(101)).is_err());
        assert_eq!(Setting::FanSpeed(FanSpeed::Percent(55)), Setting::parse("fanSpeed", &json!(55)).unwrap());
        assert!(Setting::parse("temperatureUnit", &json!("kelvin")).is_err());
        // non-boolean flags count as off
        assert_eq!(Setting::PowerOn(false), Setting::parse("powerOn", &json!("yes")).unwrap());
    }

    #[test]
    fn first_invalid_property_in_request_order_test() {
        let props = json!({ "setpoint": "hot", "mode": "turbo" });
        let err = Setting::parse_all(props.as_object().unwrap()).unwrap_err();
        assert_eq!("The setpoint must be a number", err.to_string());

        let settings = parse(json!({ "powerOn": true, "mode": "cool", "beep": false }));
        assert_eq!(
            vec![Setting::PowerOn(true), Setting::Mode(Mode::Cool), Setting::Beep(false)],
            settings
        );
    }

    #[test]
    fn message_id_test() {
        let command = SetStatusCommand::build(&Status::default(), &[], Some(7)).unwrap();
        let mut payload = [0u8; 25];
        assert_eq!(7, command.encode(&mut payload).unwrap()[23]);

        let command = SetStatusCommand::build(&Status::default(), &[], None).unwrap();
        assert_eq!(0, command.encode(&mut payload).unwrap()[23]);
    }

    #[test]
    fn encode_then_decode_test() {
        let settings = parse(json!({
            "powerOn": true,
            "mode": "heat",
            "setpoint": 22.5,
            "fanSpeed": "medium",
            "verticalSwingActive": true,
            "turboModeActive": true,
            "sleepModeActive": true,
        }));
        let command = SetStatusCommand::build(&Status::default(), &settings, None).unwrap();

        // answer with the same bytes behind a status tag
        let mut payload = [0u8; 25];
        command.encode(&mut payload).unwrap();
        payload[0] = 0xc0;
        let status = Status::parse(&payload, StatusRevision::Modern).unwrap();

        assert!(status.power_on);
        assert_eq!(Mode::Heat, status.mode);
        assert_eq!(22.5, status.setpoint);
        assert_eq!(FanSpeed::Medium, status.fan_speed);
        assert!(status.vertical_swing && !status.horizontal_swing);
        assert!(status.turbo && status.strong);
        assert!(status.sleep);
    }

    #[test]
    fn timer_round_trip_test() {
        let cached = Status {
            on_timer: Timer { active: true, hours: 5, minutes: 20 },
            off_timer: Timer { active: true, hours: 0, minutes: 45 },
            ..Default::default()
        };
        let command = SetStatusCommand::build(&cached, &[], None).unwrap();
        let mut payload = [0u8; 25];
        command.encode(&mut payload).unwrap();
        payload[0] = 0xc0;
        let status = Status::parse(&payload, StatusRevision::Modern).unwrap();
        assert_eq!(cached.on_timer, status.on_timer);
        assert_eq!(cached.off_timer, status.off_timer);
    }
}
