//! Decoder for the `0xC0` status response.
//!
//! Offsets below index the frame payload, whose byte 0 is the `0xC0` tag.

use tracing::{error, trace};

use super::types::*;

pub const STATUS_TAG: u8 = 0xc0;
const MIN_PAYLOAD_LEN: usize = 22;

/// Which bit reports the sleep mode. Older firmware sets byte 9 bit 6,
/// newer firmware byte 10 bit 0.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusRevision {
    #[default]
    Modern,
    Legacy,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Status {
    pub in_error: bool,
    pub fast_check: bool,
    /// `true` for absolute timers, `false` for relative.
    pub timer_mode: bool,
    pub resume: bool,
    pub power_on: bool,

    pub setpoint: f64,
    pub mode: Mode,
    pub fan_speed: FanSpeed,
    pub on_timer: Timer,
    pub off_timer: Timer,

    pub vertical_swing: bool,
    pub horizontal_swing: bool,

    pub personal_feeling: bool,
    pub wise_eye: bool,
    pub strong: bool,
    pub low_frequency_fan: bool,
    pub power_save: bool,
    pub alarm_sleep: bool,
    pub cosy_sleep: u8,

    pub self_personal_feeling: bool,
    pub self_cosy_sleep: bool,
    pub purifying: bool,
    pub eco: bool,
    pub ptc_heater: bool,
    pub dry_clean: bool,
    pub natural_wind: bool,
    pub child_sleep: bool,

    pub cool_wind: bool,
    pub peak_valley: bool,
    pub catch_cold: bool,
    pub night_light: bool,
    pub ventilation: bool,
    pub temperature_unit: TemperatureUnit,
    pub turbo: bool,
    /// Byte 10 bit 0, whatever the revision.
    pub sleep_flag: bool,
    /// Sleep mode as reported by the configured [`StatusRevision`].
    pub sleep: bool,

    pub indoor_temperature: f64,
    pub outdoor_temperature: f64,

    pub dust_full: bool,
    pub setting_temperature2: u8,
    pub pmv_mode: u8,
    pub light_class: u8,
    pub error_code: u8,
    pub eco_sleep_minutes: u8,
    pub eco_sleep_seconds: u8,
    pub eco_sleep_hours: u8,
    pub humidity_setpoint: u8,
    pub down_wind: bool,
    pub down_wind_lr: bool,
    pub frost_protection: bool,
    pub dual_control: bool,

    pub extended: Option<ExtendedStatus>,
}

/// Flags from byte 22, only sent by appliances with a longer status payload.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ExtendedStatus {
    pub wind_blowing: bool,
    pub bracelet_home_away: bool,
    pub bracelet_sleep: bool,
    pub keep_warm: bool,
}

fn bit(byte: u8, mask: u8) -> bool {
    byte & mask != 0
}

/// Replaces the half-degree fraction with the tenths carried separately,
/// keeping the sign of the coarse reading.
fn refine(coarse: f64, tenths: u8) -> f64 {
    if tenths == 0 {
        return coarse;
    }
    let whole = coarse.trunc();
    let sign = if coarse < 0.0 { -1.0 } else { 1.0 };
    whole + sign * f64::from(tenths) / 10.0
}

impl Status {
    /// Decodes a status payload. Short payloads are logged and yield `None`.
    pub fn parse(payload: &[u8], revision: StatusRevision) -> Option<Self> {
        trace!("Status::parse: {}", hex::encode(payload));

        if payload.len() < MIN_PAYLOAD_LEN {
            error!("Status::parse: payload too short ({} bytes)", payload.len());
            return None;
        }
        if payload[0] != STATUS_TAG {
            error!("Status::parse: unexpected response tag {:#04x}", payload[0]);
            return None;
        }

        let d = payload;
        let mut status = Status {
            in_error: bit(d[1], 0x80),
            fast_check: bit(d[1], 0x20),
            timer_mode: bit(d[1], 0x10),
            resume: bit(d[1], 0x04),
            power_on: bit(d[1], 0x01),

            setpoint: f64::from(d[2] & 0x0f) + 16.0 + if bit(d[2], 0x10) { 0.5 } else { 0.0 },
            mode: Mode::from((d[2] & 0xe0) >> 5),
            fan_speed: FanSpeed::from_raw(d[3]),
            on_timer: Timer::decode(d[4], (d[6] & 0xf0) >> 4),
            off_timer: Timer::decode(d[5], d[6] & 0x0f),

            vertical_swing: bit(d[7], 0x03),
            horizontal_swing: bit(d[7], 0x0c),

            personal_feeling: bit(d[8], 0x80),
            wise_eye: bit(d[8], 0x40),
            strong: bit(d[8], 0x20),
            low_frequency_fan: bit(d[8], 0x10),
            power_save: bit(d[8], 0x08),
            alarm_sleep: bit(d[8], 0x04),
            cosy_sleep: d[8] & 0x03,

            self_personal_feeling: bit(d[9], 0x80),
            self_cosy_sleep: bit(d[9], 0x40),
            purifying: bit(d[9], 0x20),
            eco: bit(d[9], 0x10),
            ptc_heater: bit(d[9], 0x08),
            dry_clean: bit(d[9], 0x04),
            natural_wind: bit(d[9], 0x02),
            child_sleep: bit(d[9], 0x01),

            cool_wind: bit(d[10], 0x80),
            peak_valley: bit(d[10], 0x40),
            catch_cold: bit(d[10], 0x20),
            night_light: bit(d[10], 0x10),
            ventilation: bit(d[10], 0x08),
            temperature_unit: if bit(d[10], 0x04) {
                TemperatureUnit::Fahrenheit
            } else {
                TemperatureUnit::Celsius
            },
            turbo: bit(d[10], 0x02),
            sleep_flag: bit(d[10], 0x01),
            sleep: false,

            indoor_temperature: refine((f64::from(d[11]) - 50.0) / 2.0, d[15] & 0x0f),
            outdoor_temperature: refine((f64::from(d[12]) - 50.0) / 2.0, (d[15] & 0xf0) >> 4),

            dust_full: bit(d[13], 0x20),
            setting_temperature2: d[13] & 0x1f,
            pmv_mode: d[14] & 0x0f,
            light_class: (d[14] & 0x70) >> 4,
            error_code: d[16],
            eco_sleep_minutes: (d[17] & 0xf4) >> 3,
            eco_sleep_seconds: ((d[18] & 0xf0) >> 2) | (d[17] & 0x02),
            eco_sleep_hours: d[18] & 0x0f,
            humidity_setpoint: d[19] & 0x7f,
            down_wind: bit(d[19], 0x80),
            down_wind_lr: bit(d[20], 0x80),
            frost_protection: bit(d[21], 0x80),
            dual_control: bit(d[21], 0x40),

            extended: None,
        };

        status.sleep = match revision {
            StatusRevision::Modern => status.sleep_flag,
            StatusRevision::Legacy => status.self_cosy_sleep,
        };

        if d.len() > MIN_PAYLOAD_LEN {
            status.extended = Some(ExtendedStatus {
                wind_blowing: bit(d[22], 0x10),
                bracelet_home_away: bit(d[22], 0x04),
                bracelet_sleep: bit(d[22], 0x02),
                keep_warm: bit(d[22], 0x01),
            });
        }

        if status.temperature_unit == TemperatureUnit::Fahrenheit {
            status.setpoint = celsius_to_fahrenheit(status.setpoint);
            status.indoor_temperature = celsius_to_fahrenheit(status.indoor_temperature);
            status.outdoor_temperature = celsius_to_fahrenheit(status.outdoor_temperature);
        }

        Some(status)
    }

    /// Setpoint in Celsius, whatever unit the appliance reports in.
    pub fn setpoint_celsius(&self) -> f64 {
        match self.temperature_unit {
            TemperatureUnit::Celsius => self.setpoint,
            TemperatureUnit::Fahrenheit => fahrenheit_to_celsius(self.setpoint),
        }
    }

    pub fn to_properties(&self) -> Properties {
        let mut p = Properties::new();

        p.insert("inError", self.in_error.into());
        p.insert("fastCheckActive", self.fast_check.into());
        p.insert(
            "timerMode",
            Value::Enum {
                value: self.timer_mode as u8,
                description: if self.timer_mode { "absolute" } else { "relative" },
            },
        );
        p.insert("resumeActive", self.resume.into());
        p.insert("powerOn", self.power_on.into());
        p.insert("setpoint", self.setpoint.into());
        p.insert("mode", self.mode.into());
        p.insert("fanSpeed", self.fan_speed.into());

        p.insert("onTimerActive", self.on_timer.active.into());
        p.insert("onTimerHours", self.on_timer.hours.into());
        p.insert("onTimerMinutes", self.on_timer.minutes.into());
        p.insert("offTimerActive", self.off_timer.active.into());
        p.insert("offTimerHours", self.off_timer.hours.into());
        p.insert("offTimerMinutes", self.off_timer.minutes.into());

        p.insert("verticalSwingActive", self.vertical_swing.into());
        p.insert("horizontalSwingActive", self.horizontal_swing.into());

        p.insert("personalFeeling", self.personal_feeling.into());
        p.insert("wiseEye", self.wise_eye.into());
        p.insert("strong", self.strong.into());
        p.insert("lowFrequencyFan", self.low_frequency_fan.into());
        p.insert("powerSave", self.power_save.into());
        p.insert("alarmSleep", self.alarm_sleep.into());
        p.insert(
            "cosySleepMode",
            Value::Enum {
                value: self.cosy_sleep,
                description: ["no sleep", "sleep 1", "sleep 2", "sleep 3"][(self.cosy_sleep & 0x03) as usize],
            },
        );

        p.insert("selfPersonalFeeling", self.self_personal_feeling.into());
        p.insert("selfCosySleep", self.self_cosy_sleep.into());
        p.insert("purifyingModeActive", self.purifying.into());
        p.insert("ecoModeActive", self.eco.into());
        p.insert("ptcHeaterActive", self.ptc_heater.into());
        p.insert("dryClean", self.dry_clean.into());
        p.insert("naturalWindModeActive", self.natural_wind.into());
        p.insert("childSleepMode", self.child_sleep.into());

        p.insert("coolWindMode", self.cool_wind.into());
        p.insert("peakValleyMode", self.peak_valley.into());
        p.insert("catchCold", self.catch_cold.into());
        p.insert("nightLight", self.night_light.into());
        p.insert("ventilation", self.ventilation.into());
        p.insert("temperatureUnit", self.temperature_unit.into());
        p.insert("turboModeActive", self.turbo.into());
        p.insert("sleepModeActive", self.sleep.into());

        p.insert("indoorTemperature", self.indoor_temperature.into());
        p.insert("outdoorTemperature", self.outdoor_temperature.into());

        p.insert("dustFull", self.dust_full.into());
        p.insert("settingTemperature2", self.setting_temperature2.into());
        p.insert("pmvMode", self.pmv_mode.into());
        p.insert("lightClass", self.light_class.into());
        p.insert("errorCode", self.error_code.into());
        p.insert("ecoSleepRunningMinutes", self.eco_sleep_minutes.into());
        p.insert("ecoSleepRunningSeconds", self.eco_sleep_seconds.into());
        p.insert("ecoSleepRunningHours", self.eco_sleep_hours.into());
        p.insert("humiditySetpoint", self.humidity_setpoint.into());
        p.insert("downWindControl", self.down_wind.into());
        p.insert("downWindControlLR", self.down_wind_lr.into());
        p.insert("frostProtectionModeActive", self.frost_protection.into());
        p.insert("dualControl", self.dual_control.into());

        if let Some(ext) = self.extended {
            p.insert("windBlowing", ext.wind_blowing.into());
            p.insert("braceletHomeAwayMode", ext.bracelet_home_away.into());
            p.insert("braceletSleepMode", ext.bracelet_sleep.into());
            p.insert("keepWarm", ext.keep_warm.into());
        }

        p
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Frame;

    fn payload(frame_hex: &str) -> Vec<u8> {
        let data = hex::decode(frame_hex.replace(' ', "")).unwrap();
        let (frame, _) = Frame::parse(&data).unwrap();
        frame.payload.to_vec()
    }

    const STATUS_COOL: &str = "aa22ac00000000000303c00048667f7f0030000000675300000000000000000040a5f1";
    const STATUS_HEAT_20: &str =
        "aa22ac00000000000302c00044667f7f00300000005f59000000000000000000003aa3";

    #[test]
    fn parse_test() {
        let status = Status::parse(&payload(STATUS_COOL), StatusRevision::Modern).unwrap();
        assert!(!status.power_on);
        assert_eq!(Mode::Cool, status.mode);
        assert_eq!(24.0, status.setpoint);
        assert_eq!(FanSpeed::Auto, status.fan_speed);
        assert_eq!(26.5, status.indoor_temperature);
        assert_eq!(16.5, status.outdoor_temperature);
        assert!(!status.on_timer.active);
        assert!(!status.vertical_swing);
        assert_eq!(TemperatureUnit::Celsius, status.temperature_unit);
        assert_eq!(Some(ExtendedStatus::default()), status.extended);
    }

    #[test]
    fn parse_second_fixture_test() {
        let status = Status::parse(&payload(STATUS_HEAT_20), StatusRevision::Modern).unwrap();
        assert_eq!(20.0, status.setpoint);
        assert_eq!(Mode::Cool, status.mode);
        assert_eq!(22.5, status.indoor_temperature);
        assert_eq!(19.5, status.outdoor_temperature);
    }

    #[test]
    fn short_payload_test() {
        assert_eq!(None, Status::parse(&[0xc0, 0x01, 0x02], StatusRevision::Modern));
        assert_eq!(None, Status::parse(&[], StatusRevision::Modern));
    }

    #[test]
    fn wrong_tag_test() {
        let mut data = payload(STATUS_COOL);
        data[0] = 0xc1;
        assert_eq!(None, Status::parse(&data, StatusRevision::Modern));
    }

    #[test]
    fn sleep_revision_test() {
        let mut data = payload(STATUS_COOL);
        data[9] |= 0x40;

        let modern = Status::parse(&data, StatusRevision::Modern).unwrap();
        assert!(!modern.sleep);
        assert!(modern.self_cosy_sleep);

        let legacy = Status::parse(&data, StatusRevision::Legacy).unwrap();
        assert!(legacy.sleep);

        data[10] |= 0x01;
        let modern = Status::parse(&data, StatusRevision::Modern).unwrap();
        assert!(modern.sleep);
        assert!(modern.sleep_flag);
    }

    #[test]
    fn fahrenheit_test() {
        let mut data = payload(STATUS_COOL);
        data[10] |= 0x04;
        let status = Status::parse(&data, StatusRevision::Modern).unwrap();
        assert_eq!(TemperatureUnit::Fahrenheit, status.temperature_unit);
        assert_eq!(75.0, status.setpoint);
        assert_eq!(80.0, status.indoor_temperature);
        assert_eq!(62.0, status.outdoor_temperature);
        assert_eq!(24.0, status.setpoint_celsius());
    }

    #[test]
    fn tenths_refinement_test() {
        let mut data = payload(STATUS_COOL);
        // indoor 26.5 refined to 26.3, outdoor 16.5 to 16.8
        data[15] = 0x83;
        let status = Status::parse(&data, StatusRevision::Modern).unwrap();
        assert!((status.indoor_temperature - 26.3).abs() < 1e-9);
        assert!((status.outdoor_temperature - 16.8).abs() < 1e-9);

        // below zero the tenths keep the sign
        data[12] = 40;
        data[15] = 0x20;
        let status = Status::parse(&data, StatusRevision::Modern).unwrap();
        assert!((status.outdoor_temperature + 5.2).abs() < 1e-9);
    }

    #[test]
    fn timers_test() {
        let mut data = payload(STATUS_COOL);
        data[4] = 0x80 | (3 << 2) | 2;
        data[5] = 0x80 | (1 << 2) | 3;
        data[6] = 0x50;
        let status = Status::parse(&data, StatusRevision::Modern).unwrap();
        assert_eq!(Timer { active: true, hours: 3, minutes: 40 }, status.on_timer);
        assert_eq!(Timer { active: true, hours: 2, minutes: 0 }, status.off_timer);
    }

    #[test]
    fn extended_byte_test() {
        let mut data = payload(STATUS_COOL);
        data[22] = 0x11;
        let status = Status::parse(&data, StatusRevision::Modern).unwrap();
        assert_eq!(
            Some(ExtendedStatus { wind_blowing: true, keep_warm: true, ..Default::default() }),
            status.extended
        );

        data.truncate(22);
        let status = Status::parse(&data, StatusRevision::Modern).unwrap();
        assert_eq!(None, status.extended);
        assert_eq!(54, status.to_properties().len());
    }

    #[test]
    fn properties_test() {
        let status = Status::parse(&payload(STATUS_COOL), StatusRevision::Modern).unwrap();
        let props = status.to_properties();
        assert_eq!(58, props.len());
        assert_eq!(Some(&Value::Bool(false)), props.get("powerOn"));
        assert_eq!(Some(&Value::Enum { value: 2, description: "cool" }), props.get("mode"));
        assert_eq!(Some(&Value::Number(24.0)), props.get("setpoint"));
    }
}
