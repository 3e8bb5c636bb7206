//! Decoder for the paged `0xB5` capability response.
//!
//! The payload is `B5 count (tag subtag len value...)* [pending]`: `count`
//! records follow, and an optional trailing byte tells how many pages are
//! still waiting to be requested.

use serde::Serialize;
use tracing::{error, trace, warn};

pub const CAPABILITIES_TAG: u8 = 0xb5;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub auto_mode: bool,
    pub auto_adjust_down_temp: f64,
    pub auto_adjust_up_temp: f64,
    pub cool_mode: bool,
    pub cool_adjust_down_temp: f64,
    pub cool_adjust_up_temp: f64,
    pub dry_mode: bool,
    pub eco_mode: bool,
    pub frost_protection_mode: bool,
    pub electric_aux_heating: bool,
    pub has_auto_clear_humidity: bool,
    pub has_avoid_people: bool,
    pub has_blowing_people: bool,
    pub has_breeze: bool,
    pub has_hand_clear_humidity: bool,
    pub has_no_wind_feel: bool,
    pub has_no_wind_speed: bool,
    pub has_self_clean: bool,
    pub heat_mode: bool,
    pub heat_adjust_down_temp: f64,
    pub heat_adjust_up_temp: f64,
    pub horizontal_swing_mode: bool,
    /// Whether setpoints accept a decimal part.
    pub is_have_point: bool,
    pub left_num: u8,
    pub light_type: u8,
    pub mutil_temp: bool,
    pub nest_check: bool,
    pub nest_need_change: bool,
    pub power_cal: bool,
    pub power_cal_setting: bool,
    pub selfcheck: bool,
    pub special_eco: bool,
    pub strong_cool_mode: bool,
    pub strong_heat_mode: bool,
    /// Reported once a `0x1A` record was decoded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strong_cool: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strong_heat: Option<bool>,
    pub unit_changeable: bool,
    pub vertical_swing_mode: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            auto_mode: true,
            auto_adjust_down_temp: 17.0,
            auto_adjust_up_temp: 30.0,
            cool_mode: true,
            cool_adjust_down_temp: 17.0,
            cool_adjust_up_temp: 30.0,
            dry_mode: true,
            eco_mode: false,
            frost_protection_mode: false,
            electric_aux_heating: false,
            has_auto_clear_humidity: false,
            has_avoid_people: false,
            has_blowing_people: false,
            has_breeze: false,
            has_hand_clear_humidity: false,
            has_no_wind_feel: false,
            has_no_wind_speed: false,
            has_self_clean: false,
            heat_mode: true,
            heat_adjust_down_temp: 17.0,
            heat_adjust_up_temp: 30.0,
            horizontal_swing_mode: false,
            is_have_point: false,
            left_num: 0,
            light_type: 0,
            mutil_temp: true,
            nest_check: true,
            nest_need_change: true,
            power_cal: false,
            power_cal_setting: false,
            selfcheck: true,
            special_eco: false,
            strong_cool_mode: true,
            strong_heat_mode: false,
            strong_cool: None,
            strong_heat: None,
            unit_changeable: true,
            vertical_swing_mode: true,
        }
    }
}

/// One tag/subtag/value record.
#[derive(Debug, Eq, PartialEq)]
pub struct Record<'a> {
    pub tag: u8,
    pub subtag: u8,
    pub value: &'a [u8],
}

/// Records of one capability page plus the number of pages still pending.
#[derive(Debug, Eq, PartialEq)]
pub struct CapabilityPage<'a> {
    pub records: Vec<Record<'a>>,
    pub pending: u8,
}

impl<'a> CapabilityPage<'a> {
    /// Splits a `0xB5` payload into records. A record running past the end of
    /// the payload stops the walk; what was read so far is kept.
    pub fn parse(payload: &'a [u8]) -> Option<Self> {
        trace!("CapabilityPage::parse: {}", hex::encode(payload));

        if payload.len() < 2 || payload[0] != CAPABILITIES_TAG {
            error!("CapabilityPage::parse: not a capability payload ({} bytes)", payload.len());
            return None;
        }

        let mut remaining = payload[1];
        let mut i = 2;
        let mut records = Vec::with_capacity(remaining as usize);

        while remaining > 0 && i + 3 <= payload.len() {
            let len = payload[i + 2] as usize;
            let end = i + 3 + len;
            if end > payload.len() {
                warn!("CapabilityPage::parse: record {:#04x} truncated", payload[i]);
                i = payload.len();
                break;
            }
            records.push(Record { tag: payload[i], subtag: payload[i + 1], value: &payload[i + 3..end] });
            i = end;
            remaining -= 1;
        }

        let pending = payload.get(i).copied().unwrap_or(0);
        Some(Self { records, pending })
    }
}

impl Capabilities {
    /// Folds one page into the accumulated set and returns the number of
    /// pages still pending, or `None` when the payload is not a capability page.
    pub fn merge_page(&mut self, payload: &[u8]) -> Option<u8> {
        let page = CapabilityPage::parse(payload)?;
        Some(self.merge(&page))
    }

    pub fn merge(&mut self, page: &CapabilityPage) -> u8 {
        for record in &page.records {
            self.apply(record);
        }
        page.pending
    }

    fn apply(&mut self, record: &Record) {
        let value = match record.value.first() {
            Some(v) => *v,
            None => return,
        };
        trace!("Capabilities::apply: tag={:#04x} subtag={:#04x} value={}", record.tag, record.subtag, value);

        match (record.subtag, record.tag) {
            (0x00, 0x18) => self.has_no_wind_feel = value > 0,
            (0x00, 0x32) => self.has_blowing_people = value > 0,
            (0x00, 0x33) => self.has_avoid_people = value > 0,
            (0x00, 0x39) => self.has_self_clean = value > 0,
            (0x00, 0x43) => self.has_breeze = value > 0,

            (0x02, 0x10) => self.has_no_wind_speed = value > 0,
            (0x02, 0x12) => {
                self.eco_mode = value == 1;
                self.special_eco = value == 2;
            }
            (0x02, 0x13) => self.frost_protection_mode = value == 1,
            (0x02, 0x14) => {
                let (cool, heat, dry, auto) = match value {
                    0 => (true, false, true, true),
                    1 => (true, true, true, true),
                    2 => (false, true, false, true),
                    3 => (true, false, false, false),
                    _ => return,
                };
                self.cool_mode = cool;
                self.heat_mode = heat;
                self.dry_mode = dry;
                self.auto_mode = auto;
            }
            (0x02, 0x15) => {
                let (vertical, horizontal) = match value {
                    0 => (false, true),
                    1 => (true, true),
                    2 => (false, false),
                    3 => (true, false),
                    _ => return,
                };
                self.vertical_swing_mode = vertical;
                self.horizontal_swing_mode = horizontal;
            }
            (0x02, 0x16) => {
                let (cal, setting) = match value {
                    0 | 1 => (false, false),
                    2 => (true, false),
                    3 => (true, true),
                    _ => return,
                };
                self.power_cal = cal;
                self.power_cal_setting = setting;
            }
            (0x02, 0x17) => {
                let (check, change) = match value {
                    0 => (false, false),
                    1 | 2 => (true, false),
                    3 => (false, true),
                    4 => (true, true),
                    _ => return,
                };
                self.nest_check = check;
                self.nest_need_change = change;
            }
            (0x02, 0x19) => self.electric_aux_heating = value == 1,
            (0x02, 0x1a) => {
                let (heat, cool) = match value {
                    0 => (false, true),
                    1 => (true, true),
                    2 => (false, false),
                    3 => (true, false),
                    _ => return,
                };
                self.strong_heat_mode = heat;
                self.strong_cool_mode = cool;
                self.strong_heat = Some(heat);
                self.strong_cool = Some(cool);
            }
            (0x02, 0x1f) => {
                let (auto, hand) = match value {
                    0 => (false, false),
                    1 => (true, false),
                    2 => (true, true),
                    3 => (false, true),
                    _ => return,
                };
                self.has_auto_clear_humidity = auto;
                self.has_hand_clear_humidity = hand;
            }
            (0x02, 0x22) => self.unit_changeable = value == 0,
            (0x02, 0x24) => self.light_type = value,
            (0x02, 0x25) => {
                let v = record.value;
                if v.len() < 6 {
                    warn!("Capabilities::apply: short temperature record ({} bytes)", v.len());
                    return;
                }
                self.cool_adjust_down_temp = f64::from(v[0]) / 2.0;
                self.cool_adjust_up_temp = f64::from(v[1]) / 2.0;
                self.auto_adjust_down_temp = f64::from(v[2]) / 2.0;
                self.auto_adjust_up_temp = f64::from(v[3]) / 2.0;
                self.heat_adjust_down_temp = f64::from(v[4]) / 2.0;
                self.heat_adjust_up_temp = f64::from(v[5]) / 2.0;
                self.is_have_point = match v.get(6) {
                    Some(point) => *point != 0,
                    None => true,
                };
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Frame;

    const PAGE_ONE: &str = "aa3dac00000000000303b50a12020101180001001402010115020101160201031a020101100201011f02010025020720 3c203c203c05 4000010001 00 7980";
    const PAGE_TWO: &str = "aa29ac00000000000303b507120201001302010114020101150201011602010117020100 1a0201018c2e";

    fn payload(frame_hex: &str) -> Vec<u8> {
        let data = hex::decode(frame_hex.replace(' ', "")).unwrap();
        let (frame, _) = Frame::parse(&data).unwrap();
        frame.payload.to_vec()
    }

    #[test]
    fn page_parse_test() {
        let data = payload(PAGE_ONE);
        let page = CapabilityPage::parse(&data).unwrap();
        assert_eq!(10, page.records.len());
        assert_eq!(1, page.pending);
        assert_eq!(Record { tag: 0x25, subtag: 0x02, value: &[0x20, 0x3c, 0x20, 0x3c, 0x20, 0x3c, 0x05] }, page.records[8]);

        let data = payload(PAGE_TWO);
        let page = CapabilityPage::parse(&data).unwrap();
        assert_eq!(7, page.records.len());
        assert_eq!(0, page.pending);
    }

    #[test]
    fn merge_pages_test() {
        let mut caps = Capabilities::default();

        assert_eq!(Some(1), caps.merge_page(&payload(PAGE_ONE)));
        assert!(caps.eco_mode);
        assert!(!caps.has_no_wind_feel);
        assert!(caps.heat_mode && caps.cool_mode && caps.dry_mode && caps.auto_mode);
        assert!(caps.vertical_swing_mode && caps.horizontal_swing_mode);
        assert!(caps.power_cal && caps.power_cal_setting);
        assert!(caps.strong_heat_mode && caps.strong_cool_mode);
        assert_eq!((Some(true), Some(true)), (caps.strong_heat, caps.strong_cool));
        assert!(caps.has_no_wind_speed);
        assert!(!caps.has_auto_clear_humidity);
        assert_eq!(16.0, caps.cool_adjust_down_temp);
        assert_eq!(30.0, caps.heat_adjust_up_temp);
        assert!(caps.is_have_point);

        assert_eq!(Some(0), caps.merge_page(&payload(PAGE_TWO)));
        assert!(!caps.eco_mode);
        assert!(caps.frost_protection_mode);
        assert!(!caps.power_cal);
        assert!(!caps.nest_check && !caps.nest_need_change);
        // page one values survive page two
        assert_eq!(16.0, caps.cool_adjust_down_temp);
        assert!(caps.has_no_wind_speed);
    }

    #[test]
    fn named_capability_count_test() {
        let mut caps = Capabilities::default();
        let json = serde_json::to_value(&caps).unwrap();
        assert_eq!(36, json.as_object().unwrap().len());
        assert!(json.get("isHavePoint").is_some());
        assert!(json.get("strongCool").is_none());

        caps.merge_page(&payload(PAGE_ONE)).unwrap();
        caps.merge_page(&payload(PAGE_TWO)).unwrap();
        let json = serde_json::to_value(&caps).unwrap();
        assert_eq!(38, json.as_object().unwrap().len());
        assert_eq!(Some(&serde_json::Value::Bool(true)), json.get("strongHeat"));
    }

    #[test]
    fn truncated_record_test() {
        // count says 2 but the second record runs off the end
        let data = [0xb5, 0x02, 0x13, 0x02, 0x01, 0x01, 0x14, 0x02, 0x05, 0x01];
        let mut caps = Capabilities::default();
        assert_eq!(Some(0), caps.merge_page(&data));
        assert!(caps.frost_protection_mode);
    }

    #[test]
    fn malformed_payload_test() {
        let mut caps = Capabilities::default();
        assert_eq!(None, caps.merge_page(&[]));
        assert_eq!(None, caps.merge_page(&[0xc0, 0x01]));
        assert_eq!(Capabilities::default(), caps);
    }

    #[test]
    fn unknown_tags_ignored_test() {
        let data = [0xb5, 0x01, 0x40, 0x00, 0x01, 0x01];
        let mut caps = Capabilities::default();
        assert_eq!(Some(0), caps.merge_page(&data));
        assert_eq!(Capabilities::default(), caps);
    }
}
