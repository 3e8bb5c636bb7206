use tracing::error;

pub const POWER_TAG: u8 = 0xc1;
const BCD_OFFSET: usize = 16;

/// Power usage from a `0xC1` payload: bytes 16..=18 hold six BCD digits,
/// most significant byte first, in units of 1/10000.
pub fn parse_power_usage(payload: &[u8]) -> Option<f64> {
    if payload.first() != Some(&POWER_TAG) || payload.len() < BCD_OFFSET + 3 {
        error!("parse_power_usage: malformed payload {}", hex::encode(payload));
        return None;
    }

    let value = payload[BCD_OFFSET..BCD_OFFSET + 3]
        .iter()
        .fold(0u32, |acc, b| acc * 100 + u32::from(b >> 4) * 10 + u32::from(b & 0x0f));

    Some(f64::from(value) / 10000.0)
}
