//! Appliance frames as relayed by the cloud: a `0x5A5A` header, the frame and
//! 16 zero bytes, written out as comma separated signed decimals and
//! AES-128-ECB encrypted with the key hidden in the access token.

use bytes::Bytes;
use chrono::NaiveDateTime;
use tracing::{error, trace};

use crate::crypto::{aes128_ecb_decrypt, aes128_ecb_encrypt, md5, strip_padding};
use crate::error::{Error, Result};
use crate::transport::legacy::{write_header, HEADER_LEN};

const TRAILER_LEN: usize = 16;
const CLOUD_MARKER: u8 = 0x0a;

/// Recovers the data key from an access token. The token is encrypted with
/// the first 16 hex digits of `md5(app_key)`, used as ASCII.
pub fn data_key(app_key: &str, access_token: &str) -> Result<[u8; 16]> {
    let digest = hex::encode(md5(&[app_key.as_bytes()]));
    let mut token_key = [0u8; 16];
    token_key.copy_from_slice(&digest.as_bytes()[..16]);

    let mut key = aes128_ecb_decrypt(&token_key, &hex::decode(access_token)?)?;
    strip_padding(&mut key);
    <[u8; 16]>::try_from(key.as_slice())
        .map_err(|_| Error::Authentication(format!("access token holds a {} byte key", key.len())))
}

fn comma_decimal(packet: &[u8]) -> String {
    packet.iter().map(|b| (*b as i8).to_string()).collect::<Vec<_>>().join(",")
}

/// Builds the hex `order` parameter carrying `frame` to `device_id`.
pub fn encode_order(key: &[u8; 16], frame: &[u8], device_id: u64, at: NaiveDateTime) -> String {
    let total = HEADER_LEN + frame.len() + TRAILER_LEN;
    let mut packet = vec![0u8; total];
    write_header(&mut packet, total, at, device_id);
    packet[26] = CLOUD_MARKER;
    packet[HEADER_LEN..HEADER_LEN + frame.len()].copy_from_slice(frame);
    trace!("cloud packet {}", hex::encode(&packet));

    hex::encode(aes128_ecb_encrypt(key, comma_decimal(&packet).as_bytes()))
}

/// Decrypts a `reply` and cuts the appliance frame out of it.
pub fn decode_reply(key: &[u8; 16], reply: &str) -> Result<Bytes> {
    let mut text = aes128_ecb_decrypt(key, &hex::decode(reply)?)?;
    strip_padding(&mut text);
    let text = String::from_utf8(text).map_err(|_| Error::Protocol("reply is not text".into()))?;

    let packet = text
        .split(',')
        .map(|v| v.trim().parse::<i32>().map(|n| (n & 0xff) as u8))
        .collect::<core::result::Result<Vec<u8>, _>>()
        .map_err(|e| Error::Protocol(format!("malformed reply ({})", e)))?;
    trace!("cloud reply {}", hex::encode(&packet));

    if packet.len() <= HEADER_LEN + 1 {
        error!("reply of {} bytes carries no frame", packet.len());
        return Err(Error::Protocol("reply too short".into()));
    }
    let end = HEADER_LEN + usize::from(packet[HEADER_LEN + 1]) + 1;
    if packet.len() < end {
        return Err(Error::Protocol(format!("reply truncated at {} of {} bytes", packet.len(), end)));
    }
    Ok(Bytes::copy_from_slice(&packet[HEADER_LEN..end]))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::NaiveDate;

    pub const ACCESS_TOKEN: &str = "394edb4eb7c40310f5cb58526f519b54b920ebb829d567559397ded751813801";
    pub const C0_REPLY: &str = "5e35139afd9171ee4eff428d09d7fafd84d235caf2c7ea362163204e521064a53a529db3fc9e58ebb7736da8625e7bbdaab0e99e84cb27554b916fe8b916cd5d924bca2c4187441cde1ca19e56b56a66fae3d6919dd3904aabfc19aa2acf42d02e4ab71a694bbd6898702b8065401582e92a0c3b92add1e19ce9497a7acc15bcc950c2074f3e088cadbad649d60e742294cae31309076cbdab7c0dc69cf00e89c2c5a22151bd945807177507a990d2ed20354ec1e5db30c0928dd6e944852cff7f6fb5e41c9e24b9eed1797d29ee448604e2e8dea201fe8c5b32d5e6bf6ab973";
    pub const B5_REPLY: &str = "d6da8a9acfaa8616c6f46ee94cdcd2c884d235caf2c7ea362163204e521064a53a529db3fc9e58ebb7736da8625e7bbdaab0e99e84cb27554b916fe8b916cd5d924bca2c4187441cde1ca19e56b56a662ce3444af7d54753f914deceffb5a292d4e058b53a39a5279ba90d01e86f38af16c58b320502c99b7d9bde861d1cdac88d48b8b9c8ad601d45f6722168749d7c2b64833822067697368eae2e212d2462be898536b65f5f3c2886d3c03c29b522699138e726bba889c89b124850490510924bca2c4187441cde1ca19e56b56a66924bca2c4187441cde1ca19e56b56a668bceb2fa05d048bda9992dcf5e214693";

    pub fn key() -> [u8; 16] {
        data_key(crate::config::DEFAULT_APP_KEY, ACCESS_TOKEN).unwrap()
    }

    #[test]
    fn data_key_test() {
        assert_eq!(*b"b594f30e074641ea", key());
        assert!(data_key(crate::config::DEFAULT_APP_KEY, "00").is_err());
        assert!(data_key(crate::config::DEFAULT_APP_KEY, "zz").is_err());
    }

    #[test]
    fn encode_order_test() {
        let at = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap().and_hms_milli_opt(14, 7, 9, 300).unwrap();
        let frame = hex::decode("aa0fac00000000000303b50101012166").unwrap();
        assert_eq!(
            "53e973334953a3c10e69501e620d622cc4bbe3e8670ccfca9c21f1d640250b88328dcb1a35d8c48d950a538abf4bcf34b60de7afb123cf903ec52550f9f96f18b331ec71b38626b492b996077a1292377f6fb5e41c9e24b9eed1797d29ee448618fe8bf84d952fecd48145a11d4b456b77f84b02cbf335a186f585fbb89609c95f5a7e251ab4e6f3904f66f6f5bd3b027f6fb5e41c9e24b9eed1797d29ee44866ac0ce2a1da1b9be5a806b4b3c65b033",
            encode_order(&key(), &frame, 33029023878494, at)
        );
    }

    #[test]
    fn comma_decimal_test() {
        assert_eq!("90,90,-86,0,-1", comma_decimal(&[0x5a, 0x5a, 0xaa, 0x00, 0xff]));
    }

    #[test]
    fn decode_reply_test() {
        let status = decode_reply(&key(), C0_REPLY).unwrap();
        assert_eq!(0xaa, status[0]);
        assert_eq!(0x23, status.len());
        assert_eq!(0xc0, status[10]);
        assert!(crate::protocol::Frame::parse(&status).is_ok());

        let capabilities = decode_reply(&key(), B5_REPLY).unwrap();
        assert_eq!(0x2a, capabilities.len());
        assert_eq!(0xb5, capabilities[10]);
        assert!(crate::protocol::Frame::parse(&capabilities).is_ok());
    }

    #[test]
    fn decode_reply_rejects_garbage_test() {
        let key = key();
        assert!(decode_reply(&key, "0011").is_err());
        let short = hex::encode(aes128_ecb_encrypt(&key, b"90,90,1"));
        assert_eq!(crate::ErrorKind::Protocol, decode_reply(&key, &short).unwrap_err().kind());
    }
}
