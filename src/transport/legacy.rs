//! The `0x5A5A` packet layer that wraps each appliance frame inside the SK103
//! envelope.

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{Datelike, Local, NaiveDateTime, Timelike};
use tracing::error;

use crate::crypto::{aes128_ecb_decrypt_pkcs7, aes128_ecb_encrypt_pkcs7, md5};
use crate::error::{Error, Result};

pub const SIGN_KEY: &[u8] = b"xhdiwjnchekd4d512chdjx5d8e4c394D2D7S";
pub const HEADER_LEN: usize = 40;
const CHECKSUM_LEN: usize = 16;
const MESSAGE_ID_WRAP: u32 = 0x8000;

/// Packs a timestamp the way the appliance firmware expects: milliseconds
/// (low byte), seconds, minutes, hours, day, zero-based month, year % 100,
/// century.
pub fn timestamp_bytes(at: NaiveDateTime) -> [u8; 8] {
    let millis = (at.nanosecond() / 1_000_000) % 1000;
    [
        (millis & 0xff) as u8,
        at.second() as u8,
        at.minute() as u8,
        at.hour() as u8,
        at.day() as u8,
        at.month0() as u8,
        (at.year() % 100) as u8,
        (at.year() / 100) as u8,
    ]
}

/// The fields shared by the LAN and cloud flavours of the 40-byte header.
pub(crate) fn write_header(into: &mut [u8], total_len: usize, at: NaiveDateTime, device_id: u64) {
    into[..4].copy_from_slice(&[0x5a, 0x5a, 0x01, 0x11]);
    into[4..6].copy_from_slice(&(total_len as u16).to_le_bytes());
    into[6] = 0x20;
    into[12..20].copy_from_slice(&timestamp_bytes(at));
    into[20..26].copy_from_slice(&device_id.to_le_bytes()[..6]);
}

#[derive(Debug)]
pub struct LegacyCodec {
    device_id: u64,
    message_id: u32,
    data_key: [u8; 16],
}

impl LegacyCodec {
    pub fn new(device_id: u64) -> Self {
        Self { device_id, message_id: 1, data_key: md5(&[SIGN_KEY]) }
    }

    fn next_message_id(&mut self) -> u32 {
        self.message_id += 1;
        if self.message_id == MESSAGE_ID_WRAP {
            self.message_id = 1;
        }
        self.message_id
    }

    pub fn seal(&mut self, frame: &[u8]) -> Bytes {
        self.seal_at(frame, Local::now().naive_local())
    }

    /// Encrypts `frame`, prefixes the header and appends the MD5 checksum.
    pub fn seal_at(&mut self, frame: &[u8], at: NaiveDateTime) -> Bytes {
        let encrypted = aes128_ecb_encrypt_pkcs7(&self.data_key, frame);
        let total = HEADER_LEN + encrypted.len() + CHECKSUM_LEN;

        let mut header = [0u8; HEADER_LEN];
        write_header(&mut header, total, at, self.device_id);
        header[8..12].copy_from_slice(&self.next_message_id().to_le_bytes());

        let mut out = BytesMut::with_capacity(total);
        out.put_slice(&header);
        out.put_slice(&encrypted);
        let checksum = md5(&[&out[..], SIGN_KEY]);
        out.put_slice(&checksum);
        out.freeze()
    }

    /// Verifies the checksum and returns the decrypted appliance frame.
    pub fn open(&self, packet: &[u8]) -> Result<Bytes> {
        if packet.len() < HEADER_LEN + CHECKSUM_LEN || packet[..2] != [0x5a, 0x5a] {
            error!("LegacyCodec::open: malformed packet {}", hex::encode(packet));
            return Err(Error::Protocol("malformed 5A5A packet".into()));
        }
        let (signed, checksum) = packet.split_at(packet.len() - CHECKSUM_LEN);
        if md5(&[signed, SIGN_KEY]) != checksum {
            return Err(Error::Integrity("5A5A checksum mismatch".into()));
        }
        let frame = aes128_ecb_decrypt_pkcs7(&self.data_key, &signed[HEADER_LEN..])?;
        Ok(Bytes::from(frame))
    }
}
