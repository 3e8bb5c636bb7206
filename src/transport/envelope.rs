//! The `0x8370` envelope used on the SK103 link.
//!
//! ```text
//! 83 70 | size (BE u16) | 20 | pad << 4 | type | body
//! ```
//!
//! `size` is the envelope length minus 8. Encrypted bodies are
//! `AES-256-CBC(counter ++ data ++ zero pad) ++ SHA-256(header ++ plain)`.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{error, trace};

use crate::crypto::{aes256_cbc_decrypt, aes256_cbc_encrypt, sha256, BLOCK_LEN};
use crate::error::{Error, Result};

pub const MAGIC: [u8; 2] = [0x83, 0x70];
pub const HEADER_LEN: usize = 6;
const TAG: u8 = 0x20;
const COUNTER_LEN: usize = 2;
const SIGNATURE_LEN: usize = 32;
const ERROR_REPLY: &[u8] = b"ERROR";

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EnvelopeType {
    HandshakeRequest = 0x00,
    HandshakeResponse = 0x01,
    EncryptedResponse = 0x03,
    EncryptedRequest = 0x06,

    Unknown = 0xff,
}

impl From<u8> for EnvelopeType {
    fn from(byte: u8) -> Self {
        match byte {
            0x00 => EnvelopeType::HandshakeRequest,
            0x01 => EnvelopeType::HandshakeResponse,
            0x03 => EnvelopeType::EncryptedResponse,
            0x06 => EnvelopeType::EncryptedRequest,

            _ => EnvelopeType::Unknown,
        }
    }
}

#[derive(Debug, PartialEq)]
pub struct Decoded {
    pub envelope_type: EnvelopeType,
    pub counter: u16,
    pub payload: Bytes,
}

impl Decoded {
    /// The appliance answers a request it cannot handle with a bare `ERROR`.
    pub fn is_error_reply(&self) -> bool {
        self.payload.as_ref() == ERROR_REPLY
    }
}

/// Stateful envelope codec for one connection: owns the request counter and
/// the negotiated session key.
#[derive(Debug, Default)]
pub struct EnvelopeCodec {
    counter: u16,
    session_key: Option<[u8; 32]>,
}

fn header(size: usize, pad: usize, envelope_type: EnvelopeType) -> Result<[u8; HEADER_LEN]> {
    let size = u16::try_from(size).map_err(|_| Error::Protocol(format!("envelope of {} bytes is too large", size)))?;
    let [hi, lo] = size.to_be_bytes();
    Ok([MAGIC[0], MAGIC[1], hi, lo, TAG, ((pad as u8) << 4) | envelope_type as u8])
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_session(&self) -> bool {
        self.session_key.is_some()
    }

    pub fn set_session_key(&mut self, key: [u8; 32]) {
        self.session_key = Some(key);
    }

    /// Forgets the session; the counter carries on.
    pub fn reset_session(&mut self) {
        self.session_key = None;
    }

    fn next_counter(&mut self) -> [u8; COUNTER_LEN] {
        let current = self.counter;
        self.counter = if current + 1 == 0xffff { 0 } else { current + 1 };
        current.to_be_bytes()
    }

    /// Length of the envelope at the start of `data`, if all of it has arrived.
    pub fn complete_len(data: &[u8]) -> Option<usize> {
        if data.len() < 4 {
            return None;
        }
        let total = usize::from(u16::from_be_bytes([data[2], data[3]])) + 8;
        if data.len() >= total { Some(total) } else { None }
    }

    /// The unencrypted handshake request carrying the device token.
    pub fn encode_handshake(&mut self, token: &[u8]) -> Result<Bytes> {
        let header = header(token.len(), 0, EnvelopeType::HandshakeRequest)?;
        let mut out = BytesMut::with_capacity(HEADER_LEN + COUNTER_LEN + token.len());
        out.put_slice(&header);
        out.put_slice(&self.next_counter());
        out.put_slice(token);
        Ok(out.freeze())
    }

    pub fn encode_request(&mut self, data: &[u8]) -> Result<Bytes> {
        let key = self.session_key.ok_or_else(|| Error::Authentication("no session key negotiated".into()))?;

        let pad = (BLOCK_LEN - (data.len() + COUNTER_LEN) % BLOCK_LEN) % BLOCK_LEN;
        let header = header(data.len() + pad + SIGNATURE_LEN, pad, EnvelopeType::EncryptedRequest)?;

        let mut plain = Vec::with_capacity(COUNTER_LEN + data.len() + pad);
        plain.extend_from_slice(&self.next_counter());
        plain.extend_from_slice(data);
        plain.resize(COUNTER_LEN + data.len() + pad, 0);

        let signature = sha256(&[&header[..], &plain[..]]);
        let encrypted = aes256_cbc_encrypt(&key, &plain)?;

        let mut out = BytesMut::with_capacity(HEADER_LEN + encrypted.len() + SIGNATURE_LEN);
        out.put_slice(&header);
        out.put_slice(&encrypted);
        out.put_slice(&signature);
        trace!("EnvelopeCodec::encode_request: {}", hex::encode(&out));
        Ok(out.freeze())
    }

    /// Decodes one complete envelope. Encrypted responses are verified against
    /// their signature before anything is returned.
    pub fn decode(&self, data: &[u8]) -> Result<Decoded> {
        let total = Self::complete_len(data)
            .filter(|total| *total >= HEADER_LEN + COUNTER_LEN)
            .ok_or_else(|| Error::Protocol(format!("incomplete envelope {}", hex::encode(data))))?;
        if data[..2] != MAGIC {
            error!("EnvelopeCodec::decode: invalid header {}", hex::encode(&data[..2]));
            return Err(Error::Protocol("invalid envelope header".into()));
        }
        if data[4] != TAG {
            error!("EnvelopeCodec::decode: byte 4 of header is {:#04x}", data[4]);
            return Err(Error::Protocol("invalid envelope tag".into()));
        }

        let header = &data[..HEADER_LEN];
        let pad = usize::from(header[5] >> 4);
        let envelope_type = EnvelopeType::from(header[5] & 0x0f);
        let body = &data[HEADER_LEN..total];

        let plain = if envelope_type == EnvelopeType::EncryptedResponse {
            let key = self.session_key.ok_or_else(|| Error::Authentication("no session key negotiated".into()))?;
            if body.len() < SIGNATURE_LEN + BLOCK_LEN {
                return Err(Error::Protocol("encrypted envelope too short".into()));
            }
            let (encrypted, signature) = body.split_at(body.len() - SIGNATURE_LEN);
            let mut plain = aes256_cbc_decrypt(&key, encrypted)?;
            if sha256(&[header, &plain[..]]) != signature {
                error!("EnvelopeCodec::decode: message signature does not validate");
                return Err(Error::Integrity("envelope signature mismatch".into()));
            }
            if pad > plain.len() - COUNTER_LEN {
                return Err(Error::Protocol(format!("invalid padding length {}", pad)));
            }
            plain.truncate(plain.len() - pad);
            plain
        } else {
            body.to_vec()
        };

        let counter = u16::from_be_bytes([plain[0], plain[1]]);
        Ok(Decoded { envelope_type, counter, payload: Bytes::copy_from_slice(&plain[COUNTER_LEN..]) })
    }
}
