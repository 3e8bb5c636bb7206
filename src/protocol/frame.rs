use nom::bytes::streaming::{tag, take, take_till};
use nom::combinator::map;
use nom::number::streaming::be_u8;
use nom::IResult;

use super::encoding::{Encodable, EncodingError};

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MessageType {
    Set = 0x02,
    Query = 0x03,
    ElectronicId = 0x07,
    NetworkNotify = 0x0d,

    Unknown = 0xff,
}

impl From<u8> for MessageType {
    fn from(byte: u8) -> Self {
        match byte {
            0x02 => MessageType::Set,
            0x03 => MessageType::Query,
            0x07 => MessageType::ElectronicId,
            0x0d => MessageType::NetworkNotify,

            _ => MessageType::Unknown,
        }
    }
}

impl MessageType {
    /// Requests addressed to the WiFi module itself are sent without a CRC8
    /// byte. Every response from the appliance carries one.
    pub fn request_has_crc(self) -> bool {
        !matches!(self, MessageType::ElectronicId | MessageType::NetworkNotify)
    }
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DeviceClass {
    AirConditioner = 0xac,
    Any = 0xff,
}

impl From<u8> for DeviceClass {
    fn from(byte: u8) -> Self {
        match byte {
            0xac => DeviceClass::AirConditioner,
            _ => DeviceClass::Any,
        }
    }
}

pub const FRAME_START: u8 = 0xaa;
const DEVICE_TYPE: u8 = 0x03;
pub const HEADER_LEN: usize = 10;
/// The length byte limits a frame to 256 bytes including the checksum.
pub const MAX_FRAME_LEN: usize = 256;

const fn crc8_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x01 != 0 { (crc >> 1) ^ 0x8c } else { crc >> 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC8_TABLE: [u8; 256] = crc8_table();

/// Dallas/Maxim CRC8 (reflected polynomial 0x8C, zero init) over the payload.
pub fn crc8(data: &[u8]) -> u8 {
    data.iter().fold(0, |crc, b| CRC8_TABLE[(crc ^ b) as usize])
}

/// Two's complement of the byte sum, skipping the 0xAA start byte.
pub fn checksum(frame_without_start: &[u8]) -> u8 {
    frame_without_start
        .iter()
        .fold(0u8, |acc, b| acc.wrapping_add(*b))
        .wrapping_neg()
}

#[derive(Debug, Eq, PartialEq)]
pub struct Frame<'a> {
    pub device_class: DeviceClass,
    pub message_type: MessageType,
    pub payload: &'a [u8],
    crc: Option<u8>,
    checksum: u8,
}

#[derive(Debug, Eq, PartialEq)]
pub enum FrameParsingError<'a> {
    InvalidChecksum,
    InvalidCrc,
    InvalidHeader,
    IncompleteData(Option<usize>),
    UnknownError(&'a [u8]),
}

struct RawFrame<'a> {
    length: u8,
    device_class: u8,
    message_type: MessageType,
    payload: &'a [u8],
    crc: u8,
    checksum: u8,
}

fn raw_frame(input: &[u8]) -> IResult<&[u8], RawFrame> {
    let (input, _) = tag(&[FRAME_START][..])(input)?;
    let (input, length) = be_u8(input)?;
    let (input, device_class) = be_u8(input)?;
    let (input, _reserved) = take(5usize)(input)?;
    let (input, _device_type) = be_u8(input)?;
    let (input, message_type) = map(be_u8, MessageType::from)(input)?;
    // length counts everything but the checksum: header, payload and crc8
    let payload_len = (length as usize).saturating_sub(HEADER_LEN + 1);
    let (input, payload) = take(payload_len)(input)?;
    let (input, crc) = be_u8(input)?;
    let (input, checksum) = be_u8(input)?;

    Ok((input, RawFrame { length, device_class, message_type, payload, crc, checksum }))
}

impl<'a> Frame<'a> {
    pub fn new(device_class: DeviceClass, message_type: MessageType, payload: &'a [u8]) -> Self {
        let crc = if message_type.request_has_crc() { Some(crc8(payload)) } else { None };
        let mut frame = Self { device_class, message_type, payload, crc, checksum: 0 };
        frame.checksum = frame.compute_checksum();
        frame
    }

    /// The first payload byte identifies the kind of response (0xC0 status,
    /// 0xB5 capabilities, 0xC1 power usage).
    pub fn response_tag(&self) -> Option<u8> {
        self.payload.first().copied()
    }

    fn header(&self) -> [u8; HEADER_LEN] {
        [
            FRAME_START,
            (self.encoded_len() - 1) as u8,
            self.device_class as u8,
            0x00, 0x00, 0x00, 0x00, 0x00,
            DEVICE_TYPE,
            self.message_type as u8,
        ]
    }

    fn compute_checksum(&self) -> u8 {
        let header = self.header();
        let sum = header[1..]
            .iter()
            .chain(self.payload.iter())
            .chain(self.crc.iter())
            .fold(0u8, |acc, b| acc.wrapping_add(*b));
        sum.wrapping_neg()
    }

    /// Parses one appliance response from the start of `data`, validating the
    /// CRC8 and checksum.
    pub fn parse(data: &'a [u8]) -> Result<(Self, &'a [u8]), FrameParsingError<'a>> {
        if data.len() < HEADER_LEN + 2 {
            return Err(FrameParsingError::IncompleteData(None));
        }

        match raw_frame(data) {
            Ok((remaining, raw)) => {
                if (raw.length as usize) < HEADER_LEN + 1 {
                    return Err(FrameParsingError::InvalidHeader);
                }
                let total = raw.length as usize + 1;
                if checksum(&data[1..total - 1]) != raw.checksum {
                    return Err(FrameParsingError::InvalidChecksum);
                }
                if crc8(raw.payload) != raw.crc {
                    return Err(FrameParsingError::InvalidCrc);
                }
                let frame = Frame {
                    device_class: DeviceClass::from(raw.device_class),
                    message_type: raw.message_type,
                    payload: raw.payload,
                    crc: Some(raw.crc),
                    checksum: raw.checksum,
                };
                Ok((frame, remaining))
            }

            Err(nom::Err::Incomplete(needed)) => match needed {
                nom::Needed::Size(size) => Err(FrameParsingError::IncompleteData(Some(size.get()))),
                nom::Needed::Unknown => Err(FrameParsingError::IncompleteData(None)),
            },

            Err(nom::Err::Failure(err)) | Err(nom::Err::Error(err)) => {
                if err.input.first() != Some(&FRAME_START) {
                    Err(FrameParsingError::InvalidHeader)
                } else {
                    Err(FrameParsingError::UnknownError(err.input))
                }
            }
        }
    }

    /// Skips bytes until the next frame start marker. Returns the remaining
    /// buffer and the number of discarded bytes.
    pub fn parse_until(data: &'a [u8]) -> Result<(&'a [u8], usize), FrameParsingError<'a>> {
        let result: IResult<&[u8], &[u8]> = take_till(|b| b == FRAME_START)(data);
        match result {
            Ok((rest, junk)) => Ok((rest, junk.len())),
            Err(_) => Err(FrameParsingError::IncompleteData(None)),
        }
    }

    /// Length of the complete frame at the start of `data`, if all of it has
    /// arrived.
    pub fn complete_len(data: &[u8]) -> Option<usize> {
        match data {
            [FRAME_START, length, ..] => {
                let total = *length as usize + 1;
                if data.len() >= total { Some(total) } else { None }
            }
            _ => None,
        }
    }
}

impl<'a> Encodable for Frame<'a> {
    fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len() + self.crc.map_or(0, |_| 1) + 1
    }

    fn encode<'b>(&self, into: &'b mut [u8]) -> Result<&'b [u8], EncodingError> {
        let len = self.encoded_len();
        if len > MAX_FRAME_LEN || into.len() < len {
            return Err(EncodingError);
        }

        into[..HEADER_LEN].copy_from_slice(&self.header());
        let mut at = HEADER_LEN;
        into[at..at + self.payload.len()].copy_from_slice(self.payload);
        at += self.payload.len();
        if let Some(crc) = self.crc {
            into[at] = crc;
            at += 1;
        }
        into[at] = self.checksum;

        Ok(&into[..len])
    }
}
