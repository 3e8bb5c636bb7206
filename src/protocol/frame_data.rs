use tracing::error;

use super::capabilities::{CapabilityPage, CAPABILITIES_TAG};
use super::frame::{Frame, MessageType};
use super::power::{parse_power_usage, POWER_TAG};
use super::status::{Status, StatusRevision, STATUS_TAG};

/// A decoded appliance response, selected by the payload's response tag.
#[derive(Debug, PartialEq)]
pub enum FrameData<'a> {
    Status(Status),
    Capabilities(CapabilityPage<'a>),
    PowerUsage(f64),
    /// Acknowledgement of a network status notification.
    NetworkNotify,
    /// Anything unsupported or too damaged to decode; the payload is kept
    /// for diagnostics.
    Unknown(&'a [u8]),
}

impl<'a> FrameData<'a> {
    pub fn parse(frame: &Frame<'a>, revision: StatusRevision) -> Self {
        if frame.message_type == MessageType::NetworkNotify {
            return FrameData::NetworkNotify;
        }

        let decoded = match frame.response_tag() {
            Some(STATUS_TAG) => Status::parse(frame.payload, revision).map(FrameData::Status),
            Some(CAPABILITIES_TAG) => CapabilityPage::parse(frame.payload).map(FrameData::Capabilities),
            Some(POWER_TAG) => parse_power_usage(frame.payload).map(FrameData::PowerUsage),
            Some(tag) => {
                error!("FrameData::parse: unsupported response type {:#04x}", tag);
                None
            }
            None => None,
        };

        decoded.unwrap_or(FrameData::Unknown(frame.payload))
    }
}
