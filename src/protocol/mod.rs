//! The appliance frame format and the payloads it carries.

mod frame;
mod frame_data;

#[macro_use]
pub mod encoding;
pub mod types;

pub mod capabilities;
pub mod commands;
pub mod power;
pub mod status;

pub use capabilities::{Capabilities, CapabilityPage};
pub use commands::{CommandKind, SetStatusCommand, Setting};
pub use encoding::{Encodable, EncodingError};
pub use frame::{checksum, crc8, DeviceClass, Frame, FrameParsingError, MessageType, FRAME_START, HEADER_LEN};
pub use frame_data::*;
pub use status::{Status, StatusRevision};
pub use types::{FanSpeed, Mode, Properties, TemperatureUnit, Timer, Value};
