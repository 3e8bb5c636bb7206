//! midea_ac
//!
//! Reverse-engineered protocol engine for Midea (and rebranded) air
//! conditioners. The appliance can be reached three ways:
//!
//! * a serial-to-TCP bridge wired to the appliance's UART ("serialbridge"),
//! * the SK103 WiFi smart key on TCP port 6444, which negotiates an AES session
//!   key by handshake before any frame is exchanged ("sk103"),
//! * the vendor's cloud, which relays frames over HTTPS ("mideacloud").
//!
//! All three carry the same appliance frames; [`Appliance`] hides which one is
//! in use.
//!
//! ## General Usage
//!
//! ```no_run
//! use midea_ac::{Appliance, ApplianceConfig, CloudRegistry};
//!
//! # async fn run() -> midea_ac::Result<()> {
//! let config = ApplianceConfig::from_json(r#"{
//!     "communicationMethod": "serialbridge",
//!     "host": "192.168.1.40"
//! }"#)?;
//!
//! let registry = CloudRegistry::new();
//! let appliance = Appliance::from_config(&config, &registry)?;
//! let initialized = appliance.initialize().await?;
//! println!("{:?}", initialized.status.get("indoorTemperature"));
//!
//! let change = serde_json::json!({ "powerOn": true, "mode": "cool", "setpoint": 22 });
//! appliance.set_status(change.as_object().unwrap()).await?;
//! # Ok(())
//! # }
//! ```
//!
//! The frame codec can be used on its own:
//!
//! ```
//! use midea_ac::protocol::{Frame, FrameData, Mode, StatusRevision};
//!
//! let data = hex::decode("aa22ac00000000000303c00048667f7f0030000000675300000000000000000040a5f1").unwrap();
//!
//! // Validates the CRC8 and the checksum
//! let (frame, _) = Frame::parse(&data).unwrap();
//!
//! match FrameData::parse(&frame, StatusRevision::Modern) {
//!     FrameData::Status(status) => {
//!         assert_eq!(Mode::Cool, status.mode);
//!         assert_eq!(24.0, status.setpoint);
//!         assert!(!status.power_on);
//!     }
//!     other => panic!("unexpected {:?}", other),
//! }
//! ```

pub mod config;
pub mod crypto;
pub mod error;
pub mod interface;
pub mod protocol;
pub mod queue;
pub mod transport;

pub use config::{ApplianceConfig, CloudConfig, CommonOptions, DeviceId, SerialBridgeConfig, SmartKeyConfig};
pub use error::{Error, ErrorKind, Result};
pub use interface::{Appliance, ApplianceEvent, Initialized};
pub use transport::{CloudRegistry, ConnectionState, Transport};
