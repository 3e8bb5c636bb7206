//! Transports carry appliance frames to the appliance and bring its answer
//! back. The appliance API only sees [`Transport`].

use std::net::Ipv4Addr;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::protocol::CommandKind;

pub mod cloud;
pub mod envelope;
pub mod handshake;
pub mod legacy;
pub mod serial_bridge;
pub mod smart_key;

pub use cloud::{CloudRegistry, CloudTransport};
pub use serial_bridge::SerialBridge;
pub use smart_key::SmartKey;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Connected with no command in flight.
    Idle,
    /// Connected and waiting for the answer to a command.
    Busy,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionState::Idle | ConnectionState::Busy)
    }
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends one appliance frame and resolves with the appliance's answer
    /// frame.
    async fn request(&self, kind: CommandKind, frame: Bytes) -> Result<Bytes>;

    /// Whether the transport forwards frames addressed to the WiFi module
    /// itself (electronic id, network notifications).
    fn supports_module_commands(&self) -> bool {
        false
    }

    /// The local address of the link, reported in network notifications.
    fn local_ipv4(&self) -> Option<Ipv4Addr> {
        None
    }

    fn connection_state(&self) -> watch::Receiver<ConnectionState>;

    /// Identifies the appliance in logs.
    fn label(&self) -> &str;
}

#[async_trait]
impl Transport for Box<dyn Transport> {
    async fn request(&self, kind: CommandKind, frame: Bytes) -> Result<Bytes> {
        (**self).request(kind, frame).await
    }

    fn supports_module_commands(&self) -> bool {
        (**self).supports_module_commands()
    }

    fn local_ipv4(&self) -> Option<Ipv4Addr> {
        (**self).local_ipv4()
    }

    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        (**self).connection_state()
    }

    fn label(&self) -> &str {
        (**self).label()
    }
}

/// What a [`Link`] read produced.
#[derive(Debug)]
pub enum Inbound {
    Frame(Bytes),
    /// The peer answered, but with a refusal for the in-flight command.
    Rejected(Error),
}

/// A stream connection as driven by the command queue worker.
#[async_trait]
pub trait Link: Send + 'static {
    fn is_open(&self) -> bool;

    /// Connects, and negotiates a session if the link needs one.
    async fn open(&mut self) -> Result<()>;

    async fn send(&mut self, frame: &[u8]) -> Result<()>;

    /// Waits for the next message. `Ok(None)` means the peer closed the
    /// connection. Must be cancel safe: no bytes are lost if the future is
    /// dropped.
    async fn receive(&mut self) -> Result<Option<Inbound>>;

    /// Drops the connection and any session bound to it.
    async fn close(&mut self);
}
