//! Raw appliance frames over TCP, as exposed by a serial-to-network bridge
//! wired to the appliance's UART.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use super::{ConnectionState, Inbound, Link, Transport};
use crate::config::SerialBridgeConfig;
use crate::error::{Error, Result};
use crate::protocol::{CommandKind, Frame};
use crate::queue::{QueueHandle, QueueSettings, DEFAULT_MAX_DEPTH};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) struct SerialBridgeLink {
    addr: String,
    stream: Option<TcpStream>,
    buffer: BytesMut,
    local: watch::Sender<Option<Ipv4Addr>>,
}

impl SerialBridgeLink {
    fn new(addr: String, local: watch::Sender<Option<Ipv4Addr>>) -> Self {
        Self { addr, stream: None, buffer: BytesMut::with_capacity(512), local }
    }

    /// Pops the next valid frame off the receive buffer. Bytes before a frame
    /// start and frames failing their CRC or checksum are dropped.
    fn take_frame(&mut self) -> Option<Bytes> {
        loop {
            let junk = match Frame::parse_until(&self.buffer) {
                Ok((_, junk)) => junk,
                Err(_) => self.buffer.len(),
            };
            if junk > 0 {
                warn!("discarding {} bytes before frame start", junk);
                self.buffer.advance(junk);
            }

            let total = Frame::complete_len(&self.buffer)?;
            let raw = self.buffer.split_to(total).freeze();
            if let Err(e) = Frame::parse(&raw) {
                error!("dropping invalid frame {} ({:?})", hex::encode(&raw), e);
                continue;
            }
            return Some(raw);
        }
    }
}

#[async_trait]
impl Link for SerialBridgeLink {
    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    async fn open(&mut self) -> Result<()> {
        debug!("connecting to {}", self.addr);
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| Error::Timeout(format!("connecting to {}", self.addr)))??;
        stream.set_nodelay(true)?;

        let local = match stream.local_addr()?.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(ip) => ip.to_ipv4_mapped(),
        };
        self.local.send_replace(local);
        info!("connected to {}", self.addr);

        self.buffer.clear();
        self.stream = Some(stream);
        Ok(())
    }

    async fn send(&mut self, frame: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or_else(|| Error::Transport("not connected".into()))?;
        stream.write_all(frame).await?;
        Ok(())
    }

    async fn receive(&mut self) -> Result<Option<Inbound>> {
        loop {
            if let Some(frame) = self.take_frame() {
                return Ok(Some(Inbound::Frame(frame)));
            }
            let Some(stream) = self.stream.as_mut() else { return Ok(None) };
            if stream.read_buf(&mut self.buffer).await? == 0 {
                return Ok(None);
            }
            trace!("received {}", hex::encode(&self.buffer));
        }
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            info!("closed connection to {}", self.addr);
        }
        self.buffer.clear();
    }
}

/// Transport for a serial bridge. The connection is opened right away and
/// re-established after the configured delay whenever it drops.
#[derive(Debug)]
pub struct SerialBridge {
    queue: QueueHandle,
    local: watch::Receiver<Option<Ipv4Addr>>,
    label: String,
}

impl SerialBridge {
    /// Spawns the connection worker; must be called within a tokio runtime.
    pub fn new(config: &SerialBridgeConfig) -> Result<Self> {
        config.validate()?;
        let label = format!("{}:{}", config.host, config.port);
        let (local_tx, local) = watch::channel(None);
        let link = SerialBridgeLink::new(label.clone(), local_tx);
        let settings = QueueSettings {
            command_timeout: config.command_timeout(),
            command_delay: Duration::ZERO,
            reconnect_delay: Some(config.reconnect_delay()),
            close_when_idle: false,
            max_depth: DEFAULT_MAX_DEPTH,
            retry: config.retry,
        };
        let queue = QueueHandle::spawn(link, settings, &label);
        Ok(Self { queue, local, label })
    }
}

#[async_trait]
impl Transport for SerialBridge {
    async fn request(&self, kind: CommandKind, frame: Bytes) -> Result<Bytes> {
        self.queue.request(kind, frame).await
    }

    fn supports_module_commands(&self) -> bool {
        true
    }

    fn local_ipv4(&self) -> Option<Ipv4Addr> {
        *self.local.borrow()
    }

    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.queue.connection_state()
    }

    fn label(&self) -> &str {
        &self.label
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATUS: &str = "aa22ac00000000000303c00048667f7f0030000000675300000000000000000040a5f1";

    fn link_with(data: &[u8]) -> SerialBridgeLink {
        let (tx, _rx) = watch::channel(None);
        let mut link = SerialBridgeLink::new("test".into(), tx);
        link.buffer.extend_from_slice(data);
        link
    }

    #[test]
    fn take_frame_skips_junk_test() {
        let mut data = vec![0x00, 0x13, 0x37];
        data.extend(hex::decode(STATUS).unwrap());
        let mut link = link_with(&data);
        assert_eq!(STATUS, hex::encode(link.take_frame().unwrap()));
        assert!(link.buffer.is_empty());
    }

    #[test]
    fn take_frame_waits_for_rest_test() {
        let status = hex::decode(STATUS).unwrap();
        let mut link = link_with(&status[..20]);
        assert!(link.take_frame().is_none());
        link.buffer.extend_from_slice(&status[20..]);
        assert!(link.take_frame().is_some());
    }

    #[test]
    fn take_frame_drops_bad_crc_test() {
        let mut bad = hex::decode(STATUS).unwrap();
        bad[12] ^= 0x01;
        let mut data = bad.clone();
        data.extend(hex::decode(STATUS).unwrap());
        let mut link = link_with(&data);
        assert_eq!(STATUS, hex::encode(link.take_frame().unwrap()));
        assert!(link.take_frame().is_none());
    }

    #[test]
    fn back_to_back_frames_test() {
        let mut data = hex::decode(STATUS).unwrap();
        data.extend(hex::decode(STATUS).unwrap());
        let mut link = link_with(&data);
        assert!(link.take_frame().is_some());
        assert!(link.take_frame().is_some());
        assert!(link.take_frame().is_none());
    }
}
