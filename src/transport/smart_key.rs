//! Transport for the SK103 smart key (the vendor's WiFi dongle) on TCP port
//! 6444.
//!
//! Each appliance frame is sealed in a `0x5A5A` packet, which travels
//! encrypted in an `0x8370` envelope under a session key negotiated by
//! handshake. The connection is opened on demand and closed once the queue
//! runs empty. Closing it forgets the session.

use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, trace, warn};

use super::envelope::{EnvelopeCodec, MAGIC};
use super::handshake::{derive_session_key, KEY_LEN};
use super::legacy::LegacyCodec;
use super::{ConnectionState, Inbound, Link, Transport};
use crate::config::SmartKeyConfig;
use crate::error::{Error, Result};
use crate::protocol::{CommandKind, Frame};
use crate::queue::{QueueHandle, QueueSettings};

pub(crate) struct SmartKeyLink {
    addr: String,
    connect_timeout: Duration,
    handshake_timeout: Duration,
    /// Pause between the handshake and the first command.
    settle_delay: Duration,
    static_key: [u8; KEY_LEN],
    token: Vec<u8>,
    stream: Option<TcpStream>,
    buffer: BytesMut,
    envelope: EnvelopeCodec,
    legacy: LegacyCodec,
}

impl SmartKeyLink {
    pub(crate) fn new(config: &SmartKeyConfig) -> Result<Self> {
        Ok(Self {
            addr: format!("{}:{}", config.host, config.port),
            connect_timeout: config.connect_timeout(),
            handshake_timeout: config.command_timeout(),
            settle_delay: config.command_delay(),
            static_key: config.static_key()?,
            token: config.token_bytes()?,
            stream: None,
            buffer: BytesMut::with_capacity(512),
            envelope: EnvelopeCodec::new(),
            legacy: LegacyCodec::new(config.device_id().0),
        })
    }

    fn take_envelope(&mut self) -> Option<Bytes> {
        // resynchronise on the magic
        let start = self.buffer.windows(2).position(|w| w == MAGIC).unwrap_or(self.buffer.len().saturating_sub(1));
        if start > 0 {
            warn!("discarding {} bytes before envelope start", start);
            self.buffer.advance(start);
        }
        let total = EnvelopeCodec::complete_len(&self.buffer)?;
        Some(self.buffer.split_to(total).freeze())
    }

    async fn read_envelope(&mut self) -> Result<Option<Bytes>> {
        loop {
            if let Some(raw) = self.take_envelope() {
                trace!("received {}", hex::encode(&raw));
                return Ok(Some(raw));
            }
            let Some(stream) = self.stream.as_mut() else { return Ok(None) };
            if stream.read_buf(&mut self.buffer).await? == 0 {
                return Ok(None);
            }
        }
    }

    async fn handshake(&mut self) -> Result<()> {
        let request = self.envelope.encode_handshake(&self.token)?;
        self.send_raw(&request).await?;

        let response = timeout(self.handshake_timeout, self.read_envelope())
            .await
            .map_err(|_| Error::Timeout("authenticate".into()))??
            .ok_or_else(|| Error::Transport("connection closed during handshake".into()))?;

        let session = derive_session_key(&self.static_key, &response)?;
        self.envelope.set_session_key(session);
        debug!("authenticated");

        sleep(self.settle_delay).await;
        Ok(())
    }

    async fn send_raw(&mut self, data: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or_else(|| Error::Transport("not connected".into()))?;
        trace!("writing {}", hex::encode(data));
        stream.write_all(data).await?;
        Ok(())
    }

    /// Unwraps both layers around an appliance frame.
    fn unwrap_envelope(&self, raw: &[u8]) -> Result<Inbound> {
        let decoded = self.envelope.decode(raw)?;
        if decoded.is_error_reply() {
            return Ok(Inbound::Rejected(Error::Protocol("appliance answered ERROR".into())));
        }
        let frame = self.legacy.open(&decoded.payload)?;
        Frame::parse(&frame)?;
        Ok(Inbound::Frame(frame))
    }
}

#[async_trait]
impl Link for SmartKeyLink {
    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    async fn open(&mut self) -> Result<()> {
        debug!("connecting to {}", self.addr);
        let stream = timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| Error::Timeout("Failed to connect (timeout)".into()))??;
        info!("connected to {}", self.addr);
        self.buffer.clear();
        self.stream = Some(stream);

        if let Err(e) = self.handshake().await {
            error!("failed to authenticate: {}", e);
            self.close().await;
            return Err(e);
        }
        Ok(())
    }

    async fn send(&mut self, frame: &[u8]) -> Result<()> {
        let sealed = self.legacy.seal(frame);
        let envelope = self.envelope.encode_request(&sealed)?;
        self.send_raw(&envelope).await
    }

    async fn receive(&mut self) -> Result<Option<Inbound>> {
        let Some(raw) = self.read_envelope().await? else { return Ok(None) };
        match self.unwrap_envelope(&raw) {
            Ok(inbound) => Ok(Some(inbound)),
            Err(e) => {
                error!("invalid response {} ({})", hex::encode(&raw), e);
                Ok(Some(Inbound::Rejected(e)))
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            info!("connection closed");
        }
        self.buffer.clear();
        self.envelope.reset_session();
    }
}

#[derive(Debug)]
pub struct SmartKey {
    queue: QueueHandle,
    label: String,
}

impl SmartKey {
    /// Spawns the connection worker; must be called within a tokio runtime.
    pub fn new(config: &SmartKeyConfig) -> Result<Self> {
        config.validate()?;
        let label = format!("device_id={}", config.device_id());
        let link = SmartKeyLink::new(config)?;
        let settings = QueueSettings {
            command_timeout: config.command_timeout(),
            command_delay: config.command_delay(),
            reconnect_delay: None,
            close_when_idle: true,
            max_depth: config.max_queue_depth,
            retry: config.retry,
        };
        let queue = QueueHandle::spawn(link, settings, &label);
        Ok(Self { queue, label })
    }
}

#[async_trait]
impl Transport for SmartKey {
    async fn request(&self, kind: CommandKind, frame: Bytes) -> Result<Bytes> {
        self.queue.request(kind, frame).await
    }

    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.queue.connection_state()
    }

    fn label(&self) -> &str {
        &self.label
    }
}
