//! The appliance API. An [`Appliance`] owns one [`Transport`], keeps the last
//! known status and capabilities, and broadcasts what changed.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use serde_json::{Map, Value as Json};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info, trace};

use crate::config::{ApplianceConfig, CommonOptions};
use crate::error::{Error, Result};
use crate::protocol::capabilities::CAPABILITIES_TAG;
use crate::protocol::commands::{self, CommandKind, SetStatusCommand, Setting};
use crate::protocol::power::{parse_power_usage, POWER_TAG};
use crate::protocol::status::STATUS_TAG;
use crate::protocol::types::diff;
use crate::protocol::{Capabilities, CapabilityPage, Frame, Properties, Status};
use crate::transport::{CloudRegistry, CloudTransport, ConnectionState, SerialBridge, SmartKey, Transport};

/// Capability pages requested at most; appliances send two or three.
const MAX_CAPABILITY_PAGES: u8 = 8;
const EVENT_CAPACITY: usize = 32;

#[derive(Clone, Debug, PartialEq)]
pub enum ApplianceEvent {
    /// Properties that changed since the previous status.
    StatusUpdate(Properties),
    Initialized(Initialized),
    ConnectionState(ConnectionState),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Initialized {
    pub status: Properties,
    /// `None` when the appliance did not report its capabilities.
    pub capabilities: Option<Capabilities>,
}

struct Inner<T> {
    transport: T,
    options: CommonOptions,
    status: RwLock<Option<Status>>,
    capabilities: RwLock<Option<Capabilities>>,
    message_id: AtomicU8,
    events: broadcast::Sender<ApplianceEvent>,
}

pub struct Appliance<T: Transport> {
    inner: Arc<Inner<T>>,
    keep_alive: Option<Duration>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Transport> std::fmt::Debug for Appliance<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Appliance").field("transport", &self.inner.transport.label()).finish()
    }
}

impl<T: Transport> Drop for Appliance<T> {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(std::sync::PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

fn invalid_response(expected: u8, frame: &[u8]) -> Error {
    error!("expected a {:#04x} response, got {}", expected, hex::encode(frame));
    Error::Protocol("Invalid response".into())
}

impl<T: Transport> Inner<T> {
    async fn request(&self, kind: CommandKind, frame: Bytes) -> Result<Bytes> {
        debug!("{} {}", kind.label(), hex::encode(&frame));
        let response = self.transport.request(kind, frame).await?;
        trace!("{} answered {}", kind.label(), hex::encode(&response));
        Ok(response)
    }

    /// Decodes a status answer, caches it and broadcasts what changed.
    async fn accept_status(&self, response: &[u8], notify: bool) -> Result<Properties> {
        let (frame, _) = Frame::parse(response)?;
        if frame.response_tag() != Some(STATUS_TAG) {
            return Err(invalid_response(STATUS_TAG, response));
        }
        let status = Status::parse(frame.payload, self.options.status_revision)
            .ok_or_else(|| Error::Protocol("status payload too short".into()))?;
        let properties = status.to_properties();

        let previous = self.status.write().await.replace(status);
        let updates = diff(&previous.map(|s| s.to_properties()).unwrap_or_default(), &properties);
        if notify && !updates.is_empty() {
            let _ = self.events.send(ApplianceEvent::StatusUpdate(updates));
        }
        Ok(properties)
    }

    async fn get_status(&self, notify: bool) -> Result<Properties> {
        let response = self.request(CommandKind::Status, commands::status_query()?).await?;
        self.accept_status(&response, notify).await
    }

    async fn get_capabilities(&self) -> Result<Capabilities> {
        let mut capabilities = Capabilities::default();
        for page in 1..=MAX_CAPABILITY_PAGES {
            let response = self.request(CommandKind::Capabilities, commands::capabilities_query(page)?).await?;
            let (frame, _) = Frame::parse(&response)?;
            if frame.response_tag() != Some(CAPABILITIES_TAG) {
                return Err(invalid_response(CAPABILITIES_TAG, &response));
            }
            let parsed = CapabilityPage::parse(frame.payload)
                .ok_or_else(|| Error::Protocol("malformed capability page".into()))?;
            let pending = capabilities.merge(&parsed);
            trace!("capability page {}: {} records, {} pending", page, parsed.records.len(), pending);
            if pending == 0 {
                break;
            }
        }

        *self.capabilities.write().await = Some(capabilities.clone());
        Ok(capabilities)
    }

    async fn send_network_status_notification(&self) -> Result<()> {
        if !self.transport.supports_module_commands() {
            return Err(Error::Unsupported(format!(
                "sendNetworkStatusNotification is not supported by {}",
                self.transport.label()
            )));
        }
        let frame = commands::network_status_notification(self.transport.local_ipv4())?;
        self.request(CommandKind::NetworkNotify, frame).await?;
        Ok(())
    }

    /// 1 to 255, then wraps back to 1.
    fn next_message_id(&self) -> u8 {
        let next = |id: u8| if id == u8::MAX { 1 } else { id + 1 };
        match self.message_id.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| Some(next(id))) {
            Ok(id) | Err(id) => next(id),
        }
    }
}

impl<T: Transport> Appliance<T> {
    /// Must be called within a tokio runtime; connection state changes are
    /// forwarded to the event channel from a background task.
    pub fn new(transport: T, options: CommonOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let mut state = transport.connection_state();
        let inner = Arc::new(Inner {
            transport,
            options,
            status: RwLock::new(None),
            capabilities: RwLock::new(None),
            message_id: AtomicU8::new(0),
            events,
        });

        let forward_to = inner.events.clone();
        let forwarder = tokio::spawn(async move {
            while state.changed().await.is_ok() {
                let current = *state.borrow_and_update();
                let _ = forward_to.send(ApplianceEvent::ConnectionState(current));
            }
        });

        Self { inner, keep_alive: None, tasks: std::sync::Mutex::new(vec![forwarder]) }
    }

    /// Re-sends the network status notification at this period once
    /// initialized. Only transports that forward module commands use it.
    pub fn with_keep_alive(mut self, period: Duration) -> Self {
        self.keep_alive = Some(period);
        self
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ApplianceEvent> {
        self.inner.events.subscribe()
    }

    /// The status last received, if any.
    pub async fn status(&self) -> Option<Status> {
        self.inner.status.read().await.clone()
    }

    pub async fn capabilities(&self) -> Option<Capabilities> {
        self.inner.capabilities.read().await.clone()
    }

    pub async fn get_status(&self) -> Result<Properties> {
        self.inner.get_status(true).await
    }

    /// Requests every capability page and merges them.
    pub async fn get_capabilities(&self) -> Result<Capabilities> {
        self.inner.get_capabilities().await
    }

    /// Applies `properties` (vendor names such as `powerOn`, `setpoint`,
    /// `mode`) on top of the last known status. Validation errors are
    /// returned before anything is sent.
    pub async fn set_status(&self, properties: &Map<String, Json>) -> Result<Properties> {
        let settings = Setting::parse_all(properties)?;
        self.apply(&settings).await
    }

    pub async fn apply(&self, settings: &[Setting]) -> Result<Properties> {
        let cached = self.inner.status.read().await.clone().unwrap_or_default();
        let message_id = self.inner.options.write_message_id.then(|| self.inner.next_message_id());
        let command = SetStatusCommand::build(&cached, settings, message_id)?;

        let response = self.inner.request(CommandKind::SetStatus, command.to_frame()?).await?;
        self.inner.accept_status(&response, true).await
    }

    /// Power used so far, in kWh.
    pub async fn get_power_usage(&self) -> Result<f64> {
        let response = self.inner.request(CommandKind::PowerUsage, commands::power_usage_query()?).await?;
        let (frame, _) = Frame::parse(&response)?;
        if frame.response_tag() != Some(POWER_TAG) {
            return Err(invalid_response(POWER_TAG, &response));
        }
        parse_power_usage(frame.payload).ok_or_else(|| Error::Protocol("power usage payload too short".into()))
    }

    /// Serial bridge only.
    pub async fn send_network_status_notification(&self) -> Result<()> {
        self.inner.send_network_status_notification().await
    }

    /// Serial bridge only. Returns the raw answer frame.
    pub async fn get_electronic_id(&self) -> Result<Bytes> {
        if !self.inner.transport.supports_module_commands() {
            return Err(Error::Unsupported(format!(
                "getElectronicId is not supported by {}",
                self.inner.transport.label()
            )));
        }
        self.inner.request(CommandKind::ElectronicId, commands::electronic_id_query()?).await
    }

    /// Fetches capabilities and status, starts the keep-alive and broadcasts
    /// [`ApplianceEvent::Initialized`]. Only a status failure is fatal.
    pub async fn initialize(&self) -> Result<Initialized> {
        let label = self.inner.transport.label().to_string();
        let module_commands = self.inner.transport.supports_module_commands();

        if module_commands {
            if let Err(e) = self.inner.send_network_status_notification().await {
                error!("failed to send network status notification for {} - {}", label, e);
            }
        }

        let capabilities = match self.inner.get_capabilities().await {
            Ok(capabilities) => Some(capabilities),
            Err(e) => {
                error!("failed to get capabilities of {} - {}", label, e);
                None
            }
        };

        let status = self.inner.get_status(false).await.map_err(|e| {
            error!("failed to get current status of {} - {}", label, e);
            e
        })?;

        if let (true, Some(period)) = (module_commands, self.keep_alive) {
            self.start_keep_alive(period);
        }

        info!("initialized {}", label);
        let initialized = Initialized { status, capabilities };
        let _ = self.inner.events.send(ApplianceEvent::Initialized(initialized.clone()));
        Ok(initialized)
    }

    fn start_keep_alive(&self, period: Duration) {
        let inner: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(inner) = inner.upgrade() else { break };
                if let Err(e) = inner.send_network_status_notification().await {
                    error!("failed to send network status notification for {} - {}", inner.transport.label(), e);
                }
            }
        });

        let mut tasks = self.tasks.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }
}

impl Appliance<Box<dyn Transport>> {
    /// Builds the transport `config` selects. Cloud appliances of the same
    /// account share a session through `registry`.
    pub fn from_config(config: &ApplianceConfig, registry: &CloudRegistry) -> Result<Self> {
        config.validate()?;
        let transport: Box<dyn Transport> = match config {
            ApplianceConfig::SerialBridge(c) => Box::new(SerialBridge::new(c)?),
            ApplianceConfig::SmartKey(c) => Box::new(SmartKey::new(c)?),
            ApplianceConfig::Cloud(c) => Box::new(CloudTransport::new(registry, c)?),
        };
        let appliance = Appliance::new(transport, config.common().clone());
        Ok(match config {
            ApplianceConfig::SerialBridge(c) => appliance.with_keep_alive(c.keep_alive()),
            _ => appliance,
        })
    }
}
