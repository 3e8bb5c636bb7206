//! Appliance options, deserialized from the same JSON shape the vendor
//! tooling uses.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::{Error, Result};
use crate::protocol::StatusRevision;
use crate::transport::handshake::{KEY_LEN, TOKEN_LEN};

pub const DEFAULT_APP_KEY: &str = "3742e9e5842d4ad59c2db887e12449f9";
pub const DEFAULT_CLOUD_HOST: &str = "mapp.appsmb.com";

/// A 48-bit appliance id, given either as a number or a numeric string.
#[derive(Copy, Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct DeviceId(pub u64);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for DeviceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let id: u64 = s.trim().parse().map_err(|_| Error::Config(format!("Invalid device id ({})", s)))?;
        DeviceId::try_from(id)
    }
}

impl TryFrom<u64> for DeviceId {
    type Error = Error;

    fn try_from(id: u64) -> Result<Self> {
        if id >> 48 != 0 {
            return Err(Error::Config(format!("Device id {} does not fit in 48 bits", id)));
        }
        Ok(DeviceId(id))
    }
}

impl<'de> Deserialize<'de> for DeviceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> core::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        let parsed = match Raw::deserialize(deserializer)? {
            Raw::Number(id) => DeviceId::try_from(id),
            Raw::Text(text) => text.parse(),
        };
        parsed.map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommonOptions {
    #[serde(default)]
    pub status_revision: StatusRevision,
    /// Writes the rolling message id into set commands. Off by default since
    /// some appliances reject such commands with error 9999.
    #[serde(default)]
    pub write_message_id: bool,
}

fn default_serial_port() -> u16 {
    23
}
fn default_smart_key_port() -> u16 {
    6444
}
fn default_cloud_port() -> u16 {
    443
}
fn default_serial_timeout_ms() -> u64 {
    1000
}
fn default_reconnect_delay_ms() -> u64 {
    1000
}
fn default_keep_alive_secs() -> u64 {
    120
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_smart_key_timeout_ms() -> u64 {
    2000
}
fn default_command_delay_ms() -> u64 {
    500
}
fn default_max_queue_depth() -> usize {
    5
}
fn default_app_key() -> String {
    DEFAULT_APP_KEY.to_string()
}
fn default_cloud_host() -> String {
    DEFAULT_CLOUD_HOST.to_string()
}
fn default_true() -> bool {
    true
}
fn default_retry_delay_ms() -> u64 {
    5000
}
fn default_session_refresh_secs() -> u64 {
    10
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SerialBridgeConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_serial_port")]
    pub port: u16,
    #[serde(default = "default_serial_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default)]
    pub retry: u8,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(flatten)]
    pub common: CommonOptions,
}

impl SerialBridgeConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            command_timeout_ms: default_serial_timeout_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            retry: 0,
            keep_alive_secs: default_keep_alive_secs(),
            common: CommonOptions::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() || self.port == 0 {
            return Err(Error::Config(
                "Cannot create serialbridge connection, no host and/or port specified".into(),
            ));
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SmartKeyConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_smart_key_port")]
    pub port: u16,
    #[serde(default)]
    pub id: Option<DeviceId>,
    /// Static device key, 64 hex characters.
    #[serde(default)]
    pub key: String,
    /// Handshake token, 128 hex characters.
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_smart_key_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_command_delay_ms")]
    pub command_delay_ms: u64,
    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: usize,
    #[serde(default)]
    pub retry: u8,
    #[serde(flatten)]
    pub common: CommonOptions,
}

impl SmartKeyConfig {
    pub fn new(host: impl Into<String>, id: DeviceId, key: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_smart_key_port(),
            id: Some(id),
            key: key.into(),
            token: token.into(),
            connect_timeout_ms: default_connect_timeout_ms(),
            command_timeout_ms: default_smart_key_timeout_ms(),
            command_delay_ms: default_command_delay_ms(),
            max_queue_depth: default_max_queue_depth(),
            retry: 0,
            common: CommonOptions::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::Config("Cannot create SK103 connection, no host specified".into()));
        }
        if self.id.is_none() {
            return Err(Error::Config("Cannot create SK103 connection, no device Id specified".into()));
        }
        if self.key.is_empty() || self.token.is_empty() {
            return Err(Error::Config("Cannot create SK103 connection, no key and/or token specified".into()));
        }
        self.static_key()?;
        self.token_bytes()?;
        Ok(())
    }

    pub fn device_id(&self) -> DeviceId {
        self.id.unwrap_or_default()
    }

    pub fn static_key(&self) -> Result<[u8; KEY_LEN]> {
        let bytes = hex::decode(&self.key)?;
        <[u8; KEY_LEN]>::try_from(bytes.as_slice())
            .map_err(|_| Error::Config(format!("The key must be {} hex characters", KEY_LEN * 2)))
    }

    pub fn token_bytes(&self) -> Result<Vec<u8>> {
        let bytes = hex::decode(&self.token)?;
        if bytes.len() != TOKEN_LEN {
            return Err(Error::Config(format!("The token must be {} hex characters", TOKEN_LEN * 2)));
        }
        Ok(bytes)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn command_delay(&self) -> Duration {
        Duration::from_millis(self.command_delay_ms)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CloudConfig {
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub device_id: Option<DeviceId>,
    #[serde(default = "default_app_key")]
    pub app_key: String,
    #[serde(default = "default_cloud_host")]
    pub host: String,
    #[serde(default = "default_cloud_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub retry: bool,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_session_refresh_secs")]
    pub session_refresh_secs: u64,
    #[serde(flatten)]
    pub common: CommonOptions,
}

impl CloudConfig {
    pub fn new(uid: impl Into<String>, password: impl Into<String>, device_id: DeviceId) -> Self {
        Self {
            uid: uid.into(),
            password: password.into(),
            device_id: Some(device_id),
            app_key: default_app_key(),
            host: default_cloud_host(),
            port: default_cloud_port(),
            retry: true,
            retry_delay_ms: default_retry_delay_ms(),
            session_refresh_secs: default_session_refresh_secs(),
            common: CommonOptions::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.device_id.is_none() {
            return Err(Error::Config("Cannot instantiate Midea cloud client, no deviceId specified".into()));
        }
        if self.uid.is_empty() {
            return Err(Error::Config("Cannot instantiate Midea cloud client, no user has been specified".into()));
        }
        if self.password.is_empty() {
            return Err(Error::Config(
                "Cannot instantiate Midea cloud client because no password has been specified".into(),
            ));
        }
        Ok(())
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id.unwrap_or_default()
    }

    pub fn base_url(&self) -> String {
        format!("https://{}:{}", self.host, self.port)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn session_refresh(&self) -> Duration {
        Duration::from_secs(self.session_refresh_secs)
    }
}

/// Options for one appliance, selected by `communicationMethod`.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "communicationMethod")]
pub enum ApplianceConfig {
    #[serde(rename = "serialbridge")]
    SerialBridge(SerialBridgeConfig),
    #[serde(rename = "sk103")]
    SmartKey(SmartKeyConfig),
    #[serde(rename = "mideacloud")]
    Cloud(CloudConfig),
}

impl ApplianceConfig {
    /// Parses and validates options from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: ApplianceConfig = serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            ApplianceConfig::SerialBridge(c) => c.validate(),
            ApplianceConfig::SmartKey(c) => c.validate(),
            ApplianceConfig::Cloud(c) => c.validate(),
        }
    }

    pub fn common(&self) -> &CommonOptions {
        match self {
            ApplianceConfig::SerialBridge(c) => &c.common,
            ApplianceConfig::SmartKey(c) => &c.common,
            ApplianceConfig::Cloud(c) => &c.common,
        }
    }
}
