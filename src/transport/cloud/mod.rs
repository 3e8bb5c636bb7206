//! Transport through the vendor cloud.
//!
//! Every request is a stateless HTTPS post, so there is no connection to
//! keep. What is kept is the account session: one [`CloudClient`] per
//! account, shared by all appliances of that account through a
//! [`CloudRegistry`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Local, Utc};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant};
use tracing::{debug, error, info, trace};

use super::{ConnectionState, Transport};
use crate::config::{CloudConfig, DeviceId};
use crate::error::{Error, ErrorKind, Result};
use crate::protocol::CommandKind;

pub mod api;
pub mod packet;

pub use api::{ApiResponse, CloudApi, HttpApi};

use api::{PATH_LOGIN, PATH_LOGIN_ID, PATH_SEND, PATH_SESSION_UPDATE};

/// System error, appliance offline, appliance did not answer in time.
const RETRYABLE_CODES: [&str; 3] = ["9999", "3123", "3176"];
const CODE_WRONG_PASSWORD: &str = "3101";
const CODE_UNKNOWN_ACCOUNT: &str = "3102";
const CODE_INVALID_SESSION: &str = "3106";
const MAX_RETRIES: u32 = 3;
const FUN_ID: &str = "0000";

#[derive(Clone, Debug)]
struct Session {
    session_id: String,
    data_key: [u8; 16],
}

#[derive(Default)]
struct State {
    session: Option<Session>,
    refresh: Option<JoinHandle<()>>,
}

/// The logged-in session of one account.
pub struct CloudClient {
    config: CloudConfig,
    api: Arc<dyn CloudApi>,
    state: Mutex<State>,
}

impl std::fmt::Debug for CloudClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudClient").field("uid", &self.config.uid).finish()
    }
}

impl Drop for CloudClient {
    fn drop(&mut self) {
        if let Some(refresh) = self.state.get_mut().refresh.take() {
            refresh.abort();
        }
    }
}

impl CloudClient {
    pub fn new(config: &CloudConfig, api: Arc<dyn CloudApi>) -> Arc<Self> {
        Arc::new(Self { config: config.clone(), api, state: Mutex::new(State::default()) })
    }

    pub fn uid(&self) -> &str {
        &self.config.uid
    }

    async fn post(&self, path: &str, session_id: Option<&str>, extra: &[(&str, String)]) -> Result<ApiResponse> {
        let stamp = Utc::now().format("%Y%m%d%H%M%S").to_string();
        let form = api::signed_form(&self.config.app_key, path, &stamp, session_id, extra);
        let response = self.api.post(path, form).await?;
        trace!("{} answered {:?}", path, response);
        Ok(response)
    }

    async fn login_id(&self) -> Result<String> {
        let response = self.post(PATH_LOGIN_ID, None, &[("loginAccount", self.config.uid.clone())]).await?;
        match response.error_code().as_str() {
            "0" => response.result_str("loginId"),
            CODE_UNKNOWN_ACCOUNT => Err(Error::Authentication(format!("Account {} does not exist", self.config.uid))),
            code => {
                error!("login id lookup failed: {} ({})", response.msg.as_deref().unwrap_or(""), code);
                Err(Error::Protocol("An internal error occurred".into()))
            }
        }
    }

    async fn login(&self) -> Result<Session> {
        let login_id = self.login_id().await?;
        let password = api::encrypt_password(&self.config.app_key, &login_id, &self.config.password);
        let response = self
            .post(PATH_LOGIN, None, &[("loginAccount", self.config.uid.clone()), ("password", password)])
            .await?;
        match response.error_code().as_str() {
            "0" => {}
            CODE_WRONG_PASSWORD => {
                return Err(Error::Authentication("Failed to authenticate, wrong uid and/or password".into()))
            }
            code => {
                error!("login failed: {} ({})", response.msg.as_deref().unwrap_or(""), code);
                return Err(Error::Protocol("An internal error occurred".into()));
            }
        }

        let access_token = response.result_str("accessToken")?;
        let session_id = response.result_str("sessionId")?;
        info!(uid = %self.config.uid, user_id = ?response.result_str("userId").ok(), "logged in");
        Ok(Session { session_id, data_key: packet::data_key(&self.config.app_key, &access_token)? })
    }

    /// The current session, logging in first if there is none. Concurrent
    /// callers wait for a single login.
    async fn session(self: &Arc<Self>) -> Result<Session> {
        let mut state = self.state.lock().await;
        if let Some(session) = &state.session {
            return Ok(session.clone());
        }
        if let Some(refresh) = state.refresh.take() {
            refresh.abort();
        }

        let session = self.login().await?;
        state.session = Some(session.clone());
        state.refresh = Some(self.spawn_refresh());
        Ok(session)
    }

    /// Forgets `stale`, unless another request already replaced it.
    async fn invalidate(&self, stale: &Session) {
        let mut state = self.state.lock().await;
        if state.session.as_ref().map_or(false, |s| s.session_id == stale.session_id) {
            state.session = None;
        }
    }

    fn spawn_refresh(self: &Arc<Self>) -> JoinHandle<()> {
        let client: Weak<Self> = Arc::downgrade(self);
        let period = self.config.session_refresh();
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(client) = client.upgrade() else { break };
                client.refresh_session().await;
            }
        })
    }

    async fn refresh_session(&self) {
        let session_id = self.state.lock().await.session.as_ref().map(|s| s.session_id.clone());
        let Some(session_id) = session_id else { return };

        match self.post(PATH_SESSION_UPDATE, Some(&session_id), &[]).await {
            Ok(response) if response.is_ok() => trace!("refreshed session"),
            Ok(response) => error!("failed to update session ({}: {:?})", response.error_code(), response.msg),
            Err(e) => error!("failed to refresh session ({})", e),
        }
    }

    /// Relays `frame` to the appliance and returns its answer frame.
    pub async fn transparent_send(self: &Arc<Self>, device_id: DeviceId, frame: &[u8], label: &str) -> Result<Bytes> {
        let mut reauthenticated = false;
        let mut retries = 0;

        loop {
            let session = self.session().await?;
            let order = packet::encode_order(&session.data_key, frame, device_id.0, Local::now().naive_local());
            debug!("sending {} {}", label, hex::encode(frame));
            let response = self
                .post(
                    PATH_SEND,
                    Some(&session.session_id),
                    &[("order", order), ("funId", FUN_ID.to_string()), ("applianceId", device_id.to_string())],
                )
                .await?;

            let code = response.error_code();
            match code.as_str() {
                "0" => {
                    let reply = packet::decode_reply(&session.data_key, &response.result_str("reply")?)?;
                    debug!("received {}", hex::encode(&reply));
                    return Ok(reply);
                }
                CODE_INVALID_SESSION if !reauthenticated => {
                    error!("session expired, reauthenticating");
                    reauthenticated = true;
                    self.invalidate(&session).await;
                }
                CODE_INVALID_SESSION => return Err(Error::SessionExpired),
                c if RETRYABLE_CODES.contains(&c) && self.config.retry && retries < MAX_RETRIES => {
                    retries += 1;
                    error!("request {} resulted in error {}, retrying in {:?}", label, c, self.config.retry_delay());
                    sleep(self.config.retry_delay()).await;
                }
                c => {
                    error!("request {} resulted in error {} ({:?})", label, c, response.msg);
                    return Err(Error::Protocol("An internal error occurred".into()));
                }
            }
        }
    }
}

/// Shares one [`CloudClient`] between the appliances of an account. A client
/// lives as long as some transport uses it.
#[derive(Debug, Default)]
pub struct CloudRegistry {
    clients: StdMutex<HashMap<String, Weak<CloudClient>>>,
}

impl CloudRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The client for `config.uid`, talking HTTPS to the configured host.
    pub fn client(&self, config: &CloudConfig) -> Arc<CloudClient> {
        self.client_with(config, || Arc::new(HttpApi::new(config.base_url())))
    }

    pub fn client_with(&self, config: &CloudConfig, api: impl FnOnce() -> Arc<dyn CloudApi>) -> Arc<CloudClient> {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        clients.retain(|_, client| client.strong_count() > 0);
        if let Some(client) = clients.get(&config.uid).and_then(Weak::upgrade) {
            return client;
        }
        let client = CloudClient::new(config, api());
        clients.insert(config.uid.clone(), Arc::downgrade(&client));
        client
    }
}

#[derive(Debug)]
pub struct CloudTransport {
    client: Arc<CloudClient>,
    device_id: DeviceId,
    state: watch::Sender<ConnectionState>,
    label: String,
}

impl CloudTransport {
    pub fn new(registry: &CloudRegistry, config: &CloudConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::with_client(registry.client(config), config.device_id()))
    }

    pub fn with_client(client: Arc<CloudClient>, device_id: DeviceId) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self { client, device_id, state, label: format!("device_id={}", device_id) }
    }
}

#[async_trait]
impl Transport for CloudTransport {
    async fn request(&self, kind: CommandKind, frame: Bytes) -> Result<Bytes> {
        self.state.send_if_modified(|s| {
            let changed = *s == ConnectionState::Disconnected;
            if changed {
                *s = ConnectionState::Connecting;
            }
            changed
        });
        let result = self.client.transparent_send(self.device_id, &frame, kind.label()).await;
        let logged_in = self.client.state.lock().await.session.is_some();
        let next = match &result {
            Err(e) if matches!(e.kind(), ErrorKind::Authentication | ErrorKind::SessionExpired) => {
                ConnectionState::Disconnected
            }
            _ if logged_in => ConnectionState::Idle,
            _ => ConnectionState::Disconnected,
        };
        self.state.send_replace(next);
        result
    }

    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn label(&self) -> &str {
        &self.label
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use packet::tests::{ACCESS_TOKEN, C0_REPLY};
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Answers posts from a script. Session refreshes are always accepted
    /// and never consume the script.
    #[derive(Default)]
    struct ScriptedApi {
        script: StdMutex<VecDeque<(&'static str, serde_json::Value)>>,
        seen: StdMutex<Vec<(String, api::Form)>>,
    }

    impl ScriptedApi {
        fn new(script: Vec<(&'static str, serde_json::Value)>) -> Arc<Self> {
            Arc::new(Self { script: StdMutex::new(script.into()), seen: StdMutex::default() })
        }

        fn paths(&self) -> Vec<String> {
            self.seen.lock().unwrap().iter().map(|(p, _)| p.clone()).filter(|p| p != PATH_SESSION_UPDATE).collect()
        }
    }

    #[async_trait]
    impl CloudApi for ScriptedApi {
        async fn post(&self, path: &str, form: api::Form) -> Result<ApiResponse> {
            self.seen.lock().unwrap().push((path.to_string(), form));
            if path == PATH_SESSION_UPDATE {
                return Ok(serde_json::from_value(serde_json::json!({ "errorCode": "0" }))?);
            }
            let (expected, body) = self.script.lock().unwrap().pop_front().expect("unscripted request");
            assert_eq!(expected, path);
            Ok(serde_json::from_value(body)?)
        }
    }

    fn login_script() -> Vec<(&'static str, serde_json::Value)> {
        vec![
            (PATH_LOGIN_ID, serde_json::json!({ "errorCode": "0", "result": { "loginId": "abc123" } })),
            (
                PATH_LOGIN,
                serde_json::json!({ "errorCode": "0", "result": {
                    "accessToken": ACCESS_TOKEN, "sessionId": "aa34dde79f63459291d81667193da160", "userId": 2913096
                } }),
            ),
        ]
    }

    fn reply(code: &str) -> (&'static str, serde_json::Value) {
        if code == "0" {
            (PATH_SEND, serde_json::json!({ "errorCode": "0", "result": { "reply": C0_REPLY } }))
        } else {
            (PATH_SEND, serde_json::json!({ "errorCode": code, "msg": "failed" }))
        }
    }

    fn config() -> CloudConfig {
        CloudConfig::new("me@midea.com", "secret", DeviceId(33029023878494))
    }

    fn status_query() -> Vec<u8> {
        crate::protocol::commands::status_query().unwrap().to_vec()
    }

    #[tokio::test]
    async fn logs_in_then_relays_test() {
        let mut script = login_script();
        script.push(reply("0"));
        script.push(reply("0"));
        let api = ScriptedApi::new(script);
        let client = CloudClient::new(&config(), api.clone());

        let frame = client.transparent_send(DeviceId(33029023878494), &status_query(), "getStatus").await.unwrap();
        assert_eq!(0xc0, frame[10]);
        client.transparent_send(DeviceId(33029023878494), &status_query(), "getStatus").await.unwrap();
        assert_eq!(vec![PATH_LOGIN_ID, PATH_LOGIN, PATH_SEND, PATH_SEND], api.paths());

        let seen = api.seen.lock().unwrap();
        let login = &seen.iter().find(|(p, _)| p == PATH_LOGIN).unwrap().1;
        assert!(login.contains(&(
            "password".to_string(),
            "9bbeb4bd02bf5ef9894d44c2d6ce8c8dff475e4723c5af3a8e17ebe3ff6e587f".to_string()
        )));
        let send = &seen.iter().find(|(p, _)| p == PATH_SEND).unwrap().1;
        assert!(send.contains(&("sessionId".to_string(), "aa34dde79f63459291d81667193da160".to_string())));
        assert!(send.contains(&("applianceId".to_string(), "33029023878494".to_string())));
        assert_eq!("sign", send.last().unwrap().0);
    }

    #[tokio::test]
    async fn expired_session_logs_in_again_once_test() {
        let mut script = login_script();
        script.push(reply(CODE_INVALID_SESSION));
        script.extend(login_script());
        script.push(reply("0"));
        let client = CloudClient::new(&config(), ScriptedApi::new(script));
        assert!(client.transparent_send(DeviceId(1), &status_query(), "getStatus").await.is_ok());

        let mut script = login_script();
        script.push(reply(CODE_INVALID_SESSION));
        script.extend(login_script());
        script.push(reply(CODE_INVALID_SESSION));
        let client = CloudClient::new(&config(), ScriptedApi::new(script));
        let err = client.transparent_send(DeviceId(1), &status_query(), "getStatus").await.unwrap_err();
        assert_eq!(ErrorKind::SessionExpired, err.kind());
    }

    #[tokio::test]
    async fn login_errors_test() {
        let script = vec![(PATH_LOGIN_ID, serde_json::json!({ "errorCode": "3102" }))];
        let client = CloudClient::new(&config(), ScriptedApi::new(script));
        let err = client.transparent_send(DeviceId(1), &status_query(), "getStatus").await.unwrap_err();
        assert_eq!("Authentication failed: Account me@midea.com does not exist", err.to_string());

        let mut script = login_script();
        script[1] = (PATH_LOGIN, serde_json::json!({ "errorCode": "3101" }));
        let client = CloudClient::new(&config(), ScriptedApi::new(script));
        let err = client.transparent_send(DeviceId(1), &status_query(), "getStatus").await.unwrap_err();
        assert_eq!(ErrorKind::Authentication, err.kind());
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_codes_test() {
        let mut script = login_script();
        script.push(reply("3176"));
        script.push(reply("9999"));
        script.push(reply("0"));
        let api = ScriptedApi::new(script);
        let client = CloudClient::new(&config(), api.clone());
        assert!(client.transparent_send(DeviceId(1), &status_query(), "getStatus").await.is_ok());
        assert_eq!(5, api.paths().len());

        let mut no_retry = config();
        no_retry.retry = false;
        let mut script = login_script();
        script.push(reply("3123"));
        let client = CloudClient::new(&no_retry, ScriptedApi::new(script));
        let err = client.transparent_send(DeviceId(1), &status_query(), "getStatus").await.unwrap_err();
        assert_eq!(ErrorKind::Protocol, err.kind());
    }

    #[tokio::test(start_paused = true)]
    async fn session_is_refreshed_test() {
        let mut script = login_script();
        script.push(reply("0"));
        let api = ScriptedApi::new(script);
        let client = CloudClient::new(&config(), api.clone());
        client.transparent_send(DeviceId(1), &status_query(), "getStatus").await.unwrap();

        sleep(Duration::from_secs(25)).await;
        let refreshes = api.seen.lock().unwrap().iter().filter(|(p, _)| p == PATH_SESSION_UPDATE).count();
        assert_eq!(2, refreshes);
    }

    #[tokio::test]
    async fn registry_shares_clients_test() {
        let registry = CloudRegistry::new();
        let api: Arc<dyn CloudApi> = ScriptedApi::new(vec![]);
        let a = registry.client_with(&config(), || api.clone());
        let b = registry.client_with(&config(), || panic!("client should be shared"));
        assert!(Arc::ptr_eq(&a, &b));

        let mut other = config();
        other.uid = "you@midea.com".into();
        let c = registry.client_with(&other, || api.clone());
        assert!(!Arc::ptr_eq(&a, &c));

        drop((a, b));
        let d = registry.client_with(&config(), || api.clone());
        assert_eq!("me@midea.com", d.uid());
    }

    #[tokio::test]
    async fn transport_reports_state_test() {
        let mut script = login_script();
        script.push(reply("0"));
        let client = CloudClient::new(&config(), ScriptedApi::new(script));
        let transport = CloudTransport::with_client(client, DeviceId(1));
        let state = transport.connection_state();
        assert_eq!(ConnectionState::Disconnected, *state.borrow());

        let frame = Bytes::from(status_query());
        transport.request(CommandKind::Status, frame).await.unwrap();
        assert_eq!(ConnectionState::Idle, *state.borrow());
        assert!(!transport.supports_module_commands());
    }
}
