//! The vendor's HTTPS API: signed form posts answered with JSON.

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde::Deserialize;
use tracing::trace;

use crate::crypto::sha256;
use crate::error::{Error, Result};

pub const PATH_LOGIN_ID: &str = "/v1/user/login/id/get";
pub const PATH_LOGIN: &str = "/v1/user/login";
pub const PATH_SESSION_UPDATE: &str = "/v1/user/session/update";
pub const PATH_SEND: &str = "/v1/appliance/transparent/send";

const APP_ID: &str = "1017";
const FORMAT_JSON: &str = "2";
/// 0 PC, 1 Android, 2 iOS
const CLIENT_TYPE: &str = "1";
const LANGUAGE: &str = "en_US";
const SRC: &str = "17";

pub type Form = Vec<(String, String)>;

/// `sha256(path ++ sorted query ++ app_key)`, over the unencoded values.
pub fn sign(app_key: &str, path: &str, params: &[(String, String)]) -> String {
    let mut sorted: Vec<&(String, String)> = params.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    let query = sorted.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join("&");
    hex::encode(sha256(&[path.as_bytes(), query.as_bytes(), app_key.as_bytes()]))
}

pub fn encrypt_password(app_key: &str, login_id: &str, password: &str) -> String {
    let password_hash = hex::encode(sha256(&[password.as_bytes()]));
    hex::encode(sha256(&[login_id.as_bytes(), password_hash.as_bytes(), app_key.as_bytes()]))
}

/// The common parameters plus `extra`, the session id when there is one,
/// and the signature.
pub fn signed_form(app_key: &str, path: &str, stamp: &str, session_id: Option<&str>, extra: &[(&str, String)]) -> Form {
    let mut form: Form = vec![
        ("appId".into(), APP_ID.into()),
        ("format".into(), FORMAT_JSON.into()),
        ("clientType".into(), CLIENT_TYPE.into()),
        ("language".into(), LANGUAGE.into()),
        ("src".into(), SRC.into()),
        ("stamp".into(), stamp.into()),
    ];
    form.extend(extra.iter().map(|(k, v)| (k.to_string(), v.clone())));
    if let Some(session_id) = session_id {
        form.push(("sessionId".into(), session_id.into()));
    }
    let signature = sign(app_key, path, &form);
    form.push(("sign".into(), signature));
    form
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse {
    #[serde(default)]
    error_code: serde_json::Value,
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(default)]
    pub result: serde_json::Value,
}

impl ApiResponse {
    /// The error code, which the API sends as a string but not always.
    pub fn error_code(&self) -> String {
        match &self.error_code {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => String::new(),
            other => other.to_string(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error_code() == "0"
    }

    pub fn result_str(&self, field: &str) -> Result<String> {
        match &self.result[field] {
            serde_json::Value::String(s) => Ok(s.clone()),
            serde_json::Value::Number(n) => Ok(n.to_string()),
            _ => Err(Error::Protocol(format!("response carries no {}", field))),
        }
    }
}

#[async_trait]
pub trait CloudApi: Send + Sync + 'static {
    async fn post(&self, path: &str, form: Form) -> Result<ApiResponse>;
}

#[derive(Clone, Debug)]
pub struct HttpApi {
    client: Client,
    base_url: String,
}

impl HttpApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { client: Client::new(), base_url: base_url.into() }
    }
}

#[async_trait]
impl CloudApi for HttpApi {
    async fn post(&self, path: &str, form: Form) -> Result<ApiResponse> {
        let body = serde_urlencoded::to_string(&form).map_err(|e| Error::Protocol(e.to_string()))?;
        trace!("POST {} {}", path, body);
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_APP_KEY;

    fn form(pairs: &[(&str, &str)]) -> Form {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn sign_test() {
        let params = form(&[
            ("src", "17"),
            ("loginAccount", "me@midea.com"),
            ("appId", "1017"),
            ("stamp", "20240305140709"),
            ("format", "2"),
            ("clientType", "1"),
            ("language", "en_US"),
        ]);
        assert_eq!(
            "0b36eada2723f2c7d947edcda9aa8036cfa5930f5bedd165ca8f4182e0718b9e",
            sign(DEFAULT_APP_KEY, PATH_LOGIN_ID, &params)
        );
    }

    #[test]
    fn signed_form_test() {
        let signed = signed_form(
            DEFAULT_APP_KEY,
            PATH_LOGIN_ID,
            "20240305140709",
            None,
            &[("loginAccount", "me@midea.com".to_string())],
        );
        assert_eq!(8, signed.len());
        assert_eq!(
            ("sign".to_string(), "0b36eada2723f2c7d947edcda9aa8036cfa5930f5bedd165ca8f4182e0718b9e".to_string()),
            signed[7]
        );

        let with_session = signed_form(DEFAULT_APP_KEY, PATH_SESSION_UPDATE, "20240305140709", Some("abc"), &[]);
        assert!(with_session.contains(&("sessionId".to_string(), "abc".to_string())));
    }

    #[test]
    fn encrypt_password_test() {
        assert_eq!(
            "9bbeb4bd02bf5ef9894d44c2d6ce8c8dff475e4723c5af3a8e17ebe3ff6e587f",
            encrypt_password(DEFAULT_APP_KEY, "abc123", "secret")
        );
    }

    #[test]
    fn response_test() {
        let ok: ApiResponse = serde_json::from_str(r#"{"errorCode":"0","result":{"loginId":"abc123","userId":2913096}}"#).unwrap();
        assert!(ok.is_ok());
        assert_eq!("abc123", ok.result_str("loginId").unwrap());
        assert_eq!("2913096", ok.result_str("userId").unwrap());
        assert!(ok.result_str("sessionId").is_err());

        let numeric: ApiResponse = serde_json::from_str(r#"{"errorCode":3106,"msg":"invalidSession"}"#).unwrap();
        assert_eq!("3106", numeric.error_code());
        assert!(!numeric.is_ok());
    }
}
