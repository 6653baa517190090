use std::path::{Path, PathBuf};
use std::sync::Mutex;

use reqwest::{Client as HttpClient, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::CrmConfig;

/// OAuth2 token as stored in `crm-token.json`. Refreshed tokens are written
/// back so the next run starts with a working one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub instance_url: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Authenticated JSON fetcher owning the OAuth token.
///
/// The CRM does not report token expiry with the token itself, so expiry is
/// detected from the response: a 401 whose body carries
/// `errorCode == "INVALID_SESSION_ID"` triggers one transparent
/// refresh-and-retry of the same request. A second failure propagates.
pub struct Session {
    http: HttpClient,
    cfg: CrmConfig,
    token_path: PathBuf,
    token: Mutex<Token>,
}

impl Session {
    pub fn load(http: HttpClient, cfg: CrmConfig, token_path: &Path) -> Result<Self, CrmError> {
        let raw = std::fs::read_to_string(token_path).map_err(|_| CrmError::MissingToken)?;
        let token: Token = serde_json::from_str(&raw).map_err(|_| CrmError::MissingToken)?;
        if token.access_token.is_empty() {
            return Err(CrmError::MissingToken);
        }
        Ok(Self {
            http,
            cfg,
            token_path: token_path.to_path_buf(),
            token: Mutex::new(token),
        })
    }

    pub fn instance_url(&self) -> String {
        self.token.lock().unwrap().instance_url.clone()
    }

    pub fn config(&self) -> &CrmConfig {
        &self.cfg
    }

    /// GET `url` as JSON with the bearer token, refreshing once on an
    /// expired-session 401.
    pub async fn get_json(&self, url: &str) -> Result<Value, CrmError> {
        let (status, body) = self.get_once(url).await?;
        if status == StatusCode::UNAUTHORIZED && session_expired(&body) {
            tracing::info!("access token expired, refreshing");
            self.refresh().await?;
            let (status, body) = self.get_once(url).await?;
            if !status.is_success() {
                return Err(CrmError::AuthExpired);
            }
            return Ok(body);
        }
        if !status.is_success() {
            return Err(CrmError::Api { status, body });
        }
        Ok(body)
    }

    async fn get_once(&self, url: &str) -> Result<(StatusCode, Value), CrmError> {
        let access_token = self.token.lock().unwrap().access_token.clone();
        let response = self
            .http
            .get(url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(CrmError::http)?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(CrmError::http)?;
        let body: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        Ok((status, body))
    }

    // Refresh-token grant against the token endpoint; the new token is
    // persisted so later runs don't redo the refresh.
    async fn refresh(&self) -> Result<(), CrmError> {
        let refresh_token = self
            .token
            .lock()
            .unwrap()
            .refresh_token
            .clone()
            .ok_or(CrmError::AuthExpired)?;
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
            ("client_id", self.cfg.client_id.as_str()),
            ("client_secret", self.cfg.client_secret.as_str()),
        ];
        let response = self
            .http
            .post(&self.cfg.token_uri)
            .form(&params)
            .send()
            .await
            .map_err(CrmError::http)?;
        let status = response.status();
        let body: Value = response.json().await.map_err(CrmError::http)?;
        if !status.is_success() {
            return Err(CrmError::Api { status, body });
        }

        let mut token = self.token.lock().unwrap();
        if let Some(access) = body.get("access_token").and_then(Value::as_str) {
            token.access_token = access.to_string();
        }
        if let Some(instance) = body.get("instance_url").and_then(Value::as_str) {
            token.instance_url = instance.to_string();
        }
        let serialized = serde_json::to_string(&*token).map_err(CrmError::Decode)?;
        std::fs::write(&self.token_path, serialized).map_err(CrmError::Io)?;
        tracing::info!("saved refreshed access token");
        Ok(())
    }
}

// The CRM marks an expired session as a JSON list whose first element has
// errorCode == INVALID_SESSION_ID; other 401s are real auth failures.
fn session_expired(body: &Value) -> bool {
    body.as_array()
        .and_then(|errors| errors.first())
        .and_then(|e| e.get("errorCode"))
        .and_then(Value::as_str)
        == Some("INVALID_SESSION_ID")
}

#[derive(Debug)]
pub enum CrmError {
    /// Token file missing, unreadable or empty; run the OAuth bootstrap.
    MissingToken,
    Http(reqwest::Error),
    Timeout,
    /// Token refresh happened but the retried request still failed.
    AuthExpired,
    Api { status: StatusCode, body: Value },
    Decode(serde_json::Error),
    Io(std::io::Error),
    /// A lookup that already failed earlier in this run; not refetched.
    LookupFailed { kind: String, id: String },
    /// A record or feed item without the structure the pipeline needs.
    Malformed(String),
}

impl CrmError {
    fn http(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CrmError::Timeout
        } else {
            CrmError::Http(err)
        }
    }
}

impl std::fmt::Display for CrmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CrmError::MissingToken => {
                write!(f, "no usable OAuth token; provision crm-token.json first")
            }
            CrmError::Http(err) => write!(f, "http error: {err}"),
            CrmError::Timeout => write!(f, "request timed out"),
            CrmError::AuthExpired => {
                write!(f, "access token expired and the refresh retry failed")
            }
            CrmError::Api { status, body } => write!(f, "api error {status}: {body}"),
            CrmError::Decode(err) => write!(f, "decode error: {err}"),
            CrmError::Io(err) => write!(f, "i/o error: {err}"),
            CrmError::LookupFailed { kind, id } => {
                write!(f, "{kind} {id} already failed to resolve this run")
            }
            CrmError::Malformed(what) => write!(f, "malformed record: {what}"),
        }
    }
}

impl std::error::Error for CrmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CrmError::Http(err) => Some(err),
            CrmError::Decode(err) => Some(err),
            CrmError::Io(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn expired_session_marker_is_detected() {
        let body = json!([{"errorCode": "INVALID_SESSION_ID", "message": "expired"}]);
        assert!(session_expired(&body));
        assert!(!session_expired(&json!([{"errorCode": "FORBIDDEN"}])));
        assert!(!session_expired(&json!({"errorCode": "INVALID_SESSION_ID"})));
        assert!(!session_expired(&Value::Null));
    }

    #[test]
    fn token_roundtrip_keeps_unknown_fields() {
        let raw = json!({
            "access_token": "a",
            "refresh_token": "r",
            "instance_url": "https://na1.example.com",
            "signature": "sig",
        });
        let token: Token = serde_json::from_value(raw).unwrap();
        assert_eq!(token.extra["signature"], json!("sig"));
        let back = serde_json::to_value(&token).unwrap();
        assert_eq!(back["signature"], json!("sig"));
    }
}
