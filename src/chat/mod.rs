use std::time::Duration;

use reqwest::{Client as HttpClient, StatusCode};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::config::ChatConfig;
use crate::format::InboxMessage;

const HTTP_TIMEOUT_SECS: u64 = 20;
// The chat API rejects external user names with spaces or over 16 chars.
const MAX_EXTERNAL_USER_LEN: usize = 16;

/// Message sink client. Routes team-inbox posts by team name using the
/// configured team → flow-token map, with an optional default flow for
/// unknown teams; without a default, unknown-team posts are dropped with a
/// warning.
pub struct ChatClient {
    http: HttpClient,
    cfg: ChatConfig,
}

/// Whether a message actually went out; dropped messages are not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostOutcome {
    Posted,
    Dropped,
}

impl ChatClient {
    pub fn new(cfg: ChatConfig) -> Result<Self, ChatError> {
        let http = HttpClient::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .map_err(ChatError::http)?;
        Ok(Self { http, cfg })
    }

    pub fn config(&self) -> &ChatConfig {
        &self.cfg
    }

    /// Post a one-liner to a flow's chat stream as an "external user".
    pub async fn post_chat(&self, flow_token: &str, content: &str) -> Result<(), ChatError> {
        let payload = json!({
            "external_user_name": external_user_name(
                self.cfg.team_inbox.from_name.as_deref().unwrap_or(&self.cfg.team_inbox.source),
            ),
            "content": content,
            "tags": self.cfg.team_inbox.tags,
        });
        info!("posting chat message: {content}");
        self.post(&format!("{}/messages/chat/{flow_token}", self.cfg.api_base), &payload)
            .await
    }

    // Team routing: the configured flow, else the default flow, else nothing.
    fn flow_token(&self, team: &str) -> Option<&String> {
        match self.cfg.flow_for_team.get(team) {
            Some(token) => Some(token),
            None => match &self.cfg.default_flow {
                Some(token) => {
                    warn!("unknown team: {team}, posting to the default flow");
                    Some(token)
                }
                None => {
                    warn!("unknown team: {team} and no default flow configured");
                    None
                }
            },
        }
    }

    /// Post to a team inbox, routed by the message's team name. The body is
    /// HTML-escaped with newlines turned into `<br>`.
    pub async fn post_inbox(&self, msg: &InboxMessage) -> Result<PostOutcome, ChatError> {
        let Some(flow_token) = self.flow_token(&msg.team_name) else {
            return Ok(PostOutcome::Dropped);
        };

        let inbox = &self.cfg.team_inbox;
        let mut payload = json!({
            "source": inbox.source,
            "from_address": inbox.from_address,
            "subject": msg.subject,
            "content": escape_html(&msg.text_content).replace('\n', "<br>"),
            "format": "html",
            "tags": inbox.tags,
        });
        if let Some(from_name) = &inbox.from_name {
            payload["from_name"] = json!(from_name);
        }
        if !msg.project.is_empty() {
            payload["project"] = json!(msg.project);
        }

        info!("posting to team inbox: {}", msg.subject);
        self.post(
            &format!("{}/messages/team_inbox/{flow_token}", self.cfg.api_base),
            &payload,
        )
        .await?;
        Ok(PostOutcome::Posted)
    }

    async fn post(&self, url: &str, payload: &Value) -> Result<(), ChatError> {
        let response = self
            .http
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(ChatError::http)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.json().await.unwrap_or(Value::Null);
            return Err(ChatError::Api { status, body });
        }
        Ok(())
    }
}

/// Escape text to valid HTML for the inbox body.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

// No spaces allowed, and short; the rest of the name is just dropped.
fn external_user_name(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_whitespace())
        .take(MAX_EXTERNAL_USER_LEN)
        .collect()
}

#[derive(Debug)]
pub enum ChatError {
    Http(reqwest::Error),
    Timeout,
    Api { status: StatusCode, body: Value },
}

impl ChatError {
    fn http(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ChatError::Timeout
        } else {
            ChatError::Http(err)
        }
    }
}

impl std::fmt::Display for ChatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatError::Http(err) => write!(f, "http error: {err}"),
            ChatError::Timeout => write!(f, "request timed out"),
            ChatError::Api { status, body } => write!(f, "chat api error {status}: {body}"),
        }
    }
}

impl std::error::Error for ChatError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ChatError::Http(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_cfg(default_flow: Option<&str>) -> ChatConfig {
        serde_json::from_value(json!({
            "flow_for_team": {"alpha": "tok-a"},
            "default_flow": default_flow,
            "team_inbox": {"source": "CRM", "from_address": "crm@example.com"}
        }))
        .unwrap()
    }

    #[test]
    fn routing_prefers_the_team_flow_then_the_default() {
        let chat = ChatClient::new(test_cfg(Some("tok-default"))).unwrap();
        assert_eq!(chat.flow_token("alpha"), Some(&"tok-a".to_string()));
        assert_eq!(chat.flow_token("nobody"), Some(&"tok-default".to_string()));
    }

    #[tokio::test]
    async fn unknown_team_without_default_flow_is_dropped() {
        let chat = ChatClient::new(test_cfg(None)).unwrap();
        let msg = InboxMessage {
            team_name: "nobody".into(),
            subject: "subject".into(),
            text_content: "body".into(),
            project: String::new(),
        };
        // routing fails before any request is built
        assert_eq!(chat.post_inbox(&msg).await.unwrap(), PostOutcome::Dropped);
    }

    #[test]
    fn escapes_html_special_chars() {
        assert_eq!(
            escape_html(r#"a < b & "c" > d"#),
            "a &lt; b &amp; &quot;c&quot; &gt; d"
        );
    }

    #[test]
    fn external_user_name_is_sanitized() {
        assert_eq!(external_user_name("CRM Relay Bot"), "CRMRelayBot");
        assert_eq!(
            external_user_name("a very long external user name"),
            "averylongexterna"
        );
    }
}
