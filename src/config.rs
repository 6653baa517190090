use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

pub const CRM_CONFIG_FILE: &str = "crm-config.json";
pub const CRM_TOKEN_FILE: &str = "crm-token.json";
pub const CHAT_CONFIG_FILE: &str = "chat-config.json";
pub const LIMITS_FILE: &str = "limits.json";
pub const STATE_FILE: &str = "state.json";
pub const OPPORTUNITIES_FILE: &str = "opportunities.json";

const DEFAULT_TOKEN_URI: &str = "https://login.salesforce.com/services/oauth2/token";

/// CRM API credentials and endpoints (`crm-config.json`).
#[derive(Debug, Clone, Deserialize)]
pub struct CrmConfig {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    /// API version path under the instance URL, e.g. "/services/data/v33.0/".
    pub api_version_url: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

/// Chat service routing and team-inbox identity (`chat-config.json`).
#[derive(Debug, Clone, Deserialize)]
pub struct ChatConfig {
    #[serde(default = "default_chat_api_base")]
    pub api_base: String,
    /// Team name → flow API token.
    pub flow_for_team: std::collections::HashMap<String, String>,
    /// Fallback flow token for items whose team has no configured flow.
    /// Absent means such items are dropped with a warning.
    #[serde(default)]
    pub default_flow: Option<String>,
    /// When set, chatter items are additionally posted as one-liners to
    /// this flow's chat stream.
    #[serde(default)]
    pub chatter_chat_flow: Option<String>,
    pub team_inbox: TeamInboxConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TeamInboxConfig {
    pub source: String,
    pub from_address: String,
    #[serde(default)]
    pub from_name: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Work budgets for one run (`limits.json`).
#[derive(Debug, Clone, Deserialize)]
pub struct Limits {
    /// Feed items older than this are past the recency cutoff.
    pub max_seconds: i64,
    pub max_items: usize,
    pub max_pages: usize,
    /// Hard budgets truncate mid-page; soft ones finish the current page.
    #[serde(default)]
    pub hard_limit: bool,
    /// Cap on reported items per team per run; absent means unlimited.
    #[serde(default)]
    pub max_team_items: Option<usize>,
    /// Localhost port claimed for the single-instance guard.
    #[serde(default = "default_instance_port")]
    pub instance_port: u16,
}

fn default_instance_port() -> u16 {
    19876
}

fn default_chat_api_base() -> String {
    "https://api.flowdock.com/v1".to_string()
}

fn load_json_file<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

/// Paths and parsed config files under one config directory
/// (the original deployment layout: everything in a single dir).
pub struct ConfigDir {
    pub dir: PathBuf,
    pub crm: CrmConfig,
    pub chat: ChatConfig,
    pub limits: Limits,
}

impl ConfigDir {
    pub fn load(dir: &Path) -> Result<Self> {
        Ok(Self {
            dir: dir.to_path_buf(),
            crm: load_json_file(&dir.join(CRM_CONFIG_FILE))?,
            chat: load_json_file(&dir.join(CHAT_CONFIG_FILE))?,
            limits: load_json_file(&dir.join(LIMITS_FILE))?,
        })
    }

    /// Only the CRM side, for the read-only subcommands.
    pub fn load_crm_only(dir: &Path) -> Result<CrmConfig> {
        load_json_file(&dir.join(CRM_CONFIG_FILE))
    }

    /// Only the chat side, for manual posting.
    pub fn load_chat_only(dir: &Path) -> Result<ChatConfig> {
        load_json_file(&dir.join(CHAT_CONFIG_FILE))
    }

    pub fn token_path(&self) -> PathBuf {
        self.dir.join(CRM_TOKEN_FILE)
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    pub fn opportunities_path(&self) -> PathBuf {
        self.dir.join(OPPORTUNITIES_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_defaults() {
        let limits: Limits = serde_json::from_str(
            r#"{"max_seconds": 2678400, "max_items": 100, "max_pages": 5}"#,
        )
        .unwrap();
        assert!(!limits.hard_limit);
        assert_eq!(limits.max_team_items, None);
        assert_eq!(limits.instance_port, 19876);
    }

    #[test]
    fn chat_config_optional_fields() {
        let cfg: ChatConfig = serde_json::from_str(
            r#"{
                "flow_for_team": {"alpha": "tok-a"},
                "team_inbox": {"source": "CRM", "from_address": "crm@example.com"}
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.default_flow, None);
        assert_eq!(cfg.team_inbox.tags.len(), 0);
        assert!(cfg.api_base.starts_with("https://"));
    }
}
