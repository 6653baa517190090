use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::crm::types::EntityRecord;

/// The two persisted state documents, rewritten wholesale each run:
/// the resumption cursor (`state.json`) and the entity cache
/// (`opportunities.json`). A missing or unparseable file falls back to
/// defaults; a partially written file counts as corrupt.
pub struct StateStore {
    state_path: PathBuf,
    cache_path: PathBuf,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CursorDoc {
    #[serde(rename = "updatesUrl", skip_serializing_if = "Option::is_none")]
    updates_url: Option<String>,
}

/// Loaded cache plus whether it can be trusted. An untrusted (missing or
/// corrupt) cache means this is effectively a first run: everything would
/// classify as new, so posting is suppressed to avoid flooding the chat
/// with the whole backlog.
pub struct CacheLoad {
    pub cache: HashMap<String, EntityRecord>,
    pub trusted: bool,
}

impl StateStore {
    pub fn new(state_path: PathBuf, cache_path: PathBuf) -> Self {
        Self { state_path, cache_path }
    }

    /// The cursor persisted by the previous run, or None on a first run.
    pub fn load_cursor(&self) -> Option<String> {
        let raw = std::fs::read_to_string(&self.state_path).ok()?;
        match serde_json::from_str::<CursorDoc>(&raw) {
            Ok(doc) => doc.updates_url,
            Err(err) => {
                warn!("state file {} is corrupt: {err}", self.state_path.display());
                None
            }
        }
    }

    pub fn load_cache(&self) -> CacheLoad {
        let raw = match std::fs::read_to_string(&self.cache_path) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(
                    "cache file {} unreadable ({err}), starting empty and suppressing posts",
                    self.cache_path.display()
                );
                return CacheLoad { cache: HashMap::new(), trusted: false };
            }
        };
        match serde_json::from_str(&raw) {
            Ok(cache) => CacheLoad { cache, trusted: true },
            Err(err) => {
                warn!(
                    "cache file {} is corrupt ({err}), starting empty and suppressing posts",
                    self.cache_path.display()
                );
                CacheLoad { cache: HashMap::new(), trusted: false }
            }
        }
    }

    /// Persist the merged cache. Called as soon as detection is done so the
    /// snapshot survives even when posting later fails.
    pub fn save_cache(&self, cache: &HashMap<String, EntityRecord>) -> Result<()> {
        let raw = serde_json::to_string(cache)?;
        std::fs::write(&self.cache_path, raw)
            .with_context(|| format!("writing {}", self.cache_path.display()))
    }

    pub fn save_cursor(&self, updates_url: Option<String>) -> Result<()> {
        let raw = serde_json::to_string(&CursorDoc { updates_url })?;
        std::fs::write(&self.state_path, raw)
            .with_context(|| format!("writing {}", self.state_path.display()))
    }
}
