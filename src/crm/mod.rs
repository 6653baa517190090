pub mod paginate;
pub mod session;
pub mod types;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client as HttpClient;
use serde_json::Value;
use url::Url;

use crate::config::CrmConfig;
use crate::enrich::EntityLookup;
use paginate::FeedSource;
use session::{CrmError, Session};
use types::{EntityRecord, FeedPage, OPPORTUNITY_CHANGED_FIELDS};

/// Default pagination start: the company-wide activity feed.
pub const COMPANY_FEED_PATH: &str = "chatter/feeds/company/feed-items";

const HTTP_TIMEOUT_SECS: u64 = 30;

// Fields beyond the watched ones that detection, formatting and the
// reference resolution need.
const OPPORTUNITY_QUERY_EXTRAS: &[&str] = &[
    "Id",
    "Team",
    "CreatedDate",
    "CreatedByName",
    "LastModifiedDate",
    "LastModifiedByName",
    "OwnerId",
    "AccountId",
];

/// Recently modified opportunities, independent of feed activity. This is
/// what feeds change detection, so an opportunity edited without anyone
/// commenting on it still gets reported.
#[async_trait]
pub trait OpportunitySource: Send + Sync {
    async fn recent_opportunities(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<EntityRecord>, CrmError>;
}

fn opportunity_query(since: DateTime<Utc>) -> String {
    let mut fields: Vec<&str> = OPPORTUNITY_QUERY_EXTRAS.to_vec();
    fields.extend(
        OPPORTUNITY_CHANGED_FIELDS
            .iter()
            .map(|(name, _)| *name)
            .filter(|name| !OPPORTUNITY_QUERY_EXTRAS.contains(name)),
    );
    format!(
        "SELECT {} FROM Opportunity WHERE LastModifiedDate > {} \
         ORDER BY LastModifiedDate DESC",
        fields.join(", "),
        since.format("%Y-%m-%dT%H:%M:%SZ"),
    )
}

/// CRM API client: an authenticated `Session` plus the URL arithmetic for
/// the versioned API root. Relative paths in all methods resolve against
/// that root, so a cursor URL returned by the feed can be fed straight back.
pub struct CrmClient {
    session: Session,
}

impl CrmClient {
    pub fn connect(cfg: CrmConfig, token_path: &Path) -> Result<Self, CrmError> {
        let http = HttpClient::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .map_err(CrmError::Http)?;
        let session = Session::load(http, cfg, token_path)?;
        Ok(Self { session })
    }

    fn api_root(&self) -> Result<Url, CrmError> {
        let instance = Url::parse(&self.session.instance_url())
            .map_err(|e| CrmError::Malformed(format!("instance url: {e}")))?;
        let mut root = instance
            .join(&self.session.config().api_version_url)
            .map_err(|e| CrmError::Malformed(format!("api version url: {e}")))?;
        if !root.path().ends_with('/') {
            let path = format!("{}/", root.path());
            root.set_path(&path);
        }
        Ok(root)
    }

    /// GET JSON from `url`; a relative URL resolves against the API root.
    pub async fn get_json(&self, url: &str) -> Result<Value, CrmError> {
        let resolved = self
            .api_root()?
            .join(url)
            .map_err(|e| CrmError::Malformed(format!("url {url}: {e}")))?;
        self.session.get_json(resolved.as_str()).await
    }

    /// The API versions available on this instance.
    pub async fn api_versions(&self) -> Result<Value, CrmError> {
        let url = Url::parse(&self.session.instance_url())
            .and_then(|u| u.join("/services/data/"))
            .map_err(|e| CrmError::Malformed(format!("instance url: {e}")))?;
        self.session.get_json(url.as_str()).await
    }
}

#[async_trait]
impl FeedSource for CrmClient {
    async fn feed_page(&self, url: &str) -> Result<FeedPage, CrmError> {
        let body = self.get_json(url).await?;
        serde_json::from_value(body).map_err(CrmError::Decode)
    }
}

#[async_trait]
impl EntityLookup for CrmClient {
    async fn fetch_entity(&self, kind: &str, id: &str) -> Result<Value, CrmError> {
        self.get_json(&format!("sobjects/{kind}/{id}")).await
    }
}

#[async_trait]
impl OpportunitySource for CrmClient {
    async fn recent_opportunities(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<EntityRecord>, CrmError> {
        let mut url = self
            .api_root()?
            .join("query/")
            .map_err(|e| CrmError::Malformed(format!("query url: {e}")))?;
        url.query_pairs_mut()
            .append_pair("q", &opportunity_query(since));
        let body = self.session.get_json(url.as_str()).await?;
        let records = body
            .get("records")
            .cloned()
            .ok_or_else(|| CrmError::Malformed("query response without records".to_string()))?;
        serde_json::from_value(records).map_err(CrmError::Decode)
    }
}
