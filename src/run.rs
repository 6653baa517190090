use std::collections::HashMap;
use std::net::TcpListener;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::chat::{ChatClient, PostOutcome};
use crate::config::{ConfigDir, Limits};
use crate::crm::paginate::{paginate, FeedSource, PageBudget};
use crate::crm::types::{record_id, EntityRecord, OPPORTUNITY_CHANGED_FIELDS};
use crate::crm::{CrmClient, OpportunitySource, COMPANY_FEED_PATH};
use crate::detect::{detect, ChangeSet};
use crate::enrich::{Enricher, EnrichedDetail, EntityLookup};
use crate::format::{fmt_changed_opportunity, fmt_chat_line, fmt_chatter_inbox, fmt_new_opportunity};
use crate::state::StateStore;
use crate::telemetry;
use crate::telemetry::ctx::LogCtx;
use crate::telemetry::emit::Meta;
use crate::telemetry::ops::run::{Phase as RunPhase, Run};
use crate::util::json::get_nested;
use crate::util::time::parse_iso_ts;

/// relay run — one poll-and-post pass
#[derive(clap::Args)]
pub struct RunCmd {
    /// Directory holding the config files and the state files
    pub config_dir: PathBuf,
    /// Fetch and detect changes but post nothing and persist nothing
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,
}

#[derive(Serialize, Default)]
pub struct RunSummary {
    pub fetched_items: usize,
    pub new: usize,
    pub changed: usize,
    pub chatter: usize,
    pub posted: usize,
    pub dropped: usize,
    pub errors: usize,
    pub posting_suppressed: bool,
    pub cursor_advanced: bool,
}

pub async fn run(args: RunCmd) -> Result<()> {
    let started = Instant::now();
    let log = telemetry::run();
    let _g = log
        .root_span_kv([
            ("config_dir", args.config_dir.display().to_string()),
            ("dry_run", args.dry_run.to_string()),
        ])
        .entered();

    let cfg = ConfigDir::load(&args.config_dir)?;

    // Single-instance guard: hold a localhost port for the process lifetime.
    // A failed bind means another run is in progress; exit cleanly.
    let _instance = match claim_instance(cfg.limits.instance_port) {
        Some(sock) => sock,
        None => {
            log.warn("another instance is already running, exiting");
            return Ok(());
        }
    };

    let crm = CrmClient::connect(cfg.crm.clone(), &cfg.token_path())?;
    let chat = ChatClient::new(cfg.chat.clone())?;
    let store = StateStore::new(cfg.state_path(), cfg.opportunities_path());

    let summary = execute(&crm, &crm, &crm, &chat, &store, &cfg.limits, args.dry_run, &log).await?;

    log.totals(summary.new, summary.changed, summary.chatter, summary.posted, summary.errors);
    if telemetry::config::json_mode() {
        let meta = Meta { duration_ms: started.elapsed().as_millis() };
        log.result(&summary, Some(meta))?;
    }
    Ok(())
}

// The whole pass behind the CRM and chat seams, so the state-handling
// behavior is testable without a network.
#[allow(clippy::too_many_arguments)]
async fn execute(
    feed: &dyn FeedSource,
    recent: &dyn OpportunitySource,
    lookup: &dyn EntityLookup,
    chat: &ChatClient,
    store: &StateStore,
    limits: &Limits,
    dry_run: bool,
    log: &LogCtx<Run>,
) -> Result<RunSummary> {
    let load_span = log.span(&RunPhase::LoadState).entered();
    let cursor = store.load_cursor();
    let cache_load = store.load_cache();
    // Missing/corrupt cache: run with an empty one but do not post, or the
    // whole backlog would flood the chat as "new".
    let suppress_posting = !cache_load.trusted;
    drop(load_span);

    let fetch_span = log.span(&RunPhase::FetchFeed).entered();
    let budget = PageBudget {
        max_age_secs: limits.max_seconds,
        max_items: limits.max_items,
        max_pages: limits.max_pages,
        hard_limit: limits.hard_limit,
    };
    let now = Utc::now();
    let start_url = cursor.as_deref().unwrap_or(COMPANY_FEED_PATH);
    let slice = paginate(feed, start_url, &budget, now).await;
    let chatter_items: Vec<Value> = slice
        .items
        .iter()
        .filter(|item| {
            get_nested(item, "parent.type").and_then(Value::as_str) == Some("Opportunity")
        })
        .cloned()
        .collect();

    let mut summary = RunSummary {
        fetched_items: slice.items.len(),
        chatter: chatter_items.len(),
        posting_suppressed: suppress_posting,
        ..RunSummary::default()
    };

    // Changed opportunities come from their own query, independent of feed
    // activity; a quiet edit must still be reported.
    let since = now - Duration::seconds(limits.max_seconds);
    let mut incoming = match recent.recent_opportunities(since).await {
        Ok(records) => records,
        Err(err) => {
            summary.errors += 1;
            log.error_kv("while querying recent opportunities", [("err", err.to_string())]);
            Vec::new()
        }
    };
    log.info(format!(
        "fetched {} feed items ({} about opportunities), {} recent opportunities",
        slice.items.len(),
        chatter_items.len(),
        incoming.len()
    ));
    drop(fetch_span);

    let detect_span = log.span(&RunPhase::Detect).entered();
    // Newest first so the per-team quota keeps the freshest items.
    incoming.sort_by_key(|record| {
        let ts = record
            .get("LastModifiedDate")
            .and_then(Value::as_str)
            .and_then(parse_iso_ts)
            .map(|dt| dt.timestamp())
            .unwrap_or_default();
        std::cmp::Reverse(ts)
    });
    let changeset = detect(
        &cache_load.cache,
        incoming,
        &watched_fields(),
        partition_by_team,
        limits.max_team_items,
    );
    summary.new = changeset.new.len();
    summary.changed = changeset.changed.len();
    drop(detect_span);

    if dry_run {
        log.info("dry run; cache file left untouched");
    } else {
        // Snapshot the merged cache now so it survives posting failures.
        store.save_cache(&changeset.all).context("persisting entity cache")?;
    }

    let will_post = !suppress_posting && !dry_run;

    let enrich_span = log.span(&RunPhase::Enrich).entered();
    let mut enricher = Enricher::new(lookup);
    let mut details: Vec<(&Value, EnrichedDetail)> = Vec::new();
    if will_post {
        for item in &chatter_items {
            match enricher.detail(item).await {
                Ok(detail) => details.push((item, detail)),
                Err(err) => {
                    summary.errors += 1;
                    log.error_kv(
                        "while enriching feed item",
                        [("item", item.to_string()), ("err", err.to_string())],
                    );
                }
            }
        }
    }
    drop(enrich_span);

    let post_span = log.span(&RunPhase::Post).entered();
    if suppress_posting {
        log.warn("cache was missing or corrupt; posting suppressed for this run");
    } else if dry_run {
        log.info("dry run; nothing will be posted");
    } else {
        post_all(
            chat,
            &mut enricher,
            &changeset,
            &cache_load.cache,
            &details,
            log,
            &mut summary,
        )
        .await;
    }
    drop(post_span);

    let save_span = log.span(&RunPhase::SaveState).entered();
    summary.cursor_advanced = !dry_run && slice.next_cursor.is_some();
    if dry_run {
        log.info("dry run; cursor left untouched");
    } else {
        // Keep the previous cursor when this run fetched no pages, otherwise
        // a failed fetch would restart pagination from the default feed.
        store
            .save_cursor(slice.next_cursor.or(cursor))
            .context("persisting resumption cursor")?;
        log.info_kv(
            "state persisted",
            [("cursor_advanced", summary.cursor_advanced.to_string())],
        );
    }
    drop(save_span);

    Ok(summary)
}

fn watched_fields() -> Vec<&'static str> {
    OPPORTUNITY_CHANGED_FIELDS.iter().map(|(name, _)| *name).collect()
}

fn partition_by_team(record: &EntityRecord) -> String {
    record
        .get("Team")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn claim_instance(port: u16) -> Option<TcpListener> {
    TcpListener::bind(("127.0.0.1", port)).ok()
}

// Each item is posted independently; one failure is logged and skipped,
// never aborting the run.
async fn post_all(
    chat: &ChatClient,
    enricher: &mut Enricher<'_>,
    changeset: &ChangeSet,
    old_cache: &HashMap<String, EntityRecord>,
    details: &[(&Value, EnrichedDetail)],
    log: &LogCtx<Run>,
    summary: &mut RunSummary,
) {
    for op in &changeset.new {
        let op = match enricher.annotate(op.clone()).await {
            Ok(op) => op,
            Err(err) => {
                summary.errors += 1;
                log.error_kv(
                    "while resolving opportunity references",
                    [
                        ("item", Value::Object(op.clone()).to_string()),
                        ("err", err.to_string()),
                    ],
                );
                continue;
            }
        };
        let msg = fmt_new_opportunity(&op);
        record_outcome(chat.post_inbox(&msg).await, summary, log, "new opportunity", &op);
    }

    for new_op in &changeset.changed {
        let Some(id) = record_id(new_op) else { continue };
        let Some(old_op) = old_cache.get(id) else {
            log.warn_kv(
                "changed opportunity missing from the previous cache",
                [("id", id.to_string())],
            );
            continue;
        };
        let new_op = match enricher.annotate(new_op.clone()).await {
            Ok(op) => op,
            Err(err) => {
                summary.errors += 1;
                log.error_kv(
                    "while resolving opportunity references",
                    [
                        ("item", Value::Object(new_op.clone()).to_string()),
                        ("err", err.to_string()),
                    ],
                );
                continue;
            }
        };
        let msg = fmt_changed_opportunity(old_op, &new_op);
        record_outcome(chat.post_inbox(&msg).await, summary, log, "changed opportunity", &new_op);
    }

    for (item, detail) in details {
        if let Some(id) = get_nested(item, "id").and_then(Value::as_str) {
            log.debug(format!("posting chatter item {id}"));
        }
        match chat.post_inbox(&fmt_chatter_inbox(detail)).await {
            Ok(PostOutcome::Posted) => summary.posted += 1,
            Ok(PostOutcome::Dropped) => summary.dropped += 1,
            Err(err) => {
                summary.errors += 1;
                log.error_kv(
                    "while posting feed item",
                    [("item", item.to_string()), ("err", err.to_string())],
                );
            }
        }
        if let Some(flow) = &chat.config().chatter_chat_flow {
            if let Err(err) = chat.post_chat(flow, &fmt_chat_line(detail)).await {
                summary.errors += 1;
                log.error_kv(
                    "while posting chat line",
                    [("item", item.to_string()), ("err", err.to_string())],
                );
            } else {
                summary.posted += 1;
            }
        }
    }
}

fn record_outcome(
    outcome: Result<PostOutcome, crate::chat::ChatError>,
    summary: &mut RunSummary,
    log: &LogCtx<Run>,
    what: &str,
    record: &EntityRecord,
) {
    match outcome {
        Ok(PostOutcome::Posted) => summary.posted += 1,
        Ok(PostOutcome::Dropped) => summary.dropped += 1,
        Err(err) => {
            summary.errors += 1;
            log.error_kv(
                &format!("while posting {what}"),
                [
                    ("item", Value::Object(record.clone()).to_string()),
                    ("err", err.to_string()),
                ],
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChatConfig;
    use crate::crm::session::CrmError;
    use crate::crm::types::FeedPage;
    use async_trait::async_trait;
    use chrono::DateTime;
    use serde_json::json;

    // One CRM stub behind all three seams: an empty feed page with a fresh
    // cursor, a fixed recent-opportunity result, no entity lookups.
    struct StubCrm {
        opportunities: Vec<EntityRecord>,
    }

    #[async_trait]
    impl FeedSource for StubCrm {
        async fn feed_page(&self, _url: &str) -> Result<FeedPage, CrmError> {
            Ok(FeedPage {
                items: vec![],
                next_page_url: None,
                updates_url: Some("feed-items?updatedsince=42".into()),
            })
        }
    }

    #[async_trait]
    impl OpportunitySource for StubCrm {
        async fn recent_opportunities(
            &self,
            _since: DateTime<Utc>,
        ) -> Result<Vec<EntityRecord>, CrmError> {
            Ok(self.opportunities.clone())
        }
    }

    #[async_trait]
    impl EntityLookup for StubCrm {
        async fn fetch_entity(&self, _kind: &str, _id: &str) -> Result<Value, CrmError> {
            Err(CrmError::Timeout)
        }
    }

    fn opportunity(id: &str, amount: f64) -> EntityRecord {
        serde_json::from_value(json!({
            "Id": id,
            "Name": "Deal",
            "StageName": "Prospecting",
            "Amount": amount,
            "Team": "alpha",
            "LastModifiedDate": "2015-03-06T10:00:00.000+0000",
        }))
        .unwrap()
    }

    fn chat_client() -> ChatClient {
        // no flows configured, so nothing ever leaves the process
        let cfg: ChatConfig = serde_json::from_value(json!({
            "flow_for_team": {},
            "team_inbox": {"source": "CRM", "from_address": "crm@example.com"}
        }))
        .unwrap();
        ChatClient::new(cfg).unwrap()
    }

    fn limits() -> Limits {
        Limits {
            max_seconds: 60 * 60 * 24 * 31,
            max_items: 100,
            max_pages: 5,
            hard_limit: false,
            max_team_items: None,
            instance_port: 0,
        }
    }

    fn store_in(dir: &tempfile::TempDir) -> StateStore {
        StateStore::new(dir.path().join("state.json"), dir.path().join("opportunities.json"))
    }

    fn seed_cache(dir: &tempfile::TempDir, records: &[EntityRecord]) -> String {
        let cache: HashMap<String, EntityRecord> = records
            .iter()
            .map(|r| (record_id(r).unwrap().to_string(), r.clone()))
            .collect();
        let raw = serde_json::to_string(&cache).unwrap();
        std::fs::write(dir.path().join("opportunities.json"), &raw).unwrap();
        raw
    }

    #[tokio::test]
    async fn quiet_opportunity_edits_are_detected_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        seed_cache(&dir, &[opportunity("006A", 100.0)]);
        let store = store_in(&dir);
        // the edit arrives via the recent query alone; the feed is silent
        let crm = StubCrm { opportunities: vec![opportunity("006A", 200.0)] };
        let log = telemetry::run();

        let summary = execute(&crm, &crm, &crm, &chat_client(), &store, &limits(), false, &log)
            .await
            .unwrap();

        assert_eq!(summary.changed, 1);
        assert_eq!(summary.new, 0);
        assert!(summary.cursor_advanced);
        let cache: HashMap<String, EntityRecord> = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("opportunities.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(cache["006A"]["Amount"], json!(200.0));
        let state: Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("state.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(state["updatesUrl"], json!("feed-items?updatedsince=42"));
    }

    #[tokio::test]
    async fn dry_run_leaves_state_files_untouched() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("state.json"), r#"{"updatesUrl":"old-cursor"}"#).unwrap();
        let seeded = seed_cache(&dir, &[opportunity("006A", 100.0)]);
        let store = store_in(&dir);
        let crm = StubCrm {
            opportunities: vec![opportunity("006A", 200.0), opportunity("006B", 5.0)],
        };
        let log = telemetry::run();

        let summary = execute(&crm, &crm, &crm, &chat_client(), &store, &limits(), true, &log)
            .await
            .unwrap();

        // detection still ran, but neither file moved and nothing was posted
        assert_eq!(summary.changed, 1);
        assert_eq!(summary.new, 1);
        assert_eq!(summary.posted, 0);
        assert!(!summary.cursor_advanced);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("state.json")).unwrap(),
            r#"{"updatesUrl":"old-cursor"}"#
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("opportunities.json")).unwrap(),
            seeded
        );
    }
}
