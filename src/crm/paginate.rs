use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{info, warn};

use crate::crm::session::CrmError;
use crate::crm::types::FeedPage;
use crate::util::json::get_nested;
use crate::util::time::parse_iso_ts;

/// One page fetch of the activity feed; the real implementation is the
/// authenticated CRM client.
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn feed_page(&self, url: &str) -> Result<FeedPage, CrmError>;
}

/// Budgets bounding one pagination pass.
#[derive(Debug, Clone)]
pub struct PageBudget {
    /// Items whose modifiedDate is older than this trip the recency cutoff.
    pub max_age_secs: i64,
    /// Item-count cap. With `hard_limit` this is exact; otherwise the
    /// current page is still appended whole.
    pub max_items: usize,
    /// Upper bound on page fetches; the termination guarantee against a
    /// feed that always advertises a next page.
    pub max_pages: usize,
    /// Hard budgets truncate mid-page the moment a cap or the cutoff trips.
    pub hard_limit: bool,
}

/// Collected feed items plus the run-level resumption cursor.
#[derive(Debug, Default)]
pub struct FeedSlice {
    pub items: Vec<Value>,
    /// The first fetched page's updatesUrl; None when zero pages were
    /// fetched. Later pages' continuation links are page-internal.
    pub next_cursor: Option<String>,
}

/// Walk the feed from `start_url` page by page until the cursor runs out or
/// a budget trips. A transport failure mid-loop aborts only the loop; pages
/// already collected are kept.
pub async fn paginate(
    source: &dyn FeedSource,
    start_url: &str,
    budget: &PageBudget,
    now: DateTime<Utc>,
) -> FeedSlice {
    let mut slice = FeedSlice::default();
    let mut cursor = Some(start_url.to_string());
    let mut pages_fetched = 0usize;
    let mut cutoff_tripped = false;

    while let Some(url) = cursor {
        if cutoff_tripped
            || slice.items.len() >= budget.max_items
            || pages_fetched >= budget.max_pages
        {
            break;
        }

        let page = match source.feed_page(&url).await {
            Ok(page) => page,
            Err(err) => {
                warn!("feed fetch failed, keeping {} items already collected: {err}", slice.items.len());
                break;
            }
        };
        if pages_fetched == 0 {
            slice.next_cursor = page.updates_url.clone();
            if let Some(updates) = &slice.next_cursor {
                info!("future updates at {updates}");
            }
        }
        pages_fetched += 1;

        for item in page.items {
            if budget.hard_limit && slice.items.len() >= budget.max_items {
                break;
            }
            if item_age_secs(&item, now).is_some_and(|age| age > budget.max_age_secs) {
                cutoff_tripped = true;
                if budget.hard_limit {
                    break;
                }
            }
            slice.items.push(item);
        }

        cursor = page.next_page_url;
    }

    slice
}

fn item_age_secs(item: &Value, now: DateTime<Utc>) -> Option<i64> {
    let modified = get_nested(item, "modifiedDate")?.as_str()?;
    Some((now - parse_iso_ts(modified)?).num_seconds())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn item(id: usize, modified: &str) -> Value {
        json!({
            "id": format!("item-{id}"),
            "modifiedDate": modified,
            "parent": {"id": "006A", "type": "Opportunity"},
        })
    }

    fn now() -> DateTime<Utc> {
        parse_iso_ts("2015-03-10T00:00:00+00:00").unwrap()
    }

    fn budget(max_items: usize, max_pages: usize, hard_limit: bool) -> PageBudget {
        PageBudget {
            max_age_secs: 60 * 60 * 24 * 31,
            max_items,
            max_pages,
            hard_limit,
        }
    }

    // Queue-backed feed: each fetch pops the next scripted page.
    struct ScriptedFeed {
        pages: Mutex<VecDeque<Result<FeedPage, CrmError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedFeed {
        fn new(pages: Vec<Result<FeedPage, CrmError>>) -> Self {
            Self {
                pages: Mutex::new(pages.into()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl FeedSource for ScriptedFeed {
        async fn feed_page(&self, _url: &str) -> Result<FeedPage, CrmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.pages
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(CrmError::Timeout))
        }
    }

    // A feed that always advertises another page.
    struct EndlessFeed {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl FeedSource for EndlessFeed {
        async fn feed_page(&self, _url: &str) -> Result<FeedPage, CrmError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(FeedPage {
                items: vec![item(n, "2015-03-09T12:00:00+00:00")],
                next_page_url: Some(format!("page-{}", n + 1)),
                updates_url: if n == 0 { Some("updates".into()) } else { None },
            })
        }
    }

    fn page(items: Vec<Value>, next: Option<&str>, updates: Option<&str>) -> FeedPage {
        FeedPage {
            items,
            next_page_url: next.map(str::to_string),
            updates_url: updates.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn cursor_comes_from_first_page_only() {
        let feed = ScriptedFeed::new(vec![
            Ok(page(
                vec![item(1, "2015-03-09T12:00:00+00:00")],
                Some("p2"),
                Some("updates-1"),
            )),
            Ok(page(
                vec![item(2, "2015-03-09T11:00:00+00:00")],
                None,
                Some("updates-2"),
            )),
        ]);
        let slice = paginate(&feed, "start", &budget(100, 5, false), now()).await;
        assert_eq!(slice.items.len(), 2);
        assert_eq!(slice.next_cursor.as_deref(), Some("updates-1"));
    }

    #[tokio::test]
    async fn terminates_within_max_pages_on_endless_feed() {
        let feed = EndlessFeed { calls: AtomicUsize::new(0) };
        let slice = paginate(&feed, "start", &budget(1000, 5, false), now()).await;
        assert_eq!(feed.calls.load(Ordering::SeqCst), 5);
        assert_eq!(slice.items.len(), 5);
    }

    #[tokio::test]
    async fn hard_limit_truncates_mid_page() {
        let items = (0..5).map(|i| item(i, "2015-03-09T12:00:00+00:00")).collect();
        let feed = ScriptedFeed::new(vec![Ok(page(items, Some("p2"), None))]);
        let slice = paginate(&feed, "start", &budget(3, 5, true), now()).await;
        assert_eq!(slice.items.len(), 3);
    }

    #[tokio::test]
    async fn soft_limit_finishes_the_current_page() {
        let items = (0..5).map(|i| item(i, "2015-03-09T12:00:00+00:00")).collect();
        let feed = ScriptedFeed::new(vec![
            Ok(page(items, Some("p2"), None)),
            Ok(page(vec![item(9, "2015-03-09T12:00:00+00:00")], None, None)),
        ]);
        let slice = paginate(&feed, "start", &budget(3, 5, false), now()).await;
        // the first page is appended whole; no second fetch happens
        assert_eq!(slice.items.len(), 5);
    }

    #[tokio::test]
    async fn age_cutoff_stops_fetching() {
        let feed = ScriptedFeed::new(vec![
            Ok(page(
                vec![
                    item(1, "2015-03-09T12:00:00+00:00"),
                    item(2, "2010-01-01T00:00:00+00:00"), // ancient
                ],
                Some("p2"),
                None,
            )),
            Ok(page(vec![item(3, "2015-03-09T12:00:00+00:00")], None, None)),
        ]);
        let slice = paginate(&feed, "start", &budget(100, 5, false), now()).await;
        // soft budget: the tripping item still lands in the slice
        assert_eq!(slice.items.len(), 2);
        assert_eq!(feed.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn hard_age_cutoff_drops_the_tripping_item() {
        let feed = ScriptedFeed::new(vec![Ok(page(
            vec![
                item(1, "2015-03-09T12:00:00+00:00"),
                item(2, "2010-01-01T00:00:00+00:00"),
                item(3, "2015-03-09T12:00:00+00:00"),
            ],
            None,
            None,
        ))]);
        let slice = paginate(&feed, "start", &budget(100, 5, true), now()).await;
        assert_eq!(slice.items.len(), 1);
    }

    #[tokio::test]
    async fn zero_caps_fetch_nothing() {
        let feed = ScriptedFeed::new(vec![]);
        let slice = paginate(&feed, "start", &budget(100, 0, false), now()).await;
        assert!(slice.items.is_empty());
        assert_eq!(slice.next_cursor, None);
        assert_eq!(feed.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn transport_error_keeps_prior_pages() {
        let feed = ScriptedFeed::new(vec![
            Ok(page(
                vec![item(1, "2015-03-09T12:00:00+00:00")],
                Some("p2"),
                Some("updates-1"),
            )),
            Err(CrmError::Timeout),
        ]);
        let slice = paginate(&feed, "start", &budget(100, 5, false), now()).await;
        assert_eq!(slice.items.len(), 1);
        assert_eq!(slice.next_cursor.as_deref(), Some("updates-1"));
    }
}
