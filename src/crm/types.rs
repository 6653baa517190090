use serde::Deserialize;
use serde_json::Value;

/// A CRM business record as returned by the API: a flat-ish JSON object
/// keyed by field name. The local cache stores the last-seen version.
pub type EntityRecord = serde_json::Map<String, Value>;

/// Opportunity fields whose changes get reported, with their display names.
/// Order here is the order they appear in change messages.
pub const OPPORTUNITY_CHANGED_FIELDS: &[(&str, &str)] = &[
    ("Name", "Name"),
    ("StageName", "Stage"),
    ("Amount", "Amount"),
    ("Probability", "Probability"),
    ("AvgHourPrice", "Avg. hour price"),
    ("CloseDate", "Close date"),
    ("TypeOfSales", "Type of sales"),
    ("Description", "Description"),
];

/// One page of the activity feed. Items stay loosely typed; the interesting
/// fields are pulled out with `util::json::get_nested`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedPage {
    #[serde(default)]
    pub items: Vec<Value>,
    #[serde(default)]
    pub next_page_url: Option<String>,
    /// Present only on the first page of a feed request; resuming from this
    /// URL next run yields only newer activity.
    #[serde(default)]
    pub updates_url: Option<String>,
}

/// Record id helper; CRM ids are strings and every record carries one.
pub fn record_id(record: &EntityRecord) -> Option<&str> {
    record.get("Id").and_then(Value::as_str)
}
