//! Pure message formatting: no I/O, no side effects.
//!
//! Two shapes: a terse one-line-ish chat message, and a structured
//! inbox post (`InboxMessage`) for the threaded team inbox.

use serde::Serialize;
use serde_json::Value;

use crate::crm::types::{EntityRecord, OPPORTUNITY_CHANGED_FIELDS};
use crate::enrich::EnrichedDetail;
use crate::util::json::value_to_display;
use crate::util::time::{fmt_timestamp, parse_iso_ts};

const SNIPPET_LEN: usize = 40;

/// Structured payload for a team-inbox post.
#[derive(Debug, Clone, Serialize)]
pub struct InboxMessage {
    pub team_name: String,
    pub subject: String,
    pub text_content: String,
    pub project: String,
}

/// Format a number with grouping separators, dropping the decimals of
/// integral floats: 50000 and 50000.0 both render as "50,000", 12.5 as "12.5".
pub fn fmt_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        group_digits(n as i64)
    } else {
        let s = n.to_string();
        match s.split_once('.') {
            Some((int_part, frac)) => {
                let (sign, digits) = match int_part.strip_prefix('-') {
                    Some(d) => ("-", d),
                    None => ("", int_part),
                };
                let int: i64 = digits.parse().unwrap_or_default();
                format!("{sign}{}.{frac}", group_digits(int))
            }
            None => s,
        }
    }
}

fn group_digits(n: i64) -> String {
    let digits = n.abs().to_string();
    let mut grouped = String::new();
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    if n < 0 {
        format!("-{grouped}")
    } else {
        grouped
    }
}

/// The text itself, or a "prefix…" capped at `max_len` characters.
pub fn snippet(text: &str, max_len: usize) -> String {
    let max_len = max_len.max(1);
    if text.chars().count() > max_len {
        let prefix: String = text.chars().take(max_len - 1).collect();
        format!("{prefix}…")
    } else {
        text.to_string()
    }
}

// Values skipped from optional line items: null, empty string, zero, false.
fn is_blank(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::Bool(b) => !b,
        _ => false,
    }
}

// Display form with numbers grouped; the "¡Missing! …" sentinel passes
// through untouched so schema anomalies stay visible in the output.
fn fmt_value(v: &Value) -> String {
    match v.as_f64() {
        Some(n) => fmt_number(n),
        None => value_to_display(v),
    }
}

// A watched field cleared to null reads "(none)" in diff lines, not an
// empty arrow end.
fn diff_value(v: &Value) -> String {
    if v.is_null() {
        "(none)".to_string()
    } else {
        fmt_value(v)
    }
}

fn field<'a>(op: &'a EntityRecord, name: &str) -> &'a Value {
    op.get(name).unwrap_or(&Value::Null)
}

fn field_str(op: &EntityRecord, name: &str) -> String {
    value_to_display(field(op, name))
}

fn push_item(items: &mut Vec<String>, label: &str, v: &Value, suffix: &str) {
    if !is_blank(v) {
        items.push(format!("{label}{}{suffix}", fmt_value(v)));
    }
}

// "Stage: X, Owner: Y, Account: Z." plus the optional value line.
fn opportunity_summary(op: &EntityRecord) -> String {
    let mut txt = format!(
        "Stage: {}, Owner: {}, Account: {}.",
        field_str(op, "StageName"),
        field_str(op, "OwnerName"),
        field_str(op, "AccountName"),
    );
    let mut items = Vec::new();
    push_item(&mut items, "Amount: ", field(op, "Amount"), "");
    push_item(&mut items, "Probability: ", field(op, "Probability"), "%");
    push_item(&mut items, "Avg. hour price: ", field(op, "AvgHourPrice"), "");
    push_item(&mut items, "Close date: ", field(op, "CloseDate"), "");
    push_item(&mut items, "Type of sales: ", field(op, "TypeOfSales"), "");
    if !items.is_empty() {
        txt.push('\n');
        txt.push_str(&items.join(", "));
        txt.push('.');
    }
    txt
}

fn parsed_ts(op: &EntityRecord, name: &str) -> i64 {
    field(op, name)
        .as_str()
        .and_then(parse_iso_ts)
        .map(|dt| dt.timestamp())
        .unwrap_or_default()
}

/// Terse single-string rendering of a chatter item for a chat flow.
pub fn fmt_chat_line(detail: &EnrichedDetail) -> String {
    let mut result = format!(
        "{} ({}, owner {}, account {}) ",
        value_to_display(&detail.opportunity_name),
        value_to_display(&detail.stage),
        value_to_display(&detail.owner_name),
        value_to_display(&detail.account_name),
    );

    let mut items = Vec::new();
    push_item(&mut items, "Amount: ", &detail.amount, "");
    push_item(&mut items, "Probability: ", &detail.probability, "");
    push_item(&mut items, "Avg. hour price: ", &detail.avg_hour_price, "");
    push_item(&mut items, "Close date: ", &detail.close_date, "");
    push_item(&mut items, "Type of sales: ", &detail.type_of_sales, "");
    result.push('\n');
    result.push_str(&items.join(", "));

    result.push_str("\n\n");
    result.push_str(&value_to_display(&detail.actor_name));
    if !is_blank(&detail.text) {
        result.push_str(" – ");
        result.push_str(&value_to_display(&detail.text));
    }
    result
}

/// Inbox post for an opportunity chatter comment.
pub fn fmt_chatter_inbox(detail: &EnrichedDetail) -> InboxMessage {
    let mut txt = String::new();
    if !is_blank(&detail.text) {
        txt.push_str(&value_to_display(&detail.text));
        txt.push_str("\n\n");
    }

    txt.push_str(&format!(
        "– {} ({})",
        value_to_display(&detail.actor_name),
        fmt_timestamp(detail.modified_ts),
    ));

    txt.push_str(&format!(
        "\n\nStage: {}, Owner: {}, Account: {}.",
        value_to_display(&detail.stage),
        value_to_display(&detail.owner_name),
        value_to_display(&detail.account_name),
    ));

    let mut items = Vec::new();
    push_item(&mut items, "Amount ", &detail.amount, "");
    push_item(&mut items, "Probability ", &detail.probability, "%");
    push_item(&mut items, "Avg. hour price ", &detail.avg_hour_price, "");
    push_item(&mut items, "Close date ", &detail.close_date, "");
    push_item(&mut items, "Type of sales: ", &detail.type_of_sales, "");
    txt.push('\n');
    txt.push_str(&items.join(", "));
    txt.push('.');

    InboxMessage {
        team_name: value_to_display(&detail.team),
        subject: format!(
            "[chatter] {} – {}",
            value_to_display(&detail.opportunity_name),
            value_to_display(&detail.actor_name),
        ),
        text_content: txt,
        project: value_to_display(&detail.account_name),
    }
}

/// Inbox post announcing a newly seen opportunity.
pub fn fmt_new_opportunity(op: &EntityRecord) -> InboxMessage {
    let mut txt = String::new();
    if !is_blank(field(op, "Description")) {
        txt.push_str(&field_str(op, "Description"));
        txt.push_str("\n\n");
    }

    let created = parsed_ts(op, "CreatedDate");
    txt.push_str(&format!(
        "– {} created by {}",
        fmt_timestamp(created),
        field_str(op, "CreatedByName"),
    ));

    if field(op, "LastModifiedDate") != field(op, "CreatedDate") {
        let modified = parsed_ts(op, "LastModifiedDate");
        txt.push_str(&format!(
            "\n– {} modified by {}",
            fmt_timestamp(modified),
            field_str(op, "LastModifiedByName"),
        ));
    }

    txt.push_str("\n\n");
    txt.push_str(&opportunity_summary(op));

    InboxMessage {
        team_name: field_str(op, "Team"),
        subject: format!(
            "{} — {}",
            field_str(op, "Name"),
            field_str(op, "CreatedByName"),
        ),
        text_content: txt,
        project: field_str(op, "AccountName"),
    }
}

/// Inbox post for a changed opportunity, listing the watched fields that
/// differ between the cached and the fresh version.
pub fn fmt_changed_opportunity(old: &EntityRecord, new: &EntityRecord) -> InboxMessage {
    let mut txt = String::from("Updated fields:\n");
    for (name, display) in OPPORTUNITY_CHANGED_FIELDS {
        let old_v = field(old, name);
        let new_v = field(new, name);
        if old_v == new_v {
            continue;
        }
        if *name == "Description" {
            // long by nature; show the new value whole
            txt.push_str(&format!("{display}: {}\n", diff_value(new_v)));
        } else {
            txt.push_str(&format!(
                "{display}: {} → {}\n",
                snippet(&diff_value(old_v), SNIPPET_LEN),
                snippet(&diff_value(new_v), SNIPPET_LEN),
            ));
        }
    }

    let modified = parsed_ts(new, "LastModifiedDate");
    txt.push_str(&format!(
        "\n– {} modified by {}",
        fmt_timestamp(modified),
        field_str(new, "LastModifiedByName"),
    ));

    txt.push_str("\n\n");
    txt.push_str(&opportunity_summary(new));

    InboxMessage {
        team_name: field_str(new, "Team"),
        subject: format!(
            "[updated] {} — {}",
            field_str(new, "Name"),
            field_str(new, "LastModifiedByName"),
        ),
        text_content: txt,
        project: field_str(new, "AccountName"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(pairs: &[(&str, Value)]) -> EntityRecord {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn sample_op() -> EntityRecord {
        record(&[
            ("Id", json!("006A")),
            ("Name", json!("Big Deal")),
            ("StageName", json!("Prospecting")),
            ("Amount", json!(50000.0)),
            ("Probability", json!(60)),
            ("AvgHourPrice", json!(0)),
            ("CloseDate", json!("2015-04-01")),
            ("TypeOfSales", json!(null)),
            ("Description", json!("")),
            ("OwnerName", json!("Ada")),
            ("AccountName", json!("Acme")),
            ("Team", json!("Tammerforce")),
            ("CreatedDate", json!("2015-03-06T10:00:00.000+0000")),
            ("LastModifiedDate", json!("2015-03-06T10:00:00.000+0000")),
            ("CreatedByName", json!("Ada")),
            ("LastModifiedByName", json!("Grace")),
        ])
    }

    #[test]
    fn number_formatting() {
        assert_eq!(fmt_number(50000.0), "50,000");
        assert_eq!(fmt_number(50000.5), "50,000.5");
        assert_eq!(fmt_number(12.5), "12.5");
        assert_eq!(fmt_number(999.0), "999");
        assert_eq!(fmt_number(1000.0), "1,000");
        assert_eq!(fmt_number(-1234567.0), "-1,234,567");
        assert_eq!(fmt_number(-0.5), "-0.5");
        assert_eq!(fmt_number(0.0), "0");
    }

    #[test]
    fn snippet_truncates_with_ellipsis() {
        assert_eq!(snippet("short", 40), "short");
        let long = "x".repeat(50);
        let s = snippet(&long, 40);
        assert_eq!(s.chars().count(), 40);
        assert!(s.ends_with('…'));
        // exact fit is left alone
        assert_eq!(snippet("abcd", 4), "abcd");
    }

    #[test]
    fn new_opportunity_message() {
        let msg = fmt_new_opportunity(&sample_op());
        assert_eq!(msg.team_name, "Tammerforce");
        assert_eq!(msg.subject, "Big Deal — Ada");
        assert_eq!(msg.project, "Acme");
        // empty Description is skipped, summary present with grouped amount
        assert!(msg.text_content.starts_with("– 06 Mar 2015"));
        assert!(msg.text_content.contains("Amount: 50,000"));
        assert!(msg.text_content.contains("Probability: 60%"));
        // zero and null line items are skipped
        assert!(!msg.text_content.contains("Avg. hour price"));
        assert!(!msg.text_content.contains("Type of sales"));
    }

    #[test]
    fn changed_opportunity_lists_only_differing_watched_fields() {
        let old = sample_op();
        let mut new = sample_op();
        new.insert("Amount".to_string(), json!(75000.0));
        new.insert("StageName".to_string(), json!("Negotiation"));
        let msg = fmt_changed_opportunity(&old, &new);
        assert_eq!(msg.subject, "[updated] Big Deal — Grace");
        assert!(msg.text_content.contains("Amount: 50,000 → 75,000"));
        assert!(msg.text_content.contains("Stage: Prospecting → Negotiation\n"));
        // unchanged watched fields stay out of the diff section
        assert!(!msg.text_content.contains("Close date: 2015-04-01 →"));
    }

    #[test]
    fn cleared_field_diffs_to_an_explicit_none_marker() {
        let old = sample_op();
        let mut new = sample_op();
        new.insert("CloseDate".to_string(), json!(null));
        new.insert("TypeOfSales".to_string(), json!("Direct"));
        let msg = fmt_changed_opportunity(&old, &new);
        assert!(msg.text_content.contains("Close date: 2015-04-01 → (none)"));
        assert!(msg.text_content.contains("Type of sales: (none) → Direct"));
    }

    #[test]
    fn changed_opportunity_truncates_long_values() {
        let mut old = sample_op();
        old.insert("Name".to_string(), json!("y".repeat(80)));
        let new = sample_op();
        let msg = fmt_changed_opportunity(&old, &new);
        let line = msg
            .text_content
            .lines()
            .find(|l| l.starts_with("Name:"))
            .unwrap();
        assert!(line.contains('…'));
        assert!(line.ends_with("Big Deal"));
    }
}
