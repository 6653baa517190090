use chrono::{DateTime, Utc};

// Parse an ISO-8601 timestamp as delivered by the CRM API.
// Returns Some(ts) on success; None if unparseable.
pub fn parse_iso_ts(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    // offsets without a colon, e.g. 2015-03-06T10:00:00.000+0000
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.3f%z") {
        return Some(dt.with_timezone(&Utc));
    }
    None
}

/// Render an epoch timestamp for message bodies, e.g. "06 Mar 2015 at 10:00 UTC".
pub fn fmt_timestamp(ts: i64) -> String {
    match DateTime::<Utc>::from_timestamp(ts, 0) {
        Some(dt) => dt.format("%d %b %Y at %H:%M UTC").to_string(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rfc3339_and_no_colon_offsets() {
        let a = parse_iso_ts("2015-03-06T10:00:00+00:00").unwrap();
        let b = parse_iso_ts("2015-03-06T10:00:00.000+0000").unwrap();
        assert_eq!(a.timestamp(), b.timestamp());
        assert_eq!(parse_iso_ts("not a date"), None);
    }

    #[test]
    fn renders_utc() {
        let ts = parse_iso_ts("2015-03-06T10:00:00+02:00").unwrap().timestamp();
        assert_eq!(fmt_timestamp(ts), "06 Mar 2015 at 08:00 UTC");
    }
}
