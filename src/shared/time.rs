use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub fn parse_rfc3339_secs(raw: &str) -> Result<i64, String> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|dt| dt.timestamp())
        .map_err(|err| format!("invalid RFC 3339 timestamp `{raw}`: {err}"))
}

pub fn format_rfc3339(unix_secs: i64) -> String {
    Utc.timestamp_opt(unix_secs, 0)
        .single()
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc3339_round_trips_through_unix_seconds() {
        let secs = parse_rfc3339_secs("2024-01-01T00:00:00Z").expect("parse");
        assert_eq!(secs, 1_704_067_200);
        assert_eq!(format_rfc3339(secs), "2024-01-01T00:00:00Z");
        assert!(parse_rfc3339_secs("tomorrow").is_err());
    }
}
