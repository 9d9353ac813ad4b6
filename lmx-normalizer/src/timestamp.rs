use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde_json::Value;

/// Epoch values below this are seconds; at or above, milliseconds. One source
/// emits seconds while the rest emit milliseconds or ISO strings, and the
/// cutoff is load-bearing for downstream fixtures, so it stays exactly here.
const EPOCH_MILLIS_CUTOFF: f64 = 1e12;

/// Convert a heterogeneous raw timestamp (epoch seconds, epoch milliseconds,
/// numeric string, ISO string) into a strict ISO-8601 UTC string.
///
/// Returns `None` for anything unrepresentable: `null`, `0`, empty strings,
/// unparseable text. Callers treat a missing timestamp as "unknown", so this
/// never errors and never substitutes a default instant.
pub fn normalize_timestamp(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => from_epoch(n.as_f64()?),
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return None;
            }
            if let Ok(n) = s.parse::<f64>() {
                return from_epoch(n);
            }
            parse_datetime(s)
        }
        _ => None,
    }
}

/// Convenience for the usual `data.get("...")` call sites.
pub fn normalize_opt(value: Option<&Value>) -> Option<String> {
    value.and_then(normalize_timestamp)
}

fn from_epoch(n: f64) -> Option<String> {
    if n == 0.0 || !n.is_finite() {
        return None;
    }
    let millis = if n.abs() < EPOCH_MILLIS_CUTOFF {
        n * 1000.0
    } else {
        n
    };
    let dt = Utc.timestamp_millis_opt(millis as i64).single()?;
    Some(to_iso(dt))
}

fn parse_datetime(s: &str) -> Option<String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(to_iso(dt.with_timezone(&Utc)));
    }
    if let Ok(ndt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(to_iso(Utc.from_utc_datetime(&ndt)));
    }
    if let Ok(nd) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(to_iso(Utc.from_utc_datetime(&nd.and_hms_opt(0, 0, 0)?)));
    }
    None
}

fn to_iso(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn epoch_seconds_and_millis_agree() {
        let secs = normalize_timestamp(&json!(1_757_514_180)).unwrap();
        let millis = normalize_timestamp(&json!(1_757_514_180_000_i64)).unwrap();
        assert_eq!(secs, millis);
        assert_eq!(secs, "2025-09-10T14:23:00Z");
    }

    #[test]
    fn numeric_strings_are_parsed_first() {
        assert_eq!(
            normalize_timestamp(&json!("1757514180")),
            normalize_timestamp(&json!(1_757_514_180))
        );
    }

    #[test]
    fn iso_strings_round_trip_to_utc() {
        assert_eq!(
            normalize_timestamp(&json!("2025-09-10T14:23:00Z")).as_deref(),
            Some("2025-09-10T14:23:00Z")
        );
        // Offset forms collapse to the same instant in UTC
        assert_eq!(
            normalize_timestamp(&json!("2025-09-10T16:23:00+02:00")).as_deref(),
            Some("2025-09-10T14:23:00Z")
        );
    }

    #[test]
    fn space_separated_and_date_only_forms() {
        assert_eq!(
            normalize_timestamp(&json!("2025-09-10 14:23:00")).as_deref(),
            Some("2025-09-10T14:23:00Z")
        );
        assert_eq!(
            normalize_timestamp(&json!("2025-09-10")).as_deref(),
            Some("2025-09-10T00:00:00Z")
        );
    }

    #[test]
    fn falsy_inputs_are_absent_not_epoch() {
        assert_eq!(normalize_timestamp(&Value::Null), None);
        assert_eq!(normalize_timestamp(&json!(0)), None);
        assert_eq!(normalize_timestamp(&json!("")), None);
        assert_eq!(normalize_opt(None), None);
    }

    #[test]
    fn garbage_is_dropped_not_defaulted() {
        assert_eq!(normalize_timestamp(&json!("next tuesday")), None);
        assert_eq!(normalize_timestamp(&json!(true)), None);
        assert_eq!(normalize_timestamp(&json!(f64::NAN)), None);
    }

    #[test]
    fn fractional_epoch_seconds_keep_subsecond_precision() {
        assert_eq!(
            normalize_timestamp(&json!(1_757_514_180.5)).as_deref(),
            Some("2025-09-10T14:23:00.500Z")
        );
    }
}
