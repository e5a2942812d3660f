use chrono::{SecondsFormat, Utc};

/// UTC timestamp in the canonical on-disk format (`Z` suffix, millis).
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
