pub mod sha512;

use chrono::{DateTime, Utc};
pub use sha512::ResumableSha512;

/// Formats a timestamp as an RFC 7231 HTTP-date.
pub fn http_date(time: &DateTime<Utc>) -> String {
    time.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
