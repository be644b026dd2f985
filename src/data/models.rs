//! Data models
//!
//! Rust structs representing database rows.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Time encoding
// =============================================================================

/// Encode a timestamp so that lexical order equals chronological order.
///
/// Example: "2024-05-01T10:00:00.000000000Z"
pub fn encode_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Decode a timestamp written by [`encode_time`] (or any RFC 3339 value).
pub fn decode_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}

// =============================================================================
// Followers
// =============================================================================

/// A remote actor following one of the local blogs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Follower {
    pub blog: String,
    /// Actor IRI of the follower
    pub follower: String,
    /// Inbox used for delivery (shared inbox when advertised)
    pub inbox: String,
    /// Display handle, e.g. "@alice@peer.example"
    pub username: String,
}

// =============================================================================
// Queue
// =============================================================================

/// A durable queue entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    /// Monotonically assigned row id
    pub id: i64,
    pub topic: String,
    pub payload: Vec<u8>,
    /// Invisible to `peek` until this instant
    pub scheduled_at: DateTime<Utc>,
}

// =============================================================================
// Settings keys
// =============================================================================

/// Settings key holding the `movedTo` IRI of a blog
pub fn moved_to_key(blog: &str) -> String {
    format!("movedto_{}", blog)
}

/// Settings key holding the ActivityPub object version of a post
pub fn post_version_key(path: &str) -> String {
    format!("activitypubversion_{}", path)
}

/// Persistent cache key of a certificate bundle
pub fn cert_cache_key(host: &str) -> String {
    format!("https_{}", host)
}

/// Settings key of the serialized ACME account
pub const ACME_ACCOUNT_KEY: &str = "acme_account_key";

/// Persistent cache key of the instance RSA key
pub const ACTIVITYPUB_KEY: &str = "activitypub_key";

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn encoded_times_sort_chronologically() {
        let early = Utc.with_ymd_and_hms(2024, 1, 1, 9, 59, 59).unwrap();
        let late = early + chrono::Duration::nanoseconds(1);
        let much_later = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();

        let mut encoded = vec![
            encode_time(much_later),
            encode_time(late),
            encode_time(early),
        ];
        encoded.sort();
        assert_eq!(
            encoded,
            vec![encode_time(early), encode_time(late), encode_time(much_later)]
        );
        assert_eq!(decode_time(&encode_time(late)), Some(late));
    }
}
