//! # Tweet Data Ingestor
//!
//! Turns one raw API page into validated, de-duplicated [`TweetRecord`]s.
//!
//! ## Module Structure
//!
//! ```text
//!     ingest/
//!     ├── mod.rs          (You are here - payload parsing and validation)
//!     ├── dedup.rs        (Concurrent set of seen ids / hashes)
//!     └── record.rs       (TweetRecord, RawHash, export row)
//! ```
//!
//! ## Per-entry Flow
//!
//! ```text
//!     payload ──parse──► [entry, entry, ...]        (unparsable ──► MalformedPayload)
//!                          │
//!                          ▼
//!                     raw_hash seen? ──yes──► skipped += 1
//!                          │ no
//!                          ▼
//!                     valid fields?  ──no───► skipped += 1
//!                          │ yes
//!                          ▼
//!                     dedup.try_insert ─lost─► skipped += 1
//!                          │ won
//!                          ▼
//!                     records.push (input order kept)
//! ```
//!
//! Default payload shape:
//!
//! ```text
//!     { "data": [ {id, author_id, created_at, text, public_metrics, referenced_tweets} ],
//!       "includes": { "users": [ {id, username} ] },
//!       "meta": { "next_token": "..." } }
//! ```

mod dedup;
mod record;

pub use dedup::DedupSet;
pub use record::{
    ExportRow, RawHash, TweetRecord, LEGACY_TIME_FORMAT, METRIC_BOOKMARKS, METRIC_LIKES,
    METRIC_QUOTES, METRIC_REPLIES, METRIC_RETWEETS,
};

use crate::error::IngestError;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::value::RawValue;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

#[derive(Deserialize)]
struct Page<'a> {
    #[serde(borrow, default)]
    data: Option<Vec<&'a RawValue>>,
    #[serde(default)]
    includes: Option<Includes>,
    #[serde(default)]
    meta: Option<Meta>,
}

#[derive(Deserialize, Default)]
struct Includes {
    #[serde(default)]
    users: Vec<User>,
}

#[derive(Deserialize)]
struct User {
    id: String,
    username: Option<String>,
}

#[derive(Deserialize, Default)]
struct Meta {
    next_token: Option<String>,
}

#[derive(Deserialize)]
struct Entry {
    id: Option<String>,
    #[serde(default)]
    author_id: Option<String>,
    created_at: Option<String>,
    text: Option<String>,
    #[serde(default)]
    public_metrics: Option<PublicMetrics>,
    #[serde(default)]
    referenced_tweets: Vec<Reference>,
}

#[derive(Deserialize, Default)]
struct PublicMetrics {
    like_count: Option<u64>,
    retweet_count: Option<u64>,
    reply_count: Option<u64>,
    quote_count: Option<u64>,
    bookmark_count: Option<u64>,
}

#[derive(Deserialize)]
struct Reference {
    #[serde(rename = "type")]
    kind: String,
}

/// Result of ingesting one page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestBatch {
    /// New records, in payload order.
    pub records: Vec<TweetRecord>,
    /// Entries dropped as duplicates or invalid.
    pub skipped: usize,
    /// Entries seen in the payload.
    pub entries: usize,
    /// Cursor for the next page, if the source reported one.
    pub next_cursor: Option<String>,
}

/// Parses pages against a shared [`DedupSet`].
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use tweetpace::{DedupSet, TweetIngestor};
///
/// let ingestor = TweetIngestor::new(Arc::new(DedupSet::new()));
/// let page = br#"{"data":[{"id":"1","author_id":"9","created_at":"2024-05-13T09:30:00Z","text":"hi"}]}"#;
///
/// let first = ingestor.ingest(page).unwrap();
/// assert_eq!(first.records.len(), 1);
///
/// let again = ingestor.ingest(page).unwrap();
/// assert!(again.records.is_empty());
/// assert_eq!(again.skipped, 1);
/// ```
#[derive(Clone)]
pub struct TweetIngestor {
    dedup: Arc<DedupSet>,
}

impl TweetIngestor {
    /// Ingestor sharing `dedup` with every other ingestor holding it.
    pub fn new(dedup: Arc<DedupSet>) -> Self {
        Self { dedup }
    }

    /// The shared dedup set.
    pub fn dedup(&self) -> &Arc<DedupSet> {
        &self.dedup
    }

    /// Parses `payload` and returns the records not seen before.
    ///
    /// Only a payload that cannot be parsed at all is an error; bad entries
    /// are counted in `skipped`.
    pub fn ingest(&self, payload: &[u8]) -> Result<IngestBatch, IngestError> {
        let page: Page<'_> = serde_json::from_slice(payload)
            .map_err(|err| IngestError::MalformedPayload(err.to_string()))?;

        let usernames: HashMap<String, String> = page
            .includes
            .unwrap_or_default()
            .users
            .into_iter()
            .filter_map(|user| Some((user.id, user.username?)))
            .collect();

        let entries = page.data.unwrap_or_default();
        let scraped_at = Utc::now();
        let mut batch = IngestBatch {
            records: Vec::with_capacity(entries.len()),
            skipped: 0,
            entries: entries.len(),
            next_cursor: page
                .meta
                .and_then(|meta| meta.next_token)
                .filter(|token| !token.is_empty()),
        };

        for raw in entries {
            let raw_hash = RawHash::of(raw.get().as_bytes());
            if self.dedup.contains_hash(&raw_hash) {
                batch.skipped += 1;
                continue;
            }

            let Some(record) = build_record(raw, raw_hash, &usernames, scraped_at) else {
                batch.skipped += 1;
                continue;
            };

            if self.dedup.try_insert(&record) {
                batch.records.push(record);
            } else {
                batch.skipped += 1;
            }
        }

        debug!(
            "Ingested {} new records ({} skipped of {})",
            batch.records.len(),
            batch.skipped,
            batch.entries
        );
        Ok(batch)
    }
}

impl fmt::Debug for TweetIngestor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TweetIngestor")
            .field("dedup", &self.dedup)
            .finish()
    }
}

/// Accepts RFC 3339 or the legacy `Mon May 13 09:30:00 +0000 2024` layout.
fn parse_created_at(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .or_else(|_| DateTime::parse_from_str(value, LEGACY_TIME_FORMAT))
        .ok()
        .map(|time| time.with_timezone(&Utc))
}

fn build_record(
    raw: &RawValue,
    raw_hash: RawHash,
    usernames: &HashMap<String, String>,
    scraped_at: DateTime<Utc>,
) -> Option<TweetRecord> {
    let entry: Entry = serde_json::from_str(raw.get()).ok()?;

    let id = entry.id.filter(|id| !id.trim().is_empty())?;
    let text = entry.text.filter(|text| !text.trim().is_empty())?;
    let created_at = entry.created_at.as_deref().and_then(parse_created_at)?;
    let author_id = entry.author_id.unwrap_or_default();

    let metrics = entry.public_metrics.unwrap_or_default();
    let mut engagement_metrics = BTreeMap::new();
    for (name, value) in [
        (METRIC_LIKES, metrics.like_count),
        (METRIC_RETWEETS, metrics.retweet_count),
        (METRIC_REPLIES, metrics.reply_count),
        (METRIC_QUOTES, metrics.quote_count),
        (METRIC_BOOKMARKS, metrics.bookmark_count),
    ] {
        engagement_metrics.insert(name.to_string(), value.unwrap_or(0));
    }

    let references = |kind: &str| entry.referenced_tweets.iter().any(|r| r.kind == kind);

    Some(TweetRecord {
        username: usernames.get(&author_id).cloned(),
        is_retweet: references("retweeted"),
        is_quote: references("quoted"),
        id,
        author_id,
        created_at,
        text,
        engagement_metrics,
        raw_hash,
        scraped_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    const PAGE: &str = r#"{
        "data": [
            {"id": "10", "author_id": "1", "created_at": "2024-05-13T09:30:00.000Z", "text": "first",
             "public_metrics": {"like_count": 5, "retweet_count": 2, "reply_count": 1, "quote_count": 0}},
            {"id": "11", "author_id": "2", "created_at": "Mon May 13 10:00:00 +0000 2024", "text": "second",
             "referenced_tweets": [{"type": "quoted", "id": "3"}]},
            {"id": "12", "author_id": "1", "created_at": "2024-05-13T11:00:00Z", "text": "   "},
            {"id": "13", "author_id": "1", "text": "no time"},
            {"author_id": "1", "created_at": "2024-05-13T11:00:00Z", "text": "no id"},
            "not an object"
        ],
        "includes": {"users": [{"id": "1", "username": "alice"}]},
        "meta": {"next_token": "abc"}
    }"#;

    fn ingestor() -> TweetIngestor {
        TweetIngestor::new(Arc::new(DedupSet::new()))
    }

    #[test]
    fn test_valid_entries_kept_in_order() {
        let batch = ingestor().ingest(PAGE.as_bytes()).unwrap();
        let ids: Vec<&str> = batch.records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["10", "11"]);
        assert_eq!(batch.skipped, 4);
        assert_eq!(batch.entries, 6);
        assert_eq!(batch.next_cursor.as_deref(), Some("abc"));

        let first = &batch.records[0];
        assert_eq!(first.username.as_deref(), Some("alice"));
        assert_eq!(first.metric(METRIC_LIKES), 5);
        assert_eq!(first.metric(METRIC_BOOKMARKS), 0);
        assert!(!first.is_quote);

        let second = &batch.records[1];
        assert_eq!(second.username, None);
        assert!(second.is_quote);
        assert!(!second.is_retweet);
    }

    #[test]
    fn test_repeat_payload_yields_nothing_new() {
        let ingestor = ingestor();
        ingestor.ingest(PAGE.as_bytes()).unwrap();
        let again = ingestor.ingest(PAGE.as_bytes()).unwrap();
        assert!(again.records.is_empty());
        assert_eq!(again.skipped, again.entries);
    }

    #[test]
    fn test_same_id_different_bytes_is_duplicate() {
        let ingestor = ingestor();
        let a = br#"{"data":[{"id":"7","created_at":"2024-01-01T00:00:00Z","text":"v1"}]}"#;
        let b = br#"{"data":[{"id":"7","created_at":"2024-01-01T00:00:00Z","text":"v2"}]}"#;
        assert_eq!(ingestor.ingest(a).unwrap().records.len(), 1);
        let second = ingestor.ingest(b).unwrap();
        assert!(second.records.is_empty());
        assert_eq!(second.skipped, 1);
    }

    #[test]
    fn test_empty_and_missing_data() {
        let batch = ingestor().ingest(br#"{"meta": {"result_count": 0}}"#).unwrap();
        assert!(batch.records.is_empty());
        assert_eq!(batch.entries, 0);
        assert_eq!(batch.next_cursor, None);

        let batch = ingestor().ingest(br#"{"data": [], "meta": {"next_token": ""}}"#).unwrap();
        assert_eq!(batch.next_cursor, None);
    }

    #[test]
    fn test_malformed_payload() {
        for payload in [&b"not json"[..], b"[1, 2]", b"{\"data\": 5}", b""] {
            let err = ingestor().ingest(payload).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::MalformedPayload);
        }
    }
}
