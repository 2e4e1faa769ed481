//! Canonical tweet record and its export shape.

use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Like count metric name.
pub const METRIC_LIKES: &str = "likes";
/// Retweet count metric name.
pub const METRIC_RETWEETS: &str = "retweets";
/// Reply count metric name.
pub const METRIC_REPLIES: &str = "replies";
/// Quote count metric name.
pub const METRIC_QUOTES: &str = "quotes";
/// Bookmark count metric name.
pub const METRIC_BOOKMARKS: &str = "bookmarks";

/// Timestamp layout used by the legacy API and by exports.
pub const LEGACY_TIME_FORMAT: &str = "%a %b %d %H:%M:%S %z %Y";

/// SHA-256 of an entry's raw bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawHash([u8; 32]);

impl RawHash {
    /// Hashes `bytes`.
    pub fn of(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Self(out)
    }

    /// Digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lower-case hex encoding.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for RawHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for RawHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawHash({})", &self.to_hex()[..12])
    }
}

impl Serialize for RawHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for RawHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        let bytes = hex::decode(&text).map_err(de::Error::custom)?;
        let digest: [u8; 32] = bytes
            .try_into()
            .map_err(|_| de::Error::custom("raw hash must be 32 bytes"))?;
        Ok(Self(digest))
    }
}

/// One post after ingestion.
///
/// `id` is unique within a dedup session; `raw_hash` identifies the exact
/// bytes the record was built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TweetRecord {
    /// Source-assigned id.
    pub id: String,
    /// Author's user id.
    pub author_id: String,
    /// Author's handle, when the payload included it.
    pub username: Option<String>,
    /// Post time.
    pub created_at: DateTime<Utc>,
    /// Post text.
    pub text: String,
    /// Metric name to count; see the `METRIC_*` constants.
    pub engagement_metrics: BTreeMap<String, u64>,
    /// The post is a retweet.
    pub is_retweet: bool,
    /// The post quotes another post.
    pub is_quote: bool,
    /// Digest of the raw entry.
    pub raw_hash: RawHash,
    /// When the record was ingested.
    pub scraped_at: DateTime<Utc>,
}

impl TweetRecord {
    /// Count for `name`, zero if absent.
    pub fn metric(&self, name: &str) -> u64 {
        self.engagement_metrics.get(name).copied().unwrap_or(0)
    }

    /// Public link to the post. Falls back to the `i` path when the handle
    /// is unknown.
    pub fn url(&self) -> String {
        let user = self.username.as_deref().unwrap_or("i");
        format!("https://x.com/{}/status/{}", user, self.id)
    }

    /// Flat row used by exports.
    pub fn to_export_map(&self) -> ExportRow {
        ExportRow {
            url: self.url(),
            id: self.id.clone(),
            text: self.text.clone(),
            retweet_count: self.metric(METRIC_RETWEETS),
            reply_count: self.metric(METRIC_REPLIES),
            like_count: self.metric(METRIC_LIKES),
            quote_count: self.metric(METRIC_QUOTES),
            created_at: self.created_at.format(LEGACY_TIME_FORMAT).to_string(),
            bookmark_count: self.metric(METRIC_BOOKMARKS),
            is_retweet: self.is_retweet.to_string(),
            is_quote: self.is_quote.to_string(),
        }
    }
}

/// Export row. Serialises as a map with keys in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportRow {
    #[serde(rename = "Url")]
    /// Link to the post.
    pub url: String,
    #[serde(rename = "ID")]
    /// Post id.
    pub id: String,
    #[serde(rename = "Text")]
    /// Post text.
    pub text: String,
    #[serde(rename = "Retweet Count")]
    /// Retweet count.
    pub retweet_count: u64,
    #[serde(rename = "Reply Count")]
    /// Reply count.
    pub reply_count: u64,
    #[serde(rename = "Like Count")]
    /// Like count.
    pub like_count: u64,
    #[serde(rename = "Quote Count")]
    /// Quote count.
    pub quote_count: u64,
    #[serde(rename = "Created At")]
    /// Post time in the legacy layout.
    pub created_at: String,
    #[serde(rename = "Bookmark Count")]
    /// Bookmark count.
    pub bookmark_count: u64,
    #[serde(rename = "Is Retweet")]
    /// `"true"` or `"false"`.
    pub is_retweet: String,
    #[serde(rename = "Is Quote")]
    /// `"true"` or `"false"`.
    pub is_quote: String,
}
