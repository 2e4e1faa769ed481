//! Destinations for ingested records.

use crate::error::SinkError;
use crate::ingest::TweetRecord;
use std::fmt;
use std::io::Write;

/// Where records end up once the coordinator hands them over.
pub trait RecordSink {
    /// Delivers one record.
    fn write(&mut self, record: &TweetRecord) -> Result<(), SinkError>;

    /// Pushes buffered output through.
    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Writes one export row per line as JSON.
pub struct JsonLinesSink<W: Write> {
    writer: W,
    written: usize,
}

impl<W: Write> JsonLinesSink<W> {
    /// Sink over `writer`.
    pub fn new(writer: W) -> Self {
        Self { writer, written: 0 }
    }

    /// Lines written so far.
    pub fn written(&self) -> usize {
        self.written
    }

    /// Returns the writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> RecordSink for JsonLinesSink<W> {
    fn write(&mut self, record: &TweetRecord) -> Result<(), SinkError> {
        serde_json::to_writer(&mut self.writer, &record.to_export_map())?;
        self.writer.write_all(b"\n")?;
        self.written += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.writer.flush()?;
        Ok(())
    }
}

impl<W: Write> fmt::Debug for JsonLinesSink<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonLinesSink")
            .field("written", &self.written)
            .finish()
    }
}

/// Keeps records in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Vec<TweetRecord>,
}

impl MemorySink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything received, in order.
    pub fn records(&self) -> &[TweetRecord] {
        &self.records
    }

    /// Takes the received records.
    pub fn into_records(self) -> Vec<TweetRecord> {
        self.records
    }

    /// Number of records received.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether nothing was received.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl RecordSink for MemorySink {
    fn write(&mut self, record: &TweetRecord) -> Result<(), SinkError> {
        self.records.push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::RawHash;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    fn record(id: &str) -> TweetRecord {
        TweetRecord {
            id: id.to_string(),
            author_id: "1".to_string(),
            username: Some("alice".to_string()),
            created_at: Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
            text: "hi \"there\"".to_string(),
            engagement_metrics: BTreeMap::new(),
            is_retweet: true,
            is_quote: false,
            raw_hash: RawHash::of(id.as_bytes()),
            scraped_at: Utc::now(),
        }
    }

    #[test]
    fn test_json_lines() {
        let mut sink = JsonLinesSink::new(Vec::new());
        sink.write(&record("1")).unwrap();
        sink.write(&record("2")).unwrap();
        sink.flush().unwrap();
        assert_eq!(sink.written(), 2);

        let output = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2);

        let row: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(row["Url"], "https://x.com/alice/status/1");
        assert_eq!(row["Text"], "hi \"there\"");
        assert_eq!(row["Is Retweet"], "true");
        assert_eq!(row["Created At"], "Tue Jan 02 03:04:05 +0000 2024");
    }

    #[test]
    fn test_memory_sink() {
        let mut sink = MemorySink::new();
        assert!(sink.is_empty());
        sink.write(&record("9")).unwrap();
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.records()[0].id, "9");
    }
}
