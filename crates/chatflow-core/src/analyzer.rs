use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::Path;
use tracing::{info, warn};

use crate::sink::MetricRecord;

/// Latency and distribution summary over a set of metric records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub total_messages: u64,
    pub mean_latency_ms: f64,
    pub median_latency_ms: u64,
    pub p95_latency_ms: u64,
    pub p99_latency_ms: u64,
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
    pub message_types: BTreeMap<String, u64>,
    pub messages_per_room: BTreeMap<u8, u64>,
    /// Messages per second over each room's own first-to-last timestamp span.
    pub throughput_per_room: BTreeMap<u8, f64>,
}

/// Value at index `ceil(p/100 * N) - 1` of an ascending slice, clamped to its bounds.
pub fn percentile(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (p / 100.0 * sorted.len() as f64).ceil() as i64 - 1;
    let idx = rank.clamp(0, sorted.len() as i64 - 1) as usize;
    sorted[idx]
}

/// Messages per second for `count` records spread over `span_ms`; the raw
/// count when the span is zero.
pub fn span_throughput(count: u64, span_ms: i64) -> f64 {
    if span_ms <= 0 {
        return count as f64;
    }
    count as f64 / (span_ms as f64 / 1000.0)
}

/// Summarize `records`. `None` when there is nothing to summarize.
pub fn analyze(records: &[MetricRecord]) -> Option<Statistics> {
    if records.is_empty() {
        return None;
    }

    let mut latencies: Vec<u64> = records.iter().map(|r| r.latency_ms).collect();
    latencies.sort_unstable();

    let mut message_types = BTreeMap::new();
    let mut messages_per_room = BTreeMap::new();
    let mut room_spans: BTreeMap<u8, (i64, i64)> = BTreeMap::new();
    for r in records {
        *message_types
            .entry(r.message_type.as_str().to_string())
            .or_insert(0) += 1;
        *messages_per_room.entry(r.room_id).or_insert(0u64) += 1;
        let span = room_spans
            .entry(r.room_id)
            .or_insert((r.timestamp, r.timestamp));
        span.0 = span.0.min(r.timestamp);
        span.1 = span.1.max(r.timestamp);
    }

    let throughput_per_room = messages_per_room
        .iter()
        .map(|(&room, &count)| {
            let (first, last) = room_spans[&room];
            (room, span_throughput(count, last - first))
        })
        .collect();

    let sum: u128 = latencies.iter().map(|&l| l as u128).sum();
    Some(Statistics {
        total_messages: latencies.len() as u64,
        mean_latency_ms: sum as f64 / latencies.len() as f64,
        median_latency_ms: percentile(&latencies, 50.0),
        p95_latency_ms: percentile(&latencies, 95.0),
        p99_latency_ms: percentile(&latencies, 99.0),
        min_latency_ms: latencies[0],
        max_latency_ms: latencies[latencies.len() - 1],
        message_types,
        messages_per_room,
        throughput_per_room,
    })
}

/// Record counts per fixed-width window, keyed by the window's start in seconds
/// since the earliest record.
pub fn throughput_over_time(records: &[MetricRecord], bucket_secs: u64) -> BTreeMap<u64, u64> {
    let mut buckets = BTreeMap::new();
    let bucket_secs = bucket_secs.max(1);
    let Some(earliest) = records.iter().map(|r| r.timestamp).min() else {
        return buckets;
    };

    for r in records {
        let elapsed_secs = ((r.timestamp - earliest) / 1000) as u64;
        let key = elapsed_secs / bucket_secs * bucket_secs;
        *buckets.entry(key).or_insert(0) += 1;
    }
    buckets
}

/// Read records written by `CsvRecordWriter`. Rows that do not parse are skipped.
pub fn read_records(path: impl AsRef<Path>) -> Result<Vec<MetricRecord>> {
    let path = path.as_ref();
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open metrics CSV {:?}", path))?;

    let mut records = Vec::new();
    let mut skipped = 0u64;
    for row in reader.deserialize::<MetricRecord>() {
        match row {
            Ok(record) => records.push(record),
            Err(e) => {
                skipped += 1;
                warn!("Skipping invalid row in {:?}: {}", path, e);
            }
        }
    }
    info!(
        "Read {} metric records from {:?} ({} skipped)",
        records.len(),
        path,
        skipped
    );
    Ok(records)
}

/// Write the throughput series as `seconds, messages/second` lines.
pub fn write_throughput(path: impl AsRef<Path>, buckets: &BTreeMap<u64, u64>, bucket_secs: u64) -> Result<()> {
    let path = path.as_ref();
    let mut file = std::fs::File::create(path)
        .with_context(|| format!("Failed to create throughput file {:?}", path))?;
    let width = bucket_secs.max(1) as f64;

    writeln!(file, "Throughput Over Time")?;
    writeln!(file, "====================")?;
    writeln!(file, "Time (seconds), Messages/Second")?;
    for (start, count) in buckets {
        writeln!(file, "{}, {:.2}", start, *count as f64 / width)?;
    }
    Ok(())
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Statistical Analysis ===")?;
        writeln!(f, "Total messages:  {}", self.total_messages)?;
        writeln!(f, "Mean latency:    {:.2} ms", self.mean_latency_ms)?;
        writeln!(f, "Median latency:  {} ms", self.median_latency_ms)?;
        writeln!(f, "P95 latency:     {} ms", self.p95_latency_ms)?;
        writeln!(f, "P99 latency:     {} ms", self.p99_latency_ms)?;
        writeln!(f, "Min latency:     {} ms", self.min_latency_ms)?;
        writeln!(f, "Max latency:     {} ms", self.max_latency_ms)?;

        writeln!(f, "\nMessage types:")?;
        for (kind, count) in &self.message_types {
            let share = 100.0 * *count as f64 / self.total_messages.max(1) as f64;
            writeln!(f, "  {:<6} {} ({:.1}%)", kind, count, share)?;
        }

        writeln!(f, "\nPer room:")?;
        for (room, count) in &self.messages_per_room {
            let rate = self.throughput_per_room.get(room).copied().unwrap_or(0.0);
            writeln!(f, "  Room {:>2}: {} messages, {:.2} msg/s", room, count, rate)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageType, ResponseStatus};
    use crate::sink::{CsvRecordWriter, RecordWriter};

    fn record(timestamp: i64, latency_ms: u64, message_type: MessageType, room_id: u8) -> MetricRecord {
        MetricRecord {
            timestamp,
            message_type,
            latency_ms,
            status: ResponseStatus::Success,
            room_id,
        }
    }

    #[test]
    fn test_percentile_indexing() {
        let sorted = [10, 20, 30, 40, 50];
        assert_eq!(percentile(&sorted, 50.0), 30);
        assert_eq!(percentile(&sorted, 95.0), 50);
        assert_eq!(percentile(&sorted, 99.0), 50);
        assert_eq!(percentile(&sorted, 0.0), 10);
        assert_eq!(percentile(&sorted, 100.0), 50);
        assert_eq!(percentile(&[], 50.0), 0);
        assert_eq!(percentile(&[7], 99.0), 7);
    }

    #[test]
    fn test_room_throughput_over_span() {
        let records: Vec<MetricRecord> = (0..100)
            .map(|i| {
                let ts = if i == 99 { 10_000 } else { i * 100 };
                record(ts, 5, MessageType::Text, 3)
            })
            .collect();
        let stats = analyze(&records).unwrap();
        assert!((stats.throughput_per_room[&3] - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_single_record_room_reports_count() {
        let records = vec![
            record(1_000, 5, MessageType::Text, 1),
            record(5_000, 5, MessageType::Join, 2),
        ];
        let stats = analyze(&records).unwrap();
        assert_eq!(stats.throughput_per_room[&1], 1.0);
        assert_eq!(stats.throughput_per_room[&2], 1.0);
    }

    #[test]
    fn test_analyze_summary() {
        let records = vec![
            record(0, 10, MessageType::Text, 1),
            record(100, 20, MessageType::Text, 1),
            record(200, 30, MessageType::Join, 2),
            record(300, 40, MessageType::Leave, 2),
            record(400, 50, MessageType::Text, 2),
        ];
        let stats = analyze(&records).unwrap();

        assert_eq!(stats.total_messages, 5);
        assert!((stats.mean_latency_ms - 30.0).abs() < 1e-9);
        assert_eq!(stats.median_latency_ms, 30);
        assert_eq!(stats.p95_latency_ms, 50);
        assert_eq!(stats.min_latency_ms, 10);
        assert_eq!(stats.max_latency_ms, 50);
        assert_eq!(stats.message_types["TEXT"], 3);
        assert_eq!(stats.message_types["JOIN"], 1);
        assert_eq!(stats.messages_per_room[&1], 2);
        assert_eq!(stats.messages_per_room[&2], 3);

        let rendered = stats.to_string();
        assert!(rendered.contains("Median latency:  30 ms"));
        assert!(rendered.contains("Room  2: 3 messages"));
    }

    #[test]
    fn test_empty_input() {
        assert!(analyze(&[]).is_none());
        assert!(throughput_over_time(&[], 10).is_empty());
    }

    #[test]
    fn test_throughput_buckets() {
        let base = 1_700_000_000_000;
        let records = vec![
            record(base, 1, MessageType::Text, 1),
            record(base + 9_999, 1, MessageType::Text, 1),
            record(base + 10_000, 1, MessageType::Text, 1),
            record(base + 25_500, 1, MessageType::Text, 1),
            record(base + 3_000, 1, MessageType::Text, 1),
        ];
        let buckets = throughput_over_time(&records, 10);
        let keys: Vec<u64> = buckets.keys().copied().collect();
        assert_eq!(keys, vec![0, 10, 20]);
        assert_eq!(buckets[&0], 3);
        assert_eq!(buckets[&10], 1);
        assert_eq!(buckets[&20], 1);
    }

    #[test]
    fn test_read_records_from_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.csv");

        let mut writer = CsvRecordWriter::create(&path).unwrap();
        writer.write(&record(1_000, 12, MessageType::Text, 4)).unwrap();
        writer.write(&record(2_000, 15, MessageType::Leave, 5)).unwrap();
        writer.flush().unwrap();
        drop(writer);

        let mut contents = std::fs::read_to_string(&path).unwrap();
        contents.push_str("not,a,valid,row,here\n");
        std::fs::write(&path, contents).unwrap();

        let records = read_records(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].message_type, MessageType::Leave);
        assert_eq!(records[1].room_id, 5);
    }

    #[test]
    fn test_write_throughput_divides_by_bucket_width() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("throughput.txt");
        let buckets = BTreeMap::from([(0, 50), (10, 25)]);

        write_throughput(&path, &buckets, 10).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("0, 5.00"));
        assert!(contents.contains("10, 2.50"));
    }
}
