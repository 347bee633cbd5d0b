use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::message::{MessageType, ResponseStatus};

pub const CSV_HEADER: [&str; 5] = ["timestamp", "messageType", "latencyMs", "status", "roomId"];

/// One delivered message, as persisted: `timestamp,messageType,latencyMs,status,roomId`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricRecord {
    /// Wall-clock send time, milliseconds since the Unix epoch
    pub timestamp: i64,
    pub message_type: MessageType,
    pub latency_ms: u64,
    pub status: ResponseStatus,
    pub room_id: u8,
}

/// Destination for drained metric records.
pub trait RecordWriter: Send {
    fn write(&mut self, record: &MetricRecord) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

pub struct CsvRecordWriter {
    writer: csv::Writer<File>,
}

impl CsvRecordWriter {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_path(path)
            .with_context(|| format!("Failed to create metrics CSV {:?}", path))?;
        writer.write_record(CSV_HEADER)?;
        Ok(Self { writer })
    }
}

impl RecordWriter for CsvRecordWriter {
    fn write(&mut self, record: &MetricRecord) -> Result<()> {
        self.writer.serialize(record)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Keeps records in memory; clones share the same buffer.
#[derive(Clone, Default)]
pub struct MemoryRecordWriter {
    records: Arc<Mutex<Vec<MetricRecord>>>,
}

impl MemoryRecordWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<MetricRecord> {
        self.records.lock().clone()
    }
}

impl RecordWriter for MemoryRecordWriter {
    fn write(&mut self, record: &MetricRecord) -> Result<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Single consumer of the metrics channel.
pub struct MetricsSink {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<Result<u64>>,
}

impl MetricsSink {
    /// Spawn the consumer. Records are persisted in arrival order; every
    /// `flush_every` records the writer is flushed.
    pub fn spawn<W>(rx: mpsc::Receiver<MetricRecord>, writer: W, flush_every: u64) -> Self
    where
        W: RecordWriter + 'static,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(drain(rx, writer, stop_rx, flush_every));
        Self { stop_tx, handle }
    }

    /// Ask the sink to stop, let it write whatever is still buffered, and
    /// return the number of records written.
    pub async fn finish(self) -> Result<u64> {
        let _ = self.stop_tx.send(true);
        self.handle.await.context("metrics sink task panicked")?
    }
}

async fn drain<W: RecordWriter>(
    mut rx: mpsc::Receiver<MetricRecord>,
    mut writer: W,
    mut stop_rx: watch::Receiver<bool>,
    flush_every: u64,
) -> Result<u64> {
    let mut written = 0u64;

    loop {
        tokio::select! {
            record = rx.recv() => match record {
                Some(record) => {
                    writer.write(&record)?;
                    written += 1;
                    if flush_every > 0 && written % flush_every == 0 {
                        writer.flush()?;
                        info!("Written {} metric records", written);
                    }
                }
                None => break,
            },
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
        }
    }

    // Stop requested or all senders gone: write out what is already queued.
    rx.close();
    while let Some(record) = rx.recv().await {
        writer.write(&record)?;
        written += 1;
    }

    if let Err(e) = writer.flush() {
        warn!("Failed to flush metric records: {}", e);
        return Err(e);
    }
    info!("Metrics sink completed. Total records: {}", written);
    Ok(written)
}
