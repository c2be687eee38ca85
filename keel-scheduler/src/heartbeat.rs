use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use keel_core::BrokerReport;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncBufRead;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::LinesStream;
use tracing::{debug, trace, warn};

/// Latest report of a broker together with the time it was received.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    pub report: BrokerReport,
    pub received_at: Instant,
}

/// Shared table of the latest heartbeat per broker name.
///
/// Writers are the ingestion tasks, the only reader is the scheduling tick,
/// which snapshots the table once per tick.
#[derive(Debug, Clone, Default)]
pub struct HeartbeatTable {
    inner: Arc<Mutex<HashMap<String, Heartbeat>>>,
}

impl HeartbeatTable {
    pub fn new() -> Self {
        HeartbeatTable::default()
    }

    pub async fn record(&self, report: BrokerReport) {
        self.record_at(report, Instant::now()).await
    }

    /// Stores `report` unless a more recent one is already present.
    pub async fn record_at(&self, report: BrokerReport, received_at: Instant) {
        let mut table = self.inner.lock().await;
        match table.get(&report.name) {
            Some(existing) if existing.received_at > received_at => {
                trace!(broker = %report.name, "dropping out of order heartbeat");
            }
            _ => {
                table.insert(
                    report.name.clone(),
                    Heartbeat {
                        report,
                        received_at,
                    },
                );
            }
        }
    }

    pub async fn snapshot(&self) -> Vec<Heartbeat> {
        let table = self.inner.lock().await;
        let mut beats: Vec<Heartbeat> = table.values().cloned().collect();
        beats.sort_by(|a, b| a.report.name.cmp(&b.report.name));
        beats
    }

    /// Removes a reclaimed broker, unless it sent a heartbeat after `seen_at`.
    pub async fn forget_if_stale(&self, name: &str, seen_at: Instant) -> bool {
        let mut table = self.inner.lock().await;
        match table.get(name) {
            Some(beat) if beat.received_at <= seen_at => {
                table.remove(name);
                true
            }
            _ => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

/// Feeds every report of `reports` into the table until the stream ends.
pub fn spawn_ingestion<S>(table: HeartbeatTable, mut reports: S) -> JoinHandle<()>
where
    S: Stream<Item = BrokerReport> + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        while let Some(report) = reports.next().await {
            trace!(broker = %report.name, tasks = report.tasks.len(), "heartbeat received");
            table.record(report).await;
        }
        debug!("heartbeat stream closed");
    })
}

/// Decodes one JSON encoded `BrokerReport` per line; malformed lines are skipped.
pub fn json_lines<R>(reader: R) -> BoxStream<'static, BrokerReport>
where
    R: AsyncBufRead + Send + Unpin + 'static,
{
    use tokio::io::AsyncBufReadExt;

    LinesStream::new(reader.lines()).filter_map(|line| async move {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                warn!(error = %err, "failed to read heartbeat line");
                return None;
            }
        };
        if line.trim().is_empty() {
            return None;
        }
        match serde_json::from_str::<BrokerReport>(&line) {
            Ok(report) => Some(report),
            Err(err) => {
                warn!(error = %err, "skipping malformed heartbeat");
                None
            }
        }
    })
    .boxed()
}
