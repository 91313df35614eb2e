//! Bounded asynchronous telemetry writer.
//!
//! Protocol handlers call [`BufferedTelemetryWriter::enqueue`] on their hot
//! path. Enqueue never blocks and never fails: when the queue is full or the
//! writer is stopped, the event is dropped, logged, and counted. A single
//! worker task drains the queue in enqueue order and hands each event to the
//! synchronous [`TelemetrySink`] on the blocking pool.
//!
//! Audit entries skip the queue; [`BufferedTelemetryWriter::write_audit`]
//! writes through and returns the sink's error.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::WriterConfig;
use crate::error::Result;
use crate::flow::insert_flow_report;
use crate::logs::{ProtocolLog, insert_audit_entry, insert_protocol_event, insert_subscriber_log};
use crate::metrics::{MetricRegistry, names};
use crate::storage::Store;
use crate::telemetry::{AuditEntry, TelemetryEvent};

/// Synchronous persistence target for telemetry.
pub trait TelemetrySink: Send + Sync + 'static {
    fn write_event(&self, event: &TelemetryEvent) -> Result<()>;
    fn write_audit(&self, entry: &AuditEntry) -> Result<()>;
}

impl TelemetrySink for Store {
    fn write_event(&self, event: &TelemetryEvent) -> Result<()> {
        self.with_conn(|conn| {
            match event {
                TelemetryEvent::Radio(e) => insert_protocol_event(conn, ProtocolLog::Radio, e)?,
                TelemetryEvent::Network(e) => insert_protocol_event(conn, ProtocolLog::Network, e)?,
                TelemetryEvent::Subscriber(e) => insert_subscriber_log(conn, e)?,
                TelemetryEvent::Flow(e) => insert_flow_report(conn, e)?,
            };
            Ok(())
        })
    }

    fn write_audit(&self, entry: &AuditEntry) -> Result<()> {
        self.with_conn(|conn| insert_audit_entry(conn, entry))?;
        Ok(())
    }
}

/// Snapshot of writer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterStats {
    /// Events accepted into the queue.
    pub accepted: u64,
    /// Events rejected because the queue was full or closed.
    pub dropped: u64,
    /// Events the sink persisted.
    pub written: u64,
    /// Events the sink failed to persist.
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    dropped: AtomicU64,
    written: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> WriterStats {
        WriterStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Queue in front of a [`TelemetrySink`].
///
/// Must be constructed inside a tokio runtime; the worker is spawned on it.
pub struct BufferedTelemetryWriter<S: TelemetrySink> {
    sink: Arc<S>,
    sender: RwLock<Option<mpsc::Sender<TelemetryEvent>>>,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    counters: Arc<Counters>,
    metrics: Arc<MetricRegistry>,
}

impl<S: TelemetrySink> BufferedTelemetryWriter<S> {
    /// Start a writer whose queue holds at most `capacity` events.
    pub fn new(sink: Arc<S>, capacity: usize, metrics: Arc<MetricRegistry>) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let counters = Arc::new(Counters::default());
        let worker = tokio::spawn(drain(
            Arc::clone(&sink),
            rx,
            Arc::clone(&counters),
            Arc::clone(&metrics),
        ));
        debug!(capacity, "telemetry writer started");
        Self {
            sink,
            sender: RwLock::new(Some(tx)),
            worker: tokio::sync::Mutex::new(Some(worker)),
            counters,
            metrics,
        }
    }

    pub fn from_config(sink: Arc<S>, config: &WriterConfig, metrics: Arc<MetricRegistry>) -> Self {
        Self::new(sink, config.queue_capacity, metrics)
    }

    /// Queue `event` for persistence. Returns whether it was accepted.
    pub fn enqueue(&self, event: TelemetryEvent) -> bool {
        let kind = event.kind();
        let sender = self.sender.read().unwrap_or_else(PoisonError::into_inner);
        let reason = match sender.as_ref() {
            None => "writer stopped",
            Some(tx) => match tx.try_send(event) {
                Ok(()) => {
                    self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                    self.metrics.increment_counter(names::TELEMETRY_ENQUEUED);
                    return true;
                }
                Err(TrySendError::Full(_)) => "queue full",
                Err(TrySendError::Closed(_)) => "writer stopped",
            },
        };
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        self.metrics.increment_counter(names::TELEMETRY_DROPPED);
        warn!(kind, reason, "telemetry event dropped");
        false
    }

    /// Persist an audit entry synchronously, bypassing the queue.
    pub fn write_audit(&self, entry: &AuditEntry) -> Result<()> {
        self.sink.write_audit(entry)
    }

    /// Close the queue and wait until every accepted event has been handed to
    /// the sink. Later calls return immediately.
    pub async fn stop(&self) {
        let sender = self
            .sender
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(sender);
        let worker = self.worker.lock().await.take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(error = %e, "telemetry writer worker ended abnormally");
            }
            let stats = self.stats();
            info!(
                written = stats.written,
                failed = stats.failed,
                dropped = stats.dropped,
                "telemetry writer stopped"
            );
        }
    }

    #[must_use]
    pub fn stats(&self) -> WriterStats {
        self.counters.snapshot()
    }
}

async fn drain<S: TelemetrySink>(
    sink: Arc<S>,
    mut rx: mpsc::Receiver<TelemetryEvent>,
    counters: Arc<Counters>,
    metrics: Arc<MetricRegistry>,
) {
    while let Some(event) = rx.recv().await {
        let kind = event.kind();
        let sink = Arc::clone(&sink);
        match tokio::task::spawn_blocking(move || sink.write_event(&event)).await {
            Ok(Ok(())) => {
                counters.written.fetch_add(1, Ordering::Relaxed);
                metrics.increment_counter(names::TELEMETRY_WRITTEN);
            }
            Ok(Err(e)) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                metrics.increment_counter(names::TELEMETRY_WRITE_FAILURES);
                warn!(kind, error = %e, "telemetry write failed");
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                metrics.increment_counter(names::TELEMETRY_WRITE_FAILURES);
                warn!(kind, error = %e, "telemetry write task panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::logs::SubscriberLogFilter;
    use crate::query::Page;
    use crate::telemetry::SubscriberLogEntry;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<TelemetryEvent>>,
        delay: Option<Duration>,
        fail_event: Option<String>,
    }

    impl TelemetrySink for RecordingSink {
        fn write_event(&self, event: &TelemetryEvent) -> Result<()> {
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            if let (Some(bad), TelemetryEvent::Subscriber(e)) = (&self.fail_event, event) {
                if &e.event == bad {
                    return Err(Error::Validation("rejected".into()));
                }
            }
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }

        fn write_audit(&self, _entry: &AuditEntry) -> Result<()> {
            Err(Error::Validation("audit sink offline".into()))
        }
    }

    fn sub_event(n: usize) -> TelemetryEvent {
        TelemetryEvent::Subscriber(SubscriberLogEntry {
            timestamp: "2026-10-15T08:00:00Z".into(),
            level: "info".into(),
            imsi: "001010100007487".into(),
            event: format!("event-{n}"),
            details: String::new(),
        })
    }

    fn event_names(sink: &RecordingSink) -> Vec<String> {
        sink.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| match e {
                TelemetryEvent::Subscriber(s) => s.event.clone(),
                other => panic!("unexpected {other:?}"),
            })
            .collect()
    }

    #[tokio::test]
    async fn events_persist_in_enqueue_order() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let metrics = Arc::new(MetricRegistry::new());
        let writer = BufferedTelemetryWriter::new(Arc::clone(&store), 64, Arc::clone(&metrics));
        for n in 0..10 {
            assert!(writer.enqueue(sub_event(n)));
        }
        writer.stop().await;

        let logs = store
            .list_subscriber_logs(&SubscriberLogFilter::default(), Page::first(100))
            .unwrap();
        assert_eq!(logs.total, 10);
        let mut persisted: Vec<_> = logs.items.iter().map(|r| r.record.event.clone()).collect();
        persisted.reverse();
        let expected: Vec<_> = (0..10).map(|n| format!("event-{n}")).collect();
        assert_eq!(persisted, expected);
        assert_eq!(metrics.counter_value(names::TELEMETRY_WRITTEN), 10);
        assert_eq!(writer.stats().written, 10);
    }

    #[tokio::test]
    async fn overflow_drops_without_blocking() {
        let sink = Arc::new(RecordingSink {
            delay: Some(Duration::from_millis(20)),
            ..Default::default()
        });
        let metrics = Arc::new(MetricRegistry::new());
        let writer = BufferedTelemetryWriter::new(Arc::clone(&sink), 2, Arc::clone(&metrics));
        let accepted = (0..50).filter(|n| writer.enqueue(sub_event(*n))).count();
        assert!(accepted >= 1);
        assert!(accepted < 50);

        writer.stop().await;
        let stats = writer.stats();
        assert_eq!(stats.accepted, accepted as u64);
        assert_eq!(stats.dropped, 50 - accepted as u64);
        assert_eq!(stats.written, stats.accepted);
        assert_eq!(metrics.counter_value(names::TELEMETRY_DROPPED), stats.dropped);
        assert_eq!(event_names(&sink).len(), accepted);
    }

    #[tokio::test]
    async fn failed_write_does_not_stop_worker() {
        let sink = Arc::new(RecordingSink {
            fail_event: Some("event-1".into()),
            ..Default::default()
        });
        let writer =
            BufferedTelemetryWriter::new(Arc::clone(&sink), 16, Arc::new(MetricRegistry::new()));
        for n in 0..3 {
            writer.enqueue(sub_event(n));
        }
        writer.stop().await;
        assert_eq!(event_names(&sink), vec!["event-0", "event-2"]);
        let stats = writer.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.written, 2);
    }

    #[tokio::test]
    async fn enqueue_after_stop_is_dropped() {
        let sink = Arc::new(RecordingSink::default());
        let writer =
            BufferedTelemetryWriter::new(Arc::clone(&sink), 4, Arc::new(MetricRegistry::new()));
        writer.stop().await;
        writer.stop().await;
        assert!(!writer.enqueue(sub_event(0)));
        assert_eq!(writer.stats().dropped, 1);
        assert!(event_names(&sink).is_empty());
    }

    #[tokio::test]
    async fn audit_bypasses_queue_and_reports_errors() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let writer =
            BufferedTelemetryWriter::new(Arc::clone(&store), 4, Arc::new(MetricRegistry::new()));
        let entry = AuditEntry {
            timestamp: "2026-10-15T08:00:00Z".into(),
            level: "info".into(),
            actor: "admin".into(),
            action: "update_subscriber".into(),
            ip: "198.51.100.4".into(),
            details: String::new(),
        };
        writer.write_audit(&entry).unwrap();
        assert_eq!(store.audit_entry(1).unwrap().record.actor, "admin");

        let bad = AuditEntry {
            timestamp: "not a time".into(),
            ..entry
        };
        assert!(writer.write_audit(&bad).is_err());

        let failing = BufferedTelemetryWriter::new(
            Arc::new(RecordingSink::default()),
            4,
            Arc::new(MetricRegistry::new()),
        );
        assert!(failing.write_audit(&bad).is_err());
        writer.stop().await;
        failing.stop().await;
    }
}
