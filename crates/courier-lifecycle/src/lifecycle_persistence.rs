//! Fire-and-forget persistence of telemetry events and decision traces.
//!
//! Records are queued on an unbounded FIFO channel and written by a single
//! background task, so callers never wait on I/O and writes for one message
//! land in the order they were submitted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use courier_store::{DecisionTraceRepository, TelemetryRepository};
use courier_types::{DecisionTrace, TelemetryEvent};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

const PERSISTENCE_BATCH_MAX: usize = 256;

enum PersistCommand {
    Event(TelemetryEvent),
    Trace(DecisionTrace),
    Flush(oneshot::Sender<()>),
}

/// Counters describing writer health.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistenceStats {
    pub events_written: u64,
    pub traces_written: u64,
    pub write_failures: u64,
    pub dropped_submissions: u64,
}

#[derive(Debug, Default)]
struct PersistenceCounters {
    events_written: AtomicU64,
    traces_written: AtomicU64,
    write_failures: AtomicU64,
    dropped_submissions: AtomicU64,
}

/// Handle to the background writer. Cloning shares the same queue.
#[derive(Clone)]
pub struct PersistenceWriter {
    sender: mpsc::UnboundedSender<PersistCommand>,
    counters: Arc<PersistenceCounters>,
}

impl std::fmt::Debug for PersistenceWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceWriter")
            .field("stats", &self.stats())
            .finish()
    }
}

impl PersistenceWriter {
    /// Spawns the writer task on the current tokio runtime.
    pub fn spawn(
        telemetry: Arc<dyn TelemetryRepository>,
        traces: Arc<dyn DecisionTraceRepository>,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let counters = Arc::new(PersistenceCounters::default());
        tokio::spawn(run_writer(
            receiver,
            telemetry,
            traces,
            Arc::clone(&counters),
        ));
        Self { sender, counters }
    }

    pub fn submit_event(&self, event: TelemetryEvent) {
        if self.sender.send(PersistCommand::Event(event)).is_err() {
            self.record_dropped("telemetry event");
        }
    }

    pub fn submit_trace(&self, trace: DecisionTrace) {
        if self.sender.send(PersistCommand::Trace(trace)).is_err() {
            self.record_dropped("decision trace");
        }
    }

    /// Waits until every record submitted before this call has been written
    /// or has failed.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.sender.send(PersistCommand::Flush(done_tx)).is_err() {
            return;
        }
        let _ = done_rx.await;
    }

    pub fn stats(&self) -> PersistenceStats {
        PersistenceStats {
            events_written: self.counters.events_written.load(Ordering::Relaxed),
            traces_written: self.counters.traces_written.load(Ordering::Relaxed),
            write_failures: self.counters.write_failures.load(Ordering::Relaxed),
            dropped_submissions: self.counters.dropped_submissions.load(Ordering::Relaxed),
        }
    }

    fn record_dropped(&self, kind: &'static str) {
        self.counters
            .dropped_submissions
            .fetch_add(1, Ordering::Relaxed);
        tracing::warn!(kind, "persistence writer stopped; record dropped");
    }
}

async fn run_writer(
    mut receiver: mpsc::UnboundedReceiver<PersistCommand>,
    telemetry: Arc<dyn TelemetryRepository>,
    traces: Arc<dyn DecisionTraceRepository>,
    counters: Arc<PersistenceCounters>,
) {
    while let Some(first) = receiver.recv().await {
        let mut events = Vec::new();
        let mut pending_traces = Vec::new();
        let mut flushes = Vec::new();
        let mut next = Some(first);
        let mut drained = 0_usize;

        while let Some(command) = next.take() {
            match command {
                PersistCommand::Event(event) => events.push(event),
                PersistCommand::Trace(trace) => pending_traces.push(trace),
                PersistCommand::Flush(done) => {
                    flushes.push(done);
                    break;
                }
            }
            drained += 1;
            if drained >= PERSISTENCE_BATCH_MAX {
                break;
            }
            next = receiver.try_recv().ok();
        }

        write_events(telemetry.as_ref(), events, &counters).await;
        write_traces(traces.as_ref(), pending_traces, &counters).await;
        for done in flushes {
            let _ = done.send(());
        }
    }
    tracing::debug!("persistence writer stopped");
}

async fn write_events(
    telemetry: &dyn TelemetryRepository,
    events: Vec<TelemetryEvent>,
    counters: &PersistenceCounters,
) {
    if events.is_empty() {
        return;
    }
    let count = events.len() as u64;
    let Err(error) = telemetry.create_events(events.clone()).await else {
        counters.events_written.fetch_add(count, Ordering::Relaxed);
        return;
    };
    tracing::warn!(
        error = %error,
        batch_size = count,
        "telemetry batch write failed; retrying records individually"
    );
    for event in events {
        let correlation_id = event.correlation_id.clone().unwrap_or_default();
        let message_id = event.message_id.clone();
        match telemetry.create_event(event).await {
            Ok(()) => {
                counters.events_written.fetch_add(1, Ordering::Relaxed);
            }
            Err(error) => {
                counters.write_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    error = %error,
                    correlation_id = %correlation_id,
                    message_id = %message_id,
                    "telemetry event dropped"
                );
            }
        }
    }
}

async fn write_traces(
    traces: &dyn DecisionTraceRepository,
    batch: Vec<DecisionTrace>,
    counters: &PersistenceCounters,
) {
    if batch.is_empty() {
        return;
    }
    let count = batch.len() as u64;
    let Err(error) = traces.create_traces(batch.clone()).await else {
        counters.traces_written.fetch_add(count, Ordering::Relaxed);
        return;
    };
    tracing::warn!(
        error = %error,
        batch_size = count,
        "decision trace batch write failed; retrying records individually"
    );
    for trace in batch {
        let correlation_id = trace.correlation_id.clone();
        let message_id = trace.message_id.clone();
        match traces.create_trace(trace).await {
            Ok(()) => {
                counters.traces_written.fetch_add(1, Ordering::Relaxed);
            }
            Err(error) => {
                counters.write_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    error = %error,
                    correlation_id = %correlation_id,
                    message_id = %message_id,
                    "decision trace dropped"
                );
            }
        }
    }
}
