//! The background consumer: drains the queue, merges what it found and
//! launches once per distinct batch identity.

use crate::errors::BatcherError;
use crate::metrics_defs::{CYCLES, LAUNCHES_MERGED};
use crate::queue::{BatchIdentity, BatchReceiver, QueuedBatch};
use indexmap::IndexMap;
use launcher::{Launch, LaunchRequest};
use serde::Serialize;
use shared::admin_service::HealthProbe;
use shared::counter;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerState {
    Starting,
    Idle,
    Launching,
    Stopped,
    Failed,
}

/// Observable consumer health, shared with the admin listener.
pub struct ConsumerStatus {
    state: watch::Sender<ConsumerState>,
    cycles: AtomicU64,
    batches_merged: AtomicU64,
}

impl ConsumerStatus {
    fn new() -> Self {
        ConsumerStatus {
            state: watch::Sender::new(ConsumerState::Starting),
            cycles: AtomicU64::new(0),
            batches_merged: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    pub fn batches_merged(&self) -> u64 {
        self.batches_merged.load(Ordering::Relaxed)
    }

    fn set(&self, state: ConsumerState) {
        self.state.send_replace(state);
    }
}

impl HealthProbe for ConsumerStatus {
    fn is_ready(&self) -> bool {
        matches!(self.state(), ConsumerState::Idle | ConsumerState::Launching)
    }

    fn status(&self) -> serde_json::Value {
        serde_json::json!({
            "state": self.state(),
            "cycles": self.cycles(),
            "batches_merged": self.batches_merged(),
        })
    }
}

/// Groups drained batches by identity in first-seen order and sums the
/// launch counts of each group. A group whose sum would pass `max_launches`
/// is split into several requests, each within the limit unless a single
/// batch already exceeds it.
pub fn merge(drained: Vec<QueuedBatch>, max_launches: usize) -> Vec<LaunchRequest> {
    let mut groups: IndexMap<BatchIdentity, Vec<usize>> = IndexMap::new();
    for queued in drained {
        let (identity, launches) = queued.batch.into_identity();
        let chunks = groups.entry(identity).or_default();
        let fits = |last: usize| last.checked_add(launches).is_some_and(|sum| sum <= max_launches);
        match chunks.last_mut() {
            Some(last) if fits(*last) => *last += launches,
            _ => chunks.push(launches),
        }
    }
    groups
        .into_iter()
        .flat_map(|(identity, chunks)| {
            chunks
                .into_iter()
                .map(move |launches| identity.clone().into_request(launches))
        })
        .collect()
}

/// Handle to the running consumer task.
pub struct Consumer {
    status: Arc<ConsumerStatus>,
    stop: watch::Sender<bool>,
    handle: JoinHandle<Result<(), BatcherError>>,
}

impl Consumer {
    /// Spawns the consumer on the current runtime.
    pub fn start(
        receiver: BatchReceiver,
        launcher: Arc<dyn Launch>,
        poll_interval: Duration,
        max_launches: usize,
    ) -> Self {
        let status = Arc::new(ConsumerStatus::new());
        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(consume(
            receiver,
            launcher,
            poll_interval,
            max_launches,
            status.clone(),
            stop_rx,
        ));
        Consumer {
            status,
            stop,
            handle,
        }
    }

    pub fn status(&self) -> Arc<ConsumerStatus> {
        self.status.clone()
    }

    /// Resolves when the consumer exits on its own, which only happens on a
    /// fatal launch error. Must not be awaited again once it has resolved.
    pub async fn finished(&mut self) -> Result<(), BatcherError> {
        let joined = (&mut self.handle).await;
        self.status.settle_join(joined)
    }

    /// Asks the consumer to stop after its current cycle and waits for it.
    pub async fn stop(self) -> Result<(), BatcherError> {
        let _ = self.stop.send(true);
        let joined = self.handle.await;
        self.status.settle_join(joined)
    }
}

impl ConsumerStatus {
    // A panicked consumer task counts as failed.
    fn settle_join(
        &self,
        joined: Result<Result<(), BatcherError>, tokio::task::JoinError>,
    ) -> Result<(), BatcherError> {
        match joined {
            Ok(result) => result,
            Err(e) => {
                self.set(ConsumerState::Failed);
                Err(BatcherError::ConsumerFailed(e.to_string()))
            }
        }
    }
}

async fn consume(
    mut receiver: BatchReceiver,
    launcher: Arc<dyn Launch>,
    poll_interval: Duration,
    max_launches: usize,
    status: Arc<ConsumerStatus>,
    mut stop: watch::Receiver<bool>,
) -> Result<(), BatcherError> {
    status.set(ConsumerState::Idle);
    tracing::info!(
        poll_interval_ms = poll_interval.as_millis() as u64,
        "consumer started"
    );

    loop {
        if *stop.borrow() {
            break;
        }

        let drained = receiver.drain();
        if drained.is_empty() {
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            continue;
        }

        status.set(ConsumerState::Launching);
        if let Err(e) = run_cycle(launcher.as_ref(), drained, max_launches, &status).await {
            status.set(ConsumerState::Failed);
            tracing::error!(error = %e, "consumer stopping after fatal launch error");
            return Err(e);
        }
        status.set(ConsumerState::Idle);
    }

    status.set(ConsumerState::Stopped);
    tracing::info!("consumer stopped");
    Ok(())
}

async fn run_cycle(
    launcher: &dyn Launch,
    drained: Vec<QueuedBatch>,
    max_launches: usize,
    status: &ConsumerStatus,
) -> Result<(), BatcherError> {
    let batches = drained.len();
    let requests = merge(drained, max_launches);

    counter!(CYCLES).increment(1);
    counter!(LAUNCHES_MERGED).increment(batches as u64);
    status.cycles.fetch_add(1, Ordering::Relaxed);
    status.batches_merged.fetch_add(batches as u64, Ordering::Relaxed);
    tracing::info!(batches, launches = requests.len(), "queue drained");

    for request in requests {
        match launcher.launch(&request).await {
            Ok(report) => tracing::info!(
                function = %request.function_name,
                launches = request.launches,
                sent = report.sent(),
                succeeded = report.succeeded(),
                "merged launch finished"
            ),
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => tracing::error!(
                function = %request.function_name,
                error = %e,
                "merged launch failed"
            ),
        }
    }
    Ok(())
}
