//! The queue between the ingestion front end and the consumer.

use crate::errors::BatcherError;
use crate::metrics_defs::{BATCHES_ENQUEUED, QUEUE_WAIT};
use launcher::{Credentials, InvocationMode, LaunchRequest};
use serde::Deserialize;
use shared::{counter, histogram};
use std::fmt;
use std::time::{Instant, SystemTime};
use tokio::sync::mpsc;

fn default_mode() -> InvocationMode {
    InvocationMode::Event
}

/// One submitted launch batch, as posted to `/launch`.
#[derive(Clone, Deserialize, PartialEq)]
pub struct LaunchBatch {
    pub launches: usize,
    pub function_name: String,
    pub access_key_id: String,
    pub secret: String,
    pub payload: String,
    pub regions: Vec<String>,
    #[serde(default)]
    pub qualifier: Option<String>,
    #[serde(default = "default_mode")]
    pub mode: InvocationMode,
}

impl fmt::Debug for LaunchBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchBatch")
            .field("launches", &self.launches)
            .field("function_name", &self.function_name)
            .field("credentials", &self.credentials())
            .field("payload", &self.payload)
            .field("regions", &self.regions)
            .field("qualifier", &self.qualifier)
            .field("mode", &self.mode)
            .finish()
    }
}

impl LaunchBatch {
    pub fn validate(&self, max_launches: usize) -> Result<(), BatcherError> {
        if self.launches == 0 {
            return Err(BatcherError::InvalidBatch("launches must be positive"));
        }
        if self.launches > max_launches {
            return Err(BatcherError::InvalidBatch(
                "launches exceeds the configured maximum",
            ));
        }
        if self.regions.is_empty() {
            return Err(BatcherError::InvalidBatch("regions must not be empty"));
        }
        if self.function_name.is_empty() {
            return Err(BatcherError::InvalidBatch("function_name must not be empty"));
        }
        Ok(())
    }

    pub fn credentials(&self) -> Credentials {
        Credentials::new(self.access_key_id.clone(), self.secret.clone())
    }

    /// Splits the batch into what it launches and how many times.
    pub fn into_identity(self) -> (BatchIdentity, usize) {
        let credentials = self.credentials();
        let identity = BatchIdentity {
            function_name: self.function_name,
            credentials,
            payload: self.payload,
            regions: self.regions,
            qualifier: self.qualifier,
            mode: self.mode,
        };
        (identity, self.launches)
    }
}

/// Everything about a batch except its launch count. Batches with equal
/// identities can share one launch.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BatchIdentity {
    pub function_name: String,
    pub credentials: Credentials,
    pub payload: String,
    pub regions: Vec<String>,
    pub qualifier: Option<String>,
    pub mode: InvocationMode,
}

impl BatchIdentity {
    pub fn into_request(self, launches: usize) -> LaunchRequest {
        LaunchRequest {
            launches,
            function_name: self.function_name,
            credentials: self.credentials,
            payload: self.payload,
            qualifier: self.qualifier,
            mode: self.mode,
            regions: self.regions,
        }
    }
}

#[derive(Debug)]
pub struct QueuedBatch {
    pub batch: LaunchBatch,
    /// Wall-clock enqueue time, for reporting.
    pub enqueued_at: SystemTime,
    /// Monotonic enqueue time, for measuring queue wait.
    pub enqueued: Instant,
}

/// Producer side. Cheap to clone; enqueueing never blocks.
#[derive(Clone)]
pub struct BatchQueue {
    sender: mpsc::UnboundedSender<QueuedBatch>,
}

/// Consumer side. There is exactly one.
pub struct BatchReceiver {
    receiver: mpsc::UnboundedReceiver<QueuedBatch>,
}

pub fn batch_queue() -> (BatchQueue, BatchReceiver) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (BatchQueue { sender }, BatchReceiver { receiver })
}

impl BatchQueue {
    pub fn enqueue(&self, batch: LaunchBatch) -> Result<(), BatcherError> {
        let queued = QueuedBatch {
            batch,
            enqueued_at: SystemTime::now(),
            enqueued: Instant::now(),
        };
        self.sender
            .send(queued)
            .map_err(|_| BatcherError::QueueClosed)?;
        counter!(BATCHES_ENQUEUED).increment(1);
        Ok(())
    }
}

impl BatchReceiver {
    /// Takes everything queued right now without waiting for more.
    pub fn drain(&mut self) -> Vec<QueuedBatch> {
        let mut drained = Vec::new();
        while let Ok(queued) = self.receiver.try_recv() {
            histogram!(QUEUE_WAIT).record(queued.enqueued.elapsed().as_secs_f64());
            drained.push(queued);
        }
        drained
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn batch(function_name: &str, launches: usize) -> LaunchBatch {
        LaunchBatch {
            launches,
            function_name: function_name.into(),
            access_key_id: "AKIDEXAMPLE".into(),
            secret: "wJalrXUtnFEMI/K7MDENG".into(),
            payload: r###"{"id":"##ID##"}"###.into(),
            regions: vec!["us-east-1".into()],
            qualifier: None,
            mode: InvocationMode::Event,
        }
    }

    #[test]
    fn parses_posted_batch() {
        let body = r#"{
            "launches": 4,
            "function_name": "demo",
            "access_key_id": "AKIDEXAMPLE",
            "secret": "secret",
            "payload": "{}",
            "regions": ["us-east-1", "eu-west-1"]
        }"#;
        let batch: LaunchBatch = serde_json::from_str(body).unwrap();
        assert_eq!(batch.launches, 4);
        assert_eq!(batch.mode, InvocationMode::Event);
        assert_eq!(batch.qualifier, None);
        assert!(batch.validate(10).is_ok());

        let with_mode = body.replace(
            "\"launches\": 4",
            "\"launches\": 4, \"mode\": \"RequestResponse\"",
        );
        let batch: LaunchBatch = serde_json::from_str(&with_mode).unwrap();
        assert_eq!(batch.mode, InvocationMode::RequestResponse);
    }

    #[test]
    fn rejects_empty_batches() {
        assert!(matches!(
            batch("demo", 0).validate(10),
            Err(BatcherError::InvalidBatch(_))
        ));

        let mut no_regions = batch("demo", 1);
        no_regions.regions.clear();
        assert!(matches!(
            no_regions.validate(10),
            Err(BatcherError::InvalidBatch(_))
        ));
    }

    #[test]
    fn rejects_batches_over_the_limit() {
        assert!(batch("demo", 10).validate(10).is_ok());
        assert!(matches!(
            batch("demo", 11).validate(10),
            Err(BatcherError::InvalidBatch(_))
        ));
        assert!(matches!(
            batch("demo", usize::MAX).validate(10_000),
            Err(BatcherError::InvalidBatch(_))
        ));
    }

    #[test]
    fn debug_hides_secret() {
        let rendered = format!("{:?}", batch("demo", 1));
        assert!(!rendered.contains("wJalr"));
        assert!(rendered.contains("demo"));
    }

    #[test]
    fn drain_takes_everything_queued() {
        let (queue, mut receiver) = batch_queue();
        assert!(receiver.drain().is_empty());

        for launches in [1, 2, 3] {
            queue.enqueue(batch("demo", launches)).unwrap();
        }
        let drained: Vec<usize> = receiver
            .drain()
            .into_iter()
            .map(|q| q.batch.launches)
            .collect();
        assert_eq!(drained, vec![1, 2, 3]);
        assert!(receiver.drain().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_producers_lose_nothing() {
        const PRODUCERS: usize = 8;
        const PER_PRODUCER: usize = 250;

        let (queue, mut receiver) = batch_queue();
        let mut producers = tokio::task::JoinSet::new();
        for producer in 0..PRODUCERS {
            let queue = queue.clone();
            producers.spawn(async move {
                for n in 0..PER_PRODUCER {
                    let name = format!("fn-{producer}-{n}");
                    queue.enqueue(batch(&name, 1)).unwrap();
                    if n % 16 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            });
        }

        // Drain while the producers are still running.
        let mut seen = std::collections::HashSet::new();
        while !producers.is_empty() {
            for queued in receiver.drain() {
                assert!(seen.insert(queued.batch.function_name));
            }
            if let Some(joined) = producers.try_join_next() {
                joined.unwrap();
            } else {
                tokio::task::yield_now().await;
            }
        }
        for queued in receiver.drain() {
            assert!(seen.insert(queued.batch.function_name));
        }

        assert_eq!(seen.len(), PRODUCERS * PER_PRODUCER);
        assert!(receiver.drain().is_empty());
    }

    #[test]
    fn enqueue_fails_without_receiver() {
        let (queue, receiver) = batch_queue();
        drop(receiver);
        assert!(matches!(
            queue.enqueue(batch("demo", 1)),
            Err(BatcherError::QueueClosed)
        ));
    }
}
