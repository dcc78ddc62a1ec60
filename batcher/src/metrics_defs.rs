//! Metrics definitions for the batching service.

use shared::metrics_defs::{MetricDef, MetricType};

pub const BATCHES_ENQUEUED: MetricDef = MetricDef {
    name: "batcher.batches.enqueued",
    metric_type: MetricType::Counter,
    description: "Launch batches accepted onto the queue",
};

pub const QUEUE_WAIT: MetricDef = MetricDef {
    name: "batcher.queue.wait",
    metric_type: MetricType::Histogram,
    description: "Seconds a batch spent queued before being drained",
};

pub const CYCLES: MetricDef = MetricDef {
    name: "batcher.cycles",
    metric_type: MetricType::Counter,
    description: "Drain cycles that found at least one batch",
};

pub const LAUNCHES_MERGED: MetricDef = MetricDef {
    name: "batcher.launches.merged",
    metric_type: MetricType::Counter,
    description: "Batches folded into a merged launch",
};

pub const ALL_METRICS: &[MetricDef] = &[BATCHES_ENQUEUED, QUEUE_WAIT, CYCLES, LAUNCHES_MERGED];
