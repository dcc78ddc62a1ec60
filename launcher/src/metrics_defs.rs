//! Metrics definitions for launches.

use shared::metrics_defs::{MetricDef, MetricType};

pub const SLOTS_READY: MetricDef = MetricDef {
    name: "launch.slots.ready",
    metric_type: MetricType::Counter,
    description: "Slots whose connection was established",
};

pub const SLOTS_FAILED: MetricDef = MetricDef {
    name: "launch.slots.failed",
    metric_type: MetricType::Counter,
    description: "Slots whose connection could not be established",
};

pub const CONNECT_DURATION: MetricDef = MetricDef {
    name: "launch.connect.duration",
    metric_type: MetricType::Histogram,
    description: "Time until every slot of a launch is ready or failed, in seconds",
};

pub const SEND_DURATION: MetricDef = MetricDef {
    name: "launch.send.duration",
    metric_type: MetricType::Histogram,
    description: "Time to dispatch every request of a launch, in seconds",
};

pub const RESPONSES_UNSUCCESSFUL: MetricDef = MetricDef {
    name: "launch.responses.unsuccessful",
    metric_type: MetricType::Counter,
    description: "Sent requests that failed or got a non-success response",
};

pub const LAUNCH_DURATION: MetricDef = MetricDef {
    name: "launch.duration",
    metric_type: MetricType::Histogram,
    description: "End-to-end duration of a fan-out launch in seconds",
};

pub const ALL_METRICS: &[MetricDef] = &[
    SLOTS_READY,
    SLOTS_FAILED,
    CONNECT_DURATION,
    SEND_DURATION,
    RESPONSES_UNSUCCESSFUL,
    LAUNCH_DURATION,
];
