// Observability: pipeline counters. Logging setup lives in crate::logging.

pub mod metrics;

pub use metrics::MetricName;
