// Worker-side observability primitives.

pub mod metrics;

pub use metrics::{Counter, Gauge, MetricsRegistry};
