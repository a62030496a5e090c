//! Shared tracing bootstrap for the cluster-latency binaries.

mod subscriber;

pub use subscriber::{LogFormat, init_tracing, init_tracing_with};
