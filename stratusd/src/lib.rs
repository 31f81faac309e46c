pub mod metrics;
pub mod shutdown;
pub mod tracing;
