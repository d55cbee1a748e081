pub mod backoff;
pub mod metrics;
pub mod shutdown;
pub mod telemetry;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
