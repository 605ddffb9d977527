//! Health monitoring: periodic liveness probes with bounded automatic recovery.

mod monitor;
mod probe;

pub use monitor::{HealthConfig, HealthMonitor, HealthStatus, RetryBudget};
pub use probe::{is_healthy_payload, HttpProbe, LivenessProbe, HEALTHY_STATUS};
