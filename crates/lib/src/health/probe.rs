use std::sync::Arc;

use async_trait::async_trait;

use crate::connection::{ClientError, EndpointDescriptor, RpcClient, RpcRequest};

/// Value of the `status` field a serving backend reports.
pub const HEALTHY_STATUS: &str = "healthy";

const PROBE_KEY: &str = "health";

/// Confirms a backend is serving requests, not just alive as a process.
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn probe(&self, endpoint: &EndpointDescriptor) -> Result<(), ClientError>;
}

/// `GET {address}{path}`, healthy iff the JSON `status` field is [`HEALTHY_STATUS`].
pub struct HttpProbe {
    rpc: Arc<RpcClient>,
    path: String,
}

impl HttpProbe {
    pub fn new(rpc: Arc<RpcClient>, path: impl Into<String>) -> Self {
        Self {
            rpc,
            path: path.into(),
        }
    }
}

#[async_trait]
impl LivenessProbe for HttpProbe {
    async fn probe(&self, endpoint: &EndpointDescriptor) -> Result<(), ClientError> {
        let payload = self
            .rpc
            .call_at(endpoint, PROBE_KEY, RpcRequest::get(self.path.clone()))
            .await?;
        if is_healthy_payload(&payload) {
            Ok(())
        } else {
            Err(ClientError::Unhealthy(payload.to_string()))
        }
    }
}

pub fn is_healthy_payload(payload: &serde_json::Value) -> bool {
    payload
        .get("status")
        .and_then(|v| v.as_str())
        .is_some_and(|s| s.trim().eq_ignore_ascii_case(HEALTHY_STATUS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn healthy_payload_requires_status_field() {
        assert!(is_healthy_payload(&json!({ "status": "healthy" })));
        assert!(is_healthy_payload(&json!({ "status": "Healthy", "version": "1.2" })));
        assert!(!is_healthy_payload(&json!({ "status": "degraded" })));
        assert!(!is_healthy_payload(&json!({ "healthy": true })));
        assert!(!is_healthy_payload(&json!("healthy")));
    }
}
