use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;

use super::{ensure_success, ClientError, ConnectionRegistry, EndpointDescriptor};
use crate::pending::{PendingCall, PendingCalls};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// One request/response call against the backend.
#[derive(Debug, Clone)]
pub struct RpcRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<serde_json::Value>,
    /// Overrides the client's default timeout.
    pub timeout: Option<Duration>,
}

impl RpcRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            body: None,
            timeout: None,
        }
    }

    pub fn post(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            body: Some(body),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// JSON request/response helper keyed by logical command.
///
/// A newer call for a key supersedes the older one, which then resolves with
/// [`ClientError::Superseded`] and never with a value.
pub struct RpcClient {
    registry: Arc<ConnectionRegistry>,
    http: reqwest::Client,
    default_timeout: Duration,
    pending: PendingCalls,
}

impl RpcClient {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            http: reqwest::Client::new(),
            default_timeout: DEFAULT_TIMEOUT,
            pending: PendingCalls::new(),
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Call the current endpoint. The call supersedes any older one for `key`
    /// even when there is no endpoint to send it to.
    pub async fn call(
        &self,
        key: &str,
        request: RpcRequest,
    ) -> Result<serde_json::Value, ClientError> {
        let call = self.pending.begin(key);
        let endpoint = self.registry.endpoint().ok_or(ClientError::NotConnected)?;
        self.exchange(&call, &endpoint, request).await
    }

    /// Call a specific endpoint (used by probes that already hold a snapshot).
    pub async fn call_at(
        &self,
        endpoint: &EndpointDescriptor,
        key: &str,
        request: RpcRequest,
    ) -> Result<serde_json::Value, ClientError> {
        let call = self.pending.begin(key);
        self.exchange(&call, endpoint, request).await
    }

    async fn exchange(
        &self,
        call: &PendingCall<'_>,
        endpoint: &EndpointDescriptor,
        request: RpcRequest,
    ) -> Result<serde_json::Value, ClientError> {
        let key = call.key();
        let timeout = request.timeout.unwrap_or(self.default_timeout);
        let url = endpoint.url(&request.path);
        log::debug!("{} {} ({})", request.method, url, key);

        let mut builder = self.http.request(request.method, &url);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        let exchange = async {
            let res = ensure_success(builder.send().await?).await?;
            Ok::<_, ClientError>(res.json::<serde_json::Value>().await?)
        };

        let result = tokio::select! {
            biased;
            _ = call.token().cancelled() => Err(ClientError::Superseded),
            outcome = tokio::time::timeout(timeout, exchange) => match outcome {
                Ok(result) => result,
                Err(_) => Err(ClientError::Timeout(timeout)),
            },
        };
        if !call.is_current() {
            return Err(ClientError::Superseded);
        }
        result
    }

    /// Cancel the in-flight call for `key`, if any.
    pub fn cancel(&self, key: &str) -> bool {
        self.pending.cancel(key)
    }
}
