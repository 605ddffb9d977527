use std::time::Duration;

/// Failures talking to (or managing) the backend.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("backend request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("backend returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("backend not connected")]
    NotConnected,
    #[error("superseded by a newer call")]
    Superseded,
    #[error("backend unhealthy: {0}")]
    Unhealthy(String),
    #[error("supervisor error: {0}")]
    Supervisor(String),
}

impl ClientError {
    /// True for our own timeouts and for reqwest's.
    pub fn is_timeout(&self) -> bool {
        match self {
            ClientError::Timeout(_) => true,
            ClientError::Request(e) => e.is_timeout(),
            _ => false,
        }
    }

    /// True when the call was abandoned rather than failed.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ClientError::Superseded)
    }
}

/// Map a non-2xx response to [`ClientError::Status`], keeping the body for diagnostics.
pub(crate) async fn ensure_success(
    res: reqwest::Response,
) -> Result<reqwest::Response, ClientError> {
    if !res.status().is_success() {
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        return Err(ClientError::Status { status, body });
    }
    Ok(res)
}
