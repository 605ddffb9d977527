use std::ops::ControlFlow;
use std::sync::Arc;

use reqwest::header::ACCEPT;
use reqwest::RequestBuilder;
use serde_json::Value;

use super::decoder::{decode_stream, DecodeOutcome, StreamEvent};
use crate::connection::{ensure_success, ClientError, ConnectionRegistry, EndpointDescriptor};
use crate::pending::PendingCalls;

const EVENT_STREAM: &str = "text/event-stream";

/// How a streaming call ended when it did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome<T> {
    Completed(T),
    /// Cancelled by the caller or superseded by a newer call for the same target.
    Cancelled,
}

impl<T> CallOutcome<T> {
    pub fn completed(self) -> Option<T> {
        match self {
            CallOutcome::Completed(value) => Some(value),
            CallOutcome::Cancelled => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, CallOutcome::Cancelled)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("backend reported an error: {0}")]
    Backend(String),
    /// The body ended before the terminal event; `partial` is what had streamed.
    #[error("stream ended before completion")]
    Incomplete { partial: String },
}

impl StreamError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, StreamError::Client(e) if e.is_cancellation())
    }
}

/// What one decoded event means to a controller.
pub(crate) enum Fold<U> {
    Update(U),
    /// Terminal success; delivered, then the call completes.
    Finished(U),
    Ignored,
    /// Terminal backend-reported failure.
    Failed(String),
}

/// Per-call state machine that turns events into updates and a final value.
pub(crate) trait EventFolder {
    type Update;
    type Output;

    fn fold(&mut self, event: StreamEvent) -> Fold<Self::Update>;

    /// Called once the body ended or a `Finished` was folded.
    fn complete(self) -> Result<Self::Output, StreamError>;
}

/// Shared transport for streaming calls, keyed by target.
///
/// Starting a call for a target that already has one in flight supersedes it,
/// even when the new call then fails to connect: the older call stops
/// delivering updates and resolves `Cancelled`. Supersession is observed
/// before each update, so a call superseded from another worker thread may
/// still finish the single `on_update` already running.
pub struct StreamClient {
    registry: Arc<ConnectionRegistry>,
    http: reqwest::Client,
    calls: PendingCalls,
}

impl StreamClient {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            http: reqwest::Client::new(),
            calls: PendingCalls::new(),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn cancel(&self, target: &str) -> bool {
        self.calls.cancel(target)
    }

    pub fn cancel_all(&self) {
        self.calls.cancel_all();
    }

    pub fn is_active(&self, target: &str) -> bool {
        self.calls.is_active(target)
    }

    pub(crate) async fn run_folded<F, U>(
        &self,
        target: &str,
        build: impl FnOnce(&reqwest::Client, &EndpointDescriptor) -> RequestBuilder,
        mut folder: F,
        mut on_update: U,
    ) -> Result<CallOutcome<F::Output>, StreamError>
    where
        F: EventFolder,
        U: FnMut(F::Update),
    {
        let call = self.calls.begin(target);
        let endpoint = self.registry.endpoint().ok_or(ClientError::NotConnected)?;
        let request = build(&self.http, &endpoint).header(ACCEPT, EVENT_STREAM);
        log::debug!("opening stream for {}", target);

        let res = tokio::select! {
            biased;
            _ = call.token().cancelled() => return Ok(CallOutcome::Cancelled),
            res = async { ensure_success(request.send().await?).await } => res?,
        };

        let mut failure = None;
        let decoded = decode_stream(res.bytes_stream(), call.token(), |event| {
            match folder.fold(event) {
                Fold::Update(_) | Fold::Finished(_) if !call.is_current() => {
                    ControlFlow::Break(())
                }
                Fold::Update(update) => {
                    on_update(update);
                    ControlFlow::Continue(())
                }
                Fold::Finished(update) => {
                    on_update(update);
                    ControlFlow::Break(())
                }
                Fold::Ignored => ControlFlow::Continue(()),
                Fold::Failed(message) => {
                    failure = Some(message);
                    ControlFlow::Break(())
                }
            }
        })
        .await;

        if !call.is_current() || decoded.as_ref().is_ok_and(|o| *o == DecodeOutcome::Cancelled) {
            log::debug!("stream for {} cancelled", target);
            return Ok(CallOutcome::Cancelled);
        }
        decoded?;
        if let Some(message) = failure {
            return Err(StreamError::Backend(message));
        }
        folder.complete().map(CallOutcome::Completed)
    }
}

/// The payload itself when it is a string, else the first string-valued key.
pub(crate) fn text_field(payload: &Value, keys: &[&str]) -> Option<String> {
    if let Some(s) = payload.as_str() {
        return Some(s.to_string());
    }
    keys.iter()
        .find_map(|k| payload.get(*k).and_then(Value::as_str))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_field_prefers_string_payload() {
        assert_eq!(text_field(&json!("boom"), &["error"]).as_deref(), Some("boom"));
        assert_eq!(
            text_field(&json!({ "message": "m", "error": "e" }), &["error", "message"]).as_deref(),
            Some("e")
        );
        assert_eq!(text_field(&json!({ "error": 3 }), &["error"]), None);
    }

    #[test]
    fn superseded_client_error_is_cancellation() {
        assert!(StreamError::from(ClientError::Superseded).is_cancellation());
        assert!(!StreamError::Backend("x".into()).is_cancellation());
    }
}
