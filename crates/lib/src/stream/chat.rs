use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::call::{text_field, CallOutcome, EventFolder, Fold, StreamClient, StreamError};
use super::decoder::StreamEvent;

#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub chat_id: String,
    pub message: String,
}

impl ChatRequest {
    pub fn new(chat_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            message: message.into(),
        }
    }
}

/// The user's message as the backend recorded it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserMessage {
    pub message_id: Option<String>,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatAnswer {
    pub message_id: Option<String>,
    pub content: String,
    pub sources: Vec<Value>,
    pub confidence: Option<f64>,
    pub processing_time_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChatUpdate {
    UserMessage(UserMessage),
    Status(String),
    Sources(Vec<Value>),
    /// One streamed fragment and the answer accumulated so far.
    Content { delta: String, partial: String },
    Done(ChatAnswer),
}

/// Payload of the terminal `done` event. Every field is optional on the wire.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DonePayload {
    #[serde(alias = "id")]
    message_id: Option<String>,
    content: Option<String>,
    sources: Option<Vec<Value>>,
    confidence: Option<f64>,
    #[serde(alias = "processing_time")]
    processing_time_ms: Option<u64>,
}

/// Streams one chat turn. Calls are keyed by chat id.
pub struct ChatStreamer {
    client: Arc<StreamClient>,
    path: String,
}

impl ChatStreamer {
    pub fn new(client: Arc<StreamClient>, path: impl Into<String>) -> Self {
        Self {
            client,
            path: path.into(),
        }
    }

    /// Send `request.message` and stream the answer into `on_update`.
    ///
    /// A second `run` for the same chat id supersedes this one, which then
    /// returns `Ok(CallOutcome::Cancelled)` without further updates.
    pub async fn run<F>(
        &self,
        request: &ChatRequest,
        on_update: F,
    ) -> Result<CallOutcome<ChatAnswer>, StreamError>
    where
        F: FnMut(ChatUpdate),
    {
        let folder = ChatFold::new(&request.message);
        self.client
            .run_folded(
                &target(&request.chat_id),
                |http, endpoint| http.post(endpoint.url(&self.path)).json(request),
                folder,
                on_update,
            )
            .await
    }

    pub fn cancel(&self, chat_id: &str) -> bool {
        self.client.cancel(&target(chat_id))
    }

    pub fn is_streaming(&self, chat_id: &str) -> bool {
        self.client.is_active(&target(chat_id))
    }
}

fn target(chat_id: &str) -> String {
    format!("chat:{}", chat_id)
}

struct ChatFold {
    sent: String,
    partial: String,
    sources: Vec<Value>,
    answer: Option<ChatAnswer>,
}

impl ChatFold {
    fn new(sent: &str) -> Self {
        Self {
            sent: sent.to_string(),
            partial: String::new(),
            sources: Vec::new(),
            answer: None,
        }
    }

    fn user_message(&self, payload: &Value) -> UserMessage {
        let message = payload.get("user_message").unwrap_or(payload);
        UserMessage {
            message_id: text_field(message, &["message_id", "id"]),
            content: message
                .get("content")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| self.sent.clone()),
        }
    }

    fn finish(&mut self, payload: Value) -> ChatAnswer {
        let done: DonePayload = serde_json::from_value(payload).unwrap_or_else(|e| {
            log::warn!("unexpected done payload: {}", e);
            DonePayload::default()
        });
        let answer = ChatAnswer {
            message_id: done.message_id,
            content: done.content.unwrap_or_else(|| self.partial.clone()),
            sources: done.sources.unwrap_or_else(|| self.sources.clone()),
            confidence: done.confidence,
            processing_time_ms: done.processing_time_ms,
        };
        self.answer = Some(answer.clone());
        answer
    }
}

impl EventFolder for ChatFold {
    type Update = ChatUpdate;
    type Output = ChatAnswer;

    fn fold(&mut self, event: StreamEvent) -> Fold<ChatUpdate> {
        let payload = event.payload;
        match event.event_name.as_str() {
            "metadata" | "user_message" => {
                Fold::Update(ChatUpdate::UserMessage(self.user_message(&payload)))
            }
            "status" => match text_field(&payload, &["message", "status"]) {
                Some(status) => Fold::Update(ChatUpdate::Status(status)),
                None => Fold::Ignored,
            },
            "sources" => {
                let sources = match payload {
                    Value::Array(items) => items,
                    Value::Object(mut map) => match map.remove("sources") {
                        Some(Value::Array(items)) => items,
                        _ => Vec::new(),
                    },
                    _ => Vec::new(),
                };
                self.sources = sources.clone();
                Fold::Update(ChatUpdate::Sources(sources))
            }
            "content" => match text_field(&payload, &["content", "delta", "text"]) {
                Some(delta) => {
                    self.partial.push_str(&delta);
                    Fold::Update(ChatUpdate::Content {
                        delta,
                        partial: self.partial.clone(),
                    })
                }
                None => Fold::Ignored,
            },
            "done" => Fold::Finished(ChatUpdate::Done(self.finish(payload))),
            "error" => Fold::Failed(
                text_field(&payload, &["error", "message", "detail"])
                    .unwrap_or_else(|| payload.to_string()),
            ),
            other => {
                log::debug!("ignoring chat event {}", other);
                Fold::Ignored
            }
        }
    }

    fn complete(self) -> Result<ChatAnswer, StreamError> {
        self.answer.ok_or(StreamError::Incomplete {
            partial: self.partial,
        })
    }
}
