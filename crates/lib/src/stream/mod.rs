//! Streamed backend output: SSE decoding and the chat and task-progress
//! controllers built on it.

mod call;
mod chat;
mod decoder;
mod task;

pub use call::{CallOutcome, StreamClient, StreamError};
pub use chat::{ChatAnswer, ChatRequest, ChatStreamer, ChatUpdate, UserMessage};
pub use decoder::{
    decode_stream, DecodeOutcome, SseDecoder, StreamEvent, DEFAULT_EVENT_NAME, DONE_SENTINEL,
};
pub use task::{TaskReport, TaskStreamer, TaskUpdate};
