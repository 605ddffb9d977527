use std::ops::ControlFlow;

use futures_util::{Stream, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::connection::ClientError;

/// Data payload that marks the end of a stream; never produces an event.
pub const DONE_SENTINEL: &str = "[DONE]";
/// Event name used when an event carries no `event:` field.
pub const DEFAULT_EVENT_NAME: &str = "data";

#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub event_name: String,
    pub payload: Value,
}

/// Incremental decoder for one body. Lines are split on raw bytes, so a UTF-8
/// sequence cut across chunks is whole again before it is decoded as text.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event_name: Option<String>,
    payload: Option<Value>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one chunk and return the events it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let mut buffer = std::mem::take(&mut self.buffer);
        // The carried-over tail holds no newline; only the new bytes are scanned.
        let mut scan = buffer.len();
        buffer.extend_from_slice(chunk);
        let mut start = 0;
        let mut events = Vec::new();
        while let Some(offset) = buffer[scan..].iter().position(|&b| b == b'\n') {
            let end = scan + offset;
            if let Some(event) = self.process_line(&buffer[start..end]) {
                events.push(event);
            }
            start = end + 1;
            scan = start;
        }
        buffer.drain(..start);
        self.buffer = buffer;
        events
    }

    /// End of body: the unterminated tail counts as a line, then any pending
    /// event with accepted data is emitted.
    pub fn finish(&mut self) -> Option<StreamEvent> {
        let tail = std::mem::take(&mut self.buffer);
        if !tail.is_empty() {
            if let Some(event) = self.process_line(&tail) {
                return Some(event);
            }
        }
        self.flush()
    }

    fn process_line(&mut self, raw: &[u8]) -> Option<StreamEvent> {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let line = String::from_utf8_lossy(raw);
        if line.is_empty() {
            return self.flush();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value),
            None => (&*line, ""),
        };
        match field {
            "event" => self.event_name = Some(value.trim().to_string()),
            "data" => self.accept_data(value.trim()),
            _ => {}
        }
        None
    }

    fn accept_data(&mut self, data: &str) {
        if data == DONE_SENTINEL {
            return;
        }
        match serde_json::from_str::<Value>(data) {
            Ok(value) => self.payload = Some(value),
            Err(e) => log::warn!("dropping malformed stream data ({}): {}", e, data),
        }
    }

    fn flush(&mut self) -> Option<StreamEvent> {
        let event_name = self.event_name.take();
        let payload = self.payload.take()?;
        Some(StreamEvent {
            event_name: event_name.unwrap_or_else(|| DEFAULT_EVENT_NAME.to_string()),
            payload,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// The body ended; every event was delivered.
    Finished,
    /// The consumer returned `ControlFlow::Break`.
    Stopped,
    /// The token was cancelled before the body ended.
    Cancelled,
}

/// Drive `body` through a decoder, handing each event to `on_event`.
///
/// The token is checked before every delivery, so nothing is delivered once it
/// is cancelled. The body is dropped on every exit path.
pub async fn decode_stream<S, B, F>(
    body: S,
    cancel: &CancellationToken,
    mut on_event: F,
) -> Result<DecodeOutcome, ClientError>
where
    S: Stream<Item = Result<B, reqwest::Error>>,
    B: AsRef<[u8]>,
    F: FnMut(StreamEvent) -> ControlFlow<()>,
{
    let mut body = std::pin::pin!(body);
    let mut decoder = SseDecoder::new();
    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(DecodeOutcome::Cancelled),
            chunk = body.next() => chunk,
        };
        let events = match chunk {
            Some(Ok(bytes)) => decoder.feed(bytes.as_ref()),
            Some(Err(e)) => return Err(e.into()),
            None => break,
        };
        for event in events {
            if cancel.is_cancelled() {
                return Ok(DecodeOutcome::Cancelled);
            }
            if on_event(event).is_break() {
                return Ok(DecodeOutcome::Stopped);
            }
        }
    }
    if let Some(event) = decoder.finish() {
        if cancel.is_cancelled() {
            return Ok(DecodeOutcome::Cancelled);
        }
        if on_event(event).is_break() {
            return Ok(DecodeOutcome::Stopped);
        }
    }
    Ok(DecodeOutcome::Finished)
}
