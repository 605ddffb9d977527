use std::sync::Arc;

use chrono::{DateTime, Local};
use serde::Serialize;
use serde_json::Value;

use super::call::{text_field, CallOutcome, EventFolder, Fold, StreamClient, StreamError};
use super::decoder::StreamEvent;

#[derive(Debug, Clone, PartialEq)]
pub enum TaskUpdate {
    Metadata(Value),
    Progress { percent: u8, status: String },
    /// A line appended to the task log, `[HH:MM:SS] message`.
    Log(String),
    /// The task finished; dependent state should be refreshed.
    Completed(TaskReport),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskReport {
    pub task_id: String,
    pub percent: u8,
    pub status: String,
    pub log: Vec<String>,
    pub result: Value,
}

/// Streams progress of one long-running backend task. Calls are keyed by task id.
pub struct TaskStreamer {
    client: Arc<StreamClient>,
    /// Path template containing `{task_id}`.
    path: String,
}

impl TaskStreamer {
    pub fn new(client: Arc<StreamClient>, path: impl Into<String>) -> Self {
        Self {
            client,
            path: path.into(),
        }
    }

    pub async fn run<F>(
        &self,
        task_id: &str,
        on_update: F,
    ) -> Result<CallOutcome<TaskReport>, StreamError>
    where
        F: FnMut(TaskUpdate),
    {
        let path = self.path.replace("{task_id}", task_id);
        self.client
            .run_folded(
                &target(task_id),
                |http, endpoint| http.get(endpoint.url(&path)),
                TaskFold::new(task_id),
                on_update,
            )
            .await
    }

    pub fn cancel(&self, task_id: &str) -> bool {
        self.client.cancel(&target(task_id))
    }
}

fn target(task_id: &str) -> String {
    format!("task:{}", task_id)
}

struct TaskFold {
    task_id: String,
    percent: u8,
    status: String,
    log: Vec<String>,
    report: Option<TaskReport>,
}

impl TaskFold {
    fn new(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            percent: 0,
            status: String::new(),
            log: Vec::new(),
            report: None,
        }
    }

    fn progress(&mut self, payload: &Value) -> TaskUpdate {
        let processed = payload.get("processed").and_then(Value::as_f64);
        let total = payload.get("total").and_then(Value::as_f64);
        let explicit = ["progress", "percentage", "percent"]
            .iter()
            .find_map(|k| payload.get(*k).and_then(Value::as_f64));
        let percent = match (explicit, processed, total) {
            (Some(p), _, _) => Some(p),
            (None, Some(done), Some(total)) if total > 0.0 => Some(done / total * 100.0),
            _ => None,
        };
        if let Some(p) = percent {
            self.percent = p.clamp(0.0, 100.0).round() as u8;
        }
        let status = text_field(payload, &["message", "status"]).or_else(|| {
            let (done, total) = (processed?, total?);
            let mut line = format!("Processed {}/{} items", done as u64, total as u64);
            if let Some(file) = payload.get("current_file").and_then(Value::as_str) {
                line.push_str(&format!(" ({})", file));
            }
            Some(line)
        });
        if let Some(status) = status {
            self.status = status;
        }
        TaskUpdate::Progress {
            percent: self.percent,
            status: self.status.clone(),
        }
    }

    fn log_line(&mut self, payload: &Value) -> Option<TaskUpdate> {
        let message = text_field(payload, &["message", "line"])?;
        let at = payload
            .get("timestamp")
            .and_then(Value::as_str)
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|ts| ts.with_timezone(&Local))
            .unwrap_or_else(Local::now);
        let line = match payload.get("level").and_then(Value::as_str) {
            Some(level) if !level.eq_ignore_ascii_case("info") => {
                format!("[{}] {} {}", at.format("%H:%M:%S"), level.to_uppercase(), message)
            }
            _ => format!("[{}] {}", at.format("%H:%M:%S"), message),
        };
        self.log.push(line.clone());
        Some(TaskUpdate::Log(line))
    }

    fn finish(&mut self, payload: Value) -> TaskReport {
        self.percent = 100;
        self.status = text_field(&payload, &["message", "status"])
            .unwrap_or_else(|| "Completed".to_string());
        let report = TaskReport {
            task_id: self.task_id.clone(),
            percent: self.percent,
            status: self.status.clone(),
            log: self.log.clone(),
            result: payload,
        };
        self.report = Some(report.clone());
        report
    }
}

impl EventFolder for TaskFold {
    type Update = TaskUpdate;
    type Output = TaskReport;

    fn fold(&mut self, event: StreamEvent) -> Fold<TaskUpdate> {
        let payload = event.payload;
        match event.event_name.as_str() {
            "metadata" => Fold::Update(TaskUpdate::Metadata(payload)),
            "progress" => Fold::Update(self.progress(&payload)),
            "log" => match self.log_line(&payload) {
                Some(update) => Fold::Update(update),
                None => Fold::Ignored,
            },
            "done" => Fold::Finished(TaskUpdate::Completed(self.finish(payload))),
            "error" => Fold::Failed(
                text_field(&payload, &["error", "message", "detail"])
                    .unwrap_or_else(|| payload.to_string()),
            ),
            other => {
                log::debug!("ignoring task event {}", other);
                Fold::Ignored
            }
        }
    }

    fn complete(self) -> Result<TaskReport, StreamError> {
        self.report.ok_or(StreamError::Incomplete {
            partial: self.status,
        })
    }
}
