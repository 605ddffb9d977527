//! Backend process supervision: spawn the configured command, wait until it
//! serves, and report readiness and exit to the connection registry.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::BackendConfig;
use crate::connection::{BackendSupervisor, ClientError, EndpointDescriptor, SupervisorNotice};

const READY_POLL: Duration = Duration::from_millis(250);

struct Running {
    process_id: u32,
    stop: CancellationToken,
    watcher: JoinHandle<()>,
}

/// Owns at most one backend child process at a time.
pub struct ProcessSupervisor {
    config: BackendConfig,
    health_path: String,
    notices: mpsc::UnboundedSender<SupervisorNotice>,
    http: reqwest::Client,
    /// Held across a whole start so restarts never overlap.
    current: tokio::sync::Mutex<Option<Running>>,
}

impl ProcessSupervisor {
    /// The receiver should be handed to
    /// [`ConnectionRegistry::listen`](crate::connection::ConnectionRegistry::listen).
    pub fn new(
        config: BackendConfig,
        health_path: impl Into<String>,
    ) -> (Self, mpsc::UnboundedReceiver<SupervisorNotice>) {
        let (notices, rx) = mpsc::unbounded_channel();
        let supervisor = Self {
            config,
            health_path: health_path.into(),
            notices,
            http: reqwest::Client::new(),
            current: tokio::sync::Mutex::new(None),
        };
        (supervisor, rx)
    }

    /// Stop any running child, spawn a new one and wait until it answers on the
    /// liveness path. Sends [`SupervisorNotice::Ready`] on success.
    pub async fn start(&self) -> Result<EndpointDescriptor, ClientError> {
        let mut current = self.current.lock().await;
        if let Some(running) = current.take() {
            stop_running(running).await;
        }

        let command = self
            .config
            .command
            .as_deref()
            .ok_or_else(|| ClientError::Supervisor("no backend command configured".to_string()))?;
        let port = resolve_port(&self.config.bind, self.config.port)?;
        let port_str = port.to_string();
        let args: Vec<String> = self
            .config
            .args
            .iter()
            .map(|a| a.replace("{port}", &port_str))
            .collect();

        log::info!("starting backend: {} {}", command, args.join(" "));
        let mut child = Command::new(command)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ClientError::Supervisor(format!("failed to start {}: {}", command, e)))?;
        let process_id = child
            .id()
            .ok_or_else(|| ClientError::Supervisor("backend exited immediately".to_string()))?;
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr));
        }

        let endpoint = EndpointDescriptor::new(
            format!("http://{}:{}", connect_host(&self.config.bind), port),
            process_id,
        );
        let stop = CancellationToken::new();
        let exited = CancellationToken::new();
        let watcher = tokio::spawn(watch(
            child,
            process_id,
            stop.clone(),
            exited.clone(),
            self.notices.clone(),
        ));
        *current = Some(Running {
            process_id,
            stop,
            watcher,
        });

        let ready_timeout = self.config.ready_timeout();
        let ready = wait_until_serving(
            &self.http,
            &endpoint,
            &self.health_path,
            ready_timeout,
            &exited,
        )
        .await;
        match ready {
            Ok(()) => {
                log::info!("backend pid {} serving at {}", process_id, endpoint.address);
                let _ = self.notices.send(SupervisorNotice::Ready(endpoint.clone()));
                Ok(endpoint)
            }
            Err(e) => {
                log::warn!("backend pid {} did not become ready: {}", process_id, e);
                if let Some(running) = current.take() {
                    stop_running(running).await;
                }
                Err(e)
            }
        }
    }

    /// Kill the running child, if any.
    pub async fn stop(&self) {
        if let Some(running) = self.current.lock().await.take() {
            stop_running(running).await;
        }
    }

    /// Pid of the running child, if any.
    pub async fn process_id(&self) -> Option<u32> {
        self.current.lock().await.as_ref().map(|r| r.process_id)
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if let Ok(mut current) = self.current.try_lock() {
            if let Some(running) = current.take() {
                running.stop.cancel();
            }
        }
    }
}

#[async_trait]
impl BackendSupervisor for ProcessSupervisor {
    async fn restart_backend(&self) -> Result<EndpointDescriptor, ClientError> {
        self.start().await
    }
}

/// A backend someone else runs. It can be attached to but never restarted.
pub struct ExternalBackend {
    address: String,
}

impl ExternalBackend {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }

    /// Descriptor for the attached backend; its pid is unknown and reported as 0.
    pub fn endpoint(&self) -> EndpointDescriptor {
        EndpointDescriptor::new(self.address.clone(), 0)
    }
}

#[async_trait]
impl BackendSupervisor for ExternalBackend {
    async fn restart_backend(&self) -> Result<EndpointDescriptor, ClientError> {
        Err(ClientError::Supervisor(format!(
            "backend at {} is externally managed",
            self.address
        )))
    }
}

async fn stop_running(running: Running) {
    log::info!("stopping backend pid {}", running.process_id);
    running.stop.cancel();
    if let Err(e) = running.watcher.await {
        log::warn!("backend watcher failed: {}", e);
    }
}

/// Owns the child until it exits or `stop` fires, then reports the exit.
async fn watch(
    mut child: Child,
    process_id: u32,
    stop: CancellationToken,
    exited: CancellationToken,
    notices: mpsc::UnboundedSender<SupervisorNotice>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = stop.cancelled() => {
            if let Err(e) = child.kill().await {
                log::warn!("failed to kill backend pid {}: {}", process_id, e);
            }
            child.wait().await
        }
    };
    let exit_code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            log::warn!("waiting on backend pid {} failed: {}", process_id, e);
            None
        }
    };
    exited.cancel();
    log::info!("backend pid {} exited (code {:?})", process_id, exit_code);
    let _ = notices.send(SupervisorNotice::Exited {
        process_id,
        exit_code,
    });
}

/// Log every output line until EOF and return how many were forwarded.
/// The pipe must stay drained for the child's lifetime, so lines that are not
/// UTF-8 are logged lossily rather than ending the loop.
async fn forward_output<R: AsyncRead + Unpin>(reader: R) -> usize {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut forwarded = 0;
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(|c: char| c == '\n' || c == '\r');
                log::info!("[backend] {}", line);
                forwarded += 1;
            }
            Err(e) => {
                log::debug!("backend output closed: {}", e);
                break;
            }
        }
    }
    forwarded
}

async fn wait_until_serving(
    http: &reqwest::Client,
    endpoint: &EndpointDescriptor,
    path: &str,
    timeout: Duration,
    exited: &CancellationToken,
) -> Result<(), ClientError> {
    let url = endpoint.url(path);
    let poll = async {
        loop {
            match http.get(&url).send().await {
                Ok(res) if res.status().is_success() => return,
                Ok(res) => log::debug!("backend not ready yet ({})", res.status()),
                Err(e) => log::debug!("backend not ready yet: {}", e),
            }
            tokio::time::sleep(READY_POLL).await;
        }
    };
    tokio::select! {
        _ = exited.cancelled() => Err(ClientError::Supervisor(
            "backend exited before becoming ready".to_string(),
        )),
        ready = tokio::time::timeout(timeout, poll) => {
            ready.map_err(|_| ClientError::Timeout(timeout))
        }
    }
}

/// `port`, or a free port on `bind` when it is 0.
fn resolve_port(bind: &str, port: u16) -> Result<u16, ClientError> {
    if port != 0 {
        return Ok(port);
    }
    let listener = std::net::TcpListener::bind((bind, 0))
        .map_err(|e| ClientError::Supervisor(format!("no free port on {}: {}", bind, e)))?;
    listener
        .local_addr()
        .map(|a| a.port())
        .map_err(|e| ClientError::Supervisor(format!("no free port on {}: {}", bind, e)))
}

/// Host to connect to for a bind address.
fn connect_host(bind: &str) -> String {
    match bind.trim() {
        "0.0.0.0" | "" => "127.0.0.1".to_string(),
        "::" => "[::1]".to_string(),
        b if b.contains(':') && !b.starts_with('[') => format!("[{}]", b),
        b => b.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(command: Option<&str>, args: &[&str]) -> BackendConfig {
        BackendConfig {
            command: command.map(str::to_string),
            args: args.iter().map(|a| a.to_string()).collect(),
            ready_timeout_ms: 2_000,
            ..BackendConfig::default()
        }
    }

    #[test]
    fn free_port_is_chosen_for_zero() {
        assert_ne!(resolve_port("127.0.0.1", 0).unwrap(), 0);
        assert_eq!(resolve_port("127.0.0.1", 8420).unwrap(), 8420);
    }

    #[test]
    fn connect_host_maps_wildcards() {
        assert_eq!(connect_host("0.0.0.0"), "127.0.0.1");
        assert_eq!(connect_host("::"), "[::1]");
        assert_eq!(connect_host("::1"), "[::1]");
        assert_eq!(connect_host("localhost"), "localhost");
    }

    #[tokio::test]
    async fn start_without_command_fails() {
        let (supervisor, _rx) = ProcessSupervisor::new(config(None, &[]), "/health");
        let err = supervisor.start().await.unwrap_err();
        assert!(err.to_string().contains("no backend command"));
    }

    #[tokio::test]
    async fn start_of_missing_program_fails() {
        let (supervisor, _rx) =
            ProcessSupervisor::new(config(Some("tether-no-such-backend"), &[]), "/health");
        let err = supervisor.start().await.unwrap_err();
        assert!(err.to_string().contains("failed to start"));
        assert_eq!(supervisor.process_id().await, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn early_exit_is_reported() {
        let (supervisor, mut rx) =
            ProcessSupervisor::new(config(Some("sh"), &["-c", "echo {port}; exit 3"]), "/health");
        let err = supervisor.start().await.unwrap_err();
        assert!(err.to_string().contains("exited before becoming ready"));
        match rx.recv().await {
            Some(SupervisorNotice::Exited { exit_code, .. }) => assert_eq!(exit_code, Some(3)),
            other => panic!("unexpected notice {:?}", other),
        }
    }

    #[tokio::test]
    async fn output_forwarding_continues_past_invalid_utf8() {
        let output: &[u8] = b"starting\n\xff\xfe bad bytes\r\nstill here\ntail";
        assert_eq!(forward_output(output).await, 4);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn backend_printing_invalid_utf8_keeps_running() {
        let script = "printf '\\377\\n'; sleep 0.3; \
                      i=0; while [ $i -lt 50 ]; do echo line $i; i=$((i+1)); done; exit 7";
        let (supervisor, mut rx) =
            ProcessSupervisor::new(config(Some("sh"), &["-c", script]), "/health");
        let err = supervisor.start().await.unwrap_err();
        assert!(err.to_string().contains("exited before becoming ready"));
        match rx.recv().await {
            Some(SupervisorNotice::Exited { exit_code, .. }) => assert_eq!(exit_code, Some(7)),
            other => panic!("unexpected notice {:?}", other),
        }
    }

    #[tokio::test]
    async fn external_backend_cannot_restart() {
        let backend = ExternalBackend::new("http://127.0.0.1:8000/");
        assert_eq!(backend.endpoint().address, "http://127.0.0.1:8000");
        assert!(matches!(
            backend.restart_backend().await,
            Err(ClientError::Supervisor(_))
        ));
    }
}
