use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::ClientError;
use crate::bus::{BusEvent, EventBus, SERVER_READY};

/// Where the current backend process serves, and which process it is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointDescriptor {
    /// Base URL without trailing slash, e.g. `http://127.0.0.1:8420`.
    pub address: String,
    pub process_id: u32,
    pub established_at: DateTime<Utc>,
}

impl EndpointDescriptor {
    pub fn new(address: impl Into<String>, process_id: u32) -> Self {
        let address = address.into().trim_end_matches('/').to_string();
        Self {
            address,
            process_id,
            established_at: Utc::now(),
        }
    }

    /// Absolute URL for a path on this endpoint.
    pub fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.address, path)
        } else {
            format!("{}/{}", self.address, path)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connected(EndpointDescriptor),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected(_))
    }

    pub fn endpoint(&self) -> Option<&EndpointDescriptor> {
        match self {
            ConnectionState::Connected(endpoint) => Some(endpoint),
            ConnectionState::Disconnected => None,
        }
    }
}

/// Notifications a process supervisor sends to the registry.
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorNotice {
    Ready(EndpointDescriptor),
    Exited {
        process_id: u32,
        exit_code: Option<i32>,
    },
}

/// The outbound half of the supervisor contract: start a fresh backend process.
#[async_trait]
pub trait BackendSupervisor: Send + Sync {
    async fn restart_backend(&self) -> Result<EndpointDescriptor, ClientError>;
}

pub struct ConnectionRegistry {
    state: RwLock<ConnectionState>,
    bus: Arc<EventBus>,
    supervisor: Arc<dyn BackendSupervisor>,
    /// Serializes restarts so overlapping recovery attempts do not race.
    restarting: tokio::sync::Mutex<()>,
}

impl ConnectionRegistry {
    pub fn new(bus: Arc<EventBus>, supervisor: Arc<dyn BackendSupervisor>) -> Self {
        Self {
            state: RwLock::new(ConnectionState::Disconnected),
            bus,
            supervisor,
            restarting: tokio::sync::Mutex::new(()),
        }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, ConnectionState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, ConnectionState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn state(&self) -> ConnectionState {
        self.read_state().clone()
    }

    pub fn endpoint(&self) -> Option<EndpointDescriptor> {
        self.read_state().endpoint().cloned()
    }

    pub fn is_connected(&self) -> bool {
        self.read_state().is_connected()
    }

    /// Supervisor says a backend process is serving.
    ///
    /// A ready notice for the process already recorded is absorbed, so a restart
    /// applied by [`restart`](Self::restart) and the supervisor's own notice for
    /// it publish `server-ready` once.
    pub fn handle_ready(&self, endpoint: EndpointDescriptor) {
        let was_connected = {
            let mut state = self.write_state();
            if let ConnectionState::Connected(current) = &*state {
                if current.process_id == endpoint.process_id {
                    log::debug!("ready notice for pid {} already applied", endpoint.process_id);
                    return;
                }
            }
            let was_connected = state.is_connected();
            *state = ConnectionState::Connected(endpoint.clone());
            was_connected
        };
        log::info!(
            "backend ready at {} (pid {})",
            endpoint.address,
            endpoint.process_id
        );
        self.bus.publish(&BusEvent::ServerReady(endpoint));
        if !was_connected {
            self.bus.publish(&BusEvent::ConnectionStatusChanged(true));
        }
    }

    /// Supervisor says the backend process terminated.
    pub fn handle_disconnected(&self, exit_code: Option<i32>) {
        let was_connected = {
            let mut state = self.write_state();
            let was_connected = state.is_connected();
            *state = ConnectionState::Disconnected;
            was_connected
        };
        log::warn!("backend disconnected (exit code {:?})", exit_code);
        self.bus.publish(&BusEvent::ServerDisconnected { exit_code });
        if was_connected {
            self.bus.publish(&BusEvent::ConnectionStatusChanged(false));
        }
    }

    /// Apply one supervisor notice. Exit notices for a process other than the
    /// current one (e.g. the process a restart just replaced) are ignored.
    pub fn apply_notice(&self, notice: SupervisorNotice) {
        match notice {
            SupervisorNotice::Ready(endpoint) => self.handle_ready(endpoint),
            SupervisorNotice::Exited {
                process_id,
                exit_code,
            } => {
                let current = self.read_state().endpoint().map(|e| e.process_id);
                if current == Some(process_id) {
                    self.handle_disconnected(exit_code);
                } else {
                    log::debug!(
                        "ignoring exit of stale backend pid {} (code {:?})",
                        process_id,
                        exit_code
                    );
                }
            }
        }
    }

    /// Forward supervisor notices into the registry until the sender side closes.
    pub fn listen(
        self: &Arc<Self>,
        mut notices: mpsc::UnboundedReceiver<SupervisorNotice>,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(notice) = notices.recv().await {
                registry.apply_notice(notice);
            }
            log::debug!("supervisor notice channel closed");
        })
    }

    /// Ask the supervisor for a fresh backend process.
    ///
    /// The registry is Disconnected while the restart is in flight. On failure
    /// `connection-status-changed(false)` is published only if it had been
    /// connected, and the error is returned.
    pub async fn restart(&self) -> Result<EndpointDescriptor, ClientError> {
        let _restarting = self.restarting.lock().await;
        let was_connected = {
            let mut state = self.write_state();
            let was_connected = state.is_connected();
            *state = ConnectionState::Disconnected;
            was_connected
        };
        log::info!("restarting backend");
        match self.supervisor.restart_backend().await {
            Ok(endpoint) => {
                self.handle_ready(endpoint.clone());
                Ok(endpoint)
            }
            Err(e) => {
                log::warn!("backend restart failed: {}", e);
                if was_connected {
                    self.bus.publish(&BusEvent::ConnectionStatusChanged(false));
                }
                Err(e)
            }
        }
    }

    /// Resolve with the endpoint once connected, or fail with [`ClientError::Timeout`].
    ///
    /// When already connected this is a plain read; no subscription is made.
    pub async fn wait_for_ready(
        &self,
        timeout: Duration,
    ) -> Result<EndpointDescriptor, ClientError> {
        if let Some(endpoint) = self.endpoint() {
            return Ok(endpoint);
        }
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let _subscription = self.bus.subscribe_scoped(SERVER_READY, move |event| {
            if let BusEvent::ServerReady(endpoint) = event {
                if let Some(tx) = tx.lock().unwrap_or_else(|e| e.into_inner()).take() {
                    let _ = tx.send(endpoint.clone());
                }
            }
        });
        // A ready notice may have landed between the first read and subscribing.
        if let Some(endpoint) = self.endpoint() {
            return Ok(endpoint);
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(endpoint)) => Ok(endpoint),
            Ok(Err(_)) => Err(ClientError::NotConnected),
            Err(_) => Err(ClientError::Timeout(timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{CONNECTION_STATUS_CHANGED, SERVER_DISCONNECTED};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Supervisor that hands out increasing pids, or fails when `fail` is set.
    struct FakeSupervisor {
        next_pid: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl BackendSupervisor for FakeSupervisor {
        async fn restart_backend(&self) -> Result<EndpointDescriptor, ClientError> {
            if self.fail {
                return Err(ClientError::Supervisor("spawn failed".to_string()));
            }
            let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
            Ok(EndpointDescriptor::new("http://127.0.0.1:9000", pid))
        }
    }

    fn registry(fail: bool) -> (Arc<ConnectionRegistry>, Arc<Mutex<Vec<BusEvent>>>) {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        for name in [SERVER_READY, SERVER_DISCONNECTED, CONNECTION_STATUS_CHANGED] {
            let seen = Arc::clone(&seen);
            bus.subscribe(name, move |e| seen.lock().unwrap().push(e.clone()));
        }
        let supervisor = Arc::new(FakeSupervisor {
            next_pid: AtomicU32::new(100),
            fail,
        });
        (Arc::new(ConnectionRegistry::new(bus, supervisor)), seen)
    }

    #[test]
    fn endpoint_url_joins_paths() {
        let endpoint = EndpointDescriptor::new("http://127.0.0.1:8420/", 1);
        assert_eq!(endpoint.address, "http://127.0.0.1:8420");
        assert_eq!(endpoint.url("/health"), "http://127.0.0.1:8420/health");
        assert_eq!(endpoint.url("health"), "http://127.0.0.1:8420/health");
    }

    #[test]
    fn ready_then_disconnect_publishes_transitions() {
        let (registry, seen) = registry(false);
        let endpoint = EndpointDescriptor::new("http://127.0.0.1:9000", 7);
        registry.handle_ready(endpoint.clone());
        assert!(registry.is_connected());
        assert_eq!(registry.endpoint(), Some(endpoint.clone()));

        registry.handle_disconnected(Some(1));
        assert!(!registry.is_connected());
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                BusEvent::ServerReady(endpoint),
                BusEvent::ConnectionStatusChanged(true),
                BusEvent::ServerDisconnected { exit_code: Some(1) },
                BusEvent::ConnectionStatusChanged(false),
            ]
        );
    }

    #[test]
    fn duplicate_ready_for_same_process_is_absorbed() {
        let (registry, seen) = registry(false);
        let endpoint = EndpointDescriptor::new("http://127.0.0.1:9000", 7);
        registry.handle_ready(endpoint.clone());
        registry.handle_ready(endpoint);
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn exit_of_stale_process_is_ignored() {
        let (registry, _seen) = registry(false);
        registry.handle_ready(EndpointDescriptor::new("http://127.0.0.1:9000", 8));
        registry.apply_notice(SupervisorNotice::Exited {
            process_id: 7,
            exit_code: Some(0),
        });
        assert!(registry.is_connected());
        registry.apply_notice(SupervisorNotice::Exited {
            process_id: 8,
            exit_code: None,
        });
        assert!(!registry.is_connected());
    }

    #[tokio::test]
    async fn restart_success_connects_and_publishes() {
        let (registry, seen) = registry(false);
        let endpoint = registry.restart().await.unwrap();
        assert_eq!(endpoint.process_id, 100);
        assert_eq!(registry.endpoint(), Some(endpoint.clone()));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                BusEvent::ServerReady(endpoint),
                BusEvent::ConnectionStatusChanged(true),
            ]
        );
    }

    #[tokio::test]
    async fn restart_failure_publishes_false_only_when_previously_connected() {
        let (registry, seen) = registry(true);
        assert!(registry.restart().await.is_err());
        assert!(seen.lock().unwrap().is_empty());

        registry.handle_ready(EndpointDescriptor::new("http://127.0.0.1:9000", 5));
        seen.lock().unwrap().clear();
        let err = registry.restart().await.unwrap_err();
        assert!(matches!(err, ClientError::Supervisor(_)));
        assert!(!registry.is_connected());
        assert_eq!(
            *seen.lock().unwrap(),
            vec![BusEvent::ConnectionStatusChanged(false)]
        );
    }

    #[tokio::test]
    async fn wait_for_ready_when_connected_makes_no_subscription() {
        let (registry, _seen) = registry(false);
        let endpoint = EndpointDescriptor::new("http://127.0.0.1:9000", 3);
        registry.handle_ready(endpoint.clone());
        let before = registry.bus().handler_count(SERVER_READY);
        let got = registry.wait_for_ready(Duration::from_secs(1)).await.unwrap();
        assert_eq!(got, endpoint);
        assert_eq!(registry.bus().handler_count(SERVER_READY), before);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_ready_times_out_and_unsubscribes() {
        let (registry, _seen) = registry(false);
        let before = registry.bus().handler_count(SERVER_READY);
        let err = registry
            .wait_for_ready(Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(registry.bus().handler_count(SERVER_READY), before);
    }

    #[tokio::test]
    async fn wait_for_ready_resolves_on_ready_notice() {
        let (registry, _seen) = registry(false);
        let before = registry.bus().handler_count(SERVER_READY);
        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.wait_for_ready(Duration::from_secs(5)).await })
        };
        while registry.bus().handler_count(SERVER_READY) == before {
            tokio::task::yield_now().await;
        }
        let endpoint = EndpointDescriptor::new("http://127.0.0.1:9000", 11);
        registry.handle_ready(endpoint.clone());
        assert_eq!(waiter.await.unwrap().unwrap(), endpoint);
        assert_eq!(registry.bus().handler_count(SERVER_READY), before);
    }

    #[tokio::test]
    async fn notices_are_applied_from_channel() {
        let (registry, _seen) = registry(false);
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = registry.listen(rx);
        tx.send(SupervisorNotice::Ready(EndpointDescriptor::new("http://127.0.0.1:9000", 4)))
            .unwrap();
        drop(tx);
        listener.await.unwrap();
        assert!(registry.is_connected());
    }
}
