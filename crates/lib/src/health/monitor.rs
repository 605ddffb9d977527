use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::LivenessProbe;
use crate::bus::{BusEvent, SubscriptionId, SERVER_READY};
use crate::connection::{ClientError, ConnectionRegistry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthConfig {
    /// Time between scheduled probes.
    pub interval: Duration,
    /// Per-probe timeout; a later answer counts as a failure.
    pub timeout: Duration,
    /// Consecutive failures after which recovery stops (probing continues).
    pub max_failures: u32,
    /// Delay between a failure and its recovery attempt.
    pub recovery_delay: Duration,
    /// Pause after a successful restart before re-probing.
    pub stabilize_delay: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            max_failures: 3,
            recovery_delay: Duration::from_secs(2),
            stabilize_delay: Duration::from_secs(1),
        }
    }
}

/// Outcome of the most recent probe. Only the latest is kept.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub is_healthy: bool,
    pub last_checked_at: DateTime<Utc>,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

impl HealthStatus {
    pub fn healthy(latency: Duration) -> Self {
        Self {
            is_healthy: true,
            last_checked_at: Utc::now(),
            latency_ms: Some(latency.as_millis() as u64),
            error: None,
        }
    }

    pub fn unhealthy(error: impl Into<String>) -> Self {
        Self {
            is_healthy: false,
            last_checked_at: Utc::now(),
            latency_ms: None,
            error: Some(error.into()),
        }
    }
}

/// Consecutive-failure counter that gates automatic recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    pub count: u32,
    pub max: u32,
}

impl RetryBudget {
    pub fn new(max: u32) -> Self {
        Self { count: 0, max }
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }

    /// Count one failure. Returns whether a recovery attempt may be scheduled,
    /// which holds iff `count < max` after the increment: with `max = 3` the
    /// first and second failures recover, the third and later do not.
    pub fn record_failure(&mut self) -> bool {
        self.count = self.count.saturating_add(1).min(self.max);
        self.count < self.max
    }

    pub fn is_exhausted(&self) -> bool {
        self.count >= self.max
    }
}

/// Periodically probes the current endpoint and restarts the backend through
/// the registry when probes fail.
///
/// Dropping the monitor stops it.
pub struct HealthMonitor {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Arc<ConnectionRegistry>,
    probe: Arc<dyn LivenessProbe>,
    config: HealthConfig,
    state: Mutex<MonitorState>,
    /// One probe at a time, so forced and scheduled checks count in order.
    checking: tokio::sync::Mutex<()>,
    recovery_attempts: AtomicU64,
}

struct MonitorState {
    status: Option<HealthStatus>,
    budget: RetryBudget,
    running: Option<Running>,
}

struct Running {
    /// Cancelled on stop; every task spawned for this run observes it.
    session: CancellationToken,
    ticker: JoinHandle<()>,
    ready_subscription: SubscriptionId,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        probe: Arc<dyn LivenessProbe>,
        mut config: HealthConfig,
    ) -> Self {
        config.interval = config.interval.max(Duration::from_millis(1));
        let budget = RetryBudget::new(config.max_failures);
        Self {
            inner: Arc::new(Inner {
                registry,
                probe,
                config,
                state: Mutex::new(MonitorState {
                    status: None,
                    budget,
                    running: None,
                }),
                checking: tokio::sync::Mutex::new(()),
                recovery_attempts: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.inner.config
    }

    /// Check now, then every interval. No-op when already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut state = self.inner.lock_state();
        if state.running.is_some() {
            log::debug!("health monitor already running");
            return;
        }
        let session = CancellationToken::new();
        let runtime = Handle::current();
        let weak = Arc::downgrade(&self.inner);
        let ready_session = session.clone();
        let ready_subscription = self.inner.registry.bus().subscribe(SERVER_READY, move |_| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            inner.lock_state().budget.reset();
            log::debug!("backend ready; forcing health check");
            let session = ready_session.clone();
            runtime.spawn(async move {
                inner.check(Some(&session)).await;
            });
        });
        let ticker = tokio::spawn(Arc::clone(&self.inner).run_schedule(session.clone()));
        state.running = Some(Running {
            session,
            ticker,
            ready_subscription,
        });
        log::info!(
            "health monitor started (interval {:?}, timeout {:?}, max failures {})",
            self.inner.config.interval,
            self.inner.config.timeout,
            self.inner.config.max_failures
        );
    }

    /// Cancel the schedule, pending recoveries and the ready subscription.
    pub fn stop(&self) {
        let running = self.inner.lock_state().running.take();
        if let Some(running) = running {
            running.session.cancel();
            running.ticker.abort();
            self.inner
                .registry
                .bus()
                .unsubscribe(SERVER_READY, running.ready_subscription);
            log::info!("health monitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock_state().running.is_some()
    }

    pub fn status(&self) -> Option<HealthStatus> {
        self.inner.lock_state().status.clone()
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock_state().budget.count
    }

    /// Recovery attempts scheduled since construction.
    pub fn recovery_attempts(&self) -> u64 {
        self.inner.recovery_attempts.load(Ordering::SeqCst)
    }

    /// Run one probe outside the schedule and return its status.
    ///
    /// A failure only schedules recovery while the monitor is running.
    pub async fn check_now(&self) -> Option<HealthStatus> {
        let session = self
            .inner
            .lock_state()
            .running
            .as_ref()
            .map(|r| r.session.clone());
        self.inner.check(session.as_ref()).await
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn run_schedule(self: Arc<Self>, session: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = session.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.check(Some(&session)).await;
        }
    }

    /// Probe once. Returns `None` if the session was cancelled mid-probe.
    async fn check(self: &Arc<Self>, session: Option<&CancellationToken>) -> Option<HealthStatus> {
        let _serial = self.checking.lock().await;
        let probe = async {
            let endpoint = self.registry.endpoint().ok_or(ClientError::NotConnected)?;
            let started = Instant::now();
            match tokio::time::timeout(self.config.timeout, self.probe.probe(&endpoint)).await {
                Ok(Ok(())) => Ok::<_, ClientError>(started.elapsed()),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(ClientError::Timeout(self.config.timeout)),
            }
        };
        let outcome = match session {
            Some(session) => tokio::select! {
                _ = session.cancelled() => return None,
                outcome = probe => outcome,
            },
            None => probe.await,
        };
        Some(match outcome {
            Ok(latency) => self.record_success(latency),
            Err(e) => self.record_failure(&e, session),
        })
    }

    fn record_success(&self, latency: Duration) -> HealthStatus {
        let status = HealthStatus::healthy(latency);
        {
            let mut state = self.lock_state();
            state.budget.reset();
            state.status = Some(status.clone());
        }
        log::debug!("health check ok ({:?})", latency);
        self.registry
            .bus()
            .publish(&BusEvent::HealthStatusChanged(status.clone()));
        status
    }

    fn record_failure(
        self: &Arc<Self>,
        error: &ClientError,
        session: Option<&CancellationToken>,
    ) -> HealthStatus {
        let status = HealthStatus::unhealthy(error.to_string());
        let (recover, budget) = {
            let mut state = self.lock_state();
            state.status = Some(status.clone());
            let recover = state.budget.record_failure();
            (recover, state.budget)
        };
        log::warn!(
            "health check failed ({}/{}): {}",
            budget.count,
            budget.max,
            error
        );
        self.registry
            .bus()
            .publish(&BusEvent::HealthStatusChanged(status.clone()));
        match session {
            Some(session) if recover => self.schedule_recovery(session.clone()),
            Some(_) => log::warn!("recovery budget exhausted; monitoring passively"),
            None => {}
        }
        status
    }

    fn schedule_recovery(self: &Arc<Self>, session: CancellationToken) {
        let attempt = self.recovery_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        log::info!(
            "recovery attempt {} in {:?}",
            attempt,
            self.config.recovery_delay
        );
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = session.cancelled() => return,
                _ = tokio::time::sleep(inner.config.recovery_delay) => {}
            }
            inner.recover(&session).await;
        });
    }

    async fn recover(self: &Arc<Self>, session: &CancellationToken) {
        match self.registry.restart().await {
            Ok(endpoint) => {
                log::info!("backend restarted (pid {})", endpoint.process_id);
                tokio::select! {
                    _ = session.cancelled() => return,
                    _ = tokio::time::sleep(self.config.stabilize_delay) => {}
                }
                self.spawn_check(session.clone());
            }
            Err(e) => log::warn!("recovery failed: {}; waiting for the next check", e),
        }
    }

    fn spawn_check(self: &Arc<Self>, session: CancellationToken) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.check(Some(&session)).await;
        });
    }
}
