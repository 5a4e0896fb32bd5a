//! # Status Monitor Service
//!
//! One polling cycle per interval. Each cycle fans out over the running
//! nodes and their workers; a semaphore caps simultaneous checks and a
//! target whose previous check is still running is skipped. Results are
//! counted in the store and published as `status.updated`. Nothing here
//! changes a node's process state.

use std::sync::Arc;
use std::time::Duration;

use shared_bus::{EventPublisher, SupervisorEvent};
use shared_rpc::NodeRpc;
use shared_types::{StatusDetail, StatusSample, SupervisorError, SupervisorResult, TargetId};
use tokio::sync::{watch, Mutex as AsyncMutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, info, warn};
use wf_01_local_store::{LocalStore, NodeFilter, WorkerFilter};

use crate::domain::{collect_targets, HealthTarget, InFlight, InFlightGuard};

/// Polling settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorConfig {
    pub poll_interval: Duration,
    /// Per-check deadline.
    pub check_timeout: Duration,
    /// Cap on simultaneous checks.
    pub max_concurrent_checks: usize,
    /// How long `destroy` waits for in-flight checks before abandoning them.
    pub shutdown_grace: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            check_timeout: Duration::from_secs(5),
            max_concurrent_checks: 4,
            shutdown_grace: Duration::from_secs(3),
        }
    }
}

struct Poller {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct Inner {
    store: Arc<LocalStore>,
    bus: Arc<dyn EventPublisher>,
    rpc: Arc<dyn NodeRpc>,
    config: MonitorConfig,
    permits: Arc<Semaphore>,
    inflight: InFlight,
    poller: AsyncMutex<Option<Poller>>,
}

/// Background health poller.
#[derive(Clone)]
pub struct StatusMonitor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for StatusMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusMonitor").finish_non_exhaustive()
    }
}

impl StatusMonitor {
    pub fn new(
        store: Arc<LocalStore>,
        bus: Arc<dyn EventPublisher>,
        rpc: Arc<dyn NodeRpc>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                bus,
                rpc,
                permits: Arc::new(Semaphore::new(config.max_concurrent_checks.max(1))),
                config,
                inflight: InFlight::default(),
                poller: AsyncMutex::new(None),
            }),
        }
    }

    /// Start the polling loop. A second call is a no-op.
    pub async fn start(&self) -> SupervisorResult<()> {
        let mut poller = self.inner.poller.lock().await;
        if poller.is_some() {
            return Ok(());
        }
        if self.inner.config.poll_interval.is_zero() {
            return Err(SupervisorError::Precondition(
                "poll interval must be positive".into(),
            ));
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.clone().run(shutdown_rx));
        *poller = Some(Poller { shutdown, task });
        info!(
            interval_ms = self.inner.config.poll_interval.as_millis() as u64,
            max_concurrent = self.inner.config.max_concurrent_checks,
            "status monitor started"
        );
        Ok(())
    }

    /// Stop the timer and wait, within the shutdown grace, for in-flight
    /// checks. Safe to call more than once, or before `start`.
    pub async fn destroy(&self) {
        let Some(poller) = self.inner.poller.lock().await.take() else {
            return;
        };
        let _ = poller.shutdown.send(true);
        if let Err(err) = poller.task.await {
            if !err.is_cancelled() {
                warn!(error = %err, "status poller ended abnormally");
            }
        }
        info!("status monitor destroyed");
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner
            .poller
            .try_lock()
            .map(|p| p.is_some())
            .unwrap_or(true)
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.inner.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut checks = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => self.spawn_cycle(&mut checks),
                Some(joined) = checks.join_next(), if !checks.is_empty() => {
                    if let Err(err) = joined {
                        warn!(error = %err, "health check task failed");
                    }
                }
            }
        }

        let pending = checks.len();
        let drained = timeout(self.inner.config.shutdown_grace, async {
            while checks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(abandoned = checks.len(), "abandoning health checks at shutdown");
            checks.abort_all();
        } else if pending > 0 {
            debug!(pending, "in-flight health checks finished");
        }
    }

    fn targets(&self) -> SupervisorResult<Vec<HealthTarget>> {
        let nodes = self.inner.store.list_nodes(&NodeFilter::all())?;
        let workers = self.inner.store.list_workers(&WorkerFilter::all())?;
        Ok(collect_targets(&nodes, &workers))
    }

    fn spawn_cycle(&self, checks: &mut JoinSet<Option<StatusSample>>) {
        let targets = match self.targets() {
            Ok(targets) => targets,
            Err(err) => {
                warn!(error = %err, "cannot load health targets");
                return;
            }
        };

        let mut skipped = 0usize;
        for target in targets {
            match self.inner.inflight.try_claim(target.id()) {
                Some(guard) => {
                    checks.spawn(self.clone().check(target, guard));
                }
                None => skipped += 1,
            }
        }
        if skipped > 0 {
            debug!(skipped, "targets still busy, skipped this cycle");
        }
    }

    /// Run one cycle and wait for its checks. Targets with a check already
    /// underway are skipped.
    pub async fn poll_once(&self) -> SupervisorResult<Vec<StatusSample>> {
        let mut checks = JoinSet::new();
        for target in self.targets()? {
            if let Some(guard) = self.inner.inflight.try_claim(target.id()) {
                checks.spawn(self.clone().check(target, guard));
            }
        }

        let mut samples = Vec::with_capacity(checks.len());
        while let Some(joined) = checks.join_next().await {
            if let Ok(Some(sample)) = joined {
                samples.push(sample);
            }
        }
        Ok(samples)
    }

    async fn check(self, target: HealthTarget, _claim: InFlightGuard) -> Option<StatusSample> {
        let Ok(_permit) = self.inner.permits.clone().acquire_owned().await else {
            return None;
        };

        let id = target.id();
        let outcome = match timeout(self.inner.config.check_timeout, self.query(&target)).await {
            Ok(result) => result,
            Err(_) => Err(format!(
                "health check timed out after {}ms",
                self.inner.config.check_timeout.as_millis()
            )),
        };

        let sample = match outcome {
            Ok(detail) => {
                self.record(id, true);
                StatusSample::healthy(id, detail)
            }
            Err(message) => {
                let failures = self.record(id, false);
                debug!(target = %id, failures, %message, "health check failed");
                StatusSample::unhealthy(id, message, failures)
            }
        };

        self.inner
            .bus
            .publish(SupervisorEvent::StatusUpdated(sample.clone()));
        Some(sample)
    }

    async fn query(&self, target: &HealthTarget) -> Result<StatusDetail, String> {
        match target {
            HealthTarget::Node { endpoint, .. } => self
                .inner
                .rpc
                .node_health(endpoint)
                .await
                .map(|h| StatusDetail::Node {
                    sync_height: h.sync_height,
                    peer_count: h.peer_count,
                    syncing: h.syncing,
                })
                .map_err(|e| e.to_string()),
            HealthTarget::Worker {
                endpoint,
                public_key,
                ..
            } => self
                .inner
                .rpc
                .validator_info(endpoint, public_key)
                .await
                .map(|info| StatusDetail::Worker {
                    validator_status: info.status,
                    validator_index: info.index,
                })
                .map_err(|e| e.to_string()),
        }
    }

    fn record(&self, target: TargetId, healthy: bool) -> u32 {
        match self.inner.store.record_health(target, healthy) {
            Ok(failures) => failures,
            // The target may have been deleted mid-check.
            Err(err) => {
                debug!(target = %target, error = %err, "cannot record health result");
                0
            }
        }
    }
}
