//! # Worker Manager Service
//!
//! `submit_action` returns once the node's endpoint accepted the
//! transaction. Status changes arrive later through `status.updated`
//! samples, which a background observer turns into persisted forward
//! transitions. The same task reports actions the chain never picked up.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use shared_bus::{
    topics, EventBus, EventFilter, EventPublisher, EventSubscriber, Subscription, SupervisorEvent,
};
use shared_rpc::{NodeRpc, TransactionRequest};
use shared_types::{
    ActionKind, DataLayout, DepositData, KeyMaterial, Network, NodeId, ProcessState, StatusDetail,
    SupervisorError, SupervisorResult, TargetId, Worker, WorkerId, WorkerStatus,
};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use wf_01_local_store::{LocalStore, WorkerFilter};

use crate::domain::{build_transaction, ActionError, ActionParams, ConfirmationTracker};

/// Worker manager settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerManagerConfig {
    /// How long a submitted action may take to show up on chain.
    pub confirm_timeout: Duration,
    /// How often overdue confirmations are looked for.
    pub sweep_interval: Duration,
    /// Validator deposit contract per network.
    pub deposit_addresses: HashMap<Network, String>,
}

impl Default for WorkerManagerConfig {
    fn default() -> Self {
        Self {
            confirm_timeout: Duration::from_secs(1800),
            sweep_interval: Duration::from_secs(5),
            deposit_addresses: HashMap::new(),
        }
    }
}

/// Outcome of an accepted submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResult {
    pub worker_id: WorkerId,
    pub action: ActionKind,
    pub tx_hash: String,
    pub request: TransactionRequest,
}

struct Observer {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct Inner {
    store: Arc<LocalStore>,
    bus: Arc<dyn EventBus>,
    rpc: Arc<dyn NodeRpc>,
    config: WorkerManagerConfig,
    /// Serializes actions per worker.
    locks: Mutex<HashMap<WorkerId, Arc<AsyncMutex<()>>>>,
    confirmations: Mutex<ConfirmationTracker>,
    observer: AsyncMutex<Option<Observer>>,
}

/// Validator identities and their on-chain actions.
#[derive(Clone)]
pub struct WorkerManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for WorkerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerManager").finish_non_exhaustive()
    }
}

impl WorkerManager {
    pub fn new(
        store: Arc<LocalStore>,
        bus: Arc<dyn EventBus>,
        rpc: Arc<dyn NodeRpc>,
        config: WorkerManagerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                bus,
                rpc,
                config,
                locks: Mutex::new(HashMap::new()),
                confirmations: Mutex::new(ConfirmationTracker::default()),
                observer: AsyncMutex::new(None),
            }),
        }
    }

    fn lock_for(&self, id: WorkerId) -> Arc<AsyncMutex<()>> {
        self.inner.locks.lock().entry(id).or_default().clone()
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Start observing status samples. Calling it again is a no-op.
    pub async fn initialize(&self) -> SupervisorResult<()> {
        let mut observer = self.inner.observer.lock().await;
        if observer.is_some() {
            return Ok(());
        }

        let subscription = self
            .inner
            .bus
            .subscribe(EventFilter::topics([topics::STATUS_UPDATED]));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.clone().observe(subscription, shutdown_rx));
        *observer = Some(Observer { shutdown, task });

        let workers = self.inner.store.list_workers(&WorkerFilter::all())?.len();
        info!(workers, "worker manager initialized");
        Ok(())
    }

    /// Stop the observer. Safe to call more than once, or before
    /// `initialize`.
    pub async fn destroy(&self) {
        let Some(observer) = self.inner.observer.lock().await.take() else {
            return;
        };
        let _ = observer.shutdown.send(true);
        if let Err(err) = observer.task.await {
            if !err.is_cancelled() {
                warn!(error = %err, "worker observer ended abnormally");
            }
        }
        info!("worker manager destroyed");
    }

    async fn observe(self, mut subscription: Subscription, mut shutdown: watch::Receiver<bool>) {
        let mut sweep = tokio::time::interval(self.inner.config.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                event = subscription.recv() => match event {
                    Some(SupervisorEvent::StatusUpdated(sample)) => {
                        if let (TargetId::Worker(id), StatusDetail::Worker { validator_status, validator_index }) =
                            (sample.target_id, sample.detail)
                        {
                            self.apply_observation(id, validator_status, validator_index);
                        }
                    }
                    Some(_) => {}
                    None => break,
                },
                _ = sweep.tick() => self.report_overdue(Instant::now()),
            }
        }
        debug!("worker observer stopped");
    }

    /// Persist a chain-reported status if it moves the worker forward, and
    /// a newly assigned validator index.
    pub fn apply_observation(&self, id: WorkerId, status: Option<WorkerStatus>, index: Option<u64>) {
        let current = match self.inner.store.get_worker(id) {
            Ok(worker) => worker,
            Err(_) => return,
        };
        let advance = status.filter(|s| current.status.can_advance_to(*s));
        let new_index = index.filter(|i| current.validator_index != Some(*i));
        if let Some(reported) = status {
            if advance.is_none() && reported != current.status {
                debug!(worker_id = %id, current = %current.status, %reported, "ignoring non-forward status");
            }
        }
        if advance.is_none() && new_index.is_none() {
            return;
        }

        let result = self.inner.store.modify_worker(id, |worker| {
            let from = worker.status;
            if let Some(to) = advance.filter(|to| worker.status.can_advance_to(*to)) {
                worker.status = to;
            }
            if let Some(index) = new_index {
                worker.validator_index = Some(index);
            }
            Ok(from)
        });

        match result {
            Ok((worker, from)) if worker.status != from => {
                info!(worker_id = %id, %from, to = %worker.status, "worker status changed");
                self.inner.confirmations.lock().observe(id, worker.status);
                self.inner.bus.publish(SupervisorEvent::WorkerStatusChanged {
                    worker_id: id,
                    from,
                    to: worker.status,
                });
            }
            Ok(_) => {}
            Err(err) => warn!(worker_id = %id, error = %err, "cannot record worker status"),
        }
    }

    /// Publish `worker.actionTimedOut` for every overdue confirmation.
    pub fn report_overdue(&self, now: Instant) {
        let overdue = self.inner.confirmations.lock().expired(now);
        for pending in overdue {
            let waited_secs = pending.waited(now).as_secs();
            warn!(
                worker_id = %pending.worker_id,
                action = %pending.action,
                tx_hash = %pending.tx_hash,
                waited_secs,
                "action not confirmed on chain"
            );
            self.inner.bus.publish(SupervisorEvent::WorkerActionTimedOut {
                worker_id: pending.worker_id,
                action: pending.action,
                tx_hash: pending.tx_hash,
                waited_secs,
            });
        }
    }

    // =========================================================================
    // RECORDS
    // =========================================================================

    /// Register a `pending` worker on a node, writing its keystore into the
    /// node's keystore directory when one is supplied.
    pub async fn create_worker(&self, node_id: NodeId, keys: KeyMaterial) -> SupervisorResult<Worker> {
        let node = self.inner.store.get_node(node_id)?;
        let worker = self.inner.store.insert_worker(node_id, &keys)?;

        if let Some(keystore) = &keys.keystore {
            let path = DataLayout::new(&node.data_path).validator_keystore_file(&worker.public_key);
            let written = async {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&path, serde_json::to_vec_pretty(keystore)?).await
            }
            .await;

            if let Err(err) = written {
                warn!(worker_id = %worker.id, path = %path.display(), error = %err, "cannot write keystore");
                self.inner.store.delete_worker(worker.id, |_| Ok(()))?;
                return Err(SupervisorError::Storage(format!(
                    "cannot write keystore {}: {err}",
                    path.display()
                )));
            }
        }

        info!(worker_id = %worker.id, node_id = %node_id, "worker created");
        Ok(worker)
    }

    /// Delete a worker. Without `force` only `pending` and `exited` workers
    /// may go.
    pub async fn remove_worker(&self, id: WorkerId, force: bool) -> SupervisorResult<Worker> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let worker = self.inner.store.delete_worker(id, |worker| {
            if force || worker.status.is_removable() {
                Ok(())
            } else {
                Err(SupervisorError::Precondition(format!(
                    "worker {id} is {}; only pending or exited workers can be removed",
                    worker.status
                )))
            }
        })?;

        self.inner.confirmations.lock().forget(id);
        self.inner.locks.lock().remove(&id);
        self.inner
            .bus
            .publish(SupervisorEvent::WorkerRemoved { worker_id: id, forced: force });
        info!(worker_id = %id, forced = force, "worker removed");
        Ok(worker)
    }

    pub fn get_worker(&self, id: WorkerId) -> SupervisorResult<Worker> {
        self.inner.store.get_worker(id)
    }

    pub fn list_workers(&self, filter: &WorkerFilter) -> SupervisorResult<Vec<Worker>> {
        self.inner.store.list_workers(filter)
    }

    // =========================================================================
    // ACTIONS
    // =========================================================================

    /// Build and submit the transaction for `action`.
    ///
    /// Fails with `Unavailable` when the owning node is not running, with
    /// `Precondition` when the worker's status does not allow the action and
    /// with `Conflict` when the worker already has a deposit or the same
    /// action awaits confirmation. None of these touch the worker.
    pub async fn submit_action(
        &self,
        id: WorkerId,
        action: ActionKind,
        params: ActionParams,
    ) -> SupervisorResult<ActionResult> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let worker = self.inner.store.get_worker(id)?;
        let node = self.inner.store.get_node(worker.node_id)?;
        if node.process_state != ProcessState::Running {
            return Err(SupervisorError::Unavailable(format!(
                "node {} is {}",
                node.id, node.process_state
            )));
        }

        self.check_not_in_flight(&worker, action)?;

        let deposit_address = self
            .inner
            .config
            .deposit_addresses
            .get(&node.network)
            .ok_or(ActionError::NoDepositAddress(node.network))?;
        let request = build_transaction(action, &worker, node.network, deposit_address, &params)?;

        let tx_hash = self
            .inner
            .rpc
            .send_transaction(&node.rpc_endpoint, &request)
            .await
            .map_err(SupervisorError::from)?;
        info!(worker_id = %id, %action, %tx_hash, "action submitted");

        if action == ActionKind::Activate {
            let deposit = DepositData {
                tx_hash: tx_hash.clone(),
                amount_wei: request.value.to_string(),
                submitted_at: Utc::now(),
            };
            self.inner.store.modify_worker(id, |worker| {
                worker.deposit_data = Some(deposit);
                Ok(())
            })?;
        }

        self.inner.confirmations.lock().register(
            id,
            action,
            tx_hash.clone(),
            Instant::now(),
            self.inner.config.confirm_timeout,
        );
        self.inner.bus.publish(SupervisorEvent::WorkerActionSubmitted {
            worker_id: id,
            action,
            tx_hash: tx_hash.clone(),
        });

        Ok(ActionResult {
            worker_id: id,
            action,
            tx_hash,
            request,
        })
    }

    /// A stake is sent once per worker, and an action is not repeated while
    /// the chain has yet to reflect it.
    fn check_not_in_flight(&self, worker: &Worker, action: ActionKind) -> SupervisorResult<()> {
        if action == ActionKind::Activate {
            if let Some(deposit) = &worker.deposit_data {
                return Err(SupervisorError::Conflict(format!(
                    "worker {} already has a deposit in transaction {}",
                    worker.id, deposit.tx_hash
                )));
            }
        }
        if let Some(pending) = self
            .inner
            .confirmations
            .lock()
            .pending(worker.id)
            .filter(|p| p.action == action)
        {
            return Err(SupervisorError::Conflict(format!(
                "{action} for worker {} is awaiting confirmation of {}",
                worker.id, pending.tx_hash
            )));
        }
        Ok(())
    }

    /// Actions still waiting for the chain.
    #[must_use]
    pub fn pending_confirmations(&self) -> usize {
        self.inner.confirmations.lock().len()
    }
}
