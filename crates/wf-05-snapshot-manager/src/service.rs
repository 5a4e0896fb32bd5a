//! # Snapshot Manager Service
//!
//! Runs one task per job. A job leases its node's data directory for its
//! whole life, which keeps the node manager from starting the node and a
//! second job from starting on it.
//!
//! ```text
//! queued → downloading → applying → done
//!     └────────┴──→ cancelled   └──→ failed
//! ```
//!
//! Downloads go to `snapshot.tar.part` and check the cancel flag at every
//! chunk. Once a job is `applying` a cancel request is recorded and
//! resolves as a no-op.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use shared_bus::{EventPublisher, SupervisorEvent};
use shared_types::{
    DataLayout, JobId, NodeId, SnapshotJob, SnapshotState, SupervisorError, SupervisorResult,
};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use wf_01_local_store::{LocalStore, NodeFilter};

use crate::adapters::{recover_data_path, TarApplier};
use crate::domain::{cancel_outcome, CancelOutcome, Digester, SnapshotError, SnapshotRequest};
use crate::ports::{SnapshotApplier, SnapshotSource};

/// Snapshot manager settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotConfig {
    /// Minimum time between two `snapshot.progress` events of a job.
    pub progress_interval: Duration,
    /// How long `destroy` waits for running jobs.
    pub shutdown_grace: Duration,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            progress_interval: Duration::from_millis(500),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

struct JobEntry {
    job: SnapshotJob,
    request: SnapshotRequest,
    cancel: Arc<AtomicBool>,
    /// A cancel arrived while applying.
    cancel_deferred: bool,
    state_tx: watch::Sender<SnapshotState>,
    task: Option<JoinHandle<()>>,
}

struct Inner {
    store: Arc<LocalStore>,
    bus: Arc<dyn EventPublisher>,
    source: Arc<dyn SnapshotSource>,
    applier: Arc<dyn SnapshotApplier>,
    config: SnapshotConfig,
    jobs: Mutex<HashMap<JobId, JobEntry>>,
    shut_down: AtomicBool,
}

/// Download-and-apply jobs, at most one active per node.
#[derive(Clone)]
pub struct SnapshotManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SnapshotManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotManager").finish_non_exhaustive()
    }
}

impl SnapshotManager {
    pub fn new(
        store: Arc<LocalStore>,
        bus: Arc<dyn EventPublisher>,
        source: Arc<dyn SnapshotSource>,
        config: SnapshotConfig,
    ) -> Self {
        Self::with_applier(store, bus, source, Arc::new(TarApplier), config)
    }

    pub fn with_applier(
        store: Arc<LocalStore>,
        bus: Arc<dyn EventPublisher>,
        source: Arc<dyn SnapshotSource>,
        applier: Arc<dyn SnapshotApplier>,
        config: SnapshotConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                bus,
                source,
                applier,
                config,
                jobs: Mutex::new(HashMap::new()),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Inspect every node's data directory. Half-applied directories are
    /// reported as `snapshot.corrupt` and returned; leftovers of interrupted
    /// downloads are deleted.
    pub async fn initialize(&self) -> SupervisorResult<Vec<NodeId>> {
        let nodes = self.inner.store.list_nodes(&NodeFilter::all())?;
        let mut corrupt = Vec::new();

        for node in nodes {
            let root = node.data_path.clone();
            let recovery = tokio::task::spawn_blocking(move || recover_data_path(&root))
                .await
                .map_err(|e| SupervisorError::Storage(format!("recovery task failed: {e}")))?;

            match recovery {
                Ok(recovery) if recovery.corrupt => {
                    warn!(node_id = %node.id, path = %node.data_path.display(), "data directory was left mid-swap");
                    self.inner.bus.publish(SupervisorEvent::SnapshotCorrupt {
                        node_id: node.id,
                        data_path: node.data_path.display().to_string(),
                    });
                    corrupt.push(node.id);
                }
                Ok(recovery) => {
                    for path in recovery.cleaned {
                        info!(node_id = %node.id, path = %path.display(), "removed stale snapshot leftovers");
                    }
                }
                Err(err) => warn!(node_id = %node.id, error = %err, "cannot inspect data directory"),
            }
        }
        info!(corrupt = corrupt.len(), "snapshot manager initialized");
        Ok(corrupt)
    }

    /// Cancel downloads and wait, within the shutdown grace, for running
    /// jobs. Safe to call more than once.
    pub async fn destroy(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let tasks: Vec<JoinHandle<()>> = {
            let mut jobs = self.inner.jobs.lock();
            jobs.values_mut()
                .filter_map(|entry| {
                    if !entry.job.state.is_terminal() && entry.job.state != SnapshotState::Applying {
                        entry.cancel.store(true, Ordering::Release);
                    }
                    entry.task.take()
                })
                .collect()
        };

        let waited = tokio::time::timeout(self.inner.config.shutdown_grace, async {
            for task in tasks {
                let _ = task.await;
            }
        })
        .await;
        if waited.is_err() {
            warn!("snapshot jobs still running at shutdown");
        }
        info!("snapshot manager destroyed");
    }

    // =========================================================================
    // JOBS
    // =========================================================================

    /// Start downloading `request` for a node with no processes, either
    /// stopped or failed.
    pub fn start_snapshot_job(&self, node_id: NodeId, request: SnapshotRequest) -> SupervisorResult<JobId> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(SupervisorError::Unavailable("snapshot manager is shut down".into()));
        }

        let node = self.inner.store.get_node(node_id)?;
        if !node.process_state.is_idle() {
            return Err(SupervisorError::Precondition(format!(
                "node {node_id} is {}; stop it before applying a snapshot",
                node.process_state
            )));
        }

        let mut jobs = self.inner.jobs.lock();
        if let Some(active) = jobs
            .values()
            .find(|e| e.job.node_id == node_id && !e.job.state.is_terminal())
        {
            return Err(SupervisorError::Conflict(format!(
                "snapshot job {} is already {} for node {node_id}",
                active.job.id, active.job.state
            )));
        }

        let job = SnapshotJob::queued(node_id, request.source_url.clone());
        let job_id = job.id;
        let node = self.inner.store.lease_data_path(node_id, job_id)?;

        let cancel = Arc::new(AtomicBool::new(false));
        let (state_tx, _) = watch::channel(SnapshotState::Queued);
        let task = tokio::spawn(self.clone().run_job(job_id, node.data_path.clone()));
        jobs.insert(
            job_id,
            JobEntry {
                job,
                request,
                cancel,
                cancel_deferred: false,
                state_tx,
                task: Some(task),
            },
        );

        info!(job_id = %job_id, node_id = %node_id, "snapshot job queued");
        Ok(job_id)
    }

    /// Request cancellation of a job.
    pub fn cancel(&self, job_id: JobId) -> SupervisorResult<CancelOutcome> {
        let mut jobs = self.inner.jobs.lock();
        let entry = jobs
            .get_mut(&job_id)
            .ok_or_else(|| SupervisorError::not_found("snapshot job", job_id))?;

        let outcome = cancel_outcome(entry.job.state);
        match outcome {
            CancelOutcome::Requested => entry.cancel.store(true, Ordering::Release),
            CancelOutcome::Deferred => entry.cancel_deferred = true,
            CancelOutcome::AlreadyFinished => {}
        }
        debug!(job_id = %job_id, state = %entry.job.state, ?outcome, "cancel requested");
        Ok(outcome)
    }

    pub fn get_job(&self, job_id: JobId) -> SupervisorResult<SnapshotJob> {
        self.inner
            .jobs
            .lock()
            .get(&job_id)
            .map(|e| e.job.clone())
            .ok_or_else(|| SupervisorError::not_found("snapshot job", job_id))
    }

    /// Jobs of one node, or all jobs, oldest first.
    pub fn list_jobs(&self, node_id: Option<NodeId>) -> Vec<SnapshotJob> {
        let mut jobs: Vec<SnapshotJob> = self
            .inner
            .jobs
            .lock()
            .values()
            .filter(|e| node_id.map_or(true, |id| e.job.node_id == id))
            .map(|e| e.job.clone())
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    /// Wait until a job reaches a terminal state.
    pub async fn wait(&self, job_id: JobId) -> SupervisorResult<SnapshotJob> {
        let mut state_rx = self
            .inner
            .jobs
            .lock()
            .get(&job_id)
            .map(|e| e.state_tx.subscribe())
            .ok_or_else(|| SupervisorError::not_found("snapshot job", job_id))?;
        // The sender lives as long as the entry, which is never removed.
        let _ = state_rx.wait_for(SnapshotState::is_terminal).await;
        self.get_job(job_id)
    }

    // =========================================================================
    // JOB TASK
    // =========================================================================

    fn update(&self, job_id: JobId, f: impl FnOnce(&mut SnapshotJob)) -> Option<SnapshotJob> {
        let mut jobs = self.inner.jobs.lock();
        let entry = jobs.get_mut(&job_id)?;
        f(&mut entry.job);
        entry.state_tx.send_replace(entry.job.state);
        Some(entry.job.clone())
    }

    fn publish_progress(&self, job: &SnapshotJob) {
        self.inner.bus.publish(SupervisorEvent::SnapshotProgress {
            job_id: job.id,
            node_id: job.node_id,
            state: job.state,
            progress_bytes: job.progress_bytes,
            total_bytes: job.total_bytes,
        });
    }

    async fn run_job(self, job_id: JobId, data_path: PathBuf) {
        let Some((request, cancel)) = self
            .inner
            .jobs
            .lock()
            .get(&job_id)
            .map(|e| (e.request.clone(), e.cancel.clone()))
        else {
            return;
        };
        let layout = DataLayout::new(&data_path);

        let outcome = self.download_and_apply(job_id, &request, &cancel, &layout).await;

        let (state, error) = match &outcome {
            Ok(()) => (SnapshotState::Done, None),
            Err(SnapshotError::Cancelled) => (SnapshotState::Cancelled, None),
            Err(err) => (SnapshotState::Failed, Some(err.to_string())),
        };
        if outcome.is_err() {
            cleanup_download(&layout).await;
        }
        if let Err(SnapshotError::Archive(_) | SnapshotError::Io { .. }) = &outcome {
            if layout.snapshot_journal().exists() {
                warn!(job_id = %job_id, path = %data_path.display(), "swap interrupted, data directory is half-applied");
                if let Ok(job) = self.get_job(job_id) {
                    self.inner.bus.publish(SupervisorEvent::SnapshotCorrupt {
                        node_id: job.node_id,
                        data_path: data_path.display().to_string(),
                    });
                }
            }
        }

        let Some(job) = self.update(job_id, |job| {
            job.state = state;
            job.error = error.clone();
            job.finished_at = Some(Utc::now());
        }) else {
            return;
        };
        self.inner.store.release_data_lease(job.node_id, job_id);

        let deferred = self
            .inner
            .jobs
            .lock()
            .get(&job_id)
            .is_some_and(|e| e.cancel_deferred);
        if deferred {
            debug!(job_id = %job_id, "cancel requested during apply resolved as no-op");
        }

        match &error {
            Some(err) => warn!(job_id = %job_id, node_id = %job.node_id, error = %err, "snapshot job failed"),
            None => info!(job_id = %job_id, node_id = %job.node_id, state = %state, "snapshot job finished"),
        }
        self.inner.bus.publish(SupervisorEvent::SnapshotCompleted {
            job_id,
            node_id: job.node_id,
            state,
            error,
        });
    }

    async fn download_and_apply(
        &self,
        job_id: JobId,
        request: &SnapshotRequest,
        cancel: &AtomicBool,
        layout: &DataLayout,
    ) -> Result<(), SnapshotError> {
        self.download(job_id, request, cancel, layout).await?;

        let archive = layout.snapshot_archive();
        tokio::fs::rename(layout.snapshot_partial(), &archive)
            .await
            .map_err(|e| SnapshotError::io("finalize download", e))?;

        // Last chance to cancel; from here on the job runs to completion.
        let applying = {
            let mut jobs = self.inner.jobs.lock();
            match jobs.get_mut(&job_id) {
                Some(entry) if !entry.cancel.load(Ordering::Acquire) => {
                    entry.job.state = SnapshotState::Applying;
                    entry.state_tx.send_replace(SnapshotState::Applying);
                    Some(entry.job.clone())
                }
                _ => None,
            }
        };
        let Some(job) = applying else {
            return Err(SnapshotError::Cancelled);
        };
        self.publish_progress(&job);

        let root = layout.root().to_path_buf();
        let applier = self.inner.applier.clone();
        let applied = tokio::task::spawn_blocking(move || applier.apply(&root, &archive))
            .await
            .map_err(|e| SnapshotError::Archive(format!("apply task failed: {e}")))?;
        applied?;

        if let Err(err) = tokio::fs::remove_file(layout.snapshot_archive()).await {
            debug!(job_id = %job_id, error = %err, "cannot remove applied archive");
        }
        Ok(())
    }

    async fn download(
        &self,
        job_id: JobId,
        request: &SnapshotRequest,
        cancel: &AtomicBool,
        layout: &DataLayout,
    ) -> Result<(), SnapshotError> {
        if cancel.load(Ordering::Acquire) {
            return Err(SnapshotError::Cancelled);
        }
        let mut reader = self.inner.source.open(&request.source_url).await?;
        let expected_size = request.expected_size.or(reader.total_bytes());

        if let Some(job) = self.update(job_id, |job| {
            job.state = SnapshotState::Downloading;
            job.total_bytes = expected_size;
        }) {
            self.publish_progress(&job);
        }

        let partial = layout.snapshot_partial();
        let mut file = tokio::fs::File::create(&partial)
            .await
            .map_err(|e| SnapshotError::io("create partial download", e))?;
        let mut digest = Digester::default();
        let mut last_report = Instant::now();

        loop {
            if cancel.load(Ordering::Acquire) {
                return Err(SnapshotError::Cancelled);
            }
            let Some(chunk) = reader.next_chunk().await? else {
                break;
            };
            file.write_all(&chunk)
                .await
                .map_err(|e| SnapshotError::io("write partial download", e))?;
            digest.update(&chunk);

            if last_report.elapsed() >= self.inner.config.progress_interval {
                last_report = Instant::now();
                let bytes = digest.bytes();
                if let Some(job) = self.update(job_id, |job| job.progress_bytes = bytes) {
                    self.publish_progress(&job);
                }
            }
        }

        file.sync_all()
            .await
            .map_err(|e| SnapshotError::io("sync partial download", e))?;
        let bytes = digest.bytes();
        if let Some(job) = self.update(job_id, |job| job.progress_bytes = bytes) {
            self.publish_progress(&job);
        }
        digest.verify(expected_size, request.sha256.as_deref())
    }
}

async fn cleanup_download(layout: &DataLayout) {
    for path in [layout.snapshot_partial(), layout.snapshot_archive()] {
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(path = %path.display(), "removed download"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %path.display(), error = %err, "cannot remove download"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::apply::tests::{build_archive, live_tree};
    use crate::adapters::FileSource;
    use crate::ports::SnapshotReader;
    use async_trait::async_trait;
    use shared_bus::{topics, EventFilter, InMemoryEventBus};
    use shared_types::{ErrorKind, NewNode, Network, ProcessState};
    use std::collections::BTreeMap;
    use std::path::Path;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    /// A source whose chunks the test feeds by hand.
    struct GatedSource {
        chunks: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
        total: Option<u64>,
    }

    struct GatedReader {
        chunks: mpsc::UnboundedReceiver<Vec<u8>>,
        total: Option<u64>,
    }

    #[async_trait]
    impl SnapshotReader for GatedReader {
        fn total_bytes(&self) -> Option<u64> {
            self.total
        }

        async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, SnapshotError> {
            Ok(self.chunks.recv().await)
        }
    }

    #[async_trait]
    impl SnapshotSource for GatedSource {
        async fn open(&self, _url: &str) -> Result<Box<dyn SnapshotReader>, SnapshotError> {
            let chunks = self
                .chunks
                .lock()
                .take()
                .ok_or_else(|| SnapshotError::Download("already opened".into()))?;
            Ok(Box::new(GatedReader {
                chunks,
                total: self.total,
            }))
        }
    }

    fn gated(total: Option<u64>) -> (Arc<GatedSource>, mpsc::UnboundedSender<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(GatedSource {
                chunks: parking_lot::Mutex::new(Some(rx)),
                total,
            }),
            tx,
        )
    }

    struct Fixture {
        manager: SnapshotManager,
        store: Arc<LocalStore>,
        bus: Arc<InMemoryEventBus>,
        node_id: NodeId,
        root: PathBuf,
        dir: tempfile::TempDir,
    }

    /// Holds the swap until the test releases it.
    struct GatedApplier {
        entered: parking_lot::Mutex<Option<tokio::sync::oneshot::Sender<()>>>,
        release: parking_lot::Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl SnapshotApplier for GatedApplier {
        fn apply(&self, root: &Path, archive: &Path) -> Result<(), SnapshotError> {
            if let Some(entered) = self.entered.lock().take() {
                let _ = entered.send(());
            }
            let _ = self.release.lock().recv();
            TarApplier.apply(root, archive)
        }
    }

    fn fixture(source: Arc<dyn SnapshotSource>) -> Fixture {
        fixture_with(source, Arc::new(TarApplier))
    }

    fn fixture_with(source: Arc<dyn SnapshotSource>, applier: Arc<dyn SnapshotApplier>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("node");
        live_tree(&root);
        let store = Arc::new(LocalStore::in_memory().unwrap());
        let node = store
            .insert_node(NewNode {
                name: "n1".into(),
                network: Network::Testnet8,
                data_path: root.clone(),
                ports: None,
                rpc_endpoint: None,
            })
            .unwrap();
        let bus = Arc::new(InMemoryEventBus::new());
        let config = SnapshotConfig {
            progress_interval: Duration::ZERO,
            shutdown_grace: Duration::from_secs(2),
        };
        let manager = SnapshotManager::with_applier(store.clone(), bus.clone(), source, applier, config);
        Fixture {
            manager,
            store,
            bus,
            node_id: node.id,
            root,
            dir,
        }
    }

    /// Every file under `root` with its contents.
    fn tree(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
        fn walk(base: &Path, dir: &Path, out: &mut BTreeMap<PathBuf, Vec<u8>>) {
            for entry in std::fs::read_dir(dir).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    walk(base, &path, out);
                } else {
                    out.insert(
                        path.strip_prefix(base).unwrap().to_path_buf(),
                        std::fs::read(&path).unwrap(),
                    );
                }
            }
        }
        let mut out = BTreeMap::new();
        walk(root, root, &mut out);
        out
    }

    async fn wait_state(manager: &SnapshotManager, job_id: JobId, state: SnapshotState) {
        timeout(Duration::from_secs(5), async {
            while manager.get_job(job_id).unwrap().state != state {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("job did not reach state");
    }

    #[tokio::test]
    async fn test_file_snapshot_is_applied() {
        let f = fixture(Arc::new(FileSource));
        let archive = f.dir.path().join("snap.tar.gz");
        build_archive(&archive, &[("gwat/gwat/chaindata/new.ldb", "new-chain")], true);
        let mut sub = f.bus.subscribe(EventFilter::topics(["snapshot.*"]));

        let job_id = f
            .manager
            .start_snapshot_job(f.node_id, SnapshotRequest::new(format!("file://{}", archive.display())))
            .unwrap();
        let job = timeout(Duration::from_secs(5), f.manager.wait(job_id))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(job.state, SnapshotState::Done, "{:?}", job.error);
        assert_eq!(job.progress_bytes, std::fs::metadata(&archive).unwrap().len());
        assert!(f.root.join("gwat/gwat/chaindata/new.ldb").exists());
        assert!(!f.root.join("gwat/gwat/chaindata/old.ldb").exists());
        assert!(f.root.join("gwat/keystore/k1").exists());
        assert!(!DataLayout::new(&f.root).snapshot_archive().exists());
        assert_eq!(f.store.data_lease(f.node_id), None);

        let mut topics_seen = Vec::new();
        while let Ok(Some(event)) = sub.try_recv() {
            topics_seen.push(event.topic());
        }
        assert!(topics_seen.contains(&topics::SNAPSHOT_PROGRESS));
        assert_eq!(topics_seen.last(), Some(&topics::SNAPSHOT_COMPLETED));
    }

    #[tokio::test]
    async fn test_requires_stopped_node() {
        let (source, _tx) = gated(None);
        let f = fixture(source);
        f.store.set_process_state(f.node_id, ProcessState::Running).unwrap();

        let err = f
            .manager
            .start_snapshot_job(f.node_id, SnapshotRequest::new("https://example.invalid/s.tar"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Precondition);
        assert!(f.manager.list_jobs(None).is_empty());
    }

    #[tokio::test]
    async fn test_second_job_conflicts() {
        let (source, tx) = gated(None);
        let f = fixture(source);
        let first = f
            .manager
            .start_snapshot_job(f.node_id, SnapshotRequest::new("https://example.invalid/s.tar"))
            .unwrap();

        let err = f
            .manager
            .start_snapshot_job(f.node_id, SnapshotRequest::new("https://example.invalid/s.tar"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        f.manager.cancel(first).unwrap();
        drop(tx);
        f.manager.wait(first).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_during_download_leaves_data_untouched() {
        let (source, tx) = gated(Some(1 << 20));
        let f = fixture(source);
        let before = tree(&f.root);

        let job_id = f
            .manager
            .start_snapshot_job(f.node_id, SnapshotRequest::new("https://example.invalid/s.tar"))
            .unwrap();
        tx.send(vec![1u8; 4096]).unwrap();
        wait_state(&f.manager, job_id, SnapshotState::Downloading).await;

        assert_eq!(f.manager.cancel(job_id).unwrap(), CancelOutcome::Requested);
        // The loop observes the flag at the next chunk boundary.
        tx.send(vec![2u8; 4096]).unwrap();
        let job = f.manager.wait(job_id).await.unwrap();

        assert_eq!(job.state, SnapshotState::Cancelled);
        assert_eq!(tree(&f.root), before);
        assert_eq!(f.manager.cancel(job_id).unwrap(), CancelOutcome::AlreadyFinished);
        assert_eq!(f.store.data_lease(f.node_id), None);
    }

    #[tokio::test]
    async fn test_cancel_while_applying_still_completes() {
        let (entered_tx, entered) = tokio::sync::oneshot::channel();
        let (release, release_rx) = std::sync::mpsc::channel();
        let applier = Arc::new(GatedApplier {
            entered: parking_lot::Mutex::new(Some(entered_tx)),
            release: parking_lot::Mutex::new(release_rx),
        });
        let f = fixture_with(Arc::new(FileSource), applier);
        let archive = f.dir.path().join("snap.tar");
        build_archive(&archive, &[("gwat/gwat/chaindata/new.ldb", "new-chain")], false);
        let mut completed = f.bus.subscribe(EventFilter::topics([topics::SNAPSHOT_COMPLETED]));

        let job_id = f
            .manager
            .start_snapshot_job(f.node_id, SnapshotRequest::new(format!("file://{}", archive.display())))
            .unwrap();
        timeout(Duration::from_secs(5), entered)
            .await
            .expect("apply never started")
            .unwrap();

        assert_eq!(f.manager.get_job(job_id).unwrap().state, SnapshotState::Applying);
        assert_eq!(f.manager.cancel(job_id).unwrap(), CancelOutcome::Deferred);
        assert_eq!(f.manager.cancel(job_id).unwrap(), CancelOutcome::Deferred);

        release.send(()).unwrap();
        let job = timeout(Duration::from_secs(5), f.manager.wait(job_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.state, SnapshotState::Done, "{:?}", job.error);

        let event = timeout(Duration::from_secs(5), completed.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            event,
            SupervisorEvent::SnapshotCompleted { job_id: id, state: SnapshotState::Done, error: None, .. }
                if id == job_id
        ));
        assert_eq!(
            std::fs::read_to_string(f.root.join("gwat/gwat/chaindata/new.ldb")).unwrap(),
            "new-chain"
        );
        assert!(!f.root.join("gwat/gwat/chaindata/old.ldb").exists());
        assert!(f.root.join("gwat/keystore/k1").exists());
        assert_eq!(f.store.data_lease(f.node_id), None);
        assert_eq!(f.manager.cancel(job_id).unwrap(), CancelOutcome::AlreadyFinished);
    }

    #[tokio::test]
    async fn test_failed_node_accepts_snapshot() {
        let f = fixture(Arc::new(FileSource));
        f.store.set_process_state(f.node_id, ProcessState::Failed).unwrap();
        let archive = f.dir.path().join("snap.tar");
        build_archive(&archive, &[("gwat/gwat/chaindata/new.ldb", "new-chain")], false);

        let job_id = f
            .manager
            .start_snapshot_job(f.node_id, SnapshotRequest::new(format!("file://{}", archive.display())))
            .unwrap();
        let job = f.manager.wait(job_id).await.unwrap();
        assert_eq!(job.state, SnapshotState::Done, "{:?}", job.error);
        assert!(f.root.join("gwat/gwat/chaindata/new.ldb").exists());

        for state in [ProcessState::Starting, ProcessState::Stopping] {
            f.store.set_process_state(f.node_id, state).unwrap();
            let err = f
                .manager
                .start_snapshot_job(f.node_id, SnapshotRequest::new(format!("file://{}", archive.display())))
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Precondition);
        }
    }

    #[tokio::test]
    async fn test_checksum_mismatch_fails_without_touching_data() {
        let f = fixture(Arc::new(FileSource));
        let archive = f.dir.path().join("snap.tar");
        build_archive(&archive, &[("gwat/gwat/chaindata/new.ldb", "new-chain")], false);
        let before = tree(&f.root);

        let job_id = f
            .manager
            .start_snapshot_job(
                f.node_id,
                SnapshotRequest::new(format!("file://{}", archive.display())).with_sha256("00ff"),
            )
            .unwrap();
        let job = f.manager.wait(job_id).await.unwrap();

        assert_eq!(job.state, SnapshotState::Failed);
        assert!(job.error.unwrap().contains("checksum mismatch"));
        assert_eq!(tree(&f.root), before);

        // A finished job frees the node for another one.
        let retry = f
            .manager
            .start_snapshot_job(f.node_id, SnapshotRequest::new(format!("file://{}", archive.display())))
            .unwrap();
        assert_eq!(f.manager.wait(retry).await.unwrap().state, SnapshotState::Done);
    }

    #[tokio::test]
    async fn test_initialize_reports_half_applied_directory() {
        let f = fixture(Arc::new(FileSource));
        let layout = DataLayout::new(&f.root);
        std::fs::write(layout.snapshot_partial(), b"stale").unwrap();
        let mut sub = f.bus.subscribe(EventFilter::topics([topics::SNAPSHOT_CORRUPT]));

        assert!(f.manager.initialize().await.unwrap().is_empty());
        assert!(!layout.snapshot_partial().exists());

        std::fs::write(layout.snapshot_journal(), b"applying\n").unwrap();
        assert_eq!(f.manager.initialize().await.unwrap(), vec![f.node_id]);
        assert!(matches!(
            sub.try_recv().unwrap(),
            Some(SupervisorEvent::SnapshotCorrupt { node_id, .. }) if node_id == f.node_id
        ));
    }

    #[tokio::test]
    async fn test_destroy_cancels_downloads_and_is_idempotent() {
        let (source, tx) = gated(None);
        let f = fixture(source);
        let job_id = f
            .manager
            .start_snapshot_job(f.node_id, SnapshotRequest::new("https://example.invalid/s.tar"))
            .unwrap();
        wait_state(&f.manager, job_id, SnapshotState::Downloading).await;

        let destroy = tokio::spawn({
            let manager = f.manager.clone();
            async move { manager.destroy().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(vec![0u8; 16]).unwrap();
        timeout(Duration::from_secs(5), destroy).await.unwrap().unwrap();
        f.manager.destroy().await;

        assert_eq!(f.manager.get_job(job_id).unwrap().state, SnapshotState::Cancelled);
        let err = f
            .manager
            .start_snapshot_job(f.node_id, SnapshotRequest::new("https://example.invalid/s.tar"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unavailable);
    }
}
