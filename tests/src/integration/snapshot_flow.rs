//! # Snapshot Flows
//!
//! Snapshot jobs against the node lifecycle: a job only runs on a stopped
//! node, holds its data directory while it runs, and a half-applied
//! directory is reported on the next startup.

#[cfg(all(test, unix))]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use node_supervisor::StoreBackend;
    use shared_bus::{topics, EventFilter, SupervisorEvent};
    use shared_types::{DataLayout, ErrorKind, Network, ProcessState, SnapshotState};
    use tokio::time::timeout;
    use wf_05_snapshot_manager::{CancelOutcome, FileSource, SnapshotRequest};

    use crate::support::{eventually, test_config, write_archive, GatedSource, Harness, ScriptCommands};

    #[tokio::test]
    async fn test_snapshot_applies_to_stopped_node() {
        let harness = Harness::start().await;
        let nodes = harness.orchestrator.nodes().unwrap();
        let snapshots = harness.orchestrator.snapshots().unwrap();
        let mut completed = harness
            .orchestrator
            .bus()
            .subscribe(EventFilter::topics([topics::SNAPSHOT_COMPLETED]));

        let node = harness.create_node("n1", Network::Testnet8).await;
        let layout = DataLayout::new(&node.data_path);
        let key = layout.validator_keystore().join("k1");
        std::fs::create_dir_all(layout.validator_keystore()).unwrap();
        std::fs::write(&key, "key-1").unwrap();

        let archive = harness.dir.path().join("snapshot.tar");
        write_archive(
            &archive,
            &[
                ("coordinator/beacondb/head.db", "beacon"),
                ("gwat/gwat/chaindata/000001.ldb", "chain"),
            ],
        );
        let request = SnapshotRequest::new(format!("file://{}", archive.display()));

        nodes.start(node.id).await.unwrap();
        let err = snapshots
            .start_snapshot_job(node.id, request.clone())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Precondition);
        nodes.stop(node.id).await.unwrap();

        let job_id = snapshots.start_snapshot_job(node.id, request).unwrap();
        let job = snapshots.wait(job_id).await.unwrap();
        assert_eq!(job.state, SnapshotState::Done, "job failed: {:?}", job.error);
        assert_eq!(job.progress_bytes, std::fs::metadata(&archive).unwrap().len());

        let event = timeout(Duration::from_secs(5), completed.recv())
            .await
            .expect("snapshot.completed not published")
            .unwrap();
        assert!(matches!(
            event,
            SupervisorEvent::SnapshotCompleted { job_id: id, state: SnapshotState::Done, .. } if id == job_id
        ));

        assert_eq!(
            std::fs::read_to_string(node.data_path.join("gwat/gwat/chaindata/000001.ldb")).unwrap(),
            "chain"
        );
        assert_eq!(std::fs::read_to_string(&key).unwrap(), "key-1");

        // The data directory is free again.
        assert_eq!(nodes.start(node.id).await.unwrap(), ProcessState::Running);

        harness.shutdown().await;
    }

    #[tokio::test]
    async fn test_running_job_blocks_node_start() {
        let (source, chunks) = GatedSource::new();
        let harness =
            Harness::start_with(ScriptCommands::long_running(), source, |_| {}).await;
        let nodes = harness.orchestrator.nodes().unwrap();
        let snapshots = harness.orchestrator.snapshots().unwrap();
        let node = harness.create_node("n1", Network::Testnet9).await;
        let request = SnapshotRequest::new("https://snapshots.invalid/testnet9.tar");

        let job_id = snapshots.start_snapshot_job(node.id, request.clone()).unwrap();
        eventually("download to begin", || {
            snapshots
                .get_job(job_id)
                .is_ok_and(|job| job.state == SnapshotState::Downloading)
        })
        .await;

        assert_eq!(nodes.start(node.id).await.unwrap_err().kind(), ErrorKind::Conflict);
        assert_eq!(
            snapshots.start_snapshot_job(node.id, request).unwrap_err().kind(),
            ErrorKind::Conflict
        );
        assert_eq!(harness.commands.builds(), 0);

        assert_eq!(snapshots.cancel(job_id).unwrap(), CancelOutcome::Requested);
        chunks.send(vec![0u8; 512]).unwrap();
        let job = snapshots.wait(job_id).await.unwrap();
        assert_eq!(job.state, SnapshotState::Cancelled);
        assert!(!DataLayout::new(&node.data_path).snapshot_partial().exists());

        assert_eq!(nodes.start(node.id).await.unwrap(), ProcessState::Running);
        assert_eq!(snapshots.list_jobs(Some(node.id)).len(), 1);

        harness.shutdown().await;
    }

    #[tokio::test]
    async fn test_half_applied_directory_reported_at_startup() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.store.backend = StoreBackend::File;

        let first = Harness::build(
            tempfile::tempdir().unwrap(),
            config.clone(),
            ScriptCommands::long_running(),
            Arc::new(FileSource),
        );
        first.orchestrator.initialize().await.unwrap();
        let node = first
            .orchestrator
            .nodes()
            .unwrap()
            .create_node(shared_types::NewNode {
                name: "n1".into(),
                network: Network::Testnet8,
                data_path: dir.path().join("n1"),
                ports: None,
                rpc_endpoint: None,
            })
            .await
            .unwrap();
        assert!(first.orchestrator.corrupt_nodes().is_empty());
        first.shutdown().await;

        // Crash between the two renames of an apply.
        let layout = DataLayout::new(&node.data_path);
        std::fs::write(layout.snapshot_journal(), b"applying\n").unwrap();

        let second = Harness::build(
            tempfile::tempdir().unwrap(),
            config,
            ScriptCommands::long_running(),
            Arc::new(FileSource),
        );
        let mut corrupt = second
            .orchestrator
            .bus()
            .subscribe(EventFilter::topics([topics::SNAPSHOT_CORRUPT]));
        second.orchestrator.initialize().await.unwrap();

        assert_eq!(second.orchestrator.corrupt_nodes(), vec![node.id]);
        assert!(matches!(
            corrupt.try_recv().unwrap(),
            Some(SupervisorEvent::SnapshotCorrupt { node_id, .. }) if node_id == node.id
        ));
        // The record itself survived the restart.
        assert_eq!(
            second.orchestrator.nodes().unwrap().get_node(node.id).unwrap().name,
            "n1"
        );

        second.shutdown().await;
    }
}
