//! # Supervisor End-to-End
//!
//! A node group and its worker driven through the orchestrator: create,
//! start, act on chain, stop, and what the supervisor does when a process
//! dies underneath it.

#[cfg(all(test, unix))]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use shared_bus::{topics, EventFilter, SupervisorEvent};
    use shared_types::{ActionKind, ErrorKind, Network, ProcessState, SnapshotState, WorkerStatus};
    use tokio::time::timeout;
    use wf_03_worker_manager::ActionParams;
    use wf_05_snapshot_manager::{FileSource, SnapshotRequest};

    use crate::support::{key_material, write_archive, Harness, ScriptCommands, DEPOSIT_ADDRESS};

    #[tokio::test]
    async fn test_node_and_worker_lifecycle() {
        let harness = Harness::start().await;
        let nodes = harness.orchestrator.nodes().unwrap();
        let workers = harness.orchestrator.workers().unwrap();

        let node = harness.create_node("n1", Network::Testnet8).await;
        assert_eq!(node.process_state, ProcessState::Stopped);

        assert_eq!(nodes.start(node.id).await.unwrap(), ProcessState::Running);
        assert_eq!(nodes.get_state(node.id).unwrap(), ProcessState::Running);

        let worker = workers.create_worker(node.id, key_material(0x11)).await.unwrap();
        assert_eq!(worker.status, WorkerStatus::Pending);

        let result = workers
            .submit_action(worker.id, ActionKind::Activate, ActionParams::default())
            .await
            .unwrap();
        assert!(result.tx_hash.starts_with("0x"));
        assert_eq!(result.request.to, DEPOSIT_ADDRESS);
        assert_eq!(harness.rpc.sent().len(), 1);

        // Submission records the deposit but leaves the status to the chain.
        let after = workers.get_worker(worker.id).unwrap();
        assert_eq!(after.status, WorkerStatus::Pending);
        assert_eq!(after.deposit_data.unwrap().tx_hash, result.tx_hash);

        // A repeated request does not stake twice.
        let err = workers
            .submit_action(worker.id, ActionKind::Activate, ActionParams::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(harness.rpc.sent().len(), 1);

        assert_eq!(nodes.stop(node.id).await.unwrap(), ProcessState::Stopped);

        let err = workers
            .submit_action(worker.id, ActionKind::Activate, ActionParams::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unavailable);
        assert_eq!(harness.rpc.sent().len(), 1);
        assert_eq!(workers.get_worker(worker.id).unwrap().status, WorkerStatus::Pending);

        harness.shutdown().await;
    }

    #[tokio::test]
    async fn test_second_start_is_a_no_op() {
        let harness = Harness::start().await;
        let nodes = harness.orchestrator.nodes().unwrap();
        let node = harness.create_node("n1", Network::Testnet9).await;

        nodes.start(node.id).await.unwrap();
        assert_eq!(nodes.start(node.id).await.unwrap(), ProcessState::Running);
        // One coordinator and one validator.
        assert_eq!(harness.commands.builds(), 2);

        harness.shutdown().await;
    }

    #[tokio::test]
    async fn test_crashed_process_marks_node_failed() {
        let commands = ScriptCommands::new("exec sleep 30", "sleep 1; exit 3");
        let harness = Harness::start_with(commands, Arc::new(FileSource), |_| {}).await;
        let mut failures = harness
            .orchestrator
            .bus()
            .subscribe(EventFilter::topics([topics::NODE_FAILED]));

        let nodes = harness.orchestrator.nodes().unwrap();
        let node = harness.create_node("n1", Network::Testnet8).await;
        assert_eq!(nodes.start(node.id).await.unwrap(), ProcessState::Running);

        let event = timeout(Duration::from_secs(5), failures.recv())
            .await
            .expect("node.failed not published")
            .unwrap();
        match event {
            SupervisorEvent::NodeFailed {
                node_id,
                role,
                exit_code,
                ..
            } => {
                assert_eq!(node_id, node.id);
                assert_eq!(role, "validator");
                assert_eq!(exit_code, Some(3));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(nodes.get_state(node.id).unwrap(), ProcessState::Failed);

        // Nothing left to stop.
        assert_eq!(nodes.stop(node.id).await.unwrap(), ProcessState::Failed);

        // A fresh snapshot can still be applied before the retry.
        let archive = harness.dir.path().join("snapshot.tar");
        write_archive(&archive, &[("gwat/gwat/chaindata/000001.ldb", "chain")]);
        let snapshots = harness.orchestrator.snapshots().unwrap();
        let job_id = snapshots
            .start_snapshot_job(node.id, SnapshotRequest::new(format!("file://{}", archive.display())))
            .unwrap();
        let job = snapshots.wait(job_id).await.unwrap();
        assert_eq!(job.state, SnapshotState::Done, "job failed: {:?}", job.error);
        assert!(node.data_path.join("gwat/gwat/chaindata/000001.ldb").exists());

        harness.shutdown().await;
    }

    #[tokio::test]
    async fn test_missing_binary_fails_start() {
        let commands = ScriptCommands::new("exit 127", "exec sleep 30");
        let harness = Harness::start_with(commands, Arc::new(FileSource), |_| {}).await;
        let nodes = harness.orchestrator.nodes().unwrap();
        let node = harness.create_node("n1", Network::Mainnet).await;

        let err = nodes.start(node.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Process);
        assert_eq!(nodes.get_state(node.id).unwrap(), ProcessState::Failed);

        harness.shutdown().await;
    }

    #[tokio::test]
    async fn test_destroy_stops_running_nodes() {
        let harness = Harness::start().await;
        let nodes = harness.orchestrator.nodes().unwrap();
        let store = harness.orchestrator.store().unwrap();
        let first = harness.create_node("n1", Network::Testnet8).await;
        let second = harness.create_node("n2", Network::Testnet9).await;
        nodes.start(first.id).await.unwrap();
        nodes.start(second.id).await.unwrap();

        harness.shutdown().await;

        assert_eq!(store.get_node(first.id).unwrap().process_state, ProcessState::Stopped);
        assert_eq!(store.get_node(second.id).unwrap().process_state, ProcessState::Stopped);
        assert_eq!(
            harness.orchestrator.nodes().unwrap_err().kind(),
            ErrorKind::Unavailable
        );
        // Idempotent.
        harness.shutdown().await;
    }
}
