//! # Worker Flows
//!
//! Status monitor samples feeding the worker manager, and the lifecycle
//! rules that depend on chain-reported status.

#[cfg(all(test, unix))]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use shared_bus::{topics, EventFilter, SupervisorEvent};
    use shared_rpc::ValidatorInfo;
    use shared_types::{ActionKind, ErrorKind, Network, WorkerStatus};
    use tokio::time::timeout;
    use wf_03_worker_manager::ActionParams;
    use wf_05_snapshot_manager::FileSource;

    use crate::support::{eventually, key_material, Harness, ScriptCommands};

    #[tokio::test]
    async fn test_observed_status_advances_worker() {
        let harness = Harness::start().await;
        let nodes = harness.orchestrator.nodes().unwrap();
        let workers = harness.orchestrator.workers().unwrap();
        let monitor = harness.orchestrator.monitor().unwrap();

        let node = harness.create_node("n1", Network::Testnet8).await;
        nodes.start(node.id).await.unwrap();
        let keys = key_material(0x21);
        let worker = workers.create_worker(node.id, keys.clone()).await.unwrap();

        harness.rpc.set_validator(
            &keys.public_key,
            ValidatorInfo {
                status: Some(WorkerStatus::Activating),
                index: Some(7),
            },
        );
        let samples = monitor.poll_once().await.unwrap();
        // The node and its worker.
        assert_eq!(samples.len(), 2);
        assert!(samples.iter().all(|s| s.healthy));

        eventually("worker to activate", || {
            workers
                .get_worker(worker.id)
                .is_ok_and(|w| w.status == WorkerStatus::Activating && w.validator_index == Some(7))
        })
        .await;

        // A lagging endpoint reporting an older status changes nothing.
        harness.rpc.set_validator(
            &keys.public_key,
            ValidatorInfo {
                status: Some(WorkerStatus::Pending),
                index: Some(7),
            },
        );
        monitor.poll_once().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(workers.get_worker(worker.id).unwrap().status, WorkerStatus::Activating);

        harness.shutdown().await;
    }

    #[tokio::test]
    async fn test_stopped_node_is_not_polled() {
        let harness = Harness::start().await;
        let workers = harness.orchestrator.workers().unwrap();
        let node = harness.create_node("n1", Network::Testnet8).await;
        workers.create_worker(node.id, key_material(0x22)).await.unwrap();

        let samples = harness.orchestrator.monitor().unwrap().poll_once().await.unwrap();
        assert!(samples.is_empty());

        harness.shutdown().await;
    }

    #[tokio::test]
    async fn test_active_worker_needs_force_to_remove() {
        let harness = Harness::start().await;
        let nodes = harness.orchestrator.nodes().unwrap();
        let workers = harness.orchestrator.workers().unwrap();
        let mut removed = harness
            .orchestrator
            .bus()
            .subscribe(EventFilter::topics([topics::WORKER_REMOVED]));

        let node = harness.create_node("n1", Network::Testnet8).await;
        nodes.start(node.id).await.unwrap();
        let keys = key_material(0x23);
        let worker = workers.create_worker(node.id, keys.clone()).await.unwrap();
        harness.rpc.set_validator(
            &keys.public_key,
            ValidatorInfo {
                status: Some(WorkerStatus::Active),
                index: Some(3),
            },
        );
        harness.orchestrator.monitor().unwrap().poll_once().await.unwrap();
        eventually("worker to become active", || {
            workers
                .get_worker(worker.id)
                .is_ok_and(|w| w.status == WorkerStatus::Active)
        })
        .await;

        let err = workers.remove_worker(worker.id, false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Precondition);
        assert!(workers.get_worker(worker.id).is_ok());

        workers.remove_worker(worker.id, true).await.unwrap();
        assert_eq!(workers.get_worker(worker.id).unwrap_err().kind(), ErrorKind::NotFound);
        match removed.recv().await {
            Some(SupervisorEvent::WorkerRemoved { worker_id, forced }) => {
                assert_eq!(worker_id, worker.id);
                assert!(forced);
            }
            other => panic!("unexpected event {other:?}"),
        }

        harness.shutdown().await;
    }

    #[tokio::test]
    async fn test_unconfirmed_action_times_out() {
        let harness = Harness::start_with(
            ScriptCommands::long_running(),
            Arc::new(FileSource),
            |config| {
                config.workers.confirm_timeout = Duration::from_millis(100);
                config.workers.sweep_interval = Duration::from_millis(20);
            },
        )
        .await;
        let mut timeouts = harness
            .orchestrator
            .bus()
            .subscribe(EventFilter::topics([topics::WORKER_ACTION_TIMED_OUT]));

        let nodes = harness.orchestrator.nodes().unwrap();
        let workers = harness.orchestrator.workers().unwrap();
        let node = harness.create_node("n1", Network::Testnet9).await;
        nodes.start(node.id).await.unwrap();
        let worker = workers.create_worker(node.id, key_material(0x24)).await.unwrap();
        let result = workers
            .submit_action(worker.id, ActionKind::Activate, ActionParams::default())
            .await
            .unwrap();
        assert_eq!(workers.pending_confirmations(), 1);

        let event = timeout(Duration::from_secs(5), timeouts.recv())
            .await
            .expect("no timeout reported")
            .unwrap();
        match event {
            SupervisorEvent::WorkerActionTimedOut {
                worker_id,
                action,
                tx_hash,
                ..
            } => {
                assert_eq!(worker_id, worker.id);
                assert_eq!(action, ActionKind::Activate);
                assert_eq!(tx_hash, result.tx_hash);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(workers.pending_confirmations(), 0);
        // Reported, not reverted.
        let after = workers.get_worker(worker.id).unwrap();
        assert_eq!(after.status, WorkerStatus::Pending);
        assert!(after.deposit_data.is_some());

        harness.shutdown().await;
    }

    #[tokio::test]
    async fn test_removing_node_removes_its_workers() {
        let harness = Harness::start().await;
        let nodes = harness.orchestrator.nodes().unwrap();
        let workers = harness.orchestrator.workers().unwrap();
        let node = harness.create_node("n1", Network::Testnet8).await;
        let other = harness.create_node("n2", Network::Testnet8).await;

        let first = workers.create_worker(node.id, key_material(0x31)).await.unwrap();
        let second = workers.create_worker(node.id, key_material(0x41)).await.unwrap();
        let kept = workers.create_worker(other.id, key_material(0x51)).await.unwrap();

        let mut removed = nodes.remove_node(node.id).await.unwrap();
        removed.sort();
        let mut expected = vec![first.id, second.id];
        expected.sort();
        assert_eq!(removed, expected);

        assert_eq!(nodes.get_node(node.id).unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(workers.get_worker(first.id).unwrap_err().kind(), ErrorKind::NotFound);
        assert!(workers.get_worker(kept.id).is_ok());

        harness.shutdown().await;
    }

    #[tokio::test]
    async fn test_running_node_cannot_be_removed() {
        let harness = Harness::start().await;
        let nodes = harness.orchestrator.nodes().unwrap();
        let node = harness.create_node("n1", Network::Testnet8).await;
        nodes.start(node.id).await.unwrap();

        let err = nodes.remove_node(node.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Precondition);

        harness.shutdown().await;
    }
}
