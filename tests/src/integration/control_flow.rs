//! # Control Surface Flows
//!
//! Line-delimited JSON requests against a live orchestrator, with bus
//! events interleaved on the same output stream.

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use node_supervisor::ControlSurface;
    use serde_json::{json, Value};
    use shared_bus::{topics, EventFilter};
    use tokio::io::AsyncReadExt;

    use crate::support::Harness;

    async fn serve_lines(surface: &ControlSurface, harness: &Harness, requests: &[Value]) -> Vec<Value> {
        let input: String = requests.iter().map(|r| format!("{r}\n")).collect();
        let (output, mut read_side) = tokio::io::duplex(256 * 1024);
        let events = harness
            .orchestrator
            .bus()
            .subscribe(EventFilter::topics([topics::NODE_STATE_CHANGED]));
        surface.serve(input.as_bytes(), output, events).await.unwrap();

        let mut text = String::new();
        read_side.read_to_string(&mut text).await.unwrap();
        text.lines().map(|l| serde_json::from_str(l).unwrap()).collect()
    }

    #[tokio::test]
    async fn test_start_over_control_pushes_state_changes() {
        let harness = Harness::start().await;
        let surface = ControlSurface::new(harness.orchestrator.clone());
        let created = surface
            .call("node.create", json!({"name": "n1", "network": "testnet8"}))
            .await
            .unwrap();
        let id = created["id"].clone();

        let messages = serve_lines(
            &surface,
            &harness,
            &[json!({"id": "s1", "method": "node.start", "params": {"id": id}})],
        )
        .await;

        let reply = messages
            .iter()
            .find(|m| m.get("id") == Some(&json!("s1")))
            .expect("no reply");
        assert_eq!(reply["result"]["process_state"], "running");

        let transitions: Vec<(&Value, &Value)> = messages
            .iter()
            .filter(|m| m["event"] == topics::NODE_STATE_CHANGED)
            .map(|m| (&m["payload"]["from"], &m["payload"]["to"]))
            .collect();
        assert_eq!(
            transitions,
            vec![
                (&json!("stopped"), &json!("starting")),
                (&json!("starting"), &json!("running")),
            ]
        );

        harness.shutdown().await;
    }

    #[tokio::test]
    async fn test_logs_tail_running_process() {
        let harness = Harness::start().await;
        let surface = ControlSurface::new(harness.orchestrator.clone());
        let created = surface
            .call("node.create", json!({"name": "n1", "network": "testnet9"}))
            .await
            .unwrap();
        let id = created["id"].clone();
        surface.call("node.start", json!({"id": id})).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let lines = surface
                .call("node.logs", json!({"id": id, "role": "validator"}))
                .await
                .unwrap();
            if lines.as_array().is_some_and(|l| l.iter().any(|s| s == "gwat up")) {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "no output captured: {lines}");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let err = surface
            .call("node.logs", json!({"id": id, "role": "beacon"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "precondition");

        harness.shutdown().await;
    }

    #[tokio::test]
    async fn test_requests_after_shutdown_are_unavailable() {
        let harness = Harness::start().await;
        let surface = ControlSurface::new(harness.orchestrator.clone());
        harness.shutdown().await;

        let reply = surface
            .handle_line(r#"{"id": 9, "method": "node.list"}"#)
            .await
            .unwrap();
        let reply = serde_json::to_value(reply).unwrap();
        assert_eq!(reply["id"], 9);
        assert_eq!(reply["error"]["kind"], "unavailable");
    }
}
