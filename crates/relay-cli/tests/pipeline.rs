#![allow(clippy::unwrap_used, clippy::expect_used)]

use relay_cli::agents::{demo_registry, PIPELINE};
use relay_core::TaskState;
use relay_orchestrator::{Coordinator, RelayConfig, SubmitRequest};
use relay_store::{open_backend, BackendKind, StoreConfig};
use serde_json::json;

// ---------------------------------------------------------------------------
// Demo pipeline hands results forward through context
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pipeline_chains_context() {
    let config = RelayConfig::default();
    let backend = open_backend(&config.store).await.unwrap();
    let coordinator = Coordinator::new(demo_registry(&config).unwrap(), backend, config);

    let mut records = Vec::new();
    for agent in PIPELINE {
        let record = coordinator
            .submit(SubmitRequest::new(agent, json!({"task": "microservices"})))
            .await
            .unwrap();
        assert_eq!(record.state, TaskState::Completed, "{agent} failed: {record:?}");
        records.push(record);
    }

    let plan = records[1].result.as_ref().unwrap();
    assert_eq!(plan["used_research"], true);
    let code = records[2].result.as_ref().unwrap();
    assert_eq!(code["used_plan"], true);
    let audit = records[3].result.as_ref().unwrap();
    assert_eq!(audit["audited_code"], true);
    let validation = coordinator.get_context("validation_result").await.unwrap();
    assert_eq!(validation["passed"], true);
    let deployment = coordinator.get_context("deployment_info").await.unwrap();
    assert_eq!(deployment["validated_before_deploy"], true);
    let monitoring = coordinator.get_context("monitoring_data").await.unwrap();
    assert_eq!(monitoring["monitoring_deployment"], true);
}

// ---------------------------------------------------------------------------
// Deploy and monitor stages pick up the validation hand-off
// ---------------------------------------------------------------------------

#[tokio::test]
async fn deploy_then_monitor_after_validation() {
    let config = RelayConfig::default();
    let backend = open_backend(&config.store).await.unwrap();
    let coordinator = Coordinator::new(demo_registry(&config).unwrap(), backend, config);

    let early = coordinator
        .submit(SubmitRequest::new("deployer", json!(null)))
        .await
        .unwrap();
    assert_eq!(early.result.unwrap()["validated_before_deploy"], false);

    for agent in ["coder", "validator"] {
        let record = coordinator
            .submit(SubmitRequest::new(agent, json!({"task": "checkout service"})))
            .await
            .unwrap();
        assert_eq!(record.state, TaskState::Completed);
    }
    let deployed = coordinator
        .submit(SubmitRequest::new("deployer", json!({"task": "staging"})))
        .await
        .unwrap();
    let deployment = deployed.result.unwrap();
    assert_eq!(deployment["validated_before_deploy"], true);
    assert_eq!(deployment["deployment_url"], "https://staging.example.com");

    let watched = coordinator
        .submit(SubmitRequest::new("monitor", json!({})))
        .await
        .unwrap();
    let data = watched.result.unwrap();
    assert_eq!(data["system"], "all");
    assert_eq!(data["monitoring_deployment"], true);
}

// ---------------------------------------------------------------------------
// Validator without prior code fails without retrying
// ---------------------------------------------------------------------------

#[tokio::test]
async fn validator_alone_fails_permanently() {
    let config = RelayConfig::default();
    let backend = open_backend(&config.store).await.unwrap();
    let coordinator = Coordinator::new(demo_registry(&config).unwrap(), backend, config);

    let record = coordinator
        .submit(SubmitRequest::new("validator", json!({"task": "check"})))
        .await
        .unwrap();
    assert_eq!(record.state, TaskState::Failed);
    let error = record.error.unwrap();
    assert_eq!(error.attempts, 1);
    assert!(error.message.starts_with("missing_context"));
}

// ---------------------------------------------------------------------------
// Status is readable from a second process over the file store
// ---------------------------------------------------------------------------

#[tokio::test]
async fn status_visible_after_restart() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = RelayConfig::default();
    config.store = StoreConfig {
        kind: BackendKind::File,
        path: Some(tmp.path().join("relay.jsonl")),
    };

    {
        let backend = open_backend(&config.store).await.unwrap();
        let coordinator =
            Coordinator::new(demo_registry(&config).unwrap(), backend, config.clone());
        coordinator
            .submit(SubmitRequest::new("researcher", json!("rust")).with_task_id("research_001"))
            .await
            .unwrap();
    }

    let backend = open_backend(&config.store).await.unwrap();
    let coordinator = Coordinator::new(demo_registry(&config).unwrap(), backend, config);
    coordinator.start().await.unwrap();
    let record = coordinator.get_status("research_001").await.unwrap();
    assert_eq!(record.state, TaskState::Completed);
    assert_eq!(
        coordinator.history("research_001").await.unwrap(),
        vec![TaskState::Queued, TaskState::Processing, TaskState::Completed]
    );
    assert_eq!(coordinator.active_tasks(), 0);
    coordinator.shutdown();
}
