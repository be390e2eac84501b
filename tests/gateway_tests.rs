use change_governance::config::EnvironmentPolicy;
use change_governance::database::models::{ChangeRequestStatus, Operation};
use change_governance::governance::{ChangeValues, GatewayOutcome};
use change_governance::GovernanceError;
use serde_json::json;

mod common;
use common::*;

#[tokio::test]
async fn test_direct_creation_runs_handler_once() {
    let ctx = setup().await;

    let outcome = ctx
        .gateway
        .request_creation("7", "dev", NOTICES, json!({"title": "Maintenance"}))
        .await
        .unwrap();

    match outcome {
        GatewayOutcome::Direct { data } => assert_eq!(data["title"], "Maintenance"),
        other => panic!("expected direct write, got {:?}", other),
    }
    assert_eq!(ctx.notices.applies(), 1);
    assert!(ctx.service.list("dev", None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_governed_creation_defers_write() {
    let ctx = setup().await;

    let outcome = ctx
        .gateway
        .request_creation("7", "prod", NOTICES, json!({"title": "Maintenance"}))
        .await
        .unwrap();

    assert!(!outcome.is_direct());
    assert_eq!(ctx.notices.applies(), 0);

    let id = outcome.change_request_id().unwrap();
    let detail = ctx.service.get(id).await.unwrap();
    assert_eq!(detail.request.status, ChangeRequestStatus::Draft);
    assert_eq!(detail.request.requester_id, "7");
    assert_eq!(detail.required_approvals, 2);
    assert_eq!(detail.items.len(), 1);

    let item = &detail.items[0];
    assert_eq!(item.operation, Operation::Create);
    assert_eq!(item.target_id, None);
    assert_eq!(item.before_data, None);
    assert_eq!(item.after_data, Some(json!({"title": "Maintenance"})));
}

#[tokio::test]
async fn test_direct_change_merges_and_computes() {
    let ctx = setup().await;
    ctx.notices
        .insert("dev", "10", json!({"id": "10", "title": "Old", "enabled": true}));

    let outcome = ctx
        .gateway
        .process_change("7", "dev", NOTICES, "10", json!({"title": "New"}).into())
        .await
        .unwrap();
    assert!(outcome.is_direct());
    assert_eq!(
        ctx.notices.row("dev", "10"),
        Some(json!({"id": "10", "title": "New", "enabled": true}))
    );

    let toggle = ChangeValues::compute(|row| json!({"enabled": !row["enabled"].as_bool().unwrap_or(false)}));
    ctx.gateway
        .process_change("7", "dev", NOTICES, "10", toggle)
        .await
        .unwrap();
    assert_eq!(ctx.notices.row("dev", "10").unwrap()["enabled"], false);
    assert_eq!(ctx.notices.applies(), 2);
}

#[tokio::test]
async fn test_governed_change_snapshots_before_and_after() {
    let ctx = setup().await;
    ctx.notices
        .insert("prod", "10", json!({"id": "10", "title": "Old", "enabled": true}));

    let toggle = ChangeValues::compute(|row| json!({"enabled": !row["enabled"].as_bool().unwrap_or(false)}));
    let outcome = ctx
        .gateway
        .process_change("7", "prod", NOTICES, "10", toggle)
        .await
        .unwrap();

    assert_eq!(ctx.notices.applies(), 0);
    assert_eq!(ctx.notices.row("prod", "10").unwrap()["enabled"], true);

    let detail = ctx.service.get(outcome.change_request_id().unwrap()).await.unwrap();
    let item = &detail.items[0];
    assert_eq!(item.operation, Operation::Update);
    assert_eq!(item.target_id.as_deref(), Some("10"));
    assert_eq!(item.before_data.as_ref().unwrap()["enabled"], true);
    assert_eq!(item.after_data.as_ref().unwrap()["enabled"], false);
    assert_eq!(item.after_data.as_ref().unwrap()["title"], "Old");
}

#[tokio::test]
async fn test_repeated_edits_share_one_draft() {
    let ctx = setup().await;
    ctx.notices
        .insert("prod", "10", json!({"id": "10", "title": "Old", "body": "Old body"}));

    let first = ctx
        .gateway
        .process_change("7", "prod", NOTICES, "10", json!({"title": "New"}).into())
        .await
        .unwrap();
    let second = ctx
        .gateway
        .process_change("7", "prod", NOTICES, "10", json!({"body": "New body"}).into())
        .await
        .unwrap();

    assert_eq!(first.change_request_id(), second.change_request_id());

    let detail = ctx.service.get(first.change_request_id().unwrap()).await.unwrap();
    assert_eq!(detail.items.len(), 1);
    assert_eq!(
        detail.items[0].before_data,
        Some(json!({"id": "10", "title": "Old", "body": "Old body"}))
    );
    assert_eq!(
        detail.items[0].after_data,
        Some(json!({"id": "10", "title": "New", "body": "New body"}))
    );

    // Another requester gets a draft of their own
    let other = ctx
        .gateway
        .process_change("9", "prod", NOTICES, "10", json!({"title": "Other"}).into())
        .await
        .unwrap();
    assert_ne!(other.change_request_id(), first.change_request_id());
}

#[tokio::test]
async fn test_governed_deletion_captures_row() {
    let ctx = setup().await;
    ctx.notices.insert("staging", "10", json!({"id": "10", "title": "Old"}));

    let outcome = ctx
        .gateway
        .request_deletion("7", "staging", NOTICES, "10")
        .await
        .unwrap();

    assert!(ctx.notices.row("staging", "10").is_some());
    let detail = ctx.service.get(outcome.change_request_id().unwrap()).await.unwrap();
    assert_eq!(detail.required_approvals, 1);
    assert_eq!(detail.items[0].operation, Operation::Delete);
    assert_eq!(detail.items[0].before_data, Some(json!({"id": "10", "title": "Old"})));
    assert_eq!(detail.items[0].after_data, None);
}

#[tokio::test]
async fn test_unknown_environment_is_config_error() {
    let ctx = setup().await;

    let err = ctx
        .gateway
        .request_creation("7", "qa", NOTICES, json!({"title": "x"}))
        .await
        .unwrap_err();
    assert!(matches!(err, GovernanceError::ConfigError(_)));

    let err = ctx
        .gateway
        .request_creation("7", "", NOTICES, json!({"title": "x"}))
        .await
        .unwrap_err();
    assert!(matches!(err, GovernanceError::ConfigError(_)));
    assert_eq!(ctx.notices.applies(), 0);
}

#[tokio::test]
async fn test_missing_target_and_unknown_table() {
    let ctx = setup().await;

    let err = ctx
        .gateway
        .process_change("7", "prod", NOTICES, "404", json!({"title": "x"}).into())
        .await
        .unwrap_err();
    assert!(matches!(err, GovernanceError::NotFound(_)));

    let err = ctx
        .gateway
        .request_creation("7", "prod", "g_unknown", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, GovernanceError::HandlerNotRegistered(_)));
    assert!(ctx.service.list("prod", None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_direct_failure_propagates_without_change_request() {
    let ctx = setup().await;
    ctx.notices.set_failing(true);

    let err = ctx
        .gateway
        .request_creation("7", "dev", NOTICES, json!({"title": "x"}))
        .await
        .unwrap_err();

    assert!(matches!(err, GovernanceError::ExecutionError(_)));
    assert!(ctx.service.list("dev", None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_policy_change_switches_mode() {
    let ctx = setup().await;
    assert!(!ctx.gateway.requires_approval("dev").await.unwrap());

    ctx.policies
        .set_policy("dev", &EnvironmentPolicy::with_approvers(1))
        .await
        .unwrap();
    assert!(ctx.gateway.requires_approval("dev").await.unwrap());

    let outcome = ctx
        .gateway
        .request_creation("7", "dev", NOTICES, json!({"title": "x"}))
        .await
        .unwrap();
    assert!(!outcome.is_direct());
    assert_eq!(ctx.notices.applies(), 0);
}
