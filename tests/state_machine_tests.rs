use change_governance::database::models::{ChangeRequestStatus, Priority};
use change_governance::events::GovernanceEvent;
use change_governance::governance::{
    ChangeGateway, ChangeHandler, ChangeRequestMetadata, ChangeRequestService, HandlerRegistry,
    JsonRecordHandler, PendingOperation,
};
use change_governance::GovernanceError;
use serde_json::json;
use std::sync::Arc;

mod common;
use common::*;

/// Open a request in `environment` that creates one notice
async fn open_request(ctx: &TestContext, environment: &str) -> String {
    let outcome = ctx
        .gateway
        .request_creation("7", environment, NOTICES, json!({"title": "Maintenance window"}))
        .await
        .unwrap();
    let id = outcome.change_request_id().unwrap().to_string();
    ctx.service
        .submit(&id, "Announce maintenance", "Planned downtime")
        .await
        .unwrap();
    id
}

#[tokio::test]
async fn test_two_approver_scenario() {
    let ctx = setup().await;
    let mut events = ctx.events.subscribe();
    let id = open_request(&ctx, "prod").await;

    let progress = ctx.service.approve(&id, "x", "looks fine").await.unwrap();
    assert_eq!(progress.status, ChangeRequestStatus::Open);
    assert_eq!((progress.approvals, progress.required), (1, 2));
    assert!(!progress.is_satisfied());

    let progress = ctx.service.approve(&id, "y", "").await.unwrap();
    assert_eq!(progress.status, ChangeRequestStatus::Approved);
    assert_eq!(progress.approvals, 2);
    assert_eq!(ctx.notices.applies(), 0);

    let rows = ctx.service.execute(&id, "ops").await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(ctx.notices.applies(), 1);
    assert_eq!(ctx.notices.len(), 1);

    let cr = ctx.service.get_request(&id).await.unwrap();
    assert_eq!(cr.status, ChangeRequestStatus::Applied);
    assert_eq!(cr.executed_by.as_deref(), Some("ops"));
    assert!(cr.executed_at.is_some());

    let names: Vec<&str> = drain(&mut events).iter().map(|e| e.name()).collect();
    assert_eq!(
        names,
        vec![
            "change_request.created",
            "change_request.submitted",
            "change_request.approval_recorded",
            "change_request.approval_recorded",
            "change_request.approved",
            "change_request.applied",
        ]
    );

    // Applied is terminal for execute
    let err = ctx.service.execute(&id, "ops").await.unwrap_err();
    assert!(matches!(err, GovernanceError::StateError(_)));
    assert_eq!(ctx.notices.applies(), 1);
}

#[tokio::test]
async fn test_submit_validation() {
    let ctx = setup().await;
    let outcome = ctx
        .gateway
        .request_creation("7", "prod", NOTICES, json!({"title": "x"}))
        .await
        .unwrap();
    let id = outcome.change_request_id().unwrap();

    assert!(matches!(
        ctx.service.submit(id, " ", "reason").await,
        Err(GovernanceError::ValidationError(_))
    ));
    assert!(matches!(
        ctx.service.submit(id, "title", "").await,
        Err(GovernanceError::ValidationError(_))
    ));

    let cr = ctx.service.submit(id, "title", "reason").await.unwrap();
    assert_eq!(cr.status, ChangeRequestStatus::Open);
    assert_eq!(cr.title, "title");

    assert!(matches!(
        ctx.service.submit(id, "title", "reason").await,
        Err(GovernanceError::StateError(_))
    ));
    assert!(matches!(
        ctx.service.submit("missing", "title", "reason").await,
        Err(GovernanceError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_approval_rules() {
    let ctx = setup().await;
    let outcome = ctx
        .gateway
        .request_creation("7", "prod", NOTICES, json!({"title": "x"}))
        .await
        .unwrap();
    let id = outcome.change_request_id().unwrap().to_string();

    // Drafts cannot be approved
    assert!(matches!(
        ctx.service.approve(&id, "x", "").await,
        Err(GovernanceError::StateError(_))
    ));

    ctx.service.submit(&id, "title", "reason").await.unwrap();

    // Self-approval is refused whatever the count
    assert!(matches!(
        ctx.service.approve(&id, "7", "").await,
        Err(GovernanceError::StateError(_))
    ));
    ctx.service.approve(&id, "x", "").await.unwrap();
    assert!(matches!(
        ctx.service.approve(&id, "7", "").await,
        Err(GovernanceError::StateError(_))
    ));

    // A second approval by the same approver is refused and stores nothing
    assert!(matches!(
        ctx.service.approve(&id, "x", "again").await,
        Err(GovernanceError::StateError(_))
    ));
    let detail = ctx.service.get(&id).await.unwrap();
    assert_eq!(detail.approvals.len(), 1);
    assert_eq!(detail.request.status, ChangeRequestStatus::Open);
}

#[tokio::test]
async fn test_concurrent_approvals_promote_once() {
    let ctx = setup().await;
    let id = open_request(&ctx, "prod").await;
    let mut events = ctx.events.subscribe();

    let (a, b, c) = tokio::join!(
        ctx.service.approve(&id, "x", ""),
        ctx.service.approve(&id, "y", ""),
        ctx.service.approve(&id, "z", ""),
    );

    // The third approval may land after promotion, in which case it is refused
    let succeeded = [a, b, c].into_iter().filter(|r| r.is_ok()).count();
    assert!(succeeded >= 2);

    let approved = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, GovernanceEvent::ChangeRequestApproved { .. }))
        .count();
    assert_eq!(approved, 1);

    let progress = ctx.service.approval_progress(&id).await.unwrap();
    assert_eq!(progress.status, ChangeRequestStatus::Approved);
    assert_eq!(progress.approvals as usize, succeeded);
}

#[tokio::test]
async fn test_reject_and_reopen() {
    let ctx = setup().await;
    let id = open_request(&ctx, "prod").await;
    ctx.service.approve(&id, "x", "").await.unwrap();

    assert!(matches!(
        ctx.service.reject(&id, "y", "  ").await,
        Err(GovernanceError::ValidationError(_))
    ));

    let cr = ctx.service.reject(&id, "y", "Wrong window").await.unwrap();
    assert_eq!(cr.status, ChangeRequestStatus::Rejected);
    assert_eq!(cr.rejected_by.as_deref(), Some("y"));
    assert_eq!(cr.rejection_reason.as_deref(), Some("Wrong window"));
    assert!(cr.rejected_at.is_some());

    // Approvals stay for the audit trail while rejected
    assert_eq!(ctx.service.get(&id).await.unwrap().approvals.len(), 1);
    assert!(matches!(
        ctx.service.approve(&id, "z", "").await,
        Err(GovernanceError::StateError(_))
    ));

    let cr = ctx.service.reopen(&id).await.unwrap();
    assert_eq!(cr.status, ChangeRequestStatus::Draft);
    assert_eq!(cr.rejected_by, None);
    assert_eq!(cr.rejection_reason, None);
    assert!(ctx.service.get(&id).await.unwrap().approvals.is_empty());

    assert!(matches!(
        ctx.service.reopen(&id).await,
        Err(GovernanceError::StateError(_))
    ));

    ctx.service.submit(&id, "Announce maintenance", "Moved window").await.unwrap();
    let progress = ctx.service.approve(&id, "x", "").await.unwrap();
    assert_eq!(progress.approvals, 1);
}

#[tokio::test]
async fn test_failed_execution_stays_approved() {
    let ctx = setup().await;
    let id = open_request(&ctx, "staging").await;
    let progress = ctx.service.approve(&id, "x", "").await.unwrap();
    assert_eq!(progress.status, ChangeRequestStatus::Approved);

    ctx.notices.set_failing(true);
    let err = ctx.service.execute(&id, "ops").await.unwrap_err();
    assert!(matches!(err, GovernanceError::ExecutionError(_)));

    let cr = ctx.service.get_request(&id).await.unwrap();
    assert_eq!(cr.status, ChangeRequestStatus::Approved);
    assert_eq!(cr.executed_by, None);

    ctx.notices.set_failing(false);
    ctx.service.execute(&id, "ops").await.unwrap();
    assert_eq!(
        ctx.service.get_request(&id).await.unwrap().status,
        ChangeRequestStatus::Applied
    );
    assert_eq!(ctx.notices.applies(), 2);
    assert_eq!(ctx.notices.len(), 1);
}

#[tokio::test]
async fn test_rollback_restores_updated_row() {
    let ctx = setup().await;
    let original = json!({"id": "10", "title": "Old", "enabled": true});
    ctx.notices.insert("staging", "10", original.clone());

    let outcome = ctx
        .gateway
        .process_change("7", "staging", NOTICES, "10", json!({"title": "New"}).into())
        .await
        .unwrap();
    let id = outcome.change_request_id().unwrap().to_string();
    ctx.service.submit(&id, "Retitle", "Typo").await.unwrap();
    ctx.service.approve(&id, "x", "").await.unwrap();

    assert!(matches!(
        ctx.service.rollback(&id, "ops").await,
        Err(GovernanceError::StateError(_))
    ));

    ctx.service.execute(&id, "ops").await.unwrap();
    assert_eq!(ctx.notices.row("staging", "10").unwrap()["title"], "New");

    ctx.service.rollback(&id, "ops").await.unwrap();
    assert_eq!(ctx.notices.row("staging", "10"), Some(original));

    let cr = ctx.service.get_request(&id).await.unwrap();
    assert_eq!(cr.status, ChangeRequestStatus::Applied);
    assert_eq!(cr.rolled_back_by.as_deref(), Some("ops"));

    assert!(matches!(
        ctx.service.rollback(&id, "ops").await,
        Err(GovernanceError::StateError(_))
    ));
}

#[tokio::test]
async fn test_rollback_of_creation_deletes_created_row() {
    let ctx = setup().await;
    let id = open_request(&ctx, "staging").await;
    ctx.service.approve(&id, "x", "").await.unwrap();

    let rows = ctx.service.execute(&id, "ops").await.unwrap();
    let created_id = rows[0]["id"].as_str().unwrap().to_string();
    assert!(ctx.notices.row("staging", &created_id).is_some());

    let detail = ctx.service.get(&id).await.unwrap();
    assert_eq!(detail.items[0].target_id.as_deref(), Some(created_id.as_str()));

    ctx.service.rollback(&id, "ops").await.unwrap();
    assert!(ctx.notices.row("staging", &created_id).is_none());
}

#[tokio::test]
async fn test_rollback_of_deletion_recreates_row() {
    let ctx = setup().await;
    let original = json!({"id": "10", "title": "Old"});
    ctx.notices.insert("staging", "10", original.clone());

    let outcome = ctx
        .gateway
        .request_deletion("7", "staging", NOTICES, "10")
        .await
        .unwrap();
    let id = outcome.change_request_id().unwrap().to_string();
    ctx.service.submit(&id, "Remove notice", "Expired").await.unwrap();
    ctx.service.approve(&id, "x", "").await.unwrap();
    ctx.service.execute(&id, "ops").await.unwrap();
    assert!(ctx.notices.row("staging", "10").is_none());

    ctx.service.rollback(&id, "ops").await.unwrap();
    assert_eq!(ctx.notices.row("staging", "10"), Some(original));
}

#[tokio::test]
async fn test_concurrent_execute_applies_once() {
    let ctx = setup().await;
    let mut events = ctx.events.subscribe();
    let id = open_request(&ctx, "staging").await;
    ctx.service.approve(&id, "x", "").await.unwrap();

    let (first, second) = tokio::join!(
        ctx.service.execute(&id, "ops"),
        ctx.service.execute(&id, "ops2")
    );
    assert!(first.is_ok() != second.is_ok());
    let refused = if first.is_ok() { second } else { first };
    assert!(matches!(refused, Err(GovernanceError::StateError(_))));

    assert_eq!(ctx.notices.applies(), 1);
    assert_eq!(ctx.notices.len(), 1);
    let applied = drain(&mut events)
        .iter()
        .filter(|e| e.name() == "change_request.applied")
        .count();
    assert_eq!(applied, 1);
}

#[tokio::test]
async fn test_concurrent_rollback_undoes_once() {
    let ctx = setup().await;
    let id = open_request(&ctx, "staging").await;
    ctx.service.approve(&id, "x", "").await.unwrap();
    ctx.service.execute(&id, "ops").await.unwrap();
    let mut events = ctx.events.subscribe();

    let (first, second) = tokio::join!(
        ctx.service.rollback(&id, "ops"),
        ctx.service.rollback(&id, "ops2")
    );
    assert!(first.is_ok() != second.is_ok());

    // One write to apply, one to undo
    assert_eq!(ctx.notices.applies(), 2);
    assert_eq!(ctx.notices.len(), 0);
    let rolled_back = drain(&mut events)
        .iter()
        .filter(|e| e.name() == "change_request.rolled_back")
        .count();
    assert_eq!(rolled_back, 1);
}

#[tokio::test]
async fn test_governed_creation_never_overwrites_existing_record() {
    let ctx = setup().await;
    let whitelist = Arc::new(JsonRecordHandler::new(ctx.database.clone(), "g_ip_whitelist"));
    let handlers = Arc::new(HandlerRegistry::new().with("g_ip_whitelist", whitelist.clone()));
    let service = ChangeRequestService::new(
        ctx.database.clone(),
        ctx.policies.clone(),
        handlers.clone(),
        ctx.events.clone(),
    );
    let gateway = ChangeGateway::new(ctx.policies.clone(), handlers, service.clone());

    let original = json!({"id": "5", "note": "original"});
    whitelist
        .apply("staging", &PendingOperation::create("g_ip_whitelist", original.clone()))
        .await
        .unwrap();

    let outcome = gateway
        .request_creation("7", "staging", "g_ip_whitelist", json!({"id": "5", "ip": "6.6.6.6"}))
        .await
        .unwrap();
    let id = outcome.change_request_id().unwrap().to_string();
    service.submit(&id, "Allow office", "New range").await.unwrap();
    service.approve(&id, "x", "").await.unwrap();

    let err = service.execute(&id, "ops").await.unwrap_err();
    assert!(matches!(err, GovernanceError::StateError(_)));
    assert_eq!(whitelist.load("staging", "5").await.unwrap(), Some(original));

    let cr = service.get_request(&id).await.unwrap();
    assert_eq!(cr.status, ChangeRequestStatus::Approved);
    assert!(matches!(
        service.rollback(&id, "ops").await,
        Err(GovernanceError::StateError(_))
    ));
    assert!(whitelist.load("staging", "5").await.unwrap().is_some());
}

#[tokio::test]
async fn test_metadata_and_delete_only_while_draft() {
    let ctx = setup().await;
    let outcome = ctx
        .gateway
        .request_creation("7", "prod", NOTICES, json!({"title": "x"}))
        .await
        .unwrap();
    let id = outcome.change_request_id().unwrap().to_string();

    let cr = ctx
        .service
        .update_metadata(
            &id,
            ChangeRequestMetadata {
                description: Some("Adds a banner".to_string()),
                priority: Some(Priority::High),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(cr.description, "Adds a banner");
    assert_eq!(cr.priority, Priority::High);

    ctx.service.submit(&id, "Banner", "Announcement").await.unwrap();
    assert!(matches!(
        ctx.service.update_metadata(&id, ChangeRequestMetadata::default()).await,
        Err(GovernanceError::StateError(_))
    ));
    assert!(matches!(
        ctx.service.delete(&id).await,
        Err(GovernanceError::StateError(_))
    ));

    let draft = ctx
        .gateway
        .request_creation("7", "prod", NOTICES, json!({"title": "y"}))
        .await
        .unwrap();
    let draft_id = draft.change_request_id().unwrap();
    ctx.service.delete(draft_id).await.unwrap();
    assert!(matches!(
        ctx.service.get(draft_id).await,
        Err(GovernanceError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_history_records_lifecycle() {
    let ctx = setup().await;
    let id = open_request(&ctx, "staging").await;
    ctx.service.approve(&id, "x", "ok").await.unwrap();
    ctx.service.execute(&id, "ops").await.unwrap();

    let actions: Vec<String> = ctx
        .service
        .history(&id)
        .await
        .unwrap()
        .into_iter()
        .map(|h| h.action)
        .collect();
    assert_eq!(
        actions,
        vec!["created", "submitted", "approval_recorded", "approved", "applied"]
    );

    let listed = ctx
        .service
        .list("staging", Some(ChangeRequestStatus::Applied))
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert!(ctx
        .service
        .list("staging", Some(ChangeRequestStatus::Open))
        .await
        .unwrap()
        .is_empty());
}
