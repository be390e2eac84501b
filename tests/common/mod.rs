#![allow(dead_code)]

use async_trait::async_trait;
use change_governance::config::EnvironmentPolicy;
use change_governance::database::models::Operation;
use change_governance::database::Database;
use change_governance::events::{EventBus, GovernanceEvent};
use change_governance::governance::{
    ChangeGateway, ChangeHandler, ChangeRequestService, HandlerRegistry, PendingOperation, PolicyStore,
};
use change_governance::GovernanceError;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

pub const NOTICES: &str = "g_service_notices";

/// Setup an in-memory SQLite database for testing
pub async fn setup_test_db() -> Database {
    Database::new_in_memory().await.expect("Failed to create test database")
}

/// prod needs two approvers, staging forces change requests with one, dev writes directly
pub fn test_policies() -> HashMap<String, EnvironmentPolicy> {
    let mut policies = HashMap::new();
    policies.insert("prod".to_string(), EnvironmentPolicy::with_approvers(2));
    policies.insert(
        "staging".to_string(),
        EnvironmentPolicy {
            required_approvers: 0,
            require_change_request: true,
        },
    );
    policies.insert("dev".to_string(), EnvironmentPolicy::direct());
    policies
}

/// In-memory table that counts every write it performs
#[derive(Default)]
pub struct CountingHandler {
    rows: Mutex<HashMap<(String, String), Value>>,
    applies: AtomicUsize,
    next_id: AtomicUsize,
    fail: AtomicBool,
}

impl CountingHandler {
    pub fn applies(&self) -> usize {
        self.applies.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn insert(&self, environment: &str, id: &str, row: Value) {
        self.rows
            .lock()
            .unwrap()
            .insert((environment.to_string(), id.to_string()), row);
    }

    pub fn row(&self, environment: &str, id: &str) -> Option<Value> {
        self.rows
            .lock()
            .unwrap()
            .get(&(environment.to_string(), id.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }
}

#[async_trait]
impl ChangeHandler for CountingHandler {
    async fn load(&self, environment: &str, target_id: &str) -> Result<Option<Value>, GovernanceError> {
        Ok(self.row(environment, target_id))
    }

    async fn apply(&self, environment: &str, operation: &PendingOperation) -> Result<Value, GovernanceError> {
        self.applies.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(GovernanceError::ExecutionError("notice store unavailable".to_string()));
        }

        let mut rows = self.rows.lock().unwrap();
        match operation.operation {
            Operation::Create => {
                let id = operation.target_id.clone().unwrap_or_else(|| {
                    format!("{}", 100 + self.next_id.fetch_add(1, Ordering::SeqCst))
                });
                let mut row = operation.payload.clone().unwrap_or_else(|| json!({}));
                row["id"] = json!(id);
                rows.insert((environment.to_string(), id), row.clone());
                Ok(row)
            }
            Operation::Update => {
                let id = operation.target_id.clone().unwrap_or_default();
                let key = (environment.to_string(), id.clone());
                if !rows.contains_key(&key) {
                    return Err(GovernanceError::NotFound(format!("notice {}", id)));
                }
                let row = operation.payload.clone().unwrap_or_else(|| json!({}));
                rows.insert(key, row.clone());
                Ok(row)
            }
            Operation::Delete => {
                let id = operation.target_id.clone().unwrap_or_default();
                Ok(rows
                    .remove(&(environment.to_string(), id.clone()))
                    .unwrap_or_else(|| json!({ "id": id })))
            }
        }
    }
}

pub struct TestContext {
    pub database: Database,
    pub policies: PolicyStore,
    pub events: EventBus,
    pub notices: Arc<CountingHandler>,
    pub service: ChangeRequestService,
    pub gateway: ChangeGateway,
}

pub async fn setup() -> TestContext {
    let database = setup_test_db().await;
    let policies = PolicyStore::new(database.clone(), Duration::from_secs(30));
    policies.seed(&test_policies()).await.unwrap();

    let events = EventBus::new(64);
    let notices = Arc::new(CountingHandler::default());
    let handlers = Arc::new(HandlerRegistry::new().with(NOTICES, notices.clone()));

    let service = ChangeRequestService::new(
        database.clone(),
        policies.clone(),
        handlers.clone(),
        events.clone(),
    );
    let gateway = ChangeGateway::new(policies.clone(), handlers, service.clone());

    TestContext {
        database,
        policies,
        events,
        notices,
        service,
        gateway,
    }
}

/// Everything published so far
pub fn drain(receiver: &mut broadcast::Receiver<GovernanceEvent>) -> Vec<GovernanceEvent> {
    let mut events = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        events.push(event);
    }
    events
}
