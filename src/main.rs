use anyhow::Context;
use clap::Parser;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::Duration;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use change_governance::advisory::ConflictAdvisory;
use change_governance::api::{self, AppState};
use change_governance::config::{loader, AppConfig, LockBackend};
use change_governance::database::Database;
use change_governance::events::EventBus;
use change_governance::governance::{
    ChangeGateway, ChangeRequestService, HandlerRegistry, JsonRecordHandler, PolicyStore,
};
use change_governance::locks::{EntityLockCoordinator, LockStore, MemoryLockStore, SqlLockStore};

#[derive(Parser)]
#[command(name = "change-governance")]
#[command(about = "Change requests and advisory entity locks for environment-scoped configuration")]
struct Cli {
    /// Configuration file (defaults to ./change-governance.{toml,yaml} when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// YAML file with additional environment policies
    #[arg(short, long)]
    policies: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "change_governance=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    info!("Starting change governance service");

    let mut config = AppConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(path) = cli.policies.as_deref() {
        let policies = loader::load_policy_file(path).context("loading policy file")?;
        info!("Loaded {} policies from {}", policies.len(), path.display());
        config.merge_policies(policies).context("validating policy file")?;
    }
    info!("Configuration loaded");

    let database = Database::new(&config.database_url)
        .await
        .context("connecting to database")?;
    database.run_migrations().await.context("running migrations")?;
    info!("Database ready");

    let policies = PolicyStore::new(
        database.clone(),
        Duration::from_secs(config.policy_refresh_secs),
    );
    policies.seed(&config.environments).await?;

    let events = EventBus::new(config.event_buffer);

    let lock_store: Arc<dyn LockStore> = match config.locks.store {
        LockBackend::Memory => Arc::new(MemoryLockStore::new()),
        LockBackend::Database => {
            let store = SqlLockStore::new(database.pool().clone());
            spawn_lock_purge(store.clone());
            Arc::new(store)
        }
    };
    let locks = EntityLockCoordinator::with_default_ttl(
        lock_store,
        events.clone(),
        config.locks.default_ttl_secs,
    );

    let mut handlers = HandlerRegistry::new();
    let mut records = HashMap::new();
    for table in &config.managed_tables {
        let handler = JsonRecordHandler::new(database.clone(), table);
        handlers.register(table, Arc::new(handler.clone()));
        records.insert(table.clone(), handler);
    }
    info!("Managing {} tables", records.len());
    let handlers = Arc::new(handlers);

    let change_requests = ChangeRequestService::new(
        database.clone(),
        policies.clone(),
        handlers.clone(),
        events.clone(),
    );
    let gateway = ChangeGateway::new(policies, handlers, change_requests.clone());
    let advisory = ConflictAdvisory::new(database, locks.clone());

    let address = config.server_address();
    let state = AppState {
        config: Arc::new(config),
        locks,
        advisory,
        change_requests,
        gateway,
        records: Arc::new(records),
    };

    let app = api::router(state).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .into_inner(),
    );

    info!("Server listening on {}", address);
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("binding {}", address))?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Expired lock rows are already ignored by reads; this only keeps the table small
fn spawn_lock_purge(store: SqlLockStore) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            if let Err(e) = store.purge_expired().await {
                error!("Failed to purge expired locks: {}", e);
            }
        }
    });
    info!("Lock purge task started");
}
