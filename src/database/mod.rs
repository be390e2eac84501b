pub mod models;
pub mod queries;
pub mod schema;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::{debug, info};

use crate::error::GovernanceError;

/// Handle on the relational change record store
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self, GovernanceError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        Ok(Database { pool })
    }

    /// A private in-memory database with migrations applied.
    /// The pool keeps exactly one connection alive so every query sees the same data.
    pub async fn new_in_memory() -> Result<Self, GovernanceError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let database = Database { pool };
        database.run_migrations().await?;
        Ok(database)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<(), GovernanceError> {
        for (name, sql) in schema::MIGRATIONS {
            debug!("Applying migration {}", name);
            sqlx::raw_sql(sql).execute(&self.pool).await?;
        }

        info!("Applied {} migrations", schema::MIGRATIONS.len());
        Ok(())
    }
}
