//! PostgreSQL connection: the retry loop is driven here, one fresh
//! transaction per attempt.

use futures::future::BoxFuture;
use log::info;
use sqlx::PgPool;
use sqlx::postgres::{PgArguments, PgPoolOptions, PgQueryResult, PgRow};

use crate::classify;
use crate::config::{Config, RetryPolicy};
use crate::conn::{self, Connection, Transaction};
use crate::engine;
use crate::error::{Error, Result};

/// Connection to a single-node PostgreSQL server.
///
/// Conflicts are recognized by SQLSTATE `40001` only. A panic inside a
/// transaction callback rolls the attempt back and then continues unwinding
/// into the caller of [`Connection::exec_tx`].
#[derive(Debug, Clone)]
pub struct PostgresConnection {
    pool: PgPool,
    policy: RetryPolicy,
}

impl PostgresConnection {
    /// Connect with default settings.
    pub async fn connect(uri: &str) -> Result<Self> {
        Self::connect_with(&Config::new(uri)).await
    }

    pub async fn connect_with(config: &Config) -> Result<Self> {
        config.validate()?;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
            .map_err(Error::Connect)?;

        info!(
            "postgres pool ready (max_connections = {})",
            config.max_connections
        );
        Ok(Self::from_pool(pool, config.retry))
    }

    pub fn from_pool(pool: PgPool, policy: RetryPolicy) -> Self {
        Self { pool, policy }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

impl Connection for PostgresConnection {
    async fn query(&self, stmt: &str, args: PgArguments) -> Result<Vec<PgRow>> {
        conn::fetch_all(&self.pool, stmt, args).await
    }

    async fn query_row(&self, stmt: &str, args: PgArguments) -> Result<Option<PgRow>> {
        conn::fetch_optional(&self.pool, stmt, args).await
    }

    async fn exec(&self, stmt: &str, args: PgArguments) -> Result<PgQueryResult> {
        conn::execute(&self.pool, stmt, args).await
    }

    async fn exec_tx<T, F>(&self, callback: F) -> Result<T>
    where
        T: Send + 'static,
        F: for<'c> FnMut(&'c mut Transaction) -> BoxFuture<'c, Result<T>> + Send,
    {
        engine::run(&self.pool, &self.policy, classify::is_retryable, callback).await
    }
}
