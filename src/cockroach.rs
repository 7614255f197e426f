//! CockroachDB connection: retries are left to the [`crdb`](crate::crdb)
//! savepoint protocol.

use futures::FutureExt;
use futures::future::{self, BoxFuture};
use log::info;
use sqlx::PgPool;
use sqlx::postgres::{PgArguments, PgPoolOptions, PgQueryResult, PgRow};

use crate::config::{Config, RetryPolicy};
use crate::conn::{self, Connection, Transaction, TxSource};
use crate::crdb;
use crate::engine::{self, Outcome};
use crate::error::{Error, Result};

/// Connection to a CockroachDB cluster.
///
/// Conflicts are recognized by SQLSTATE `40001` and the legacy `CR000`. A
/// panic inside a transaction callback does not unwind into the caller: the
/// transaction is rolled back and `exec_tx` returns [`Error::Panicked`].
#[derive(Debug, Clone)]
pub struct CockroachConnection {
    pool: PgPool,
    policy: RetryPolicy,
}

impl CockroachConnection {
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
            "cockroachdb pool ready (max_connections = {})",
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

/// Invoke `callback` on `tx`, turning any panic it raises, while building
/// its future or while that future is polled, into [`Error::Panicked`].
fn recover<'c, Tx, T, F>(callback: &mut F, tx: &'c mut Tx) -> BoxFuture<'c, Result<T>>
where
    T: Send + 'static,
    F: for<'x> FnMut(&'x mut Tx) -> BoxFuture<'x, Result<T>>,
{
    match engine::start(callback, tx) {
        Ok(fut) => engine::settle(fut).map(Outcome::into_result).boxed(),
        Err(payload) => future::ready(Err(Error::panicked(payload))).boxed(),
    }
}

/// [`crdb::execute_tx`] with every callback invocation wrapped in
/// [`recover`].
async fn execute_recovering<S, T, F>(source: &S, policy: &RetryPolicy, mut callback: F) -> Result<T>
where
    S: TxSource,
    T: Send + 'static,
    F: for<'c> FnMut(&'c mut S::Tx) -> BoxFuture<'c, Result<T>> + Send,
{
    crdb::execute_tx(source, policy, move |tx: &mut S::Tx| recover(&mut callback, tx)).await
}

impl Connection for CockroachConnection {
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
        execute_recovering(&self.pool, &self.policy, callback).await
    }
}
