//! Connection and transaction handles
//!
//! [`Connection`] is the contract both variants satisfy: single statements
//! straight against the pool, plus `exec_tx` for a retried serializable
//! transaction. Callers should be written against the trait:
//!
//! ```ignore
//! use sqltx::{Connection, Result};
//!
//! async fn transfer<C: Connection>(conn: &C, from: i64, to: i64, amount: i64) -> Result<()> {
//!     conn.exec_tx(|tx| {
//!         Box::pin(async move {
//!             sqlx::query("UPDATE accounts SET balance = balance - $1 WHERE id = $2")
//!                 .bind(amount)
//!                 .bind(from)
//!                 .execute(tx.as_executor())
//!                 .await?;
//!             sqlx::query("UPDATE accounts SET balance = balance + $1 WHERE id = $2")
//!                 .bind(amount)
//!                 .bind(to)
//!                 .execute(tx.as_executor())
//!                 .await?;
//!             Ok(())
//!         })
//!     })
//!     .await
//! }
//! ```
//!
//! The callback may run more than once, each time against a fresh
//! [`Transaction`], so it must not have effects outside the database that
//! cannot be repeated.
//!
//! The retry engines don't talk to `PgPool` directly. They go through
//! [`TxSource`] and [`TxControl`], which is what lets the tests drive them
//! with a scripted backend.

use std::future::Future;

use futures::future::BoxFuture;
use log::debug;
use sqlx::postgres::{PgArguments, PgQueryResult, PgRow};
use sqlx::{PgConnection, PgPool, Postgres};

use crate::error::Result;

/// Something that can open a transaction attempt.
pub trait TxSource: Send + Sync {
    type Tx: TxControl;

    fn begin(&self) -> impl Future<Output = Result<Self::Tx>> + Send;
}

/// Control operations on one open transaction attempt.
pub trait TxControl: Send + Sized {
    /// Run a statement without arguments, discarding any rows.
    fn execute(&mut self, sql: &str) -> impl Future<Output = Result<()>> + Send;

    fn commit(self) -> impl Future<Output = Result<()>> + Send;

    fn rollback(self) -> impl Future<Output = Result<()>> + Send;
}

/// Roll back an abandoned attempt. A failure here only means the server
/// already discarded the transaction, so it is logged and dropped.
pub(crate) async fn rollback_quietly<Tx: TxControl>(tx: Tx) {
    if let Err(err) = tx.rollback().await {
        debug!("ignoring rollback failure: {}", err);
    }
}

/// One attempt of a logical transaction.
///
/// Handed to transaction callbacks by `&mut`, so it can't outlive the
/// invocation it was given to.
pub struct Transaction {
    inner: sqlx::Transaction<'static, Postgres>,
}

impl Transaction {
    /// Rows returned by `stmt`.
    pub async fn query(&mut self, stmt: &str, args: PgArguments) -> Result<Vec<PgRow>> {
        Ok(sqlx::query_with(stmt, args)
            .fetch_all(&mut *self.inner)
            .await?)
    }

    /// First row returned by `stmt`, if there is one.
    pub async fn query_row(&mut self, stmt: &str, args: PgArguments) -> Result<Option<PgRow>> {
        Ok(sqlx::query_with(stmt, args)
            .fetch_optional(&mut *self.inner)
            .await?)
    }

    pub async fn exec(&mut self, stmt: &str, args: PgArguments) -> Result<PgQueryResult> {
        Ok(sqlx::query_with(stmt, args)
            .execute(&mut *self.inner)
            .await?)
    }

    /// The underlying connection, for use with any `sqlx` query.
    pub fn as_executor(&mut self) -> &mut PgConnection {
        &mut self.inner
    }
}

impl TxSource for PgPool {
    type Tx = Transaction;

    async fn begin(&self) -> Result<Transaction> {
        let inner = sqlx::Pool::begin(self).await?;
        Ok(Transaction { inner })
    }
}

impl TxControl for Transaction {
    async fn execute(&mut self, sql: &str) -> Result<()> {
        sqlx::query(sql).execute(&mut *self.inner).await?;
        Ok(())
    }

    async fn commit(self) -> Result<()> {
        Ok(self.inner.commit().await?)
    }

    async fn rollback(self) -> Result<()> {
        Ok(self.inner.rollback().await?)
    }
}

/// A database handle that can run statements and retried transactions.
pub trait Connection: Send + Sync {
    /// Rows returned by `stmt`. Not retried.
    fn query(&self, stmt: &str, args: PgArguments)
    -> impl Future<Output = Result<Vec<PgRow>>> + Send;

    /// First row returned by `stmt`, if there is one. Not retried.
    fn query_row(
        &self,
        stmt: &str,
        args: PgArguments,
    ) -> impl Future<Output = Result<Option<PgRow>>> + Send;

    /// Execute `stmt` for its effect. Not retried.
    fn exec(&self, stmt: &str, args: PgArguments)
    -> impl Future<Output = Result<PgQueryResult>> + Send;

    /// Run `callback` inside a serializable transaction, retrying it on
    /// serialization conflicts. Returns the callback's value once the
    /// transaction has committed, or the error that ended it.
    fn exec_tx<T, F>(&self, callback: F) -> impl Future<Output = Result<T>> + Send
    where
        T: Send + 'static,
        F: for<'c> FnMut(&'c mut Transaction) -> BoxFuture<'c, Result<T>> + Send;
}

pub(crate) async fn fetch_all(pool: &PgPool, stmt: &str, args: PgArguments) -> Result<Vec<PgRow>> {
    Ok(sqlx::query_with(stmt, args).fetch_all(pool).await?)
}

pub(crate) async fn fetch_optional(
    pool: &PgPool,
    stmt: &str,
    args: PgArguments,
) -> Result<Option<PgRow>> {
    Ok(sqlx::query_with(stmt, args).fetch_optional(pool).await?)
}

pub(crate) async fn execute(pool: &PgPool, stmt: &str, args: PgArguments) -> Result<PgQueryResult> {
    Ok(sqlx::query_with(stmt, args).execute(pool).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::error::Error;
    use crate::{CockroachConnection, PostgresConnection};
    use std::time::Duration;
    use sqlx::Arguments;
    use sqlx::postgres::PgPoolOptions;

    async fn debit<C: Connection>(conn: &C, id: i64, amount: i64) -> Result<u64> {
        conn.exec_tx(|tx| {
            Box::pin(async move {
                let mut args = PgArguments::default();
                args.add(amount).map_err(sqlx::Error::Encode)?;
                args.add(id).map_err(sqlx::Error::Encode)?;
                let done = tx
                    .exec(
                        "UPDATE accounts SET balance = balance - $1 WHERE id = $2",
                        args,
                    )
                    .await?;
                Ok(done.rows_affected())
            })
        })
        .await
    }

    fn id_arg(id: i64) -> PgArguments {
        let mut args = PgArguments::default();
        args.add(id).unwrap();
        args
    }

    async fn audit<C: Connection>(conn: &C, id: i64) -> Result<Option<PgRow>> {
        conn.exec("INSERT INTO audit (account) VALUES ($1)", id_arg(id)).await?;
        conn.query("SELECT * FROM audit WHERE account = $1", id_arg(id)).await?;
        conn.query_row("SELECT balance FROM accounts WHERE id = $1", id_arg(id))
            .await
    }

    async fn snapshot<C: Connection>(conn: &C, id: i64) -> Result<usize> {
        conn.exec_tx(|tx| {
            Box::pin(async move {
                tx.exec("UPDATE accounts SET seen = now() WHERE id = $1", id_arg(id))
                    .await?;
                let row = tx
                    .query_row("SELECT balance FROM accounts WHERE id = $1", id_arg(id))
                    .await?;
                let history = tx
                    .query("SELECT * FROM audit WHERE account = $1", id_arg(id))
                    .await?;
                Ok(history.len() + usize::from(row.is_some()))
            })
        })
        .await
    }

    fn assert_send<T: Send>(_: T) {}

    fn unreachable_pool() -> PgPool {
        PgPoolOptions::new()
            .acquire_timeout(Duration::from_millis(300))
            .connect_lazy("postgres://postgres@127.0.0.1:1/postgres")
            .unwrap()
    }

    #[tokio::test]
    async fn generic_callers_get_send_futures() {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://postgres@localhost/postgres")
            .unwrap();
        let pg = PostgresConnection::from_pool(pool.clone(), RetryPolicy::default());
        let crdb = CockroachConnection::from_pool(pool, RetryPolicy::default());

        // never polled, nothing reaches the network
        assert_send(debit(&pg, 1, 10));
        assert_send(debit(&crdb, 1, 10));
    }

    #[tokio::test]
    async fn statement_paths_are_send() {
        let pool = unreachable_pool();
        let pg = PostgresConnection::from_pool(pool.clone(), RetryPolicy::default());
        let crdb = CockroachConnection::from_pool(pool, RetryPolicy::default());

        assert_send(audit(&pg, 1));
        assert_send(audit(&crdb, 1));
        assert_send(snapshot(&pg, 1));
        assert_send(snapshot(&crdb, 1));
    }

    #[tokio::test]
    async fn statements_surface_pool_errors() {
        let conn = PostgresConnection::from_pool(unreachable_pool(), RetryPolicy::default());

        let err = audit(&conn, 1).await.unwrap_err();
        assert!(matches!(err, Error::Database(_)));

        let err = snapshot(&conn, 1).await.unwrap_err();
        assert!(matches!(err, Error::Database(_)));
    }
}
