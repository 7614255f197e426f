//! Serializable transactions that retry themselves on conflict.
//!
//! Under SERIALIZABLE isolation the database may abort a transaction with
//! SQLSTATE `40001` when it conflicts with a concurrent one. The right
//! response is to run the whole transaction again. [`Connection::exec_tx`]
//! does that, against either of two backends:
//!
//! - [`PostgresConnection`] begins a new transaction for every attempt and
//!   drives the loop itself. A panic in the callback rolls back the attempt
//!   and keeps unwinding.
//! - [`CockroachConnection`] hands the callback to CockroachDB's savepoint
//!   restart protocol ([`crdb`]). A panic in the callback is returned as
//!   [`Error::Panicked`].
//!
//! ```ignore
//! let conn = sqltx::PostgresConnection::connect(&std::env::var("DATABASE_URL")?).await?;
//!
//! let balance: i64 = conn
//!     .exec_tx(|tx| {
//!         Box::pin(async move {
//!             let (balance,): (i64,) =
//!                 sqlx::query_as("SELECT balance FROM accounts WHERE id = $1")
//!                     .bind(1_i64)
//!                     .fetch_one(tx.as_executor())
//!                     .await?;
//!             Ok(balance)
//!         })
//!     })
//!     .await?;
//! ```
//!
//! Retries are unbounded by default. Use [`RetryPolicy`] to cap them by
//! attempt count or elapsed time.

pub mod classify;
pub mod cockroach;
pub mod config;
pub mod conn;
pub mod crdb;
pub mod engine;
pub mod error;
pub mod postgres;

#[cfg(test)]
mod testing;

pub use classify::{error_cause, error_code, is_retryable, is_retryable_crdb};
pub use cockroach::CockroachConnection;
pub use config::{Config, RetryPolicy};
pub use conn::{Connection, Transaction, TxControl, TxSource};
pub use error::{Error, Result};
pub use postgres::PostgresConnection;

pub use futures::future::BoxFuture;
pub use sqlx::postgres::{PgArguments, PgQueryResult, PgRow};
