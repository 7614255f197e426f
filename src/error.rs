//! Error type shared by both connection variants.
//!
//! Everything the crate returns is an [`Error`]. Errors produced inside a
//! transaction callback travel back to the caller of `exec_tx` as the same
//! value, so callers can match on them exactly as they were raised.

use std::any::Any;
use std::error::Error as StdError;
use std::time::Duration;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// Opening the pool failed: malformed URI or failed handshake.
    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// Domain error returned by a transaction callback.
    #[error(transparent)]
    Callback(#[from] anyhow::Error),

    #[error("panicked during transaction: {0}")]
    Panicked(String),

    #[error("transaction still conflicting after {attempts} attempts ({elapsed:?})")]
    RetryLimit {
        attempts: u32,
        elapsed: Duration,
        #[source]
        source: Box<Error>,
    },

    /// RELEASE of the restart savepoint failed, so whether the transaction
    /// committed is unknown.
    #[error("transaction commit result is ambiguous: {0}")]
    AmbiguousCommit(#[source] Box<Error>),

    /// Rolling back to the restart savepoint failed after `original`.
    #[error("restarting transaction failed: {restart}; original error: {original}")]
    TxnRestart {
        restart: Box<Error>,
        #[source]
        original: Box<Error>,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Wrap a domain error so it can be returned from a transaction callback.
    pub fn callback<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Error::Callback(anyhow::Error::new(err))
    }

    pub(crate) fn panicked(payload: Box<dyn Any + Send>) -> Self {
        Error::Panicked(panic_message(payload.as_ref()))
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
