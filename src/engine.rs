//! Manually driven retry loop.
//!
//! Every attempt is a fresh transaction from the pool. The first statement
//! of each attempt pins the isolation level to SERIALIZABLE, even where that
//! is already the server default, so the behavior doesn't depend on how the
//! server is configured.
//!
//! ```text
//! Beginning ──> Executing ──> Committing ──> Done(Ok)
//!     ^             │              │
//!     │             v              v
//!     └─ retry ── RollingBack <────┘ ──> Done(Err)
//! ```

use std::any::Any;
use std::error::Error as StdError;
use std::panic::{self, AssertUnwindSafe};

use futures::FutureExt;
use futures::future::BoxFuture;
use log::{debug, trace};
use tokio::time::Instant;

use crate::classify;
use crate::config::RetryPolicy;
use crate::conn::{TxControl, TxSource, rollback_quietly};
use crate::error::{Error, Result};

pub const SET_SERIALIZABLE: &str = "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE";

/// What a single invocation of a transaction callback produced.
pub(crate) enum Outcome<T> {
    Success(T),
    Failure(Error),
    Panic(Box<dyn Any + Send>),
}

impl<T> Outcome<T> {
    /// Collapse into a plain result, reporting a panic as [`Error::Panicked`].
    pub(crate) fn into_result(self) -> Result<T> {
        match self {
            Outcome::Success(value) => Ok(value),
            Outcome::Failure(err) => Err(err),
            Outcome::Panic(payload) => Err(Error::panicked(payload)),
        }
    }
}

/// Call `callback` to build its future, catching a panic raised before the
/// future exists.
pub(crate) fn start<'c, Tx, T, F>(
    callback: &mut F,
    tx: &'c mut Tx,
) -> std::result::Result<BoxFuture<'c, Result<T>>, Box<dyn Any + Send>>
where
    F: for<'x> FnMut(&'x mut Tx) -> BoxFuture<'x, Result<T>>,
{
    panic::catch_unwind(AssertUnwindSafe(move || {
        let tx = tx;
        callback(tx)
    }))
}

/// Drive a callback's future to completion, catching a panic raised while
/// it is polled.
pub(crate) async fn settle<T>(fut: BoxFuture<'_, Result<T>>) -> Outcome<T> {
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(value)) => Outcome::Success(value),
        Ok(Err(err)) => Outcome::Failure(err),
        Err(payload) => Outcome::Panic(payload),
    }
}

/// Invoke `callback`, catching a panic raised either while it builds its
/// future or while that future runs.
pub(crate) async fn invoke<Tx, T, F>(callback: &mut F, tx: &mut Tx) -> Outcome<T>
where
    F: for<'c> FnMut(&'c mut Tx) -> BoxFuture<'c, Result<T>>,
{
    match start(callback, tx) {
        Ok(fut) => settle(fut).await,
        Err(payload) => Outcome::Panic(payload),
    }
}

/// Attempt counter step. Unbounded policies can retry past `u32::MAX`.
pub(crate) fn next_attempt(attempts: u32) -> u32 {
    attempts.saturating_add(1)
}

enum State<Tx, T> {
    Beginning,
    Executing(Tx),
    Committing(Tx, T),
    /// `tx` is gone when the failure came from commit, which consumes it.
    RollingBack(Option<Tx>, Error),
    Done(Result<T>),
}

/// Run `callback` in serializable transactions from `source` until one
/// commits or fails with an error `retryable` rejects.
///
/// If the callback panics, the attempt is rolled back and the panic resumes
/// in the caller.
pub async fn run<S, T, F>(
    source: &S,
    policy: &RetryPolicy,
    retryable: fn(&(dyn StdError + 'static)) -> bool,
    mut callback: F,
) -> Result<T>
where
    S: TxSource,
    T: Send,
    F: for<'c> FnMut(&'c mut S::Tx) -> BoxFuture<'c, Result<T>> + Send,
{
    let started = Instant::now();
    let mut attempts: u32 = 0;
    let mut state = State::Beginning;

    loop {
        state = match state {
            State::Beginning => {
                attempts = next_attempt(attempts);
                trace!("starting transaction attempt {}", attempts);
                let mut tx = source.begin().await?;
                match tx.execute(SET_SERIALIZABLE).await {
                    Ok(()) => State::Executing(tx),
                    Err(err) => {
                        rollback_quietly(tx).await;
                        State::Done(Err(err))
                    }
                }
            }

            State::Executing(mut tx) => {
                let outcome = invoke(&mut callback, &mut tx).await;
                match outcome {
                    Outcome::Success(value) => State::Committing(tx, value),
                    Outcome::Failure(err) => State::RollingBack(Some(tx), err),
                    Outcome::Panic(payload) => {
                        rollback_quietly(tx).await;
                        panic::resume_unwind(payload);
                    }
                }
            }

            State::Committing(tx, value) => match tx.commit().await {
                Ok(()) => State::Done(Ok(value)),
                Err(err) => State::RollingBack(None, err),
            },

            State::RollingBack(tx, err) => {
                if let Some(tx) = tx {
                    rollback_quietly(tx).await;
                }

                if !retryable(&err) {
                    State::Done(Err(err))
                } else if !policy.allows_retry(attempts, started.elapsed()) {
                    State::Done(Err(Error::RetryLimit {
                        attempts,
                        elapsed: started.elapsed(),
                        source: Box::new(err),
                    }))
                } else {
                    debug!(
                        "retrying transaction after attempt {} failed with SQLSTATE {}",
                        attempts,
                        classify::error_code(&err).unwrap_or_default()
                    );
                    State::Beginning
                }
            }

            State::Done(result) => return result,
        };
    }
}
