//! CockroachDB client-side transaction retries.
//!
//! CockroachDB asks clients to retry a conflicting transaction inside the
//! same physical transaction, rewinding to a special savepoint instead of
//! starting over:
//!
//! ```text
//! BEGIN
//! SAVEPOINT cockroach_restart
//!   ... statements ...
//!   on 40001 / CR000: ROLLBACK TO SAVEPOINT cockroach_restart, run again
//! RELEASE SAVEPOINT cockroach_restart   -- this is the real commit
//! COMMIT
//! ```
//!
//! Keeping the transaction open across retries lets the server keep the
//! priority it accumulated, so a transaction that lost once is less likely
//! to lose again.

use futures::future::BoxFuture;
use log::debug;
use tokio::time::Instant;

use crate::classify::{self, is_retryable_crdb};
use crate::config::RetryPolicy;
use crate::conn::{TxControl, TxSource, rollback_quietly};
use crate::engine;
use crate::error::{Error, Result};

pub const RESTART_SAVEPOINT: &str = "SAVEPOINT cockroach_restart";
pub const RELEASE_SAVEPOINT: &str = "RELEASE SAVEPOINT cockroach_restart";
pub const ROLLBACK_TO_SAVEPOINT: &str = "ROLLBACK TO SAVEPOINT cockroach_restart";

/// Run `callback` in a transaction from `source`, retrying it with the
/// restart savepoint until it commits, fails with a non-retryable error, or
/// `policy` gives up.
///
/// The callback's errors are returned as they are, except that a
/// non-retryable failure of the final RELEASE is reported as
/// [`Error::AmbiguousCommit`].
pub async fn execute_tx<S, T, F>(source: &S, policy: &RetryPolicy, mut callback: F) -> Result<T>
where
    S: TxSource,
    T: Send,
    F: for<'c> FnMut(&'c mut S::Tx) -> BoxFuture<'c, Result<T>> + Send,
{
    let mut tx = source.begin().await?;

    match execute_in_tx(&mut tx, policy, &mut callback).await {
        Ok(value) => {
            // RELEASE already made the writes durable
            if let Err(err) = tx.commit().await {
                debug!("ignoring commit failure after savepoint release: {}", err);
            }
            Ok(value)
        }
        Err(err) => {
            rollback_quietly(tx).await;
            Err(err)
        }
    }
}

/// The retry loop proper, against a transaction that is already open.
pub async fn execute_in_tx<Tx, T, F>(tx: &mut Tx, policy: &RetryPolicy, callback: &mut F) -> Result<T>
where
    Tx: TxControl,
    T: Send,
    F: for<'c> FnMut(&'c mut Tx) -> BoxFuture<'c, Result<T>> + Send,
{
    tx.execute(RESTART_SAVEPOINT).await?;

    let started = Instant::now();
    let mut attempts: u32 = 0;

    loop {
        attempts = engine::next_attempt(attempts);
        let mut released = false;

        let result = callback(&mut *tx).await;
        let err = match result {
            Ok(value) => {
                released = true;
                match tx.execute(RELEASE_SAVEPOINT).await {
                    Ok(()) => return Ok(value),
                    Err(err) => err,
                }
            }
            Err(err) => err,
        };

        if !is_retryable_crdb(&err) {
            if released {
                return Err(Error::AmbiguousCommit(Box::new(err)));
            }
            return Err(err);
        }

        if !policy.allows_retry(attempts, started.elapsed()) {
            return Err(Error::RetryLimit {
                attempts,
                elapsed: started.elapsed(),
                source: Box::new(err),
            });
        }

        if let Err(restart) = tx.execute(ROLLBACK_TO_SAVEPOINT).await {
            return Err(Error::TxnRestart {
                restart: Box::new(restart),
                original: Box::new(err),
            });
        }

        debug!(
            "restarting transaction after attempt {} failed with SQLSTATE {}",
            attempts,
            classify::error_code(&err).unwrap_or_default()
        );
    }
}
