//! Retryability classification.
//!
//! A serialization conflict can reach us buried under any number of
//! wrappers: a `sqlx::Error` around the driver error, a callback's
//! `anyhow` context around that, a [`Error::RetryLimit`] around everything.
//! The functions here walk that chain and look for a SQLSTATE code.
//!
//! Two conventions link an error to the one it wraps: the [`Cause`]
//! capability, implemented by the error types this crate knows how to see
//! through, and the standard `source()`. [`error_cause`] follows whichever
//! one the error at hand provides.

use std::error::Error as StdError;

use sqlx::postgres::PgDatabaseError;

use crate::error::Error;

/// Standard SQLSTATE `serialization_failure`.
pub const SERIALIZATION_FAILURE: &str = "40001";

/// CockroachDB's retry code from before it adopted 40001. Servers no longer
/// send it but older clusters still might.
pub const CRDB_RETRY: &str = "CR000";

/// Longest cause chain we are willing to follow. Also what ends a chain
/// that loops back on itself.
pub const MAX_CAUSE_DEPTH: usize = 64;

/// An error that can name the error it wraps, independent of `source()`.
pub trait Cause {
    fn underlying(&self) -> Option<&(dyn StdError + 'static)>;
}

impl Cause for sqlx::Error {
    fn underlying(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            sqlx::Error::Database(db) => Some(db.as_error()),
            _ => self.source(),
        }
    }
}

impl Cause for Error {
    fn underlying(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Connect(err) | Error::Database(err) => Some(err as &(dyn StdError + 'static)),
            Error::Callback(err) => Some(&**err),
            Error::RetryLimit { source, .. } => Some(&**source),
            Error::AmbiguousCommit(err) => Some(&**err),
            Error::TxnRestart { original, .. } => Some(&**original),
            Error::Panicked(_) | Error::Config(_) => None,
        }
    }
}

fn cause_of<'a>(err: &'a (dyn StdError + 'static)) -> Option<&'a (dyn StdError + 'static)> {
    if let Some(err) = err.downcast_ref::<Error>() {
        err.underlying()
    } else if let Some(err) = err.downcast_ref::<sqlx::Error>() {
        err.underlying()
    } else {
        err.source()
    }
}

/// Iterates an error and everything it wraps, outermost first.
struct Causes<'a> {
    next: Option<&'a (dyn StdError + 'static)>,
    depth: usize,
}

impl<'a> Iterator for Causes<'a> {
    type Item = &'a (dyn StdError + 'static);

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next.take()?;
        self.depth += 1;
        if self.depth < MAX_CAUSE_DEPTH {
            self.next = cause_of(current);
        }
        Some(current)
    }
}

fn causes<'a>(err: &'a (dyn StdError + 'static)) -> Causes<'a> {
    Causes {
        next: Some(err),
        depth: 0,
    }
}

/// Returns the root cause of `err`: the end of its causal chain.
pub fn error_cause<'a>(err: &'a (dyn StdError + 'static)) -> &'a (dyn StdError + 'static) {
    causes(err).last().unwrap_or(err)
}

fn sqlstate(err: &(dyn StdError + 'static)) -> Option<String> {
    if let Some(pg) = err.downcast_ref::<PgDatabaseError>() {
        return Some(pg.code().to_string());
    }

    err.downcast_ref::<sqlx::Error>()
        .and_then(|err| err.as_database_error())
        .and_then(|db| db.code())
        .map(|code| code.into_owned())
}

/// SQLSTATE of the innermost database error in the chain, if any.
pub fn error_code(err: &(dyn StdError + 'static)) -> Option<String> {
    causes(err).filter_map(sqlstate).last()
}

/// PostgreSQL: only `serialization_failure` is worth retrying.
pub fn is_retryable(err: &(dyn StdError + 'static)) -> bool {
    error_code(err).is_some_and(|code| code == SERIALIZATION_FAILURE)
}

/// CockroachDB: `serialization_failure`, plus the legacy `CR000`.
pub fn is_retryable_crdb(err: &(dyn StdError + 'static)) -> bool {
    error_code(err).is_some_and(|code| code == SERIALIZATION_FAILURE || code == CRDB_RETRY)
}
