//! Scripted stand-ins for the pool and the driver, used by unit tests.

use std::borrow::Cow;
use std::collections::{HashMap, VecDeque};
use std::error::Error as StdError;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use sqlx::error::{DatabaseError, ErrorKind};

use crate::conn::{TxControl, TxSource};
use crate::error::{Error, Result};

/// A driver error carrying an arbitrary SQLSTATE.
#[derive(Debug)]
pub struct FakeDbError {
    code: String,
}

impl fmt::Display for FakeDbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fake database error (SQLSTATE {})", self.code)
    }
}

impl StdError for FakeDbError {}

impl DatabaseError for FakeDbError {
    fn message(&self) -> &str {
        "fake database error"
    }

    fn code(&self) -> Option<Cow<'_, str>> {
        Some(Cow::Borrowed(self.code.as_str()))
    }

    fn as_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
        self
    }

    fn as_error_mut(&mut self) -> &mut (dyn StdError + Send + Sync + 'static) {
        self
    }

    fn into_error(self: Box<Self>) -> Box<dyn StdError + Send + Sync + 'static> {
        self
    }

    fn kind(&self) -> ErrorKind {
        ErrorKind::Other
    }
}

/// The error a statement failing with `code` would surface as.
pub fn db_error(code: &str) -> Error {
    Error::Database(sqlx::Error::Database(Box::new(FakeDbError {
        code: code.to_string(),
    })))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Begin,
    Execute(String),
    Commit,
    Rollback,
}

#[derive(Debug, Default)]
struct Script {
    events: Vec<Event>,
    begins_allowed: Option<usize>,
    commit_failures: VecDeque<String>,
    statement_failures: HashMap<String, VecDeque<String>>,
    rollback_fails: bool,
}

/// A pool whose transactions record what they were asked to do.
#[derive(Debug, Clone, Default)]
pub struct FakeBackend {
    script: Arc<Mutex<Script>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }

    /// Only the first `n` begins succeed; later ones fail to connect.
    pub fn allow_begins(self, n: usize) -> Self {
        self.script().begins_allowed = Some(n);
        self
    }

    /// The next commits fail with these codes, one per commit.
    pub fn fail_commits(self, codes: &[&str]) -> Self {
        self.script()
            .commit_failures
            .extend(codes.iter().map(|c| c.to_string()));
        self
    }

    /// The next executions of `sql` fail with these codes, one per execution.
    pub fn fail_statement(self, sql: &str, codes: &[&str]) -> Self {
        self.script()
            .statement_failures
            .entry(sql.to_string())
            .or_default()
            .extend(codes.iter().map(|c| c.to_string()));
        self
    }

    pub fn fail_rollbacks(self) -> Self {
        self.script().rollback_fails = true;
        self
    }

    pub fn events(&self) -> Vec<Event> {
        self.script().events.clone()
    }

    pub fn count(&self, event: &Event) -> usize {
        self.script().events.iter().filter(|e| *e == event).count()
    }

    pub fn executed(&self, sql: &str) -> usize {
        self.count(&Event::Execute(sql.to_string()))
    }
}

impl TxSource for FakeBackend {
    type Tx = FakeTx;

    async fn begin(&self) -> Result<FakeTx> {
        let mut script = self.script();
        let begun = script.events.iter().filter(|e| **e == Event::Begin).count();
        if script.begins_allowed.is_some_and(|n| begun >= n) {
            return Err(Error::Database(sqlx::Error::PoolTimedOut));
        }
        script.events.push(Event::Begin);
        Ok(FakeTx {
            script: Arc::clone(&self.script),
        })
    }
}

#[derive(Debug)]
pub struct FakeTx {
    script: Arc<Mutex<Script>>,
}

impl FakeTx {
    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }
}

impl TxControl for FakeTx {
    async fn execute(&mut self, sql: &str) -> Result<()> {
        let mut script = self.script();
        script.events.push(Event::Execute(sql.to_string()));
        match script
            .statement_failures
            .get_mut(sql)
            .and_then(|codes| codes.pop_front())
        {
            Some(code) => Err(db_error(&code)),
            None => Ok(()),
        }
    }

    async fn commit(self) -> Result<()> {
        let mut script = self.script();
        script.events.push(Event::Commit);
        match script.commit_failures.pop_front() {
            Some(code) => Err(db_error(&code)),
            None => Ok(()),
        }
    }

    async fn rollback(self) -> Result<()> {
        let mut script = self.script();
        script.events.push(Event::Rollback);
        if script.rollback_fails {
            return Err(Error::Database(sqlx::Error::PoolClosed));
        }
        Ok(())
    }
}
