#![forbid(unsafe_code)]

//! Statement execution with retries, time budgets, advisory locks and
//! cancellation on top of pooled SQLite connections.

mod context;
mod inflight;
mod locks;
mod pool;
mod query;

pub use context::ExecutionContext;
pub use locks::{AdvisoryLockGuard, AdvisoryLocks, lock_key};
pub use pool::{ConnectionPool, ConnectionSource, FileSource, PooledConnection, Route};
pub use query::{PreparedSql, SqlBatch, SqlQuery, SqlValue};

use std::sync::Arc;
use std::time::{Duration, Instant};

use rusqlite::{Connection, Row, Transaction, TransactionBehavior, params_from_iter};

use super::{SQL_STATE_CONNECTION_FAILURE, StoreConfig, StoreError};
use inflight::{InFlight, Ticket, Watchdog};

/// Per-call overrides; unset fields fall back to the executor defaults.
#[derive(Clone, Debug, Default)]
pub struct ExecOptions {
    pub label: &'static str,
    pub query_id: Option<String>,
    pub timeout: Option<Duration>,
    pub max_retries: Option<u32>,
    /// Advisory lock held across every attempt.
    pub lock: Option<String>,
}

impl ExecOptions {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            ..Self::default()
        }
    }

    pub fn with_query_id(mut self, query_id: impl Into<String>) -> Self {
        self.query_id = Some(query_id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_lock(mut self, name: impl Into<String>) -> Self {
        self.lock = Some(name.into());
        self
    }

    fn for_query(label: &'static str, query: &SqlQuery) -> Self {
        Self {
            label,
            query_id: query.query_id().map(str::to_string),
            timeout: query.timeout(),
            max_retries: query.max_retries(),
            lock: None,
        }
    }
}

pub struct Executor {
    writers: ConnectionPool,
    readers: ConnectionPool,
    locks: AdvisoryLocks,
    inflight: Arc<InFlight>,
    default_timeout: Duration,
    default_max_retries: u32,
    // Declared last so it stops after the pools are gone.
    _watchdog: Watchdog,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("writers", &self.writers)
            .field("readers", &self.readers)
            .field("default_timeout", &self.default_timeout)
            .field("default_max_retries", &self.default_max_retries)
            .finish_non_exhaustive()
    }
}

impl Executor {
    pub fn new(source: Arc<dyn ConnectionSource>, config: &StoreConfig) -> Result<Self, StoreError> {
        let inflight = Arc::new(InFlight::default());
        let watchdog = Watchdog::spawn(Arc::clone(&inflight), config.watchdog_tick)?;
        Ok(Self {
            writers: ConnectionPool::new(Arc::clone(&source), Route::Writer, config.pool_size),
            readers: ConnectionPool::new(source, Route::Reader, config.reader_pool_size),
            locks: AdvisoryLocks::new(),
            inflight,
            default_timeout: config.statement_timeout,
            default_max_retries: config.max_retries,
            _watchdog: watchdog,
        })
    }

    fn pool(&self, route: Route) -> &ConnectionPool {
        match route {
            Route::Writer => &self.writers,
            Route::Reader => &self.readers,
        }
    }

    /// Rows of a read.
    pub fn run<T, F>(&self, route: Route, query: &SqlQuery, mut map: F) -> Result<Vec<T>, StoreError>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let prepared = query.substitute()?;
        self.execute(route, ExecOptions::for_query("run", query), |conn, query_id| {
            log_statement(query_id, &prepared);
            let mut stmt = conn.prepare_cached(&prepared.text)?;
            let rows = stmt.query_map(params_from_iter(prepared.parameters.iter()), |row| map(row))?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// First row of a read, if any.
    pub fn run_one<T, F>(&self, route: Route, query: &SqlQuery, mut map: F) -> Result<Option<T>, StoreError>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let prepared = query.substitute()?;
        self.execute(route, ExecOptions::for_query("run_one", query), |conn, query_id| {
            log_statement(query_id, &prepared);
            let mut stmt = conn.prepare_cached(&prepared.text)?;
            let mut rows = stmt.query(params_from_iter(prepared.parameters.iter()))?;
            match rows.next()? {
                Some(row) => Ok(Some(map(row)?)),
                None => Ok(None),
            }
        })
    }

    /// Affected row count of a single write.
    pub fn write(&self, query: &SqlQuery) -> Result<usize, StoreError> {
        let prepared = query.substitute()?;
        self.execute(Route::Writer, ExecOptions::for_query("write", query), |conn, query_id| {
            log_statement(query_id, &prepared);
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let affected = {
                let mut stmt = tx.prepare_cached(&prepared.text)?;
                stmt.execute(params_from_iter(prepared.parameters.iter()))?
            };
            tx.commit()?;
            Ok(affected)
        })
    }

    /// All statements in one transaction; any failure rolls back the batch.
    pub fn write_batch(&self, batch: &SqlBatch) -> Result<Vec<usize>, StoreError> {
        let prepared = batch
            .statements()
            .iter()
            .map(SqlQuery::substitute)
            .collect::<Result<Vec<_>, _>>()?;
        let options = ExecOptions {
            label: "write_batch",
            query_id: batch.query_id().map(str::to_string),
            timeout: batch.timeout(),
            max_retries: batch.max_retries(),
            lock: batch.lock().map(str::to_string),
        };
        self.execute(Route::Writer, options, |conn, query_id| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut affected = Vec::with_capacity(prepared.len());
            for statement in &prepared {
                log_statement(query_id, statement);
                let mut stmt = tx.prepare_cached(&statement.text)?;
                affected.push(stmt.execute(params_from_iter(statement.parameters.iter()))?);
            }
            tx.commit()?;
            Ok(affected)
        })
    }

    /// Runs `body` inside one write transaction, retried as a whole on
    /// transient failures. Returning `Err` rolls the attempt back.
    pub fn transaction<T, F>(&self, options: ExecOptions, mut body: F) -> Result<T, StoreError>
    where
        F: FnMut(&Transaction<'_>) -> Result<T, StoreError>,
    {
        self.execute(Route::Writer, options, |conn, _| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let out = body(&tx)?;
            tx.commit()?;
            Ok(out)
        })
    }

    /// Read-only snapshot across several statements.
    pub fn snapshot<T, F>(&self, options: ExecOptions, mut body: F) -> Result<T, StoreError>
    where
        F: FnMut(&Transaction<'_>) -> Result<T, StoreError>,
    {
        self.execute(Route::Reader, options, |conn, _| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
            let out = body(&tx)?;
            tx.finish()?;
            Ok(out)
        })
    }

    /// Interrupts the execution holding `query_id`. Unknown or finished ids
    /// return `false`.
    pub fn cancel(&self, query_id: &str) -> bool {
        self.inflight.cancel(query_id)
    }

    /// True while an attempt of `query_id` is on a connection.
    pub fn is_running(&self, query_id: &str) -> bool {
        self.inflight.is_attempting(query_id)
    }

    pub fn advisory_lock(&self, name: &str, timeout: Duration) -> Result<AdvisoryLockGuard<'_>, StoreError> {
        self.locks.acquire(name, Instant::now() + timeout)
    }

    pub fn locks(&self) -> &AdvisoryLocks {
        &self.locks
    }

    fn execute<T, F>(&self, route: Route, options: ExecOptions, mut attempt: F) -> Result<T, StoreError>
    where
        F: FnMut(&mut Connection, &str) -> Result<T, StoreError>,
    {
        let query_id = options
            .query_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let mut ctx = ExecutionContext::new(
            query_id.clone(),
            options.timeout.unwrap_or(self.default_timeout),
            options.max_retries.unwrap_or(self.default_max_retries),
        );
        let ticket = self.inflight.register(&query_id)?;
        let _lock = match options.lock.as_deref() {
            Some(name) => Some(self.locks.acquire(name, ctx.deadline())?),
            None => None,
        };

        let mut last = None;
        loop {
            if ticket.is_cancelled() {
                return Err(StoreError::Cancelled { query_id });
            }
            let deadline = ctx.begin_attempt(last.take())?;
            let result = self.attempt_once(route, deadline, &ticket, &query_id, &mut attempt);
            match result {
                Ok(value) => {
                    tracing::info!(
                        query_id = %query_id,
                        label = options.label,
                        attempts = ctx.attempts(),
                        elapsed_ms = ctx.elapsed().as_millis() as u64,
                        "query finished"
                    );
                    return Ok(value);
                }
                Err(_) if ticket.is_cancelled() => {
                    return Err(StoreError::Cancelled { query_id });
                }
                Err(err) if err.is_transient() => {
                    tracing::warn!(
                        query_id = %query_id,
                        label = options.label,
                        attempt = ctx.attempts(),
                        sql_state = err.sql_state().unwrap_or_default(),
                        "transient failure, retrying: {err}"
                    );
                    last = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn attempt_once<T, F>(
        &self,
        route: Route,
        deadline: Instant,
        ticket: &Ticket<'_>,
        query_id: &str,
        attempt: &mut F,
    ) -> Result<T, StoreError>
    where
        F: FnMut(&mut Connection, &str) -> Result<T, StoreError>,
    {
        let mut conn = self.pool(route).checkout(deadline)?;
        ticket.arm(conn.get_interrupt_handle(), deadline);
        let result = if ticket.is_cancelled() {
            Err(StoreError::Cancelled {
                query_id: query_id.to_string(),
            })
        } else {
            attempt(&mut conn, query_id)
        };
        ticket.disarm();
        if let Err(err) = &result
            && err.sql_state() == Some(SQL_STATE_CONNECTION_FAILURE)
        {
            conn.discard();
        }
        result
    }
}

fn log_statement(query_id: &str, prepared: &PreparedSql) {
    tracing::debug!(
        query_id,
        sql = %prepared.text,
        params = ?prepared.parameters,
        "statement"
    );
}

#[cfg(test)]
mod tests;
