#![forbid(unsafe_code)]

use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rusqlite::{Connection, OpenFlags};

use super::super::StoreError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Route {
    Writer,
    Reader,
}

/// Opens backend connections for a pool.
pub trait ConnectionSource: Send + Sync {
    fn connect(&self, route: Route) -> Result<Connection, StoreError>;
}

/// SQLite database file in WAL mode; readers open it read-only.
#[derive(Debug)]
pub struct FileSource {
    path: PathBuf,
    busy_timeout: Duration,
}

impl FileSource {
    pub fn new(path: impl AsRef<Path>, busy_timeout: Duration) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            busy_timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConnectionSource for FileSource {
    fn connect(&self, route: Route) -> Result<Connection, StoreError> {
        let conn = match route {
            Route::Writer => {
                let conn = Connection::open(&self.path)?;
                conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get::<_, String>(0))?;
                conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA synchronous = NORMAL;")?;
                conn
            }
            Route::Reader => Connection::open_with_flags(
                &self.path,
                OpenFlags::SQLITE_OPEN_READ_ONLY
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX
                    | OpenFlags::SQLITE_OPEN_URI,
            )?,
        };
        conn.busy_timeout(self.busy_timeout)?;
        tracing::debug!(path = %self.path.display(), ?route, "opened connection");
        Ok(conn)
    }
}

struct PoolState {
    idle: Vec<Connection>,
    open: usize,
}

/// Bounded set of connections for one route. Checkout blocks up to a deadline.
pub struct ConnectionPool {
    source: Arc<dyn ConnectionSource>,
    route: Route,
    capacity: usize,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ConnectionPool")
            .field("route", &self.route)
            .field("capacity", &self.capacity)
            .field("open", &state.open)
            .field("idle", &state.idle.len())
            .finish()
    }
}

impl ConnectionPool {
    pub fn new(source: Arc<dyn ConnectionSource>, route: Route, capacity: usize) -> Self {
        Self {
            source,
            route,
            capacity: capacity.max(1),
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                open: 0,
            }),
            available: Condvar::new(),
        }
    }

    pub fn route(&self) -> Route {
        self.route
    }

    pub fn checkout(&self, deadline: Instant) -> Result<PooledConnection<'_>, StoreError> {
        let mut state = self.state.lock();
        loop {
            if let Some(conn) = state.idle.pop() {
                return Ok(PooledConnection::new(self, conn));
            }
            if state.open < self.capacity {
                state.open += 1;
                drop(state);
                return match self.source.connect(self.route) {
                    Ok(conn) => Ok(PooledConnection::new(self, conn)),
                    Err(err) => {
                        self.release_slot();
                        Err(err)
                    }
                };
            }
            if self.available.wait_until(&mut state, deadline).timed_out() {
                tracing::warn!(route = ?self.route, capacity = self.capacity, "pool checkout timed out");
                return Err(StoreError::PoolTimeout);
            }
        }
    }

    fn release_slot(&self) {
        let mut state = self.state.lock();
        state.open = state.open.saturating_sub(1);
        drop(state);
        self.available.notify_one();
    }

    fn give_back(&self, conn: Connection) {
        self.state.lock().idle.push(conn);
        self.available.notify_one();
    }
}

/// Returned to its pool on drop unless discarded.
pub struct PooledConnection<'a> {
    pool: &'a ConnectionPool,
    conn: Option<Connection>,
    discard: bool,
}

impl<'a> PooledConnection<'a> {
    fn new(pool: &'a ConnectionPool, conn: Connection) -> Self {
        Self {
            pool,
            conn: Some(conn),
            discard: false,
        }
    }

    /// Close instead of reusing, e.g. after a connection-level failure.
    pub fn discard(&mut self) {
        self.discard = true;
    }
}

impl Deref for PooledConnection<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl DerefMut for PooledConnection<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        match &mut self.conn {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if self.discard || !conn.is_autocommit() {
            drop(conn);
            self.pool.release_slot();
        } else {
            self.pool.give_back(conn);
        }
    }
}
