#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rusqlite::InterruptHandle;

use super::super::StoreError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Status {
    Running,
    Cancelled,
    TimedOut,
}

struct Entry {
    status: Status,
    /// Interrupt handle and deadline of the attempt currently on a connection.
    attempt: Option<(InterruptHandle, Instant)>,
}

/// Executions that currently hold a query id.
#[derive(Default)]
pub(crate) struct InFlight {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InFlight {
    /// A query id names at most one live execution.
    pub(crate) fn register(&self, query_id: &str) -> Result<Ticket<'_>, StoreError> {
        let mut entries = self.entries.lock();
        if entries.contains_key(query_id) {
            tracing::warn!(query_id, "query id already in flight");
            return Err(StoreError::InvalidInput("query id is already in flight"));
        }
        entries.insert(
            query_id.to_string(),
            Entry {
                status: Status::Running,
                attempt: None,
            },
        );
        Ok(Ticket {
            registry: self,
            query_id: query_id.to_string(),
        })
    }

    /// Only attempts that are on a connection can be cancelled.
    pub(crate) fn cancel(&self, query_id: &str) -> bool {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(query_id) else {
            return false;
        };
        if entry.status == Status::Cancelled {
            return false;
        }
        entry.status = Status::Cancelled;
        if let Some((handle, _)) = &entry.attempt {
            handle.interrupt();
        }
        tracing::info!(query_id, "query cancelled");
        true
    }

    pub(crate) fn is_attempting(&self, query_id: &str) -> bool {
        self.entries
            .lock()
            .get(query_id)
            .is_some_and(|e| e.attempt.is_some())
    }

    /// Interrupts attempts past their deadline. Cancelled attempts are
    /// interrupted again in case the first interrupt arrived before the
    /// statement started.
    fn sweep(&self, now: Instant) {
        let mut entries = self.entries.lock();
        for (query_id, entry) in entries.iter_mut() {
            let Some((handle, deadline)) = &entry.attempt else {
                continue;
            };
            match entry.status {
                Status::Running if *deadline <= now => {
                    entry.status = Status::TimedOut;
                    tracing::warn!(query_id = %query_id, "statement timeout, interrupting attempt");
                    handle.interrupt();
                }
                Status::Cancelled | Status::TimedOut => handle.interrupt(),
                Status::Running => {}
            }
        }
    }
}

/// Registration of one execution; removed on drop.
pub(crate) struct Ticket<'a> {
    registry: &'a InFlight,
    query_id: String,
}

impl Ticket<'_> {
    pub(crate) fn arm(&self, handle: InterruptHandle, deadline: Instant) {
        if let Some(entry) = self.registry.entries.lock().get_mut(&self.query_id) {
            if entry.status == Status::TimedOut {
                entry.status = Status::Running;
            }
            entry.attempt = Some((handle, deadline));
        }
    }

    pub(crate) fn disarm(&self) {
        if let Some(entry) = self.registry.entries.lock().get_mut(&self.query_id) {
            entry.attempt = None;
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.registry
            .entries
            .lock()
            .get(&self.query_id)
            .is_some_and(|e| e.status == Status::Cancelled)
    }
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        self.registry.entries.lock().remove(&self.query_id);
    }
}

/// Background thread that enforces attempt deadlines.
pub(crate) struct Watchdog {
    shutdown: Arc<(Mutex<bool>, Condvar)>,
    thread: Option<JoinHandle<()>>,
}

impl Watchdog {
    pub(crate) fn spawn(inflight: Arc<InFlight>, tick: Duration) -> std::io::Result<Self> {
        let shutdown = Arc::new((Mutex::new(false), Condvar::new()));
        let signal = Arc::clone(&shutdown);
        let thread = std::thread::Builder::new()
            .name("sv-watchdog".to_string())
            .spawn(move || {
                let (stop, wake) = &*signal;
                let mut stopped = stop.lock();
                while !*stopped {
                    wake.wait_for(&mut stopped, tick);
                    if *stopped {
                        break;
                    }
                    inflight.sweep(Instant::now());
                }
            })?;
        Ok(Self {
            shutdown,
            thread: Some(thread),
        })
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        let (stop, wake) = &*self.shutdown;
        *stop.lock() = true;
        wake.notify_all();
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            tracing::warn!("watchdog thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_query_ids_cannot_be_reused() {
        let inflight = InFlight::default();
        let first = inflight.register("q-1").expect("first registration");

        match inflight.register("q-1") {
            Err(StoreError::InvalidInput(message)) => {
                assert_eq!(message, "query id is already in flight");
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("duplicate query id must be rejected"),
        }
        assert!(!first.is_cancelled());
        assert!(inflight.cancel("q-1"));
        assert!(first.is_cancelled());

        drop(first);
        let again = inflight.register("q-1").expect("id is free after drop");
        assert!(!again.is_cancelled());
    }
}
