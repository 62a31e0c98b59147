#![forbid(unsafe_code)]

use super::*;
use crate::store::AttemptFailure;
use std::sync::atomic::{AtomicU32, Ordering};

const ENDLESS: &str =
    "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) SELECT max(x) FROM c";

fn busy() -> StoreError {
    StoreError::Sql(rusqlite::Error::SqliteFailure(
        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
        None,
    ))
}

fn test_config() -> StoreConfig {
    StoreConfig {
        max_retries: 2,
        statement_timeout: Duration::from_secs(10),
        watchdog_tick: Duration::from_millis(5),
        ..StoreConfig::default()
    }
}

fn file_executor(dir: &tempfile::TempDir) -> Executor {
    let source = Arc::new(FileSource::new(dir.path().join("exec.db"), Duration::from_millis(20)));
    let executor = Executor::new(source, &test_config()).expect("executor should start");
    executor
        .write(&SqlQuery::new("CREATE TABLE t(id TEXT PRIMARY KEY, n INTEGER)"))
        .expect("table should be created");
    executor
}

struct FlakySource {
    inner: FileSource,
    failures_left: AtomicU32,
    connects: AtomicU32,
}

impl ConnectionSource for FlakySource {
    fn connect(&self, route: Route) -> Result<Connection, StoreError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(StoreError::Sql(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CANTOPEN),
                None,
            )));
        }
        self.inner.connect(route)
    }
}

#[test]
fn always_transient_body_runs_max_retries_plus_one_times_and_commits_nothing() {
    let dir = tempfile::tempdir().expect("temp dir");
    let executor = file_executor(&dir);
    let calls = AtomicU32::new(0);

    let err = executor
        .transaction(ExecOptions::new("test"), |tx| {
            calls.fetch_add(1, Ordering::SeqCst);
            tx.execute("INSERT INTO t(id, n) VALUES ('a', 1)", [])?;
            Err::<(), _>(busy())
        })
        .expect_err("every attempt fails");

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    match err {
        StoreError::FailedAttempt {
            reason,
            attempts,
            last,
        } => {
            assert_eq!(reason, AttemptFailure::TooManyAttempts);
            assert_eq!(attempts, 3);
            assert_eq!(last.and_then(|e| e.sql_state()), Some("57P01"));
        }
        other => panic!("unexpected error: {other}"),
    }

    let rows = executor
        .run(Route::Writer, &SqlQuery::new("SELECT COUNT(*) FROM t"), |row| {
            row.get::<_, i64>(0)
        })
        .expect("count");
    assert_eq!(rows, vec![0]);
}

#[test]
fn non_transient_errors_are_not_retried() {
    let dir = tempfile::tempdir().expect("temp dir");
    let executor = file_executor(&dir);
    let calls = AtomicU32::new(0);

    let err = executor
        .transaction(ExecOptions::new("test"), |tx| {
            calls.fetch_add(1, Ordering::SeqCst);
            tx.execute("INSERT INTO missing_table VALUES (1)", [])?;
            Ok(())
        })
        .expect_err("syntax error");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!err.is_transient());
    assert_eq!(err.code(), "SQL");
}

#[test]
fn connection_failures_are_retried_until_the_source_recovers() {
    let dir = tempfile::tempdir().expect("temp dir");
    let source = Arc::new(FlakySource {
        inner: FileSource::new(dir.path().join("flaky.db"), Duration::from_millis(20)),
        failures_left: AtomicU32::new(2),
        connects: AtomicU32::new(0),
    });
    let executor = Executor::new(source.clone(), &test_config()).expect("executor");

    let affected = executor
        .write(&SqlQuery::new("CREATE TABLE t(id TEXT)"))
        .expect("third attempt connects");
    assert_eq!(affected, 0);
    assert_eq!(source.connects.load(Ordering::SeqCst), 3);

    let broken = Arc::new(FlakySource {
        inner: FileSource::new(dir.path().join("broken.db"), Duration::from_millis(20)),
        failures_left: AtomicU32::new(u32::MAX),
        connects: AtomicU32::new(0),
    });
    let executor = Executor::new(broken.clone(), &test_config()).expect("executor");
    let err = executor
        .write(&SqlQuery::new("SELECT 1"))
        .expect_err("never connects");
    assert_eq!(err.attempts(), Some(3));
    assert_eq!(err.sql_state(), Some("XYZ51"));
    assert_eq!(broken.connects.load(Ordering::SeqCst), 3);
}

#[test]
fn watchdog_interrupts_attempts_past_the_budget() {
    let dir = tempfile::tempdir().expect("temp dir");
    let executor = file_executor(&dir);
    let query = SqlQuery::new(ENDLESS)
        .with_timeout(Duration::from_millis(150))
        .with_max_retries(5);

    let err = executor
        .run(Route::Writer, &query, |row| row.get::<_, i64>(0))
        .expect_err("endless query must be interrupted");
    match err {
        StoreError::FailedAttempt { reason, last, .. } => {
            assert_eq!(reason, AttemptFailure::NoTimeLeft);
            assert_eq!(last.and_then(|e| e.sql_state()), Some("57014"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn cancel_interrupts_a_running_query() {
    let dir = tempfile::tempdir().expect("temp dir");
    let executor = file_executor(&dir);
    assert!(!executor.cancel("nobody"));

    std::thread::scope(|scope| {
        let running = scope.spawn(|| {
            let query = SqlQuery::new(ENDLESS).with_query_id("q-cancel");
            executor.run(Route::Writer, &query, |row| row.get::<_, i64>(0))
        });
        let started = Instant::now();
        while !executor.is_running("q-cancel") {
            assert!(started.elapsed() < Duration::from_secs(5), "query never started");
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(executor.cancel("q-cancel"));
        let err = running
            .join()
            .expect("thread should not panic")
            .expect_err("cancelled");
        assert!(matches!(&err, StoreError::Cancelled { query_id } if query_id == "q-cancel"));
        assert!(!err.is_transient());
    });
    assert!(!executor.cancel("q-cancel"));
}

#[test]
fn batch_runs_atomically_under_its_lock() {
    let dir = tempfile::tempdir().expect("temp dir");
    let executor = file_executor(&dir);

    let batch = SqlBatch::new()
        .with_lock("t-maintenance")
        .push(SqlQuery::new("INSERT INTO t(id, n) VALUES (#{id}, #{n})").named("id", "a").named("n", 1i64))
        .push(SqlQuery::new("INSERT INTO t(id, n) VALUES (?, ?)").bind("b").bind(2i64));
    assert_eq!(executor.write_batch(&batch).expect("batch"), vec![1, 1]);

    let failing = SqlBatch::new()
        .push(SqlQuery::new("INSERT INTO t(id, n) VALUES ('c', 3)"))
        .push(SqlQuery::new("INSERT INTO t(id, n) VALUES ('a', 4)"));
    assert!(executor.write_batch(&failing).is_err());

    let ids = executor
        .run(Route::Writer, &SqlQuery::new("SELECT id FROM t ORDER BY id"), |row| {
            row.get::<_, String>(0)
        })
        .expect("ids");
    assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);

    let held = executor
        .advisory_lock("t-maintenance", Duration::from_secs(1))
        .expect("lock");
    let blocked = SqlBatch::new()
        .with_lock("t-maintenance")
        .with_timeout(Duration::from_millis(50))
        .push(SqlQuery::new("DELETE FROM t"));
    let err = executor.write_batch(&blocked).expect_err("lock is held");
    assert!(matches!(err, StoreError::LockTimeout { key } if key == held.key()));
}

#[test]
fn mixed_parameters_fail_before_any_attempt() {
    let dir = tempfile::tempdir().expect("temp dir");
    let executor = file_executor(&dir);
    let query = SqlQuery::new("SELECT ? + #{a}").bind(1i64).named("a", 2i64);
    let err = executor
        .run_one(Route::Writer, &query, |row| row.get::<_, i64>(0))
        .expect_err("mixed parameters");
    assert!(matches!(err, StoreError::InvalidStatement(_)));
}

#[test]
fn run_one_returns_none_for_empty_results() {
    let dir = tempfile::tempdir().expect("temp dir");
    let executor = file_executor(&dir);
    let none = executor
        .run_one(
            Route::Reader,
            &SqlQuery::new("SELECT n FROM t WHERE id = #{id}").named("id", "zzz"),
            |row| row.get::<_, i64>(0),
        )
        .expect("read");
    assert_eq!(none, None);
}
