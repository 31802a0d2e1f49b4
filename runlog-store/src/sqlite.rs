//! SQLite backend.
//!
//! One connection guarded by a mutex, shared by all channel workers.
//! Uncommitted writes accumulate in an open transaction that
//! [`WriteBackend::flush_cache`] commits; the transaction is also committed
//! once `max_cached` writes are pending or an interactive write arrives.

use runlog_common::backend::{BackendResult, CheckpointInfo, MessageRecord, MessageTarget};
use runlog_common::events::{
    InsertCheckpoint, StartLoadQueue, StartRun, StartTestcase, StatisticSample, UpdateRun,
    UpdateTestcase,
};
use runlog_common::{
    BackendError, CheckpointId, CheckpointResult, LoadQueueId, RunId, SuiteId, TestcaseId,
    TestcaseResult, WriteBackend,
};
use rusqlite::{Connection, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_name TEXT NOT NULL,
    os_name TEXT NOT NULL DEFAULT '',
    product_name TEXT NOT NULL DEFAULT '',
    version_name TEXT NOT NULL DEFAULT '',
    build_name TEXT NOT NULL DEFAULT '',
    host_name TEXT NOT NULL DEFAULT '',
    user_note TEXT,
    start_time INTEGER NOT NULL,
    end_time INTEGER
);
CREATE TABLE IF NOT EXISTS run_metainfo (
    run_id INTEGER NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS suites (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id INTEGER NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
    suite_name TEXT NOT NULL,
    package_name TEXT NOT NULL DEFAULT '',
    user_note TEXT,
    start_time INTEGER NOT NULL,
    end_time INTEGER
);
CREATE TABLE IF NOT EXISTS testcases (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    suite_id INTEGER NOT NULL REFERENCES suites(id) ON DELETE CASCADE,
    suite_full_name TEXT NOT NULL,
    scenario_name TEXT NOT NULL,
    scenario_description TEXT NOT NULL DEFAULT '',
    testcase_name TEXT NOT NULL,
    user_note TEXT,
    result INTEGER NOT NULL,
    start_time INTEGER NOT NULL,
    end_time INTEGER
);
CREATE TABLE IF NOT EXISTS scenario_metainfo (
    testcase_id INTEGER NOT NULL REFERENCES testcases(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS testcase_metainfo (
    testcase_id INTEGER NOT NULL REFERENCES testcases(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id INTEGER REFERENCES runs(id) ON DELETE CASCADE,
    suite_id INTEGER REFERENCES suites(id) ON DELETE CASCADE,
    testcase_id INTEGER REFERENCES testcases(id) ON DELETE CASCADE,
    level INTEGER NOT NULL,
    message TEXT NOT NULL,
    escape_html INTEGER NOT NULL,
    machine_name TEXT NOT NULL,
    thread_name TEXT NOT NULL,
    timestamp INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS load_queues (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    testcase_id INTEGER NOT NULL REFERENCES testcases(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    hosts TEXT NOT NULL,
    threading_pattern TEXT NOT NULL,
    number_threads INTEGER NOT NULL,
    machine TEXT NOT NULL,
    result INTEGER NOT NULL,
    start_time INTEGER NOT NULL,
    end_time INTEGER
);
CREATE TABLE IF NOT EXISTS checkpoints (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    load_queue_id INTEGER NOT NULL REFERENCES load_queues(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    thread_name TEXT NOT NULL,
    start_time INTEGER NOT NULL,
    response_time INTEGER,
    transfer_size INTEGER NOT NULL DEFAULT 0,
    transfer_unit TEXT NOT NULL DEFAULT '',
    result INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS statistics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    testcase_id INTEGER NOT NULL REFERENCES testcases(id) ON DELETE CASCADE,
    kind TEXT NOT NULL,
    machine TEXT NOT NULL,
    statistic_ids TEXT NOT NULL,
    statistic_values TEXT NOT NULL,
    timestamp INTEGER NOT NULL
);
"#;

const TABLES: &[&str] = &[
    "runs",
    "run_metainfo",
    "suites",
    "testcases",
    "scenario_metainfo",
    "testcase_metainfo",
    "messages",
    "load_queues",
    "checkpoints",
    "statistics",
];

fn map_err(err: rusqlite::Error) -> BackendError {
    use rusqlite::ErrorCode;
    match err.sqlite_error_code() {
        Some(ErrorCode::ConstraintViolation) => BackendError::Integrity(err.to_string()),
        Some(
            ErrorCode::CannotOpen
            | ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked
            | ErrorCode::SystemIoFailure
            | ErrorCode::NotADatabase,
        ) => BackendError::Connectivity(err.to_string()),
        _ => BackendError::Database(err.to_string()),
    }
}

fn missing(entity: &str, id: i64) -> BackendError {
    BackendError::Integrity(format!("no {entity} with id {id}"))
}

struct Conn {
    conn: Connection,
    in_transaction: bool,
    pending: usize,
}

impl Conn {
    /// Run one write, inside the batch transaction when `commit` is false.
    fn write<T>(
        &mut self,
        commit: bool,
        max_cached: usize,
        op: impl FnOnce(&Connection) -> BackendResult<T>,
    ) -> BackendResult<T> {
        if !commit && !self.in_transaction {
            self.conn.execute_batch("BEGIN").map_err(map_err)?;
            self.in_transaction = true;
        }
        let value = op(&self.conn)?;
        if self.in_transaction {
            self.pending += 1;
            if commit || self.pending >= max_cached {
                self.commit()?;
            }
        }
        Ok(value)
    }

    fn commit(&mut self) -> BackendResult<()> {
        if self.in_transaction {
            self.conn.execute_batch("COMMIT").map_err(map_err)?;
            debug!(writes = self.pending, "committed batch");
            self.in_transaction = false;
            self.pending = 0;
        }
        Ok(())
    }

    fn exists(&self, table: &str, id: i64) -> BackendResult<bool> {
        let sql = format!("SELECT EXISTS(SELECT 1 FROM {table} WHERE id = ?1)");
        self.conn
            .query_row(&sql, params![id], |row| row.get(0))
            .map_err(map_err)
    }
}

/// Durable backend over a single SQLite database.
pub struct SqliteBackend {
    conn: Mutex<Conn>,
    max_cached: usize,
}

impl SqliteBackend {
    /// Open (or create) the database at `path` and ensure the schema exists.
    pub fn open(path: impl AsRef<Path>, max_cached: usize) -> Result<Self, BackendError> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .map_err(|e| BackendError::Connectivity(format!("{}: {e}", path.display())))?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000; PRAGMA foreign_keys=ON;",
        )
        .map_err(map_err)?;
        info!(path = %path.display(), "opened sqlite backend");
        Self::init(conn, max_cached)
    }

    pub fn open_in_memory(max_cached: usize) -> Result<Self, BackendError> {
        let conn = Connection::open_in_memory().map_err(map_err)?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(map_err)?;
        Self::init(conn, max_cached)
    }

    fn init(conn: Connection, max_cached: usize) -> Result<Self, BackendError> {
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| BackendError::Schema(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(Conn {
                conn,
                in_transaction: false,
                pending: 0,
            }),
            max_cached: max_cached.max(1),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Conn> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Remove a run and everything below it, as an external actor would.
    pub fn delete_run(&self, run_id: RunId) -> BackendResult<()> {
        let conn = self.lock();
        conn.conn
            .execute("DELETE FROM runs WHERE id = ?1", params![run_id.get()])
            .map_err(map_err)?;
        Ok(())
    }

    pub fn delete_suite(&self, suite_id: SuiteId) -> BackendResult<()> {
        let conn = self.lock();
        conn.conn
            .execute("DELETE FROM suites WHERE id = ?1", params![suite_id.get()])
            .map_err(map_err)?;
        Ok(())
    }

    /// Number of rows in `table`.
    pub fn count(&self, table: &str) -> BackendResult<i64> {
        if !TABLES.contains(&table) {
            return Err(BackendError::Schema(format!("unknown table {table}")));
        }
        let conn = self.lock();
        conn.conn
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
            .map_err(map_err)
    }

    /// Message texts attached to a testcase, in insertion order.
    pub fn testcase_messages(&self, testcase_id: TestcaseId) -> BackendResult<Vec<String>> {
        let conn = self.lock();
        let mut stmt = conn
            .conn
            .prepare("SELECT message FROM messages WHERE testcase_id = ?1 ORDER BY id")
            .map_err(map_err)?;
        let rows = stmt
            .query_map(params![testcase_id.get()], |row| row.get(0))
            .map_err(map_err)?;
        rows.collect::<Result<Vec<String>, _>>().map_err(map_err)
    }

    /// Stored (name, result code) of a testcase.
    pub fn testcase_row(&self, testcase_id: TestcaseId) -> BackendResult<(String, i32)> {
        let conn = self.lock();
        conn.conn
            .query_row(
                "SELECT testcase_name, result FROM testcases WHERE id = ?1",
                params![testcase_id.get()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(map_err)
    }

    /// Stored run name.
    pub fn run_name(&self, run_id: RunId) -> BackendResult<String> {
        let conn = self.lock();
        conn.conn
            .query_row(
                "SELECT run_name FROM runs WHERE id = ?1",
                params![run_id.get()],
                |row| row.get(0),
            )
            .map_err(map_err)
    }
}

fn expect_row(affected: usize, entity: &str, id: i64) -> BackendResult<()> {
    if affected == 0 {
        return Err(missing(entity, id));
    }
    Ok(())
}

impl WriteBackend for SqliteBackend {
    fn sanity_check(&self) -> BackendResult<()> {
        let conn = self.lock();
        for table in TABLES {
            let present: bool = conn
                .conn
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
                    params![table],
                    |row| row.get(0),
                )
                .map_err(map_err)?;
            if !present {
                return Err(BackendError::Schema(format!("missing table {table}")));
            }
        }
        Ok(())
    }

    fn start_run(&self, run: &StartRun, timestamp: i64, commit: bool) -> BackendResult<RunId> {
        self.lock().write(commit, self.max_cached, |conn| {
            conn.execute(
                "INSERT INTO runs (run_name, os_name, product_name, version_name, build_name, host_name, start_time)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    run.run_name,
                    run.os_name,
                    run.product_name,
                    run.version_name,
                    run.build_name,
                    run.host_name,
                    timestamp
                ],
            )
            .map_err(map_err)?;
            Ok(RunId(conn.last_insert_rowid()))
        })
    }

    fn end_run(&self, run_id: RunId, timestamp: i64, commit: bool) -> BackendResult<()> {
        self.lock().write(commit, self.max_cached, |conn| {
            let affected = conn
                .execute(
                    "UPDATE runs SET end_time = ?2 WHERE id = ?1",
                    params![run_id.get(), timestamp],
                )
                .map_err(map_err)?;
            expect_row(affected, "run", run_id.get())
        })
    }

    fn update_run(&self, run_id: RunId, update: &UpdateRun, commit: bool) -> BackendResult<()> {
        self.lock().write(commit, self.max_cached, |conn| {
            let affected = conn
                .execute(
                    "UPDATE runs SET
                        run_name = COALESCE(?2, run_name),
                        os_name = COALESCE(?3, os_name),
                        product_name = COALESCE(?4, product_name),
                        version_name = COALESCE(?5, version_name),
                        build_name = COALESCE(?6, build_name),
                        user_note = COALESCE(?7, user_note),
                        host_name = COALESCE(?8, host_name)
                     WHERE id = ?1",
                    params![
                        run_id.get(),
                        update.run_name,
                        update.os_name,
                        update.product_name,
                        update.version_name,
                        update.build_name,
                        update.user_note,
                        update.host_name
                    ],
                )
                .map_err(map_err)?;
            expect_row(affected, "run", run_id.get())
        })
    }

    fn add_run_metainfo(
        &self,
        run_id: RunId,
        key: &str,
        value: &str,
        commit: bool,
    ) -> BackendResult<()> {
        self.lock().write(commit, self.max_cached, |conn| {
            conn.execute(
                "INSERT INTO run_metainfo (run_id, name, value) VALUES (?1, ?2, ?3)",
                params![run_id.get(), key, value],
            )
            .map_err(map_err)?;
            Ok(())
        })
    }

    fn start_suite(
        &self,
        package_name: &str,
        suite_name: &str,
        timestamp: i64,
        run_id: RunId,
        commit: bool,
    ) -> BackendResult<SuiteId> {
        self.lock().write(commit, self.max_cached, |conn| {
            conn.execute(
                "INSERT INTO suites (run_id, suite_name, package_name, start_time) VALUES (?1, ?2, ?3, ?4)",
                params![run_id.get(), suite_name, package_name, timestamp],
            )
            .map_err(map_err)?;
            Ok(SuiteId(conn.last_insert_rowid()))
        })
    }

    fn end_suite(&self, suite_id: SuiteId, timestamp: i64, commit: bool) -> BackendResult<()> {
        self.lock().write(commit, self.max_cached, |conn| {
            let affected = conn
                .execute(
                    "UPDATE suites SET end_time = ?2 WHERE id = ?1",
                    params![suite_id.get(), timestamp],
                )
                .map_err(map_err)?;
            expect_row(affected, "suite", suite_id.get())
        })
    }

    fn update_suite(
        &self,
        suite_id: SuiteId,
        suite_name: Option<&str>,
        user_note: Option<&str>,
        commit: bool,
    ) -> BackendResult<()> {
        self.lock().write(commit, self.max_cached, |conn| {
            let affected = conn
                .execute(
                    "UPDATE suites SET suite_name = COALESCE(?2, suite_name), user_note = COALESCE(?3, user_note)
                     WHERE id = ?1",
                    params![suite_id.get(), suite_name, user_note],
                )
                .map_err(map_err)?;
            expect_row(affected, "suite", suite_id.get())
        })
    }

    fn start_testcase(
        &self,
        testcase: &StartTestcase,
        suite_id: SuiteId,
        timestamp: i64,
        commit: bool,
    ) -> BackendResult<TestcaseId> {
        self.lock().write(commit, self.max_cached, |conn| {
            conn.execute(
                "INSERT INTO testcases
                    (suite_id, suite_full_name, scenario_name, scenario_description, testcase_name, result, start_time)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    suite_id.get(),
                    testcase.suite_full_name,
                    testcase.scenario_name,
                    testcase.scenario_description,
                    testcase.testcase_name,
                    TestcaseResult::Running.code(),
                    timestamp
                ],
            )
            .map_err(map_err)?;
            Ok(TestcaseId(conn.last_insert_rowid()))
        })
    }

    fn end_testcase(
        &self,
        testcase_id: TestcaseId,
        result: TestcaseResult,
        timestamp: i64,
        commit: bool,
    ) -> BackendResult<()> {
        self.lock().write(commit, self.max_cached, |conn| {
            let affected = conn
                .execute(
                    "UPDATE testcases SET result = ?2, end_time = ?3 WHERE id = ?1",
                    params![testcase_id.get(), result.code(), timestamp],
                )
                .map_err(map_err)?;
            expect_row(affected, "testcase", testcase_id.get())
        })
    }

    fn update_testcase(
        &self,
        testcase_id: TestcaseId,
        update: &UpdateTestcase,
        _timestamp: i64,
        commit: bool,
    ) -> BackendResult<()> {
        self.lock().write(commit, self.max_cached, |conn| {
            let affected = conn
                .execute(
                    "UPDATE testcases SET
                        suite_full_name = COALESCE(?2, suite_full_name),
                        scenario_name = COALESCE(?3, scenario_name),
                        scenario_description = COALESCE(?4, scenario_description),
                        testcase_name = COALESCE(?5, testcase_name),
                        user_note = COALESCE(?6, user_note),
                        result = COALESCE(?7, result)
                     WHERE id = ?1",
                    params![
                        testcase_id.get(),
                        update.suite_full_name,
                        update.scenario_name,
                        update.scenario_description,
                        update.testcase_name,
                        update.user_note,
                        update.result.map(TestcaseResult::code)
                    ],
                )
                .map_err(map_err)?;
            expect_row(affected, "testcase", testcase_id.get())
        })
    }

    fn delete_testcase(&self, testcase_id: TestcaseId) -> BackendResult<()> {
        self.lock().write(true, self.max_cached, |conn| {
            conn.execute(
                "DELETE FROM testcases WHERE id = ?1",
                params![testcase_id.get()],
            )
            .map_err(map_err)?;
            Ok(())
        })
    }

    fn add_scenario_metainfo(
        &self,
        testcase_id: TestcaseId,
        key: &str,
        value: &str,
        commit: bool,
    ) -> BackendResult<()> {
        self.lock().write(commit, self.max_cached, |conn| {
            conn.execute(
                "INSERT INTO scenario_metainfo (testcase_id, name, value) VALUES (?1, ?2, ?3)",
                params![testcase_id.get(), key, value],
            )
            .map_err(map_err)?;
            Ok(())
        })
    }

    fn clear_scenario_metainfo(&self, testcase_id: TestcaseId, commit: bool) -> BackendResult<()> {
        self.lock().write(commit, self.max_cached, |conn| {
            conn.execute(
                "DELETE FROM scenario_metainfo WHERE testcase_id = ?1",
                params![testcase_id.get()],
            )
            .map_err(map_err)?;
            Ok(())
        })
    }

    fn add_testcase_metainfo(
        &self,
        testcase_id: TestcaseId,
        key: &str,
        value: &str,
        commit: bool,
    ) -> BackendResult<()> {
        self.lock().write(commit, self.max_cached, |conn| {
            conn.execute(
                "INSERT INTO testcase_metainfo (testcase_id, name, value) VALUES (?1, ?2, ?3)",
                params![testcase_id.get(), key, value],
            )
            .map_err(map_err)?;
            Ok(())
        })
    }

    fn insert_message(
        &self,
        target: MessageTarget,
        message: &MessageRecord,
        commit: bool,
    ) -> BackendResult<()> {
        let (run_id, suite_id, testcase_id) = match target {
            MessageTarget::Run(id) => (Some(id.get()), None, None),
            MessageTarget::Suite(id) => (None, Some(id.get()), None),
            MessageTarget::Testcase(id) => (None, None, Some(id.get())),
        };
        self.lock().write(commit, self.max_cached, |conn| {
            conn.execute(
                "INSERT INTO messages
                    (run_id, suite_id, testcase_id, level, message, escape_html, machine_name, thread_name, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    run_id,
                    suite_id,
                    testcase_id,
                    message.level.code(),
                    message.message,
                    message.escape_html,
                    message.machine_name,
                    message.thread_name,
                    message.timestamp
                ],
            )
            .map_err(map_err)?;
            Ok(())
        })
    }

    fn start_load_queue(
        &self,
        load_queue: &StartLoadQueue,
        timestamp: i64,
        testcase_id: TestcaseId,
        commit: bool,
    ) -> BackendResult<LoadQueueId> {
        self.lock().write(commit, self.max_cached, |conn| {
            conn.execute(
                "INSERT INTO load_queues
                    (testcase_id, name, sequence, hosts, threading_pattern, number_threads, machine, result, start_time)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    testcase_id.get(),
                    load_queue.name,
                    load_queue.sequence,
                    load_queue.hosts,
                    load_queue.threading_pattern,
                    load_queue.number_threads,
                    load_queue.machine,
                    CheckpointResult::Running.code(),
                    timestamp
                ],
            )
            .map_err(map_err)?;
            Ok(LoadQueueId(conn.last_insert_rowid()))
        })
    }

    fn end_load_queue(
        &self,
        load_queue_id: LoadQueueId,
        result: CheckpointResult,
        timestamp: i64,
        commit: bool,
    ) -> BackendResult<()> {
        self.lock().write(commit, self.max_cached, |conn| {
            let affected = conn
                .execute(
                    "UPDATE load_queues SET result = ?2, end_time = ?3 WHERE id = ?1",
                    params![load_queue_id.get(), result.code(), timestamp],
                )
                .map_err(map_err)?;
            expect_row(affected, "load queue", load_queue_id.get())
        })
    }

    fn start_checkpoint(
        &self,
        name: &str,
        thread_name: &str,
        start_timestamp: i64,
        transfer_unit: &str,
        load_queue_id: LoadQueueId,
        commit: bool,
    ) -> BackendResult<CheckpointInfo> {
        self.lock().write(commit, self.max_cached, |conn| {
            conn.execute(
                "INSERT INTO checkpoints (load_queue_id, name, thread_name, start_time, transfer_unit, result)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    load_queue_id.get(),
                    name,
                    thread_name,
                    start_timestamp,
                    transfer_unit,
                    CheckpointResult::Running.code()
                ],
            )
            .map_err(map_err)?;
            Ok(CheckpointInfo {
                checkpoint_id: CheckpointId(conn.last_insert_rowid()),
                name: name.to_string(),
                load_queue_id,
                start_timestamp,
            })
        })
    }

    fn end_checkpoint(
        &self,
        checkpoint: &CheckpointInfo,
        end_timestamp: i64,
        transfer_size: i64,
        result: CheckpointResult,
        commit: bool,
    ) -> BackendResult<()> {
        self.lock().write(commit, self.max_cached, |conn| {
            let affected = conn
                .execute(
                    "UPDATE checkpoints SET response_time = ?2, transfer_size = ?3, result = ?4 WHERE id = ?1",
                    params![
                        checkpoint.checkpoint_id.get(),
                        end_timestamp - checkpoint.start_timestamp,
                        transfer_size,
                        result.code()
                    ],
                )
                .map_err(map_err)?;
            expect_row(affected, "checkpoint", checkpoint.checkpoint_id.get())
        })
    }

    fn insert_checkpoint(
        &self,
        checkpoint: &InsertCheckpoint,
        load_queue_id: LoadQueueId,
        commit: bool,
    ) -> BackendResult<()> {
        self.lock().write(commit, self.max_cached, |conn| {
            conn.execute(
                "INSERT INTO checkpoints
                    (load_queue_id, name, thread_name, start_time, response_time, transfer_size, transfer_unit, result)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    load_queue_id.get(),
                    checkpoint.name,
                    checkpoint.thread_name,
                    checkpoint.start_timestamp,
                    checkpoint.response_time,
                    checkpoint.transfer_size,
                    checkpoint.transfer_unit,
                    checkpoint.result.code()
                ],
            )
            .map_err(map_err)?;
            Ok(())
        })
    }

    fn insert_system_statistics(
        &self,
        testcase_id: TestcaseId,
        sample: &StatisticSample,
        commit: bool,
    ) -> BackendResult<()> {
        insert_statistics(self, "system", testcase_id, sample, commit)
    }

    fn insert_user_activity_statistics(
        &self,
        testcase_id: TestcaseId,
        sample: &StatisticSample,
        commit: bool,
    ) -> BackendResult<()> {
        insert_statistics(self, "user_activity", testcase_id, sample, commit)
    }

    fn is_run_present(&self, run_id: RunId) -> BackendResult<bool> {
        self.lock().exists("runs", run_id.get())
    }

    fn is_suite_present(&self, suite_id: SuiteId) -> BackendResult<bool> {
        self.lock().exists("suites", suite_id.get())
    }

    fn is_testcase_present(&self, testcase_id: TestcaseId) -> BackendResult<bool> {
        self.lock().exists("testcases", testcase_id.get())
    }

    fn flush_cache(&self) -> BackendResult<()> {
        self.lock().commit()
    }
}

fn insert_statistics(
    backend: &SqliteBackend,
    kind: &str,
    testcase_id: TestcaseId,
    sample: &StatisticSample,
    commit: bool,
) -> BackendResult<()> {
    backend.lock().write(commit, backend.max_cached, |conn| {
        conn.execute(
            "INSERT INTO statistics (testcase_id, kind, machine, statistic_ids, statistic_values, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                testcase_id.get(),
                kind,
                sample.monitored_machine,
                sample.statistic_ids,
                sample.statistic_values,
                sample.timestamp
            ],
        )
        .map_err(map_err)?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_passes_sanity_check() {
        let backend = SqliteBackend::open_in_memory(10).unwrap();
        backend.sanity_check().unwrap();
    }

    #[test]
    fn test_missing_parent_is_integrity_error() {
        let backend = SqliteBackend::open_in_memory(10).unwrap();
        let err = backend
            .start_suite("pkg", "suite", 1, RunId(404), true)
            .unwrap_err();
        assert!(err.is_integrity(), "{err}");
    }

    #[test]
    fn test_update_of_missing_row_is_integrity_error() {
        let backend = SqliteBackend::open_in_memory(10).unwrap();
        let err = backend.end_run(RunId(9), 10, true).unwrap_err();
        assert!(err.is_integrity());
    }

    #[test]
    fn test_unknown_table_count_rejected() {
        let backend = SqliteBackend::open_in_memory(10).unwrap();
        assert!(backend.count("runs; DROP TABLE runs").is_err());
        assert_eq!(backend.count("runs").unwrap(), 0);
    }
}
