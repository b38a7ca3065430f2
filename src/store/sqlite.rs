use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use crate::error::{PoolError, Result};
use crate::store::job::{Job, JobCounts, JobId, JobStatus};
use crate::store::JobStore;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS jobs (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        target      TEXT NOT NULL,
        status      TEXT NOT NULL DEFAULT 'pending',
        created_at  INTEGER NOT NULL,
        started_at  INTEGER,
        finished_at INTEGER,
        result_code INTEGER,
        error       TEXT
    );
    CREATE INDEX IF NOT EXISTS jobs_claim_order ON jobs (status, created_at, id);
";

const JOB_COLUMNS: &str =
    "id, target, status, created_at, started_at, finished_at, result_code, error";

impl ToSql for JobStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for JobStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: PoolError| FromSqlError::Other(Box::new(e)))
    }
}

/// SQLite-backed job store.
///
/// Timestamps are stored as microseconds since the Unix epoch so that
/// `ORDER BY created_at` and `ORDER BY finished_at` sort chronologically.
///
/// All statements run on the blocking thread pool. The connection sits behind
/// a mutex, and every state change additionally runs in a `BEGIN IMMEDIATE`
/// transaction so that other processes sharing the file observe claims
/// atomically as well.
#[derive(Clone, Debug)]
pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl SqliteJobStore {
    /// Open or create a job database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&path)?;
        let journal_mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!(path = %path.display(), journal_mode, "Configured job database");
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::init(conn, Some(path))
    }

    /// Database that lives only as long as this store.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;

        tracing::debug!(path = ?path, "Job store opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| PoolError::Store("connection mutex poisoned".to_string()))?;
            f(&mut conn)
        })
        .await?
    }
}

fn micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

fn timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let value: Option<i64> = row.get(idx)?;
    value
        .map(|us| {
            DateTime::from_timestamp_micros(us)
                .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, us))
        })
        .transpose()
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    let created_at = timestamp(row, 3)?.ok_or(rusqlite::Error::InvalidColumnType(
        3,
        "created_at".to_string(),
        rusqlite::types::Type::Null,
    ))?;

    Ok(Job {
        id: row.get(0)?,
        target: row.get(1)?,
        status: row.get(2)?,
        created_at,
        started_at: timestamp(row, 4)?,
        finished_at: timestamp(row, 5)?,
        result_code: row.get(6)?,
        error: row.get(7)?,
    })
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn enqueue(&self, targets: &[String]) -> Result<Vec<JobId>> {
        let targets = targets.to_vec();
        self.with_conn(move |conn| {
            let created_at = micros(Utc::now());
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut ids = Vec::with_capacity(targets.len());
            {
                let mut stmt =
                    tx.prepare_cached("INSERT INTO jobs (target, created_at) VALUES (?1, ?2)")?;
                for target in &targets {
                    stmt.execute(params![target, created_at])?;
                    ids.push(tx.last_insert_rowid());
                }
            }
            tx.commit()?;
            Ok(ids)
        })
        .await
    }

    async fn claim_next(&self) -> Result<Job> {
        self.with_conn(|conn| {
            let sql = format!(
                "UPDATE jobs SET status = ?1, started_at = ?2
                 WHERE id = (
                     SELECT id FROM jobs WHERE status = ?3
                     ORDER BY created_at, id LIMIT 1
                 )
                 RETURNING {}",
                JOB_COLUMNS
            );

            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let job = tx
                .query_row(
                    &sql,
                    params![
                        JobStatus::Processing,
                        micros(Utc::now()),
                        JobStatus::Pending
                    ],
                    row_to_job,
                )
                .optional()?;
            tx.commit()?;

            job.ok_or(PoolError::NoJobsAvailable)
        })
        .await
    }

    async fn complete(&self, id: JobId, result_code: i32, error: Option<&str>) -> Result<()> {
        let status = Job::outcome_status(error);
        let error = error.filter(|e| !e.is_empty()).map(str::to_string);

        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let updated = tx.execute(
                "UPDATE jobs SET status = ?1, finished_at = ?2, result_code = ?3, error = ?4
                 WHERE id = ?5 AND status = ?6",
                params![
                    status,
                    micros(Utc::now()),
                    result_code,
                    error,
                    id,
                    JobStatus::Processing
                ],
            )?;

            if updated == 0 {
                let current: Option<JobStatus> = tx
                    .query_row("SELECT status FROM jobs WHERE id = ?1", [id], |row| {
                        row.get(0)
                    })
                    .optional()?;
                return Err(match current {
                    Some(status) => PoolError::InvalidTransition { job_id: id, status },
                    None => PoolError::JobNotFound(id),
                });
            }

            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn list_terminal(&self) -> Result<Vec<Job>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM jobs WHERE status IN (?1, ?2)
                 ORDER BY finished_at DESC, id DESC",
                JOB_COLUMNS
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            let jobs = stmt
                .query_map(
                    params![JobStatus::Completed, JobStatus::Failed],
                    row_to_job,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(jobs)
        })
        .await
    }

    async fn clear(&self) -> Result<()> {
        self.with_conn(|conn| {
            let removed = conn.execute("DELETE FROM jobs", [])?;
            tracing::debug!(removed, "Job store cleared");
            Ok(())
        })
        .await
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        self.with_conn(move |conn| {
            let sql = format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS);
            Ok(conn.query_row(&sql, [id], row_to_job).optional()?)
        })
        .await
    }

    async fn counts(&self) -> Result<JobCounts> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached("SELECT status, COUNT(*) FROM jobs GROUP BY status")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, JobStatus>(0)?, row.get::<_, i64>(1)?))
            })?;

            let mut counts = JobCounts::default();
            for row in rows {
                let (status, n) = row?;
                counts.record(status, n as usize);
            }
            Ok(counts)
        })
        .await
    }
}
