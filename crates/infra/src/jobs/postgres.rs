//! Postgres-backed job store.
//!
//! Every queue is its own table (`timer_jobs`, `executable_jobs`, ...); moving
//! a job is a `DELETE` plus an `INSERT` inside one database transaction.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobError |
//! |------------|----------------------|----------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Conditional update/delete matched zero rows | N/A | `Conflict` |
//! | Anything else | Any | `Storage` |
//!
//! ## Sync bridging
//!
//! The [`JobStore`] trait is synchronous. The store captures a tokio runtime
//! handle at construction and `block_on`s each statement, so its methods must be
//! called from plain threads (the async executor's workers), not from inside
//! async tasks.

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tokio::runtime::Handle;
use tracing::instrument;
use uuid::Uuid;

use jobforge_core::{ExecutionId, JobError, JobId, JobResult, ProcessInstanceId, TenantId};

use super::store::{JobStore, JobTransaction};
use super::types::{
    Correlation, Job, JobQueue, JobRecord, JobStats, ProcessInstanceRecord, Variables,
};

const SCHEMA: &str = include_str!("schema.sql");

const JOB_COLUMNS: &str = "id, revision, process_instance_id, execution_id, scope_id, scope_type, \
     job_type, handler_type, handler_configuration, due_date, retries, lock_owner, \
     lock_expiration_time, exclusive, retry_time_cycle, exception_message, \
     exception_stacktrace, tenant_id, created_at";

fn table(queue: JobQueue) -> String {
    format!("{}_jobs", queue.as_str())
}

/// `SELECT '<queue>' AS queue, <columns> FROM <table> WHERE <predicate>` for each queue,
/// joined with `UNION ALL`.
fn union_select(queues: &[JobQueue], predicate: &str) -> String {
    queues
        .iter()
        .map(|q| {
            format!(
                "SELECT '{}' AS queue, {JOB_COLUMNS} FROM {} WHERE {predicate}",
                q.as_str(),
                table(*q)
            )
        })
        .collect::<Vec<_>>()
        .join(" UNION ALL ")
}

/// Finds which queue other than `queue` already holds a job id (`$1`).
fn occupied_elsewhere(queue: JobQueue) -> String {
    JobQueue::ALL
        .iter()
        .filter(|q| **q != queue)
        .map(|q| format!("SELECT '{}' AS queue FROM {} WHERE id = $1", q.as_str(), table(*q)))
        .collect::<Vec<_>>()
        .join(" UNION ALL ")
        + " LIMIT 1"
}

/// Postgres job store.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
    handle: Handle,
}

impl PostgresJobStore {
    /// Create a store bound to the current tokio runtime.
    pub fn new(pool: PgPool) -> JobResult<Self> {
        let handle = Handle::try_current().map_err(|_| {
            JobError::storage(
                "PostgresJobStore requires a tokio runtime; construct it inside one or use with_handle",
            )
        })?;
        Ok(Self::with_handle(pool, handle))
    }

    pub fn with_handle(pool: PgPool, handle: Handle) -> Self {
        Self { pool, handle }
    }

    /// Create the job tables if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> JobResult<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn load_job(&self, id: JobId) -> JobResult<Option<Job>> {
        let sql = union_select(&JobQueue::ALL, "id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_job", e))?;
        row.map(|r| queued_job(&r)).transpose()
    }

    #[instrument(skip(self), err)]
    async fn load_acquirable(&self, now: DateTime<Utc>, limit: usize) -> JobResult<Vec<Job>> {
        let sql = format!(
            "SELECT * FROM ({}) candidates ORDER BY due_date ASC NULLS FIRST, id ASC LIMIT $2",
            union_select(
                &[JobQueue::Timer, JobQueue::Executable],
                "(due_date IS NULL OR due_date <= $1) \
                 AND (lock_expiration_time IS NULL OR lock_expiration_time <= $1)",
            )
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_acquirable", e))?;
        rows.iter().map(queued_job).collect()
    }

    #[instrument(skip(self), err)]
    async fn load_claimable_external(
        &self,
        topic: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> JobResult<Vec<JobRecord>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM {} \
             WHERE handler_configuration = $1 \
               AND (due_date IS NULL OR due_date <= $2) \
               AND (lock_expiration_time IS NULL OR lock_expiration_time <= $2) \
             ORDER BY created_at ASC, id ASC LIMIT $3",
            table(JobQueue::ExternalWorker)
        );
        let rows = sqlx::query(&sql)
            .bind(topic)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_claimable_external", e))?;
        rows.iter().map(record_from_row).collect()
    }

    async fn load_queue(&self, queue: JobQueue, limit: usize) -> JobResult<Vec<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM {} ORDER BY created_at ASC, id ASC LIMIT $1",
            table(queue)
        );
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_jobs", e))?;
        rows.iter()
            .map(|r| record_from_row(r).map(|rec| Job::in_queue(queue, rec)))
            .collect()
    }

    async fn load_stats(&self) -> JobResult<JobStats> {
        let sql = format!(
            "SELECT {}",
            JobQueue::ALL
                .iter()
                .map(|q| format!("(SELECT COUNT(*) FROM {}) AS {}", table(*q), q.as_str()))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let row = sqlx::query(&sql)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let count = |queue: JobQueue| -> JobResult<usize> {
            row.try_get::<i64, _>(queue.as_str())
                .map(|n| n.max(0) as usize)
                .map_err(|e| map_sqlx_error("stats", e))
        };
        Ok(JobStats {
            timer: count(JobQueue::Timer)?,
            executable: count(JobQueue::Executable)?,
            suspended: count(JobQueue::Suspended)?,
            dead_letter: count(JobQueue::DeadLetter)?,
            external_worker: count(JobQueue::ExternalWorker)?,
        })
    }
}

impl JobStore for PostgresJobStore {
    type Tx<'a> = PgJobTransaction<'a>;

    fn begin(&self) -> JobResult<Self::Tx<'_>> {
        let tx = self
            .handle
            .block_on(self.pool.begin())
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(PgJobTransaction {
            handle: &self.handle,
            tx: Some(tx),
        })
    }

    fn find_job(&self, id: JobId) -> JobResult<Option<Job>> {
        self.handle.block_on(self.load_job(id))
    }

    fn list_jobs(&self, queue: JobQueue, limit: usize) -> JobResult<Vec<Job>> {
        self.handle.block_on(self.load_queue(queue, limit))
    }

    fn find_acquirable(&self, now: DateTime<Utc>, limit: usize) -> JobResult<Vec<Job>> {
        self.handle.block_on(self.load_acquirable(now, limit))
    }

    fn find_claimable_external(
        &self,
        topic: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> JobResult<Vec<JobRecord>> {
        self.handle
            .block_on(self.load_claimable_external(topic, now, limit))
    }

    fn find_process_instance(
        &self,
        id: ProcessInstanceId,
    ) -> JobResult<Option<ProcessInstanceRecord>> {
        self.handle.block_on(async {
            let mut conn = self
                .pool
                .acquire()
                .await
                .map_err(|e| map_sqlx_error("acquire_connection", e))?;
            select_process_instance(&mut *conn, id).await
        })
    }

    fn variables(&self, execution_id: ExecutionId) -> JobResult<Variables> {
        self.handle.block_on(async {
            let mut conn = self
                .pool
                .acquire()
                .await
                .map_err(|e| map_sqlx_error("acquire_connection", e))?;
            select_variables(&mut *conn, execution_id).await
        })
    }

    fn stats(&self) -> JobResult<JobStats> {
        self.handle.block_on(self.load_stats())
    }
}

/// A database transaction. Rolled back on drop unless committed.
#[derive(Debug)]
pub struct PgJobTransaction<'a> {
    handle: &'a Handle,
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgJobTransaction<'_> {
    fn parts(&mut self) -> JobResult<(&Handle, &mut Transaction<'static, Postgres>)> {
        let handle = self.handle;
        let tx = self
            .tx
            .as_mut()
            .ok_or_else(|| JobError::storage("transaction already finished"))?;
        Ok((handle, tx))
    }
}

impl Drop for PgJobTransaction<'_> {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            // sqlx queues the rollback and returns the connection from a spawned task.
            let _runtime = self.handle.enter();
            drop(tx);
        }
    }
}

impl JobTransaction for PgJobTransaction<'_> {
    fn find_job(&mut self, id: JobId) -> JobResult<Option<Job>> {
        let (handle, tx) = self.parts()?;
        handle.block_on(async {
            let sql = union_select(&JobQueue::ALL, "id = $1");
            let row = sqlx::query(&sql)
                .bind(id.as_uuid())
                .fetch_optional(&mut **tx)
                .await
                .map_err(|e| map_sqlx_error("find_job", e))?;
            row.map(|r| queued_job(&r)).transpose()
        })
    }

    fn insert_job(&mut self, job: &mut Job) -> JobResult<()> {
        let (handle, tx) = self.parts()?;
        let queue = job.queue();
        let record = job.record_mut();
        record.revision = 1;
        handle.block_on(insert_record(tx, queue, record))
    }

    fn update_job(&mut self, job: &mut Job) -> JobResult<()> {
        let (handle, tx) = self.parts()?;
        let queue = job.queue();
        handle.block_on(update_record(tx, queue, job.record()))?;
        job.record_mut().revision += 1;
        Ok(())
    }

    fn delete_job(&mut self, job: &Job) -> JobResult<()> {
        let (handle, tx) = self.parts()?;
        let sql = format!(
            "DELETE FROM {} WHERE id = $1 AND revision = $2",
            table(job.queue())
        );
        let result = handle
            .block_on(
                sqlx::query(&sql)
                    .bind(job.id().as_uuid())
                    .bind(job.record().revision as i64)
                    .execute(&mut **tx),
            )
            .map_err(|e| map_sqlx_error("delete_job", e))?;
        if result.rows_affected() == 0 {
            return Err(JobError::conflict(format!(
                "job {} changed or moved out of the {} queue",
                job.id(),
                job.queue()
            )));
        }
        Ok(())
    }

    fn find_process_instance(
        &mut self,
        id: ProcessInstanceId,
    ) -> JobResult<Option<ProcessInstanceRecord>> {
        let (handle, tx) = self.parts()?;
        handle.block_on(select_process_instance(&mut **tx, id))
    }

    fn insert_process_instance(&mut self, record: &mut ProcessInstanceRecord) -> JobResult<()> {
        let (handle, tx) = self.parts()?;
        record.revision = 1;
        handle
            .block_on(
                sqlx::query(
                    r#"
                    INSERT INTO process_instances
                        (id, revision, lock_owner, lock_time, locking_job, tenant_id)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    "#,
                )
                .bind(record.id.as_uuid())
                .bind(record.revision as i64)
                .bind(record.lock_owner.as_deref())
                .bind(record.lock_time)
                .bind(record.locking_job.map(|j| *j.as_uuid()))
                .bind(record.tenant_id.map(|t| *t.as_uuid()))
                .execute(&mut **tx),
            )
            .map_err(|e| map_sqlx_error("insert_process_instance", e))?;
        Ok(())
    }

    fn update_process_instance(&mut self, record: &mut ProcessInstanceRecord) -> JobResult<()> {
        let (handle, tx) = self.parts()?;
        let result = handle
            .block_on(
                sqlx::query(
                    r#"
                    UPDATE process_instances
                    SET lock_owner = $3, lock_time = $4, locking_job = $5, tenant_id = $6,
                        revision = revision + 1
                    WHERE id = $1 AND revision = $2
                    "#,
                )
                .bind(record.id.as_uuid())
                .bind(record.revision as i64)
                .bind(record.lock_owner.as_deref())
                .bind(record.lock_time)
                .bind(record.locking_job.map(|j| *j.as_uuid()))
                .bind(record.tenant_id.map(|t| *t.as_uuid()))
                .execute(&mut **tx),
            )
            .map_err(|e| map_sqlx_error("update_process_instance", e))?;
        if result.rows_affected() == 0 {
            return Err(JobError::conflict(format!(
                "process instance {} changed concurrently",
                record.id
            )));
        }
        record.revision += 1;
        Ok(())
    }

    fn variables(&mut self, execution_id: ExecutionId) -> JobResult<Variables> {
        let (handle, tx) = self.parts()?;
        handle.block_on(select_variables(&mut **tx, execution_id))
    }

    fn set_variables(&mut self, execution_id: ExecutionId, variables: &Variables) -> JobResult<()> {
        let (handle, tx) = self.parts()?;
        handle.block_on(async {
            for (name, value) in variables {
                sqlx::query(
                    r#"
                    INSERT INTO execution_variables (execution_id, name, value)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (execution_id, name) DO UPDATE SET value = EXCLUDED.value
                    "#,
                )
                .bind(execution_id.as_uuid())
                .bind(name)
                .bind(value)
                .execute(&mut **tx)
                .await
                .map_err(|e| map_sqlx_error("set_variables", e))?;
            }
            Ok(())
        })
    }

    fn commit(mut self) -> JobResult<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| JobError::storage("transaction already finished"))?;
        self.handle
            .block_on(tx.commit())
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }
}

fn bind_record<'q>(
    query: Query<'q, Postgres, PgArguments>,
    record: &'q JobRecord,
) -> Query<'q, Postgres, PgArguments> {
    let (process_instance_id, execution_id, scope_id, scope_type) = match &record.correlation {
        Correlation::Process {
            process_instance_id,
            execution_id,
        } => (
            Some(*process_instance_id.as_uuid()),
            Some(*execution_id.as_uuid()),
            None,
            None,
        ),
        Correlation::Scope {
            scope_id,
            scope_type,
        } => (None, None, Some(scope_id.as_str()), Some(scope_type.as_str())),
        Correlation::Unbound => (None, None, None, None),
    };

    query
        .bind(record.id.as_uuid())
        .bind(record.revision as i64)
        .bind(process_instance_id)
        .bind(execution_id)
        .bind(scope_id)
        .bind(scope_type)
        .bind(record.job_type.as_str())
        .bind(record.handler_type.as_str())
        .bind(record.handler_configuration.as_deref())
        .bind(record.due_date)
        .bind(i64::from(record.retries))
        .bind(record.lock_owner.as_deref())
        .bind(record.lock_expiration_time)
        .bind(record.exclusive)
        .bind(record.retry_time_cycle.as_deref())
        .bind(record.exception_message.as_deref())
        .bind(record.exception_stacktrace.as_deref())
        .bind(record.tenant_id.map(|t| *t.as_uuid()))
        .bind(record.created_at)
}

async fn insert_record(
    tx: &mut Transaction<'static, Postgres>,
    queue: JobQueue,
    record: &JobRecord,
) -> JobResult<()> {
    // A job id lives in exactly one queue; the primary key only covers one table.
    let holder: Option<String> = sqlx::query_scalar(&occupied_elsewhere(queue))
        .bind(record.id.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("insert_job", e))?;
    if let Some(holder) = holder {
        return Err(JobError::conflict(format!(
            "job {} already exists in the {holder} queue",
            record.id
        )));
    }

    let sql = format!(
        "INSERT INTO {} ({JOB_COLUMNS}) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)",
        table(queue)
    );
    bind_record(sqlx::query(&sql), record)
        .execute(&mut **tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                JobError::conflict(format!("job {} already exists in the {queue} queue", record.id))
            } else {
                map_sqlx_error("insert_job", e)
            }
        })?;
    Ok(())
}

async fn update_record(
    tx: &mut Transaction<'static, Postgres>,
    queue: JobQueue,
    record: &JobRecord,
) -> JobResult<()> {
    let sql = format!(
        "UPDATE {} SET \
            process_instance_id = $3, execution_id = $4, scope_id = $5, scope_type = $6, \
            job_type = $7, handler_type = $8, handler_configuration = $9, due_date = $10, \
            retries = $11, lock_owner = $12, lock_expiration_time = $13, exclusive = $14, \
            retry_time_cycle = $15, exception_message = $16, exception_stacktrace = $17, \
            tenant_id = $18, created_at = $19, revision = revision + 1 \
         WHERE id = $1 AND revision = $2",
        table(queue)
    );
    let result = bind_record(sqlx::query(&sql), record)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("update_job", e))?;
    if result.rows_affected() == 0 {
        return Err(JobError::conflict(format!(
            "job {} changed or moved out of the {queue} queue",
            record.id
        )));
    }
    Ok(())
}

async fn select_process_instance(
    conn: &mut sqlx::PgConnection,
    id: ProcessInstanceId,
) -> JobResult<Option<ProcessInstanceRecord>> {
    let row = sqlx::query(
        r#"
        SELECT id, revision, lock_owner, lock_time, locking_job, tenant_id
        FROM process_instances
        WHERE id = $1
        "#,
    )
    .bind(id.as_uuid())
    .fetch_optional(conn)
    .await
    .map_err(|e| map_sqlx_error("find_process_instance", e))?;

    row.map(|r| {
        let row = ProcessInstanceRow::from_row(&r)
            .map_err(|e| map_sqlx_error("decode_process_instance", e))?;
        Ok(row.into())
    })
    .transpose()
}

async fn select_variables(
    conn: &mut sqlx::PgConnection,
    execution_id: ExecutionId,
) -> JobResult<Variables> {
    let rows = sqlx::query("SELECT name, value FROM execution_variables WHERE execution_id = $1")
        .bind(execution_id.as_uuid())
        .fetch_all(conn)
        .await
        .map_err(|e| map_sqlx_error("variables", e))?;

    let mut variables = Variables::new();
    for row in rows {
        let name: String = row.try_get("name").map_err(|e| map_sqlx_error("variables", e))?;
        let value: serde_json::Value =
            row.try_get("value").map_err(|e| map_sqlx_error("variables", e))?;
        variables.insert(name, value);
    }
    Ok(variables)
}

fn queued_job(row: &PgRow) -> JobResult<Job> {
    let queue: String = row
        .try_get("queue")
        .map_err(|e| map_sqlx_error("decode_job", e))?;
    let queue: JobQueue = queue.parse()?;
    Ok(Job::in_queue(queue, record_from_row(row)?))
}

fn record_from_row(row: &PgRow) -> JobResult<JobRecord> {
    JobRow::from_row(row)
        .map_err(|e| map_sqlx_error("decode_job", e))?
        .try_into()
}

/// Map SQLx errors to JobError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => JobError::conflict(msg),
                _ => JobError::storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            JobError::storage(format!("connection pool closed in {}", operation))
        }
        _ => JobError::storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: Uuid,
    revision: i64,
    process_instance_id: Option<Uuid>,
    execution_id: Option<Uuid>,
    scope_id: Option<String>,
    scope_type: Option<String>,
    job_type: String,
    handler_type: String,
    handler_configuration: Option<String>,
    due_date: Option<DateTime<Utc>>,
    retries: i64,
    lock_owner: Option<String>,
    lock_expiration_time: Option<DateTime<Utc>>,
    exclusive: bool,
    retry_time_cycle: Option<String>,
    exception_message: Option<String>,
    exception_stacktrace: Option<String>,
    tenant_id: Option<Uuid>,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            revision: row.try_get("revision")?,
            process_instance_id: row.try_get("process_instance_id")?,
            execution_id: row.try_get("execution_id")?,
            scope_id: row.try_get("scope_id")?,
            scope_type: row.try_get("scope_type")?,
            job_type: row.try_get("job_type")?,
            handler_type: row.try_get("handler_type")?,
            handler_configuration: row.try_get("handler_configuration")?,
            due_date: row.try_get("due_date")?,
            retries: row.try_get("retries")?,
            lock_owner: row.try_get("lock_owner")?,
            lock_expiration_time: row.try_get("lock_expiration_time")?,
            exclusive: row.try_get("exclusive")?,
            retry_time_cycle: row.try_get("retry_time_cycle")?,
            exception_message: row.try_get("exception_message")?,
            exception_stacktrace: row.try_get("exception_stacktrace")?,
            tenant_id: row.try_get("tenant_id")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<JobRow> for JobRecord {
    type Error = JobError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let correlation = match (row.process_instance_id, row.execution_id, row.scope_id, row.scope_type) {
            (Some(pi), Some(ex), _, _) => Correlation::process(
                ProcessInstanceId::from_uuid(pi),
                ExecutionId::from_uuid(ex),
            ),
            (None, None, Some(scope_id), Some(scope_type)) => Correlation::Scope {
                scope_id,
                scope_type,
            },
            (None, None, None, None) => Correlation::Unbound,
            _ => {
                return Err(JobError::storage(format!(
                    "job {} has an inconsistent correlation",
                    row.id
                )));
            }
        };

        Ok(JobRecord {
            id: JobId::from_uuid(row.id),
            revision: row.revision.max(0) as u64,
            correlation,
            job_type: row.job_type.parse()?,
            handler_type: row.handler_type,
            handler_configuration: row.handler_configuration,
            due_date: row.due_date,
            retries: u32::try_from(row.retries.max(0)).unwrap_or(u32::MAX),
            lock_owner: row.lock_owner,
            lock_expiration_time: row.lock_expiration_time,
            exclusive: row.exclusive,
            retry_time_cycle: row.retry_time_cycle,
            exception_message: row.exception_message,
            exception_stacktrace: row.exception_stacktrace,
            tenant_id: row.tenant_id.map(TenantId::from_uuid),
            created_at: row.created_at,
        })
    }
}

#[derive(Debug)]
struct ProcessInstanceRow {
    id: Uuid,
    revision: i64,
    lock_owner: Option<String>,
    lock_time: Option<DateTime<Utc>>,
    locking_job: Option<Uuid>,
    tenant_id: Option<Uuid>,
}

impl<'r> FromRow<'r, PgRow> for ProcessInstanceRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(ProcessInstanceRow {
            id: row.try_get("id")?,
            revision: row.try_get("revision")?,
            lock_owner: row.try_get("lock_owner")?,
            lock_time: row.try_get("lock_time")?,
            locking_job: row.try_get("locking_job")?,
            tenant_id: row.try_get("tenant_id")?,
        })
    }
}

impl From<ProcessInstanceRow> for ProcessInstanceRecord {
    fn from(row: ProcessInstanceRow) -> Self {
        ProcessInstanceRecord {
            id: ProcessInstanceId::from_uuid(row.id),
            revision: row.revision.max(0) as u64,
            lock_owner: row.lock_owner,
            lock_time: row.lock_time,
            locking_job: row.locking_job.map(JobId::from_uuid),
            tenant_id: row.tenant_id.map(TenantId::from_uuid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_tables_match_the_schema() {
        for queue in JobQueue::ALL {
            let create = format!("CREATE TABLE IF NOT EXISTS {}", table(queue));
            assert!(SCHEMA.contains(&create), "schema is missing {create}");
        }
    }

    #[test]
    fn union_select_tags_rows_with_their_queue() {
        let sql = union_select(&[JobQueue::Timer, JobQueue::Executable], "id = $1");
        assert!(sql.starts_with("SELECT 'timer' AS queue"));
        assert!(sql.contains("UNION ALL SELECT 'executable' AS queue"));
        assert!(sql.contains("FROM executable_jobs WHERE id = $1"));
    }

    #[test]
    fn insert_checks_every_other_queue() {
        for queue in JobQueue::ALL {
            let sql = occupied_elsewhere(queue);
            assert!(!sql.contains(&format!("FROM {} ", table(queue))));
            for other in JobQueue::ALL.into_iter().filter(|q| *q != queue) {
                assert!(sql.contains(&format!("FROM {} WHERE id = $1", table(other))));
            }
            assert!(sql.ends_with("LIMIT 1"));
        }
    }

    #[test]
    fn half_set_correlations_are_rejected() {
        let row = JobRow {
            id: Uuid::now_v7(),
            revision: 1,
            process_instance_id: Some(Uuid::now_v7()),
            execution_id: None,
            scope_id: None,
            scope_type: None,
            job_type: "message".into(),
            handler_type: "deliver".into(),
            handler_configuration: None,
            due_date: None,
            retries: 3,
            lock_owner: None,
            lock_expiration_time: None,
            exclusive: false,
            retry_time_cycle: None,
            exception_message: None,
            exception_stacktrace: None,
            tenant_id: None,
            created_at: Utc::now(),
        };
        assert!(JobRecord::try_from(row).is_err());
    }
}
