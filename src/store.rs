//! Durable queue operations over the SQLite-backed job store.
//!
//! The store is the only shared mutable state in the system and this adapter
//! is the only component that knows its wire details. Every state transition
//! is a single statement (or a transaction), so concurrent workers contend
//! only through the database and two `reserve` calls can never observe the
//! same job as active.

use sqlx::types::Json;
use sqlx::SqlitePool;
use tokio_stream::StreamExt as _;

use crate::backoff::MAIN_QUEUE;
use crate::error::Error;
use crate::job::{JobRecord, JobState, QueueCounts};
use crate::message::Message;

/// Completed main-queue jobs are retained for at most an hour and at most
/// this many rows, whichever bound is tighter. Failed and dead-letter rows
/// are kept until an operator removes or requeues them.
pub const COMPLETED_RETENTION_MS: i64 = 60 * 60 * 1000;
pub const COMPLETED_RETENTION_COUNT: i64 = 1000;

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Clone)]
pub struct JobStore {
    db: SqlitePool,
}

impl JobStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    /// Inserts a job. Main-queue submissions enter as WAITING with
    /// `attempt_count = 1`.
    pub async fn enqueue(
        &self,
        queue: &str,
        message: &Message,
        state: JobState,
    ) -> Result<i64, Error> {
        let job_id = sqlx::query_scalar(
            "
            INSERT INTO jobs (queue, state, message, attempt_count, not_before, enqueued_at)
            VALUES ($1, $2, $3, 1, 0, $4)
            RETURNING id
            ",
        )
        .bind(queue)
        .bind(state)
        .bind(Json(message))
        .bind(now_ms())
        .fetch_one(&mut *self.db.acquire().await?)
        .await?;

        Ok(job_id)
    }

    /// Atomically hands the next ready job to the caller.
    ///
    /// Ready means WAITING, or DELAYED with an elapsed `not_before`. The
    /// smallest `not_before` wins, ties broken by insertion order. The
    /// selected row is flipped to ACTIVE and `first_attempted_at` is stamped
    /// on the first reservation only.
    pub async fn reserve(
        &self,
        queue: &str,
        worker_id: &str,
    ) -> Result<Option<JobRecord>, Error> {
        let now = now_ms();

        let job = sqlx::query_as(
            "
            WITH next_job AS (
                SELECT id FROM jobs
                WHERE queue = $1
                AND (state = 'waiting' OR (state = 'delayed' AND not_before <= $2))
                ORDER BY not_before ASC, id ASC
                LIMIT 1
            )
            UPDATE jobs
            SET state = 'active',
                reserved_at = $2,
                reserved_by = $3,
                first_attempted_at = COALESCE(first_attempted_at, $2)
            WHERE id IN (SELECT id FROM next_job)
            RETURNING *
            ",
        )
        .bind(queue)
        .bind(now)
        .bind(worker_id)
        .fetch_optional(&mut *self.db.acquire().await?)
        .await?;

        Ok(job)
    }

    /// ACTIVE → COMPLETED. Completed main-queue rows are swept by the
    /// retention policy; dead-letter rows stay retrievable for inspection
    /// and requeue.
    pub async fn complete(&self, job_id: i64) -> Result<(), Error> {
        let queue: Option<String> = sqlx::query_scalar(
            "
            UPDATE jobs
            SET state = 'completed', completed_at = $1, reserved_by = NULL
            WHERE id = $2 AND state = 'active'
            RETURNING queue
            ",
        )
        .bind(now_ms())
        .bind(job_id)
        .fetch_optional(&mut *self.db.acquire().await?)
        .await?;

        match queue {
            Some(queue) if queue == MAIN_QUEUE => self.sweep_completed().await,
            Some(_) => Ok(()),
            None => Err(Error::job_not_found(job_id)),
        }
    }

    /// ACTIVE → DELAYED with `not_before = now + next_delay_ms`. Records the
    /// error and the attempt number the next pickup will represent;
    /// `first_attempted_at` is left untouched.
    pub async fn fail(
        &self,
        job_id: i64,
        error: &str,
        next_delay_ms: u64,
        next_attempt_count: i64,
    ) -> Result<(), Error> {
        let now = now_ms();

        let res = sqlx::query(
            "
            UPDATE jobs
            SET state = 'delayed',
                not_before = $1,
                attempt_count = $2,
                last_error = $3,
                reserved_at = NULL,
                reserved_by = NULL
            WHERE id = $4 AND state = 'active'
            ",
        )
        .bind(now + next_delay_ms as i64)
        .bind(next_attempt_count)
        .bind(error)
        .bind(job_id)
        .execute(&mut *self.db.acquire().await?)
        .await?;

        if res.rows_affected() == 0 {
            return Err(Error::job_not_found(job_id));
        }

        Ok(())
    }

    /// Moves a main-queue job into the dead-letter queue in one statement:
    /// the row leaves the main working set and appears as a WAITING
    /// dead-letter entry with all prior fields preserved.
    pub async fn move_to_dead_letter(
        &self,
        job_id: i64,
        final_error: &str,
    ) -> Result<(), Error> {
        let res = sqlx::query(
            "
            UPDATE jobs
            SET queue = $1,
                state = 'waiting',
                not_before = 0,
                last_error = $2,
                moved_to_dead_letter_at = $3,
                reserved_at = NULL,
                reserved_by = NULL
            WHERE id = $4 AND queue = $5
            ",
        )
        .bind(crate::backoff::DEAD_LETTER_QUEUE)
        .bind(final_error)
        .bind(now_ms())
        .bind(job_id)
        .bind(MAIN_QUEUE)
        .execute(&mut *self.db.acquire().await?)
        .await?;

        if res.rows_affected() == 0 {
            return Err(Error::job_not_found(job_id));
        }

        Ok(())
    }

    /// Promotes a DELAYED job so the next reservation picks it up
    /// immediately. Administrative escape hatch from the backoff schedule.
    pub async fn promote(&self, queue: &str, job_id: i64) -> Result<(), Error> {
        let res = sqlx::query(
            "
            UPDATE jobs
            SET state = 'waiting', not_before = 0
            WHERE id = $1 AND queue = $2 AND state = 'delayed'
            ",
        )
        .bind(job_id)
        .bind(queue)
        .execute(&mut *self.db.acquire().await?)
        .await?;

        if res.rows_affected() == 0 {
            return Err(Error::job_not_found(job_id));
        }

        Ok(())
    }

    pub async fn list(
        &self,
        queue: &str,
        state: Option<JobState>,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<JobRecord>, Error> {
        let mut db = self.db.acquire().await?;

        let mut stream = sqlx::query_as(
            "
            SELECT * FROM jobs
            WHERE queue = $1 AND ($2 IS NULL OR state = $2)
            ORDER BY id ASC
            LIMIT $3 OFFSET $4
            ",
        )
        .bind(queue)
        .bind(state)
        .bind(limit)
        .bind(offset)
        .fetch(&mut *db);

        let mut jobs = Vec::new();

        while let Some(job) = stream.next().await.transpose()? {
            jobs.push(job);
        }

        Ok(jobs)
    }

    pub async fn get(&self, queue: &str, job_id: i64) -> Result<Option<JobRecord>, Error> {
        Ok(
            sqlx::query_as("SELECT * FROM jobs WHERE queue = $1 AND id = $2")
                .bind(queue)
                .bind(job_id)
                .fetch_optional(&mut *self.db.acquire().await?)
                .await?,
        )
    }

    /// Looks a job up across queues in the given order; the first hit wins.
    pub async fn get_any(
        &self,
        queues: &[&str],
        job_id: i64,
    ) -> Result<Option<JobRecord>, Error> {
        for queue in queues {
            if let Some(job) = self.get(queue, job_id).await? {
                return Ok(Some(job));
            }
        }

        Ok(None)
    }

    pub async fn remove(&self, queue: &str, job_id: i64) -> Result<(), Error> {
        let res = sqlx::query("DELETE FROM jobs WHERE queue = $1 AND id = $2")
            .bind(queue)
            .bind(job_id)
            .execute(&mut *self.db.acquire().await?)
            .await?;

        if res.rows_affected() == 0 {
            return Err(Error::job_not_found(job_id));
        }

        Ok(())
    }

    pub async fn counts(&self, queue: &str) -> Result<QueueCounts, Error> {
        let rows: Vec<(JobState, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM jobs WHERE queue = $1 GROUP BY state")
                .bind(queue)
                .fetch_all(&mut *self.db.acquire().await?)
                .await?;

        let mut counts = QueueCounts::default();
        for (state, count) in rows {
            match state {
                JobState::Waiting => counts.waiting = count,
                JobState::Active => counts.active = count,
                JobState::Completed => counts.completed = count,
                JobState::Failed => counts.failed = count,
                JobState::Delayed => counts.delayed = count,
            }
        }

        Ok(counts)
    }

    /// Resets reservations whose worker never came back (crash, forced
    /// shutdown). Stuck ACTIVE rows older than the threshold return to
    /// WAITING and become reservable again.
    pub async fn reap_stale(&self, queue: &str, threshold_ms: i64) -> Result<u64, Error> {
        let res = sqlx::query(
            "
            UPDATE jobs
            SET state = 'waiting', not_before = 0, reserved_at = NULL, reserved_by = NULL
            WHERE queue = $1 AND state = 'active' AND reserved_at < $2
            ",
        )
        .bind(queue)
        .bind(now_ms() - threshold_ms)
        .execute(&mut *self.db.acquire().await?)
        .await?;

        Ok(res.rows_affected())
    }

    /// Purges every record in a queue. Test reset only.
    pub async fn obliterate(&self, queue: &str) -> Result<(), Error> {
        sqlx::query("DELETE FROM jobs WHERE queue = $1")
            .bind(queue)
            .execute(&mut *self.db.acquire().await?)
            .await?;

        Ok(())
    }

    async fn sweep_completed(&self) -> Result<(), Error> {
        let mut tx = self.db.begin().await?;

        sqlx::query(
            "
            DELETE FROM jobs
            WHERE queue = $1 AND state = 'completed' AND completed_at < $2
            ",
        )
        .bind(MAIN_QUEUE)
        .bind(now_ms() - COMPLETED_RETENTION_MS)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "
            DELETE FROM jobs
            WHERE queue = $1 AND state = 'completed' AND id NOT IN (
                SELECT id FROM jobs
                WHERE queue = $1 AND state = 'completed'
                ORDER BY completed_at DESC, id DESC
                LIMIT $2
            )
            ",
        )
        .bind(MAIN_QUEUE)
        .bind(COMPLETED_RETENTION_COUNT)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(())
    }
}
