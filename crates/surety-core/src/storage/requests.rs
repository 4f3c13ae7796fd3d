//! Repository for request rows and their state transitions.
//!
//! Exposes the atomic operations the worker engine is built from: the
//! batched claim, the per-row transitions written by the processor, the
//! sweeper's set-based promotion, and the administrative actions. Every
//! mutation keeps the lock and retry invariants: `locked_at` is non-null iff
//! a row is `pending`, `retry_at` is non-null iff a row is `waiting`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    error::{CoreError, Result},
    models::{AttemptTimings, NewRequest, RequestId, RequestState, StoredRequest},
    storage::with_transaction,
};

const COLUMNS: &str = "id, priority, url, method, headers, payload, state, state_changed_at, \
                       retry_at, retry_count, retry_factor, retry_inconsistent, locked_at, \
                       completed_at, abandoned_at, timings_wall_ms, timings_cpu_ms";

/// Repository for request database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Persists a new request in state `ready`.
    ///
    /// Headers are JSON-encoded here, at the single point where caller data
    /// enters the table.
    ///
    /// # Errors
    ///
    /// Returns error if the headers cannot be serialized or the insert fails.
    pub async fn create(&self, request: &NewRequest) -> Result<RequestId> {
        let headers = serde_json::to_string(&request.headers)
            .map_err(|e| CoreError::InvalidInput(format!("unserializable headers: {e}")))?;

        let id: i64 = sqlx::query_scalar(
            r"
            INSERT INTO requests (
                priority, url, method, headers, payload,
                state, state_changed_at, retry_count, retry_factor, retry_inconsistent
            ) VALUES ($1, $2, $3, $4, $5, 'ready', NOW(), 0, $6, $7)
            RETURNING id
            ",
        )
        .bind(request.priority)
        .bind(&request.url)
        .bind(&request.method)
        .bind(headers)
        .bind(&request.payload)
        .bind(request.retry_factor)
        .bind(request.retry_inconsistent)
        .fetch_one(&*self.pool)
        .await?;

        Ok(RequestId(id))
    }

    /// Claims up to `batch_size` ready rows for this worker.
    ///
    /// One transaction: SELECT the first candidates in `(priority, id)` order
    /// with `FOR UPDATE SKIP LOCKED`, then flip them to `pending` and stamp
    /// `locked_at`. SKIP LOCKED keeps concurrent claimers from blocking each
    /// other; deadlocks are retried up to 5 times by [`with_transaction`].
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ClaimFailed` if the SELECT found candidates but
    /// the UPDATE locked none of them, or a database error otherwise.
    pub async fn claim_ready_batch(&self, batch_size: usize) -> Result<Vec<RequestId>> {
        let limit = i64::try_from(batch_size).unwrap_or(i64::MAX);

        let (selected, locked) = with_transaction(&self.pool, move |tx| {
            Box::pin(async move {
                let selected: Vec<i64> = sqlx::query_scalar(
                    r"
                    SELECT id FROM requests
                    WHERE state = 'ready' AND locked_at IS NULL
                    ORDER BY priority ASC, id ASC
                    LIMIT $1
                    FOR UPDATE SKIP LOCKED
                    ",
                )
                .bind(limit)
                .fetch_all(&mut **tx)
                .await?;

                if selected.is_empty() {
                    return Ok((selected, Vec::new()));
                }

                let locked: Vec<i64> = sqlx::query_scalar(
                    r"
                    UPDATE requests
                    SET state = 'pending', state_changed_at = NOW(), locked_at = NOW()
                    WHERE id = ANY($1)
                    RETURNING id
                    ",
                )
                .bind(&selected)
                .fetch_all(&mut **tx)
                .await?;

                Ok((selected, locked))
            })
        })
        .await?;

        if locked.is_empty() && !selected.is_empty() {
            return Err(CoreError::ClaimFailed { selected: selected.len() });
        }

        Ok(locked.into_iter().map(RequestId).collect())
    }

    /// Fetches full rows for the given ids in `(priority, id)` order.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn load(&self, ids: &[RequestId]) -> Result<Vec<StoredRequest>> {
        let raw: Vec<i64> = ids.iter().map(|id| id.0).collect();

        let rows = sqlx::query_as::<_, StoredRequest>(&format!(
            r"
            SELECT {COLUMNS}
            FROM requests
            WHERE id = ANY($1)
            ORDER BY priority ASC, id ASC
            "
        ))
        .bind(&raw)
        .fetch_all(&*self.pool)
        .await?;

        Ok(rows)
    }

    /// Marks a claimed row as delivered. Terminal.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn complete(&self, id: RequestId, timings: AttemptTimings) -> Result<()> {
        sqlx::query(
            r"
            UPDATE requests
            SET state = 'completed', state_changed_at = NOW(), completed_at = NOW(),
                retry_at = NULL, timings_wall_ms = $2, timings_cpu_ms = $3
            WHERE id = $1 AND state = 'pending'
            ",
        )
        .bind(id.0)
        .bind(timings.wall_ms)
        .bind(timings.cpu_ms)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Marks a claimed row as permanently failed. Terminal.
    ///
    /// `retry_count` is written as given: a non-retryable outcome counts the
    /// attempt, exhaustion keeps the count the last deferral wrote.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn fail(
        &self,
        id: RequestId,
        retry_count: i32,
        timings: AttemptTimings,
    ) -> Result<()> {
        sqlx::query(
            r"
            UPDATE requests
            SET state = 'failed', state_changed_at = NOW(), retry_at = NULL,
                retry_count = $2, timings_wall_ms = $3, timings_cpu_ms = $4
            WHERE id = $1 AND state = 'pending'
            ",
        )
        .bind(id.0)
        .bind(retry_count)
        .bind(timings.wall_ms)
        .bind(timings.cpu_ms)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Moves a claimed row back to `waiting` until `retry_at`.
    ///
    /// Timings are optional because a processor pause defers without a
    /// completed measurement; existing timings are kept in that case.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn defer(
        &self,
        id: RequestId,
        retry_at: DateTime<Utc>,
        retry_count: i32,
        timings: Option<AttemptTimings>,
    ) -> Result<()> {
        sqlx::query(
            r"
            UPDATE requests
            SET state = 'waiting', state_changed_at = NOW(), retry_at = $2,
                retry_count = $3,
                timings_wall_ms = COALESCE($4, timings_wall_ms),
                timings_cpu_ms = COALESCE($5, timings_cpu_ms)
            WHERE id = $1 AND state = 'pending'
            ",
        )
        .bind(id.0)
        .bind(retry_at)
        .bind(retry_count)
        .bind(timings.map(|t| t.wall_ms))
        .bind(timings.map(|t| t.cpu_ms))
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Clears the lock stamp. Called unconditionally at the end of
    /// processing, whatever the outcome was.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn unlock(&self, id: RequestId) -> Result<()> {
        sqlx::query("UPDATE requests SET locked_at = NULL WHERE id = $1")
            .bind(id.0)
            .execute(&*self.pool)
            .await?;

        Ok(())
    }

    /// Promotes every `waiting` row whose `retry_at` has elapsed back to
    /// `ready`.
    ///
    /// Set-based and idempotent; concurrent workers running it in the same
    /// second promote each row exactly once between them.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn promote_waiting_to_ready(&self) -> Result<u64> {
        let result = sqlx::query(
            r"
            UPDATE requests
            SET state = 'ready', retry_at = NULL, state_changed_at = NOW()
            WHERE state = 'waiting' AND retry_at <= NOW()
            ",
        )
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Administrative action: stop delivery of a non-terminal row. Terminal.
    ///
    /// # Errors
    ///
    /// Refuses rows that are already terminal with
    /// `CoreError::InvalidTransition`; returns `NotFound` for unknown ids.
    pub async fn abandon(&self, id: RequestId) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE requests
            SET state = 'abandoned', abandoned_at = NOW(), state_changed_at = NOW(),
                locked_at = NULL, retry_at = NULL
            WHERE id = $1 AND state IN ('ready', 'pending', 'waiting')
            ",
        )
        .bind(id.0)
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.find_by_id(id).await? {
                Some(row) => Err(CoreError::InvalidTransition {
                    from: row.state,
                    to: RequestState::Abandoned,
                }),
                None => Err(CoreError::NotFound(format!("request {id}"))),
            };
        }

        Ok(())
    }

    /// Administrative action: release a stuck `pending` row back to `ready`.
    ///
    /// The engine never reaps stale locks on its own; an operator decides
    /// when a worker is dead rather than slow.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` if the row is not pending, `NotFound` for
    /// unknown ids.
    pub async fn release(&self, id: RequestId) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE requests
            SET state = 'ready', locked_at = NULL, state_changed_at = NOW()
            WHERE id = $1 AND state = 'pending'
            ",
        )
        .bind(id.0)
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.find_by_id(id).await? {
                Some(row) => {
                    Err(CoreError::InvalidTransition { from: row.state, to: RequestState::Ready })
                },
                None => Err(CoreError::NotFound(format!("request {id}"))),
            };
        }

        Ok(())
    }

    /// Finds a request by id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: RequestId) -> Result<Option<StoredRequest>> {
        let row = sqlx::query_as::<_, StoredRequest>(&format!(
            r"
            SELECT {COLUMNS}
            FROM requests
            WHERE id = $1
            "
        ))
        .bind(id.0)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(row)
    }

    /// Counts requests in a given state.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn count_by_state(&self, state: RequestState) -> Result<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM requests WHERE state = $1")
            .bind(state)
            .fetch_one(&*self.pool)
            .await?;

        Ok(count.0)
    }

    /// Finds rows stuck in `pending` with a lock stamp older than the cutoff.
    ///
    /// Operator tooling for spotting leaked locks after a worker died
    /// mid-cycle.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_stuck_pending(
        &self,
        locked_before: DateTime<Utc>,
    ) -> Result<Vec<StoredRequest>> {
        let rows = sqlx::query_as::<_, StoredRequest>(&format!(
            r"
            SELECT {COLUMNS}
            FROM requests
            WHERE state = 'pending' AND locked_at IS NOT NULL AND locked_at < $1
            ORDER BY locked_at ASC
            "
        ))
        .bind(locked_before)
        .fetch_all(&*self.pool)
        .await?;

        Ok(rows)
    }
}
