//! Repository for the append-only attempt log.
//!
//! One row per delivery attempt, immutable once written. The log is the
//! audit trail operators read when a request surfaces as failed.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{
    error::Result,
    models::{NewRequestLog, RequestId, RequestLog},
};

/// Repository for request log database operations.
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

    /// Appends one attempt row for a request.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn append(&self, request_id: RequestId, log: &NewRequestLog) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r"
            INSERT INTO request_logs (
                request_id, response_code, response_body, response_headers, attempted_at
            ) VALUES ($1, $2, $3, $4, NOW())
            RETURNING id
            ",
        )
        .bind(request_id.0)
        .bind(log.response_code)
        .bind(&log.response_body)
        .bind(&log.response_headers)
        .fetch_one(&*self.pool)
        .await?;

        Ok(id)
    }

    /// Lists attempts for a request in chronological order.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_request(&self, request_id: RequestId) -> Result<Vec<RequestLog>> {
        let logs = sqlx::query_as::<_, RequestLog>(
            r"
            SELECT id, request_id, response_code, response_body, response_headers, attempted_at
            FROM request_logs
            WHERE request_id = $1
            ORDER BY attempted_at ASC, id ASC
            ",
        )
        .bind(request_id.0)
        .fetch_all(&*self.pool)
        .await?;

        Ok(logs)
    }

    /// Counts attempts recorded for a request.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn count_by_request(&self, request_id: RequestId) -> Result<i64> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM request_logs WHERE request_id = $1")
                .bind(request_id.0)
                .fetch_one(&*self.pool)
                .await?;

        Ok(count.0)
    }
}
