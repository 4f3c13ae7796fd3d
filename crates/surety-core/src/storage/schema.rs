//! Idempotent schema bootstrap for the two tables the engine owns.
//!
//! Shared by the service binary and the test harness so the DDL lives in one
//! place. Partial indexes cover the two hot predicates: the claim SELECT and
//! the sweeper UPDATE.

use sqlx::PgPool;

use crate::error::Result;

/// Creates the `requests` and `request_logs` tables and their indexes.
///
/// # Errors
///
/// Returns error if any DDL statement fails.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS requests (
            id BIGSERIAL PRIMARY KEY,
            priority INTEGER NOT NULL DEFAULT 0,
            url TEXT NOT NULL,
            method TEXT NOT NULL,
            headers TEXT NOT NULL DEFAULT '{}',
            payload TEXT,
            state TEXT NOT NULL DEFAULT 'ready',
            state_changed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            retry_at TIMESTAMPTZ,
            retry_count INTEGER NOT NULL DEFAULT 0,
            retry_factor INTEGER NOT NULL DEFAULT 2,
            retry_inconsistent BOOLEAN NOT NULL DEFAULT FALSE,
            locked_at TIMESTAMPTZ,
            completed_at TIMESTAMPTZ,
            abandoned_at TIMESTAMPTZ,
            timings_wall_ms DOUBLE PRECISION,
            timings_cpu_ms DOUBLE PRECISION
        )
        ",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS request_logs (
            id BIGSERIAL PRIMARY KEY,
            request_id BIGINT NOT NULL REFERENCES requests(id),
            response_code INTEGER NOT NULL,
            response_body TEXT,
            response_headers TEXT,
            attempted_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        ",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r"
        CREATE INDEX IF NOT EXISTS idx_requests_ready
        ON requests (priority, id)
        WHERE state = 'ready' AND locked_at IS NULL
        ",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r"
        CREATE INDEX IF NOT EXISTS idx_requests_waiting
        ON requests (retry_at)
        WHERE state = 'waiting'
        ",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r"
        CREATE INDEX IF NOT EXISTS idx_request_logs_request
        ON request_logs (request_id, attempted_at)
        ",
    )
    .execute(pool)
    .await?;

    Ok(())
}
