//! Database access layer implementing the repository pattern for request
//! persistence.
//!
//! The repository layer translates between domain models and the two tables
//! the engine owns (`requests`, `request_logs`). All SQL lives here; the
//! worker engine only speaks in terms of the semantic operations these
//! repositories expose.

use std::{future::Future, pin::Pin, sync::Arc};

use sqlx::{PgPool, Postgres, Transaction};

pub mod request_logs;
pub mod requests;
pub mod schema;

use crate::error::{is_transient, Result};

type TxFuture<'t, T> =
    Pin<Box<dyn Future<Output = std::result::Result<T, sqlx::Error>> + Send + 't>>;

/// Container for all repository instances providing unified database access.
#[derive(Clone)]
pub struct Storage {
    /// Repository for request rows and their state transitions.
    pub requests: Arc<requests::Repository>,

    /// Repository for the append-only attempt log.
    pub request_logs: Arc<request_logs::Repository>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            requests: Arc::new(requests::Repository::new(pool.clone())),
            request_logs: Arc::new(request_logs::Repository::new(pool)),
        }
    }

    /// Performs a health check on the database connection.
    ///
    /// The worker runs this at the start of each tick (when reconnect is
    /// enabled) so a dropped connection is re-established by the pool before
    /// the claim transaction begins.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.requests.pool()).await?;

        Ok(())
    }
}

/// Runs `op` inside a transaction, retrying transient failures.
///
/// Postgres deadlocks (40P01) and serialization failures (40001) are retried
/// up to 5 attempts; any other error propagates immediately. The transaction
/// is rolled back on drop when `op` fails.
pub async fn with_transaction<T, F>(pool: &PgPool, op: F) -> Result<T>
where
    F: for<'t> Fn(&'t mut Transaction<'static, Postgres>) -> TxFuture<'t, T>,
{
    const MAX_ATTEMPTS: u32 = 5;

    let mut attempt = 1;
    loop {
        let result = async {
            let mut tx = pool.begin().await?;
            let value = op(&mut tx).await?;
            tx.commit().await?;
            Ok::<T, sqlx::Error>(value)
        }
        .await;

        match result {
            Ok(value) => return Ok(value),
            Err(err) if attempt < MAX_ATTEMPTS && is_transient(&err) => {
                tracing::warn!(
                    attempt,
                    error = %err,
                    "transient storage error, retrying transaction"
                );
                attempt += 1;
            },
            Err(err) => return Err(err.into()),
        }
    }
}
