//! Schema-isolated test databases.
//!
//! Each `TestDatabase` creates a throwaway Postgres schema inside the
//! database `DATABASE_URL` points at, so parallel tests never see each
//! other's rows. Integration tests skip themselves when no database is
//! configured.

use anyhow::{Context, Result};
use rand::{distr::Alphanumeric, Rng};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions},
    PgPool,
};
use surety_core::{storage::schema::ensure_schema, Storage};

/// A pool scoped to a fresh, uniquely named schema.
pub struct TestDatabase {
    pool: PgPool,
    admin: PgPool,
    schema: String,
}

impl TestDatabase {
    /// Connects to the database named by `DATABASE_URL` and provisions an
    /// isolated schema with the engine's tables.
    ///
    /// Returns `Ok(None)` when `DATABASE_URL` is unset, so callers can skip
    /// database-backed tests on machines without Postgres.
    ///
    /// # Errors
    ///
    /// Returns error if the connection or the schema bootstrap fails.
    pub async fn try_new() -> Result<Option<Self>> {
        let Ok(url) = std::env::var("DATABASE_URL") else {
            return Ok(None);
        };

        let admin = PgPoolOptions::new()
            .max_connections(2)
            .connect(&url)
            .await
            .context("failed to connect to the test database")?;

        let suffix: String =
            rand::rng().sample_iter(&Alphanumeric).take(12).map(char::from).collect();
        let schema = format!("surety_test_{}", suffix.to_lowercase());

        sqlx::query(&format!("CREATE SCHEMA {schema}"))
            .execute(&admin)
            .await
            .context("failed to create test schema")?;

        let options: PgConnectOptions =
            url.parse().context("DATABASE_URL is not a valid Postgres URL")?;
        let options = options.options([("search_path", schema.as_str())]);

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("failed to connect to the test schema")?;

        ensure_schema(&pool).await.context("failed to create engine tables")?;

        Ok(Some(Self { pool, admin, schema }))
    }

    /// Pool scoped to this test's schema.
    pub fn pool(&self) -> PgPool {
        self.pool.clone()
    }

    /// Storage over this test's schema.
    pub fn storage(&self) -> Storage {
        Storage::new(self.pool.clone())
    }

    /// Drops the schema and everything in it.
    ///
    /// # Errors
    ///
    /// Returns error if the drop fails; leaked schemas are harmless but
    /// clutter the test database.
    pub async fn cleanup(self) -> Result<()> {
        self.pool.close().await;
        sqlx::query(&format!("DROP SCHEMA {} CASCADE", self.schema))
            .execute(&self.admin)
            .await
            .context("failed to drop test schema")?;
        self.admin.close().await;
        Ok(())
    }
}
