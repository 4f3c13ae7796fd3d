//! Builders and helpers for seeding request rows in tests.

use anyhow::Result;
use sqlx::PgPool;
use surety_core::{NewRequest, RequestId, Storage};

/// Fluent builder over [`NewRequest`] with test-friendly defaults.
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    inner: NewRequest,
}

impl RequestBuilder {
    /// A POST request to the given URL.
    pub fn post(url: impl Into<String>) -> Self {
        Self { inner: NewRequest::new("POST", url) }
    }

    /// A GET request to the given URL.
    pub fn get(url: impl Into<String>) -> Self {
        Self { inner: NewRequest::new("GET", url) }
    }

    /// Sets the claim priority (lower is earlier).
    #[must_use]
    pub fn priority(mut self, priority: i32) -> Self {
        self.inner.priority = priority;
        self
    }

    /// Adds one request header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.inner.headers.insert(name.into(), value.into());
        self
    }

    /// Sets the request body.
    #[must_use]
    pub fn payload(mut self, payload: impl Into<String>) -> Self {
        self.inner.payload = Some(payload.into());
        self
    }

    /// Sets the per-row backoff factor.
    #[must_use]
    pub fn retry_factor(mut self, factor: i32) -> Self {
        self.inner.retry_factor = factor;
        self
    }

    /// Opts the row into retrying inconsistent outcomes.
    #[must_use]
    pub fn retry_inconsistent(mut self) -> Self {
        self.inner.retry_inconsistent = true;
        self
    }

    /// The built request intent.
    pub fn build(self) -> NewRequest {
        self.inner
    }

    /// Persists the request and returns its id.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn insert(self, storage: &Storage) -> Result<RequestId> {
        Ok(storage.requests.create(&self.inner).await?)
    }
}

/// Rewinds a waiting row's `retry_at` into the past so the next sweep
/// promotes it immediately.
///
/// # Errors
///
/// Returns error if the update fails.
pub async fn make_retry_due(pool: &PgPool, id: RequestId) -> Result<()> {
    sqlx::query(
        "UPDATE requests SET retry_at = NOW() - INTERVAL '1 second' \
         WHERE id = $1 AND state = 'waiting'",
    )
    .bind(id.0)
    .execute(pool)
    .await?;

    Ok(())
}
