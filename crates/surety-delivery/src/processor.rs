//! Per-row processing: one transport call, one log row, one transition.
//!
//! The next-state decision is a pure function ([`plan_transition`]) so the
//! whole retry ladder is testable without a database or a network.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use surety_core::{Clock, NewRequestLog, Storage, StoredRequest};
use tracing::{debug, info, warn};

use crate::{
    error::Result,
    retry::BackoffPolicy,
    transport::{Outcome, OutcomeKind, Transport, TransportRequest},
};

/// The state a processed row moves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Delivered; terminal.
    Complete,
    /// Permanently failed; terminal.
    Fail {
        /// Attempt count to persist.
        retry_count: i32,
    },
    /// Cooling down until `retry_at`.
    Defer {
        /// Earliest moment of the next attempt.
        retry_at: DateTime<Utc>,
        /// Attempt count to persist.
        retry_count: i32,
    },
}

/// What the processor did with a row, for worker statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// Row reached `completed`.
    Completed,
    /// Row reached `failed`.
    Failed,
    /// Row went back to `waiting`.
    Deferred,
}

/// Computes the next state for a finished attempt.
///
/// `retry_count` is the row's pre-attempt count. A non-retryable outcome
/// counts the attempt it just burned; exhaustion fails the row without
/// touching the count (the last deferral already wrote it). A deferred row
/// backs off by `base_delay * factor^retry_count` from `now`.
pub fn plan_transition(
    kind: OutcomeKind,
    retry_inconsistent: bool,
    retry_count: i32,
    max_retries: i32,
    retry_factor: i32,
    backoff: &BackoffPolicy,
    now: DateTime<Utc>,
) -> Transition {
    if kind == OutcomeKind::Successful {
        return Transition::Complete;
    }

    if !kind.is_retryable(retry_inconsistent) {
        return Transition::Fail { retry_count: retry_count.saturating_add(1) };
    }

    if retry_count >= max_retries {
        return Transition::Fail { retry_count };
    }

    Transition::Defer {
        retry_at: backoff.retry_at(now, retry_factor, retry_count),
        retry_count: retry_count.saturating_add(1),
    }
}

/// Processes one claimed row at a time.
pub struct Processor {
    storage: Arc<Storage>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
    max_retries: i32,
    backoff: BackoffPolicy,
}

impl Processor {
    /// Creates a processor over the given store and transport.
    pub fn new(
        storage: Arc<Storage>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        timeout: Duration,
        max_retries: i32,
        backoff: BackoffPolicy,
    ) -> Self {
        Self { storage, transport, clock, timeout, max_retries, backoff }
    }

    /// Delivers one claimed row: transport call, log append, state write.
    ///
    /// Does not unlock; the worker releases the lock unconditionally after
    /// this returns, whatever happened here.
    ///
    /// # Errors
    ///
    /// Returns error if the log append or the state write fails. The worker
    /// treats that as a processor fault and pauses the row.
    pub async fn process(&self, request: &StoredRequest) -> Result<Applied> {
        let outcome = self.attempt(request).await;

        let log = NewRequestLog {
            response_code: outcome.code,
            response_body: outcome.body.clone(),
            response_headers: outcome
                .headers
                .as_ref()
                .and_then(|headers| serde_json::to_string(headers).ok()),
        };
        self.storage.request_logs.append(request.id, &log).await?;

        let transition = plan_transition(
            outcome.kind(),
            request.retry_inconsistent,
            request.retry_count,
            self.max_retries,
            request.retry_factor,
            &self.backoff,
            self.clock.now_utc(),
        );

        let applied = match transition {
            Transition::Complete => {
                self.storage.requests.complete(request.id, outcome.timings()).await?;
                info!(
                    request_id = %request.id,
                    code = outcome.code,
                    wall_ms = outcome.wall.as_millis(),
                    "request delivered"
                );
                Applied::Completed
            },
            Transition::Fail { retry_count } => {
                self.storage.requests.fail(request.id, retry_count, outcome.timings()).await?;
                warn!(
                    request_id = %request.id,
                    code = outcome.code,
                    retry_count,
                    "request permanently failed"
                );
                Applied::Failed
            },
            Transition::Defer { retry_at, retry_count } => {
                self.storage
                    .requests
                    .defer(request.id, retry_at, retry_count, Some(outcome.timings()))
                    .await?;
                debug!(
                    request_id = %request.id,
                    code = outcome.code,
                    retry_count,
                    retry_at = %retry_at,
                    "request deferred"
                );
                Applied::Deferred
            },
        };

        Ok(applied)
    }

    /// Runs the transport call for a row.
    ///
    /// A header column that does not decode is an attempt that produced
    /// nothing usable, so it classifies as inconsistent rather than killing
    /// the cycle.
    async fn attempt(&self, request: &StoredRequest) -> Outcome {
        let headers = match request.header_map() {
            Ok(headers) => headers,
            Err(e) => {
                warn!(request_id = %request.id, error = %e, "undecodable header column");
                return Outcome::inconsistent(Duration::ZERO, Duration::ZERO);
            },
        };

        let transport_request = TransportRequest {
            method: request.method.clone(),
            url: request.url.clone(),
            headers,
            payload: request.payload.clone(),
        };

        self.transport.send(&transport_request, self.timeout).await
    }
}
