//! Domain models and strongly-typed identifiers.
//!
//! Defines the persisted request, its lifecycle states, and the append-only
//! attempt log. Includes database serialization traits and the state
//! transition rules enforced by the worker engine.

use std::{collections::HashMap, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Strongly-typed request identifier.
///
/// Wraps the monotonic `BIGSERIAL` primary key of the requests table. Batch
/// ordering is `(priority, id)`, so ids double as a stable FIFO tiebreaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(pub i64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl sqlx::Type<PgDb> for RequestId {
    fn type_info() -> PgTypeInfo {
        <i64 as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for RequestId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let id = <i64 as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(id))
    }
}

impl sqlx::Encode<'_, PgDb> for RequestId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <i64 as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Request lifecycle state.
///
/// Requests progress through these states while the worker engine drains the
/// queue. Transitions are strictly controlled:
///
/// ```text
/// ready -> pending -> completed
///      ^          -> failed
///      |          -> waiting -> ready (sweeper)
///      |
///      +-- release (operator, from stuck pending)
///
/// any non-terminal -> abandoned (operator)
/// ```
///
/// `completed`, `failed`, and `abandoned` are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    /// Eligible for immediate claim by any worker.
    Ready,

    /// Locked by a worker and being processed this cycle.
    ///
    /// A row in this state always carries a non-null `locked_at`.
    Pending,

    /// Cooling down until `retry_at`; the sweeper promotes it back to ready.
    Waiting,

    /// Delivered with a 2xx response. Terminal.
    Completed,

    /// The engine's verdict: non-retryable outcome or exhausted retries.
    /// Terminal.
    Failed,

    /// An operator decision to stop delivery. Terminal.
    Abandoned,
}

impl RequestState {
    /// Canonical database representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Pending => "pending",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
        }
    }

    /// Whether this state is absorbing.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Abandoned)
    }

    /// Whether the engine or an operator may move a row from `self` to `next`.
    pub const fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::Ready => matches!(next, Self::Pending | Self::Abandoned),
            Self::Pending => matches!(
                next,
                Self::Completed | Self::Failed | Self::Waiting | Self::Ready | Self::Abandoned
            ),
            Self::Waiting => matches!(next, Self::Ready | Self::Abandoned),
            Self::Completed | Self::Failed | Self::Abandoned => false,
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ready" => Ok(Self::Ready),
            "pending" => Ok(Self::Pending),
            "waiting" => Ok(Self::Waiting),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "abandoned" => Ok(Self::Abandoned),
            other => Err(format!("unknown request state: {other}")),
        }
    }
}

impl sqlx::Type<PgDb> for RequestState {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for RequestState {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let raw = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        raw.parse().map_err(Into::into)
    }
}

impl sqlx::Encode<'_, PgDb> for RequestState {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// A persisted request row.
///
/// Header values may be ciphertext when the caller stores credentials
/// encrypted at rest; the engine forwards them verbatim and never inspects
/// them.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StoredRequest {
    /// Monotonic identifier.
    pub id: RequestId,

    /// Lower value is claimed earlier within a batch.
    pub priority: i32,

    /// Destination URL.
    pub url: String,

    /// HTTP method verbatim from the caller.
    pub method: String,

    /// JSON-encoded request headers.
    pub headers: String,

    /// Request body, if any.
    pub payload: Option<String>,

    /// Current lifecycle state.
    pub state: RequestState,

    /// Timestamp of the last state transition.
    pub state_changed_at: DateTime<Utc>,

    /// Earliest moment the row may return to ready. Set iff waiting.
    pub retry_at: Option<DateTime<Utc>>,

    /// Completed delivery attempts that did not end in `completed`.
    pub retry_count: i32,

    /// Exponential base for backoff, per row.
    pub retry_factor: i32,

    /// Whether inconsistent transport outcomes are retried or fatal.
    pub retry_inconsistent: bool,

    /// Lock stamp. Set iff pending.
    pub locked_at: Option<DateTime<Utc>>,

    /// Terminal timestamp for completed rows.
    pub completed_at: Option<DateTime<Utc>>,

    /// Terminal timestamp for abandoned rows.
    pub abandoned_at: Option<DateTime<Utc>>,

    /// Wall-clock duration of the last attempt, milliseconds.
    pub timings_wall_ms: Option<f64>,

    /// Process CPU consumed by the last attempt, milliseconds.
    pub timings_cpu_ms: Option<f64>,
}

impl StoredRequest {
    /// Decodes the JSON header column into a name/value map.
    pub fn header_map(&self) -> serde_json::Result<HashMap<String, String>> {
        if self.headers.is_empty() {
            return Ok(HashMap::new());
        }
        serde_json::from_str(&self.headers)
    }
}

/// Caller-side intent to deliver one HTTP request.
///
/// Rows are always created in state `ready`; the worker engine owns every
/// transition after insertion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRequest {
    /// Lower value is claimed earlier within a batch.
    #[serde(default)]
    pub priority: i32,

    /// Destination URL.
    pub url: String,

    /// HTTP method.
    pub method: String,

    /// Request headers; serialized to JSON on insert.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Request body, if any.
    #[serde(default)]
    pub payload: Option<String>,

    /// Exponential base for backoff.
    #[serde(default = "default_retry_factor")]
    pub retry_factor: i32,

    /// Whether inconsistent transport outcomes are retried.
    #[serde(default)]
    pub retry_inconsistent: bool,
}

impl NewRequest {
    /// Creates a request intent with default priority and retry settings.
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            priority: 0,
            url: url.into(),
            method: method.into(),
            headers: HashMap::new(),
            payload: None,
            retry_factor: default_retry_factor(),
            retry_inconsistent: false,
        }
    }
}

const fn default_retry_factor() -> i32 {
    2
}

/// One delivery attempt, appended after every transport call.
///
/// Attempt rows are immutable once written. `response_code` carries the
/// sentinel values `0` (connection-level timeout) and `-1` (inconsistent
/// outcome, no usable response).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RequestLog {
    /// Log row identifier.
    pub id: i64,

    /// Owning request.
    pub request_id: RequestId,

    /// HTTP status, or a sentinel for timeout/inconsistent outcomes.
    pub response_code: i32,

    /// Response body; null for inconsistent outcomes.
    pub response_body: Option<String>,

    /// JSON-encoded response headers; null for inconsistent outcomes.
    pub response_headers: Option<String>,

    /// When the attempt finished.
    pub attempted_at: DateTime<Utc>,
}

/// Attempt log fields supplied by the processor.
#[derive(Debug, Clone)]
pub struct NewRequestLog {
    /// HTTP status, or a sentinel for timeout/inconsistent outcomes.
    pub response_code: i32,

    /// Response body; null for inconsistent outcomes.
    pub response_body: Option<String>,

    /// JSON-encoded response headers; null for inconsistent outcomes.
    pub response_headers: Option<String>,
}

/// Durations measured around one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AttemptTimings {
    /// Wall-clock milliseconds.
    pub wall_ms: f64,

    /// Process CPU milliseconds.
    pub cpu_ms: f64,
}
