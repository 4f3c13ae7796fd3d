//! HTTP transport behind a pluggable trait.
//!
//! The worker engine never talks to `reqwest` directly: it hands a
//! [`TransportRequest`] to a [`Transport`] and gets back an [`Outcome`] with
//! a classified numeric code. Sentinels: `0` for a connection-level timeout,
//! `-1` for an inconsistent attempt (no usable response). A transport never
//! returns an error; anything it cannot explain becomes Inconsistent.

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use surety_core::AttemptTimings;
use tracing::warn;

use crate::error::{DeliveryError, Result};

/// Reported code for a connection-level timeout.
pub const TIMED_OUT_CODE: i32 = 0;

/// Reported code for an inconsistent attempt.
pub const INCONSISTENT_CODE: i32 = -1;

/// Response bodies are truncated beyond this size before logging.
const MAX_BODY_BYTES: usize = 64 * 1024;

/// One HTTP request as handed to the transport.
///
/// Header values are forwarded verbatim; the engine treats them as opaque
/// (they may be ciphertext decrypted by an upstream proxy).
#[derive(Debug, Clone)]
pub struct TransportRequest {
    /// HTTP method.
    pub method: String,
    /// Destination URL.
    pub url: String,
    /// Request headers.
    pub headers: HashMap<String, String>,
    /// Request body, if any.
    pub payload: Option<String>,
}

/// The classified result of one delivery attempt.
#[derive(Debug, Clone)]
pub struct Outcome {
    /// HTTP status, or a sentinel (`0` timed out, `-1` inconsistent).
    pub code: i32,
    /// Response body; `None` for timeouts and inconsistent attempts.
    pub body: Option<String>,
    /// Response headers; `None` for timeouts and inconsistent attempts.
    pub headers: Option<HashMap<String, Vec<String>>>,
    /// Wall-clock duration of the attempt.
    pub wall: Duration,
    /// Process CPU consumed during the attempt.
    pub cpu: Duration,
}

impl Outcome {
    /// A connection-level timeout.
    pub fn timed_out(wall: Duration, cpu: Duration) -> Self {
        Self { code: TIMED_OUT_CODE, body: None, headers: None, wall, cpu }
    }

    /// An attempt with no usable response.
    pub fn inconsistent(wall: Duration, cpu: Duration) -> Self {
        Self { code: INCONSISTENT_CODE, body: None, headers: None, wall, cpu }
    }

    /// Classification of this outcome's code.
    pub fn kind(&self) -> OutcomeKind {
        OutcomeKind::from_code(self.code)
    }

    /// Attempt measurements in the shape the store persists.
    pub fn timings(&self) -> AttemptTimings {
        AttemptTimings {
            wall_ms: self.wall.as_secs_f64() * 1000.0,
            cpu_ms: self.cpu.as_secs_f64() * 1000.0,
        }
    }
}

/// Outcome classification driving the next state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeKind {
    /// HTTP status in `[200, 299]`.
    Successful,
    /// HTTP status in `[400, 499]`. Non-retryable.
    ClientError,
    /// HTTP status in `[500, 599]`. Retryable.
    ServerError,
    /// Any other real status (1xx, 3xx, ...). Retryable.
    OtherStatus,
    /// Connection-level timeout, code `0`. Retryable.
    TimedOut,
    /// No response and no explanation, code `-1`. Retryable only when the
    /// row opts in.
    Inconsistent,
}

impl OutcomeKind {
    /// Classifies a reported code.
    pub fn from_code(code: i32) -> Self {
        match code {
            200..=299 => Self::Successful,
            400..=499 => Self::ClientError,
            500..=599 => Self::ServerError,
            TIMED_OUT_CODE => Self::TimedOut,
            INCONSISTENT_CODE => Self::Inconsistent,
            _ => Self::OtherStatus,
        }
    }

    /// Whether another attempt may be made for this outcome.
    pub fn is_retryable(self, retry_inconsistent: bool) -> bool {
        match self {
            Self::ServerError | Self::OtherStatus | Self::TimedOut => true,
            Self::Inconsistent => retry_inconsistent,
            Self::Successful | Self::ClientError => false,
        }
    }
}

/// Pluggable HTTP transport.
///
/// Implementations must enforce `timeout` themselves and must not fail:
/// every attempt maps to some [`Outcome`].
pub trait Transport: Send + Sync {
    /// Delivers one request, classifying whatever happened.
    fn send<'a>(
        &'a self,
        request: &'a TransportRequest,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Outcome> + Send + 'a>>;
}

/// Configuration for the reqwest-backed transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// User agent string for requests.
    pub user_agent: String,
    /// Maximum number of redirects to follow.
    pub max_redirects: u32,
    /// Whether to verify TLS certificates.
    pub verify_tls: bool,
    /// Whether to keep upstream connections alive between attempts.
    pub keep_alive: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("surety/{}", env!("CARGO_PKG_VERSION")),
            max_redirects: 3,
            verify_tls: true,
            keep_alive: true,
        }
    }
}

/// HTTP transport backed by a pooled reqwest client.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Creates a transport with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the client cannot be built.
    pub fn new(config: TransportConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects as usize))
            .danger_accept_invalid_certs(!config.verify_tls);

        builder = if config.keep_alive {
            builder.tcp_keepalive(Some(Duration::from_secs(60)))
        } else {
            builder.tcp_keepalive(None).pool_max_idle_per_host(0)
        };

        let client = builder.build().map_err(|e| DeliveryError::Configuration {
            message: format!("failed to build HTTP client: {e}"),
        })?;

        Ok(Self { client })
    }

    /// Creates a transport with default configuration.
    ///
    /// # Errors
    ///
    /// Returns error if the client cannot be built.
    pub fn with_defaults() -> Result<Self> {
        Self::new(TransportConfig::default())
    }

    async fn attempt(&self, request: &TransportRequest, timeout: Duration) -> Outcome {
        let wall_started = Instant::now();
        let cpu_started = process_cpu_now();

        let method = match reqwest::Method::from_bytes(request.method.as_bytes()) {
            Ok(method) => method,
            Err(_) => {
                warn!(method = %request.method, "unsupported HTTP method");
                return Outcome::inconsistent(
                    wall_started.elapsed(),
                    cpu_since(cpu_started),
                );
            },
        };

        let mut http_request =
            self.client.request(method, &request.url).timeout(timeout);

        for (name, value) in &request.headers {
            http_request = http_request.header(name, value);
        }

        if let Some(payload) = &request.payload {
            http_request = http_request.body(payload.clone());
        }

        let response = match http_request.send().await {
            Ok(response) => response,
            Err(e) => {
                let wall = wall_started.elapsed();
                let cpu = cpu_since(cpu_started);
                warn!(url = %request.url, wall_ms = wall.as_millis(), error = %e, "request failed");

                if e.is_timeout() {
                    return Outcome::timed_out(wall, cpu);
                }
                return Outcome::inconsistent(wall, cpu);
            },
        };

        let code = i32::from(response.status().as_u16());
        let headers = collect_headers(response.headers());

        let body = match response.text().await {
            Ok(text) if text.len() > MAX_BODY_BYTES => {
                let mut end = MAX_BODY_BYTES;
                while !text.is_char_boundary(end) {
                    end -= 1;
                }
                format!("{}... (truncated)", &text[..end])
            },
            Ok(text) => text,
            Err(e) => {
                warn!(url = %request.url, error = %e, "failed to read response body");
                format!("[failed to read response body: {e}]")
            },
        };

        Outcome {
            code,
            body: Some(body),
            headers: Some(headers),
            wall: wall_started.elapsed(),
            cpu: cpu_since(cpu_started),
        }
    }
}

impl Transport for HttpTransport {
    fn send<'a>(
        &'a self,
        request: &'a TransportRequest,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Outcome> + Send + 'a>> {
        Box::pin(self.attempt(request, timeout))
    }
}

/// Groups a reqwest header map into name -> values, preserving repeats.
fn collect_headers(header_map: &reqwest::header::HeaderMap) -> HashMap<String, Vec<String>> {
    let mut headers: HashMap<String, Vec<String>> = HashMap::new();

    for (name, value) in header_map {
        if let Ok(value) = value.to_str() {
            headers.entry(name.to_string()).or_default().push(value.to_string());
        }
    }

    headers
}

/// Process CPU clock reading, when the platform exposes one.
#[cfg(unix)]
fn process_cpu_now() -> Option<Duration> {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // SAFETY: ts is a valid out-pointer for the duration of the call.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_PROCESS_CPUTIME_ID, &mut ts) };
    (rc == 0).then(|| {
        Duration::new(u64::try_from(ts.tv_sec).unwrap_or(0), u32::try_from(ts.tv_nsec).unwrap_or(0))
    })
}

#[cfg(not(unix))]
fn process_cpu_now() -> Option<Duration> {
    None
}

fn cpu_since(started: Option<Duration>) -> Duration {
    match (started, process_cpu_now()) {
        (Some(start), Some(end)) => end.saturating_sub(start),
        _ => Duration::ZERO,
    }
}
