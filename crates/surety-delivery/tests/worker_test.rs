//! End-to-end worker tests against a real database and a mock upstream.
//!
//! These run against the Postgres named by `DATABASE_URL` and skip
//! themselves when none is configured. The upstream is always wiremock, so
//! every delivery outcome is scripted.

use std::{sync::Arc, time::Duration};

use surety_core::{Clock, RealClock, RequestId, RequestState, Storage};
use surety_delivery::{HttpTransport, Transport, Worker, WorkerConfig};
use surety_testing::{make_retry_due, RequestBuilder, TestClock, TestDatabase};
use tokio_util::sync::CancellationToken;
use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

macro_rules! require_database {
    () => {
        match TestDatabase::try_new().await.expect("test database setup failed") {
            Some(db) => db,
            None => {
                eprintln!("skipping: DATABASE_URL not set");
                return;
            },
        }
    };
}

fn test_config() -> WorkerConfig {
    WorkerConfig {
        batch_size: 10,
        tick: Duration::from_millis(10),
        timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

fn worker_with(
    storage: Arc<Storage>,
    config: WorkerConfig,
    clock: Arc<dyn Clock>,
) -> (Worker, CancellationToken) {
    let transport: Arc<dyn Transport> =
        Arc::new(HttpTransport::with_defaults().expect("transport should build"));
    let token = CancellationToken::new();
    let worker = Worker::new(storage, transport, config, token.clone(), clock)
        .expect("worker should construct");
    (worker, token)
}

/// Drives enough cycles to promote a due waiting row and deliver it again:
/// one cycle for the sweep (after opening the gate) and one for the claim.
async fn promote_and_redeliver(worker: &Worker, clock: &TestClock, pool: &sqlx::PgPool, id: RequestId) {
    make_retry_due(pool, id).await.expect("rewind retry_at");
    clock.advance(Duration::from_secs(2));
    worker.cycle().await.expect("sweep cycle");
    worker.cycle().await.expect("delivery cycle");
}

#[tokio::test]
async fn happy_path_completes_in_one_cycle() {
    surety_testing::init_tracing();
    let db = require_database!();
    let storage = Arc::new(db.storage());
    let mock_server = MockServer::start().await;

    Mock::given(matchers::method("GET"))
        .and(matchers::path("/ok"))
        .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let id = RequestBuilder::get(format!("{}/ok", mock_server.uri()))
        .priority(5)
        .insert(&storage)
        .await
        .unwrap();

    let (worker, _token) = worker_with(storage.clone(), test_config(), Arc::new(RealClock::new()));
    let claimed = worker.cycle().await.unwrap();
    assert_eq!(claimed, 1);

    let row = storage.requests.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(row.state, RequestState::Completed);
    assert_eq!(row.retry_count, 0);
    assert!(row.locked_at.is_none());
    assert!(row.completed_at.is_some());
    assert!(row.timings_wall_ms.is_some());

    let logs = storage.request_logs.find_by_request(id).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].response_code, 200);

    mock_server.verify().await;
    db.cleanup().await.unwrap();
}

#[tokio::test]
async fn client_error_fails_without_retry() {
    let db = require_database!();
    let storage = Arc::new(db.storage());
    let mock_server = MockServer::start().await;

    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(404).set_body_string("Not Found"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let id = RequestBuilder::post(format!("{}/hook", mock_server.uri()))
        .insert(&storage)
        .await
        .unwrap();

    let (worker, _token) = worker_with(storage.clone(), test_config(), Arc::new(RealClock::new()));
    worker.cycle().await.unwrap();

    let row = storage.requests.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(row.state, RequestState::Failed);
    assert_eq!(row.retry_count, 1);
    assert!(row.retry_at.is_none());
    assert!(row.locked_at.is_none());

    let logs = storage.request_logs.find_by_request(id).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].response_code, 404);

    mock_server.verify().await;
    db.cleanup().await.unwrap();
}

#[tokio::test]
async fn server_errors_back_off_with_increasing_retry_at() {
    let db = require_database!();
    let storage = Arc::new(db.storage());
    let mock_server = MockServer::start().await;

    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("Service Unavailable"))
        .mount(&mock_server)
        .await;

    let id = RequestBuilder::post(format!("{}/hook", mock_server.uri()))
        .insert(&storage)
        .await
        .unwrap();

    let clock = TestClock::new();
    let (worker, _token) =
        worker_with(storage.clone(), test_config(), Arc::new(clock.clone()));

    worker.cycle().await.unwrap();
    let row = storage.requests.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(row.state, RequestState::Waiting);
    assert_eq!(row.retry_count, 1);
    let first_retry_at = row.retry_at.expect("waiting row carries retry_at");

    promote_and_redeliver(&worker, &clock, &db.pool(), id).await;
    let row = storage.requests.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(row.state, RequestState::Waiting);
    assert_eq!(row.retry_count, 2);
    assert!(row.retry_at.expect("retry_at") > first_retry_at);

    promote_and_redeliver(&worker, &clock, &db.pool(), id).await;
    let row = storage.requests.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(row.state, RequestState::Waiting);
    assert_eq!(row.retry_count, 3);

    assert_eq!(storage.request_logs.count_by_request(id).await.unwrap(), 3);

    db.cleanup().await.unwrap();
}

#[tokio::test]
async fn exhausted_retries_mark_the_row_failed() {
    let db = require_database!();
    let storage = Arc::new(db.storage());
    let mock_server = MockServer::start().await;

    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("Service Unavailable"))
        .mount(&mock_server)
        .await;

    let id = RequestBuilder::post(format!("{}/hook", mock_server.uri()))
        .insert(&storage)
        .await
        .unwrap();

    let clock = TestClock::new();
    let config = WorkerConfig { max_retries: 2, ..test_config() };
    let (worker, _token) = worker_with(storage.clone(), config, Arc::new(clock.clone()));

    // Attempt 1: defer with count 1.
    worker.cycle().await.unwrap();
    let row = storage.requests.find_by_id(id).await.unwrap().unwrap();
    assert_eq!((row.state, row.retry_count), (RequestState::Waiting, 1));

    // Attempt 2: still within budget, defer with count 2.
    promote_and_redeliver(&worker, &clock, &db.pool(), id).await;
    let row = storage.requests.find_by_id(id).await.unwrap().unwrap();
    assert_eq!((row.state, row.retry_count), (RequestState::Waiting, 2));

    // Attempt 3: budget exhausted, fail with the count untouched.
    promote_and_redeliver(&worker, &clock, &db.pool(), id).await;
    let row = storage.requests.find_by_id(id).await.unwrap().unwrap();
    assert_eq!((row.state, row.retry_count), (RequestState::Failed, 2));
    assert!(row.locked_at.is_none());

    assert_eq!(storage.request_logs.count_by_request(id).await.unwrap(), 3);

    db.cleanup().await.unwrap();
}

#[tokio::test]
async fn timeouts_defer_with_the_sentinel_code() {
    let db = require_database!();
    let storage = Arc::new(db.storage());
    let mock_server = MockServer::start().await;

    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&mock_server)
        .await;

    let id = RequestBuilder::post(format!("{}/hook", mock_server.uri()))
        .insert(&storage)
        .await
        .unwrap();

    let config = WorkerConfig { timeout: Duration::from_millis(100), ..test_config() };
    let (worker, _token) = worker_with(storage.clone(), config, Arc::new(RealClock::new()));
    worker.cycle().await.unwrap();

    let row = storage.requests.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(row.state, RequestState::Waiting);
    assert_eq!(row.retry_count, 1);

    let logs = storage.request_logs.find_by_request(id).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].response_code, 0);
    assert!(logs[0].response_body.is_none());
    assert!(logs[0].response_headers.is_none());

    db.cleanup().await.unwrap();
}

#[tokio::test]
async fn inconsistent_outcome_is_fatal_without_opt_in() {
    let db = require_database!();
    let storage = Arc::new(db.storage());

    // Nothing listens here: a connection error, not a timeout.
    let id = RequestBuilder::post("http://127.0.0.1:9/hook").insert(&storage).await.unwrap();

    let (worker, _token) = worker_with(storage.clone(), test_config(), Arc::new(RealClock::new()));
    worker.cycle().await.unwrap();

    let row = storage.requests.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(row.state, RequestState::Failed);
    assert_eq!(row.retry_count, 1);
    assert!(row.locked_at.is_none());

    let logs = storage.request_logs.find_by_request(id).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].response_code, -1);
    assert!(logs[0].response_body.is_none());

    db.cleanup().await.unwrap();
}

#[tokio::test]
async fn inconsistent_outcome_defers_with_opt_in() {
    let db = require_database!();
    let storage = Arc::new(db.storage());

    let id = RequestBuilder::post("http://127.0.0.1:9/hook")
        .retry_inconsistent()
        .insert(&storage)
        .await
        .unwrap();

    let (worker, _token) = worker_with(storage.clone(), test_config(), Arc::new(RealClock::new()));
    worker.cycle().await.unwrap();

    let row = storage.requests.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(row.state, RequestState::Waiting);
    assert_eq!(row.retry_count, 1);

    db.cleanup().await.unwrap();
}

#[tokio::test]
async fn batches_are_processed_in_priority_then_id_order() {
    let db = require_database!();
    let storage = Arc::new(db.storage());
    let mock_server = MockServer::start().await;

    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;

    RequestBuilder::post(format!("{}/later", mock_server.uri()))
        .priority(5)
        .insert(&storage)
        .await
        .unwrap();
    RequestBuilder::post(format!("{}/first", mock_server.uri()))
        .priority(1)
        .insert(&storage)
        .await
        .unwrap();

    let (worker, _token) = worker_with(storage.clone(), test_config(), Arc::new(RealClock::new()));
    worker.cycle().await.unwrap();

    let received = mock_server.received_requests().await.expect("recording enabled");
    let paths: Vec<_> = received.iter().map(|r| r.url.path().to_string()).collect();
    assert_eq!(paths, vec!["/first", "/later"]);

    db.cleanup().await.unwrap();
}

#[tokio::test]
async fn concurrent_workers_deliver_every_row_exactly_once() {
    let db = require_database!();
    let storage = Arc::new(db.storage());
    let mock_server = MockServer::start().await;

    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(10)
        .mount(&mock_server)
        .await;

    let mut ids = Vec::new();
    for i in 0..10 {
        let id = RequestBuilder::post(format!("{}/hook/{i}", mock_server.uri()))
            .insert(&storage)
            .await
            .unwrap();
        ids.push(id);
    }

    let (worker_a, _token_a) =
        worker_with(storage.clone(), test_config(), Arc::new(RealClock::new()));
    let (worker_b, _token_b) =
        worker_with(storage.clone(), test_config(), Arc::new(RealClock::new()));

    let (a, b) = tokio::join!(worker_a.cycle(), worker_b.cycle());
    assert_eq!(a.unwrap() + b.unwrap(), 10);

    for id in ids {
        let row = storage.requests.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(row.state, RequestState::Completed);
        assert_eq!(storage.request_logs.count_by_request(id).await.unwrap(), 1);
    }

    mock_server.verify().await;
    db.cleanup().await.unwrap();
}

#[tokio::test]
async fn graceful_shutdown_finishes_the_batch_and_leaves_no_locks() {
    let db = require_database!();
    let storage = Arc::new(db.storage());
    let mock_server = MockServer::start().await;

    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(200)))
        .expect(2)
        .mount(&mock_server)
        .await;

    let first = RequestBuilder::post(format!("{}/a", mock_server.uri()))
        .insert(&storage)
        .await
        .unwrap();
    let second = RequestBuilder::post(format!("{}/b", mock_server.uri()))
        .insert(&storage)
        .await
        .unwrap();

    let (worker, token) = worker_with(storage.clone(), test_config(), Arc::new(RealClock::new()));
    let worker = Arc::new(worker);

    let handle = tokio::spawn({
        let worker = worker.clone();
        async move { worker.run().await }
    });

    // Cancel while the first delivery is still in flight.
    tokio::time::sleep(Duration::from_millis(50)).await;
    token.cancel();

    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("worker should stop after the cycle")
        .expect("worker task should not panic");

    for id in [first, second] {
        let row = storage.requests.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(row.state, RequestState::Completed, "row {id} must finish before shutdown");
        assert!(row.locked_at.is_none(), "no lock stamp may survive a graceful shutdown");
    }

    mock_server.verify().await;
    db.cleanup().await.unwrap();
}

#[tokio::test]
async fn stats_track_processing_outcomes() {
    let db = require_database!();
    let storage = Arc::new(db.storage());
    let mock_server = MockServer::start().await;

    Mock::given(matchers::method("POST"))
        .and(matchers::path("/ok"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;
    Mock::given(matchers::method("POST"))
        .and(matchers::path("/bad"))
        .respond_with(ResponseTemplate::new(400))
        .mount(&mock_server)
        .await;
    Mock::given(matchers::method("POST"))
        .and(matchers::path("/busy"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&mock_server)
        .await;

    for path in ["ok", "bad", "busy"] {
        RequestBuilder::post(format!("{}/{path}", mock_server.uri()))
            .insert(&storage)
            .await
            .unwrap();
    }

    let (worker, _token) = worker_with(storage.clone(), test_config(), Arc::new(RealClock::new()));
    worker.cycle().await.unwrap();

    let stats = worker.stats().await;
    assert_eq!(stats.claimed, 3);
    assert_eq!(stats.processed, 3);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.deferred, 1);

    db.cleanup().await.unwrap();
}
