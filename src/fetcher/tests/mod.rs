//! Unit tests for the fetch engine: ordering, stats accounting, admission
//! backpressure, the retry cap, and the two concrete policies.

use super::*;
use crate::config::FetchConfig;
use crate::types::RequestDescriptor;
use std::sync::atomic::AtomicBool;
use std::time::Instant;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fast_config() -> FetchConfig {
    FetchConfig {
        max_retries: 3,
        deferral_interval: Duration::from_millis(50),
        ..FetchConfig::default()
    }
}

/// Policy that replays scripted outcomes without touching the network
struct ScriptedPolicy {
    outcomes: Mutex<VecDeque<ScriptedOutcome>>,
    attempts: Arc<Mutex<Vec<String>>>,
}

enum ScriptedOutcome {
    Success(Vec<u8>),
    HttpError(u16),
}

impl ScriptedPolicy {
    fn new(outcomes: Vec<ScriptedOutcome>) -> (Self, Arc<Mutex<Vec<String>>>) {
        let attempts = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                outcomes: Mutex::new(outcomes.into()),
                attempts: Arc::clone(&attempts),
            },
            attempts,
        )
    }
}

#[async_trait]
impl FetchPolicy for ScriptedPolicy {
    async fn execute(
        &self,
        request: &RequestDescriptor,
    ) -> std::result::Result<FetchSuccess, FetchFailure> {
        self.attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.url.clone());

        let outcome = self
            .outcomes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or(ScriptedOutcome::Success(Vec::new()));

        match outcome {
            ScriptedOutcome::Success(body) => Ok(FetchSuccess {
                body,
                headers: HeaderMap::new(),
            }),
            ScriptedOutcome::HttpError(status) => Err(FetchFailure::Http {
                status: StatusCode::from_u16(status).expect("valid status"),
                url: request.url.clone(),
                headers: HeaderMap::new(),
            }),
        }
    }

    fn success_delay(&self, _headers: &HeaderMap) -> Duration {
        Duration::ZERO
    }

    fn failure_delay(&self, _failure: &FetchFailure) -> Duration {
        Duration::ZERO
    }
}

#[tokio::test]
async fn tasks_complete_in_fifo_order() {
    let fetcher: Fetcher<usize> = Fetcher::new("fifo");
    let (tx, mut rx) = mpsc::channel(16);
    let (policy, _) = ScriptedPolicy::new(vec![]);
    let cancel = CancellationToken::new();
    fetcher.spawn(policy, tx, fast_config(), cancel.clone());

    for i in 0..3 {
        fetcher.enqueue(RequestDescriptor::get(format!("http://x/{i}")), i);
    }

    let mut order = Vec::new();
    for _ in 0..3 {
        let completion = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("completion within timeout")
            .expect("channel open");
        order.push(completion.continuation);
    }
    assert_eq!(order, vec![0, 1, 2]);
    cancel.cancel();
}

#[tokio::test]
async fn stats_count_queued_plus_in_flight_and_finished() {
    let fetcher: Fetcher<()> = Fetcher::new("stats");
    // No loop spawned yet: everything stays queued
    fetcher.enqueue(RequestDescriptor::get("http://x/1"), ());
    fetcher.enqueue(RequestDescriptor::get("http://x/2"), ());
    let stats = fetcher.stats();
    assert_eq!(stats.pending, 2);
    assert_eq!(stats.finished, 0);
    assert_eq!(stats.errored, 0);

    let (tx, mut rx) = mpsc::channel(16);
    let (policy, _) = ScriptedPolicy::new(vec![]);
    let cancel = CancellationToken::new();
    fetcher.spawn(policy, tx, fast_config(), cancel.clone());

    for _ in 0..2 {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("completion within timeout")
            .expect("channel open");
    }
    // Both served; drain may still be settling the counter stores
    tokio::time::sleep(Duration::from_millis(50)).await;
    let stats = fetcher.stats();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.finished, 2);
    cancel.cancel();
}

#[tokio::test]
async fn failed_task_is_retried_then_dropped_at_the_cap() {
    let fetcher: Fetcher<()> = Fetcher::new("retry-cap");
    let (tx, mut rx) = mpsc::channel(16);
    // Every attempt fails with an HTTP error
    let (policy, attempts) = ScriptedPolicy::new(
        (0..16).map(|_| ScriptedOutcome::HttpError(500)).collect(),
    );
    let config = FetchConfig {
        max_retries: 2,
        ..fast_config()
    };
    let cancel = CancellationToken::new();
    fetcher.spawn(policy, tx, config, cancel.clone());

    fetcher.enqueue(RequestDescriptor::get("http://x/failing"), ());

    // Give the loop time to burn through the initial attempt plus 2 retries
    tokio::time::sleep(Duration::from_millis(300)).await;

    let attempts = attempts.lock().unwrap_or_else(|e| e.into_inner());
    assert_eq!(
        attempts.len(),
        3,
        "initial attempt + max_retries retries, then the task is dropped"
    );
    let stats = fetcher.stats();
    assert_eq!(stats.pending, 0, "abandoned task must not linger");
    assert_eq!(stats.errored, 3);
    assert!(rx.try_recv().is_err(), "no completion for a dropped task");
    cancel.cancel();
}

#[tokio::test]
async fn retries_move_to_the_tail_behind_healthy_tasks() {
    let fetcher: Fetcher<&'static str> = Fetcher::new("tail");
    let (tx, mut rx) = mpsc::channel(16);
    // First attempt (task A) fails, everything after succeeds
    let (policy, attempts) =
        ScriptedPolicy::new(vec![ScriptedOutcome::HttpError(502)]);
    let cancel = CancellationToken::new();
    fetcher.spawn(policy, tx, fast_config(), cancel.clone());

    fetcher.enqueue(RequestDescriptor::get("http://x/a"), "a");
    fetcher.enqueue(RequestDescriptor::get("http://x/b"), "b");

    let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("completion")
        .expect("open");
    let second = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("completion")
        .expect("open");

    assert_eq!(first.continuation, "b", "healthy task overtakes the retry");
    assert_eq!(second.continuation, "a");
    assert_eq!(
        attempts.lock().unwrap_or_else(|e| e.into_inner()).as_slice(),
        ["http://x/a", "http://x/b", "http://x/a"]
    );
    cancel.cancel();
}

#[tokio::test]
async fn admission_gate_defers_dequeue_until_released() {
    let fetcher: Fetcher<()> = Fetcher::new("gate");
    let (tx, mut rx) = mpsc::channel(16);
    let (policy, _) = ScriptedPolicy::new(vec![]);
    let cancel = CancellationToken::new();

    let open = Arc::new(AtomicBool::new(false));
    let gate = Arc::clone(&open);
    fetcher.set_admission(move || gate.load(Ordering::SeqCst));
    fetcher.spawn(policy, tx, fast_config(), cancel.clone());

    fetcher.enqueue(RequestDescriptor::get("http://x/gated"), ());

    // While the gate is closed, nothing may be dequeued
    assert!(
        tokio::time::timeout(Duration::from_millis(150), rx.recv())
            .await
            .is_err(),
        "no completion while admission is denied"
    );
    assert_eq!(fetcher.stats().pending, 1);

    // Opening the gate resumes dequeuing within one deferral interval
    let released_at = Instant::now();
    open.store(true, Ordering::SeqCst);
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("completion after release")
        .expect("open");
    assert!(
        released_at.elapsed() < Duration::from_millis(500),
        "dequeue should resume within a deferral interval of release"
    );
    cancel.cancel();
}

#[tokio::test]
async fn cancellation_stops_the_loop() {
    let fetcher: Fetcher<()> = Fetcher::new("cancel");
    let (tx, mut rx) = mpsc::channel(16);
    let (policy, _) = ScriptedPolicy::new(vec![]);
    let cancel = CancellationToken::new();
    let handle = fetcher.spawn(policy, tx, fast_config(), cancel.clone());

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("loop exits promptly")
        .expect("loop task does not panic");

    fetcher.enqueue(RequestDescriptor::get("http://x/late"), ());
    assert!(
        tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .is_err(),
        "a cancelled loop serves nothing"
    );
}

// ---------------------------------------------------------------------------
// Concrete policies
// ---------------------------------------------------------------------------

#[tokio::test]
async fn api_policy_parses_success_and_paces_from_headers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search/commits"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({ "total_count": 0, "items": [] }))
                .insert_header("date", "Mon, 01 Apr 2019 00:00:00 GMT")
                .insert_header("x-ratelimit-remaining", "1")
                // 120s after the date header
                .insert_header("x-ratelimit-reset", "1554076920"),
        )
        .mount(&server)
        .await;

    let config = FetchConfig::default();
    let policy = ApiPolicy::new(&config).expect("client");
    let request = RequestDescriptor::get(format!("{}/search/commits", server.uri()))
        .with_query("q", "overflow");

    let success = policy.execute(&request).await.expect("2xx");
    let parsed: serde_json::Value = serde_json::from_slice(&success.body).expect("json");
    assert_eq!(parsed["total_count"], 0);
    assert_eq!(
        policy.success_delay(&success.headers),
        Duration::from_millis(120_000),
        "one remaining call over a 120s window schedules the full window"
    );
}

#[tokio::test]
async fn api_policy_classifies_http_errors_with_their_headers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let config = FetchConfig::default();
    let policy = ApiPolicy::new(&config).expect("client");
    let request = RequestDescriptor::get(format!("{}/missing", server.uri()));

    let failure = policy.execute(&request).await.expect_err("404");
    match &failure {
        FetchFailure::Http { status, .. } => assert_eq!(status.as_u16(), 404),
        other => panic!("expected HTTP failure, got {other}"),
    }
    assert_eq!(
        policy.failure_delay(&failure),
        config.api_default_delay,
        "error response without quota headers uses the default delay"
    );
}

#[tokio::test]
async fn api_policy_classifies_transport_failures_aggressively() {
    let config = FetchConfig {
        request_timeout: Duration::from_millis(500),
        ..FetchConfig::default()
    };
    let policy = ApiPolicy::new(&config).expect("client");
    // Port 1 on loopback: connection refused, no HTTP response
    let request = RequestDescriptor::get("http://127.0.0.1:1/unreachable");

    let failure = policy.execute(&request).await.expect_err("unreachable");
    assert!(matches!(failure, FetchFailure::Transport(_)));
    assert_eq!(policy.failure_delay(&failure), config.api_aggressive_delay);
}

#[tokio::test]
async fn resource_policy_uses_fixed_delays_and_raw_bytes() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/raw/file.c"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"\x00\x01binary".to_vec()))
        .mount(&server)
        .await;

    let config = FetchConfig::default();
    let policy = ResourcePolicy::new(&config).expect("client");
    let request = RequestDescriptor::get(format!("{}/raw/file.c", server.uri()));

    let success = policy.execute(&request).await.expect("2xx");
    assert_eq!(success.body, b"\x00\x01binary");
    assert_eq!(
        policy.success_delay(&success.headers),
        config.resource_success_delay
    );

    Mock::given(method("GET"))
        .and(path("/raw/gone.c"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    let failure = policy
        .execute(&RequestDescriptor::get(format!("{}/raw/gone.c", server.uri())))
        .await
        .expect_err("500");
    assert_eq!(
        policy.failure_delay(&failure),
        config.resource_failure_delay,
        "resource failures ignore headers and use the flat backoff"
    );
}

#[tokio::test]
async fn api_policy_sends_user_agent_and_auth() {
    use wiremock::matchers::{basic_auth, header};

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/authed"))
        .and(header("user-agent", "forge-harvest-test/1.0"))
        .and(basic_auth("t0ken", ""))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let config = FetchConfig {
        user_agent: "forge-harvest-test/1.0".to_string(),
        ..FetchConfig::default()
    };
    let policy = ApiPolicy::new(&config).expect("client");
    let request = RequestDescriptor::get(format!("{}/authed", server.uri()))
        .with_auth(Some(crate::types::Credentials::token("t0ken")));

    policy.execute(&request).await.expect("2xx");
    server.verify().await;
}
