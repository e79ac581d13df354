use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use collab_scout::github::rate_limit::{Bucket, Clock};
use collab_scout::github::{
    ApiRequest, GithubClient, GithubError, Sleeper, ThrottleEvent, ThrottleReason, ThrottleSink,
};
use collab_scout::store::Store;

#[derive(Default)]
struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    fn advance(&self, ms: i64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Records requested waits instead of serving them.
#[derive(Default)]
struct RecordingSleeper {
    waits_ms: Mutex<Vec<u64>>,
}

impl RecordingSleeper {
    fn waits(&self) -> Vec<u64> {
        self.waits_ms.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.waits_ms.lock().unwrap().push(duration.as_millis() as u64);
    }
}

#[derive(Default)]
struct CollectingThrottleSink {
    events: Mutex<Vec<ThrottleEvent>>,
}

impl CollectingThrottleSink {
    fn events(&self) -> Vec<ThrottleEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl ThrottleSink for CollectingThrottleSink {
    fn on_throttle(&self, event: &ThrottleEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

struct Harness {
    client: GithubClient,
    store: Store,
    clock: Arc<ManualClock>,
    sleeper: Arc<RecordingSleeper>,
    throttle: Arc<CollectingThrottleSink>,
}

fn harness(base_url: &str) -> Harness {
    let store = Store::open_in_memory().unwrap();
    let clock = Arc::new(ManualClock::default());
    let sleeper = Arc::new(RecordingSleeper::default());
    let throttle = Arc::new(CollectingThrottleSink::default());
    let client = GithubClient::with_parts(
        base_url,
        Some("test-token"),
        store.clone(),
        clock.clone(),
        sleeper.clone(),
        throttle.clone(),
    )
    .unwrap();
    Harness {
        client,
        store,
        clock,
        sleeper,
        throttle,
    }
}

#[tokio::test]
async fn success_is_cached_and_304_returns_cached_body() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("ETag", "\"abc\"")
                .set_body_json(json!({ "value": 42 })),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(ResponseTemplate::new(304))
        .mount(&server)
        .await;

    let h = harness(&server.uri());
    let req = ApiRequest::new("/data");

    let first = h.client.get(&req).await.unwrap();
    assert_eq!(first.status, 200);
    assert!(!first.from_cache);
    assert_eq!(first.body["value"], 42);
    assert_eq!(first.etag.as_deref(), Some("\"abc\""));

    h.clock.advance(5_000);

    let second = h.client.get(&req).await.unwrap();
    assert_eq!(second.status, 200);
    assert!(second.from_cache);
    assert_eq!(second.body["value"], 42);

    // The revalidating request carried the stored entity tag.
    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    let revalidation = &requests[1];
    assert_eq!(
        revalidation
            .headers
            .get("If-None-Match")
            .map(|v| v.to_str().unwrap()),
        Some("\"abc\"")
    );
}

#[tokio::test]
async fn http_304_advances_fetched_at_but_never_overwrites_body() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("ETag", "\"abc\"")
                .set_body_string("payload"),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(ResponseTemplate::new(304))
        .mount(&server)
        .await;

    let h = harness(&server.uri());
    let req = ApiRequest::new("/data");
    h.client.get(&req).await.unwrap();

    let key = collab_scout::store::http_cache::cache_key(
        "GET",
        &format!("{}/data", server.uri()),
        "application/vnd.github+json",
    );
    let before = h.store.get_http_cache(&key).unwrap().unwrap();

    h.clock.advance(9_000);
    h.client.get(&req).await.unwrap();

    let after = h.store.get_http_cache(&key).unwrap().unwrap();
    assert_eq!(after.body, before.body);
    assert_eq!(after.etag, before.etag);
    assert!(after.fetched_at > before.fetched_at);
}

#[tokio::test]
async fn retry_after_header_waits_exactly_that_many_seconds() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "7"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
        .mount(&server)
        .await;

    let h = harness(&server.uri());
    let resp = h.client.get(&ApiRequest::new("/data")).await.unwrap();
    assert_eq!(resp.body["ok"], true);

    assert_eq!(h.sleeper.waits(), vec![7_000]);
    let events = h.throttle.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].reason, ThrottleReason::RateLimit429);
    assert_eq!(events[0].wait_ms, 7_000);
}

#[tokio::test]
async fn reset_header_wait_adds_one_second_buffer() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(ResponseTemplate::new(403).insert_header("X-RateLimit-Reset", "100"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
        .mount(&server)
        .await;

    let h = harness(&server.uri());
    // Clock is at 0, so the wait is 100s to reset plus the 1s buffer.
    h.client.get(&ApiRequest::new("/data")).await.unwrap();

    assert_eq!(h.sleeper.waits(), vec![101_000]);
    let events = h.throttle.events();
    assert_eq!(events[0].reason, ThrottleReason::SecondaryRateLimit403);
    assert_eq!(events[0].reset_at, Some(100));
}

#[tokio::test]
async fn rate_limit_retries_are_bounded() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "1"))
        .mount(&server)
        .await;

    let h = harness(&server.uri());
    let err = h
        .client
        .get(&ApiRequest::new("/data").bucket(Bucket::Search))
        .await
        .unwrap_err();
    match err {
        GithubError::RateLimited { bucket, retries } => {
            assert_eq!(bucket, "search");
            assert_eq!(retries, 3);
        }
        other => panic!("expected RateLimited, got {other:?}"),
    }

    // Three throttle-and-retry cycles before giving up.
    assert_eq!(h.sleeper.waits(), vec![1_000, 1_000, 1_000]);
    assert_eq!(server.received_requests().await.unwrap().len(), 4);
}

#[tokio::test]
async fn server_errors_back_off_exponentially_then_succeed() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
        .mount(&server)
        .await;

    let h = harness(&server.uri());
    let resp = h.client.get(&ApiRequest::new("/data")).await.unwrap();
    assert_eq!(resp.body["ok"], true);

    // 2^0 then 2^1 seconds.
    assert_eq!(h.sleeper.waits(), vec![1_000, 2_000]);
}

#[tokio::test]
async fn non_retryable_status_fails_fast() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(ResponseTemplate::new(422).set_body_string("bad query"))
        .mount(&server)
        .await;

    let h = harness(&server.uri());
    let err = h.client.get(&ApiRequest::new("/data")).await.unwrap_err();
    match err {
        GithubError::Http { status, body } => {
            assert_eq!(status, 422);
            assert_eq!(body, "bad query");
        }
        other => panic!("expected Http, got {other:?}"),
    }
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn missing_readme_is_none_not_error() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/repos/acme/ghost/readme"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let h = harness(&server.uri());
    let readme = h.client.fetch_readme("acme/ghost").await.unwrap();
    assert!(readme.is_none());
}

#[tokio::test]
async fn readme_raw_body_round_trips_as_text() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/repos/acme/alpha/readme"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("ETag", "\"r1\"")
                .set_body_string("# Alpha\n\nA vector database."),
        )
        .mount(&server)
        .await;

    let h = harness(&server.uri());
    let readme = h.client.fetch_readme("acme/alpha").await.unwrap().unwrap();
    assert!(readme.text.starts_with("# Alpha"));
    assert_eq!(readme.etag.as_deref(), Some("\"r1\""));
    assert!(readme.source_url.ends_with("/repos/acme/alpha/readme"));
}
