use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use collab_scout::github::Sleeper;
use collab_scout::llm::schema::validate_repo_analysis;
use collab_scout::llm::{LlmClient, LlmError, LlmRequest, Message};

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

fn client(base_url: &str, sleeper: Arc<RecordingSleeper>) -> LlmClient {
    LlmClient::with_sleeper(base_url, "sk-test", sleeper).unwrap()
}

fn request() -> LlmRequest {
    LlmRequest::new("test/model", vec![Message::user("analyze this")])
}

fn chat_body(content: &str) -> serde_json::Value {
    json!({
        "choices": [{ "message": { "content": content } }]
    })
}

#[tokio::test]
async fn valid_json_content_is_returned_parsed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_body(r#"{"answer": 7}"#)))
        .mount(&server)
        .await;

    let sleeper = Arc::new(RecordingSleeper::default());
    let value = client(&server.uri(), sleeper)
        .chat_json(&request())
        .await
        .unwrap();
    assert_eq!(value["answer"], 7);
}

#[tokio::test]
async fn invalid_json_content_is_retried_three_times_then_fails() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_body("NOT VALID JSON!!!")))
        .mount(&server)
        .await;

    let sleeper = Arc::new(RecordingSleeper::default());
    let err = client(&server.uri(), sleeper.clone())
        .chat_json(&request())
        .await
        .unwrap_err();
    assert!(matches!(err, LlmError::InvalidOutput { .. }));

    // Three attempts, backoff 2^0 then 2^1 seconds between them.
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
    assert_eq!(sleeper.waits(), vec![1_000, 2_000]);
}

#[tokio::test]
async fn missing_content_field_counts_as_invalid_output() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "choices": [] })))
        .mount(&server)
        .await;

    let sleeper = Arc::new(RecordingSleeper::default());
    let err = client(&server.uri(), sleeper)
        .chat_json(&request())
        .await
        .unwrap_err();
    match err {
        LlmError::InvalidOutput { message } => assert!(message.contains("content")),
        other => panic!("expected InvalidOutput, got {other:?}"),
    }
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn rate_limit_honors_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "5"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_body(r#"{"ok": true}"#)))
        .mount(&server)
        .await;

    let sleeper = Arc::new(RecordingSleeper::default());
    let value = client(&server.uri(), sleeper.clone())
        .chat_json(&request())
        .await
        .unwrap();
    assert_eq!(value["ok"], true);
    assert_eq!(sleeper.waits(), vec![5_000]);
}

#[tokio::test]
async fn non_429_error_status_fails_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
        .mount(&server)
        .await;

    let sleeper = Arc::new(RecordingSleeper::default());
    let err = client(&server.uri(), sleeper)
        .chat_json(&request())
        .await
        .unwrap_err();
    match err {
        LlmError::Provider { status, body } => {
            assert_eq!(status, 400);
            assert_eq!(body, "bad request");
        }
        other => panic!("expected Provider, got {other:?}"),
    }
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn schema_failure_reenters_the_retry_loop() {
    let server = MockServer::start().await;
    // Valid JSON, but scores out of range: fails RepoAnalysisOutput.
    let invalid = json!({
        "repo": {"full_name": "acme/alpha"},
        "scores": {"interestingness": 2.0, "novelty": 0.5, "collaboration_potential": 0.5},
        "reasons": {"interestingness": [], "novelty": [], "collaboration_potential": []}
    });
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_body(&invalid.to_string())))
        .mount(&server)
        .await;

    let sleeper = Arc::new(RecordingSleeper::default());
    let err = client(&server.uri(), sleeper)
        .chat_validated(&request(), validate_repo_analysis)
        .await
        .unwrap_err();
    assert!(matches!(err, LlmError::InvalidOutput { .. }));
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn request_carries_json_object_response_format() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_body(r#"{"ok": true}"#)))
        .mount(&server)
        .await;

    let sleeper = Arc::new(RecordingSleeper::default());
    client(&server.uri(), sleeper)
        .chat_json(&request().temperature(0.2).max_tokens(512))
        .await
        .unwrap();

    let sent = &server.received_requests().await.unwrap()[0];
    let body: serde_json::Value = serde_json::from_slice(&sent.body).unwrap();
    assert_eq!(body["response_format"]["type"], "json_object");
    assert_eq!(body["model"], "test/model");
    assert_eq!(body["max_tokens"], 512);
}
