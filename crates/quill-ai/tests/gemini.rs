use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use quill_ai::{AiError, AiProvider, FALLBACK_REPLY, GeminiClient, GeminiConfig};
use serde_json::{Value, json};

#[derive(Clone, Default)]
struct Seen {
    requests: Arc<Mutex<Vec<(String, Option<String>, Value)>>>,
}

/// Serves `status` + `body` for every `generateContent` call and records
/// what it was sent.
async fn mock_gemini(status: StatusCode, body: Value, delay: Duration) -> (String, Seen) {
    let seen = Seen::default();
    let app = Router::new()
        .route(
            "/v1beta/models/{action}",
            post(
                move |State(seen): State<Seen>, Path(action): Path<String>, headers: HeaderMap, body_in: String| {
                    let body = body.clone();
                    async move {
                        let key = headers
                            .get("x-goog-api-key")
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string);
                        let parsed: Value = serde_json::from_str(&body_in).unwrap_or(Value::Null);
                        seen.requests.lock().unwrap().push((action, key, parsed));
                        tokio::time::sleep(delay).await;
                        (status, body.to_string())
                    }
                },
            ),
        )
        .with_state(seen.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), seen)
}

fn client(base_url: String, timeout: Duration) -> GeminiClient {
    GeminiClient::new(GeminiConfig {
        api_key: "test-key".into(),
        model: "test-model".into(),
        base_url,
        timeout,
    })
    .unwrap()
}

#[tokio::test]
async fn returns_generated_text_and_sends_prompt() {
    let (base, seen) = mock_gemini(
        StatusCode::OK,
        json!({"candidates": [{"content": {"role": "model", "parts": [{"text": "Hi there!"}]}}]}),
        Duration::ZERO,
    )
    .await;

    let reply = client(base, Duration::from_secs(5)).generate("Hello").await;
    assert_eq!(reply, "Hi there!");

    let requests = seen.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    let (action, key, body) = &requests[0];
    assert_eq!(action, "test-model:generateContent");
    assert_eq!(key.as_deref(), Some("test-key"));
    assert_eq!(body["contents"][0]["parts"][0]["text"], "Hello");
}

#[tokio::test]
async fn provider_error_status_falls_back() {
    let (base, _) = mock_gemini(
        StatusCode::INTERNAL_SERVER_ERROR,
        json!({"error": {"message": "boom"}}),
        Duration::ZERO,
    )
    .await;
    let client = client(base, Duration::from_secs(5));

    let err = client.try_generate("Hello").await.unwrap_err();
    assert!(matches!(err, AiError::Status { status, .. } if status.as_u16() == 500));
    assert_eq!(client.generate("Hello").await, FALLBACK_REPLY);
}

#[tokio::test]
async fn empty_candidates_fall_back() {
    let (base, _) = mock_gemini(StatusCode::OK, json!({"candidates": []}), Duration::ZERO).await;
    let client = client(base, Duration::from_secs(5));

    assert!(matches!(client.try_generate("Hello").await, Err(AiError::Empty)));
    assert_eq!(client.generate("Hello").await, FALLBACK_REPLY);
}

#[tokio::test]
async fn slow_provider_times_out_into_fallback() {
    let (base, _) = mock_gemini(
        StatusCode::OK,
        json!({"candidates": [{"content": {"parts": [{"text": "too late"}]}}]}),
        Duration::from_secs(3),
    )
    .await;
    let client = client(base, Duration::from_millis(200));

    assert!(matches!(client.try_generate("Hello").await, Err(AiError::Http(_))));
    assert_eq!(client.generate("Hello").await, FALLBACK_REPLY);
}

#[tokio::test]
async fn unreachable_provider_falls_back() {
    let reply = client("http://127.0.0.1:1".into(), Duration::from_secs(2))
        .generate("Hello")
        .await;
    assert_eq!(reply, FALLBACK_REPLY);
}
