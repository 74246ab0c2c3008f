//! Mock API tests for the Anthropic adapter.
//!
//! wiremock simulates the Messages and Models endpoints; response shapes
//! follow the official API reference.

use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

use lacquer::error::LacquerError;
use lacquer::events::NullSink;
use lacquer::providers::Provider;
use lacquer::providers::anthropic::{AnthropicConfig, AnthropicProvider};
use lacquer::types::message::Message;
use lacquer::types::request::GenerateRequest;

fn provider_for(server: &MockServer) -> AnthropicProvider {
    AnthropicProvider::new(AnthropicConfig {
        api_key: Some("test-key".to_string()),
        base_url: Some(server.uri()),
        timeout: Some(Duration::from_secs(5)),
    })
    .unwrap()
}

fn messages_response() -> serde_json::Value {
    json!({
        "id": "msg_01XFDUDYJgAACzvnptvVoYEL",
        "type": "message",
        "role": "assistant",
        "content": [
            {"type": "text", "text": "Hello! How can I help you today?"}
        ],
        "model": "claude-3-5-haiku-20241022",
        "stop_reason": "end_turn",
        "usage": {"input_tokens": 10, "output_tokens": 15}
    })
}

#[tokio::test]
async fn generate_maps_request_and_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "test-key"))
        .and(header("anthropic-version", "2023-06-01"))
        .respond_with(ResponseTemplate::new(200).set_body_json(messages_response()))
        .expect(1)
        .mount(&server)
        .await;

    let provider = provider_for(&server);
    let mut request =
        GenerateRequest::new("claude-3-5-haiku-20241022", vec![Message::user("Hello")]);
    request.system_prompt = Some("be brief".to_string());

    let output = provider.generate(request, &NullSink).await.unwrap();
    assert_eq!(output.messages[0].text(), "Hello! How can I help you today?");
    assert_eq!(output.usage.prompt_tokens, 10);
    assert_eq!(output.usage.completion_tokens, 15);

    // The wire request carried the vendor-mapped fields.
    let received: Vec<Request> = server.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&received[0].body).unwrap();
    assert_eq!(body["model"], "claude-3-5-haiku-20241022");
    assert_eq!(body["system"], "be brief");
    assert_eq!(body["max_tokens"], 8192);
    assert_eq!(body["messages"][0]["content"][0]["type"], "text");
}

#[tokio::test]
async fn client_errors_pass_through_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "type": "error",
            "error": {"type": "not_found_error", "message": "model: no-such-model"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let provider = provider_for(&server);
    let request = GenerateRequest::new("no-such-model", vec![Message::user("hi")]);
    let err = provider.generate(request, &NullSink).await.unwrap_err();

    match err {
        LacquerError::Api { status, message, .. } => {
            assert_eq!(status, 404);
            assert_eq!(message, "model: no-such-model");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn server_errors_are_retried_until_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(529).set_body_json(json!({
            "type": "error",
            "error": {"type": "overloaded_error", "message": "Overloaded"}
        })))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(messages_response()))
        .mount(&server)
        .await;

    let provider = provider_for(&server);
    let request = GenerateRequest::new("claude-3-5-haiku-20241022", vec![Message::user("hi")]);
    let output = provider.generate(request, &NullSink).await.unwrap();
    assert_eq!(output.usage.total_tokens, 25);
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn cancellation_aborts_an_inflight_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(messages_response())
                .set_delay(Duration::from_secs(30)),
        )
        .mount(&server)
        .await;

    let provider = provider_for(&server);
    let request = GenerateRequest::new("claude-3-5-haiku-20241022", vec![Message::user("hi")]);
    let cancel = request.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let started = std::time::Instant::now();
    let err = provider.generate(request, &NullSink).await.unwrap_err();
    assert!(err.is_cancellation());
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn list_models_paginates() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/models"))
        .respond_with(move |request: &Request| {
            let query = request.url.query().unwrap_or("");
            if query.contains("after_id") {
                ResponseTemplate::new(200).set_body_json(json!({
                    "data": [{"id": "claude-3-5-haiku-20241022", "display_name": "Claude 3.5 Haiku"}],
                    "has_more": false
                }))
            } else {
                ResponseTemplate::new(200).set_body_json(json!({
                    "data": [{"id": "claude-sonnet-4-20250514", "display_name": "Claude Sonnet 4"}],
                    "has_more": true,
                    "last_id": "claude-sonnet-4-20250514"
                }))
            }
        })
        .mount(&server)
        .await;

    let provider = provider_for(&server);
    let models = provider.list_models().await.unwrap();
    assert_eq!(models.len(), 2);
    assert_eq!(models[0].id, "claude-sonnet-4-20250514");
    assert_eq!(models[1].display_name, "Claude 3.5 Haiku");
}
