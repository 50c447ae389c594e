use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use persona_survey::gateway::openrouter::OpenRouterAdapter;
use persona_survey::gateway::{
    Attribution, ChatModel, ChatProvider, ChatRequest, FinishReason, GatewayConfig, Message,
    ProviderError, ProviderGateway, ResponseSchema, TallyUsageSink,
};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

fn adapter(server: &MockServer) -> OpenRouterAdapter {
    OpenRouterAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5), None, None)
        .unwrap()
}

fn request() -> ChatRequest {
    ChatRequest::new(
        ChatModel::openrouter("meta-llama/llama-3.1-8b-instruct"),
        vec![
            Message::system("You are a moderate."),
            Message::user("Rate relevance.\n\nSentence: Whether someone was harmed"),
        ],
        Attribution::new("test"),
    )
    .temperature(0.8)
}

#[tokio::test]
async fn openrouter_parses_success_content_and_usage() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({
            "model": "meta-llama/llama-3.1-8b-instruct",
            "messages": [
                {"role": "system", "content": "You are a moderate."},
                {"role": "user", "content": "Rate relevance.\n\nSentence: Whether someone was harmed"}
            ]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": { "content": "I'd say 4." },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 10, "completion_tokens": 20 }
        })))
        .mount(&server)
        .await;

    let resp = adapter(&server).chat(&request()).await.unwrap();
    assert_eq!(resp.content, "I'd say 4.");
    assert_eq!(resp.finish_reason, FinishReason::Stop);
    assert_eq!(resp.input_tokens, 10);
    assert_eq!(resp.output_tokens, 20);
}

#[tokio::test]
async fn openrouter_sends_json_schema_response_format() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({
            "response_format": {
                "type": "json_schema",
                "json_schema": { "name": "survey_answer", "strict": true }
            }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "content": "{\"answer\": 2}" }, "finish_reason": "stop" }]
        })))
        .mount(&server)
        .await;

    let req = request().schema(ResponseSchema {
        name: "survey_answer".into(),
        schema: json!({"type": "object"}),
    });
    let resp = adapter(&server).chat(&req).await.unwrap();
    assert_eq!(resp.content, "{\"answer\": 2}");
    assert_eq!(resp.input_tokens, 0);
}

#[tokio::test]
async fn openrouter_keeps_refusal_like_content_as_a_reply() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": { "content": "I cannot agree more: 5" },
                "finish_reason": "stop"
            }]
        })))
        .mount(&server)
        .await;

    let resp = adapter(&server).chat(&request()).await.unwrap();
    assert_eq!(resp.content, "I cannot agree more: 5");
}

#[tokio::test]
async fn openrouter_maps_api_level_refusal() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "error": { "message": "Request was refused by the upstream model" }
        })))
        .mount(&server)
        .await;

    let err = adapter(&server).chat(&request()).await.unwrap_err();
    assert!(matches!(err, ProviderError::Refused { .. }));
}

#[tokio::test]
async fn openrouter_classifies_http_429_and_keeps_context() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("x-request-id", "abc123")
                .set_body_json(json!({
                    "error": { "message": "rate limited", "code": "rate_limit_exceeded" }
                })),
        )
        .mount(&server)
        .await;

    let err = adapter(&server).chat(&request()).await.unwrap_err();
    assert!(err.is_retryable());
    match err {
        ProviderError::RateLimited {
            retry_after,
            context,
        } => {
            assert_eq!(retry_after, Duration::from_secs(60));
            let ctx = context.expect("expected error context");
            assert_eq!(ctx.http_status, Some(429));
            assert_eq!(ctx.provider_code.as_deref(), Some("rate_limit_exceeded"));
            assert_eq!(ctx.request_id.as_deref(), Some("abc123"));
        }
        other => panic!("expected RateLimited, got {other:?}"),
    }
}

#[tokio::test]
async fn openrouter_client_errors_are_not_retryable() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
        .mount(&server)
        .await;

    let err = adapter(&server).chat(&request()).await.unwrap_err();
    assert!(!err.is_retryable());
    assert!(!err.is_fatal());
    assert_eq!(err.code(), "provider_error");
}

#[derive(Clone)]
struct FlipResponder {
    calls: Arc<AtomicUsize>,
    first: ResponseTemplate,
    second: ResponseTemplate,
}

impl Respond for FlipResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n == 0 {
            self.first.clone()
        } else {
            self.second.clone()
        }
    }
}

fn flip_server_responses() -> (ResponseTemplate, ResponseTemplate) {
    let first = ResponseTemplate::new(500).set_body_json(json!({
        "error": { "message": "transient error", "code": "internal" }
    }));
    let second = ResponseTemplate::new(200).set_body_json(json!({
        "choices": [{
            "message": { "content": "ok" },
            "finish_reason": "stop"
        }],
        "usage": { "prompt_tokens": 1, "completion_tokens": 1 }
    }));
    (first, second)
}

#[tokio::test]
async fn provider_gateway_retries_on_retryable_errors_and_records_usage() {
    let server = MockServer::start().await;
    let (first, second) = flip_server_responses();

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(FlipResponder {
            calls: Arc::new(AtomicUsize::new(0)),
            first,
            second,
        })
        .mount(&server)
        .await;

    let usage = Arc::new(TallyUsageSink::default());
    let gateway = ProviderGateway::with_config(
        adapter(&server),
        usage.clone(),
        GatewayConfig {
            max_retries: 1,
            retry_base_delay: Duration::from_millis(0),
        },
    );

    let resp = gateway.chat(request()).await.unwrap();
    assert_eq!(resp.content, "ok");

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 2);

    let tally = usage.snapshot();
    assert_eq!(tally.calls, 2);
    assert_eq!(tally.errors, 1);
    assert_eq!(tally.input_tokens, 1);
}

#[tokio::test]
async fn provider_gateway_makes_one_call_by_default() {
    let server = MockServer::start().await;
    let (first, second) = flip_server_responses();

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(FlipResponder {
            calls: Arc::new(AtomicUsize::new(0)),
            first,
            second,
        })
        .mount(&server)
        .await;

    let gateway = ProviderGateway::with_config(
        adapter(&server),
        Arc::new(TallyUsageSink::default()),
        GatewayConfig {
            retry_base_delay: Duration::from_millis(0),
            ..GatewayConfig::default()
        },
    );

    let err = gateway.chat(request()).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}
