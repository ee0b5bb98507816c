//! HTTP clients against a local mock server.

use std::{sync::Arc, time::Duration};

use prtriage::{
    BackoffPolicy, ChatMessage, ChatModel, OpenAiClient, SqliteCache, Tool, ToolRegistry,
    ToolSchema, tools::FetchUrlTool,
};
use serde_json::{Value, json};
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{header, method, path},
};

const TIMEOUT: Duration = Duration::from_secs(5);
const HOUR: Duration = Duration::from_secs(3600);

fn fast_policy() -> BackoffPolicy {
    BackoffPolicy {
        initial_interval: Duration::from_millis(10),
        max_interval: Duration::from_millis(50),
        multiplier: 2.0,
        max_elapsed_time: Duration::from_secs(5),
        randomization_factor: 0.0,
    }
}

fn completion(content: &str) -> Value {
    json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "choices": [{
            "index": 0,
            "finish_reason": "stop",
            "message": { "role": "assistant", "content": content }
        }]
    })
}

fn client(server: &MockServer) -> OpenAiClient {
    OpenAiClient::new(
        &format!("{}/v1/", server.uri()),
        Some("sk-test".to_string()),
        "gpt-test",
        &fast_policy(),
        TIMEOUT,
    )
    .unwrap()
}

fn diff_schema() -> ToolSchema {
    ToolSchema {
        name: "analyze_diff".to_string(),
        description: "Analyse a diff".to_string(),
        parameters: json!({ "type": "object" }),
    }
}

#[tokio::test]
async fn test_chat_completion_request_shape() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("hello")))
        .expect(1)
        .mount(&server)
        .await;

    let reply = client(&server)
        .complete(&[ChatMessage::user("hi")], &[diff_schema()])
        .await
        .unwrap();
    assert_eq!(reply.content.as_deref(), Some("hello"));
    assert!(reply.tool_calls.is_empty());

    let requests = server.received_requests().await.unwrap();
    let body: Value = requests[0].body_json().unwrap();
    assert_eq!(body["model"], "gpt-test");
    assert_eq!(body["messages"][0]["role"], "user");
    assert_eq!(body["messages"][0]["content"], "hi");
    assert_eq!(body["tools"][0]["type"], "function");
    assert_eq!(body["tools"][0]["function"]["name"], "analyze_diff");
}

#[tokio::test]
async fn test_chat_completion_omits_empty_tools() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("ok")))
        .mount(&server)
        .await;

    client(&server)
        .complete(&[ChatMessage::user("hi")], &[])
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    let body: Value = requests[0].body_json().unwrap();
    assert!(body.get("tools").is_none());
}

#[tokio::test]
async fn test_chat_completion_parses_tool_calls() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_9",
                        "type": "function",
                        "function": { "name": "analyze_diff", "arguments": "{\"diff\":\"\"}" }
                    }]
                }
            }]
        })))
        .mount(&server)
        .await;

    let reply = client(&server)
        .complete(&[ChatMessage::user("hi")], &[diff_schema()])
        .await
        .unwrap();
    assert_eq!(reply.content, None);
    assert_eq!(reply.tool_calls[0].id, "call_9");
    assert_eq!(reply.tool_calls[0].function.arguments, "{\"diff\":\"\"}");
}

#[tokio::test]
async fn test_server_error_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("recovered")))
        .with_priority(2)
        .expect(1)
        .mount(&server)
        .await;

    let reply = client(&server)
        .complete(&[ChatMessage::user("hi")], &[])
        .await
        .unwrap();
    assert_eq!(reply.content.as_deref(), Some("recovered"));
}

#[tokio::test]
async fn test_fractional_multiplier_is_respected() {
    let server = MockServer::start().await;
    // Waits of 100ms then 150ms fit the 280ms budget; doubling to 200ms
    // would not, and a third wait of 225ms does not.
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let policy = BackoffPolicy {
        initial_interval: Duration::from_millis(100),
        max_interval: Duration::from_secs(5),
        multiplier: 1.5,
        max_elapsed_time: Duration::from_millis(280),
        randomization_factor: 0.0,
    };
    let client = OpenAiClient::new(
        &format!("{}/v1/", server.uri()),
        None,
        "gpt-test",
        &policy,
        TIMEOUT,
    )
    .unwrap();

    let err = client
        .complete(&[ChatMessage::user("hi")], &[])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("500"), "{err}");
}

#[tokio::test]
async fn test_client_error_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad model"))
        .expect(1)
        .mount(&server)
        .await;

    let err = client(&server)
        .complete(&[ChatMessage::user("hi")], &[])
        .await
        .unwrap_err();
    let message = err.to_string();
    assert!(message.contains("400"), "{message}");
    assert!(message.contains("bad model"), "{message}");
}

#[tokio::test]
async fn test_empty_choices_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "choices": [] })))
        .mount(&server)
        .await;

    let err = client(&server)
        .complete(&[ChatMessage::user("hi")], &[])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no choices"));
}

fn fetch_registry() -> ToolRegistry {
    let cache = Arc::new(SqliteCache::open_in_memory().unwrap());
    let mut registry = ToolRegistry::new(cache, HOUR);
    registry.register(Tool::FetchUrl(
        FetchUrlTool::new(&BackoffPolicy::no_retry(), TIMEOUT).unwrap(),
    ));
    registry
}

fn url_args(url: &str) -> String {
    json!({ "url": url }).to_string()
}

#[tokio::test]
async fn test_fetch_url_truncates_long_pages() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/log"))
        .respond_with(ResponseTemplate::new(200).set_body_string("a".repeat(12_000)))
        .mount(&server)
        .await;

    let text = fetch_registry()
        .call("fetch_url", &url_args(&format!("{}/log", server.uri())))
        .await
        .unwrap();
    assert!(text.starts_with(&"a".repeat(5000)));
    assert!(text.ends_with("... (truncated)"));
    assert_eq!(text.chars().filter(|c| *c == 'a').count(), 5000);
}

#[tokio::test]
async fn test_fetch_url_short_page_is_returned_whole() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ok"))
        .respond_with(ResponseTemplate::new(200).set_body_string("build passed"))
        .mount(&server)
        .await;

    let text = fetch_registry()
        .call("fetch_url", &url_args(&format!("{}/ok", server.uri())))
        .await
        .unwrap();
    assert_eq!(text, "build passed");
}

#[tokio::test]
async fn test_fetch_url_success_is_cached() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/cached"))
        .respond_with(ResponseTemplate::new(200).set_body_string("log line"))
        .expect(1)
        .mount(&server)
        .await;

    let registry = fetch_registry();
    let args = url_args(&format!("{}/cached", server.uri()));
    let first = registry.call("fetch_url", &args).await.unwrap();
    let second = registry.call("fetch_url", &args).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_fetch_url_error_is_not_cached() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .expect(2)
        .mount(&server)
        .await;

    let registry = fetch_registry();
    let args = url_args(&format!("{}/missing", server.uri()));
    for _ in 0..2 {
        let err = registry.call("fetch_url", &args).await.unwrap_err();
        assert!(err.to_string().contains("404"), "{err}");
    }
}

#[tokio::test]
async fn test_fetch_url_rejects_other_schemes() {
    let err = fetch_registry()
        .call("fetch_url", &url_args("ftp://example.com/file"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Only http and https"), "{err}");

    let err = fetch_registry()
        .call("fetch_url", &url_args("not a url"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Invalid URL"), "{err}");
}
