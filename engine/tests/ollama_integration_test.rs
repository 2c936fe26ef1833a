//! Integration tests for Ollama provider
//!
//! These tests do NOT require a running Ollama instance. The chat endpoint
//! is served by a mock server, or the provider is pointed at a dead port.

use polyquery_engine::llm::{ollama::OllamaProvider, LLMError, LLMProvider, Message};
use serde_json::json;
use wiremock::{
    matchers::{body_partial_json, method, path},
    Mock, MockServer, ResponseTemplate,
};

#[tokio::test]
async fn test_ollama_provider_properties() {
    let provider = OllamaProvider::new("http://localhost:11434", "llama3.1:8b");

    assert_eq!(provider.name(), "ollama");
    assert!(provider.is_local());
}

#[tokio::test]
async fn test_ollama_connection_error() {
    // Use an invalid port to ensure connection fails
    let provider = OllamaProvider::new("http://localhost:99999", "llama3.1:8b");
    let messages = vec![Message::user("Hello")];

    let result = provider.generate(&messages).await;

    assert!(result.is_err());
    match result.unwrap_err() {
        LLMError::ProviderUnavailable(msg) => {
            assert!(msg.contains("Cannot connect to Ollama"));
        }
        LLMError::NetworkError(_) => {
            // Also acceptable - network errors can manifest differently
        }
        other => panic!(
            "Expected ProviderUnavailable or NetworkError, got: {:?}",
            other
        ),
    }
}

#[tokio::test]
async fn test_ollama_chat_round_trip() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .and(body_partial_json(json!({
            "model": "llama3.1:8b",
            "stream": false,
            "options": {"temperature": 0.0}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "model": "llama3.1:8b",
            "message": {"role": "assistant", "content": "SELECT COUNT(*) FROM orders"},
            "done": true
        })))
        .expect(1)
        .mount(&server)
        .await;

    let provider = OllamaProvider::new(server.uri(), "llama3.1:8b").with_temperature(0.0);
    let reply = provider
        .generate(&[
            Message::system("You are a SQLite expert."),
            Message::user("Task: Count orders"),
        ])
        .await
        .unwrap();

    assert_eq!(reply, "SELECT COUNT(*) FROM orders");
}

#[tokio::test]
async fn test_ollama_api_error_maps_to_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(500).set_body_string("model not loaded"))
        .mount(&server)
        .await;

    let provider = OllamaProvider::new(server.uri(), "llama3.1:8b");
    match provider.generate(&[Message::user("hi")]).await {
        Err(LLMError::ProviderUnavailable(msg)) => assert!(msg.contains("model not loaded")),
        other => panic!("expected ProviderUnavailable, got {:?}", other),
    }
}

#[tokio::test]
async fn test_ollama_health_check() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"models": []})))
        .mount(&server)
        .await;

    let healthy = OllamaProvider::new(server.uri(), "llama3.1:8b");
    assert!(healthy.check_health().await);

    let unreachable = OllamaProvider::new("http://localhost:99999", "llama3.1:8b");
    assert!(!unreachable.check_health().await);
}
