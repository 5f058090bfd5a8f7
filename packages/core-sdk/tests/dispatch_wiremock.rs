use std::sync::Arc;
use std::time::Duration;

use chatlist_core_sdk::credentials::CredentialStore;
use chatlist_core_sdk::dispatch::Dispatcher;
use chatlist_core_sdk::error::DispatchError;
use chatlist_core_sdk::llm::ProviderFamily;
use chatlist_core_sdk::models::ModelConfig;
use futures_util::{pin_mut, StreamExt};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn model(id: i64, name: &str, family: ProviderFamily, url: String, credential: &str) -> ModelConfig {
    ModelConfig {
        id,
        name: name.to_string(),
        api_url: url,
        api_id: credential.to_string(),
        family,
        is_active: true,
        created_at: "2024-01-01 00:00:00".to_string(),
    }
}

fn endpoint(server: &MockServer) -> String {
    format!("{}/v1/chat/completions", server.uri())
}

fn dispatcher(pairs: &[(&str, &str)], timeout: Duration) -> Dispatcher {
    let creds = CredentialStore::from_pairs(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())));
    Dispatcher::with_timeout(Arc::new(creds), timeout).unwrap()
}

fn reply(content: &str) -> serde_json::Value {
    json!({ "choices": [{ "message": { "role": "assistant", "content": content } }] })
}

#[tokio::test]
async fn one_outcome_per_model_in_input_order() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(reply("pong")))
        .mount(&server)
        .await;

    let configs: Vec<ModelConfig> = (1..=4)
        .map(|i| model(i, &format!("m-{}", i), ProviderFamily::OpenAI, endpoint(&server), "KEY"))
        .collect();
    let d = dispatcher(&[("KEY", "sk-1")], Duration::from_secs(5));

    let outcomes = d.dispatch("ping", &configs).await;
    assert_eq!(outcomes.len(), 4);
    for (outcome, cfg) in outcomes.iter().zip(&configs) {
        assert_eq!(outcome.model_id, cfg.id);
        assert_eq!(outcome.reply().unwrap().response, "pong");
    }
}

#[tokio::test]
async fn missing_credential_makes_no_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(reply("never")))
        .expect(0)
        .mount(&server)
        .await;

    let d = dispatcher(&[], Duration::from_secs(5));
    let configs = vec![model(1, "m", ProviderFamily::OpenAI, endpoint(&server), "KEY1")];
    let outcomes = d.dispatch("Hello", &configs).await;

    assert_eq!(outcomes.len(), 1);
    let err = outcomes[0].result.as_ref().unwrap_err();
    assert!(matches!(err, DispatchError::CredentialMissing { .. }));
    assert!(err.to_string().contains("KEY1"));
}

#[tokio::test]
async fn provider_failure_does_not_affect_sibling() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({ "model": "broken" })))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream exploded"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({ "model": "healthy" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(reply("fine")))
        .mount(&server)
        .await;

    let d = dispatcher(&[("KEY", "sk-1")], Duration::from_secs(5));
    let configs = vec![
        model(1, "broken", ProviderFamily::OpenAI, endpoint(&server), "KEY"),
        model(2, "healthy", ProviderFamily::OpenAI, endpoint(&server), "KEY"),
    ];
    let outcomes = d.dispatch("Hello", &configs).await;

    let err = outcomes[0].result.as_ref().unwrap_err();
    assert_eq!(err.kind(), "provider_status");
    assert!(err.to_string().contains("500"));
    assert!(err.to_string().contains("upstream exploded"));
    assert_eq!(outcomes[1].reply().unwrap().response, "fine");
}

#[tokio::test]
async fn slow_provider_times_out_without_blocking_fast_one() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({ "model": "slow" })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(reply("too late"))
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({ "model": "fast" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(reply("quick")))
        .mount(&server)
        .await;

    let d = dispatcher(&[("KEY", "sk-1")], Duration::from_millis(300));
    let configs = vec![
        model(1, "slow", ProviderFamily::OpenAI, endpoint(&server), "KEY"),
        model(2, "fast", ProviderFamily::OpenAI, endpoint(&server), "KEY"),
    ];

    let stream = d.dispatch_stream("Hello", &configs);
    pin_mut!(stream);
    let mut order = Vec::new();
    let mut slow_err = None;
    while let Some((index, outcome)) = stream.next().await {
        order.push(index);
        if index == 0 {
            slow_err = outcome.result.err();
        } else {
            assert_eq!(outcome.reply().unwrap().response, "quick");
        }
    }

    assert_eq!(order, vec![1, 0]);
    let err = slow_err.expect("slow model should fail");
    assert!(err.is_timeout());
    assert_eq!(err.kind(), "timeout");
}

#[tokio::test]
async fn usage_and_model_are_normalized() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-secret"))
        .and(header("content-type", "application/json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "model": "m-echo",
            "choices": [{ "message": { "content": "X" } }],
            "usage": { "total_tokens": 42 }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let d = dispatcher(&[("KEY", "sk-secret")], Duration::from_secs(5));
    let configs = vec![model(9, "m", ProviderFamily::DeepSeek, endpoint(&server), "KEY")];
    let outcomes = d.dispatch("Hello", &configs).await;

    let reply = outcomes[0].reply().unwrap();
    assert_eq!(reply.response, "X");
    assert_eq!(reply.metadata.tokens_used, 42);
    assert_eq!(reply.metadata.model, "m-echo");
    assert_eq!(reply.metadata.api_type, "deepseek");
    assert!(reply.metadata.response_time >= 0.0);
}

#[tokio::test]
async fn missing_usage_defaults_to_zero_tokens() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "content": "Hi there" } }]
        })))
        .mount(&server)
        .await;

    let d = dispatcher(&[("KEY", "sk-1")], Duration::from_secs(5));
    let configs = vec![model(1, "groq-model", ProviderFamily::Groq, endpoint(&server), "KEY")];
    let outcomes = d.dispatch("Hello", &configs).await;

    let reply = outcomes[0].reply().unwrap();
    assert_eq!(reply.response, "Hi there");
    assert_eq!(reply.metadata.tokens_used, 0);
    assert_eq!(reply.metadata.model, "groq-model");
}

#[tokio::test]
async fn malformed_body_is_reported_per_model() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "choices": [] })))
        .mount(&server)
        .await;

    let d = dispatcher(&[("KEY", "sk-1")], Duration::from_secs(5));
    let configs = vec![model(1, "m", ProviderFamily::OpenAI, endpoint(&server), "KEY")];
    let outcomes = d.dispatch("Hello", &configs).await;
    assert_eq!(outcomes[0].result.as_ref().unwrap_err().kind(), "malformed_response");
}

#[tokio::test]
async fn openrouter_without_vendor_prefix_sends_default_model() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({
            "model": "openai/gpt-3.5-turbo",
            "messages": [{ "role": "user", "content": "Hello" }]
        })))
        .and(header("x-title", "ChatList"))
        .respond_with(ResponseTemplate::new(200).set_body_json(reply("ok")))
        .expect(1)
        .mount(&server)
        .await;

    let d = dispatcher(&[("OR_KEY", "sk-or")], Duration::from_secs(5));
    let configs = vec![model(1, "gpt-4", ProviderFamily::OpenRouter, endpoint(&server), "OR_KEY")];
    let outcomes = d.dispatch("Hello", &configs).await;
    assert!(outcomes[0].is_ok());
}

#[tokio::test]
async fn universal_model_without_url_fails_locally() {
    let d = dispatcher(&[("KEY", "sk-1")], Duration::from_secs(5));
    let configs = vec![model(1, "custom", ProviderFamily::Universal, String::new(), "KEY")];
    let outcomes = d.dispatch("Hello", &configs).await;
    assert_eq!(outcomes[0].result.as_ref().unwrap_err().kind(), "endpoint_missing");
}
