//! Chat-completion boundary shared by the code agent and the post-run generators.
//!
//! `ChatModel` is the seam; `OpenAiChatModel` speaks the OpenAI-compatible
//! `/chat/completions` wire format, `ScriptedChatModel` replays canned replies.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::config::AgentConfig;
use crate::errors::LlmError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool-call directive emitted by the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON arguments exactly as the model produced them.
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::text(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text(Role::Assistant, content)
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }
}

/// Function schema advertised to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: Option<u32>,
    /// Ask the provider for a single JSON object reply.
    pub json_response: bool,
}

/// One assistant reply: free text, tool calls, or both.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

impl ChatResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            tool_calls: Vec::new(),
        }
    }

    pub fn tool_call(id: &str, name: &str, arguments: Value) -> Self {
        Self {
            content: None,
            tool_calls: vec![ToolCall {
                id: id.to_string(),
                name: name.to_string(),
                arguments: arguments.to_string(),
            }],
        }
    }

    pub fn into_message(self) -> ChatMessage {
        ChatMessage {
            role: Role::Assistant,
            content: self.content,
            tool_calls: self.tool_calls,
            tool_call_id: None,
        }
    }
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError>;
}

// ── OpenAI-compatible client ─────────────────────────────────────────

pub struct OpenAiChatModel {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    max_retries: u32,
}

impl OpenAiChatModel {
    pub fn new(config: &AgentConfig) -> Result<Self, LlmError> {
        let api_key = config.api_key.clone().ok_or(LlmError::MissingApiKey)?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            max_retries: config.max_retries,
        })
    }

    fn payload(request: &ChatRequest) -> Value {
        let messages: Vec<Value> = request.messages.iter().map(wire_message).collect();
        let mut payload = json!({
            "model": request.model,
            "messages": messages,
        });
        if let Some(temperature) = request.temperature {
            payload["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = request.max_tokens {
            payload["max_tokens"] = json!(max_tokens);
        }
        if request.json_response {
            payload["response_format"] = json!({ "type": "json_object" });
        }
        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            payload["tools"] = Value::Array(tools);
        }
        payload
    }
}

fn wire_message(message: &ChatMessage) -> Value {
    let mut value = json!({
        "role": message.role,
        "content": message.content,
    });
    if !message.tool_calls.is_empty() {
        let calls: Vec<Value> = message
            .tool_calls
            .iter()
            .map(|c| {
                json!({
                    "id": c.id,
                    "type": "function",
                    "function": { "name": c.name, "arguments": c.arguments },
                })
            })
            .collect();
        value["tool_calls"] = Value::Array(calls);
    }
    if let Some(id) = &message.tool_call_id {
        value["tool_call_id"] = json!(id);
    }
    value
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    choices: Vec<WireChoice>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireMessage,
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

fn parse_response(body: &str) -> Result<ChatResponse, LlmError> {
    let wire: WireResponse =
        serde_json::from_str(body).map_err(|e| LlmError::Decode(e.to_string()))?;
    let choice = wire.choices.into_iter().next().ok_or(LlmError::EmptyResponse)?;
    Ok(ChatResponse {
        content: choice.message.content.filter(|c| !c.is_empty()),
        tool_calls: choice
            .message
            .tool_calls
            .into_iter()
            .map(|c| ToolCall {
                id: c.id,
                name: c.function.name,
                arguments: c.function.arguments,
            })
            .collect(),
    })
}

/// Exponential delay: 200ms, 400ms, 800ms, ...
pub(crate) fn backoff(attempt: u32) -> Duration {
    Duration::from_millis(200u64.saturating_mul(1u64 << attempt.saturating_sub(1).min(16)))
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let payload = Self::payload(request);
        debug!(model = %request.model, messages = request.messages.len(), "POST {url}");

        let mut attempt = 0;
        loop {
            attempt += 1;
            let res = self
                .client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&payload)
                .send()
                .await;

            match res {
                Ok(resp) if resp.status().is_success() => {
                    let body = resp.text().await?;
                    return parse_response(&body);
                }
                Ok(resp) => {
                    let status = resp.status();
                    let retryable =
                        status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
                    if !retryable || attempt > self.max_retries {
                        let body = resp.text().await.unwrap_or_default();
                        return Err(LlmError::UnexpectedStatus {
                            status: status.as_u16(),
                            body,
                        });
                    }

                    let retry_after = resp
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| s.parse::<u64>().ok())
                        .map(Duration::from_secs);
                    let delay = retry_after.unwrap_or_else(|| backoff(attempt));
                    warn!(%status, attempt, ?delay, "Model provider busy, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if attempt > self.max_retries {
                        return Err(e.into());
                    }
                    warn!(error = %e, attempt, "Model request failed, retrying");
                    tokio::time::sleep(backoff(attempt)).await;
                }
            }
        }
    }
}

// ── Scripted model ───────────────────────────────────────────────────

/// Replays queued responses in order and records every request it receives.
/// Once the queue is empty the fallback (if any) is returned forever.
#[derive(Default)]
pub struct ScriptedChatModel {
    responses: Mutex<VecDeque<ChatResponse>>,
    fallback: Option<ChatResponse>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedChatModel {
    pub fn new(responses: Vec<ChatResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            ..Default::default()
        }
    }

    pub fn with_fallback(mut self, response: ChatResponse) -> Self {
        self.fallback = Some(response);
        self
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ChatModel for ScriptedChatModel {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let next = self
            .responses
            .lock()
            .ok()
            .and_then(|mut queue| queue.pop_front());
        next.or_else(|| self.fallback.clone())
            .ok_or(LlmError::EmptyResponse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(base_url: &str) -> AgentConfig {
        AgentConfig {
            base_url: base_url.to_string(),
            api_key: Some("sk-test".into()),
            max_retries: 2,
            ..Default::default()
        }
    }

    fn request() -> ChatRequest {
        ChatRequest {
            model: "gpt-4.1".into(),
            messages: vec![ChatMessage::system("sys"), ChatMessage::user("hi")],
            temperature: Some(0.1),
            tools: vec![ToolDefinition {
                name: "terminal".into(),
                description: "run".into(),
                parameters: json!({"type": "object"}),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_new_requires_api_key() {
        let config = AgentConfig::default();
        assert!(matches!(
            OpenAiChatModel::new(&config),
            Err(LlmError::MissingApiKey)
        ));
    }

    #[test]
    fn test_payload_includes_temperature_and_tools() {
        let payload = OpenAiChatModel::payload(&request());
        assert_eq!(payload["model"], "gpt-4.1");
        assert_eq!(payload["messages"][0]["role"], "system");
        assert_eq!(payload["tools"][0]["function"]["name"], "terminal");
        assert!(payload["temperature"].as_f64().unwrap() < 0.2);
        assert!(payload.get("response_format").is_none());
        assert!(payload.get("max_tokens").is_none());
    }

    #[test]
    fn test_payload_json_mode() {
        let payload = OpenAiChatModel::payload(&ChatRequest {
            json_response: true,
            max_tokens: Some(4096),
            ..request()
        });
        assert_eq!(payload["response_format"], json!({"type": "json_object"}));
        assert_eq!(payload["max_tokens"], 4096);
    }

    #[test]
    fn test_wire_message_for_tool_result() {
        let value = wire_message(&ChatMessage::tool_result("call_1", "ok"));
        assert_eq!(value["role"], "tool");
        assert_eq!(value["tool_call_id"], "call_1");
        assert_eq!(value["content"], "ok");
    }

    #[test]
    fn test_parse_response_with_tool_calls() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":null,
            "tool_calls":[{"id":"c1","type":"function","function":{"name":"terminal","arguments":"{\"command\":\"ls\"}"}}]}}]}"#;
        let response = parse_response(body).unwrap();
        assert!(response.content.is_none());
        assert_eq!(response.tool_calls[0].name, "terminal");
        assert_eq!(response.tool_calls[0].arguments, r#"{"command":"ls"}"#);
    }

    #[test]
    fn test_parse_response_without_choices() {
        assert!(matches!(
            parse_response(r#"{"choices":[]}"#),
            Err(LlmError::EmptyResponse)
        ));
    }

    #[test]
    fn test_backoff_grows() {
        assert_eq!(backoff(1), Duration::from_millis(200));
        assert_eq!(backoff(2), Duration::from_millis(400));
        assert_eq!(backoff(3), Duration::from_millis(800));
    }

    #[tokio::test]
    async fn test_complete_against_mock_server() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "Hello"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let model = OpenAiChatModel::new(&config(&server.uri())).unwrap();
        let response = model.complete(&request()).await.unwrap();
        assert_eq!(response.content.as_deref(), Some("Hello"));
    }

    #[tokio::test]
    async fn test_complete_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(503).insert_header("retry-after", "0"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "recovered"}}]
            })))
            .mount(&server)
            .await;

        let model = OpenAiChatModel::new(&config(&server.uri())).unwrap();
        let response = model.complete(&request()).await.unwrap();
        assert_eq!(response.content.as_deref(), Some("recovered"));
    }

    #[tokio::test]
    async fn test_complete_does_not_retry_client_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .expect(1)
            .mount(&server)
            .await;

        let model = OpenAiChatModel::new(&config(&server.uri())).unwrap();
        match model.complete(&request()).await {
            Err(LlmError::UnexpectedStatus { status, body }) => {
                assert_eq!(status, 401);
                assert_eq!(body, "bad key");
            }
            other => panic!("Expected UnexpectedStatus, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_scripted_model_replays_then_falls_back() {
        let model = ScriptedChatModel::new(vec![ChatResponse::text("first")])
            .with_fallback(ChatResponse::text("again"));
        assert_eq!(
            model.complete(&request()).await.unwrap().content.as_deref(),
            Some("first")
        );
        assert_eq!(
            model.complete(&request()).await.unwrap().content.as_deref(),
            Some("again")
        );
        assert_eq!(model.requests().len(), 2);
    }
}
