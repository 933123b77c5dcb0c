//! OpenAI-compatible chat completion adapter for local model servers
//! (llama.cpp server, LM Studio, Ollama's OpenAI endpoint).

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;

use crate::registry::ResolvedModel;
use crate::types::{ChatMessage, Role};

pub const DEFAULT_THINK_BYPASS_TAG: &str = "<think></think>";

#[derive(Debug, Clone, Copy)]
pub struct HttpConfig {
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 2000,
            request_timeout_ms: 180_000,
        }
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    Connection,
    Timeout,
    RateLimit,
    Server,
    Client,
    Unauthorized,
    Parse,
    Other,
}

#[derive(Debug)]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub http_status: Option<u16>,
    pub retryable: bool,
    pub message: String,
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "provider {:?} error: {}",
            self.kind,
            message_short(&self.message)
        )
    }
}

impl std::error::Error for ProviderError {}

pub fn classify_status(status: u16) -> (ProviderErrorKind, bool) {
    match status {
        429 => (ProviderErrorKind::RateLimit, true),
        401 | 403 => (ProviderErrorKind::Unauthorized, false),
        400 | 404 => (ProviderErrorKind::Client, false),
        502..=504 => (ProviderErrorKind::Server, true),
        500..=599 => (ProviderErrorKind::Server, false),
        _ => (ProviderErrorKind::Other, false),
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> (ProviderErrorKind, bool) {
    if err.is_timeout() {
        return (ProviderErrorKind::Timeout, true);
    }
    if err.is_connect() {
        return (ProviderErrorKind::Connection, true);
    }
    if let Some(status) = err.status() {
        return classify_status(status.as_u16());
    }
    (ProviderErrorKind::Other, false)
}

pub fn message_short(s: &str) -> String {
    let single_line = s
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect::<String>();
    let trimmed = single_line.trim();
    if trimmed.chars().count() <= 200 {
        trimmed.to_string()
    } else {
        trimmed.chars().take(200).collect()
    }
}

/// One chat completion request. Sampling fields set here override the
/// model's registry defaults; `extra_body` overrides both (request-level
/// wins on key collision, see `merged_extra`). `debug_enabled` logs the
/// outgoing payload to stderr, labeled with `debug_tag`.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
    pub min_p: Option<f32>,
    pub top_k: Option<u32>,
    pub extra_body: serde_json::Map<String, Value>,
    pub disable_thinking_hack: bool,
    pub think_bypass_tag: Option<String>,
    pub debug_enabled: bool,
    pub debug_tag: Option<String>,
}

impl ChatRequest {
    /// Model-level `extra_params` first, then request-level `extra_body`;
    /// request-level entries win on key collision.
    pub fn merged_extra(&self, model: &ResolvedModel) -> serde_json::Map<String, Value> {
        let mut merged = model.extra_params.clone().unwrap_or_default();
        for (k, v) in &self.extra_body {
            merged.insert(k.clone(), v.clone());
        }
        merged
    }
}

#[derive(Debug, Clone)]
pub struct ChatReply {
    pub content: String,
    pub raw: Value,
}

#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn complete(&self, req: ChatRequest) -> anyhow::Result<ChatReply>;

    // Hand-desugared (not `async fn`) because async_trait's rewrite pins the
    // `&str` passed to `on_token` to a single lifetime, which the borrow
    // checker then rejects; writing the `Pin<Box<dyn Future>>` signature
    // ourselves keeps `on_token`'s per-call lifetime free.
    fn stream<'a>(
        &'a self,
        req: ChatRequest,
        on_token: &'a mut (dyn FnMut(&str) + Send),
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<ChatReply>> + Send + 'a>>;

    fn model_name(&self) -> &str;
}

#[derive(Debug, Clone)]
pub struct OpenAiCompatApi {
    client: Client,
    model: ResolvedModel,
}

impl OpenAiCompatApi {
    pub fn new(model: ResolvedModel, http: HttpConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_millis(http.connect_timeout_ms))
            .timeout(Duration::from_millis(http.request_timeout_ms))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client, model })
    }

    fn completions_url(&self) -> String {
        format!(
            "{}/chat/completions",
            self.model.endpoint.trim_end_matches('/')
        )
    }

    fn build_payload(&self, req: &ChatRequest, stream: bool) -> Value {
        let messages = apply_think_bypass(req);
        let mut body = serde_json::Map::new();
        body.insert(
            "model".to_string(),
            Value::String(self.model.model_name.clone()),
        );
        body.insert(
            "messages".to_string(),
            serde_json::to_value(&messages).unwrap_or(Value::Array(Vec::new())),
        );
        if let Some(t) = req.temperature.or(self.model.temperature) {
            body.insert("temperature".to_string(), float_value(t));
        }
        if let Some(m) = req.max_tokens.or(self.model.max_tokens) {
            body.insert("max_tokens".to_string(), Value::from(m));
        }
        if let Some(p) = req.top_p {
            body.insert("top_p".to_string(), float_value(p));
        }
        if let Some(p) = req.min_p {
            body.insert("min_p".to_string(), float_value(p));
        }
        if let Some(k) = req.top_k {
            body.insert("top_k".to_string(), Value::from(k));
        }
        body.insert("stream".to_string(), Value::Bool(stream));
        for (k, v) in req.merged_extra(&self.model) {
            body.insert(k, v);
        }
        Value::Object(body)
    }

    async fn send(
        &self,
        payload: &Value,
        debug_enabled: bool,
        debug_tag: Option<&str>,
    ) -> anyhow::Result<reqwest::Response> {
        if debug_enabled {
            eprintln!(
                "DEBUG[{}] POST {} payload={}",
                debug_tag.unwrap_or("-"),
                self.completions_url(),
                message_short(&payload.to_string())
            );
        }
        let mut request = self.client.post(self.completions_url()).json(payload);
        if let Some(key) = &self.model.credential {
            request = request.bearer_auth(key);
        }
        let response = request.send().await.map_err(|e| {
            let (kind, retryable) = classify_reqwest_error(&e);
            anyhow::Error::new(ProviderError {
                kind,
                http_status: e.status().map(|s| s.as_u16()),
                retryable,
                message: e.to_string(),
            })
        })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let (kind, retryable) = classify_status(status.as_u16());
            return Err(anyhow::Error::new(ProviderError {
                kind,
                http_status: Some(status.as_u16()),
                retryable,
                message: format!("status {}: {}", status.as_u16(), message_short(&body)),
            }));
        }
        Ok(response)
    }
}

#[derive(Debug, Default, Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    #[serde(default)]
    message: WireMessage,
    #[serde(default)]
    delta: WireMessage,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    choices: Vec<WireChoice>,
}

#[async_trait]
impl ChatApi for OpenAiCompatApi {
    async fn complete(&self, req: ChatRequest) -> anyhow::Result<ChatReply> {
        let payload = self.build_payload(&req, false);
        let response = self
            .send(&payload, req.debug_enabled, req.debug_tag.as_deref())
            .await?;
        let raw: Value = response.json().await.map_err(|e| {
            anyhow::Error::new(ProviderError {
                kind: ProviderErrorKind::Parse,
                http_status: None,
                retryable: false,
                message: format!("failed to parse completion JSON: {e}"),
            })
        })?;
        let parsed: WireResponse = serde_json::from_value(raw.clone()).map_err(|e| {
            anyhow::Error::new(ProviderError {
                kind: ProviderErrorKind::Parse,
                http_status: None,
                retryable: false,
                message: format!("unexpected completion shape: {e}"),
            })
        })?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        Ok(ChatReply { content, raw })
    }

    fn stream<'a>(
        &'a self,
        req: ChatRequest,
        on_token: &'a mut (dyn FnMut(&str) + Send),
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<ChatReply>> + Send + 'a>>
    {
        Box::pin(self.stream_impl(req, on_token))
    }

    fn model_name(&self) -> &str {
        &self.model.model_name
    }
}

impl OpenAiCompatApi {
    async fn stream_impl(
        &self,
        req: ChatRequest,
        on_token: &mut (dyn FnMut(&str) + Send),
    ) -> anyhow::Result<ChatReply> {
        let payload = self.build_payload(&req, true);
        let response = self
            .send(&payload, req.debug_enabled, req.debug_tag.as_deref())
            .await?;

        let mut stream = response.bytes_stream();
        let mut text_buf = String::new();
        let mut content = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                let (kind, retryable) = classify_reqwest_error(&e);
                anyhow::Error::new(ProviderError {
                    kind,
                    http_status: None,
                    retryable,
                    message: format!("stream read failed: {e}"),
                })
            })?;
            text_buf.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(pos) = text_buf.find('\n') {
                let line = text_buf[..pos].trim().to_string();
                text_buf = text_buf[pos + 1..].to_string();
                if line.is_empty() || !line.starts_with("data:") {
                    continue;
                }
                let data = line.trim_start_matches("data:").trim();
                if data == "[DONE]" {
                    continue;
                }
                if let Some(token) = parse_stream_delta(data)? {
                    on_token(&token);
                    content.push_str(&token);
                }
            }
        }
        Ok(ChatReply {
            content,
            raw: Value::Null,
        })
    }
}

fn parse_stream_delta(data: &str) -> anyhow::Result<Option<String>> {
    let item: WireResponse = serde_json::from_str(data).map_err(|e| {
        anyhow::Error::new(ProviderError {
            kind: ProviderErrorKind::Parse,
            http_status: None,
            retryable: false,
            message: format!("failed parsing stream event: {e}"),
        })
    })?;
    Ok(item
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|t| !t.is_empty()))
}

/// Inject the empty-think assistant primer after the last user message so
/// reasoning-tag models skip their hidden monologue.
fn apply_think_bypass(req: &ChatRequest) -> Vec<ChatMessage> {
    if !req.disable_thinking_hack {
        return req.messages.clone();
    }
    let tag = req
        .think_bypass_tag
        .clone()
        .unwrap_or_else(|| DEFAULT_THINK_BYPASS_TAG.to_string());
    let mut out = req.messages.clone();
    let insert_at = out
        .iter()
        .rposition(|m| matches!(m.role, Role::User))
        .map(|i| i + 1)
        .unwrap_or(out.len());
    out.insert(insert_at, ChatMessage::assistant(tag));
    out
}

fn float_value(f: f32) -> Value {
    serde_json::Number::from_f64(f64::from(f))
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::{
        apply_think_bypass, classify_status, message_short, parse_stream_delta, ChatRequest,
        ProviderErrorKind, DEFAULT_THINK_BYPASS_TAG,
    };
    use crate::registry::ResolvedModel;
    use crate::types::{ChatMessage, Role};

    fn model() -> ResolvedModel {
        ResolvedModel {
            id: "m".to_string(),
            provider: "llamacpp".to_string(),
            endpoint: "http://127.0.0.1:8080/v1".to_string(),
            credential: None,
            model_name: "test-model".to_string(),
            context_length: Some(8192),
            temperature: Some(0.5),
            max_tokens: None,
            extra_params: Some(
                serde_json::json!({"repeat_penalty": 1.1, "seed": 7})
                    .as_object()
                    .cloned()
                    .expect("map"),
            ),
        }
    }

    #[test]
    fn classify_status_mappings() {
        assert_eq!(classify_status(429), (ProviderErrorKind::RateLimit, true));
        assert_eq!(classify_status(503), (ProviderErrorKind::Server, true));
        assert_eq!(classify_status(500), (ProviderErrorKind::Server, false));
        assert_eq!(
            classify_status(401),
            (ProviderErrorKind::Unauthorized, false)
        );
        assert_eq!(classify_status(404), (ProviderErrorKind::Client, false));
    }

    #[test]
    fn request_extra_body_wins_over_model_params() {
        let req = ChatRequest {
            extra_body: serde_json::json!({"seed": 42})
                .as_object()
                .cloned()
                .expect("map"),
            ..ChatRequest::default()
        };
        let merged = req.merged_extra(&model());
        assert_eq!(merged.get("seed"), Some(&serde_json::json!(42)));
        assert_eq!(
            merged.get("repeat_penalty"),
            Some(&serde_json::json!(1.1))
        );
    }

    #[test]
    fn think_bypass_primer_lands_after_last_user_message() {
        let req = ChatRequest {
            messages: vec![
                ChatMessage::system("sys"),
                ChatMessage::user("first"),
                ChatMessage::assistant("reply"),
                ChatMessage::user("second"),
            ],
            disable_thinking_hack: true,
            ..ChatRequest::default()
        };
        let out = apply_think_bypass(&req);
        assert_eq!(out.len(), 5);
        assert!(matches!(out[4].role, Role::Assistant));
        assert_eq!(out[4].content, DEFAULT_THINK_BYPASS_TAG);

        let off = ChatRequest {
            messages: req.messages.clone(),
            ..ChatRequest::default()
        };
        assert_eq!(apply_think_bypass(&off).len(), 4);
    }

    #[test]
    fn stream_delta_extracts_content() {
        let token = parse_stream_delta(r#"{"choices":[{"delta":{"content":"hel"}}]}"#)
            .expect("parse")
            .expect("token");
        assert_eq!(token, "hel");
        assert!(parse_stream_delta(r#"{"choices":[{"delta":{}}]}"#)
            .expect("parse")
            .is_none());
        assert!(parse_stream_delta("garbage").is_err());
    }

    #[test]
    fn message_short_flattens_and_caps() {
        assert_eq!(message_short("a\nb"), "a b");
        assert_eq!(message_short(&"x".repeat(500)).chars().count(), 200);
    }
}
