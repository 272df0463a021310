use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bench_core::{BenchError, FunctionCall, Message, MessageContent, Role, ToolCall, Usage};
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<Value>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub stream: bool,
    pub n: u32,
    pub chat_id: String,
    pub chat_remote: bool,
    pub boost_thinking: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BuildInfo {
    pub version: String,
    #[serde(default)]
    pub commit: String,
}

/// Agent backend a conversation talks to.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn fetch_tools(&self) -> Result<Vec<Value>>;
    /// Each candidate is the complete message sequence after this turn.
    async fn chat(&self, request: &ChatRequest) -> Result<Vec<Vec<Message>>>;
    async fn build_info(&self) -> Result<BuildInfo>;
}

#[derive(Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn checked(&self, response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(BenchError::Protocol(format!("{} returned {}: {}", what, status, body)).into())
    }
}

#[async_trait]
impl InferenceBackend for HttpBackend {
    async fn fetch_tools(&self) -> Result<Vec<Value>> {
        let response = self.client.get(self.url("/v1/tools")).send().await?;
        let body: Value = self.checked(response, "tools").await?.json().await?;
        match body {
            Value::Array(tools) => Ok(tools),
            Value::Object(mut map) => match map.remove("tools") {
                Some(Value::Array(tools)) => Ok(tools),
                _ => Err(BenchError::Protocol("tools response has no `tools` list".into()).into()),
            },
            other => Err(BenchError::Protocol(format!("unexpected tools response: {}", other)).into()),
        }
    }

    async fn chat(&self, request: &ChatRequest) -> Result<Vec<Vec<Message>>> {
        let response = self
            .client
            .post(self.url("/v1/chat"))
            .json(request)
            .send()
            .await?;
        let response = self.checked(response, "chat").await?;

        if !request.stream {
            let body: Value = response.json().await?;
            return parse_chat_response(&request.messages, &body);
        }

        let mut decoder = SseDecoder::default();
        let mut accumulator = StreamAccumulator::default();
        let mut stream = response.bytes_stream();
        'read: while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("chat stream interrupted")?;
            for payload in decoder.push(&chunk) {
                if payload == "[DONE]" {
                    break 'read;
                }
                let event: Value = serde_json::from_str(&payload)
                    .map_err(|e| BenchError::Protocol(format!("bad stream event: {}", e)))?;
                accumulator.apply(&event)?;
            }
        }
        Ok(accumulator.finish(&request.messages))
    }

    async fn build_info(&self) -> Result<BuildInfo> {
        let response = self.client.get(self.url("/build_info")).send().await?;
        let info = self.checked(response, "build_info").await?.json().await?;
        Ok(info)
    }
}

/// Splits a server-sent-events byte stream into `data:` payloads.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\r', '\n']);
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim_start();
                if !data.is_empty() {
                    payloads.push(data.to_string());
                }
            }
        }
        payloads
    }
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

#[derive(Debug, Default)]
struct PartialChoice {
    content: String,
    tool_calls: Vec<PartialToolCall>,
    usage: Option<Usage>,
}

/// Folds streamed deltas back into whole messages.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    deterministic: Vec<Message>,
    choices: Vec<PartialChoice>,
    usage: Option<Usage>,
}

impl StreamAccumulator {
    pub fn apply(&mut self, event: &Value) -> Result<()> {
        if let Some(detail) = event.get("detail") {
            return Err(BenchError::Protocol(format!("backend error: {}", detail)).into());
        }
        if let Some(usage) = event.get("usage").filter(|u| !u.is_null()) {
            self.usage = Some(serde_json::from_value(usage.clone())?);
        }
        let Some(choices) = event.get("choices").and_then(Value::as_array) else {
            if event.get("role").is_some() {
                self.deterministic.push(serde_json::from_value(event.clone())?);
            }
            return Ok(());
        };
        for choice in choices {
            let index = choice.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
            if self.choices.len() <= index {
                self.choices.resize_with(index + 1, PartialChoice::default);
            }
            let slot = &mut self.choices[index];
            let Some(delta) = choice.get("delta") else {
                continue;
            };
            if let Some(text) = delta.get("content").and_then(Value::as_str) {
                slot.content.push_str(text);
            }
            for call in delta
                .get("tool_calls")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                let call_index = call
                    .get("index")
                    .and_then(Value::as_u64)
                    .map(|i| i as usize)
                    .unwrap_or(slot.tool_calls.len());
                if slot.tool_calls.len() <= call_index {
                    slot.tool_calls
                        .resize_with(call_index + 1, PartialToolCall::default);
                }
                let partial = &mut slot.tool_calls[call_index];
                if let Some(id) = call.get("id").and_then(Value::as_str) {
                    partial.id = id.to_string();
                }
                if let Some(function) = call.get("function") {
                    if let Some(name) = function.get("name").and_then(Value::as_str) {
                        partial.name.push_str(name);
                    }
                    if let Some(args) = function.get("arguments").and_then(Value::as_str) {
                        partial.arguments.push_str(args);
                    }
                }
            }
            if let Some(usage) = choice.get("usage").filter(|u| !u.is_null()) {
                slot.usage = Some(serde_json::from_value(usage.clone())?);
            }
        }
        Ok(())
    }

    pub fn finish(self, history: &[Message]) -> Vec<Vec<Message>> {
        let mut prefix = history.to_vec();
        prefix.extend(self.deterministic);
        let usage = self.usage;
        self.choices
            .into_iter()
            .map(|choice| {
                let mut message = Message::assistant(choice.content);
                let calls: Vec<ToolCall> = choice
                    .tool_calls
                    .into_iter()
                    .filter(|c| !c.name.is_empty())
                    .map(|c| ToolCall {
                        id: c.id,
                        kind: "function".to_string(),
                        function: FunctionCall {
                            name: c.name,
                            arguments: c.arguments,
                        },
                    })
                    .collect();
                if !calls.is_empty() {
                    message.tool_calls = Some(calls);
                }
                message.usage = choice.usage.or_else(|| usage.clone());
                let mut candidate = prefix.clone();
                candidate.push(message);
                candidate
            })
            .collect()
    }
}

/// Reads a non-streaming reply: `deterministic_messages` then one message per choice.
pub fn parse_chat_response(history: &[Message], body: &Value) -> Result<Vec<Vec<Message>>> {
    if let Some(detail) = body.get("detail") {
        return Err(BenchError::Protocol(format!("backend error: {}", detail)).into());
    }
    let deterministic: Vec<Message> = match body.get("deterministic_messages") {
        Some(raw) if !raw.is_null() => serde_json::from_value(raw.clone())
            .map_err(|e| BenchError::Protocol(format!("bad deterministic_messages: {}", e)))?,
        _ => Vec::new(),
    };
    let choices = body
        .get("choices")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!(BenchError::Protocol("chat response has no choices".into())))?;
    let usage: Option<Usage> = match body.get("usage") {
        Some(raw) if !raw.is_null() => Some(serde_json::from_value(raw.clone())?),
        _ => None,
    };

    let mut prefix = history.to_vec();
    prefix.extend(deterministic);
    let mut candidates = Vec::with_capacity(choices.len());
    for choice in choices {
        let raw = choice
            .get("message")
            .ok_or_else(|| anyhow!(BenchError::Protocol("choice without message".into())))?;
        let mut message: Message = serde_json::from_value(raw.clone())
            .map_err(|e| BenchError::Protocol(format!("bad choice message: {}", e)))?;
        if message.role != Role::Assistant {
            debug!(role = ?message.role, "non-assistant choice");
        }
        if message.content.is_none() {
            message.content = Some(MessageContent::Text(String::new()));
        }
        if message.usage.is_none() {
            message.usage = usage.clone();
        }
        let mut candidate = prefix.clone();
        candidate.push(message);
        candidates.push(candidate);
    }
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sse_decoder_handles_split_lines() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: {\"a\"").is_empty());
        let payloads = decoder.push(b": 1}\r\n\r\ndata: [DONE]\n");
        assert_eq!(payloads, vec!["{\"a\": 1}".to_string(), "[DONE]".to_string()]);
    }

    #[test]
    fn accumulator_rebuilds_tool_calls_from_deltas() {
        let history = vec![Message::user("hi")];
        let mut acc = StreamAccumulator::default();
        for event in [
            json!({"role": "context_file", "content": "[]"}),
            json!({"choices": [{"index": 0, "delta": {"role": "assistant", "content": "Let me "}}]}),
            json!({"choices": [{"index": 0, "delta": {"content": "look", "tool_calls": [
                {"index": 0, "id": "call_a", "function": {"name": "cat", "arguments": "{\"pa"}}
            ]}}]}),
            json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "ths\":\"a\"}"}}
            ]}}]}),
            json!({"choices": [], "usage": {"prompt_tokens": 7, "completion_tokens": 3}}),
        ] {
            acc.apply(&event).expect("apply");
        }
        let candidates = acc.finish(&history);
        assert_eq!(candidates.len(), 1);
        let messages = &candidates[0];
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1].role, Role::ContextFile);
        let last = &messages[2];
        assert_eq!(last.text().as_deref(), Some("Let me look"));
        assert_eq!(last.tool_names(), vec!["cat"]);
        let call = &last.tool_calls.as_ref().expect("calls")[0];
        assert_eq!(call.function.arguments, "{\"paths\":\"a\"}");
        assert_eq!(last.usage.as_ref().expect("usage").prompt_tokens, 7);
    }

    #[test]
    fn stream_error_detail_is_a_protocol_error() {
        let mut acc = StreamAccumulator::default();
        let err = acc
            .apply(&json!({"detail": "model not found"}))
            .expect_err("should fail");
        assert_eq!(
            BenchError::classify(&err),
            Some(bench_core::ErrorKind::Protocol)
        );
    }

    #[test]
    fn non_streaming_reply_appends_each_choice() {
        let history = vec![Message::user("hi")];
        let body = json!({
            "deterministic_messages": [{"role": "tool", "tool_call_id": "x", "content": "out"}],
            "choices": [{"message": {"role": "assistant", "content": "done"}}],
            "usage": {"prompt_tokens": 1, "completion_tokens": 2}
        });
        let candidates = parse_chat_response(&history, &body).expect("parse");
        assert_eq!(candidates[0].len(), 3);
        assert_eq!(candidates[0][2].text().as_deref(), Some("done"));
        assert!(parse_chat_response(&history, &json!({})).is_err());
    }
}
