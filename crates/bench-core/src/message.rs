use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
    ContextFile,
    /// Corrective instruction injected by the runner, not by the agent.
    CdInstruction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentPart {
    pub m_type: String,
    pub m_content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

fn default_tool_call_type() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default = "default_tool_call_type")]
    pub kind: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u64>,
}

/// Marks which guard rule produced a corrective message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvisoryKind {
    PreferDebugger,
    DebuggerLimit,
    PlanBeforeEdit,
    Difficulties,
    RevisitedStage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advisory: Option<AdvisoryKind>,
    /// Backend fields this runner does not interpret, kept for lossless persistence.
    #[serde(flatten, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(MessageContent::Text(content.into())),
            tool_calls: None,
            tool_call_id: None,
            usage: None,
            advisory: None,
            extra: Map::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn advisory(kind: AdvisoryKind, content: impl Into<String>) -> Self {
        let mut message = Self::new(Role::CdInstruction, content);
        message.advisory = Some(kind);
        message
    }

    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls
            .as_ref()
            .map(|calls| !calls.is_empty())
            .unwrap_or(false)
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tool_calls
            .iter()
            .flatten()
            .map(|call| call.function.name.as_str())
            .collect()
    }

    /// Plain text content; list content is joined from its text parts.
    pub fn text(&self) -> Option<String> {
        match self.content.as_ref()? {
            MessageContent::Text(text) => Some(text.clone()),
            MessageContent::Parts(parts) => {
                let texts: Vec<&str> = parts
                    .iter()
                    .filter(|part| part.m_type == "text")
                    .map(|part| part.m_content.as_str())
                    .collect();
                if texts.is_empty() {
                    None
                } else {
                    Some(texts.join("\n"))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_backend_assistant_message_with_tool_calls() {
        let raw = json!({
            "role": "assistant",
            "content": "",
            "tool_calls": [
                {"id": "call_1", "type": "function", "function": {"name": "shell", "arguments": "{\"command\":\"ls\"}"}},
                {"id": "call_2", "function": {"name": "cat", "arguments": "{}"}}
            ],
            "usage": {"prompt_tokens": 120, "completion_tokens": 30},
            "finish_reason": "tool_calls"
        });
        let message: Message = serde_json::from_value(raw).expect("parse");
        assert_eq!(message.role, Role::Assistant);
        assert_eq!(message.tool_names(), vec!["shell", "cat"]);
        assert_eq!(message.tool_calls.as_ref().expect("calls")[1].kind, "function");
        assert_eq!(message.usage.as_ref().expect("usage").prompt_tokens, 120);
        assert_eq!(message.extra["finish_reason"], "tool_calls");
    }

    #[test]
    fn multimodal_tool_content_keeps_parts() {
        let raw = json!({
            "role": "tool",
            "tool_call_id": "call_9",
            "content": [
                {"m_type": "text", "m_content": "screenshot"},
                {"m_type": "image/png", "m_content": "aGVsbG8="}
            ]
        });
        let message: Message = serde_json::from_value(raw.clone()).expect("parse");
        assert_eq!(message.text().as_deref(), Some("screenshot"));
        assert_eq!(serde_json::to_value(&message).expect("serialize"), raw);
    }

    #[test]
    fn advisory_serializes_role_and_marker() {
        let message = Message::advisory(AdvisoryKind::Difficulties, "try again");
        let value = serde_json::to_value(&message).expect("serialize");
        assert_eq!(value["role"], "cd_instruction");
        assert_eq!(value["advisory"], "difficulties");
        assert!(!message.has_tool_calls());
    }
}
