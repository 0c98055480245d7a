use crate::error::DispatchError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChatMode {
    Normal,
    DbExecute,
    DbQa,
    Excel,
    Knowledge,
    Dashboard,
    Agent,
    Flow,
}

impl ChatMode {
    pub const ALL: [ChatMode; 8] = [
        ChatMode::Normal,
        ChatMode::DbExecute,
        ChatMode::DbQa,
        ChatMode::Excel,
        ChatMode::Knowledge,
        ChatMode::Dashboard,
        ChatMode::Agent,
        ChatMode::Flow,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChatMode::Normal => "chat_normal",
            ChatMode::DbExecute => "chat_with_db_execute",
            ChatMode::DbQa => "chat_with_db_qa",
            ChatMode::Excel => "chat_excel",
            ChatMode::Knowledge => "chat_knowledge",
            ChatMode::Dashboard => "chat_dashboard",
            ChatMode::Agent => "chat_agent",
            ChatMode::Flow => "chat_flow",
        }
    }

    /// Modes whose `select_param` names a resource the session cannot run without.
    pub fn requires_select_param(&self) -> bool {
        matches!(
            self,
            ChatMode::DbExecute | ChatMode::DbQa | ChatMode::Dashboard | ChatMode::Excel
        )
    }
}

impl fmt::Display for ChatMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChatMode {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(ChatMode::Normal);
        }
        ChatMode::ALL
            .into_iter()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| DispatchError::UnsupportedMode(s.to_string()))
    }
}

/// The dialogue object posted by clients. Field names follow the public API.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ChatRequest {
    #[serde(default, rename = "conv_uid")]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub chat_mode: Option<String>,
    #[serde(default, rename = "select_param")]
    pub selected_param: Option<String>,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub user_input: String,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub sys_code: Option<String>,
    #[serde(default)]
    pub incremental: bool,
}

impl ChatRequest {
    pub fn mode(&self) -> Result<ChatMode, DispatchError> {
        self.chat_mode.as_deref().unwrap_or_default().parse()
    }

    pub fn select_param(&self) -> &str {
        self.selected_param.as_deref().unwrap_or_default()
    }

    pub fn model(&self) -> &str {
        self.model_name.as_deref().unwrap_or_default()
    }

    pub fn conv_uid(&self) -> &str {
        self.conversation_id.as_deref().unwrap_or_default()
    }
}

/// One fragment produced by a backend. `error_code != 0` marks a server-side failure.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct RawChunk {
    pub text: String,
    #[serde(default)]
    pub error_code: i32,
}

impl RawChunk {
    pub fn text(text: impl Into<String>) -> Self {
        RawChunk {
            text: text.into(),
            error_code: 0,
        }
    }

    pub fn error(text: impl Into<String>, error_code: i32) -> Self {
        RawChunk {
            text: text.into(),
            error_code,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error_code != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Partial,
    Final,
    Error,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolFrame {
    pub kind: FrameKind,
    pub payload: String,
    /// `data: ` rather than `data:`
    pub spaced: bool,
}

impl ProtocolFrame {
    pub fn delta(json: String) -> Self {
        ProtocolFrame {
            kind: FrameKind::Partial,
            payload: json,
            spaced: true,
        }
    }

    pub fn snapshot(text: String) -> Self {
        ProtocolFrame {
            kind: FrameKind::Partial,
            payload: text,
            spaced: false,
        }
    }

    pub fn final_text(text: String) -> Self {
        ProtocolFrame {
            kind: FrameKind::Final,
            payload: text,
            spaced: true,
        }
    }

    pub fn error(text: String) -> Self {
        ProtocolFrame {
            kind: FrameKind::Error,
            payload: text,
            spaced: false,
        }
    }

    pub fn done() -> Self {
        ProtocolFrame {
            kind: FrameKind::Done,
            payload: "[DONE]".to_string(),
            spaced: true,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.kind == FrameKind::Done
    }

    pub fn encode(&self) -> Bytes {
        let prefix = if self.spaced { "data: " } else { "data:" };
        Bytes::from(format!("{}{}\n\n", prefix, self.payload))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeltaMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Working notes shown before the answer; never part of `content`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatStreamChoice {
    pub index: u32,
    pub delta: DeltaMessage,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatCompletionStreamResponse {
    pub id: String,
    pub model: String,
    pub choices: Vec<ChatStreamChoice>,
}

impl ChatCompletionStreamResponse {
    fn single(id: &str, model: &str, delta: DeltaMessage) -> Self {
        ChatCompletionStreamResponse {
            id: id.to_string(),
            model: model.to_string(),
            choices: vec![ChatStreamChoice { index: 0, delta }],
        }
    }

    pub fn assistant_delta(id: &str, model: &str, content: String) -> Self {
        Self::single(
            id,
            model,
            DeltaMessage {
                role: Some("assistant".to_string()),
                content: Some(content),
                reasoning_content: None,
            },
        )
    }

    pub fn reasoning_delta(id: &str, model: &str, reasoning: String) -> Self {
        Self::single(
            id,
            model,
            DeltaMessage {
                role: Some("assistant".to_string()),
                content: None,
                reasoning_content: Some(reasoning),
            },
        )
    }
}

/// Primary answer plus the critic's suggestion, concatenated for history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComposedAnswer {
    pub primary_text: String,
    pub critic_suggestion: String,
}

impl ComposedAnswer {
    pub fn text(&self) -> String {
        format!("{}{}", self.primary_text, self.critic_suggestion)
    }
}

/// Request object handed to flow-execution services and graph output nodes.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FlowRequest {
    pub model: String,
    pub messages: String,
    pub stream: bool,
    pub conv_uid: String,
    pub span_id: String,
    pub chat_mode: String,
    pub chat_param: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sys_code: Option<String>,
    pub incremental: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

impl FlowRequest {
    pub fn from_chat(request: &ChatRequest, mode: ChatMode) -> Self {
        FlowRequest {
            model: request.model().to_string(),
            messages: request.user_input.clone(),
            stream: true,
            conv_uid: request.conv_uid().to_string(),
            span_id: uuid::Uuid::new_v4().simple().to_string(),
            chat_mode: mode.as_str().to_string(),
            chat_param: request.select_param().to_string(),
            user_name: request.user_name.clone(),
            sys_code: request.sys_code.clone(),
            incremental: request.incremental,
            extra: None,
        }
    }
}
