use crate::io_struct::ChatRequest;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Conversation-history writer for one request.
///
/// The dispatcher calls each method at most once, in declaration order.
#[async_trait]
pub trait SessionRecorder: Send + Sync {
    async fn add_ai_message(&mut self, text: &str);
    async fn add_view_message(&mut self, text: &str);
    async fn end_current_round(&mut self);
}

/// Hands out recorders for individual requests.
pub trait HistoryStore: Send + Sync {
    fn begin_round(&self, request: &ChatRequest) -> Box<dyn SessionRecorder>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    Human,
    Ai,
    View,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StoredMessage {
    pub role: MessageRole,
    pub content: String,
    pub round: usize,
}

/// Process-local history keyed by conversation id.
#[derive(Debug, Clone, Default)]
pub struct InMemoryHistory {
    conversations: Arc<DashMap<String, Vec<StoredMessage>>>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self, conv_uid: &str) -> Vec<StoredMessage> {
        self.conversations
            .get(conv_uid)
            .map(|messages| messages.clone())
            .unwrap_or_default()
    }

    pub fn rounds(&self, conv_uid: &str) -> usize {
        self.conversations
            .get(conv_uid)
            .and_then(|messages| messages.last().map(|m| m.round + 1))
            .unwrap_or(0)
    }
}

impl HistoryStore for InMemoryHistory {
    fn begin_round(&self, request: &ChatRequest) -> Box<dyn SessionRecorder> {
        let mut pending = Vec::new();
        if !request.user_input.is_empty() {
            pending.push((MessageRole::Human, request.user_input.clone()));
        }
        Box::new(InMemoryRound {
            conversations: Arc::clone(&self.conversations),
            conv_uid: request.conv_uid().to_string(),
            pending,
        })
    }
}

/// Buffers a round's messages until the round ends; an abandoned round leaves no trace.
struct InMemoryRound {
    conversations: Arc<DashMap<String, Vec<StoredMessage>>>,
    conv_uid: String,
    pending: Vec<(MessageRole, String)>,
}

#[async_trait]
impl SessionRecorder for InMemoryRound {
    async fn add_ai_message(&mut self, text: &str) {
        self.pending.push((MessageRole::Ai, text.to_string()));
    }

    async fn add_view_message(&mut self, text: &str) {
        self.pending.push((MessageRole::View, text.to_string()));
    }

    async fn end_current_round(&mut self) {
        let mut messages = self.conversations.entry(self.conv_uid.clone()).or_default();
        let round = messages.last().map(|m| m.round + 1).unwrap_or(0);
        messages.extend(
            self.pending
                .drain(..)
                .map(|(role, content)| StoredMessage {
                    role,
                    content,
                    round,
                }),
        );
        log::debug!("Conversation {} finished round {}", self.conv_uid, round);
    }
}
