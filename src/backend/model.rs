use super::{ChunkStream, run_blocking};
use crate::config::ModelConfig;
use crate::error::{DispatchError, DispatchResult};
use crate::io_struct::{ChatMode, RawChunk};
use crate::upstream::{ChatCompletionRequest, ChatMessage, OpenAiClient};
use async_trait::async_trait;
use futures::{StreamExt, future};
use std::sync::Arc;

/// Parameters a chat session is created with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatParam {
    pub chat_session_id: String,
    pub user_name: Option<String>,
    pub sys_code: Option<String>,
    pub current_user_input: String,
    pub select_param: String,
    pub model_name: String,
}

/// Inputs of the critic prompt besides the primary answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CriticContext {
    pub db_name: String,
    pub table_info: String,
    pub user_input: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedAnswer {
    /// What the model said, after output parsing.
    pub ai_text: String,
    /// What the user is shown: the answer with query results and charts rendered in.
    pub view_text: String,
}

/// A conversation with a model in one chat mode.
#[async_trait]
pub trait ChatSession: Send + Sync {
    fn conv_uid(&self) -> &str;

    /// Whether the active prompt template streams its output.
    fn stream_out(&self) -> bool;

    /// Model output as snapshots of the full text so far.
    async fn stream_call(&self) -> DispatchResult<ChunkStream>;

    async fn nostream_call(&self) -> DispatchResult<String>;

    /// Turns the complete model output into the answer shown to the user.
    async fn finalize(&self, model_output: &str) -> DispatchResult<FinalizedAnswer>;

    /// `None` for sessions without a database behind them.
    fn critic_context(&self) -> Option<CriticContext>;

    /// Post-processing of the composed answer before it is stored as the view message.
    fn reinforce_view(&self, text: &str) -> String {
        text.to_string()
    }
}

pub trait ChatFactory: Send + Sync {
    /// May block (resource lookups, connector setup); callers run it off the event loop.
    fn create(&self, mode: ChatMode, param: ChatParam) -> DispatchResult<Arc<dyn ChatSession>>;
}

pub struct DirectModelBackend {
    mode: ChatMode,
    session: Arc<dyn ChatSession>,
}

impl DirectModelBackend {
    pub fn new(mode: ChatMode, session: Arc<dyn ChatSession>) -> Self {
        DirectModelBackend { mode, session }
    }

    pub fn session(&self) -> &Arc<dyn ChatSession> {
        &self.session
    }

    /// Only database execution answers get a critic pass, and only when streamed.
    pub fn wants_critic(&self) -> bool {
        self.mode == ChatMode::DbExecute && self.session.stream_out()
    }

    pub async fn invoke(&self) -> DispatchResult<ChunkStream> {
        self.session.stream_call().await
    }
}

/// Builds sessions talking to an OpenAI-compatible endpoint.
pub struct ModelChatFactory {
    client: OpenAiClient,
    config: ModelConfig,
}

impl ModelChatFactory {
    pub fn new(client: reqwest::Client, config: ModelConfig) -> Self {
        let client = OpenAiClient::new(client, &config.api_base, config.api_key.clone());
        ModelChatFactory { client, config }
    }
}

impl ChatFactory for ModelChatFactory {
    fn create(&self, mode: ChatMode, param: ChatParam) -> DispatchResult<Arc<dyn ChatSession>> {
        if mode.requires_select_param() && param.select_param.is_empty() {
            return Err(DispatchError::InvalidRequest(format!(
                "{} mode should chose db!",
                mode
            )));
        }
        let model = if param.model_name.is_empty() {
            self.config.default_model.clone()
        } else {
            param.model_name.clone()
        };
        Ok(Arc::new(ModelChatSession {
            client: self.client.clone(),
            mode,
            model,
            table_info: self
                .config
                .table_info
                .get(&param.select_param)
                .cloned()
                .unwrap_or_default(),
            param,
            stream_out: self.config.stream_out,
        }))
    }
}

pub struct ModelChatSession {
    client: OpenAiClient,
    mode: ChatMode,
    model: String,
    param: ChatParam,
    stream_out: bool,
    table_info: String,
}

impl ModelChatSession {
    fn completion_request(&self) -> ChatCompletionRequest {
        let mut messages = Vec::new();
        if !self.param.select_param.is_empty() {
            messages.push(ChatMessage::system(&format!(
                "Mode: {}. Selected resource: {}.",
                self.mode, self.param.select_param
            )));
        }
        messages.push(ChatMessage::user(&self.param.current_user_input));
        ChatCompletionRequest {
            model: self.model.clone(),
            messages,
            stream: true,
            top_p: None,
            temperature: None,
        }
    }
}

#[async_trait]
impl ChatSession for ModelChatSession {
    fn conv_uid(&self) -> &str {
        &self.param.chat_session_id
    }

    fn stream_out(&self) -> bool {
        self.stream_out
    }

    async fn stream_call(&self) -> DispatchResult<ChunkStream> {
        let deltas = self.client.stream_chat(&self.completion_request()).await?;
        Ok(deltas
            .scan(String::new(), |text, delta| {
                let item = delta.map(|delta| {
                    text.push_str(&delta);
                    RawChunk::text(text.clone())
                });
                future::ready(Some(item))
            })
            .boxed())
    }

    async fn nostream_call(&self) -> DispatchResult<String> {
        let mut deltas = self.client.stream_chat(&self.completion_request()).await?;
        let mut text = String::new();
        while let Some(delta) = deltas.next().await {
            text.push_str(&delta?);
        }
        Ok(text)
    }

    /// Chart and table rendering of the answer belongs to the view layer; sessions built here
    /// only trim the raw output.
    async fn finalize(&self, model_output: &str) -> DispatchResult<FinalizedAnswer> {
        let output = model_output.to_string();
        run_blocking(move || {
            let view_text = output.trim().to_string();
            Ok(FinalizedAnswer {
                ai_text: output,
                view_text,
            })
        })
        .await
    }

    fn critic_context(&self) -> Option<CriticContext> {
        if self.param.select_param.is_empty() {
            return None;
        }
        Some(CriticContext {
            db_name: self.param.select_param.clone(),
            table_info: self.table_info.clone(),
            user_input: self.param.current_user_input.clone(),
        })
    }
}
