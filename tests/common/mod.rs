#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chat_dispatch::backend::{
    AgentRequest, AgentService, ChatFactory, ChatParam, ChatSession, ChunkStream, CriticContext,
    FinalizedAnswer, FlowService, GraphNode, StaticRegistry,
};
use chat_dispatch::config::{AppConfig, CriticConfig};
use chat_dispatch::critic::{CriticChainer, CriticModel};
use chat_dispatch::dispatcher::{DispatchContext, Dispatcher};
use chat_dispatch::error::{DispatchError, DispatchResult};
use chat_dispatch::io_struct::{ChatMode, ChatRequest, FlowRequest, RawChunk};
use chat_dispatch::recorder::{HistoryStore, SessionRecorder};
use chat_dispatch::upstream::TextStream;
use futures::{Stream, StreamExt, stream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Critic reply whose `suggestions_of_query` is "name the year".
pub const CRITIC_REPLY: [&str; 4] = [
    "{\n    \"thoughts_of_query\": \"vague\",\n    \n",
    "    \"thoughts_of_sql\": \"ok\",\n\n",
    "    \"suggestions_of_query\": \"name the",
    " year\",\n    \"suggestions_of_sql\": \"none\"\n}",
];

/// Chat session replaying fixed snapshots.
#[derive(Clone, Default)]
pub struct ScriptedSession {
    pub conv_uid: String,
    pub stream_out: bool,
    pub chunks: Vec<RawChunk>,
    /// Raised by the stream after all chunks.
    pub fail_with: Option<String>,
    /// Shown instead of the raw model output once finalized.
    pub view_text: Option<String>,
    pub critic_context: Option<CriticContext>,
    pub invocations: Arc<AtomicUsize>,
}

impl ScriptedSession {
    pub fn streaming(chunks: &[&str]) -> Self {
        ScriptedSession {
            stream_out: true,
            chunks: chunks.iter().map(|c| RawChunk::text(*c)).collect(),
            ..Default::default()
        }
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatSession for ScriptedSession {
    fn conv_uid(&self) -> &str {
        &self.conv_uid
    }

    fn stream_out(&self) -> bool {
        self.stream_out
    }

    async fn stream_call(&self) -> DispatchResult<ChunkStream> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let mut items: Vec<DispatchResult<RawChunk>> =
            self.chunks.iter().cloned().map(Ok).collect();
        if let Some(message) = &self.fail_with {
            items.push(Err(DispatchError::BackendFailure(message.clone())));
        }
        Ok(stream::iter(items).boxed())
    }

    async fn nostream_call(&self) -> DispatchResult<String> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .chunks
            .last()
            .map(|c| c.text.clone())
            .unwrap_or_default())
    }

    async fn finalize(&self, model_output: &str) -> DispatchResult<FinalizedAnswer> {
        Ok(FinalizedAnswer {
            ai_text: model_output.to_string(),
            view_text: self
                .view_text
                .clone()
                .unwrap_or_else(|| model_output.to_string()),
        })
    }

    fn critic_context(&self) -> Option<CriticContext> {
        self.critic_context.clone()
    }

    fn reinforce_view(&self, text: &str) -> String {
        format!("[reinforced]{}", text)
    }
}

pub struct ScriptedChatFactory {
    pub session: ScriptedSession,
    pub created: AtomicUsize,
}

impl ChatFactory for ScriptedChatFactory {
    fn create(&self, mode: ChatMode, param: ChatParam) -> DispatchResult<Arc<dyn ChatSession>> {
        if mode.requires_select_param() && param.select_param.is_empty() {
            return Err(DispatchError::InvalidRequest("db name is empty".to_string()));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        let mut session = self.session.clone();
        session.conv_uid = param.chat_session_id;
        Ok(Arc::new(session))
    }
}

pub struct ScriptedCritic {
    pub deltas: Vec<String>,
    pub calls: AtomicUsize,
}

#[async_trait]
impl CriticModel for ScriptedCritic {
    async fn stream(&self, _system: &str, _input: &str) -> DispatchResult<TextStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let deltas: Vec<DispatchResult<String>> = self.deltas.iter().cloned().map(Ok).collect();
        Ok(stream::iter(deltas).boxed())
    }
}

pub struct ScriptedAgent {
    pub chunks: Vec<RawChunk>,
    pub requests: Mutex<Vec<AgentRequest>>,
}

#[async_trait]
impl AgentService for ScriptedAgent {
    async fn app_agent_chat(&self, request: &AgentRequest) -> DispatchResult<ChunkStream> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(replay(&self.chunks))
    }
}

fn replay(chunks: &[RawChunk]) -> ChunkStream {
    let items: Vec<DispatchResult<RawChunk>> = chunks.iter().cloned().map(Ok).collect();
    stream::iter(items).boxed()
}

/// Flow service remembering `(flow_id, request)` of every call.
pub struct ScriptedFlow {
    pub chunks: Vec<RawChunk>,
    pub requests: Mutex<Vec<(String, FlowRequest)>>,
}

#[async_trait]
impl FlowService for ScriptedFlow {
    async fn chat_stream_flow(
        &self,
        flow_id: &str,
        request: &FlowRequest,
    ) -> DispatchResult<ChunkStream> {
        self.requests
            .lock()
            .unwrap()
            .push((flow_id.to_string(), request.clone()));
        Ok(replay(&self.chunks))
    }
}

pub struct ScriptedGraphNode {
    pub name: String,
    pub chunks: Vec<RawChunk>,
    pub requests: Mutex<Vec<FlowRequest>>,
}

impl ScriptedGraphNode {
    pub fn new(name: &str, chunks: &[&str]) -> Arc<Self> {
        Arc::new(ScriptedGraphNode {
            name: name.to_string(),
            chunks: chunks.iter().map(|c| RawChunk::text(*c)).collect(),
            requests: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl GraphNode for ScriptedGraphNode {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stream(&self, request: &FlowRequest) -> DispatchResult<ChunkStream> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(replay(&self.chunks))
    }
}

/// History that logs every recorder call as `ai:..`, `view:..` or `end`.
#[derive(Clone, Default)]
pub struct RecordingHistory {
    pub calls: Arc<Mutex<Vec<String>>>,
}

impl RecordingHistory {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

struct RecordingRound {
    calls: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl SessionRecorder for RecordingRound {
    async fn add_ai_message(&mut self, text: &str) {
        self.calls.lock().unwrap().push(format!("ai:{}", text));
    }

    async fn add_view_message(&mut self, text: &str) {
        self.calls.lock().unwrap().push(format!("view:{}", text));
    }

    async fn end_current_round(&mut self) {
        self.calls.lock().unwrap().push("end".to_string());
    }
}

impl HistoryStore for RecordingHistory {
    fn begin_round(&self, _request: &ChatRequest) -> Box<dyn SessionRecorder> {
        Box::new(RecordingRound {
            calls: Arc::clone(&self.calls),
        })
    }
}

pub struct TestContext {
    pub dispatcher: Dispatcher,
    pub history: RecordingHistory,
    pub chats: Arc<ScriptedChatFactory>,
    pub critic: Arc<ScriptedCritic>,
    pub agent: Arc<ScriptedAgent>,
    pub flow: Arc<ScriptedFlow>,
}

impl TestContext {
    pub fn new(session: ScriptedSession, registry: StaticRegistry) -> Self {
        Self::build(session, registry, vec![], vec![])
    }

    pub fn with_agent(
        session: ScriptedSession,
        registry: StaticRegistry,
        agent_chunks: Vec<RawChunk>,
    ) -> Self {
        Self::build(session, registry, agent_chunks, vec![])
    }

    pub fn with_flow(registry: StaticRegistry, flow_chunks: Vec<RawChunk>) -> Self {
        Self::build(ScriptedSession::default(), registry, vec![], flow_chunks)
    }

    fn build(
        session: ScriptedSession,
        registry: StaticRegistry,
        agent_chunks: Vec<RawChunk>,
        flow_chunks: Vec<RawChunk>,
    ) -> Self {
        let mut config = AppConfig::default();
        config.pipeline.pacing_ms = 0;
        let config = Arc::new(config);

        let history = RecordingHistory::default();
        let chats = Arc::new(ScriptedChatFactory {
            session,
            created: AtomicUsize::new(0),
        });
        let critic = Arc::new(ScriptedCritic {
            deltas: CRITIC_REPLY.iter().map(|d| d.to_string()).collect(),
            calls: AtomicUsize::new(0),
        });
        let agent = Arc::new(ScriptedAgent {
            chunks: agent_chunks,
            requests: Mutex::new(Vec::new()),
        });
        let flow = Arc::new(ScriptedFlow {
            chunks: flow_chunks,
            requests: Mutex::new(Vec::new()),
        });
        let registry = Arc::new(registry);

        let dispatcher = Dispatcher::new(DispatchContext {
            config,
            agents: Some(agent.clone()),
            flows: Some(flow.clone()),
            spaces: registry.clone(),
            graphs: registry.clone(),
            connectors: registry,
            chats: Some(chats.clone()),
            critic: Some(Arc::new(CriticChainer::new(
                critic.clone(),
                &CriticConfig::default(),
            ))),
            history: Arc::new(history.clone()),
        });
        TestContext {
            dispatcher,
            history,
            chats,
            critic,
            agent,
            flow,
        }
    }

    pub fn chats_created(&self) -> usize {
        self.chats.created.load(Ordering::SeqCst)
    }

    pub fn critic_calls(&self) -> usize {
        self.critic.calls.load(Ordering::SeqCst)
    }
}

pub fn chat_request(mode: &str, select_param: &str, incremental: bool) -> ChatRequest {
    ChatRequest {
        conversation_id: Some("conv-1".to_string()),
        chat_mode: Some(mode.to_string()),
        selected_param: Some(select_param.to_string()),
        model_name: Some("test-model".to_string()),
        user_input: "how many orders last year?".to_string(),
        incremental,
        ..Default::default()
    }
}

pub async fn collect_frames<S>(frames: S) -> Vec<String>
where
    S: Stream<Item = Bytes>,
{
    frames
        .map(|bytes| String::from_utf8(bytes.to_vec()).unwrap())
        .collect()
        .await
}

/// Concatenated `content` of incremental delta frames.
pub fn delta_text(frames: &[String]) -> String {
    delta_field(frames, "content")
}

/// Concatenated `reasoning_content` of incremental delta frames.
pub fn reasoning_text(frames: &[String]) -> String {
    delta_field(frames, "reasoning_content")
}

fn delta_field(frames: &[String], field: &str) -> String {
    frames
        .iter()
        .filter_map(|f| f.strip_prefix("data: "))
        .filter_map(|f| f.strip_suffix("\n\n"))
        .filter(|f| *f != "[DONE]")
        .filter_map(|json| {
            let value: serde_json::Value = serde_json::from_str(json).unwrap();
            value["choices"][0]["delta"][field]
                .as_str()
                .map(str::to_string)
        })
        .collect()
}
