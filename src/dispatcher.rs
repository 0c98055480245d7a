//! Per-request state machine: route, stream the primary answer, optionally stream the critic,
//! record the round.
//!
//! Routing happens before the response starts so routing errors can be answered with a plain
//! failure body. Everything after that runs in one spawned task per request that writes frames
//! into a bounded channel; the HTTP layer streams the receiving side.

use crate::backend::{
    AgentBackend, AgentRequest, AgentService, Backend, BackendKind, ChatFactory, ChatParam,
    ConnectorRegistry, DirectModelBackend, DomainGraphBackend, FlowBackend, FlowService,
    GraphRegistry, HttpAgentService, HttpFlowService, KnowledgeSpaces, ModelChatFactory,
    StaticRegistry, run_blocking,
};
use crate::config::AppConfig;
use crate::critic::CriticChainer;
use crate::error::{DispatchError, DispatchResult};
use crate::extractor::FragmentExtractor;
use crate::io_struct::{ChatMode, ChatRequest, FlowRequest};
use crate::recorder::{HistoryStore, InMemoryHistory};
use crate::renderer::{FrameSink, RenderOutcome, RenderSettings, StreamRenderer};
use crate::routing;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

pub type FrameStream = ReceiverStream<Bytes>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Routing,
    StreamingPrimary,
    StreamingCritic,
    Done,
    Failed,
}

impl fmt::Display for DispatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DispatchState::Routing => "routing",
            DispatchState::StreamingPrimary => "streaming_primary",
            DispatchState::StreamingCritic => "streaming_critic",
            DispatchState::Done => "done",
            DispatchState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Collaborators and configuration shared by all requests. Read-only once built.
pub struct DispatchContext {
    pub config: Arc<AppConfig>,
    pub agents: Option<Arc<dyn AgentService>>,
    pub flows: Option<Arc<dyn FlowService>>,
    pub spaces: Arc<dyn KnowledgeSpaces>,
    pub graphs: Arc<dyn GraphRegistry>,
    pub connectors: Arc<dyn ConnectorRegistry>,
    pub chats: Option<Arc<dyn ChatFactory>>,
    pub critic: Option<Arc<CriticChainer>>,
    pub history: Arc<dyn HistoryStore>,
}

/// A routed request.
pub struct Plan {
    request: ChatRequest,
    backend: Backend,
}

impl Plan {
    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// The request as routed, with a generated conversation id where one was needed.
    pub fn request(&self) -> &ChatRequest {
        &self.request
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOutcome {
    pub state: DispatchState,
    pub frames_sent: usize,
    pub cancelled: bool,
}

/// Texts written to history for a finished direct-model round.
struct RoundRecord {
    ai_text: String,
    view_text: String,
}

#[derive(Clone)]
pub struct Dispatcher {
    ctx: Arc<DispatchContext>,
}

impl Dispatcher {
    pub fn new(ctx: DispatchContext) -> Self {
        Dispatcher { ctx: Arc::new(ctx) }
    }

    /// Wires the HTTP-backed collaborators declared in `config`.
    pub fn from_config(config: AppConfig, client: reqwest::Client) -> Self {
        let registry = Arc::new(StaticRegistry::from_config(&config.routing, &client));
        let agents = config.upstreams.agent.clone().map(|upstream| {
            Arc::new(HttpAgentService::new(client.clone(), upstream)) as Arc<dyn AgentService>
        });
        let flows = config.upstreams.flow.clone().map(|upstream| {
            Arc::new(HttpFlowService::new(client.clone(), upstream)) as Arc<dyn FlowService>
        });
        let chats = config.upstreams.model.clone().map(|model| {
            Arc::new(ModelChatFactory::new(client.clone(), model)) as Arc<dyn ChatFactory>
        });
        let critic = config
            .critic
            .enabled
            .then(|| Arc::new(CriticChainer::from_config(client.clone(), &config.critic)));

        Dispatcher::new(DispatchContext {
            config: Arc::new(config),
            agents,
            flows,
            spaces: registry.clone(),
            graphs: registry.clone(),
            connectors: registry,
            chats,
            critic,
            history: Arc::new(InMemoryHistory::new()),
        })
    }

    /// Routes the request and starts streaming it.
    pub async fn dispatch(&self, request: ChatRequest) -> DispatchResult<FrameStream> {
        let plan = self.prepare(request).await?;
        let pipeline = &self.ctx.config.pipeline;
        let (tx, rx) = mpsc::channel(pipeline.frame_buffer);
        let sink = FrameSink::new(tx, pipeline.pacing());

        let dispatcher = self.clone();
        tokio::spawn(async move {
            let conv_uid = plan.request.conv_uid().to_string();
            let kind = plan.kind();
            let outcome = dispatcher.run(plan, sink).await;
            log::info!(
                "Chat {} via {} ended {} after {} frames",
                conv_uid,
                kind,
                outcome.state,
                outcome.frames_sent
            );
        });
        Ok(ReceiverStream::new(rx))
    }

    /// Routing step. Every error returned here is raised before a frame exists.
    pub async fn prepare(&self, mut request: ChatRequest) -> DispatchResult<Plan> {
        let mode = request.mode()?;
        if mode.requires_select_param() && request.select_param().is_empty() {
            return Err(DispatchError::InvalidRequest(format!(
                "{} mode should chose db!",
                mode
            )));
        }
        let domain = routing::resolve_domain(mode, request.select_param(), &*self.ctx.spaces)?;
        let kind = routing::route(mode, domain.as_deref());
        log::debug!(
            "{} {} -> {} (domain {:?})",
            DispatchState::Routing,
            mode,
            kind,
            domain
        );

        let backend = match kind {
            BackendKind::Agent => {
                let service = self.ctx.agents.clone().ok_or_else(|| unconfigured(mode))?;
                Backend::Agent(AgentBackend::new(service, AgentRequest::from_chat(&request)))
            }
            BackendKind::Flow => {
                let service = self.ctx.flows.clone().ok_or_else(|| unconfigured(mode))?;
                let flow_id = request.select_param().to_string();
                if flow_id.is_empty() {
                    return Err(DispatchError::InvalidRequest(
                        "flow chat needs a flow id in select_param".to_string(),
                    ));
                }
                let flow_request = FlowRequest::from_chat(&request, mode);
                Backend::Flow(FlowBackend::new(service, flow_id, flow_request))
            }
            BackendKind::DomainGraph => {
                let tag = domain.as_deref().unwrap_or(routing::NORMAL_DOMAIN);
                Backend::DomainGraph(DomainGraphBackend::resolve(
                    &request,
                    mode,
                    tag,
                    &*self.ctx.graphs,
                    &*self.ctx.connectors,
                )?)
            }
            BackendKind::DirectModel => {
                let factory = self.ctx.chats.clone().ok_or_else(|| unconfigured(mode))?;
                if request.conv_uid().is_empty() {
                    request.conversation_id = Some(uuid::Uuid::now_v7().to_string());
                }
                let param = ChatParam {
                    chat_session_id: request.conv_uid().to_string(),
                    user_name: request.user_name.clone(),
                    sys_code: request.sys_code.clone(),
                    current_user_input: request.user_input.clone(),
                    select_param: request.select_param().to_string(),
                    model_name: request.model().to_string(),
                };
                let session = run_blocking(move || factory.create(mode, param)).await?;
                Backend::DirectModel(DirectModelBackend::new(mode, session))
            }
        };
        Ok(Plan { request, backend })
    }

    /// Streams a routed request into `sink` until a terminal frame or a closed transport.
    pub async fn run(&self, plan: Plan, sink: FrameSink) -> PipelineOutcome {
        let settings = RenderSettings {
            incremental: plan.request.incremental,
            conv_uid: plan.request.conv_uid().to_string(),
            model_name: plan.request.model().to_string(),
            empty_output_message: self.ctx.config.pipeline.empty_output_message.clone(),
        };
        let mut renderer = StreamRenderer::new(sink, settings);

        let result = match &plan.backend {
            Backend::DirectModel(backend) => {
                self.run_direct(&plan.request, backend, &mut renderer).await
            }
            backend => self.run_remote(backend, &mut renderer).await,
        };

        let (state, cancelled) = match result {
            Ok(state) => (state, false),
            Err(DispatchError::TransportClosed) => {
                log::info!("Client of {} disconnected", plan.request.conv_uid());
                (DispatchState::Failed, true)
            }
            Err(e) => {
                log::error!("Chat {} failed: {}", plan.request.conv_uid(), e);
                let closed = renderer.server_error(&e.to_string()).await.is_err();
                (DispatchState::Failed, closed)
            }
        };
        PipelineOutcome {
            state,
            frames_sent: renderer.sink().frames_sent(),
            cancelled,
        }
    }

    /// Agent, flow and domain-graph backends keep their own history.
    async fn run_remote(
        &self,
        backend: &Backend,
        renderer: &mut StreamRenderer,
    ) -> DispatchResult<DispatchState> {
        let chunks = backend.invoke().await?;
        match renderer.render(chunks).await? {
            RenderOutcome::Completed(_) => {
                renderer.finish().await?;
                Ok(DispatchState::Done)
            }
            RenderOutcome::ServerError(_) => Ok(DispatchState::Failed),
        }
    }

    async fn run_direct(
        &self,
        request: &ChatRequest,
        backend: &DirectModelBackend,
        renderer: &mut StreamRenderer,
    ) -> DispatchResult<DispatchState> {
        let mut model_text = String::new();
        let result = if backend.wants_critic() {
            self.stream_with_critic(backend, renderer, &mut model_text)
                .await
        } else if backend.session().stream_out() {
            self.stream_plain(backend, renderer).await
        } else {
            self.call_once(backend, renderer).await
        };

        match result {
            Ok(record) => {
                renderer.finish().await?;
                renderer.sink().flush().await?;
                self.record(request, &record).await;
                Ok(DispatchState::Done)
            }
            Err(DispatchError::TransportClosed) => Err(DispatchError::TransportClosed),
            Err(e) => {
                let partial = if model_text.is_empty() {
                    renderer.last_text().to_string()
                } else {
                    model_text
                };
                log::error!("Chat {} failed: {}", request.conv_uid(), e);
                let message = format!("<span style=\"color:red\">ERROR!</span>{}\n  {}", e, partial);
                renderer.fail(&message).await?;
                renderer.sink().flush().await?;
                let record = RoundRecord {
                    ai_text: message.clone(),
                    view_text: message,
                };
                self.record(request, &record).await;
                Ok(DispatchState::Failed)
            }
        }
    }

    async fn stream_plain(
        &self,
        backend: &DirectModelBackend,
        renderer: &mut StreamRenderer,
    ) -> DispatchResult<RoundRecord> {
        let chunks = backend.invoke().await?;
        let text = match renderer.render(chunks).await? {
            RenderOutcome::Completed(text) => text,
            RenderOutcome::ServerError(text) => return Err(DispatchError::BackendFailure(text)),
        };
        let answer = backend.session().finalize(&text).await?;
        Ok(RoundRecord {
            ai_text: answer.ai_text,
            view_text: answer.view_text,
        })
    }

    async fn call_once(
        &self,
        backend: &DirectModelBackend,
        renderer: &mut StreamRenderer,
    ) -> DispatchResult<RoundRecord> {
        let session = backend.session();
        let text = session.nostream_call().await?;
        let answer = session.finalize(&text).await?;
        renderer.final_text(&answer.view_text).await?;
        Ok(RoundRecord {
            ai_text: answer.ai_text,
            view_text: answer.view_text,
        })
    }

    /// Database execution: the client sees the model's thoughts while the answer is generated,
    /// then the rendered view, then the critic's suggestion appended to it.
    async fn stream_with_critic(
        &self,
        backend: &DirectModelBackend,
        renderer: &mut StreamRenderer,
        model_text: &mut String,
    ) -> DispatchResult<RoundRecord> {
        let session = backend.session();
        let mut chunks = backend.invoke().await?;
        let mut thoughts = FragmentExtractor::new(self.ctx.config.pipeline.primary_extractor.clone());
        while let Some(chunk) = renderer.sink().pull(&mut chunks).await? {
            let chunk = chunk?;
            if chunk.is_error() {
                return Err(DispatchError::BackendFailure(chunk.text));
            }
            model_text.clear();
            model_text.push_str(&chunk.text);
            if let Some(value) = thoughts.observe(&chunk.text) {
                renderer.push_thoughts(&value).await?;
            }
        }

        let answer = session.finalize(model_text).await?;
        renderer.push(&answer.view_text).await?;

        let (critic, critic_ctx) = match (&self.ctx.critic, session.critic_context()) {
            (Some(critic), Some(critic_ctx)) => (critic, critic_ctx),
            _ => {
                return Ok(RoundRecord {
                    ai_text: answer.ai_text,
                    view_text: answer.view_text,
                })
            }
        };
        log::debug!(
            "{} -> {} for {}",
            DispatchState::StreamingPrimary,
            DispatchState::StreamingCritic,
            session.conv_uid()
        );
        let composed = critic.run(renderer, &answer.view_text, &critic_ctx).await?;
        let text = composed.text();
        Ok(RoundRecord {
            view_text: session.reinforce_view(&text),
            ai_text: text,
        })
    }

    async fn record(&self, request: &ChatRequest, record: &RoundRecord) {
        let mut recorder = self.ctx.history.begin_round(request);
        recorder.add_ai_message(&record.ai_text).await;
        recorder.add_view_message(&record.view_text).await;
        recorder.end_current_round().await;
    }
}

fn unconfigured(mode: ChatMode) -> DispatchError {
    DispatchError::UnsupportedMode(format!("{} (no backend configured)", mode))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;

    fn dispatcher() -> Dispatcher {
        let mut config = AppConfig::default();
        config.critic.enabled = false;
        config.upstreams.model = Some(ModelConfig {
            api_base: "http://127.0.0.1:1/v1".to_string(),
            api_key: None,
            default_model: "m".to_string(),
            stream_out: true,
            table_info: Default::default(),
        });
        Dispatcher::from_config(config, reqwest::Client::new())
    }

    fn request(mode: &str, select_param: &str) -> ChatRequest {
        ChatRequest {
            chat_mode: Some(mode.to_string()),
            selected_param: Some(select_param.to_string()),
            user_input: "hi".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_prepare_direct_model_generates_conv_uid() {
        let d = dispatcher();
        let plan = d.prepare(request("chat_normal", "")).await.unwrap();
        assert_eq!(plan.kind(), BackendKind::DirectModel);
        let conv_uid = plan.request().conv_uid().to_string();
        let parsed = uuid::Uuid::parse_str(&conv_uid).unwrap();
        assert_eq!(parsed.get_version_num(), 7);

        let mut keep = request("chat_normal", "");
        keep.conversation_id = Some("mine".to_string());
        assert_eq!(d.prepare(keep).await.unwrap().request().conv_uid(), "mine");
    }

    #[tokio::test]
    async fn test_prepare_errors() {
        let d = dispatcher();
        let cases = [
            (request("chat_unknown", ""), "E0001"),
            (request("chat_with_db_execute", ""), "E0002"),
            (request("chat_knowledge", "nowhere"), "E0003"),
            (request("chat_agent", "planner"), "E0001"),
        ];
        for (req, code) in cases {
            let mode = req.chat_mode.clone();
            match d.prepare(req).await {
                Err(e) => assert_eq!(e.code(), code, "{:?}", mode),
                Ok(_) => panic!("{:?} should not route", mode),
            }
        }
    }

    #[test]
    fn test_state_names() {
        assert_eq!(DispatchState::StreamingCritic.to_string(), "streaming_critic");
        assert_eq!(DispatchState::Failed.to_string(), "failed");
    }
}
