use super::{ChunkStream, upstream_chunks};
use crate::config::UpstreamConfig;
use crate::error::DispatchResult;
use crate::io_struct::ChatRequest;
use crate::upstream::post_stream;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AgentRequest {
    pub conv_uid: String,
    pub gpts_name: String,
    pub user_query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sys_code: Option<String>,
}

impl AgentRequest {
    pub fn from_chat(request: &ChatRequest) -> Self {
        AgentRequest {
            conv_uid: request.conv_uid().to_string(),
            gpts_name: request.select_param().to_string(),
            user_query: request.user_input.clone(),
            user_code: request.user_name.clone(),
            sys_code: request.sys_code.clone(),
        }
    }
}

/// Multi-agent orchestrator.
#[async_trait]
pub trait AgentService: Send + Sync {
    async fn app_agent_chat(&self, request: &AgentRequest) -> DispatchResult<ChunkStream>;
}

pub struct AgentBackend {
    service: Arc<dyn AgentService>,
    request: AgentRequest,
}

impl AgentBackend {
    pub fn new(service: Arc<dyn AgentService>, request: AgentRequest) -> Self {
        AgentBackend { service, request }
    }

    pub fn request(&self) -> &AgentRequest {
        &self.request
    }

    pub async fn invoke(&self) -> DispatchResult<ChunkStream> {
        log::info!(
            "Agent chat {} with {}",
            self.request.conv_uid,
            self.request.gpts_name
        );
        self.service.app_agent_chat(&self.request).await
    }
}

pub struct HttpAgentService {
    client: reqwest::Client,
    upstream: UpstreamConfig,
}

impl HttpAgentService {
    pub fn new(client: reqwest::Client, upstream: UpstreamConfig) -> Self {
        HttpAgentService { client, upstream }
    }
}

#[async_trait]
impl AgentService for HttpAgentService {
    async fn app_agent_chat(&self, request: &AgentRequest) -> DispatchResult<ChunkStream> {
        let resp = post_stream(
            &self.client,
            &self.upstream.endpoint(),
            self.upstream.api_key.as_deref(),
            request,
        )
        .await?;
        Ok(upstream_chunks(resp, self.upstream.chunk_mode))
    }
}
