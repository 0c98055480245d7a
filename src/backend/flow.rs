use super::{ChunkStream, upstream_chunks};
use crate::config::UpstreamConfig;
use crate::error::DispatchResult;
use crate::io_struct::FlowRequest;
use crate::upstream::post_stream;
use async_trait::async_trait;
use std::sync::Arc;

/// Flow-execution service; `flow_id` selects the flow to run.
#[async_trait]
pub trait FlowService: Send + Sync {
    async fn chat_stream_flow(
        &self,
        flow_id: &str,
        request: &FlowRequest,
    ) -> DispatchResult<ChunkStream>;
}

pub struct FlowBackend {
    service: Arc<dyn FlowService>,
    flow_id: String,
    request: FlowRequest,
}

impl FlowBackend {
    pub fn new(service: Arc<dyn FlowService>, flow_id: String, request: FlowRequest) -> Self {
        FlowBackend {
            service,
            flow_id,
            request,
        }
    }

    pub fn request(&self) -> &FlowRequest {
        &self.request
    }

    pub async fn invoke(&self) -> DispatchResult<ChunkStream> {
        log::info!(
            "Flow chat {} on flow {} (span {})",
            self.request.conv_uid,
            self.flow_id,
            self.request.span_id
        );
        self.service
            .chat_stream_flow(&self.flow_id, &self.request)
            .await
    }
}

/// Posts the flow request to `{endpoint}/{flow_id}`.
pub struct HttpFlowService {
    client: reqwest::Client,
    upstream: UpstreamConfig,
}

impl HttpFlowService {
    pub fn new(client: reqwest::Client, upstream: UpstreamConfig) -> Self {
        HttpFlowService { client, upstream }
    }

    fn flow_url(&self, flow_id: &str) -> String {
        format!("{}/{}", self.upstream.endpoint(), flow_id)
    }
}

#[async_trait]
impl FlowService for HttpFlowService {
    async fn chat_stream_flow(
        &self,
        flow_id: &str,
        request: &FlowRequest,
    ) -> DispatchResult<ChunkStream> {
        let resp = post_stream(
            &self.client,
            &self.flow_url(flow_id),
            self.upstream.api_key.as_deref(),
            request,
        )
        .await?;
        Ok(upstream_chunks(resp, self.upstream.chunk_mode))
    }
}
