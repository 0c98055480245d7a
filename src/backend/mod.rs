//! Execution backends a chat request can be routed to.
//!
//! Every backend produces a [`ChunkStream`] of snapshots: each chunk carries the full answer
//! text generated so far. Upstreams that stream deltas are accumulated by [`into_snapshots`].

pub mod agent;
pub mod domain;
pub mod flow;
pub mod model;

use crate::config::ChunkMode;
use crate::error::DispatchResult;
use crate::io_struct::RawChunk;
use crate::upstream::{UpstreamBody, UpstreamResponse};
use futures::stream::{self, BoxStream};
use futures::{StreamExt, future};
use serde_json::Value;
use std::fmt;

pub use agent::{AgentBackend, AgentRequest, AgentService, HttpAgentService};
pub use domain::{
    ConnectorRegistry, DomainGraphBackend, ExecutionGraph, GraphNode, GraphRegistry,
    HttpGraphNode, KnowledgeSpace, KnowledgeSpaces, StaticRegistry,
};
pub use flow::{FlowBackend, FlowService, HttpFlowService};
pub use model::{
    ChatFactory, ChatParam, ChatSession, CriticContext, DirectModelBackend, FinalizedAnswer,
    ModelChatFactory, ModelChatSession,
};

pub type ChunkStream = BoxStream<'static, DispatchResult<RawChunk>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Agent,
    Flow,
    DomainGraph,
    DirectModel,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::Agent => "agent",
            BackendKind::Flow => "flow",
            BackendKind::DomainGraph => "domain_graph",
            BackendKind::DirectModel => "direct_model",
        };
        f.write_str(name)
    }
}

/// A routed backend, ready to be invoked.
pub enum Backend {
    Agent(AgentBackend),
    Flow(FlowBackend),
    DomainGraph(DomainGraphBackend),
    DirectModel(DirectModelBackend),
}

impl Backend {
    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Agent(_) => BackendKind::Agent,
            Backend::Flow(_) => BackendKind::Flow,
            Backend::DomainGraph(_) => BackendKind::DomainGraph,
            Backend::DirectModel(_) => BackendKind::DirectModel,
        }
    }

    pub async fn invoke(&self) -> DispatchResult<ChunkStream> {
        match self {
            Backend::Agent(backend) => backend.invoke().await,
            Backend::Flow(backend) => backend.invoke().await,
            Backend::DomainGraph(backend) => backend.invoke().await,
            Backend::DirectModel(backend) => backend.invoke().await,
        }
    }
}

/// Turns delta chunks into snapshots. Error chunks pass through untouched.
pub fn into_snapshots(chunks: ChunkStream, mode: ChunkMode) -> ChunkStream {
    match mode {
        ChunkMode::Snapshot => chunks,
        ChunkMode::Delta => chunks
            .scan(String::new(), |text, item| {
                let item = item.map(|chunk| {
                    if chunk.is_error() {
                        chunk
                    } else {
                        text.push_str(&chunk.text);
                        RawChunk::text(text.clone())
                    }
                });
                future::ready(Some(item))
            })
            .boxed(),
    }
}

/// Adapts an HTTP upstream response to a snapshot stream.
///
/// A failed status becomes a single error chunk carrying the status code.
pub fn upstream_chunks(resp: UpstreamResponse, mode: ChunkMode) -> ChunkStream {
    match resp.body {
        UpstreamBody::Stream(payloads) => into_snapshots(
            payloads
                .map(|payload| payload.map(|p| parse_chunk(&p)))
                .boxed(),
            mode,
        ),
        UpstreamBody::Failed(body) => {
            let chunk = RawChunk::error(body, i32::from(resp.status.as_u16()));
            stream::once(future::ready(Ok(chunk))).boxed()
        }
    }
}

/// Payloads shaped like `{"text": .., "error_code": ..}` are unpacked, anything else is text.
fn parse_chunk(payload: &str) -> RawChunk {
    if payload.starts_with('{') {
        if let Ok(value) = serde_json::from_str::<Value>(payload) {
            if let Some(text) = value.get("text").and_then(Value::as_str) {
                let error_code = value
                    .get("error_code")
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                return RawChunk::error(text, error_code as i32);
            }
        }
    }
    RawChunk::text(payload)
}

/// Runs a blocking closure on the blocking pool and awaits its result.
pub async fn run_blocking<F, T>(f: F) -> DispatchResult<T>
where
    F: FnOnce() -> DispatchResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        crate::error::DispatchError::BackendFailure(format!("blocking task failed: {}", e))
    })?
}
