use super::{ChunkStream, upstream_chunks};
use crate::config::{RoutingConfig, UpstreamConfig};
use crate::error::{DispatchError, DispatchResult};
use crate::io_struct::{ChatMode, ChatRequest, FlowRequest};
use crate::upstream::post_stream;
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnowledgeSpace {
    pub name: String,
    pub domain_type: Option<String>,
}

pub trait KnowledgeSpaces: Send + Sync {
    fn find_space(&self, name: &str) -> Option<KnowledgeSpace>;
}

/// Read-only after startup.
pub trait GraphRegistry: Send + Sync {
    /// Graphs carrying `tag`, in registration order.
    fn resolve_graphs_by_domain_tag(&self, tag: &str) -> Vec<Arc<ExecutionGraph>>;
}

/// Backing resources (database connectors) a domain graph can run against.
pub trait ConnectorRegistry: Send + Sync {
    fn connector_names(&self) -> Vec<String>;
}

#[async_trait]
pub trait GraphNode: Send + Sync {
    fn name(&self) -> &str;
    async fn stream(&self, request: &FlowRequest) -> DispatchResult<ChunkStream>;
}

pub struct ExecutionGraph {
    pub name: String,
    pub tags: Vec<String>,
    pub leaf_nodes: Vec<Arc<dyn GraphNode>>,
}

impl ExecutionGraph {
    pub fn output_node(&self) -> Option<&Arc<dyn GraphNode>> {
        self.leaf_nodes.first()
    }
}

pub struct DomainGraphBackend {
    graph_name: String,
    node: Arc<dyn GraphNode>,
    request: FlowRequest,
}

impl DomainGraphBackend {
    /// Picks the first graph tagged `domain_tag` and the first connector whose name contains
    /// the request's space.
    pub fn resolve(
        request: &ChatRequest,
        mode: ChatMode,
        domain_tag: &str,
        graphs: &dyn GraphRegistry,
        connectors: &dyn ConnectorRegistry,
    ) -> DispatchResult<Self> {
        let graphs = graphs.resolve_graphs_by_domain_tag(domain_tag);
        let graph = graphs.first().ok_or_else(|| {
            DispatchError::NotFound(format!("Cant find the DAG for domain type {}", domain_tag))
        })?;
        let node = graph.output_node().cloned().ok_or_else(|| {
            DispatchError::NotFound(format!(
                "DAG {} for domain type {} has no output node",
                graph.name, domain_tag
            ))
        })?;

        let space = request.select_param();
        let db_name = connectors
            .connector_names()
            .into_iter()
            .find(|name| name.contains(space))
            .ok_or_else(|| {
                DispatchError::NotFound(format!("No connector matching space {}", space))
            })?;

        let mut flow_request = FlowRequest::from_chat(request, mode);
        flow_request.extra = Some(json!({ "space": space, "db_name": db_name }));
        Ok(DomainGraphBackend {
            graph_name: graph.name.clone(),
            node,
            request: flow_request,
        })
    }

    pub fn graph_name(&self) -> &str {
        &self.graph_name
    }

    pub fn request(&self) -> &FlowRequest {
        &self.request
    }

    pub async fn invoke(&self) -> DispatchResult<ChunkStream> {
        log::info!(
            "Domain graph {} node {} for {}",
            self.graph_name,
            self.node.name(),
            self.request.conv_uid
        );
        self.node.stream(&self.request).await
    }
}

pub struct HttpGraphNode {
    name: String,
    client: reqwest::Client,
    upstream: UpstreamConfig,
}

impl HttpGraphNode {
    pub fn new(name: String, client: reqwest::Client, upstream: UpstreamConfig) -> Self {
        HttpGraphNode {
            name,
            client,
            upstream,
        }
    }
}

#[async_trait]
impl GraphNode for HttpGraphNode {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stream(&self, request: &FlowRequest) -> DispatchResult<ChunkStream> {
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

/// Spaces, graphs and connectors declared in the configuration file.
#[derive(Default)]
pub struct StaticRegistry {
    spaces: HashMap<String, KnowledgeSpace>,
    graphs: Vec<Arc<ExecutionGraph>>,
    connectors: Vec<String>,
}

impl StaticRegistry {
    pub fn new(
        spaces: Vec<KnowledgeSpace>,
        graphs: Vec<ExecutionGraph>,
        connectors: Vec<String>,
    ) -> Self {
        StaticRegistry {
            spaces: spaces
                .into_iter()
                .map(|space| (space.name.clone(), space))
                .collect(),
            graphs: graphs.into_iter().map(Arc::new).collect(),
            connectors,
        }
    }

    pub fn from_config(config: &RoutingConfig, client: &reqwest::Client) -> Self {
        let spaces = config
            .spaces
            .iter()
            .map(|space| KnowledgeSpace {
                name: space.name.clone(),
                domain_type: space.domain_type.clone(),
            })
            .collect();
        let graphs = config
            .graphs
            .iter()
            .map(|graph| ExecutionGraph {
                name: graph.name.clone(),
                tags: graph.tags.clone(),
                leaf_nodes: graph
                    .output_node
                    .iter()
                    .map(|node| {
                        Arc::new(HttpGraphNode::new(
                            format!("{}.output", graph.name),
                            client.clone(),
                            node.clone(),
                        )) as Arc<dyn GraphNode>
                    })
                    .collect(),
            })
            .collect();
        Self::new(spaces, graphs, config.connectors.clone())
    }
}

impl KnowledgeSpaces for StaticRegistry {
    fn find_space(&self, name: &str) -> Option<KnowledgeSpace> {
        self.spaces.get(name).cloned()
    }
}

impl GraphRegistry for StaticRegistry {
    fn resolve_graphs_by_domain_tag(&self, tag: &str) -> Vec<Arc<ExecutionGraph>> {
        self.graphs
            .iter()
            .filter(|graph| graph.tags.iter().any(|t| t == tag))
            .cloned()
            .collect()
    }
}

impl ConnectorRegistry for StaticRegistry {
    fn connector_names(&self) -> Vec<String> {
        self.connectors.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io_struct::RawChunk;
    use futures::{StreamExt, stream};

    struct EchoNode;

    #[async_trait]
    impl GraphNode for EchoNode {
        fn name(&self) -> &str {
            "echo"
        }

        async fn stream(&self, request: &FlowRequest) -> DispatchResult<ChunkStream> {
            let text = request.extra.as_ref().unwrap()["db_name"]
                .as_str()
                .unwrap()
                .to_string();
            Ok(stream::iter(vec![Ok(RawChunk::text(text))]).boxed())
        }
    }

    fn registry() -> StaticRegistry {
        StaticRegistry::new(
            vec![KnowledgeSpace {
                name: "fin".to_string(),
                domain_type: Some("FinancialReport".to_string()),
            }],
            vec![
                ExecutionGraph {
                    name: "empty".to_string(),
                    tags: vec!["Empty".to_string()],
                    leaf_nodes: vec![],
                },
                ExecutionGraph {
                    name: "fin_report".to_string(),
                    tags: vec!["FinancialReport".to_string()],
                    leaf_nodes: vec![Arc::new(EchoNode)],
                },
            ],
            vec!["sales".to_string(), "fin_report_2024".to_string(), "fin_2".to_string()],
        )
    }

    fn request(space: &str) -> ChatRequest {
        ChatRequest {
            conversation_id: Some("c1".to_string()),
            chat_mode: Some("chat_knowledge".to_string()),
            selected_param: Some(space.to_string()),
            user_input: "revenue?".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_resolve_first_matching_connector() {
        let registry = registry();
        let backend = DomainGraphBackend::resolve(
            &request("fin"),
            ChatMode::Knowledge,
            "FinancialReport",
            &registry,
            &registry,
        )
        .unwrap();
        assert_eq!(backend.graph_name(), "fin_report");
        let extra = backend.request().extra.clone().unwrap();
        assert_eq!(extra["db_name"], "fin_report_2024");
        assert_eq!(extra["space"], "fin");
        assert_eq!(backend.request().chat_mode, "chat_knowledge");

        let chunks: Vec<_> = backend.invoke().await.unwrap().collect().await;
        assert_eq!(chunks[0].as_ref().unwrap().text, "fin_report_2024");
    }

    #[test]
    fn test_resolve_not_found() {
        let registry = registry();
        for (tag, space) in [("finance", "fin"), ("Empty", "fin"), ("FinancialReport", "hr")] {
            let result = DomainGraphBackend::resolve(
                &request(space),
                ChatMode::Knowledge,
                tag,
                &registry,
                &registry,
            );
            assert!(matches!(result, Err(DispatchError::NotFound(_))), "{}", tag);
        }
    }
}
