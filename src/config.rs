use crate::extractor::{Completion, ExtractorConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for field '{field}': {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Missing required field: {field}")]
    MissingRequired { field: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub pipeline: PipelineConfig,
    pub critic: CriticConfig,
    pub upstreams: UpstreamsConfig,
    pub routing: RoutingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub timeout_secs: u64,
    pub log_level: String,
    pub max_payload_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 5670,
            timeout_secs: 600,
            log_level: "info".to_string(),
            max_payload_size: 4 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Delay after every frame written to the client.
    pub pacing_ms: u64,
    /// Sent when a backend finishes without producing any text.
    pub empty_output_message: String,
    /// Frames buffered between the pipeline task and the response body.
    pub frame_buffer: usize,
    pub primary_extractor: ExtractorConfig,
}

impl PipelineConfig {
    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            pacing_ms: 20,
            empty_output_message:
                "[LLM_ERROR]: llm server has no output, maybe your prompt template is wrong."
                    .to_string(),
            frame_buffer: 16,
            primary_extractor: ExtractorConfig::primary_thoughts(),
        }
    }
}

pub const DEFAULT_CRITIC_SYSTEM_PROMPT: &str = "You review the output of a text-to-SQL data model.";

pub const DEFAULT_CRITIC_TEMPLATE: &str = r#"
Review the data model answer below and suggest how the user could improve the question.

Database name:
    {db_name}
Table structure:
    {table_info}
User question:
    {user_input}
Data model output:
    {model_output}

Respond strictly in the following JSON format, one field per line:
{
    "thoughts_of_query": "assessment of the user question",
    "thoughts_of_sql": "assessment of the generated sql",
    "suggestions_of_query": "suggested rewrite of the question for the user",
    "suggestions_of_sql": "suggested fix for the sql",
}
"#;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CriticConfig {
    pub enabled: bool,
    pub api_base: String,
    pub api_key: Option<String>,
    pub model: String,
    pub top_p: f32,
    pub temperature: f32,
    pub system_prompt: String,
    pub template: String,
    pub extractor: ExtractorConfig,
}

impl Default for CriticConfig {
    fn default() -> Self {
        CriticConfig {
            enabled: true,
            api_base: "https://open.bigmodel.cn/api/paas/v4".to_string(),
            api_key: None,
            model: "glm-4".to_string(),
            top_p: 0.7,
            temperature: 0.9,
            system_prompt: DEFAULT_CRITIC_SYSTEM_PROMPT.to_string(),
            template: DEFAULT_CRITIC_TEMPLATE.to_string(),
            extractor: ExtractorConfig::critic_suggestions(),
        }
    }
}

/// Whether successive upstream chunks append to each other or repeat the full text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkMode {
    Delta,
    #[default]
    Snapshot,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    pub url: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub chunk_mode: ChunkMode,
    #[serde(default)]
    pub api_key: Option<String>,
}

impl UpstreamConfig {
    pub fn endpoint(&self) -> String {
        let base = self.url.trim_end_matches('/');
        if self.path.is_empty() {
            base.to_string()
        } else if self.path.starts_with('/') {
            format!("{}{}", base, self.path)
        } else {
            format!("{}/{}", base, self.path)
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamsConfig {
    pub agent: Option<UpstreamConfig>,
    pub flow: Option<UpstreamConfig>,
    pub model: Option<ModelConfig>,
}

/// OpenAI-compatible endpoint backing direct-model sessions.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelConfig {
    pub api_base: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub default_model: String,
    #[serde(default = "default_true")]
    pub stream_out: bool,
    /// Table summary per database, shown to the critic. Databases without one get "".
    #[serde(default)]
    pub table_info: HashMap<String, String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub spaces: Vec<SpaceConfig>,
    pub graphs: Vec<GraphConfig>,
    pub connectors: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SpaceConfig {
    pub name: String,
    #[serde(default)]
    pub domain_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GraphConfig {
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// The node whose output is streamed back; graphs without one cannot serve chats.
    #[serde(default)]
    pub output_node: Option<UpstreamConfig>,
}

impl AppConfig {
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.server.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "server.timeout_secs".to_string(),
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.pipeline.frame_buffer == 0 {
            return Err(ConfigError::InvalidValue {
                field: "pipeline.frame_buffer".to_string(),
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        validate_extractor("pipeline.primary_extractor", &self.pipeline.primary_extractor)?;
        if self.critic.enabled {
            if self.critic.api_base.is_empty() {
                return Err(ConfigError::MissingRequired {
                    field: "critic.api_base".to_string(),
                });
            }
            if !self.critic.template.contains("{model_output}") {
                return Err(ConfigError::InvalidValue {
                    field: "critic.template".to_string(),
                    value: "<template>".to_string(),
                    reason: "must contain the {model_output} placeholder".to_string(),
                });
            }
            validate_extractor("critic.extractor", &self.critic.extractor)?;
        }
        for space in &self.routing.spaces {
            if space.name.is_empty() {
                return Err(ConfigError::MissingRequired {
                    field: "routing.spaces[].name".to_string(),
                });
            }
        }
        Ok(())
    }
}

fn validate_extractor(field: &str, extractor: &ExtractorConfig) -> ConfigResult<()> {
    if extractor.key.is_empty() {
        return Err(ConfigError::MissingRequired {
            field: format!("{}.key", field),
        });
    }
    if let Completion::LineCount { marker, .. } = &extractor.completion {
        if marker.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: format!("{}.completion.marker", field),
                value: "\"\"".to_string(),
                reason: "line-count marker cannot be empty".to_string(),
            });
        }
    }
    Ok(())
}
