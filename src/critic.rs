//! Second-opinion pass over database answers.
//!
//! After the primary answer is finalized, a separate evaluation model is asked how the user
//! could phrase the question better. Its `suggestions_of_query` field is streamed to the client
//! appended to the primary view, so every critic frame carries the complete message.

use crate::backend::CriticContext;
use crate::config::CriticConfig;
use crate::error::DispatchResult;
use crate::extractor::{ExtractorConfig, FragmentExtractor};
use crate::io_struct::ComposedAnswer;
use crate::renderer::StreamRenderer;
use crate::upstream::{ChatCompletionRequest, ChatMessage, OpenAiClient, TextStream};
use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use std::sync::{Arc, OnceLock};

/// A streaming chat model used for evaluation. Shared by all requests.
#[async_trait]
pub trait CriticModel: Send + Sync {
    /// Streams content deltas of the model's reply.
    async fn stream(&self, system: &str, input: &str) -> DispatchResult<TextStream>;
}

pub struct OpenAiCriticClient {
    client: OpenAiClient,
    model: String,
    top_p: f32,
    temperature: f32,
}

impl OpenAiCriticClient {
    pub fn new(client: reqwest::Client, config: &CriticConfig) -> Self {
        OpenAiCriticClient {
            client: OpenAiClient::new(client, &config.api_base, config.api_key.clone()),
            model: config.model.clone(),
            top_p: config.top_p,
            temperature: config.temperature,
        }
    }
}

#[async_trait]
impl CriticModel for OpenAiCriticClient {
    async fn stream(&self, system: &str, input: &str) -> DispatchResult<TextStream> {
        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage::system(system), ChatMessage::user(input)],
            stream: true,
            top_p: Some(self.top_p),
            temperature: Some(self.temperature),
        };
        self.client.stream_chat(&request).await
    }
}

/// What the critic gets to see of the primary answer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ViewSummary {
    pub thoughts: String,
    pub sql: String,
    pub db_data: String,
    #[serde(rename = "type")]
    pub chart_type: String,
}

fn view_patterns() -> &'static [Regex; 3] {
    static PATTERNS: OnceLock<[Regex; 3]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"&quot;sql&quot;: &quot;(.*?)&quot;",
            r"&quot;data&quot;: (\[.*?\])",
            r"&quot;type&quot;: &quot;(.*?)&quot;",
        ]
        .map(|p| Regex::new(p).unwrap_or_else(|e| panic!("invalid view pattern {}: {}", p, e)))
    })
}

impl ViewSummary {
    /// Pulls the fields out of a rendered view. The view embeds its chart spec HTML-escaped.
    pub fn parse(view_text: &str) -> Self {
        let [sql, data, chart_type] = view_patterns();
        let capture = |re: &Regex| {
            re.captures(view_text)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string())
                .unwrap_or_default()
        };
        ViewSummary {
            thoughts: view_text.lines().next().unwrap_or_default().to_string(),
            sql: capture(sql),
            db_data: capture(data),
            chart_type: capture(chart_type),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

pub fn render_template(template: &str, ctx: &CriticContext, model_output: &str) -> String {
    template
        .replace("{db_name}", &ctx.db_name)
        .replace("{table_info}", &ctx.table_info)
        .replace("{user_input}", &ctx.user_input)
        .replace("{model_output}", model_output)
}

pub struct CriticChainer {
    model: Arc<dyn CriticModel>,
    system_prompt: String,
    template: String,
    extractor: ExtractorConfig,
}

impl CriticChainer {
    pub fn new(model: Arc<dyn CriticModel>, config: &CriticConfig) -> Self {
        CriticChainer {
            model,
            system_prompt: config.system_prompt.clone(),
            template: config.template.clone(),
            extractor: config.extractor.clone(),
        }
    }

    pub fn from_config(client: reqwest::Client, config: &CriticConfig) -> Self {
        Self::new(Arc::new(OpenAiCriticClient::new(client, config)), config)
    }

    /// Streams the critic's suggestion after `view_text`.
    ///
    /// Only a closed transport is an error here; a failing critic ends the pass with whatever
    /// suggestion arrived so far.
    pub async fn run(
        &self,
        renderer: &mut StreamRenderer,
        view_text: &str,
        ctx: &CriticContext,
    ) -> DispatchResult<ComposedAnswer> {
        let summary = ViewSummary::parse(view_text).to_json();
        let prompt = render_template(&self.template, ctx, &summary);
        let mut answer = ComposedAnswer {
            primary_text: view_text.to_string(),
            critic_suggestion: String::new(),
        };

        let mut stream = match self.model.stream(&self.system_prompt, &prompt).await {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!("Critic model unavailable: {}", e);
                return Ok(answer);
            }
        };

        let mut extractor = FragmentExtractor::new(self.extractor.clone());
        while let Some(item) = renderer.sink().pull(&mut stream).await? {
            let delta = match item {
                Ok(delta) => delta,
                Err(e) => {
                    log::warn!("Critic stream failed: {}", e);
                    break;
                }
            };
            if let Some(suggestion) = extractor.extract(&delta) {
                answer.critic_suggestion = suggestion;
                renderer.push(&answer.text()).await?;
            }
        }

        if extractor.last_value().is_none() {
            let buffered = extractor.accumulated_text().to_string();
            if !buffered.is_empty() {
                log::debug!("Critic suggestion not found, using the whole reply");
                answer.critic_suggestion = buffered;
                renderer.push(&answer.text()).await?;
            }
        }
        Ok(answer)
    }
}
