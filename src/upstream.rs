use crate::error::{DispatchError, DispatchResult};
use bytes::Bytes;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;

pub type TextStream = BoxStream<'static, DispatchResult<String>>;

pub enum UpstreamBody {
    Stream(TextStream),
    Failed(String),
}

pub struct UpstreamResponse {
    pub status: reqwest::StatusCode,
    pub body: UpstreamBody,
}

/// POSTs `request` as JSON and exposes the response as a stream of SSE payloads.
///
/// Error statuses are read in full so the caller can surface the upstream message.
pub async fn post_stream<T: Serialize + ?Sized>(
    client: &reqwest::Client,
    url: &str,
    api_key: Option<&str>,
    request: &T,
) -> DispatchResult<UpstreamResponse> {
    let mut builder = client.post(url).json(request);
    if let Some(key) = api_key {
        builder = builder.bearer_auth(key);
    }
    let resp = builder.send().await?;
    let status = resp.status();
    let body = if status.is_success() {
        UpstreamBody::Stream(sse_payloads(resp.bytes_stream().boxed()))
    } else {
        let text = resp.text().await.unwrap_or_default();
        log::warn!("Upstream {} answered {}: {}", url, status, text);
        UpstreamBody::Failed(text)
    };
    Ok(UpstreamResponse { status, body })
}

/// Splits a byte stream into SSE `data:` payloads.
///
/// Lines without a `data:` prefix are passed through so line-oriented upstreams work too.
/// A `[DONE]` payload ends the stream.
pub fn sse_payloads(
    bytes: BoxStream<'static, Result<Bytes, reqwest::Error>>,
) -> TextStream {
    struct State {
        inner: BoxStream<'static, Result<Bytes, reqwest::Error>>,
        decoder: SseDecoder,
        pending: VecDeque<String>,
        done: bool,
    }

    let state = State {
        inner: bytes,
        decoder: SseDecoder::default(),
        pending: VecDeque::new(),
        done: false,
    };
    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(payload) = st.pending.pop_front() {
                if payload == "[DONE]" {
                    st.pending.clear();
                    st.done = true;
                    return None;
                }
                return Some((Ok(payload), st));
            }
            if st.done {
                return None;
            }
            match st.inner.next().await {
                Some(Ok(bytes)) => st.pending.extend(st.decoder.push(&bytes)),
                Some(Err(e)) => {
                    st.done = true;
                    return Some((Err(DispatchError::from(e)), st));
                }
                None => {
                    st.done = true;
                    st.pending.extend(st.decoder.finish());
                }
            }
        }
    })
    .boxed()
}

/// Line buffer that only decodes complete lines, so multi-byte characters split across
/// network chunks survive.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(payload) = Self::parse_line(&line) {
                payloads.push(payload);
            }
        }
        payloads
    }

    pub fn finish(&mut self) -> Vec<String> {
        let line = std::mem::take(&mut self.buffer);
        Self::parse_line(&line).into_iter().collect()
    }

    fn parse_line(line: &[u8]) -> Option<String> {
        let line = String::from_utf8_lossy(line);
        let line = line.trim_end_matches(['\n', '\r']);
        if line.is_empty() || line.starts_with(':') {
            return None;
        }
        match line.strip_prefix("data:") {
            Some(payload) => Some(payload.strip_prefix(' ').unwrap_or(payload).to_string()),
            None if line.starts_with("event:") || line.starts_with("id:") => None,
            None => Some(line.to_string()),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: &str) -> Self {
        ChatMessage {
            role: "system".to_string(),
            content: content.to_string(),
        }
    }

    pub fn user(content: &str) -> Self {
        ChatMessage {
            role: "user".to_string(),
            content: content.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

/// Client for OpenAI-compatible `/chat/completions` endpoints. Cheap to clone; the
/// underlying connection pool is shared.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    client: reqwest::Client,
    api_base: String,
    api_key: Option<String>,
}

impl OpenAiClient {
    pub fn new(client: reqwest::Client, api_base: &str, api_key: Option<String>) -> Self {
        OpenAiClient {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    /// Streams the assistant content deltas of one completion.
    pub async fn stream_chat(&self, request: &ChatCompletionRequest) -> DispatchResult<TextStream> {
        let url = format!("{}/chat/completions", self.api_base);
        let resp = post_stream(&self.client, &url, self.api_key.as_deref(), request).await?;
        match resp.body {
            UpstreamBody::Stream(payloads) => Ok(payloads
                .filter_map(|payload| async move {
                    match payload {
                        Ok(payload) => delta_content(&payload).map(Ok),
                        Err(e) => Some(Err(e)),
                    }
                })
                .boxed()),
            UpstreamBody::Failed(body) => Err(DispatchError::BackendFailure(format!(
                "model endpoint returned {}: {}",
                resp.status, body
            ))),
        }
    }
}

/// `choices[0].delta.content` of a streamed completion chunk. Malformed payloads are skipped.
pub fn delta_content(payload: &str) -> Option<String> {
    let value: Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(e) => {
            log::debug!("Skipping malformed completion chunk: {}", e);
            return None;
        }
    };
    value
        .pointer("/choices/0/delta/content")
        .and_then(Value::as_str)
        .map(str::to_string)
}
