use crate::backend::ChunkStream;
use crate::error::{DispatchError, DispatchResult};
use crate::io_struct::{ChatCompletionStreamResponse, ProtocolFrame};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;

/// Decoding artifact some model servers leave in partially decoded output.
const REPLACEMENT_CHAR: char = '\u{fffd}';

/// Write side of the client transport.
pub struct FrameSink {
    tx: mpsc::Sender<Bytes>,
    pacing: Duration,
    frames_sent: usize,
}

impl FrameSink {
    pub fn new(tx: mpsc::Sender<Bytes>, pacing: Duration) -> Self {
        FrameSink {
            tx,
            pacing,
            frames_sent: 0,
        }
    }

    pub async fn send(&mut self, frame: ProtocolFrame) -> DispatchResult<()> {
        let terminal = frame.is_terminal();
        self.tx
            .send(frame.encode())
            .await
            .map_err(|_| DispatchError::TransportClosed)?;
        self.frames_sent += 1;
        if !terminal && !self.pacing.is_zero() {
            tokio::time::sleep(self.pacing).await;
        }
        Ok(())
    }

    /// Pulls the next item unless the client goes away first.
    pub async fn pull<S>(&self, stream: &mut S) -> DispatchResult<Option<S::Item>>
    where
        S: Stream + Unpin,
    {
        tokio::select! {
            biased;
            _ = self.tx.closed() => Err(DispatchError::TransportClosed),
            item = stream.next() => Ok(item),
        }
    }

    /// Waits until the transport has taken every frame sent so far.
    pub async fn flush(&self) -> DispatchResult<()> {
        self.tx
            .reserve_many(self.tx.max_capacity())
            .await
            .map(drop)
            .map_err(|_| DispatchError::TransportClosed)
    }

    pub fn frames_sent(&self) -> usize {
        self.frames_sent
    }
}

#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub incremental: bool,
    /// Used as the `id` of delta payloads.
    pub conv_uid: String,
    pub model_name: String,
    pub empty_output_message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderOutcome {
    Completed(String),
    ServerError(String),
}

/// Turns full-text-so-far snapshots into protocol frames.
///
/// In incremental mode every frame carries only the text added since the previous frame and
/// the response ends with `[DONE]`. Otherwise each frame repeats the whole text with newlines
/// escaped and the transport close ends the response.
pub struct StreamRenderer {
    sink: FrameSink,
    settings: RenderSettings,
    previous: String,
    previous_thoughts: String,
    last_text: String,
    emitted: bool,
    terminated: bool,
}

impl StreamRenderer {
    pub fn new(sink: FrameSink, settings: RenderSettings) -> Self {
        StreamRenderer {
            sink,
            settings,
            previous: String::new(),
            previous_thoughts: String::new(),
            last_text: String::new(),
            emitted: false,
            terminated: false,
        }
    }

    pub fn sink(&self) -> &FrameSink {
        &self.sink
    }

    pub fn last_text(&self) -> &str {
        &self.last_text
    }

    /// Consumes a snapshot stream. Stops at the first chunk with a non-zero error code.
    pub async fn render(&mut self, mut chunks: ChunkStream) -> DispatchResult<RenderOutcome> {
        while let Some(chunk) = self.sink.pull(&mut chunks).await? {
            let chunk = chunk?;
            if chunk.is_error() {
                log::warn!(
                    "Backend reported error code {} for {}",
                    chunk.error_code,
                    self.settings.conv_uid
                );
                self.server_error(&chunk.text).await?;
                return Ok(RenderOutcome::ServerError(chunk.text));
            }
            self.push(&chunk.text).await?;
        }
        Ok(RenderOutcome::Completed(self.last_text.clone()))
    }

    pub async fn push(&mut self, text: &str) -> DispatchResult<()> {
        if text.is_empty() || self.terminated {
            return Ok(());
        }
        let msg: String = text.chars().filter(|c| *c != REPLACEMENT_CHAR).collect();
        let frame = if self.settings.incremental {
            let delta = suffix_after(&msg, &self.previous);
            let payload = ChatCompletionStreamResponse::assistant_delta(
                &self.settings.conv_uid,
                &self.settings.model_name,
                delta,
            );
            self.previous = msg.clone();
            ProtocolFrame::delta(serde_json::to_string(&payload)?)
        } else {
            let escaped = escape_newlines(&msg);
            self.previous = escaped.clone();
            ProtocolFrame::snapshot(escaped)
        };
        self.last_text = msg;
        self.emitted = true;
        self.sink.send(frame).await
    }

    /// Provisional text shown while the answer is generated, replaced later by `push`.
    ///
    /// Incremental clients get it as `reasoning_content` deltas so the `content` deltas still
    /// rebuild the final answer. Full-text clients see it like any other snapshot.
    pub async fn push_thoughts(&mut self, text: &str) -> DispatchResult<()> {
        if !self.settings.incremental {
            return self.push(text).await;
        }
        if text.is_empty() || self.terminated {
            return Ok(());
        }
        let msg: String = text.chars().filter(|c| *c != REPLACEMENT_CHAR).collect();
        let delta = suffix_after(&msg, &self.previous_thoughts);
        if delta.is_empty() {
            return Ok(());
        }
        let payload = ChatCompletionStreamResponse::reasoning_delta(
            &self.settings.conv_uid,
            &self.settings.model_name,
            delta,
        );
        self.previous_thoughts = msg;
        self.emitted = true;
        self.sink
            .send(ProtocolFrame::delta(serde_json::to_string(&payload)?))
            .await
    }

    /// Whole answer of a non-streaming session, sent as one frame.
    pub async fn final_text(&mut self, text: &str) -> DispatchResult<()> {
        if self.terminated {
            return Ok(());
        }
        self.last_text = text.to_string();
        self.emitted = true;
        self.sink
            .send(ProtocolFrame::final_text(escape_newlines(text)))
            .await
    }

    /// Upstream reported an error: tag it and end the response without `[DONE]`.
    pub async fn server_error(&mut self, text: &str) -> DispatchResult<()> {
        self.fail(&format!("[SERVER_ERROR]{}", text)).await
    }

    /// Sends an error frame and ends the response without `[DONE]`.
    pub async fn fail(&mut self, text: &str) -> DispatchResult<()> {
        if self.terminated {
            return Ok(());
        }
        self.terminated = true;
        self.emitted = true;
        self.sink
            .send(ProtocolFrame::error(escape_newlines(text)))
            .await
    }

    /// Ends a successful response. Never sends a second terminator.
    pub async fn finish(&mut self) -> DispatchResult<()> {
        if self.terminated {
            return Ok(());
        }
        if !self.emitted {
            let message = self.settings.empty_output_message.clone();
            log::warn!("No output for {}: {}", self.settings.conv_uid, message);
            self.sink
                .send(ProtocolFrame::error(escape_newlines(&message)))
                .await?;
            self.emitted = true;
        }
        self.terminated = true;
        if self.settings.incremental {
            self.sink.send(ProtocolFrame::done()).await?;
        }
        Ok(())
    }
}

/// Characters of `current` beyond the length of `previous`.
fn suffix_after(current: &str, previous: &str) -> String {
    current.chars().skip(previous.chars().count()).collect()
}

pub fn escape_newlines(text: &str) -> String {
    text.replace('\n', "\\n")
}
