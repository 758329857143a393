//! SSE streaming parser for OpenAI chat completions.
//!
//! Converts a raw `reqwest` byte stream into `StreamDelta` values.
//! Handles `data: [DONE]`, partial lines, split UTF-8 sequences, and the
//! usage-only chunk sent when `stream_options.include_usage` is set.

use bytes::Bytes;
use futures::stream::Stream;
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::error::OpenAIError;
use crate::types::Usage;

/// One item from a streaming chat completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamDelta {
    /// A non-empty piece of generated text.
    Content(String),
    /// Token usage for the whole completion.
    Usage(Usage),
    /// The server sent `[DONE]`.
    Done,
}

/// Raw streaming chunk from OpenAI API.
#[derive(Debug, serde::Deserialize)]
struct StreamChunkRaw {
    #[serde(default)]
    choices: Vec<StreamChoiceRaw>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, serde::Deserialize)]
struct StreamChoiceRaw {
    delta: DeltaRaw,
}

#[derive(Debug, serde::Deserialize)]
struct DeltaRaw {
    #[serde(default)]
    content: Option<String>,
}

/// Stream adapter that converts raw SSE bytes into `StreamDelta` values.
pub struct ChatCompletionStream {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
    bytes: Vec<u8>,
    ready: VecDeque<StreamDelta>,
    finished: bool,
}

impl ChatCompletionStream {
    pub(crate) fn new(
        byte_stream: impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            bytes: Vec::new(),
            ready: VecDeque::new(),
            finished: false,
        }
    }

    /// Parse every complete line currently buffered.
    fn drain_lines(&mut self) -> Result<(), OpenAIError> {
        while let Some(newline_pos) = self.bytes.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.bytes.drain(..=newline_pos).collect();
            let line = std::str::from_utf8(&raw)
                .map_err(|e| OpenAIError::Parse(format!("Invalid UTF-8 in stream: {}", e)))?;
            parse_line(line.trim(), &mut self.ready)?;
        }
        Ok(())
    }
}

impl Stream for ChatCompletionStream {
    type Item = Result<StreamDelta, OpenAIError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if let Some(delta) = this.ready.pop_front() {
                return Poll::Ready(Some(Ok(delta)));
            }
            if this.finished {
                return Poll::Ready(None);
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    this.bytes.extend_from_slice(&bytes);
                    if let Err(e) = this.drain_lines() {
                        this.finished = true;
                        return Poll::Ready(Some(Err(e)));
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    this.finished = true;
                    return Poll::Ready(Some(Err(OpenAIError::Network(e.to_string()))));
                }
                Poll::Ready(None) => {
                    this.finished = true;
                    // Last line may lack its trailing newline.
                    if !this.bytes.is_empty() {
                        this.bytes.push(b'\n');
                        if let Err(e) = this.drain_lines() {
                            return Poll::Ready(Some(Err(e)));
                        }
                    }
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Parse one SSE line, queueing whatever deltas it carries.
fn parse_line(line: &str, out: &mut VecDeque<StreamDelta>) -> Result<(), OpenAIError> {
    // Blank lines separate events; "event:", "id:" and "retry:" are ignored.
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(());
    };
    let data = data.trim();

    if data == "[DONE]" {
        out.push_back(StreamDelta::Done);
        return Ok(());
    }

    let raw: StreamChunkRaw = serde_json::from_str(data).map_err(|e| {
        OpenAIError::Parse(format!(
            "Failed to parse stream chunk: {} (data: {})",
            e,
            data.chars().take(200).collect::<String>()
        ))
    })?;

    if let Some(content) = raw
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|c| !c.is_empty())
    {
        out.push_back(StreamDelta::Content(content));
    }
    if let Some(usage) = raw.usage {
        out.push_back(StreamDelta::Usage(usage));
    }
    Ok(())
}
