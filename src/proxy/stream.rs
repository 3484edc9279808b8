//! Upstream SSE stream observation.
//!
//! Provides [`SseObserver`] for line-buffered extraction of text fragments
//! from OpenAI-compatible SSE streaming responses, and [`fragment_stream`]
//! which turns a raw byte stream into a stream of fragments. Handles TCP
//! chunk boundary reassembly correctly.

use std::collections::VecDeque;
use std::pin::Pin;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::Value;

use crate::error::{Error, Result};

/// Maximum bytes buffered for a single SSE line before it is discarded.
const MAX_LINE_BYTES: usize = 64 * 1024;

/// Incremental text fragments from upstream, in arrival order.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// What one upstream `data:` line meant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseSignal {
    /// Non-empty delta text.
    Fragment(String),
    /// `data: [DONE]`
    Done,
    /// An in-stream error payload.
    Failed(String),
}

/// Line buffer and decoder for an upstream SSE body.
///
/// Buffers raw bytes across chunk boundaries (so multi-byte UTF-8 sequences
/// split between chunks survive), reassembles complete lines and decodes
/// `data:` lines. Nothing is produced after `[DONE]` or an error payload.
pub(crate) struct SseObserver {
    buffer: Vec<u8>,
    finished: bool,
}

impl SseObserver {
    /// Create a new observer with empty state.
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            finished: false,
        }
    }

    /// Process a chunk of bytes from the SSE stream.
    pub fn process_chunk(&mut self, bytes: &[u8]) -> Vec<SseSignal> {
        let mut signals = Vec::new();
        if self.finished {
            return signals;
        }

        self.buffer.extend_from_slice(bytes);

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.process_line(&line, &mut signals);
            if self.finished {
                self.buffer.clear();
                return signals;
            }
        }

        if self.buffer.len() > MAX_LINE_BYTES {
            tracing::warn!(
                buffered = self.buffer.len(),
                "SSE line exceeds buffer cap, discarding"
            );
            self.buffer.clear();
        }

        signals
    }

    /// Flush any remaining content in the buffer as a final line.
    pub fn finish(mut self) -> Vec<SseSignal> {
        let mut signals = Vec::new();
        if !self.finished && !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            self.process_line(&line, &mut signals);
        }
        signals
    }

    /// Process a single complete SSE line.
    fn process_line(&mut self, raw: &[u8], signals: &mut Vec<SseSignal>) {
        let text = String::from_utf8_lossy(raw);
        let line = text.trim_end_matches(['\r', '\n']);

        // event:, id:, retry: and comment lines carry nothing we forward
        if let Some(data) = line.strip_prefix("data:") {
            self.process_data(data.trim_start(), signals);
        }
    }

    /// Process the data payload of a `data:` SSE line.
    fn process_data(&mut self, data: &str, signals: &mut Vec<SseSignal>) {
        if data == "[DONE]" {
            self.finished = true;
            signals.push(SseSignal::Done);
            return;
        }

        let parsed: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(error = %e, "Skipping malformed SSE data line");
                return;
            }
        };

        if let Some(error) = parsed.get("error").filter(|e| !e.is_null()) {
            self.finished = true;
            signals.push(SseSignal::Failed(error_message(error)));
            return;
        }

        if let Some(content) = parsed
            .pointer("/choices/0/delta/content")
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty())
        {
            signals.push(SseSignal::Fragment(content.to_string()));
        }
    }
}

/// Human-readable message of a provider error object.
pub(crate) fn error_message(error: &Value) -> String {
    match error {
        Value::String(message) => message.clone(),
        other => other
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| other.to_string()),
    }
}

struct FragmentState<S> {
    bytes: Pin<Box<S>>,
    observer: Option<SseObserver>,
    pending: VecDeque<Result<String>>,
}

impl<S> FragmentState<S> {
    /// Queue decoded signals; returns false once the stream is over.
    fn enqueue(&mut self, signals: Vec<SseSignal>) -> bool {
        for signal in signals {
            match signal {
                SseSignal::Fragment(text) => self.pending.push_back(Ok(text)),
                SseSignal::Done => return false,
                SseSignal::Failed(message) => {
                    self.pending.push_back(Err(Error::UpstreamStream(message)));
                    return false;
                }
            }
        }
        true
    }
}

/// Decode an upstream SSE byte stream into text fragments.
///
/// The stream ends after `[DONE]`, after an error, or when the body ends;
/// a body that ends without `[DONE]` counts as a normal completion.
pub fn fragment_stream<S>(bytes: S) -> FragmentStream
where
    S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
{
    let state = FragmentState {
        bytes: Box::pin(bytes),
        observer: Some(SseObserver::new()),
        pending: VecDeque::new(),
    };

    let stream = futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }

            let observer = state.observer.as_mut()?;
            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    let signals = observer.process_chunk(&chunk);
                    if !state.enqueue(signals) {
                        state.observer = None;
                    }
                }
                Some(Err(e)) => {
                    tracing::error!(error = %e, "Error streaming from upstream");
                    state.pending.push_back(Err(Error::Http(e)));
                    state.observer = None;
                }
                None => {
                    if let Some(observer) = state.observer.take() {
                        let signals = observer.finish();
                        state.enqueue(signals);
                    }
                }
            }
        }
    });

    Box::pin(stream)
}
