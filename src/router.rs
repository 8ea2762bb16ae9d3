use crate::correlator::Correlator;
use crate::errors::AppError;
use crate::harness::stream_reassembler::{Reassembled, StreamReassembler, DEFAULT_MAX_STREAM_CHUNKS};
use crate::models::ResponseFrame;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static REQUEST_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""requestId"\s*:\s*"([^"\\]+)""#).expect("valid request id regex"));

/// Routes extracted frames for one helper process: stream control frames to
/// the reassembler, terminal frames straight to the correlator.
pub struct FrameRouter {
    correlator: Correlator,
    streams: StreamReassembler,
    generation: u64,
}

impl FrameRouter {
    pub fn new(correlator: Correlator, generation: u64) -> Self {
        Self::with_max_stream_chunks(correlator, generation, DEFAULT_MAX_STREAM_CHUNKS)
    }

    pub fn with_max_stream_chunks(correlator: Correlator, generation: u64, max_stream_chunks: usize) -> Self {
        Self {
            correlator,
            streams: StreamReassembler::with_max_chunks(max_stream_chunks),
            generation,
        }
    }

    /// Drops partial streams whose request already settled (timed out or
    /// rejected). Returns how many were dropped.
    pub async fn sweep_settled(&mut self) -> usize {
        let mut dropped = 0;
        for request_id in self.streams.stream_ids() {
            if !self.correlator.contains(&request_id).await && self.streams.discard(&request_id) {
                dropped += 1;
            }
        }
        if dropped > 0 {
            tracing::debug!(generation = self.generation, dropped, "dropped streams of settled requests");
        }
        dropped
    }

    pub fn active_streams(&self) -> usize {
        self.streams.active_streams()
    }

    /// Parses one frame. Unparseable frames are dropped; when the raw text
    /// still names a pending request, that request alone is rejected.
    pub async fn route_raw(&mut self, raw: &[u8]) {
        match serde_json::from_slice::<Value>(raw) {
            Ok(value) => self.route_value(value).await,
            Err(error) => {
                let text = String::from_utf8_lossy(raw);
                tracing::warn!(
                    generation = self.generation,
                    bytes = raw.len(),
                    error = %error,
                    "malformed frame from helper"
                );
                if let Some(request_id) = request_id_in(&text) {
                    self.correlator
                        .reject(
                            &request_id,
                            AppError::Protocol(format!("malformed response frame: {}", error)),
                        )
                        .await;
                }
            }
        }
    }

    pub async fn route_value(&mut self, value: Value) {
        let request_id = value
            .get("requestId")
            .and_then(Value::as_str)
            .map(str::to_string);

        let frame = match ResponseFrame::decode(value) {
            Ok(frame) => frame,
            Err(error) => {
                tracing::warn!(generation = self.generation, error = %error, "undecodable frame from helper");
                if let Some(request_id) = request_id {
                    self.correlator.reject(&request_id, error).await;
                }
                return;
            }
        };

        match frame {
            ResponseFrame::StreamStart {
                request_id,
                total_chunks,
            } => {
                tracing::debug!(request_id = %request_id, total_chunks, "stream started");
                if !self.correlator.contains(&request_id).await {
                    self.streams.discard(&request_id);
                    self.note_unmatched(&request_id, false);
                    return;
                }
                if let Err(error) = self.streams.start(&request_id, total_chunks) {
                    self.correlator.reject(&request_id, error).await;
                }
            }
            ResponseFrame::StreamChunk {
                request_id,
                chunk_index,
                chunk_data,
            } => {
                if !self.correlator.contains(&request_id).await {
                    self.streams.discard(&request_id);
                    return;
                }
                if let Some(done) = self.streams.chunk(&request_id, chunk_index, chunk_data) {
                    self.deliver(done).await;
                }
            }
            ResponseFrame::StreamEnd { request_id } => {
                if !self.correlator.contains(&request_id).await {
                    self.streams.discard(&request_id);
                    return;
                }
                if let Some(done) = self.streams.end(&request_id) {
                    self.deliver(done).await;
                }
            }
            ResponseFrame::Success {
                request_id: None,
                status,
                ..
            } => {
                tracing::info!(generation = self.generation, status = %status, "helper notice");
            }
            ResponseFrame::Error {
                request_id: None,
                message,
            } => {
                tracing::warn!(generation = self.generation, message = %message, "helper error outside any request");
            }
            ResponseFrame::Success {
                request_id: Some(request_id),
                body,
                ..
            } => {
                let settled = self.correlator.resolve(&request_id, body).await;
                self.note_unmatched(&request_id, settled);
            }
            ResponseFrame::Error {
                request_id: Some(request_id),
                message,
            } => {
                let settled = self.correlator.reject(&request_id, AppError::Helper(message)).await;
                self.note_unmatched(&request_id, settled);
            }
        }
    }

    async fn deliver(&mut self, done: Reassembled) {
        let Reassembled { request_id, result } = done;
        let value = match result {
            Ok(value) => value,
            Err(error) => {
                tracing::warn!(request_id = %request_id, error = %error, "streamed response unusable");
                self.correlator.reject(&request_id, error).await;
                return;
            }
        };
        tracing::debug!(request_id = %request_id, "stream reassembled");

        let settled = match ResponseFrame::decode(value) {
            Ok(ResponseFrame::Success { body, .. }) => self.correlator.resolve(&request_id, body).await,
            Ok(ResponseFrame::Error { message, .. }) => {
                self.correlator.reject(&request_id, AppError::Helper(message)).await
            }
            Ok(_) => {
                self.correlator
                    .reject(
                        &request_id,
                        AppError::Protocol("streamed response is itself a stream control frame".to_string()),
                    )
                    .await
            }
            Err(error) => self.correlator.reject(&request_id, error).await,
        };
        self.note_unmatched(&request_id, settled);
    }

    fn note_unmatched(&self, request_id: &str, settled: bool) {
        if !settled {
            tracing::debug!(
                generation = self.generation,
                request_id = %request_id,
                "response for unknown or already settled request dropped"
            );
        }
    }
}

fn request_id_in(text: &str) -> Option<String> {
    REQUEST_ID_RE
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}
