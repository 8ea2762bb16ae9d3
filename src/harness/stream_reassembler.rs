use crate::errors::{AppError, AppResult};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Upper bound on `total_chunks` accepted from a `stream_start`.
pub const DEFAULT_MAX_STREAM_CHUNKS: usize = 4096;

/// Chunks are stored as they arrive; nothing is sized from `total` up front.
#[derive(Debug)]
struct StreamBuffer {
    total: usize,
    chunks: BTreeMap<usize, String>,
    completed: bool,
}

impl StreamBuffer {
    fn new(total: usize) -> Self {
        Self {
            total,
            chunks: BTreeMap::new(),
            completed: false,
        }
    }

    fn received(&self) -> usize {
        self.chunks.len()
    }

    fn is_full(&self) -> bool {
        self.received() == self.total
    }
}

/// A stream that has been put back together. `result` is the parsed payload
/// or a protocol error when the concatenated chunks are not valid JSON.
#[derive(Debug)]
pub struct Reassembled {
    pub request_id: String,
    pub result: AppResult<Value>,
}

/// Buffers `stream_chunk` frames per request id and rebuilds the original
/// oversized response once every index has arrived.
#[derive(Debug)]
pub struct StreamReassembler {
    streams: HashMap<String, StreamBuffer>,
    max_chunks: usize,
}

impl Default for StreamReassembler {
    fn default() -> Self {
        Self::with_max_chunks(DEFAULT_MAX_STREAM_CHUNKS)
    }
}

impl StreamReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_chunks(max_chunks: usize) -> Self {
        Self {
            streams: HashMap::new(),
            max_chunks,
        }
    }

    /// Opens (or reopens) a stream. A repeated start replaces the old buffer.
    pub fn start(&mut self, request_id: &str, total_chunks: usize) -> AppResult<()> {
        if total_chunks == 0 || total_chunks > self.max_chunks {
            self.streams.remove(request_id);
            return Err(AppError::Protocol(format!(
                "stream for {} declared {} chunks (allowed 1..={})",
                request_id, total_chunks, self.max_chunks
            )));
        }
        if self
            .streams
            .insert(request_id.to_string(), StreamBuffer::new(total_chunks))
            .is_some()
        {
            tracing::warn!(request_id = %request_id, "stream restarted before completion");
        }
        Ok(())
    }

    /// Stores one chunk. Chunks are placed by index, so arrival order does not
    /// matter; the stream completes as soon as the last distinct index lands.
    pub fn chunk(&mut self, request_id: &str, chunk_index: usize, chunk_data: String) -> Option<Reassembled> {
        let Some(buffer) = self.streams.get_mut(request_id) else {
            tracing::debug!(request_id = %request_id, chunk_index, "chunk for unknown stream ignored");
            return None;
        };
        if buffer.completed {
            return None;
        }

        let total = buffer.total;
        if chunk_index >= total {
            tracing::warn!(request_id = %request_id, chunk_index, total, "chunk index out of range ignored");
            return None;
        }
        if buffer.chunks.contains_key(&chunk_index) {
            tracing::debug!(request_id = %request_id, chunk_index, "duplicate chunk ignored");
            return None;
        }

        buffer.chunks.insert(chunk_index, chunk_data);
        if buffer.is_full() {
            return self.reassemble(request_id);
        }
        None
    }

    pub fn end(&mut self, request_id: &str) -> Option<Reassembled> {
        let buffer = self.streams.get(request_id)?;
        if buffer.completed {
            return None;
        }
        if !buffer.is_full() {
            tracing::warn!(
                request_id = %request_id,
                received = buffer.received(),
                total = buffer.total,
                "stream ended with missing chunks"
            );
            return None;
        }
        self.reassemble(request_id)
    }

    /// Drops a partial stream. Returns whether one existed.
    pub fn discard(&mut self, request_id: &str) -> bool {
        self.streams.remove(request_id).is_some()
    }

    /// Keeps only streams whose id satisfies `keep`; returns how many went.
    pub fn retain<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(&str) -> bool,
    {
        let before = self.streams.len();
        self.streams.retain(|request_id, _| keep(request_id));
        before - self.streams.len()
    }

    pub fn stream_ids(&self) -> Vec<String> {
        self.streams.keys().cloned().collect()
    }

    pub fn active_streams(&self) -> usize {
        self.streams.len()
    }

    fn reassemble(&mut self, request_id: &str) -> Option<Reassembled> {
        let buffer = self.streams.get_mut(request_id)?;
        if buffer.completed {
            return None;
        }
        buffer.completed = true;

        let total = buffer.total;
        let joined = buffer.chunks.values().map(String::as_str).collect::<String>();
        self.streams.remove(request_id);

        let result = serde_json::from_str::<Value>(&joined).map_err(|error| {
            AppError::Protocol(format!(
                "failed to parse {}-chunk streamed response: {}",
                total, error
            ))
        });
        Some(Reassembled {
            request_id: request_id.to_string(),
            result,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::StreamReassembler;
    use crate::errors::AppError;
    use serde_json::json;

    const PAYLOAD: &str = r#"{"status":"ok","requestId":"r-1","data":"done"}"#;

    fn pieces() -> Vec<String> {
        vec![
            PAYLOAD[..12].to_string(),
            PAYLOAD[12..30].to_string(),
            PAYLOAD[30..].to_string(),
        ]
    }

    #[test]
    fn every_arrival_order_yields_the_same_value() {
        let orders = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];
        for order in orders {
            let mut reassembler = StreamReassembler::new();
            reassembler.start("r-1", 3).expect("start");
            let chunks = pieces();
            let mut completed = None;
            for index in order {
                if let Some(done) = reassembler.chunk("r-1", index, chunks[index].clone()) {
                    assert!(completed.is_none(), "completed twice for {:?}", order);
                    completed = Some(done);
                }
            }
            let done = completed.expect("reassembled");
            assert_eq!(done.request_id, "r-1");
            assert_eq!(
                done.result.expect("parsed"),
                json!({ "status": "ok", "requestId": "r-1", "data": "done" })
            );
            assert!(reassembler.end("r-1").is_none());
            assert_eq!(reassembler.active_streams(), 0);
        }
    }

    #[test]
    fn single_chunk_stream_goes_through_reassembly() {
        let mut reassembler = StreamReassembler::new();
        reassembler.start("r-1", 1).expect("start");
        let done = reassembler
            .chunk("r-1", 0, PAYLOAD.to_string())
            .expect("reassembled");
        assert!(done.result.is_ok());
    }

    #[test]
    fn unknown_and_completed_streams_ignore_frames() {
        let mut reassembler = StreamReassembler::new();
        assert!(reassembler.chunk("missing", 0, "x".to_string()).is_none());
        assert!(reassembler.end("missing").is_none());

        reassembler.start("r-1", 1).expect("start");
        assert!(reassembler.chunk("r-1", 0, PAYLOAD.to_string()).is_some());
        assert!(reassembler.chunk("r-1", 0, PAYLOAD.to_string()).is_none());
        assert!(reassembler.end("r-1").is_none());
    }

    #[test]
    fn duplicate_index_is_counted_once() {
        let mut reassembler = StreamReassembler::new();
        reassembler.start("r-1", 2).expect("start");
        assert!(reassembler.chunk("r-1", 0, PAYLOAD[..10].to_string()).is_none());
        assert!(reassembler.chunk("r-1", 0, "garbage".to_string()).is_none());
        assert!(reassembler.end("r-1").is_none());
        let done = reassembler
            .chunk("r-1", 1, PAYLOAD[10..].to_string())
            .expect("reassembled");
        assert!(done.result.is_ok());
    }

    #[test]
    fn out_of_range_index_is_ignored() {
        let mut reassembler = StreamReassembler::new();
        reassembler.start("r-1", 1).expect("start");
        assert!(reassembler.chunk("r-1", 4, "{}".to_string()).is_none());
        assert_eq!(reassembler.active_streams(), 1);
    }

    #[test]
    fn invalid_json_is_reported_as_protocol_error() {
        let mut reassembler = StreamReassembler::new();
        reassembler.start("r-1", 2).expect("start");
        reassembler.chunk("r-1", 0, "{\"status\":".to_string());
        let done = reassembler
            .chunk("r-1", 1, "oops".to_string())
            .expect("reassembled");
        assert!(matches!(done.result, Err(AppError::Protocol(_))));
        assert_eq!(reassembler.active_streams(), 0);
    }

    #[test]
    fn zero_chunk_stream_is_rejected() {
        let mut reassembler = StreamReassembler::new();
        assert!(reassembler.start("r-1", 0).is_err());
        assert_eq!(reassembler.active_streams(), 0);
    }

    #[test]
    fn oversized_chunk_count_is_refused_without_allocating() {
        let mut reassembler = StreamReassembler::with_max_chunks(8);
        let err = reassembler.start("r-1", usize::MAX).expect_err("too many chunks");
        assert!(matches!(err, AppError::Protocol(_)));
        assert_eq!(reassembler.active_streams(), 0);
        assert!(reassembler.start("r-2", 8).is_ok());
    }

    #[test]
    fn retain_drops_streams_of_settled_requests() {
        let mut reassembler = StreamReassembler::new();
        reassembler.start("keep", 2).expect("keep");
        reassembler.start("gone", 2).expect("gone");
        assert_eq!(reassembler.retain(|id| id == "keep"), 1);
        assert_eq!(reassembler.stream_ids(), vec!["keep".to_string()]);
        assert!(reassembler.discard("keep"));
        assert!(!reassembler.discard("keep"));
    }

    #[test]
    fn restart_replaces_partial_stream() {
        let mut reassembler = StreamReassembler::new();
        reassembler.start("r-1", 2).expect("start");
        reassembler.chunk("r-1", 0, "stale".to_string());
        reassembler.start("r-1", 1).expect("restart");
        let done = reassembler
            .chunk("r-1", 0, PAYLOAD.to_string())
            .expect("reassembled");
        assert!(done.result.is_ok());
    }
}
