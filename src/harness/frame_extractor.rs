//! Incremental extraction of JSON object frames from the helper's stdout.
//!
//! Output arrives in arbitrarily sized reads, so a frame may be split across
//! several pushes and one push may carry several frames. Scanning works on raw
//! bytes: `{`, `}`, `"` and `\` are ASCII and never occur inside a multi-byte
//! UTF-8 sequence, so a read that splits a character is harmless.

pub const DEFAULT_MAX_FRAME_BUFFER_BYTES: usize = 1024 * 1024;
pub const DEFAULT_RETAIN_AFTER_TRIM_BYTES: usize = 100 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSpan {
    /// Offset of the opening `{`.
    pub start: usize,
    /// Offset of the matching `}` (inclusive).
    pub end: usize,
}

/// Finds the first complete JSON object at or after `search_start`.
///
/// Returns `None` when there is no `{` yet or when the object is still open at
/// the end of the buffer; the caller keeps the tail and waits for more input.
/// Braces inside string literals and escaped quotes do not affect depth.
pub fn find_frame_end(buffer: &[u8], search_start: usize) -> Option<FrameSpan> {
    let offset = buffer.get(search_start..)?.iter().position(|byte| *byte == b'{')?;
    let start = search_start + offset;

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (index, byte) in buffer.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if *byte == b'\\' {
                escaped = true;
            } else if *byte == b'"' {
                in_string = false;
            }
            continue;
        }

        match byte {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(FrameSpan { start, end: index });
                }
            }
            _ => {}
        }
    }

    None
}

/// Accumulates helper output and hands back each complete frame.
///
/// The buffer has a soft cap. When the unconsumed tail grows past
/// `max_buffer_bytes` (a frame that never closes, or a desynchronized
/// stream), everything except the newest `retain_bytes` is discarded. This
/// is a lossy safety valve that bounds memory, not a recovery mechanism: any
/// frame overlapping the discarded prefix is lost, and the request it
/// belonged to only settles through its timeout. Dropped byte counts are
/// reported through [`FrameBuffer::consume_overflowed_bytes`].
#[derive(Debug)]
pub struct FrameBuffer {
    buffer: Vec<u8>,
    max_buffer_bytes: Option<usize>,
    retain_bytes: usize,
    overflowed_bytes: usize,
    skipped_bytes: usize,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new(
            Some(DEFAULT_MAX_FRAME_BUFFER_BYTES),
            DEFAULT_RETAIN_AFTER_TRIM_BYTES,
        )
    }
}

impl FrameBuffer {
    pub fn new(max_buffer_bytes: Option<usize>, retain_bytes: usize) -> Self {
        let retain_bytes = match max_buffer_bytes {
            Some(max) => retain_bytes.min(max),
            None => retain_bytes,
        };
        Self {
            buffer: Vec::new(),
            max_buffer_bytes,
            retain_bytes,
            overflowed_bytes: 0,
            skipped_bytes: 0,
        }
    }

    /// Appends `chunk` and returns every frame completed by it, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        let mut consumed = 0usize;
        while let Some(span) = find_frame_end(&self.buffer, consumed) {
            self.skipped_bytes = self
                .skipped_bytes
                .saturating_add(count_non_whitespace(&self.buffer[consumed..span.start]));
            frames.push(self.buffer[span.start..=span.end].to_vec());
            consumed = span.end + 1;
        }
        if consumed > 0 {
            self.buffer.drain(..consumed);
        }

        if let Some(max) = self.max_buffer_bytes {
            if self.buffer.len() > max {
                let excess = self.buffer.len() - self.retain_bytes;
                self.buffer.drain(..excess);
                self.overflowed_bytes = self.overflowed_bytes.saturating_add(excess);
            }
        }

        frames
    }

    /// Bytes discarded by the soft cap since the last call.
    pub fn consume_overflowed_bytes(&mut self) -> usize {
        std::mem::take(&mut self.overflowed_bytes)
    }

    /// Non-whitespace bytes found between frames since the last call.
    pub fn consume_skipped_bytes(&mut self) -> usize {
        std::mem::take(&mut self.skipped_bytes)
    }

    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn flush(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }
}

fn count_non_whitespace(bytes: &[u8]) -> usize {
    bytes.iter().filter(|byte| !byte.is_ascii_whitespace()).count()
}

#[cfg(test)]
mod tests {
    use super::{find_frame_end, FrameBuffer, FrameSpan};

    #[test]
    fn finds_simple_frame_after_leading_noise() {
        let input = b"noise {\"a\":1} tail";
        assert_eq!(find_frame_end(input, 0), Some(FrameSpan { start: 6, end: 12 }));
    }

    #[test]
    fn braces_inside_strings_do_not_close_the_frame() {
        let input = br#"{"msg": "a } b {"}"#;
        let span = find_frame_end(input, 0).expect("frame");
        assert_eq!(span.end, input.len() - 1);
    }

    #[test]
    fn escaped_quote_does_not_end_the_string() {
        let input = br#"{"a":"x\"}y"}"#;
        let span = find_frame_end(input, 0).expect("frame");
        assert_eq!(&input[span.start..=span.end], input.as_slice());
    }

    #[test]
    fn escaped_backslash_before_quote_closes_the_string() {
        let input = br#"{"path":"c:\\"}{"b":2}"#;
        let first = find_frame_end(input, 0).expect("first");
        assert_eq!(&input[first.start..=first.end], br#"{"path":"c:\\"}"#);
        let second = find_frame_end(input, first.end + 1).expect("second");
        assert_eq!(&input[second.start..=second.end], br#"{"b":2}"#);
    }

    #[test]
    fn unbalanced_input_is_not_found() {
        assert_eq!(find_frame_end(br#"{"a":{"b":1}"#, 0), None);
        assert_eq!(find_frame_end(b"no braces here", 0), None);
        assert_eq!(find_frame_end(b"{}", 5), None);
    }

    #[test]
    fn yields_one_frame_regardless_of_split_points() {
        let frame = r#"{"status":"ok","requestId":"r-1","text":"名字 } {\" x"}"#.as_bytes();
        for split in 1..frame.len() {
            let mut buffer = FrameBuffer::default();
            assert!(buffer.push(&frame[..split]).is_empty(), "split at {}", split);
            let frames = buffer.push(&frame[split..]);
            assert_eq!(frames, vec![frame.to_vec()], "split at {}", split);
            assert_eq!(buffer.pending_len(), 0);
        }
    }

    #[test]
    fn byte_by_byte_delivery_yields_each_frame_once() {
        let input = b"{\"a\":1}\n{\"b\":\"}\"}\n{\"c\":";
        let mut buffer = FrameBuffer::default();
        let mut frames = Vec::new();
        for byte in input {
            frames.extend(buffer.push(std::slice::from_ref(byte)));
        }
        assert_eq!(frames, vec![b"{\"a\":1}".to_vec(), b"{\"b\":\"}\"}".to_vec()]);
        assert_eq!(buffer.flush(), b"\n{\"c\":".to_vec());
    }

    #[test]
    fn counts_noise_between_frames() {
        let mut buffer = FrameBuffer::default();
        let frames = buffer.push(b"Traceback junk\n{\"a\":1}");
        assert_eq!(frames.len(), 1);
        assert_eq!(buffer.consume_skipped_bytes(), 13);
        assert_eq!(buffer.consume_skipped_bytes(), 0);
    }

    #[test]
    fn trims_oldest_bytes_past_soft_cap() {
        let mut buffer = FrameBuffer::new(Some(8), 4);
        assert!(buffer.push(b"{\"abcdefgh").is_empty());
        assert_eq!(buffer.consume_overflowed_bytes(), 6);
        assert_eq!(buffer.flush(), b"efgh".to_vec());
    }
}
