//! Buffered streaming decoder for newline-delimited JSON streams.
//!
//! Handles the case where JSON objects are split across TCP chunk boundaries,
//! which is a common issue with Ollama's streaming API.

use serde_json::Value;

use crate::output_parser::streaming::auto_complete_json;

/// Buffered decoder for newline-delimited JSON streams (NDJSON).
///
/// Accumulates raw bytes, splits on newline boundaries, and yields
/// complete JSON lines. Handles the common case where a single JSON
/// object is split across multiple network chunks.
///
/// # Example
///
/// ```
/// use news_digest::StreamingDecoder;
///
/// let mut decoder = StreamingDecoder::new();
///
/// // First chunk: partial JSON
/// let values = decoder.decode(b"{\"response\":");
/// assert!(values.is_empty());
///
/// // Second chunk: completes the line
/// let values = decoder.decode(b"\"hello\"}\n");
/// assert_eq!(values.len(), 1);
/// assert_eq!(values[0]["response"], "hello");
/// ```
pub struct StreamingDecoder {
    buffer: String,
}

impl StreamingDecoder {
    /// Create a new empty decoder.
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
        }
    }

    /// Feed a raw chunk into the decoder and return any complete JSON lines.
    ///
    /// Each returned value is a parsed JSON `Value` from one complete line.
    /// Incomplete lines are buffered until the next chunk arrives.
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<Value> {
        let text = String::from_utf8_lossy(chunk);
        self.buffer.push_str(&text);

        let mut values = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Ok(val) = serde_json::from_str::<Value>(line) {
                values.push(val);
            }
        }

        values
    }

    /// Flush remaining buffer content, attempting to parse it as JSON.
    ///
    /// Call this after the stream ends to handle any trailing data
    /// not terminated by a newline. If direct parsing fails, attempts
    /// auto-completion of truncated JSON (closing unclosed strings,
    /// brackets, and braces).
    pub fn flush(&mut self) -> Option<Value> {
        let remaining = self.buffer.trim().to_string();
        self.buffer.clear();
        if remaining.is_empty() {
            return None;
        }
        // Try direct parse first
        if let Ok(val) = serde_json::from_str::<Value>(&remaining) {
            return Some(val);
        }
        // Try auto-completing truncated JSON
        if let Some(completed) = auto_complete_json(&remaining) {
            return serde_json::from_str::<Value>(&completed).ok();
        }
        None
    }
}

impl Default for StreamingDecoder {
    fn default() -> Self {
        Self::new()
    }
}
