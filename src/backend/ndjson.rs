//! Incremental decoder for newline-delimited JSON bodies.

use serde_json::Value;

/// Splits a byte stream into JSON values, one per line.
///
/// Bytes are buffered until a newline arrives, so a multi-byte UTF-8
/// sequence or a JSON object split across network chunks is reassembled
/// before parsing. Lines that are not valid JSON are logged and dropped.
#[derive(Debug, Default)]
pub(crate) struct NdjsonDecoder {
    buffer: Vec<u8>,
}

impl NdjsonDecoder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every value whose line is now complete.
    pub(crate) fn decode(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.buffer.extend_from_slice(chunk);
        let mut values = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(value) = parse_line(&line) {
                values.push(value);
            }
        }
        values
    }

    /// Parse whatever remains after the body ends without a trailing newline.
    pub(crate) fn flush(&mut self) -> Option<Value> {
        let rest = std::mem::take(&mut self.buffer);
        parse_line(&rest)
    }
}

fn parse_line(line: &[u8]) -> Option<Value> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    match serde_json::from_str(text) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(error = %err, "dropping malformed NDJSON line");
            None
        }
    }
}
