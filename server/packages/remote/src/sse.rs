//! Incremental decoder for server-sent "event block" framing.
//!
//! The remote execution service frames its run output as blocks separated by
//! a blank line, each block carrying one or more `data:` lines. Transport
//! reads can split a block anywhere, so the decoder buffers partial input and
//! only interprets a block once it is complete. Each completed block is
//! decoded exactly once; whatever is still buffered when the stream ends is
//! flushed as a final block.

use serde_json::Value;

/// One decoded payload from the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum SsePayload {
    Json(Value),
    /// Non-JSON data payloads pass through as text.
    Text(String),
    /// The literal `[DONE]` terminator.
    Done,
}

#[derive(Debug, Default)]
pub struct SseBlockDecoder {
    buffer: String,
    done: bool,
}

impl SseBlockDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one transport read. Returns the payloads of every block the read
    /// completed, in order. Everything after a `[DONE]` terminator is ignored.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SsePayload> {
        if self.done {
            return Vec::new();
        }
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut payloads = Vec::new();
        while let Some(boundary) = find_block_boundary(&self.buffer) {
            let rest = self.buffer.split_off(boundary.end);
            let block = self.buffer[..boundary.start].to_string();
            self.buffer = rest;

            if let Some(payload) = decode_block(&block) {
                let is_done = payload == SsePayload::Done;
                payloads.push(payload);
                if is_done {
                    self.done = true;
                    self.buffer.clear();
                    break;
                }
            }
        }
        payloads
    }

    /// Flush the trailing unterminated block at end of stream, if any.
    pub fn finish(&mut self) -> Vec<SsePayload> {
        if self.done {
            return Vec::new();
        }
        let remainder = std::mem::take(&mut self.buffer);
        self.done = true;
        decode_block(&remainder).into_iter().collect()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }
}

struct Boundary {
    start: usize,
    end: usize,
}

fn find_block_boundary(buffer: &str) -> Option<Boundary> {
    let lf = buffer.find("\n\n").map(|index| Boundary {
        start: index,
        end: index + 2,
    });
    let crlf = buffer.find("\r\n\r\n").map(|index| Boundary {
        start: index,
        end: index + 4,
    });
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.start <= b.start { a } else { b }),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

/// Join the `data:` lines of one block and interpret the payload once.
fn decode_block(block: &str) -> Option<SsePayload> {
    let mut data_lines = Vec::new();
    for line in block.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }
    if data_lines.is_empty() {
        return None;
    }

    let payload = data_lines.join("\n");
    if payload.trim() == "[DONE]" {
        return Some(SsePayload::Done);
    }
    match serde_json::from_str::<Value>(&payload) {
        Ok(value) => Some(SsePayload::Json(value)),
        Err(_) => Some(SsePayload::Text(payload)),
    }
}
