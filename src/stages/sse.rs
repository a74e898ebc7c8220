//! SSE (Server-Sent Events) stream codec.
//!
//! Decodes raw byte chunks into [`SseFrame`]s, handling the `data: ` prefix,
//! `event:` names (Anthropic-style), `[DONE]` termination, line buffering
//! across TCP chunk boundaries, and empty keep-alive lines. The encoder side
//! is [`SseFrame::to_wire`].

use crate::payload::SseFrame;

/// Incremental SSE decoder.
///
/// Feed raw bytes with [`decode`](SseDecoder::decode); complete frames come
/// out as they are terminated by newlines. A trailing partial line survives
/// in the buffer until the next chunk or [`flush`](SseDecoder::flush).
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
    pending_event: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes and return any frames completed by this chunk.
    ///
    /// `event:` lines attach to the next `data:` line. Empty keep-alive
    /// lines and comment lines are ignored. The `[DONE]` terminator is
    /// returned as a frame (callers check [`SseFrame::is_done`]).
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        let text = String::from_utf8_lossy(chunk);
        self.buffer.push_str(&text);

        let mut frames = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim();

            if line.is_empty() || line.starts_with(':') {
                continue;
            }

            if let Some(name) = line
                .strip_prefix("event: ")
                .or_else(|| line.strip_prefix("event:"))
            {
                self.pending_event = Some(name.trim().to_string());
                continue;
            }

            if let Some(data) = line
                .strip_prefix("data: ")
                .or_else(|| line.strip_prefix("data:"))
            {
                frames.push(SseFrame {
                    event: self.pending_event.take(),
                    data: data.trim().to_string(),
                });
            }
        }

        frames
    }

    /// Drain any complete frames left in the buffer (stream ended without a
    /// trailing newline).
    pub fn flush(&mut self) -> Vec<SseFrame> {
        let remaining = std::mem::take(&mut self.buffer);
        let remaining = remaining.trim();
        if remaining.is_empty() {
            return Vec::new();
        }

        let mut frames = Vec::new();
        for line in remaining.lines() {
            let line = line.trim();
            if let Some(name) = line
                .strip_prefix("event: ")
                .or_else(|| line.strip_prefix("event:"))
            {
                self.pending_event = Some(name.trim().to_string());
                continue;
            }
            if let Some(data) = line
                .strip_prefix("data: ")
                .or_else(|| line.strip_prefix("data:"))
            {
                frames.push(SseFrame {
                    event: self.pending_event.take(),
                    data: data.trim().to_string(),
                });
            }
        }
        frames
    }
}
