//! Server-Sent Events framing, shared by the live event feed and the chat stream.
//!
//! Bytes arrive in arbitrary chunks: a line (or a UTF-8 sequence) may be split
//! across two reads, so partial input stays buffered until its newline shows up.
//! A frame is dispatched on the blank line that terminates it.
use tracing::warn;

/// A single line may not grow past this without a newline.
pub const MAX_PENDING_BYTES: usize = 1024 * 1024;

// ── Frame ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    /// Value of the `event:` field, if the server named the frame
    pub event: Option<String>,
    /// All `data:` lines of the frame joined with '\n'
    pub data: String,
}

impl SseFrame {
    /// OpenAI-style terminator (`data: [DONE]`), accepted on the chat stream.
    pub fn is_done_marker(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

// ── Decoder ───────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct SseDecoder {
    pending: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes, returning every frame it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.pending.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(newline) = self.pending.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=newline).collect();
            line.pop();
            if line.ends_with(b"\r") {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line).into_owned();
            if let Some(frame) = self.take_line(&line) {
                frames.push(frame);
            }
        }

        if self.pending.len() > MAX_PENDING_BYTES {
            warn!(size = self.pending.len(), "sse line exceeds buffer limit, dropping it");
            self.pending.clear();
        }

        frames
    }

    /// Flush whatever the stream left behind when it closed without a final blank line.
    pub fn finish(&mut self) -> Option<SseFrame> {
        if !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            let line = String::from_utf8_lossy(&rest).into_owned();
            self.take_line(line.trim_end_matches('\r'));
        }
        self.dispatch()
    }

    fn take_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        // Comment / keep-alive
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            // id / retry carry nothing we act on
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseFrame { event, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decodes_named_frame() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(b"event: message\ndata: {\"a\":1}\n\n");
        assert_eq!(
            frames,
            vec![SseFrame {
                event: Some("message".to_string()),
                data: "{\"a\":1}".to_string(),
            }]
        );
    }

    #[test]
    fn test_frame_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: {\"chan").is_empty());
        assert!(decoder.push(b"nel\":\"x\"}\r\n").is_empty());
        let frames = decoder.push(b"\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "{\"channel\":\"x\"}");
        assert_eq!(frames[0].event, None);
    }

    #[test]
    fn test_utf8_split_mid_codepoint() {
        let text = "data: héllo\n\n".as_bytes();
        // 'é' is two bytes; cut between them
        let cut = text.iter().position(|b| *b == 0xc3).unwrap() + 1;
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(&text[..cut]).is_empty());
        let frames = decoder.push(&text[cut..]);
        assert_eq!(frames[0].data, "héllo");
    }

    #[test]
    fn test_multiline_data_and_comments() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(b": keep-alive\n\ndata: one\ndata: two\nid: 7\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "one\ntwo");
    }

    #[test]
    fn test_event_without_data_is_not_dispatched() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"event: ping\n\n").is_empty());
        // The dangling event name must not leak into the next frame
        let frames = decoder.push(b"data: x\n\n");
        assert_eq!(frames[0].event, None);
    }

    #[test]
    fn test_finish_flushes_unterminated_frame() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: [DONE]").is_empty());
        let frame = decoder.finish().unwrap();
        assert!(frame.is_done_marker());
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn test_oversized_line_is_dropped_and_decoder_recovers() {
        let mut decoder = SseDecoder::new();
        let huge = vec![b'x'; MAX_PENDING_BYTES + 1];
        assert!(decoder.push(&huge).is_empty());
        let frames = decoder.push(b"\ndata: ok\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "ok");
    }
}
