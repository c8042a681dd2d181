//! SSE framing
//!
//! Every line of a multi-line payload gets its own `data:` prefix. Without
//! that, a newline inside sandbox output would break the event boundary
//! and let the sandboxed code forge SSE events of its own. Terminal
//! `done`/`error` payloads are single-line by construction: embedded
//! newlines are replaced before framing.

use bytes::Bytes;

/// Frames one output stream as SSE events, enforcing the same byte cap as
/// the non-streaming capture. Bytes past the cap are silently dropped.
pub struct SseFramer {
    event: &'static str,
    written: usize,
    limit: usize,
}

impl SseFramer {
    pub fn new(event: &'static str, limit: usize) -> Self {
        Self {
            event,
            written: 0,
            limit,
        }
    }

    /// Frame a chunk, or `None` once the stream's byte budget is spent.
    pub fn frame(&mut self, data: &[u8]) -> Option<Bytes> {
        if data.is_empty() || self.written >= self.limit {
            return None;
        }
        let take = data.len().min(self.limit - self.written);
        self.written += take;

        let text = String::from_utf8_lossy(&data[..take]);
        let mut frame = String::with_capacity(text.len() + 32);
        frame.push_str("event: ");
        frame.push_str(self.event);
        frame.push('\n');
        for line in text.split('\n') {
            frame.push_str("data: ");
            frame.push_str(line);
            frame.push('\n');
        }
        frame.push('\n');
        Some(Bytes::from(frame))
    }
}

/// Completion event carrying the result summary as JSON.
pub fn done_frame(payload: &str) -> Bytes {
    Bytes::from(format!("event: done\ndata: {}\n\n", sanitize(payload)))
}

/// Terminal error event.
pub fn error_frame(message: &str) -> Bytes {
    Bytes::from(format!("event: error\ndata: {}\n\n", sanitize(message)))
}

/// Strip newlines so a payload can never span event boundaries.
fn sanitize(s: &str) -> String {
    s.replace(['\n', '\r'], " ")
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal SSE parser: returns (event, joined-data) pairs.
    fn parse_events(raw: &str) -> Vec<(String, String)> {
        raw.split("\n\n")
            .filter(|block| !block.is_empty())
            .map(|block| {
                let mut event = String::new();
                let mut data: Vec<&str> = Vec::new();
                for line in block.split('\n') {
                    if let Some(rest) = line.strip_prefix("event: ") {
                        event = rest.to_string();
                    } else if let Some(rest) = line.strip_prefix("data: ") {
                        data.push(rest);
                    }
                }
                (event, data.join("\n"))
            })
            .collect()
    }

    #[test]
    fn test_single_line_frame() {
        let mut framer = SseFramer::new("stdout", 1024);
        let frame = framer.frame(b"hello").unwrap();
        assert_eq!(&frame[..], b"event: stdout\ndata: hello\n\n");
    }

    #[test]
    fn test_multiline_payload_gets_data_prefix_per_line() {
        let mut framer = SseFramer::new("stdout", 1024);
        let frame = framer.frame(b"a\nb\nc").unwrap();
        let events = parse_events(std::str::from_utf8(&frame).unwrap());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "stdout");
        assert_eq!(events[0].1, "a\nb\nc");
    }

    /// The forged-event scenario: output containing an SSE-shaped payload
    /// must round-trip as data, not parse as a new event.
    #[test]
    fn test_output_cannot_forge_events() {
        let hostile = "x\nevent: fake\ndata: y";
        let mut framer = SseFramer::new("stdout", 1024);
        let frame = framer.frame(hostile.as_bytes()).unwrap();

        let events = parse_events(std::str::from_utf8(&frame).unwrap());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "stdout");
        assert_eq!(events[0].1, hostile);
    }

    #[test]
    fn test_concatenated_data_equals_input_across_chunks() {
        let chunks: &[&[u8]] = &[b"first\nsecond", b" continues", b"\ntail\n"];
        let mut framer = SseFramer::new("stdout", 1024);
        let mut raw = String::new();
        for chunk in chunks {
            raw.push_str(std::str::from_utf8(&framer.frame(chunk).unwrap()).unwrap());
        }

        let events = parse_events(&raw);
        let reassembled: String = events.iter().map(|(_, d)| d.as_str()).collect();
        let original: String = chunks
            .iter()
            .map(|c| std::str::from_utf8(c).unwrap())
            .collect();
        assert_eq!(reassembled, original);
    }

    #[test]
    fn test_byte_limit_drops_silently() {
        let mut framer = SseFramer::new("stderr", 8);
        assert!(framer.frame(b"12345678").is_some());
        assert!(framer.frame(b"more").is_none());
    }

    #[test]
    fn test_limit_truncates_mid_chunk() {
        let mut framer = SseFramer::new("stdout", 4);
        let frame = framer.frame(b"123456").unwrap();
        let events = parse_events(std::str::from_utf8(&frame).unwrap());
        assert_eq!(events[0].1, "1234");
    }

    #[test]
    fn test_done_and_error_frames_are_single_line() {
        let done = done_frame("{\"id\":\"x\"}\ninjected");
        let text = std::str::from_utf8(&done).unwrap();
        let events = parse_events(text);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "done");
        assert!(!events[0].1.contains('\n'));

        let err = error_frame("boom\r\nevent: fake");
        let events = parse_events(std::str::from_utf8(&err).unwrap());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "error");
    }
}
