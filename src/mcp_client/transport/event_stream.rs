//! Server-Sent Events decoding shared by the HTTP transports.
//!
//! Bytes arrive in arbitrary chunks; lines are only decoded once complete so
//! multi-byte characters split across chunks survive.

use std::ops::ControlFlow;

use futures::StreamExt;

/// One dispatched SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event type; `message` when the server sent no `event:` field.
    pub event: String,
    /// `data:` lines joined with `\n`.
    pub data: String,
    /// Last event ID seen on the stream.
    pub id: Option<String>,
}

/// Incremental SSE line parser.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    last_id: Option<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes; returns every event completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Flush at end of stream. A trailing event without a blank line is still dispatched.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest);
            let line = line.trim_end_matches('\r').to_string();
            if let Some(event) = self.process_line(&line) {
                return Some(event);
            }
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
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
            "id" => self.last_id = Some(value.to_string()),
            // `retry` and unknown fields are ignored
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() {
            self.event = None;
            return None;
        }
        Some(SseEvent {
            event: self.event.take().unwrap_or_else(|| "message".to_string()),
            data: std::mem::take(&mut self.data).join("\n"),
            id: self.last_id.clone(),
        })
    }
}

/// Drive an HTTP response body through the parser, handing each event to
/// `on_event` until the stream ends or the callback breaks.
pub async fn pump_events<F>(response: reqwest::Response, mut on_event: F) -> Result<(), String>
where
    F: FnMut(SseEvent) -> ControlFlow<()>,
{
    let mut parser = SseParser::new();
    let mut body = response.bytes_stream();

    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| format!("event stream read failed: {e}"))?;
        for event in parser.feed(&chunk) {
            if on_event(event).is_break() {
                return Ok(());
            }
        }
    }

    if let Some(event) = parser.finish() {
        let _ = on_event(event);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_event() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"event: endpoint\ndata: /messages?sid=1\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "endpoint");
        assert_eq!(events[0].data, "/messages?sid=1");
    }

    #[test]
    fn test_default_event_type_is_message() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"data: {\"jsonrpc\":\"2.0\"}\n\n");
        assert_eq!(events[0].event, "message");
    }

    #[test]
    fn test_chunk_boundaries() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"event: mess").is_empty());
        assert!(parser.feed(b"age\ndata: hel").is_empty());
        let events = parser.feed(b"lo\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "hello");
    }

    #[test]
    fn test_multibyte_split_across_chunks() {
        let text = "data: héllo\n\n".as_bytes();
        // split inside the two-byte 'é'
        let split = text.iter().position(|b| *b == 0xC3).unwrap() + 1;
        let mut parser = SseParser::new();
        assert!(parser.feed(&text[..split]).is_empty());
        let events = parser.feed(&text[split..]);
        assert_eq!(events[0].data, "héllo");
    }

    #[test]
    fn test_crlf_comments_and_multiline_data() {
        let mut parser = SseParser::new();
        let events = parser.feed(b": keepalive\r\nid: 7\r\ndata: a\r\ndata: b\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "a\nb");
        assert_eq!(events[0].id.as_deref(), Some("7"));
    }

    #[test]
    fn test_event_without_data_is_dropped() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"event: ping\n\n").is_empty());
        // the dropped event type must not leak into the next event
        let events = parser.feed(b"data: x\n\n");
        assert_eq!(events[0].event, "message");
    }

    #[test]
    fn test_finish_flushes_trailing_event() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"data: tail").is_empty());
        let event = parser.finish().unwrap();
        assert_eq!(event.data, "tail");
        assert!(parser.finish().is_none());
    }
}
