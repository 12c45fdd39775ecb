//! Server-Sent Events parsing as a pure, allocation-light state machine.
//!
//! Deliberately not built on `eventsource-stream`: that crate wraps a
//! `Stream` combinator, but the Streaming Engine needs a value type it can
//! `feed` arbitrary byte chunks into and query independently of how those
//! chunks were read off the wire (a `reqwest::Response::bytes_stream`, a
//! test fixture split at arbitrary boundaries, whatever). `feed`/`finalize`
//! make that boundary explicit.
//!
//! Chunk boundaries are never assumed to land on UTF-8 code-point
//! boundaries, only on a bare `\n` byte — `SseParser` buffers undecodable
//! trailing bytes until more input arrives rather than ever calling
//! `str::from_utf8` on a chunk that might split a multi-byte character.

use serde_json::Value;

/// One decoded SSE event.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub event_type: Option<String>,
    pub id: Option<String>,
    pub payload: SsePayload,
}

/// The payload shapes the Streaming Engine cares about: a JSON data frame,
/// the literal `[DONE]` sentinel some Google endpoints emit to mark
/// end-of-stream, or a `data:` body that failed to decode as JSON.
/// `[DONE]` is a state transition, not a data event, and is never handed to
/// a subscriber as one. `Invalid` is likewise never handed to a subscriber
/// as data — the Streaming Engine turns it into a warning and drops it,
/// per the "decode failures skip the event, not abort the stream" rule.
#[derive(Debug, Clone, PartialEq)]
pub enum SsePayload {
    Data(Value),
    Done,
    Invalid(String),
}

#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    pending_event_type: Option<String>,
    pending_id: Option<String>,
    pending_data: String,
    saw_any_field: bool,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes, as read off the wire, and return any complete
    /// events it completed. Incomplete trailing data (a partial line, or a
    /// partial UTF-8 code point) is retained for the next call.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        loop {
            let Some(newline_pos) = self.buffer.iter().position(|&b| b == b'\n') else {
                break;
            };

            let mut line_bytes = self.buffer.drain(..=newline_pos).collect::<Vec<u8>>();
            line_bytes.pop(); // drop the '\n'
            if line_bytes.last() == Some(&b'\r') {
                line_bytes.pop();
            }

            let line = match std::str::from_utf8(&line_bytes) {
                Ok(s) => s.to_string(),
                Err(_) => {
                    // A multi-byte codepoint was split across chunks at
                    // exactly the newline boundary. Put the line back ahead
                    // of the buffer and wait for more bytes.
                    let mut restored = line_bytes;
                    restored.push(b'\n');
                    restored.extend_from_slice(&self.buffer);
                    self.buffer = restored;
                    break;
                }
            };

            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }

        events
    }

    /// Flush whatever is buffered when the underlying stream ends without a
    /// trailing blank line. A dangling `data:` line with no terminating
    /// blank line still dispatches as an event; a dangling partial line with
    /// no field prefix is discarded.
    pub fn finalize(&mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if !self.buffer.is_empty() {
            if let Ok(line) = std::str::from_utf8(&self.buffer) {
                let line = line.to_string();
                self.buffer.clear();
                if let Some(event) = self.process_line(&line) {
                    events.push(event);
                }
            } else {
                self.buffer.clear();
            }
        }
        if let Some(event) = self.dispatch() {
            events.push(event);
        }
        events
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if let Some(rest) = line.strip_prefix("data:") {
            let value = rest.strip_prefix(' ').unwrap_or(rest);
            if !self.pending_data.is_empty() {
                self.pending_data.push('\n');
            }
            self.pending_data.push_str(value);
            self.saw_any_field = true;
        } else if let Some(rest) = line.strip_prefix("event:") {
            self.pending_event_type = Some(rest.strip_prefix(' ').unwrap_or(rest).to_string());
            self.saw_any_field = true;
        } else if let Some(rest) = line.strip_prefix("id:") {
            self.pending_id = Some(rest.strip_prefix(' ').unwrap_or(rest).to_string());
            self.saw_any_field = true;
        }
        // Comment lines (leading ':') and unrecognized fields are ignored.
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if !self.saw_any_field {
            return None;
        }
        let event_type = self.pending_event_type.take();
        let id = self.pending_id.take();
        let data = std::mem::take(&mut self.pending_data);
        self.saw_any_field = false;

        if data.trim() == "[DONE]" {
            return Some(SseEvent {
                event_type,
                id,
                payload: SsePayload::Done,
            });
        }

        match serde_json::from_str::<Value>(&data) {
            Ok(value) => Some(SseEvent {
                event_type,
                id,
                payload: SsePayload::Data(value),
            }),
            Err(_) if data.is_empty() => None,
            Err(_) => Some(SseEvent {
                event_type,
                id,
                payload: SsePayload::Invalid(data),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn single_event_in_one_chunk() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"data: {\"text\":\"hi\"}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload, SsePayload::Data(json!({"text": "hi"})));
    }

    #[test]
    fn event_split_across_chunks_byte_by_byte() {
        let mut parser = SseParser::new();
        let mut all = Vec::new();
        for byte in b"data: {\"text\":\"hi\"}\n\n" {
            all.extend(parser.feed(&[*byte]));
        }
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].payload, SsePayload::Data(json!({"text": "hi"})));
    }

    #[test]
    fn multi_byte_utf8_split_across_chunks() {
        let mut parser = SseParser::new();
        let line = "data: {\"text\":\"caf\u{00e9}\"}\n\n".as_bytes().to_vec();
        let mid = line.len() / 2;
        let mut all = parser.feed(&line[..mid]);
        all.extend(parser.feed(&line[mid..]));
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].payload, SsePayload::Data(json!({"text": "caf\u{00e9}"})));
    }

    #[test]
    fn done_sentinel_alone_yields_no_data_event() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"data: [DONE]\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload, SsePayload::Done);
    }

    #[test]
    fn empty_feed_is_a_no_op() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"").is_empty());
    }

    #[test]
    fn finalize_flushes_dangling_data_without_trailing_blank_line() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"data: {\"text\":\"partial\"}\n");
        assert!(events.is_empty());
        let flushed = parser.finalize();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].payload, SsePayload::Data(json!({"text": "partial"})));
    }

    #[test]
    fn multiline_data_joins_with_newline() {
        // A pretty-printed JSON object split across two `data:` lines joins
        // into one valid document: whitespace (including the inserted `\n`)
        // is insignificant between JSON tokens.
        let mut parser = SseParser::new();
        let events = parser.feed(b"data: {\"a\":\ndata: 1}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload, SsePayload::Data(json!({"a": 1})));
    }

    #[test]
    fn malformed_json_data_is_reported_invalid_not_aborted() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"data: not json\n\ndata: {\"ok\":true}\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0].payload,
            SsePayload::Invalid("not json".to_string())
        );
        assert_eq!(events[1].payload, SsePayload::Data(json!({"ok": true})));
    }

    #[test]
    fn event_and_id_fields_are_captured() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"event: message\nid: 42\ndata: {\"ok\":true}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type.as_deref(), Some("message"));
        assert_eq!(events[0].id.as_deref(), Some("42"));
    }

    #[test]
    fn chunk_boundary_within_data_prefix_still_parses() {
        let mut parser = SseParser::new();
        let mut all = parser.feed(b"da");
        all.extend(parser.feed(b"ta: {\"text\":\"hi\"}\n\n"));
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].payload, SsePayload::Data(json!({"text": "hi"})));
    }

    #[test]
    fn reassembly_is_invariant_to_chunk_partitioning() {
        let full = b"data: {\"a\":1}\n\ndata: {\"b\":2}\n\n".to_vec();

        let mut whole_parser = SseParser::new();
        let mut whole = whole_parser.feed(&full);
        whole.extend(whole_parser.finalize());

        let mut byte_parser = SseParser::new();
        let mut byte_wise = Vec::new();
        for byte in &full {
            byte_wise.extend(byte_parser.feed(&[*byte]));
        }
        byte_wise.extend(byte_parser.finalize());

        assert_eq!(whole, byte_wise);
        assert_eq!(whole.len(), 2);
    }
}
