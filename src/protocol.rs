//! Wire protocol for the relay link.
//!
//! Messages are JSON objects, one per line, newline-delimited:
//!
//! ```text
//! {"type":"join","channel":"abc123","connection_type":"leader"}\n
//! {"type":"key","vk_code":65,"pressed":true,...}\n
//! ```
//!
//! Every message carries a top-level `type` field; all other fields are
//! type-specific. JSON string escaping guarantees that a serialized message
//! never contains a literal newline, so the line framing cannot be broken
//! by message content.
//!
//! Framing is strict: a line that fails to parse poisons the whole stream,
//! because there is no reliable way to resynchronize a line-oriented
//! protocol after a corrupt line. Callers must drop the connection on the
//! first decode error.

use anyhow::{bail, Result};
use serde_json::{Map, Value};

/// Maximum length of a single message line (guards against a peer that
/// never sends a newline).
const MAX_LINE_LEN: usize = 1024 * 1024;

/// Protocol version this client declares after connecting.
///
/// Version 1 peers receive a minimal payload; version 2 adds the `origin`,
/// `clients` and `client` bookkeeping fields to relayed messages.
pub const PROTOCOL_VERSION: u64 = 2;

/// Message type names on the wire.
pub mod msg {
    // Relay control messages
    pub const JOIN: &str = "join";
    pub const PROTOCOL_VERSION: &str = "protocol_version";
    pub const CHANNEL_JOINED: &str = "channel_joined";
    pub const CLIENT_JOINED: &str = "client_joined";
    pub const CLIENT_LEFT: &str = "client_left";
    pub const ERROR: &str = "error";
    pub const PING: &str = "ping";

    // Routed application messages (opaque to the relay)
    pub const KEY: &str = "key";
    pub const SPEAK: &str = "speak";
    pub const CANCEL_SPEECH: &str = "cancel_speech";
    pub const PAUSE_SPEECH: &str = "pause_speech";
    pub const BEEP: &str = "beep";
    pub const PLAY_WAVE: &str = "play_wave";
    pub const DISPLAY: &str = "display";
    pub const BRAILLE_INPUT: &str = "braille_input";
    pub const SET_BRAILLE_DISPLAY_SIZE: &str = "set_braille_display_size";
    pub const SET_CLIPBOARD_TEXT: &str = "set_clipboard_text";
    pub const SEND_SAS: &str = "send_sas";
}

/// Encode a message as one wire line (JSON object + trailing newline).
///
/// `fields` must be a JSON object (or `Value::Null` for a bare message);
/// the `type` key is inserted into it. Field values containing newlines
/// are escaped by the JSON encoder.
pub fn encode(kind: &str, fields: Value) -> Vec<u8> {
    let mut obj = match fields {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            // Non-object payloads are a programming error upstream; wrap
            // them rather than producing an unframeable message.
            let mut map = Map::new();
            map.insert("payload".to_owned(), other);
            map
        }
    };
    obj.insert("type".to_owned(), Value::String(kind.to_owned()));
    let mut line = serde_json::to_vec(&Value::Object(obj)).unwrap_or_default();
    line.push(b'\n');
    line
}

/// The `type` field of a parsed message, if present and a string.
pub fn kind(message: &Value) -> Option<&str> {
    message.get("type").and_then(Value::as_str)
}

/// Incremental decoder for newline-delimited JSON messages.
///
/// Feed raw socket bytes via [`LineDecoder::feed`]; complete lines are
/// parsed and returned in arrival order, partial trailing data is buffered
/// for the next call.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buf: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes and extract every complete message.
    ///
    /// # Errors
    ///
    /// Returns an error if any complete line is not valid JSON, or if the
    /// buffered partial line exceeds [`MAX_LINE_LEN`]. After an error the
    /// decoder state is unspecified; the connection must be dropped.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Value>> {
        self.buf.extend_from_slice(bytes);
        let mut messages = Vec::new();

        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = &line[..line.len() - 1]; // strip the newline
            let parsed: Value = serde_json::from_slice(line)
                .map_err(|e| anyhow::anyhow!("malformed message line: {e}"))?;
            messages.push(parsed);
        }

        if self.buf.len() > MAX_LINE_LEN {
            bail!(
                "message line exceeds {MAX_LINE_LEN} bytes without a newline"
            );
        }

        Ok(messages)
    }

    /// Returns true if a partial line is buffered.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_decode_round_trip() {
        let line = encode(msg::JOIN, json!({"channel": "abc123", "connection_type": "leader"}));
        let mut decoder = LineDecoder::new();
        let messages = decoder.feed(&line).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(kind(&messages[0]), Some("join"));
        assert_eq!(messages[0]["channel"], "abc123");
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_line_split_across_reads_reassembled() {
        let mut decoder = LineDecoder::new();
        let messages = decoder.feed(br#"{"type":"pi"#).unwrap();
        assert!(messages.is_empty());
        assert!(decoder.has_partial());

        let messages = decoder.feed(b"ng\"}\n").unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(kind(&messages[0]), Some("ping"));
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_two_messages_in_one_read() {
        let mut decoder = LineDecoder::new();
        let messages = decoder.feed(b"{\"a\":1}\n{\"b\":2}\n").unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["a"], 1);
        assert_eq!(messages[1]["b"], 2);
    }

    #[test]
    fn test_byte_at_a_time() {
        let line = encode(msg::PING, Value::Null);
        let mut decoder = LineDecoder::new();
        for (i, byte) in line.iter().enumerate() {
            let messages = decoder.feed(&[*byte]).unwrap();
            if i < line.len() - 1 {
                assert!(messages.is_empty());
            } else {
                assert_eq!(messages.len(), 1);
            }
        }
    }

    #[test]
    fn test_malformed_line_is_an_error() {
        let mut decoder = LineDecoder::new();
        assert!(decoder.feed(b"{not json}\n").is_err());
    }

    #[test]
    fn test_empty_line_is_an_error() {
        let mut decoder = LineDecoder::new();
        assert!(decoder.feed(b"\n").is_err());
    }

    #[test]
    fn test_embedded_newline_is_escaped_not_literal() {
        let line = encode(msg::SET_CLIPBOARD_TEXT, json!({"text": "two\nlines"}));
        // Exactly one newline: the frame terminator.
        assert_eq!(line.iter().filter(|&&b| b == b'\n').count(), 1);

        let mut decoder = LineDecoder::new();
        let messages = decoder.feed(&line).unwrap();
        assert_eq!(messages[0]["text"], "two\nlines");
    }

    #[test]
    fn test_unterminated_line_over_limit_is_an_error() {
        let mut decoder = LineDecoder::new();
        let chunk = vec![b'x'; MAX_LINE_LEN + 1];
        assert!(decoder.feed(&chunk).is_err());
    }

    #[test]
    fn test_kind_absent_for_untyped_message() {
        let mut decoder = LineDecoder::new();
        let messages = decoder.feed(b"{\"channel\":\"x\"}\n").unwrap();
        assert_eq!(kind(&messages[0]), None);
    }
}
