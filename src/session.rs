//! Leader and follower sessions.
//!
//! A session binds a [`Transport`] to the [`LocalMachine`]: inbound
//! protocol messages become local actions, and the connect handshake
//! (protocol version declaration, channel join, braille size exchange) is
//! sent when the transport comes up. Sessions are plain state driven by
//! the orchestrator's event loop, and never touch shared state from
//! another thread.
//!
//! The leader executes the *output* the controlled machine sends back
//! (speech, tones, braille cells); the follower executes the *input* the
//! controlling machine sends (keys, clipboard, the secure attention
//! sequence). Both sides cache the peer's braille display sizes for size
//! negotiation.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::local_machine::LocalMachine;
use crate::protocol::{self, msg, PROTOCOL_VERSION};
use crate::transport::{ConnectionInfo, Transport, TransportEvent};

/// Messages sent when a connection is (re-)established.
///
/// Declared version first so the relay knows how to talk to us before the
/// join reply; then the join itself; then our braille display size, when a
/// display is present, so the peer can negotiate layout.
pub(crate) fn handshake_messages(
    info: &ConnectionInfo,
    braille_display_size: usize,
) -> Vec<(&'static str, Value)> {
    let mut messages = vec![
        (msg::PROTOCOL_VERSION, json!({ "version": PROTOCOL_VERSION })),
        (
            msg::JOIN,
            json!({
                "channel": info.key,
                "connection_type": info.mode.connection_type(),
            }),
        ),
    ];
    if braille_display_size > 0 {
        messages.push((
            msg::SET_BRAILLE_DISPLAY_SIZE,
            json!({ "sizes": [braille_display_size] }),
        ));
    }
    messages
}

fn send_handshake(transport: &Transport, machine: &LocalMachine) {
    for (kind, fields) in
        handshake_messages(transport.info(), machine.bridge().braille_display_size())
    {
        transport.send(kind, fields);
    }
}

/// Session for the controlling endpoint.
pub struct LeaderSession {
    transport: Arc<Transport>,
}

impl LeaderSession {
    pub fn new(transport: Arc<Transport>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// React to a transport event. Messages carry the follower's output.
    pub fn handle_event(&mut self, event: &TransportEvent, machine: &mut LocalMachine) {
        match event {
            TransportEvent::Connected => send_handshake(&self.transport, machine),
            TransportEvent::Message(message) => self.handle_message(message, machine),
            _ => {}
        }
    }

    fn handle_message(&mut self, message: &Value, machine: &mut LocalMachine) {
        let Some(kind) = protocol::kind(message) else {
            return;
        };
        match kind {
            msg::SPEAK => {
                if let Some(sequence) = message.get("sequence") {
                    machine.speak(sequence);
                }
            }
            msg::CANCEL_SPEECH => machine.cancel_speech(),
            msg::PAUSE_SPEECH => {
                machine.pause_speech(message.get("switch").and_then(Value::as_bool).unwrap_or(false));
            }
            msg::BEEP => {
                let hz = message.get("hz").and_then(Value::as_f64).unwrap_or(0.0);
                let length = message.get("length").and_then(Value::as_u64).unwrap_or(0);
                let left = message.get("left").and_then(Value::as_u64).unwrap_or(50);
                let right = message.get("right").and_then(Value::as_u64).unwrap_or(50);
                machine.beep(hz, length, left, right);
            }
            msg::PLAY_WAVE => {
                if let Some(name) = message.get("name").and_then(Value::as_str) {
                    machine.play_wave(name);
                }
            }
            msg::DISPLAY => {
                if let Some(cells) = parse_cells(message.get("cells")) {
                    machine.display(&cells);
                }
            }
            msg::SET_BRAILLE_DISPLAY_SIZE => {
                if let Some(sizes) = parse_sizes(message.get("sizes")) {
                    machine.set_braille_display_sizes(sizes);
                }
            }
            msg::SET_CLIPBOARD_TEXT => {
                if let Some(text) = message.get("text").and_then(Value::as_str) {
                    machine.set_clipboard_text(text);
                }
            }
            msg::CLIENT_JOINED => {
                machine.bridge().message("Peer connected to the channel");
            }
            msg::CLIENT_LEFT => {
                machine.bridge().message("Peer left the channel");
            }
            msg::CHANNEL_JOINED | msg::PING => {}
            other => log::debug!("[session] leader ignoring {other}"),
        }
    }
}

/// Session for the controlled endpoint.
pub struct FollowerSession {
    transport: Arc<Transport>,
}

impl FollowerSession {
    pub fn new(transport: Arc<Transport>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// React to a transport event. Messages carry the leader's commands.
    pub fn handle_event(&mut self, event: &TransportEvent, machine: &mut LocalMachine) {
        match event {
            TransportEvent::Connected => send_handshake(&self.transport, machine),
            TransportEvent::Message(message) => self.handle_message(message, machine),
            _ => {}
        }
    }

    fn handle_message(&mut self, message: &Value, machine: &mut LocalMachine) {
        let Some(kind) = protocol::kind(message) else {
            return;
        };
        match kind {
            msg::KEY => {
                let vk_code = message.get("vk_code").and_then(Value::as_u64);
                let extended = message.get("extended").and_then(Value::as_bool).unwrap_or(false);
                let pressed = message.get("pressed").and_then(Value::as_bool).unwrap_or(false);
                machine.send_key(vk_code, extended, pressed);
            }
            msg::SET_CLIPBOARD_TEXT => {
                if let Some(text) = message.get("text").and_then(Value::as_str) {
                    machine.set_clipboard_text(text);
                }
            }
            msg::SEND_SAS => machine.send_sas(),
            msg::BRAILLE_INPUT => machine.braille_input(message),
            msg::DISPLAY => {
                if let Some(cells) = parse_cells(message.get("cells")) {
                    machine.display(&cells);
                }
            }
            msg::SET_BRAILLE_DISPLAY_SIZE => {
                if let Some(sizes) = parse_sizes(message.get("sizes")) {
                    machine.set_braille_display_sizes(sizes);
                }
            }
            msg::CLIENT_JOINED => {
                machine.bridge().message("Peer connected to the channel");
            }
            msg::CLIENT_LEFT => {
                machine.bridge().message("Peer left the channel");
            }
            msg::CHANNEL_JOINED | msg::PING => {}
            other => log::debug!("[session] follower ignoring {other}"),
        }
    }
}

/// Braille cells: an array of integers in 0..=255, rejected wholesale on
/// any out-of-range or non-integer entry.
fn parse_cells(value: Option<&Value>) -> Option<Vec<u8>> {
    value?
        .as_array()?
        .iter()
        .map(|cell| cell.as_u64().and_then(|c| u8::try_from(c).ok()))
        .collect()
}

fn parse_sizes(value: Option<&Value>) -> Option<Vec<i64>> {
    value?.as_array()?.iter().map(Value::as_i64).collect()
}
