//! Per-socket state for relay clients (server side).
//!
//! Each accepted TLS connection gets a [`ClientRecord`] in the relay's
//! table plus a pair of I/O tasks: the read task feeds decoded messages
//! into the relay event loop, the write task drains an unbounded channel
//! of pre-encoded lines. A decode error, EOF, or I/O error on either side
//! reports the socket as closed; the relay loop owns all bookkeeping.

use serde_json::{json, Map, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio_rustls::server::TlsStream;

use super::ServerEvent;
use crate::protocol::{self, LineDecoder};

/// Read buffer size for client sockets.
const READ_BUF_LEN: usize = 16 * 1024;

/// Server-side record for one connected client.
///
/// Lives in the relay's client table and is only touched by the relay
/// event loop; the I/O tasks communicate with it exclusively through
/// channels.
pub(crate) struct ClientRecord {
    /// Server-assigned id, unique for the server instance's lifetime.
    pub id: u64,
    /// Free-form tag supplied by the peer in its join message.
    pub connection_type: Option<String>,
    /// Declared protocol version; 1 until the peer says otherwise.
    pub protocol_version: u64,
    /// Whether the peer has passed the channel password check.
    pub authenticated: bool,
    /// Outgoing wire lines, drained by the write task.
    line_tx: UnboundedSender<Vec<u8>>,
}

impl ClientRecord {
    pub(crate) fn new(id: u64, line_tx: UnboundedSender<Vec<u8>>) -> Self {
        Self {
            id,
            connection_type: None,
            protocol_version: 1,
            authenticated: false,
            line_tx,
        }
    }

    /// Client metadata as shared with peers in roster messages.
    pub(crate) fn describe(&self) -> Value {
        json!({ "id": self.id, "connection_type": self.connection_type })
    }

    /// Queue a message for this client, gating bookkeeping fields.
    ///
    /// `origin`, `clients` and `client` are included only for peers that
    /// declared protocol version > 1; version 1 peers get the minimal
    /// payload for backward compatibility.
    ///
    /// Returns `false` if the write task is gone (dead peer).
    pub(crate) fn send(
        &self,
        kind: &str,
        mut fields: Map<String, Value>,
        origin: Option<u64>,
        clients: Option<Value>,
        client: Option<Value>,
    ) -> bool {
        if self.protocol_version > 1 {
            if let Some(origin) = origin {
                fields.insert("origin".to_owned(), json!(origin));
            }
            if let Some(clients) = clients {
                fields.insert("clients".to_owned(), clients);
            }
            if let Some(client) = client {
                fields.insert("client".to_owned(), client);
            }
        }
        let line = protocol::encode(kind, Value::Object(fields));
        self.line_tx.send(line).is_ok()
    }
}

/// Spawn the read/write tasks for an accepted TLS stream.
///
/// Returns the sender for outgoing lines. Both tasks end on their own when
/// the socket dies or the record (and with it the line sender) is dropped.
pub(crate) fn spawn_io(
    id: u64,
    stream: TlsStream<TcpStream>,
    events: UnboundedSender<ServerEvent>,
) -> UnboundedSender<Vec<u8>> {
    let (read_half, write_half) = tokio::io::split(stream);
    let (line_tx, line_rx) = tokio::sync::mpsc::unbounded_channel::<Vec<u8>>();

    tokio::spawn(read_loop(id, read_half, events.clone()));
    tokio::spawn(write_loop(id, write_half, line_rx, events));

    line_tx
}

/// Read task: decode lines, forward messages, report closure.
///
/// Framing is strict: one malformed line forfeits the connection, since
/// a line-oriented stream cannot be reliably resynchronized after a
/// corrupt line.
async fn read_loop(
    id: u64,
    mut reader: ReadHalf<TlsStream<TcpStream>>,
    events: UnboundedSender<ServerEvent>,
) {
    let mut decoder = LineDecoder::new();
    let mut buf = [0u8; READ_BUF_LEN];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => match decoder.feed(&buf[..n]) {
                Ok(messages) => {
                    for message in messages {
                        if events.send(ServerEvent::Message { id, message }).is_err() {
                            return; // relay loop gone
                        }
                    }
                }
                Err(e) => {
                    log::warn!("[relay] client {id}: {e:#}, dropping connection");
                    break;
                }
            },
            Err(e) => {
                log::debug!("[relay] client {id} read error: {e}");
                break;
            }
        }
    }
    let _ = events.send(ServerEvent::Closed { id });
}

/// Write task: drain queued lines onto the socket.
///
/// Exits when the line sender is dropped (client removed from the table)
/// or a write fails; queued lines are flushed before a drop-triggered
/// exit, so an `error` reply still reaches a rejected client.
async fn write_loop(
    id: u64,
    mut writer: WriteHalf<TlsStream<TcpStream>>,
    mut line_rx: UnboundedReceiver<Vec<u8>>,
    events: UnboundedSender<ServerEvent>,
) {
    while let Some(line) = line_rx.recv().await {
        if let Err(e) = writer.write_all(&line).await {
            log::debug!("[relay] client {id} write error: {e}");
            let _ = events.send(ServerEvent::Closed { id });
            break;
        }
    }
    let _ = writer.shutdown().await;
}
