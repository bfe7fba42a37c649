//! Relay server: routes messages between authenticated clients.
//!
//! The relay accepts TLS connections on IPv4 and IPv6, authenticates each
//! client by channel password, and forwards every typed message from an
//! authenticated client to all *other* authenticated clients. Payloads are
//! opaque; the relay only reads the top-level `type` field and attaches
//! routing bookkeeping (`origin`, roster snapshots) for protocol
//! version > 1 peers.
//!
//! # Concurrency
//!
//! Accept tasks and per-socket read/write tasks post [`ServerEvent`]s onto
//! one unbounded channel; a single consumer loop owns the client table, so
//! no locking is needed around it. Housekeeping runs on a 60-second tick
//! even when idle; a one-way keepalive ping goes to every authenticated
//! client every 300 seconds. The ping is never acknowledged; it keeps
//! NAT/firewall state alive, and a dead peer surfaces on the next failed
//! write.
//!
//! # Scope
//!
//! One server process serves one channel: the password gate is the only
//! membership test, and every authenticated socket is part of the same
//! implicit room. Running two different passwords against one instance is
//! not supported; provision one process per channel.

mod client;

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde_json::{json, Map, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

use crate::protocol::{self, msg};
use client::{spawn_io, ClientRecord};

/// Seconds between keepalive pings to authenticated clients.
const PING_TIME: Duration = Duration::from_secs(300);

/// Upper bound on idle waiting, so housekeeping runs even with no traffic.
const HOUSEKEEPING_TICK: Duration = Duration::from_secs(60);

/// Event posted to the relay loop by accept and socket tasks.
pub(crate) enum ServerEvent {
    /// TLS handshake completed on a new connection.
    Accepted { stream: TlsStream<TcpStream>, peer: SocketAddr },
    /// A complete message arrived from a client.
    Message { id: u64, message: Value },
    /// A client socket died (EOF, I/O error, or framing error).
    Closed { id: u64 },
}

/// Relay server bound to its listening sockets but not yet running.
///
/// Lifecycle is one-way: bind, [`RelayServer::spawn`] (or
/// [`RelayServer::run`]), stop. A stopped server is not restartable.
pub struct RelayServer {
    password: String,
    listeners: Vec<TcpListener>,
    acceptor: TlsAcceptor,
    local_port: u16,
    next_id: AtomicU64,
    clients: HashMap<u64, ClientRecord>,
    events_tx: UnboundedSender<ServerEvent>,
    events_rx: UnboundedReceiver<ServerEvent>,
    last_ping: Instant,
}

/// Handle to a running relay server.
pub struct ServerHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
    local_port: u16,
}

impl ServerHandle {
    /// Port the server is listening on (useful when bound to port 0).
    pub fn port(&self) -> u16 {
        self.local_port
    }

    /// Stop the server: close the listeners and exit the loop.
    ///
    /// In-flight client connections are not force-closed here; their
    /// sockets die as the table is dropped and peers detect it as an
    /// ordinary disconnect.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.join.await;
    }
}

impl RelayServer {
    /// Bind the relay's listening sockets on `port`.
    ///
    /// IPv6 is bound first (on dual-stack hosts it may serve IPv4-mapped
    /// peers too); the IPv4 bind is then attempted on the same port and
    /// tolerated to fail when the v6 socket already covers it. At least
    /// one listener must bind. Pass port 0 to let the OS pick.
    pub async fn bind(
        port: u16,
        password: impl Into<String>,
        tls: std::sync::Arc<rustls::ServerConfig>,
    ) -> Result<Self> {
        crate::cert::ensure_crypto_provider();

        let mut listeners = Vec::new();

        let v6 = TcpListener::bind(SocketAddr::from((Ipv6Addr::UNSPECIFIED, port))).await;
        let mut local_port = port;
        match v6 {
            Ok(listener) => {
                local_port = listener.local_addr()?.port();
                listeners.push(listener);
            }
            Err(e) => log::warn!("[relay] IPv6 listener unavailable: {e}"),
        }

        match TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, local_port))).await {
            Ok(listener) => {
                local_port = listener.local_addr()?.port();
                listeners.push(listener);
            }
            Err(e) if !listeners.is_empty() => {
                // Dual-stack kernels reject a second bind on the same port;
                // the v6 socket already accepts v4-mapped connections.
                log::debug!("[relay] IPv4 bind skipped (covered by dual-stack socket): {e}");
            }
            Err(e) => return Err(e).context("bind relay listener"),
        }

        let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
        log::info!("[relay] listening on port {local_port}");

        Ok(Self {
            password: password.into(),
            listeners,
            acceptor: TlsAcceptor::from(tls),
            local_port,
            next_id: AtomicU64::new(0),
            clients: HashMap::new(),
            events_tx,
            events_rx,
            last_ping: Instant::now(),
        })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Run the relay on a background task, returning a stop handle.
    pub fn spawn(self) -> ServerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let local_port = self.local_port;
        let join = tokio::spawn(self.run(shutdown_rx));
        ServerHandle {
            shutdown_tx,
            join,
            local_port,
        }
    }

    /// Relay event loop. Returns when `shutdown` flips.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let accept_tasks: Vec<JoinHandle<()>> = self
            .listeners
            .drain(..)
            .map(|listener| {
                tokio::spawn(accept_loop(
                    listener,
                    self.acceptor.clone(),
                    self.events_tx.clone(),
                ))
            })
            .collect();

        let mut tick = tokio::time::interval(HOUSEKEEPING_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tick.tick() => {}
                event = self.events_rx.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
            }
            if self.last_ping.elapsed() >= PING_TIME {
                self.ping_sweep();
                self.last_ping = Instant::now();
            }
        }

        for task in accept_tasks {
            task.abort();
        }
        log::info!("[relay] server stopped");
    }

    fn handle_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Accepted { stream, peer } => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
                log::info!("[relay] client {id} connected from {peer}");
                let line_tx = spawn_io(id, stream, self.events_tx.clone());
                self.clients.insert(id, ClientRecord::new(id, line_tx));
            }
            ServerEvent::Message { id, message } => self.handle_message(id, message),
            ServerEvent::Closed { id } => self.client_disconnected(id),
        }
    }

    fn handle_message(&mut self, id: u64, message: Value) {
        let Some(kind) = protocol::kind(&message) else {
            return; // untyped messages are ignored
        };
        let Some(record) = self.clients.get(&id) else {
            return; // already removed
        };

        if record.authenticated {
            self.route_to_others(id, message);
            return;
        }

        // Pre-auth dispatch: only these two types exist before joining;
        // anything else from an unauthenticated client is silently dropped.
        match kind {
            msg::JOIN => self.do_join(id, &message),
            msg::PROTOCOL_VERSION => self.do_protocol_version(id, &message),
            _ => {}
        }
    }

    /// Authenticate a client against the channel password.
    fn do_join(&mut self, id: u64, message: &Value) {
        let supplied = message.get("channel").and_then(Value::as_str);
        if supplied != Some(self.password.as_str()) {
            log::warn!("[relay] client {id} sent an incorrect channel password");
            if let Some(record) = self.clients.get(&id) {
                let mut fields = Map::new();
                fields.insert("message".to_owned(), json!("incorrect_password"));
                record.send(msg::ERROR, fields, None, None, None);
            }
            // Queued error flushes before the write task exits.
            self.clients.remove(&id);
            return;
        }

        let (user_ids, clients): (Vec<u64>, Vec<Value>) = self
            .authenticated_ids()
            .into_iter()
            .filter(|other| *other != id)
            .filter_map(|other| self.clients.get(&other))
            .map(|c| (c.id, c.describe()))
            .unzip();

        let Some(record) = self.clients.get_mut(&id) else {
            return;
        };
        record.connection_type = message
            .get("connection_type")
            .and_then(Value::as_str)
            .map(str::to_owned);
        record.authenticated = true;
        log::info!(
            "[relay] client {id} authenticated (connection type: {:?})",
            record.connection_type
        );

        let joined = record.describe();
        let mut fields = Map::new();
        fields.insert("channel".to_owned(), json!(self.password));
        fields.insert("user_ids".to_owned(), json!(user_ids));
        record.send(
            msg::CHANNEL_JOINED,
            fields,
            None,
            Some(json!(clients)),
            None,
        );

        let mut announce = Map::new();
        announce.insert("user_id".to_owned(), json!(id));
        self.send_to_others(id, msg::CLIENT_JOINED, announce, None, Some(joined));
    }

    /// Record the peer's declared protocol version; absent or zero values
    /// leave the default of 1 in place.
    fn do_protocol_version(&mut self, id: u64, message: &Value) {
        let Some(version) = message.get("version").and_then(Value::as_u64) else {
            return;
        };
        if version == 0 {
            return;
        }
        if let Some(record) = self.clients.get_mut(&id) {
            record.protocol_version = version;
        }
    }

    /// Forward an authenticated client's message to every other
    /// authenticated client, stamping the sender id as `origin`.
    fn route_to_others(&mut self, sender: u64, message: Value) {
        let Value::Object(mut fields) = message else {
            return;
        };
        fields.remove("origin");
        let clients = fields.remove("clients");
        let client = fields.remove("client");
        let Some(kind) = fields
            .remove("type")
            .as_ref()
            .and_then(Value::as_str)
            .map(str::to_owned)
        else {
            return;
        };
        self.send_to_others(sender, &kind, fields, clients, client);
    }

    fn send_to_others(
        &mut self,
        sender: u64,
        kind: &str,
        fields: Map<String, Value>,
        clients: Option<Value>,
        client: Option<Value>,
    ) {
        let mut dead = Vec::new();
        for record in self.clients.values() {
            if record.id == sender || !record.authenticated {
                continue;
            }
            if !record.send(
                kind,
                fields.clone(),
                Some(sender),
                clients.clone(),
                client.clone(),
            ) {
                dead.push(record.id);
            }
        }
        for id in dead {
            self.client_disconnected(id);
        }
    }

    /// One-way keepalive to every authenticated client.
    fn ping_sweep(&mut self) {
        let mut dead = Vec::new();
        for record in self.clients.values() {
            if record.authenticated && !record.send(msg::PING, Map::new(), None, None, None) {
                dead.push(record.id);
            }
        }
        for id in dead {
            self.client_disconnected(id);
        }
    }

    /// Drop a client and, if it had authenticated, announce its departure.
    fn client_disconnected(&mut self, id: u64) {
        let Some(record) = self.clients.remove(&id) else {
            return;
        };
        log::info!("[relay] client {id} disconnected");
        if record.authenticated {
            let mut fields = Map::new();
            fields.insert("user_id".to_owned(), json!(id));
            self.send_to_others(id, msg::CLIENT_LEFT, fields, None, Some(record.describe()));
        }
    }

    fn authenticated_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .clients
            .values()
            .filter(|c| c.authenticated)
            .map(|c| c.id)
            .collect();
        ids.sort_unstable();
        ids
    }
}

/// Accept loop for one listening socket.
///
/// The TLS handshake runs on its own task so a slow or stuck handshake
/// never delays other connections.
async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    events: UnboundedSender<ServerEvent>,
) {
    loop {
        match listener.accept().await {
            Ok((tcp, peer)) => {
                if let Err(e) = tcp.set_nodelay(true) {
                    log::debug!("[relay] set_nodelay: {e}");
                }
                let acceptor = acceptor.clone();
                let events = events.clone();
                tokio::spawn(async move {
                    match acceptor.accept(tcp).await {
                        Ok(stream) => {
                            let _ = events.send(ServerEvent::Accepted { stream, peer });
                        }
                        Err(e) => log::debug!("[relay] TLS handshake with {peer} failed: {e}"),
                    }
                });
            }
            Err(e) => {
                log::error!("[relay] accept error: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::CertificateManager;
    use crate::config::Settings;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio_rustls::TlsConnector;

    const RECV_TIMEOUT: Duration = Duration::from_secs(5);

    async fn start_server(password: &str) -> (ServerHandle, tempfile::TempDir) {
        let tmp = tempfile::TempDir::new().unwrap();
        let mgr = CertificateManager::new(tmp.path().join("certs"));
        mgr.ensure_valid_cert_exists(&mut Settings::default()).unwrap();
        let tls = mgr.server_config().unwrap();
        let server = RelayServer::bind(0, password, tls).await.unwrap();
        (server.spawn(), tmp)
    }

    struct TestClient {
        reader: BufReader<tokio::io::ReadHalf<tokio_rustls::client::TlsStream<TcpStream>>>,
        writer: tokio::io::WriteHalf<tokio_rustls::client::TlsStream<TcpStream>>,
    }

    impl TestClient {
        async fn connect(port: u16) -> Self {
            let tcp = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            let connector =
                TlsConnector::from(Arc::new(crate::transport::insecure_client_config()));
            let server_name = rustls::pki_types::ServerName::try_from("localhost").unwrap();
            let stream = connector.connect(server_name, tcp).await.unwrap();
            let (read_half, writer) = tokio::io::split(stream);
            Self {
                reader: BufReader::new(read_half),
                writer,
            }
        }

        async fn send(&mut self, kind: &str, fields: Value) {
            use tokio::io::AsyncWriteExt;
            let line = protocol::encode(kind, fields);
            self.writer.write_all(&line).await.unwrap();
        }

        async fn join(&mut self, channel: &str, connection_type: &str) {
            self.send(msg::PROTOCOL_VERSION, json!({"version": 2})).await;
            self.send(
                msg::JOIN,
                json!({"channel": channel, "connection_type": connection_type}),
            )
            .await;
        }

        /// Read one message, panicking on timeout or EOF.
        async fn recv(&mut self) -> Value {
            let mut line = String::new();
            let n = tokio::time::timeout(RECV_TIMEOUT, self.reader.read_line(&mut line))
                .await
                .expect("timed out waiting for a message")
                .expect("read failed");
            assert!(n > 0, "connection closed while a message was expected");
            serde_json::from_str(&line).expect("server sent malformed JSON")
        }

        /// Expect the connection to deliver nothing within a short window.
        async fn expect_silence(&mut self) {
            let mut line = String::new();
            let result =
                tokio::time::timeout(Duration::from_millis(300), self.reader.read_line(&mut line))
                    .await;
            assert!(result.is_err(), "expected no message, got: {line}");
        }

        /// Expect EOF (server closed the connection).
        async fn expect_eof(&mut self) {
            let mut line = String::new();
            let n = tokio::time::timeout(RECV_TIMEOUT, self.reader.read_line(&mut line))
                .await
                .expect("timed out waiting for close")
                .expect("read failed");
            assert_eq!(n, 0, "expected EOF, got: {line}");
        }
    }

    #[tokio::test]
    async fn test_join_with_correct_password_yields_channel_joined() {
        let (server, _tmp) = start_server("abc123").await;

        let mut c1 = TestClient::connect(server.port()).await;
        c1.join("abc123", "leader").await;
        let joined = c1.recv().await;
        assert_eq!(joined["type"], "channel_joined");
        assert_eq!(joined["channel"], "abc123");
        assert_eq!(joined["user_ids"], json!([]));
        assert_eq!(joined["clients"], json!([]));

        // Second client sees the first in its roster; the first is told.
        let mut c2 = TestClient::connect(server.port()).await;
        c2.join("abc123", "follower").await;
        let joined2 = c2.recv().await;
        assert_eq!(joined2["type"], "channel_joined");
        assert_eq!(joined2["user_ids"].as_array().unwrap().len(), 1);
        assert_eq!(joined2["clients"][0]["connection_type"], "leader");

        let announce = c1.recv().await;
        assert_eq!(announce["type"], "client_joined");
        assert_eq!(announce["client"]["connection_type"], "follower");

        server.stop().await;
    }

    #[tokio::test]
    async fn test_wrong_password_gets_error_then_closure() {
        let (server, _tmp) = start_server("abc123").await;

        let mut bystander = TestClient::connect(server.port()).await;
        bystander.join("abc123", "leader").await;
        let _ = bystander.recv().await; // channel_joined

        let mut intruder = TestClient::connect(server.port()).await;
        intruder.join("wrong", "leader").await;
        let error = intruder.recv().await;
        assert_eq!(error["type"], "error");
        assert_eq!(error["message"], "incorrect_password");
        intruder.expect_eof().await;

        // The failed join is invisible to authenticated clients.
        bystander.expect_silence().await;

        server.stop().await;
    }

    #[tokio::test]
    async fn test_broadcast_reaches_others_but_never_sender() {
        let (server, _tmp) = start_server("abc123").await;

        let mut c1 = TestClient::connect(server.port()).await;
        c1.join("abc123", "leader").await;
        let joined = c1.recv().await;
        assert_eq!(joined["type"], "channel_joined");

        let mut c2 = TestClient::connect(server.port()).await;
        c2.join("abc123", "follower").await;
        let roster = c2.recv().await; // channel_joined listing c1
        let c1_id = roster["user_ids"][0].as_u64().unwrap();
        let _ = c1.recv().await; // client_joined

        c1.send(msg::KEY, json!({"vk_code": 65, "pressed": true})).await;
        let key = c2.recv().await;
        assert_eq!(key["type"], "key");
        assert_eq!(key["vk_code"], 65);
        assert_eq!(key["pressed"], true);
        assert_eq!(key["origin"].as_u64(), Some(c1_id));

        c1.expect_silence().await;

        server.stop().await;
    }

    #[tokio::test]
    async fn test_end_to_end_leader_key_reaches_follower_with_origin() {
        let (server, _tmp) = start_server("abc123").await;

        let mut leader = TestClient::connect(server.port()).await;
        leader.join("abc123", "leader").await;
        let _ = leader.recv().await;

        let mut follower = TestClient::connect(server.port()).await;
        follower.join("abc123", "follower").await;
        let roster = follower.recv().await;
        let leader_id = roster["user_ids"][0].as_u64().unwrap();
        let _ = leader.recv().await; // client_joined

        leader
            .send(msg::KEY, json!({"vk_code": 65, "pressed": true}))
            .await;
        let key = follower.recv().await;
        assert_eq!(key["type"], "key");
        assert_eq!(key["vk_code"], 65);
        assert_eq!(key["origin"].as_u64(), Some(leader_id));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_unauthenticated_messages_are_not_routed() {
        let (server, _tmp) = start_server("abc123").await;

        let mut member = TestClient::connect(server.port()).await;
        member.join("abc123", "leader").await;
        let _ = member.recv().await;

        let mut lurker = TestClient::connect(server.port()).await;
        lurker
            .send(msg::KEY, json!({"vk_code": 65, "pressed": true}))
            .await;
        member.expect_silence().await;

        // The lurker can still authenticate afterwards.
        lurker.join("abc123", "follower").await;
        let joined = lurker.recv().await;
        assert_eq!(joined["type"], "channel_joined");

        server.stop().await;
    }

    #[tokio::test]
    async fn test_version_1_peer_gets_minimal_payload() {
        let (server, _tmp) = start_server("abc123").await;

        // Legacy client: joins without declaring a protocol version.
        let mut legacy = TestClient::connect(server.port()).await;
        legacy
            .send(msg::JOIN, json!({"channel": "abc123", "connection_type": "leader"}))
            .await;
        let joined = legacy.recv().await;
        assert_eq!(joined["type"], "channel_joined");
        assert!(joined.get("clients").is_none(), "clients is v2 bookkeeping");
        assert!(joined.get("user_ids").is_some(), "user_ids is not gated");

        let mut modern = TestClient::connect(server.port()).await;
        modern.join("abc123", "follower").await;
        let _ = modern.recv().await;

        let announce = legacy.recv().await;
        assert_eq!(announce["type"], "client_joined");
        assert!(announce.get("client").is_none());

        modern.send(msg::KEY, json!({"vk_code": 13, "pressed": false})).await;
        let key = legacy.recv().await;
        assert_eq!(key["type"], "key");
        assert!(key.get("origin").is_none(), "origin is v2 bookkeeping");

        server.stop().await;
    }

    #[tokio::test]
    async fn test_disconnect_broadcasts_client_left() {
        let (server, _tmp) = start_server("abc123").await;

        let mut c1 = TestClient::connect(server.port()).await;
        c1.join("abc123", "leader").await;
        let _ = c1.recv().await;

        let mut c2 = TestClient::connect(server.port()).await;
        c2.join("abc123", "follower").await;
        let roster = c2.recv().await;
        let _ = c1.recv().await; // client_joined
        let c2_id = {
            // c2's own id is the announce's user_id; read it from c1's view instead.
            // The roster told c2 about c1, so c2's id is one more.
            roster["user_ids"][0].as_u64().unwrap() + 1
        };

        drop(c2);
        let left = c1.recv().await;
        assert_eq!(left["type"], "client_left");
        assert_eq!(left["user_id"].as_u64(), Some(c2_id));
        assert_eq!(left["client"]["connection_type"], "follower");

        server.stop().await;
    }

    #[tokio::test]
    async fn test_malformed_line_drops_the_connection() {
        let (server, _tmp) = start_server("abc123").await;

        let mut client = TestClient::connect(server.port()).await;
        client.join("abc123", "leader").await;
        let _ = client.recv().await;

        use tokio::io::AsyncWriteExt;
        client.writer.write_all(b"{broken\n").await.unwrap();
        client.expect_eof().await;

        server.stop().await;
    }
}
