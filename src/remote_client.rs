//! Top-level orchestrator for remote-control connections.
//!
//! [`RemoteClient`] owns at most one leader and one follower session at a
//! time (both may be live when bridging), the local command executor, the
//! keyboard-forwarding state, and an optionally self-hosted relay server.
//! All transport events from both roles funnel into one queue; the driver
//! (the CLI, or the host application's main loop) drains it and calls
//! [`RemoteClient::handle_event`], so every piece of shared state is only
//! ever touched from that single consumer.
//!
//! # Certificate trust recovery
//!
//! A failed certificate validation runs a strict one-shot state machine:
//! disconnect, ask the trust prompt, and only on approval pin the
//! fingerprint and retry the same connection once with validation
//! relaxed. A second failure while retrying is terminal; it surfaces as
//! an error instead of looping.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::cert::CertificateManager;
use crate::config::Settings;
use crate::local_machine::{HostBridge, LocalMachine};
use crate::protocol::msg;
use crate::server::{RelayServer, ServerHandle};
use crate::session::{FollowerSession, LeaderSession};
use crate::transport::{ConnectionInfo, ConnectionMode, Transport, TransportEvent};

/// A held key: virtual-key code plus the extended-key flag.
pub type KeyId = (u64, bool);

/// Decides whether to trust an unknown certificate fingerprint.
///
/// Implemented by the host application's dialog layer; the bundled
/// [`DenyAllPrompt`] refuses everything, which is the right default for
/// unattended runs.
pub trait TrustPrompt: Send + Sync {
    fn confirm_fingerprint(&self, address: &str, fingerprint: &str) -> bool;
}

/// Refuses every unknown fingerprint.
pub struct DenyAllPrompt;

impl TrustPrompt for DenyAllPrompt {
    fn confirm_fingerprint(&self, address: &str, fingerprint: &str) -> bool {
        log::warn!("[client] refusing unknown certificate {fingerprint} for {address}");
        false
    }
}

/// What to do with one raw key event while forwarding is active.
#[derive(Debug, PartialEq)]
pub enum KeyDecision {
    /// Forwarding is off or the event belongs to the host; let the local
    /// system handle it normally.
    PassThrough,
    /// A pre-registered local gesture; run it here, block propagation.
    HandleLocally(KeyId),
    /// Send this payload to the leader transport, block local handling.
    Forward(Value),
}

/// Whether a virtual-key code is a modifier: shift/control/alt (generic
/// and left/right variants) or an OS key.
pub fn is_modifier(vk_code: u64) -> bool {
    matches!(vk_code, 0x10..=0x12 | 0x5B | 0x5C | 0xA0..=0xA5)
}

/// Keyboard-forwarding state machine.
///
/// While active, raw key events are intercepted before normal local
/// handling: modifiers are tracked in a set rather than acted on locally,
/// registered local gestures run here, and everything else is forwarded.
/// Deactivating drains the tracked modifiers as synthetic key-ups so the
/// peer is never left with a stuck modifier.
#[derive(Default)]
pub struct KeyForwarder {
    active: bool,
    modifiers: HashSet<KeyId>,
    /// Modifiers physically held when forwarding was switched on; their
    /// release belongs to the host, not the peer.
    host_pending: HashSet<KeyId>,
    local_gestures: HashSet<KeyId>,
}

impl KeyForwarder {
    pub fn active(&self) -> bool {
        self.active
    }

    pub fn modifiers(&self) -> &HashSet<KeyId> {
        &self.modifiers
    }

    /// Register a gesture that must run locally instead of being sent.
    pub fn register_local_gesture(&mut self, key: KeyId) {
        self.local_gestures.insert(key);
    }

    /// Switch forwarding on. `held` is the set of modifiers physically
    /// down at activation (typically the toggle gesture's own modifiers).
    pub fn activate(&mut self, held: HashSet<KeyId>) {
        self.active = true;
        self.host_pending = held;
    }

    /// Switch forwarding off, returning a synthetic key-up payload for
    /// every tracked modifier. The tracked set is empty afterwards.
    pub fn deactivate(&mut self) -> Vec<Value> {
        self.active = false;
        self.host_pending.clear();
        self.modifiers
            .drain()
            .map(|(vk_code, extended)| {
                json!({
                    "vk_code": vk_code,
                    "extended": extended,
                    "pressed": false,
                })
            })
            .collect()
    }

    /// Clear all state without emitting releases (transport is gone).
    pub fn reset(&mut self) {
        self.active = false;
        self.modifiers.clear();
        self.host_pending.clear();
    }

    /// Classify one raw key event.
    pub fn process(
        &mut self,
        vk_code: u64,
        scan_code: Option<u64>,
        extended: bool,
        pressed: bool,
    ) -> KeyDecision {
        if !self.active {
            return KeyDecision::PassThrough;
        }
        let key = (vk_code, extended);

        // The release of a modifier that was held to *enter* forwarding
        // mode belongs to the host side.
        if !pressed && self.host_pending.remove(&key) {
            return KeyDecision::PassThrough;
        }

        if is_modifier(vk_code) {
            if pressed {
                self.modifiers.insert(key);
            } else {
                self.modifiers.remove(&key);
            }
        } else if pressed && self.local_gestures.contains(&key) {
            return KeyDecision::HandleLocally(key);
        }

        KeyDecision::Forward(json!({
            "vk_code": vk_code,
            "extended": extended,
            "pressed": pressed,
            "scan_code": scan_code,
        }))
    }
}

/// One-shot certificate trust recovery state.
enum TrustRetry {
    Idle,
    /// The post-approval insecure retry is in flight for this role.
    Retrying(ConnectionMode),
}

/// Event delivered to the orchestrator: which role's transport, and what.
pub type RoleEvent = (ConnectionMode, TransportEvent);

struct RoleState<S> {
    transport: Arc<Transport>,
    session: S,
}

/// Top-level client: owns sessions, executor, forwarding and trust state.
pub struct RemoteClient {
    machine: LocalMachine,
    settings: Settings,
    trust_prompt: Arc<dyn TrustPrompt>,
    leader: Option<RoleState<LeaderSession>>,
    follower: Option<RoleState<FollowerSession>>,
    key_forwarder: KeyForwarder,
    local_handlers: HashMap<KeyId, Box<dyn Fn(&LocalMachine) + Send>>,
    control_server: Option<ServerHandle>,
    trust_retry: TrustRetry,
    events_tx: UnboundedSender<RoleEvent>,
    events_rx: UnboundedReceiver<RoleEvent>,
}

impl RemoteClient {
    pub fn new(
        bridge: Arc<dyn HostBridge>,
        settings: Settings,
        trust_prompt: Arc<dyn TrustPrompt>,
    ) -> Self {
        let (events_tx, events_rx) = unbounded_channel();
        Self {
            machine: LocalMachine::new(bridge),
            settings,
            trust_prompt,
            leader: None,
            follower: None,
            key_forwarder: KeyForwarder::default(),
            local_handlers: HashMap::new(),
            control_server: None,
            trust_retry: TrustRetry::Idle,
            events_tx,
            events_rx,
        }
    }

    pub fn machine(&self) -> &LocalMachine {
        &self.machine
    }

    pub fn machine_mut(&mut self) -> &mut LocalMachine {
        &mut self.machine
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn is_connected(&self) -> bool {
        self.follower
            .as_ref()
            .map(|r| r.transport.connected())
            .or_else(|| self.leader.as_ref().map(|r| r.transport.connected()))
            .unwrap_or(false)
    }

    /// Next transport event; `None` once every sender is gone.
    pub async fn next_event(&mut self) -> Option<RoleEvent> {
        self.events_rx.recv().await
    }

    // ── Connection lifecycle ────────────────────────────────────────────

    /// Connect in the requested role, replacing any live session of that
    /// role.
    pub fn connect(&mut self, info: ConnectionInfo) {
        log::info!(
            "[client] connecting as {:?} to {}",
            info.mode,
            info.address()
        );
        match info.mode {
            ConnectionMode::Leader => self.connect_as_leader(info),
            ConnectionMode::Follower => self.connect_as_follower(info),
        }
    }

    fn transport_for(&self, info: &ConnectionInfo) -> Arc<Transport> {
        // A fresh channel per transport, forwarded into the shared queue
        // with the role attached.
        let (tx, mut rx) = unbounded_channel::<TransportEvent>();
        let merged = self.events_tx.clone();
        let mode = info.mode;
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if merged.send((mode, event)).is_err() {
                    break;
                }
            }
        });

        let pinned = self
            .settings
            .trusted_fingerprint(&info.hostname, info.port);
        Arc::new(Transport::start(info.clone(), pinned, tx))
    }

    fn connect_as_leader(&mut self, info: ConnectionInfo) {
        self.disconnect_leader();
        let transport = self.transport_for(&info);
        self.leader = Some(RoleState {
            session: LeaderSession::new(Arc::clone(&transport)),
            transport,
        });
    }

    fn connect_as_follower(&mut self, info: ConnectionInfo) {
        self.disconnect_follower();
        let transport = self.transport_for(&info);
        self.follower = Some(RoleState {
            session: FollowerSession::new(Arc::clone(&transport)),
            transport,
        });
    }

    /// Tear down whatever is active. Safe to call with nothing connected.
    pub async fn disconnect(&mut self) {
        if self.leader.is_none() && self.follower.is_none() && self.control_server.is_none() {
            log::debug!("[client] disconnect with no active sessions");
            return;
        }
        log::info!("[client] disconnecting");
        if let Some(server) = self.control_server.take() {
            server.stop().await;
        }
        self.disconnect_leader();
        self.disconnect_follower();
        self.machine.bridge().message("Disconnected");
    }

    fn disconnect_leader(&mut self) {
        if let Some(role) = self.leader.take() {
            role.transport.close();
            self.key_forwarder.reset();
            self.machine.set_muted(false);
            self.machine.set_receiving_braille(false);
        }
    }

    fn disconnect_follower(&mut self) {
        if let Some(role) = self.follower.take() {
            role.transport.close();
        }
    }

    /// Reconnect at startup from the persisted control-server settings.
    ///
    /// No-op when autoconnect is off or a session is already live. In
    /// self-hosted mode the local relay is provisioned first and the
    /// connection targets loopback, which is auto-trusted at certificate
    /// generation time.
    pub async fn autoconnect(&mut self, mode: ConnectionMode) -> Result<()> {
        let control = self.settings.control_server.clone();
        if !control.autoconnect || self.leader.is_some() || self.follower.is_some() {
            log::debug!("[client] autoconnect disabled or already connected");
            return Ok(());
        }
        let (hostname, port, insecure) = if control.self_hosted {
            let port = self.start_control_server(control.port, &control.key).await?;
            ("localhost".to_owned(), port, true)
        } else {
            let (host, port) = parse_address(&control.host)
                .with_context(|| format!("bad control server address {:?}", control.host))?;
            (host, port, false)
        };
        self.connect(ConnectionInfo {
            mode,
            hostname,
            port,
            key: control.key,
            insecure,
        });
        Ok(())
    }

    /// Host a relay server locally (self-hosted mode) on `port`.
    pub async fn start_control_server(&mut self, port: u16, key: &str) -> Result<u16> {
        let manager = CertificateManager::new(CertificateManager::default_dir()?);
        manager.ensure_valid_cert_exists(&mut self.settings)?;
        if let Err(e) = self.settings.save() {
            log::warn!("[client] could not persist settings: {e:#}");
        }
        let tls = manager.server_config()?;
        let server = RelayServer::bind(port, key, tls)
            .await
            .context("start local control server")?;
        let port = server.local_port();
        self.control_server = Some(server.spawn());
        Ok(port)
    }

    // ── Event handling ──────────────────────────────────────────────────

    /// Dispatch one transport event. The caller is the single consumer of
    /// the event queue.
    pub fn handle_event(&mut self, mode: ConnectionMode, event: TransportEvent) {
        // Session layer first: handshake and message execution.
        match mode {
            ConnectionMode::Leader => {
                if let Some(role) = self.leader.as_mut() {
                    role.session.handle_event(&event, &mut self.machine);
                }
            }
            ConnectionMode::Follower => {
                if let Some(role) = self.follower.as_mut() {
                    role.session.handle_event(&event, &mut self.machine);
                }
            }
        }

        match event {
            TransportEvent::Connected => self.on_connected(mode),
            TransportEvent::ConnectionFailed => self.on_connection_failed(mode),
            TransportEvent::Disconnected => {
                self.machine.bridge().message("Connection interrupted");
            }
            TransportEvent::Closing => {
                if mode == ConnectionMode::Leader {
                    // Keyboard control cannot outlive its transport.
                    self.key_forwarder.reset();
                    self.machine.set_muted(false);
                }
                self.machine.set_receiving_braille(false);
            }
            TransportEvent::CertificateAuthenticationFailed { fingerprint } => {
                self.on_certificate_failure(mode, fingerprint);
            }
            TransportEvent::Message(_) => {}
        }
    }

    fn on_connected(&mut self, mode: ConnectionMode) {
        log::info!("[client] connected as {mode:?}");
        self.trust_retry = TrustRetry::Idle;
        if let Some(info) = self.role_info(mode) {
            self.settings.remember_connection(&info.address());
            if let Err(e) = self.settings.save() {
                log::warn!("[client] could not persist settings: {e:#}");
            }
        }
        // A controlled endpoint with a braille display shows the peer's
        // cells for the lifetime of the session.
        if mode == ConnectionMode::Follower && self.machine.bridge().braille_display_size() > 0 {
            self.machine.set_receiving_braille(true);
        }
        self.machine.bridge().message("Connected");
    }

    fn on_connection_failed(&mut self, mode: ConnectionMode) {
        log::error!("[client] failed to connect as {mode:?}");
        match mode {
            ConnectionMode::Leader => self.disconnect_leader(),
            ConnectionMode::Follower => self.disconnect_follower(),
        }
        self.machine
            .bridge()
            .message("Unable to connect to the remote computer");
    }

    /// Trust-on-first-use recovery: one prompt, one pinned retry, then
    /// terminal failure.
    fn on_certificate_failure(&mut self, mode: ConnectionMode, fingerprint: Option<String>) {
        let Some(info) = self.role_info(mode) else {
            return;
        };

        if matches!(self.trust_retry, TrustRetry::Retrying(m) if m == mode) {
            // Already retried once after pinning; do not loop.
            log::error!(
                "[client] certificate for {} failed again after trust was granted",
                info.address()
            );
            self.trust_retry = TrustRetry::Idle;
            match mode {
                ConnectionMode::Leader => self.disconnect_leader(),
                ConnectionMode::Follower => self.disconnect_follower(),
            }
            self.machine
                .bridge()
                .message("The relay's certificate could not be verified");
            return;
        }

        match mode {
            ConnectionMode::Leader => self.disconnect_leader(),
            ConnectionMode::Follower => self.disconnect_follower(),
        }

        let Some(fingerprint) = fingerprint else {
            self.machine
                .bridge()
                .message("The relay's certificate could not be verified");
            return;
        };

        let address = info.address();
        if self
            .trust_prompt
            .confirm_fingerprint(&address, &fingerprint)
        {
            self.settings.trust_certificate(&address, &fingerprint);
            if let Err(e) = self.settings.save() {
                log::warn!("[client] could not persist trusted certificate: {e:#}");
            }
            self.trust_retry = TrustRetry::Retrying(mode);
            self.connect(ConnectionInfo {
                insecure: true,
                ..info
            });
        } else {
            log::info!("[client] user declined certificate for {address}");
        }
    }

    fn role_info(&self, mode: ConnectionMode) -> Option<ConnectionInfo> {
        match mode {
            ConnectionMode::Leader => self.leader.as_ref().map(|r| r.transport.info().clone()),
            ConnectionMode::Follower => {
                self.follower.as_ref().map(|r| r.transport.info().clone())
            }
        }
    }

    // ── Commands ────────────────────────────────────────────────────────

    /// Toggle muting of output that originates from the peer.
    pub fn toggle_mute(&mut self) {
        let muted = !self.machine.is_muted();
        self.machine.set_muted(muted);
        self.machine.bridge().message(if muted {
            "Muted remote speech and sounds"
        } else {
            "Unmuted remote speech and sounds"
        });
    }

    /// Send local clipboard text to the peer (either role's transport).
    pub fn push_clipboard(&self, text: &str) {
        let connector = self
            .follower
            .as_ref()
            .map(|r| &r.transport)
            .or_else(|| self.leader.as_ref().map(|r| &r.transport));
        match connector {
            Some(transport) if transport.connected() => {
                transport.send(msg::SET_CLIPBOARD_TEXT, json!({ "text": text }));
            }
            _ => self.machine.bridge().message("Not connected"),
        }
    }

    /// URL a peer can use to join the active session's channel.
    pub fn connection_url(&self) -> Option<String> {
        self.leader
            .as_ref()
            .map(|r| r.transport.info().url())
            .or_else(|| self.follower.as_ref().map(|r| r.transport.info().url()))
    }

    /// Ask the controlled machine to run its secure attention sequence.
    pub fn send_sas(&self) {
        match self.leader.as_ref() {
            Some(role) => {
                role.transport.send(msg::SEND_SAS, Value::Null);
            }
            None => log::error!("[client] no leader transport for the secure attention sequence"),
        }
    }

    /// Register a gesture that runs locally during key forwarding.
    pub fn register_local_gesture(
        &mut self,
        key: KeyId,
        handler: impl Fn(&LocalMachine) + Send + 'static,
    ) {
        self.key_forwarder.register_local_gesture(key);
        self.local_handlers.insert(key, Box::new(handler));
    }

    /// Toggle keyboard forwarding to the controlled machine.
    ///
    /// `held` is the set of modifiers physically down right now (the
    /// toggle gesture's own modifiers); their upcoming releases belong to
    /// this machine.
    pub fn toggle_key_forwarding(&mut self, held: HashSet<KeyId>) {
        if self.leader.is_none() {
            return;
        }
        if self.key_forwarder.active() {
            self.stop_key_forwarding();
        } else {
            self.key_forwarder.activate(held);
            self.machine.set_receiving_braille(true);
            if self.machine.is_muted() {
                self.toggle_mute();
            }
            self.machine.bridge().message("Controlling the remote machine");
        }
    }

    fn stop_key_forwarding(&mut self) {
        let releases = self.key_forwarder.deactivate();
        if let Some(role) = self.leader.as_ref() {
            for release in releases {
                role.transport.send(msg::KEY, release);
            }
        }
        self.machine.set_receiving_braille(false);
        self.machine.bridge().message("Controlling the local machine");
    }

    /// Intercept one raw key event.
    ///
    /// Returns `true` when the local system should continue handling the
    /// event, `false` when it has been consumed (forwarded or run as a
    /// local gesture).
    pub fn process_key_input(
        &mut self,
        vk_code: u64,
        scan_code: Option<u64>,
        extended: bool,
        pressed: bool,
    ) -> bool {
        match self
            .key_forwarder
            .process(vk_code, scan_code, extended, pressed)
        {
            KeyDecision::PassThrough => true,
            KeyDecision::HandleLocally(key) => {
                if let Some(handler) = self.local_handlers.get(&key) {
                    handler(&self.machine);
                }
                false
            }
            KeyDecision::Forward(payload) => {
                if let Some(role) = self.leader.as_ref() {
                    role.transport.send(msg::KEY, payload);
                }
                false
            }
        }
    }
}

/// Split a `host:port` address, tolerating a bracketed IPv6 host.
pub fn parse_address(address: &str) -> Option<(String, u16)> {
    let (host, port) = address.rsplit_once(':')?;
    let port = port.parse().ok()?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return None;
    }
    Some((host.to_owned(), port))
}
