//! Screenlink - secure relay and remote-control link between screen
//! reader instances.
//!
//! One endpoint acts as the *leader* (controlling) or *follower*
//! (controlled) half of a pairing, optionally routed through a relay
//! server shared by both. The wire protocol is newline-delimited JSON
//! over TLS; relay authentication is a shared channel key, and
//! certificate trust is pinned by fingerprint (trust-on-first-use).
//!
//! # Architecture
//!
//! - **RelayServer** - accepts TLS clients, routes messages between
//!   authenticated peers on one event loop
//! - **Transport** - reconnecting client connection with certificate
//!   pinning, feeding events into a single consumer queue
//! - **Session** - leader/follower protocol handling over a transport
//! - **LocalMachine** - executes peer commands through the [`HostBridge`]
//!   seam, gated by a mute flag
//! - **RemoteClient** - orchestrator: dual-role lifecycle, certificate
//!   trust recovery, keyboard forwarding
//!
//! # Modules
//!
//! - [`protocol`] - message vocabulary and line framing
//! - [`cert`] - relay certificate lifecycle
//! - [`server`] - the relay server
//! - [`transport`] - the reconnecting client transport
//! - [`config`] - persisted settings (trust table, connection history)

pub mod cert;
pub mod config;
pub mod local_machine;
pub mod protocol;
pub mod remote_client;
pub mod server;
pub mod session;
pub mod transport;

// Re-export commonly used types
pub use cert::CertificateManager;
pub use config::Settings;
pub use local_machine::{HostBridge, LocalMachine, LoggingBridge};
pub use remote_client::{DenyAllPrompt, RemoteClient, TrustPrompt};
pub use server::{RelayServer, ServerHandle};
pub use session::{FollowerSession, LeaderSession};
pub use transport::{ConnectionInfo, ConnectionMode, Transport, TransportEvent};
