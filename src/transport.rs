//! Reconnecting TLS transport to a relay server or direct peer.
//!
//! A [`Transport`] owns one background task that connects, reads, and
//! reconnects on a fixed schedule until closed. Everything the rest of the
//! system needs to know arrives as [`TransportEvent`]s on a single
//! unbounded channel supplied at construction; the orchestrator drains
//! that channel on its own loop, so no shared state is ever mutated from
//! the network task. [`Transport::send`] is safe from any thread: writes
//! are serialized through the connection's outbound queue, so interleaved
//! senders cannot corrupt the line framing.
//!
//! # Certificate trust
//!
//! Server certificates are validated in one of three ways:
//! - a pinned fingerprint for this address must match exactly
//!   (trust-on-first-use; a mismatch fails even if a CA would vouch),
//! - with no pin, standard webpki validation against the Mozilla roots,
//! - with the `insecure` flag, any certificate is accepted, used only
//!   for the single retry right after the user approves a fingerprint.
//!
//! In every case the observed leaf fingerprint is recorded so a rejection
//! can be surfaced to the trust prompt.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::watch;
use tokio_rustls::TlsConnector;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};

use crate::cert::{ensure_crypto_provider, fingerprint_der};
use crate::protocol::{self, LineDecoder};

/// Delay between reconnection attempts.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Bound on a single TCP connect + TLS handshake attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Which side of the pairing this endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    /// Controlling the peer.
    Leader,
    /// Being controlled by the peer.
    Follower,
}

impl ConnectionMode {
    /// The `connection_type` tag sent in the join message.
    pub fn connection_type(self) -> &'static str {
        match self {
            Self::Leader => "leader",
            Self::Follower => "follower",
        }
    }
}

/// Parameters of one connection attempt. Immutable once the attempt starts.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub mode: ConnectionMode,
    pub hostname: String,
    pub port: u16,
    /// Channel key (shared secret).
    pub key: String,
    /// Accept any certificate; set only for the one-shot post-trust retry.
    pub insecure: bool,
}

impl ConnectionInfo {
    pub fn address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    /// Shareable URL for connecting to the same channel in the opposite
    /// role.
    pub fn url(&self) -> String {
        format!(
            "screenlink://{}?key={}&mode={}",
            self.address(),
            self.key,
            self.mode.connection_type()
        )
    }
}

/// Lifecycle and traffic events, delivered to the orchestrator's queue.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// TLS connection established.
    Connected,
    /// A connection attempt failed before any attempt ever succeeded.
    /// Fired at most once per transport; later drops surface as
    /// `Disconnected` and reconnection proceeds silently.
    ConnectionFailed,
    /// An established connection dropped; the transport will retry.
    Disconnected,
    /// The transport is about to be torn down for good.
    Closing,
    /// The peer certificate failed validation.
    CertificateAuthenticationFailed { fingerprint: Option<String> },
    /// A protocol message arrived.
    Message(Value),
}

/// Client-side reconnecting transport.
pub struct Transport {
    info: ConnectionInfo,
    outbound: Arc<Mutex<Option<UnboundedSender<Vec<u8>>>>>,
    connected: Arc<AtomicBool>,
    closed: AtomicBool,
    close_tx: watch::Sender<bool>,
    events: UnboundedSender<TransportEvent>,
}

impl Transport {
    /// Start the transport: spawn the reconnector task and return.
    ///
    /// `pinned` is the trusted fingerprint for this address, when one is
    /// known. Events are delivered on `events` from the background task.
    pub fn start(
        info: ConnectionInfo,
        pinned: Option<String>,
        events: UnboundedSender<TransportEvent>,
    ) -> Self {
        let (close_tx, close_rx) = watch::channel(false);
        let outbound = Arc::new(Mutex::new(None));
        let connected = Arc::new(AtomicBool::new(false));

        tokio::spawn(reconnector(
            info.clone(),
            pinned,
            events.clone(),
            Arc::clone(&outbound),
            Arc::clone(&connected),
            close_rx,
        ));

        Self {
            info,
            outbound,
            connected,
            closed: AtomicBool::new(false),
            close_tx,
            events,
        }
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Enqueue a message for transmission. Safe from any thread.
    ///
    /// Returns `false` (and drops the message) when not connected.
    pub fn send(&self, kind: &str, fields: Value) -> bool {
        let line = protocol::encode(kind, fields);
        let guard = self.outbound.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(tx) => tx.send(line).is_ok(),
            None => {
                log::debug!("[transport] dropping {kind} message, not connected");
                false
            }
        }
    }

    /// Tear the transport down. Idempotent.
    ///
    /// Emits `Closing`, stops the reconnector, and ends the connection.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.events.send(TransportEvent::Closing);
        let _ = self.close_tx.send(true);
        if let Ok(mut guard) = self.outbound.lock() {
            guard.take();
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Background task: connect, read, and retry until closed.
async fn reconnector(
    info: ConnectionInfo,
    pinned: Option<String>,
    events: UnboundedSender<TransportEvent>,
    outbound: Arc<Mutex<Option<UnboundedSender<Vec<u8>>>>>,
    connected: Arc<AtomicBool>,
    mut close_rx: watch::Receiver<bool>,
) {
    let mut ever_connected = false;
    let mut failure_reported = false;

    loop {
        if *close_rx.borrow() {
            break;
        }

        let attempt = tokio::select! {
            _ = close_rx.changed() => break,
            attempt = connect_once(&info, pinned.as_deref()) => attempt,
        };

        match attempt {
            Ok(stream) => {
                ever_connected = true;
                log::info!("[transport] connected to {}", info.address());

                let (read_half, mut write_half) = tokio::io::split(stream);
                let (line_tx, mut line_rx) =
                    tokio::sync::mpsc::unbounded_channel::<Vec<u8>>();
                *outbound.lock().unwrap_or_else(|e| e.into_inner()) = Some(line_tx);
                connected.store(true, Ordering::Release);
                let _ = events.send(TransportEvent::Connected);

                let writer = tokio::spawn(async move {
                    use tokio::io::AsyncWriteExt;
                    while let Some(line) = line_rx.recv().await {
                        if write_half.write_all(&line).await.is_err() {
                            break;
                        }
                    }
                });

                let closing = read_until_closed(read_half, &events, &mut close_rx).await;

                connected.store(false, Ordering::Release);
                outbound.lock().unwrap_or_else(|e| e.into_inner()).take();
                writer.abort();

                if closing {
                    break;
                }
                log::info!("[transport] connection to {} lost", info.address());
                let _ = events.send(TransportEvent::Disconnected);
            }
            Err(ConnectError::Certificate { fingerprint }) => {
                log::warn!(
                    "[transport] certificate validation failed for {}",
                    info.address()
                );
                let _ = events
                    .send(TransportEvent::CertificateAuthenticationFailed { fingerprint });
            }
            Err(ConnectError::Other(e)) => {
                log::debug!("[transport] connect to {} failed: {e:#}", info.address());
                if !ever_connected && !failure_reported {
                    failure_reported = true;
                    let _ = events.send(TransportEvent::ConnectionFailed);
                }
            }
        }

        tokio::select! {
            _ = close_rx.changed() => break,
            () = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
    log::debug!("[transport] reconnector for {} stopped", info.address());
}

/// Read messages until the socket dies or close is requested.
///
/// Returns `true` when the exit was close-requested.
async fn read_until_closed(
    mut read_half: tokio::io::ReadHalf<tokio_rustls::client::TlsStream<TcpStream>>,
    events: &UnboundedSender<TransportEvent>,
    close_rx: &mut watch::Receiver<bool>,
) -> bool {
    let mut decoder = LineDecoder::new();
    let mut buf = [0u8; 16 * 1024];

    loop {
        tokio::select! {
            _ = close_rx.changed() => return true,
            read = read_half.read(&mut buf) => match read {
                Ok(0) => return false,
                Ok(n) => match decoder.feed(&buf[..n]) {
                    Ok(messages) => {
                        for message in messages {
                            if events.send(TransportEvent::Message(message)).is_err() {
                                return true; // consumer gone, stop for good
                            }
                        }
                    }
                    Err(e) => {
                        log::warn!("[transport] framing error: {e:#}");
                        return false;
                    }
                },
                Err(e) => {
                    log::debug!("[transport] read error: {e}");
                    return false;
                }
            },
        }
    }
}

enum ConnectError {
    /// The peer certificate was rejected by the verifier.
    Certificate { fingerprint: Option<String> },
    Other(anyhow::Error),
}

/// One TCP connect + TLS handshake attempt.
async fn connect_once(
    info: &ConnectionInfo,
    pinned: Option<&str>,
) -> std::result::Result<tokio_rustls::client::TlsStream<TcpStream>, ConnectError> {
    ensure_crypto_provider();

    let verifier = TofuVerifier::new(pinned.map(str::to_owned), info.insecure)
        .map_err(ConnectError::Other)?;
    let verifier = Arc::new(verifier);
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::clone(&verifier) as Arc<dyn ServerCertVerifier>)
        .with_no_client_auth();

    let server_name = ServerName::try_from(info.hostname.clone())
        .map_err(|e| ConnectError::Other(anyhow::anyhow!("invalid hostname: {e}")))?;

    let attempt = async {
        let tcp = TcpStream::connect((info.hostname.as_str(), info.port))
            .await
            .context("tcp connect")?;
        tcp.set_nodelay(true).context("set_nodelay")?;
        TlsConnector::from(Arc::new(config))
            .connect(server_name, tcp)
            .await
            .context("tls handshake")
    };

    match tokio::time::timeout(CONNECT_TIMEOUT, attempt).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => {
            if verifier.rejected() {
                Err(ConnectError::Certificate {
                    fingerprint: verifier.observed_fingerprint(),
                })
            } else {
                Err(ConnectError::Other(e))
            }
        }
        Err(_) => Err(ConnectError::Other(anyhow::anyhow!(
            "connect timed out after {CONNECT_TIMEOUT:?}"
        ))),
    }
}

/// Certificate verifier implementing fingerprint pinning over webpki.
#[derive(Debug)]
struct TofuVerifier {
    pinned: Option<String>,
    insecure: bool,
    webpki: Arc<rustls::client::WebPkiServerVerifier>,
    observed: Mutex<Option<String>>,
    rejected: AtomicBool,
}

impl TofuVerifier {
    fn new(pinned: Option<String>, insecure: bool) -> Result<Self> {
        ensure_crypto_provider();
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let webpki = rustls::client::WebPkiServerVerifier::builder(Arc::new(roots))
            .build()
            .context("build webpki verifier")?;
        Ok(Self {
            pinned,
            insecure,
            webpki,
            observed: Mutex::new(None),
            rejected: AtomicBool::new(false),
        })
    }

    /// Fingerprint of the last certificate the peer presented.
    fn observed_fingerprint(&self) -> Option<String> {
        self.observed.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Whether this verifier rejected the peer certificate.
    fn rejected(&self) -> bool {
        self.rejected.load(Ordering::Acquire)
    }
}

impl ServerCertVerifier for TofuVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let fingerprint = fingerprint_der(end_entity.as_ref());
        *self.observed.lock().unwrap_or_else(|e| e.into_inner()) = Some(fingerprint.clone());

        if self.insecure {
            return Ok(ServerCertVerified::assertion());
        }

        if let Some(pinned) = &self.pinned {
            if *pinned == fingerprint {
                return Ok(ServerCertVerified::assertion());
            }
            // A changed certificate on a pinned address is never accepted,
            // regardless of what a CA would say.
            self.rejected.store(true, Ordering::Release);
            return Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ));
        }

        self.webpki
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
            .map_err(|e| {
                self.rejected.store(true, Ordering::Release);
                e
            })
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Client TLS config that accepts any certificate. Test support only.
#[cfg(test)]
pub(crate) fn insecure_client_config() -> rustls::ClientConfig {
    let verifier = TofuVerifier::new(None, true).expect("webpki verifier");
    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth()
}
