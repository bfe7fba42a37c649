//! Persisted settings: trusted certificates, connection history, and
//! control-server defaults.
//!
//! Settings live in a single JSON file under the platform config
//! directory. Loading is self-healing: a missing or corrupt file yields
//! defaults rather than an error, so a damaged settings file can never
//! prevent connecting.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Maximum number of remembered host addresses.
const LAST_CONNECTED_CAP: usize = 10;

/// Defaults for the self-hosted control server and autoconnect.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ControlServerSettings {
    /// Reconnect automatically at startup.
    pub autoconnect: bool,
    /// Host a local relay instead of using a remote one.
    pub self_hosted: bool,
    /// Remote relay address (`host:port`) when not self-hosted.
    pub host: String,
    /// Port for the self-hosted relay.
    pub port: u16,
    /// Channel key.
    pub key: String,
}

/// Persisted configuration consumed by the relay subsystem.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Settings {
    /// Trusted certificate fingerprints, keyed by `host:port` (loopback
    /// identities registered at certificate generation use the bare host).
    #[serde(default)]
    pub trusted_certs: HashMap<String, String>,
    /// Previously connected relay addresses, most recent last.
    #[serde(default)]
    pub last_connected: Vec<String>,
    #[serde(default)]
    pub control_server: ControlServerSettings,
}

impl Settings {
    /// Returns the settings directory, creating it if necessary.
    ///
    /// `SCREENLINK_CONFIG_DIR` overrides the platform config dir so tests
    /// and portable installs can redirect all persisted state.
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("SCREENLINK_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::config_dir()
                .context("could not determine config directory")?
                .join("screenlink")
        };
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    fn settings_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("settings.json"))
    }

    /// Load settings, falling back to defaults on any error.
    pub fn load() -> Self {
        match Self::try_load() {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("[config] using default settings: {e:#}");
                Self::default()
            }
        }
    }

    fn try_load() -> Result<Self> {
        let path = Self::settings_path()?;
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("read {}", path.display()))?;
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
    }

    /// Persist settings to disk.
    pub fn save(&self) -> Result<()> {
        let path = Self::settings_path()?;
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    /// Record `fingerprint` as trusted for `key` (a `host:port` address or
    /// a bare loopback host).
    pub fn trust_certificate(&mut self, key: &str, fingerprint: &str) {
        self.trusted_certs
            .insert(key.to_owned(), fingerprint.to_owned());
    }

    /// Trusted fingerprint for an address, if any.
    ///
    /// Looks up `host:port` first, then the bare host (the form used for
    /// the relay's own loopback identities).
    pub fn trusted_fingerprint(&self, host: &str, port: u16) -> Option<String> {
        self.trusted_certs
            .get(&format!("{host}:{port}"))
            .or_else(|| self.trusted_certs.get(host))
            .cloned()
    }

    /// Remember a successfully connected address, deduplicated and capped.
    pub fn remember_connection(&mut self, address: &str) {
        self.last_connected.retain(|a| a != address);
        self.last_connected.push(address.to_owned());
        if self.last_connected.len() > LAST_CONNECTED_CAP {
            let excess = self.last_connected.len() - LAST_CONNECTED_CAP;
            self.last_connected.drain(..excess);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trusted_fingerprint_prefers_host_port_over_bare_host() {
        let mut settings = Settings::default();
        settings.trust_certificate("localhost", "aaaa");
        settings.trust_certificate("localhost:6837", "bbbb");

        assert_eq!(settings.trusted_fingerprint("localhost", 6837), Some("bbbb".into()));
        assert_eq!(settings.trusted_fingerprint("localhost", 9999), Some("aaaa".into()));
        assert_eq!(settings.trusted_fingerprint("example.com", 6837), None);
    }

    #[test]
    fn test_remember_connection_dedupes_and_caps() {
        let mut settings = Settings::default();
        for i in 0..15 {
            settings.remember_connection(&format!("host{i}:6837"));
        }
        settings.remember_connection("host12:6837");

        assert_eq!(settings.last_connected.len(), LAST_CONNECTED_CAP);
        assert_eq!(settings.last_connected.last().map(String::as_str), Some("host12:6837"));
        assert_eq!(
            settings.last_connected.iter().filter(|a| *a == "host12:6837").count(),
            1
        );
    }

    #[test]
    fn test_settings_json_round_trip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut settings = Settings::default();
        settings.trust_certificate("relay.example:6837", "cafe");
        settings.remember_connection("relay.example:6837");
        settings.control_server.key = "abc123".into();

        let path = tmp.path().join("settings.json");
        fs::write(&path, serde_json::to_string_pretty(&settings).unwrap()).unwrap();
        let loaded: Settings =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();

        assert_eq!(loaded.trusted_fingerprint("relay.example", 6837), Some("cafe".into()));
        assert_eq!(loaded.last_connected, vec!["relay.example:6837"]);
        assert_eq!(loaded.control_server.key, "abc123");
    }

    #[test]
    fn test_corrupt_settings_parse_fails_cleanly() {
        assert!(serde_json::from_str::<Settings>("{not json").is_err());
        // Settings::load maps this failure to defaults.
        assert!(Settings::default().trusted_certs.is_empty());
    }
}
