//! TLS certificate lifecycle for the relay server.
//!
//! The relay presents a self-signed certificate; clients authenticate it by
//! fingerprint (trust-on-first-use), not by chain validation, so the
//! certificate only needs to be structurally valid and fresh. This module
//! owns generation, validation, renewal and fingerprinting of that
//! certificate, and builds the rustls server config from it.
//!
//! Provisioning is self-healing: any problem with the on-disk material
//! (missing files, expired or near-expiry certificate, unreadable key)
//! results in regeneration rather than an error.

use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};

use anyhow::{Context, Result};
use data_encoding::HEXLOWER;
use rsa::pkcs8::EncodePrivateKey;
use sha2::{Digest, Sha256};
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::{FromDer, X509Certificate};

const CERT_FILE: &str = "relay-cert.pem";
const KEY_FILE: &str = "relay-key.pem";
const FINGERPRINT_FILE: &str = "relay-cert.fingerprint";

const CERT_DURATION_DAYS: i64 = 365;
const CERT_RENEWAL_THRESHOLD_DAYS: i64 = 30;

const RSA_KEY_BITS: usize = 2048;

/// Install the ring crypto provider as the process default.
///
/// Safe to call from multiple entry points; only the first call has any
/// effect. Both the server and the client transport go through this before
/// building any rustls config.
pub(crate) fn ensure_crypto_provider() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Manages the relay server's certificate, key and fingerprint files.
pub struct CertificateManager {
    cert_dir: PathBuf,
}

impl CertificateManager {
    pub fn new(cert_dir: impl Into<PathBuf>) -> Self {
        Self {
            cert_dir: cert_dir.into(),
        }
    }

    /// Default certificate directory under the platform data dir.
    pub fn default_dir() -> Result<PathBuf> {
        if let Ok(dir) = std::env::var("SCREENLINK_CONFIG_DIR") {
            return Ok(PathBuf::from(dir).join("certs"));
        }
        let base = dirs::data_local_dir().context("could not determine data directory")?;
        Ok(base.join("screenlink").join("certs"))
    }

    pub fn cert_path(&self) -> PathBuf {
        self.cert_dir.join(CERT_FILE)
    }

    pub fn key_path(&self) -> PathBuf {
        self.cert_dir.join(KEY_FILE)
    }

    fn fingerprint_path(&self) -> PathBuf {
        self.cert_dir.join(FINGERPRINT_FILE)
    }

    /// Ensure a valid certificate and key exist, regenerating if needed.
    ///
    /// Idempotent: when the existing material validates, nothing is
    /// touched. On (re)generation the new fingerprint is registered as
    /// trusted for the loopback identities in `settings`; the caller is
    /// responsible for persisting the settings.
    pub fn ensure_valid_cert_exists(&self, settings: &mut crate::config::Settings) -> Result<()> {
        log::info!("[cert] checking certificate validity");
        fs::create_dir_all(&self.cert_dir)
            .with_context(|| format!("create cert dir {}", self.cert_dir.display()))?;

        let must_generate = if self.files_exist() {
            match self.validate_certificate() {
                Ok(()) => false,
                Err(e) => {
                    log::warn!("[cert] validation failed, regenerating: {e:#}");
                    true
                }
            }
        } else {
            true
        };

        if must_generate {
            let fingerprint = self.generate_self_signed()?;
            settings.trust_certificate("localhost", &fingerprint);
            settings.trust_certificate("127.0.0.1", &fingerprint);
        }
        Ok(())
    }

    /// Fingerprint of the current certificate, or `None` if unreadable.
    pub fn current_fingerprint(&self) -> Option<String> {
        match fs::read_to_string(self.fingerprint_path()) {
            Ok(s) if !s.trim().is_empty() => Some(s.trim().to_owned()),
            Ok(_) => None,
            Err(e) => {
                log::debug!("[cert] fingerprint unreadable: {e}");
                None
            }
        }
    }

    /// Build the rustls server config presenting this certificate.
    ///
    /// Client certificates are not requested; authentication is the
    /// channel password, not mTLS.
    pub fn server_config(&self) -> Result<Arc<rustls::ServerConfig>> {
        ensure_crypto_provider();

        let cert_file = fs::File::open(self.cert_path())
            .with_context(|| format!("open cert {}", self.cert_path().display()))?;
        let key_file = fs::File::open(self.key_path())
            .with_context(|| format!("open key {}", self.key_path().display()))?;

        let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("parse relay certificate")?;
        let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
            .context("parse relay private key")?
            .context("no private key found in key file")?;

        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .context("invalid relay certificate or key")?;
        Ok(Arc::new(config))
    }

    fn files_exist(&self) -> bool {
        self.cert_path().is_file() && self.key_path().is_file()
    }

    /// Validate the existing certificate and key.
    ///
    /// Errors here are treated as "must regenerate" by the caller; they
    /// never propagate out of [`ensure_valid_cert_exists`].
    fn validate_certificate(&self) -> Result<()> {
        let pem_bytes = fs::read(self.cert_path()).context("read certificate")?;
        let (_, pem) = parse_x509_pem(&pem_bytes)
            .map_err(|e| anyhow::anyhow!("certificate is not valid PEM: {e}"))?;
        let (_, cert) = X509Certificate::from_der(&pem.contents)
            .map_err(|e| anyhow::anyhow!("certificate DER parse failed: {e}"))?;

        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        let not_before = cert.validity().not_before.timestamp();
        let not_after = cert.validity().not_after.timestamp();
        if now < not_before || now >= not_after {
            anyhow::bail!("certificate is outside its validity window");
        }
        if not_after - now <= CERT_RENEWAL_THRESHOLD_DAYS * 86_400 {
            anyhow::bail!("certificate is approaching expiration");
        }

        // The private key must still load.
        let key_file = fs::File::open(self.key_path()).context("open private key")?;
        rustls_pemfile::private_key(&mut BufReader::new(key_file))
            .context("parse private key")?
            .context("no private key in key file")?;
        Ok(())
    }

    /// Generate a fresh self-signed certificate, write all three files
    /// atomically, and return the new fingerprint.
    fn generate_self_signed(&self) -> Result<String> {
        log::info!("[cert] generating new self-signed certificate");

        // rcgen signs with an existing key but cannot generate RSA keys.
        let rsa_key = rsa::RsaPrivateKey::new(&mut rand::rngs::OsRng, RSA_KEY_BITS)
            .context("generate RSA key")?;
        let pkcs8 = rsa_key
            .to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)
            .context("encode RSA key as PKCS#8")?;
        let key_pair = rcgen::KeyPair::from_pem(&pkcs8).context("load RSA key into rcgen")?;

        let mut params =
            rcgen::CertificateParams::new(vec!["localhost".to_owned(), "127.0.0.1".to_owned()])
                .context("certificate params")?;
        let mut dn = rcgen::DistinguishedName::new();
        dn.push(rcgen::DnType::CommonName, "Screenlink Relay");
        dn.push(rcgen::DnType::OrganizationName, "Screenlink");
        params.distinguished_name = dn;
        let now = time::OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + time::Duration::days(CERT_DURATION_DAYS);

        let cert = params.self_signed(&key_pair).context("sign certificate")?;
        let fingerprint = fingerprint_der(cert.der().as_ref());

        // Key first, then cert, then fingerprint, each via a tmp-file
        // rename so no reader ever observes half-written material.
        write_atomic(&self.key_path(), key_pair.serialize_pem().as_bytes())?;
        write_atomic(&self.cert_path(), cert.pem().as_bytes())?;
        write_atomic(&self.fingerprint_path(), fingerprint.as_bytes())?;

        log::info!("[cert] generated relay certificate, fingerprint {fingerprint}");
        Ok(fingerprint)
    }
}

/// Lowercase hex SHA-256 over certificate DER bytes.
pub fn fingerprint_der(der: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(der);
    HEXLOWER.encode(&hasher.finalize())
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("rename into {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;

    fn manager() -> (tempfile::TempDir, CertificateManager) {
        let tmp = tempfile::TempDir::new().unwrap();
        let mgr = CertificateManager::new(tmp.path().join("certs"));
        (tmp, mgr)
    }

    #[test]
    fn test_ensure_creates_cert_key_and_fingerprint() {
        let (_tmp, mgr) = manager();
        let mut settings = Settings::default();
        mgr.ensure_valid_cert_exists(&mut settings).unwrap();

        assert!(mgr.cert_path().is_file());
        assert!(mgr.key_path().is_file());
        let fp = mgr.current_fingerprint().expect("fingerprint written");
        assert_eq!(fp.len(), 64, "sha256 hex fingerprint");
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));

        // Loopback identities are trusted at generation time.
        assert_eq!(settings.trusted_fingerprint("localhost", 6837), Some(fp.clone()));
        assert_eq!(settings.trusted_fingerprint("127.0.0.1", 1), Some(fp));
    }

    #[test]
    fn test_ensure_is_idempotent() {
        let (_tmp, mgr) = manager();
        let mut settings = Settings::default();
        mgr.ensure_valid_cert_exists(&mut settings).unwrap();
        let cert_before = fs::read(mgr.cert_path()).unwrap();
        let fp_before = mgr.current_fingerprint().unwrap();

        mgr.ensure_valid_cert_exists(&mut settings).unwrap();
        assert_eq!(fs::read(mgr.cert_path()).unwrap(), cert_before);
        assert_eq!(mgr.current_fingerprint().unwrap(), fp_before);
    }

    #[test]
    fn test_deleting_cert_forces_regeneration() {
        let (_tmp, mgr) = manager();
        let mut settings = Settings::default();
        mgr.ensure_valid_cert_exists(&mut settings).unwrap();
        let fp_before = mgr.current_fingerprint().unwrap();

        fs::remove_file(mgr.cert_path()).unwrap();
        mgr.ensure_valid_cert_exists(&mut settings).unwrap();

        assert!(mgr.cert_path().is_file());
        let fp_after = mgr.current_fingerprint().unwrap();
        assert_ne!(fp_before, fp_after, "fresh key pair, fresh fingerprint");
    }

    #[test]
    fn test_deleting_key_forces_regeneration() {
        let (_tmp, mgr) = manager();
        let mut settings = Settings::default();
        mgr.ensure_valid_cert_exists(&mut settings).unwrap();
        let fp_before = mgr.current_fingerprint().unwrap();

        fs::remove_file(mgr.key_path()).unwrap();
        mgr.ensure_valid_cert_exists(&mut settings).unwrap();
        assert_ne!(mgr.current_fingerprint().unwrap(), fp_before);
    }

    #[test]
    fn test_server_config_builds_from_generated_material() {
        let (_tmp, mgr) = manager();
        mgr.ensure_valid_cert_exists(&mut Settings::default()).unwrap();
        mgr.server_config().expect("generated cert/key must produce a server config");
    }

    #[test]
    fn test_fingerprint_none_when_absent() {
        let (_tmp, mgr) = manager();
        assert_eq!(mgr.current_fingerprint(), None);
    }
}
