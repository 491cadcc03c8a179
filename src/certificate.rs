//! Device certificates and the local certificate store.
//!
//! Every device authenticates with a long-lived self-signed X.509
//! certificate. The subject follows the KDE Connect convention (O=KDE,
//! OU=Kde connect, CN=device id) so reference peers display it correctly.
//! Fingerprints are the SHA-1 digest over the DER encoding rendered as
//! `sha1:<lowercase hex>`; they are shown to users in pairing confirmation
//! dialogs and must be stable across restarts.

use crate::{ProtocolError, Result};
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::x509::extension::{BasicConstraints, KeyUsage};
use openssl::x509::{X509Name, X509};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Certificate validity period (10 years).
const CERT_VALIDITY_DAYS: u32 = 3650;

const CERT_ORG: &str = "KDE";
const CERT_ORG_UNIT: &str = "Kde connect";

const IDENTITY_CERT_FILE: &str = "identity.pem";
const IDENTITY_KEY_FILE: &str = "identity.key";

/// Fingerprint of a DER-encoded certificate: `sha1:` + 40 lowercase hex chars.
pub fn fingerprint(cert_der: &[u8]) -> String {
    let digest = openssl::sha::sha1(cert_der);
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("sha1:{hex}")
}

/// A certificate together with its private key, both DER-encoded.
#[derive(Debug, Clone)]
pub struct CertificateInfo {
    pub device_id: String,
    pub certificate: Vec<u8>,
    pub private_key: Vec<u8>,
}

impl CertificateInfo {
    /// Generate a new self-signed RSA-2048 certificate for a device.
    pub fn generate(device_id: impl Into<String>) -> Result<Self> {
        let device_id = device_id.into();

        let rsa = Rsa::generate(2048)?;
        let pkey = PKey::from_rsa(rsa)?;

        let mut builder = X509::builder()?;
        builder.set_version(2)?;

        let mut serial = BigNum::new()?;
        serial.rand(159, MsbOption::MAYBE_ZERO, false)?;
        let serial = serial.to_asn1_integer()?;
        builder.set_serial_number(&serial)?;

        let mut name = X509Name::builder()?;
        name.append_entry_by_text("O", CERT_ORG)?;
        name.append_entry_by_text("OU", CERT_ORG_UNIT)?;
        name.append_entry_by_text("CN", &device_id)?;
        let name = name.build();
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(&name)?;

        let not_before = Asn1Time::days_from_now(0)?;
        let not_after = Asn1Time::days_from_now(CERT_VALIDITY_DAYS)?;
        builder.set_not_before(&not_before)?;
        builder.set_not_after(&not_after)?;

        builder.set_pubkey(&pkey)?;

        // End-entity device certificate, not a CA.
        builder.append_extension(BasicConstraints::new().build()?)?;
        builder.append_extension(
            KeyUsage::new()
                .digital_signature()
                .key_encipherment()
                .key_agreement()
                .build()?,
        )?;

        builder.sign(&pkey, MessageDigest::sha256())?;
        let cert = builder.build();

        let certificate = cert.to_der()?;
        let private_key = pkey.private_key_to_der()?;

        info!(
            "generated certificate for device {} with fingerprint {}",
            device_id,
            fingerprint(&certificate)
        );

        Ok(Self {
            device_id,
            certificate,
            private_key,
        })
    }

    /// `sha1:<hex>` fingerprint of this certificate.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.certificate)
    }

    /// Save certificate and private key as PEM files.
    pub fn save_to_files(
        &self,
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<()> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();

        if let Some(parent) = cert_path.parent() {
            fs::create_dir_all(parent)?;
        }
        if let Some(parent) = key_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let cert = X509::from_der(&self.certificate)?;
        fs::write(cert_path, cert.to_pem()?)?;

        let pkey = PKey::private_key_from_der(&self.private_key)?;
        fs::write(key_path, pkey.private_key_to_pem_pkcs8()?)?;

        debug!("saved identity certificate to {cert_path:?}");
        Ok(())
    }

    /// Load certificate and private key from PEM files.
    pub fn load_from_files(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self> {
        let cert_pem = fs::read(cert_path.as_ref())?;
        let cert = X509::from_pem(&cert_pem)?;
        let certificate = cert.to_der()?;

        let key_pem = fs::read(key_path.as_ref())?;
        let pkey = PKey::private_key_from_pem(&key_pem)?;
        let private_key = pkey.private_key_to_der()?;

        let device_id = device_id_from_cert(&cert)?;

        Ok(Self {
            device_id,
            certificate,
            private_key,
        })
    }
}

/// Extract the device id from the certificate Common Name.
fn device_id_from_cert(cert: &X509) -> Result<String> {
    for entry in cert.subject_name().entries() {
        if entry.object().nid() == openssl::nid::Nid::COMMONNAME {
            return Ok(entry.data().as_utf8()?.to_string());
        }
    }
    Err(ProtocolError::TlsHandshakeFailed(
        "certificate has no Common Name".to_string(),
    ))
}

/// Process-wide store for the local identity certificate.
///
/// Read-only after initialization; opened once and shared via `Arc`.
pub struct CertificateStore {
    dir: PathBuf,
    local: CertificateInfo,
}

impl CertificateStore {
    /// Open the store, loading the identity certificate from `dir` or
    /// generating and persisting a fresh one.
    pub fn open(dir: impl Into<PathBuf>, device_id: &str) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let cert_path = dir.join(IDENTITY_CERT_FILE);
        let key_path = dir.join(IDENTITY_KEY_FILE);

        let local = if cert_path.exists() && key_path.exists() {
            debug!("loading identity certificate from {cert_path:?}");
            CertificateInfo::load_from_files(&cert_path, &key_path)?
        } else {
            let cert = CertificateInfo::generate(device_id)?;
            cert.save_to_files(&cert_path, &key_path)?;
            cert
        };

        Ok(Self { dir, local })
    }

    /// The local identity certificate.
    pub fn local(&self) -> &CertificateInfo {
        &self.local
    }

    /// Fingerprint of the local identity certificate.
    pub fn local_fingerprint(&self) -> String {
        self.local.fingerprint()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_certificate_generation() {
        let cert = CertificateInfo::generate("test_device_123").unwrap();
        assert_eq!(cert.device_id, "test_device_123");
        assert!(!cert.certificate.is_empty());
        assert!(!cert.private_key.is_empty());
    }

    #[test]
    fn test_fingerprint_format() {
        let cert = CertificateInfo::generate("test_device").unwrap();
        let fp = cert.fingerprint();

        assert_eq!(fp.len(), 45);
        assert!(fp.starts_with("sha1:"));
        assert!(fp[5..].chars().all(|c| c.is_ascii_hexdigit()));
        assert!(!fp[5..].chars().any(|c| c.is_ascii_uppercase()));
    }

    #[test]
    fn test_fingerprint_deterministic() {
        let cert = CertificateInfo::generate("test_device").unwrap();
        assert_eq!(fingerprint(&cert.certificate), fingerprint(&cert.certificate));

        let other = CertificateInfo::generate("other_device").unwrap();
        assert_ne!(fingerprint(&cert.certificate), fingerprint(&other.certificate));
    }

    #[test]
    fn test_save_and_load() {
        let tmp = TempDir::new().unwrap();
        let cert_path = tmp.path().join("cert.pem");
        let key_path = tmp.path().join("key.pem");

        let original = CertificateInfo::generate("roundtrip_device").unwrap();
        original.save_to_files(&cert_path, &key_path).unwrap();

        let loaded = CertificateInfo::load_from_files(&cert_path, &key_path).unwrap();
        assert_eq!(loaded.device_id, "roundtrip_device");
        assert_eq!(loaded.fingerprint(), original.fingerprint());
    }

    #[test]
    fn test_store_persists_identity() {
        let tmp = TempDir::new().unwrap();

        let first = CertificateStore::open(tmp.path(), "store_device").unwrap();
        let fp = first.local_fingerprint();
        drop(first);

        let second = CertificateStore::open(tmp.path(), "store_device").unwrap();
        assert_eq!(second.local_fingerprint(), fp);
        assert_eq!(second.local().device_id, "store_device");
    }
}
