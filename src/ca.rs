//! Local certificate authority.
//!
//! Generates a self-signed RSA root once, persists it under a per-user
//! directory, and mints per-host leaf certificates signed by it. Leaves are
//! cached in memory; the root is never regenerated silently if only one of
//! its two files survives, since that would invalidate previously trusted
//! deployments.
//!
//! The minted leaves are infrastructure for terminating tunneled TLS; the
//! tunnel itself currently relays opaque bytes and does not use them.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use rand::Rng;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, Issuer, KeyPair, KeyUsagePurpose, SerialNumber,
};
use rsa::RsaPrivateKey;
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rustls_pki_types::PrivatePkcs8KeyDer;
use time::{Duration, OffsetDateTime};

use crate::error::CaError;

/// File name of the PEM-encoded root certificate.
pub const CA_CERT_FILE: &str = "ca.pem";
/// File name of the PEM-encoded root private key (traditional OpenSSL form).
pub const CA_KEY_FILE: &str = "ca.key";

const ROOT_COMMON_NAME: &str = "LokiProxy Local Test CA";
const RSA_BITS: usize = 2048;
const ROOT_VALIDITY_DAYS: i64 = 3650;
const LEAF_VALIDITY_DAYS: i64 = 825;

/// Per-user directory holding the root material (`~/.lokiproxy`).
pub fn default_dir() -> Result<PathBuf, CaError> {
    dirs::home_dir()
        .map(|home| home.join(".lokiproxy"))
        .ok_or(CaError::NoHomeDir)
}

/// A minted per-host certificate and its private key, both PEM-encoded.
#[derive(Debug, Clone)]
pub struct LeafCert {
    /// PEM certificate chainable to the root.
    pub cert_pem: String,
    /// PEM RSA private key.
    pub key_pem: String,
}

/// The persisted root plus an in-memory cache of issued leaves.
#[derive(Debug)]
pub struct CertificateAuthority {
    dir: PathBuf,
    root_cert_pem: String,
    root_key_pem: String,
    leaves: HashMap<String, LeafCert>,
}

impl CertificateAuthority {
    /// Load the root from `dir`, generating and persisting it on first use.
    ///
    /// Fails rather than regenerate when exactly one of the two root files is
    /// present.
    pub fn ensure_root(dir: impl Into<PathBuf>) -> Result<Self, CaError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| CaError::Io {
            path: dir.clone(),
            source,
        })?;
        let cert_path = dir.join(CA_CERT_FILE);
        let key_path = dir.join(CA_KEY_FILE);

        let (root_cert_pem, root_key_pem) = match (cert_path.exists(), key_path.exists()) {
            (true, true) => {
                let cert = read_pem(&cert_path)?;
                let key = read_pem(&key_path)?;
                (cert, key)
            }
            (true, false) => {
                return Err(CaError::IncompleteRoot {
                    present: cert_path,
                    missing: key_path,
                });
            }
            (false, true) => {
                return Err(CaError::IncompleteRoot {
                    present: key_path,
                    missing: cert_path,
                });
            }
            (false, false) => {
                let (cert, key) = generate_root()?;
                write_private(&key_path, &key)?;
                write_private(&cert_path, &cert)?;
                tracing::info!(dir = %dir.display(), "generated new root CA");
                (cert, key)
            }
        };

        Ok(Self {
            dir,
            root_cert_pem,
            root_key_pem,
            leaves: HashMap::new(),
        })
    }

    /// Load or create the root under the default per-user directory.
    pub fn open_default() -> Result<Self, CaError> {
        Self::ensure_root(default_dir()?)
    }

    /// Path of the persisted root certificate.
    pub fn cert_path(&self) -> PathBuf {
        self.dir.join(CA_CERT_FILE)
    }

    /// Path of the persisted root key.
    pub fn key_path(&self) -> PathBuf {
        self.dir.join(CA_KEY_FILE)
    }

    /// PEM encoding of the root certificate.
    pub fn root_cert_pem(&self) -> &str {
        &self.root_cert_pem
    }

    /// PEM encoding of the root private key.
    pub fn root_key_pem(&self) -> &str {
        &self.root_key_pem
    }

    /// Leaf certificate and key for `hostname`, minting on first request and
    /// serving repeats from the cache.
    pub fn leaf_for(&mut self, hostname: &str) -> Result<LeafCert, CaError> {
        if let Some(leaf) = self.leaves.get(hostname) {
            return Ok(leaf.clone());
        }
        let leaf = issue_leaf(hostname, &self.root_cert_pem, &self.root_key_pem)?;
        self.leaves.insert(hostname.to_string(), leaf.clone());
        Ok(leaf)
    }
}

/// Mint a fresh RSA leaf for `hostname`, signed by the given root material.
///
/// The certificate carries `CommonName=hostname`, a DNS subject alternative
/// name, and a non-critical serverAuth extended key usage; validity runs from
/// one day in the past to 825 days out.
pub fn issue_leaf(
    hostname: &str,
    root_cert_pem: &str,
    root_key_pem: &str,
) -> Result<LeafCert, CaError> {
    let root_key = RsaPrivateKey::from_pkcs1_pem(root_key_pem).map_err(|err| {
        CaError::KeyGeneration {
            reason: format!("failed to parse root key PEM: {err}"),
        }
    })?;
    let issuer = Issuer::from_ca_cert_pem(root_cert_pem, signing_key(&root_key)?).map_err(
        |err| CaError::CertificateBuild {
            reason: format!("failed to parse root certificate: {err}"),
        },
    )?;

    let leaf_key = generate_rsa_key()?;
    let leaf_signer = signing_key(&leaf_key)?;

    let mut params = CertificateParams::new(vec![hostname.to_string()]).map_err(|err| {
        CaError::CertificateBuild {
            reason: format!("invalid subject alt name '{hostname}': {err}"),
        }
    })?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, hostname);
    params.distinguished_name = dn;
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.not_before = OffsetDateTime::now_utc() - Duration::days(1);
    params.not_after = OffsetDateTime::now_utc() + Duration::days(LEAF_VALIDITY_DAYS);
    params.serial_number = Some(random_serial());

    let cert = params
        .signed_by(&leaf_signer, &issuer)
        .map_err(|err| CaError::CertificateBuild {
            reason: format!("failed to sign leaf for '{hostname}': {err}"),
        })?;

    Ok(LeafCert {
        cert_pem: cert.pem(),
        key_pem: pkcs1_pem(&leaf_key)?,
    })
}

fn generate_root() -> Result<(String, String), CaError> {
    let key = generate_rsa_key()?;
    let signer = signing_key(&key)?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, ROOT_COMMON_NAME);
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
    ];
    params.not_before = OffsetDateTime::now_utc() - Duration::days(1);
    params.not_after = OffsetDateTime::now_utc() + Duration::days(ROOT_VALIDITY_DAYS);
    params.serial_number = Some(random_serial());

    let cert = params
        .self_signed(&signer)
        .map_err(|err| CaError::CertificateBuild {
            reason: format!("failed to self-sign root: {err}"),
        })?;

    Ok((cert.pem(), pkcs1_pem(&key)?))
}

fn generate_rsa_key() -> Result<RsaPrivateKey, CaError> {
    RsaPrivateKey::new(&mut rand::thread_rng(), RSA_BITS).map_err(|err| CaError::KeyGeneration {
        reason: format!("RSA key generation failed: {err}"),
    })
}

/// Bridge an RSA key into an rcgen signing key (SHA-256, PKCS#1 v1.5).
fn signing_key(key: &RsaPrivateKey) -> Result<KeyPair, CaError> {
    let der = key.to_pkcs8_der().map_err(|err| CaError::KeyGeneration {
        reason: format!("PKCS#8 encoding failed: {err}"),
    })?;
    let pkcs8 = PrivatePkcs8KeyDer::from(der.as_bytes().to_vec());
    KeyPair::from_pkcs8_der_and_sign_algo(&pkcs8, &rcgen::PKCS_RSA_SHA256).map_err(|err| {
        CaError::KeyGeneration {
            reason: format!("signing key import failed: {err}"),
        }
    })
}

/// Traditional OpenSSL (`BEGIN RSA PRIVATE KEY`) encoding, unencrypted.
fn pkcs1_pem(key: &RsaPrivateKey) -> Result<String, CaError> {
    key.to_pkcs1_pem(LineEnding::LF)
        .map(|pem| pem.to_string())
        .map_err(|err| CaError::KeyGeneration {
            reason: format!("PKCS#1 encoding failed: {err}"),
        })
}

/// Random positive 160-bit serial number.
fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; 20];
    rand::thread_rng().fill(&mut bytes);
    bytes[0] &= 0x7f;
    SerialNumber::from(bytes.to_vec())
}

fn read_pem(path: &Path) -> Result<String, CaError> {
    fs::read_to_string(path).map_err(|source| CaError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &str) -> Result<(), CaError> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(|source| CaError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    file.write_all(contents.as_bytes())
        .map_err(|source| CaError::Io {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &str) -> Result<(), CaError> {
    fs::write(path, contents).map_err(|source| CaError::Io {
        path: path.to_path_buf(),
        source,
    })
}
