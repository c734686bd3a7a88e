//! Root CA management for TLS interception.
//!
//! Generates a self-signed root certificate on first run and hands it to
//! hudsucker, which signs per-host leaf certificates on the fly. The
//! operator installs the root into their browser's trust store once.

use std::fs;
use std::path::{Path, PathBuf};

use hudsucker::certificate_authority::RcgenAuthority;
use hudsucker::rcgen::{CertificateParams, KeyPair};
use hudsucker::rustls::crypto::aws_lc_rs::default_provider;

pub use crate::error::CaManagerError;

const CA_CERT_FILENAME: &str = "lyrebird-ca.crt";
const CA_KEY_FILENAME: &str = "lyrebird-ca.key";
const CA_COMMON_NAME: &str = "Lyrebird Root CA";

/// How many leaf certificates hudsucker caches before re-signing.
const LEAF_CACHE_SIZE: u64 = 1000;

/// Owns the root CA files for the MITM proxy.
#[derive(Debug, Clone)]
pub struct CaManager {
    ca_dir: PathBuf,
}

impl CaManager {
    /// Creates a manager rooted at the given directory.
    pub fn new(ca_dir: impl AsRef<Path>) -> Self {
        CaManager {
            ca_dir: ca_dir.as_ref().to_path_buf(),
        }
    }

    /// Creates a manager using the per-user data directory.
    pub fn with_default_dir() -> Result<Self, CaManagerError> {
        let project_dirs = directories::ProjectDirs::from("com", "lyrebird", "Lyrebird")
            .ok_or_else(|| CaManagerError::Generation("failed to resolve project dirs".into()))?;
        Ok(CaManager::new(project_dirs.data_dir().join("ca")))
    }

    /// Path to the CA certificate file.
    pub fn cert_path(&self) -> PathBuf {
        self.ca_dir.join(CA_CERT_FILENAME)
    }

    /// Path to the CA private key file.
    pub fn key_path(&self) -> PathBuf {
        self.ca_dir.join(CA_KEY_FILENAME)
    }

    /// Whether both CA files exist.
    pub fn ca_exists(&self) -> bool {
        self.cert_path().exists() && self.key_path().exists()
    }

    /// Loads the CA, generating it first if necessary.
    pub fn ensure_ca(&self) -> Result<RcgenAuthority, CaManagerError> {
        if !self.ca_exists() {
            self.generate_ca()?;
        }
        self.load_authority()
    }

    /// Generates a fresh root CA key pair and self-signed certificate.
    pub fn generate_ca(&self) -> Result<(), CaManagerError> {
        fs::create_dir_all(&self.ca_dir)?;

        let key_pair =
            KeyPair::generate().map_err(|e| CaManagerError::Generation(e.to_string()))?;

        let mut params = CertificateParams::new(vec![CA_COMMON_NAME.to_string()])
            .map_err(|e| CaManagerError::Generation(e.to_string()))?;
        params.is_ca =
            hudsucker::rcgen::IsCa::Ca(hudsucker::rcgen::BasicConstraints::Unconstrained);
        params.key_usages = vec![
            hudsucker::rcgen::KeyUsagePurpose::KeyCertSign,
            hudsucker::rcgen::KeyUsagePurpose::CrlSign,
            hudsucker::rcgen::KeyUsagePurpose::DigitalSignature,
        ];
        params.extended_key_usages = vec![
            hudsucker::rcgen::ExtendedKeyUsagePurpose::ServerAuth,
            hudsucker::rcgen::ExtendedKeyUsagePurpose::ClientAuth,
        ];

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| CaManagerError::Generation(e.to_string()))?;

        fs::write(self.cert_path(), cert.pem())
            .map_err(|e| CaManagerError::Write(e.to_string()))?;
        fs::write(self.key_path(), key_pair.serialize_pem())
            .map_err(|e| CaManagerError::Write(e.to_string()))?;

        tracing::info!("generated new CA certificate at {:?}", self.cert_path());
        Ok(())
    }

    /// Loads the CA files into a hudsucker signing authority.
    pub fn load_authority(&self) -> Result<RcgenAuthority, CaManagerError> {
        let cert_pem = fs::read_to_string(self.cert_path())?;
        let key_pem = fs::read_to_string(self.key_path())?;

        let key_pair =
            KeyPair::from_pem(&key_pem).map_err(|e| CaManagerError::Parse(e.to_string()))?;
        let ca_cert = CertificateParams::from_ca_cert_pem(&cert_pem)
            .map_err(|e| CaManagerError::Parse(e.to_string()))?
            .self_signed(&key_pair)
            .map_err(|e| CaManagerError::Parse(e.to_string()))?;

        Ok(RcgenAuthority::new(
            key_pair,
            ca_cert,
            LEAF_CACHE_SIZE,
            default_provider(),
        ))
    }
}
