//! Certificate substitution
//!
//! A locally trusted root CA signs one leaf certificate per intercepted
//! hostname. The CA is loaded from (or generated into) a storage directory
//! once; leaves are cached in memory.

use crate::errors::{Error, Result};
use async_trait::async_trait;
use moka::future::Cache;
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
  Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

/// Leaf validity in seconds
const TTL_SECS: i64 = 365 * 24 * 60 * 60;
/// Leaves are evicted well before they expire
const CACHE_TTL: u64 = (TTL_SECS / 2) as u64;
/// Backdating for clients with skewed clocks
const NOT_BEFORE_OFFSET: i64 = 60;
const CACHE_CAPACITY: u64 = 1000;

const CA_CERT_FILE: &str = "cert.pem";
const CA_KEY_FILE: &str = "key.pem";

/// A certificate chain (leaf first) and the leaf's private key.
pub type CertifiedLeaf = (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>);

/// Supplies server certificates for intercepted hostnames.
#[async_trait]
pub trait CertificateSource: Send + Sync {
  /// Certificate for `hostname`, trusted by clients that trust this
  /// source's root.
  async fn leaf_certificate(&self, hostname: &str) -> Result<CertifiedLeaf>;
}

/// Root certificate authority used to sign leaves.
pub struct CertificateAuthority {
  issuer: Issuer<'static, KeyPair>,
  ca_cert_der: CertificateDer<'static>,
  ca_cert_pem: String,
  storage_path: Option<PathBuf>,
}

impl std::fmt::Debug for CertificateAuthority {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CertificateAuthority")
      .field("storage_path", &self.storage_path)
      .finish_non_exhaustive()
  }
}

impl CertificateAuthority {
  /// Load the CA stored under `storage_path`, generating and saving a new one
  /// if either file is missing.
  pub async fn load_or_generate(storage_path: impl AsRef<Path>) -> Result<Self> {
    let storage_path = storage_path.as_ref().to_path_buf();
    fs::create_dir_all(&storage_path).await?;
    let cert_path = storage_path.join(CA_CERT_FILE);
    let key_path = storage_path.join(CA_KEY_FILE);

    let mut ca = if fs::try_exists(&cert_path).await? && fs::try_exists(&key_path).await? {
      let cert_pem = fs::read_to_string(&cert_path).await?;
      let key_pem = fs::read_to_string(&key_path).await?;
      tracing::debug!("loaded CA from {}", storage_path.display());
      Self::from_pem(&cert_pem, &key_pem)?
    } else {
      let (ca, key_pem) = Self::generate_with_key()?;
      fs::write(&cert_path, ca.ca_cert_pem.as_bytes()).await?;
      fs::write(&key_path, key_pem.as_bytes()).await?;
      tracing::info!("generated CA at {}", cert_path.display());
      ca
    };
    ca.storage_path = Some(storage_path);
    Ok(ca)
  }

  /// Generate a CA that only lives in memory.
  pub fn generate() -> Result<Self> {
    Ok(Self::generate_with_key()?.0)
  }

  fn generate_with_key() -> Result<(Self, String)> {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Hazetunnel MITM CA");
    dn.push(DnType::OrganizationName, "Hazetunnel");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
      KeyUsagePurpose::KeyCertSign,
      KeyUsagePurpose::CrlSign,
      KeyUsagePurpose::DigitalSignature,
    ];
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::days(3650);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate_error(format!("Failed to generate key pair: {}", e)))?;
    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::certificate_error(format!("Failed to generate CA: {}", e)))?;
    let key_pem = key_pair.serialize_pem();
    let ca = Self::from_pem(&cert.pem(), &key_pem)?;
    Ok((ca, key_pem))
  }

  /// Build from a PEM encoded CA certificate and private key.
  pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
    let key_pair = KeyPair::from_pem(key_pem)
      .map_err(|e| Error::certificate_error(format!("Failed to parse CA key: {}", e)))?;
    let issuer = Issuer::from_ca_cert_pem(cert_pem, key_pair).map_err(|e| {
      Error::certificate_error(format!("Failed to create issuer from CA cert: {}", e))
    })?;
    let ca_cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::certificate_error("No certificate found in PEM"))?
      .map_err(|e| Error::certificate_error(format!("Failed to parse PEM: {}", e)))?;
    Ok(Self {
      issuer,
      ca_cert_der,
      ca_cert_pem: cert_pem.to_string(),
      storage_path: None,
    })
  }

  /// Sign a fresh leaf for `hostname`. IP literals get an IP SAN.
  pub fn issue(&self, hostname: &str) -> Result<CertifiedLeaf> {
    let mut params = CertificateParams::default();
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, hostname);
    params.distinguished_name = dn;
    params.subject_alt_names = match hostname.parse::<IpAddr>() {
      Ok(ip) => vec![SanType::IpAddress(ip)],
      Err(_) => vec![SanType::DnsName(hostname.try_into().map_err(|_| {
        Error::certificate_error(format!("Invalid domain name: {}", hostname))
      })?)],
    };
    params.key_usages = vec![
      KeyUsagePurpose::DigitalSignature,
      KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::seconds(TTL_SECS);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate_error(format!("Failed to generate key pair: {}", e)))?;
    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::certificate_error(format!("Failed to sign server cert: {}", e)))?;
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|_| Error::certificate_error("Failed to serialize server key"))?;
    Ok((
      vec![CertificateDer::from(cert.der().to_vec()), self.ca_cert_der.clone()],
      key_der,
    ))
  }

  /// The CA certificate in PEM, for installing into clients.
  pub fn ca_cert_pem(&self) -> &str {
    &self.ca_cert_pem
  }

  /// The CA certificate in DER.
  pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
    &self.ca_cert_der
  }

  /// Where the CA certificate is stored, if it was loaded from disk.
  pub fn ca_cert_path(&self) -> Option<PathBuf> {
    self.storage_path.as_ref().map(|p| p.join(CA_CERT_FILE))
  }
}

/// Caching [`CertificateSource`] backed by a [`CertificateAuthority`].
pub struct CertificateManager {
  ca: CertificateAuthority,
  cert_cache: Cache<String, Arc<CertifiedLeaf>>,
}

impl CertificateManager {
  /// Load or generate the CA under `storage_path`.
  pub async fn new(storage_path: impl AsRef<Path>) -> Result<Self> {
    Ok(Self::with_authority(
      CertificateAuthority::load_or_generate(storage_path).await?,
    ))
  }

  /// Wrap an existing authority.
  pub fn with_authority(ca: CertificateAuthority) -> Self {
    let cert_cache = Cache::builder()
      .max_capacity(CACHE_CAPACITY)
      .time_to_live(std::time::Duration::from_secs(CACHE_TTL))
      .build();
    Self { ca, cert_cache }
  }

  /// The signing authority.
  pub fn authority(&self) -> &CertificateAuthority {
    &self.ca
  }

  /// Leaf for `hostname`, issued once per cache lifetime. Concurrent
  /// requests for the same host share one issuance.
  pub async fn get_server_cert(&self, hostname: &str) -> Result<CertifiedLeaf> {
    let key = hostname.to_ascii_lowercase();
    let leaf = self
      .cert_cache
      .try_get_with(key.clone(), async { self.ca.issue(&key).map(Arc::new) })
      .await
      .map_err(|e: Arc<Error>| Error::Certificate(e.to_string()))?;
    let (chain, key) = leaf.as_ref();
    Ok((chain.clone(), key.clone_key()))
  }
}

#[async_trait]
impl CertificateSource for CertificateManager {
  async fn leaf_certificate(&self, hostname: &str) -> Result<CertifiedLeaf> {
    self.get_server_cert(hostname).await
  }
}
