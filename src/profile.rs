//! Fingerprint profiles
//!
//! A [`FingerprintProfile`] names a browser-like ClientHello identity and
//! carries, for every optional handshake feature, the probability that a
//! genuine browser handshake includes it. Profiles are immutable values;
//! share one behind an `Arc` across every connection that samples from it.
//!
//! Wire identifiers (cipher suites, signature schemes, named groups) are kept
//! as their IANA `u16` code points so a profile can describe features the TLS
//! backend does not implement.
use std::collections::HashMap;

/// The handshake identity a profile imitates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ClientHelloId {
  /// Randomized hello, the ALPN extension is itself sampled.
  Randomized,
  /// Randomized hello that always advertises ALPN.
  #[default]
  RandomizedAlpn,
  /// Randomized hello that never advertises ALPN.
  RandomizedNoAlpn,
}

/// A TLS protocol version a plan may offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TlsVersion {
  /// TLS 1.2
  Tls12,
  /// TLS 1.3
  Tls13,
}

impl TlsVersion {
  /// IANA code point.
  pub const fn code(self) -> u16 {
    match self {
      TlsVersion::Tls12 => 0x0303,
      TlsVersion::Tls13 => 0x0304,
    }
  }
}

/// ClientHello extensions the engine knows how to plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtensionKind {
  /// server_name
  ServerName,
  /// status_request (OCSP stapling)
  StatusRequest,
  /// supported_groups
  SupportedGroups,
  /// ec_point_formats
  EcPointFormats,
  /// signature_algorithms
  SignatureAlgorithms,
  /// application_layer_protocol_negotiation
  Alpn,
  /// signed_certificate_timestamp
  SignedCertificateTimestamp,
  /// padding
  Padding,
  /// extended_master_secret
  ExtendedMasterSecret,
  /// session_ticket
  SessionTicket,
  /// supported_versions
  SupportedVersions,
  /// psk_key_exchange_modes
  PskKeyExchangeModes,
  /// key_share
  KeyShare,
  /// application_settings (ALPS)
  ApplicationSettings,
  /// renegotiation_info
  RenegotiationInfo,
}

impl ExtensionKind {
  /// IANA code point.
  pub const fn code(self) -> u16 {
    match self {
      ExtensionKind::ServerName => 0,
      ExtensionKind::StatusRequest => 5,
      ExtensionKind::SupportedGroups => 10,
      ExtensionKind::EcPointFormats => 11,
      ExtensionKind::SignatureAlgorithms => 13,
      ExtensionKind::Alpn => 16,
      ExtensionKind::SignedCertificateTimestamp => 18,
      ExtensionKind::Padding => 21,
      ExtensionKind::ExtendedMasterSecret => 23,
      ExtensionKind::SessionTicket => 35,
      ExtensionKind::SupportedVersions => 43,
      ExtensionKind::PskKeyExchangeModes => 45,
      ExtensionKind::KeyShare => 51,
      ExtensionKind::ApplicationSettings => 17513,
      ExtensionKind::RenegotiationInfo => 65281,
    }
  }

  /// Extensions that every plan carries, never sampled away.
  pub const fn is_mandatory(self) -> bool {
    matches!(
      self,
      ExtensionKind::ServerName
        | ExtensionKind::SupportedGroups
        | ExtensionKind::EcPointFormats
        | ExtensionKind::SignatureAlgorithms
    ) || self.is_tls13_only()
  }

  /// Extensions that only make sense when TLS 1.3 is offered. They are
  /// mandatory in that case.
  pub const fn is_tls13_only(self) -> bool {
    matches!(
      self,
      ExtensionKind::SupportedVersions | ExtensionKind::PskKeyExchangeModes | ExtensionKind::KeyShare
    )
  }
}

/// Cipher suite code points.
pub mod cipher {
  #![allow(missing_docs)]
  // Names follow the IANA TLS registry.

  pub const TLS13_AES_128_GCM_SHA256: u16 = 0x1301;
  pub const TLS13_AES_256_GCM_SHA384: u16 = 0x1302;
  pub const TLS13_CHACHA20_POLY1305_SHA256: u16 = 0x1303;
  pub const ECDHE_ECDSA_AES_128_GCM_SHA256: u16 = 0xc02b;
  pub const ECDHE_RSA_AES_128_GCM_SHA256: u16 = 0xc02f;
  pub const ECDHE_ECDSA_AES_256_GCM_SHA384: u16 = 0xc02c;
  pub const ECDHE_RSA_AES_256_GCM_SHA384: u16 = 0xc030;
  pub const ECDHE_ECDSA_CHACHA20_POLY1305_SHA256: u16 = 0xcca9;
  pub const ECDHE_RSA_CHACHA20_POLY1305_SHA256: u16 = 0xcca8;
  pub const ECDHE_RSA_AES_128_CBC_SHA: u16 = 0xc013;
  pub const ECDHE_RSA_AES_256_CBC_SHA: u16 = 0xc014;
  pub const RSA_AES_128_GCM_SHA256: u16 = 0x009c;
  pub const RSA_AES_256_GCM_SHA384: u16 = 0x009d;
  pub const RSA_AES_128_CBC_SHA: u16 = 0x002f;
  pub const RSA_AES_256_CBC_SHA: u16 = 0x0035;

  /// TLS 1.3 suites.
  pub const TLS13: [u16; 3] = [
    TLS13_AES_128_GCM_SHA256,
    TLS13_AES_256_GCM_SHA384,
    TLS13_CHACHA20_POLY1305_SHA256,
  ];
  /// TLS 1.2 ECDHE suites with an ECDSA certificate.
  pub const TLS12_ECDSA: [u16; 3] = [
    ECDHE_ECDSA_AES_128_GCM_SHA256,
    ECDHE_ECDSA_AES_256_GCM_SHA384,
    ECDHE_ECDSA_CHACHA20_POLY1305_SHA256,
  ];
  /// TLS 1.2 ECDHE suites with an RSA certificate.
  pub const TLS12_RSA: [u16; 3] = [
    ECDHE_RSA_AES_128_GCM_SHA256,
    ECDHE_RSA_AES_256_GCM_SHA384,
    ECDHE_RSA_CHACHA20_POLY1305_SHA256,
  ];
}

/// Signature scheme code points.
pub mod signature {
  #![allow(missing_docs)]
  // Names follow the IANA TLS registry.

  pub const RSA_PKCS1_SHA1: u16 = 0x0201;
  pub const ECDSA_SHA1: u16 = 0x0203;
  pub const RSA_PKCS1_SHA256: u16 = 0x0401;
  pub const ECDSA_NISTP256_SHA256: u16 = 0x0403;
  pub const RSA_PKCS1_SHA384: u16 = 0x0501;
  pub const ECDSA_NISTP384_SHA384: u16 = 0x0503;
  pub const RSA_PKCS1_SHA512: u16 = 0x0601;
  pub const ECDSA_NISTP521_SHA512: u16 = 0x0603;
  pub const RSA_PSS_SHA256: u16 = 0x0804;
  pub const RSA_PSS_SHA384: u16 = 0x0805;
  pub const RSA_PSS_SHA512: u16 = 0x0806;

  pub const RSA_PKCS1: [u16; 4] = [RSA_PKCS1_SHA1, RSA_PKCS1_SHA256, RSA_PKCS1_SHA384, RSA_PKCS1_SHA512];
  pub const RSA_PSS: [u16; 3] = [RSA_PSS_SHA256, RSA_PSS_SHA384, RSA_PSS_SHA512];
}

/// Named group code points.
pub mod curve {
  #![allow(missing_docs)]
  // Names follow the IANA TLS registry.

  pub const SECP256R1: u16 = 0x0017;
  pub const SECP384R1: u16 = 0x0018;
  pub const SECP521R1: u16 = 0x0019;
  pub const X25519: u16 = 0x001d;

  /// Groups any mainstream origin can complete a key exchange with.
  pub const INTEROPERABLE: [u16; 3] = [X25519, SECP256R1, SECP384R1];
}

/// A weighted feature of a profile.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Feature {
  /// Presence of an optional extension.
  Extension(ExtensionKind),
  /// Presence of a cipher suite.
  CipherSuite(u16),
  /// Presence of a signature scheme.
  SignatureScheme(u16),
  /// Presence of a named group.
  Curve(u16),
  /// Presence of an ALPN protocol id.
  AlpnProtocol(String),
  /// Offering TLS 1.3 as the maximum version.
  MaxVersionTls13,
  /// Sending the first key share for P-256 rather than X25519.
  FirstKeyShareP256,
}

/// A named handshake identity with ordered candidates and inclusion weights.
#[derive(Debug, Clone, PartialEq)]
pub struct FingerprintProfile {
  id: ClientHelloId,
  extensions: Vec<ExtensionKind>,
  cipher_suites: Vec<u16>,
  signature_schemes: Vec<u16>,
  curves: Vec<u16>,
  alpn_protocols: Vec<String>,
  weights: HashMap<Feature, f64>,
}

impl Default for FingerprintProfile {
  /// Browser-like weights observed across real Chrome/Firefox/Safari
  /// handshakes.
  fn default() -> Self {
    use ExtensionKind::*;
    let mut builder = FingerprintProfile::builder(ClientHelloId::RandomizedAlpn)
      .extensions(vec![
        ServerName,
        ExtendedMasterSecret,
        RenegotiationInfo,
        SupportedGroups,
        EcPointFormats,
        SessionTicket,
        Alpn,
        StatusRequest,
        SignatureAlgorithms,
        SignedCertificateTimestamp,
        KeyShare,
        PskKeyExchangeModes,
        SupportedVersions,
        ApplicationSettings,
        Padding,
      ])
      .cipher_suites(vec![
        cipher::TLS13_AES_128_GCM_SHA256,
        cipher::TLS13_AES_256_GCM_SHA384,
        cipher::TLS13_CHACHA20_POLY1305_SHA256,
        cipher::ECDHE_ECDSA_AES_128_GCM_SHA256,
        cipher::ECDHE_RSA_AES_128_GCM_SHA256,
        cipher::ECDHE_ECDSA_AES_256_GCM_SHA384,
        cipher::ECDHE_RSA_AES_256_GCM_SHA384,
        cipher::ECDHE_ECDSA_CHACHA20_POLY1305_SHA256,
        cipher::ECDHE_RSA_CHACHA20_POLY1305_SHA256,
        cipher::ECDHE_RSA_AES_128_CBC_SHA,
        cipher::ECDHE_RSA_AES_256_CBC_SHA,
        cipher::RSA_AES_128_GCM_SHA256,
        cipher::RSA_AES_256_GCM_SHA384,
        cipher::RSA_AES_128_CBC_SHA,
        cipher::RSA_AES_256_CBC_SHA,
      ])
      .signature_schemes(vec![
        signature::ECDSA_NISTP256_SHA256,
        signature::RSA_PSS_SHA256,
        signature::RSA_PKCS1_SHA256,
        signature::ECDSA_NISTP384_SHA384,
        signature::RSA_PSS_SHA384,
        signature::RSA_PKCS1_SHA384,
        signature::RSA_PSS_SHA512,
        signature::RSA_PKCS1_SHA512,
        signature::ECDSA_NISTP521_SHA512,
        signature::ECDSA_SHA1,
        signature::RSA_PKCS1_SHA1,
      ])
      .curves(vec![
        curve::X25519,
        curve::SECP256R1,
        curve::SECP384R1,
        curve::SECP521R1,
      ])
      .alpn_protocols(vec!["h2".to_string(), "http/1.1".to_string()])
      .weight(Feature::Extension(Alpn), 0.7)
      .weight(Feature::MaxVersionTls13, 1.0)
      .weight(Feature::SignatureScheme(signature::ECDSA_SHA1), 0.63)
      .weight(Feature::SignatureScheme(signature::ECDSA_NISTP521_SHA512), 0.59)
      .weight(Feature::SignatureScheme(signature::RSA_PSS_SHA256), 0.51)
      .weight(Feature::SignatureScheme(signature::RSA_PSS_SHA384), 0.9)
      .weight(Feature::SignatureScheme(signature::RSA_PSS_SHA512), 0.9)
      .weight(Feature::Curve(curve::X25519), 0.71)
      .weight(Feature::Curve(curve::SECP521R1), 0.46)
      .weight(Feature::Extension(Padding), 0.62)
      .weight(Feature::Extension(StatusRequest), 0.74)
      .weight(Feature::Extension(SignedCertificateTimestamp), 0.46)
      .weight(Feature::Extension(RenegotiationInfo), 0.75)
      .weight(Feature::Extension(ExtendedMasterSecret), 0.77)
      .weight(Feature::FirstKeyShareP256, 0.25)
      .weight(Feature::Extension(ApplicationSettings), 0.33);
    // Everything past the TLS 1.3 suites and the first ECDHE pair may be
    // dropped at random. The browser table removes each such suite with
    // probability 0.4, so each is kept with weight 0.6.
    for suite in [
      cipher::ECDHE_ECDSA_AES_256_GCM_SHA384,
      cipher::ECDHE_RSA_AES_256_GCM_SHA384,
      cipher::ECDHE_ECDSA_CHACHA20_POLY1305_SHA256,
      cipher::ECDHE_RSA_CHACHA20_POLY1305_SHA256,
      cipher::ECDHE_RSA_AES_128_CBC_SHA,
      cipher::ECDHE_RSA_AES_256_CBC_SHA,
      cipher::RSA_AES_128_GCM_SHA256,
      cipher::RSA_AES_256_GCM_SHA384,
      cipher::RSA_AES_128_CBC_SHA,
      cipher::RSA_AES_256_CBC_SHA,
    ] {
      builder = builder.weight(Feature::CipherSuite(suite), 0.6);
    }
    builder.build()
  }
}

impl FingerprintProfile {
  /// Start a profile with no candidates.
  pub fn builder(id: ClientHelloId) -> ProfileBuilder {
    ProfileBuilder {
      inner: FingerprintProfile {
        id,
        extensions: Vec::new(),
        cipher_suites: Vec::new(),
        signature_schemes: Vec::new(),
        curves: Vec::new(),
        alpn_protocols: Vec::new(),
        weights: HashMap::new(),
      },
    }
  }

  /// A copy of this profile with one weight replaced.
  pub fn with_weight(mut self, feature: Feature, weight: f64) -> Self {
    self.weights.insert(feature, clamp(weight));
    self
  }

  /// A copy of this profile with a different identity.
  pub fn with_id(mut self, id: ClientHelloId) -> Self {
    self.id = id;
    self
  }

  /// A copy of this profile where every candidate and every switch has the
  /// same weight.
  pub fn with_uniform_weight(mut self, weight: f64) -> Self {
    let weight = clamp(weight);
    let mut features: Vec<Feature> = Vec::new();
    features.extend(self.extensions.iter().map(|e| Feature::Extension(*e)));
    features.extend(self.cipher_suites.iter().map(|c| Feature::CipherSuite(*c)));
    features.extend(
      self
        .signature_schemes
        .iter()
        .map(|s| Feature::SignatureScheme(*s)),
    );
    features.extend(self.curves.iter().map(|c| Feature::Curve(*c)));
    features.extend(
      self
        .alpn_protocols
        .iter()
        .map(|p| Feature::AlpnProtocol(p.clone())),
    );
    features.push(Feature::MaxVersionTls13);
    features.push(Feature::FirstKeyShareP256);
    self.weights = features.into_iter().map(|f| (f, weight)).collect();
    self
  }

  /// The handshake identity.
  pub fn id(&self) -> ClientHelloId {
    self.id
  }

  /// Extension candidates, in wire order.
  pub fn extensions(&self) -> &[ExtensionKind] {
    &self.extensions
  }

  /// Cipher suite candidates, in preference order.
  pub fn cipher_suites(&self) -> &[u16] {
    &self.cipher_suites
  }

  /// Signature scheme candidates, in preference order.
  pub fn signature_schemes(&self) -> &[u16] {
    &self.signature_schemes
  }

  /// Named group candidates, in preference order.
  pub fn curves(&self) -> &[u16] {
    &self.curves
  }

  /// ALPN protocol candidates, in preference order.
  pub fn alpn_protocols(&self) -> &[String] {
    &self.alpn_protocols
  }

  /// Inclusion probability of a feature. Unlisted features are always
  /// included.
  pub fn weight(&self, feature: &Feature) -> f64 {
    self.weights.get(feature).copied().unwrap_or(1.0)
  }
}

/// Builder for a [`FingerprintProfile`].
#[derive(Debug, Clone)]
pub struct ProfileBuilder {
  inner: FingerprintProfile,
}

impl ProfileBuilder {
  /// Set the extension candidates.
  pub fn extensions(mut self, value: Vec<ExtensionKind>) -> Self {
    self.inner.extensions = value;
    self
  }
  /// Set the cipher suite candidates.
  pub fn cipher_suites(mut self, value: Vec<u16>) -> Self {
    self.inner.cipher_suites = value;
    self
  }
  /// Set the signature scheme candidates.
  pub fn signature_schemes(mut self, value: Vec<u16>) -> Self {
    self.inner.signature_schemes = value;
    self
  }
  /// Set the named group candidates.
  pub fn curves(mut self, value: Vec<u16>) -> Self {
    self.inner.curves = value;
    self
  }
  /// Set the ALPN protocol candidates.
  pub fn alpn_protocols(mut self, value: Vec<String>) -> Self {
    self.inner.alpn_protocols = value;
    self
  }
  /// Set the inclusion probability of one feature, clamped to `[0, 1]`.
  pub fn weight(mut self, feature: Feature, weight: f64) -> Self {
    self.inner.weights.insert(feature, clamp(weight));
    self
  }
  /// Finish the profile.
  pub fn build(self) -> FingerprintProfile {
    self.inner
  }
}

fn clamp(weight: f64) -> f64 {
  if weight.is_nan() {
    0.0
  } else {
    weight.clamp(0.0, 1.0)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_profile_carries_browser_weights() {
    let profile = FingerprintProfile::default();
    assert_eq!(profile.id(), ClientHelloId::RandomizedAlpn);
    assert_eq!(
      profile.weight(&Feature::Extension(ExtensionKind::Padding)),
      0.62
    );
    assert_eq!(profile.weight(&Feature::FirstKeyShareP256), 0.25);
    assert_eq!(
      profile.weight(&Feature::CipherSuite(cipher::TLS13_AES_128_GCM_SHA256)),
      1.0
    );
    assert_eq!(profile.weight(&Feature::Curve(curve::SECP521R1)), 0.46);
    // Removable suites are dropped 40% of the time.
    assert_eq!(
      profile.weight(&Feature::CipherSuite(cipher::ECDHE_RSA_AES_256_GCM_SHA384)),
      0.6
    );
  }

  #[test]
  fn weights_are_clamped() {
    let profile = FingerprintProfile::default()
      .with_weight(Feature::MaxVersionTls13, 3.5)
      .with_weight(Feature::FirstKeyShareP256, -1.0)
      .with_weight(Feature::Curve(curve::X25519), f64::NAN);
    assert_eq!(profile.weight(&Feature::MaxVersionTls13), 1.0);
    assert_eq!(profile.weight(&Feature::FirstKeyShareP256), 0.0);
    assert_eq!(profile.weight(&Feature::Curve(curve::X25519)), 0.0);
  }

  #[test]
  fn uniform_weight_covers_every_candidate() {
    let profile = FingerprintProfile::default().with_uniform_weight(0.0);
    for suite in profile.cipher_suites() {
      assert_eq!(profile.weight(&Feature::CipherSuite(*suite)), 0.0);
    }
    for proto in profile.alpn_protocols() {
      assert_eq!(profile.weight(&Feature::AlpnProtocol(proto.clone())), 0.0);
    }
    assert_eq!(profile.weight(&Feature::MaxVersionTls13), 0.0);
  }

  #[test]
  fn mandatory_extensions() {
    assert!(ExtensionKind::ServerName.is_mandatory());
    assert!(ExtensionKind::KeyShare.is_mandatory());
    assert!(ExtensionKind::KeyShare.is_tls13_only());
    assert!(!ExtensionKind::Padding.is_mandatory());
    assert_eq!(ExtensionKind::RenegotiationInfo.code(), 0xff01);
  }
}
