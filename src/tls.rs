//! TLS configuration
//!
//! Turns a [`HandshakePlan`] into a rustls [`ClientConfig`] for the origin
//! side, and builds the [`ServerConfig`] that terminates the client side of a
//! `CONNECT` tunnel.
//!
//! rustls exposes the cipher suite list, the named groups and their order,
//! the signature schemes, ALPN, protocol versions and session ticket
//! resumption. Planned extensions outside that set (padding,
//! status_request, SCT, ALPS, renegotiation_info) stay in the plan and its
//! JA3 text but are not written on the wire.
use crate::errors::{Error, Result};
use crate::plan::HandshakePlan;
use crate::profile::{ExtensionKind, TlsVersion};
use std::sync::Arc;
use tokio_rustls::rustls;
use tokio_rustls::rustls::client::danger::{
  HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::client::{Resumption, Tls12Resumption};
use tokio_rustls::rustls::crypto::{ring, CryptoProvider, SupportedKxGroup};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{
  CipherSuite, ClientConfig, DigitallySignedStruct, Error as TLSError, NamedGroup, ServerConfig,
  SignatureScheme, SupportedCipherSuite,
};

/// The crypto provider every config is built on.
pub fn crypto_provider() -> CryptoProvider {
  ring::default_provider()
}

/// Build the outbound client configuration realizing `plan`.
pub fn client_config(plan: &HandshakePlan) -> Result<ClientConfig> {
  let base = crypto_provider();
  let tls13 = plan.max_version == TlsVersion::Tls13;

  let mut cipher_suites: Vec<SupportedCipherSuite> = plan
    .cipher_suites
    .iter()
    .filter_map(|code| {
      base
        .cipher_suites
        .iter()
        .find(|s| s.suite() == CipherSuite::from(*code))
        .copied()
    })
    .filter(|s| tls13 || !matches!(s, SupportedCipherSuite::Tls13(_)))
    .collect();
  if cipher_suites.is_empty() {
    cipher_suites = base
      .cipher_suites
      .iter()
      .filter(|s| tls13 || !matches!(s, SupportedCipherSuite::Tls13(_)))
      .copied()
      .collect();
  }

  // rustls sends a key share for the first group only
  let mut group_order = vec![plan.key_share];
  group_order.extend(plan.curves.iter().filter(|c| **c != plan.key_share));
  let mut kx_groups: Vec<&'static dyn SupportedKxGroup> = group_order
    .into_iter()
    .filter_map(|code| {
      base
        .kx_groups
        .iter()
        .find(|g| g.name() == NamedGroup::from(code))
        .copied()
    })
    .collect();
  if kx_groups.is_empty() {
    kx_groups = base.kx_groups.clone();
  }

  let versions: &[&'static rustls::SupportedProtocolVersion] = if tls13 {
    &[&rustls::version::TLS13, &rustls::version::TLS12]
  } else {
    &[&rustls::version::TLS12]
  };

  let provider = CryptoProvider {
    cipher_suites,
    kx_groups,
    ..base
  };
  let verifier = NoVerifier::new(
    plan
      .signature_schemes
      .iter()
      .map(|code| SignatureScheme::from(*code))
      .collect(),
  );
  let mut config = ClientConfig::builder_with_provider(Arc::new(provider))
    .with_protocol_versions(versions)?
    .dangerous()
    .with_custom_certificate_verifier(Arc::new(verifier))
    .with_no_client_auth();
  if plan.has_extension(ExtensionKind::Alpn) {
    config.alpn_protocols = plan
      .alpn_protocols
      .iter()
      .map(|p| p.as_bytes().to_vec())
      .collect();
  }
  if !plan.has_extension(ExtensionKind::SessionTicket) {
    config.resumption = Resumption::default().tls12_resumption(Tls12Resumption::SessionIdOnly);
  }
  Ok(config)
}

/// Server configuration presenting a substituted certificate to the client.
pub fn server_config(
  cert_chain: Vec<rustls_pki_types::CertificateDer<'static>>,
  key: rustls_pki_types::PrivateKeyDer<'static>,
) -> Result<ServerConfig> {
  let mut config = ServerConfig::builder_with_provider(Arc::new(crypto_provider()))
    .with_safe_default_protocol_versions()?
    .with_no_client_auth()
    .with_single_cert(cert_chain, key)
    .map_err(|e| Error::tls_error(format!("Failed to create TLS config: {}", e)))?;
  config.alpn_protocols = vec![b"http/1.1".to_vec()];
  Ok(config)
}

/// Accepts any origin certificate.
///
/// The proxy re-originates TLS towards arbitrary origins while presenting a
/// browser-like identity, and the client side of the proxy is where trust is
/// decided. Origin certificates are therefore not validated here. The
/// advertised signature schemes come from the handshake plan.
#[derive(Debug)]
pub(crate) struct NoVerifier {
  schemes: Vec<SignatureScheme>,
}

impl NoVerifier {
  pub(crate) fn new(schemes: Vec<SignatureScheme>) -> Self {
    Self { schemes }
  }
}

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer<'_>,
    _intermediates: &[CertificateDer<'_>],
    _server_name: &ServerName<'_>,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, TLSError> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer<'_>,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer<'_>,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    self.schemes.clone()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::plan::build_handshake_plan_with;
  use crate::profile::{curve, ClientHelloId, FingerprintProfile};
  use rand::rngs::StdRng;
  use rand::SeedableRng;

  #[test]
  fn every_sampled_plan_builds_a_config() {
    let profiles = [
      FingerprintProfile::default(),
      FingerprintProfile::default().with_id(ClientHelloId::Randomized),
      FingerprintProfile::default().with_uniform_weight(0.0),
      FingerprintProfile::default().with_uniform_weight(0.5),
    ];
    let mut rng = StdRng::seed_from_u64(11);
    for profile in &profiles {
      for _ in 0..100 {
        let plan = build_handshake_plan_with(profile, &mut rng);
        let config = client_config(&plan).unwrap();
        assert!(!config.crypto_provider().cipher_suites.is_empty());
        assert_eq!(
          u16::from(config.crypto_provider().kx_groups[0].name()),
          plan.key_share
        );
      }
    }
  }

  #[test]
  fn plan_shapes_the_config() {
    let profile = FingerprintProfile::default().with_uniform_weight(0.0);
    let plan = build_handshake_plan_with(&profile, &mut StdRng::seed_from_u64(5));
    let config = client_config(&plan).unwrap();
    assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    assert!(config
      .crypto_provider()
      .cipher_suites
      .iter()
      .all(|s| !matches!(s, SupportedCipherSuite::Tls13(_))));
    let groups: Vec<u16> = config
      .crypto_provider()
      .kx_groups
      .iter()
      .map(|g| u16::from(g.name()))
      .collect();
    assert_eq!(groups, vec![curve::X25519, curve::SECP256R1]);
  }

  #[test]
  fn verifier_advertises_planned_schemes() {
    let verifier = NoVerifier::new(vec![SignatureScheme::ECDSA_NISTP256_SHA256]);
    assert_eq!(
      verifier.supported_verify_schemes(),
      vec![SignatureScheme::ECDSA_NISTP256_SHA256]
    );
  }
}
