//! Handshake plan sampling
//!
//! Every outbound TLS attempt asks a [`PlanSource`] for a fresh
//! [`HandshakePlan`]. Plans are never cached or reused, so two connections to
//! the same origin do not share a fingerprint by construction.
use crate::profile::{
  cipher, curve, signature, ClientHelloId, ExtensionKind, Feature, FingerprintProfile, TlsVersion,
};
use rand::Rng;
use std::sync::Arc;

/// A concrete ClientHello construction sampled from a profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakePlan {
  /// Identity of the profile the plan was drawn from
  pub id: ClientHelloId,
  /// Lowest version offered, always TLS 1.2
  pub min_version: TlsVersion,
  /// Highest version offered
  pub max_version: TlsVersion,
  /// Cipher suites in preference order
  pub cipher_suites: Vec<u16>,
  /// Extensions in wire order
  pub extensions: Vec<ExtensionKind>,
  /// Signature schemes in preference order
  pub signature_schemes: Vec<u16>,
  /// Named groups in preference order
  pub curves: Vec<u16>,
  /// Group of the key share sent in the hello
  pub key_share: u16,
  /// ALPN protocol ids, empty when the ALPN extension is not planned
  pub alpn_protocols: Vec<String>,
}

impl HandshakePlan {
  /// Whether the plan carries an extension.
  pub fn has_extension(&self, kind: ExtensionKind) -> bool {
    self.extensions.contains(&kind)
  }

  /// JA3 text of the planned hello:
  /// `version,ciphers,extensions,curves,point_formats`.
  pub fn ja3_text(&self) -> String {
    fn join<I: IntoIterator<Item = u16>>(values: I) -> String {
      values
        .into_iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("-")
    }
    format!(
      "{},{},{},{},0",
      TlsVersion::Tls12.code(),
      join(self.cipher_suites.iter().copied()),
      join(self.extensions.iter().map(|e| e.code())),
      join(self.curves.iter().copied()),
    )
  }
}

/// Sample a plan using the thread-local RNG.
pub fn build_handshake_plan(profile: &FingerprintProfile) -> HandshakePlan {
  build_handshake_plan_with(profile, &mut rand::thread_rng())
}

/// Sample a plan from `profile` with independent weighted coin flips.
///
/// Categories that end up empty or unusable are topped up with a fixed
/// baseline, so the result can always complete a handshake with a
/// mainstream origin even when every weight is zero.
pub fn build_handshake_plan_with<R: Rng + ?Sized>(
  profile: &FingerprintProfile,
  rng: &mut R,
) -> HandshakePlan {
  let max_version = if flip(rng, profile.weight(&Feature::MaxVersionTls13)) {
    TlsVersion::Tls13
  } else {
    TlsVersion::Tls12
  };
  let tls13 = max_version == TlsVersion::Tls13;

  let mut cipher_suites: Vec<u16> = sample(rng, profile, profile.cipher_suites(), |c| {
    Feature::CipherSuite(*c)
  });
  if !tls13 {
    cipher_suites.retain(|c| !cipher::TLS13.contains(c));
  }
  ensure_cipher_baseline(&mut cipher_suites, tls13);

  let mut signature_schemes = sample(rng, profile, profile.signature_schemes(), |s| {
    Feature::SignatureScheme(*s)
  });
  ensure_signature_baseline(&mut signature_schemes, tls13);

  let mut curves = sample(rng, profile, profile.curves(), |c| Feature::Curve(*c));
  ensure_curve_baseline(&mut curves);

  let key_share = pick_key_share(rng, profile, &curves);

  let alpn_planned = match profile.id() {
    ClientHelloId::RandomizedAlpn => true,
    ClientHelloId::RandomizedNoAlpn => false,
    ClientHelloId::Randomized => flip(rng, profile.weight(&Feature::Extension(ExtensionKind::Alpn))),
  };
  let mut alpn_protocols = Vec::new();
  if alpn_planned {
    alpn_protocols = sample(rng, profile, profile.alpn_protocols(), |p| {
      Feature::AlpnProtocol(p.clone())
    });
    if alpn_protocols.is_empty() {
      alpn_protocols.push("http/1.1".to_string());
    }
  }

  let mut extensions = Vec::with_capacity(profile.extensions().len());
  for kind in profile.extensions() {
    let keep = match kind {
      k if k.is_tls13_only() => tls13,
      k if k.is_mandatory() => true,
      ExtensionKind::Alpn => alpn_planned,
      // ALPS rides on ALPN
      ExtensionKind::ApplicationSettings => {
        alpn_planned && flip(rng, profile.weight(&Feature::Extension(*kind)))
      }
      k => flip(rng, profile.weight(&Feature::Extension(*k))),
    };
    if keep && !extensions.contains(kind) {
      extensions.push(*kind);
    }
  }
  for kind in [
    ExtensionKind::ServerName,
    ExtensionKind::SupportedGroups,
    ExtensionKind::EcPointFormats,
    ExtensionKind::SignatureAlgorithms,
  ] {
    if !extensions.contains(&kind) {
      extensions.push(kind);
    }
  }
  if tls13 {
    for kind in [
      ExtensionKind::SupportedVersions,
      ExtensionKind::PskKeyExchangeModes,
      ExtensionKind::KeyShare,
    ] {
      if !extensions.contains(&kind) {
        extensions.push(kind);
      }
    }
  }
  if alpn_planned && !extensions.contains(&ExtensionKind::Alpn) {
    extensions.push(ExtensionKind::Alpn);
  }

  HandshakePlan {
    id: profile.id(),
    min_version: TlsVersion::Tls12,
    max_version,
    cipher_suites,
    extensions,
    signature_schemes,
    curves,
    key_share,
    alpn_protocols,
  }
}

fn flip<R: Rng + ?Sized>(rng: &mut R, weight: f64) -> bool {
  rng.gen::<f64>() < weight
}

fn sample<R, T, F>(rng: &mut R, profile: &FingerprintProfile, candidates: &[T], feature: F) -> Vec<T>
where
  R: Rng + ?Sized,
  T: Clone + PartialEq,
  F: Fn(&T) -> Feature,
{
  let mut out: Vec<T> = Vec::with_capacity(candidates.len());
  for candidate in candidates {
    if flip(rng, profile.weight(&feature(candidate))) && !out.contains(candidate) {
      out.push(candidate.clone());
    }
  }
  out
}

// One ECDHE suite per certificate type, plus a TLS 1.3 suite when 1.3 is on
// offer.
fn ensure_cipher_baseline(suites: &mut Vec<u16>, tls13: bool) {
  if tls13 && !suites.iter().any(|c| cipher::TLS13.contains(c)) {
    suites.insert(0, cipher::TLS13_AES_128_GCM_SHA256);
  }
  if !suites.iter().any(|c| cipher::TLS12_ECDSA.contains(c)) {
    suites.push(cipher::ECDHE_ECDSA_AES_128_GCM_SHA256);
  }
  if !suites.iter().any(|c| cipher::TLS12_RSA.contains(c)) {
    suites.push(cipher::ECDHE_RSA_AES_128_GCM_SHA256);
  }
}

fn ensure_signature_baseline(schemes: &mut Vec<u16>, tls13: bool) {
  if !schemes.contains(&signature::ECDSA_NISTP256_SHA256) {
    schemes.insert(0, signature::ECDSA_NISTP256_SHA256);
  }
  // TLS 1.3 only signs with PSS for RSA keys
  if tls13 && !schemes.iter().any(|s| signature::RSA_PSS.contains(s)) {
    schemes.push(signature::RSA_PSS_SHA256);
  }
  if !schemes
    .iter()
    .any(|s| *s != signature::RSA_PKCS1_SHA1 && signature::RSA_PKCS1.contains(s))
  {
    schemes.push(signature::RSA_PKCS1_SHA256);
  }
}

fn ensure_curve_baseline(curves: &mut Vec<u16>) {
  if !curves.iter().any(|c| curve::INTEROPERABLE.contains(c)) {
    for c in [curve::X25519, curve::SECP256R1] {
      if !curves.contains(&c) {
        curves.push(c);
      }
    }
  }
}

fn pick_key_share<R: Rng + ?Sized>(rng: &mut R, profile: &FingerprintProfile, curves: &[u16]) -> u16 {
  if curves.contains(&curve::SECP256R1) && flip(rng, profile.weight(&Feature::FirstKeyShareP256)) {
    return curve::SECP256R1;
  }
  if curves.contains(&curve::X25519) {
    return curve::X25519;
  }
  curves
    .iter()
    .copied()
    .find(|c| curve::INTEROPERABLE.contains(c))
    .unwrap_or(curve::X25519)
}

/// Hands out a fresh plan per outbound TLS attempt.
pub trait PlanSource: Send + Sync {
  /// Sample a new plan.
  fn plan(&self) -> HandshakePlan;
}

/// Stateless engine sampling from one shared profile.
#[derive(Debug, Clone, Default)]
pub struct FingerprintEngine {
  profile: Arc<FingerprintProfile>,
}

impl FingerprintEngine {
  /// Create an engine over `profile`.
  pub fn new(profile: FingerprintProfile) -> Self {
    Self {
      profile: Arc::new(profile),
    }
  }

  /// The profile the engine samples from.
  pub fn profile(&self) -> &FingerprintProfile {
    &self.profile
  }
}

impl PlanSource for FingerprintEngine {
  fn plan(&self) -> HandshakePlan {
    let plan = build_handshake_plan(&self.profile);
    tracing::debug!(ja3 = %plan.ja3_text(), key_share = plan.key_share, "sampled handshake plan");
    plan
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use rand::rngs::StdRng;
  use rand::SeedableRng;

  const ROUNDS: usize = 20_000;
  const TOLERANCE: f64 = 0.02;

  fn frequency<F: Fn(&HandshakePlan) -> bool>(profile: &FingerprintProfile, seed: u64, f: F) -> f64 {
    let mut rng = StdRng::seed_from_u64(seed);
    let hits = (0..ROUNDS)
      .filter(|_| f(&build_handshake_plan_with(profile, &mut rng)))
      .count();
    hits as f64 / ROUNDS as f64
  }

  #[test]
  fn inclusion_frequency_converges_to_weight() {
    let profile = FingerprintProfile::default();
    let cases: Vec<(Feature, Box<dyn Fn(&HandshakePlan) -> bool>)> = vec![
      (
        Feature::Extension(ExtensionKind::Padding),
        Box::new(|p: &HandshakePlan| p.has_extension(ExtensionKind::Padding)),
      ),
      (
        Feature::Extension(ExtensionKind::StatusRequest),
        Box::new(|p: &HandshakePlan| p.has_extension(ExtensionKind::StatusRequest)),
      ),
      (
        Feature::Extension(ExtensionKind::ExtendedMasterSecret),
        Box::new(|p: &HandshakePlan| p.has_extension(ExtensionKind::ExtendedMasterSecret)),
      ),
      (
        Feature::SignatureScheme(signature::ECDSA_SHA1),
        Box::new(|p: &HandshakePlan| p.signature_schemes.contains(&signature::ECDSA_SHA1)),
      ),
      (
        Feature::Curve(curve::X25519),
        Box::new(|p: &HandshakePlan| p.curves.contains(&curve::X25519)),
      ),
      (
        Feature::CipherSuite(cipher::RSA_AES_128_CBC_SHA),
        Box::new(|p: &HandshakePlan| p.cipher_suites.contains(&cipher::RSA_AES_128_CBC_SHA)),
      ),
      (
        Feature::FirstKeyShareP256,
        Box::new(|p: &HandshakePlan| p.key_share == curve::SECP256R1),
      ),
    ];
    for (seed, (feature, check)) in cases.into_iter().enumerate() {
      let expected = profile.weight(&feature);
      let observed = frequency(&profile, seed as u64, check);
      assert!(
        (observed - expected).abs() < TOLERANCE,
        "{:?}: observed {} expected {}",
        feature,
        observed,
        expected
      );
    }
  }

  #[test]
  fn alpn_extension_follows_identity() {
    let profile = FingerprintProfile::default().with_id(ClientHelloId::Randomized);
    let observed = frequency(&profile, 42, |p| p.has_extension(ExtensionKind::Alpn));
    assert!((observed - 0.7).abs() < TOLERANCE, "observed {}", observed);

    let mut rng = StdRng::seed_from_u64(7);
    let always = FingerprintProfile::default();
    let never = FingerprintProfile::default().with_id(ClientHelloId::RandomizedNoAlpn);
    for _ in 0..200 {
      let plan = build_handshake_plan_with(&always, &mut rng);
      assert!(plan.has_extension(ExtensionKind::Alpn));
      assert!(!plan.alpn_protocols.is_empty());
      let plan = build_handshake_plan_with(&never, &mut rng);
      assert!(!plan.has_extension(ExtensionKind::Alpn));
      assert!(!plan.has_extension(ExtensionKind::ApplicationSettings));
      assert!(plan.alpn_protocols.is_empty());
    }
  }

  #[test]
  fn zero_weights_still_yield_a_viable_plan() {
    let profile = FingerprintProfile::default().with_uniform_weight(0.0);
    let mut rng = StdRng::seed_from_u64(1);
    let plan = build_handshake_plan_with(&profile, &mut rng);
    assert_eq!(plan.max_version, TlsVersion::Tls12);
    assert_eq!(plan.min_version, TlsVersion::Tls12);
    assert!(plan
      .cipher_suites
      .contains(&cipher::ECDHE_ECDSA_AES_128_GCM_SHA256));
    assert!(plan
      .cipher_suites
      .contains(&cipher::ECDHE_RSA_AES_128_GCM_SHA256));
    assert!(!plan.cipher_suites.iter().any(|c| cipher::TLS13.contains(c)));
    assert_eq!(plan.curves, vec![curve::X25519, curve::SECP256R1]);
    assert_eq!(plan.key_share, curve::X25519);
    assert!(plan
      .signature_schemes
      .contains(&signature::ECDSA_NISTP256_SHA256));
    assert!(plan.signature_schemes.contains(&signature::RSA_PKCS1_SHA256));
    assert_eq!(plan.alpn_protocols, vec!["http/1.1".to_string()]);
    for kind in [
      ExtensionKind::ServerName,
      ExtensionKind::SupportedGroups,
      ExtensionKind::EcPointFormats,
      ExtensionKind::SignatureAlgorithms,
      ExtensionKind::Alpn,
    ] {
      assert!(plan.has_extension(kind), "missing {:?}", kind);
    }
    assert!(!plan.has_extension(ExtensionKind::KeyShare));
    assert!(!plan.has_extension(ExtensionKind::Padding));
  }

  #[test]
  fn empty_profile_still_yields_a_viable_plan() {
    let profile = FingerprintProfile::builder(ClientHelloId::RandomizedAlpn).build();
    let plan = build_handshake_plan(&profile);
    assert_eq!(plan.max_version, TlsVersion::Tls13);
    assert_eq!(plan.cipher_suites[0], cipher::TLS13_AES_128_GCM_SHA256);
    assert!(plan.signature_schemes.contains(&signature::RSA_PSS_SHA256));
    assert!(plan.has_extension(ExtensionKind::KeyShare));
    assert!(plan.has_extension(ExtensionKind::SupportedVersions));
    assert!(!plan.curves.is_empty());
  }

  #[test]
  fn tls13_plans_carry_their_mandatory_parts() {
    let profile = FingerprintProfile::default();
    let mut rng = StdRng::seed_from_u64(99);
    for _ in 0..500 {
      let plan = build_handshake_plan_with(&profile, &mut rng);
      assert_eq!(plan.max_version, TlsVersion::Tls13);
      assert!(plan.has_extension(ExtensionKind::KeyShare));
      assert!(plan.has_extension(ExtensionKind::PskKeyExchangeModes));
      assert!(plan.curves.contains(&plan.key_share));
      assert!(plan
        .signature_schemes
        .iter()
        .any(|s| signature::RSA_PSS.contains(s)));
    }
  }

  #[test]
  fn ja3_text_lists_plan_fields() {
    let profile = FingerprintProfile::default().with_uniform_weight(0.0);
    let plan = build_handshake_plan_with(&profile, &mut StdRng::seed_from_u64(3));
    assert_eq!(plan.ja3_text(), "771,49195-49199,0-10-11-16-13,29-23,0");
  }

  #[test]
  fn engine_samples_independently() {
    let engine = FingerprintEngine::default();
    let plans: Vec<HandshakePlan> = (0..64).map(|_| engine.plan()).collect();
    assert!(plans.iter().any(|p| p != &plans[0]));
  }
}
