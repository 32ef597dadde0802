#![warn(missing_docs)]

//! # hazetunnel
//!
//! An intercepting HTTP/HTTPS proxy that re-originates every TLS connection
//! with a randomized, browser-like ClientHello and injects a script into
//! the HTML responses it relays.
//!
//! - `CONNECT` tunnels are always intercepted with a certificate signed by a
//!   local CA (see [`CertificateManager`]).
//! - Each outbound TLS attempt samples a fresh [`HandshakePlan`] from a
//!   [`FingerprintProfile`].
//! - Outbound traffic may be chained through an HTTP or SOCKS5
//!   [`UpstreamProxy`].
//! - Several independent instances can run side by side in one
//!   [`InstanceRegistry`].
//!
//! ## Running an instance
//!
//! ```no_run
//! use hazetunnel::{InstanceRegistry, ProxyInstanceConfig};
//!
//! # async fn run() -> hazetunnel::Result<()> {
//! let registry = InstanceRegistry::new().with_ca_storage("./.hazetunnel");
//! let handle = registry
//!   .start(
//!     ProxyInstanceConfig::new("main")
//!       .bind_port(8080)
//!       .payload("console.log('intercepted')"),
//!   )
//!   .await?;
//! println!("listening at {}", handle.local_addr);
//! registry.stop("main").await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Fingerprints
//!
//! ```rust
//! use hazetunnel::{build_handshake_plan, Feature, FingerprintProfile};
//!
//! let profile = FingerprintProfile::default().with_weight(Feature::MaxVersionTls13, 0.5);
//! let plan = build_handshake_plan(&profile);
//! assert!(!plan.cipher_suites.is_empty());
//! println!("{}", plan.ja3_text());
//! ```

mod ca;
mod connector;
mod context;
mod errors;
mod h2_client;
mod instance;
mod plan;
mod profile;
mod proxy;
mod request;
mod response;
pub mod rewriter;
mod server;
mod socket;
pub mod tls;

pub use ca::{CertificateAuthority, CertificateManager, CertificateSource, CertifiedLeaf};
pub use connector::{Connector, ConnectorBuilder};
pub use context::RequestContext;
pub use errors::{Error, Result};
pub use instance::{InstanceHandle, InstanceRegistry, ProxyInstanceConfig};
pub use plan::{build_handshake_plan, build_handshake_plan_with, FingerprintEngine, HandshakePlan, PlanSource};
pub use profile::{
  cipher, curve, signature, ClientHelloId, ExtensionKind, Feature, FingerprintProfile,
  ProfileBuilder, TlsVersion,
};
pub use proxy::{encode_basic_auth, HttpProxy, Socks5Proxy, UpstreamProxy};
pub use rewriter::{inject, inject_limited};
pub use server::{ProxyServer, ServerOptions};
pub use socket::{MaybeTlsStream, Socket};

pub(crate) const CR_LF: &[u8] = &[13, 10];
pub(crate) const SPACE: &[u8] = &[32];
pub(crate) const COLON_SPACE: &[u8] = &[58, 32];
