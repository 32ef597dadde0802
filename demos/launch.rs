//! Run a single proxy instance from the command line
//!
//! To run:
//! ```bash
//! cargo run --example launch -- 127.0.0.1 8080 "console.log('hazed')" socks5://127.0.0.1:1080
//! ```
//!
//! Every argument is optional and positional: bind address, port, payload,
//! upstream proxy URL. Install `<storage>/cert.pem` into the browser (or
//! pass `--cacert` to curl) before sending HTTPS traffic through it.

use hazetunnel::{InstanceRegistry, ProxyInstanceConfig};

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
  tracing_subscriber::fmt()
    .with_env_filter(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("hazetunnel=info")),
    )
    .init();

  let mut args = std::env::args().skip(1);
  let mut config = ProxyInstanceConfig::new("cli");
  if let Some(addr) = args.next() {
    config = config.bind_address(addr);
  }
  if let Some(port) = args.next() {
    config = config.bind_port(port.parse()?);
  }
  if let Some(payload) = args.next() {
    config = config.payload(payload);
  }
  if let Some(upstream) = args.next() {
    config = config.upstream_proxy(upstream);
  }

  let registry = InstanceRegistry::new();
  let handle = registry.start(config).await?;
  println!("Proxy listening on {}", handle.local_addr);
  println!(
    "CA certificate: {}",
    registry.ca_storage().join("cert.pem").display()
  );
  println!("Press Ctrl+C to stop\n");

  tokio::signal::ctrl_c().await?;
  registry.stop_all().await?;
  Ok(())
}
