#![allow(dead_code)]

use hazetunnel::{
  CertificateAuthority, CertificateManager, FingerprintEngine, FingerprintProfile, HandshakePlan,
  InstanceRegistry, PlanSource, ServerOptions,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::{TlsAcceptor, TlsConnector};

pub fn init_tracing() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .with_test_writer()
    .try_init();
}

/// Counts how many plans the pipeline asked for.
#[derive(Default)]
pub struct CountingPlans {
  count: AtomicUsize,
  engine: FingerprintEngine,
}

impl CountingPlans {
  pub fn count(&self) -> usize {
    self.count.load(Ordering::SeqCst)
  }
}

impl PlanSource for CountingPlans {
  fn plan(&self) -> HandshakePlan {
    self.count.fetch_add(1, Ordering::SeqCst);
    self.engine.plan()
  }
}

pub struct Harness {
  pub registry: InstanceRegistry,
  pub certs: Arc<CertificateManager>,
  pub plans: Arc<CountingPlans>,
}

pub fn harness() -> Harness {
  harness_with(ServerOptions {
    read_timeout: Some(Duration::from_secs(5)),
    ..ServerOptions::default()
  })
}

pub fn harness_with(options: ServerOptions) -> Harness {
  init_tracing();
  let certs = Arc::new(CertificateManager::with_authority(
    CertificateAuthority::generate().unwrap(),
  ));
  let plans = Arc::new(CountingPlans {
    count: AtomicUsize::new(0),
    engine: FingerprintEngine::new(FingerprintProfile::default()),
  });
  let registry = InstanceRegistry::new()
    .with_certificate_source(certs.clone())
    .with_plan_source(plans.clone())
    .with_options(options);
  Harness {
    registry,
    certs,
    plans,
  }
}

pub const PAGE: &str = "<html><head><title>t</title></head><body>hello</body></html>";

pub fn html_response(body: &str) -> Vec<u8> {
  format!(
    "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\n\r\n{}",
    body.len(),
    body
  )
  .into_bytes()
}

/// Read up to and including the blank line ending a message head.
pub async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> String {
  let mut head = Vec::new();
  let mut byte = [0u8; 1];
  while !head.ends_with(b"\r\n\r\n") {
    if stream.read(&mut byte).await.unwrap() == 0 {
      break;
    }
    head.push(byte[0]);
  }
  String::from_utf8_lossy(&head).to_string()
}

async fn answer<S: AsyncRead + AsyncWrite + Unpin>(mut stream: S, response: Arc<Vec<u8>>, delay: Duration) {
  let head = read_head(&mut stream).await;
  if head.is_empty() {
    return;
  }
  tokio::time::sleep(delay).await;
  let _ = stream.write_all(&response).await;
  let _ = stream.shutdown().await;
}

/// Plain HTTP origin answering every request with `response`.
pub async fn spawn_origin(response: Vec<u8>, delay: Duration) -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let response = Arc::new(response);
  tokio::spawn(async move {
    while let Ok((stream, _)) = listener.accept().await {
      tokio::spawn(answer(stream, response.clone(), delay));
    }
  });
  addr
}

/// HTTPS origin on 127.0.0.1 with a certificate from its own CA.
pub async fn spawn_tls_origin(response: Vec<u8>) -> SocketAddr {
  let ca = CertificateManager::with_authority(CertificateAuthority::generate().unwrap());
  let (chain, key) = ca.get_server_cert("127.0.0.1").await.unwrap();
  let config = hazetunnel::tls::server_config(chain, key).unwrap();
  let acceptor = TlsAcceptor::from(Arc::new(config));
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let response = Arc::new(response);
  tokio::spawn(async move {
    while let Ok((stream, _)) = listener.accept().await {
      let acceptor = acceptor.clone();
      let response = response.clone();
      tokio::spawn(async move {
        if let Ok(tls) = acceptor.accept(stream).await {
          answer(tls, response, Duration::ZERO).await;
        }
      });
    }
  });
  addr
}

/// Send raw bytes to the proxy and read until it closes.
pub async fn roundtrip(proxy: SocketAddr, raw: &str) -> String {
  let mut stream = TcpStream::connect(proxy).await.unwrap();
  stream.write_all(raw.as_bytes()).await.unwrap();
  let mut out = Vec::new();
  stream.read_to_end(&mut out).await.unwrap();
  String::from_utf8_lossy(&out).to_string()
}

/// Client config trusting only `ca`.
pub fn client_trusting(ca: &CertificateDer<'static>) -> TlsConnector {
  let mut roots = RootCertStore::empty();
  roots.add(ca.clone()).unwrap();
  let config = ClientConfig::builder_with_provider(Arc::new(hazetunnel::tls::crypto_provider()))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
  TlsConnector::from(Arc::new(config))
}

pub fn ip_name() -> ServerName<'static> {
  ServerName::try_from("127.0.0.1").unwrap()
}

/// HTTPS origin that only speaks HTTP/2 and serves `page` as HTML.
pub async fn spawn_h2_origin(page: &'static str) -> SocketAddr {
  let ca = CertificateManager::with_authority(CertificateAuthority::generate().unwrap());
  let (chain, key) = ca.get_server_cert("127.0.0.1").await.unwrap();
  let mut config = hazetunnel::tls::server_config(chain, key).unwrap();
  config.alpn_protocols = vec![b"h2".to_vec()];
  let acceptor = TlsAcceptor::from(Arc::new(config));
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    while let Ok((stream, _)) = listener.accept().await {
      let acceptor = acceptor.clone();
      tokio::spawn(async move {
        let Ok(tls) = acceptor.accept(stream).await else {
          return;
        };
        let Ok(mut conn) = h2::server::handshake(tls).await else {
          return;
        };
        while let Some(Ok((_request, mut respond))) = conn.accept().await {
          let response = http::Response::builder()
            .header("content-type", "text/html; charset=utf-8")
            .body(())
            .unwrap();
          if let Ok(mut stream) = respond.send_response(response, false) {
            let _ = stream.send_data(bytes::Bytes::from_static(page.as_bytes()), true);
          }
        }
      });
    }
  });
  addr
}

/// `CONNECT` to `origin` through the proxy, then `GET path` inside the
/// intercepted tunnel with `Connection: close`. Returns the raw response.
pub async fn fetch_through_tunnel(
  h: &Harness,
  proxy: SocketAddr,
  origin: SocketAddr,
  path: &str,
) -> String {
  let mut stream = TcpStream::connect(proxy).await.unwrap();
  stream
    .write_all(format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\n", origin, origin).as_bytes())
    .await
    .unwrap();
  let head = read_head(&mut stream).await;
  if !head.starts_with("HTTP/1.1 200") {
    let mut rest = Vec::new();
    let _ = stream.read_to_end(&mut rest).await;
    return head + &String::from_utf8_lossy(&rest);
  }
  let connector = client_trusting(h.certs.authority().ca_cert_der());
  let mut tls = connector.connect(ip_name(), stream).await.unwrap();
  tls
    .write_all(
      format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, origin
      )
      .as_bytes(),
    )
    .await
    .unwrap();
  let mut out = Vec::new();
  tls.read_to_end(&mut out).await.unwrap();
  String::from_utf8_lossy(&out).to_string()
}
