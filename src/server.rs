//! Intercepting proxy server
//!
//! One task per accepted connection. A connection starts in plain mode and
//! serves absolute-form requests until it sees `CONNECT`; the tunnel is then
//! terminated with a substituted certificate and the decrypted requests are
//! served the same way. Every request is forwarded on its own outbound
//! connection.

use crate::ca::CertificateSource;
use crate::connector::{Connector, ConnectorBuilder};
use crate::context::RequestContext;
use crate::errors::{Error, Result};
use crate::instance::ProxyInstanceConfig;
use crate::plan::PlanSource;
use crate::proxy::authority_text;
use crate::request::{read_request, to_raw, wants_keep_alive, Limits, TargetForm};
use crate::response::{error_response, timed, ResponseBuilder, ResponseConfig};
use crate::{h2_client, response, rewriter, tls};
use bytes::Bytes;
use http::{Method, Request, Response, StatusCode};
use socket2::{Domain, Protocol, Socket as RawSocket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;

macro_rules! pipeline_log {
  ($ctx:expr, $($arg:tt)+) => {
    if $ctx.verbose() {
      tracing::info!($($arg)+)
    } else {
      tracing::debug!($($arg)+)
    }
  };
}

const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Per-instance tunables.
#[derive(Debug, Clone)]
pub struct ServerOptions {
  /// TCP connect, upstream proxy handshake and TLS handshake, each
  pub connect_timeout: Option<Duration>,
  /// Per read, inbound and outbound; also the keep-alive idle limit
  pub read_timeout: Option<Duration>,
  /// Per write, inbound and outbound
  pub write_timeout: Option<Duration>,
  /// Request line plus headers
  pub max_header_bytes: usize,
  /// Decoded message body
  pub max_body_bytes: usize,
  /// How long in-flight exchanges may run after shutdown is signalled
  pub shutdown_grace: Duration,
}

impl Default for ServerOptions {
  fn default() -> Self {
    Self {
      connect_timeout: Some(Duration::from_secs(10)),
      read_timeout: Some(Duration::from_secs(30)),
      write_timeout: Some(Duration::from_secs(30)),
      max_header_bytes: 64 * 1024,
      max_body_bytes: 32 * 1024 * 1024,
      shutdown_grace: Duration::from_secs(5),
    }
  }
}

impl ServerOptions {
  pub(crate) fn limits(&self) -> Limits {
    Limits {
      max_header_bytes: self.max_header_bytes,
      max_body_bytes: self.max_body_bytes,
      read_timeout: self.read_timeout,
    }
  }
}

/// Resolves once `true` has been sent. A dropped sender never resolves.
pub(crate) async fn wait_shutdown(rx: &mut watch::Receiver<bool>) {
  if rx.wait_for(|stop| *stop).await.is_err() {
    std::future::pending::<()>().await;
  }
}

struct Shared {
  template: RequestContext,
  certs: Arc<dyn CertificateSource>,
  connector: Connector,
  options: ServerOptions,
}

/// The server behind one proxy instance.
#[derive(Clone)]
pub struct ProxyServer {
  bind_address: String,
  bind_port: u16,
  shared: Arc<Shared>,
}

impl ProxyServer {
  /// Server for `config`, issuing tunnel certificates from `certs` and
  /// drawing outbound handshake plans from `plans`.
  pub fn new(
    config: &ProxyInstanceConfig,
    certs: Arc<dyn CertificateSource>,
    plans: Arc<dyn PlanSource>,
    options: ServerOptions,
  ) -> Self {
    let connector = ConnectorBuilder::default()
      .connect_timeout(options.connect_timeout)
      .read_timeout(options.read_timeout)
      .write_timeout(options.write_timeout)
      .plans(plans)
      .build();
    let template = RequestContext::new(
      config.id.as_str(),
      config.payload.as_str(),
      config
        .upstream_proxy
        .as_deref()
        .filter(|u| !u.trim().is_empty()),
      config.verbose,
    );
    Self {
      bind_address: config.bind_address.clone(),
      bind_port: config.bind_port,
      shared: Arc::new(Shared {
        template,
        certs,
        connector,
        options,
      }),
    }
  }

  /// `address:port` this server binds to.
  pub fn bind_target(&self) -> String {
    authority_text(
      self.bind_address.trim_start_matches('[').trim_end_matches(']'),
      self.bind_port,
    )
  }

  /// Bind the listening socket.
  pub async fn bind(&self) -> Result<TcpListener> {
    let target = self.bind_target();
    let host = self.bind_address.trim_start_matches('[').trim_end_matches(']');
    let addr = tokio::net::lookup_host((host, self.bind_port))
      .await
      .map_err(|e| Error::bind_error(&target, e))?
      .next()
      .ok_or_else(|| {
        Error::bind_error(
          &target,
          std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, "address did not resolve"),
        )
      })?;
    bind_listener(addr).map_err(|e| Error::bind_error(&target, e))
  }

  /// Accept connections until `shutdown` becomes `true`, then stop
  /// accepting, let in-flight exchanges finish within the grace period and
  /// abort the rest.
  pub async fn serve(&self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let worker_shutdown = shutdown.clone();
    let mut workers = JoinSet::new();
    loop {
      tokio::select! {
        biased;
        _ = wait_shutdown(&mut shutdown) => break,
        accepted = listener.accept() => match accepted {
          Ok((stream, peer)) => {
            let shared = self.shared.clone();
            let shutdown = worker_shutdown.clone();
            workers.spawn(async move {
              if let Err(e) = shared.handle_connection(stream, shutdown).await {
                if e.is_disconnect() {
                  tracing::debug!("{} disconnected: {}", peer, e);
                } else {
                  tracing::warn!("connection from {} failed: {}", peer, e);
                }
              }
            });
          }
          Err(e) => {
            tracing::error!("failed to accept connection: {}", e);
            tokio::time::sleep(Duration::from_millis(50)).await;
          }
        },
        Some(_) = workers.join_next(), if !workers.is_empty() => {}
      }
    }
    drop(listener);

    let grace = self.shared.options.shutdown_grace;
    let drained = tokio::time::timeout(grace, async {
      while workers.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
      tracing::warn!("aborting {} connections after shutdown grace period", workers.len());
      workers.abort_all();
      while workers.join_next().await.is_some() {}
    }
    Ok(())
  }
}

fn bind_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
  let socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
  #[cfg(unix)]
  socket.set_reuse_address(true)?;
  socket.set_nonblocking(true)?;
  socket.bind(&addr.into())?;
  socket.listen(1024)?;
  TcpListener::from_std(socket.into())
}

async fn write_response<S>(
  stream: &mut S,
  response: &Response<Bytes>,
  head: bool,
  keep_alive: bool,
  write_timeout: Option<Duration>,
) -> Result<()>
where
  S: AsyncWrite + Unpin,
{
  let raw = response::to_raw(response, head, keep_alive);
  timed(write_timeout, stream.write_all(&raw)).await?;
  timed(write_timeout, stream.flush()).await?;
  Ok(())
}

/// Host and port of a `CONNECT` target, IPv6 brackets removed.
fn connect_target(request: &Request<Bytes>) -> Result<(String, u16)> {
  let uri = request.uri();
  let host = uri
    .host()
    .filter(|h| !h.is_empty())
    .ok_or_else(|| Error::invalid_request(format!("invalid CONNECT target: {}", uri)))?;
  let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
  Ok((host, uri.port_u16().unwrap_or(443)))
}

/// Make the request target absolute. Inside a tunnel origin-form targets
/// belong to the tunneled authority.
fn resolve_target(request: &mut Request<Bytes>, tunnel: Option<&str>) -> Result<()> {
  let uri = request.uri();
  if uri.scheme().is_some() && uri.authority().is_some() {
    return Ok(());
  }
  match tunnel {
    Some(authority) => {
      let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
      *request.uri_mut() = format!("https://{}{}", authority, path).parse()?;
      Ok(())
    }
    None => Err(Error::invalid_request(format!(
      "proxy requests need an absolute-form target, got {}",
      uri
    ))),
  }
}

impl Shared {
  async fn handle_connection(
    self: Arc<Self>,
    stream: TcpStream,
    mut shutdown: watch::Receiver<bool>,
  ) -> Result<()> {
    let mut reader = BufReader::new(stream);
    let Some(connect) = self.serve_requests(&mut reader, None, &mut shutdown).await? else {
      return Ok(());
    };
    if !reader.buffer().is_empty() {
      return Err(Error::invalid_request(
        "client sent data before the tunnel was established",
      ));
    }
    self.intercept_tunnel(reader.into_inner(), &connect, shutdown).await
  }

  /// Serve requests on one client connection. Returns the `CONNECT` request
  /// that ended plain mode, if any.
  async fn serve_requests<S>(
    &self,
    reader: &mut BufReader<S>,
    tunnel: Option<&str>,
    shutdown: &mut watch::Receiver<bool>,
  ) -> Result<Option<Request<Bytes>>>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    let limits = self.options.limits();
    let write_timeout = self.options.write_timeout;
    loop {
      let next = tokio::select! {
        biased;
        _ = wait_shutdown(shutdown) => return Ok(None),
        next = read_idle(reader, &limits) => next,
      };
      let mut request = match next {
        Ok(Some(request)) => request,
        Ok(None) => return Ok(None),
        Err(Error::InvalidRequest(msg)) => {
          let response = error_response(StatusCode::BAD_REQUEST, &msg);
          write_response(reader.get_mut(), &response, false, false, write_timeout).await?;
          return Ok(None);
        }
        Err(e) => return Err(e),
      };
      let ctx = self.template.admit();

      if request.method() == Method::CONNECT {
        if tunnel.is_none() {
          return Ok(Some(request));
        }
        let response = error_response(StatusCode::METHOD_NOT_ALLOWED, "CONNECT inside a tunnel");
        write_response(reader.get_mut(), &response, false, false, write_timeout).await?;
        return Ok(None);
      }

      let keep_alive = wants_keep_alive(&request);
      let head = request.method() == Method::HEAD;
      let response = match resolve_target(&mut request, tunnel) {
        Ok(()) => self.exchange(&ctx, request).await,
        Err(e) => {
          let response = error_response(StatusCode::BAD_REQUEST, &e.to_string());
          write_response(reader.get_mut(), &response, false, false, write_timeout).await?;
          return Ok(None);
        }
      };
      write_response(reader.get_mut(), &response, head, keep_alive, write_timeout).await?;
      if !keep_alive {
        return Ok(None);
      }
    }
  }

  /// Forward one request and rewrite its response. Failures become proxy
  /// error responses.
  async fn exchange(&self, ctx: &RequestContext, request: Request<Bytes>) -> Response<Bytes> {
    let head = request.method() == Method::HEAD;
    match self.forward(ctx, &request).await {
      Ok(response) if head => response,
      Ok(response) => rewriter::inject_limited(response, ctx.payload(), self.options.max_body_bytes),
      Err(Error::InvalidUpstreamProxy { url, reason }) => error_response(
        StatusCode::BAD_GATEWAY,
        &format!("invalid upstream proxy `{}`: {}", url, reason),
      ),
      Err(e) => {
        tracing::warn!("{} {} failed: {}", request.method(), request.uri(), e);
        error_response(StatusCode::BAD_GATEWAY, &format!("upstream request failed: {}", e))
      }
    }
  }

  async fn forward(&self, ctx: &RequestContext, request: &Request<Bytes>) -> Result<Response<Bytes>> {
    let upstream = ctx.upstream_proxy()?;
    let scheme = request.uri().scheme_str().unwrap_or("http");
    pipeline_log!(ctx, "scheme: {}", scheme);
    let plain = match scheme {
      "http" => {
        pipeline_log!(ctx, "skipping TLS for HTTP request");
        true
      }
      "https" => false,
      other => {
        return Err(Error::invalid_request(format!("unsupported scheme: {}", other)));
      }
    };

    let limits = self.options.limits();
    let mut socket = self.connector.connect(request.uri(), upstream.as_ref()).await?;
    if socket.is_h2() {
      return h2_client::send_request(socket, request, &limits).await;
    }
    let via_proxy = upstream.as_ref().filter(|u| plain && u.forwards_plain_http());
    let raw = match via_proxy {
      Some(proxy) => to_raw(request, TargetForm::Absolute, proxy.authorization()),
      None => to_raw(request, TargetForm::Origin, None),
    };
    let write_timeout = socket.write_timeout();
    timed(write_timeout, socket.write_all(&raw)).await?;
    timed(write_timeout, socket.flush()).await?;
    ResponseBuilder::new(
      BufReader::new(socket),
      ResponseConfig::new(request.method().clone(), limits),
    )
    .build()
    .await
  }

  async fn intercept_tunnel(
    &self,
    mut stream: TcpStream,
    connect: &Request<Bytes>,
    mut shutdown: watch::Receiver<bool>,
  ) -> Result<()> {
    let write_timeout = self.options.write_timeout;
    let (host, port) = match connect_target(connect) {
      Ok(target) => target,
      Err(e) => {
        let response = error_response(StatusCode::BAD_REQUEST, &e.to_string());
        write_response(&mut stream, &response, false, false, write_timeout).await?;
        return Err(e);
      }
    };
    let config = match self.certs.leaf_certificate(&host).await {
      Ok((chain, key)) => tls::server_config(chain, key),
      Err(e) => Err(e),
    };
    let config = match config {
      Ok(config) => config,
      Err(e) => {
        let response = error_response(
          StatusCode::BAD_GATEWAY,
          &format!("no certificate for {}: {}", host, e),
        );
        write_response(&mut stream, &response, false, false, write_timeout).await?;
        return Err(e);
      }
    };
    timed(write_timeout, stream.write_all(CONNECTION_ESTABLISHED)).await?;
    timed(write_timeout, stream.flush()).await?;

    let acceptor = TlsAcceptor::from(Arc::new(config));
    let tls_stream = timed(self.options.connect_timeout, acceptor.accept(stream))
      .await
      .map_err(|e| Error::tls_error(format!("TLS handshake with client for {} failed: {}", host, e)))?;
    let authority = if port == 443 {
      authority_text(&host, port)
        .strip_suffix(":443")
        .map(str::to_string)
        .unwrap_or_default()
    } else {
      authority_text(&host, port)
    };
    let mut reader = BufReader::new(tls_stream);
    self
      .serve_requests(&mut reader, Some(&authority), &mut shutdown)
      .await?;
    let _ = reader.get_mut().shutdown().await;
    Ok(())
  }
}

/// Read the next request, treating a connection idle past the read timeout
/// as closed. Only the wait for the first byte counts as idle; once a
/// request has started, each read is timed on its own.
async fn read_idle<R>(reader: &mut R, limits: &Limits) -> Result<Option<Request<Bytes>>>
where
  R: tokio::io::AsyncBufRead + Unpin,
{
  if let Some(idle) = limits.read_timeout {
    match tokio::time::timeout(idle, reader.fill_buf()).await {
      Err(_) => return Ok(None),
      Ok(Err(e)) => return Err(e.into()),
      Ok(Ok(buf)) if buf.is_empty() => return Ok(None),
      Ok(Ok(_)) => {}
    }
  }
  read_request(reader, limits).await
}
