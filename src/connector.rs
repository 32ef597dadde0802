use crate::errors::{new_io_error, Error, Result};
use crate::plan::{FingerprintEngine, PlanSource};
use crate::profile::FingerprintProfile;
use crate::proxy::UpstreamProxy;
use crate::socket::{MaybeTlsStream, Socket};
use crate::tls;
use socket2::Socket as RawSocket;
use socket2::{Domain, Protocol, Type};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpSocket;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

/// ConnectorBuilder
#[derive(Clone)]
pub struct ConnectorBuilder {
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
  connect_timeout: Option<Duration>,
  nodelay: bool,
  keepalive: bool,
  plans: Option<Arc<dyn PlanSource>>,
}

impl Default for ConnectorBuilder {
  fn default() -> Self {
    Self {
      read_timeout: Some(Duration::from_secs(30)),
      write_timeout: Some(Duration::from_secs(30)),
      connect_timeout: Some(Duration::from_secs(10)),
      nodelay: true,
      keepalive: false,
      plans: None,
    }
  }
}

impl ConnectorBuilder {
  /// Set that all sockets have `SO_NODELAY` set to the supplied value `nodelay`.
  ///
  /// Default is `true`.
  pub fn nodelay(mut self, value: bool) -> ConnectorBuilder {
    self.nodelay = value;
    self
  }
  /// Sets value for the `SO_KEEPALIVE` option on this socket.
  ///
  /// Default is `false`.
  pub fn keepalive(mut self, value: bool) -> ConnectorBuilder {
    self.keepalive = value;
    self
  }
  /// Enables a read timeout.
  ///
  /// The timeout applies to each read operation, and resets after a
  /// successful read.
  ///
  /// Default is 30 seconds.
  pub fn read_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.read_timeout = timeout;
    self
  }
  /// Enables a write timeout.
  ///
  /// Default is 30 seconds.
  pub fn write_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.write_timeout = timeout;
    self
  }
  /// Set a timeout for the connect phase, covering TCP, the upstream proxy
  /// handshake and the TLS handshake each.
  ///
  /// Default is 10 seconds.
  pub fn connect_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.connect_timeout = timeout;
    self
  }
  /// Where outbound TLS connections get their handshake plans.
  ///
  /// Defaults to a [`FingerprintEngine`] over the default profile.
  pub fn plans(mut self, plans: Arc<dyn PlanSource>) -> ConnectorBuilder {
    self.plans = Some(plans);
    self
  }
  /// Combine the configuration of this builder to create a `Connector`.
  pub fn build(&self) -> Connector {
    Connector {
      connect_timeout: self.connect_timeout,
      nodelay: self.nodelay,
      keepalive: self.keepalive,
      read_timeout: self.read_timeout,
      write_timeout: self.write_timeout,
      plans: self
        .plans
        .clone()
        .unwrap_or_else(|| Arc::new(FingerprintEngine::new(FingerprintProfile::default()))),
    }
  }
}

/// Opens outbound connections to origins, optionally through an upstream
/// proxy, with a freshly sampled TLS fingerprint per connection.
#[derive(Clone)]
pub struct Connector {
  connect_timeout: Option<Duration>,
  nodelay: bool,
  keepalive: bool,
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
  plans: Arc<dyn PlanSource>,
}

impl Connector {
  async fn bounded<F, T>(&self, what: &str, fut: F) -> Result<T>
  where
    F: Future<Output = Result<T>>,
  {
    match self.connect_timeout {
      None => fut.await,
      Some(timeout) => tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| new_io_error(std::io::ErrorKind::TimedOut, &format!("{} timed out", what)))?,
    }
  }

  /// Connect to a remote endpoint with addr
  pub async fn connect_with_addr<S: Into<SocketAddr>>(&self, addr: S) -> Result<Socket> {
    let addr = addr.into();
    let raw_socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    raw_socket.set_nonblocking(true)?;
    let socket = TcpSocket::from_std_stream(raw_socket.into());
    if self.nodelay {
      socket.set_nodelay(self.nodelay)?;
    }
    if self.keepalive {
      socket.set_keepalive(self.keepalive)?;
    }
    let s = self
      .bounded("connect", async { Ok::<_, Error>(socket.connect(addr).await?) })
      .await?;
    Ok(Socket::new(
      MaybeTlsStream::Tcp(s),
      self.read_timeout,
      self.write_timeout,
    ))
  }

  /// Resolve `host` and connect to the first address that answers.
  pub(crate) async fn connect_tcp(&self, host: &str, port: u16) -> Result<Socket> {
    let addrs: Vec<SocketAddr> = self
      .bounded("resolve", async {
        Ok::<_, Error>(tokio::net::lookup_host((host, port)).await?.collect())
      })
      .await
      .map_err(|e| Error::connection_error(format!("failed to resolve {}: {}", host, e)))?;
    let mut last_error = None;
    for addr in addrs {
      match self.connect_with_addr(addr).await {
        Ok(socket) => return Ok(socket),
        Err(e) => last_error = Some(e),
      }
    }
    Err(Error::connection_error(match last_error {
      Some(e) => format!("failed to connect to {}:{}: {}", host, port, e),
      None => format!("no addresses for {}", host),
    }))
  }

  /// Open a connection able to carry a request for `target`.
  ///
  /// `https` targets are wrapped in TLS. With an upstream proxy the
  /// connection is tunneled through it, except plain `http` through an HTTP
  /// proxy, which is left connected to the proxy itself.
  pub async fn connect(&self, target: &http::Uri, upstream: Option<&UpstreamProxy>) -> Result<Socket> {
    let https = target.scheme_str() == Some("https");
    let host = target
      .host()
      .ok_or_else(|| Error::invalid_request(format!("missing host in {}", target)))?
      .trim_start_matches('[')
      .trim_end_matches(']');
    let port = target.port_u16().unwrap_or(if https { 443 } else { 80 });
    let socket = match upstream {
      None => self.connect_tcp(host, port).await?,
      Some(proxy) => {
        let mut socket = self.connect_tcp(proxy.host(), proxy.port()).await?;
        if https || !proxy.forwards_plain_http() {
          self
            .bounded("upstream proxy handshake", proxy.tunnel(&mut socket, host, port))
            .await?;
        }
        socket
      }
    };
    if https {
      self.upgrade_to_tls(socket, host).await
    } else {
      Ok(socket)
    }
  }

  /// Wrap `stream` in TLS using a newly sampled handshake plan.
  pub async fn upgrade_to_tls(&self, stream: Socket, domain: &str) -> Result<Socket> {
    let plan = self.plans.plan();
    let config = tls::client_config(&plan)?;
    let domain = ServerName::try_from(domain.to_owned())
      .map_err(|e| Error::tls_error(format!("invalid server name {}: {}", domain, e)))?;
    let connector = TlsConnector::from(Arc::new(config));
    let connect_timeout = self.connect_timeout;
    let tls = stream
      .tls(move |t| async move {
        match connect_timeout {
          None => connector.connect(domain, t).await,
          Some(timeout) => tokio::time::timeout(timeout, connector.connect(domain, t))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "TLS handshake timed out"))?,
        }
      })
      .await?;
    Ok(tls)
  }
}

impl Default for Connector {
  fn default() -> Self {
    ConnectorBuilder::default().build()
  }
}
