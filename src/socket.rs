use std::io::Error;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

/// Outbound connection to an origin or upstream proxy.
#[derive(Debug)]
pub struct Socket {
  inner: MaybeTlsStream,
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
}

impl Socket {
  pub(crate) fn new(
    maybe_tls_stream: MaybeTlsStream,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
  ) -> Self {
    Self {
      inner: maybe_tls_stream,
      read_timeout,
      write_timeout,
    }
  }

  /// Replace the plain TCP stream with the result of `func`. Already
  /// encrypted sockets are returned as is.
  pub(crate) async fn tls<F, Fut>(self, func: F) -> Result<Self, Error>
  where
    F: FnOnce(TcpStream) -> Fut,
    Fut: std::future::Future<Output = Result<TlsStream<TcpStream>, Error>>,
  {
    let inner = match self.inner {
      MaybeTlsStream::Tcp(t) => MaybeTlsStream::Tls(Box::new(func(t).await?)),
      tls @ MaybeTlsStream::Tls(_) => tls,
    };
    Ok(Self {
      inner,
      read_timeout: self.read_timeout,
      write_timeout: self.write_timeout,
    })
  }

  /// Per read idle timeout.
  pub fn read_timeout(&self) -> Option<Duration> {
    self.read_timeout
  }

  /// Per write timeout.
  pub fn write_timeout(&self) -> Option<Duration> {
    self.write_timeout
  }

  /// Protocol agreed through ALPN, if any.
  pub fn alpn_protocol(&self) -> Option<&[u8]> {
    match &self.inner {
      MaybeTlsStream::Tcp(_) => None,
      MaybeTlsStream::Tls(stream) => stream.get_ref().1.alpn_protocol(),
    }
  }

  /// Whether the origin negotiated HTTP/2.
  pub fn is_h2(&self) -> bool {
    self.alpn_protocol() == Some(b"h2")
  }
}

/// Plain or TLS-wrapped TCP stream.
#[derive(Debug)]
pub enum MaybeTlsStream {
  /// TCP
  Tcp(TcpStream),
  /// TLS
  Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for Socket {
  fn poll_read(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    Pin::new(&mut self.inner).poll_read(cx, buf)
  }
}

impl AsyncWrite for Socket {
  fn poll_write(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, Error>> {
    Pin::new(&mut self.inner).poll_write(cx, buf)
  }

  fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    Pin::new(&mut self.inner).poll_flush(cx)
  }

  fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    Pin::new(&mut self.inner).poll_shutdown(cx)
  }
}

impl AsyncRead for MaybeTlsStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
    }
  }
}

impl AsyncWrite for MaybeTlsStream {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
    }
  }
}
