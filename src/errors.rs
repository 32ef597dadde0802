//! Error types for the proxy
use std::io;
use thiserror::Error as ThisError;

/// A `Result` alias where the `Err` case is `hazetunnel::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// The errors that may occur while running proxy instances.
#[derive(ThisError, Debug)]
pub enum Error {
  /// IO error
  #[error("IO error: {0}")]
  Io(io::Error),

  /// TLS error from rustls
  #[error("TLS error: {0}")]
  Tls(String),

  /// HTTP message construction error
  #[error("HTTP error: {0}")]
  Http(http::Error),

  /// HTTP/2 protocol error
  #[error("HTTP/2 error: {0}")]
  H2(String),

  /// Certificate issuance error
  #[error("Certificate error: {0}")]
  Certificate(String),

  /// The configured upstream proxy could not be parsed
  #[error("invalid upstream proxy `{url}`: {reason}")]
  InvalidUpstreamProxy {
    /// The configured value
    url: String,
    /// Why it was rejected
    reason: String,
  },

  /// An instance with this id is already registered
  #[error("instance `{0}` is already running")]
  DuplicateInstance(String),

  /// No instance with this id is registered
  #[error("instance `{0}` not found")]
  InstanceNotFound(String),

  /// The listener could not be bound
  #[error("failed to bind {addr}: {source}")]
  Bind {
    /// Requested bind address
    addr: String,
    /// Underlying error
    source: io::Error,
  },

  /// Connection error towards the origin or an upstream proxy
  #[error("Connection error: {0}")]
  Connection(String),

  /// Malformed client request
  #[error("Invalid request: {0}")]
  InvalidRequest(String),

  /// Other errors
  #[error("{0}")]
  Other(String),
}

impl Error {
  /// Create a certificate error and log it
  pub fn certificate_error(msg: impl Into<String>) -> Self {
    let error = Error::Certificate(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a TLS error and log it
  pub fn tls_error(msg: impl Into<String>) -> Self {
    let error = Error::Tls(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create an HTTP/2 error and log it
  pub fn h2_error(msg: impl Into<String>) -> Self {
    let error = Error::H2(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a connection error and log it
  pub fn connection_error(msg: impl Into<String>) -> Self {
    let error = Error::Connection(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create an invalid request error and log it
  pub fn invalid_request(msg: impl Into<String>) -> Self {
    let error = Error::InvalidRequest(msg.into());
    tracing::warn!("{}", error);
    error
  }

  /// Create an invalid upstream proxy error and log it
  pub fn invalid_upstream(url: impl Into<String>, reason: impl Into<String>) -> Self {
    let error = Error::InvalidUpstreamProxy {
      url: url.into(),
      reason: reason.into(),
    };
    tracing::error!("{}", error);
    error
  }

  /// Create a duplicate instance error and log it
  pub fn duplicate_instance(id: impl Into<String>) -> Self {
    let error = Error::DuplicateInstance(id.into());
    tracing::warn!("{}", error);
    error
  }

  /// Create an instance not found error and log it
  pub fn instance_not_found(id: impl Into<String>) -> Self {
    let error = Error::InstanceNotFound(id.into());
    tracing::warn!("{}", error);
    error
  }

  /// Create a bind error and log it
  pub fn bind_error(addr: impl Into<String>, source: io::Error) -> Self {
    let error = Error::Bind {
      addr: addr.into(),
      source,
    };
    tracing::error!("{}", error);
    error
  }

  /// Create an other error and log it
  pub fn other(msg: impl Into<String>) -> Self {
    let error = Error::Other(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Whether the error describes a peer that simply went away.
  pub(crate) fn is_disconnect(&self) -> bool {
    match self {
      Error::Io(e) => matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof
          | io::ErrorKind::ConnectionReset
          | io::ErrorKind::ConnectionAborted
          | io::ErrorKind::BrokenPipe
      ),
      _ => false,
    }
  }
}

impl From<io::Error> for Error {
  fn from(value: io::Error) -> Self {
    let error = Error::Io(value);
    tracing::debug!("{}", error);
    error
  }
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    let error = Error::Http(value);
    tracing::error!("{}", error);
    error
  }
}

impl From<http::header::InvalidHeaderValue> for Error {
  fn from(value: http::header::InvalidHeaderValue) -> Self {
    Error::from(http::Error::from(value))
  }
}

impl From<http::uri::InvalidUri> for Error {
  fn from(value: http::uri::InvalidUri) -> Self {
    Error::from(http::Error::from(value))
  }
}

impl From<tokio_rustls::rustls::Error> for Error {
  fn from(value: tokio_rustls::rustls::Error) -> Self {
    Error::tls_error(value.to_string())
  }
}

impl From<h2::Error> for Error {
  fn from(value: h2::Error) -> Self {
    Error::h2_error(value.to_string())
  }
}

pub(crate) fn new_io_error(error_kind: io::ErrorKind, msg: &str) -> Error {
  Error::Io(io::Error::new(error_kind, msg))
}
