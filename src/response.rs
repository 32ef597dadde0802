//! HTTP/1.1 response codec
use crate::errors::{new_io_error, Error, Result};
use crate::request::{content_length, is_chunked, read_headers, strip_hop_by_hop, Limits};
use crate::{COLON_SPACE, CR_LF, SPACE};
use bytes::Bytes;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use http::{Method, Response, StatusCode, Version};
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

/// Per read timeout wrapper. An elapsed timer becomes `TimedOut`.
pub(crate) async fn timed<F, T>(timeout: Option<Duration>, fut: F) -> Result<T>
where
  F: Future<Output = std::io::Result<T>>,
{
  match timeout {
    Some(to) => match tokio::time::timeout(to, fut).await {
      Ok(res) => Ok(res?),
      Err(_) => Err(new_io_error(std::io::ErrorKind::TimedOut, "read timed out")),
    },
    None => Ok(fut.await?),
  }
}

/// `read_until(b'\n')` that stops after `max + 1` bytes, so an overlong
/// line shows up as `line.len() > max` instead of growing without bound.
pub(crate) async fn read_line_bounded<R>(
  reader: &mut R,
  line: &mut Vec<u8>,
  max: usize,
  timeout: Option<Duration>,
) -> Result<usize>
where
  R: AsyncBufRead + Unpin,
{
  let mut limited = (&mut *reader).take(max as u64 + 1);
  timed(timeout, limited.read_until(b'\n', line)).await
}

/// Fill `buf` completely. The timeout applies to each read, not to the
/// whole buffer.
async fn read_full<R>(reader: &mut R, buf: &mut [u8], timeout: Option<Duration>) -> Result<()>
where
  R: AsyncRead + Unpin,
{
  let mut filled = 0;
  while filled < buf.len() {
    let n = timed(timeout, reader.read(&mut buf[filled..])).await?;
    if n == 0 {
      return Err(new_io_error(
        std::io::ErrorKind::UnexpectedEof,
        "connection closed inside body",
      ));
    }
    filled += n;
  }
  Ok(())
}

/// How a response read from the origin is interpreted.
#[derive(Debug, Clone)]
pub(crate) struct ResponseConfig {
  method: Method,
  limits: Limits,
}

impl ResponseConfig {
  pub(crate) fn new(method: Method, limits: Limits) -> Self {
    ResponseConfig { method, limits }
  }
}

/// Reads one response off an origin connection.
#[derive(Debug)]
pub(crate) struct ResponseBuilder<T: AsyncRead> {
  reader: BufReader<T>,
  config: ResponseConfig,
}

impl<T: AsyncRead + Unpin> ResponseBuilder<T> {
  pub(crate) fn new(reader: BufReader<T>, config: ResponseConfig) -> ResponseBuilder<T> {
    ResponseBuilder { reader, config }
  }

  async fn parser_version(&mut self) -> Result<(Version, StatusCode)> {
    let mut line = Vec::new();
    let limits = self.config.limits;
    let n = read_line_bounded(
      &mut self.reader,
      &mut line,
      limits.max_header_bytes,
      limits.read_timeout,
    )
    .await?;
    if n == 0 {
      return Err(new_io_error(
        std::io::ErrorKind::UnexpectedEof,
        "connection closed before status line",
      ));
    }
    if line.len() > limits.max_header_bytes {
      return Err(new_io_error(std::io::ErrorKind::InvalidData, "status line too long"));
    }
    let line = line.strip_suffix(CR_LF).unwrap_or(&line);
    let mut parts = line.splitn(3, |b| b == &b' ');
    let version = match parts.next() {
      Some(b"HTTP/1.0") => Version::HTTP_10,
      Some(b"HTTP/1.1") => Version::HTTP_11,
      _ => {
        return Err(new_io_error(
          std::io::ErrorKind::InvalidData,
          "invalid http version",
        ));
      }
    };
    let status = match parts.next() {
      Some(code) => StatusCode::from_bytes(code).map_err(|x| Error::Http(http::Error::from(x)))?,
      None => {
        return Err(new_io_error(
          std::io::ErrorKind::InvalidData,
          "invalid http version and status_code data",
        ));
      }
    };
    Ok((version, status))
  }

  fn has_body(&self, status: StatusCode) -> bool {
    !(self.config.method == Method::HEAD
      || status.is_informational()
      || status == StatusCode::NO_CONTENT
      || status == StatusCode::NOT_MODIFIED)
  }

  async fn read_body(&mut self, status: StatusCode, headers: &http::HeaderMap) -> Result<Vec<u8>> {
    if !self.has_body(status) {
      return Ok(Vec::new());
    }
    let limits = self.config.limits;
    if is_chunked(headers) {
      return read_chunked_body(&mut self.reader, &limits).await;
    }
    match content_length(headers)? {
      Some(len) => read_exact_body(&mut self.reader, len, &limits).await,
      None => read_to_close(&mut self.reader, &limits).await,
    }
  }

  /// Read the final response, skipping interim `1xx` responses.
  pub(crate) async fn build(mut self) -> Result<Response<Bytes>> {
    loop {
      let (version, status) = self.parser_version().await?;
      let headers = read_headers(&mut self.reader, &self.config.limits).await?;
      if status.is_informational() && status != StatusCode::SWITCHING_PROTOCOLS {
        continue;
      }
      let body = self.read_body(status, &headers).await?;
      let mut response = Response::builder()
        .version(version)
        .status(status)
        .body(Bytes::from(body))?;
      *response.headers_mut() = headers;
      return Ok(response);
    }
  }
}

pub(crate) async fn read_exact_body<R>(reader: &mut R, len: usize, limits: &Limits) -> Result<Vec<u8>>
where
  R: AsyncRead + Unpin,
{
  if len > limits.max_body_bytes {
    return Err(new_io_error(
      std::io::ErrorKind::InvalidData,
      "body size exceeds maximum allowed",
    ));
  }
  let mut body = vec![0; len];
  read_full(reader, &mut body, limits.read_timeout).await?;
  Ok(body)
}

async fn read_to_close<R>(reader: &mut R, limits: &Limits) -> Result<Vec<u8>>
where
  R: AsyncRead + Unpin,
{
  let mut body = Vec::new();
  let mut buffer = vec![0; 8192];
  loop {
    let n = timed(limits.read_timeout, reader.read(&mut buffer)).await?;
    if n == 0 {
      break;
    }
    body.extend_from_slice(&buffer[..n]);
    if body.len() > limits.max_body_bytes {
      return Err(new_io_error(
        std::io::ErrorKind::InvalidData,
        "body size exceeds maximum allowed",
      ));
    }
  }
  Ok(body)
}

/// Decode a chunked body, discarding extensions and trailers.
pub(crate) async fn read_chunked_body<R>(reader: &mut R, limits: &Limits) -> Result<Vec<u8>>
where
  R: AsyncBufRead + Unpin,
{
  let mut body: Vec<u8> = Vec::new();
  let mut line = Vec::new();
  loop {
    line.clear();
    let n = read_line_bounded(reader, &mut line, limits.max_header_bytes, limits.read_timeout).await?;
    if n == 0 {
      return Err(new_io_error(
        std::io::ErrorKind::UnexpectedEof,
        "connection closed inside chunked body",
      ));
    }
    if line.len() > limits.max_header_bytes {
      return Err(new_io_error(std::io::ErrorKind::InvalidData, "chunk size line too long"));
    }
    let text = String::from_utf8_lossy(&line);
    let size = text.split(';').next().unwrap_or_default().trim();
    if size.is_empty() {
      continue;
    }
    let chunk = usize::from_str_radix(size, 16)
      .map_err(|_| new_io_error(std::io::ErrorKind::InvalidData, "invalid chunk size"))?;
    if chunk == 0 {
      break;
    }
    if chunk > limits.max_body_bytes - body.len() {
      return Err(new_io_error(
        std::io::ErrorKind::InvalidData,
        "body size exceeds maximum allowed",
      ));
    }
    let start = body.len();
    body.resize(start + chunk, 0);
    read_full(reader, &mut body[start..], limits.read_timeout).await?;
  }
  // trailers
  let mut trailers = 0usize;
  loop {
    line.clear();
    let remaining = limits.max_header_bytes - trailers;
    let n = read_line_bounded(reader, &mut line, remaining, limits.read_timeout).await?;
    if n == 0 || line == CR_LF || line == b"\n" {
      break;
    }
    trailers += n;
    if trailers > limits.max_header_bytes {
      return Err(new_io_error(std::io::ErrorKind::InvalidData, "trailers too long"));
    }
  }
  Ok(body)
}

/// Split a raw header line into name and value.
pub(crate) fn parser_headers(
  buffer: &[u8],
) -> Result<(Option<http::HeaderName>, Option<http::HeaderValue>)> {
  let mut k = None;
  let mut v = None;
  let buffer = buffer.strip_suffix(CR_LF).unwrap_or(buffer);
  let buffer = buffer.strip_suffix(b"\n").unwrap_or(buffer);
  for (index, h) in buffer.splitn(2, |s| s == &58).enumerate() {
    let h = h.trim_ascii();
    match index {
      0 => match http::HeaderName::from_bytes(h) {
        Ok(hk) => k = Some(hk),
        Err(err) => {
          return Err(Error::Http(http::Error::from(err)));
        }
      },
      1 => match http::HeaderValue::from_bytes(h) {
        Ok(hv) => v = Some(hv),
        Err(err) => {
          return Err(Error::Http(http::Error::from(err)));
        }
      },
      _ => {}
    }
  }
  Ok((k, v))
}

/// Serialize a response for the client.
///
/// Framing is always rewritten to `Content-Length`. Responses to `HEAD`
/// keep the origin's length and carry no body.
pub(crate) fn to_raw(response: &Response<Bytes>, head: bool, keep_alive: bool) -> Bytes {
  let status = response.status();
  let mut headers = response.headers().clone();
  strip_hop_by_hop(&mut headers);
  let bodyless = head
    || status.is_informational()
    || status == StatusCode::NO_CONTENT
    || status == StatusCode::NOT_MODIFIED;
  if !head {
    headers.remove(CONTENT_LENGTH);
  }

  let mut raw = Vec::with_capacity(256 + response.body().len());
  raw.extend(b"HTTP/1.1");
  raw.extend(SPACE);
  raw.extend(status.as_str().as_bytes());
  raw.extend(SPACE);
  raw.extend(status.canonical_reason().unwrap_or("Unknown").as_bytes());
  raw.extend(CR_LF);
  for (k, v) in headers.iter() {
    raw.extend(k.as_str().as_bytes());
    raw.extend(COLON_SPACE);
    raw.extend(v.as_bytes());
    raw.extend(CR_LF);
  }
  if !bodyless {
    raw.extend(format!("content-length: {}", response.body().len()).as_bytes());
    raw.extend(CR_LF);
  }
  if keep_alive {
    raw.extend(b"connection: keep-alive");
  } else {
    raw.extend(b"connection: close");
  }
  raw.extend(CR_LF);
  raw.extend(CR_LF);
  if !bodyless {
    raw.extend(response.body().as_ref());
  }
  Bytes::from(raw)
}

/// Plain text response generated by the proxy itself.
pub(crate) fn error_response(status: StatusCode, message: &str) -> Response<Bytes> {
  let mut response = Response::new(Bytes::from(format!("{}\n", message)));
  *response.status_mut() = status;
  response.headers_mut().insert(
    CONTENT_TYPE,
    http::HeaderValue::from_static("text/plain; charset=utf-8"),
  );
  response
}
