//! HTTP/1.1 request codec
use crate::errors::{new_io_error, Error, Result};
use crate::response::{parser_headers, read_chunked_body, read_exact_body, read_line_bounded};
use crate::{COLON_SPACE, CR_LF, SPACE};
use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, Method, Request, Version};
use std::time::Duration;
use tokio::io::AsyncBufRead;

/// Size limits applied while reading messages.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Limits {
  pub max_header_bytes: usize,
  pub max_body_bytes: usize,
  pub read_timeout: Option<Duration>,
}

/// How the request target is written on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TargetForm {
  /// `/path?query`, to an origin
  Origin,
  /// `http://host/path`, to an upstream HTTP proxy
  Absolute,
}

const HOP_BY_HOP: [&str; 8] = [
  "connection",
  "proxy-connection",
  "keep-alive",
  "te",
  "trailer",
  "transfer-encoding",
  "upgrade",
  "proxy-authorization",
];

/// Read one request from a client.
///
/// Returns `Ok(None)` when the peer closes the connection before sending a
/// request line.
pub(crate) async fn read_request<R>(reader: &mut R, limits: &Limits) -> Result<Option<Request<Bytes>>>
where
  R: AsyncBufRead + Unpin,
{
  let mut line = Vec::new();
  // Tolerate stray CRLF between pipelined requests.
  loop {
    line.clear();
    let n = read_line_bounded(reader, &mut line, limits.max_header_bytes, limits.read_timeout).await?;
    if n == 0 {
      return Ok(None);
    }
    if line.len() > limits.max_header_bytes {
      return Err(Error::invalid_request("Request line too long"));
    }
    if line != CR_LF && line != b"\n" {
      break;
    }
  }
  let text = std::str::from_utf8(&line)
    .map_err(|_| Error::invalid_request("Request line is not UTF-8"))?
    .trim_end();
  let mut parts = text.split(' ').filter(|p| !p.is_empty());
  let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
    (Some(m), Some(t), Some(v), None) => (m, t, v),
    _ => return Err(Error::invalid_request(format!("Invalid request line: {}", text))),
  };
  let method = Method::from_bytes(method.as_bytes())
    .map_err(|_| Error::invalid_request(format!("Invalid method: {}", method)))?;
  let version = match version {
    "HTTP/1.1" => Version::HTTP_11,
    "HTTP/1.0" => Version::HTTP_10,
    other => return Err(Error::invalid_request(format!("Unsupported version: {}", other))),
  };
  let uri: http::Uri = target
    .parse()
    .map_err(|_| Error::invalid_request(format!("Invalid request target: {}", target)))?;

  let headers = read_headers(reader, limits).await?;
  let body = if method == Method::CONNECT {
    Vec::new()
  } else if is_chunked(&headers) {
    read_chunked_body(reader, limits).await?
  } else {
    match content_length(&headers)? {
      Some(len) => read_exact_body(reader, len, limits).await?,
      None => Vec::new(),
    }
  };

  let mut request = Request::builder()
    .method(method)
    .uri(uri)
    .version(version)
    .body(Bytes::from(body))?;
  *request.headers_mut() = headers;
  Ok(Some(request))
}

/// Read a header block up to the empty line.
pub(crate) async fn read_headers<R>(reader: &mut R, limits: &Limits) -> Result<HeaderMap>
where
  R: AsyncBufRead + Unpin,
{
  let mut headers = HeaderMap::new();
  let mut header_line = Vec::new();
  let mut total = 0usize;
  loop {
    header_line.clear();
    let remaining = limits.max_header_bytes - total;
    let length = read_line_bounded(reader, &mut header_line, remaining, limits.read_timeout).await?;
    if length == 0 {
      return Err(new_io_error(
        std::io::ErrorKind::UnexpectedEof,
        "connection closed inside header block",
      ));
    }
    total += length;
    if total > limits.max_header_bytes {
      return Err(Error::invalid_request("Headers size exceeds maximum allowed"));
    }
    if header_line == CR_LF || header_line == b"\n" {
      break;
    }
    if let Ok((Some(k), Some(v))) = parser_headers(&header_line) {
      headers.append(k, v);
    }
  }
  Ok(headers)
}

pub(crate) fn is_chunked(headers: &HeaderMap) -> bool {
  headers
    .get_all(TRANSFER_ENCODING)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .last()
    .map(|v| v.trim().eq_ignore_ascii_case("chunked"))
    .unwrap_or(false)
}

pub(crate) fn content_length(headers: &HeaderMap) -> Result<Option<usize>> {
  match headers.get(CONTENT_LENGTH) {
    None => Ok(None),
    Some(v) => v
      .to_str()
      .ok()
      .and_then(|s| s.trim().parse::<usize>().ok())
      .map(Some)
      .ok_or_else(|| new_io_error(std::io::ErrorKind::InvalidData, "invalid content-length")),
  }
}

/// Tokens listed in `Connection`, lowercased.
fn connection_tokens(headers: &HeaderMap) -> Vec<String> {
  headers
    .get_all(CONNECTION)
    .iter()
    .chain(headers.get_all("proxy-connection").iter())
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .map(|t| t.trim().to_ascii_lowercase())
    .filter(|t| !t.is_empty())
    .collect()
}

/// Whether the client expects the connection to stay open after this
/// exchange.
pub(crate) fn wants_keep_alive<B>(request: &Request<B>) -> bool {
  let tokens = connection_tokens(request.headers());
  match request.version() {
    Version::HTTP_10 => tokens.iter().any(|t| t == "keep-alive"),
    _ => !tokens.iter().any(|t| t == "close"),
  }
}

/// Drop hop-by-hop headers, including those named by `Connection`.
pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap) {
  for token in connection_tokens(headers) {
    if let Ok(name) = HeaderName::from_bytes(token.as_bytes()) {
      headers.remove(name);
    }
  }
  for name in HOP_BY_HOP {
    headers.remove(name);
  }
}

/// Serialize a request for the origin or an upstream proxy. The outbound
/// connection is single-use, so `Connection: close` is always sent.
pub(crate) fn to_raw(
  request: &Request<Bytes>,
  form: TargetForm,
  proxy_authorization: Option<&http::HeaderValue>,
) -> Bytes {
  let uri = request.uri();
  let target = match form {
    TargetForm::Absolute => uri.to_string(),
    TargetForm::Origin => uri
      .path_and_query()
      .map(|p| p.as_str().to_string())
      .filter(|p| !p.is_empty())
      .unwrap_or_else(|| "/".to_string()),
  };
  let mut headers = request.headers().clone();
  strip_hop_by_hop(&mut headers);
  headers.remove(CONTENT_LENGTH);

  let mut raw = Vec::with_capacity(256 + request.body().len());
  raw.extend(request.method().as_str().as_bytes());
  raw.extend(SPACE);
  raw.extend(target.as_bytes());
  raw.extend(b" HTTP/1.1");
  raw.extend(CR_LF);
  if !headers.contains_key(HOST) {
    if let Some(authority) = uri.authority() {
      raw.extend(b"host: ");
      raw.extend(authority.as_str().as_bytes());
      raw.extend(CR_LF);
    }
  }
  for (k, v) in headers.iter() {
    raw.extend(k.as_str().as_bytes());
    raw.extend(COLON_SPACE);
    raw.extend(v.as_bytes());
    raw.extend(CR_LF);
  }
  if !request.body().is_empty() || matches!(*request.method(), Method::POST | Method::PUT | Method::PATCH) {
    raw.extend(format!("content-length: {}", request.body().len()).as_bytes());
    raw.extend(CR_LF);
  }
  if let Some(auth) = proxy_authorization {
    raw.extend(b"proxy-authorization: ");
    raw.extend(auth.as_bytes());
    raw.extend(CR_LF);
  }
  raw.extend(b"connection: close");
  raw.extend(CR_LF);
  raw.extend(CR_LF);
  raw.extend(request.body().as_ref());
  Bytes::from(raw)
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::BufReader;

  fn limits() -> Limits {
    Limits {
      max_header_bytes: 1024,
      max_body_bytes: 1024,
      read_timeout: None,
    }
  }

  #[tokio::test]
  async fn reads_absolute_form_request_with_body() {
    let raw = b"POST http://example.com/submit?x=1 HTTP/1.1\r\nHost: example.com\r\nContent-Length: 5\r\n\r\nhelloGET";
    let mut reader = BufReader::new(&raw[..]);
    let request = read_request(&mut reader, &limits()).await.unwrap().unwrap();
    assert_eq!(request.method(), Method::POST);
    assert_eq!(request.uri().scheme_str(), Some("http"));
    assert_eq!(request.uri().path(), "/submit");
    assert_eq!(request.body().as_ref(), b"hello");
    assert!(wants_keep_alive(&request));
  }

  #[tokio::test]
  async fn reads_chunked_request() {
    let raw = b"PUT /a HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n2;ext=1\r\nde\r\n0\r\n\r\n";
    let mut reader = BufReader::new(&raw[..]);
    let request = read_request(&mut reader, &limits()).await.unwrap().unwrap();
    assert_eq!(request.body().as_ref(), b"abcde");
  }

  #[tokio::test]
  async fn eof_before_request_is_none() {
    let mut reader = BufReader::new(&b""[..]);
    assert!(read_request(&mut reader, &limits()).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn rejects_garbage_and_oversized_headers() {
    let mut reader = BufReader::new(&b"NOT A VALID REQUEST LINE\r\n\r\n"[..]);
    assert!(read_request(&mut reader, &limits()).await.is_err());

    let big = format!("GET / HTTP/1.1\r\nX-Big: {}\r\n\r\n", "a".repeat(2048));
    let mut reader = BufReader::new(big.as_bytes());
    let err = read_request(&mut reader, &limits()).await.unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));
  }

  #[tokio::test]
  async fn huge_chunk_size_is_rejected() {
    let raw = b"POST /u HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n1\r\na\r\nffffffffffffffff\r\n";
    let mut reader = BufReader::new(&raw[..]);
    let err = read_request(&mut reader, &limits()).await.unwrap_err();
    assert!(matches!(err, Error::Io(ref e) if e.kind() == std::io::ErrorKind::InvalidData), "{:?}", err);
  }

  #[tokio::test]
  async fn endless_request_line_stops_at_the_cap() {
    let mut reader = BufReader::new(tokio::io::repeat(b'a'));
    let err = read_request(&mut reader, &limits()).await.unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)), "{:?}", err);

    let head = &b"GET / HTTP/1.1\r\nX-Endless: "[..];
    let mut reader = BufReader::new(tokio::io::AsyncReadExt::chain(head, tokio::io::repeat(b'a')));
    let err = read_request(&mut reader, &limits()).await.unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)), "{:?}", err);
  }

  #[test]
  fn keep_alive_rules() {
    let close = Request::builder()
      .header("Connection", "close")
      .body(())
      .unwrap();
    assert!(!wants_keep_alive(&close));
    let old = Request::builder().version(Version::HTTP_10).body(()).unwrap();
    assert!(!wants_keep_alive(&old));
    let old_keep = Request::builder()
      .version(Version::HTTP_10)
      .header("Connection", "Keep-Alive")
      .body(())
      .unwrap();
    assert!(wants_keep_alive(&old_keep));
  }

  #[test]
  fn serializes_origin_form_without_hop_headers() {
    let request = Request::builder()
      .method(Method::GET)
      .uri("https://example.com/p?q=1")
      .header("Connection", "keep-alive, x-trace")
      .header("X-Trace", "1")
      .header("Proxy-Connection", "keep-alive")
      .header("Accept", "*/*")
      .body(Bytes::new())
      .unwrap();
    let raw = to_raw(&request, TargetForm::Origin, None);
    let text = std::str::from_utf8(&raw).unwrap();
    assert!(text.starts_with("GET /p?q=1 HTTP/1.1\r\nhost: example.com\r\n"));
    assert!(text.contains("accept: */*\r\n"));
    assert!(!text.contains("x-trace"));
    assert!(!text.contains("proxy-connection"));
    assert!(text.ends_with("connection: close\r\n\r\n"));
  }

  #[test]
  fn serializes_absolute_form_with_proxy_auth() {
    let request = Request::builder()
      .method(Method::POST)
      .uri("http://example.com/")
      .header("Host", "example.com")
      .body(Bytes::from_static(b"data"))
      .unwrap();
    let auth = http::HeaderValue::from_static("Basic YTpi");
    let raw = to_raw(&request, TargetForm::Absolute, Some(&auth));
    let text = std::str::from_utf8(&raw).unwrap();
    assert!(text.starts_with("POST http://example.com/ HTTP/1.1\r\n"));
    assert!(text.contains("content-length: 4\r\n"));
    assert!(text.contains("proxy-authorization: Basic YTpi\r\n"));
    assert!(text.ends_with("\r\n\r\ndata"));
  }
}
