//! HTTP/2 towards origins that negotiated `h2`
//!
//! Each call performs its own handshake on a fresh connection; the
//! connection task ends once the single stream completes.
use crate::errors::{new_io_error, Error, Result};
use crate::request::Limits;
use crate::socket::Socket;
use bytes::Bytes;
use h2::client;
use http::{Request, Response, Version};
use std::future::Future;
use std::time::Duration;

const H2_SKIPPED_HEADERS: [&str; 8] = [
  "connection",
  "proxy-connection",
  "keep-alive",
  "transfer-encoding",
  "upgrade",
  "te",
  "host",
  "proxy-authorization",
];

async fn within<F, T>(timeout: Option<Duration>, fut: F) -> Result<T>
where
  F: Future<Output = std::result::Result<T, h2::Error>>,
{
  match timeout {
    Some(to) => match tokio::time::timeout(to, fut).await {
      Ok(res) => Ok(res?),
      Err(_) => Err(new_io_error(std::io::ErrorKind::TimedOut, "HTTP/2 read timed out")),
    },
    None => Ok(fut.await?),
  }
}

/// Send `request` over `socket` and collect the full response.
///
/// The response is returned as HTTP/1.1 so it can be written back on the
/// client connection unchanged.
pub(crate) async fn send_request(
  socket: Socket,
  request: &Request<Bytes>,
  limits: &Limits,
) -> Result<Response<Bytes>> {
  let read_timeout = socket.read_timeout();
  let (client, h2_conn) = client::handshake(socket)
    .await
    .map_err(|e| Error::h2_error(format!("HTTP/2 handshake failed: {}", e)))?;
  tokio::spawn(async move {
    if let Err(e) = h2_conn.await {
      tracing::debug!("HTTP/2 connection closed: {}", e);
    }
  });
  let mut client = client
    .ready()
    .await
    .map_err(|e| Error::h2_error(format!("HTTP/2 client not ready: {}", e)))?;

  let mut h2_request = Request::builder()
    .method(request.method())
    .uri(request.uri())
    .version(Version::HTTP_2);
  for (key, value) in request.headers().iter() {
    if H2_SKIPPED_HEADERS.contains(&key.as_str()) {
      continue;
    }
    h2_request = h2_request.header(key, value);
  }
  let h2_request = h2_request.body(())?;
  let body = request.body().clone();
  let (response_future, mut send_stream) = client.send_request(h2_request, body.is_empty())?;
  if !body.is_empty() {
    send_stream.send_data(body, true)?;
  }

  let h2_response = within(read_timeout, response_future).await?;
  let (parts, mut body_stream) = h2_response.into_parts();
  let mut body = Vec::new();
  loop {
    let next = within(read_timeout, async { body_stream.data().await.transpose() }).await?;
    let Some(chunk) = next else {
      break;
    };
    body.extend_from_slice(&chunk);
    if body.len() > limits.max_body_bytes {
      return Err(new_io_error(
        std::io::ErrorKind::InvalidData,
        "body size exceeds maximum allowed",
      ));
    }
    body_stream.flow_control().release_capacity(chunk.len())?;
  }

  let mut response = Response::builder()
    .status(parts.status)
    .version(Version::HTTP_11)
    .body(Bytes::from(body))?;
  *response.headers_mut() = parts.headers;
  Ok(response)
}
