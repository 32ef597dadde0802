//! Payload injection into intercepted markup responses
use bytes::Bytes;
use encoding_rs::Encoding;
use flate2::read::{DeflateDecoder, MultiGzDecoder, ZlibDecoder};
use flate2::write::{DeflateEncoder, GzEncoder, ZlibEncoder};
use flate2::Compression;
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, ETAG};
use http::{HeaderMap, HeaderValue, Response, StatusCode};
use mime::Mime;
use std::io::{Read, Write};

/// Decoded size cap used by [`inject`].
pub const DEFAULT_MAX_DECODED: usize = 32 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Coding {
  Identity,
  Gzip,
  Deflate { zlib: bool },
}

impl Coding {
  fn from_headers(headers: &HeaderMap, body: &[u8]) -> Option<Coding> {
    let mut values = headers.get_all(CONTENT_ENCODING).iter();
    let value = match (values.next(), values.next()) {
      (None, _) => return Some(Coding::Identity),
      (Some(v), None) => v.to_str().ok()?.trim().to_ascii_lowercase(),
      _ => return None,
    };
    match value.as_str() {
      "" | "identity" => Some(Coding::Identity),
      "gzip" | "x-gzip" => Some(Coding::Gzip),
      // servers disagree on whether deflate means zlib or raw
      "deflate" => Some(Coding::Deflate {
        zlib: looks_like_zlib(body),
      }),
      _ => None,
    }
  }

  /// Decode at most `limit` bytes; anything larger is an error.
  fn decode(self, body: &[u8], limit: usize) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    let cap = limit as u64 + 1;
    match self {
      Coding::Identity => out.extend_from_slice(body),
      Coding::Gzip => {
        MultiGzDecoder::new(body).take(cap).read_to_end(&mut out)?;
      }
      Coding::Deflate { zlib: true } => {
        ZlibDecoder::new(body).take(cap).read_to_end(&mut out)?;
      }
      Coding::Deflate { zlib: false } => {
        DeflateDecoder::new(body).take(cap).read_to_end(&mut out)?;
      }
    }
    if out.len() > limit {
      return Err(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        "decoded body exceeds maximum allowed",
      ));
    }
    Ok(out)
  }

  fn encode(self, body: &[u8]) -> std::io::Result<Vec<u8>> {
    match self {
      Coding::Identity => Ok(body.to_vec()),
      Coding::Gzip => {
        let mut e = GzEncoder::new(Vec::new(), Compression::default());
        e.write_all(body)?;
        e.finish()
      }
      Coding::Deflate { zlib: true } => {
        let mut e = ZlibEncoder::new(Vec::new(), Compression::default());
        e.write_all(body)?;
        e.finish()
      }
      Coding::Deflate { zlib: false } => {
        let mut e = DeflateEncoder::new(Vec::new(), Compression::default());
        e.write_all(body)?;
        e.finish()
      }
    }
  }
}

fn looks_like_zlib(body: &[u8]) -> bool {
  match body {
    [cmf, flg, ..] => cmf & 0x0f == 8 && (u16::from(*cmf) << 8 | u16::from(*flg)) % 31 == 0,
    _ => false,
  }
}

fn is_markup(headers: &HeaderMap) -> bool {
  let Some(mime) = headers
    .get(CONTENT_TYPE)
    .and_then(|value| value.to_str().ok())
    .and_then(|value| value.parse::<Mime>().ok())
  else {
    return false;
  };
  let markup = (mime.type_() == mime::TEXT && mime.subtype() == mime::HTML)
    || (mime.type_() == mime::APPLICATION && mime.subtype() == "xhtml" && mime.suffix() == Some(mime::XML));
  if !markup {
    return false;
  }
  match mime.get_param(mime::CHARSET) {
    None => true,
    Some(charset) => Encoding::for_label(charset.as_str().as_bytes())
      .map(|e| e.is_ascii_compatible())
      .unwrap_or(false),
  }
}

fn is_eligible<B>(response: &Response<B>) -> bool {
  let status = response.status();
  status.is_success()
    && status != StatusCode::NO_CONTENT
    && status != StatusCode::PARTIAL_CONTENT
    && !response.headers().contains_key(CONTENT_RANGE)
    && is_markup(response.headers())
}

fn find_ignore_case(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
  if from > haystack.len() || needle.len() > haystack.len() - from {
    return None;
  }
  haystack[from..]
    .windows(needle.len())
    .position(|w| w.eq_ignore_ascii_case(needle))
    .map(|p| p + from)
}

/// Position right after the opening `<head>` tag, skipping `<header>`.
fn after_head_tag(body: &[u8]) -> Option<usize> {
  let mut from = 0;
  while let Some(start) = find_ignore_case(body, b"<head", from) {
    let next = start + 5;
    match body.get(next) {
      Some(b'>') => return Some(next + 1),
      Some(c) if c.is_ascii_whitespace() || *c == b'/' => {
        return body[next..].iter().position(|b| *b == b'>').map(|p| next + p + 1);
      }
      _ => from = next,
    }
  }
  None
}

fn insert_script(body: &[u8], payload: &str) -> Vec<u8> {
  let script = format!("<script>{}</script>", payload);
  let at = after_head_tag(body)
    .or_else(|| find_ignore_case(body, b"</body", 0))
    .unwrap_or(body.len());
  let mut out = Vec::with_capacity(body.len() + script.len());
  out.extend_from_slice(&body[..at]);
  out.extend_from_slice(script.as_bytes());
  out.extend_from_slice(&body[at..]);
  out
}

/// Insert `<script>{payload}</script>` into an HTML response.
///
/// Responses that are not successful markup, use an encoding that cannot
/// be rewritten losslessly, or fail to decode are returned unchanged.
pub fn inject(response: Response<Bytes>, payload: &str) -> Response<Bytes> {
  inject_limited(response, payload, DEFAULT_MAX_DECODED)
}

/// [`inject`] with an explicit cap on the decoded body. Bodies that
/// decompress past `max_decoded` bytes are passed through untouched.
pub fn inject_limited(response: Response<Bytes>, payload: &str, max_decoded: usize) -> Response<Bytes> {
  if payload.is_empty() || !is_eligible(&response) {
    return response;
  }
  let Some(coding) = Coding::from_headers(response.headers(), response.body()) else {
    return response;
  };
  let decoded = match coding.decode(response.body(), max_decoded) {
    Ok(decoded) => decoded,
    Err(e) => {
      tracing::debug!("leaving undecodable body untouched: {}", e);
      return response;
    }
  };
  let encoded = match coding.encode(&insert_script(&decoded, payload)) {
    Ok(encoded) => encoded,
    Err(e) => {
      tracing::debug!("failed to re-encode rewritten body: {}", e);
      return response;
    }
  };
  let (mut parts, _) = response.into_parts();
  parts
    .headers
    .insert(CONTENT_LENGTH, HeaderValue::from(encoded.len()));
  parts.headers.remove(ETAG);
  parts.headers.remove("content-md5");
  Response::from_parts(parts, Bytes::from(encoded))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn html(body: &'static [u8]) -> Response<Bytes> {
    Response::builder()
      .header(CONTENT_TYPE, "text/html; charset=UTF-8")
      .header(CONTENT_LENGTH, body.len())
      .header(ETAG, "\"abc\"")
      .body(Bytes::from_static(body))
      .unwrap()
  }

  fn text(resp: &Response<Bytes>) -> &str {
    std::str::from_utf8(resp.body()).unwrap()
  }

  #[test]
  fn injects_after_head_tag() {
    let resp = inject(
      html(b"<!doctype html><HTML><Head lang=\"en\"><title>t</title></head><body></body></HTML>"),
      "alert(1)",
    );
    assert_eq!(
      text(&resp),
      "<!doctype html><HTML><Head lang=\"en\"><script>alert(1)</script><title>t</title></head><body></body></HTML>"
    );
    assert_eq!(resp.headers()[CONTENT_LENGTH], resp.body().len().to_string().as_str());
    assert!(resp.headers().get(ETAG).is_none());
  }

  #[test]
  fn header_element_is_not_head() {
    let resp = inject(html(b"<header>x</header><BODY>y</BODY>"), "p()");
    assert_eq!(text(&resp), "<header>x</header><BODY>y<script>p()</script></BODY>");
  }

  #[test]
  fn falls_back_to_appending() {
    let resp = inject(html(b"<p>fragment</p>"), "p()");
    assert_eq!(text(&resp), "<p>fragment</p><script>p()</script>");
  }

  #[test]
  fn ineligible_responses_are_untouched() {
    let json = Response::builder()
      .header(CONTENT_TYPE, "application/json")
      .body(Bytes::from_static(b"{\"a\":1}"))
      .unwrap();
    let out = inject(json, "p()");
    assert_eq!(out.body().as_ref(), b"{\"a\":1}");
    assert_eq!(out.headers().len(), 1);

    let mut failed = html(b"<head></head>");
    *failed.status_mut() = StatusCode::NOT_FOUND;
    assert_eq!(inject(failed, "p()").body().as_ref(), b"<head></head>");

    let mut partial = html(b"<head></head>");
    *partial.status_mut() = StatusCode::PARTIAL_CONTENT;
    assert_eq!(inject(partial, "p()").body().as_ref(), b"<head></head>");

    let utf16 = Response::builder()
      .header(CONTENT_TYPE, "text/html; charset=utf-16")
      .body(Bytes::from_static(b"<\0h\0"))
      .unwrap();
    assert_eq!(inject(utf16, "p()").body().as_ref(), b"<\0h\0");

    let brotli = Response::builder()
      .header(CONTENT_TYPE, "text/html")
      .header(CONTENT_ENCODING, "br")
      .body(Bytes::from_static(b"\x0b\x02\x80"))
      .unwrap();
    assert_eq!(inject(brotli, "p()").body().as_ref(), b"\x0b\x02\x80");

    let unchanged = inject(html(b"<head></head>"), "");
    assert_eq!(unchanged.body().as_ref(), b"<head></head>");
    assert!(unchanged.headers().contains_key(ETAG));
  }

  #[test]
  fn rewrites_gzip_bodies_in_place() {
    let compressed = Coding::Gzip.encode(b"<html><head></head></html>").unwrap();
    let resp = Response::builder()
      .header(CONTENT_TYPE, "application/xhtml+xml")
      .header(CONTENT_ENCODING, "gzip")
      .body(Bytes::from(compressed))
      .unwrap();
    let out = inject(resp, "p()");
    assert_eq!(out.headers()[CONTENT_ENCODING], "gzip");
    let decoded = Coding::Gzip.decode(out.body(), DEFAULT_MAX_DECODED).unwrap();
    assert_eq!(decoded, b"<html><head><script>p()</script></head></html>");
  }

  #[test]
  fn deflate_flavours_are_detected() {
    let zlib = Coding::Deflate { zlib: true }.encode(b"<head>").unwrap();
    let raw = Coding::Deflate { zlib: false }.encode(b"<head>").unwrap();
    assert!(looks_like_zlib(&zlib));
    for body in [zlib, raw] {
      let resp = Response::builder()
        .header(CONTENT_TYPE, "text/html")
        .header(CONTENT_ENCODING, "deflate")
        .body(Bytes::from(body))
        .unwrap();
      let coding = Coding::from_headers(resp.headers(), resp.body()).unwrap();
      let out = inject(resp, "p()");
      assert_eq!(coding.decode(out.body(), DEFAULT_MAX_DECODED).unwrap(), b"<head><script>p()</script>");
    }
  }

  #[test]
  fn corrupt_gzip_passes_through() {
    let resp = Response::builder()
      .header(CONTENT_TYPE, "text/html")
      .header(CONTENT_ENCODING, "gzip")
      .body(Bytes::from_static(b"not gzip at all"))
      .unwrap();
    assert_eq!(inject(resp, "p()").body().as_ref(), b"not gzip at all");
  }

  #[test]
  fn oversized_decompression_passes_through() {
    let page = format!("<html><head></head><body>{}</body></html>", " ".repeat(1 << 20));
    let compressed = Coding::Gzip.encode(page.as_bytes()).unwrap();
    assert!(compressed.len() < 16 * 1024);
    let resp = Response::builder()
      .header(CONTENT_TYPE, "text/html")
      .header(CONTENT_ENCODING, "gzip")
      .body(Bytes::from(compressed.clone()))
      .unwrap();
    let out = inject_limited(resp, "p()", 64 * 1024);
    assert_eq!(out.body().as_ref(), compressed.as_slice());

    let resp = Response::builder()
      .header(CONTENT_TYPE, "text/html")
      .header(CONTENT_ENCODING, "gzip")
      .body(Bytes::from(compressed))
      .unwrap();
    let out = inject_limited(resp, "p()", 2 << 20);
    let decoded = Coding::Gzip.decode(out.body(), 2 << 20).unwrap();
    assert!(decoded.starts_with(b"<html><head><script>p()</script>"));
  }
}
