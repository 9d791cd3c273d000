//! HTTP/1.1 message framing used on both sides of the proxy.

use crate::body::Body;
use crate::errors::{new_io_error, Error, Result};
use crate::exchange::content_length;
use crate::{COLON_SPACE, CR_LF, SPACE};
use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, Version};
use std::io::ErrorKind;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Largest accepted request line plus headers.
pub(crate) const MAX_HEAD: usize = 64 * 1024;
/// Largest body buffered in either direction.
pub(crate) const MAX_BODY: u64 = 256 * 1024 * 1024;

/// Request line and headers of a client request.
#[derive(Debug)]
pub(crate) struct RequestHead {
  pub(crate) method: Method,
  pub(crate) target: String,
  pub(crate) version: Version,
  pub(crate) headers: HeaderMap,
}

/// How the length of a message body is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Framing {
  Empty,
  Length(u64),
  Chunked,
  UntilEof,
}

async fn read_line<R>(reader: &mut R, line: &mut Vec<u8>, budget: &mut usize) -> Result<usize>
where
  R: AsyncBufRead + Unpin,
{
  line.clear();
  let n = (&mut *reader)
    .take(*budget as u64 + 1)
    .read_until(b'\n', line)
    .await?;
  if n > *budget {
    return Err(Error::Parse("message head too large".to_string()));
  }
  *budget -= n;
  Ok(n)
}

fn trim_line(line: &[u8]) -> &[u8] {
  let line = line.strip_suffix(b"\n").unwrap_or(line);
  line.strip_suffix(b"\r").unwrap_or(line)
}

fn parse_version(raw: &[u8]) -> Result<Version> {
  match raw {
    b"HTTP/0.9" => Ok(Version::HTTP_09),
    b"HTTP/1.0" => Ok(Version::HTTP_10),
    b"HTTP/1.1" => Ok(Version::HTTP_11),
    b"HTTP/2" | b"HTTP/2.0" => Ok(Version::HTTP_2),
    _ => Err(new_io_error(ErrorKind::InvalidData, "invalid http version")),
  }
}

/// Split one `name: value` header line.
pub(crate) fn parse_header_line(line: &[u8]) -> Result<(HeaderName, HeaderValue)> {
  let mut parts = line.splitn(2, |b| *b == b':');
  let name = parts.next().unwrap_or_default();
  let value = parts.next().ok_or_else(|| {
    Error::Parse(format!(
      "header line without colon: {}",
      String::from_utf8_lossy(line)
    ))
  })?;
  let name = HeaderName::from_bytes(name)?;
  let value = HeaderValue::from_bytes(value.trim_ascii())?;
  Ok((name, value))
}

async fn read_headers<R>(reader: &mut R, budget: &mut usize) -> Result<HeaderMap>
where
  R: AsyncBufRead + Unpin,
{
  let mut headers = HeaderMap::new();
  let mut line = Vec::new();
  loop {
    if read_line(reader, &mut line, budget).await? == 0 {
      return Err(new_io_error(
        ErrorKind::UnexpectedEof,
        "connection closed inside message head",
      ));
    }
    let trimmed = trim_line(&line);
    if trimmed.is_empty() {
      break;
    }
    let (name, value) = parse_header_line(trimmed)?;
    headers.append(name, value);
  }
  Ok(headers)
}

/// Read a request line and headers. `None` if the peer closed first.
pub(crate) async fn read_request_head<R>(reader: &mut R) -> Result<Option<RequestHead>>
where
  R: AsyncBufRead + Unpin,
{
  let mut budget = MAX_HEAD;
  let mut line = Vec::new();
  loop {
    if read_line(reader, &mut line, &mut budget).await? == 0 {
      return Ok(None);
    }
    if !trim_line(&line).is_empty() {
      break;
    }
  }
  let request_line = trim_line(&line);
  let mut parts = request_line.split(|b| *b == b' ').filter(|p| !p.is_empty());
  let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
  else {
    return Err(Error::Parse(format!(
      "invalid request line: {}",
      String::from_utf8_lossy(request_line)
    )));
  };
  let method = Method::from_bytes(method).map_err(|e| Error::Parse(e.to_string()))?;
  let target = String::from_utf8(target.to_vec())
    .map_err(|_| Error::Parse("request target is not utf-8".to_string()))?;
  let version = parse_version(version)?;
  let headers = read_headers(reader, &mut budget).await?;
  Ok(Some(RequestHead {
    method,
    target,
    version,
    headers,
  }))
}

/// Read a status line and headers.
pub(crate) async fn read_response_head<R>(
  reader: &mut R,
) -> Result<(Version, StatusCode, HeaderMap)>
where
  R: AsyncBufRead + Unpin,
{
  let mut budget = MAX_HEAD;
  let mut line = Vec::new();
  if read_line(reader, &mut line, &mut budget).await? == 0 {
    return Err(new_io_error(
      ErrorKind::UnexpectedEof,
      "upstream closed before sending a response",
    ));
  }
  let status_line = trim_line(&line);
  let mut parts = status_line.splitn(3, |b| *b == b' ');
  let version = parse_version(parts.next().unwrap_or_default())?;
  let status = StatusCode::from_bytes(parts.next().unwrap_or_default())?;
  let headers = read_headers(reader, &mut budget).await?;
  Ok((version, status, headers))
}

fn is_chunked(headers: &HeaderMap) -> bool {
  headers.get_all(TRANSFER_ENCODING).iter().any(|v| {
    v.to_str()
      .map(|s| s.to_ascii_lowercase().contains("chunked"))
      .unwrap_or(false)
  })
}

/// Body framing of a client request.
pub(crate) fn request_framing(headers: &HeaderMap) -> Result<Framing> {
  if is_chunked(headers) {
    return Ok(Framing::Chunked);
  }
  match (headers.get(CONTENT_LENGTH), content_length(headers)) {
    (None, _) | (Some(_), Some(0)) => Ok(Framing::Empty),
    (Some(_), Some(n)) => Ok(Framing::Length(n)),
    (Some(raw), None) => Err(Error::Parse(format!("invalid content-length {:?}", raw))),
  }
}

/// Body framing of an upstream response to `method`.
pub(crate) fn response_framing(method: &Method, status: StatusCode, headers: &HeaderMap) -> Framing {
  if method == Method::HEAD
    || status.is_informational()
    || status == StatusCode::NO_CONTENT
    || status == StatusCode::NOT_MODIFIED
  {
    return Framing::Empty;
  }
  if is_chunked(headers) {
    return Framing::Chunked;
  }
  match content_length(headers) {
    Some(n) => Framing::Length(n),
    None => Framing::UntilEof,
  }
}

fn too_large() -> Error {
  Error::Parse(format!("body larger than {} bytes", MAX_BODY))
}

/// Buffer a whole body according to `framing`.
pub(crate) async fn read_body<R>(reader: &mut R, framing: Framing) -> Result<Bytes>
where
  R: AsyncBufRead + Unpin,
{
  match framing {
    Framing::Empty => Ok(Bytes::new()),
    Framing::Length(n) => {
      if n > MAX_BODY {
        return Err(too_large());
      }
      let mut body = Vec::new();
      (&mut *reader).take(n).read_to_end(&mut body).await?;
      if (body.len() as u64) < n {
        return Err(new_io_error(ErrorKind::UnexpectedEof, "truncated body"));
      }
      Ok(Bytes::from(body))
    }
    Framing::Chunked => read_chunked_body(reader).await,
    Framing::UntilEof => {
      let mut body = Vec::new();
      (&mut *reader).take(MAX_BODY + 1).read_to_end(&mut body).await?;
      if body.len() as u64 > MAX_BODY {
        return Err(too_large());
      }
      Ok(Bytes::from(body))
    }
  }
}

async fn read_chunked_body<R>(reader: &mut R) -> Result<Bytes>
where
  R: AsyncBufRead + Unpin,
{
  let mut body = Vec::new();
  let mut line = Vec::new();
  loop {
    let mut budget = MAX_HEAD;
    if read_line(reader, &mut line, &mut budget).await? == 0 {
      return Err(new_io_error(ErrorKind::UnexpectedEof, "truncated chunked body"));
    }
    let size = {
      let field = trim_line(&line)
        .split(|b| *b == b';')
        .next()
        .unwrap_or_default();
      let field = String::from_utf8_lossy(field).trim().to_string();
      u64::from_str_radix(&field, 16)
        .map_err(|e| Error::Parse(format!("invalid chunk size `{}`: {}", field, e)))?
    };
    if size == 0 {
      // trailers are read and discarded
      loop {
        if read_line(reader, &mut line, &mut budget).await? == 0 || trim_line(&line).is_empty() {
          break;
        }
      }
      break;
    }
    if size > MAX_BODY - body.len() as u64 {
      return Err(too_large());
    }
    let start = body.len();
    (&mut *reader).take(size).read_to_end(&mut body).await?;
    if ((body.len() - start) as u64) < size {
      return Err(new_io_error(ErrorKind::UnexpectedEof, "truncated chunk"));
    }
    read_line(reader, &mut line, &mut budget).await?;
  }
  Ok(Bytes::from(body))
}

/// `host` and `port` a request is addressed to, from the URI authority or
/// else the `Host` header.
pub(crate) fn target_of(uri: &Uri, headers: &HeaderMap) -> Option<(String, u16)> {
  let default_port = if uri.scheme() == Some(&http::uri::Scheme::HTTPS) {
    443
  } else {
    80
  };
  let authority = match uri.authority() {
    Some(authority) => authority.clone(),
    None => headers.get(HOST)?.to_str().ok()?.parse().ok()?,
  };
  Some((
    authority.host().to_string(),
    authority.port_u16().unwrap_or(default_port),
  ))
}

/// Serialize a response for the client.
///
/// The body is re-framed with an exact `Content-Length` and the connection
/// is marked for close.
pub(crate) fn response_to_raw(response: &http::Response<Body>) -> Bytes {
  let body = response.body();
  let keep_declared = body.is_empty() && response.headers().contains_key(CONTENT_LENGTH);
  let mut raw = Vec::new();
  raw.extend(format!("{:?}", Version::HTTP_11).as_bytes());
  raw.extend(SPACE);
  raw.extend(format!("{}", response.status()).as_bytes());
  raw.extend(CR_LF);
  for (k, v) in response.headers().iter() {
    if k == TRANSFER_ENCODING || k == CONNECTION || (k == CONTENT_LENGTH && !keep_declared) {
      continue;
    }
    raw.extend(k.as_str().as_bytes());
    raw.extend(COLON_SPACE);
    raw.extend(v.as_bytes());
    raw.extend(CR_LF);
  }
  if !keep_declared {
    raw.extend(format!("content-length: {}", body.len()).as_bytes());
    raw.extend(CR_LF);
  }
  raw.extend(b"connection: close");
  raw.extend(CR_LF);
  raw.extend(CR_LF);
  raw.extend(body.as_ref());
  Bytes::from(raw)
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::BufReader;

  #[tokio::test]
  async fn parses_absolute_form_request() {
    let raw: &[u8] =
      b"POST http://example.com/a?b=1 HTTP/1.1\r\nHost: example.com\r\nContent-Length: 3\r\n\r\nabcEXTRA";
    let mut reader = BufReader::new(raw);
    let head = read_request_head(&mut reader).await.unwrap().unwrap();
    assert_eq!(head.method, Method::POST);
    assert_eq!(head.target, "http://example.com/a?b=1");
    assert_eq!(head.version, Version::HTTP_11);
    let framing = request_framing(&head.headers).unwrap();
    assert_eq!(framing, Framing::Length(3));
    assert_eq!(&read_body(&mut reader, framing).await.unwrap()[..], b"abc");
  }

  #[tokio::test]
  async fn empty_connection_has_no_head() {
    let mut reader = BufReader::new(&b""[..]);
    assert!(read_request_head(&mut reader).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn oversized_head_is_rejected() {
    let mut raw = b"GET / HTTP/1.1\r\nx-big: ".to_vec();
    raw.extend(std::iter::repeat(b'a').take(MAX_HEAD));
    raw.extend(b"\r\n\r\n");
    let mut reader = BufReader::new(&raw[..]);
    assert!(matches!(
      read_request_head(&mut reader).await,
      Err(Error::Parse(_))
    ));
  }

  #[tokio::test]
  async fn chunked_response_body() {
    let raw: &[u8] = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4;ext=1\r\nWiki\r\n5\r\npedia\r\n0\r\nx-trailer: 1\r\n\r\n";
    let mut reader = BufReader::new(raw);
    let (version, status, headers) = read_response_head(&mut reader).await.unwrap();
    assert_eq!(version, Version::HTTP_11);
    assert_eq!(status, StatusCode::OK);
    let framing = response_framing(&Method::GET, status, &headers);
    assert_eq!(framing, Framing::Chunked);
    assert_eq!(&read_body(&mut reader, framing).await.unwrap()[..], b"Wikipedia");
  }

  #[tokio::test]
  async fn huge_chunk_size_is_rejected() {
    let raw: &[u8] = b"1\r\na\r\nffffffffffffffff\r\nzz\r\n0\r\n\r\n";
    let mut reader = BufReader::new(raw);
    assert!(matches!(
      read_body(&mut reader, Framing::Chunked).await,
      Err(Error::Parse(_))
    ));
  }

  #[tokio::test]
  async fn truncated_chunk_is_an_error() {
    let raw: &[u8] = b"10\r\nshort";
    let mut reader = BufReader::new(raw);
    assert!(read_body(&mut reader, Framing::Chunked).await.is_err());
  }

  #[tokio::test]
  async fn declared_length_must_arrive() {
    let mut reader = BufReader::new(&b"abc"[..]);
    assert!(matches!(
      read_body(&mut reader, Framing::Length(MAX_BODY)).await,
      Err(Error::IO(_))
    ));
    let mut reader = BufReader::new(&b"abc"[..]);
    assert!(matches!(
      read_body(&mut reader, Framing::Length(MAX_BODY + 1)).await,
      Err(Error::Parse(_))
    ));
  }

  #[tokio::test]
  async fn response_without_length_reads_to_eof() {
    let raw: &[u8] = b"HTTP/1.0 200 OK\r\n\r\nall of it";
    let mut reader = BufReader::new(raw);
    let (_, status, headers) = read_response_head(&mut reader).await.unwrap();
    let framing = response_framing(&Method::GET, status, &headers);
    assert_eq!(framing, Framing::UntilEof);
    assert_eq!(&read_body(&mut reader, framing).await.unwrap()[..], b"all of it");
    assert_eq!(
      response_framing(&Method::HEAD, status, &headers),
      Framing::Empty
    );
  }

  #[test]
  fn target_falls_back_to_host_header() {
    let mut headers = HeaderMap::new();
    headers.insert(HOST, "example.com:8080".parse().unwrap());
    let uri: Uri = "/x".parse().unwrap();
    assert_eq!(
      target_of(&uri, &headers),
      Some(("example.com".to_string(), 8080))
    );
    let uri: Uri = "https://secure.example/".parse().unwrap();
    assert_eq!(
      target_of(&uri, &headers),
      Some(("secure.example".to_string(), 443))
    );
  }

  #[test]
  fn response_is_reframed() {
    let response = http::Response::builder()
      .status(200)
      .header("transfer-encoding", "chunked")
      .header("connection", "keep-alive")
      .header("x-a", "1")
      .body(Body::from("hello"))
      .unwrap();
    let raw = response_to_raw(&response);
    assert_eq!(
      &raw[..],
      b"HTTP/1.1 200 OK\r\nx-a: 1\r\ncontent-length: 5\r\nconnection: close\r\n\r\nhello"
    );
  }
}
