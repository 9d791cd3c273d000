//! Request and response wrappers carried through an interception.

use crate::body::Body;
use crate::errors::Result;
use crate::{COLON_SPACE, CR_LF, SPACE};
use bytes::Bytes;
use std::fmt;
use std::io::Write;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the unix epoch, `0` if the clock is before it.
pub fn unix_now() -> i64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_secs() as i64)
    .unwrap_or(0)
}

/// A client request that reached the proxy, plus where it came from and
/// where it is going.
pub struct InterceptedRequest {
  /// Source address and port (client)
  pub source: Option<SocketAddr>,
  /// Destination address (host:port)
  pub destination: String,
  /// Arrival time in unix seconds
  pub timestamp: i64,
  /// The buffered request
  pub request: http::Request<Body>,
}

impl InterceptedRequest {
  /// Wrap a request with no known client address.
  pub fn new(destination: impl Into<String>, request: http::Request<Body>) -> Self {
    Self {
      source: None,
      destination: destination.into(),
      timestamp: unix_now(),
      request,
    }
  }

  /// Wrap a request received from `source`.
  pub fn with_source(
    source: SocketAddr,
    destination: impl Into<String>,
    request: http::Request<Body>,
  ) -> Self {
    Self {
      source: Some(source),
      ..Self::new(destination, request)
    }
  }

  /// Get the source address
  pub fn source(&self) -> Option<SocketAddr> {
    self.source
  }

  /// Get the destination address
  pub fn destination(&self) -> &str {
    &self.destination
  }

  /// Get the underlying request
  pub fn request(&self) -> &http::Request<Body> {
    &self.request
  }

  /// Get a mutable reference to the underlying request
  pub fn request_mut(&mut self) -> &mut http::Request<Body> {
    &mut self.request
  }

  /// Consume the wrapper, returning the request.
  pub fn into_request(self) -> http::Request<Body> {
    self.request
  }

  /// Host the client asked for: the `Host` header, falling back to the
  /// authority of an absolute-form target.
  pub fn host(&self) -> String {
    self
      .request
      .headers()
      .get(http::header::HOST)
      .and_then(|h| h.to_str().ok())
      .map(str::to_string)
      .or_else(|| self.request.uri().authority().map(|a| a.to_string()))
      .unwrap_or_default()
  }

  /// Full URL of the request target.
  pub fn url(&self) -> String {
    self.request.uri().to_string()
  }

  /// Client address as `ip:port`, empty when unknown.
  pub fn client_addr(&self) -> String {
    self.source.map(|s| s.to_string()).unwrap_or_default()
  }
}

impl fmt::Debug for InterceptedRequest {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("InterceptedRequest")
      .field("source", &self.source)
      .field("destination", &self.destination)
      .field("timestamp", &self.timestamp)
      .field("request", &self.request)
      .finish()
  }
}

/// An upstream response on its way back to the client.
pub struct InterceptedResponse {
  /// Upstream address (host:port)
  pub source: String,
  /// The buffered response
  pub response: http::Response<Body>,
}

impl InterceptedResponse {
  /// Wrap a response received from `source`.
  pub fn new(source: impl Into<String>, response: http::Response<Body>) -> Self {
    Self {
      source: source.into(),
      response,
    }
  }

  /// Get the upstream address
  pub fn source(&self) -> &str {
    &self.source
  }

  /// Get the underlying response
  pub fn response(&self) -> &http::Response<Body> {
    &self.response
  }

  /// Get a mutable reference to the underlying response
  pub fn response_mut(&mut self) -> &mut http::Response<Body> {
    &mut self.response
  }

  /// Consume the wrapper, returning the response.
  pub fn into_response(self) -> http::Response<Body> {
    self.response
  }

  /// The `Content-Length` the upstream declared, if any.
  pub fn declared_length(&self) -> Option<u64> {
    content_length(self.response.headers())
  }
}

impl fmt::Debug for InterceptedResponse {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("InterceptedResponse")
      .field("source", &self.source)
      .field("response", &self.response)
      .finish()
  }
}

pub(crate) fn content_length(headers: &http::HeaderMap) -> Option<u64> {
  headers
    .get(http::header::CONTENT_LENGTH)
    .and_then(|x| x.to_str().ok()?.trim().parse().ok())
}

/// Render a request in HTTP/1.1 wire format.
///
/// The request target is written in origin-form. A `Host` header is added
/// from the URI when the request has none.
pub fn dump_request(request: &http::Request<Body>, with_body: bool) -> Result<Bytes> {
  let mut raw = Vec::new();
  raw.write_all(request.method().as_str().as_bytes())?;
  raw.write_all(SPACE)?;
  let target = match request.uri().path_and_query() {
    Some(pq) if !pq.as_str().is_empty() => pq.as_str(),
    _ => "/",
  };
  raw.write_all(target.as_bytes())?;
  raw.write_all(SPACE)?;
  write!(raw, "{:?}", request.version())?;
  raw.write_all(CR_LF)?;
  if request.headers().get(http::header::HOST).is_none() {
    if let Some(authority) = request.uri().authority() {
      raw.write_all(http::header::HOST.as_str().as_bytes())?;
      raw.write_all(COLON_SPACE)?;
      raw.write_all(authority.as_str().as_bytes())?;
      raw.write_all(CR_LF)?;
    }
  }
  write_headers(&mut raw, request.headers())?;
  raw.write_all(CR_LF)?;
  if with_body {
    raw.write_all(request.body())?;
  }
  Ok(Bytes::from(raw))
}

/// Render the status line and headers of a response in wire format.
pub fn dump_response_head(response: &http::Response<Body>) -> Result<Bytes> {
  let mut raw = Vec::new();
  write!(raw, "{:?}", response.version())?;
  raw.write_all(SPACE)?;
  write!(raw, "{}", response.status())?;
  raw.write_all(CR_LF)?;
  write_headers(&mut raw, response.headers())?;
  raw.write_all(CR_LF)?;
  Ok(Bytes::from(raw))
}

fn write_headers(raw: &mut Vec<u8>, headers: &http::HeaderMap) -> std::io::Result<()> {
  for (k, v) in headers.iter() {
    raw.write_all(k.as_str().as_bytes())?;
    raw.write_all(COLON_SPACE)?;
    raw.write_all(v.as_bytes())?;
    raw.write_all(CR_LF)?;
  }
  Ok(())
}
