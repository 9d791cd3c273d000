//! Sends forwarded requests to the origin server.

use crate::body::Body;
use crate::errors::{Error, Result};
use crate::exchange::{dump_request, InterceptedRequest, InterceptedResponse};
use crate::wire::{read_body, read_response_head, response_framing, target_of};
use http::header::{CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderValue, Method, StatusCode, Version};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

/// Default limit for one upstream round trip.
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Where forwarded requests go.
#[async_trait::async_trait]
pub trait Upstream: Send + Sync {
  /// Forward `request` and return the buffered response.
  async fn send(&self, request: InterceptedRequest) -> Result<InterceptedResponse>;
}

/// Plain HTTP/1.1 over a fresh TCP connection per request.
#[derive(Debug, Clone)]
pub struct HttpUpstream {
  timeout: Duration,
}

impl Default for HttpUpstream {
  fn default() -> Self {
    Self {
      timeout: DEFAULT_UPSTREAM_TIMEOUT,
    }
  }
}

impl HttpUpstream {
  /// Upstream with the default timeout.
  pub fn new() -> Self {
    Self::default()
  }

  /// Limit connect, send and receive together to `timeout`.
  pub fn timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  async fn round_trip(&self, addr: &str, request: http::Request<Body>) -> Result<http::Response<Body>> {
    let method = request.method().clone();
    let raw = encode_request(request)?;
    let mut stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    stream.write_all(&raw).await?;
    stream.flush().await?;
    let mut reader = BufReader::new(stream);
    let (version, status, headers) = loop {
      let head = read_response_head(&mut reader).await?;
      // interim responses are not relayed
      if head.1.is_informational() && head.1 != StatusCode::SWITCHING_PROTOCOLS {
        continue;
      }
      break head;
    };
    let body = read_body(&mut reader, response_framing(&method, status, &headers)).await?;
    let mut builder = http::Response::builder().version(version).status(status);
    if let Some(h) = builder.headers_mut() {
      *h = headers;
    }
    Ok(builder.body(Body::from(body))?)
  }
}

/// Origin-form wire bytes for `request`, framed with `Content-Length` and
/// `Connection: close`.
fn encode_request(mut request: http::Request<Body>) -> Result<bytes::Bytes> {
  *request.version_mut() = Version::HTTP_11;
  let len = request.body().len();
  let expects_body = matches!(
    *request.method(),
    Method::POST | Method::PUT | Method::PATCH
  );
  let headers = request.headers_mut();
  headers.remove(TRANSFER_ENCODING);
  headers.remove("keep-alive");
  headers.insert(CONNECTION, HeaderValue::from_static("close"));
  if len > 0 || expects_body {
    headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
  } else {
    headers.remove(CONTENT_LENGTH);
  }
  dump_request(&request, true)
}

#[async_trait::async_trait]
impl Upstream for HttpUpstream {
  async fn send(&self, request: InterceptedRequest) -> Result<InterceptedResponse> {
    let request = request.into_request();
    if request.uri().scheme() == Some(&http::uri::Scheme::HTTPS) {
      return Err(Error::Upstream(format!(
        "{} needs TLS, only CONNECT tunnels reach https origins",
        request.uri()
      )));
    }
    let (host, port) = target_of(request.uri(), request.headers())
      .ok_or_else(|| Error::Upstream(format!("no host to forward {} to", request.uri())))?;
    let addr = format!("{}:{}", host, port);
    let response = tokio::time::timeout(self.timeout, self.round_trip(&addr, request))
      .await
      .map_err(|_| Error::Upstream(format!("{} timed out after {:?}", addr, self.timeout)))??;
    Ok(InterceptedResponse::new(addr, response))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn request_is_reframed() {
    let request = http::Request::builder()
      .method("POST")
      .uri("http://example.com/submit")
      .header("transfer-encoding", "chunked")
      .header("connection", "keep-alive")
      .body(Body::from("a=1"))
      .unwrap();
    let raw = encode_request(request).unwrap();
    assert_eq!(
      &raw[..],
      b"POST /submit HTTP/1.1\r\nhost: example.com\r\nconnection: close\r\ncontent-length: 3\r\n\r\na=1"
    );
  }

  #[tokio::test]
  async fn https_targets_are_refused() {
    let request = http::Request::builder()
      .uri("https://example.com/")
      .body(Body::empty())
      .unwrap();
    let result = HttpUpstream::new()
      .send(InterceptedRequest::new("example.com:443", request))
      .await;
    assert!(matches!(result, Err(Error::Upstream(_))));
  }
}
