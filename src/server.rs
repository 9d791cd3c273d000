//! Accepts client connections and routes each request.

use crate::body::Body;
use crate::correlate::ExchangeContext;
use crate::errors::{Error, Result};
use crate::exchange::InterceptedRequest;
use crate::interceptor::{Interceptor, RequestOutcome};
use crate::local::is_local_target;
use crate::management::{LocalHandler, ManagementApi};
use crate::pipeline::Pipeline;
use crate::upstream::{HttpUpstream, Upstream};
use crate::wire::{read_body, read_request_head, request_framing, response_to_raw, target_of, RequestHead};
use http::header::HOST;
use http::{Method, StatusCode};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

struct ServerInner {
  interceptor: Arc<dyn Interceptor>,
  upstream: Arc<dyn Upstream>,
  local: Option<Arc<dyn LocalHandler>>,
  sessions: AtomicU64,
}

/// HTTP/1.1 forward proxy.
///
/// Every connection carries one request. Requests for the proxy's own port
/// on a local address go to the [`LocalHandler`], `CONNECT` requests are
/// tunnelled untouched, and everything else passes through the
/// [`Interceptor`] on its way to the [`Upstream`].
#[derive(Clone)]
pub struct ProxyServer {
  inner: Arc<ServerInner>,
}

/// Builder for [`ProxyServer`].
pub struct ProxyServerBuilder {
  interceptor: Arc<dyn Interceptor>,
  upstream: Option<Arc<dyn Upstream>>,
  local: Option<Arc<dyn LocalHandler>>,
}

impl ProxyServerBuilder {
  /// Send forwarded requests to `upstream` instead of the network.
  pub fn upstream(mut self, upstream: Arc<dyn Upstream>) -> Self {
    self.upstream = Some(upstream);
    self
  }

  /// Answer local requests with `handler`.
  pub fn local_handler(mut self, handler: Arc<dyn LocalHandler>) -> Self {
    self.local = Some(handler);
    self
  }

  /// Build the server.
  pub fn build(self) -> ProxyServer {
    ProxyServer {
      inner: Arc::new(ServerInner {
        interceptor: self.interceptor,
        upstream: self
          .upstream
          .unwrap_or_else(|| Arc::new(HttpUpstream::new()) as Arc<dyn Upstream>),
        local: self.local,
        sessions: AtomicU64::new(0),
      }),
    }
  }
}

impl ProxyServer {
  /// Start building a server around `interceptor`.
  pub fn builder(interceptor: Arc<dyn Interceptor>) -> ProxyServerBuilder {
    ProxyServerBuilder {
      interceptor,
      upstream: None,
      local: None,
    }
  }

  /// Capture proxy over `pipeline`, with its management API and a plain
  /// HTTP upstream.
  pub fn from_pipeline(pipeline: Arc<Pipeline>) -> Self {
    Self::builder(pipeline.clone())
      .local_handler(Arc::new(ManagementApi::new(pipeline)))
      .build()
  }

  /// Bind `addr` and serve until the listener fails.
  pub async fn run<A: ToSocketAddrs>(&self, addr: A) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    self.serve(listener).await
  }

  /// Serve connections from an already bound listener.
  pub async fn serve(&self, listener: TcpListener) -> Result<()> {
    let local_addr = listener.local_addr()?;
    tracing::info!("proxy listening on {}", local_addr);
    loop {
      match listener.accept().await {
        Ok((stream, peer)) => {
          let inner = self.inner.clone();
          tokio::spawn(async move {
            if let Err(e) = inner.handle_connection(stream, peer, local_addr.port()).await {
              tracing::debug!("connection from {} ended with error: {}", peer, e);
            }
          });
        }
        Err(e) => tracing::error!("accept failed: {}", e),
      }
    }
  }
}

impl ServerInner {
  async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr, listen_port: u16) -> Result<()> {
    let mut reader = BufReader::new(stream);
    let head = match read_request_head(&mut reader).await {
      Ok(Some(head)) => head,
      Ok(None) => return Ok(()),
      Err(e) => {
        write_response(reader.get_mut(), &status_response(StatusCode::BAD_REQUEST)).await?;
        return Err(e);
      }
    };
    let session = self.sessions.fetch_add(1, Ordering::Relaxed) + 1;
    if head.method == Method::CONNECT {
      return self.tunnel(session, reader, head).await;
    }

    let request = match read_request(&mut reader, head).await {
      Ok(request) => request,
      Err(e) => {
        tracing::debug!("session={} bad request from {}: {}", session, peer, e);
        write_response(reader.get_mut(), &status_response(StatusCode::BAD_REQUEST)).await?;
        return Err(e);
      }
    };
    let Some((host, port)) = target_of(request.uri(), request.headers()) else {
      write_response(reader.get_mut(), &status_response(StatusCode::BAD_REQUEST)).await?;
      return Err(Error::InvalidRequest(format!("no host in {}", request.uri())));
    };

    let response = if is_local_target(&host, port, listen_port).await {
      match &self.local {
        Some(handler) => handler.handle(request).await,
        None => status_response(StatusCode::NOT_FOUND),
      }
    } else {
      let mut ctx = ExchangeContext::new(session);
      let request = InterceptedRequest::with_source(peer, format!("{}:{}", host, port), request);
      match self.interceptor.on_request(&mut ctx, request).await {
        RequestOutcome::Respond(response) => response,
        RequestOutcome::Forward(request) => match self.upstream.send(request).await {
          Ok(response) => self
            .interceptor
            .on_response(&mut ctx, response)
            .await
            .into_response(),
          Err(e) => {
            tracing::warn!("session={} upstream {}:{} failed: {}", session, host, port, e);
            status_response(StatusCode::BAD_GATEWAY)
          }
        },
      }
    };
    write_response(reader.get_mut(), &response).await
  }

  async fn tunnel(&self, session: u64, mut reader: BufReader<TcpStream>, head: RequestHead) -> Result<()> {
    let authority = head.target;
    let mut ctx = ExchangeContext::new(session);
    if let Some(refusal) = self
      .interceptor
      .on_connect(&mut ctx, &authority, &head.headers)
      .await
    {
      return write_response(reader.get_mut(), &refusal).await;
    }
    let mut upstream = match TcpStream::connect(authority.as_str()).await {
      Ok(stream) => stream,
      Err(e) => {
        tracing::warn!("session={} tunnel to {} failed: {}", session, authority, e);
        write_response(reader.get_mut(), &status_response(StatusCode::BAD_GATEWAY)).await?;
        return Err(e.into());
      }
    };
    reader
      .get_mut()
      .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
      .await?;
    let pending = reader.buffer().to_vec();
    if !pending.is_empty() {
      upstream.write_all(&pending).await?;
    }
    let mut client = reader.into_inner();
    let (up, down) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    tracing::debug!(
      "session={} tunnel {} closed, {} bytes up, {} bytes down",
      session,
      authority,
      up,
      down
    );
    Ok(())
  }
}

async fn read_request(reader: &mut BufReader<TcpStream>, head: RequestHead) -> Result<http::Request<Body>> {
  let body = read_body(reader, request_framing(&head.headers)?).await?;
  let uri: http::Uri = if head.target.starts_with('/') {
    let host = head
      .headers
      .get(HOST)
      .and_then(|h| h.to_str().ok())
      .ok_or_else(|| Error::InvalidRequest("origin-form request without Host".to_string()))?;
    format!("http://{}{}", host, head.target).parse()?
  } else {
    head.target.parse()?
  };
  let mut builder = http::Request::builder()
    .method(head.method)
    .uri(uri)
    .version(head.version);
  if let Some(h) = builder.headers_mut() {
    *h = head.headers;
  }
  Ok(builder.body(Body::from(body))?)
}

fn status_response(status: StatusCode) -> http::Response<Body> {
  let reason = status.canonical_reason().unwrap_or("");
  let mut response = http::Response::new(Body::from(format!("{} {}\n", status.as_u16(), reason)));
  *response.status_mut() = status;
  response
}

async fn write_response(stream: &mut TcpStream, response: &http::Response<Body>) -> Result<()> {
  stream.write_all(&response_to_raw(response)).await?;
  stream.flush().await?;
  if let Err(e) = stream.shutdown().await {
    tracing::debug!("shutdown after response failed: {}", e);
  }
  Ok(())
}
