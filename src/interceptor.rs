//! Hooks the proxy server calls around every forwarded exchange.

use crate::body::Body;
use crate::correlate::ExchangeContext;
use crate::exchange::{InterceptedRequest, InterceptedResponse};

/// What to do with a request after the request hook ran.
#[derive(Debug)]
pub enum RequestOutcome {
  /// Send the (possibly modified) request upstream
  Forward(InterceptedRequest),
  /// Answer the client directly; nothing is sent upstream
  Respond(http::Response<Body>),
}

/// Trait for intercepting proxied exchanges.
///
/// Both hooks of one exchange receive the same [`ExchangeContext`], which is
/// how state flows from the request phase to the response phase.
#[async_trait::async_trait]
pub trait Interceptor: Send + Sync {
  /// Inspect and optionally modify a request before it is forwarded.
  async fn on_request(&self, ctx: &mut ExchangeContext, request: InterceptedRequest)
    -> RequestOutcome;

  /// Inspect and optionally modify a response before it reaches the client.
  async fn on_response(
    &self,
    ctx: &mut ExchangeContext,
    response: InterceptedResponse,
  ) -> InterceptedResponse;

  /// Decide whether a `CONNECT` tunnel to `authority` may be opened.
  ///
  /// Return a response to refuse it.
  async fn on_connect(
    &self,
    _ctx: &mut ExchangeContext,
    _authority: &str,
    _headers: &http::HeaderMap,
  ) -> Option<http::Response<Body>> {
    None
  }
}

/// Forwards everything untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThrough;

#[async_trait::async_trait]
impl Interceptor for PassThrough {
  async fn on_request(
    &self,
    _ctx: &mut ExchangeContext,
    request: InterceptedRequest,
  ) -> RequestOutcome {
    RequestOutcome::Forward(request)
  }

  async fn on_response(
    &self,
    _ctx: &mut ExchangeContext,
    response: InterceptedResponse,
  ) -> InterceptedResponse {
    response
  }
}
