//! The capture pipeline run on every proxied exchange.

use crate::auth::{authorize, challenge, Credentials};
use crate::body::Body;
use crate::config::ProxyConfig;
use crate::cookies::request_cookies;
use crate::correlate::{attach, resolve, ExchangeContext};
use crate::docid::DocIdAllocator;
use crate::errors::{Error, Result};
use crate::exchange::{dump_request, dump_response_head, unix_now, InterceptedRequest, InterceptedResponse};
use crate::form::{decode_form, is_form_urlencoded, parse_query};
use crate::hub::BroadcastHub;
use crate::interceptor::{Interceptor, RequestOutcome};
use crate::record::{
  CapturedEvent, RequestRecord, ResponseRecord, REQUEST_DUMP_FAILED, RESPONSE_DUMP_FAILED,
  SKIPPED_BODY,
};
use crate::script::{RequestDescriptor, RewriteEngine};
use crate::store::{CaptureStore, CaptureTables};
use crate::wire::target_of;
use bytes::Bytes;
use http::header::{CONNECTION, HOST};
use http::{HeaderMap, HeaderName, HeaderValue};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Realm sent with the basic-auth challenge.
pub const AUTH_REALM: &str = "tapline auth need";

/// Prefix of the headers meant for the proxy only.
const PRIVATE_HEADER_PREFIX: &str = "proxy-";

/// Authenticates, rewrites, records and broadcasts each exchange.
///
/// Only an authentication failure changes what the client sees. Every other
/// failure is logged and the exchange continues.
pub struct Pipeline {
  config: Arc<ProxyConfig>,
  rewrite: Arc<RewriteEngine>,
  ids: DocIdAllocator,
  tables: CaptureTables,
  hub: BroadcastHub,
}

impl Pipeline {
  /// Build the pipeline, loading the configured rewrite script.
  ///
  /// A configured script that cannot be loaded is an error.
  pub async fn open(config: Arc<ProxyConfig>, store: Arc<dyn CaptureStore>) -> Result<Self> {
    let rewrite = Arc::new(RewriteEngine::from_config(&config)?);
    Self::with_rewrite(config, rewrite, store).await
  }

  /// Build the pipeline around an existing rewrite engine.
  ///
  /// Doc-ids continue after the highest one already in `store`.
  pub async fn with_rewrite(
    config: Arc<ProxyConfig>,
    rewrite: Arc<RewriteEngine>,
    store: Arc<dyn CaptureStore>,
  ) -> Result<Self> {
    let high_water_mark = store.high_water_mark().await?;
    tracing::info!("capture store resumes after doc_id={}", high_water_mark);
    Ok(Self {
      hub: BroadcastHub::new(config.viewer_buffer),
      ids: DocIdAllocator::resume_after(high_water_mark),
      tables: CaptureTables::new(store),
      rewrite,
      config,
    })
  }

  /// Shared configuration
  pub fn config(&self) -> &Arc<ProxyConfig> {
    &self.config
  }

  /// The rewrite engine, for hot reloads
  pub fn rewrite(&self) -> &Arc<RewriteEngine> {
    &self.rewrite
  }

  /// Live viewer hub
  pub fn hub(&self) -> &BroadcastHub {
    &self.hub
  }

  /// Capture tables
  pub fn tables(&self) -> &CaptureTables {
    &self.tables
  }

  /// Last doc-id handed out.
  pub fn last_doc_id(&self) -> u64 {
    self.ids.last_id()
  }

  /// Request record stored under `doc_id`, or an empty record if it cannot
  /// be read.
  pub async fn request_record(&self, doc_id: u64) -> RequestRecord {
    self.tables.read_request(doc_id).await.unwrap_or_else(|e| {
      tracing::warn!("read request by doc_id={} failed: {}", doc_id, e);
      RequestRecord::default()
    })
  }

  /// Response record stored under `doc_id`, or an empty record if it cannot
  /// be read.
  pub async fn response_record(&self, doc_id: u64) -> ResponseRecord {
    self.tables.read_response(doc_id).await.unwrap_or_else(|e| {
      tracing::warn!("read response by doc_id={} failed: {}", doc_id, e);
      ResponseRecord::default()
    })
  }

  fn authenticate(&self, headers: &HeaderMap) -> Result<String> {
    let credentials = Credentials::from_headers(headers);
    authorize(
      self.config.auth_mode,
      &self.config.users,
      credentials.as_ref(),
    )
  }

  /// Request phase. Returns the request to forward, or the challenge to send
  /// back when authentication fails.
  pub async fn handle_request(
    &self,
    ctx: &mut ExchangeContext,
    mut request: InterceptedRequest,
  ) -> RequestOutcome {
    let session = ctx.session();
    let auth = self.authenticate(request.request().headers());
    strip_private_headers(request.request_mut().headers_mut());
    let user = match auth {
      Ok(user) => user,
      Err(e) => {
        tracing::info!(
          "login required session={} client={}: {}",
          session,
          request.client_addr(),
          e
        );
        return RequestOutcome::Respond(challenge(AUTH_REALM));
      }
    };

    self.debug_dump(session, "BEFORE", request.request());
    let host = request.host();
    let url = request.url();
    let path = request.request().uri().path().to_string();
    let form_get = parse_query(request.request().uri().query());
    self.apply_rewrite(session, &mut request);
    self.debug_dump(session, "AFTER", request.request());

    let req = request.request();
    let mut record = RequestRecord {
      host,
      header: req.headers().clone(),
      url,
      path,
      method: req.method().to_string(),
      cookies: request_cookies(req.headers()),
      now: request.timestamp,
      session_id: session,
      user,
      client_ip: request.client_addr(),
      form_get,
      form_post: None,
      dump: Bytes::new(),
      rewrite: BTreeMap::new(),
    };
    if is_form_urlencoded(req.headers()) {
      match decode_form(req.headers(), req.body()) {
        Ok(values) => record.form_post = Some(values),
        Err(e) => tracing::warn!("session={} parse post form failed: {}", session, e),
      }
    }
    record.dump = dump_request(req, true).unwrap_or_else(|e| {
      tracing::warn!("session={} dump request failed: {}", session, e);
      Bytes::from_static(REQUEST_DUMP_FAILED)
    });

    let doc_id = self.ids.next_id();
    let new_url = request.url();
    if new_url != record.url {
      record.rewrite.insert("url".to_string(), new_url);
    }

    match self.tables.insert_request(doc_id, &record).await {
      Ok(()) => {
        tracing::info!(
          "save_req session={} url={} doc_id={} rewrite={:?}",
          session,
          record.url,
          doc_id,
          record.rewrite
        );
        attach(ctx, doc_id);
        self.hub.publish(&CapturedEvent::new(doc_id, &record));
      }
      Err(e) => {
        tracing::error!(
          "save_req session={} url={} doc_id={} failed: {}",
          session,
          record.url,
          doc_id,
          e
        );
      }
    }
    RequestOutcome::Forward(request)
  }

  /// Response phase. Always returns the response, marked for close.
  pub async fn handle_response(
    &self,
    ctx: &mut ExchangeContext,
    mut response: InterceptedResponse,
  ) -> InterceptedResponse {
    response
      .response_mut()
      .headers_mut()
      .insert(CONNECTION, HeaderValue::from_static("close"));
    let doc_id = match resolve(ctx) {
      Ok(doc_id) => doc_id,
      Err(e) => {
        tracing::warn!("{}, response record skipped", e);
        return response;
      }
    };
    let record = self.response_record_for(ctx.session(), &response);
    match self.tables.insert_response(doc_id, &record).await {
      Ok(()) => tracing::info!(
        "save_res session={} doc_id={} status={}",
        ctx.session(),
        doc_id,
        record.status
      ),
      Err(e) => tracing::error!(
        "save_res session={} doc_id={} failed: {}",
        ctx.session(),
        doc_id,
        e
      ),
    }
    response
  }

  fn response_record_for(&self, session: u64, response: &InterceptedResponse) -> ResponseRecord {
    let resp = response.response();
    let declared = response.declared_length();
    let dump = dump_response_head(resp).unwrap_or_else(|e| {
      tracing::warn!("session={} dump response failed: {}", session, e);
      Bytes::from_static(RESPONSE_DUMP_FAILED)
    });
    let length = declared.unwrap_or(0).max(resp.body().len() as u64);
    let body = if length <= self.config.max_response_body {
      resp.body().clone().into_bytes()
    } else {
      Bytes::from_static(SKIPPED_BODY)
    };
    ResponseRecord {
      session_id: session,
      now: unix_now(),
      header: resp.headers().clone(),
      status: resp.status().as_u16(),
      content_length: declared,
      dump,
      body,
    }
  }

  fn apply_rewrite(&self, session: u64, request: &mut InterceptedRequest) {
    let descriptor = RequestDescriptor::from_request(request.request());
    let mutation = match self.rewrite.transform(&descriptor) {
      Ok(mutation) => mutation,
      Err(e) => {
        tracing::warn!("session={} rewrite skipped: {}", session, e);
        return;
      }
    };
    if let Some(url) = mutation.url {
      if let Err(e) = set_url(request, &url) {
        tracing::warn!("session={} rewrite to `{}` ignored: {}", session, url, e);
      }
    }
  }

  fn debug_dump(&self, session: u64, stage: &str, request: &http::Request<Body>) {
    if !self.config.debug {
      return;
    }
    match dump_request(request, false) {
      Ok(raw) => tracing::debug!(
        "session={} req {}:\n{}",
        session,
        stage,
        String::from_utf8_lossy(&raw)
      ),
      Err(e) => tracing::debug!("session={} req {} dump failed: {}", session, stage, e),
    }
  }
}

/// Remove every header in the proxy's private namespace.
fn strip_private_headers(headers: &mut HeaderMap) {
  let private: Vec<HeaderName> = headers
    .keys()
    .filter(|name| name.as_str().starts_with(PRIVATE_HEADER_PREFIX))
    .cloned()
    .collect();
  for name in private {
    headers.remove(&name);
  }
}

/// Point `request` at the absolute `url`, keeping `Host` and the destination
/// in step with it.
fn set_url(request: &mut InterceptedRequest, url: &str) -> Result<()> {
  let uri: http::Uri = url.parse()?;
  if uri.scheme().is_none() {
    return Err(Error::InvalidRequest(format!("`{}` is not an absolute url", url)));
  }
  let authority = uri
    .authority()
    .ok_or_else(|| Error::InvalidRequest(format!("`{}` has no authority", url)))?;
  let host = HeaderValue::from_str(authority.as_str())?;
  if let Some((host, port)) = target_of(&uri, request.request().headers()) {
    request.destination = format!("{}:{}", host, port);
  }
  request.request_mut().headers_mut().insert(HOST, host);
  *request.request_mut().uri_mut() = uri;
  Ok(())
}

#[async_trait::async_trait]
impl Interceptor for Pipeline {
  async fn on_request(&self, ctx: &mut ExchangeContext, request: InterceptedRequest)
    -> RequestOutcome {
    self.handle_request(ctx, request).await
  }

  async fn on_response(
    &self,
    ctx: &mut ExchangeContext,
    response: InterceptedResponse,
  ) -> InterceptedResponse {
    self.handle_response(ctx, response).await
  }

  async fn on_connect(
    &self,
    ctx: &mut ExchangeContext,
    authority: &str,
    headers: &HeaderMap,
  ) -> Option<http::Response<Body>> {
    match self.authenticate(headers) {
      Ok(user) => {
        tracing::info!(
          "tunnel session={} to {} user={}",
          ctx.session(),
          authority,
          user
        );
        None
      }
      Err(e) => {
        tracing::info!("login required session={} tunnel={}: {}", ctx.session(), authority, e);
        Some(challenge(AUTH_REALM))
      }
    }
  }
}
