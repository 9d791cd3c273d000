//! Requests addressed to the proxy itself.

use crate::body::Body;
use crate::pipeline::Pipeline;
use http::header::CONTENT_TYPE;
use http::{HeaderValue, Method, StatusCode};
use serde::Serialize;
use std::sync::Arc;

/// Answers requests the front door decided are for the proxy itself.
#[async_trait::async_trait]
pub trait LocalHandler: Send + Sync {
  /// Produce the response for a local request.
  async fn handle(&self, request: http::Request<Body>) -> http::Response<Body>;
}

/// JSON lookups into the capture store plus script reload.
///
/// | route | result |
/// |-------|--------|
/// | `GET /api/request/{doc_id}` | request record |
/// | `GET /api/response/{doc_id}` | response record |
/// | `POST /api/script/reload` | reloads the rewrite script |
pub struct ManagementApi {
  pipeline: Arc<Pipeline>,
}

impl ManagementApi {
  /// API over `pipeline`.
  pub fn new(pipeline: Arc<Pipeline>) -> Self {
    Self { pipeline }
  }
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> http::Response<Body> {
  match serde_json::to_vec(value) {
    Ok(raw) => {
      let mut response = http::Response::new(Body::from(raw));
      *response.status_mut() = status;
      response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
      response
    }
    Err(e) => {
      tracing::error!("encode management response failed: {}", e);
      error_response(StatusCode::INTERNAL_SERVER_ERROR, "encode failed")
    }
  }
}

fn error_response(status: StatusCode, message: &str) -> http::Response<Body> {
  json_response(status, &serde_json::json!({ "error": message }))
}

fn parse_doc_id(raw: &str) -> Option<u64> {
  raw.parse().ok()
}

#[async_trait::async_trait]
impl LocalHandler for ManagementApi {
  async fn handle(&self, request: http::Request<Body>) -> http::Response<Body> {
    let path = request.uri().path().trim_matches('/').to_string();
    let segments: Vec<&str> = path.split('/').collect();
    tracing::debug!("management {} /{}", request.method(), path);
    match (request.method(), segments.as_slice()) {
      (&Method::GET, ["api", "request", id]) => match parse_doc_id(id) {
        Some(doc_id) => json_response(StatusCode::OK, &self.pipeline.request_record(doc_id).await),
        None => error_response(StatusCode::BAD_REQUEST, "doc_id must be an unsigned integer"),
      },
      (&Method::GET, ["api", "response", id]) => match parse_doc_id(id) {
        Some(doc_id) => json_response(StatusCode::OK, &self.pipeline.response_record(doc_id).await),
        None => error_response(StatusCode::BAD_REQUEST, "doc_id must be an unsigned integer"),
      },
      (&Method::POST, ["api", "script", "reload"]) => match self.pipeline.rewrite().reload() {
        Ok(()) => json_response(StatusCode::OK, &serde_json::json!({ "reloaded": true })),
        Err(e) => {
          tracing::warn!("script reload failed: {}", e);
          error_response(StatusCode::UNPROCESSABLE_ENTITY, &e.to_string())
        }
      },
      _ => error_response(StatusCode::NOT_FOUND, "not found"),
    }
  }
}
