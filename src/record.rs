use crate::cookies::RequestCookie;
use crate::form::FormValues;
use bytes::Bytes;
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Marker stored instead of a response body larger than the configured cap.
pub const SKIPPED_BODY: &[u8] = b"tapline skip";
/// Placeholder stored when a request could not be dumped.
pub const REQUEST_DUMP_FAILED: &[u8] = b"dump failed";
/// Placeholder stored when a response head could not be dumped.
pub const RESPONSE_DUMP_FAILED: &[u8] = b"dump res failed";

/// Persisted snapshot of an intercepted request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
  /// destination host, as the client named it
  pub host: String,
  /// request headers after rewriting
  #[serde(with = "http_serde::header_map")]
  pub header: HeaderMap,
  /// full URL the client asked for
  pub url: String,
  /// path component of `url`
  pub path: String,
  /// request method
  pub method: String,
  /// cookies sent with the request
  pub cookies: Vec<RequestCookie>,
  /// arrival time, unix seconds
  pub now: i64,
  /// interception session the exchange belongs to
  pub session_id: u64,
  /// authenticated user or `guest`
  pub user: String,
  /// client `ip:port`
  pub client_ip: String,
  /// decoded query parameters
  pub form_get: FormValues,
  /// decoded url-encoded body
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub form_post: Option<FormValues>,
  /// wire dump of the request, headers and body
  #[serde(with = "base64_bytes")]
  pub dump: Bytes,
  /// fields the rewrite script changed, with their new value
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub rewrite: BTreeMap<String, String>,
}

/// Persisted snapshot of the response paired with a [`RequestRecord`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseRecord {
  /// interception session the exchange belongs to
  pub session_id: u64,
  /// finalize time, unix seconds
  pub now: i64,
  /// response headers
  #[serde(with = "http_serde::header_map")]
  pub header: HeaderMap,
  /// status code
  pub status: u16,
  /// `Content-Length` the upstream declared
  pub content_length: Option<u64>,
  /// wire dump of the status line and headers
  #[serde(with = "base64_bytes")]
  pub dump: Bytes,
  /// body, or [`SKIPPED_BODY`]
  #[serde(with = "base64_bytes")]
  pub body: Bytes,
}

impl ResponseRecord {
  /// Whether the body was replaced by the size marker.
  pub fn body_skipped(&self) -> bool {
    self.body.as_ref() == SKIPPED_BODY
  }
}

/// What live viewers are sent for each captured request.
#[derive(Debug, Clone, Serialize)]
pub struct CapturedEvent {
  /// interception session
  pub session_id: u64,
  /// doc-id of the persisted request record
  pub doc_id: u64,
  /// authenticated user
  pub user: String,
  /// client `ip:port`
  pub client_ip: String,
  /// request method
  pub method: String,
  /// destination host
  pub host: String,
  /// request URL
  pub url: String,
  /// request path
  pub path: String,
  /// request headers
  #[serde(with = "http_serde::header_map")]
  pub header: HeaderMap,
  /// request cookies
  pub cookies: Vec<RequestCookie>,
  /// arrival time
  pub now: i64,
  /// base64 wire dump
  #[serde(with = "base64_bytes")]
  pub dump: Bytes,
  /// rewrite diff
  #[serde(skip_serializing_if = "BTreeMap::is_empty")]
  pub rewrite: BTreeMap<String, String>,
}

impl CapturedEvent {
  /// Build the event for a record stored under `doc_id`.
  pub fn new(doc_id: u64, record: &RequestRecord) -> Self {
    CapturedEvent {
      session_id: record.session_id,
      doc_id,
      user: record.user.clone(),
      client_ip: record.client_ip.clone(),
      method: record.method.clone(),
      host: record.host.clone(),
      url: record.url.clone(),
      path: record.path.clone(),
      header: record.header.clone(),
      cookies: record.cookies.clone(),
      now: record.now,
      dump: record.dump.clone(),
      rewrite: record.rewrite.clone(),
    }
  }
}

pub(crate) mod base64_bytes {
  use base64::engine::general_purpose::STANDARD;
  use base64::Engine;
  use bytes::Bytes;
  use serde::{Deserialize, Deserializer, Serializer};

  pub fn serialize<S: Serializer>(v: &Bytes, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&STANDARD.encode(v))
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Bytes, D::Error> {
    let encoded = String::deserialize(d)?;
    STANDARD
      .decode(encoded)
      .map(Bytes::from)
      .map_err(serde::de::Error::custom)
  }
}
