//! proxy error
use std::io::ErrorKind;
use thiserror::Error as ThisError;
/// A `Result` alias where the `Err` case is `tapline::Error`.
pub type Result<T> = std::result::Result<T, Error>;
/// The Errors that may occur while intercepting an exchange.
///
/// Only [`Error::AuthRequired`] and [`Error::ScriptLoad`] ever change what a
/// client sees. Everything else is logged at the point where it happens and
/// the exchange carries on.
#[derive(ThisError, Debug)]
pub enum Error {
  /// Error
  #[error(transparent)]
  IO(#[from] std::io::Error),
  /// http::Error
  #[error(transparent)]
  Http(http::Error),
  /// serde_json::Error
  #[error(transparent)]
  Json(#[from] serde_json::Error),
  /// The configured auth mode rejected the request.
  #[error("proxy authentication required: {0}")]
  AuthRequired(String),
  /// The rewrite script could not be read, compiled or has no entry function.
  #[error("load rewrite script failed: {0}")]
  ScriptLoad(String),
  /// The rewrite script raised while handling a request.
  #[error("rewrite script failed: {0}")]
  ScriptRuntime(String),
  /// The capture store refused a record.
  #[error("persist doc_id={doc_id} failed: {reason}")]
  Persist {
    /// doc-id of the record that was not written
    doc_id: u64,
    /// store error text
    reason: String,
  },
  /// The response phase found no doc-id on the exchange context.
  #[error("no doc_id attached to session {0}")]
  CorrelationMiss(u64),
  /// Wire dump could not be rendered.
  #[error("dump failed: {0}")]
  Dump(String),
  /// Body, query or cookie decoding failed.
  #[error("parse failed: {0}")]
  Parse(String),
  /// Malformed request from the client side.
  #[error("invalid request: {0}")]
  InvalidRequest(String),
  /// The upstream origin could not be reached or answered garbage.
  #[error("upstream error: {0}")]
  Upstream(String),
  /// Bad configuration.
  #[error("config error: {0}")]
  Config(String),
  /// Unknown Error
  #[error("{0}")]
  Other(String),
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    Error::Http(value)
  }
}

impl From<http::header::InvalidHeaderValue> for Error {
  fn from(value: http::header::InvalidHeaderValue) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::header::InvalidHeaderName> for Error {
  fn from(value: http::header::InvalidHeaderName) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::uri::InvalidUri> for Error {
  fn from(value: http::uri::InvalidUri) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::status::InvalidStatusCode> for Error {
  fn from(value: http::status::InvalidStatusCode) -> Self {
    Error::Http(http::Error::from(value))
  }
}

pub(crate) fn new_io_error(error_kind: ErrorKind, msg: &str) -> Error {
  Error::IO(std::io::Error::new(error_kind, msg))
}
