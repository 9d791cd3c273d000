//! Carries a doc-id from the request phase to the response phase.

use crate::errors::{Error, Result};

/// Typed slot value stored on an [`ExchangeContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocId(pub u64);

/// Per-exchange state created by the transport for one request/response pair.
///
/// Nothing in here is shared with other exchanges.
#[derive(Debug, Default)]
pub struct ExchangeContext {
  session: u64,
  user_data: http::Extensions,
}

impl ExchangeContext {
  /// Context for interception session `session`.
  pub fn new(session: u64) -> Self {
    Self {
      session,
      user_data: http::Extensions::new(),
    }
  }

  /// Interception session id.
  pub fn session(&self) -> u64 {
    self.session
  }

  /// Arbitrary typed values attached to the exchange.
  pub fn user_data(&self) -> &http::Extensions {
    &self.user_data
  }

  /// Mutable access to the attached values.
  pub fn user_data_mut(&mut self) -> &mut http::Extensions {
    &mut self.user_data
  }
}

/// Attach `doc_id` to the exchange, replacing any earlier one.
pub fn attach(ctx: &mut ExchangeContext, doc_id: u64) {
  if let Some(DocId(previous)) = ctx.user_data.insert(DocId(doc_id)) {
    tracing::warn!(
      "session {} already carried doc_id={}, replaced by {}",
      ctx.session,
      previous,
      doc_id
    );
  }
}

/// Take the doc-id attached to the exchange.
///
/// The slot is emptied so a reused context cannot hand the same id to a
/// second response.
pub fn resolve(ctx: &mut ExchangeContext) -> Result<u64> {
  ctx
    .user_data
    .remove::<DocId>()
    .map(|DocId(id)| id)
    .ok_or(Error::CorrelationMiss(ctx.session))
}
