use std::fmt;
use std::ops::Deref;

use bytes::Bytes;

/// A fully buffered message body.
///
/// Cloning is cheap, so the pipeline can read the bytes for capture and still
/// hand the same body on to the upstream or the client.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Body {
  inner: Bytes,
}

impl Body {
  /// An empty body.
  pub fn empty() -> Self {
    Self::default()
  }
  /// Consume the body, returning the underlying bytes.
  pub fn into_bytes(self) -> Bytes {
    self.inner
  }
}

impl Deref for Body {
  type Target = Bytes;

  fn deref(&self) -> &Self::Target {
    &self.inner
  }
}

impl AsRef<[u8]> for Body {
  fn as_ref(&self) -> &[u8] {
    &self.inner
  }
}

impl From<Bytes> for Body {
  #[inline]
  fn from(b: Bytes) -> Body {
    Body { inner: b }
  }
}

impl From<String> for Body {
  #[inline]
  fn from(s: String) -> Body {
    s.into_bytes().into()
  }
}

impl From<&'static str> for Body {
  #[inline]
  fn from(s: &'static str) -> Body {
    s.as_bytes().into()
  }
}

impl From<&'static [u8]> for Body {
  #[inline]
  fn from(s: &'static [u8]) -> Body {
    Body {
      inner: Bytes::from_static(s),
    }
  }
}

impl From<Vec<u8>> for Body {
  #[inline]
  fn from(v: Vec<u8>) -> Body {
    Body { inner: v.into() }
  }
}

impl fmt::Debug for Body {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match std::str::from_utf8(&self.inner) {
      Ok(s) => fmt::Debug::fmt(s, f),
      Err(_err) => fmt::Debug::fmt(&self.inner, f),
    }
  }
}
