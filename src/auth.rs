//! Proxy authentication

use crate::body::Body;
use crate::config::AuthMode;
use crate::errors::{Error, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use http::header::{AUTHORIZATION, PROXY_AUTHORIZATION, WWW_AUTHENTICATE};
use http::{HeaderMap, StatusCode};
use std::collections::HashMap;

/// Username recorded for requests that carry no credentials.
pub const GUEST: &str = "guest";

/// Basic credentials presented by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
  /// user name
  pub username: String,
  /// password
  pub password: String,
}

impl Credentials {
  /// Parse `Proxy-Authorization`, falling back to `Authorization`.
  ///
  /// Only the `Basic` scheme is understood.
  pub fn from_headers(headers: &HeaderMap) -> Option<Credentials> {
    [PROXY_AUTHORIZATION, AUTHORIZATION]
      .iter()
      .filter_map(|name| headers.get(name))
      .find_map(|value| Credentials::parse_basic(value.to_str().ok()?))
  }

  fn parse_basic(value: &str) -> Option<Credentials> {
    let (scheme, token) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
      return None;
    }
    let decoded = STANDARD.decode(token.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some(Credentials {
      username: username.to_string(),
      password: password.to_string(),
    })
  }
}

/// Apply the auth policy to already extracted credentials.
///
/// Returns the username to record for the exchange, or
/// [`Error::AuthRequired`] when the request must not be forwarded.
pub fn authorize(
  mode: AuthMode,
  users: &HashMap<String, String>,
  credentials: Option<&Credentials>,
) -> Result<String> {
  match (mode, credentials) {
    (AuthMode::RequireAnyCredentials | AuthMode::RequireKnownUser, None) => {
      Err(Error::AuthRequired("no credentials".to_string()))
    }
    (AuthMode::RequireKnownUser, Some(c)) => match users.get(&c.username) {
      Some(password) if *password == c.password => Ok(c.username.clone()),
      _ => Err(Error::AuthRequired(format!("unknown user `{}`", c.username))),
    },
    (_, Some(c)) => Ok(c.username.clone()),
    (AuthMode::Open, None) => Ok(GUEST.to_string()),
  }
}

/// `401` basic-auth challenge sent instead of forwarding.
pub fn challenge(realm: &str) -> http::Response<Body> {
  let mut response = http::Response::new(Body::from("authentication required\n"));
  *response.status_mut() = StatusCode::UNAUTHORIZED;
  if let Ok(value) = format!("Basic realm=\"{}\"", realm).parse() {
    response.headers_mut().insert(WWW_AUTHENTICATE, value);
  }
  response
}
