use http::header::COOKIE;
use http::HeaderMap;
use serde::{Deserialize, Serialize};

/// One `name=value` pair sent in a request `Cookie` header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestCookie {
  /// cookie name
  pub name: String,
  /// cookie value
  pub value: String,
}

/// Collect the cookies of every `Cookie` header, in order.
///
/// Note that pairs the `cookie` crate cannot parse are dropped.
pub fn request_cookies(headers: &HeaderMap) -> Vec<RequestCookie> {
  headers
    .get_all(COOKIE)
    .iter()
    .filter_map(|value| value.to_str().ok())
    .flat_map(|value| cookie::Cookie::split_parse(value.to_string()))
    .filter_map(|parsed| match parsed {
      Ok(c) => Some(RequestCookie {
        name: c.name().to_string(),
        value: c.value().to_string(),
      }),
      Err(err) => {
        tracing::debug!("skip malformed cookie: {}", err);
        None
      }
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn cookies_from_all_headers() {
    let mut headers = HeaderMap::new();
    headers.append(COOKIE, "sid=abc; theme=dark".parse().unwrap());
    headers.append(COOKIE, "lang=en".parse().unwrap());
    let names: Vec<_> = request_cookies(&headers)
      .into_iter()
      .map(|c| format!("{}={}", c.name, c.value))
      .collect();
    assert_eq!(names, vec!["sid=abc", "theme=dark", "lang=en"]);
    assert!(request_cookies(&HeaderMap::new()).is_empty());
  }
}
