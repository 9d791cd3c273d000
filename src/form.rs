//! url-encoded form and query decoding

use crate::errors::{Error, Result};
use encoding_rs::{Encoding, UTF_8};
use flate2::read::MultiGzDecoder;
use http::header::{CONTENT_ENCODING, CONTENT_TYPE};
use http::HeaderMap;
use mime::Mime;
use percent_encoding::percent_decode;
use std::collections::BTreeMap;
use std::io::Read;

/// Decoded key/value pairs; repeated keys keep every value in order.
pub type FormValues = BTreeMap<String, Vec<String>>;

/// Whether the request body is an url-encoded form.
pub fn is_form_urlencoded(headers: &HeaderMap) -> bool {
  headers
    .get(CONTENT_TYPE)
    .and_then(|v| v.to_str().ok())
    .map(|v| v.contains("x-www-form-urlencoded"))
    .unwrap_or(false)
}

/// Decode a form body, inflating it first when `Content-Encoding: gzip`.
///
/// The charset comes from the `Content-Type` parameter, UTF-8 by default.
pub fn decode_form(headers: &HeaderMap, body: &[u8]) -> Result<FormValues> {
  let gzipped = headers
    .get(CONTENT_ENCODING)
    .and_then(|v| v.to_str().ok())
    .map(|v| v.eq_ignore_ascii_case("gzip") || v.eq_ignore_ascii_case("x-gzip"))
    .unwrap_or(false);
  let inflated;
  let raw = if gzipped {
    let mut out = Vec::new();
    MultiGzDecoder::new(body)
      .read_to_end(&mut out)
      .map_err(|e| Error::Parse(format!("unzip body failed: {}", e)))?;
    inflated = out;
    &inflated[..]
  } else {
    body
  };
  parse_pairs(raw, charset(headers))
}

/// Decode a query string, skipping pairs that fail to decode.
pub fn parse_query(query: Option<&str>) -> FormValues {
  let mut values = FormValues::new();
  for pair in query.unwrap_or_default().split('&').filter(|p| !p.is_empty()) {
    match decode_pair(pair.as_bytes(), UTF_8) {
      Ok((k, v)) => values.entry(k).or_default().push(v),
      Err(e) => tracing::debug!("skip query pair {:?}: {}", pair, e),
    }
  }
  values
}

fn charset(headers: &HeaderMap) -> &'static Encoding {
  headers
    .get(CONTENT_TYPE)
    .and_then(|v| v.to_str().ok())
    .and_then(|v| v.parse::<Mime>().ok())
    .and_then(|m| {
      m.get_param(mime::CHARSET)
        .and_then(|c| Encoding::for_label(c.as_str().as_bytes()))
    })
    .unwrap_or(UTF_8)
}

fn parse_pairs(raw: &[u8], encoding: &'static Encoding) -> Result<FormValues> {
  let mut values = FormValues::new();
  for pair in raw.split(|b| *b == b'&').filter(|p| !p.is_empty()) {
    let (k, v) = decode_pair(pair, encoding)?;
    values.entry(k).or_default().push(v);
  }
  Ok(values)
}

fn decode_pair(pair: &[u8], encoding: &'static Encoding) -> Result<(String, String)> {
  let mut parts = pair.splitn(2, |b| *b == b'=');
  let k = parts.next().unwrap_or_default();
  let v = parts.next().unwrap_or_default();
  Ok((decode_component(k, encoding)?, decode_component(v, encoding)?))
}

fn decode_component(raw: &[u8], encoding: &'static Encoding) -> Result<String> {
  let hex_at = |i: usize| raw.get(i).is_some_and(|b| b.is_ascii_hexdigit());
  for (i, b) in raw.iter().enumerate() {
    if *b == b'%' && !(hex_at(i + 1) && hex_at(i + 2)) {
      return Err(Error::Parse(format!(
        "invalid escape in {:?}",
        String::from_utf8_lossy(raw)
      )));
    }
  }
  let plus_as_space: Vec<u8> = raw
    .iter()
    .map(|b| if *b == b'+' { b' ' } else { *b })
    .collect();
  let decoded = percent_decode(&plus_as_space).collect::<Vec<u8>>();
  encoding
    .decode_without_bom_handling_and_without_replacement(&decoded)
    .map(|s| s.into_owned())
    .ok_or_else(|| {
      Error::Parse(format!(
        "{:?} is not valid {}",
        String::from_utf8_lossy(raw),
        encoding.name()
      ))
    })
}
