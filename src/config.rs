//! Proxy configuration

use crate::errors::{Error, Result};
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Default cap on persisted response bodies: 2 MiB.
pub const DEFAULT_MAX_RESPONSE_BODY: u64 = 2 * 1024 * 1024;

/// Who may use the proxy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AuthMode {
  /// Anyone; unauthenticated users are logged as `guest`.
  #[default]
  Open,
  /// Credentials must match an entry of the credential set.
  RequireKnownUser,
  /// Any credentials at all must be presented.
  RequireAnyCredentials,
}

impl AuthMode {
  fn from_name(name: &str) -> Option<Self> {
    match name {
      "open" | "0" => Some(AuthMode::Open),
      "require-known-user" | "1" => Some(AuthMode::RequireKnownUser),
      "require-any-credentials" | "2" => Some(AuthMode::RequireAnyCredentials),
      _ => None,
    }
  }
}

impl<'de> Deserialize<'de> for AuthMode {
  fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
  where
    D: Deserializer<'de>,
  {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
      Name(String),
      Number(u8),
    }
    let name = match Repr::deserialize(deserializer)? {
      Repr::Name(name) => name,
      Repr::Number(n) => n.to_string(),
    };
    AuthMode::from_name(&name)
      .ok_or_else(|| serde::de::Error::custom(format!("unknown auth mode `{}`", name)))
  }
}

/// Configuration for the intercepting proxy.
///
/// Built once at startup and shared read-only between exchanges.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyConfig {
  /// Port the proxy listens on; requests to it on a local address go to the
  /// management handler.
  pub port: u16,
  /// Authentication policy
  pub auth_mode: AuthMode,
  /// username -> password
  pub users: HashMap<String, String>,
  /// Responses declaring more bytes than this are stored as a marker.
  pub max_response_body: u64,
  /// Optional rewrite script
  pub rewrite_script: Option<PathBuf>,
  /// Where the file capture store keeps its tables
  pub data_dir: PathBuf,
  /// Events buffered per live viewer before new ones are dropped
  pub viewer_buffer: usize,
  /// Operation budget for a single script invocation
  pub script_max_operations: u64,
  /// Log request dumps before and after rewriting
  pub debug: bool,
}

impl Default for ProxyConfig {
  fn default() -> Self {
    Self {
      port: 8080,
      auth_mode: AuthMode::Open,
      users: HashMap::new(),
      max_response_body: DEFAULT_MAX_RESPONSE_BODY,
      rewrite_script: None,
      data_dir: PathBuf::from(".tapline"),
      viewer_buffer: 256,
      script_max_operations: 1_000_000,
      debug: false,
    }
  }
}

impl ProxyConfig {
  /// Load a config from a JSON file; missing fields keep their defaults.
  pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();
    let raw = std::fs::read(path)
      .map_err(|e| Error::Config(format!("read {}: {}", path.display(), e)))?;
    let config: ProxyConfig = serde_json::from_slice(&raw)
      .map_err(|e| Error::Config(format!("parse {}: {}", path.display(), e)))?;
    config.validate()?;
    Ok(config)
  }

  /// Reject combinations no request could ever satisfy.
  pub fn validate(&self) -> Result<()> {
    if self.viewer_buffer == 0 {
      return Err(Error::Config("viewer_buffer must be at least 1".to_string()));
    }
    if self.auth_mode == AuthMode::RequireKnownUser && self.users.is_empty() {
      tracing::warn!("auth mode require-known-user with no users: every request will be challenged");
    }
    Ok(())
  }
}
