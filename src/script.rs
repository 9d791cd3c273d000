//! Script driven request rewriting.
//!
//! A rewrite script is a [rhai](https://rhai.rs) program defining
//!
//! ```text
//! fn rewrite(req) {
//!   if req.host == "old.example.com" {
//!     let url = req.url;
//!     url.replace("old.example.com", "new.example.com");
//!     return #{ url: url };
//!   }
//! }
//! ```
//!
//! `req` carries `method`, `url`, `host`, `path` and `headers`. Returning `()`
//! leaves the request untouched; returning a map overrides the fields it
//! names. Only `url` is understood today.

use crate::body::Body;
use crate::config::ProxyConfig;
use crate::errors::{Error, Result};
use parking_lot::Mutex;
use rhai::{Dynamic, Engine, Map, Scope, AST};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Name of the function every script must define.
pub const ENTRY_FN: &str = "rewrite";

/// Read-only view of a request handed to the script.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestDescriptor {
  /// request method
  pub method: String,
  /// full URL
  pub url: String,
  /// destination host
  pub host: String,
  /// URL path
  pub path: String,
  /// header name -> comma joined values
  pub headers: BTreeMap<String, String>,
}

impl RequestDescriptor {
  /// Snapshot a request.
  pub fn from_request(request: &http::Request<Body>) -> Self {
    let mut headers: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in request.headers() {
      let value = String::from_utf8_lossy(value.as_bytes());
      headers
        .entry(name.as_str().to_string())
        .and_modify(|joined| {
          joined.push_str(", ");
          joined.push_str(&value);
        })
        .or_insert_with(|| value.into_owned());
    }
    let host = request
      .uri()
      .host()
      .map(str::to_string)
      .or_else(|| headers.get(http::header::HOST.as_str()).cloned())
      .unwrap_or_default();
    Self {
      method: request.method().to_string(),
      url: request.uri().to_string(),
      host,
      path: request.uri().path().to_string(),
      headers,
    }
  }

  fn to_script_value(&self) -> Map {
    let headers: Map = self
      .headers
      .iter()
      .map(|(k, v)| (k.as_str().into(), Dynamic::from(v.clone())))
      .collect();
    let mut req = Map::new();
    req.insert("method".into(), Dynamic::from(self.method.clone()));
    req.insert("url".into(), Dynamic::from(self.url.clone()));
    req.insert("host".into(), Dynamic::from(self.host.clone()));
    req.insert("path".into(), Dynamic::from(self.path.clone()));
    req.insert("headers".into(), Dynamic::from(headers));
    req
  }
}

/// Overrides returned by the script.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mutation {
  /// replacement absolute URL
  pub url: Option<String>,
}

impl Mutation {
  /// Whether the script asked for no change.
  pub fn is_empty(&self) -> bool {
    self.url.is_none()
  }
}

struct Sandbox {
  engine: Engine,
  script: Option<AST>,
}

/// Owns the single script sandbox.
///
/// Every invocation and every reload takes the same lock, so script runs are
/// fully serialized and a reload is seen whole by the next request.
pub struct RewriteEngine {
  sandbox: Mutex<Sandbox>,
  path: Option<PathBuf>,
  max_operations: u64,
}

fn new_engine(max_operations: u64) -> Engine {
  let mut engine = Engine::new();
  engine.set_max_operations(max_operations);
  engine.on_print(|s| tracing::info!("[rewrite] {}", s));
  engine.on_debug(|s, _source, pos| tracing::debug!("[rewrite] {} {}", pos, s));
  engine
}

fn compile(source: &str, max_operations: u64) -> Result<AST> {
  let ast = new_engine(max_operations)
    .compile(source)
    .map_err(|e| Error::ScriptLoad(e.to_string()))?;
  let has_entry = ast
    .iter_functions()
    .any(|f| f.name == ENTRY_FN && f.params.len() == 1);
  if !has_entry {
    return Err(Error::ScriptLoad(format!(
      "script does not define `fn {}(req)`",
      ENTRY_FN
    )));
  }
  Ok(ast)
}

fn read_source(path: &Path) -> Result<String> {
  std::fs::read_to_string(path)
    .map_err(|e| Error::ScriptLoad(format!("read {}: {}", path.display(), e)))
}

impl RewriteEngine {
  /// Engine with no script; [`RewriteEngine::transform`] is a no-op.
  pub fn disabled(max_operations: u64) -> Self {
    Self {
      sandbox: Mutex::new(Sandbox {
        engine: new_engine(max_operations),
        script: None,
      }),
      path: None,
      max_operations,
    }
  }

  /// Compile `source` directly. There is no path to reload from.
  pub fn from_source(source: &str, max_operations: u64) -> Result<Self> {
    let engine = Self::disabled(max_operations);
    engine.replace_source(source)?;
    Ok(engine)
  }

  /// Load the script file at `path`.
  pub fn from_path(path: impl Into<PathBuf>, max_operations: u64) -> Result<Self> {
    let path = path.into();
    let ast = compile(&read_source(&path)?, max_operations)?;
    tracing::info!("loaded rewrite script {}", path.display());
    Ok(Self {
      sandbox: Mutex::new(Sandbox {
        engine: new_engine(max_operations),
        script: Some(ast),
      }),
      path: Some(path),
      max_operations,
    })
  }

  /// Build from the proxy config. A configured script that cannot be loaded
  /// is an error the caller should treat as fatal.
  pub fn from_config(config: &ProxyConfig) -> Result<Self> {
    match &config.rewrite_script {
      Some(path) => Self::from_path(path, config.script_max_operations),
      None => Ok(Self::disabled(config.script_max_operations)),
    }
  }

  /// Path the script was loaded from.
  pub fn path(&self) -> Option<&Path> {
    self.path.as_deref()
  }

  /// Whether a script is installed.
  pub fn is_enabled(&self) -> bool {
    self.sandbox.lock().script.is_some()
  }

  /// Compile `source` and swap it in.
  ///
  /// On error the current script stays active.
  pub fn replace_source(&self, source: &str) -> Result<()> {
    let ast = compile(source, self.max_operations)?;
    self.sandbox.lock().script = Some(ast);
    Ok(())
  }

  /// Re-read the script file and swap it in.
  pub fn reload(&self) -> Result<()> {
    let path = self
      .path
      .as_deref()
      .ok_or_else(|| Error::ScriptLoad("no rewrite script configured".to_string()))?;
    self.replace_source(&read_source(path)?)?;
    tracing::info!("reloaded rewrite script {}", path.display());
    Ok(())
  }

  /// Run the script against `request`.
  pub fn transform(&self, request: &RequestDescriptor) -> Result<Mutation> {
    let sandbox = self.sandbox.lock();
    let Some(ast) = sandbox.script.as_ref() else {
      return Ok(Mutation::default());
    };
    let out: Dynamic = sandbox
      .engine
      .call_fn(
        &mut Scope::new(),
        ast,
        ENTRY_FN,
        (request.to_script_value(),),
      )
      .map_err(|e| Error::ScriptRuntime(e.to_string()))?;
    drop(sandbox);
    if out.is_unit() {
      return Ok(Mutation::default());
    }
    let type_name = out.type_name();
    let overrides = out.try_cast::<Map>().ok_or_else(|| {
      Error::ScriptRuntime(format!("{} returned {}, expected a map", ENTRY_FN, type_name))
    })?;
    let url = match overrides.get("url") {
      None => None,
      Some(v) if v.is_unit() => None,
      Some(v) => Some(v.clone().into_string().map_err(|t| {
        Error::ScriptRuntime(format!("`url` must be a string, got {}", t))
      })?),
    };
    Ok(Mutation { url })
  }
}
