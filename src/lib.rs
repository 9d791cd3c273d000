#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # tapline
//!
//! The `tapline` crate is an intercepting HTTP proxy. Every request that
//! passes through it is captured to a durable store together with its
//! response, optionally rewritten by a user script, and pushed live to
//! connected viewers.
//!
//! - Basic [authentication](#authentication) with three policies
//! - Script driven request [rewriting](#rewriting)
//! - Durable request/response capture keyed by doc-id
//! - Live fan-out with per-viewer filters and redaction
//!
//! ## Running a capture proxy
//!
//! ```no_run
//! use std::sync::Arc;
//! use tapline::{FileStore, Pipeline, ProxyConfig, ProxyServer};
//!
//! # async fn run() -> tapline::Result<()> {
//! let config = Arc::new(ProxyConfig::default());
//! let store = Arc::new(FileStore::open(&config.data_dir).await?);
//! let pipeline = Arc::new(Pipeline::open(config.clone(), store).await?);
//! ProxyServer::from_pipeline(pipeline)
//!   .run(("0.0.0.0", config.port))
//!   .await
//! # }
//! ```
//!
//! Requests for the proxy's own port on a local address are not proxied.
//! They go to the [`ManagementApi`], which serves stored records as JSON.
//!
//! ## Authentication
//!
//! [`AuthMode::Open`] lets everyone through and records anonymous users as
//! `guest`. [`AuthMode::RequireKnownUser`] and
//! [`AuthMode::RequireAnyCredentials`] answer `401` with a basic-auth
//! challenge instead of forwarding.
//!
//! ## Rewriting
//!
//! A [rhai](https://rhai.rs) script defining `fn rewrite(req)` may return a
//! new URL for a request. See [`script`] for the contract.
//!
//! ## Watching live traffic
//!
//! ```no_run
//! # async fn run(pipeline: &tapline::Pipeline) {
//! use tapline::hub::ViewerSubscription;
//!
//! let mut viewer = pipeline
//!   .hub()
//!   .subscribe(ViewerSubscription::new("ops").hide("dump").url_pattern("/api/"));
//! while let Some(event) = viewer.recv().await {
//!   println!("{}", event);
//! }
//! # }
//! ```
//!
/// Proxy authentication
pub mod auth;
mod body;
/// Proxy configuration
pub mod config;
mod cookies;
/// Request/response correlation
pub mod correlate;
mod docid;
mod errors;
mod exchange;
/// Form and query decoding
pub mod form;
/// Live viewers
pub mod hub;
mod interceptor;
mod local;
mod management;
mod pipeline;
/// Capture records
pub mod record;
/// Request rewriting
pub mod script;
mod server;
/// Capture stores
pub mod store;
mod upstream;
mod wire;

pub use body::Body;
pub use config::{AuthMode, ProxyConfig};
pub use cookies::{request_cookies, RequestCookie};
pub use docid::DocIdAllocator;
pub use errors::{Error, Result};
pub use exchange::{dump_request, dump_response_head, InterceptedRequest, InterceptedResponse};
pub use http::StatusCode;
pub use interceptor::{Interceptor, PassThrough, RequestOutcome};
pub use local::{is_local_ip, is_local_target};
pub use management::{LocalHandler, ManagementApi};
pub use pipeline::{Pipeline, AUTH_REALM};
pub use record::{CapturedEvent, RequestRecord, ResponseRecord};
pub use script::RewriteEngine;
pub use server::{ProxyServer, ProxyServerBuilder};
pub use store::{CaptureStore, CaptureTables, FileStore, MemoryStore, Table};
pub use upstream::{HttpUpstream, Upstream, DEFAULT_UPSTREAM_TIMEOUT};

pub(crate) const CR_LF: &[u8] = &[13, 10];
pub(crate) const SPACE: &[u8] = &[32];
pub(crate) const COLON_SPACE: &[u8] = &[58, 32];
