//! Capture proxy with a live console viewer
//!
//! Starts the proxy on the configured port, stores every exchange under the
//! data directory and prints each captured request as it happens.
//!
//! To run:
//! ```bash
//! cargo run --example capture_proxy -- [config.json]
//! ```
//!
//! Then point a client at it:
//! ```bash
//! curl -x http://127.0.0.1:8080 http://example.com/
//! curl http://127.0.0.1:8080/api/request/1
//! ```

use std::sync::Arc;
use tapline::hub::ViewerSubscription;
use tapline::{FileStore, Pipeline, ProxyConfig, ProxyServer, RewriteEngine};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let config = match std::env::args().nth(1) {
    Some(path) => ProxyConfig::from_json_file(path)?,
    None => ProxyConfig::default(),
  };
  let config = Arc::new(config);
  let rewrite = Arc::new(RewriteEngine::from_config(&config)?);
  let store = Arc::new(FileStore::open(&config.data_dir).await?);
  let pipeline = Arc::new(Pipeline::with_rewrite(config.clone(), rewrite, store).await?);

  // Print a one-line summary of each capture; the raw dump stays in the store.
  let mut viewer = pipeline
    .hub()
    .subscribe(ViewerSubscription::new("console").hide("dump").hide("header"));
  tokio::spawn(async move {
    while let Some(event) = viewer.recv().await {
      println!(
        "[{}] {} {} {}",
        event["doc_id"], event["user"], event["method"], event["url"]
      );
    }
  });

  println!("=== tapline capture proxy on port {} ===", config.port);
  println!("Data directory: {}", config.data_dir.display());
  ProxyServer::from_pipeline(pipeline)
    .run(("0.0.0.0", config.port))
    .await?;
  Ok(())
}
