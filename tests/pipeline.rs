#[cfg(test)]
mod tests {
  use base64::engine::general_purpose::STANDARD;
  use base64::Engine;
  use flate2::write::GzEncoder;
  use flate2::Compression;
  use std::collections::{BTreeMap, HashSet};
  use std::io::Write;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Arc;
  use tapline::correlate::ExchangeContext;
  use tapline::hub::ViewerSubscription;
  use tapline::record::SKIPPED_BODY;
  use tapline::{
    AuthMode, Body, CaptureStore, InterceptedRequest, InterceptedResponse, MemoryStore, Pipeline,
    ProxyConfig, RequestOutcome, RewriteEngine, StatusCode, Table,
  };

  const HOST_SWAP: &str = r#"
    fn rewrite(req) {
      if req.host == "old.example.com" {
        let url = req.url;
        url.replace("old.example.com", "new.example.com");
        return #{ url: url };
      }
    }
  "#;

  /// Pipeline over a fresh in-memory store
  async fn pipeline_with(config: ProxyConfig, script: Option<&str>) -> (Arc<Pipeline>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let rewrite = match script {
      Some(source) => RewriteEngine::from_source(source, 100_000).unwrap(),
      None => RewriteEngine::disabled(100_000),
    };
    let pipeline = Pipeline::with_rewrite(Arc::new(config), Arc::new(rewrite), store.clone())
      .await
      .unwrap();
    (Arc::new(pipeline), store)
  }

  fn request(method: &str, url: &str, headers: &[(&str, &str)], body: impl Into<Body>) -> InterceptedRequest {
    let mut builder = http::Request::builder().method(method).uri(url);
    for (name, value) in headers {
      builder = builder.header(*name, *value);
    }
    InterceptedRequest::with_source(
      "10.0.0.5:5555".parse().unwrap(),
      "example.com:80",
      builder.body(body.into()).unwrap(),
    )
  }

  fn response(status: u16, headers: &[(&str, &str)], body: impl Into<Body>) -> InterceptedResponse {
    let mut builder = http::Response::builder().status(status);
    for (name, value) in headers {
      builder = builder.header(*name, *value);
    }
    InterceptedResponse::new("example.com:80", builder.body(body.into()).unwrap())
  }

  fn forwarded(outcome: RequestOutcome) -> InterceptedRequest {
    match outcome {
      RequestOutcome::Forward(request) => request,
      RequestOutcome::Respond(response) => panic!("expected forward, got {}", response.status()),
    }
  }

  fn gzip(raw: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(raw).unwrap();
    encoder.finish().unwrap()
  }

  fn basic(user: &str, pass: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{}:{}", user, pass)))
  }

  #[tokio::test]
  async fn test_form_body_is_decoded_plain_and_gzipped() {
    let (pipeline, _) = pipeline_with(ProxyConfig::default(), None).await;
    let expected: BTreeMap<String, Vec<String>> = [
      ("a".to_string(), vec!["1".to_string()]),
      ("b".to_string(), vec!["2".to_string()]),
    ]
    .into_iter()
    .collect();
    let form = ("content-type", "application/x-www-form-urlencoded");

    let mut ctx = ExchangeContext::new(1);
    let plain = request("POST", "http://example.com/login", &[form], "a=1&b=2");
    let sent = forwarded(pipeline.handle_request(&mut ctx, plain).await);
    assert_eq!(&sent.request().body()[..], b"a=1&b=2");
    let record = pipeline.request_record(pipeline.last_doc_id()).await;
    assert_eq!(record.form_post.as_ref(), Some(&expected));

    let compressed = gzip(b"a=1&b=2");
    let mut ctx = ExchangeContext::new(2);
    let zipped = request(
      "POST",
      "http://example.com/login",
      &[form, ("content-encoding", "gzip")],
      compressed.clone(),
    );
    let sent = forwarded(pipeline.handle_request(&mut ctx, zipped).await);
    assert_eq!(&sent.request().body()[..], &compressed[..]);
    let record = pipeline.request_record(pipeline.last_doc_id()).await;
    assert_eq!(record.form_post, Some(expected));
  }

  #[tokio::test]
  async fn test_broken_form_body_is_omitted() {
    let (pipeline, store) = pipeline_with(ProxyConfig::default(), None).await;
    let mut ctx = ExchangeContext::new(1);
    let broken = request(
      "POST",
      "http://example.com/login",
      &[
        ("content-type", "application/x-www-form-urlencoded"),
        ("content-encoding", "gzip"),
      ],
      "not gzip at all",
    );
    forwarded(pipeline.handle_request(&mut ctx, broken).await);
    assert_eq!(store.len(Table::Request).await, 1);
    let record = pipeline.request_record(1).await;
    assert_eq!(record.form_post, None);
    assert!(!record.dump.is_empty());
  }

  #[tokio::test]
  async fn test_record_fields() {
    let (pipeline, _) = pipeline_with(ProxyConfig::default(), None).await;
    let mut ctx = ExchangeContext::new(77);
    let get = request(
      "GET",
      "http://example.com/search?q=rust&q=tokio&page=2",
      &[("host", "example.com"), ("cookie", "sid=abc; theme=dark")],
      Body::empty(),
    );
    forwarded(pipeline.handle_request(&mut ctx, get).await);
    let record = pipeline.request_record(1).await;
    assert_eq!(record.host, "example.com");
    assert_eq!(record.url, "http://example.com/search?q=rust&q=tokio&page=2");
    assert_eq!(record.path, "/search");
    assert_eq!(record.method, "GET");
    assert_eq!(record.session_id, 77);
    assert_eq!(record.user, "guest");
    assert_eq!(record.client_ip, "10.0.0.5:5555");
    assert_eq!(record.form_get["q"], vec!["rust", "tokio"]);
    assert_eq!(record.cookies.len(), 2);
    assert_eq!(record.cookies[0].name, "sid");
    assert!(record.rewrite.is_empty());
    assert!(record.dump.starts_with(b"GET /search?q=rust&q=tokio&page=2 HTTP/1.1\r\n"));
  }

  #[tokio::test]
  async fn test_rewrite_changes_forwarded_url_but_not_recorded_url() {
    let (pipeline, _) = pipeline_with(ProxyConfig::default(), Some(HOST_SWAP)).await;
    let mut ctx = ExchangeContext::new(1);
    let old = request(
      "GET",
      "http://old.example.com/x",
      &[("host", "old.example.com")],
      Body::empty(),
    );
    let sent = forwarded(pipeline.handle_request(&mut ctx, old).await);
    assert_eq!(sent.url(), "http://new.example.com/x");
    assert_eq!(sent.host(), "new.example.com");
    assert_eq!(sent.destination(), "new.example.com:80");

    let record = pipeline.request_record(pipeline.last_doc_id()).await;
    assert_eq!(record.url, "http://old.example.com/x");
    assert_eq!(
      record.rewrite.get("url").map(String::as_str),
      Some("http://new.example.com/x")
    );

    let mut ctx = ExchangeContext::new(2);
    let other = request("GET", "http://other.example.com/x", &[], Body::empty());
    let sent = forwarded(pipeline.handle_request(&mut ctx, other).await);
    assert_eq!(sent.url(), "http://other.example.com/x");
    assert!(pipeline.request_record(pipeline.last_doc_id()).await.rewrite.is_empty());
  }

  #[tokio::test]
  async fn test_failing_script_never_blocks_the_request() {
    let script = r#"fn rewrite(req) { throw "bad day"; }"#;
    let (pipeline, store) = pipeline_with(ProxyConfig::default(), Some(script)).await;
    let mut ctx = ExchangeContext::new(1);
    let sent = forwarded(
      pipeline
        .handle_request(&mut ctx, request("GET", "http://example.com/", &[], Body::empty()))
        .await,
    );
    assert_eq!(sent.url(), "http://example.com/");
    assert_eq!(store.len(Table::Request).await, 1);
    assert!(pipeline.request_record(1).await.rewrite.is_empty());
  }

  #[tokio::test]
  async fn test_require_known_user() {
    let config = ProxyConfig {
      auth_mode: AuthMode::RequireKnownUser,
      users: [("alice".to_string(), "secret".to_string())].into_iter().collect(),
      ..Default::default()
    };
    let (pipeline, store) = pipeline_with(config, None).await;

    for headers in [
      vec![],
      vec![("proxy-authorization", basic("alice", "wrong"))],
      vec![("proxy-authorization", basic("mallory", "secret"))],
    ] {
      let headers: Vec<(&str, &str)> = headers.iter().map(|(k, v)| (*k, v.as_str())).collect();
      let mut ctx = ExchangeContext::new(1);
      match pipeline
        .handle_request(&mut ctx, request("GET", "http://example.com/", &headers, Body::empty()))
        .await
      {
        RequestOutcome::Respond(challenge) => {
          assert_eq!(challenge.status(), StatusCode::UNAUTHORIZED);
          assert!(challenge.headers()["www-authenticate"]
            .to_str()
            .unwrap()
            .starts_with("Basic realm="));
        }
        RequestOutcome::Forward(_) => panic!("unauthenticated request was forwarded"),
      }
    }
    assert_eq!(store.len(Table::Request).await, 0);
    assert_eq!(store.high_water_mark().await.unwrap(), 0);

    let good = basic("alice", "secret");
    let mut ctx = ExchangeContext::new(2);
    let sent = forwarded(
      pipeline
        .handle_request(
          &mut ctx,
          request(
            "GET",
            "http://example.com/",
            &[("proxy-authorization", good.as_str()), ("proxy-connection", "keep-alive")],
            Body::empty(),
          ),
        )
        .await,
    );
    assert!(sent.request().headers().get("proxy-authorization").is_none());
    assert!(sent.request().headers().get("proxy-connection").is_none());
    let record = pipeline.request_record(pipeline.last_doc_id()).await;
    assert_eq!(record.user, "alice");
    assert!(record.header.get("proxy-authorization").is_none());
  }

  #[tokio::test]
  async fn test_require_any_credentials() {
    let config = ProxyConfig {
      auth_mode: AuthMode::RequireAnyCredentials,
      ..Default::default()
    };
    let (pipeline, _) = pipeline_with(config, None).await;
    let mut ctx = ExchangeContext::new(1);
    let anonymous = request("GET", "http://example.com/", &[], Body::empty());
    assert!(matches!(
      pipeline.handle_request(&mut ctx, anonymous).await,
      RequestOutcome::Respond(_)
    ));
    let creds = basic("anyone", "anything");
    let mut ctx = ExchangeContext::new(2);
    let known = request("GET", "http://example.com/", &[("authorization", creds.as_str())], Body::empty());
    forwarded(pipeline.handle_request(&mut ctx, known).await);
    assert_eq!(pipeline.request_record(1).await.user, "anyone");
  }

  #[tokio::test]
  async fn test_response_is_paired_by_doc_id() {
    let (pipeline, store) = pipeline_with(ProxyConfig::default(), None).await;
    let mut ctx = ExchangeContext::new(5);
    forwarded(
      pipeline
        .handle_request(&mut ctx, request("GET", "http://example.com/", &[], Body::empty()))
        .await,
    );
    let doc_id = pipeline.last_doc_id();
    let reply = pipeline
      .handle_response(
        &mut ctx,
        response(200, &[("content-length", "5"), ("connection", "keep-alive")], "hello"),
      )
      .await;
    assert_eq!(reply.response().headers()["connection"], "close");
    assert_eq!(&reply.response().body()[..], b"hello");

    let record = pipeline.response_record(doc_id).await;
    assert_eq!(record.session_id, 5);
    assert_eq!(record.status, 200);
    assert_eq!(record.content_length, Some(5));
    assert_eq!(&record.body[..], b"hello");
    assert!(record.dump.starts_with(b"HTTP/1.1 200 OK\r\n"));

    let first = store.read(Table::Response, doc_id).await.unwrap().unwrap();
    let second = store.read(Table::Response, doc_id).await.unwrap().unwrap();
    assert_eq!(first, second);
  }

  #[tokio::test]
  async fn test_oversized_response_body_is_skipped() {
    let config = ProxyConfig {
      max_response_body: 4,
      ..Default::default()
    };
    let (pipeline, _) = pipeline_with(config, None).await;

    let mut ctx = ExchangeContext::new(1);
    forwarded(
      pipeline
        .handle_request(&mut ctx, request("GET", "http://example.com/big", &[], Body::empty()))
        .await,
    );
    let reply = pipeline
      .handle_response(&mut ctx, response(200, &[("content-length", "10")], "0123456789"))
      .await;
    assert_eq!(&reply.response().body()[..], b"0123456789");
    let record = pipeline.response_record(pipeline.last_doc_id()).await;
    assert_eq!(&record.body[..], SKIPPED_BODY);
    assert!(record.body_skipped());

    // no declared length, the real size decides
    let mut ctx = ExchangeContext::new(2);
    forwarded(
      pipeline
        .handle_request(&mut ctx, request("GET", "http://example.com/big", &[], Body::empty()))
        .await,
    );
    pipeline
      .handle_response(&mut ctx, response(200, &[], "0123456789"))
      .await;
    assert!(pipeline.response_record(pipeline.last_doc_id()).await.body_skipped());
  }

  #[tokio::test]
  async fn test_uncorrelated_response_is_not_recorded() {
    let (pipeline, store) = pipeline_with(ProxyConfig::default(), None).await;
    let mut ctx = ExchangeContext::new(9);
    ctx.user_data_mut().insert(42u64);
    let reply = pipeline
      .handle_response(&mut ctx, response(204, &[], Body::empty()))
      .await;
    assert_eq!(reply.response().status(), StatusCode::NO_CONTENT);
    assert_eq!(reply.response().headers()["connection"], "close");
    assert_eq!(store.len(Table::Response).await, 0);
  }

  #[tokio::test]
  async fn test_doc_ids_are_unique_under_concurrency() {
    let (pipeline, store) = pipeline_with(ProxyConfig::default(), None).await;
    let tasks: Vec<_> = (0..64)
      .map(|session| {
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
          let mut ctx = ExchangeContext::new(session);
          let url = format!("http://example.com/{}", session);
          forwarded(
            pipeline
              .handle_request(&mut ctx, request("GET", &url, &[], Body::empty()))
              .await,
          );
          let reply = response(200, &[], "ok");
          pipeline.handle_response(&mut ctx, reply).await;
          tapline::correlate::resolve(&mut ctx).is_err()
        })
      })
      .collect();
    for task in tasks {
      assert!(task.await.unwrap());
    }
    assert_eq!(store.len(Table::Request).await, 64);
    assert_eq!(store.len(Table::Response).await, 64);

    let mut sessions = HashSet::new();
    for doc_id in 1..=64 {
      let req = pipeline.request_record(doc_id).await;
      let res = pipeline.response_record(doc_id).await;
      assert_eq!(req.session_id, res.session_id);
      assert_eq!(req.url, format!("http://example.com/{}", req.session_id));
      assert!(sessions.insert(req.session_id));
    }
  }

  #[tokio::test]
  async fn test_doc_ids_resume_after_store_contents() {
    let store = Arc::new(MemoryStore::new());
    store
      .insert_recovery(Table::Request, 41, bytes::Bytes::from_static(b"{}"))
      .await
      .unwrap();
    let pipeline = Pipeline::open(Arc::new(ProxyConfig::default()), store.clone())
      .await
      .unwrap();
    let mut ctx = ExchangeContext::new(1);
    forwarded(
      pipeline
        .handle_request(&mut ctx, request("GET", "http://example.com/", &[], Body::empty()))
        .await,
    );
    assert_eq!(pipeline.last_doc_id(), 42);
    assert!(store.read(Table::Request, 42).await.unwrap().is_some());
  }

  #[tokio::test]
  async fn test_viewers_receive_filtered_events() {
    let (pipeline, _) = pipeline_with(ProxyConfig::default(), Some(HOST_SWAP)).await;
    let mut everything = pipeline.hub().subscribe(ViewerSubscription::new("ops"));
    let mut redacted = pipeline
      .hub()
      .subscribe(ViewerSubscription::new("ops").hide("dump").hide("header"));
    let mut elsewhere = pipeline
      .hub()
      .subscribe(ViewerSubscription::new("ops").client_ip("10.0.0.9"));

    let mut ctx = ExchangeContext::new(3);
    forwarded(
      pipeline
        .handle_request(&mut ctx, request("GET", "http://old.example.com/x", &[], Body::empty()))
        .await,
    );

    let event = everything.try_recv().unwrap();
    assert_eq!(event["doc_id"], 1);
    assert_eq!(event["session_id"], 3);
    assert_eq!(event["user"], "guest");
    assert_eq!(event["url"], "http://old.example.com/x");
    assert_eq!(event["rewrite"]["url"], "http://new.example.com/x");
    assert!(event.get("dump").is_some());

    let event = redacted.try_recv().unwrap();
    assert!(event.get("dump").is_none());
    assert!(event.get("header").is_none());
    assert_eq!(event["host"], "old.example.com");

    assert!(elsewhere.try_recv().is_none());
  }

  #[tokio::test]
  async fn test_stalled_viewer_does_not_slow_requests() {
    let config = ProxyConfig {
      viewer_buffer: 1,
      ..Default::default()
    };
    let (pipeline, store) = pipeline_with(config, None).await;
    let _stalled = pipeline.hub().subscribe(ViewerSubscription::new("slow"));
    let started = std::time::Instant::now();
    for session in 0..200 {
      let mut ctx = ExchangeContext::new(session);
      forwarded(
        pipeline
          .handle_request(&mut ctx, request("GET", "http://example.com/", &[], Body::empty()))
          .await,
      );
    }
    assert!(started.elapsed() < std::time::Duration::from_secs(10));
    assert_eq!(store.len(Table::Request).await, 200);
    assert_eq!(pipeline.hub().viewer_count(), 1);
  }

  /// Store whose every insert fails, counting attempts per table.
  #[derive(Default)]
  struct BrokenStore {
    request_inserts: AtomicUsize,
    response_inserts: AtomicUsize,
  }

  #[async_trait::async_trait]
  impl CaptureStore for BrokenStore {
    async fn insert_recovery(&self, table: Table, doc_id: u64, _record: bytes::Bytes) -> tapline::Result<()> {
      match table {
        Table::Request => self.request_inserts.fetch_add(1, Ordering::SeqCst),
        Table::Response => self.response_inserts.fetch_add(1, Ordering::SeqCst),
      };
      Err(tapline::Error::Persist {
        doc_id,
        reason: "disk full".to_string(),
      })
    }

    async fn read(&self, _table: Table, _doc_id: u64) -> tapline::Result<Option<bytes::Bytes>> {
      Ok(None)
    }

    async fn high_water_mark(&self) -> tapline::Result<u64> {
      Ok(0)
    }
  }

  #[tokio::test]
  async fn test_failed_request_insert_still_forwards() {
    let store = Arc::new(BrokenStore::default());
    let pipeline = Pipeline::open(Arc::new(ProxyConfig::default()), store.clone())
      .await
      .unwrap();
    let mut viewer = pipeline.hub().subscribe(ViewerSubscription::new("ops"));

    let mut ctx = ExchangeContext::new(4);
    let sent = forwarded(
      pipeline
        .handle_request(&mut ctx, request("GET", "http://example.com/a", &[], Body::empty()))
        .await,
    );
    assert_eq!(sent.url(), "http://example.com/a");
    assert_eq!(store.request_inserts.load(Ordering::SeqCst), 1);
    assert!(ctx.user_data().get::<tapline::correlate::DocId>().is_none());
    assert!(viewer.try_recv().is_none());

    let reply = pipeline
      .handle_response(&mut ctx, response(200, &[], "ok"))
      .await;
    assert_eq!(reply.response().status(), StatusCode::OK);
    assert_eq!(&reply.response().body()[..], b"ok");
    assert_eq!(store.response_inserts.load(Ordering::SeqCst), 0);
  }
}
