//! Live fan-out of captured requests to connected viewers.

use crate::record::CapturedEvent;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};

/// Filter and redaction settings a viewer supplies when it connects.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewerSubscription {
  /// authenticated user behind the viewer
  pub user: String,
  /// only events from this client IP; empty or `*` for any
  pub client_ip: String,
  /// event fields removed before delivery
  pub hide: BTreeSet<String>,
  /// only events whose URL matches one of these; `*` is a wildcard
  pub url_patterns: Vec<String>,
}

impl ViewerSubscription {
  /// Subscription that receives everything.
  pub fn new(user: impl Into<String>) -> Self {
    Self {
      user: user.into(),
      ..Default::default()
    }
  }

  /// Restrict to one client IP.
  pub fn client_ip(mut self, ip: impl Into<String>) -> Self {
    self.client_ip = ip.into();
    self
  }

  /// Remove `field` from every delivered event.
  pub fn hide(mut self, field: impl Into<String>) -> Self {
    self.hide.insert(field.into());
    self
  }

  /// Add a URL pattern.
  pub fn url_pattern(mut self, pattern: impl Into<String>) -> Self {
    self.url_patterns.push(pattern.into());
    self
  }

  /// Whether an event from `client_addr` for `url` passes the filter.
  pub fn matches(&self, client_addr: &str, url: &str) -> bool {
    self.matches_client(client_addr) && self.matches_url(url)
  }

  fn matches_client(&self, client_addr: &str) -> bool {
    let wanted = self.client_ip.trim();
    if wanted.is_empty() || wanted == "*" {
      return true;
    }
    let ip = client_addr
      .parse::<SocketAddr>()
      .map(|a| a.ip().to_string())
      .unwrap_or_else(|_| client_addr.to_string());
    ip == wanted
  }

  fn matches_url(&self, url: &str) -> bool {
    self.url_patterns.is_empty() || self.url_patterns.iter().any(|p| wildcard_contains(url, p))
  }
}

fn wildcard_contains(haystack: &str, pattern: &str) -> bool {
  let mut rest = haystack;
  for part in pattern.split('*').filter(|p| !p.is_empty()) {
    match rest.find(part) {
      Some(i) => rest = &rest[i + part.len()..],
      None => return false,
    }
  }
  true
}

struct ViewerSlot {
  subscription: ViewerSubscription,
  sender: mpsc::Sender<Value>,
}

struct HubInner {
  viewers: RwLock<HashMap<u64, ViewerSlot>>,
  next_id: AtomicU64,
  buffer: usize,
}

impl HubInner {
  fn remove(&self, id: u64) -> bool {
    self.viewers.write().remove(&id).is_some()
  }
}

/// The set of connected viewers.
///
/// Publishing never waits on a viewer: each has a bounded buffer and events
/// that do not fit are dropped for that viewer only.
#[derive(Clone)]
pub struct BroadcastHub {
  inner: Arc<HubInner>,
}

impl BroadcastHub {
  /// Hub giving each viewer a buffer of `buffer` events.
  pub fn new(buffer: usize) -> Self {
    Self {
      inner: Arc::new(HubInner {
        viewers: RwLock::new(HashMap::new()),
        next_id: AtomicU64::new(1),
        buffer: buffer.max(1),
      }),
    }
  }

  /// Register a viewer after its handshake succeeded.
  pub fn subscribe(&self, subscription: ViewerSubscription) -> Viewer {
    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
    let (sender, receiver) = mpsc::channel(self.inner.buffer);
    let user = subscription.user.clone();
    tracing::info!("viewer {} connected, user={}", id, user);
    self.inner.viewers.write().insert(
      id,
      ViewerSlot {
        subscription,
        sender,
      },
    );
    Viewer {
      id,
      user,
      receiver,
      hub: Arc::downgrade(&self.inner),
    }
  }

  /// Remove a viewer. Returns `false` if it was already gone.
  pub fn unsubscribe(&self, id: u64) -> bool {
    self.inner.remove(id)
  }

  /// Number of connected viewers.
  pub fn viewer_count(&self) -> usize {
    self.inner.viewers.read().len()
  }

  /// Deliver `event` to every viewer whose filter accepts it.
  ///
  /// Returns how many viewers it was queued for.
  pub fn publish(&self, event: &CapturedEvent) -> usize {
    if self.inner.viewers.read().is_empty() {
      return 0;
    }
    let fields = match serde_json::to_value(event) {
      Ok(Value::Object(fields)) => fields,
      Ok(_) => return 0,
      Err(e) => {
        tracing::error!("encode event doc_id={} failed: {}", event.doc_id, e);
        return 0;
      }
    };
    let mut delivered = 0;
    let mut closed = Vec::new();
    {
      let viewers = self.inner.viewers.read();
      for (id, slot) in viewers.iter() {
        if !slot.subscription.matches(&event.client_ip, &event.url) {
          continue;
        }
        let message = sanitize(&fields, &slot.subscription.hide);
        match slot.sender.try_send(message) {
          Ok(()) => delivered += 1,
          Err(TrySendError::Full(_)) => {
            tracing::warn!("viewer {} is full, dropped doc_id={}", id, event.doc_id);
          }
          Err(TrySendError::Closed(_)) => closed.push(*id),
        }
      }
    }
    for id in closed {
      if self.inner.remove(id) {
        tracing::info!("viewer {} disconnected", id);
      }
    }
    delivered
  }
}

fn sanitize(fields: &Map<String, Value>, hide: &BTreeSet<String>) -> Value {
  Value::Object(
    fields
      .iter()
      .filter(|(k, _)| !hide.contains(k.as_str()))
      .map(|(k, v)| (k.clone(), v.clone()))
      .collect(),
  )
}

/// Receiving side of one viewer subscription. Dropping it unsubscribes.
pub struct Viewer {
  id: u64,
  user: String,
  receiver: mpsc::Receiver<Value>,
  hub: Weak<HubInner>,
}

impl Viewer {
  /// Subscription id.
  pub fn id(&self) -> u64 {
    self.id
  }

  /// User the viewer authenticated as.
  pub fn user(&self) -> &str {
    &self.user
  }

  /// Wait for the next event; `None` once the hub is gone.
  pub async fn recv(&mut self) -> Option<Value> {
    self.receiver.recv().await
  }

  /// Next buffered event without waiting.
  pub fn try_recv(&mut self) -> Option<Value> {
    match self.receiver.try_recv() {
      Ok(v) => Some(v),
      Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
    }
  }
}

impl Drop for Viewer {
  fn drop(&mut self) {
    if let Some(hub) = self.hub.upgrade() {
      if hub.remove(self.id) {
        tracing::info!("viewer {} disconnected", self.id);
      }
    }
  }
}
