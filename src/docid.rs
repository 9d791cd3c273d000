use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide source of capture record identifiers.
///
/// Ids are strictly increasing. The interception session id is kept on the
/// record and never folded into the id.
#[derive(Debug, Default)]
pub struct DocIdAllocator {
  last: AtomicU64,
}

impl DocIdAllocator {
  /// Allocator whose first id is `1`.
  pub fn new() -> Self {
    Self::default()
  }

  /// Allocator that continues after `high_water_mark`, usually the largest
  /// id already in the capture store.
  pub fn resume_after(high_water_mark: u64) -> Self {
    Self {
      last: AtomicU64::new(high_water_mark),
    }
  }

  /// Allocate the next id.
  pub fn next_id(&self) -> u64 {
    self.last.fetch_add(1, Ordering::Relaxed) + 1
  }

  /// Last id handed out, `0` or the resume point if none yet.
  pub fn last_id(&self) -> u64 {
    self.last.load(Ordering::Relaxed)
  }
}
