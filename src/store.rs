//! Capture store contract and the two bundled implementations.

use crate::errors::{Error, Result};
use crate::record::{RequestRecord, ResponseRecord};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

/// The two logical tables of the capture store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
  /// request records
  Request,
  /// response records
  Response,
}

impl Table {
  /// Both tables.
  pub const ALL: [Table; 2] = [Table::Request, Table::Response];

  /// Directory / display name.
  pub fn name(&self) -> &'static str {
    match self {
      Table::Request => "request",
      Table::Response => "response",
    }
  }
}

/// Durable keyed storage for capture records.
///
/// Implementations must allow concurrent inserts and reads of independent
/// keys. A key is written at most once.
#[async_trait::async_trait]
pub trait CaptureStore: Send + Sync {
  /// Durably store `record` under `doc_id`. Once this returns `Ok` the record
  /// survives a crash.
  async fn insert_recovery(&self, table: Table, doc_id: u64, record: Bytes) -> Result<()>;

  /// Point lookup by exact key.
  async fn read(&self, table: Table, doc_id: u64) -> Result<Option<Bytes>>;

  /// Largest doc-id present in any table, `0` for an empty store.
  async fn high_water_mark(&self) -> Result<u64>;
}

/// Typed access to the request and response tables of a [`CaptureStore`].
#[derive(Clone)]
pub struct CaptureTables {
  store: Arc<dyn CaptureStore>,
}

impl CaptureTables {
  /// Wrap a store.
  pub fn new(store: Arc<dyn CaptureStore>) -> Self {
    Self { store }
  }

  /// The underlying store.
  pub fn store(&self) -> &Arc<dyn CaptureStore> {
    &self.store
  }

  /// Persist a request record.
  pub async fn insert_request(&self, doc_id: u64, record: &RequestRecord) -> Result<()> {
    let raw = serde_json::to_vec(record)?;
    self.store.insert_recovery(Table::Request, doc_id, raw.into()).await
  }

  /// Persist a response record.
  pub async fn insert_response(&self, doc_id: u64, record: &ResponseRecord) -> Result<()> {
    let raw = serde_json::to_vec(record)?;
    self.store.insert_recovery(Table::Response, doc_id, raw.into()).await
  }

  /// Read a request record.
  pub async fn read_request(&self, doc_id: u64) -> Result<RequestRecord> {
    let raw = self.read_raw(Table::Request, doc_id).await?;
    Ok(serde_json::from_slice(&raw)?)
  }

  /// Read a response record.
  pub async fn read_response(&self, doc_id: u64) -> Result<ResponseRecord> {
    let raw = self.read_raw(Table::Response, doc_id).await?;
    Ok(serde_json::from_slice(&raw)?)
  }

  async fn read_raw(&self, table: Table, doc_id: u64) -> Result<Bytes> {
    self.store.read(table, doc_id).await?.ok_or_else(|| {
      Error::IO(std::io::Error::new(
        ErrorKind::NotFound,
        format!("{} doc_id={} not found", table.name(), doc_id),
      ))
    })
  }
}

fn already_stored(table: Table, doc_id: u64) -> Error {
  Error::Persist {
    doc_id,
    reason: format!("{} record already exists", table.name()),
  }
}

/// Volatile store for tests and short captures.
#[derive(Debug, Default)]
pub struct MemoryStore {
  tables: RwLock<BTreeMap<Table, BTreeMap<u64, Bytes>>>,
}

impl MemoryStore {
  /// An empty store.
  pub fn new() -> Self {
    Self::default()
  }

  /// Number of records held in `table`.
  pub async fn len(&self, table: Table) -> usize {
    self
      .tables
      .read()
      .await
      .get(&table)
      .map(BTreeMap::len)
      .unwrap_or(0)
  }
}

#[async_trait::async_trait]
impl CaptureStore for MemoryStore {
  async fn insert_recovery(&self, table: Table, doc_id: u64, record: Bytes) -> Result<()> {
    let mut tables = self.tables.write().await;
    let rows = tables.entry(table).or_default();
    if rows.contains_key(&doc_id) {
      return Err(already_stored(table, doc_id));
    }
    rows.insert(doc_id, record);
    Ok(())
  }

  async fn read(&self, table: Table, doc_id: u64) -> Result<Option<Bytes>> {
    Ok(
      self
        .tables
        .read()
        .await
        .get(&table)
        .and_then(|rows| rows.get(&doc_id).cloned()),
    )
  }

  async fn high_water_mark(&self) -> Result<u64> {
    let tables = self.tables.read().await;
    Ok(
      tables
        .values()
        .filter_map(|rows| rows.keys().next_back().copied())
        .max()
        .unwrap_or(0),
    )
  }
}

/// One JSON file per record, one directory per table.
///
/// Inserts go through a temporary file that is synced and renamed into
/// place, followed by a sync of the table directory.
#[derive(Debug, Clone)]
pub struct FileStore {
  root: PathBuf,
}

impl FileStore {
  /// Open (creating if needed) a store rooted at `root`.
  pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
    let root = root.as_ref().to_path_buf();
    for table in Table::ALL {
      tokio::fs::create_dir_all(root.join(table.name())).await?;
    }
    Ok(Self { root })
  }

  /// Root directory.
  pub fn root(&self) -> &Path {
    &self.root
  }

  fn record_path(&self, table: Table, doc_id: u64) -> PathBuf {
    self
      .root
      .join(table.name())
      .join(format!("{:020}.json", doc_id))
  }
}

#[async_trait::async_trait]
impl CaptureStore for FileStore {
  async fn insert_recovery(&self, table: Table, doc_id: u64, record: Bytes) -> Result<()> {
    let dir = self.root.join(table.name());
    let target = self.record_path(table, doc_id);
    if tokio::fs::try_exists(&target).await? {
      return Err(already_stored(table, doc_id));
    }
    let tmp = dir.join(format!(".{:020}.tmp", doc_id));
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(&record).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, &target).await?;
    #[cfg(unix)]
    tokio::fs::File::open(&dir).await?.sync_all().await?;
    Ok(())
  }

  async fn read(&self, table: Table, doc_id: u64) -> Result<Option<Bytes>> {
    match tokio::fs::read(self.record_path(table, doc_id)).await {
      Ok(raw) => Ok(Some(Bytes::from(raw))),
      Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
      Err(e) => Err(e.into()),
    }
  }

  async fn high_water_mark(&self) -> Result<u64> {
    let mut highest = 0;
    for table in Table::ALL {
      let mut entries = tokio::fs::read_dir(self.root.join(table.name())).await?;
      while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let doc_id = name
          .to_str()
          .and_then(|n| n.strip_suffix(".json"))
          .and_then(|n| n.parse::<u64>().ok());
        if let Some(doc_id) = doc_id {
          highest = highest.max(doc_id);
        }
      }
    }
    Ok(highest)
  }
}
