//! Persistence of registry records.
//!
//! The registry writes one [`InstanceRecord`] per managed instance so that a
//! later process pointed at the same location can rediscover (and re-attach
//! to) servers it did not start itself.
//!
//! [`SqliteStateStore`] keeps records in a SQLite database in WAL mode and
//! holds an advisory lock file next to it for as long as it is open.

mod sqlite;
mod types;

pub use sqlite::SqliteStateStore;
pub use types::InstanceRecord;

use crate::error::Result;
use async_trait::async_trait;
use std::path::Path;

/// Durable keyed storage for instance records.
///
/// All operations after [`StateStore::close`] fail with `Error::StoreClosed`.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Every stored record, oldest first.
    async fn load_all(&self) -> Result<Vec<InstanceRecord>>;

    /// Insert or replace the record with `record.id`.
    async fn put(&self, record: &InstanceRecord) -> Result<()>;

    /// Delete a record. Deleting an unknown id is not an error.
    async fn remove(&self, id: &str) -> Result<()>;

    /// Delete every record.
    async fn clear(&self) -> Result<()>;

    /// Flush and release the backing storage. Idempotent.
    async fn close(&self) -> Result<()>;

    fn location(&self) -> &Path;
}
