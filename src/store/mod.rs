//! Block persistence module
//!
//! The local cache is a collection of blocks keyed by height plus a sync cursor pointing at the
//! highest consecutively persisted block. Writes go through `BlockRepository::append_batch`, which
//! is idempotent for blocks already stored, all-or-nothing for the rest, and advances the cursor
//! together with the records.

/// Single-writer advisory lock on a collection directory
mod lock;
/// Durable file-backed collection
mod file;
/// In-process collection
mod memory;
/// MongoDB collection
mod mongo;
/// Repository trait, cursor types and store errors
mod repositories;

use crate::config::{StoreConfig, StoreLocation};
use crate::ledger::Block;
use std::sync::Arc;

pub use file::FileBlockStore;
pub use memory::MemoryBlockStore;
pub use mongo::MongoBlockStore;
pub use repositories::{AppendOutcome, BlockRepository, StoreError, StoredBlock, SyncCursor};

/// Open the collection described by `config`.
///
/// URI validation happens before this is called; only I/O and locking errors surface here.
pub async fn open_store(
	location: &StoreLocation,
	config: &StoreConfig,
) -> Result<Arc<dyn BlockRepository>, StoreError> {
	match location {
		StoreLocation::Memory => Ok(Arc::new(MemoryBlockStore::new())),
		StoreLocation::File(root) => Ok(Arc::new(
			FileBlockStore::open(root, &config.db_name, &config.collection_name).await?,
		)),
		StoreLocation::Mongo(uri) => Ok(Arc::new(
			MongoBlockStore::open(uri, &config.db_name, &config.collection_name).await?,
		)),
	}
}

/// Heights of `blocks`, for log lines.
pub(crate) fn height_span(blocks: &[Block]) -> String {
	match (blocks.first(), blocks.last()) {
		(Some(first), Some(last)) if first.height == last.height => first.height.to_string(),
		(Some(first), Some(last)) => format!("{}..={}", first.height, last.height),
		_ => "none".to_string(),
	}
}
