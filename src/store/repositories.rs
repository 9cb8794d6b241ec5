use crate::ledger::Block;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Durable pointer to the highest consecutively persisted block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
	pub last_persisted_height: u64,
	pub last_persisted_id: String,
}

/// A persisted block together with its write timestamp (RFC 3339).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredBlock {
	#[serde(flatten)]
	pub block: Block,
	pub persisted_at: String,
}

impl StoredBlock {
	pub fn now(block: Block) -> Self {
		Self {
			block,
			persisted_at: chrono::Utc::now().to_rfc3339(),
		}
	}
}

/// Result of a successful `append_batch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendOutcome {
	/// Records actually written; already-stored duplicates are not counted.
	pub written: usize,
	/// Cursor after the write; `None` only for an empty batch on an empty collection.
	pub cursor: Option<SyncCursor>,
}

/// Repository for the block collection and its sync cursor
#[async_trait::async_trait]
pub trait BlockRepository: Send + Sync {
	/// Current cursor, `None` while the collection is empty.
	async fn load_cursor(&self) -> Result<Option<SyncCursor>, StoreError>;

	/// Append an ascending, contiguous batch, all-or-nothing.
	///
	/// Blocks already stored with the same id are skipped. The first new block must sit at
	/// `cursor + 1`; a gap fails with `StoreError::SequenceConflict` and an id differing from the
	/// stored one fails with `StoreError::IdConflict`. On failure nothing is written. The cursor
	/// advances together with the records.
	async fn append_batch(&self, blocks: &[Block]) -> Result<AppendOutcome, StoreError>;

	/// Id stored at `height`, if any.
	async fn block_id_at(&self, height: u64) -> Result<Option<String>, StoreError>;

	/// Stored blocks with `from <= height <= to`, ascending.
	async fn read_range(&self, from: u64, to: u64) -> Result<Vec<StoredBlock>, StoreError>;

	/// Release held resources. Later calls fail with `StoreError::Closed`.
	async fn close(&self) -> Result<(), StoreError> {
		Ok(())
	}
}

/// Check a batch against the stored state and return the blocks that must be written.
///
/// `lookup` resolves the stored id at a height at or below the cursor.
pub(crate) fn plan_append<'a, F>(
	cursor: Option<&SyncCursor>,
	blocks: &[Block],
	lookup: F,
) -> Result<Vec<Block>, StoreError>
where
	F: Fn(u64) -> Option<&'a str>,
{
	let persisted = cursor.map_or(0, |c| c.last_persisted_height);
	let mut expected = persisted + 1;
	let mut previous: Option<u64> = None;
	let mut fresh = Vec::new();

	for block in blocks {
		if let Some(previous) = previous {
			if block.height != previous + 1 {
				return Err(StoreError::SequenceConflict {
					expected: previous + 1,
					found: block.height,
				});
			}
		}
		previous = Some(block.height);

		if block.height <= persisted {
			match lookup(block.height) {
				Some(stored) if stored == block.id => continue,
				Some(stored) => {
					return Err(StoreError::IdConflict {
						height: block.height,
						stored_id: stored.to_string(),
						incoming_id: block.id.clone(),
					});
				}
				None => {
					return Err(StoreError::Corrupt(format!(
						"no record at height {} below cursor {}",
						block.height, persisted
					)));
				}
			}
		}

		if block.height != expected {
			return Err(StoreError::SequenceConflict {
				expected,
				found: block.height,
			});
		}
		fresh.push(block.clone());
		expected += 1;
	}

	Ok(fresh)
}

/// Error types for block persistence
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
	#[error("Sequence conflict: expected height {expected}, found {found}")]
	SequenceConflict { expected: u64, found: u64 },

	#[error("Height {height} is stored with id {stored_id}, refusing {incoming_id}")]
	IdConflict {
		height: u64,
		stored_id: String,
		incoming_id: String,
	},

	#[error("Height {height} was written concurrently by another writer")]
	ConcurrentWrite { height: u64 },

	#[error("IO error: {0}")]
	IoError(#[from] std::io::Error),

	#[error("Serialization error: {0}")]
	SerializationError(#[from] serde_json::Error),

	#[error("MongoDB error: {0}")]
	MongoError(#[from] mongodb::error::Error),

	#[error("Store directory {0:?} is locked by another process")]
	Locked(PathBuf),

	#[error("Corrupt store: {0}")]
	Corrupt(String),

	#[error("Store is closed")]
	Closed,
}

impl StoreError {
	/// Whether the write was rejected because it conflicts with persisted state.
	pub fn is_conflict(&self) -> bool {
		matches!(
			self,
			StoreError::SequenceConflict { .. }
				| StoreError::IdConflict { .. }
				| StoreError::ConcurrentWrite { .. }
		)
	}
}
