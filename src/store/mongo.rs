//! MongoDB-backed block collection.
//!
//! Blocks live in the configured collection, one document per height, guarded by a unique index
//! on `height`. The cursor is a single document in `{collection_name}_cursor`. A batch is
//! inserted first and the cursor document is replaced afterwards, compare-and-swap on the
//! previous cursor height. Documents above the committed cursor belong to a write that never
//! committed: readers ignore them, and they are deleted on open and before the next insert.
//!
//! Another writer on the same collection shows up either as a cursor that moved under us or as a
//! duplicate height on insert; both fail the append as a conflict.

use super::repositories::{
	AppendOutcome, BlockRepository, StoreError, StoredBlock, SyncCursor, plan_append,
};
use crate::ledger::Block;
use futures_util::TryStreamExt;
use mongodb::bson::{Document, doc};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::IndexOptions;
use mongodb::{Client, Collection, IndexModel};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const CURSOR_KEY: &str = "cursor";
const DUPLICATE_KEY: i32 = 11000;

/// Stored form of a block
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BlockDocument {
	height: i64,
	id: String,
	#[serde(default)]
	payload: serde_json::Value,
	persisted_at: String,
}

impl BlockDocument {
	fn from_block(block: Block) -> Result<Self, StoreError> {
		let stored = StoredBlock::now(block);
		Ok(Self {
			height: to_bson_height(stored.block.height)?,
			id: stored.block.id,
			payload: stored.block.payload,
			persisted_at: stored.persisted_at,
		})
	}

	fn into_stored(self) -> Result<StoredBlock, StoreError> {
		Ok(StoredBlock {
			block: Block::new(from_bson_height(self.height)?, self.id, self.payload),
			persisted_at: self.persisted_at,
		})
	}
}

/// The single cursor document of a collection
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CursorDocument {
	#[serde(rename = "_id")]
	key: String,
	last_persisted_height: i64,
	last_persisted_id: String,
	updated_at: String,
}

impl CursorDocument {
	fn new(cursor: &SyncCursor) -> Result<Self, StoreError> {
		Ok(Self {
			key: CURSOR_KEY.to_string(),
			last_persisted_height: to_bson_height(cursor.last_persisted_height)?,
			last_persisted_id: cursor.last_persisted_id.clone(),
			updated_at: chrono::Utc::now().to_rfc3339(),
		})
	}

	fn cursor(&self) -> Result<SyncCursor, StoreError> {
		Ok(SyncCursor {
			last_persisted_height: from_bson_height(self.last_persisted_height)?,
			last_persisted_id: self.last_persisted_id.clone(),
		})
	}
}

fn to_bson_height(height: u64) -> Result<i64, StoreError> {
	i64::try_from(height)
		.map_err(|_| StoreError::Corrupt(format!("height {} exceeds the BSON integer range", height)))
}

fn from_bson_height(height: i64) -> Result<u64, StoreError> {
	u64::try_from(height).map_err(|_| StoreError::Corrupt(format!("negative height {}", height)))
}

fn is_duplicate_key(error: &mongodb::error::Error) -> bool {
	match error.kind.as_ref() {
		ErrorKind::Write(WriteFailure::WriteError(failure)) => failure.code == DUPLICATE_KEY,
		ErrorKind::InsertMany(failure) => failure
			.write_errors
			.as_ref()
			.is_some_and(|errors| errors.iter().any(|e| e.code == DUPLICATE_KEY)),
		_ => false,
	}
}

/// MongoDB implementation of BlockRepository
pub struct MongoBlockStore {
	client: Client,
	blocks: Collection<BlockDocument>,
	cursor: Collection<CursorDocument>,
	/// Serializes appends from this instance; `true` once closed.
	closed: Mutex<bool>,
}

impl MongoBlockStore {
	/// Connect to `uri` and open `{db_name}.{collection_name}`.
	///
	/// Creates the height index if missing and deletes documents left above the cursor by an
	/// interrupted write.
	///
	/// # Errors
	/// `StoreError::MongoError` when the deployment cannot be reached, `StoreError::Corrupt` when
	/// the cursor points at a block that is not stored.
	pub async fn open(uri: &str, db_name: &str, collection_name: &str) -> Result<Self, StoreError> {
		let client = Client::with_uri_str(uri).await?;
		let database = client.database(db_name);
		let blocks = database.collection::<BlockDocument>(collection_name);
		let cursor = database.collection::<CursorDocument>(&format!("{}_cursor", collection_name));

		let index = IndexModel::builder()
			.keys(doc! { "height": 1 })
			.options(IndexOptions::builder().unique(true).build())
			.build();
		blocks.create_index(index).await?;

		let store = Self {
			client,
			blocks,
			cursor,
			closed: Mutex::new(false),
		};

		let committed = store.read_cursor().await?;
		let height = committed.as_ref().map_or(0, |c| c.last_persisted_height);
		store.discard_uncommitted(height).await?;
		if let Some(committed) = &committed {
			let stored = store.stored_ids(height, height).await?;
			if stored.get(&height) != Some(&committed.last_persisted_id) {
				return Err(StoreError::Corrupt(format!(
					"cursor points at {} at height {} but the collection disagrees",
					committed.last_persisted_id, height
				)));
			}
		}

		info!(
			"Opened MongoDB collection {}.{} at height {}",
			db_name, collection_name, height
		);
		Ok(store)
	}

	async fn ensure_open(&self) -> Result<(), StoreError> {
		if *self.closed.lock().await {
			return Err(StoreError::Closed);
		}
		Ok(())
	}

	async fn read_cursor(&self) -> Result<Option<SyncCursor>, StoreError> {
		self.cursor
			.find_one(doc! { "_id": CURSOR_KEY })
			.await?
			.map(|document| document.cursor())
			.transpose()
	}

	async fn find_blocks(&self, from: u64, to: u64) -> Result<Vec<BlockDocument>, StoreError> {
		let filter = doc! {
			"height": { "$gte": to_bson_height(from)?, "$lte": to_bson_height(to)? }
		};
		let documents = self
			.blocks
			.find(filter)
			.sort(doc! { "height": 1 })
			.await?
			.try_collect()
			.await?;
		Ok(documents)
	}

	async fn stored_ids(&self, from: u64, to: u64) -> Result<HashMap<u64, String>, StoreError> {
		self.find_blocks(from, to)
			.await?
			.into_iter()
			.map(|document| from_bson_height(document.height).map(|height| (height, document.id)))
			.collect()
	}

	async fn discard_uncommitted(&self, committed_height: u64) -> Result<(), StoreError> {
		let filter = doc! { "height": { "$gt": to_bson_height(committed_height)? } };
		let result = self.blocks.delete_many(filter).await?;
		if result.deleted_count > 0 {
			warn!(
				"Discarded {} uncommitted blocks above height {}",
				result.deleted_count, committed_height
			);
		}
		Ok(())
	}

	/// Replace the cursor document, failing if another writer moved it since `previous`.
	async fn commit_cursor(
		&self,
		previous: Option<&SyncCursor>,
		next: &SyncCursor,
	) -> Result<(), StoreError> {
		let mut filter: Document = doc! { "_id": CURSOR_KEY };
		if let Some(previous) = previous {
			filter.insert(
				"last_persisted_height",
				to_bson_height(previous.last_persisted_height)?,
			);
		}

		let result = self
			.cursor
			.replace_one(filter, CursorDocument::new(next)?)
			.upsert(true)
			.await;
		match result {
			Ok(_) => Ok(()),
			Err(e) if is_duplicate_key(&e) => Err(StoreError::ConcurrentWrite {
				height: next.last_persisted_height,
			}),
			Err(e) => Err(e.into()),
		}
	}
}

#[async_trait::async_trait]
impl BlockRepository for MongoBlockStore {
	async fn load_cursor(&self) -> Result<Option<SyncCursor>, StoreError> {
		self.ensure_open().await?;
		self.read_cursor().await
	}

	async fn append_batch(&self, blocks: &[Block]) -> Result<AppendOutcome, StoreError> {
		let closed = self.closed.lock().await;
		if *closed {
			return Err(StoreError::Closed);
		}

		let cursor = self.read_cursor().await?;
		let persisted = cursor.as_ref().map_or(0, |c| c.last_persisted_height);
		let stored = match (blocks.first(), blocks.last()) {
			(Some(first), Some(last)) if first.height <= persisted => {
				self.stored_ids(first.height, last.height.min(persisted)).await?
			}
			_ => HashMap::new(),
		};
		let fresh = plan_append(cursor.as_ref(), blocks, |height| {
			stored.get(&height).map(String::as_str)
		})?;

		let Some(last) = fresh.last() else {
			return Ok(AppendOutcome { written: 0, cursor });
		};
		let next = SyncCursor {
			last_persisted_height: last.height,
			last_persisted_id: last.id.clone(),
		};
		let written = fresh.len();
		let documents = fresh
			.into_iter()
			.map(BlockDocument::from_block)
			.collect::<Result<Vec<_>, _>>()?;

		self.discard_uncommitted(persisted).await?;
		if let Err(e) = self.blocks.insert_many(&documents).await {
			if is_duplicate_key(&e) {
				return Err(StoreError::ConcurrentWrite {
					height: persisted + 1,
				});
			}
			return Err(e.into());
		}
		self.commit_cursor(cursor.as_ref(), &next).await?;

		debug!(
			"MongoDB store appended {} blocks, cursor at {}",
			written, next.last_persisted_height
		);
		Ok(AppendOutcome {
			written,
			cursor: Some(next),
		})
	}

	async fn block_id_at(&self, height: u64) -> Result<Option<String>, StoreError> {
		self.ensure_open().await?;
		let persisted = self
			.read_cursor()
			.await?
			.map_or(0, |c| c.last_persisted_height);
		if height > persisted {
			return Ok(None);
		}
		Ok(self.stored_ids(height, height).await?.remove(&height))
	}

	async fn read_range(&self, from: u64, to: u64) -> Result<Vec<StoredBlock>, StoreError> {
		self.ensure_open().await?;
		let persisted = self
			.read_cursor()
			.await?
			.map_or(0, |c| c.last_persisted_height);
		let to = to.min(persisted);
		if from > to {
			return Ok(Vec::new());
		}
		self.find_blocks(from, to)
			.await?
			.into_iter()
			.map(BlockDocument::into_stored)
			.collect()
	}

	async fn close(&self) -> Result<(), StoreError> {
		let mut closed = self.closed.lock().await;
		if !*closed {
			*closed = true;
			self.client.clone().shutdown().await;
		}
		Ok(())
	}
}
