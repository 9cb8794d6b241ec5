//! File-backed block collection.
//!
//! A collection lives in `{root}/{db_name}/{collection_name}/` and consists of:
//! - `blocks.jsonl`: append-only JSON lines, one `StoredBlock` per line;
//! - `cursor.json`: the committed cursor plus the committed byte length of `blocks.jsonl`.
//!
//! A batch is appended and fsynced first; the cursor document is then replaced atomically via
//! write-to-temp and rename. Bytes past the committed length belong to a batch that never
//! committed and are truncated on open, so readers never observe a partial batch.

use super::lock::CollectionLockGuard;
use super::repositories::{
	AppendOutcome, BlockRepository, StoreError, StoredBlock, SyncCursor, plan_append,
};
use crate::ledger::Block;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const RECORDS_FILE: &str = "blocks.jsonl";
const CURSOR_FILE: &str = "cursor.json";
const CURSOR_TMP_FILE: &str = "cursor.json.tmp";

/// On-disk cursor document
#[derive(Debug, Serialize, Deserialize)]
struct CursorDocument {
	last_persisted_height: u64,
	last_persisted_id: String,
	/// Committed length of the record file in bytes.
	records_len: u64,
	updated_at: String,
}

/// File-based implementation of BlockRepository
pub struct FileBlockStore {
	dir: PathBuf,
	inner: Mutex<FileState>,
}

struct FileState {
	/// Stored id per height.
	index: BTreeMap<u64, String>,
	cursor: Option<SyncCursor>,
	records_len: u64,
	/// `None` once closed.
	lock: Option<CollectionLockGuard>,
}

impl FileBlockStore {
	/// Open (or create) the collection `{root}/{db_name}/{collection_name}`.
	///
	/// # Errors
	/// `StoreError::Locked` if another store instance holds the collection,
	/// `StoreError::Corrupt` if the record file and the cursor disagree.
	pub async fn open(
		root: impl AsRef<Path>,
		db_name: &str,
		collection_name: &str,
	) -> Result<Self, StoreError> {
		let dir = root.as_ref().join(db_name).join(collection_name);
		tokio::fs::create_dir_all(&dir).await?;
		let lock = CollectionLockGuard::acquire(&dir)?;

		let document = read_cursor_document(&dir.join(CURSOR_FILE)).await?;
		let committed_len = document.as_ref().map_or(0, |d| d.records_len);

		let records_path = dir.join(RECORDS_FILE);
		let records = match tokio::fs::read(&records_path).await {
			Ok(bytes) => bytes,
			Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
			Err(e) => return Err(e.into()),
		};

		let on_disk = records.len() as u64;
		if on_disk < committed_len {
			return Err(StoreError::Corrupt(format!(
				"{:?} holds {} bytes but the cursor commits {}",
				records_path, on_disk, committed_len
			)));
		}
		if on_disk > committed_len {
			warn!(
				"Discarding {} uncommitted bytes from {:?}",
				on_disk - committed_len,
				records_path
			);
			let file = tokio::fs::OpenOptions::new()
				.write(true)
				.open(&records_path)
				.await?;
			file.set_len(committed_len).await?;
			file.sync_all().await?;
		}

		let committed = usize::try_from(committed_len)
			.map_err(|_| StoreError::Corrupt("record file too large".to_string()))?;
		let index = index_records(&records[..committed])?;
		let cursor = document.map(|d| SyncCursor {
			last_persisted_height: d.last_persisted_height,
			last_persisted_id: d.last_persisted_id,
		});
		check_consistency(&index, cursor.as_ref())?;

		info!(
			"Opened block collection {:?} at height {}",
			dir,
			cursor.as_ref().map_or(0, |c| c.last_persisted_height)
		);

		Ok(Self {
			dir,
			inner: Mutex::new(FileState {
				index,
				cursor,
				records_len: committed_len,
				lock: Some(lock),
			}),
		})
	}

	/// Directory holding this collection.
	pub fn path(&self) -> &Path {
		&self.dir
	}

	async fn read_records(&self, len: u64) -> Result<Vec<u8>, StoreError> {
		let mut bytes = match tokio::fs::read(self.dir.join(RECORDS_FILE)).await {
			Ok(bytes) => bytes,
			Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
			Err(e) => return Err(e.into()),
		};
		let len = usize::try_from(len)
			.map_err(|_| StoreError::Corrupt("record file too large".to_string()))?;
		bytes.truncate(len);
		Ok(bytes)
	}

	async fn write_records(&self, offset: u64, encoded: &[u8]) -> Result<(), StoreError> {
		let mut file = tokio::fs::OpenOptions::new()
			.create(true)
			.truncate(false)
			.write(true)
			.open(self.dir.join(RECORDS_FILE))
			.await?;
		file.set_len(offset).await?;
		file.seek(SeekFrom::Start(offset)).await?;
		file.write_all(encoded).await?;
		file.flush().await?;
		file.sync_all().await?;
		Ok(())
	}

	async fn commit_cursor(&self, document: &CursorDocument) -> Result<(), StoreError> {
		let tmp_path = self.dir.join(CURSOR_TMP_FILE);
		let bytes = serde_json::to_vec_pretty(document)?;

		let mut file = tokio::fs::File::create(&tmp_path).await?;
		file.write_all(&bytes).await?;
		file.flush().await?;
		file.sync_all().await?;
		drop(file);

		tokio::fs::rename(&tmp_path, self.dir.join(CURSOR_FILE)).await?;
		Ok(())
	}
}

async fn read_cursor_document(path: &Path) -> Result<Option<CursorDocument>, StoreError> {
	match tokio::fs::read(path).await {
		Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
		Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
		Err(e) => Err(e.into()),
	}
}

fn parse_records(bytes: &[u8]) -> impl Iterator<Item = Result<StoredBlock, StoreError>> + '_ {
	bytes
		.split(|byte| *byte == b'\n')
		.filter(|line| !line.is_empty())
		.map(|line| serde_json::from_slice::<StoredBlock>(line).map_err(StoreError::from))
}

fn index_records(bytes: &[u8]) -> Result<BTreeMap<u64, String>, StoreError> {
	let mut index = BTreeMap::new();
	for stored in parse_records(bytes) {
		let stored = stored?;
		index.insert(stored.block.height, stored.block.id);
	}
	Ok(index)
}

fn check_consistency(
	index: &BTreeMap<u64, String>,
	cursor: Option<&SyncCursor>,
) -> Result<(), StoreError> {
	match (cursor, index.last_key_value()) {
		(None, None) => Ok(()),
		(Some(cursor), Some((height, id)))
			if *height == cursor.last_persisted_height
				&& *id == cursor.last_persisted_id
				&& index.len() as u64 == *height =>
		{
			Ok(())
		}
		_ => Err(StoreError::Corrupt(
			"cursor does not match the stored records".to_string(),
		)),
	}
}

#[async_trait::async_trait]
impl BlockRepository for FileBlockStore {
	async fn load_cursor(&self) -> Result<Option<SyncCursor>, StoreError> {
		let state = self.inner.lock().await;
		if state.lock.is_none() {
			return Err(StoreError::Closed);
		}
		Ok(state.cursor.clone())
	}

	async fn append_batch(&self, blocks: &[Block]) -> Result<AppendOutcome, StoreError> {
		let mut state = self.inner.lock().await;
		if state.lock.is_none() {
			return Err(StoreError::Closed);
		}

		let index = &state.index;
		let fresh = plan_append(state.cursor.as_ref(), blocks, |height| {
			index.get(&height).map(String::as_str)
		})?;
		let Some(last) = fresh.last() else {
			return Ok(AppendOutcome {
				written: 0,
				cursor: state.cursor.clone(),
			});
		};

		let mut encoded = Vec::new();
		for block in &fresh {
			serde_json::to_writer(&mut encoded, &StoredBlock::now(block.clone()))?;
			encoded.push(b'\n');
		}

		self.write_records(state.records_len, &encoded).await?;

		let records_len = state.records_len + encoded.len() as u64;
		let cursor = SyncCursor {
			last_persisted_height: last.height,
			last_persisted_id: last.id.clone(),
		};
		self.commit_cursor(&CursorDocument {
			last_persisted_height: cursor.last_persisted_height,
			last_persisted_id: cursor.last_persisted_id.clone(),
			records_len,
			updated_at: chrono::Utc::now().to_rfc3339(),
		})
		.await?;

		let written = fresh.len();
		state.records_len = records_len;
		for block in fresh {
			state.index.insert(block.height, block.id);
		}
		state.cursor = Some(cursor.clone());

		debug!(
			"Appended {} blocks to {:?}, cursor at {}",
			written, self.dir, cursor.last_persisted_height
		);
		Ok(AppendOutcome {
			written,
			cursor: Some(cursor),
		})
	}

	async fn block_id_at(&self, height: u64) -> Result<Option<String>, StoreError> {
		let state = self.inner.lock().await;
		if state.lock.is_none() {
			return Err(StoreError::Closed);
		}
		Ok(state.index.get(&height).cloned())
	}

	async fn read_range(&self, from: u64, to: u64) -> Result<Vec<StoredBlock>, StoreError> {
		let state = self.inner.lock().await;
		if state.lock.is_none() {
			return Err(StoreError::Closed);
		}
		if from > to || state.records_len == 0 {
			return Ok(Vec::new());
		}

		let bytes = self.read_records(state.records_len).await?;
		let mut blocks = Vec::new();
		for stored in parse_records(&bytes) {
			let stored = stored?;
			if stored.block.height > to {
				break;
			}
			if stored.block.height >= from {
				blocks.push(stored);
			}
		}
		Ok(blocks)
	}

	async fn close(&self) -> Result<(), StoreError> {
		let mut state = self.inner.lock().await;
		if state.lock.take().is_some() {
			info!("Closed block collection {:?}", self.dir);
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;
	use std::io::Write;

	fn block(height: u64) -> Block {
		Block::new(height, format!("id-{}", height), json!({ "txs": [height] }))
	}

	fn blocks(heights: std::ops::RangeInclusive<u64>) -> Vec<Block> {
		heights.map(block).collect()
	}

	#[tokio::test]
	async fn blocks_survive_reopen() {
		let dir = tempfile::tempdir().unwrap();
		let store = FileBlockStore::open(dir.path(), "resdb", "blocks").await.unwrap();
		store.append_batch(&blocks(1..=4)).await.unwrap();
		store.close().await.unwrap();

		let reopened = FileBlockStore::open(dir.path(), "resdb", "blocks").await.unwrap();
		let cursor = reopened.load_cursor().await.unwrap().unwrap();
		assert_eq!(cursor.last_persisted_height, 4);
		assert_eq!(cursor.last_persisted_id, "id-4");

		let stored = reopened.read_range(2, 3).await.unwrap();
		let heights: Vec<u64> = stored.iter().map(|s| s.block.height).collect();
		assert_eq!(heights, vec![2, 3]);
		assert_eq!(stored[0].block.payload, json!({ "txs": [2] }));
	}

	#[tokio::test]
	async fn reappending_is_idempotent() {
		let dir = tempfile::tempdir().unwrap();
		let store = FileBlockStore::open(dir.path(), "resdb", "blocks").await.unwrap();
		store.append_batch(&blocks(1..=3)).await.unwrap();
		let outcome = store.append_batch(&blocks(1..=3)).await.unwrap();

		assert_eq!(outcome.written, 0);
		assert_eq!(store.read_range(1, 10).await.unwrap().len(), 3);
	}

	#[tokio::test]
	async fn conflicts_leave_the_files_untouched() {
		let dir = tempfile::tempdir().unwrap();
		let store = FileBlockStore::open(dir.path(), "resdb", "blocks").await.unwrap();
		store.append_batch(&blocks(1..=2)).await.unwrap();
		let records = store.path().join(RECORDS_FILE);
		let before = std::fs::read(&records).unwrap();

		assert!(store.append_batch(&blocks(4..=6)).await.unwrap_err().is_conflict());
		let mut forked = blocks(2..=3);
		forked[0].id = "fork-2".to_string();
		assert!(store.append_batch(&forked).await.unwrap_err().is_conflict());

		assert_eq!(std::fs::read(&records).unwrap(), before);
	}

	#[tokio::test]
	async fn uncommitted_tail_is_discarded_on_open() {
		let dir = tempfile::tempdir().unwrap();
		let store = FileBlockStore::open(dir.path(), "resdb", "blocks").await.unwrap();
		store.append_batch(&blocks(1..=2)).await.unwrap();
		let records = store.path().join(RECORDS_FILE);
		store.close().await.unwrap();

		// A batch whose cursor commit never happened, cut mid-line.
		let mut file = std::fs::OpenOptions::new().append(true).open(&records).unwrap();
		let torn = serde_json::to_string(&StoredBlock::now(block(3))).unwrap();
		writeln!(file, "{}", torn).unwrap();
		write!(file, "{{\"height\":4,\"id\"").unwrap();
		drop(file);

		let reopened = FileBlockStore::open(dir.path(), "resdb", "blocks").await.unwrap();
		assert_eq!(
			reopened.load_cursor().await.unwrap().unwrap().last_persisted_height,
			2
		);
		assert_eq!(reopened.block_id_at(3).await.unwrap(), None);

		reopened.append_batch(&blocks(3..=3)).await.unwrap();
		assert_eq!(reopened.read_range(1, 10).await.unwrap().len(), 3);
	}

	#[tokio::test]
	async fn collection_is_exclusive_until_closed() {
		let dir = tempfile::tempdir().unwrap();
		let first = FileBlockStore::open(dir.path(), "resdb", "blocks").await.unwrap();

		let second = FileBlockStore::open(dir.path(), "resdb", "blocks").await;
		assert!(matches!(second, Err(StoreError::Locked(_))));

		first.close().await.unwrap();
		assert!(matches!(first.load_cursor().await, Err(StoreError::Closed)));
		FileBlockStore::open(dir.path(), "resdb", "blocks").await.unwrap();
	}
}
