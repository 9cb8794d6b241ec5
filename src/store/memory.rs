use super::repositories::{
	AppendOutcome, BlockRepository, StoreError, StoredBlock, SyncCursor, plan_append,
};
use crate::ledger::Block;
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use tracing::debug;

/// Process-local implementation of BlockRepository
#[derive(Default)]
pub struct MemoryBlockStore {
	inner: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
	blocks: BTreeMap<u64, StoredBlock>,
	closed: bool,
}

impl MemoryState {
	fn cursor(&self) -> Option<SyncCursor> {
		self.blocks.last_key_value().map(|(height, stored)| SyncCursor {
			last_persisted_height: *height,
			last_persisted_id: stored.block.id.clone(),
		})
	}

	fn ensure_open(&self) -> Result<(), StoreError> {
		if self.closed {
			return Err(StoreError::Closed);
		}
		Ok(())
	}
}

impl MemoryBlockStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait::async_trait]
impl BlockRepository for MemoryBlockStore {
	async fn load_cursor(&self) -> Result<Option<SyncCursor>, StoreError> {
		let state = self.inner.lock().await;
		state.ensure_open()?;
		Ok(state.cursor())
	}

	async fn append_batch(&self, blocks: &[Block]) -> Result<AppendOutcome, StoreError> {
		let mut state = self.inner.lock().await;
		state.ensure_open()?;

		let cursor = state.cursor();
		let stored_blocks = &state.blocks;
		let fresh = plan_append(cursor.as_ref(), blocks, |height| {
			stored_blocks.get(&height).map(|stored| stored.block.id.as_str())
		})?;

		let written = fresh.len();
		for block in fresh {
			state.blocks.insert(block.height, StoredBlock::now(block));
		}

		let cursor = state.cursor();
		debug!(
			"Memory store appended {} blocks, cursor at {:?}",
			written,
			cursor.as_ref().map(|c| c.last_persisted_height)
		);
		Ok(AppendOutcome { written, cursor })
	}

	async fn block_id_at(&self, height: u64) -> Result<Option<String>, StoreError> {
		let state = self.inner.lock().await;
		state.ensure_open()?;
		Ok(state.blocks.get(&height).map(|stored| stored.block.id.clone()))
	}

	async fn read_range(&self, from: u64, to: u64) -> Result<Vec<StoredBlock>, StoreError> {
		let state = self.inner.lock().await;
		state.ensure_open()?;
		if from > to {
			return Ok(Vec::new());
		}
		Ok(state.blocks.range(from..=to).map(|(_, stored)| stored.clone()).collect())
	}

	async fn close(&self) -> Result<(), StoreError> {
		self.inner.lock().await.closed = true;
		Ok(())
	}
}
