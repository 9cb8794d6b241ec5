#![allow(dead_code)]

use futures::channel::mpsc;
use futures::{StreamExt, stream};
use resilient_block_cache::{
	AppendOutcome, Block, BlockRepository, BlockStream, CacheEvent, EventKind, LedgerError,
	LedgerSource, MemoryBlockStore, ResilientCache, StoreError, StoredBlock, SyncCursor,
	SyncFailure, SyncOptions,
};
use serde_json::json;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

pub fn block(height: u64) -> Block {
	Block::new(height, format!("block-{}", height), json!({ "txs": [height] }))
}

pub fn blocks(heights: std::ops::RangeInclusive<u64>) -> Vec<Block> {
	heights.map(block).collect()
}

pub fn fast_options() -> SyncOptions {
	SyncOptions {
		backoff_initial: Duration::from_millis(10),
		backoff_max: Duration::from_millis(50),
		backoff_jitter: 0.0,
		error_report_threshold: 3,
		request_timeout: Duration::from_secs(2),
		..SyncOptions::default()
	}
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn eventually<F: Fn() -> bool>(what: &str, condition: F) {
	let deadline = Instant::now() + Duration::from_secs(5);
	while !condition() {
		assert!(Instant::now() < deadline, "timed out waiting for {}", what);
		tokio::time::sleep(Duration::from_millis(5)).await;
	}
}

type LiveSender = mpsc::UnboundedSender<Result<Block, LedgerError>>;

#[derive(Default)]
struct LedgerState {
	chain: BTreeMap<u64, Block>,
	subscribers: Vec<LiveSender>,
	/// Delivered right after the next successful subscription.
	queued_live: VecDeque<Block>,
	/// Subscription attempts left to refuse.
	refuse_subscriptions: usize,
	/// Lowest height still served by historical fetches.
	retained_from: Option<u64>,
	/// Historical fetches never yield.
	stalled: bool,
	subscriptions: usize,
	fetches: Vec<(u64, Option<u64>)>,
}

/// In-process ledger node driven by the test.
#[derive(Clone, Default)]
pub struct ScriptedLedger {
	state: Arc<Mutex<LedgerState>>,
}

impl ScriptedLedger {
	pub fn with_chain(chain: Vec<Block>) -> Self {
		let ledger = Self::default();
		ledger.extend_chain(chain);
		ledger
	}

	/// Add blocks to the history without announcing them live.
	pub fn extend_chain(&self, blocks: Vec<Block>) {
		let mut state = self.state.lock().unwrap();
		for block in blocks {
			state.chain.insert(block.height, block);
		}
	}

	/// Produce a block: add it to the history and push it to live subscribers.
	pub fn produce(&self, block: Block) {
		self.state
			.lock()
			.unwrap()
			.chain
			.insert(block.height, block.clone());
		self.push_live(block);
	}

	/// Push a block to live subscribers only.
	pub fn push_live(&self, block: Block) {
		let mut state = self.state.lock().unwrap();
		state
			.subscribers
			.retain(|sender| sender.unbounded_send(Ok(block.clone())).is_ok());
	}

	pub fn queue_live_on_subscribe(&self, blocks: Vec<Block>) {
		self.state.lock().unwrap().queued_live.extend(blocks);
	}

	pub fn refuse_subscriptions(&self, attempts: usize) {
		self.state.lock().unwrap().refuse_subscriptions = attempts;
	}

	pub fn prune_below(&self, height: u64) {
		self.state.lock().unwrap().retained_from = Some(height);
	}

	pub fn stall_fetches(&self) {
		self.state.lock().unwrap().stalled = true;
	}

	/// Drop every live connection.
	pub fn disconnect(&self) {
		self.state.lock().unwrap().subscribers.clear();
	}

	pub fn subscriptions(&self) -> usize {
		self.state.lock().unwrap().subscriptions
	}

	pub fn live_connections(&self) -> usize {
		let mut state = self.state.lock().unwrap();
		state.subscribers.retain(|sender| !sender.is_closed());
		state.subscribers.len()
	}

	pub fn fetches(&self) -> Vec<(u64, Option<u64>)> {
		self.state.lock().unwrap().fetches.clone()
	}
}

#[async_trait::async_trait]
impl LedgerSource for ScriptedLedger {
	fn fetch_range(&self, from_height_exclusive: u64, to_height_inclusive: Option<u64>) -> BlockStream {
		let mut state = self.state.lock().unwrap();
		state.fetches.push((from_height_exclusive, to_height_inclusive));

		if state.stalled {
			return stream::pending().boxed();
		}

		if let Some(retained_from) = state.retained_from {
			if from_height_exclusive + 1 < retained_from {
				return stream::once(async move {
					Err(LedgerError::NotFound {
						from_height: from_height_exclusive,
					})
				})
				.boxed();
			}
		}

		let upper = to_height_inclusive.unwrap_or(u64::MAX);
		let blocks: Vec<Block> = state
			.chain
			.range(from_height_exclusive + 1..=upper)
			.map(|(_, block)| block.clone())
			.collect();

		// One scheduling point per block, so live traffic interleaves with the fetch.
		stream::iter(blocks)
			.then(|block| async move {
				tokio::task::yield_now().await;
				Ok(block)
			})
			.boxed()
	}

	async fn subscribe_live(&self) -> Result<BlockStream, LedgerError> {
		let mut state = self.state.lock().unwrap();
		if state.refuse_subscriptions > 0 {
			state.refuse_subscriptions -= 1;
			return Err(LedgerError::Disconnected);
		}

		let (sender, receiver) = mpsc::unbounded();
		for block in state.queued_live.drain(..) {
			let _ = sender.unbounded_send(Ok(block));
		}
		state.subscribers.push(sender);
		state.subscriptions += 1;
		Ok(receiver.boxed())
	}

	fn name(&self) -> &'static str {
		"scripted-ledger"
	}
}

/// Memory store whose first appends fail.
pub struct FlakyStore {
	inner: MemoryBlockStore,
	failures_left: AtomicUsize,
	append_calls: AtomicUsize,
}

impl FlakyStore {
	pub fn failing(times: usize) -> Self {
		Self {
			inner: MemoryBlockStore::new(),
			failures_left: AtomicUsize::new(times),
			append_calls: AtomicUsize::new(0),
		}
	}

	pub fn append_calls(&self) -> usize {
		self.append_calls.load(Ordering::SeqCst)
	}
}

#[async_trait::async_trait]
impl BlockRepository for FlakyStore {
	async fn load_cursor(&self) -> Result<Option<SyncCursor>, StoreError> {
		self.inner.load_cursor().await
	}

	async fn append_batch(&self, blocks: &[Block]) -> Result<AppendOutcome, StoreError> {
		self.append_calls.fetch_add(1, Ordering::SeqCst);
		let failing = self
			.failures_left
			.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
			.is_ok();
		if failing {
			return Err(StoreError::IoError(std::io::Error::other("disk unavailable")));
		}
		self.inner.append_batch(blocks).await
	}

	async fn block_id_at(&self, height: u64) -> Result<Option<String>, StoreError> {
		self.inner.block_id_at(height).await
	}

	async fn read_range(&self, from: u64, to: u64) -> Result<Vec<StoredBlock>, StoreError> {
		self.inner.read_range(from, to).await
	}

	async fn close(&self) -> Result<(), StoreError> {
		self.inner.close().await
	}
}

/// Records every event a cache emits.
#[derive(Clone, Default)]
pub struct Recorder {
	events: Arc<Mutex<Vec<CacheEvent>>>,
}

impl Recorder {
	pub fn attach(cache: &ResilientCache) -> Self {
		let recorder = Self::default();
		for kind in [
			EventKind::Connected,
			EventKind::Data,
			EventKind::Error,
			EventKind::Closed,
		] {
			let events = Arc::clone(&recorder.events);
			cache.on(kind, move |event| events.lock().unwrap().push(event.clone()));
		}
		recorder
	}

	pub fn events(&self) -> Vec<CacheEvent> {
		self.events.lock().unwrap().clone()
	}

	pub fn count(&self, kind: EventKind) -> usize {
		self.events().iter().filter(|e| e.kind() == kind).count()
	}

	/// Heights of each `data` event, in emission order.
	pub fn data_batches(&self) -> Vec<Vec<u64>> {
		self.events()
			.into_iter()
			.filter_map(|event| match event {
				CacheEvent::Data(blocks) => Some(blocks.iter().map(|b| b.height).collect()),
				_ => None,
			})
			.collect()
	}

	pub fn data_heights(&self) -> Vec<u64> {
		self.data_batches().into_iter().flatten().collect()
	}

	pub fn last_data_height(&self) -> Option<u64> {
		self.data_heights().last().copied()
	}

	pub fn errors(&self) -> Vec<SyncFailure> {
		self.events()
			.into_iter()
			.filter_map(|event| match event {
				CacheEvent::Error(failure) => Some(failure),
				_ => None,
			})
			.collect()
	}
}

pub async fn stored_heights(store: &dyn BlockRepository) -> Vec<u64> {
	store
		.read_range(1, u64::MAX)
		.await
		.unwrap()
		.into_iter()
		.map(|stored| stored.block.height)
		.collect()
}
