//! The synchronization loop.
//!
//! One `Reconciler` runs per cache as a single tokio task and is the only writer to the store.
//! A session opens the live subscription, catches up from the persisted cursor through historical
//! fetches while buffering live blocks, then tails the live stream. Blocks are accepted strictly
//! in height order: a live block above `cursor + 1` triggers a scoped recovery fetch, a block at
//! or below the cursor is compared against the stored id and either discarded or reported as a
//! reorg. Any transport or store failure ends the session; the loop backs off and starts a new
//! one from the cursor reloaded from the store.

use super::events::{CacheEvent, EventDispatcher};
use super::progress_tracker::{SyncProgressTracker, SyncStats};
use super::retry::RetryPolicy;
use super::types::{CacheError, SyncFailure, SyncState};
use crate::config::SyncOptions;
use crate::ledger::{Block, BlockStream, LedgerError, LedgerSource};
use crate::store::{BlockRepository, StoreError, height_span};
use futures_util::StreamExt;
use std::collections::{BTreeMap, VecDeque};
use std::convert::Infallible;
use std::future::Future;
use std::mem;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Why a session stopped making progress.
enum Interrupt {
	/// `close()` was called.
	Cancelled,
	Failed(CacheError),
}

impl From<CacheError> for Interrupt {
	fn from(error: CacheError) -> Self {
		Interrupt::Failed(error)
	}
}

impl From<LedgerError> for Interrupt {
	fn from(error: LedgerError) -> Self {
		Interrupt::Failed(error.into())
	}
}

impl From<StoreError> for Interrupt {
	fn from(error: StoreError) -> Self {
		Interrupt::Failed(error.into())
	}
}

type Step<T> = Result<T, Interrupt>;

/// Height of the first block of the chain; the cursor of an empty store is one below it.
const FIRST_HEIGHT: u64 = 1;

/// Await `fut` unless the token is cancelled first.
async fn guarded<T, E, F>(cancel: &CancellationToken, fut: F) -> Step<T>
where
	F: Future<Output = Result<T, E>>,
	Interrupt: From<E>,
{
	tokio::select! {
		biased;
		_ = cancel.cancelled() => Err(Interrupt::Cancelled),
		result = fut => result.map_err(Interrupt::from),
	}
}

async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T, LedgerError>
where
	F: Future<Output = T>,
{
	tokio::time::timeout(limit, fut)
		.await
		.map_err(|_| LedgerError::Timeout(limit))
}

/// Live blocks received but not yet accepted, by height.
///
/// Several ids may be buffered for one height; the first one wins and the others surface as
/// reorgs once it is persisted.
#[derive(Default)]
struct LiveBuffer {
	blocks: BTreeMap<u64, VecDeque<Block>>,
}

impl LiveBuffer {
	/// Returns false if the same block is already buffered.
	fn push(&mut self, block: Block) -> bool {
		let entry = self.blocks.entry(block.height).or_default();
		if entry.iter().any(|buffered| buffered.id == block.id) {
			return false;
		}
		entry.push_back(block);
		true
	}

	fn first_height(&self) -> Option<u64> {
		self.blocks.keys().next().copied()
	}

	fn pop_first(&mut self) -> Option<Block> {
		let mut entry = self.blocks.first_entry()?;
		let block = entry.get_mut().pop_front();
		if entry.get().is_empty() {
			entry.remove();
		}
		block
	}

	fn pop_at(&mut self, height: u64) -> Option<Block> {
		match self.blocks.first_key_value() {
			Some((first, _)) if *first == height => self.pop_first(),
			_ => None,
		}
	}

	fn len(&self) -> usize {
		self.blocks.values().map(VecDeque::len).sum()
	}

	fn clear(&mut self) {
		self.blocks.clear();
	}
}

pub(crate) struct Reconciler {
	ledger: Arc<dyn LedgerSource>,
	store: Arc<dyn BlockRepository>,
	dispatcher: EventDispatcher,
	options: SyncOptions,
	cancel: CancellationToken,
	state: Arc<watch::Sender<SyncState>>,
	stats: Arc<watch::Sender<SyncStats>>,
	progress: Option<SyncProgressTracker>,
	retry: RetryPolicy,
	/// Highest persisted height, 0 for an empty store.
	cursor: u64,
	buffer: LiveBuffer,
}

impl Reconciler {
	pub(crate) fn new(
		ledger: Arc<dyn LedgerSource>,
		store: Arc<dyn BlockRepository>,
		dispatcher: EventDispatcher,
		options: SyncOptions,
		cancel: CancellationToken,
		state: Arc<watch::Sender<SyncState>>,
		stats: Arc<watch::Sender<SyncStats>>,
	) -> Self {
		let retry = RetryPolicy::new(&options);
		Self {
			ledger,
			store,
			dispatcher,
			options,
			cancel,
			state,
			stats,
			progress: None,
			retry,
			cursor: 0,
			buffer: LiveBuffer::default(),
		}
	}

	/// Run sessions until cancelled.
	pub(crate) async fn run(mut self) {
		info!("Starting block synchronization from {}", self.ledger.name());

		loop {
			let error = match self.run_session().await {
				Ok(never) => match never {},
				Err(Interrupt::Cancelled) => break,
				Err(Interrupt::Failed(error)) => error,
			};
			if let Err(Interrupt::Cancelled) = self.back_off(error).await {
				break;
			}
		}

		if let Some(progress) = self.progress.as_mut() {
			progress.log_progress(true);
			info!("{}", progress.get_stats().summary());
		}
		info!("Block synchronization stopped at height {}", self.cursor);
	}

	async fn run_session(&mut self) -> Step<Infallible> {
		self.set_state(SyncState::CatchingUp);
		self.buffer.clear();

		let cursor = guarded(&self.cancel, self.store.load_cursor()).await?;
		self.cursor = cursor.map_or(0, |c| c.last_persisted_height);
		let cursor = self.cursor;
		self.progress
			.get_or_insert_with(|| SyncProgressTracker::new(cursor))
			.record_connection();

		let request_timeout = self.options.request_timeout;
		let mut live = guarded(
			&self.cancel,
			bounded(request_timeout, self.ledger.subscribe_live()),
		)
		.await?
		.map_err(Interrupt::from)?;

		info!(
			"Live subscription to {} open, catching up from height {}",
			self.ledger.name(),
			self.cursor
		);
		self.publish_stats();
		self.dispatcher.dispatch(&CacheEvent::Connected);

		self.catch_up(&mut live, None).await?;
		self.set_state(SyncState::Live);
		info!(
			"Caught up at height {} with {} live blocks buffered",
			self.cursor,
			self.buffer.len()
		);

		self.tail(&mut live).await
	}

	/// Persist historical blocks above the cursor, up to `upper` if given, while buffering
	/// live blocks.
	async fn catch_up(&mut self, live: &mut BlockStream, upper: Option<u64>) -> Step<()> {
		let cancel = self.cancel.clone();
		let request_timeout = self.options.request_timeout;
		let mut fetch = self.ledger.fetch_range(self.cursor, upper);
		let mut pending: Vec<Block> = Vec::new();
		// Only fetched blocks push the deadline out; live traffic does not.
		let stall = tokio::time::sleep(request_timeout);
		tokio::pin!(stall);

		loop {
			tokio::select! {
				biased;
				_ = cancel.cancelled() => return Err(Interrupt::Cancelled),
				item = fetch.next() => match item {
					Some(Ok(block)) => {
						self.stage(block, &mut pending).await?;
						stall.as_mut().reset(Instant::now() + request_timeout);
					}
					None => break,
					Some(Err(error)) => return self.abort_catch_up(pending, error).await,
				},
				_ = &mut stall => {
					let timeout = LedgerError::Timeout(request_timeout);
					return self.abort_catch_up(pending, timeout).await;
				}
				item = live.next() => match item {
					Some(Ok(block)) => self.buffer_live(block),
					Some(Err(error)) => return self.abort_catch_up(pending, error).await,
					None => return self.abort_catch_up(pending, LedgerError::Disconnected).await,
				},
			}
		}

		self.flush(&mut pending).await
	}

	/// Keep what was already fetched, then fail the session.
	async fn abort_catch_up(&mut self, mut pending: Vec<Block>, error: LedgerError) -> Step<()> {
		self.flush(&mut pending).await?;
		Err(error.into())
	}

	/// Queue a fetched block for persistence.
	async fn stage(&mut self, block: Block, pending: &mut Vec<Block>) -> Step<()> {
		let expected = pending.last().map_or(self.cursor, |b| b.height) + 1;

		if block.height < expected {
			let accepted = pending
				.iter()
				.find(|p| p.height == block.height)
				.map(|p| p.id.clone());
			return self.check_stale(&block, accepted).await;
		}
		if block.height > expected {
			return Err(LedgerError::ProtocolError(format!(
				"historical fetch skipped from height {} to {}",
				expected, block.height
			))
			.into());
		}

		pending.push(block);
		if pending.len() >= self.options.batch_size {
			self.flush(pending).await?;
		}
		Ok(())
	}

	async fn flush(&mut self, pending: &mut Vec<Block>) -> Step<()> {
		if pending.is_empty() {
			return Ok(());
		}
		self.persist(mem::take(pending)).await
	}

	/// Append a contiguous batch, retrying store failures in place.
	///
	/// Conflicts are not retried: the store no longer agrees with the cursor, so the session
	/// ends and the next one reloads it.
	async fn persist(&mut self, batch: Vec<Block>) -> Step<()> {
		loop {
			let error = match guarded(&self.cancel, self.store.append_batch(&batch)).await {
				Ok(outcome) => {
					let previous = self.cursor;
					if let Some(cursor) = outcome.cursor {
						self.cursor = cursor.last_persisted_height;
					}
					let cursor = self.cursor;
					let fresh: Vec<Block> = batch
						.into_iter()
						.filter(|b| b.height > previous && b.height <= cursor)
						.collect();

					if let Some(progress) = self.progress.as_mut() {
						progress.record_batch(outcome.written, cursor);
						progress.log_progress(false);
					}
					if fresh.is_empty() {
						return Ok(());
					}

					debug!("Persisted blocks {}", height_span(&fresh));
					self.retry.reset();
					self.publish_stats();
					self.dispatcher.dispatch(&CacheEvent::Data(fresh));
					return Ok(());
				}
				Err(Interrupt::Failed(CacheError::StoreError(error))) if !error.is_conflict() => {
					CacheError::from(error)
				}
				Err(other) => return Err(other),
			};
			self.back_off(error).await?;
		}
	}

	/// Handle a block at or below the accepted height. `accepted` is the id of a pending block at
	/// that height, if any; otherwise the store is consulted.
	async fn check_stale(&mut self, block: &Block, accepted: Option<String>) -> Step<()> {
		if block.height < FIRST_HEIGHT {
			warn!(
				"Discarding block {} at height {}: heights start at {}",
				block.id, block.height, FIRST_HEIGHT
			);
			return Ok(());
		}

		let accepted = match accepted {
			Some(id) => id,
			None => guarded(&self.cancel, self.store.block_id_at(block.height))
				.await?
				.ok_or_else(|| {
					StoreError::Corrupt(format!(
						"no stored block at height {} below cursor {}",
						block.height, self.cursor
					))
				})?,
		};

		if accepted == block.id {
			if let Some(progress) = self.progress.as_mut() {
				progress.record_duplicate();
			}
			return Ok(());
		}

		let error = CacheError::ReorgDetected {
			height: block.height,
			stored_id: accepted,
			incoming_id: block.id.clone(),
		};
		warn!("{}", error);
		if let Some(progress) = self.progress.as_mut() {
			progress.record_reorg();
		}
		self.publish_stats();
		self.report(&error, 0);
		Ok(())
	}

	fn buffer_live(&mut self, block: Block) {
		if !self.buffer.push(block) {
			if let Some(progress) = self.progress.as_mut() {
				progress.record_duplicate();
			}
		}
	}

	async fn tail(&mut self, live: &mut BlockStream) -> Step<Infallible> {
		loop {
			self.drain_buffer(live).await?;

			let block = self.next_live(live).await?;
			self.buffer_live(block);
			if !self.options.coalesce_window.is_zero() {
				self.coalesce(live).await?;
			}
		}
	}

	async fn next_live(&mut self, live: &mut BlockStream) -> Step<Block> {
		let item = match self.options.live_idle_timeout {
			Some(idle) => guarded(&self.cancel, bounded(idle, live.next())).await?,
			None => {
				let next = async { Ok::<_, LedgerError>(live.next().await) };
				guarded(&self.cancel, next).await?
			}
		};
		match item {
			Some(Ok(block)) => Ok(block),
			Some(Err(error)) => Err(error.into()),
			None => Err(LedgerError::Disconnected.into()),
		}
	}

	/// Collect further live blocks for up to `coalesce_window`, at most one batch.
	async fn coalesce(&mut self, live: &mut BlockStream) -> Step<()> {
		let cancel = self.cancel.clone();
		let deadline = Instant::now() + self.options.coalesce_window;

		while self.buffer.len() < self.options.batch_size {
			tokio::select! {
				biased;
				_ = cancel.cancelled() => return Err(Interrupt::Cancelled),
				_ = tokio::time::sleep_until(deadline) => break,
				item = live.next() => match item {
					Some(Ok(block)) => self.buffer_live(block),
					Some(Err(error)) => return Err(error.into()),
					None => return Err(LedgerError::Disconnected.into()),
				},
			}
		}
		Ok(())
	}

	/// Accept buffered live blocks in height order, recovering gaps on the way.
	async fn drain_buffer(&mut self, live: &mut BlockStream) -> Step<()> {
		while let Some(height) = self.buffer.first_height() {
			let expected = self.cursor + 1;

			// The revealing blocks stay buffered in arrival order while the gap is fetched.
			if height > expected {
				self.recover(live, height - 1).await?;
				continue;
			}

			let Some(block) = self.buffer.pop_first() else {
				break;
			};
			if block.height < expected {
				self.check_stale(&block, None).await?;
				continue;
			}

			let mut batch = vec![block];
			while batch.len() < self.options.batch_size {
				let next = batch[batch.len() - 1].height + 1;
				match self.buffer.pop_at(next) {
					Some(block) => batch.push(block),
					None => break,
				}
			}
			self.persist(batch).await?;
		}
		Ok(())
	}

	/// Fetch the missing heights up to `gap_height`.
	async fn recover(&mut self, live: &mut BlockStream, gap_height: u64) -> Step<()> {
		let before = self.cursor;
		info!(
			"Gap detected after height {}, recovering up to {}",
			before, gap_height
		);
		self.set_state(SyncState::Recovering);
		if let Some(progress) = self.progress.as_mut() {
			progress.record_gap();
		}

		self.catch_up(live, Some(gap_height)).await?;
		self.set_state(SyncState::Live);

		if self.cursor == before {
			return Err(CacheError::RecoveryStalled {
				cursor: before,
				gap_height,
			}
			.into());
		}
		Ok(())
	}

	/// Count a failure, report it when due and wait out the backoff delay.
	async fn back_off(&mut self, error: CacheError) -> Step<()> {
		let step = self.retry.record_failure();
		warn!(
			"Sync attempt {} failed: {}. Retrying in {:?}",
			step.attempt, error, step.delay
		);
		if step.report || error.kind().always_reported() {
			self.report(&error, step.attempt);
		}

		tokio::select! {
			biased;
			_ = self.cancel.cancelled() => Err(Interrupt::Cancelled),
			_ = tokio::time::sleep(step.delay) => Ok(()),
		}
	}

	fn report(&self, error: &CacheError, attempts: u32) {
		let failure = SyncFailure::from_error(error, attempts);
		self.dispatcher.dispatch(&CacheEvent::Error(failure));
	}

	fn set_state(&self, state: SyncState) {
		let previous = self.state.send_replace(state);
		if previous != state {
			debug!("Sync state {} -> {}", previous, state);
		}
	}

	fn publish_stats(&self) {
		if let Some(progress) = &self.progress {
			self.stats.send_replace(progress.get_stats());
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::Value;

	fn block(height: u64, id: &str) -> Block {
		Block::new(height, id, Value::Null)
	}

	#[test]
	fn live_buffer_orders_by_height_and_skips_duplicates() {
		let mut buffer = LiveBuffer::default();
		assert!(buffer.push(block(5, "e")));
		assert!(buffer.push(block(3, "c")));
		assert!(!buffer.push(block(3, "c")));
		assert!(buffer.push(block(3, "c-fork")));
		assert_eq!(buffer.len(), 3);

		let order: Vec<String> = std::iter::from_fn(|| buffer.pop_first())
			.map(|b| b.id)
			.collect();
		assert_eq!(order, vec!["c", "c-fork", "e"]);
	}

	#[test]
	fn pop_at_only_takes_the_requested_height() {
		let mut buffer = LiveBuffer::default();
		buffer.push(block(7, "g"));

		assert!(buffer.pop_at(6).is_none());
		assert_eq!(buffer.pop_at(7).map(|b| b.id).as_deref(), Some("g"));
		assert_eq!(buffer.len(), 0);
	}

	#[test]
	fn first_height_leaves_the_arrival_order_intact() {
		let mut buffer = LiveBuffer::default();
		buffer.push(block(5, "five-first"));
		buffer.push(block(5, "five-second"));

		assert_eq!(buffer.first_height(), Some(5));
		assert_eq!(buffer.first_height(), Some(5));
		assert_eq!(buffer.pop_first().map(|b| b.id).as_deref(), Some("five-first"));
		assert_eq!(buffer.pop_first().map(|b| b.id).as_deref(), Some("five-second"));
		assert_eq!(buffer.first_height(), None);
	}
}
