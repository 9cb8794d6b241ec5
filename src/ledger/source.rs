use super::types::{Block, LedgerError};
use futures::Stream;
use std::pin::Pin;

/// Ordered stream of blocks coming from a ledger node.
pub type BlockStream = Pin<Box<dyn Stream<Item = Result<Block, LedgerError>> + Send>>;

/// The two channels the cache reads from a ledger node.
///
/// Implementations do not retry; retry policy belongs to the synchronization loop.
#[async_trait::async_trait]
pub trait LedgerSource: Send + Sync {
	/// Historical blocks with `from_height_exclusive < height <= to_height_inclusive`, ascending.
	///
	/// The stream is lazy and may be dropped at any point. `None` as the upper bound reads up to
	/// the node's current head. Fails with `LedgerError::NotFound` when the node no longer
	/// retains the requested history.
	fn fetch_range(&self, from_height_exclusive: u64, to_height_inclusive: Option<u64>)
	-> BlockStream;

	/// Open a live subscription. Resolves once the connection is confirmed open.
	///
	/// The returned stream ends, or yields an error, when the connection drops. Each block is
	/// delivered at most once per subscription.
	async fn subscribe_live(&self) -> Result<BlockStream, LedgerError>;

	/// Get the name of this source for logging
	fn name(&self) -> &'static str;
}
