//! A local cache of ResilientDB ledger blocks that stays consistent with the node across
//! disconnects, restarts and gaps in the live stream.

pub mod cache;
pub mod config;
pub mod ledger;
pub mod store;

pub use cache::{
	CacheError, CacheEvent, ErrorKind, EventKind, HandlerId, ResilientCache, SyncFailure,
	SyncState, SyncStats,
};
pub use config::{CacheSettings, ConfigError, LedgerConfig, StoreConfig, SyncOptions};
pub use ledger::{Block, BlockStream, LedgerError, LedgerSource, ResilientDbClient};
pub use store::{
	AppendOutcome, BlockRepository, FileBlockStore, MemoryBlockStore, MongoBlockStore, StoreError,
	StoredBlock, SyncCursor,
};
