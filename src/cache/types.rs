use crate::config::ConfigError;
use crate::ledger::LedgerError;
use crate::store::StoreError;
use serde::Serialize;
use std::fmt;

/// Errors of the block cache
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
	#[error("Ledger error: {0}")]
	LedgerError(#[from] LedgerError),

	#[error("Store error: {0}")]
	StoreError(#[from] StoreError),

	#[error("Configuration error: {0}")]
	ConfigError(#[from] ConfigError),

	#[error("Reorg detected at height {height}: stored {stored_id}, ledger offered {incoming_id}")]
	ReorgDetected {
		height: u64,
		stored_id: String,
		incoming_id: String,
	},

	#[error("Cache is already initialized")]
	AlreadyInitialized,

	#[error("Cache is closed")]
	Closed,

	#[error("Initialization error: {0}")]
	InitializationError(String),

	#[error("Recovery stalled at height {cursor} while filling up to {gap_height}")]
	RecoveryStalled { cursor: u64, gap_height: u64 },
}

impl CacheError {
	/// Category of this error as reported in `error` events.
	pub fn kind(&self) -> ErrorKind {
		match self {
			CacheError::LedgerError(e) if e.is_not_found() => ErrorKind::NotFound,
			CacheError::LedgerError(_) | CacheError::RecoveryStalled { .. } => ErrorKind::Transport,
			CacheError::StoreError(e) if e.is_conflict() => ErrorKind::SequenceConflict,
			CacheError::StoreError(_) => ErrorKind::Persistence,
			CacheError::ConfigError(_) => ErrorKind::Config,
			CacheError::ReorgDetected { .. } => ErrorKind::ReorgDetected,
			CacheError::AlreadyInitialized => ErrorKind::AlreadyInitialized,
			CacheError::Closed => ErrorKind::Closed,
			CacheError::InitializationError(_) => ErrorKind::Initialization,
		}
	}
}

/// Failure categories surfaced to the embedding application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
	Transport,
	NotFound,
	SequenceConflict,
	ReorgDetected,
	Persistence,
	Config,
	AlreadyInitialized,
	Closed,
	Initialization,
}

impl ErrorKind {
	pub fn as_str(&self) -> &'static str {
		match self {
			ErrorKind::Transport => "TransportError",
			ErrorKind::NotFound => "NotFoundError",
			ErrorKind::SequenceConflict => "SequenceConflictError",
			ErrorKind::ReorgDetected => "ReorgDetectedError",
			ErrorKind::Persistence => "PersistenceError",
			ErrorKind::Config => "ConfigError",
			ErrorKind::AlreadyInitialized => "AlreadyInitializedError",
			ErrorKind::Closed => "ClosedError",
			ErrorKind::Initialization => "InitializationError",
		}
	}

	/// Whether every occurrence is reported, regardless of the retry count.
	pub fn always_reported(&self) -> bool {
		matches!(
			self,
			ErrorKind::NotFound | ErrorKind::SequenceConflict | ErrorKind::ReorgDetected
		)
	}
}

impl fmt::Display for ErrorKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Payload of an `error` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncFailure {
	pub kind: ErrorKind,
	pub message: String,
	/// Consecutive failed attempts at the time of the report; 0 for conditions that are not retried
	/// as such (reorgs).
	pub attempts: u32,
}

impl SyncFailure {
	pub fn from_error(error: &CacheError, attempts: u32) -> Self {
		Self {
			kind: error.kind(),
			message: error.to_string(),
			attempts,
		}
	}
}

impl fmt::Display for SyncFailure {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{} after {} attempts: {}", self.kind, self.attempts, self.message)
	}
}

/// Phase of the synchronization loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SyncState {
	/// Constructed, not yet initialized.
	Idle,
	CatchingUp,
	Live,
	Recovering,
	/// Terminal, reached only through `close()`.
	Stopped,
}

impl SyncState {
	pub fn as_str(&self) -> &'static str {
		match self {
			SyncState::Idle => "IDLE",
			SyncState::CatchingUp => "CATCHING_UP",
			SyncState::Live => "LIVE",
			SyncState::Recovering => "RECOVERING",
			SyncState::Stopped => "STOPPED",
		}
	}
}

impl fmt::Display for SyncState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}
