//! Block Cache Synchronization Module
//!
//! This module keeps a local block store consistent with a ledger node. It is composed of:
//!
//! - `orchestrator`: `ResilientCache`, the lifecycle controller (`initialize`, `close`, `on`).
//! - `reconciler`: The single control loop merging historical catch-up and the live stream into one ordered, deduplicated sequence.
//! - `events`: Event kinds, payloads and the dispatcher invoking registered handlers.
//! - `retry`: Capped exponential backoff with jitter for transport and store failures.
//! - `progress_tracker`: Counters, periodic progress logs and statistics.
//! - `types`: The error taxonomy, failure payloads and sync states.

/// Event system between the loop and the embedding application
pub mod events;
/// Lifecycle controller
pub mod orchestrator;
/// Tracks synchronization progress and statistics
pub mod progress_tracker;
/// The synchronization state machine
mod reconciler;
/// Retry policy for failed attempts
pub mod retry;
/// Errors, failure payloads and states
pub mod types;

pub use events::{CacheEvent, EventDispatcher, EventHandler, EventKind, HandlerId};
pub use orchestrator::ResilientCache;
pub use progress_tracker::SyncStats;
pub use types::{CacheError, ErrorKind, SyncFailure, SyncState};
