//! Block cache lifecycle controller.
//!
//! `ResilientCache` is the entry point for embedding applications. It owns the event registry,
//! validates configuration, wires the ledger client and the store together, and runs the
//! synchronization loop as a background task between `initialize()` and `close()`.
//!
//! Only configuration errors and lifecycle misuse fail a call. Everything that goes wrong while
//! the loop is running is retried and reported through `error` events.

use super::events::{CacheEvent, EventDispatcher, EventKind, HandlerId};
use super::progress_tracker::SyncStats;
use super::reconciler::Reconciler;
use super::types::{CacheError, SyncState};
use crate::config::{LedgerConfig, StoreConfig, SyncOptions};
use crate::ledger::{LedgerSource, ResilientDbClient};
use crate::store::{BlockRepository, open_store};
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Where the ledger client and the store come from.
enum Components {
	/// Built from connection settings on `initialize()`.
	Configured {
		store: StoreConfig,
		ledger: LedgerConfig,
	},
	/// Supplied ready-made by the embedding application.
	Provided {
		ledger: Arc<dyn LedgerSource>,
		store: Arc<dyn BlockRepository>,
	},
}

enum Lifecycle {
	Idle,
	Running {
		cancel: CancellationToken,
		task: JoinHandle<()>,
		store: Arc<dyn BlockRepository>,
	},
	Closed,
}

/// A local block cache kept in sync with a ResilientDB node.
pub struct ResilientCache {
	components: Components,
	options: SyncOptions,
	dispatcher: EventDispatcher,
	state: Arc<watch::Sender<SyncState>>,
	stats: Arc<watch::Sender<SyncStats>>,
	lifecycle: Mutex<Lifecycle>,
}

impl ResilientCache {
	pub fn new(store: StoreConfig, ledger: LedgerConfig) -> Self {
		Self::with_options(store, ledger, SyncOptions::default())
	}

	pub fn with_options(store: StoreConfig, ledger: LedgerConfig, options: SyncOptions) -> Self {
		Self::build(Components::Configured { store, ledger }, options)
	}

	/// Run against a custom ledger source and store.
	///
	/// The cache takes over the store: `close()` closes it.
	pub fn with_components(
		options: SyncOptions,
		ledger: Arc<dyn LedgerSource>,
		store: Arc<dyn BlockRepository>,
	) -> Self {
		Self::build(Components::Provided { ledger, store }, options)
	}

	fn build(components: Components, options: SyncOptions) -> Self {
		let (state, _) = watch::channel(SyncState::Idle);
		let (stats, _) = watch::channel(SyncStats::default());
		Self {
			components,
			options,
			dispatcher: EventDispatcher::new(),
			state: Arc::new(state),
			stats: Arc::new(stats),
			lifecycle: Mutex::new(Lifecycle::Idle),
		}
	}

	/// Validate the configuration, open the store and start synchronizing.
	///
	/// Returns once the loop is running; `connected` follows when the live subscription opens.
	///
	/// # Errors
	/// `ConfigError` for invalid settings, `AlreadyInitialized` while running, `Closed` after
	/// `close()`, `InitializationError` when the client or the store cannot be set up. A failed
	/// call leaves the cache uninitialized.
	pub async fn initialize(&self) -> Result<(), CacheError> {
		let mut lifecycle = self.lifecycle.lock().await;
		match *lifecycle {
			Lifecycle::Running { .. } => return Err(CacheError::AlreadyInitialized),
			Lifecycle::Closed => return Err(CacheError::Closed),
			Lifecycle::Idle => {}
		}

		self.options.validate()?;
		let (ledger, store) = self.resolve_components().await?;

		let cancel = CancellationToken::new();
		let reconciler = Reconciler::new(
			ledger,
			Arc::clone(&store),
			self.dispatcher.clone(),
			self.options.clone(),
			cancel.clone(),
			Arc::clone(&self.state),
			Arc::clone(&self.stats),
		);
		let task = tokio::spawn(reconciler.run());

		*lifecycle = Lifecycle::Running {
			cancel,
			task,
			store,
		};
		info!("Block cache initialized");
		Ok(())
	}

	async fn resolve_components(
		&self,
	) -> Result<(Arc<dyn LedgerSource>, Arc<dyn BlockRepository>), CacheError> {
		match &self.components {
			Components::Provided { ledger, store } => Ok((Arc::clone(ledger), Arc::clone(store))),
			Components::Configured { store, ledger } => {
				let location = store.location()?;
				let endpoints = ledger.endpoints()?;

				let client = ResilientDbClient::new(
					endpoints,
					self.options.fetch_page_size,
					self.options.request_timeout,
				)
				.map_err(|e| {
					CacheError::InitializationError(format!("failed to build ledger client: {}", e))
				})?;
				let repository = open_store(&location, store).await.map_err(|e| {
					CacheError::InitializationError(format!("failed to open store: {}", e))
				})?;

				info!(
					"Syncing {} into {}/{}",
					ledger.base_url, store.db_name, store.collection_name
				);
				Ok((Arc::new(client), repository))
			}
		}
	}

	/// Stop synchronizing and release the store.
	///
	/// Waits for the loop to finish, then emits `closed`. Later calls return immediately.
	pub async fn close(&self) {
		let mut lifecycle = self.lifecycle.lock().await;
		match std::mem::replace(&mut *lifecycle, Lifecycle::Closed) {
			Lifecycle::Closed => return,
			Lifecycle::Idle => {}
			Lifecycle::Running {
				cancel,
				task,
				store,
			} => {
				cancel.cancel();
				if let Err(e) = task.await {
					error!("Sync task ended abnormally: {}", e);
				}
				if let Err(e) = store.close().await {
					warn!("Failed to close store: {}", e);
				}
			}
		}

		self.state.send_replace(SyncState::Stopped);
		info!("Block cache closed");
		self.dispatcher.dispatch(&CacheEvent::Closed);
	}

	/// Register a handler for `kind`. Handlers run in registration order on the sync task.
	pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
	where
		F: Fn(&CacheEvent) + Send + Sync + 'static,
	{
		self.dispatcher.register_handler(kind, Arc::new(handler))
	}

	/// Remove a handler registered with `on`.
	pub fn off(&self, id: HandlerId) -> bool {
		self.dispatcher.remove_handler(id)
	}

	pub fn state(&self) -> SyncState {
		*self.state.borrow()
	}

	/// Watch state transitions.
	pub fn subscribe_state(&self) -> watch::Receiver<SyncState> {
		self.state.subscribe()
	}

	pub fn stats(&self) -> SyncStats {
		self.stats.borrow().clone()
	}
}

impl Drop for ResilientCache {
	fn drop(&mut self) {
		if let Lifecycle::Running { cancel, .. } = self.lifecycle.get_mut() {
			cancel.cancel();
		}
	}
}
